//! HTTP verbs over the conductor library.
//!
//! Handlers only translate between HTTP and library calls. Anything that
//! touches git or the task store runs on the blocking pool.

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use conductor::autorun::{RunOptions, RunProgress, RunSummary};
use conductor::core::conflict::{ConflictInfo, Resolution};
use conductor::core::safety::{SafetyOperation, SafetyReport};
use conductor::core::types::{Initiator, Task};
use conductor::error::OrchestratorError;
use conductor::io::branch_map::{MergeState, TaskBranchMapping};
use conductor::io::tools::ApprovalRequest;
use conductor::orchestrator::{CreateBranchOptions, MergeOutcome};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::state::AppState;

/// Build the API router.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/tasks", get(list_tasks))
        .route("/runs", post(start_run))
        .route("/runs/stop", post(stop_run))
        .route("/runs/pause", post(pause_run))
        .route("/runs/resume", post(resume_run))
        .route("/runs/last", get(last_run))
        .route("/progress", get(progress))
        .route("/tasks/{id}/branch", get(get_branch))
        .route("/tasks/{id}/branch/create", post(create_branch))
        .route("/tasks/{id}/branch/checkout", post(checkout_branch))
        .route("/tasks/{id}/branch/detach", post(detach_branch))
        .route("/tasks/{id}/branch/commit", post(commit_branch))
        .route("/tasks/{id}/branch/merge-review", post(merge_to_review))
        .route("/tasks/{id}/branch/merge-main", post(merge_to_main))
        .route("/merge", get(merge_state))
        .route("/merge/resolve", post(resolve_conflict))
        .route("/merge/skip", post(skip_conflict))
        .route("/merge/finalize", post(finalize_merge))
        .route("/merge/abort", post(abort_merge))
        .route("/review/merge-main", post(merge_review_to_main))
        .route("/safety-check", post(safety_check))
        .route("/approvals", get(list_approvals).post(decide_approval))
}

/// JSON error body with a status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: Value,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "error": message.into() }),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        let status = match &err {
            OrchestratorError::Unsafe(report) => {
                return Self {
                    status: StatusCode::CONFLICT,
                    body: json!({ "error": err.to_string(), "safety": report }),
                };
            }
            OrchestratorError::ActiveBranchExists { .. }
            | OrchestratorError::BranchExists(_)
            | OrchestratorError::UnresolvedConflicts(_) => StatusCode::CONFLICT,
            OrchestratorError::NoActiveBranch(_)
            | OrchestratorError::NoMergeInProgress
            | OrchestratorError::UnknownConflict(_) => StatusCode::NOT_FOUND,
            OrchestratorError::InvalidBranchName { .. } | OrchestratorError::NoReviewBranch => {
                StatusCode::BAD_REQUEST
            }
            OrchestratorError::Git(_) | OrchestratorError::State(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, format!("{err:#}"))
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Refuse to touch the working tree while the runner owns it.
fn ensure_idle(state: &AppState) -> Result<(), ApiError> {
    if state.runner.handle().is_active() {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            "a run is in progress; stop it before changing branches",
        ));
    }
    Ok(())
}

/// Run a synchronous library call off the async workers.
async fn blocking<T, F>(f: F) -> ApiResult<T>
where
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, format!("worker failed: {err}")))?
        .map(Json)
}

async fn health() -> &'static str {
    "ok"
}

async fn list_tasks(State(state): State<AppState>) -> ApiResult<Vec<Task>> {
    blocking(move || Ok(state.store.list_tasks()?)).await
}

// ---- runs ---------------------------------------------------------------

/// POST /api/runs - start an autonomous run in the background.
async fn start_run(
    State(state): State<AppState>,
    Json(options): Json<RunOptions>,
) -> Result<(StatusCode, Json<RunProgress>), ApiError> {
    let handle = state.runner.handle();
    let claim = state
        .runner
        .claim()
        .map_err(|err| ApiError::new(StatusCode::CONFLICT, format!("{err:#}")))?;
    let runner = state.runner.clone();
    tokio::task::spawn_blocking(move || match runner.start_claimed(claim, options) {
        Ok(summary) => info!(run_id = %summary.run_id, reason = %summary.stopped_reason, "run finished"),
        Err(err) => warn!(error = %format!("{err:#}"), "run failed"),
    });
    Ok((StatusCode::ACCEPTED, Json(handle.progress())))
}

async fn stop_run(State(state): State<AppState>) -> Json<RunProgress> {
    let handle = state.runner.handle();
    handle.stop();
    Json(handle.progress())
}

async fn pause_run(State(state): State<AppState>) -> Json<RunProgress> {
    let handle = state.runner.handle();
    handle.pause();
    Json(handle.progress())
}

async fn resume_run(State(state): State<AppState>) -> Json<RunProgress> {
    let handle = state.runner.handle();
    handle.resume();
    Json(handle.progress())
}

async fn progress(State(state): State<AppState>) -> Json<RunProgress> {
    Json(state.runner.handle().progress())
}

async fn last_run(State(state): State<AppState>) -> ApiResult<RunSummary> {
    state
        .runner
        .handle()
        .last_summary()
        .map(Json)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "no run has finished yet"))
}

// ---- task branches --------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CreateBranchBody {
    force: bool,
}

#[derive(Debug, Deserialize)]
struct CommitBody {
    message: String,
}

async fn get_branch(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<TaskBranchMapping> {
    blocking(move || {
        state
            .orchestrator()
            .mapping_for(&id)?
            .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("task '{id}' has no branch")))
    })
    .await
}

async fn create_branch(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<CreateBranchBody>,
) -> ApiResult<TaskBranchMapping> {
    ensure_idle(&state)?;
    blocking(move || {
        let options = CreateBranchOptions {
            force: body.force,
            initiator: Initiator::Operator,
        };
        Ok(state.orchestrator().create_task_branch(&id, options)?)
    })
    .await
}

async fn checkout_branch(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<TaskBranchMapping> {
    ensure_idle(&state)?;
    blocking(move || Ok(state.orchestrator().checkout_task_branch(&id, Initiator::Operator)?)).await
}

async fn detach_branch(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<()> {
    ensure_idle(&state)?;
    blocking(move || Ok(state.orchestrator().detach_branch_from_task(&id, Initiator::Operator)?)).await
}

async fn commit_branch(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<CommitBody>,
) -> ApiResult<Option<String>> {
    ensure_idle(&state)?;
    blocking(move || {
        Ok(state
            .orchestrator()
            .commit_task_changes(&id, &body.message, Initiator::Operator)?)
    })
    .await
}

async fn merge_to_review(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<MergeOutcome> {
    ensure_idle(&state)?;
    blocking(move || Ok(state.orchestrator().merge_task_to_review(&id, Initiator::Operator)?)).await
}

async fn merge_to_main(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<MergeOutcome> {
    ensure_idle(&state)?;
    blocking(move || Ok(state.orchestrator().merge_task_to_main(&id, Initiator::Operator)?)).await
}

async fn merge_review_to_main(State(state): State<AppState>) -> ApiResult<MergeOutcome> {
    ensure_idle(&state)?;
    blocking(move || Ok(state.orchestrator().merge_review_to_main(Initiator::Operator)?)).await
}

// ---- merge resolution -------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ResolveBody {
    file_path: String,
    resolution: Resolution,
}

#[derive(Debug, Deserialize)]
struct SkipBody {
    file_path: String,
}

async fn merge_state(State(state): State<AppState>) -> ApiResult<Option<MergeState>> {
    blocking(move || Ok(state.orchestrator().merge_state()?)).await
}

async fn resolve_conflict(
    State(state): State<AppState>,
    Json(body): Json<ResolveBody>,
) -> ApiResult<Vec<ConflictInfo>> {
    ensure_idle(&state)?;
    blocking(move || {
        Ok(state
            .orchestrator()
            .resolve_conflict(&body.file_path, body.resolution)?)
    })
    .await
}

async fn skip_conflict(
    State(state): State<AppState>,
    Json(body): Json<SkipBody>,
) -> ApiResult<Vec<ConflictInfo>> {
    ensure_idle(&state)?;
    blocking(move || Ok(state.orchestrator().skip_conflict(&body.file_path)?)).await
}

async fn finalize_merge(State(state): State<AppState>) -> ApiResult<MergeOutcome> {
    ensure_idle(&state)?;
    blocking(move || Ok(state.orchestrator().finalize_merge(Initiator::Operator)?)).await
}

async fn abort_merge(State(state): State<AppState>) -> ApiResult<()> {
    ensure_idle(&state)?;
    blocking(move || Ok(state.orchestrator().abort_merge(Initiator::Operator)?)).await
}

async fn safety_check(
    State(state): State<AppState>,
    Json(operation): Json<SafetyOperation>,
) -> ApiResult<SafetyReport> {
    blocking(move || Ok(state.orchestrator().run_safety_check(&operation)?)).await
}

// ---- approvals --------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct DecisionBody {
    id: u64,
    approved: bool,
}

async fn list_approvals(State(state): State<AppState>) -> Json<Vec<ApprovalRequest>> {
    Json(state.approvals.pending())
}

async fn decide_approval(
    State(state): State<AppState>,
    Json(body): Json<DecisionBody>,
) -> Result<StatusCode, ApiError> {
    state
        .approvals
        .decide(body.id, body.approved)
        .map_err(|err| ApiError::new(StatusCode::NOT_FOUND, format!("{err:#}")))?;
    Ok(StatusCode::NO_CONTENT)
}
