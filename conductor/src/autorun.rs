//! Autonomous task runner.
//!
//! Pops eligible tasks one at a time and drives each through
//! branch → execution loop → commit → review merge, recording the outcome on
//! the task as a status move plus a typed comment. The run is steered from
//! other threads through a cloneable [`RunHandle`]: pause and resume take
//! effect between tasks, stop cancels the in-flight loop.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::core::limits::{LimitCounters, LimitTracker};
use crate::core::policy::Policy;
use crate::core::types::{Author, CommentKind, Initiator, OrderingStrategy, Task, TaskStatus};
use crate::execution::{ExecutionOutcome, LoopStop, run_execution_loop};
use crate::io::atomic::write_json_atomic;
use crate::io::config::ConductorConfig;
use crate::io::init::ConductorPaths;
use crate::io::policy_store::load_policy;
use crate::io::prompt::initial_messages;
use crate::io::provider::{Message, Provider};
use crate::io::task_store::TaskStore;
use crate::io::tools::{Approver, CompletionMode, DenyApprover, ToolExecutor};
use crate::orchestrator::{BranchOrchestrator, CreateBranchOptions};

const SUMMARY_LIMIT: usize = 4_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    pub strategy: OrderingStrategy,
    /// Stop after this many processed tasks.
    pub max_tasks: Option<usize>,
    /// Stop once this many tasks have failed. Cancelled tasks do not count.
    pub max_failures: Option<usize>,
    pub merge_to_review: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            strategy: OrderingStrategy::Fifo,
            max_tasks: None,
            max_failures: None,
            merge_to_review: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Idle,
    Running,
    Paused,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    #[serde(rename = "no eligible tasks")]
    NoEligibleTasks,
    #[serde(rename = "max tasks reached")]
    MaxTasksReached,
    #[serde(rename = "max failures reached")]
    MaxFailuresReached,
    #[serde(rename = "stopped by operator")]
    StoppedByOperator,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::NoEligibleTasks => "no eligible tasks",
            StopReason::MaxTasksReached => "max tasks reached",
            StopReason::MaxFailuresReached => "max failures reached",
            StopReason::StoppedByOperator => "stopped by operator",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunProgress {
    pub run_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub blocked: usize,
    pub current_task_id: Option<String>,
    pub status: RunStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub total: usize,
    pub processed: usize,
    pub completed: usize,
    pub failed: usize,
    pub blocked: usize,
    pub stopped_reason: StopReason,
}

/// Observable run activity, for streaming surfaces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    Progress(RunProgress),
    Output { task_id: String, chunk: String },
    TaskFinished { task_id: String, status: TaskStatus },
    Finished(RunSummary),
}

pub type EventSink = Arc<dyn Fn(RunEvent) + Send + Sync>;

#[derive(Debug, Default)]
struct Control {
    /// Held by the live [`RunClaim`].
    active: bool,
    paused: bool,
    stop: bool,
    /// Token of the in-flight execution loop.
    cancel: Option<CancelToken>,
}

#[derive(Debug, Default)]
struct Shared {
    control: Mutex<Control>,
    wake: Condvar,
    progress: Mutex<RunProgress>,
    last_summary: Mutex<Option<RunSummary>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Thread-safe control surface for a [`TaskRunner`].
#[derive(Debug, Clone, Default)]
pub struct RunHandle {
    shared: Arc<Shared>,
}

impl RunHandle {
    /// Halt before the next task. The current task runs to completion.
    pub fn pause(&self) {
        lock(&self.shared.control).paused = true;
        info!("pause requested");
    }

    pub fn resume(&self) {
        lock(&self.shared.control).paused = false;
        self.shared.wake.notify_all();
        info!("resume requested");
    }

    /// Cancel the in-flight task and stop popping new ones.
    pub fn stop(&self) {
        let mut control = lock(&self.shared.control);
        control.stop = true;
        if let Some(token) = &control.cancel {
            token.cancel();
        }
        drop(control);
        self.shared.wake.notify_all();
        info!("stop requested");
    }

    pub fn progress(&self) -> RunProgress {
        lock(&self.shared.progress).clone()
    }

    pub fn status(&self) -> RunStatus {
        lock(&self.shared.progress).status
    }

    pub fn last_summary(&self) -> Option<RunSummary> {
        lock(&self.shared.last_summary).clone()
    }

    /// Whether a run currently holds the claim.
    pub fn is_active(&self) -> bool {
        lock(&self.shared.control).active
    }

    fn update(&self, f: impl FnOnce(&mut RunProgress)) -> RunProgress {
        let mut progress = lock(&self.shared.progress);
        f(&mut progress);
        progress.clone()
    }

    /// Fresh token for the next task, already cancelled if a stop is pending.
    fn arm(&self) -> CancelToken {
        let token = CancelToken::new();
        let mut control = lock(&self.shared.control);
        if control.stop {
            token.cancel();
        }
        control.cancel = Some(token.clone());
        token
    }

    fn disarm(&self) {
        lock(&self.shared.control).cancel = None;
    }

    fn stop_requested(&self) -> bool {
        lock(&self.shared.control).stop
    }

    /// Block while paused. Returns `true` if a stop arrived.
    fn wait_while_paused(&self, on_pause: impl FnOnce()) -> bool {
        {
            let control = lock(&self.shared.control);
            if control.stop {
                return true;
            }
            if !control.paused {
                return false;
            }
        }
        on_pause();
        let mut control = lock(&self.shared.control);
        while control.paused && !control.stop {
            control = self
                .shared
                .wake
                .wait_timeout(control, Duration::from_millis(200))
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
        control.stop
    }
}

/// Exclusive right to drive the runner. Released on drop.
#[derive(Debug)]
pub struct RunClaim {
    handle: RunHandle,
}

impl Drop for RunClaim {
    fn drop(&mut self) {
        lock(&self.handle.shared.control).active = false;
    }
}

/// How one task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskEnd {
    Completed,
    Failed,
    Cancelled,
    Blocked,
}

#[derive(Debug, Serialize)]
struct TranscriptRecord<'a> {
    run_id: &'a str,
    task_id: &'a str,
    branch: Option<&'a str>,
    stop: &'a LoopStop,
    answer: &'a str,
    iterations: u32,
    counters: &'a LimitCounters,
    messages: &'a [Message],
}

pub struct TaskRunner {
    paths: ConductorPaths,
    config: ConductorConfig,
    store: Arc<dyn TaskStore>,
    provider: Arc<dyn Provider>,
    approver: Arc<dyn Approver>,
    orchestrator: BranchOrchestrator,
    events: Option<EventSink>,
    handle: RunHandle,
}

impl TaskRunner {
    pub fn new(
        paths: ConductorPaths,
        config: ConductorConfig,
        store: Arc<dyn TaskStore>,
        provider: Arc<dyn Provider>,
    ) -> Self {
        let orchestrator = BranchOrchestrator::new(paths.clone(), config.clone(), Arc::clone(&store));
        Self {
            paths,
            config,
            store,
            provider,
            approver: Arc::new(DenyApprover),
            orchestrator,
            events: None,
            handle: RunHandle::default(),
        }
    }

    pub fn with_approver(mut self, approver: Arc<dyn Approver>) -> Self {
        self.approver = approver;
        self
    }

    pub fn with_events(mut self, sink: EventSink) -> Self {
        self.events = Some(sink);
        self
    }

    pub fn handle(&self) -> RunHandle {
        self.handle.clone()
    }

    pub fn orchestrator(&self) -> &BranchOrchestrator {
        &self.orchestrator
    }

    fn emit(&self, event: RunEvent) {
        if let Some(sink) = &self.events {
            sink(event);
        }
    }

    fn publish(&self, f: impl FnOnce(&mut RunProgress)) {
        let progress = self.handle.update(f);
        self.emit(RunEvent::Progress(progress));
    }

    /// Take the run claim, failing if another run holds it.
    pub fn claim(&self) -> Result<RunClaim> {
        let mut control = lock(&self.handle.shared.control);
        if control.active {
            return Err(anyhow!("a run is already in progress"));
        }
        *control = Control {
            active: true,
            ..Control::default()
        };
        Ok(RunClaim {
            handle: self.handle.clone(),
        })
    }

    /// Run until no eligible task remains or a stop condition is met.
    pub fn start(&self, options: RunOptions) -> Result<RunSummary> {
        let claim = self.claim()?;
        self.start_claimed(claim, options)
    }

    /// [`TaskRunner::start`] with a claim taken earlier through [`TaskRunner::claim`].
    #[instrument(skip_all, fields(strategy = ?options.strategy))]
    pub fn start_claimed(&self, claim: RunClaim, options: RunOptions) -> Result<RunSummary> {
        if !Arc::ptr_eq(&claim.handle.shared, &self.handle.shared) {
            return Err(anyhow!("run claim belongs to a different runner"));
        }
        let run_id = Uuid::new_v4().to_string();
        let reset = reset_orphans(self.store.as_ref())?;
        if !reset.is_empty() {
            info!(tasks = ?reset, "reset orphaned tasks");
        }
        let policy = load_policy(&self.paths.policy_path)?;
        // Tasks that become eligible mid-run wait for the next run.
        let eligible: HashSet<String> = self
            .store
            .pending_tasks(options.strategy)?
            .into_iter()
            .map(|t| t.id)
            .collect();
        let total = eligible.len();
        self.publish(|p| {
            *p = RunProgress {
                run_id: Some(run_id.clone()),
                started_at: Some(Utc::now()),
                total,
                status: RunStatus::Running,
                ..RunProgress::default()
            };
        });
        info!(run_id = %run_id, total, "run started");

        let result = self.run_tasks(&run_id, &policy, options, &eligible);
        let summary = match result {
            Ok((processed, reason)) => {
                let progress = self.handle.progress();
                RunSummary {
                    run_id: run_id.clone(),
                    total,
                    processed,
                    completed: progress.completed,
                    failed: progress.failed,
                    blocked: progress.blocked,
                    stopped_reason: reason,
                }
            }
            Err(err) => {
                self.publish(|p| {
                    p.status = RunStatus::Stopped;
                    p.current_task_id = None;
                });
                return Err(err);
            }
        };
        self.publish(|p| {
            p.status = RunStatus::Stopped;
            p.current_task_id = None;
        });
        *lock(&self.handle.shared.last_summary) = Some(summary.clone());
        info!(run_id = %run_id, processed = summary.processed, reason = %summary.stopped_reason, "run finished");
        self.emit(RunEvent::Finished(summary.clone()));
        drop(claim);
        Ok(summary)
    }

    fn run_tasks(
        &self,
        run_id: &str,
        policy: &Policy,
        options: RunOptions,
        eligible: &HashSet<String>,
    ) -> Result<(usize, StopReason)> {
        let mut processed = 0usize;
        let mut failures = 0usize;
        let mut attempted = HashSet::new();
        loop {
            if self.handle.stop_requested() {
                return Ok((processed, StopReason::StoppedByOperator));
            }
            let stopped = self
                .handle
                .wait_while_paused(|| self.publish(|p| p.status = RunStatus::Paused));
            if stopped {
                return Ok((processed, StopReason::StoppedByOperator));
            }
            if self.handle.status() == RunStatus::Paused {
                self.publish(|p| p.status = RunStatus::Running);
            }
            if options.max_failures.is_some_and(|max| failures >= max) {
                return Ok((processed, StopReason::MaxFailuresReached));
            }
            if options.max_tasks.is_some_and(|max| processed >= max) {
                return Ok((processed, StopReason::MaxTasksReached));
            }
            let next = self
                .store
                .pending_tasks(options.strategy)?
                .into_iter()
                .find(|t| eligible.contains(&t.id) && !attempted.contains(&t.id));
            let Some(task) = next else {
                return Ok((processed, StopReason::NoEligibleTasks));
            };
            attempted.insert(task.id.clone());

            let end = self.run_task(task, run_id, policy, options)?;
            processed += 1;
            if end == TaskEnd::Failed {
                failures += 1;
            }
        }
    }

    #[instrument(skip_all, fields(task_id = %task.id))]
    fn run_task(&self, mut task: Task, run_id: &str, policy: &Policy, options: RunOptions) -> Result<TaskEnd> {
        let task_id = task.id.clone();
        let token = self.handle.arm();
        task.current_run_id = Some(run_id.to_string());
        self.store.update_task(&task)?;
        let task = self.store.move_task(&task_id, TaskStatus::Doing)?;
        self.publish(|p| p.current_task_id = Some(task_id.clone()));

        let end = self.execute_task(&task, run_id, policy, options, &token);
        self.handle.disarm();
        let end = end?;

        if task.code_changes
            && let Err(err) = self
                .orchestrator
                .detach_branch_from_task(&task_id, Initiator::Runner)
        {
            warn!(err = %err, "failed to detach task branch");
        }

        let status = match end {
            TaskEnd::Completed => TaskStatus::Review,
            TaskEnd::Failed | TaskEnd::Cancelled => TaskStatus::Failed,
            TaskEnd::Blocked => TaskStatus::Blocked,
        };
        self.publish(|p| {
            p.current_task_id = None;
            match end {
                TaskEnd::Completed => p.completed += 1,
                TaskEnd::Failed | TaskEnd::Cancelled => p.failed += 1,
                TaskEnd::Blocked => p.blocked += 1,
            }
        });
        self.emit(RunEvent::TaskFinished {
            task_id,
            status,
        });
        Ok(end)
    }

    /// Branch, loop and record the outcome. `Err` only for task-store failures.
    fn execute_task(
        &self,
        task: &Task,
        run_id: &str,
        policy: &Policy,
        options: RunOptions,
        token: &CancelToken,
    ) -> Result<TaskEnd> {
        let branch = if task.code_changes {
            match self.prepare_branch(&task.id) {
                Ok(name) => Some(name),
                Err(err) => {
                    return self.fail(task, run_id, &format!("git operation failed: {err}"), None);
                }
            }
        } else {
            None
        };

        self.provider.set_working_directory(&self.paths.root);
        let messages = match initial_messages(task, branch.as_deref(), CompletionMode::Agent) {
            Ok(messages) => messages,
            Err(err) => return self.fail(task, run_id, &format!("prompt rendering failed: {err:#}"), None),
        };
        let mut executor = ToolExecutor::new(
            &self.paths.root,
            policy,
            self.approver.as_ref(),
            LimitTracker::new(policy.limits),
            CompletionMode::Agent,
        )
        .with_task(&task.id)
        .with_command_limits(
            Duration::from_secs(self.config.command_timeout_secs),
            self.config.command_output_limit_bytes,
        );

        let outcome = run_execution_loop(
            self.provider.as_ref(),
            &mut executor,
            messages,
            self.config.max_iterations,
            &mut |chunk| {
                self.emit(RunEvent::Output {
                    task_id: task.id.clone(),
                    chunk: chunk.to_string(),
                });
            },
            token,
        );
        self.write_transcript(run_id, task, branch.as_deref(), &outcome);
        debug!(stop = ?outcome.stop, iterations = outcome.iterations, "execution loop finished");

        match &outcome.stop {
            LoopStop::Completed => self.succeed(task, run_id, branch.as_deref(), &outcome, options),
            LoopStop::Cancelled => {
                self.save_partial_work(task, branch.as_deref(), "cancelled");
                self.store.add_typed_comment(
                    &task.id,
                    CommentKind::Failure,
                    Author::System,
                    "cancelled",
                    Some(run_id),
                )?;
                self.store.move_task(&task.id, TaskStatus::Failed)?;
                Ok(TaskEnd::Cancelled)
            }
            LoopStop::Blocked { reason } => {
                self.save_partial_work(task, branch.as_deref(), "blocked");
                self.store.add_typed_comment(
                    &task.id,
                    CommentKind::Blocker,
                    Author::Agent,
                    reason,
                    Some(run_id),
                )?;
                self.store.move_task(&task.id, TaskStatus::Blocked)?;
                Ok(TaskEnd::Blocked)
            }
            LoopStop::IterationCap => {
                self.save_partial_work(task, branch.as_deref(), "iteration cap");
                let message = format!(
                    "iteration cap reached: the agent was still working after {} iterations",
                    outcome.iterations
                );
                self.fail(task, run_id, &message, Some(&outcome.counters))
            }
            LoopStop::LimitExceeded(breach) => {
                self.save_partial_work(task, branch.as_deref(), "limit exceeded");
                self.fail(task, run_id, &format!("limit exceeded: {breach}"), Some(&outcome.counters))
            }
            LoopStop::ProviderFailed { message } => {
                self.save_partial_work(task, branch.as_deref(), "provider failure");
                self.fail(task, run_id, &format!("provider failed: {message}"), Some(&outcome.counters))
            }
        }
    }

    /// Reuse the task's unmerged branch or create one, then check it out.
    fn prepare_branch(&self, task_id: &str) -> Result<String> {
        let table = self.orchestrator.branch_table()?;
        if table.active_for(task_id).is_none() {
            self.orchestrator.create_task_branch(
                task_id,
                CreateBranchOptions {
                    force: false,
                    initiator: Initiator::Runner,
                },
            )?;
        }
        let mapping = self
            .orchestrator
            .checkout_task_branch(task_id, Initiator::Runner)?;
        Ok(mapping.branch_name)
    }

    fn succeed(
        &self,
        task: &Task,
        run_id: &str,
        branch: Option<&str>,
        outcome: &ExecutionOutcome,
        options: RunOptions,
    ) -> Result<TaskEnd> {
        if branch.is_some() {
            let message = format!("task {}: {}", task.id, task.title);
            if let Err(err) = self
                .orchestrator
                .commit_task_changes(&task.id, &message, Initiator::Runner)
            {
                return self.fail(task, run_id, &format!("git operation failed: {err}"), Some(&outcome.counters));
            }
        }
        self.store.move_task(&task.id, TaskStatus::Review)?;
        let summary = if outcome.answer.trim().is_empty() {
            "completed without a summary".to_string()
        } else {
            truncate(outcome.answer.trim(), SUMMARY_LIMIT)
        };
        self.store.add_typed_comment(
            &task.id,
            CommentKind::Summary,
            Author::Agent,
            &summary,
            Some(run_id),
        )?;

        if options.merge_to_review && branch.is_some() && self.config.review_branch().is_some() {
            self.merge_to_review(task, run_id)?;
        }
        Ok(TaskEnd::Completed)
    }

    /// Conflicts leave the task in review with a comment and the merge aborted.
    fn merge_to_review(&self, task: &Task, run_id: &str) -> Result<()> {
        match self
            .orchestrator
            .merge_task_to_review(&task.id, Initiator::Runner)
        {
            Ok(outcome) if outcome.had_conflicts => {
                let files: Vec<&str> = outcome
                    .conflicts
                    .iter()
                    .map(|c| c.file_path.as_str())
                    .collect();
                let content = format!(
                    "merge into the review branch conflicted in {} file(s): {}",
                    files.len(),
                    files.join(", ")
                );
                self.store.add_typed_comment(
                    &task.id,
                    CommentKind::Conflict,
                    Author::System,
                    &content,
                    Some(run_id),
                )?;
                if let Err(err) = self.orchestrator.abort_merge(Initiator::Runner) {
                    warn!(err = %err, "failed to abort conflicting merge");
                }
            }
            Ok(_) => debug!("merged into review branch"),
            Err(err) => {
                warn!(err = %err, "merge to review failed");
                self.store.add_typed_comment(
                    &task.id,
                    CommentKind::System,
                    Author::System,
                    &format!("merge into the review branch failed: {err}"),
                    Some(run_id),
                )?;
            }
        }
        Ok(())
    }

    fn fail(
        &self,
        task: &Task,
        run_id: &str,
        message: &str,
        counters: Option<&LimitCounters>,
    ) -> Result<TaskEnd> {
        let mut content = message.to_string();
        if let Some(c) = counters {
            content.push_str(&format!(
                "\nsteps={} files={} diff_lines={} elapsed_secs={}",
                c.steps, c.files, c.diff_lines, c.elapsed_secs
            ));
        }
        warn!(task_id = %task.id, reason = message, "task failed");
        self.store.add_typed_comment(
            &task.id,
            CommentKind::Failure,
            Author::System,
            &content,
            Some(run_id),
        )?;
        self.store.move_task(&task.id, TaskStatus::Failed)?;
        Ok(TaskEnd::Failed)
    }

    /// Commit whatever the agent left on the task branch so main stays clean.
    fn save_partial_work(&self, task: &Task, branch: Option<&str>, why: &str) {
        if branch.is_none() {
            return;
        }
        let message = format!("wip: task {} ({why})", task.id);
        match self
            .orchestrator
            .commit_task_changes(&task.id, &message, Initiator::Runner)
        {
            Ok(Some(head)) => debug!(head = %head, "saved partial work"),
            Ok(None) => {}
            Err(err) => warn!(err = %err, "failed to save partial work"),
        }
    }

    fn write_transcript(&self, run_id: &str, task: &Task, branch: Option<&str>, outcome: &ExecutionOutcome) {
        let path = self.paths.transcript_path(run_id, &task.id);
        let record = TranscriptRecord {
            run_id,
            task_id: &task.id,
            branch,
            stop: &outcome.stop,
            answer: &outcome.answer,
            iterations: outcome.iterations,
            counters: &outcome.counters,
            messages: &outcome.transcript,
        };
        if let Err(err) = write_json_atomic(&path, &record) {
            warn!(err = %err, path = %path.display(), "failed to write transcript");
        }
    }
}

/// Move tasks left in `doing` by an interrupted run back to `todo`.
///
/// Returns the ids that were reset.
pub fn reset_orphans(store: &dyn TaskStore) -> Result<Vec<String>> {
    let mut reset = Vec::new();
    for mut task in store.list_tasks()? {
        if task.status != TaskStatus::Doing {
            continue;
        }
        let previous_run = task.current_run_id.take();
        store.update_task(&task)?;
        store.move_task(&task.id, TaskStatus::Todo)?;
        let content = match &previous_run {
            Some(run) => format!("reset to todo: run {run} ended while the task was in progress"),
            None => "reset to todo: a previous run ended while the task was in progress".to_string(),
        };
        store.add_typed_comment(&task.id, CommentKind::System, Author::System, &content, None)?;
        reset.push(task.id);
    }
    Ok(reset)
}

fn truncate(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}
