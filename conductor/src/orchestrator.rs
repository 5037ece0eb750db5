//! Source-control branch orchestrator.
//!
//! Owns the per-task branch lifecycle:
//! `none → created → (checked out ↔ detached) → merged to review? → merged to main`.
//!
//! Every verb takes the project lock first, so git never runs concurrently
//! against one working tree. Every state-changing git command is appended to
//! the operation log, whether it succeeded or not. Merge conflicts are not
//! errors: they come back as a [`MergeOutcome`] with `had_conflicts` set and
//! the working tree left mid-merge until the operator resolves, skips,
//! finalizes or aborts.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use anyhow::Context;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::branch_name::render_branch_name;
use crate::core::conflict::{ConflictInfo, ConflictStatus, Resolution};
use crate::core::safety::{RepoFacts, SafetyOperation, SafetyReport, assess};
use crate::core::types::{Initiator, Task};
use crate::error::{GitFailure, OrchestratorError};
use crate::io::branch_map::{
    BranchTable, MergeKind, MergeState, ReviewBranchSummary, TaskBranchMapping, clear_merge_state,
    load_branch_table, load_merge_state, load_review_summary, save_branch_table, save_merge_state,
    save_review_summary,
};
use crate::io::config::ConductorConfig;
use crate::io::git::{Git, GitOutput, MergeRun, Stage};
use crate::io::init::ConductorPaths;
use crate::io::op_log::{NewOperation, OperationLog};
use crate::io::task_store::TaskStore;

type OrchResult<T> = Result<T, OrchestratorError>;

/// Paths the orchestrator never stages or treats as dirty.
const STATE_DIR_PREFIX: &str = ".conductor/";
const STATE_DIR_PATHSPEC: &str = ".conductor";

static PROJECT_LOCKS: LazyLock<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// One lock per canonical project root, shared by every orchestrator in the process.
fn project_lock(root: &Path) -> Arc<Mutex<()>> {
    let key = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    let mut locks = PROJECT_LOCKS.lock().unwrap_or_else(PoisonError::into_inner);
    Arc::clone(locks.entry(key).or_default())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateBranchOptions {
    /// Reset an existing branch with the same name to HEAD.
    pub force: bool,
    pub initiator: Initiator,
}

impl Default for CreateBranchOptions {
    fn default() -> Self {
        Self {
            force: false,
            initiator: Initiator::Operator,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOutcome {
    pub had_conflicts: bool,
    pub conflicts: Vec<ConflictInfo>,
    pub merge_commit_hash: Option<String>,
    /// Safety-check warnings that did not prevent the merge.
    pub warnings: Vec<String>,
}

pub struct BranchOrchestrator {
    paths: ConductorPaths,
    config: ConductorConfig,
    git: Git,
    log: OperationLog,
    store: Arc<dyn TaskStore>,
    lock: Arc<Mutex<()>>,
}

impl BranchOrchestrator {
    pub fn new(paths: ConductorPaths, config: ConductorConfig, store: Arc<dyn TaskStore>) -> Self {
        let git = Git::new(&paths.root);
        let log = OperationLog::new(&paths.op_log_path);
        let lock = project_lock(&paths.root);
        Self {
            paths,
            config,
            git,
            log,
            store,
            lock,
        }
    }

    pub fn config(&self) -> &ConductorConfig {
        &self.config
    }

    pub fn operation_log(&self) -> &OperationLog {
        &self.log
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ---- queries -------------------------------------------------------

    pub fn mapping_for(&self, task_id: &str) -> OrchResult<Option<TaskBranchMapping>> {
        Ok(self.table()?.latest_for(task_id).cloned())
    }

    pub fn branch_table(&self) -> OrchResult<BranchTable> {
        self.table()
    }

    pub fn merge_state(&self) -> OrchResult<Option<MergeState>> {
        Ok(load_merge_state(&self.paths.merge_state_path)?)
    }

    pub fn review_summary(&self) -> OrchResult<Option<ReviewBranchSummary>> {
        Ok(load_review_summary(&self.paths.review_branch_path)?)
    }

    pub fn run_safety_check(&self, operation: &SafetyOperation) -> OrchResult<SafetyReport> {
        let _guard = self.guard();
        self.safety_locked(operation)
    }

    // ---- branch lifecycle ---------------------------------------------

    /// Create the branch for `task_id` at HEAD and record the mapping.
    #[instrument(skip_all, fields(task_id, force = options.force))]
    pub fn create_task_branch(
        &self,
        task_id: &str,
        options: CreateBranchOptions,
    ) -> OrchResult<TaskBranchMapping> {
        let _guard = self.guard();
        let mut task = self.load_task(task_id)?;
        let mut table = self.table()?;
        if let Some(active) = table.active_for(task_id) {
            return Err(OrchestratorError::ActiveBranchExists {
                task_id: task_id.to_string(),
                branch: active.branch_name.clone(),
            });
        }

        let name = render_branch_name(&self.config.branch_template, &task).map_err(|err| {
            OrchestratorError::InvalidBranchName {
                name: self.config.branch_template.clone(),
                reason: format!("{err:#}"),
            }
        })?;
        if let Err(failure) = self.git.check_branch_name(&name) {
            return Err(OrchestratorError::InvalidBranchName {
                name,
                reason: failure.stderr,
            });
        }
        if self.git.branch_exists(&name)? && !options.force {
            return Err(OrchestratorError::BranchExists(name));
        }

        self.logged("create_branch", Some(task_id), options.initiator, |git| {
            git.create_branch(&name, options.force)
        })?;
        let head = self.git.rev_parse(&name)?;
        let mapping = TaskBranchMapping {
            id: 0,
            task_id: task_id.to_string(),
            branch_name: name.clone(),
            created_at: Utc::now(),
            base_commit_hash: head.clone(),
            head_commit_hash: head,
            is_checked_out: false,
            is_merged: false,
            merge_commit_hash: None,
            merged_to: None,
        };
        let id = table.insert(mapping);
        self.save_table(&table)?;

        task.branch_name = Some(name.clone());
        self.store.update_task(&task)?;
        info!(branch = %name, "created task branch");
        table
            .get(id)
            .cloned()
            .ok_or_else(|| OrchestratorError::NoActiveBranch(task_id.to_string()))
    }

    #[instrument(skip_all, fields(task_id))]
    pub fn checkout_task_branch(
        &self,
        task_id: &str,
        initiator: Initiator,
    ) -> OrchResult<TaskBranchMapping> {
        let _guard = self.guard();
        self.checkout_locked(task_id, initiator)
    }

    /// Leave the task branch intact and return to the main branch.
    #[instrument(skip_all, fields(task_id))]
    pub fn detach_branch_from_task(&self, task_id: &str, initiator: Initiator) -> OrchResult<()> {
        let _guard = self.guard();
        let mut table = self.table()?;
        if table.latest_for(task_id).is_none() {
            return Err(OrchestratorError::NoActiveBranch(task_id.to_string()));
        }
        self.ensure_safe(&SafetyOperation::Detach)?;
        let main = self.config.main_branch.clone();
        if self.git.current_branch()?.as_deref() != Some(main.as_str()) {
            self.logged("checkout", Some(task_id), initiator, |git| git.checkout(&main))?;
        }
        table.set_checked_out(None);
        self.save_table(&table)?;
        debug!(branch = %main, "detached task branch");
        Ok(())
    }

    /// Stage everything outside `.conductor/` and commit on the task branch.
    ///
    /// Returns the new head, or `None` when there was nothing to commit.
    #[instrument(skip_all, fields(task_id))]
    pub fn commit_task_changes(
        &self,
        task_id: &str,
        message: &str,
        initiator: Initiator,
    ) -> OrchResult<Option<String>> {
        let _guard = self.guard();
        let mapping = self
            .table()?
            .active_for(task_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::NoActiveBranch(task_id.to_string()))?;
        if self.git.current_branch()?.as_deref() != Some(mapping.branch_name.as_str()) {
            self.checkout_locked(task_id, initiator)?;
        }

        self.git.add_all_except(&[STATE_DIR_PATHSPEC])?;
        let committed = self.logged_opt("commit", Some(task_id), initiator, |git| {
            git.commit_staged(message)
        })?;
        if !committed {
            debug!("nothing to commit");
            return Ok(None);
        }
        let head = self.git.head_commit()?;
        let mut table = self.table()?;
        if let Some(m) = table.get_mut(mapping.id) {
            m.head_commit_hash = head.clone();
        }
        self.save_table(&table)?;
        Ok(Some(head))
    }

    // ---- merges --------------------------------------------------------

    pub fn merge_task_to_review(&self, task_id: &str, initiator: Initiator) -> OrchResult<MergeOutcome> {
        let _guard = self.guard();
        let review = self
            .config
            .review_branch()
            .ok_or(OrchestratorError::NoReviewBranch)?
            .to_string();
        self.ensure_review_branch(&review, initiator)?;
        self.merge_task_locked(task_id, &review, MergeKind::TaskToReview, initiator)
    }

    pub fn merge_task_to_main(&self, task_id: &str, initiator: Initiator) -> OrchResult<MergeOutcome> {
        let _guard = self.guard();
        let main = self.config.main_branch.clone();
        self.merge_task_locked(task_id, &main, MergeKind::TaskToMain, initiator)
    }

    pub fn merge_review_to_main(&self, initiator: Initiator) -> OrchResult<MergeOutcome> {
        let _guard = self.guard();
        let review = self
            .config
            .review_branch()
            .ok_or(OrchestratorError::NoReviewBranch)?
            .to_string();
        let main = self.config.main_branch.clone();
        let state = MergeState {
            kind: MergeKind::ReviewToMain,
            task_id: None,
            mapping_id: None,
            source_branch: review,
            target_branch: main,
            initiator,
            started_at: Utc::now(),
            conflicts: Vec::new(),
        };
        self.merge_locked(state)
    }

    /// Settle one conflicting file. Never completes the merge by itself.
    #[instrument(skip_all, fields(file_path))]
    pub fn resolve_conflict(&self, file_path: &str, resolution: Resolution) -> OrchResult<Vec<ConflictInfo>> {
        let _guard = self.guard();
        self.settle_conflict(file_path, resolution, ConflictStatus::Resolved)
    }

    /// Keep the target branch's version of a conflicting file.
    #[instrument(skip_all, fields(file_path))]
    pub fn skip_conflict(&self, file_path: &str) -> OrchResult<Vec<ConflictInfo>> {
        let _guard = self.guard();
        self.settle_conflict(file_path, Resolution::Ours, ConflictStatus::Skipped)
    }

    /// Commit a merge whose conflicts have all been resolved or skipped.
    #[instrument(skip_all)]
    pub fn finalize_merge(&self, initiator: Initiator) -> OrchResult<MergeOutcome> {
        let _guard = self.guard();
        let state = self
            .merge_state()?
            .ok_or(OrchestratorError::NoMergeInProgress)?;
        let unresolved = state.unresolved_count();
        if unresolved > 0 {
            return Err(OrchestratorError::UnresolvedConflicts(unresolved));
        }
        let remaining = self.git.conflicted_files()?;
        if !remaining.is_empty() {
            return Err(OrchestratorError::UnresolvedConflicts(remaining.len()));
        }
        self.logged("finalize_merge", state.task_id.as_deref(), initiator, Git::commit_merge)?;
        let merge_commit = self.git.head_commit()?;
        self.apply_merge_success(&state, Some(merge_commit.clone()))?;
        clear_merge_state(&self.paths.merge_state_path)?;
        info!(commit = %merge_commit, "merge finalized");
        Ok(MergeOutcome {
            had_conflicts: false,
            conflicts: state.conflicts,
            merge_commit_hash: Some(merge_commit),
            warnings: Vec::new(),
        })
    }

    #[instrument(skip_all)]
    pub fn abort_merge(&self, initiator: Initiator) -> OrchResult<()> {
        let _guard = self.guard();
        let state = self.merge_state()?;
        if state.is_some() && !self.git.merge_in_progress()? {
            warn!("merge state on disk but no merge in git, clearing");
            clear_merge_state(&self.paths.merge_state_path)?;
            return Ok(());
        }
        self.ensure_safe(&SafetyOperation::AbortMerge)?;
        let task_id = state.and_then(|s| s.task_id);
        self.logged("abort_merge", task_id.as_deref(), initiator, Git::merge_abort)?;
        clear_merge_state(&self.paths.merge_state_path)?;
        Ok(())
    }

    // ---- internals (lock held) ------------------------------------------

    fn checkout_locked(&self, task_id: &str, initiator: Initiator) -> OrchResult<TaskBranchMapping> {
        let mut table = self.table()?;
        let mapping = table
            .active_for(task_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::NoActiveBranch(task_id.to_string()))?;
        self.ensure_safe(&SafetyOperation::Checkout {
            branch: mapping.branch_name.clone(),
        })?;
        if self.git.current_branch()?.as_deref() != Some(mapping.branch_name.as_str()) {
            self.logged("checkout", Some(task_id), initiator, |git| {
                git.checkout(&mapping.branch_name)
            })?;
        }
        table.set_checked_out(Some(mapping.id));
        self.save_table(&table)?;
        Ok(TaskBranchMapping {
            is_checked_out: true,
            ..mapping
        })
    }

    fn merge_task_locked(
        &self,
        task_id: &str,
        target: &str,
        kind: MergeKind,
        initiator: Initiator,
    ) -> OrchResult<MergeOutcome> {
        let mapping = self
            .table()?
            .latest_for(task_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::NoActiveBranch(task_id.to_string()))?;
        let state = MergeState {
            kind,
            task_id: Some(task_id.to_string()),
            mapping_id: Some(mapping.id),
            source_branch: mapping.branch_name,
            target_branch: target.to_string(),
            initiator,
            started_at: Utc::now(),
            conflicts: Vec::new(),
        };
        self.merge_locked(state)
    }

    #[instrument(skip_all, fields(source = %state.source_branch, target = %state.target_branch))]
    fn merge_locked(&self, mut state: MergeState) -> OrchResult<MergeOutcome> {
        let report = self.ensure_safe(&SafetyOperation::Merge {
            source: state.source_branch.clone(),
            target: state.target_branch.clone(),
        })?;
        let task_id = state.task_id.clone();
        let initiator = state.initiator;

        if self.git.current_branch()?.as_deref() != Some(state.target_branch.as_str()) {
            self.logged("checkout", task_id.as_deref(), initiator, |git| {
                git.checkout(&state.target_branch)
            })?;
            let mut table = self.table()?;
            table.set_checked_out(None);
            self.save_table(&table)?;
        }
        let before = self.git.head_commit()?;

        let message = format!("Merge {} into {}", state.source_branch, state.target_branch);
        let started = Instant::now();
        let merged = self.git.merge_no_ff(&state.source_branch, &message);
        let elapsed = started.elapsed().as_millis() as u64;
        let (out, run) = match merged {
            Ok(result) => result,
            Err(failure) => {
                self.record_failure("merge", task_id.as_deref(), initiator, &failure, elapsed)?;
                return Err(failure.into());
            }
        };
        self.record("merge", task_id.as_deref(), initiator, &out, elapsed)?;

        match run {
            MergeRun::Merged => {
                let after = self.git.head_commit()?;
                let merge_commit = (after != before).then_some(after);
                self.apply_merge_success(&state, merge_commit.clone())?;
                info!(commit = ?merge_commit, "merge succeeded");
                Ok(MergeOutcome {
                    had_conflicts: false,
                    conflicts: Vec::new(),
                    merge_commit_hash: merge_commit,
                    warnings: report.warnings,
                })
            }
            MergeRun::Conflicted(files) => {
                let mut conflicts = Vec::with_capacity(files.len());
                for file in &files {
                    conflicts.push(ConflictInfo::new(
                        file.as_str(),
                        self.git.show_stage(Stage::Base, file)?,
                        self.git.show_stage(Stage::Ours, file)?,
                        self.git.show_stage(Stage::Theirs, file)?,
                    ));
                }
                state.conflicts = conflicts.clone();
                save_merge_state(&self.paths.merge_state_path, &state)?;
                warn!(files = conflicts.len(), "merge has conflicts");
                Ok(MergeOutcome {
                    had_conflicts: true,
                    conflicts,
                    merge_commit_hash: None,
                    warnings: report.warnings,
                })
            }
        }
    }

    fn apply_merge_success(&self, state: &MergeState, merge_commit: Option<String>) -> OrchResult<()> {
        let now = Utc::now();
        if let Some(mapping_id) = state.mapping_id {
            let source_head = self.git.rev_parse(&state.source_branch)?;
            let mut table = self.table()?;
            if let Some(m) = table.get_mut(mapping_id) {
                m.head_commit_hash = source_head;
                m.is_merged = true;
                m.merge_commit_hash = merge_commit.clone();
                m.merged_to = Some(state.target_branch.clone());
            }
            table.set_checked_out(None);
            self.save_table(&table)?;
        }

        match state.kind {
            MergeKind::TaskToReview => {
                let mut summary = self.review_summary_or_new(&state.target_branch)?;
                summary.head_commit_hash = self.git.rev_parse(&state.target_branch)?;
                if let Some(task_id) = &state.task_id
                    && !summary.merged_tasks.contains(task_id)
                {
                    summary.merged_tasks.push(task_id.clone());
                }
                save_review_summary(&self.paths.review_branch_path, &summary)?;
            }
            MergeKind::ReviewToMain => {
                let mut summary = self.review_summary_or_new(&state.source_branch)?;
                let mut table = self.table()?;
                for m in &mut table.mappings {
                    if m.merged_to.as_deref() == Some(state.source_branch.as_str())
                        && summary.merged_tasks.contains(&m.task_id)
                    {
                        m.merged_to = Some(state.target_branch.clone());
                        m.merge_commit_hash = merge_commit.clone();
                    }
                }
                self.save_table(&table)?;

                summary.head_commit_hash = self.git.rev_parse(&state.source_branch)?;
                summary.last_merged_to_main_at = Some(now);
                summary.last_main_merge_commit = merge_commit;
                summary.merged_tasks.clear();
                save_review_summary(&self.paths.review_branch_path, &summary)?;
            }
            MergeKind::TaskToMain => {}
        }
        Ok(())
    }

    /// Create the review branch from main on first use.
    fn ensure_review_branch(&self, review: &str, initiator: Initiator) -> OrchResult<()> {
        if self.git.branch_exists(review)? {
            return Ok(());
        }
        let main = self.config.main_branch.clone();
        self.logged("create_review_branch", None, initiator, |git| {
            git.create_branch_from(review, &main)
        })?;
        let head = self.git.rev_parse(review)?;
        let summary = ReviewBranchSummary {
            branch: review.to_string(),
            created_at: Utc::now(),
            base_commit_hash: head.clone(),
            head_commit_hash: head,
            merged_tasks: Vec::new(),
            last_merged_to_main_at: None,
            last_main_merge_commit: None,
        };
        save_review_summary(&self.paths.review_branch_path, &summary)?;
        info!(branch = review, "created review branch");
        Ok(())
    }

    fn review_summary_or_new(&self, review: &str) -> OrchResult<ReviewBranchSummary> {
        if let Some(summary) = self.review_summary()? {
            return Ok(summary);
        }
        let head = self.git.rev_parse(review)?;
        Ok(ReviewBranchSummary {
            branch: review.to_string(),
            created_at: Utc::now(),
            base_commit_hash: head.clone(),
            head_commit_hash: head,
            merged_tasks: Vec::new(),
            last_merged_to_main_at: None,
            last_main_merge_commit: None,
        })
    }

    fn settle_conflict(
        &self,
        file_path: &str,
        resolution: Resolution,
        status: ConflictStatus,
    ) -> OrchResult<Vec<ConflictInfo>> {
        let mut state = self
            .merge_state()?
            .ok_or(OrchestratorError::NoMergeInProgress)?;
        let conflict = state
            .conflicts
            .iter_mut()
            .find(|c| c.file_path == file_path)
            .ok_or_else(|| OrchestratorError::UnknownConflict(file_path.to_string()))?;

        match resolution {
            Resolution::Content(text) => {
                let full = self.paths.root.join(file_path);
                if let Some(parent) = full.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("create directory {}", parent.display()))?;
                }
                fs::write(&full, text).with_context(|| format!("write {}", full.display()))?;
                self.git.add_path(file_path)?;
            }
            // Sides are restored from their commits so binary content survives.
            Resolution::Ours => {
                self.take_side("HEAD", conflict.ours.is_some(), file_path)?;
            }
            Resolution::Theirs => {
                self.take_side("MERGE_HEAD", conflict.theirs.is_some(), file_path)?;
            }
        }
        conflict.status = status;
        debug!(file_path, status = ?status, "conflict settled");
        save_merge_state(&self.paths.merge_state_path, &state)?;
        Ok(state.conflicts)
    }

    fn take_side(&self, rev: &str, present: bool, file_path: &str) -> OrchResult<()> {
        if present {
            self.git.restore_path_from(rev, file_path)?;
        } else {
            // The chosen side deleted the file.
            self.git.remove_path(file_path)?;
        }
        Ok(())
    }

    fn safety_locked(&self, operation: &SafetyOperation) -> OrchResult<SafetyReport> {
        let mut facts = RepoFacts {
            merge_in_progress: self.git.merge_in_progress()?,
            dirty_paths: self.git.dirty_paths(&[STATE_DIR_PREFIX])?,
            missing_branches: Vec::new(),
            commits_to_merge: None,
            main_branch: self.config.main_branch.clone(),
            review_branch: self.config.review_branch().map(str::to_string),
        };
        match operation {
            SafetyOperation::Checkout { branch } => {
                if !self.git.branch_exists(branch)? {
                    facts.missing_branches.push(branch.clone());
                }
            }
            SafetyOperation::Merge { source, target } => {
                for branch in [source, target] {
                    if !self.git.branch_exists(branch)? {
                        facts.missing_branches.push(branch.clone());
                    }
                }
                if facts.missing_branches.is_empty() {
                    facts.commits_to_merge = Some(self.git.commits_between(target, source)?);
                }
            }
            SafetyOperation::Detach => {
                if !self.git.branch_exists(&self.config.main_branch)? {
                    facts.missing_branches.push(self.config.main_branch.clone());
                }
            }
            SafetyOperation::AbortMerge => {}
        }
        let report = assess(operation, &facts);
        if !report.warnings.is_empty() {
            debug!(operation = %operation.describe(), warnings = ?report.warnings, "safety warnings");
        }
        Ok(report)
    }

    fn ensure_safe(&self, operation: &SafetyOperation) -> OrchResult<SafetyReport> {
        let report = self.safety_locked(operation)?;
        if !report.safe {
            warn!(operation = %operation.describe(), blockers = ?report.blockers, "operation blocked");
            return Err(OrchestratorError::Unsafe(report));
        }
        Ok(report)
    }

    fn load_task(&self, task_id: &str) -> OrchResult<Task> {
        self.store
            .get_task(task_id)?
            .ok_or_else(|| anyhow::anyhow!("task '{task_id}' not found").into())
    }

    fn table(&self) -> OrchResult<BranchTable> {
        Ok(load_branch_table(&self.paths.branches_path)?)
    }

    fn save_table(&self, table: &BranchTable) -> OrchResult<()> {
        Ok(save_branch_table(&self.paths.branches_path, table)?)
    }

    /// Run a git command and log it either way.
    fn logged(
        &self,
        operation: &str,
        task_id: Option<&str>,
        initiator: Initiator,
        f: impl FnOnce(&Git) -> Result<GitOutput, GitFailure>,
    ) -> OrchResult<GitOutput> {
        let started = Instant::now();
        let result = f(&self.git);
        let elapsed = started.elapsed().as_millis() as u64;
        match result {
            Ok(out) => {
                self.record(operation, task_id, initiator, &out, elapsed)?;
                Ok(out)
            }
            Err(failure) => {
                self.record_failure(operation, task_id, initiator, &failure, elapsed)?;
                Err(failure.into())
            }
        }
    }

    /// Like [`Self::logged`] for commands that may have nothing to do.
    fn logged_opt(
        &self,
        operation: &str,
        task_id: Option<&str>,
        initiator: Initiator,
        f: impl FnOnce(&Git) -> Result<Option<GitOutput>, GitFailure>,
    ) -> OrchResult<bool> {
        let started = Instant::now();
        let result = f(&self.git);
        let elapsed = started.elapsed().as_millis() as u64;
        match result {
            Ok(Some(out)) => {
                self.record(operation, task_id, initiator, &out, elapsed)?;
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(failure) => {
                self.record_failure(operation, task_id, initiator, &failure, elapsed)?;
                Err(failure.into())
            }
        }
    }

    fn record(
        &self,
        operation: &str,
        task_id: Option<&str>,
        initiator: Initiator,
        out: &GitOutput,
        duration_ms: u64,
    ) -> OrchResult<()> {
        self.log.append(&NewOperation {
            operation,
            task_id,
            command: &format!("git {}", out.command),
            success: out.success(),
            exit_code: out.exit_code,
            stdout: &out.stdout,
            stderr: &out.stderr,
            initiator,
            duration_ms,
        })?;
        Ok(())
    }

    fn record_failure(
        &self,
        operation: &str,
        task_id: Option<&str>,
        initiator: Initiator,
        failure: &GitFailure,
        duration_ms: u64,
    ) -> OrchResult<()> {
        self.log.append(&NewOperation {
            operation,
            task_id,
            command: &format!("git {}", failure.command),
            success: false,
            exit_code: failure.exit_code,
            stdout: "",
            stderr: &failure.stderr,
            initiator,
            duration_ms,
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::conflict::ConflictType;
    use crate::test_support::TestProject;

    #[test]
    fn create_records_mapping_and_updates_task() {
        let project = TestProject::new().expect("project");
        project.add_task("1", "Add login").expect("task");
        let orch = project.orchestrator();

        let mapping = orch
            .create_task_branch("1", CreateBranchOptions::default())
            .expect("create");
        assert_eq!(mapping.branch_name, "task/1-add-login");
        assert_eq!(mapping.base_commit_hash, mapping.head_commit_hash);
        assert!(project.repo.git().branch_exists("task/1-add-login").expect("exists"));

        let task = project.task("1").expect("task");
        assert_eq!(task.branch_name.as_deref(), Some("task/1-add-login"));

        let entries = orch.operation_log().entries().expect("log");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].operation, "create_branch");
        assert_eq!(entries[0].initiator, Initiator::Operator);
    }

    #[test]
    fn second_create_with_unmerged_mapping_fails_fast() {
        let project = TestProject::new().expect("project");
        project.add_task("1", "Add login").expect("task");
        let orch = project.orchestrator();
        orch.create_task_branch("1", CreateBranchOptions::default())
            .expect("create");
        let err = orch
            .create_task_branch(
                "1",
                CreateBranchOptions {
                    force: true,
                    initiator: Initiator::Runner,
                },
            )
            .expect_err("second create");
        assert!(matches!(err, OrchestratorError::ActiveBranchExists { .. }));
        assert_eq!(orch.branch_table().expect("table").mappings.len(), 1);
    }

    #[test]
    fn existing_branch_requires_force() {
        let project = TestProject::new().expect("project");
        project.add_task("1", "Add login").expect("task");
        project
            .repo
            .git()
            .create_branch("task/1-add-login", false)
            .expect("branch");
        let orch = project.orchestrator();
        let err = orch
            .create_task_branch("1", CreateBranchOptions::default())
            .expect_err("collision");
        assert!(matches!(err, OrchestratorError::BranchExists(_)));
        orch.create_task_branch(
            "1",
            CreateBranchOptions {
                force: true,
                initiator: Initiator::Operator,
            },
        )
        .expect("forced");
    }

    #[test]
    fn checkout_commit_detach_cycle() {
        let project = TestProject::new().expect("project");
        project.add_task("1", "Feature").expect("task");
        let orch = project.orchestrator();
        let created = orch
            .create_task_branch("1", CreateBranchOptions::default())
            .expect("create");

        let mapping = orch
            .checkout_task_branch("1", Initiator::Operator)
            .expect("checkout");
        assert!(mapping.is_checked_out);
        assert_eq!(
            project.repo.git().current_branch().expect("branch").as_deref(),
            Some(created.branch_name.as_str())
        );

        project.repo.write("feature.txt", "hello\n").expect("write");
        let head = orch
            .commit_task_changes("1", "add feature", Initiator::Runner)
            .expect("commit")
            .expect("new head");
        assert_ne!(head, created.base_commit_hash);
        assert_eq!(
            orch.commit_task_changes("1", "nothing", Initiator::Runner)
                .expect("commit"),
            None
        );

        orch.detach_branch_from_task("1", Initiator::Runner)
            .expect("detach");
        assert_eq!(
            project.repo.git().current_branch().expect("branch").as_deref(),
            Some("main")
        );
        let mapping = orch.mapping_for("1").expect("mapping").expect("present");
        assert!(!mapping.is_checked_out);
        assert_eq!(mapping.head_commit_hash, head);
        assert!(project.repo.git().branch_exists(&mapping.branch_name).expect("kept"));
    }

    #[test]
    fn merge_to_review_creates_review_branch_and_marks_merged() {
        let project = TestProject::new().expect("project");
        project.add_task("1", "Feature").expect("task");
        let orch = project.orchestrator();
        orch.create_task_branch("1", CreateBranchOptions::default())
            .expect("create");
        orch.checkout_task_branch("1", Initiator::Runner)
            .expect("checkout");
        project.repo.write("feature.txt", "hello\n").expect("write");
        orch.commit_task_changes("1", "feature", Initiator::Runner)
            .expect("commit");

        let outcome = orch
            .merge_task_to_review("1", Initiator::Runner)
            .expect("merge");
        assert!(!outcome.had_conflicts);
        let merge_commit = outcome.merge_commit_hash.expect("merge commit");

        let mapping = orch.mapping_for("1").expect("mapping").expect("present");
        assert!(mapping.is_merged);
        assert_eq!(mapping.merged_to.as_deref(), Some("review"));
        assert_eq!(mapping.merge_commit_hash.as_deref(), Some(merge_commit.as_str()));

        let summary = orch.review_summary().expect("summary").expect("present");
        assert_eq!(summary.merged_tasks, vec!["1".to_string()]);
        assert_eq!(summary.head_commit_hash, merge_commit);

        let review_to_main = orch.merge_review_to_main(Initiator::Operator).expect("merge");
        assert!(!review_to_main.had_conflicts);
        let summary = orch.review_summary().expect("summary").expect("present");
        assert!(summary.last_merged_to_main_at.is_some());
        assert_eq!(summary.last_main_merge_commit, review_to_main.merge_commit_hash);
        assert!(summary.merged_tasks.is_empty());

        let mapping = orch.mapping_for("1").expect("mapping").expect("present");
        assert_eq!(mapping.merged_to.as_deref(), Some("main"));
        assert_eq!(mapping.merge_commit_hash, review_to_main.merge_commit_hash);
    }

    #[test]
    fn conflicting_merge_to_main_leaves_mapping_untouched() {
        let project = TestProject::new().expect("project");
        let git = project.repo.git();
        project.repo.write("shared.txt", "base\n").expect("write");
        project.repo.commit_all("base").expect("commit");
        project.add_task("1", "Edit shared").expect("task");
        let orch = project.orchestrator();

        let created = orch
            .create_task_branch("1", CreateBranchOptions::default())
            .expect("create");
        orch.checkout_task_branch("1", Initiator::Runner)
            .expect("checkout");
        project.repo.write("shared.txt", "task\n").expect("write");
        project.repo.write("other.txt", "task\n").expect("write");
        let task_head = orch
            .commit_task_changes("1", "task edit", Initiator::Runner)
            .expect("commit")
            .expect("head");

        git.checkout("main").expect("main");
        project.repo.write("shared.txt", "main\n").expect("write");
        project.repo.write("other.txt", "main\n").expect("write");
        project.repo.commit_all("main edit").expect("commit");

        let outcome = orch
            .merge_task_to_main("1", Initiator::Operator)
            .expect("merge");
        assert!(outcome.had_conflicts);
        assert_eq!(outcome.merge_commit_hash, None);
        assert_eq!(outcome.conflicts.len(), 2);
        let shared = outcome
            .conflicts
            .iter()
            .find(|c| c.file_path == "shared.txt")
            .expect("shared conflict");
        assert_eq!(shared.conflict_type, ConflictType::Content);
        assert_eq!(shared.ours.as_deref(), Some("main\n"));
        assert_eq!(shared.theirs.as_deref(), Some("task\n"));

        let mapping = orch.mapping_for("1").expect("mapping").expect("present");
        assert!(!mapping.is_merged);
        assert_eq!(mapping.head_commit_hash, task_head);
        assert_ne!(mapping.head_commit_hash, created.base_commit_hash);
        assert!(orch.merge_state().expect("state").is_some());

        // Finalize refuses while conflicts remain.
        assert!(matches!(
            orch.finalize_merge(Initiator::Operator),
            Err(OrchestratorError::UnresolvedConflicts(2))
        ));

        orch.resolve_conflict("shared.txt", Resolution::Content("merged\n".to_string()))
            .expect("resolve");
        let remaining = orch.skip_conflict("other.txt").expect("skip");
        assert!(remaining.iter().all(|c| c.status != ConflictStatus::Unresolved));

        let finished = orch.finalize_merge(Initiator::Operator).expect("finalize");
        assert!(finished.merge_commit_hash.is_some());
        assert!(orch.merge_state().expect("state").is_none());
        assert_eq!(project.repo.read("shared.txt").expect("read"), "merged\n");
        assert_eq!(project.repo.read("other.txt").expect("read"), "main\n");
        let mapping = orch.mapping_for("1").expect("mapping").expect("present");
        assert!(mapping.is_merged);
        assert_eq!(mapping.merged_to.as_deref(), Some("main"));
    }

    #[test]
    fn ours_and_theirs_keep_binary_content_byte_exact() {
        let project = TestProject::new().expect("project");
        let root = project.repo.path().to_path_buf();
        let main_bytes: &[u8] = &[195, 40, 153, 0];
        let task_bytes: &[u8] = &[0, 159, 146, 150, 255];
        for name in ["a.bin", "b.bin"] {
            fs::write(root.join(name), [1u8, 2, 3]).expect("write");
        }
        project.repo.commit_all("base").expect("commit");
        project.add_task("1", "Binary").expect("task");
        let orch = project.orchestrator();
        orch.create_task_branch("1", CreateBranchOptions::default())
            .expect("create");
        orch.checkout_task_branch("1", Initiator::Runner)
            .expect("checkout");
        for name in ["a.bin", "b.bin"] {
            fs::write(root.join(name), task_bytes).expect("write");
        }
        orch.commit_task_changes("1", "task", Initiator::Runner)
            .expect("commit");
        project.repo.git().checkout("main").expect("main");
        for name in ["a.bin", "b.bin"] {
            fs::write(root.join(name), main_bytes).expect("write");
        }
        project.repo.commit_all("main").expect("commit");

        let outcome = orch.merge_task_to_main("1", Initiator::Operator).expect("merge");
        assert!(outcome.had_conflicts);
        orch.resolve_conflict("a.bin", Resolution::Ours).expect("ours");
        orch.resolve_conflict("b.bin", Resolution::Theirs).expect("theirs");
        orch.finalize_merge(Initiator::Operator).expect("finalize");

        assert_eq!(fs::read(root.join("a.bin")).expect("read"), main_bytes);
        assert_eq!(fs::read(root.join("b.bin")).expect("read"), task_bytes);
    }

    #[test]
    fn abort_restores_tree_and_blocks_when_idle() {
        let project = TestProject::new().expect("project");
        project.repo.write("shared.txt", "base\n").expect("write");
        project.repo.commit_all("base").expect("commit");
        project.add_task("1", "Edit").expect("task");
        let orch = project.orchestrator();
        orch.create_task_branch("1", CreateBranchOptions::default())
            .expect("create");
        orch.checkout_task_branch("1", Initiator::Runner)
            .expect("checkout");
        project.repo.write("shared.txt", "task\n").expect("write");
        orch.commit_task_changes("1", "task", Initiator::Runner)
            .expect("commit");
        project.repo.git().checkout("main").expect("main");
        project.repo.write("shared.txt", "main\n").expect("write");
        project.repo.commit_all("main").expect("commit");

        let outcome = orch.merge_task_to_main("1", Initiator::Runner).expect("merge");
        assert!(outcome.had_conflicts);

        // Switching branches is unsafe mid-merge.
        let err = orch
            .checkout_task_branch("1", Initiator::Operator)
            .expect_err("blocked");
        assert!(err.safety_report().is_some());

        orch.abort_merge(Initiator::Operator).expect("abort");
        assert!(!project.repo.git().merge_in_progress().expect("state"));
        assert_eq!(project.repo.read("shared.txt").expect("read"), "main\n");

        let err = orch.abort_merge(Initiator::Operator).expect_err("nothing to abort");
        assert!(matches!(err, OrchestratorError::Unsafe(_)));
    }

    #[test]
    fn dirty_tree_blocks_merge() {
        let project = TestProject::new().expect("project");
        project.add_task("1", "Edit").expect("task");
        let orch = project.orchestrator();
        orch.create_task_branch("1", CreateBranchOptions::default())
            .expect("create");
        project.repo.write("stray.txt", "dirty").expect("write");
        let report = orch
            .run_safety_check(&SafetyOperation::Merge {
                source: "task/1-edit".to_string(),
                target: "main".to_string(),
            })
            .expect("check");
        assert!(!report.safe);
        let err = orch.merge_task_to_main("1", Initiator::Operator).expect_err("blocked");
        assert!(matches!(err, OrchestratorError::Unsafe(_)));
    }
}
