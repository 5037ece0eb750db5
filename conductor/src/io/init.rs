//! Canonical `.conductor/` layout and project scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::atomic::write_atomic;
use super::config::{ConductorConfig, write_config};
use super::policy_store::save_policy;
use super::task_store::{FileTaskStore, TaskFile};
use crate::core::policy::Policy;

/// State files are local to a checkout; nothing under `.conductor/` is tracked.
const CONDUCTOR_GITIGNORE: &str = "*\n";

/// All canonical paths within `.conductor/` for a project root.
#[derive(Debug, Clone)]
pub struct ConductorPaths {
    pub root: PathBuf,
    pub conductor_dir: PathBuf,
    pub state_dir: PathBuf,
    pub runs_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
    pub policy_path: PathBuf,
    pub tasks_path: PathBuf,
    pub op_log_path: PathBuf,
    pub branches_path: PathBuf,
    pub review_branch_path: PathBuf,
    pub merge_state_path: PathBuf,
}

impl ConductorPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let conductor_dir = root.join(".conductor");
        let state_dir = conductor_dir.join("state");
        let runs_dir = conductor_dir.join("runs");
        Self {
            root: root.clone(),
            conductor_dir: conductor_dir.clone(),
            state_dir: state_dir.clone(),
            runs_dir,
            gitignore_path: conductor_dir.join(".gitignore"),
            config_path: conductor_dir.join("config.toml"),
            policy_path: conductor_dir.join("policy.json"),
            tasks_path: conductor_dir.join("tasks.json"),
            op_log_path: state_dir.join("operations.jsonl"),
            branches_path: state_dir.join("branches.json"),
            review_branch_path: state_dir.join("review_branch.json"),
            merge_state_path: state_dir.join("merge_state.json"),
        }
    }

    pub fn transcript_path(&self, run_id: &str, task_id: &str) -> PathBuf {
        self.runs_dir
            .join(run_id)
            .join(task_id)
            .join("transcript.json")
    }
}

#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    /// Overwrite existing conductor-owned files.
    pub force: bool,
}

/// Create `.conductor/` scaffolding in `root`.
///
/// Fails if `.conductor/` already exists unless `options.force` is set.
pub fn init_project(root: &Path, options: &InitOptions) -> Result<ConductorPaths> {
    let paths = ConductorPaths::new(root);
    if paths.conductor_dir.exists() && !paths.conductor_dir.is_dir() {
        return Err(anyhow!("init: .conductor exists but is not a directory"));
    }
    if paths.conductor_dir.exists() && !options.force {
        return Err(anyhow!(
            "init: .conductor already exists (use --force to overwrite)"
        ));
    }

    for dir in [&paths.conductor_dir, &paths.state_dir, &paths.runs_dir] {
        fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
    }
    write_atomic(&paths.gitignore_path, CONDUCTOR_GITIGNORE)?;
    write_config(&paths.config_path, &ConductorConfig::default())?;
    save_policy(&paths.policy_path, &Policy::default())?;
    FileTaskStore::new(&paths.tasks_path).save(&TaskFile::default())?;

    Ok(paths)
}
