//! Test-only fixtures: temp git repos, initialized projects, scripted
//! providers and an in-memory task store.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::cancel::CancelToken;
use crate::core::types::{Author, CommentKind, Task, TaskComment, TaskStatus};
use crate::error::ProviderError;
use crate::io::config::{ConductorConfig, load_config};
use crate::io::git::Git;
use crate::io::init::{ConductorPaths, InitOptions, init_project};
use crate::io::provider::{Completion, CompletionRequest, Provider};
use crate::io::task_store::{
    FileTaskStore, TaskStore, comment_in, insert_into, move_in, resolve_in, update_in,
};
use crate::orchestrator::BranchOrchestrator;

/// A throwaway git repository on `main` with one commit.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp dir")?;
        let root = dir.path();
        run_git(root, &["init", "--quiet"])?;
        run_git(root, &["symbolic-ref", "HEAD", "refs/heads/main"])?;
        run_git(root, &["config", "user.email", "test@example.com"])?;
        run_git(root, &["config", "user.name", "test"])?;
        run_git(root, &["config", "commit.gpgsign", "false"])?;
        fs::write(root.join("README.md"), "hi\n").context("write README.md")?;
        run_git(root, &["add", "README.md"])?;
        run_git(root, &["commit", "--quiet", "-m", "chore: init"])?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn git(&self) -> Git {
        Git::new(self.dir.path())
    }

    pub fn write(&self, rel: &str, contents: &str) -> Result<()> {
        let path = self.dir.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }

    pub fn read(&self, rel: &str) -> Result<String> {
        let path = self.dir.path().join(rel);
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }

    /// Stage everything and commit; returns the new head.
    pub fn commit_all(&self, message: &str) -> Result<String> {
        run_git(self.path(), &["add", "-A"])?;
        run_git(self.path(), &["commit", "--quiet", "-m", message])?;
        run_git(self.path(), &["rev-parse", "HEAD"])
    }
}

fn run_git(dir: &Path, args: &[&str]) -> Result<String> {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .with_context(|| format!("spawn git {}", args.join(" ")))?;
    if !out.status.success() {
        return Err(anyhow!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&out.stderr).trim()
        ));
    }
    Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
}

/// A [`TestRepo`] with `.conductor/` initialized and a file-backed store.
pub struct TestProject {
    pub repo: TestRepo,
    pub paths: ConductorPaths,
    pub config: ConductorConfig,
    pub store: Arc<FileTaskStore>,
}

impl TestProject {
    pub fn new() -> Result<Self> {
        let repo = TestRepo::new()?;
        let paths = init_project(repo.path(), &InitOptions::default())?;
        let config = load_config(&paths.config_path)?;
        let store = Arc::new(FileTaskStore::new(&paths.tasks_path));
        Ok(Self {
            repo,
            paths,
            config,
            store,
        })
    }

    pub fn add_task(&self, id: &str, title: &str) -> Result<Task> {
        let task = Task::new(id, title);
        self.store.insert_task(task.clone())?;
        Ok(task)
    }

    pub fn task(&self, id: &str) -> Result<Task> {
        self.store
            .get_task(id)?
            .ok_or_else(|| anyhow!("task '{id}' not found"))
    }

    pub fn task_store(&self) -> Arc<dyn TaskStore> {
        self.store.clone()
    }

    pub fn orchestrator(&self) -> BranchOrchestrator {
        BranchOrchestrator::new(self.paths.clone(), self.config.clone(), self.task_store())
    }
}

/// One scripted provider turn.
#[derive(Debug)]
pub enum ScriptedStep {
    /// Stream `content` as one chunk, then return the completion.
    Reply(Completion),
    Fail(ProviderError),
    /// Stream the text, cancel the caller's token, return `Cancelled`.
    CancelAfter(String),
}

type Hook = Box<dyn Fn(usize) + Send + Sync>;

/// Provider that replays predetermined turns. Once the script runs out it
/// answers `"done"` without tool calls.
pub struct ScriptedProvider {
    steps: Mutex<VecDeque<ScriptedStep>>,
    requests: Mutex<Vec<CompletionRequest>>,
    workdir: Mutex<Option<PathBuf>>,
    calls: AtomicUsize,
    cancelled: AtomicBool,
    hook: Option<Hook>,
}

impl ScriptedProvider {
    pub fn new(steps: Vec<ScriptedStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            requests: Mutex::new(Vec::new()),
            workdir: Mutex::new(None),
            calls: AtomicUsize::new(0),
            cancelled: AtomicBool::new(false),
            hook: None,
        }
    }

    /// Run `hook(call_index)` at the start of every completion.
    pub fn with_hook(mut self, hook: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn working_directory(&self) -> Option<PathBuf> {
        self.workdir
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn was_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl Provider for ScriptedProvider {
    fn complete(
        &self,
        request: &CompletionRequest,
        on_chunk: &mut dyn FnMut(&str),
        cancel: &CancelToken,
    ) -> Result<Completion, ProviderError> {
        let index = self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        if let Some(hook) = &self.hook {
            hook(index);
        }
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        let step = self
            .steps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        match step {
            Some(ScriptedStep::Reply(completion)) => {
                if !completion.content.is_empty() {
                    on_chunk(&completion.content);
                }
                Ok(completion)
            }
            Some(ScriptedStep::Fail(err)) => Err(err),
            Some(ScriptedStep::CancelAfter(text)) => {
                on_chunk(&text);
                cancel.cancel();
                Err(ProviderError::Cancelled)
            }
            None => {
                on_chunk("done");
                Ok(Completion {
                    content: "done".to_string(),
                    ..Completion::default()
                })
            }
        }
    }

    fn set_working_directory(&self, path: &Path) {
        *self.workdir.lock().unwrap_or_else(PoisonError::into_inner) = Some(path.to_path_buf());
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

/// Task store kept entirely in memory.
#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: Mutex<Vec<Task>>,
}

impl MemoryTaskStore {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self {
            tasks: Mutex::new(tasks),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut Vec<Task>) -> Result<R>) -> Result<R> {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut tasks)
    }
}

impl TaskStore for MemoryTaskStore {
    fn list_tasks(&self) -> Result<Vec<Task>> {
        self.with(|tasks| Ok(tasks.clone()))
    }

    fn get_task(&self, id: &str) -> Result<Option<Task>> {
        self.with(|tasks| Ok(tasks.iter().find(|t| t.id == id).cloned()))
    }

    fn insert_task(&self, task: Task) -> Result<()> {
        self.with(|tasks| insert_into(tasks, task))
    }

    fn update_task(&self, task: &Task) -> Result<()> {
        self.with(|tasks| update_in(tasks, task))
    }

    fn move_task(&self, id: &str, status: TaskStatus) -> Result<Task> {
        self.with(|tasks| move_in(tasks, id, status))
    }

    fn add_typed_comment(
        &self,
        task_id: &str,
        kind: CommentKind,
        author: Author,
        content: &str,
        run_id: Option<&str>,
    ) -> Result<TaskComment> {
        self.with(|tasks| comment_in(tasks, task_id, kind, author, content, run_id))
    }

    fn resolve_comment(&self, task_id: &str, comment_id: u64) -> Result<()> {
        self.with(|tasks| resolve_in(tasks, task_id, comment_id))
    }
}
