//! Task persistence.
//!
//! [`TaskStore`] is the seam the runner and the host talk to; the default
//! implementation keeps every task in `.conductor/tasks.json` and rewrites the
//! file atomically on each mutation.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Result, anyhow};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::atomic::{read_json_opt, write_json_atomic};
use crate::core::selector::order_pending;
use crate::core::types::{Author, CommentKind, OrderingStrategy, Task, TaskComment, TaskStatus};

/// Task persistence used by the runner and host surfaces.
pub trait TaskStore: Send + Sync {
    fn list_tasks(&self) -> Result<Vec<Task>>;

    fn get_task(&self, id: &str) -> Result<Option<Task>>;

    /// Add a new task. Fails if the id is taken.
    fn insert_task(&self, task: Task) -> Result<()>;

    /// Replace the stored task with the same id.
    fn update_task(&self, task: &Task) -> Result<()>;

    fn move_task(&self, id: &str, status: TaskStatus) -> Result<Task>;

    fn add_typed_comment(
        &self,
        task_id: &str,
        kind: CommentKind,
        author: Author,
        content: &str,
        run_id: Option<&str>,
    ) -> Result<TaskComment>;

    /// Mark a question/blocker comment as answered.
    fn resolve_comment(&self, task_id: &str, comment_id: u64) -> Result<()>;

    /// Eligible tasks in the order the runner should take them.
    fn pending_tasks(&self, strategy: OrderingStrategy) -> Result<Vec<Task>> {
        Ok(order_pending(&self.list_tasks()?, strategy))
    }
}

/// On-disk shape of `tasks.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFile {
    #[serde(default)]
    pub tasks: Vec<Task>,
}

#[derive(Debug)]
pub struct FileTaskStore {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process.
    lock: Mutex<()>,
}

impl FileTaskStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<TaskFile> {
        Ok(read_json_opt(&self.path)?.unwrap_or_default())
    }

    pub fn save(&self, file: &TaskFile) -> Result<()> {
        write_json_atomic(&self.path, file)
    }

    fn modify<R>(&self, f: impl FnOnce(&mut Vec<Task>) -> Result<R>) -> Result<R> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow!("task store lock poisoned"))?;
        let mut file = self.load()?;
        let out = f(&mut file.tasks)?;
        self.save(&file)?;
        Ok(out)
    }
}

impl TaskStore for FileTaskStore {
    fn list_tasks(&self) -> Result<Vec<Task>> {
        Ok(self.load()?.tasks)
    }

    fn get_task(&self, id: &str) -> Result<Option<Task>> {
        Ok(self.load()?.tasks.into_iter().find(|t| t.id == id))
    }

    fn insert_task(&self, task: Task) -> Result<()> {
        self.modify(|tasks| insert_into(tasks, task))
    }

    fn update_task(&self, task: &Task) -> Result<()> {
        self.modify(|tasks| update_in(tasks, task))
    }

    fn move_task(&self, id: &str, status: TaskStatus) -> Result<Task> {
        self.modify(|tasks| move_in(tasks, id, status))
    }

    fn add_typed_comment(
        &self,
        task_id: &str,
        kind: CommentKind,
        author: Author,
        content: &str,
        run_id: Option<&str>,
    ) -> Result<TaskComment> {
        self.modify(|tasks| comment_in(tasks, task_id, kind, author, content, run_id))
    }

    fn resolve_comment(&self, task_id: &str, comment_id: u64) -> Result<()> {
        self.modify(|tasks| resolve_in(tasks, task_id, comment_id))
    }
}

fn find_mut<'a>(tasks: &'a mut [Task], id: &str) -> Result<&'a mut Task> {
    tasks
        .iter_mut()
        .find(|t| t.id == id)
        .ok_or_else(|| anyhow!("task '{id}' not found"))
}

// The helpers below are shared with in-memory stores used in tests.

pub fn insert_into(tasks: &mut Vec<Task>, task: Task) -> Result<()> {
    if tasks.iter().any(|t| t.id == task.id) {
        return Err(anyhow!("task '{}' already exists", task.id));
    }
    tasks.push(task);
    Ok(())
}

pub fn update_in(tasks: &mut [Task], task: &Task) -> Result<()> {
    let slot = find_mut(tasks, &task.id)?;
    *slot = task.clone();
    slot.updated_at = Utc::now();
    Ok(())
}

pub fn move_in(tasks: &mut [Task], id: &str, status: TaskStatus) -> Result<Task> {
    let task = find_mut(tasks, id)?;
    debug!(task_id = id, from = task.status.as_str(), to = status.as_str(), "move task");
    task.status = status;
    task.updated_at = Utc::now();
    Ok(task.clone())
}

pub fn comment_in(
    tasks: &mut [Task],
    task_id: &str,
    kind: CommentKind,
    author: Author,
    content: &str,
    run_id: Option<&str>,
) -> Result<TaskComment> {
    let task = find_mut(tasks, task_id)?;
    let id = task.comments.iter().map(|c| c.id).max().unwrap_or(0) + 1;
    let comment = TaskComment {
        id,
        kind,
        author,
        content: content.to_string(),
        run_id: run_id.map(str::to_string),
        created_at: Utc::now(),
        resolved: !kind.is_blocking(),
    };
    task.comments.push(comment.clone());
    task.updated_at = comment.created_at;
    Ok(comment)
}

pub fn resolve_in(tasks: &mut [Task], task_id: &str, comment_id: u64) -> Result<()> {
    let task = find_mut(tasks, task_id)?;
    let comment = task
        .comments
        .iter_mut()
        .find(|c| c.id == comment_id)
        .ok_or_else(|| anyhow!("comment {comment_id} not found on task '{task_id}'"))?;
    comment.resolved = true;
    task.updated_at = Utc::now();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, FileTaskStore) {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileTaskStore::new(temp.path().join("tasks.json"));
        (temp, store)
    }

    #[test]
    fn missing_file_is_empty() {
        let (_temp, store) = store();
        assert!(store.list_tasks().expect("list").is_empty());
    }

    #[test]
    fn insert_move_and_comment_persist() {
        let (_temp, store) = store();
        store.insert_task(Task::new("1", "First")).expect("insert");
        assert!(store.insert_task(Task::new("1", "Dup")).is_err());

        let moved = store.move_task("1", TaskStatus::Doing).expect("move");
        assert_eq!(moved.status, TaskStatus::Doing);

        let c1 = store
            .add_typed_comment("1", CommentKind::Progress, Author::Agent, "working", Some("run-1"))
            .expect("comment");
        let c2 = store
            .add_typed_comment("1", CommentKind::Question, Author::Agent, "which db?", None)
            .expect("comment");
        assert_eq!((c1.id, c2.id), (1, 2));
        assert!(c1.resolved);
        assert!(!c2.resolved);

        let reloaded = FileTaskStore::new(store.path());
        let task = reloaded.get_task("1").expect("get").expect("present");
        assert_eq!(task.status, TaskStatus::Doing);
        assert_eq!(task.comments.len(), 2);
        assert!(task.has_unresolved_blocker());

        reloaded.resolve_comment("1", 2).expect("resolve");
        let task = reloaded.get_task("1").expect("get").expect("present");
        assert!(!task.has_unresolved_blocker());
    }

    #[test]
    fn pending_tasks_skip_blocked_questions() {
        let (_temp, store) = store();
        store.insert_task(Task::new("a", "A")).expect("insert");
        store.insert_task(Task::new("b", "B")).expect("insert");
        store
            .add_typed_comment("a", CommentKind::Blocker, Author::Agent, "need creds", None)
            .expect("comment");
        let pending = store.pending_tasks(OrderingStrategy::Fifo).expect("pending");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "b");
    }

    #[test]
    fn unknown_task_errors() {
        let (_temp, store) = store();
        let err = store.move_task("nope", TaskStatus::Done).expect_err("missing");
        assert!(err.to_string().contains("nope"));
    }
}
