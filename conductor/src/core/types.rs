//! Shared deterministic types for conductor core logic.
//!
//! These types define stable contracts between the task store, the runner and
//! the branch orchestrator. They carry no I/O and serialize to the on-disk
//! formats under `.conductor/`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Board column a task currently sits in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Backlog,
    Todo,
    Doing,
    Review,
    Done,
    Failed,
    Blocked,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Backlog => "backlog",
            TaskStatus::Todo => "todo",
            TaskStatus::Doing => "doing",
            TaskStatus::Review => "review",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::Blocked => "blocked",
        }
    }

    /// Statuses the runner may pick up.
    pub fn is_pending(self) -> bool {
        matches!(self, TaskStatus::Todo | TaskStatus::Backlog)
    }

    /// Statuses that satisfy a dependency edge.
    pub fn satisfies_dependency(self) -> bool {
        matches!(self, TaskStatus::Review | TaskStatus::Done)
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommentKind {
    Progress,
    Summary,
    Failure,
    Question,
    Blocker,
    Conflict,
    System,
}

impl CommentKind {
    /// Kinds that hold a task back until an operator resolves them.
    pub fn is_blocking(self) -> bool {
        matches!(self, CommentKind::Question | CommentKind::Blocker)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Author {
    Agent,
    Operator,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskComment {
    pub id: u64,
    pub kind: CommentKind,
    pub author: Author,
    pub content: String,
    #[serde(default)]
    pub run_id: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Only meaningful for blocking kinds; other kinds are created resolved.
    #[serde(default)]
    pub resolved: bool,
}

/// A unit of delegated work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub current_run_id: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Whether running the task is expected to touch the working tree.
    #[serde(default = "default_code_changes")]
    pub code_changes: bool,
    #[serde(default)]
    pub comments: Vec<TaskComment>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_code_changes() -> bool {
    true
}

impl Task {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            status: TaskStatus::Todo,
            priority: Priority::Medium,
            acceptance_criteria: Vec::new(),
            branch_name: None,
            current_run_id: None,
            depends_on: Vec::new(),
            code_changes: true,
            comments: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// True if an unresolved question or blocker comment is attached.
    pub fn has_unresolved_blocker(&self) -> bool {
        self.comments
            .iter()
            .any(|c| c.kind.is_blocking() && !c.resolved)
    }
}

/// Ordering strategy used when popping the next eligible task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderingStrategy {
    #[default]
    Fifo,
    Priority,
    Dependency,
}

/// Who asked for a state-changing operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Initiator {
    Runner,
    Operator,
    Agent,
}

impl Initiator {
    pub fn as_str(self) -> &'static str {
        match self {
            Initiator::Runner => "runner",
            Initiator::Operator => "operator",
            Initiator::Agent => "agent",
        }
    }
}
