//! Closed error taxonomy for library boundaries.
//!
//! File and config plumbing uses `anyhow`; the orchestrator, the provider
//! seam and the policy gate return these typed errors so callers can decide
//! between retrying, failing the task or reporting back to the agent.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::policy::{DenyReason, Operation};
use crate::core::safety::SafetyReport;

/// A git subprocess that exited unsuccessfully.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("git {command} failed (exit {}): {stderr}", exit_code.map_or_else(|| "signal".to_string(), |c| c.to_string()))]
pub struct GitFailure {
    pub command: String,
    pub exit_code: Option<i32>,
    pub stderr: String,
}

const TRANSIENT_MARKERS: &[&str] = &["index.lock", "cannot lock ref", "Unable to create"];

impl GitFailure {
    /// Lock contention that is worth one retry.
    pub fn is_transient(&self) -> bool {
        TRANSIENT_MARKERS
            .iter()
            .any(|marker| self.stderr.contains(marker))
    }
}

/// An agent operation the policy gate refused. Recoverable: it is reported
/// back to the agent as a tool result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("policy denied {} '{}': {reason}", operation.kind.as_str(), operation.target)]
pub struct PolicyViolation {
    pub operation: Operation,
    pub reason: DenyReason,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider call cancelled")]
    Cancelled,
    #[error("failed to start provider: {0}")]
    Spawn(String),
    #[error("provider timed out after {secs}s")]
    Timeout { secs: u64 },
    #[error("provider exited with {}: {stderr}", exit_code.map_or_else(|| "signal".to_string(), |c| c.to_string()))]
    Exit { exit_code: Option<i32>, stderr: String },
    #[error("provider transport error: {0}")]
    Transport(String),
    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Git(#[from] GitFailure),
    #[error("task {task_id} already has active branch '{branch}'")]
    ActiveBranchExists { task_id: String, branch: String },
    #[error("branch '{0}' already exists")]
    BranchExists(String),
    #[error("invalid branch name '{name}': {reason}")]
    InvalidBranchName { name: String, reason: String },
    #[error("task {0} has no active branch")]
    NoActiveBranch(String),
    #[error("operation blocked: {}", .0.blockers.join("; "))]
    Unsafe(SafetyReport),
    #[error("no merge is in progress")]
    NoMergeInProgress,
    #[error("no conflict recorded for '{0}'")]
    UnknownConflict(String),
    #[error("{0} conflicts are still unresolved")]
    UnresolvedConflicts(usize),
    #[error("no review branch is configured")]
    NoReviewBranch,
    #[error(transparent)]
    State(#[from] anyhow::Error),
}

impl OrchestratorError {
    /// The safety report, when the operation was refused by the safety check.
    pub fn safety_report(&self) -> Option<&SafetyReport> {
        match self {
            OrchestratorError::Unsafe(report) => Some(report),
            _ => None,
        }
    }
}
