//! Pre-flight safety assessment for branch operations.
//!
//! The orchestrator gathers [`RepoFacts`] from git and this module turns them
//! into a [`SafetyReport`]. Any blocker prevents the operation.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum SafetyOperation {
    Checkout { branch: String },
    Merge { source: String, target: String },
    Detach,
    AbortMerge,
}

impl SafetyOperation {
    pub fn describe(&self) -> String {
        match self {
            SafetyOperation::Checkout { branch } => format!("checkout {branch}"),
            SafetyOperation::Merge { source, target } => format!("merge {source} into {target}"),
            SafetyOperation::Detach => "detach".to_string(),
            SafetyOperation::AbortMerge => "abort merge".to_string(),
        }
    }
}

/// Repository observations relevant to a safety decision.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepoFacts {
    pub merge_in_progress: bool,
    pub dirty_paths: Vec<String>,
    /// Branches named by the operation that do not exist.
    pub missing_branches: Vec<String>,
    /// Commits on the merge source not yet on the target, when known.
    pub commits_to_merge: Option<u64>,
    pub main_branch: String,
    pub review_branch: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyReport {
    pub safe: bool,
    pub warnings: Vec<String>,
    pub blockers: Vec<String>,
    pub suggestions: Vec<String>,
}

impl SafetyReport {
    fn block(&mut self, blocker: String, suggestion: Option<&str>) {
        self.blockers.push(blocker);
        if let Some(s) = suggestion {
            self.suggestions.push(s.to_string());
        }
    }
}

pub fn assess(operation: &SafetyOperation, facts: &RepoFacts) -> SafetyReport {
    let mut report = SafetyReport::default();

    for branch in &facts.missing_branches {
        report.block(format!("branch '{branch}' does not exist"), None);
    }

    match operation {
        SafetyOperation::Merge { source, target } => {
            if facts.merge_in_progress {
                report.block(
                    "a merge is already in progress".to_string(),
                    Some("finalize or abort the current merge first"),
                );
            }
            if !facts.dirty_paths.is_empty() {
                report.block(
                    format!(
                        "working tree has uncommitted changes ({} files)",
                        facts.dirty_paths.len()
                    ),
                    Some("commit or discard local changes before merging"),
                );
            }
            if facts.commits_to_merge == Some(0) {
                report
                    .warnings
                    .push(format!("nothing to merge: '{source}' has no commits missing from '{target}'"));
            }
            if let Some(review) = &facts.review_branch
                && *target == facts.main_branch
                && source != review
            {
                report.warnings.push(format!(
                    "merging '{source}' straight to '{target}' bypasses review branch '{review}'"
                ));
            }
        }
        SafetyOperation::Checkout { .. } | SafetyOperation::Detach => {
            if facts.merge_in_progress {
                report.block(
                    "cannot switch branches while a merge is unresolved".to_string(),
                    Some("finalize or abort the current merge first"),
                );
            }
            if !facts.dirty_paths.is_empty() {
                report.warnings.push(format!(
                    "{} uncommitted changes will be carried to the new branch",
                    facts.dirty_paths.len()
                ));
            }
        }
        SafetyOperation::AbortMerge => {
            if !facts.merge_in_progress {
                report.block("no merge is in progress".to_string(), None);
            }
        }
    }

    report.safe = report.blockers.is_empty();
    report
}
