//! Merge-conflict records and resolution heuristics.

use serde::{Deserialize, Serialize};

/// How the two sides collided on a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Both sides changed overlapping lines.
    Content,
    /// Both sides added the file.
    AddAdd,
    /// Target deleted the file, source modified it.
    DeleteModify,
    /// Target modified the file, source deleted it.
    ModifyDelete,
}

impl ConflictType {
    /// Classify from the presence of the index stages (1=base, 2=ours, 3=theirs).
    pub fn from_stages(base: bool, ours: bool, theirs: bool) -> Self {
        match (base, ours, theirs) {
            (false, true, true) => ConflictType::AddAdd,
            (true, false, true) => ConflictType::DeleteModify,
            (true, true, false) => ConflictType::ModifyDelete,
            _ => ConflictType::Content,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStatus {
    #[default]
    Unresolved,
    Resolved,
    Skipped,
}

/// Suggested way to settle a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuggestedResolution {
    Ours,
    Theirs,
    Manual,
}

/// One conflicting file in an unresolved merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictInfo {
    pub file_path: String,
    pub conflict_type: ConflictType,
    #[serde(default)]
    pub ours: Option<String>,
    #[serde(default)]
    pub theirs: Option<String>,
    #[serde(default)]
    pub base: Option<String>,
    pub suggested_resolution: SuggestedResolution,
    #[serde(default)]
    pub status: ConflictStatus,
}

impl ConflictInfo {
    pub fn new(
        file_path: impl Into<String>,
        base: Option<String>,
        ours: Option<String>,
        theirs: Option<String>,
    ) -> Self {
        let conflict_type = ConflictType::from_stages(base.is_some(), ours.is_some(), theirs.is_some());
        let suggested_resolution = suggest_resolution(base.as_deref(), ours.as_deref(), theirs.as_deref());
        Self {
            file_path: file_path.into(),
            conflict_type,
            ours,
            theirs,
            base,
            suggested_resolution,
            status: ConflictStatus::Unresolved,
        }
    }
}

/// Operator's choice for a conflicting file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", content = "content", rename_all = "lowercase")]
pub enum Resolution {
    Ours,
    Theirs,
    Content(String),
}

/// If only one side changed relative to the base, take that side.
fn suggest_resolution(
    base: Option<&str>,
    ours: Option<&str>,
    theirs: Option<&str>,
) -> SuggestedResolution {
    if ours == theirs {
        return SuggestedResolution::Ours;
    }
    match base {
        Some(_) if base == ours => SuggestedResolution::Theirs,
        Some(_) if base == theirs => SuggestedResolution::Ours,
        _ => match (ours, theirs) {
            (Some(o), Some(t)) if o.trim() == t.trim() => SuggestedResolution::Ours,
            _ => SuggestedResolution::Manual,
        },
    }
}
