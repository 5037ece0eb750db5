//! Persistent branch bookkeeping under `.conductor/state/`.
//!
//! - `branches.json`: flat table of task→branch mappings keyed by arena id.
//!   Merged mappings are retained for audit.
//! - `review_branch.json`: summary of the review integration branch.
//! - `merge_state.json`: present only while a merge is unresolved.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::atomic::{read_json_opt, write_json_atomic};
use crate::core::conflict::{ConflictInfo, ConflictStatus};
use crate::core::types::Initiator;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskBranchMapping {
    pub id: u64,
    pub task_id: String,
    pub branch_name: String,
    pub created_at: DateTime<Utc>,
    pub base_commit_hash: String,
    pub head_commit_hash: String,
    pub is_checked_out: bool,
    pub is_merged: bool,
    #[serde(default)]
    pub merge_commit_hash: Option<String>,
    #[serde(default)]
    pub merged_to: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchTable {
    pub next_id: u64,
    pub mappings: Vec<TaskBranchMapping>,
}

impl BranchTable {
    /// The unmerged mapping for `task_id`, if any.
    pub fn active_for(&self, task_id: &str) -> Option<&TaskBranchMapping> {
        self.mappings
            .iter()
            .find(|m| m.task_id == task_id && !m.is_merged)
    }

    /// The newest mapping for `task_id`, merged or not.
    pub fn latest_for(&self, task_id: &str) -> Option<&TaskBranchMapping> {
        self.mappings
            .iter()
            .filter(|m| m.task_id == task_id)
            .max_by_key(|m| m.id)
    }

    pub fn get(&self, id: u64) -> Option<&TaskBranchMapping> {
        self.mappings.iter().find(|m| m.id == id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut TaskBranchMapping> {
        self.mappings.iter_mut().find(|m| m.id == id)
    }

    pub fn checked_out(&self) -> Option<&TaskBranchMapping> {
        self.mappings.iter().find(|m| m.is_checked_out)
    }

    /// Insert a mapping, assigning the next arena id.
    pub fn insert(&mut self, mut mapping: TaskBranchMapping) -> u64 {
        self.next_id += 1;
        mapping.id = self.next_id;
        self.mappings.push(mapping);
        self.next_id
    }

    /// Mark exactly `id` (or nothing) as checked out.
    pub fn set_checked_out(&mut self, id: Option<u64>) {
        for mapping in &mut self.mappings {
            mapping.is_checked_out = Some(mapping.id) == id;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewBranchSummary {
    pub branch: String,
    pub created_at: DateTime<Utc>,
    pub base_commit_hash: String,
    pub head_commit_hash: String,
    /// Tasks merged into review since its last merge to main.
    #[serde(default)]
    pub merged_tasks: Vec<String>,
    #[serde(default)]
    pub last_merged_to_main_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_main_merge_commit: Option<String>,
}

/// Which merge verb started the unresolved merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeKind {
    TaskToReview,
    TaskToMain,
    ReviewToMain,
}

/// Everything needed to finish or abort an unresolved merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeState {
    pub kind: MergeKind,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub mapping_id: Option<u64>,
    pub source_branch: String,
    pub target_branch: String,
    pub initiator: Initiator,
    pub started_at: DateTime<Utc>,
    pub conflicts: Vec<ConflictInfo>,
}

impl MergeState {
    pub fn unresolved_count(&self) -> usize {
        self.conflicts
            .iter()
            .filter(|c| c.status == ConflictStatus::Unresolved)
            .count()
    }
}

pub fn load_branch_table(path: &Path) -> Result<BranchTable> {
    Ok(read_json_opt(path)?.unwrap_or_default())
}

pub fn save_branch_table(path: &Path, table: &BranchTable) -> Result<()> {
    write_json_atomic(path, table)
}

pub fn load_review_summary(path: &Path) -> Result<Option<ReviewBranchSummary>> {
    read_json_opt(path)
}

pub fn save_review_summary(path: &Path, summary: &ReviewBranchSummary) -> Result<()> {
    write_json_atomic(path, summary)
}

pub fn load_merge_state(path: &Path) -> Result<Option<MergeState>> {
    read_json_opt(path)
}

pub fn save_merge_state(path: &Path, state: &MergeState) -> Result<()> {
    write_json_atomic(path, state)
}

pub fn clear_merge_state(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_file(path).with_context(|| format!("remove {}", path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(task: &str) -> TaskBranchMapping {
        TaskBranchMapping {
            id: 0,
            task_id: task.to_string(),
            branch_name: format!("task/{task}"),
            created_at: Utc::now(),
            base_commit_hash: "abc".to_string(),
            head_commit_hash: "abc".to_string(),
            is_checked_out: false,
            is_merged: false,
            merge_commit_hash: None,
            merged_to: None,
        }
    }

    #[test]
    fn arena_ids_are_sequential_and_lookup_tracks_merge() {
        let mut table = BranchTable::default();
        let first = table.insert(mapping("1"));
        let second = table.insert(mapping("2"));
        assert_eq!((first, second), (1, 2));

        assert_eq!(table.active_for("1").map(|m| m.id), Some(1));
        if let Some(m) = table.get_mut(first) {
            m.is_merged = true;
        }
        assert!(table.active_for("1").is_none());
        assert_eq!(table.latest_for("1").map(|m| m.id), Some(1));

        let third = table.insert(mapping("1"));
        assert_eq!(table.latest_for("1").map(|m| m.id), Some(third));
    }

    #[test]
    fn only_one_mapping_is_checked_out() {
        let mut table = BranchTable::default();
        let a = table.insert(mapping("a"));
        let b = table.insert(mapping("b"));
        table.set_checked_out(Some(a));
        table.set_checked_out(Some(b));
        assert_eq!(table.checked_out().map(|m| m.id), Some(b));
        assert_eq!(table.mappings.iter().filter(|m| m.is_checked_out).count(), 1);
        table.set_checked_out(None);
        assert!(table.checked_out().is_none());
    }

    #[test]
    fn table_persists_and_merge_state_clears() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("branches.json");
        assert_eq!(load_branch_table(&path).expect("load"), BranchTable::default());
        let mut table = BranchTable::default();
        table.insert(mapping("1"));
        save_branch_table(&path, &table).expect("save");
        assert_eq!(load_branch_table(&path).expect("load"), table);

        let merge_path = temp.path().join("merge_state.json");
        let state = MergeState {
            kind: MergeKind::TaskToMain,
            task_id: Some("1".to_string()),
            mapping_id: Some(1),
            source_branch: "task/1".to_string(),
            target_branch: "main".to_string(),
            initiator: Initiator::Operator,
            started_at: Utc::now(),
            conflicts: vec![ConflictInfo::new("a.txt", None, Some("x".into()), Some("y".into()))],
        };
        save_merge_state(&merge_path, &state).expect("save");
        let loaded = load_merge_state(&merge_path).expect("load").expect("present");
        assert_eq!(loaded.unresolved_count(), 1);
        clear_merge_state(&merge_path).expect("clear");
        assert!(load_merge_state(&merge_path).expect("load").is_none());
    }
}
