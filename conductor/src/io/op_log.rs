//! Append-only operation log (`.conductor/state/operations.jsonl`).
//!
//! One JSON object per line. Entries are never rewritten; ids are assigned
//! sequentially from the number of existing lines.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::types::Initiator;

/// Maximum bytes of stdout/stderr kept per entry.
const OUTPUT_CAP: usize = 4_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationLogEntry {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub operation: String,
    #[serde(default)]
    pub task_id: Option<String>,
    pub command: String,
    pub success: bool,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    pub initiator: Initiator,
    pub duration_ms: u64,
}

/// Fields supplied by the caller; id and timestamp are assigned on append.
#[derive(Debug, Clone)]
pub struct NewOperation<'a> {
    pub operation: &'a str,
    pub task_id: Option<&'a str>,
    pub command: &'a str,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: &'a str,
    pub stderr: &'a str,
    pub initiator: Initiator,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub struct OperationLog {
    path: PathBuf,
}

impl OperationLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, op: &NewOperation<'_>) -> Result<OperationLogEntry> {
        let entry = OperationLogEntry {
            id: self.next_id()?,
            timestamp: Utc::now(),
            operation: op.operation.to_string(),
            task_id: op.task_id.map(str::to_string),
            command: op.command.to_string(),
            success: op.success,
            exit_code: op.exit_code,
            stdout: cap(op.stdout),
            stderr: cap(op.stderr),
            initiator: op.initiator,
            duration_ms: op.duration_ms,
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let mut line = serde_json::to_string(&entry).context("serialize operation log entry")?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append {}", self.path.display()))?;
        Ok(entry)
    }

    pub fn entries(&self) -> Result<Vec<OperationLogEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read {}", self.path.display()))?;
        contents
            .lines()
            .filter(|l| !l.trim().is_empty())
            .enumerate()
            .map(|(i, line)| {
                serde_json::from_str(line)
                    .with_context(|| format!("parse {} line {}", self.path.display(), i + 1))
            })
            .collect()
    }

    pub fn entries_for_task(&self, task_id: &str) -> Result<Vec<OperationLogEntry>> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|e| e.task_id.as_deref() == Some(task_id))
            .collect())
    }

    fn next_id(&self) -> Result<u64> {
        if !self.path.exists() {
            return Ok(1);
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read {}", self.path.display()))?;
        Ok(contents.lines().filter(|l| !l.trim().is_empty()).count() as u64 + 1)
    }
}

fn cap(text: &str) -> String {
    if text.len() <= OUTPUT_CAP {
        return text.to_string();
    }
    let mut end = OUTPUT_CAP;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…[{} bytes truncated]", &text[..end], text.len() - end)
}
