//! Numeric run limits and the counters that enforce them.
//!
//! The policy gate itself is stateless; callers own a [`LimitTracker`] for the
//! duration of one task run and consult it before issuing each operation. A
//! breach is fatal to the task run and is never retried.

use std::collections::BTreeSet;
use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Per-run maximums. `0` disables a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_steps_per_run: u64,
    pub max_files_per_run: u64,
    pub max_diff_lines_per_run: u64,
    pub max_runtime_minutes: u64,
    pub max_file_size_bytes: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_steps_per_run: 50,
            max_files_per_run: 25,
            max_diff_lines_per_run: 2_000,
            max_runtime_minutes: 30,
            max_file_size_bytes: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    MaxStepsPerRun,
    MaxFilesPerRun,
    MaxDiffLinesPerRun,
    MaxRuntimeMinutes,
    MaxFileSizeBytes,
}

impl LimitKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LimitKind::MaxStepsPerRun => "maxStepsPerRun",
            LimitKind::MaxFilesPerRun => "maxFilesPerRun",
            LimitKind::MaxDiffLinesPerRun => "maxDiffLinesPerRun",
            LimitKind::MaxRuntimeMinutes => "maxRuntimeMinutes",
            LimitKind::MaxFileSizeBytes => "maxFileSizeBytes",
        }
    }
}

/// A limit that would be exceeded by the next operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitBreach {
    pub limit: LimitKind,
    /// Counter value before the rejected operation.
    pub current: u64,
    /// Counter value the operation would have produced.
    pub attempted: u64,
    pub max: u64,
}

impl fmt::Display for LimitBreach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} exceeded: current={} attempted={} max={}",
            self.limit.as_str(),
            self.current,
            self.attempted,
            self.max
        )
    }
}

/// Snapshot of the running counters, for failure comments and transcripts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitCounters {
    pub steps: u64,
    pub files: u64,
    pub diff_lines: u64,
    pub elapsed_secs: u64,
}

/// Running counters for one task run.
#[derive(Debug, Clone)]
pub struct LimitTracker {
    limits: Limits,
    started: Instant,
    steps: u64,
    files: BTreeSet<String>,
    diff_lines: u64,
}

impl LimitTracker {
    pub fn new(limits: Limits) -> Self {
        Self::started_at(limits, Instant::now())
    }

    pub fn started_at(limits: Limits, started: Instant) -> Self {
        Self {
            limits,
            started,
            steps: 0,
            files: BTreeSet::new(),
            diff_lines: 0,
        }
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Check that one more step fits, including the runtime budget.
    pub fn check_step(&self) -> Result<(), LimitBreach> {
        self.check_runtime()?;
        exceeds(LimitKind::MaxStepsPerRun, self.steps, 1, self.limits.max_steps_per_run)
    }

    pub fn check_runtime(&self) -> Result<(), LimitBreach> {
        let max = self.limits.max_runtime_minutes;
        if max == 0 {
            return Ok(());
        }
        let elapsed = self.started.elapsed();
        if elapsed >= Duration::from_secs(max * 60) {
            let minutes = elapsed.as_secs() / 60;
            return Err(LimitBreach {
                limit: LimitKind::MaxRuntimeMinutes,
                current: minutes,
                attempted: minutes,
                max,
            });
        }
        Ok(())
    }

    /// Check that writing `size` bytes with `diff_lines` changed lines to `path` fits.
    pub fn check_write(&self, path: &str, size: u64, diff_lines: u64) -> Result<(), LimitBreach> {
        let max_size = self.limits.max_file_size_bytes;
        if max_size > 0 && size > max_size {
            return Err(LimitBreach {
                limit: LimitKind::MaxFileSizeBytes,
                current: 0,
                attempted: size,
                max: max_size,
            });
        }
        let new_file = u64::from(!self.files.contains(path));
        exceeds(
            LimitKind::MaxFilesPerRun,
            self.files.len() as u64,
            new_file,
            self.limits.max_files_per_run,
        )?;
        exceeds(
            LimitKind::MaxDiffLinesPerRun,
            self.diff_lines,
            diff_lines,
            self.limits.max_diff_lines_per_run,
        )
    }

    pub fn record_step(&mut self) {
        self.steps += 1;
    }

    pub fn record_write(&mut self, path: &str, diff_lines: u64) {
        self.files.insert(path.to_string());
        self.diff_lines += diff_lines;
    }

    pub fn counters(&self) -> LimitCounters {
        LimitCounters {
            steps: self.steps,
            files: self.files.len() as u64,
            diff_lines: self.diff_lines,
            elapsed_secs: self.started.elapsed().as_secs(),
        }
    }
}

fn exceeds(limit: LimitKind, current: u64, add: u64, max: u64) -> Result<(), LimitBreach> {
    if max == 0 || add == 0 {
        return Ok(());
    }
    let attempted = current.saturating_add(add);
    if attempted > max {
        return Err(LimitBreach {
            limit,
            current,
            attempted,
            max,
        });
    }
    Ok(())
}

/// Count changed lines between two texts (lines only in `old` plus lines only in `new`).
pub fn diff_line_count(old: &str, new: &str) -> u64 {
    use std::collections::HashMap;

    let mut counts: HashMap<&str, i64> = HashMap::new();
    for line in old.lines() {
        *counts.entry(line).or_default() += 1;
    }
    for line in new.lines() {
        *counts.entry(line).or_default() -= 1;
    }
    counts.values().map(|v| v.unsigned_abs()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> Limits {
        Limits {
            max_steps_per_run: 2,
            max_files_per_run: 1,
            max_diff_lines_per_run: 10,
            max_runtime_minutes: 0,
            max_file_size_bytes: 100,
        }
    }

    #[test]
    fn step_limit_trips_before_exceeding() {
        let mut tracker = LimitTracker::new(limits());
        tracker.check_step().expect("first");
        tracker.record_step();
        tracker.check_step().expect("second");
        tracker.record_step();
        let breach = tracker.check_step().expect_err("third");
        assert_eq!(breach.limit, LimitKind::MaxStepsPerRun);
        assert_eq!(breach.current, 2);
        assert_eq!(breach.attempted, 3);
        assert_eq!(breach.max, 2);
    }

    #[test]
    fn rewriting_same_file_does_not_count_as_new_file() {
        let mut tracker = LimitTracker::new(limits());
        tracker.check_write("a.txt", 10, 2).expect("first write");
        tracker.record_write("a.txt", 2);
        tracker.check_write("a.txt", 10, 2).expect("same file");
        let breach = tracker.check_write("b.txt", 10, 1).expect_err("second file");
        assert_eq!(breach.limit, LimitKind::MaxFilesPerRun);
    }

    #[test]
    fn file_size_and_diff_limits_report_values() {
        let tracker = LimitTracker::new(limits());
        let size = tracker.check_write("a.txt", 101, 1).expect_err("size");
        assert_eq!(size.limit, LimitKind::MaxFileSizeBytes);
        assert_eq!(size.attempted, 101);

        let diff = tracker.check_write("a.txt", 10, 11).expect_err("diff");
        assert_eq!(diff.limit, LimitKind::MaxDiffLinesPerRun);
        assert!(diff.to_string().contains("maxDiffLinesPerRun"));
    }

    #[test]
    fn runtime_limit_uses_start_instant() {
        let started = Instant::now() - Duration::from_secs(120);
        let tracker = LimitTracker::started_at(
            Limits {
                max_runtime_minutes: 1,
                ..limits()
            },
            started,
        );
        let breach = tracker.check_step().expect_err("runtime");
        assert_eq!(breach.limit, LimitKind::MaxRuntimeMinutes);
    }

    #[test]
    fn zero_disables_limit() {
        let tracker = LimitTracker::new(Limits {
            max_steps_per_run: 0,
            max_files_per_run: 0,
            max_diff_lines_per_run: 0,
            max_runtime_minutes: 0,
            max_file_size_bytes: 0,
        });
        tracker.check_step().expect("unlimited");
        tracker.check_write("x", u64::MAX, u64::MAX).expect("unlimited");
    }

    #[test]
    fn diff_line_count_counts_both_sides() {
        assert_eq!(diff_line_count("a\nb\nc\n", "a\nb\nc\n"), 0);
        assert_eq!(diff_line_count("a\nb\n", "a\nc\n"), 2);
        assert_eq!(diff_line_count("", "x\ny\n"), 2);
    }
}
