//! Git adapter for the branch orchestrator.
//!
//! A small, explicit wrapper around `git` subprocess calls. Every failing
//! command surfaces as a [`GitFailure`] carrying the command line, exit code
//! and stderr. Lock contention is retried once.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::thread;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::error::GitFailure;

const RETRY_DELAY: Duration = Duration::from_millis(250);

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    pub path: String,
}

/// Result of `git merge` that did not fail outright.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeRun {
    Merged,
    Conflicted(Vec<String>),
}

/// Index stage of a conflicted path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Base = 1,
    Ours = 2,
    Theirs = 3,
}

/// Captured output of a git command, success or not.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub command: String,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    fn into_failure(self) -> GitFailure {
        GitFailure {
            command: self.command,
            exit_code: self.exit_code,
            stderr: self.stderr.trim().to_string(),
        }
    }
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Current branch name, or `None` on a detached HEAD.
    pub fn current_branch(&self) -> Result<Option<String>, GitFailure> {
        let name = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = name.trim();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Ok(None);
        }
        Ok(Some(name.to_string()))
    }

    /// Full SHA of `rev`.
    pub fn rev_parse(&self, rev: &str) -> Result<String, GitFailure> {
        Ok(self.run_capture(&["rev-parse", "--verify", rev])?.trim().to_string())
    }

    pub fn head_commit(&self) -> Result<String, GitFailure> {
        self.rev_parse("HEAD")
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool, GitFailure> {
        let out = self.run(&[
            "show-ref",
            "--verify",
            "--quiet",
            &format!("refs/heads/{branch}"),
        ])?;
        Ok(out.success())
    }

    /// Validate a branch name with `git check-ref-format --branch`.
    pub fn check_branch_name(&self, branch: &str) -> Result<(), GitFailure> {
        self.run_checked(&["check-ref-format", "--branch", branch])?;
        Ok(())
    }

    /// Create `branch` at HEAD without checking it out. `force` resets an existing branch.
    #[instrument(skip_all, fields(branch, force))]
    pub fn create_branch(&self, branch: &str, force: bool) -> Result<GitOutput, GitFailure> {
        debug!(branch, force, "creating branch");
        if force {
            self.run_checked(&["branch", "--force", branch, "HEAD"])
        } else {
            self.run_checked(&["branch", branch, "HEAD"])
        }
    }

    /// Create `branch` from `start_point` without checking it out.
    pub fn create_branch_from(&self, branch: &str, start_point: &str) -> Result<GitOutput, GitFailure> {
        self.run_checked(&["branch", branch, start_point])
    }

    #[instrument(skip_all, fields(branch))]
    pub fn checkout(&self, branch: &str) -> Result<GitOutput, GitFailure> {
        debug!(branch, "checking out branch");
        self.run_checked(&["checkout", branch])
    }

    /// Status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>, GitFailure> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        Ok(out
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(parse_status_line)
            .collect())
    }

    /// Changed paths, ignoring entries under any of `ignored_prefixes`.
    pub fn dirty_paths(&self, ignored_prefixes: &[&str]) -> Result<Vec<String>, GitFailure> {
        Ok(self
            .status_porcelain()?
            .into_iter()
            .filter(|entry| !ignored_prefixes.iter().any(|p| entry.path.starts_with(p)))
            .map(|entry| entry.path)
            .collect())
    }

    /// Stage all changes except paths matching `excluded` pathspecs.
    pub fn add_all_except(&self, excluded: &[&str]) -> Result<(), GitFailure> {
        let excludes: Vec<String> = excluded.iter().map(|p| format!(":(exclude){p}")).collect();
        let mut args = vec!["add", "-A", "--", "."];
        args.extend(excludes.iter().map(String::as_str));
        self.run_checked(&args)?;
        Ok(())
    }

    pub fn add_path(&self, path: &str) -> Result<(), GitFailure> {
        self.run_checked(&["add", "--", path])?;
        Ok(())
    }

    /// Take `path` exactly as it is at `rev`, in both worktree and index.
    pub fn restore_path_from(&self, rev: &str, path: &str) -> Result<(), GitFailure> {
        self.run_checked(&["checkout", rev, "--", path])?;
        Ok(())
    }

    pub fn remove_path(&self, path: &str) -> Result<(), GitFailure> {
        self.run_checked(&["rm", "--quiet", "--", path])?;
        Ok(())
    }

    pub fn has_staged_changes(&self) -> Result<bool, GitFailure> {
        let out = self.run(&["diff", "--cached", "--quiet"])?;
        Ok(!out.success())
    }

    /// Commit staged changes. Returns `None` if nothing was staged.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<Option<GitOutput>, GitFailure> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(None);
        }
        self.run_checked(&["commit", "--no-verify", "-m", message]).map(Some)
    }

    /// Commit the in-progress merge with the prepared message.
    pub fn commit_merge(&self) -> Result<GitOutput, GitFailure> {
        self.run_checked(&["commit", "--no-verify", "--no-edit"])
    }

    /// `git merge --no-ff` of `source` into the current branch.
    ///
    /// Conflicts leave the tree mid-merge and return [`MergeRun::Conflicted`].
    #[instrument(skip_all, fields(source))]
    pub fn merge_no_ff(&self, source: &str, message: &str) -> Result<(GitOutput, MergeRun), GitFailure> {
        let out = self.run_with_retry(&["merge", "--no-ff", "--no-verify", "-m", message, source])?;
        if out.success() {
            return Ok((out, MergeRun::Merged));
        }
        let conflicted = self.conflicted_files()?;
        if conflicted.is_empty() {
            return Err(out.into_failure());
        }
        warn!(files = conflicted.len(), "merge stopped on conflicts");
        Ok((out, MergeRun::Conflicted(conflicted)))
    }

    pub fn merge_abort(&self) -> Result<GitOutput, GitFailure> {
        self.run_checked(&["merge", "--abort"])
    }

    pub fn merge_in_progress(&self) -> Result<bool, GitFailure> {
        Ok(self
            .run(&["rev-parse", "-q", "--verify", "MERGE_HEAD"])?
            .success())
    }

    /// Paths with unmerged index entries.
    pub fn conflicted_files(&self) -> Result<Vec<String>, GitFailure> {
        let out = self.run_capture(&["diff", "--name-only", "--diff-filter=U"])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Content of `path` at an index stage, or `None` if that side lacks the file.
    pub fn show_stage(&self, stage: Stage, path: &str) -> Result<Option<String>, GitFailure> {
        let spec = format!(":{}:{path}", stage as u8);
        let out = self.run(&["show", &spec])?;
        Ok(out.success().then_some(out.stdout))
    }

    /// Number of commits reachable from `source` but not from `target`.
    pub fn commits_between(&self, target: &str, source: &str) -> Result<u64, GitFailure> {
        let range = format!("{target}..{source}");
        let out = self.run_capture(&["rev-list", "--count", &range])?;
        out.trim().parse().map_err(|_| GitFailure {
            command: format!("rev-list --count {range}"),
            exit_code: Some(0),
            stderr: format!("unexpected output '{}'", out.trim()),
        })
    }

    fn run_capture(&self, args: &[&str]) -> Result<String, GitFailure> {
        Ok(self.run_checked(args)?.stdout)
    }

    fn run_checked(&self, args: &[&str]) -> Result<GitOutput, GitFailure> {
        let out = self.run_with_retry(args)?;
        if !out.success() {
            return Err(out.into_failure());
        }
        Ok(out)
    }

    /// Run once, and once more after a short delay if the failure looks transient.
    fn run_with_retry(&self, args: &[&str]) -> Result<GitOutput, GitFailure> {
        let out = self.run(args)?;
        if out.success() || !out.clone().into_failure().is_transient() {
            return Ok(out);
        }
        warn!(command = %out.command, "transient git failure, retrying once");
        thread::sleep(RETRY_DELAY);
        self.run(args)
    }

    fn run(&self, args: &[&str]) -> Result<GitOutput, GitFailure> {
        let command = args.join(" ");
        let output: Output = Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .map_err(|err| GitFailure {
                command: command.clone(),
                exit_code: None,
                stderr: format!("spawn git: {err}"),
            })?;
        Ok(GitOutput {
            command,
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

fn parse_status_line(line: &str) -> Option<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Some(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return None;
    }
    let code = line.get(..2)?.to_string();
    let mut path = line.get(3..)?.trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Some(StatusEntry { code, path })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;

    #[test]
    fn parses_untracked_line() {
        let e = parse_status_line("?? foo.txt").expect("parse");
        assert_eq!(
            e,
            StatusEntry {
                code: "??".to_string(),
                path: "foo.txt".to_string()
            }
        );
    }

    #[test]
    fn parses_modified_and_rename_lines() {
        let e = parse_status_line(" M src/main.rs").expect("parse");
        assert_eq!(e.code, " M");
        assert_eq!(e.path, "src/main.rs");
        let r = parse_status_line("R  old.txt -> new.txt").expect("parse");
        assert_eq!(r.path, "new.txt");
        assert!(parse_status_line("x").is_none());
    }

    #[test]
    fn failure_carries_command_and_stderr() {
        let repo = TestRepo::new().expect("repo");
        let err = repo.git().checkout("does-not-exist").expect_err("checkout");
        assert_eq!(err.command, "checkout does-not-exist");
        assert_ne!(err.exit_code, Some(0));
        assert!(!err.stderr.is_empty());
    }

    #[test]
    fn conflicting_merge_reports_files_and_stages() {
        let repo = TestRepo::new().expect("repo");
        let git = repo.git();
        repo.write("shared.txt", "base\n").expect("write");
        repo.commit_all("base").expect("commit");

        git.create_branch("feature", false).expect("branch");
        git.checkout("feature").expect("checkout");
        repo.write("shared.txt", "feature\n").expect("write");
        repo.commit_all("feature change").expect("commit");

        git.checkout("main").expect("checkout main");
        repo.write("shared.txt", "main\n").expect("write");
        repo.commit_all("main change").expect("commit");

        let (_, run) = git.merge_no_ff("feature", "merge feature").expect("merge");
        assert_eq!(run, MergeRun::Conflicted(vec!["shared.txt".to_string()]));
        assert!(git.merge_in_progress().expect("merge state"));
        assert_eq!(
            git.show_stage(Stage::Ours, "shared.txt").expect("ours").as_deref(),
            Some("main\n")
        );
        assert_eq!(
            git.show_stage(Stage::Theirs, "shared.txt").expect("theirs").as_deref(),
            Some("feature\n")
        );
        git.merge_abort().expect("abort");
        assert!(!git.merge_in_progress().expect("merge state"));
    }

    #[test]
    fn dirty_paths_skips_ignored_prefixes() {
        let repo = TestRepo::new().expect("repo");
        repo.write(".conductor/state/x.json", "{}").expect("write");
        repo.write("src/lib.rs", "fn a() {}").expect("write");
        let dirty = repo.git().dirty_paths(&[".conductor/"]).expect("dirty");
        assert_eq!(dirty, vec!["src/lib.rs".to_string()]);
    }
}
