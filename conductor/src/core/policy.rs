//! Policy gate: a pure decision function over proposed agent operations.
//!
//! Every file read, file write and shell command the agent proposes is passed
//! through [`Policy::evaluate`] before anything touches the working tree. The
//! gate holds no state and performs no I/O, so it is safe to share across
//! threads and to call concurrently.

use std::fmt;

use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};

use super::limits::Limits;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Declarative rule set gating all agent actions (one per project).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    pub allowed_paths: Vec<String>,
    pub blocked_paths: Vec<String>,
    pub allowed_commands: Vec<String>,
    pub blocked_commands: Vec<String>,
    pub confirm_commands: Vec<String>,
    pub limits: Limits,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    FileRead,
    FileWrite,
    ShellCommand,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::FileRead => "file_read",
            OperationKind::FileWrite => "file_write",
            OperationKind::ShellCommand => "shell_command",
        }
    }
}

/// An operation proposed by the agent: a kind plus a path or command string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub kind: OperationKind,
    pub target: String,
}

impl Operation {
    pub fn read(path: impl Into<String>) -> Self {
        Self {
            kind: OperationKind::FileRead,
            target: path.into(),
        }
    }

    pub fn write(path: impl Into<String>) -> Self {
        Self {
            kind: OperationKind::FileWrite,
            target: path.into(),
        }
    }

    pub fn command(command: impl Into<String>) -> Self {
        Self {
            kind: OperationKind::ShellCommand,
            target: command.into(),
        }
    }
}

/// The rule that caused a denial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum DenyReason {
    PathEscapesRoot { path: String },
    BlockedPath { pattern: String },
    NotInAllowedPaths { path: String },
    InvalidPattern { pattern: String },
    EmptyCommand,
    /// Backticks or `$(..)` hide a command from segment matching.
    CommandSubstitution,
    BlockedCommand { entry: String },
    CommandNotAllowed { segment: String },
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::PathEscapesRoot { path } => {
                write!(f, "path '{path}' escapes the project root")
            }
            DenyReason::BlockedPath { pattern } => {
                write!(f, "path matches blocked pattern '{pattern}'")
            }
            DenyReason::NotInAllowedPaths { path } => {
                write!(f, "path '{path}' matches no allowed pattern")
            }
            DenyReason::InvalidPattern { pattern } => {
                write!(f, "policy contains invalid glob '{pattern}'")
            }
            DenyReason::EmptyCommand => write!(f, "empty command"),
            DenyReason::CommandSubstitution => {
                write!(f, "command substitution is not allowed under a command policy")
            }
            DenyReason::BlockedCommand { entry } => {
                write!(f, "command matches blocked entry '{entry}'")
            }
            DenyReason::CommandNotAllowed { segment } => {
                write!(f, "command '{segment}' is not in the allowed list")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny(DenyReason),
    /// Execution pauses until a human approves the operation.
    RequireConfirmation { rule: String },
}

impl Decision {
    pub fn is_allow(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

impl Policy {
    /// Decide whether `operation` may proceed.
    pub fn evaluate(&self, operation: &Operation) -> Decision {
        match operation.kind {
            OperationKind::FileRead | OperationKind::FileWrite => {
                self.evaluate_path(&operation.target)
            }
            OperationKind::ShellCommand => self.evaluate_command(&operation.target),
        }
    }

    fn evaluate_path(&self, raw: &str) -> Decision {
        let Some(path) = normalize_path(raw) else {
            return Decision::Deny(DenyReason::PathEscapesRoot {
                path: raw.to_string(),
            });
        };

        for pattern in &self.blocked_paths {
            match glob_matches(pattern, &path) {
                Ok(true) => {
                    return Decision::Deny(DenyReason::BlockedPath {
                        pattern: pattern.clone(),
                    });
                }
                Ok(false) => {}
                // A blocked rule we cannot interpret must not silently open the path.
                Err(()) => {
                    return Decision::Deny(DenyReason::InvalidPattern {
                        pattern: pattern.clone(),
                    });
                }
            }
        }

        if self.allowed_paths.is_empty() {
            return Decision::Allow;
        }
        let allowed = self
            .allowed_paths
            .iter()
            .any(|pattern| glob_matches(pattern, &path) == Ok(true));
        if allowed {
            Decision::Allow
        } else {
            Decision::Deny(DenyReason::NotInAllowedPaths { path })
        }
    }

    fn evaluate_command(&self, command: &str) -> Decision {
        let segments = split_command_segments(command);
        if segments.is_empty() {
            return Decision::Deny(DenyReason::EmptyCommand);
        }
        let restricted = !self.blocked_commands.is_empty() || !self.allowed_commands.is_empty();
        if restricted && has_command_substitution(command) {
            return Decision::Deny(DenyReason::CommandSubstitution);
        }

        for segment in &segments {
            if let Some(entry) = first_prefix_match(&self.blocked_commands, segment) {
                return Decision::Deny(DenyReason::BlockedCommand {
                    entry: entry.to_string(),
                });
            }
        }

        if !self.allowed_commands.is_empty()
            && segments
                .iter()
                .all(|s| first_prefix_match(&self.allowed_commands, s).is_some())
        {
            return Decision::Allow;
        }

        for segment in &segments {
            if let Some(entry) = first_prefix_match(&self.confirm_commands, segment) {
                return Decision::RequireConfirmation {
                    rule: entry.to_string(),
                };
            }
        }

        if self.allowed_commands.is_empty() {
            return Decision::Allow;
        }
        let segment = segments
            .iter()
            .find(|s| first_prefix_match(&self.allowed_commands, s).is_none())
            .cloned()
            .unwrap_or_default();
        Decision::Deny(DenyReason::CommandNotAllowed { segment })
    }

    /// Glob patterns that fail to parse, for validation at load time.
    pub fn invalid_patterns(&self) -> Vec<String> {
        self.allowed_paths
            .iter()
            .chain(self.blocked_paths.iter())
            .filter(|p| Pattern::new(p).is_err())
            .cloned()
            .collect()
    }
}

/// Normalize an agent-supplied path to a root-relative, `/`-separated form.
///
/// Returns `None` for absolute paths and for paths that climb above the root.
pub fn normalize_path(raw: &str) -> Option<String> {
    let unified = raw.trim().replace('\\', "/");
    if unified.is_empty() || unified.starts_with('/') || has_drive_prefix(&unified) {
        return None;
    }
    let mut parts: Vec<&str> = Vec::new();
    for part in unified.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

fn glob_matches(pattern: &str, path: &str) -> Result<bool, ()> {
    let compiled = Pattern::new(pattern).map_err(|_| ())?;
    Ok(compiled.matches_with(path, MATCH_OPTIONS))
}

/// Split a shell command on `&&`, `||`, `&`, `;`, `|`, newlines and
/// subshell parentheses. `&` inside a redirection (`2>&1`, `&>`) is kept.
fn split_command_segments(command: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut prev: Option<char> = None;
    let mut chars = command.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            ';' | '\n' | '(' | ')' => push_segment(&mut segments, &mut current),
            '&' if chars.peek() == Some(&'&') => {
                chars.next();
                push_segment(&mut segments, &mut current);
            }
            '&' if chars.peek() == Some(&'>') || matches!(prev, Some('>' | '<')) => {
                current.push(c);
            }
            '&' => push_segment(&mut segments, &mut current),
            '|' => {
                if chars.peek() == Some(&'|') {
                    chars.next();
                }
                push_segment(&mut segments, &mut current);
            }
            other => current.push(other),
        }
        prev = Some(c);
    }
    push_segment(&mut segments, &mut current);
    segments
}

fn has_command_substitution(command: &str) -> bool {
    command.contains('`') || ["$(", "<(", ">("].iter().any(|m| command.contains(m))
}

fn push_segment(segments: &mut Vec<String>, current: &mut String) {
    let normalized = current.split_whitespace().collect::<Vec<_>>().join(" ");
    if !normalized.is_empty() {
        segments.push(normalized);
    }
    current.clear();
}

/// Return the first entry matching `segment` exactly or as a word prefix.
fn first_prefix_match<'a>(entries: &'a [String], segment: &str) -> Option<&'a str> {
    entries.iter().map(String::as_str).find(|entry| {
        let entry = entry.trim();
        if entry.is_empty() {
            return false;
        }
        segment == entry
            || segment
                .strip_prefix(entry)
                .is_some_and(|rest| rest.starts_with(' '))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn blocked_glob_wins_over_allowed_glob() {
        let policy = Policy {
            allowed_paths: strings(&["src/**"]),
            blocked_paths: strings(&["src/secrets/**"]),
            ..Policy::default()
        };
        let decision = policy.evaluate(&Operation::write("src/secrets/key.pem"));
        assert_eq!(
            decision,
            Decision::Deny(DenyReason::BlockedPath {
                pattern: "src/secrets/**".to_string()
            })
        );
        assert!(policy.evaluate(&Operation::write("src/main.rs")).is_allow());
    }

    #[test]
    fn path_outside_non_empty_allow_list_is_denied() {
        let policy = Policy {
            allowed_paths: strings(&["src/**"]),
            ..Policy::default()
        };
        let decision = policy.evaluate(&Operation::read("docs/README.md"));
        assert!(matches!(
            decision,
            Decision::Deny(DenyReason::NotInAllowedPaths { .. })
        ));
    }

    #[test]
    fn empty_allow_list_allows_unblocked_paths() {
        let policy = Policy::default();
        assert!(policy.evaluate(&Operation::read("anything/at/all.txt")).is_allow());
    }

    #[test]
    fn escaping_paths_are_denied() {
        let policy = Policy::default();
        for raw in ["/etc/passwd", "../outside.txt", "src/../../x", "C:/windows"] {
            assert!(
                matches!(
                    policy.evaluate(&Operation::read(raw)),
                    Decision::Deny(DenyReason::PathEscapesRoot { .. })
                ),
                "expected {raw} to escape"
            );
        }
    }

    #[test]
    fn dot_segments_are_normalized_before_matching() {
        let policy = Policy {
            blocked_paths: strings(&["src/secrets/**"]),
            ..Policy::default()
        };
        let decision = policy.evaluate(&Operation::write("./src/app/../secrets/key.pem"));
        assert!(matches!(decision, Decision::Deny(DenyReason::BlockedPath { .. })));
    }

    #[test]
    fn blocked_command_prefix_denies_with_entry() {
        let policy = Policy {
            allowed_commands: strings(&["npm"]),
            blocked_commands: strings(&["rm -rf"]),
            ..Policy::default()
        };
        let decision = policy.evaluate(&Operation::command("rm -rf /"));
        assert_eq!(
            decision,
            Decision::Deny(DenyReason::BlockedCommand {
                entry: "rm -rf".to_string()
            })
        );
        assert!(policy.evaluate(&Operation::command("npm test")).is_allow());
    }

    #[test]
    fn blocked_segment_inside_chain_denies_whole_command() {
        let policy = Policy {
            allowed_commands: strings(&["npm"]),
            blocked_commands: strings(&["rm -rf"]),
            ..Policy::default()
        };
        let decision = policy.evaluate(&Operation::command("npm test && rm  -rf build"));
        assert!(matches!(decision, Decision::Deny(DenyReason::BlockedCommand { .. })));
    }

    #[test]
    fn background_operator_separates_segments() {
        let policy = Policy {
            allowed_commands: strings(&["echo"]),
            blocked_commands: strings(&["touch"]),
            ..Policy::default()
        };
        assert_eq!(
            policy.evaluate(&Operation::command("echo hi & touch marker")),
            Decision::Deny(DenyReason::BlockedCommand {
                entry: "touch".to_string()
            })
        );
        assert!(matches!(
            policy.evaluate(&Operation::command("echo hi; (touch marker)")),
            Decision::Deny(DenyReason::BlockedCommand { .. })
        ));
        assert!(policy.evaluate(&Operation::command("echo hi 2>&1")).is_allow());
    }

    #[test]
    fn command_substitution_is_denied_under_restrictions() {
        let policy = Policy {
            allowed_commands: strings(&["echo"]),
            blocked_commands: strings(&["touch"]),
            ..Policy::default()
        };
        for command in ["echo $(touch marker)", "echo `touch marker`"] {
            assert_eq!(
                policy.evaluate(&Operation::command(command)),
                Decision::Deny(DenyReason::CommandSubstitution),
                "{command}"
            );
        }
        assert!(Policy::default()
            .evaluate(&Operation::command("echo $(date)"))
            .is_allow());
    }

    #[test]
    fn prefix_match_respects_word_boundary() {
        let policy = Policy {
            allowed_commands: strings(&["npm"]),
            ..Policy::default()
        };
        assert!(matches!(
            policy.evaluate(&Operation::command("npmx install")),
            Decision::Deny(DenyReason::CommandNotAllowed { .. })
        ));
    }

    #[test]
    fn confirm_list_requires_confirmation() {
        let policy = Policy {
            allowed_commands: strings(&["cargo test"]),
            confirm_commands: strings(&["git push"]),
            ..Policy::default()
        };
        assert_eq!(
            policy.evaluate(&Operation::command("git push origin main")),
            Decision::RequireConfirmation {
                rule: "git push".to_string()
            }
        );
    }

    #[test]
    fn allowed_match_takes_precedence_over_confirm() {
        let policy = Policy {
            allowed_commands: strings(&["git"]),
            confirm_commands: strings(&["git push"]),
            ..Policy::default()
        };
        assert!(policy.evaluate(&Operation::command("git push")).is_allow());
    }

    #[test]
    fn evaluate_is_deterministic() {
        let policy = Policy {
            allowed_paths: strings(&["src/**", "tests/*.rs"]),
            blocked_paths: strings(&["**/*.pem"]),
            allowed_commands: strings(&["cargo"]),
            blocked_commands: strings(&["cargo publish"]),
            confirm_commands: strings(&["git"]),
            ..Policy::default()
        };
        let ops = [
            Operation::read("src/lib.rs"),
            Operation::write("keys/a.pem"),
            Operation::command("cargo publish"),
            Operation::command("git status"),
            Operation::command("cargo build | tee log"),
        ];
        for op in &ops {
            let first = policy.evaluate(op);
            for _ in 0..10 {
                assert_eq!(policy.evaluate(op), first);
            }
        }
    }

    #[test]
    fn invalid_blocked_pattern_fails_closed() {
        let policy = Policy {
            blocked_paths: strings(&["src/[unterminated"]),
            ..Policy::default()
        };
        assert!(matches!(
            policy.evaluate(&Operation::read("src/a.rs")),
            Decision::Deny(DenyReason::InvalidPattern { .. })
        ));
        assert_eq!(policy.invalid_patterns(), strings(&["src/[unterminated"]));
    }
}
