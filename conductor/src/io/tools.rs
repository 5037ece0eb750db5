//! Tool execution behind the policy gate.
//!
//! [`ToolExecutor::execute`] is the only path by which an agent tool call
//! reaches the filesystem or a shell. Each call goes through the policy gate,
//! then confirmation (if the policy asks for it), then the run limits, and
//! only then performs its side effect.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use super::process::run_command_streaming;
use super::provider::ToolSpec;
use crate::cancel::CancelToken;
use crate::core::limits::{LimitBreach, LimitTracker, diff_line_count};
use crate::core::policy::{Decision, Operation, Policy, normalize_path};
use crate::core::tool_call::{ToolCall, ToolResult};
use crate::error::PolicyViolation;

pub const READ_FILE: &str = "read_file";
pub const WRITE_FILE: &str = "write_file";
pub const RUN_COMMAND: &str = "run_command";
pub const REPORT_BLOCKED: &str = "report_blocked";

/// Which tools the agent is offered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionMode {
    /// Full tool set.
    #[default]
    Agent,
    /// Read-only tools.
    Ask,
}

pub fn tool_specs(mode: CompletionMode) -> Vec<ToolSpec> {
    let mut specs = vec![
        ToolSpec {
            name: READ_FILE.to_string(),
            description: "Read a UTF-8 file relative to the project root.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "required": ["path"]
            }),
        },
        ToolSpec {
            name: REPORT_BLOCKED.to_string(),
            description: "Stop work and ask a human for help.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {"reason": {"type": "string"}},
                "required": ["reason"]
            }),
        },
    ];
    if mode == CompletionMode::Agent {
        specs.push(ToolSpec {
            name: WRITE_FILE.to_string(),
            description: "Create or overwrite a file relative to the project root.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "content": {"type": "string"}
                },
                "required": ["path", "content"]
            }),
        });
        specs.push(ToolSpec {
            name: RUN_COMMAND.to_string(),
            description: "Run a shell command in the project root.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {"command": {"type": "string"}},
                "required": ["command"]
            }),
        });
    }
    specs
}

/// An operation parked until a human decides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: u64,
    #[serde(default)]
    pub task_id: Option<String>,
    pub operation: Operation,
    /// Policy rule that asked for confirmation.
    pub rule: String,
    pub requested_at: DateTime<Utc>,
}

/// Decides operations the policy marks as requiring confirmation.
pub trait Approver: Send + Sync {
    /// Block until the request is decided. `false` denies.
    fn approve(&self, request: &ApprovalRequest, cancel: &CancelToken) -> bool;
}

/// Unattended default: every confirmation is denied.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyApprover;

impl Approver for DenyApprover {
    fn approve(&self, request: &ApprovalRequest, _cancel: &CancelToken) -> bool {
        info!(rule = %request.rule, target = %request.operation.target, "confirmation denied (unattended)");
        false
    }
}

#[derive(Debug, Default)]
struct QueueState {
    next_id: u64,
    pending: Vec<ApprovalRequest>,
    decisions: Vec<(u64, bool)>,
}

/// Parks confirmation requests until an operator decides or the run is cancelled.
#[derive(Debug, Default)]
pub struct ApprovalQueue {
    state: Mutex<QueueState>,
    changed: Condvar,
}

const APPROVAL_POLL: Duration = Duration::from_millis(100);

impl ApprovalQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> Vec<ApprovalRequest> {
        self.state
            .lock()
            .map(|s| s.pending.clone())
            .unwrap_or_default()
    }

    /// Record the operator's decision for a pending request.
    pub fn decide(&self, id: u64, approved: bool) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow!("approval queue lock poisoned"))?;
        if !state.pending.iter().any(|r| r.id == id) {
            return Err(anyhow!("no pending approval with id {id}"));
        }
        state.pending.retain(|r| r.id != id);
        state.decisions.push((id, approved));
        self.changed.notify_all();
        Ok(())
    }
}

impl Approver for ApprovalQueue {
    fn approve(&self, request: &ApprovalRequest, cancel: &CancelToken) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        state.next_id += 1;
        let id = state.next_id;
        state.pending.push(ApprovalRequest {
            id,
            ..request.clone()
        });
        self.changed.notify_all();
        info!(id, rule = %request.rule, "waiting for operator approval");

        loop {
            if let Some(pos) = state.decisions.iter().position(|(d, _)| *d == id) {
                let (_, approved) = state.decisions.remove(pos);
                return approved;
            }
            if cancel.is_cancelled() {
                state.pending.retain(|r| r.id != id);
                return false;
            }
            state = match self.changed.wait_timeout(state, APPROVAL_POLL) {
                Ok((guard, _)) => guard,
                Err(_) => return false,
            };
        }
    }
}

/// What a tool call produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOutcome {
    Result(ToolResult),
    /// The agent asked for human help.
    Blocked { reason: String },
    /// Fatal to the task run.
    LimitExceeded(LimitBreach),
}

pub struct ToolExecutor<'a> {
    root: PathBuf,
    policy: &'a Policy,
    approver: &'a dyn Approver,
    tracker: LimitTracker,
    mode: CompletionMode,
    task_id: Option<String>,
    command_timeout: Duration,
    output_limit_bytes: usize,
}

impl<'a> ToolExecutor<'a> {
    pub fn new(
        root: &Path,
        policy: &'a Policy,
        approver: &'a dyn Approver,
        tracker: LimitTracker,
        mode: CompletionMode,
    ) -> Self {
        Self {
            root: root.to_path_buf(),
            policy,
            approver,
            tracker,
            mode,
            task_id: None,
            command_timeout: Duration::from_secs(300),
            output_limit_bytes: 100_000,
        }
    }

    pub fn with_task(mut self, task_id: &str) -> Self {
        self.task_id = Some(task_id.to_string());
        self
    }

    pub fn with_command_limits(mut self, timeout: Duration, output_limit_bytes: usize) -> Self {
        self.command_timeout = timeout;
        self.output_limit_bytes = output_limit_bytes;
        self
    }

    pub fn mode(&self) -> CompletionMode {
        self.mode
    }

    pub fn tracker(&self) -> &LimitTracker {
        &self.tracker
    }

    #[instrument(skip_all, fields(tool = %call.name, call_id = %call.id))]
    pub fn execute(&mut self, call: &ToolCall, cancel: &CancelToken) -> ToolOutcome {
        match call.name.as_str() {
            REPORT_BLOCKED => {
                let reason = string_arg(&call.arguments, "reason")
                    .unwrap_or_else(|| "no reason given".to_string());
                ToolOutcome::Blocked { reason }
            }
            READ_FILE => self.read_file(call, cancel),
            WRITE_FILE | RUN_COMMAND if self.mode == CompletionMode::Ask => {
                failed(call, format!("tool '{}' is not available in ask mode", call.name))
            }
            WRITE_FILE => self.write_file(call, cancel),
            RUN_COMMAND => self.run_command(call, cancel),
            other => failed(call, format!("unknown tool '{other}'")),
        }
    }

    /// Policy gate plus confirmation. `Err` carries the result to report back.
    fn authorize(&self, call: &ToolCall, operation: Operation, cancel: &CancelToken) -> Result<(), ToolOutcome> {
        match self.policy.evaluate(&operation) {
            Decision::Allow => Ok(()),
            Decision::Deny(reason) => {
                let violation = PolicyViolation { operation, reason };
                warn!(err = %violation, "policy denied tool call");
                Err(failed(call, violation.to_string()))
            }
            Decision::RequireConfirmation { rule } => {
                let request = ApprovalRequest {
                    id: 0,
                    task_id: self.task_id.clone(),
                    operation,
                    rule,
                    requested_at: Utc::now(),
                };
                if self.approver.approve(&request, cancel) {
                    debug!(rule = %request.rule, "confirmation granted");
                    Ok(())
                } else {
                    Err(failed(
                        call,
                        format!(
                            "operation '{}' requires confirmation (rule '{}') and was not approved",
                            request.operation.target, request.rule
                        ),
                    ))
                }
            }
        }
    }

    fn read_file(&mut self, call: &ToolCall, cancel: &CancelToken) -> ToolOutcome {
        let Some(path) = string_arg(&call.arguments, "path") else {
            return failed(call, "missing 'path' argument");
        };
        if let Err(outcome) = self.authorize(call, Operation::read(&path), cancel) {
            return outcome;
        }
        if let Err(breach) = self.tracker.check_step() {
            return ToolOutcome::LimitExceeded(breach);
        }
        self.tracker.record_step();
        let Some(rel) = normalize_path(&path) else {
            return failed(call, format!("invalid path '{path}'"));
        };
        match fs::read_to_string(self.root.join(&rel)) {
            Ok(contents) => succeeded(call, truncate(contents, self.output_limit_bytes)),
            Err(err) => failed(call, format!("read {rel}: {err}")),
        }
    }

    fn write_file(&mut self, call: &ToolCall, cancel: &CancelToken) -> ToolOutcome {
        let (Some(path), Some(content)) = (
            string_arg(&call.arguments, "path"),
            string_arg(&call.arguments, "content"),
        ) else {
            return failed(call, "write_file needs 'path' and 'content' arguments");
        };
        if let Err(outcome) = self.authorize(call, Operation::write(&path), cancel) {
            return outcome;
        }
        let Some(rel) = normalize_path(&path) else {
            return failed(call, format!("invalid path '{path}'"));
        };
        let full = self.root.join(&rel);
        let previous = fs::read_to_string(&full).unwrap_or_default();
        let diff_lines = diff_line_count(&previous, &content);
        let limits = self
            .tracker
            .check_step()
            .and_then(|()| self.tracker.check_write(&rel, content.len() as u64, diff_lines));
        if let Err(breach) = limits {
            return ToolOutcome::LimitExceeded(breach);
        }
        self.tracker.record_step();

        if let Some(parent) = full.parent()
            && let Err(err) = fs::create_dir_all(parent)
        {
            return failed(call, format!("create directory for {rel}: {err}"));
        }
        match fs::write(&full, &content) {
            Ok(()) => {
                self.tracker.record_write(&rel, diff_lines);
                debug!(path = %rel, bytes = content.len(), diff_lines, "wrote file");
                succeeded(call, format!("wrote {} bytes to {rel}", content.len()))
            }
            Err(err) => failed(call, format!("write {rel}: {err}")),
        }
    }

    fn run_command(&mut self, call: &ToolCall, cancel: &CancelToken) -> ToolOutcome {
        let Some(command) = string_arg(&call.arguments, "command") else {
            return failed(call, "missing 'command' argument");
        };
        if let Err(outcome) = self.authorize(call, Operation::command(&command), cancel) {
            return outcome;
        }
        if let Err(breach) = self.tracker.check_step() {
            return ToolOutcome::LimitExceeded(breach);
        }
        self.tracker.record_step();

        let mut cmd = shell(&command);
        cmd.current_dir(&self.root);
        info!(command = %command, "running agent command");
        let outcome = run_command_streaming(
            cmd,
            None,
            self.command_timeout,
            self.output_limit_bytes,
            cancel,
            &mut |_| {},
        );
        match outcome {
            Ok(out) if out.cancelled => {
                let mut text = "[cancelled]\n--- stdout ---\n".to_string();
                text.push_str(&out.stdout_lossy());
                failed(call, text)
            }
            Ok(out) => {
                let mut text = format!("exit code: {:?}\n", out.status.code());
                if out.timed_out {
                    text.push_str(&format!(
                        "[timed out after {}s]\n",
                        self.command_timeout.as_secs()
                    ));
                }
                text.push_str("--- stdout ---\n");
                text.push_str(&out.stdout_lossy());
                text.push_str("\n--- stderr ---\n");
                text.push_str(&out.stderr_lossy());
                ToolOutcome::Result(ToolResult {
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                    ok: out.status.success() && !out.timed_out,
                    output: text,
                })
            }
            Err(err) => failed(call, format!("run command: {err:#}")),
        }
    }
}

#[cfg(windows)]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

#[cfg(not(windows))]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

fn string_arg(arguments: &Value, key: &str) -> Option<String> {
    arguments.get(key).and_then(Value::as_str).map(str::to_string)
}

fn truncate(mut text: String, limit: usize) -> String {
    if text.len() <= limit {
        return text;
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    let dropped = text.len() - end;
    text.truncate(end);
    text.push_str(&format!("\n[truncated {dropped} bytes]"));
    text
}

fn succeeded(call: &ToolCall, output: impl Into<String>) -> ToolOutcome {
    ToolOutcome::Result(ToolResult {
        call_id: call.id.clone(),
        name: call.name.clone(),
        ok: true,
        output: output.into(),
    })
}

fn failed(call: &ToolCall, output: impl Into<String>) -> ToolOutcome {
    ToolOutcome::Result(ToolResult {
        call_id: call.id.clone(),
        name: call.name.clone(),
        ok: false,
        output: output.into(),
    })
}
