//! Execution provider abstraction.
//!
//! The [`Provider`] trait decouples the execution loop from the model
//! backend. Variants are chosen by [`ProviderConfig`] through
//! [`build_provider`]; callers only ever see `Box<dyn Provider>`. Tests use
//! scripted providers that return predetermined completions without spawning
//! processes.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::mpsc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use super::config::ProviderConfig;
use super::process::run_command_streaming;
use crate::cancel::CancelToken;
use crate::core::tool_call::{ToolCall, ToolResult};
use crate::error::ProviderError;

const PROVIDER_OUTPUT_LIMIT: usize = 2_000_000;
const CANCEL_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One entry of the conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Structured calls reported by the provider (assistant messages only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Results of the previous assistant turn (tool messages only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_results: Vec<ToolResult>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::text(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::text(Role::Assistant, content)
        }
    }

    /// Synthetic message carrying every result of one assistant turn.
    pub fn tool_results(results: Vec<ToolResult>) -> Self {
        let content = serde_json::to_string(&results).unwrap_or_default();
        Self {
            tool_results: results,
            ..Self::text(Role::Tool, content)
        }
    }

    fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
        }
    }
}

/// A tool the model may call, described with a JSON Schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
}

/// One model turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// Abstraction over model backends.
pub trait Provider: Send + Sync {
    /// Run one completion, forwarding streamed text to `on_chunk`.
    fn complete(
        &self,
        request: &CompletionRequest,
        on_chunk: &mut dyn FnMut(&str),
        cancel: &CancelToken,
    ) -> Result<Completion, ProviderError>;

    /// Directory the agent operates in (the project root).
    fn set_working_directory(&self, path: &Path);

    /// Abort the in-flight completion, if any.
    fn cancel(&self);
}

/// Construct the provider selected by `config`.
pub fn build_provider(config: &ProviderConfig, workdir: &Path) -> Box<dyn Provider> {
    match config {
        ProviderConfig::Command {
            command,
            timeout_secs,
        } => Box::new(CommandProvider::new(
            command.clone(),
            Duration::from_secs(*timeout_secs),
            workdir,
        )),
        ProviderConfig::Http {
            base_url,
            model,
            api_key_env,
            timeout_secs,
        } => Box::new(HttpProvider::new(
            base_url.clone(),
            model.clone(),
            std::env::var(api_key_env).unwrap_or_default(),
            Duration::from_secs(*timeout_secs),
        )),
    }
}

/// Tracks the token of the call in flight so `cancel()` can reach it.
#[derive(Debug, Default)]
struct InFlight(Mutex<Option<CancelToken>>);

impl InFlight {
    fn begin(&self, token: &CancelToken) {
        if let Ok(mut slot) = self.0.lock() {
            *slot = Some(token.clone());
        }
    }

    fn end(&self) {
        if let Ok(mut slot) = self.0.lock() {
            *slot = None;
        }
    }

    fn cancel(&self) {
        if let Ok(slot) = self.0.lock()
            && let Some(token) = slot.as_ref()
        {
            token.cancel();
        }
    }
}

/// Provider backed by a local CLI.
///
/// The request is written to stdin as JSON. Stdout lines stream to the caller
/// as they arrive. If the complete stdout is a JSON [`Completion`] it is used
/// as-is, otherwise the text becomes the completion content.
#[derive(Debug)]
pub struct CommandProvider {
    command: Vec<String>,
    timeout: Duration,
    workdir: Mutex<PathBuf>,
    in_flight: InFlight,
}

impl CommandProvider {
    pub fn new(command: Vec<String>, timeout: Duration, workdir: &Path) -> Self {
        Self {
            command,
            timeout,
            workdir: Mutex::new(workdir.to_path_buf()),
            in_flight: InFlight::default(),
        }
    }

    fn workdir(&self) -> PathBuf {
        self.workdir
            .lock()
            .map(|dir| dir.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

impl Provider for CommandProvider {
    #[instrument(skip_all, fields(program = self.command.first().map(String::as_str).unwrap_or_default()))]
    fn complete(
        &self,
        request: &CompletionRequest,
        on_chunk: &mut dyn FnMut(&str),
        cancel: &CancelToken,
    ) -> Result<Completion, ProviderError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| ProviderError::Spawn("empty provider command".to_string()))?;
        let workdir = self.workdir();
        let stdin = serde_json::to_vec(&json!({
            "messages": request.messages,
            "tools": request.tools,
            "working_directory": workdir,
        }))
        .map_err(|err| ProviderError::InvalidResponse(format!("encode request: {err}")))?;

        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&workdir);

        info!(workdir = %workdir.display(), "starting provider command");
        self.in_flight.begin(cancel);
        let output = run_command_streaming(
            cmd,
            Some(&stdin),
            self.timeout,
            PROVIDER_OUTPUT_LIMIT,
            cancel,
            on_chunk,
        );
        self.in_flight.end();
        let output = output.map_err(|err| ProviderError::Spawn(format!("{err:#}")))?;

        if output.cancelled {
            return Err(ProviderError::Cancelled);
        }
        if output.timed_out {
            warn!(timeout_secs = self.timeout.as_secs(), "provider timed out");
            return Err(ProviderError::Timeout {
                secs: self.timeout.as_secs(),
            });
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "provider command failed");
            return Err(ProviderError::Exit {
                exit_code: output.status.code(),
                stderr: output.stderr_lossy().trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let completion = parse_command_output(&stdout);
        debug!(
            tool_calls = completion.tool_calls.len(),
            content_len = completion.content.len(),
            "provider command completed"
        );
        Ok(completion)
    }

    fn set_working_directory(&self, path: &Path) {
        if let Ok(mut dir) = self.workdir.lock() {
            *dir = path.to_path_buf();
        }
    }

    fn cancel(&self) {
        self.in_flight.cancel();
    }
}

fn parse_command_output(stdout: &str) -> Completion {
    match serde_json::from_str::<Completion>(stdout.trim()) {
        Ok(completion) if stdout.trim_start().starts_with('{') => completion,
        _ => Completion {
            content: stdout.to_string(),
            tool_calls: Vec::new(),
            finish_reason: Some("stop".to_string()),
        },
    }
}

/// Provider for OpenAI-compatible chat-completions endpoints.
#[derive(Debug)]
pub struct HttpProvider {
    base_url: String,
    model: String,
    api_key: String,
    timeout: Duration,
    in_flight: InFlight,
}

impl HttpProvider {
    pub fn new(base_url: String, model: String, api_key: String, timeout: Duration) -> Self {
        Self {
            base_url,
            model,
            api_key,
            timeout,
            in_flight: InFlight::default(),
        }
    }

    fn request_body(&self, request: &CompletionRequest) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": openai_messages(&request.messages),
        });
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(
                request
                    .tools
                    .iter()
                    .map(|tool| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": tool.name,
                                "description": tool.description,
                                "parameters": tool.parameters,
                            }
                        })
                    })
                    .collect(),
            );
        }
        body
    }
}

impl Provider for HttpProvider {
    #[instrument(skip_all, fields(model = %self.model))]
    fn complete(
        &self,
        request: &CompletionRequest,
        on_chunk: &mut dyn FnMut(&str),
        cancel: &CancelToken,
    ) -> Result<Completion, ProviderError> {
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = self.request_body(request);
        let api_key = self.api_key.clone();
        let timeout = self.timeout;

        // The blocking client cannot be interrupted, so the request runs on its
        // own thread while this one watches the cancel token.
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let result = send_chat_request(&url, &api_key, &body, timeout);
            let _ = tx.send(result);
        });

        self.in_flight.begin(cancel);
        let result = loop {
            match rx.recv_timeout(CANCEL_POLL) {
                Ok(result) => break result,
                Err(mpsc::RecvTimeoutError::Timeout) if cancel.is_cancelled() => {
                    break Err(ProviderError::Cancelled);
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    break Err(ProviderError::Transport("request thread exited".to_string()));
                }
            }
        };
        self.in_flight.end();

        let completion = parse_chat_response(&result?)?;
        if !completion.content.is_empty() {
            on_chunk(&completion.content);
        }
        Ok(completion)
    }

    fn set_working_directory(&self, _path: &Path) {}

    fn cancel(&self) {
        self.in_flight.cancel();
    }
}

fn send_chat_request(
    url: &str,
    api_key: &str,
    body: &Value,
    timeout: Duration,
) -> Result<Value, ProviderError> {
    let client = reqwest::blocking::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|err| ProviderError::Transport(err.to_string()))?;
    let mut req = client.post(url).json(body);
    if !api_key.trim().is_empty() {
        req = req.bearer_auth(api_key);
    }
    let resp = req.send().map_err(|err| {
        if err.is_timeout() {
            ProviderError::Timeout {
                secs: timeout.as_secs(),
            }
        } else {
            ProviderError::Transport(err.to_string())
        }
    })?;
    let status = resp.status();
    debug!(status = %status, "chat completion response");
    if !status.is_success() {
        let text = resp.text().unwrap_or_default();
        return Err(ProviderError::Transport(format!("HTTP {status}: {text}")));
    }
    resp.json::<Value>()
        .map_err(|err| ProviderError::InvalidResponse(err.to_string()))
}

/// Map conversation history to chat-completions messages.
///
/// Results for structured calls become `tool` messages keyed by call id;
/// results for inline calls have no id the API knows, so they are sent back
/// as a user message.
fn openai_messages(messages: &[Message]) -> Vec<Value> {
    let mut out = Vec::new();
    let mut native_ids: Vec<&str> = Vec::new();
    for message in messages {
        match message.role {
            Role::Assistant => {
                native_ids = message.tool_calls.iter().map(|c| c.id.as_str()).collect();
                let mut value = json!({"role": "assistant", "content": message.content});
                if !message.tool_calls.is_empty() {
                    value["tool_calls"] = Value::Array(
                        message
                            .tool_calls
                            .iter()
                            .map(|call| {
                                json!({
                                    "id": call.id,
                                    "type": "function",
                                    "function": {
                                        "name": call.name,
                                        "arguments": call.arguments.to_string(),
                                    }
                                })
                            })
                            .collect(),
                    );
                }
                out.push(value);
            }
            Role::Tool => {
                let (native, inline): (Vec<&ToolResult>, Vec<&ToolResult>) = message
                    .tool_results
                    .iter()
                    .partition(|r| native_ids.contains(&r.call_id.as_str()));
                for result in native {
                    out.push(json!({
                        "role": "tool",
                        "tool_call_id": result.call_id,
                        "content": result.output,
                    }));
                }
                if !inline.is_empty() {
                    let text = serde_json::to_string(&inline).unwrap_or_default();
                    out.push(json!({"role": "user", "content": format!("Tool results:\n{text}")}));
                }
            }
            Role::System => out.push(json!({"role": "system", "content": message.content})),
            Role::User => out.push(json!({"role": "user", "content": message.content})),
        }
    }
    out
}

fn parse_chat_response(value: &Value) -> Result<Completion, ProviderError> {
    let choice = value
        .get("choices")
        .and_then(|c| c.get(0))
        .ok_or_else(|| ProviderError::InvalidResponse("response has no choices".to_string()))?;
    let message = choice
        .get("message")
        .ok_or_else(|| ProviderError::InvalidResponse("choice has no message".to_string()))?;
    let content = message
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let tool_calls = message
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|calls| {
            calls
                .iter()
                .filter_map(|call| {
                    let function = call.get("function")?;
                    let raw_args = function.get("arguments");
                    let arguments = match raw_args {
                        Some(Value::String(raw)) => {
                            serde_json::from_str(raw).unwrap_or(Value::String(raw.clone()))
                        }
                        Some(other) => other.clone(),
                        None => Value::Null,
                    };
                    Some(ToolCall {
                        id: call.get("id")?.as_str()?.to_string(),
                        name: function.get("name")?.as_str()?.to_string(),
                        arguments,
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    let finish_reason = choice
        .get("finish_reason")
        .and_then(Value::as_str)
        .map(str::to_string);
    Ok(Completion {
        content,
        tool_calls,
        finish_reason,
    })
}
