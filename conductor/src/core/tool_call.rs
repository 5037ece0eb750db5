//! Tool-call normalization.
//!
//! Providers report tool calls either as structured data alongside the text
//! or inline in the text as `<tool_call>{json}</tool_call>` payloads. Both
//! forms normalize to the same [`ToolCall`]. Structured calls take precedence;
//! the text is scanned only when a completion carries none.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

static INLINE_CALL: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?s)<tool_call>\s*(.*?)\s*</tool_call>").ok());

/// A single tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Outcome of executing a tool call, fed back to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub name: String,
    pub ok: bool,
    pub output: String,
}

#[derive(Debug, Deserialize)]
struct InlinePayload {
    name: String,
    #[serde(default, alias = "args", alias = "parameters")]
    arguments: Value,
}

/// Pick the tool calls for one completion.
///
/// `iteration` seeds ids for inline calls (`inline-{iteration}-{n}`).
pub fn normalize_tool_calls(structured: Vec<ToolCall>, text: &str, iteration: u32) -> Vec<ToolCall> {
    if !structured.is_empty() {
        return structured;
    }
    parse_inline_calls(text, iteration)
}

/// Extract inline `<tool_call>` payloads. Malformed payloads are skipped.
pub fn parse_inline_calls(text: &str, iteration: u32) -> Vec<ToolCall> {
    let Some(re) = INLINE_CALL.as_ref() else {
        return Vec::new();
    };
    let mut calls = Vec::new();
    for capture in re.captures_iter(text) {
        let Some(body) = capture.get(1) else {
            continue;
        };
        match serde_json::from_str::<InlinePayload>(body.as_str()) {
            Ok(payload) => {
                let arguments = match payload.arguments {
                    // Some models double-encode arguments as a JSON string.
                    Value::String(raw) => serde_json::from_str(&raw).unwrap_or(Value::String(raw)),
                    other => other,
                };
                calls.push(ToolCall {
                    id: format!("inline-{iteration}-{}", calls.len()),
                    name: payload.name,
                    arguments,
                });
            }
            Err(err) => warn!(err = %err, "skipping malformed inline tool call"),
        }
    }
    calls
}

/// Remove inline tool-call tags from an answer.
pub fn strip_inline_calls(text: &str) -> String {
    match INLINE_CALL.as_ref() {
        Some(re) => re.replace_all(text, "").trim().to_string(),
        None => text.trim().to_string(),
    }
}
