//! Single-task execution loop: provider turns interleaved with tool calls.
//!
//! The loop never returns an error. Every way it can end is a [`LoopStop`],
//! and the transcript collected so far always comes back with it.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::limits::{LimitBreach, LimitCounters};
use crate::core::tool_call::{normalize_tool_calls, strip_inline_calls};
use crate::error::ProviderError;
use crate::io::provider::{CompletionRequest, Message, Provider};
use crate::io::tools::{ToolExecutor, ToolOutcome, tool_specs};

/// Why the loop ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stop", rename_all = "snake_case")]
pub enum LoopStop {
    /// The model answered without calling any tool.
    Completed,
    /// Soft stop: the answer is whatever text the last turn produced.
    IterationCap,
    Cancelled,
    Blocked { reason: String },
    LimitExceeded(LimitBreach),
    ProviderFailed { message: String },
}

impl LoopStop {
    pub fn is_success(&self) -> bool {
        matches!(self, LoopStop::Completed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub stop: LoopStop,
    /// Final answer, or the partial text produced before the loop stopped.
    pub answer: String,
    pub transcript: Vec<Message>,
    pub iterations: u32,
    pub counters: LimitCounters,
}

/// Run provider turns until the model stops calling tools or a stop
/// condition fires.
#[instrument(skip_all, fields(max_iterations))]
pub fn run_execution_loop(
    provider: &dyn Provider,
    executor: &mut ToolExecutor<'_>,
    mut transcript: Vec<Message>,
    max_iterations: u32,
    on_chunk: &mut dyn FnMut(&str),
    cancel: &CancelToken,
) -> ExecutionOutcome {
    let tools = tool_specs(executor.mode());
    let mut answer = String::new();
    let mut iterations = 0u32;

    let stop = loop {
        if cancel.is_cancelled() {
            break LoopStop::Cancelled;
        }
        if iterations >= max_iterations {
            info!(iterations, "iteration cap reached");
            break LoopStop::IterationCap;
        }
        if let Err(breach) = executor.tracker().check_runtime() {
            break LoopStop::LimitExceeded(breach);
        }
        iterations += 1;

        let request = CompletionRequest {
            messages: transcript.clone(),
            tools: tools.clone(),
        };
        let mut streamed = String::new();
        let completion = {
            let mut sink = |chunk: &str| {
                streamed.push_str(chunk);
                on_chunk(chunk);
            };
            provider.complete(&request, &mut sink, cancel)
        };
        let completion = match completion {
            Ok(completion) => completion,
            Err(err) => {
                if !streamed.is_empty() {
                    transcript.push(Message::assistant(streamed.clone(), Vec::new()));
                    answer = streamed;
                }
                if matches!(err, ProviderError::Cancelled) || cancel.is_cancelled() {
                    break LoopStop::Cancelled;
                }
                warn!(err = %err, "provider call failed");
                break LoopStop::ProviderFailed {
                    message: err.to_string(),
                };
            }
        };

        let calls = normalize_tool_calls(completion.tool_calls, &completion.content, iterations);
        answer = strip_inline_calls(&completion.content);
        if calls.is_empty() {
            transcript.push(Message::assistant(answer.clone(), Vec::new()));
            break LoopStop::Completed;
        }
        debug!(iteration = iterations, calls = calls.len(), "executing tool calls");
        transcript.push(Message::assistant(completion.content, calls.clone()));

        let mut results = Vec::with_capacity(calls.len());
        let mut halt = None;
        for call in &calls {
            if cancel.is_cancelled() {
                halt = Some(LoopStop::Cancelled);
                break;
            }
            match executor.execute(call, cancel) {
                ToolOutcome::Result(result) => results.push(result),
                ToolOutcome::Blocked { reason } => {
                    halt = Some(LoopStop::Blocked { reason });
                    break;
                }
                ToolOutcome::LimitExceeded(breach) => {
                    warn!(breach = %breach, "limit exceeded");
                    halt = Some(LoopStop::LimitExceeded(breach));
                    break;
                }
            }
        }
        if !results.is_empty() {
            transcript.push(Message::tool_results(results));
        }
        if let Some(stop) = halt {
            break stop;
        }
    };

    ExecutionOutcome {
        stop,
        answer,
        transcript,
        iterations,
        counters: executor.tracker().counters(),
    }
}
