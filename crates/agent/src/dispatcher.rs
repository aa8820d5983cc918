//! Tool dispatch.
//!
//! Executes the tool calls of one assistant turn, strictly in order, and
//! appends exactly one tool turn per call. No failure escapes a batch: bad
//! argument text, unknown tool names and failing tools all become result
//! text the model can read and react to.

use quill_core::error::ToolError;
use quill_core::event::{DomainEvent, EventBus};
use quill_core::message::{Message, MessageToolCall};
use quill_core::tool::{ProjectContext, ToolArguments, ToolRegistry};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::compressor::{CompressionOutcome, ContextCompressor};
use crate::prompt::COMPRESS_CONTEXT_TOOL;
use crate::stream_event::{AgentStreamEvent, StreamObserver};

/// Characters of a tool result shown in console and log previews.
pub const RESULT_PREVIEW_CHARS: usize = 400;

/// Cut `text` to at most `max_chars` characters, marking the cut with `...`.
pub fn truncate_preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => format!("{}...", &text[..byte_idx]),
        None => text.to_string(),
    }
}

/// Whole milliseconds in `elapsed`, saturating at `u64::MAX`.
pub fn elapsed_ms(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

/// Parse raw argument text into a flat record.
///
/// Empty or whitespace-only text is an empty record. Anything that is not a
/// JSON object yields an empty record plus the parse error.
pub fn parse_arguments(raw: &str) -> (ToolArguments, Option<String>) {
    if raw.trim().is_empty() {
        return (ToolArguments::new(), None);
    }
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Object(map)) => (map, None),
        Ok(other) => (
            ToolArguments::new(),
            Some(format!("expected a JSON object, got {}", json_kind(&other))),
        ),
        Err(e) => (ToolArguments::new(), Some(e.to_string())),
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

/// What happened to one tool call.
#[derive(Debug)]
pub enum InvocationResult {
    Success(String),
    UnknownTool,
    CapabilityFailure(ToolError),
    /// The reserved compression tool ran; carries the compressor's message
    Compression(String),
}

/// One dispatched call and its result.
#[derive(Debug)]
pub struct Invocation {
    pub call: MessageToolCall,
    pub parse_error: Option<String>,
    pub result: InvocationResult,
    pub duration_ms: u64,
}

impl Invocation {
    pub fn is_success(&self) -> bool {
        matches!(
            self.result,
            InvocationResult::Success(_) | InvocationResult::Compression(_)
        )
    }

    /// The full text of the tool turn for this call.
    pub fn render(&self) -> String {
        let text = match &self.result {
            InvocationResult::Success(out) | InvocationResult::Compression(out) => out.clone(),
            InvocationResult::UnknownTool => format!("Error: Unknown tool '{}'", self.call.name),
            InvocationResult::CapabilityFailure(e) => format!("Tool failed: {}: {e}", e.kind()),
        };
        match &self.parse_error {
            Some(err) => format!(
                "Warning: could not parse tool arguments ({err}); the tool was called with no arguments.\n{text}"
            ),
            None => text,
        }
    }
}

#[derive(Debug)]
pub enum DispatchOutcome {
    /// The assistant turn asked for nothing: the task is done.
    Completed,
    /// Every call ran and has a tool turn at the end of the history.
    Dispatched(Vec<Invocation>),
}

pub struct ToolDispatcher<'a> {
    tools: &'a ToolRegistry,
    compressor: &'a ContextCompressor,
    keep_recent: usize,
    event_bus: Option<Arc<EventBus>>,
    observer: StreamObserver,
}

impl<'a> ToolDispatcher<'a> {
    pub fn new(tools: &'a ToolRegistry, compressor: &'a ContextCompressor, keep_recent: usize) -> Self {
        Self {
            tools,
            compressor,
            keep_recent,
            event_bus: None,
            observer: StreamObserver::none(),
        }
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn with_observer(mut self, observer: StreamObserver) -> Self {
        self.observer = observer;
        self
    }

    /// Run `calls`, appending one tool turn per call to `history`.
    pub async fn dispatch(
        &self,
        history: &mut Vec<Message>,
        calls: &[MessageToolCall],
        project: &mut ProjectContext,
    ) -> DispatchOutcome {
        if calls.is_empty() {
            return DispatchOutcome::Completed;
        }

        let mut invocations = Vec::with_capacity(calls.len());

        for call in calls {
            let (arguments, parse_error) = parse_arguments(&call.arguments);
            if let Some(err) = &parse_error {
                warn!(tool = %call.name, id = %call.id, error = %err, "Malformed tool arguments");
            }
            debug!(tool = %call.name, id = %call.id, "Dispatching tool call");

            let start = Instant::now();
            let result = if call.name == COMPRESS_CONTEXT_TOOL {
                let outcome = self
                    .compressor
                    .compress(history, self.keep_recent, &project.artifact_dir())
                    .await;
                self.publish_compression(history, &outcome);
                let message = outcome.message().to_string();
                *history = outcome.into_history();
                InvocationResult::Compression(message)
            } else {
                match self.tools.get(&call.name) {
                    None => InvocationResult::UnknownTool,
                    Some(tool) => match tool.execute(arguments, project).await {
                        Ok(out) => InvocationResult::Success(out),
                        Err(e) => InvocationResult::CapabilityFailure(e),
                    },
                }
            };
            let duration_ms = elapsed_ms(start.elapsed());

            let invocation = Invocation {
                call: call.clone(),
                parse_error,
                result,
                duration_ms,
            };
            let text = invocation.render();
            let preview = truncate_preview(&text, RESULT_PREVIEW_CHARS);

            if invocation.is_success() {
                info!(tool = %call.name, duration_ms, "Tool call finished");
            } else {
                warn!(tool = %call.name, duration_ms, result = %preview, "Tool call failed");
            }

            self.observer.emit(AgentStreamEvent::ToolResult {
                id: call.id.clone(),
                name: call.name.clone(),
                preview: preview.clone(),
                success: invocation.is_success(),
            });
            if let Some(bus) = &self.event_bus {
                bus.publish(DomainEvent::ToolExecuted {
                    tool_name: call.name.clone(),
                    success: invocation.is_success(),
                    duration_ms,
                    preview,
                });
            }

            history.push(Message::tool_result(&call.id, &call.name, text));
            invocations.push(invocation);
        }

        DispatchOutcome::Dispatched(invocations)
    }

    fn publish_compression(&self, before: &[Message], outcome: &CompressionOutcome) {
        let Some(bus) = &self.event_bus else {
            return;
        };
        match outcome {
            CompressionOutcome::Compressed(report) => bus.publish(DomainEvent::ContextCompressed {
                messages_before: before.len(),
                messages_after: report.history.len(),
                tokens_saved: report.tokens_saved,
                summary_file: report.summary_file.clone(),
            }),
            other => bus.publish(DomainEvent::CompressionSkipped {
                reason: other.message().to_string(),
            }),
        }
    }
}
