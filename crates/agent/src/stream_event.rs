//! Agent-level streaming events.
//!
//! `AgentStreamEvent` is the live progress feed of one model turn and the
//! tool calls that follow it. The CLI renders these to the console as they
//! arrive. Nothing in the loop waits on a consumer.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Events emitted by the agent while a turn is in flight.
///
/// - `reasoning`: hidden reasoning fragment
/// - `chunk`: visible text fragment
/// - `tool_call`: a tool call slot received its name
/// - `tool_arguments`: argument text for a slot grew
/// - `tool_result`: a tool call finished
/// - `error`: the turn failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentStreamEvent {
    /// Hidden reasoning fragment.
    Reasoning { content: String },

    /// Visible text fragment.
    Chunk { content: String },

    /// The model started preparing a tool call.
    ToolCall { index: usize, name: String },

    /// Argument characters received so far for a tool call.
    ToolArguments {
        index: usize,
        name: String,
        chars: usize,
    },

    /// A tool call completed. `preview` is truncated for display.
    ToolResult {
        id: String,
        name: String,
        preview: String,
        success: bool,
    },

    /// The turn failed before an assistant message was produced.
    Error { message: String },
}

impl AgentStreamEvent {
    /// Short event name, used in logs.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Reasoning { .. } => "reasoning",
            Self::Chunk { .. } => "chunk",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolArguments { .. } => "tool_arguments",
            Self::ToolResult { .. } => "tool_result",
            Self::Error { .. } => "error",
        }
    }
}

/// Optional sink for stream events. Sending never fails the caller: a
/// dropped receiver just silences the feed.
#[derive(Debug, Clone, Default)]
pub struct StreamObserver {
    tx: Option<mpsc::UnboundedSender<AgentStreamEvent>>,
}

impl StreamObserver {
    pub fn new(tx: mpsc::UnboundedSender<AgentStreamEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// An observer that discards everything.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: AgentStreamEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}
