//! Streaming response assembly.
//!
//! Folds the incremental deltas of one model turn into a single assistant
//! [`Message`]. Text and reasoning fragments are concatenated in arrival
//! order. Tool call fragments are addressed by index into a growable list of
//! slots; a slot's argument text is the concatenation of every fragment sent
//! to its index, and its name is fixed by the first non-empty name fragment.

use quill_core::error::ProviderError;
use quill_core::message::{Message, MessageToolCall, Role};
use quill_core::provider::{StreamDelta, ToolCallDelta};
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::stream_event::{AgentStreamEvent, StreamObserver};

/// How far past the current slots a fragment index may reach.
pub const MAX_TOOL_CALLS_PER_TURN: usize = 128;

#[derive(Debug, Default)]
struct Slot {
    /// Whether any fragment ever addressed this index
    touched: bool,
    id: String,
    name: String,
    arguments: String,
    argument_chars: usize,
}

/// Accumulates the deltas of one streamed turn.
#[derive(Debug, Default)]
pub struct StreamAssembler {
    role: Option<Role>,
    content: String,
    reasoning: String,
    slots: Vec<Slot>,
    rejected_indices: Vec<usize>,
    finish_reason: Option<String>,
    observer: StreamObserver,
}

/// The result of a finished stream.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledMessage {
    pub role: Role,
    pub content: Option<String>,
    pub reasoning: Option<String>,
    /// Completed tool calls, in index order
    pub tool_calls: Vec<MessageToolCall>,
    pub finish_reason: Option<String>,
    /// Indices that were padded over but never received a fragment
    pub skipped_indices: Vec<usize>,
    /// Indices too far out of range to address; their fragments were dropped
    pub rejected_indices: Vec<usize>,
}

impl AssembledMessage {
    /// The canonical assistant turn for the history.
    pub fn into_message(self) -> Message {
        let mut message = Message::assistant_with_tools(self.content, self.reasoning, self.tool_calls);
        message.role = self.role;
        message
    }
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report progress to `observer` as fragments arrive.
    pub fn with_observer(mut self, observer: StreamObserver) -> Self {
        self.observer = observer;
        self
    }

    /// Fold one delta into the in-progress turn.
    pub fn push(&mut self, delta: StreamDelta) {
        if self.role.is_none() {
            self.role = delta.role;
        }

        if let Some(reasoning) = delta.reasoning.filter(|r| !r.is_empty()) {
            self.reasoning.push_str(&reasoning);
            self.observer
                .emit(AgentStreamEvent::Reasoning { content: reasoning });
        }

        if let Some(content) = delta.content.filter(|c| !c.is_empty()) {
            self.content.push_str(&content);
            self.observer.emit(AgentStreamEvent::Chunk { content });
        }

        for fragment in delta.tool_calls {
            self.push_tool_fragment(fragment);
        }

        if delta.finish_reason.is_some() {
            self.finish_reason = delta.finish_reason;
        }
    }

    fn push_tool_fragment(&mut self, fragment: ToolCallDelta) {
        let index = fragment.index;
        if index >= self.slots.len() + MAX_TOOL_CALLS_PER_TURN {
            warn!(index, slots = self.slots.len(), "Dropping tool call fragment with impossible index");
            if !self.rejected_indices.contains(&index) {
                self.rejected_indices.push(index);
            }
            return;
        }
        if index >= self.slots.len() {
            self.slots.resize_with(index + 1, Slot::default);
        }
        let slot = &mut self.slots[index];
        slot.touched = true;

        if let Some(id) = fragment.id.filter(|id| !id.is_empty()) {
            slot.id = id;
        }

        if let Some(name) = fragment.name.filter(|n| !n.is_empty())
            && slot.name.is_empty()
        {
            slot.name = name;
            self.observer.emit(AgentStreamEvent::ToolCall {
                index,
                name: slot.name.clone(),
            });
        }

        if let Some(args) = fragment.arguments.filter(|a| !a.is_empty()) {
            slot.argument_chars += args.chars().count();
            slot.arguments.push_str(&args);
            self.observer.emit(AgentStreamEvent::ToolArguments {
                index,
                name: slot.name.clone(),
                chars: slot.argument_chars,
            });
        }
    }

    /// Close the turn.
    ///
    /// Slots that never received a fragment are a protocol violation: they
    /// are logged, listed in `skipped_indices` and dropped. Slots that never
    /// received an id cannot be answered by a tool turn and are dropped too.
    /// Out-of-range indices were already rejected while streaming.
    pub fn finish(self) -> AssembledMessage {
        let mut skipped_indices = Vec::new();
        let mut tool_calls = Vec::with_capacity(self.slots.len());

        for (index, slot) in self.slots.into_iter().enumerate() {
            if !slot.touched {
                skipped_indices.push(index);
                continue;
            }
            if slot.id.is_empty() {
                warn!(index, name = %slot.name, "Dropping tool call without an id");
                continue;
            }
            tool_calls.push(MessageToolCall::new(slot.id, slot.name, slot.arguments));
        }

        if !skipped_indices.is_empty() {
            warn!(?skipped_indices, "Stream skipped tool call indices");
        }

        trace!(
            content_len = self.content.len(),
            reasoning_len = self.reasoning.len(),
            tool_calls = tool_calls.len(),
            "Assembled streamed turn"
        );

        AssembledMessage {
            role: self.role.unwrap_or(Role::Assistant),
            content: Some(self.content).filter(|c| !c.is_empty()),
            reasoning: Some(self.reasoning).filter(|r| !r.is_empty()),
            tool_calls,
            finish_reason: self.finish_reason,
            skipped_indices,
            rejected_indices: self.rejected_indices,
        }
    }

    /// Drain a provider stream to completion.
    ///
    /// Deltas are consumed strictly in arrival order. A stream error aborts
    /// the turn; the partial state is discarded.
    pub async fn collect(
        mut self,
        rx: &mut mpsc::Receiver<Result<StreamDelta, ProviderError>>,
    ) -> Result<AssembledMessage, ProviderError> {
        while let Some(delta) = rx.recv().await {
            self.push(delta?);
        }
        Ok(self.finish())
    }
}
