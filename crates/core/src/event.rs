//! Domain event system: run lifecycle notifications.
//!
//! Events are published when something interesting happens during a run
//! (compression, checkpoints, tool executions, failed iterations). The CLI
//! subscribes to render progress; nothing in the core depends on a
//! subscriber being present.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;

/// All domain events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DomainEvent {
    /// A new iteration began
    IterationStarted {
        iteration: u32,
        max_iterations: u32,
        messages: usize,
    },

    /// The token budget was checked
    TokensEstimated {
        /// `None` when estimation failed and zero was assumed
        tokens: Option<u64>,
        limit: u64,
        threshold: u64,
    },

    /// History was compressed into a summary
    ContextCompressed {
        messages_before: usize,
        messages_after: usize,
        tokens_saved: i64,
        summary_file: Option<PathBuf>,
    },

    /// Compression was attempted but the history was left unchanged
    CompressionSkipped { reason: String },

    /// A tool was executed
    ToolExecuted {
        tool_name: String,
        success: bool,
        duration_ms: u64,
        preview: String,
    },

    /// A backup record was written
    CheckpointWritten {
        iteration: u32,
        backup_file: PathBuf,
        summary_file: PathBuf,
        compression_ratio: f64,
    },

    /// A periodic checkpoint failed; the run continues
    CheckpointFailed { iteration: u32, error: String },

    /// An iteration failed before its assistant turn was appended
    IterationFailed { iteration: u32, error: String },

    /// An error occurred
    ErrorOccurred {
        context: String,
        error_message: String,
        timestamp: DateTime<Utc>,
    },
}

/// A broadcast-based event bus for domain events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: DomainEvent) {
        // Ignore send errors (no subscribers = that's fine)
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn event_bus_publish_subscribe() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(DomainEvent::ToolExecuted {
            tool_name: "write_file".into(),
            success: true,
            duration_ms: 42,
            preview: "Successfully created file".into(),
        });

        let event = rx.recv().await.unwrap();
        match event.as_ref() {
            DomainEvent::ToolExecuted { tool_name, success, .. } => {
                assert_eq!(tool_name, "write_file");
                assert!(*success);
            }
            _ => panic!("Expected ToolExecuted event"),
        }
    }

    #[test]
    fn event_bus_no_subscribers_doesnt_panic() {
        let bus = EventBus::new(16);
        bus.publish(DomainEvent::ErrorOccurred {
            context: "test".into(),
            error_message: "no subscribers".into(),
            timestamp: Utc::now(),
        });
    }
}
