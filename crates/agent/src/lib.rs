//! The Quill writing agent.
//!
//! A run is a loop of model turns over one growing history:
//!
//! 1. **Budget**: estimate the history's token size and compress it past
//!    the threshold
//! 2. **Checkpoint**: every N iterations, snapshot the history to disk
//! 3. **Stream**: call the model and assemble its streamed turn
//! 4. **Dispatch**: run the requested tool calls and append their results
//!
//! The loop ends when the model answers without calling a tool, when the
//! iteration cap is reached, or on cancellation, which takes an emergency
//! checkpoint first.

pub mod budget;
pub mod compressor;
pub mod dispatcher;
pub mod error;
pub mod loop_runner;
pub mod persistence;
pub mod prompt;
pub mod session;
pub mod shutdown;
pub mod stream_event;
pub mod streaming;

#[cfg(test)]
mod test_helpers;

pub use budget::{BudgetCheck, BudgetMonitor};
pub use compressor::{CompressionOutcome, CompressionReport, ContextCompressor, Snapshot};
pub use dispatcher::{DispatchOutcome, Invocation, InvocationResult, ToolDispatcher};
pub use error::AgentError;
pub use loop_runner::{AgentLoop, RunOutcome, RunReport};
pub use persistence::{BackupManager, BackupRecord, Checkpoint, EmergencyOutcome};
pub use prompt::{WRITING_SYSTEM_PROMPT, system_prompt};
pub use session::Session;
pub use shutdown::ShutdownSignal;
pub use stream_event::{AgentStreamEvent, StreamObserver};
pub use streaming::{AssembledMessage, StreamAssembler};
