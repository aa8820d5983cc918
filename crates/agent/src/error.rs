//! Agent-level errors.
//!
//! Almost every failure inside a run is absorbed and reported as progress.
//! What remains here are the fatal input errors that stop a run before the
//! first model call, and the persistence errors the checkpoint fallback
//! chain consumes internally.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Recovery file not found: {}", path.display())]
    RecoveryNotFound { path: PathBuf },

    #[error("Recovery path is not a file: {}", path.display())]
    RecoveryNotAFile { path: PathBuf },

    #[error("Recovery file is empty: {}", path.display())]
    RecoveryEmpty { path: PathBuf },

    #[error("Failed to read recovery file {}: {source}", path.display())]
    RecoveryRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No prompt provided")]
    EmptyPrompt,

    #[error("Summarization failed: {0}")]
    Summary(String),

    #[error("Persistence I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AgentError {
    /// Fatal input errors end the process before any model call.
    pub fn is_fatal_input(&self) -> bool {
        matches!(
            self,
            Self::RecoveryNotFound { .. }
                | Self::RecoveryNotAFile { .. }
                | Self::RecoveryEmpty { .. }
                | Self::RecoveryRead { .. }
                | Self::EmptyPrompt
        )
    }
}
