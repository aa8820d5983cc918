//! Token budget monitoring.
//!
//! Before every model call the history is measured against the configured
//! threshold. Crossing it triggers compression with the configured
//! retention. Nothing here ever fails the iteration: an estimate that
//! cannot be obtained counts as zero.

use quill_config::{ContextConfig, EstimationMode};
use quill_core::message::Message;
use quill_core::provider::{EstimateMessage, Provider, TokenCountRequest};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::compressor::{CompressionOutcome, ContextCompressor};

/// Per-message overhead for role and delimiters in the wire format.
const MESSAGE_OVERHEAD_TOKENS: u64 = 4;

/// Estimate the token count of a string at ~4 characters per token.
pub fn estimate_tokens(text: &str) -> u64 {
    text.len().div_ceil(4) as u64
}

/// Local estimate over the same rendering the remote counter receives,
/// padded by a 10% safety margin.
pub fn heuristic_count(messages: &[Message]) -> u64 {
    let raw: u64 = messages
        .iter()
        .map(|m| {
            let json = serde_json::to_string(&EstimateMessage::from(m)).unwrap_or_default();
            MESSAGE_OVERHEAD_TOKENS + estimate_tokens(&json)
        })
        .sum();
    (raw as f64 * 1.1).ceil() as u64
}

/// Result of one budget check.
#[derive(Debug)]
pub struct BudgetCheck {
    /// `None` when estimation failed and zero was assumed
    pub tokens: Option<u64>,
    /// Present when the threshold was crossed and compression ran
    pub compression: Option<CompressionOutcome>,
}

pub struct BudgetMonitor {
    provider: Arc<dyn Provider>,
    model: String,
    mode: EstimationMode,
    limit: u64,
    threshold: u64,
    keep_recent: usize,
    timeout: Duration,
}

impl BudgetMonitor {
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>, config: &ContextConfig) -> Self {
        Self {
            provider,
            model: model.into(),
            mode: config.estimation,
            limit: config.token_limit,
            threshold: config.compression_threshold,
            keep_recent: config.keep_recent,
            timeout: config.estimate_timeout(),
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// Estimate the size of `messages`, or `None` if counting failed.
    pub async fn estimate(&self, messages: &[Message]) -> Option<u64> {
        match self.mode {
            EstimationMode::Heuristic => Some(heuristic_count(messages)),
            EstimationMode::Remote => {
                let request = TokenCountRequest::new(&self.model, messages);
                match tokio::time::timeout(self.timeout, self.provider.count_tokens(request)).await
                {
                    Ok(Ok(tokens)) => Some(tokens),
                    Ok(Err(e)) => {
                        warn!(error = %e, "Token estimation failed, assuming 0");
                        None
                    }
                    Err(_) => {
                        warn!(
                            timeout_secs = self.timeout.as_secs(),
                            "Token estimation timed out, assuming 0"
                        );
                        None
                    }
                }
            }
        }
    }

    /// Measure `history` and compress it when it reaches the threshold.
    ///
    /// The caller adopts `compression.history()` whether or not it shrank.
    pub async fn check(
        &self,
        history: &[Message],
        compressor: &ContextCompressor,
        artifact_dir: &Path,
    ) -> BudgetCheck {
        let tokens = self.estimate(history).await;
        let current = tokens.unwrap_or(0);
        debug!(tokens = current, limit = self.limit, threshold = self.threshold, "Token budget");

        if current < self.threshold {
            return BudgetCheck {
                tokens,
                compression: None,
            };
        }

        info!(
            tokens = current,
            threshold = self.threshold,
            "Token threshold reached, compressing context"
        );
        let outcome = compressor
            .compress(history, self.keep_recent, artifact_dir)
            .await;
        BudgetCheck {
            tokens,
            compression: Some(outcome),
        }
    }
}
