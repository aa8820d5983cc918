//! Context compression.
//!
//! Replaces the older part of a history with a model-written summary while
//! keeping the leading system turn and the most recent turns verbatim. Every
//! successful summary is also written to a `.context_summary_*.md` artifact,
//! which doubles as a recovery seed for a later `--recover` run.
//!
//! Compression never fails hard: on any summarization error the caller gets
//! the input history back unchanged together with a message.

use chrono::{DateTime, Local};
use quill_core::message::{Message, Role, history_char_len};
use quill_core::provider::{Provider, ProviderRequest};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::dispatcher::truncate_preview;
use crate::error::AgentError;

/// Characters of hidden reasoning kept per assistant turn in the transcript.
pub const REASONING_PREVIEW_CHARS: usize = 500;

/// Characters of a tool result kept in the transcript.
pub const TOOL_RESULT_PREVIEW_CHARS: usize = 200;

const SUMMARY_SYSTEM_PROMPT: &str =
    "You are a helpful assistant that creates comprehensive summaries of conversations.";

const SUMMARY_PROMPT: &str = "\
Please provide a comprehensive summary of the conversation history below. Include:
1. The main task or goal discussed
2. Key decisions made
3. Files created and their purposes
4. Progress made so far
5. Any important context for continuing the work

Conversation history to summarize:
";

const SUMMARY_TEMPERATURE: f32 = 0.7;

pub const SUMMARY_START_MARKER: &str = "[CONTEXT SUMMARY - Previous conversation compressed]";
pub const SUMMARY_END_MARKER: &str = "[END CONTEXT SUMMARY - Continuing from here...]";

/// A successful compression.
#[derive(Debug, Clone)]
pub struct CompressionReport {
    /// System turn (if any) + summary turn + retained recent turns
    pub history: Vec<Message>,
    /// `None` when the artifact could not be written
    pub summary_file: Option<PathBuf>,
    pub messages_compressed: usize,
    pub messages_retained: usize,
    /// Rough estimate from the character delta
    pub tokens_saved: i64,
    /// Characters summarized per summary character
    pub compression_ratio: f64,
    pub message: String,
}

#[derive(Debug, Clone)]
pub enum CompressionOutcome {
    /// History too short; returned unchanged.
    NotNeeded {
        history: Vec<Message>,
        message: String,
    },
    Compressed(CompressionReport),
    /// Summarization failed; returned unchanged.
    Failed {
        history: Vec<Message>,
        message: String,
    },
}

impl CompressionOutcome {
    pub fn history(&self) -> &[Message] {
        match self {
            Self::NotNeeded { history, .. } | Self::Failed { history, .. } => history,
            Self::Compressed(report) => &report.history,
        }
    }

    pub fn into_history(self) -> Vec<Message> {
        match self {
            Self::NotNeeded { history, .. } | Self::Failed { history, .. } => history,
            Self::Compressed(report) => report.history,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::NotNeeded { message, .. } | Self::Failed { message, .. } => message,
            Self::Compressed(report) => &report.message,
        }
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self, Self::Compressed(_))
    }
}

/// A full-retention summary written for a checkpoint.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub summary_file: PathBuf,
    pub messages_summarized: usize,
    pub compression_ratio: f64,
    /// Rough token size of the summary text
    pub summary_tokens: u64,
}

pub struct ContextCompressor {
    provider: Arc<dyn Provider>,
    model: String,
    summary_max_tokens: u32,
    timeout: Duration,
}

impl ContextCompressor {
    pub fn new(
        provider: Arc<dyn Provider>,
        model: impl Into<String>,
        summary_max_tokens: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            provider,
            model: model.into(),
            summary_max_tokens,
            timeout,
        }
    }

    /// Compress `history`, keeping the last `keep_recent` turns verbatim.
    ///
    /// `artifact_dir` receives the summary artifact.
    pub async fn compress(
        &self,
        history: &[Message],
        keep_recent: usize,
        artifact_dir: &Path,
    ) -> CompressionOutcome {
        if history.len() <= keep_recent + 1 {
            return CompressionOutcome::NotNeeded {
                history: history.to_vec(),
                message: "Not enough messages to compress.".into(),
            };
        }

        let system = history.first().filter(|m| m.role == Role::System);
        let start = usize::from(system.is_some());
        let split = batch_boundary(history, start, history.len() - keep_recent);
        if split <= start {
            return CompressionOutcome::NotNeeded {
                history: history.to_vec(),
                message: "Not enough messages to compress.".into(),
            };
        }
        let to_compress = &history[start..split];
        let recent = &history[split..];

        debug!(
            compress = to_compress.len(),
            retain = recent.len(),
            "Compressing context"
        );

        let summary = match self.summarize(to_compress).await {
            Ok(summary) => summary,
            Err(e) => {
                warn!(error = %e, "Context compression failed, keeping history");
                return CompressionOutcome::Failed {
                    history: history.to_vec(),
                    message: format!("Error during compression: {e}"),
                };
            }
        };

        let summary_file =
            match write_summary_artifact(artifact_dir, &summary, to_compress.len(), recent.len())
                .await
            {
                Ok(path) => Some(path),
                Err(e) => {
                    warn!(dir = %artifact_dir.display(), error = %e, "Could not save summary artifact");
                    None
                }
            };

        let mut compressed = Vec::with_capacity(recent.len() + 2);
        if let Some(system) = system {
            compressed.push(system.clone());
        }
        compressed.push(summary_turn(&summary));
        compressed.extend_from_slice(recent);

        let original_chars = history_char_len(to_compress);
        let summary_chars = summary.chars().count();
        let tokens_saved = (original_chars as i64 - summary_chars as i64) / 4;

        let message = match &summary_file {
            Some(path) => format!(
                "Successfully compressed {} messages. Summary saved to {}.",
                to_compress.len(),
                path.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default()
            ),
            None => format!(
                "Successfully compressed {} messages. Summary could not be saved to disk.",
                to_compress.len()
            ),
        };

        info!(
            compressed = to_compress.len(),
            retained = recent.len(),
            tokens_saved,
            "Context compressed"
        );

        CompressionOutcome::Compressed(CompressionReport {
            history: compressed,
            summary_file,
            messages_compressed: to_compress.len(),
            messages_retained: recent.len(),
            tokens_saved,
            compression_ratio: ratio(original_chars, summary_chars),
            message,
        })
    }

    /// Summarize every non-system turn into a fresh artifact without
    /// touching the history.
    pub async fn snapshot(
        &self,
        history: &[Message],
        artifact_dir: &Path,
    ) -> Result<Snapshot, AgentError> {
        let turns: Vec<Message> = history
            .iter()
            .filter(|m| m.role != Role::System)
            .cloned()
            .collect();
        if turns.is_empty() {
            return Err(AgentError::Summary("history has nothing to summarize".into()));
        }

        let summary = self.summarize(&turns).await?;
        let summary_file =
            write_summary_artifact(artifact_dir, &summary, turns.len(), turns.len()).await?;

        let summary_chars = summary.chars().count();
        Ok(Snapshot {
            summary_file,
            messages_summarized: turns.len(),
            compression_ratio: ratio(history_char_len(&turns), summary_chars),
            summary_tokens: summary_chars.div_ceil(4) as u64,
        })
    }

    /// One bounded summarization request.
    async fn summarize(&self, turns: &[Message]) -> Result<String, AgentError> {
        let mut request = ProviderRequest::simple(
            &self.model,
            vec![
                Message::system(SUMMARY_SYSTEM_PROMPT),
                Message::user(format!("{SUMMARY_PROMPT}{}", render_transcript(turns))),
            ],
        );
        request.temperature = SUMMARY_TEMPERATURE;
        request.max_tokens = Some(self.summary_max_tokens);

        let response = tokio::time::timeout(self.timeout, self.provider.complete(request))
            .await
            .map_err(|_| {
                AgentError::Summary(format!(
                    "summary request timed out after {}s",
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| AgentError::Summary(e.to_string()))?;

        response
            .message
            .content
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| AgentError::Summary("model returned an empty summary".into()))
    }
}

/// Render turns as a labeled plain-text transcript for the summary prompt.
pub fn render_transcript(turns: &[Message]) -> String {
    let mut out = String::new();
    for msg in turns {
        match msg.role {
            Role::Assistant => {
                if let Some(reasoning) = msg.reasoning.as_deref().filter(|r| !r.is_empty()) {
                    out.push_str(&format!(
                        "\n[Assistant Reasoning]: {}\n",
                        truncate_preview(reasoning, REASONING_PREVIEW_CHARS)
                    ));
                }
                if !msg.tool_calls.is_empty() {
                    let calls: Vec<String> = msg
                        .tool_calls
                        .iter()
                        .map(|tc| format!("{}({})", tc.name, tc.arguments))
                        .collect();
                    out.push_str(&format!("\n[Assistant Tool Calls]: {}\n", calls.join(", ")));
                }
                if !msg.text().is_empty() {
                    out.push_str(&format!("\n[Assistant]: {}\n", msg.text()));
                }
            }
            Role::Tool => {
                out.push_str(&format!(
                    "\n[Tool Result - {}]: {}\n",
                    msg.name.as_deref().unwrap_or("unknown_tool"),
                    truncate_preview(msg.text(), TOOL_RESULT_PREVIEW_CHARS)
                ));
            }
            Role::User => out.push_str(&format!("\n[User]: {}\n", msg.text())),
            Role::System => {}
        }
    }
    out
}

/// The synthetic user turn that stands in for the summarized range.
/// Move `split` back so the retained window never opens with tool turns
/// whose assistant turn would be summarized away.
fn batch_boundary(history: &[Message], start: usize, mut split: usize) -> usize {
    while split > start && history[split].role == Role::Tool {
        split -= 1;
    }
    split
}

pub fn summary_turn(summary: &str) -> Message {
    Message::user(format!(
        "{SUMMARY_START_MARKER}\n\n{summary}\n\n{SUMMARY_END_MARKER}"
    ))
}

fn ratio(original_chars: usize, summary_chars: usize) -> f64 {
    let r = original_chars as f64 / summary_chars.max(1) as f64;
    (r * 1000.0).round() / 1000.0
}

/// Write a summary artifact into `dir`, named by local time to the
/// millisecond.
pub async fn write_summary_artifact(
    dir: &Path,
    summary: &str,
    compressed: usize,
    retained: usize,
) -> std::io::Result<PathBuf> {
    let now: DateTime<Local> = Local::now();
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(format!(
        ".context_summary_{}.md",
        now.format("%Y%m%d_%H%M%S_%3f")
    ));

    let body = format!(
        "# Context Summary\n\n\
         **Generated:** {}\n\n\
         **Messages Compressed:** {compressed}\n\n\
         **Messages Retained:** {retained}\n\n\
         ---\n\n\
         {summary}",
        now.format("%Y-%m-%d %H:%M:%S")
    );

    tokio::fs::write(&path, body).await?;
    Ok(path)
}
