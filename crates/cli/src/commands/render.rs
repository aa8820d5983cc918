//! Console rendering of run progress.
//!
//! Stream events (model text, reasoning, tool progress) go to stdout as they
//! arrive. Domain events become one-line status notes on stderr.

use quill_agent::AgentStreamEvent;
use quill_core::event::DomainEvent;
use std::io::Write;

/// Tracks what was printed last so sections get headers only once.
#[derive(Debug, Default)]
pub struct StreamRenderer {
    section: Section,
}

#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
enum Section {
    #[default]
    None,
    Reasoning,
    Content,
    ToolArguments,
}

impl StreamRenderer {
    pub fn render(&mut self, event: &AgentStreamEvent, out: &mut impl Write) -> std::io::Result<()> {
        match event {
            AgentStreamEvent::Reasoning { content } => {
                if self.section != Section::Reasoning {
                    self.break_line(out)?;
                    writeln!(out, "[thinking]")?;
                    self.section = Section::Reasoning;
                }
                write!(out, "{content}")?;
            }
            AgentStreamEvent::Chunk { content } => {
                if self.section != Section::Content {
                    self.break_line(out)?;
                    writeln!(out, "[response]")?;
                    self.section = Section::Content;
                }
                write!(out, "{content}")?;
            }
            AgentStreamEvent::ToolCall { name, .. } => {
                self.break_line(out)?;
                writeln!(out, "[tool call] {name}")?;
                self.section = Section::None;
            }
            AgentStreamEvent::ToolArguments { name, chars, .. } => {
                write!(out, "\r  {name}: {chars} characters of arguments")?;
                self.section = Section::ToolArguments;
            }
            AgentStreamEvent::ToolResult {
                name,
                preview,
                success,
                ..
            } => {
                self.break_line(out)?;
                let mark = if *success { "ok" } else { "failed" };
                writeln!(out, "[tool {mark}] {name}: {preview}")?;
                self.section = Section::None;
            }
            AgentStreamEvent::Error { message } => {
                self.break_line(out)?;
                writeln!(out, "[error] {message}")?;
                self.section = Section::None;
            }
        }
        out.flush()
    }

    fn break_line(&mut self, out: &mut impl Write) -> std::io::Result<()> {
        if self.section != Section::None {
            writeln!(out)?;
            if self.section != Section::ToolArguments {
                writeln!(out)?;
            }
        }
        self.section = Section::None;
        Ok(())
    }
}

/// A status line for events worth surfacing on the console.
pub fn describe(event: &DomainEvent) -> Option<String> {
    match event {
        DomainEvent::IterationStarted {
            iteration,
            max_iterations,
            messages,
        } => Some(format!(
            "── Iteration {iteration}/{max_iterations} ({messages} messages) ──"
        )),
        DomainEvent::TokensEstimated {
            tokens: Some(tokens),
            limit,
            ..
        } => Some(format!(
            "Context: {tokens}/{limit} tokens ({:.1}%)",
            *tokens as f64 / (*limit).max(1) as f64 * 100.0
        )),
        DomainEvent::TokensEstimated { tokens: None, .. } => {
            Some("Context: token estimate unavailable".into())
        }
        DomainEvent::ContextCompressed {
            messages_before,
            messages_after,
            tokens_saved,
            summary_file,
        } => Some(format!(
            "Context compressed: {messages_before} → {messages_after} messages, ~{tokens_saved} tokens saved{}",
            summary_file
                .as_ref()
                .map(|p| format!(", summary at {}", p.display()))
                .unwrap_or_default()
        )),
        DomainEvent::CompressionSkipped { reason } => Some(format!("Compression skipped: {reason}")),
        DomainEvent::CheckpointWritten {
            iteration,
            backup_file,
            summary_file,
            compression_ratio,
        } => Some(format!(
            "Checkpoint at iteration {iteration}: {} (ratio ~{compression_ratio:.2}x)\n  Resume with: quill --recover \"{}\"",
            backup_file.display(),
            summary_file.display()
        )),
        DomainEvent::CheckpointFailed { iteration, error } => Some(format!(
            "Checkpoint at iteration {iteration} failed: {error}. Continuing without backup."
        )),
        DomainEvent::IterationFailed { iteration, error } => {
            Some(format!("Iteration {iteration} failed: {error}"))
        }
        DomainEvent::ErrorOccurred {
            context,
            error_message,
            ..
        } => Some(format!("Error in {context}: {error_message}")),
        DomainEvent::ToolExecuted { .. } => None,
    }
}
