//! The state of one run.

use quill_core::message::Message;
use quill_core::tool::ProjectContext;
use std::path::{Path, PathBuf};

use crate::error::AgentError;
use crate::persistence::{load_recovery, recovered_prompt};

/// Everything a run owns: its history, its progress and its project.
#[derive(Debug, Clone)]
pub struct Session {
    pub messages: Vec<Message>,
    /// Iterations completed so far
    pub iteration: u32,
    pub model: String,
    /// The recovery artifact this run was seeded from, if any
    pub recovered_from: Option<PathBuf>,
    pub project: ProjectContext,
}

impl Session {
    /// Seed a run from a user prompt.
    pub fn new(
        model: impl Into<String>,
        system_prompt: &str,
        prompt: &str,
        project: ProjectContext,
    ) -> Result<Self, AgentError> {
        if prompt.trim().is_empty() {
            return Err(AgentError::EmptyPrompt);
        }
        Ok(Self {
            messages: vec![Message::system(system_prompt), Message::user(prompt)],
            iteration: 0,
            model: model.into(),
            recovered_from: None,
            project,
        })
    }

    /// Seed a run from a recovery artifact.
    pub fn recover(
        model: impl Into<String>,
        system_prompt: &str,
        path: &Path,
        project: ProjectContext,
    ) -> Result<Self, AgentError> {
        let text = load_recovery(path)?;
        Ok(Self {
            messages: vec![
                Message::system(system_prompt),
                Message::user(recovered_prompt(&text)),
            ],
            iteration: 0,
            model: model.into(),
            recovered_from: Some(path.to_path_buf()),
            project,
        })
    }
}
