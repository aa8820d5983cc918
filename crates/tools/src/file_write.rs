//! File write tool: write markdown files into the active project folder.

use async_trait::async_trait;
use quill_core::error::ToolError;
use quill_core::tool::{ProjectContext, Tool, ToolArguments};
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// How `write_file` treats an existing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Fail if the file already exists
    Create,
    Append,
    Overwrite,
}

impl WriteMode {
    pub fn parse(mode: &str) -> Option<Self> {
        match mode {
            "create" => Some(Self::Create),
            "append" => Some(Self::Append),
            "overwrite" => Some(Self::Overwrite),
            _ => None,
        }
    }
}

pub struct FileWriteTool;

impl FileWriteTool {
    /// Normalize a requested filename: must be a bare file name, gets `.md`.
    fn normalize_filename(filename: &str) -> Result<String, ToolError> {
        let filename = filename.trim();
        if filename.is_empty()
            || filename.contains('/')
            || filename.contains('\\')
            || filename == "."
            || filename.starts_with("..")
        {
            return Err(ToolError::PermissionDenied {
                tool_name: "write_file".into(),
                reason: format!("'{filename}' must be a plain file name inside the project folder"),
            });
        }

        if filename.ends_with(".md") {
            Ok(filename.to_string())
        } else {
            Ok(format!("{filename}.md"))
        }
    }
}

#[async_trait]
impl Tool for FileWriteTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Writes content to a markdown file in the active project folder. Supports three modes: \
         'create' (creates new file, fails if exists), 'append' (adds content to end of existing file), \
         'overwrite' (replaces entire file content)."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "filename": {
                    "type": "string",
                    "description": "The name of the markdown file to write (should end in .md)"
                },
                "content": {
                    "type": "string",
                    "description": "The content to write to the file"
                },
                "mode": {
                    "type": "string",
                    "enum": ["create", "append", "overwrite"],
                    "description": "The write mode: 'create' for new files, 'append' to add to existing, 'overwrite' to replace"
                }
            },
            "required": ["filename", "content", "mode"]
        })
    }

    async fn execute(
        &self,
        arguments: ToolArguments,
        project: &mut ProjectContext,
    ) -> Result<String, ToolError> {
        let folder = project.active().ok_or(ToolError::NoActiveProject)?;

        let filename = arguments
            .get("filename")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'filename' argument".into()))?;

        let content = arguments
            .get("content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'content' argument".into()))?;

        let mode_str = arguments
            .get("mode")
            .and_then(|v| v.as_str())
            .unwrap_or("create");
        let mode = WriteMode::parse(mode_str).ok_or_else(|| {
            ToolError::InvalidArguments(format!(
                "Invalid mode '{mode_str}'. Use 'create', 'append', or 'overwrite'."
            ))
        })?;

        let filename = Self::normalize_filename(filename)?;
        let path = folder.join(&filename);
        let chars = content.chars().count();

        debug!(file = %path.display(), ?mode, chars, "Writing file");

        match mode {
            WriteMode::Create => {
                if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                    return Err(ToolError::ExecutionFailed {
                        tool_name: "write_file".into(),
                        reason: format!(
                            "File '{filename}' already exists. Use 'append' or 'overwrite' mode to modify it."
                        ),
                    });
                }
                tokio::fs::write(&path, content).await?;
                Ok(format!(
                    "Successfully created file '{filename}' with {chars} characters."
                ))
            }
            WriteMode::Append => {
                let mut file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .await?;
                file.write_all(content.as_bytes()).await?;
                file.flush().await?;
                Ok(format!(
                    "Successfully appended {chars} characters to '{filename}'."
                ))
            }
            WriteMode::Overwrite => {
                tokio::fs::write(&path, content).await?;
                Ok(format!(
                    "Successfully overwrote '{filename}' with {chars} characters."
                ))
            }
        }
    }
}
