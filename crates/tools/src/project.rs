//! Project tool: create (or reopen) a project folder and make it active.

use async_trait::async_trait;
use quill_core::error::ToolError;
use quill_core::tool::{ProjectContext, Tool, ToolArguments};
use tracing::info;

/// Folder name used when sanitizing leaves nothing behind.
pub const UNTITLED_PROJECT: &str = "untitled_project";

/// Make a project name safe to use as a single folder name.
///
/// Spaces become underscores, anything other than alphanumerics, `_` and
/// `-` is dropped, and leading/trailing `-`/`_` are stripped.
pub fn sanitize_project_name(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .replace(' ', "_")
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
        .collect();

    let trimmed = cleaned.trim_matches(|c| c == '-' || c == '_');
    if trimmed.is_empty() {
        UNTITLED_PROJECT.to_string()
    } else {
        trimmed.to_string()
    }
}

pub struct CreateProjectTool;

#[async_trait]
impl Tool for CreateProjectTool {
    fn name(&self) -> &str {
        "create_project"
    }

    fn description(&self) -> &str {
        "Creates a new project folder in the output directory with a sanitized name. \
         This must be called before writing any files. Only one project can be active at a time."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "project_name": {
                    "type": "string",
                    "description": "The name for the project folder (will be sanitized for filesystem compatibility)"
                }
            },
            "required": ["project_name"]
        })
    }

    async fn execute(
        &self,
        arguments: ToolArguments,
        project: &mut ProjectContext,
    ) -> Result<String, ToolError> {
        let requested = arguments
            .get("project_name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'project_name' argument".into()))?;

        let name = sanitize_project_name(requested);
        let path = project.output_dir.join(&name);

        if path.is_dir() {
            project.set_active(&path);
            info!(project = %path.display(), "Reusing existing project folder");
            return Ok(format!(
                "Project folder already exists at '{}'. Set as active project folder.",
                path.display()
            ));
        }

        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                tool_name: "create_project".into(),
                reason: format!("could not create '{}': {e}", path.display()),
            })?;

        project.set_active(&path);
        info!(project = %path.display(), "Created project folder");

        Ok(format!(
            "Successfully created project folder at '{}'. This is now the active project folder.",
            path.display()
        ))
    }
}
