//! Tool trait: the abstraction over agent capabilities.
//!
//! Tools are what give the agent the ability to act in the world: create a
//! project folder, write chapter files. Each one is a name-addressed,
//! fallible function over a flat record of named arguments.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use crate::error::ToolError;
use crate::provider::ToolDefinition;

/// Flat record of named tool arguments.
pub type ToolArguments = serde_json::Map<String, serde_json::Value>;

/// The project a run is writing into.
///
/// Owned by the session and lent to tools by `&mut`, so a tool that creates
/// a project can make it the active one for every later call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectContext {
    /// Directory under which project folders are created
    pub output_dir: PathBuf,

    /// The currently active project folder, if any
    active: Option<PathBuf>,
}

impl ProjectContext {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            active: None,
        }
    }

    /// The active project folder.
    pub fn active(&self) -> Option<&Path> {
        self.active.as_deref()
    }

    /// Make `folder` the active project.
    pub fn set_active(&mut self, folder: impl Into<PathBuf>) {
        self.active = Some(folder.into());
    }

    /// Where durable artifacts (summaries) belong: the active project
    /// folder, or the current directory when no project exists yet.
    pub fn artifact_dir(&self) -> PathBuf {
        self.active
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

/// The core Tool trait.
///
/// Tools are registered in the [`ToolRegistry`] and made available to the
/// dispatcher. Every tool is treated as fallible.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "write_file").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the model).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool, returning a short human-readable result.
    async fn execute(
        &self,
        arguments: ToolArguments,
        project: &mut ProjectContext,
    ) -> std::result::Result<String, ToolError>;

    /// Convert this tool into a ToolDefinition for sending to the model.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// A registry of available tools, keyed by name.
pub struct ToolRegistry {
    tools: BTreeMap<String, Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: BTreeMap::new(),
        }
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    /// Get all tool definitions (for sending to the model), sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.to_definition()).collect()
    }

    /// List all registered tool names.
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
