//! Built-in tool implementations for Quill.
//!
//! The writing agent has two capabilities: create a project folder and
//! write markdown files into it. Context compression is also offered to the
//! model as a tool, but the dispatcher handles it directly.

pub mod file_write;
pub mod project;

use quill_core::tool::ToolRegistry;

pub use file_write::{FileWriteTool, WriteMode};
pub use project::{CreateProjectTool, sanitize_project_name};

/// Create a default tool registry with all built-in tools.
pub fn default_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Box::new(CreateProjectTool));
    registry.register(Box::new(FileWriteTool));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_has_writing_tools() {
        let registry = default_registry();
        assert_eq!(registry.names(), vec!["create_project", "write_file"]);
    }
}
