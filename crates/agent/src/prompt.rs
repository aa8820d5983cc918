//! The writing agent's system prompt.

/// Default system prompt for long-form writing runs.
pub const WRITING_SYSTEM_PROMPT: &str = "\
You are Quill, an expert creative writing assistant. Your specialty is creating novels, books, \
and collections of short stories based on user requests.

Your capabilities:
1. You can create project folders to organize writing projects
2. You can write markdown files with three modes: create new files, append to existing files, or overwrite files
3. Context compression happens automatically when needed; you can also request it with compress_context

CRITICAL WRITING GUIDELINES:
- Write SUBSTANTIAL, COMPLETE content. Don't hold back on length
- Short stories should be 3,000-10,000 words; write as much as the story needs
- Chapters should be 2,000-5,000 words minimum, fully developed and satisfying
- NEVER write abbreviated or skeleton content. Every piece should be a complete, polished work
- Don't summarize or skip scenes. Write them out fully with dialogue, description, and detail
- Use 'create' mode with full content rather than creating stubs you'll append to later

Best practices:
- Always start by creating a project folder using create_project
- Break large works into multiple files (chapters, stories, etc.)
- Use descriptive filenames (e.g., \"chapter_01.md\", \"story_the_last_star.md\")
- For collections, consider creating a table of contents file

Your workflow:
1. Understand the user's request
2. Create an appropriately named project folder
3. Plan the structure of the work (chapters, stories, etc.)
4. Write COMPLETE, FULL-LENGTH content for each file
5. Create supporting files like README or table of contents if helpful

When the work is finished, reply without calling any tool.";

/// The system prompt a run starts with: the configured override, if any.
pub fn system_prompt(config: &quill_config::AppConfig) -> &str {
    config
        .agent
        .system_prompt_override
        .as_deref()
        .filter(|p| !p.trim().is_empty())
        .unwrap_or(WRITING_SYSTEM_PROMPT)
}

/// Name of the reserved compression tool offered to the model.
pub const COMPRESS_CONTEXT_TOOL: &str = "compress_context";

/// Manifest entry for the reserved compression tool. The dispatcher handles
/// it directly; it never reaches the tool registry.
pub fn compress_context_definition() -> quill_core::ToolDefinition {
    quill_core::ToolDefinition {
        name: COMPRESS_CONTEXT_TOOL.into(),
        description: "Compresses the conversation history by summarizing older messages. \
                      Use this when the conversation is getting long; it also runs automatically \
                      near the token limit."
            .into(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_mentions_tools() {
        assert!(WRITING_SYSTEM_PROMPT.contains("create_project"));
        assert!(WRITING_SYSTEM_PROMPT.contains("compress_context"));
    }

    #[test]
    fn override_replaces_default_prompt() {
        let mut config = quill_config::AppConfig::default();
        assert_eq!(system_prompt(&config), WRITING_SYSTEM_PROMPT);
        config.agent.system_prompt_override = Some("Write haiku only.".into());
        assert_eq!(system_prompt(&config), "Write haiku only.");
    }

    #[test]
    fn compress_definition_has_no_parameters() {
        let def = compress_context_definition();
        assert_eq!(def.name, "compress_context");
        assert_eq!(def.parameters["properties"], serde_json::json!({}));
    }
}
