//! # Quill Core
//!
//! Domain types, traits, and error definitions for the Quill writing agent.
//! Every other crate in the workspace depends inward on this one.
//!
//! - [`message`]: the one canonical conversation turn shape
//! - [`provider`]: the model boundary (completion, delta streaming, token counting)
//! - [`tool`]: capabilities the dispatcher can invoke by name

pub mod error;
pub mod event;
pub mod message;
pub mod provider;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{ProviderError, ToolError};
pub use event::{DomainEvent, EventBus};
pub use message::{Message, MessageToolCall, Role};
pub use provider::{
    Provider, ProviderRequest, ProviderResponse, StreamDelta, TokenCountRequest, ToolCallDelta,
    ToolChoice, ToolDefinition,
};
pub use tool::{ProjectContext, Tool, ToolArguments, ToolRegistry};
