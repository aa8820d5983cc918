//! Provider trait: the abstraction over the model backend.
//!
//! A Provider knows how to send a conversation to a model and get a response
//! back, either as a complete message or as a sequence of incremental deltas.
//! It can also (optionally) count the tokens a history would occupy.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use crate::error::ProviderError;
use crate::message::{Message, MessageToolCall, Role};

/// How the model may pick tools.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoice {
    /// Model decides whether to call tools
    #[default]
    Auto,
    /// Model must not call tools
    None,
}

/// Configuration for a provider request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequest {
    /// The model to use (e.g., "kimi-k2-thinking")
    pub model: String,

    /// The conversation messages
    pub messages: Vec<Message>,

    /// Temperature (0.0 = deterministic, 1.0 = creative)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Available tools the model can call
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,

    /// Tool invocation mode
    #[serde(default)]
    pub tool_choice: ToolChoice,

    /// Whether to stream the response
    #[serde(default)]
    pub stream: bool,
}

fn default_temperature() -> f32 {
    0.7
}

impl ProviderRequest {
    /// A plain, non-streaming request without tools.
    pub fn simple(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: default_temperature(),
            max_tokens: None,
            tools: Vec::new(),
            tool_choice: ToolChoice::Auto,
            stream: false,
        }
    }
}

/// A tool definition sent to the model so it knows what tools it can call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The tool name
    pub name: String,

    /// Description of what the tool does
    pub description: String,

    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

/// A complete (non-streaming) response from a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// The generated message
    pub message: Message,

    /// Token usage statistics
    pub usage: Option<Usage>,

    /// Which model actually responded (may differ from requested)
    pub model: String,
}

/// Token usage information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// One incremental update from a streaming response.
///
/// Every field is optional: the role usually arrives only on the first
/// delta, and text, reasoning and tool call fragments interleave freely.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,

    /// Visible text fragment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    /// Hidden reasoning fragment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,

    /// Tool call fragments, each addressed by index
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallDelta>,

    /// Set on the last delta of a choice
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,

    /// Usage info (typically only on the final delta)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl StreamDelta {
    /// A delta carrying only a visible text fragment.
    pub fn text(fragment: impl Into<String>) -> Self {
        Self {
            content: Some(fragment.into()),
            ..Self::default()
        }
    }

    /// A delta carrying only a hidden reasoning fragment.
    pub fn reasoning(fragment: impl Into<String>) -> Self {
        Self {
            reasoning: Some(fragment.into()),
            ..Self::default()
        }
    }

    /// A delta carrying a single tool call fragment.
    pub fn tool_call(fragment: ToolCallDelta) -> Self {
        Self {
            tool_calls: vec![fragment],
            ..Self::default()
        }
    }
}

/// A fragment of one in-progress tool call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolCallDelta {
    /// Which in-progress call this fragment belongs to
    pub index: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Increment of the raw argument text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

/// A message reduced to the fields a token estimator accepts.
///
/// Hidden reasoning is stripped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimateMessage {
    pub role: Role,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<MessageToolCall>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl From<&Message> for EstimateMessage {
    fn from(m: &Message) -> Self {
        Self {
            role: m.role,
            content: m.content.clone().filter(|c| !c.is_empty()),
            name: m.name.clone(),
            tool_calls: m.tool_calls.clone(),
            tool_call_id: m.tool_call_id.clone(),
        }
    }
}

/// A token counting request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenCountRequest {
    pub model: String,
    pub messages: Vec<EstimateMessage>,
}

impl TokenCountRequest {
    pub fn new(model: impl Into<String>, messages: &[Message]) -> Self {
        Self {
            model: model.into(),
            messages: messages.iter().map(EstimateMessage::from).collect(),
        }
    }
}

/// The core Provider trait.
///
/// The agent loop calls `stream()` for its main turns, `complete()` for
/// summaries and `count_tokens()` for budget checks, without knowing which
/// backend is in use.
#[async_trait]
pub trait Provider: Send + Sync {
    /// A human-readable name for this provider (e.g., "moonshot").
    fn name(&self) -> &str;

    /// Send a request and get a complete response.
    async fn complete(&self, request: ProviderRequest) -> std::result::Result<ProviderResponse, ProviderError>;

    /// Send a request and get a stream of response deltas.
    ///
    /// Default implementation calls `complete()` and replays the result as
    /// a single delta.
    async fn stream(
        &self,
        request: ProviderRequest,
    ) -> std::result::Result<
        tokio::sync::mpsc::Receiver<std::result::Result<StreamDelta, ProviderError>>,
        ProviderError,
    > {
        let response = self.complete(request).await?;
        let message = response.message;
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        let _ = tx
            .send(Ok(StreamDelta {
                role: Some(message.role),
                content: message.content,
                reasoning: message.reasoning,
                tool_calls: message
                    .tool_calls
                    .into_iter()
                    .enumerate()
                    .map(|(index, tc)| ToolCallDelta {
                        index,
                        id: Some(tc.id),
                        name: Some(tc.name),
                        arguments: Some(tc.arguments),
                    })
                    .collect(),
                finish_reason: Some("stop".into()),
                usage: response.usage,
            }))
            .await;
        Ok(rx)
    }

    /// Count the tokens the given history would occupy for a model.
    ///
    /// Default implementation returns an error indicating counting isn't supported.
    async fn count_tokens(
        &self,
        _request: TokenCountRequest,
    ) -> std::result::Result<u64, ProviderError> {
        Err(ProviderError::NotConfigured(format!(
            "Provider '{}' does not support token counting",
            self.name()
        )))
    }
}
