//! OpenAI-compatible provider implementation.
//!
//! Works with Moonshot (Kimi), OpenAI and any endpoint exposing
//! `/chat/completions` in the OpenAI wire format.
//!
//! Supports:
//! - Chat completions (non-streaming and streaming SSE)
//! - Tool use / function calling
//! - Hidden reasoning (`reasoning_content`) in both directions
//! - Token estimation via `/tokenizers/estimate-token-count`
//!
//! Streaming forwards each SSE chunk as a raw [`StreamDelta`]; assembling
//! the fragments into a turn is the caller's job.

use async_trait::async_trait;
use futures::StreamExt;
use quill_core::error::ProviderError;
use quill_core::message::{Message, MessageToolCall, Role};
use quill_core::provider::*;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// An OpenAI-compatible model provider.
pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    /// Create a new OpenAI-compatible provider.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        // No total request timeout: a streamed thinking turn can legitimately
        // run for minutes. Callers bound their own calls.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "Falling back to default HTTP client");
                reqwest::Client::new()
            });

        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
        }
    }

    /// Create a Moonshot provider (convenience constructor).
    pub fn moonshot(api_key: impl Into<String>) -> Self {
        Self::new("moonshot", "https://api.moonshot.ai/v1", api_key)
    }

    /// Create an OpenAI provider (convenience constructor).
    pub fn openai(api_key: impl Into<String>) -> Self {
        Self::new("openai", "https://api.openai.com/v1", api_key)
    }

    /// Convert our Message types to OpenAI API format.
    fn to_api_messages(messages: &[Message]) -> Vec<ApiMessage> {
        messages
            .iter()
            .map(|m| ApiMessage {
                role: m.role.as_str().into(),
                content: m.content.clone(),
                reasoning_content: m.reasoning.clone(),
                tool_calls: if m.tool_calls.is_empty() {
                    None
                } else {
                    Some(
                        m.tool_calls
                            .iter()
                            .map(|tc| ApiToolCall {
                                id: tc.id.clone(),
                                r#type: "function".into(),
                                function: ApiFunction {
                                    name: tc.name.clone(),
                                    arguments: tc.arguments.clone(),
                                },
                            })
                            .collect(),
                    )
                },
                tool_call_id: m.tool_call_id.clone(),
                name: m.name.clone(),
            })
            .collect()
    }

    /// Convert tool definitions to OpenAI API format.
    fn to_api_tools(tools: &[ToolDefinition]) -> Vec<ApiToolDefinition> {
        tools
            .iter()
            .map(|t| ApiToolDefinition {
                r#type: "function".into(),
                function: ApiToolFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                },
            })
            .collect()
    }

    fn request_body(request: &ProviderRequest, stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": Self::to_api_messages(&request.messages),
            "temperature": request.temperature,
            "stream": stream,
        });

        if stream {
            body["stream_options"] = serde_json::json!({ "include_usage": true });
        }

        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }

        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(Self::to_api_tools(&request.tools));
            body["tool_choice"] = serde_json::json!(request.tool_choice);
        }

        body
    }

    /// POST `body` to `path` and map non-success statuses to provider errors.
    async fn post(
        &self,
        path: &str,
        body: &serde_json::Value,
        event_stream: bool,
    ) -> std::result::Result<reqwest::Response, ProviderError> {
        let url = format!("{}{}", self.base_url, path);

        let mut builder = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json");
        if event_stream {
            builder = builder.header("Accept", "text/event-stream");
        }

        let response = builder.json(body).send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout(e.to_string())
            } else {
                ProviderError::Network(e.to_string())
            }
        })?;

        let status = response.status().as_u16();

        if status == 429 {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(5);
            return Err(ProviderError::RateLimited { retry_after_secs });
        }

        if status == 401 || status == 403 {
            return Err(ProviderError::AuthenticationFailed(
                "Invalid API key or insufficient permissions".into(),
            ));
        }

        if status != 200 {
            let error_body = response.text().await.unwrap_or_default();
            warn!(status, body = %error_body, path, "Provider returned error");
            return Err(ProviderError::ApiError {
                status_code: status,
                message: error_body,
            });
        }

        Ok(response)
    }
}

#[async_trait]
impl quill_core::Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        request: ProviderRequest,
    ) -> std::result::Result<ProviderResponse, ProviderError> {
        let body = Self::request_body(&request, false);

        debug!(provider = %self.name, model = %request.model, "Sending completion request");

        let response = self.post("/chat/completions", &body, false).await?;

        let api_response: ApiResponse =
            response.json().await.map_err(|e| ProviderError::ApiError {
                status_code: 200,
                message: format!("Failed to parse response: {e}"),
            })?;

        let choice =
            api_response
                .choices
                .into_iter()
                .next()
                .ok_or_else(|| ProviderError::ApiError {
                    status_code: 200,
                    message: "No choices in response".into(),
                })?;

        let tool_calls: Vec<MessageToolCall> = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| MessageToolCall::new(tc.id, tc.function.name, tc.function.arguments))
            .collect();

        let message = Message::assistant_with_tools(
            choice.message.content,
            choice.message.reasoning_content,
            tool_calls,
        );

        let usage = api_response.usage.map(Usage::from);

        Ok(ProviderResponse {
            message,
            usage,
            model: api_response.model,
        })
    }

    async fn stream(
        &self,
        request: ProviderRequest,
    ) -> std::result::Result<
        tokio::sync::mpsc::Receiver<std::result::Result<StreamDelta, ProviderError>>,
        ProviderError,
    > {
        let body = Self::request_body(&request, true);

        debug!(provider = %self.name, model = %request.model, "Sending streaming request");

        let response = self.post("/chat/completions", &body, true).await?;

        let (tx, rx) = tokio::sync::mpsc::channel(64);
        let provider_name = self.name.clone();

        // Spawn task to read the SSE byte stream and forward deltas
        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut lines = SseLineBuffer::default();

            while let Some(chunk_result) = byte_stream.next().await {
                let bytes = match chunk_result {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx
                            .send(Err(ProviderError::StreamInterrupted(e.to_string())))
                            .await;
                        return;
                    }
                };

                for line in lines.push(&String::from_utf8_lossy(&bytes)) {
                    match parse_sse_line(&line) {
                        SseLine::Done => return,
                        SseLine::Delta(delta) => {
                            if tx.send(Ok(delta)).await.is_err() {
                                return; // receiver dropped
                            }
                        }
                        SseLine::Skip => {}
                        SseLine::Malformed(e) => {
                            trace!(
                                provider = %provider_name,
                                line = %line,
                                error = %e,
                                "Ignoring unparseable SSE chunk"
                            );
                        }
                    }
                }
            }

            // Stream ended without [DONE]; the channel closing is the signal.
            debug!(provider = %provider_name, "SSE stream closed without [DONE]");
        });

        Ok(rx)
    }

    async fn count_tokens(
        &self,
        request: TokenCountRequest,
    ) -> std::result::Result<u64, ProviderError> {
        let body = serde_json::json!({
            "model": request.model,
            "messages": request.messages,
        });

        trace!(provider = %self.name, messages = request.messages.len(), "Estimating tokens");

        let response = self
            .post("/tokenizers/estimate-token-count", &body, false)
            .await?;

        let estimate: TokenEstimateResponse =
            response.json().await.map_err(|e| ProviderError::ApiError {
                status_code: 200,
                message: format!("Failed to parse token estimate: {e}"),
            })?;

        Ok(estimate.data.total_tokens)
    }
}

// --- SSE parsing ---

/// Splits an SSE byte stream into complete lines, holding back a trailing
/// partial line until the rest of it arrives.
#[derive(Debug, Default)]
struct SseLineBuffer {
    buffer: String,
}

impl SseLineBuffer {
    fn push(&mut self, text: &str) -> Vec<String> {
        self.buffer.push_str(text);
        let mut lines = Vec::new();
        while let Some(line_end) = self.buffer.find('\n') {
            let line = self.buffer[..line_end].trim_end_matches('\r').to_string();
            self.buffer.drain(..=line_end);
            lines.push(line);
        }
        lines
    }
}

#[derive(Debug)]
enum SseLine {
    /// `data: [DONE]`
    Done,
    Delta(StreamDelta),
    /// Blank lines, comments, non-data fields and empty deltas
    Skip,
    Malformed(serde_json::Error),
}

fn parse_sse_line(line: &str) -> SseLine {
    if line.is_empty() || line.starts_with(':') {
        return SseLine::Skip;
    }

    let Some(data) = line.strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.trim();

    if data == "[DONE]" {
        return SseLine::Done;
    }

    match serde_json::from_str::<StreamResponse>(data) {
        Ok(chunk) => match chunk.into_delta() {
            Some(delta) => SseLine::Delta(delta),
            None => SseLine::Skip,
        },
        Err(e) => SseLine::Malformed(e),
    }
}

fn parse_role(role: &str) -> Option<Role> {
    match role {
        "system" => Some(Role::System),
        "user" => Some(Role::User),
        "assistant" => Some(Role::Assistant),
        "tool" => Some(Role::Tool),
        _ => None,
    }
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reasoning_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolCall {
    id: String,
    r#type: String,
    function: ApiFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolDefinition {
    r#type: String,
    function: ApiToolFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    model: String,
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

impl From<ApiUsage> for Usage {
    fn from(u: ApiUsage) -> Self {
        Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenEstimateResponse {
    data: TokenEstimateData,
}

#[derive(Debug, Deserialize)]
struct TokenEstimateData {
    total_tokens: u64,
}

// --- Streaming SSE types ---

/// A single SSE `data: {...}` chunk from a streaming response.
#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

impl StreamResponse {
    /// Flatten the first choice (and any usage) into a core delta.
    /// Returns `None` when the chunk carries nothing.
    fn into_delta(self) -> Option<StreamDelta> {
        let mut delta = StreamDelta {
            usage: self.usage.map(Usage::from),
            ..StreamDelta::default()
        };

        if let Some(choice) = self.choices.into_iter().next() {
            let d = choice.delta;
            delta.role = d.role.as_deref().and_then(parse_role);
            delta.content = d.content.filter(|c| !c.is_empty());
            delta.reasoning = d.reasoning_content.filter(|c| !c.is_empty());
            delta.finish_reason = choice.finish_reason;
            delta.tool_calls = d
                .tool_calls
                .unwrap_or_default()
                .into_iter()
                .map(|tc| {
                    let (name, arguments) = match tc.function {
                        Some(f) => (f.name, f.arguments),
                        None => (None, None),
                    };
                    ToolCallDelta {
                        index: tc.index,
                        id: tc.id,
                        name,
                        arguments,
                    }
                })
                .collect();
        }

        let empty = delta.role.is_none()
            && delta.content.is_none()
            && delta.reasoning.is_none()
            && delta.tool_calls.is_empty()
            && delta.finish_reason.is_none()
            && delta.usage.is_none();

        (!empty).then_some(delta)
    }
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: ApiStreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiStreamDelta {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

/// A tool call delta; arrives incrementally across chunks.
#[derive(Debug, Deserialize)]
struct StreamToolCallDelta {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_core::Provider;

    #[test]
    fn moonshot_constructor() {
        let provider = OpenAiCompatProvider::moonshot("sk-test");
        assert_eq!(provider.name(), "moonshot");
        assert_eq!(provider.base_url, "https://api.moonshot.ai/v1");
    }

    #[test]
    fn base_url_trailing_slash_trimmed() {
        let provider = OpenAiCompatProvider::new("custom", "http://localhost:8000/v1/", "k");
        assert_eq!(provider.base_url, "http://localhost:8000/v1");
    }

    #[test]
    fn message_conversion() {
        let messages = vec![Message::system("You are helpful"), Message::user("Hello")];
        let api_messages = OpenAiCompatProvider::to_api_messages(&messages);
        assert_eq!(api_messages.len(), 2);
        assert_eq!(api_messages[0].role, "system");
        assert_eq!(api_messages[1].role, "user");
    }

    #[test]
    fn assistant_reasoning_is_sent_back() {
        let msg = Message::assistant_with_tools(
            None,
            Some("plan the outline".into()),
            vec![MessageToolCall::new("call_1", "create_project", r#"{"project_name":"x"}"#)],
        );
        let api_msgs = OpenAiCompatProvider::to_api_messages(&[msg]);
        let json = serde_json::to_value(&api_msgs[0]).unwrap();
        assert_eq!(json["reasoning_content"], "plan the outline");
        assert!(json.get("content").is_none());
        assert_eq!(json["tool_calls"][0]["function"]["name"], "create_project");
    }

    #[test]
    fn message_conversion_tool_response() {
        let msg = Message::tool_result("call_1", "write_file", "ok");
        let api_msgs = OpenAiCompatProvider::to_api_messages(&[msg]);
        assert_eq!(api_msgs[0].role, "tool");
        assert_eq!(api_msgs[0].tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(api_msgs[0].name.as_deref(), Some("write_file"));
    }

    #[test]
    fn tool_definition_conversion() {
        let tools = vec![ToolDefinition {
            name: "write_file".into(),
            description: "Write a markdown file".into(),
            parameters: serde_json::json!({"type": "object"}),
        }];
        let api_tools = OpenAiCompatProvider::to_api_tools(&tools);
        assert_eq!(api_tools.len(), 1);
        assert_eq!(api_tools[0].function.name, "write_file");
        assert_eq!(api_tools[0].r#type, "function");
    }

    #[test]
    fn request_body_includes_tool_choice_only_with_tools() {
        let mut req = ProviderRequest::simple("kimi-k2-thinking", vec![Message::user("hi")]);
        let body = OpenAiCompatProvider::request_body(&req, true);
        assert!(body.get("tools").is_none());
        assert!(body.get("tool_choice").is_none());
        assert_eq!(body["stream_options"]["include_usage"], true);

        req.tools.push(ToolDefinition {
            name: "write_file".into(),
            description: "d".into(),
            parameters: serde_json::json!({"type": "object"}),
        });
        req.max_tokens = Some(1024);
        let body = OpenAiCompatProvider::request_body(&req, false);
        assert_eq!(body["tool_choice"], "auto");
        assert_eq!(body["max_tokens"], 1024);
        assert!(body.get("stream_options").is_none());
    }

    // --- SSE parsing tests ---

    #[test]
    fn line_buffer_holds_partial_lines() {
        let mut buf = SseLineBuffer::default();
        assert!(buf.push("data: {\"cho").is_empty());
        let lines = buf.push("ices\":[]}\r\n\ndata: [DO");
        assert_eq!(lines, vec!["data: {\"choices\":[]}".to_string(), String::new()]);
        assert_eq!(buf.push("NE]\n"), vec!["data: [DONE]".to_string()]);
    }

    #[test]
    fn parse_content_delta() {
        let line = r#"data: {"choices":[{"delta":{"role":"assistant","content":"Hello"},"finish_reason":null}]}"#;
        let SseLine::Delta(delta) = parse_sse_line(line) else {
            panic!("expected delta");
        };
        assert_eq!(delta.role, Some(Role::Assistant));
        assert_eq!(delta.content.as_deref(), Some("Hello"));
        assert!(delta.finish_reason.is_none());
    }

    #[test]
    fn parse_reasoning_delta() {
        let line = r#"data: {"choices":[{"delta":{"reasoning_content":"Let me think"}}]}"#;
        let SseLine::Delta(delta) = parse_sse_line(line) else {
            panic!("expected delta");
        };
        assert_eq!(delta.reasoning.as_deref(), Some("Let me think"));
        assert!(delta.content.is_none());
    }

    #[test]
    fn parse_tool_call_fragments() {
        let line = r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_abc","function":{"name":"write_file","arguments":""}},{"index":1,"function":{"arguments":"{\"file"}}]}}]}"#;
        let SseLine::Delta(delta) = parse_sse_line(line) else {
            panic!("expected delta");
        };
        assert_eq!(delta.tool_calls.len(), 2);
        assert_eq!(delta.tool_calls[0].id.as_deref(), Some("call_abc"));
        assert_eq!(delta.tool_calls[0].name.as_deref(), Some("write_file"));
        assert_eq!(delta.tool_calls[1].index, 1);
        assert!(delta.tool_calls[1].id.is_none());
        assert_eq!(delta.tool_calls[1].arguments.as_deref(), Some("{\"file"));
    }

    #[test]
    fn parse_finish_and_usage() {
        let finish = r#"data: {"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#;
        let SseLine::Delta(delta) = parse_sse_line(finish) else {
            panic!("expected delta");
        };
        assert_eq!(delta.finish_reason.as_deref(), Some("tool_calls"));

        let usage = r#"data: {"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}"#;
        let SseLine::Delta(delta) = parse_sse_line(usage) else {
            panic!("expected delta");
        };
        assert_eq!(delta.usage.unwrap().total_tokens, 15);
    }

    #[test]
    fn empty_and_control_lines_are_skipped() {
        assert!(matches!(parse_sse_line(""), SseLine::Skip));
        assert!(matches!(parse_sse_line(": keep-alive"), SseLine::Skip));
        assert!(matches!(parse_sse_line("event: ping"), SseLine::Skip));
        assert!(matches!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"content":""}}]}"#),
            SseLine::Skip
        ));
        assert!(matches!(parse_sse_line("data: [DONE]"), SseLine::Done));
        assert!(matches!(parse_sse_line("data: {oops"), SseLine::Malformed(_)));
    }

    #[test]
    fn parse_token_estimate() {
        let data = r#"{"code":0,"data":{"total_tokens":18342},"scode":"0x0","status":true}"#;
        let parsed: TokenEstimateResponse = serde_json::from_str(data).unwrap();
        assert_eq!(parsed.data.total_tokens, 18342);
    }

    #[test]
    fn parse_completion_with_reasoning() {
        let data = r#"{
            "model": "kimi-k2-thinking",
            "choices": [{"message": {"role": "assistant", "content": "Summary text", "reasoning_content": "hmm"}}],
            "usage": {"prompt_tokens": 8, "completion_tokens": 2, "total_tokens": 10}
        }"#;
        let parsed: ApiResponse = serde_json::from_str(data).unwrap();
        assert_eq!(parsed.choices[0].message.content.as_deref(), Some("Summary text"));
        assert_eq!(parsed.choices[0].message.reasoning_content.as_deref(), Some("hmm"));
        assert_eq!(parsed.usage.unwrap().total_tokens, 10);
    }
}
