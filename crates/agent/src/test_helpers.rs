//! Shared test helpers for agent tests.

use async_trait::async_trait;
use quill_core::error::{ProviderError, ToolError};
use quill_core::message::Message;
use quill_core::provider::{
    Provider, ProviderRequest, ProviderResponse, StreamDelta, TokenCountRequest, ToolCallDelta,
};
use quill_core::tool::{ProjectContext, Tool, ToolArguments};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

/// What one `stream` call does.
pub enum ScriptedTurn {
    /// Deliver these deltas, then close the stream.
    Deltas(Vec<StreamDelta>),
    /// Deliver these deltas, then fail mid-stream.
    Interrupted(Vec<StreamDelta>, ProviderError),
    /// Fail before any delta.
    Fail(ProviderError),
    /// Never deliver anything and never close.
    Hang,
    /// Panic inside the provider.
    Panic,
}

/// A mock provider driven by scripts.
///
/// `stream` pops the next [`ScriptedTurn`]; an exhausted script is a
/// `NotConfigured` error. `complete` (used for summaries) pops the next
/// summary; an exhausted queue is an API error.
pub struct ScriptedProvider {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    summaries: Mutex<VecDeque<Result<String, ProviderError>>>,
    token_counts: Mutex<VecDeque<Result<u64, ProviderError>>>,
    summary_delay: Option<Duration>,
    stream_requests: Mutex<Vec<ProviderRequest>>,
    summary_requests: Mutex<Vec<ProviderRequest>>,
    token_requests: Mutex<Vec<TokenCountRequest>>,
    hung: Mutex<Vec<mpsc::Sender<Result<StreamDelta, ProviderError>>>>,
}

impl ScriptedProvider {
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            summaries: Mutex::new(VecDeque::new()),
            token_counts: Mutex::new(VecDeque::new()),
            summary_delay: None,
            stream_requests: Mutex::new(Vec::new()),
            summary_requests: Mutex::new(Vec::new()),
            token_requests: Mutex::new(Vec::new()),
            hung: Mutex::new(Vec::new()),
        }
    }

    pub fn with_summaries(summaries: Vec<&str>) -> Self {
        Self::new(vec![]).summaries(summaries)
    }

    /// Every summary request fails.
    pub fn failing_summaries() -> Self {
        Self::new(vec![])
    }

    pub fn summaries(self, summaries: Vec<&str>) -> Self {
        *self.summaries.lock().unwrap() =
            summaries.into_iter().map(|s| Ok(s.to_string())).collect();
        self
    }

    pub fn token_counts(self, counts: Vec<Result<u64, ProviderError>>) -> Self {
        *self.token_counts.lock().unwrap() = counts.into();
        self
    }

    pub fn with_summary_delay(mut self, delay: Duration) -> Self {
        self.summary_delay = Some(delay);
        self
    }

    pub fn stream_requests(&self) -> Vec<ProviderRequest> {
        self.stream_requests.lock().unwrap().clone()
    }

    pub fn summary_requests(&self) -> Vec<ProviderRequest> {
        self.summary_requests.lock().unwrap().clone()
    }

    pub fn token_requests(&self) -> Vec<TokenCountRequest> {
        self.token_requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        self.summary_requests.lock().unwrap().push(request);
        if let Some(delay) = self.summary_delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.summaries.lock().unwrap().pop_front();
        let summary = next.unwrap_or(Err(ProviderError::ApiError {
            status_code: 500,
            message: "no scripted summary".into(),
        }))?;
        Ok(ProviderResponse {
            message: Message::assistant(summary),
            usage: None,
            model: "mock".into(),
        })
    }

    async fn stream(
        &self,
        request: ProviderRequest,
    ) -> Result<mpsc::Receiver<Result<StreamDelta, ProviderError>>, ProviderError> {
        self.stream_requests.lock().unwrap().push(request);
        let turn = self.turns.lock().unwrap().pop_front();
        let (tx, rx) = mpsc::channel(256);
        match turn {
            None => Err(ProviderError::NotConfigured("script exhausted".into())),
            Some(ScriptedTurn::Fail(e)) => Err(e),
            Some(ScriptedTurn::Panic) => panic!("scripted provider panic"),
            Some(ScriptedTurn::Hang) => {
                self.hung.lock().unwrap().push(tx);
                Ok(rx)
            }
            Some(ScriptedTurn::Deltas(deltas)) => {
                for delta in deltas {
                    let _ = tx.send(Ok(delta)).await;
                }
                Ok(rx)
            }
            Some(ScriptedTurn::Interrupted(deltas, e)) => {
                for delta in deltas {
                    let _ = tx.send(Ok(delta)).await;
                }
                let _ = tx.send(Err(e)).await;
                Ok(rx)
            }
        }
    }

    async fn count_tokens(&self, request: TokenCountRequest) -> Result<u64, ProviderError> {
        self.token_requests.lock().unwrap().push(request);
        self.token_counts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(ProviderError::NotConfigured("no scripted count".into())))
    }
}

/// A turn that streams `text` in two fragments and requests no tools.
pub fn text_turn(text: &str) -> ScriptedTurn {
    let mid = text.char_indices().nth(text.chars().count() / 2).map_or(0, |(i, _)| i);
    ScriptedTurn::Deltas(vec![
        StreamDelta::reasoning("thinking"),
        StreamDelta::text(&text[..mid]),
        StreamDelta::text(&text[mid..]),
    ])
}

/// A turn requesting the given `(id, name, arguments)` calls, each call's
/// argument text split across two fragments.
pub fn tool_turn(calls: &[(&str, &str, &str)]) -> ScriptedTurn {
    let mut deltas = vec![StreamDelta::text("Working on it.")];
    for (index, (id, name, args)) in calls.iter().enumerate() {
        let mut mid = args.len() / 2;
        while !args.is_char_boundary(mid) {
            mid += 1;
        }
        let (head, tail) = args.split_at(mid);
        deltas.push(StreamDelta::tool_call(ToolCallDelta {
            index,
            id: Some(id.to_string()),
            name: Some(name.to_string()),
            arguments: Some(head.to_string()),
        }));
        deltas.push(StreamDelta::tool_call(ToolCallDelta {
            index,
            arguments: Some(tail.to_string()),
            ..Default::default()
        }));
    }
    ScriptedTurn::Deltas(deltas)
}

/// A tool that reports its own name and arguments.
pub struct RecordingTool {
    name: String,
    output: Option<String>,
}

impl RecordingTool {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            output: None,
        }
    }

    pub fn with_output(name: &str, output: String) -> Self {
        Self {
            name: name.into(),
            output: Some(output),
        }
    }
}

#[async_trait]
impl Tool for RecordingTool {
    fn name(&self) -> &str {
        &self.name
    }
    fn description(&self) -> &str {
        "Records its arguments"
    }
    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object", "properties": {} })
    }
    async fn execute(
        &self,
        arguments: ToolArguments,
        _project: &mut ProjectContext,
    ) -> Result<String, ToolError> {
        Ok(self.output.clone().unwrap_or_else(|| {
            format!("{} ran with {}", self.name, serde_json::Value::Object(arguments))
        }))
    }
}

/// A tool that always fails.
pub struct FailingTool;

#[async_trait]
impl Tool for FailingTool {
    fn name(&self) -> &str {
        "always_fails"
    }
    fn description(&self) -> &str {
        "Always fails"
    }
    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object", "properties": {} })
    }
    async fn execute(
        &self,
        _arguments: ToolArguments,
        _project: &mut ProjectContext,
    ) -> Result<String, ToolError> {
        Err(ToolError::ExecutionFailed {
            tool_name: "always_fails".into(),
            reason: "disk on fire".into(),
        })
    }
}
