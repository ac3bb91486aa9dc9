//! Model endpoint contract and adapters.
//!
//! One `ModelEndpoint` implementation exists per provider *family*
//! (OpenAI-compatible chat, completion, embeddings) rather than per hosted
//! provider.  Adapters own streaming delta parsing, tool-call extraction,
//! bounded retry with jittered backoff, and per-adapter rate limiting.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;

mod limiter;
mod openai;
mod router;
pub mod testing;

pub use limiter::RateLimiter;
pub use openai::OpenAiCompatEndpoint;
pub use router::EndpointRouter;

// ── Chat message types ───────────────────────────────────────────────────────

/// Role in a chat conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A single message in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: Option<String>,
    /// Tool calls requested by the assistant (assistant messages only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// When role == Tool, identifies which tool call this result answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: ChatRole::System, content: Some(content.into()), tool_calls: vec![], tool_call_id: None }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: Some(content.into()), tool_calls: vec![], tool_call_id: None }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: ChatRole::Assistant, content: Some(content.into()), tool_calls: vec![], tool_call_id: None }
    }
    pub fn assistant_tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self { role: ChatRole::Assistant, content: None, tool_calls, tool_call_id: None }
    }
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Tool,
            content: Some(content.into()),
            tool_calls: vec![],
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

/// A tool call requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique ID correlating the call with its tool-role result message.
    #[serde(default)]
    pub id: String,
    #[serde(default = "default_tool_call_type", rename = "type")]
    pub kind: String,
    pub function: ToolCallFunction,
}

fn default_tool_call_type() -> String {
    "function".to_string()
}

/// Function name and arguments within a tool call.
///
/// Arguments arrive as a JSON string from OpenAI-compatible APIs; adapters
/// normalize to a parsed `Value` for downstream consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallFunction {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// Tool-choice directive passed through to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolChoice {
    #[default]
    Auto,
    None,
}

impl ToolChoice {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::None => "none",
        }
    }
}

/// Response from a chat call.
#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    /// Assistant text (may be empty when tool_calls are present).
    pub content: String,
    /// Tool calls the model wants made (empty for a plain text response).
    pub tool_calls: Vec<ToolCall>,
    /// "stop", "tool_calls", "length", "error".
    pub finish_reason: String,
}

impl ChatResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self { content: content.into(), tool_calls: vec![], finish_reason: "stop".to_string() }
    }

    pub fn with_tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self { content: String::new(), tool_calls, finish_reason: "tool_calls".to_string() }
    }
}

// ── Endpoint contract ────────────────────────────────────────────────────────

/// One invocation surface per provider family.
///
/// Every method is a suspension point; implementations must not hold locks
/// across the underlying request.
#[async_trait]
pub trait ModelEndpoint: Send + Sync {
    /// Model identifier this endpoint is bound to.
    fn model(&self) -> &str;

    /// Context window, in tokens.  Drives observation compression upstream.
    fn context_tokens(&self) -> usize {
        128_000
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: Option<&serde_json::Value>,
        tool_choice: ToolChoice,
    ) -> Result<ChatResponse>;

    /// Streaming chat: text deltas are forwarded on `tx` as they arrive;
    /// the full accumulated response is returned at the end.
    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        tools: Option<&serde_json::Value>,
        tool_choice: ToolChoice,
        tx: mpsc::Sender<String>,
    ) -> Result<ChatResponse>;

    /// Bare completion (no chat framing).
    async fn complete(&self, prompt: &str) -> Result<String>;

    /// Embedding generation for a batch of texts.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Serialize messages into the OpenAI-compatible wire shape.
pub(crate) fn messages_to_wire(messages: &[ChatMessage]) -> Vec<serde_json::Value> {
    messages
        .iter()
        .map(|m| {
            let role = match m.role {
                ChatRole::System => "system",
                ChatRole::User => "user",
                ChatRole::Assistant => "assistant",
                ChatRole::Tool => "tool",
            };
            let mut msg = json!({ "role": role });
            if let Some(ref content) = m.content {
                msg["content"] = json!(content);
            }
            if !m.tool_calls.is_empty() {
                let calls: Vec<serde_json::Value> = m
                    .tool_calls
                    .iter()
                    .map(|tc| {
                        json!({
                            "id": tc.id,
                            "type": tc.kind,
                            "function": {
                                "name": tc.function.name,
                                // OpenAI-compatible APIs expect a JSON string here.
                                "arguments": tc.function.arguments.to_string(),
                            }
                        })
                    })
                    .collect();
                msg["tool_calls"] = json!(calls);
            }
            if let Some(ref id) = m.tool_call_id {
                msg["tool_call_id"] = json!(id);
            }
            msg
        })
        .collect()
}
