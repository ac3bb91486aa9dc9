//! Deterministic endpoint doubles for tests across the workspace.

use std::collections::VecDeque;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use crate::{ChatMessage, ChatResponse, ModelEndpoint, ToolChoice};

/// Dimension of the deterministic test embeddings.
pub const TEST_EMBED_DIM: usize = 32;

/// A scripted model endpoint: queued responses are returned in order, and
/// every call is recorded for assertions.  When the queue runs dry a plain
/// "ok" text response is produced so loops always terminate.
pub struct ScriptedEndpoint {
    model: String,
    context_tokens: usize,
    responses: Mutex<VecDeque<ChatResponse>>,
    calls: Mutex<Vec<RecordedCall>>,
}

/// What the endpoint saw on one chat invocation.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub messages: Vec<ChatMessage>,
    pub had_tools: bool,
    pub tool_choice: ToolChoice,
}

impl ScriptedEndpoint {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            context_tokens: 128_000,
            responses: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_context_tokens(mut self, tokens: usize) -> Self {
        self.context_tokens = tokens;
        self
    }

    pub fn push_response(&self, response: ChatResponse) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn push_text(&self, content: impl Into<String>) {
        self.push_response(ChatResponse::text(content));
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn next_response(&self) -> ChatResponse {
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| ChatResponse::text("ok"))
    }

    fn record(&self, messages: &[ChatMessage], tools: Option<&serde_json::Value>, tool_choice: ToolChoice) {
        self.calls.lock().unwrap().push(RecordedCall {
            messages: messages.to_vec(),
            had_tools: tools.is_some(),
            tool_choice,
        });
    }
}

#[async_trait]
impl ModelEndpoint for ScriptedEndpoint {
    fn model(&self) -> &str {
        &self.model
    }

    fn context_tokens(&self) -> usize {
        self.context_tokens
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: Option<&serde_json::Value>,
        tool_choice: ToolChoice,
    ) -> Result<ChatResponse> {
        self.record(messages, tools, tool_choice);
        Ok(self.next_response())
    }

    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        tools: Option<&serde_json::Value>,
        tool_choice: ToolChoice,
        tx: mpsc::Sender<String>,
    ) -> Result<ChatResponse> {
        self.record(messages, tools, tool_choice);
        let response = self.next_response();
        // Stream the content word-by-word so consumers exercise delta paths.
        for word in response.content.split_inclusive(' ') {
            let _ = tx.send(word.to_string()).await;
        }
        Ok(response)
    }

    async fn complete(&self, _prompt: &str) -> Result<String> {
        Ok(self.next_response().content)
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| embed_text(t, TEST_EMBED_DIM)).collect())
    }
}

/// Deterministic bag-of-words embedding: each token hashes into one slot of
/// a fixed-dimension vector, which is then L2-normalized.  Similar texts get
/// similar vectors, and repeated calls are exactly reproducible, which is
/// what rank-stability tests need.
pub fn embed_text(text: &str, dim: usize) -> Vec<f32> {
    let mut vector = vec![0.0_f32; dim.max(1)];
    for token in text
        .split(|ch: char| !ch.is_alphanumeric())
        .filter(|t| t.len() >= 2)
        .map(str::to_lowercase)
    {
        let digest = Sha256::digest(token.as_bytes());
        let slot = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize % vector.len();
        vector[slot] += 1.0;
    }
    let magnitude: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if magnitude > 0.0 {
        for v in &mut vector {
            *v /= magnitude;
        }
    }
    vector
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_responses_pop_in_order() {
        let endpoint = ScriptedEndpoint::new("test");
        endpoint.push_text("first");
        endpoint.push_text("second");

        let a = endpoint.chat(&[], None, ToolChoice::Auto).await.unwrap();
        let b = endpoint.chat(&[], None, ToolChoice::Auto).await.unwrap();
        let c = endpoint.chat(&[], None, ToolChoice::Auto).await.unwrap();
        assert_eq!(a.content, "first");
        assert_eq!(b.content, "second");
        assert_eq!(c.content, "ok");
        assert_eq!(endpoint.call_count(), 3);
    }

    #[test]
    fn embeddings_are_deterministic_and_normalized() {
        let a = embed_text("rain in Madrid", TEST_EMBED_DIM);
        let b = embed_text("rain in Madrid", TEST_EMBED_DIM);
        assert_eq!(a, b);
        let magnitude: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((magnitude - 1.0).abs() < 1e-5);
    }

    #[test]
    fn similar_texts_score_higher_than_unrelated() {
        let query = embed_text("weather rain madrid", TEST_EMBED_DIM);
        let close = embed_text("rain forecast for madrid", TEST_EMBED_DIM);
        let far = embed_text("quarterly earnings report", TEST_EMBED_DIM);
        let dot = |a: &[f32], b: &[f32]| -> f32 { a.iter().zip(b).map(|(x, y)| x * y).sum() };
        assert!(dot(&query, &close) > dot(&query, &far));
    }
}
