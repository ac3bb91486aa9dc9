//! OpenAI-compatible REST adapter: chat, completion, and embedding families.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, instrument};

use anima_config::EndpointConfig;

use crate::limiter::{RateLimiter, with_retries};
use crate::{ChatMessage, ChatResponse, ModelEndpoint, ToolCall, ToolCallFunction, ToolChoice, messages_to_wire};

pub struct OpenAiCompatEndpoint {
    client: reqwest::Client,
    model: String,
    base_url: String,
    api_key: Option<String>,
    context_tokens: usize,
    limiter: RateLimiter,
}

impl OpenAiCompatEndpoint {
    pub fn new(model: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            model: model.into(),
            base_url: base_url.into(),
            api_key: None,
            context_tokens: 128_000,
            limiter: RateLimiter::new(0.0),
        }
    }

    pub fn from_config(cfg: &EndpointConfig) -> Self {
        let api_key = (!cfg.api_key_env.is_empty())
            .then(|| std::env::var(&cfg.api_key_env).ok())
            .flatten()
            .filter(|k| !k.trim().is_empty());
        Self {
            client: reqwest::Client::new(),
            model: cfg.name.clone(),
            base_url: cfg.base_url.clone(),
            api_key,
            context_tokens: cfg.context_tokens,
            limiter: RateLimiter::new(cfg.requests_per_second),
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_rate_limit(mut self, requests_per_second: f64) -> Self {
        self.limiter = RateLimiter::new(requests_per_second);
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url.trim_end_matches('/'))
    }

    fn request(&self, path: &str, payload: &serde_json::Value) -> reqwest::RequestBuilder {
        let mut req = self.client.post(self.endpoint(path)).json(payload);
        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key);
        }
        req
    }

    fn chat_payload(
        &self,
        messages: &[ChatMessage],
        tools: Option<&serde_json::Value>,
        tool_choice: ToolChoice,
        stream: bool,
    ) -> serde_json::Value {
        let mut payload = json!({
            "model": self.model,
            "messages": messages_to_wire(messages),
            "stream": stream,
        });
        if let Some(tools_val) = tools {
            payload["tools"] = tools_val.clone();
            payload["tool_choice"] = json!(tool_choice.as_str());
        }
        payload
    }
}

#[async_trait]
impl ModelEndpoint for OpenAiCompatEndpoint {
    fn model(&self) -> &str {
        &self.model
    }

    fn context_tokens(&self) -> usize {
        self.context_tokens
    }

    #[instrument(skip_all, fields(model = %self.model, messages = messages.len()))]
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: Option<&serde_json::Value>,
        tool_choice: ToolChoice,
    ) -> Result<ChatResponse> {
        let payload = self.chat_payload(messages, tools, tool_choice, false);
        let body = with_retries("chat", || async {
            self.limiter.acquire().await;
            let response = self.request("chat/completions", &payload).send().await?;
            let status = response.status();
            let body: serde_json::Value = response.json().await?;
            if !status.is_success() {
                bail!("chat endpoint returned {status}: {body}");
            }
            Ok(body)
        })
        .await?;

        parse_chat_body(&body)
    }

    #[instrument(skip_all, fields(model = %self.model, messages = messages.len()))]
    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        tools: Option<&serde_json::Value>,
        tool_choice: ToolChoice,
        tx: mpsc::Sender<String>,
    ) -> Result<ChatResponse> {
        let payload = self.chat_payload(messages, tools, tool_choice, true);

        self.limiter.acquire().await;
        let mut response = self.request("chat/completions", &payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body: serde_json::Value = response.json().await?;
            bail!("chat endpoint returned {status}: {body}");
        }

        let mut assembler = StreamAssembler::default();
        let mut buffer = String::new();
        while let Some(chunk) = response.chunk().await? {
            buffer.push_str(&String::from_utf8_lossy(&chunk));
            // Drain complete lines; a trailing partial line stays buffered.
            while let Some(pos) = buffer.find('\n') {
                let line: String = buffer.drain(..=pos).collect();
                if let Some(delta) = assembler.feed_line(line.trim()) {
                    let _ = tx.send(delta).await;
                }
            }
        }
        if let Some(delta) = assembler.feed_line(buffer.trim()) {
            let _ = tx.send(delta).await;
        }

        Ok(assembler.finish())
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        let payload = json!({
            "model": self.model,
            "prompt": prompt,
        });
        let body = with_retries("complete", || async {
            self.limiter.acquire().await;
            let response = self.request("completions", &payload).send().await?;
            let status = response.status();
            let body: serde_json::Value = response.json().await?;
            if !status.is_success() {
                bail!("completion endpoint returned {status}: {body}");
            }
            Ok(body)
        })
        .await?;

        body["choices"][0]["text"]
            .as_str()
            .map(str::to_string)
            .context("completion response missing choices[0].text")
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let payload = json!({
            "model": self.model,
            "input": texts,
        });
        let body = with_retries("embed", || async {
            self.limiter.acquire().await;
            let response = self.request("embeddings", &payload).send().await?;
            let status = response.status();
            let body: serde_json::Value = response.json().await?;
            if !status.is_success() {
                bail!("embedding endpoint returned {status}: {body}");
            }
            Ok(body)
        })
        .await?;

        let data = body["data"]
            .as_array()
            .context("embedding response missing data array")?;
        let mut vectors = Vec::with_capacity(data.len());
        for item in data {
            let vector = item["embedding"]
                .as_array()
                .context("embedding item missing vector")?
                .iter()
                .filter_map(|v| v.as_f64().map(|f| f as f32))
                .collect();
            vectors.push(vector);
        }
        debug!(count = vectors.len(), "embeddings generated");
        Ok(vectors)
    }
}

// ── Response parsing ─────────────────────────────────────────────────────────

fn parse_chat_body(body: &serde_json::Value) -> Result<ChatResponse> {
    let message = &body["choices"][0]["message"];
    let content = message["content"].as_str().unwrap_or("").to_string();
    let tool_calls = message["tool_calls"]
        .as_array()
        .map(|calls| parse_tool_calls(calls))
        .unwrap_or_default();
    let finish_reason = body["choices"][0]["finish_reason"]
        .as_str()
        .unwrap_or(if tool_calls.is_empty() { "stop" } else { "tool_calls" })
        .to_string();
    Ok(ChatResponse { content, tool_calls, finish_reason })
}

/// Parse a tool_calls array, tolerating both string-encoded and structured
/// argument payloads.
fn parse_tool_calls(calls: &[serde_json::Value]) -> Vec<ToolCall> {
    calls
        .iter()
        .enumerate()
        .filter_map(|(i, call)| {
            let func = call.get("function")?;
            let name = func.get("name")?.as_str()?.to_string();
            let arguments = match func.get("arguments") {
                Some(serde_json::Value::String(raw)) => {
                    serde_json::from_str(raw).unwrap_or_else(|_| json!({}))
                }
                Some(value) => value.clone(),
                None => json!({}),
            };
            Some(ToolCall {
                id: call
                    .get("id")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("call_{i}")),
                kind: "function".to_string(),
                function: ToolCallFunction { name, arguments },
            })
        })
        .collect()
}

/// Incremental assembler for `data:`-framed streaming chat chunks.
///
/// Tool-call fragments arrive index-keyed with the argument JSON split
/// across chunks; text content arrives as plain deltas.
#[derive(Default)]
struct StreamAssembler {
    content: String,
    finish_reason: Option<String>,
    // index → (id, name, accumulated argument text)
    partial_calls: Vec<(String, String, String)>,
}

impl StreamAssembler {
    /// Feed one line; returns a text delta when the line carried one.
    fn feed_line(&mut self, line: &str) -> Option<String> {
        let data = line.strip_prefix("data:")?.trim();
        if data.is_empty() || data == "[DONE]" {
            return None;
        }
        let chunk: serde_json::Value = serde_json::from_str(data).ok()?;
        let choice = &chunk["choices"][0];

        if let Some(reason) = choice["finish_reason"].as_str() {
            self.finish_reason = Some(reason.to_string());
        }

        if let Some(calls) = choice["delta"]["tool_calls"].as_array() {
            for fragment in calls {
                let index = fragment["index"].as_u64().unwrap_or(0) as usize;
                while self.partial_calls.len() <= index {
                    self.partial_calls.push((String::new(), String::new(), String::new()));
                }
                let slot = &mut self.partial_calls[index];
                if let Some(id) = fragment["id"].as_str() {
                    slot.0 = id.to_string();
                }
                if let Some(name) = fragment["function"]["name"].as_str() {
                    slot.1.push_str(name);
                }
                if let Some(args) = fragment["function"]["arguments"].as_str() {
                    slot.2.push_str(args);
                }
            }
        }

        let delta = choice["delta"]["content"].as_str()?;
        if delta.is_empty() {
            return None;
        }
        self.content.push_str(delta);
        Some(delta.to_string())
    }

    fn finish(self) -> ChatResponse {
        let tool_calls: Vec<ToolCall> = self
            .partial_calls
            .into_iter()
            .enumerate()
            .filter(|(_, (_, name, _))| !name.is_empty())
            .map(|(i, (id, name, args))| ToolCall {
                id: if id.is_empty() { format!("call_{i}") } else { id },
                kind: "function".to_string(),
                function: ToolCallFunction {
                    name,
                    arguments: serde_json::from_str(&args).unwrap_or_else(|_| json!({})),
                },
            })
            .collect();
        let finish_reason = self.finish_reason.unwrap_or_else(|| {
            if tool_calls.is_empty() { "stop" } else { "tool_calls" }.to_string()
        });
        ChatResponse { content: self.content, tool_calls, finish_reason }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_string_encoded_tool_arguments() {
        let calls = json!([{
            "id": "call_abc",
            "function": {"name": "search", "arguments": "{\"q\":\"rain in Madrid\"}"}
        }]);
        let parsed = parse_tool_calls(calls.as_array().unwrap());
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].function.name, "search");
        assert_eq!(parsed[0].function.arguments["q"], "rain in Madrid");
    }

    #[test]
    fn assembler_accumulates_text_and_tool_fragments() {
        let mut asm = StreamAssembler::default();
        assert_eq!(
            asm.feed_line(r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#),
            Some("Hel".to_string())
        );
        assert_eq!(
            asm.feed_line(r#"data: {"choices":[{"delta":{"content":"lo"}}]}"#),
            Some("lo".to_string())
        );
        asm.feed_line(
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1","function":{"name":"search","arguments":"{\"q\":"}}]}}]}"#,
        );
        asm.feed_line(
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"x\"}"}}]},"finish_reason":"tool_calls"}]}"#,
        );
        asm.feed_line("data: [DONE]");

        let response = asm.finish();
        assert_eq!(response.content, "Hello");
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].function.arguments["q"], "x");
        assert_eq!(response.finish_reason, "tool_calls");
    }

    #[test]
    fn assembler_ignores_keepalive_lines() {
        let mut asm = StreamAssembler::default();
        assert!(asm.feed_line("").is_none());
        assert!(asm.feed_line(": keepalive").is_none());
        let response = asm.finish();
        assert_eq!(response.finish_reason, "stop");
    }
}
