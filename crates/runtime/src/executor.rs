//! The tool-calling loop.
//!
//! Each round: call the model with the accumulated messages, dispatch any
//! requested tool calls (in parallel, with per-pathway timeouts), feed the
//! observations back in the order the model listed the calls, and repeat
//! until the model answers in text, the tool budget runs out, or the round
//! cap is hit -- at which point `tool_choice = "none"` forces a final
//! streaming synthesis.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use anima_config::ExecutorConfig;
use anima_entity::Entity;
use anima_llm::{ChatMessage, ChatResponse, EndpointRouter, ToolCall, ToolChoice};
use anima_pathway::{Pathway, PathwayContext, PathwayRegistry, Summarizer};

use crate::RuntimeError;
use crate::emitter::{ToolStatusKind, TurnEmitter, TurnEvent};

// ── Request / outcome types ──────────────────────────────────────────────────

pub struct TurnRequest {
    pub entity: Entity,
    pub user_id: String,
    pub system_prompt: String,
    /// Chat history including the user's latest message.
    pub history: Vec<ChatMessage>,
    /// Serialized function-calling schemas for the entity's tools.
    pub tool_schema: Vec<Value>,
    pub model: String,
    /// Aggregate tool-cost cap for this turn.
    pub budget: f64,
}

/// One tool invocation (or short-circuit) within a turn.
#[derive(Debug, Clone)]
pub struct ToolUseRecord {
    pub name: String,
    pub duplicate: bool,
    pub success: bool,
    pub cost: f64,
}

#[derive(Debug, Clone, Default)]
pub struct TurnOutcome {
    pub text: String,
    pub tools_used: Vec<ToolUseRecord>,
    pub rounds: usize,
    pub budget_used: f64,
    pub cancelled: bool,
    pub errors: Vec<String>,
}

// ── Executor ─────────────────────────────────────────────────────────────────

pub struct TurnExecutor {
    registry: Arc<PathwayRegistry>,
    router: EndpointRouter,
    config: ExecutorConfig,
}

/// How one requested call will be handled this round.
enum CallPlan {
    Execute { pathway: Arc<Pathway>, key: String },
    Duplicate { key: String, name: String },
    BudgetTruncated,
    Unknown,
}

impl TurnExecutor {
    pub fn new(registry: Arc<PathwayRegistry>, router: EndpointRouter, config: ExecutorConfig) -> Self {
        Self { registry, router, config }
    }

    #[instrument(skip_all, fields(entity = %request.entity.name, model = %request.model))]
    pub async fn execute(
        &self,
        request: TurnRequest,
        emitter: &TurnEmitter,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome> {
        let endpoint = self
            .router
            .resolve(Some(&request.model))
            .map_err(|err| RuntimeError::Configuration(err.to_string()))?;
        let track_id = Uuid::new_v4().to_string();
        emitter.emit(TurnEvent::ResponseCreated { track_id: track_id.clone() });

        let tools_json = (!request.tool_schema.is_empty())
            .then(|| Value::Array(request.tool_schema.clone()));

        let mut messages = Vec::with_capacity(request.history.len() + 1);
        messages.push(ChatMessage::system(request.system_prompt.clone()));
        messages.extend(request.history.iter().cloned());

        // (message index, summarizer) for each prior tool observation, so
        // compression can rewrite them in place.
        let mut observation_slots: Vec<(usize, Option<Arc<dyn Summarizer>>)> = Vec::new();
        // (toolName, canonicalJSON(args)) → result payload, per request.
        let mut memo: HashMap<String, String> = HashMap::new();

        let mut outcome = TurnOutcome::default();
        let mut tool_choice = ToolChoice::Auto;

        loop {
            outcome.rounds += 1;
            self.compress_if_needed(&mut messages, &observation_slots, endpoint.context_tokens());

            let partial = Arc::new(Mutex::new(String::new()));
            let response = {
                let (delta_tx, mut delta_rx) = mpsc::channel::<String>(64);
                let forward_partial = Arc::clone(&partial);
                let forward_emitter = emitter.clone();
                let forward_track = track_id.clone();
                let forwarder = tokio::spawn(async move {
                    while let Some(delta) = delta_rx.recv().await {
                        forward_partial.lock().unwrap().push_str(&delta);
                        forward_emitter.transcript_delta(&forward_track, &delta);
                    }
                });

                let call = endpoint.chat_stream(
                    &messages,
                    tools_json.as_ref().filter(|_| tool_choice == ToolChoice::Auto),
                    tool_choice,
                    delta_tx,
                );
                let result = tokio::select! {
                    response = call => response,
                    _ = cancel.cancelled() => {
                        forwarder.abort();
                        outcome.text = partial.lock().unwrap().clone();
                        outcome.cancelled = true;
                        emitter.emit(TurnEvent::ResponseDone { track_id, cancelled: true });
                        info!(rounds = outcome.rounds, "turn cancelled mid-stream");
                        return Ok(outcome);
                    }
                };
                let _ = forwarder.await;
                // The adapter has already retried; what comes back here is
                // a hard remote failure.
                result.map_err(|err| RuntimeError::Remote(err.to_string()))?
            };

            if response.tool_calls.is_empty() || tool_choice == ToolChoice::None {
                outcome.text = response.content;
                break;
            }

            let observations = self
                .run_tool_round(&request, &response, &mut memo, &mut outcome, emitter)
                .await;

            messages.push(ChatMessage::assistant_tool_calls(response.tool_calls.clone()));
            for (call, payload, summarize) in observations {
                messages.push(ChatMessage::tool_result(&call.id, &payload));
                observation_slots.push((messages.len() - 1, summarize));
            }

            // Cancellation during dispatch: tools were awaited with their
            // timeouts; return what we have.
            if cancel.is_cancelled() {
                outcome.cancelled = true;
                emitter.emit(TurnEvent::ResponseDone { track_id, cancelled: true });
                info!(rounds = outcome.rounds, "turn cancelled after tool round");
                return Ok(outcome);
            }

            if outcome.budget_used >= request.budget || outcome.rounds >= self.config.max_rounds {
                debug!(
                    budget_used = outcome.budget_used,
                    rounds = outcome.rounds,
                    "budget or round cap reached -- forcing final synthesis"
                );
                tool_choice = ToolChoice::None;
            }
        }

        emitter.emit(TurnEvent::TranscriptDone {
            track_id: track_id.clone(),
            text: outcome.text.clone(),
        });
        emitter.emit(TurnEvent::ResponseDone { track_id, cancelled: false });
        info!(
            rounds = outcome.rounds,
            tools = outcome.tools_used.len(),
            budget_used = outcome.budget_used,
            "turn complete"
        );
        Ok(outcome)
    }

    /// Plan and dispatch one round of tool calls.  Unique calls run
    /// concurrently; observations come back in the order the model listed
    /// the calls.
    async fn run_tool_round(
        &self,
        request: &TurnRequest,
        response: &ChatResponse,
        memo: &mut HashMap<String, String>,
        outcome: &mut TurnOutcome,
        emitter: &TurnEmitter,
    ) -> Vec<(ToolCall, String, Option<Arc<dyn Summarizer>>)> {
        // Planning pass: resolve pathways, detect duplicates, gate on the
        // remaining budget -- all in the model's listed order.
        let mut plans: Vec<CallPlan> = Vec::with_capacity(response.tool_calls.len());
        let mut planned_keys: Vec<String> = Vec::new();
        let mut projected = outcome.budget_used;
        for call in &response.tool_calls {
            let name = call.function.name.to_lowercase();
            let Some(pathway) = self.registry.resolve_tool(&name) else {
                plans.push(CallPlan::Unknown);
                continue;
            };
            let key = duplicate_key(&name, &call.function.arguments);
            let seen = memo.contains_key(&key) || planned_keys.contains(&key);
            if seen && !pathway.enable_duplicate_requests {
                plans.push(CallPlan::Duplicate { key, name });
                continue;
            }
            if projected >= request.budget {
                plans.push(CallPlan::BudgetTruncated);
                continue;
            }
            projected += pathway.tool_cost;
            planned_keys.push(key.clone());
            plans.push(CallPlan::Execute { pathway, key });
        }

        // Dispatch pass: every Execute plan runs concurrently.
        let dispatches = response.tool_calls.iter().zip(plans.iter()).filter_map(|(call, plan)| {
            let CallPlan::Execute { pathway, key } = plan else {
                return None;
            };
            Some(self.dispatch_tool(request, call, Arc::clone(pathway), key.clone(), emitter))
        });
        let executed = futures::future::join_all(dispatches).await;
        for (key, payload, _) in &executed {
            memo.insert(key.clone(), payload.clone());
        }

        // Observation pass: stable order, duplicates resolved from the memo.
        let mut executed_iter = executed.into_iter();
        response
            .tool_calls
            .iter()
            .zip(plans)
            .map(|(call, plan)| match plan {
                CallPlan::Execute { pathway, .. } => {
                    let (_, payload, success) =
                        executed_iter.next().expect("one dispatch per execute plan");
                    outcome.tools_used.push(ToolUseRecord {
                        name: pathway.name.clone(),
                        duplicate: false,
                        success,
                        cost: pathway.tool_cost,
                    });
                    outcome.budget_used += pathway.tool_cost;
                    let payload = match pathway.summarize {
                        Some(ref summarizer) => summarizer.summarize(&payload),
                        None => payload,
                    };
                    (call.clone(), payload, pathway.summarize.clone())
                }
                CallPlan::Duplicate { key, name } => {
                    emitter.tool_status(&name, ToolStatusKind::Duplicate, "re-used prior result");
                    outcome.tools_used.push(ToolUseRecord {
                        name,
                        duplicate: true,
                        success: true,
                        cost: 0.0,
                    });
                    let payload = memo.get(&key).cloned().unwrap_or_else(|| {
                        json!({"success": false, "error": "duplicate of a failed call"}).to_string()
                    });
                    (call.clone(), payload, None)
                }
                CallPlan::BudgetTruncated => {
                    let name = call.function.name.clone();
                    emitter.tool_status(&name, ToolStatusKind::Failed, "tool budget exhausted");
                    warn!(tool = %name, "tool call truncated by budget");
                    let payload = json!({"success": false, "error": "tool budget exhausted"}).to_string();
                    (call.clone(), payload, None)
                }
                CallPlan::Unknown => {
                    let name = call.function.name.clone();
                    let error = RuntimeError::Validation(format!("unknown tool: {name}"));
                    emitter.tool_status(&name, ToolStatusKind::Failed, "unknown tool");
                    outcome.errors.push(error.to_string());
                    let payload = json!({"success": false, "error": error.to_string()}).to_string();
                    (call.clone(), payload, None)
                }
            })
            .collect()
    }

    /// Run one tool pathway with its declared timeout.  Failures become
    /// machine-readable payloads the model can adapt to next round.
    async fn dispatch_tool(
        &self,
        request: &TurnRequest,
        call: &ToolCall,
        pathway: Arc<Pathway>,
        key: String,
        emitter: &TurnEmitter,
    ) -> (String, String, bool) {
        let name = call.function.name.to_lowercase();
        emitter.tool_status(&name, ToolStatusKind::Running, "");

        let ctx = PathwayContext::new(Arc::clone(&self.registry), self.router.clone())
            .with_entity(request.entity.clone())
            .with_user(request.user_id.clone());
        let timeout = Duration::from_secs(if pathway.timeout_secs == 0 {
            self.config.default_tool_timeout_secs
        } else {
            pathway.timeout_secs
        });

        let invocation = tokio::time::timeout(
            timeout,
            self.registry
                .invoke(&pathway.name, call.function.arguments.clone(), ctx),
        )
        .await;

        match invocation {
            Ok(Ok(result)) if result.errors.is_empty() => {
                emitter.tool_status(&name, ToolStatusKind::Completed, "");
                (key, result.result.to_string(), true)
            }
            Ok(Ok(result)) => {
                emitter.tool_status(&name, ToolStatusKind::Failed, &result.errors.join("; "));
                (key, result.result.to_string(), false)
            }
            Ok(Err(err)) => {
                warn!(tool = %name, %err, "tool execution failed");
                emitter.tool_status(&name, ToolStatusKind::Failed, &err.to_string());
                (key, json!({"success": false, "error": err.to_string()}).to_string(), false)
            }
            Err(_) => {
                let error = RuntimeError::Remote(format!("tool {name} timed out"));
                warn!(tool = %name, ?timeout, "tool timed out");
                emitter.tool_status(&name, ToolStatusKind::Failed, "timed out");
                (key, json!({"success": false, "error": error.to_string()}).to_string(), false)
            }
        }
    }

    /// When the estimated context exceeds the compression fraction of the
    /// model window, rewrite prior tool observations: the pathway's
    /// summarizer when it declared one, otherwise a marked prefix
    /// truncation.
    fn compress_if_needed(
        &self,
        messages: &mut [ChatMessage],
        observation_slots: &[(usize, Option<Arc<dyn Summarizer>>)],
        context_tokens: usize,
    ) {
        let estimated = estimate_tokens(messages);
        let threshold = (context_tokens as f64 * self.config.compression_fraction) as usize;
        if estimated <= threshold {
            return;
        }
        debug!(estimated, threshold, "context over limit -- compressing tool observations");
        for (index, summarizer) in observation_slots {
            let Some(content) = messages[*index].content.take() else { continue };
            let compressed = match summarizer {
                Some(summarizer) => summarizer.summarize(&content),
                None => {
                    let prefix: String = content.chars().take(self.config.truncate_prefix_chars).collect();
                    if prefix.len() < content.len() {
                        format!("{prefix}… [compressed]")
                    } else {
                        prefix
                    }
                }
            };
            messages[*index].content = Some(compressed);
        }
    }
}

/// Chars-over-four token estimate across all message content.
fn estimate_tokens(messages: &[ChatMessage]) -> usize {
    let chars: usize = messages
        .iter()
        .map(|m| m.content.as_deref().map_or(0, str::len))
        .sum();
    chars / 4
}

/// Per-request duplicate key: lowercased tool name plus the SHA-256 of the
/// canonicalized (recursively key-sorted) argument JSON, so key order in
/// the model's output never defeats the dedup.
fn duplicate_key(tool_name: &str, args: &Value) -> String {
    let canonical = canonicalize(args).to_string();
    let digest = Sha256::digest(canonical.as_bytes());
    format!("{tool_name}:{digest:x}")
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted: Vec<(&String, &Value)> = map.iter().collect();
            sorted.sort_by_key(|(k, _)| k.as_str());
            Value::Object(
                sorted
                    .into_iter()
                    .map(|(k, v)| (k.clone(), canonicalize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anima_llm::testing::ScriptedEndpoint;
    use anima_llm::ToolCallFunction;
    use anima_pathway::{PathwayExecutor, PathwayInvocation, PromptTemplate, ToolDefinition};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTool {
        calls: Arc<AtomicUsize>,
        delay: Duration,
    }

    #[async_trait]
    impl PathwayExecutor for CountingTool {
        async fn execute(&self, args: Value, _ctx: PathwayContext) -> Result<PathwayInvocation> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(PathwayInvocation {
                result: json!({"success": true, "echo": args}),
                tool: None,
                errors: vec![],
                warnings: vec![],
            })
        }
    }

    fn tool_pathway(name: &str, cost: f64, calls: Arc<AtomicUsize>, delay: Duration) -> Pathway {
        let definition = ToolDefinition::parse(json!({
            "type": "function",
            "function": {"name": name, "description": "test tool", "parameters": {"type": "object"}}
        }))
        .unwrap();
        let mut pathway = Pathway::named(format!("{}_pathway", name.to_lowercase()))
            .with_tool_definition(definition)
            .with_executor(Arc::new(CountingTool { calls, delay }));
        pathway.tool_cost = cost;
        pathway.timeout_secs = 5;
        pathway
    }

    fn tool_call(id: &str, name: &str, args: Value) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            kind: "function".to_string(),
            function: ToolCallFunction { name: name.to_string(), arguments: args },
        }
    }

    struct Harness {
        executor: TurnExecutor,
        endpoint: Arc<ScriptedEndpoint>,
        calls: Arc<AtomicUsize>,
    }

    fn harness(tool_name: &str, cost: f64, budget_tools_delay: Duration) -> Harness {
        let registry = Arc::new(PathwayRegistry::new());
        let calls = Arc::new(AtomicUsize::new(0));
        registry.register_pathway(tool_pathway(tool_name, cost, calls.clone(), budget_tools_delay));
        // A plain prompt pathway proves non-tool pathways stay invisible
        // to the loop.
        registry.register_pathway(
            Pathway::named("summarize_text").with_prompt(PromptTemplate::user("{{text}}").unwrap()),
        );

        let endpoint = Arc::new(ScriptedEndpoint::new("loop-model"));
        let mut router = EndpointRouter::new();
        router.register(endpoint.clone());

        let executor = TurnExecutor::new(registry, router, ExecutorConfig::default());
        Harness { executor, endpoint, calls }
    }

    fn request(budget: f64) -> TurnRequest {
        let schema = json!({
            "type": "function",
            "function": {"name": "SearchInternet", "description": "d", "parameters": {"type": "object"}}
        });
        TurnRequest {
            entity: Entity::new("Tester"),
            user_id: "ana".to_string(),
            system_prompt: "You are Tester.".to_string(),
            history: vec![ChatMessage::user("hi")],
            tool_schema: vec![schema],
            model: "loop-model".to_string(),
            budget,
        }
    }

    #[tokio::test]
    async fn plain_text_response_finishes_in_one_round() -> Result<()> {
        let h = harness("SearchInternet", 1.0, Duration::ZERO);
        h.endpoint.push_text("hello there");

        let outcome = h
            .executor
            .execute(request(10.0), &TurnEmitter::sink(), CancellationToken::new())
            .await?;
        assert_eq!(outcome.text, "hello there");
        assert_eq!(outcome.rounds, 1);
        assert!(outcome.tools_used.is_empty());
        assert!(!outcome.cancelled);
        Ok(())
    }

    #[tokio::test]
    async fn tool_round_feeds_observations_then_finalizes() -> Result<()> {
        let h = harness("SearchInternet", 1.0, Duration::ZERO);
        h.endpoint.push_response(ChatResponse::with_tool_calls(vec![tool_call(
            "c1",
            "SearchInternet",
            json!({"q": "rain in Madrid"}),
        )]));
        h.endpoint.push_text("it is raining");

        let outcome = h
            .executor
            .execute(request(10.0), &TurnEmitter::sink(), CancellationToken::new())
            .await?;
        assert_eq!(outcome.text, "it is raining");
        assert_eq!(outcome.rounds, 2);
        assert_eq!(outcome.tools_used.len(), 1);
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);

        // The second model call must carry the tool observation.
        let second_call = &h.endpoint.calls()[1];
        let roles: Vec<_> = second_call.messages.iter().map(|m| m.role).collect();
        assert!(roles.contains(&anima_llm::ChatRole::Tool));
        Ok(())
    }

    #[tokio::test]
    async fn identical_calls_in_one_round_dedupe_to_one_invocation() -> Result<()> {
        let h = harness("SearchInternet", 1.0, Duration::ZERO);
        h.endpoint.push_response(ChatResponse::with_tool_calls(vec![
            tool_call("c1", "SearchInternet", json!({"q": "rain in Madrid"})),
            // Key order flipped on purpose: canonicalization must collide.
            tool_call("c2", "SearchInternet", json!({"q": "rain in Madrid"})),
        ]));
        h.endpoint.push_text("done");

        let (emitter, mut rx) = TurnEmitter::channel();
        let outcome = h
            .executor
            .execute(request(10.0), &emitter, CancellationToken::new())
            .await?;

        assert_eq!(h.calls.load(Ordering::SeqCst), 1, "one pathway invocation");
        assert_eq!(outcome.tools_used.len(), 2);
        assert_eq!(outcome.tools_used.iter().filter(|t| t.duplicate).count(), 1);

        // Both observations carry the same payload.
        let second_call = &h.endpoint.calls()[1];
        let payloads: Vec<&str> = second_call
            .messages
            .iter()
            .filter(|m| m.role == anima_llm::ChatRole::Tool)
            .filter_map(|m| m.content.as_deref())
            .collect();
        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads[0], payloads[1]);

        // Status stream: one running/completed pair plus one duplicate.
        let mut statuses = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let TurnEvent::ToolStatus { status, .. } = event {
                statuses.push(status);
            }
        }
        assert_eq!(statuses.iter().filter(|s| **s == ToolStatusKind::Running).count(), 1);
        assert_eq!(statuses.iter().filter(|s| **s == ToolStatusKind::Completed).count(), 1);
        assert_eq!(statuses.iter().filter(|s| **s == ToolStatusKind::Duplicate).count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn budget_cap_truncates_and_forces_final_round() -> Result<()> {
        let h = harness("SearchInternet", 3.0, Duration::ZERO);
        h.endpoint.push_response(ChatResponse::with_tool_calls(vec![
            tool_call("c1", "SearchInternet", json!({"q": "one"})),
            tool_call("c2", "SearchInternet", json!({"q": "two"})),
            tool_call("c3", "SearchInternet", json!({"q": "three"})),
        ]));
        h.endpoint.push_text("final answer");

        let outcome = h
            .executor
            .execute(request(5.0), &TurnEmitter::sink(), CancellationToken::new())
            .await?;

        assert_eq!(h.calls.load(Ordering::SeqCst), 2, "third call is budget-truncated");
        assert!((outcome.budget_used - 6.0).abs() < f64::EPSILON);
        assert!(outcome.budget_used <= 5.0 + 3.0, "overshoot bounded by last tool cost");
        assert_eq!(outcome.text, "final answer");
        assert!(outcome.rounds <= ExecutorConfig::default().max_rounds);

        // The forced final call must carry tool_choice = none.
        let last = h.endpoint.calls().last().unwrap().clone();
        assert_eq!(last.tool_choice, ToolChoice::None);
        Ok(())
    }

    #[tokio::test]
    async fn round_cap_forces_finalization() -> Result<()> {
        let h = harness("SearchInternet", 0.1, Duration::ZERO);
        // The model keeps asking for distinct tool calls forever.
        for i in 0..10 {
            h.endpoint.push_response(ChatResponse::with_tool_calls(vec![tool_call(
                "c",
                "SearchInternet",
                json!({"q": format!("query {i}")}),
            )]));
        }

        let outcome = h
            .executor
            .execute(request(1000.0), &TurnEmitter::sink(), CancellationToken::new())
            .await?;
        assert!(outcome.rounds <= ExecutorConfig::default().max_rounds + 1);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_tool_returns_structured_error_to_model() -> Result<()> {
        let h = harness("SearchInternet", 1.0, Duration::ZERO);
        h.endpoint.push_response(ChatResponse::with_tool_calls(vec![tool_call(
            "c1",
            "NoSuchTool",
            json!({}),
        )]));
        h.endpoint.push_text("recovered");

        let outcome = h
            .executor
            .execute(request(10.0), &TurnEmitter::sink(), CancellationToken::new())
            .await?;
        assert_eq!(outcome.text, "recovered");
        assert_eq!(outcome.errors.len(), 1);

        let second_call = &h.endpoint.calls()[1];
        let observation = second_call
            .messages
            .iter()
            .find(|m| m.role == anima_llm::ChatRole::Tool)
            .and_then(|m| m.content.as_deref())
            .unwrap();
        assert!(observation.contains("unknown tool"));
        Ok(())
    }

    #[tokio::test]
    async fn cancellation_during_tool_round_returns_partial() -> Result<()> {
        let h = harness("SearchInternet", 1.0, Duration::from_millis(50));
        h.endpoint.push_response(ChatResponse::with_tool_calls(vec![tool_call(
            "c1",
            "SearchInternet",
            json!({"q": "slow"}),
        )]));

        let cancel = CancellationToken::new();
        let early = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            early.cancel();
        });

        let outcome = h
            .executor
            .execute(request(10.0), &TurnEmitter::sink(), cancel)
            .await?;
        assert!(outcome.cancelled);
        // The in-flight tool was awaited, not abandoned.
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn duplicate_keys_ignore_object_key_order() {
        let a = duplicate_key("search", &json!({"a": 1, "b": {"c": 2, "d": 3}}));
        let b = duplicate_key("search", &json!({"b": {"d": 3, "c": 2}, "a": 1}));
        let c = duplicate_key("search", &json!({"a": 1, "b": {"c": 2, "d": 4}}));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
