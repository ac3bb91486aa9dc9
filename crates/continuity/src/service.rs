//! The continuity service: process-wide orchestrator over one hot store
//! and one cold index.
//!
//! Exposed through an explicit constructor plus the `continuity()`
//! accessor.  Synthesis is fire-and-forget with at most one in-flight pass
//! per `(entityId, userId)`; re-entrant triggers drop silently.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use uuid::Uuid;

use anima_config::{ContinuityConfig, ModelsConfig};
use anima_llm::EndpointRouter;
use anima_pathway::{
    PathwayContext, PathwayExecutor, PathwayInvocation, PathwayRegistry, Pathway, PromptTemplate,
    ToolDefinition,
};

use crate::cold::ColdMemoryIndex;
use crate::context::{ContextBuilder, NARRATIVE_PATHWAY};
use crate::hot::HotMemoryStore;
use crate::model::{EpisodicTurn, ExpressionState, MemoryNode, MemoryNodeType};
use crate::synthesis::{NarrativeSynthesizer, SynthesisContext, SynthesisKind};

static CONTINUITY: OnceLock<Arc<ContinuityService>> = OnceLock::new();

/// Install the process-wide service.  Second calls are rejected.
pub fn init_continuity(service: Arc<ContinuityService>) -> Result<()> {
    CONTINUITY
        .set(service)
        .map_err(|_| anyhow::anyhow!("continuity service already initialized"))
}

/// The process-wide service, if initialized.
pub fn continuity() -> Option<Arc<ContinuityService>> {
    CONTINUITY.get().cloned()
}

#[derive(Debug, Clone, Default)]
pub struct SessionInfo {
    pub session_start_at: Option<DateTime<Utc>>,
    pub last_interaction_at: Option<DateTime<Utc>>,
    pub turn_count: usize,
}

pub struct ContinuityService {
    hot: Arc<HotMemoryStore>,
    cold: Arc<ColdMemoryIndex>,
    synthesizer: NarrativeSynthesizer,
    context_builder: ContextBuilder,
    session_idle: Duration,
    in_flight: Mutex<HashSet<(Uuid, String)>>,
}

impl ContinuityService {
    pub fn new(
        hot: Arc<HotMemoryStore>,
        cold: Arc<ColdMemoryIndex>,
        registry: Arc<PathwayRegistry>,
        router: EndpointRouter,
        config: &ContinuityConfig,
        models: &ModelsConfig,
    ) -> Self {
        let synthesizer = NarrativeSynthesizer::new(
            Arc::clone(&hot),
            Arc::clone(&cold),
            router.clone(),
            models.synthesis_model.clone(),
            config,
        );
        let context_builder = ContextBuilder::new(
            Arc::clone(&hot),
            Arc::clone(&cold),
            Arc::clone(&registry),
            router,
            config,
        );
        Self {
            hot,
            cold,
            synthesizer,
            context_builder,
            session_idle: Duration::hours(config.session_idle_hours),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn hot(&self) -> &Arc<HotMemoryStore> {
        &self.hot
    }

    pub fn cold(&self) -> &Arc<ColdMemoryIndex> {
        &self.cold
    }

    // ── Context assembly ─────────────────────────────────────────────────

    pub async fn get_context_window(
        &self,
        entity_id: Uuid,
        user_id: &str,
        query: &str,
    ) -> Result<String> {
        self.context_builder.build(entity_id, user_id, query).await
    }

    // ── Turn recording & sessions ────────────────────────────────────────

    /// Append one turn to the episodic stream, starting a fresh session
    /// first when the idle gap exceeds the configured threshold.
    pub async fn record_turn(
        self: &Arc<Self>,
        entity_id: Uuid,
        user_id: &str,
        turn: EpisodicTurn,
    ) -> Result<()> {
        let expression = self.hot.get_expression(entity_id, user_id).await?;
        let idle_expired = expression
            .last_interaction_at
            .is_some_and(|last| Utc::now() - last > self.session_idle);
        if idle_expired || expression.session_start_at.is_none() {
            self.start_session(entity_id, user_id, idle_expired).await?;
        }

        let tone = turn.emotional_tone.clone();
        self.hot.append_turn(entity_id, user_id, turn).await?;
        self.hot
            .update_expression(entity_id, user_id, |state| {
                state.last_interaction_at = Some(Utc::now());
                if let Some(tone) = tone {
                    state.last_interaction_tone = Some(tone);
                }
            })
            .await?;
        Ok(())
    }

    /// Begin a session.  `force` clears the episodic stream even when the
    /// idle rule would not; expression state persists either way.
    pub async fn init_session(self: &Arc<Self>, entity_id: Uuid, user_id: &str, force: bool) -> Result<bool> {
        if force {
            self.start_session(entity_id, user_id, true).await?;
            return Ok(true);
        }
        let expression = self.hot.get_expression(entity_id, user_id).await?;
        let idle_expired = expression
            .last_interaction_at
            .is_some_and(|last| Utc::now() - last > self.session_idle);
        if idle_expired || expression.session_start_at.is_none() {
            self.start_session(entity_id, user_id, idle_expired).await?;
            return Ok(true);
        }
        Ok(false)
    }

    async fn start_session(self: &Arc<Self>, entity_id: Uuid, user_id: &str, clear_stream: bool) -> Result<()> {
        if clear_stream {
            // Consolidate the ending session before its turns disappear.
            let ended = self.hot.last_n(entity_id, user_id, usize::MAX).await?;
            self.hot.clear_stream(entity_id, user_id).await?;
            if !ended.is_empty() {
                self.spawn_session_rollover(entity_id, user_id, ended);
            }
        }
        self.hot
            .update_expression(entity_id, user_id, |state| {
                state.session_start_at = Some(Utc::now());
                state.situational_adjustments.clear();
            })
            .await?;
        debug!(%entity_id, user_id, clear_stream, "session started");
        Ok(())
    }

    /// Fire-and-forget session synthesis over the turns of a session that
    /// just ended.  Shares the in-flight gate with `trigger_synthesis`.
    fn spawn_session_rollover(self: &Arc<Self>, entity_id: Uuid, user_id: &str, turns: Vec<EpisodicTurn>) {
        let key = (entity_id, user_id.to_string());
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            if !in_flight.insert(key.clone()) {
                debug!(%entity_id, user_id, "synthesis in flight -- session rollover dropped");
                return;
            }
        }
        let service = Arc::clone(self);
        let user_id = user_id.to_string();
        tokio::spawn(async move {
            let result = service
                .synthesizer
                .run_session_synthesis_over(entity_id, &user_id, &turns, &SynthesisContext::default())
                .await;
            match result {
                Ok(written) if !written.is_empty() => {
                    if let Err(err) = service.hot.invalidate_active_context(entity_id, &user_id).await {
                        warn!(%err, "active-context invalidation failed");
                    }
                }
                Ok(_) => {}
                Err(err) => warn!(%err, %entity_id, user_id, "session rollover synthesis failed -- swallowed"),
            }
            service.in_flight.lock().unwrap().remove(&key);
        });
    }

    pub async fn get_session_info(&self, entity_id: Uuid, user_id: &str) -> Result<SessionInfo> {
        let expression = self.hot.get_expression(entity_id, user_id).await?;
        let turns = self.hot.last_n(entity_id, user_id, usize::MAX).await?;
        Ok(SessionInfo {
            session_start_at: expression.session_start_at,
            last_interaction_at: expression.last_interaction_at,
            turn_count: turns.len(),
        })
    }

    pub async fn get_expression(&self, entity_id: Uuid, user_id: &str) -> Result<ExpressionState> {
        self.hot.get_expression(entity_id, user_id).await
    }

    // ── Synthesis ────────────────────────────────────────────────────────

    /// Fire-and-forget synthesis on the background scheduler.  Returns
    /// whether the pass was actually scheduled; a pass already in flight
    /// for this `(entityId, userId)` silently drops the trigger.
    pub fn trigger_synthesis(
        self: &Arc<Self>,
        entity_id: Uuid,
        user_id: &str,
        kind: SynthesisKind,
        ctx: SynthesisContext,
    ) -> bool {
        let key = (entity_id, user_id.to_string());
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            if !in_flight.insert(key.clone()) {
                debug!(%entity_id, user_id, "synthesis already in flight -- trigger dropped");
                return false;
            }
        }

        let service = Arc::clone(self);
        let user_id = user_id.to_string();
        tokio::spawn(async move {
            let result = match kind {
                SynthesisKind::Turn => {
                    service
                        .synthesizer
                        .run_turn_synthesis(entity_id, &user_id, &ctx)
                        .await
                }
                SynthesisKind::Session => {
                    service
                        .synthesizer
                        .run_session_synthesis(entity_id, &user_id, &ctx)
                        .await
                }
            };
            match result {
                Ok(written) if !written.is_empty() => {
                    // New synthesized memories make the cached narrative stale.
                    if let Err(err) = service.hot.invalidate_active_context(entity_id, &user_id).await {
                        warn!(%err, "active-context invalidation failed");
                    }
                }
                Ok(_) => {}
                Err(err) => warn!(%err, %entity_id, user_id, "synthesis failed -- swallowed"),
            }
            service.in_flight.lock().unwrap().remove(&key);
        });
        true
    }

    /// Deep consolidation, run synchronously (CLI and scheduled jobs).
    pub async fn run_deep_synthesis(
        &self,
        entity_id: Uuid,
        user_id: &str,
        ctx: &SynthesisContext,
    ) -> Result<Vec<Uuid>> {
        let written = self
            .synthesizer
            .run_deep_synthesis(entity_id, user_id, ctx)
            .await?;
        if !written.is_empty() {
            self.hot.invalidate_active_context(entity_id, user_id).await?;
        }
        Ok(written)
    }

    // ── Memory operations ────────────────────────────────────────────────

    pub async fn search_memory(
        &self,
        entity_id: Uuid,
        user_id: &str,
        query: &str,
        limit: usize,
        types: Option<Vec<MemoryNodeType>>,
    ) -> Result<Vec<MemoryNode>> {
        self.cold
            .search_semantic(entity_id, user_id, query, limit, types)
            .await
    }

    pub async fn get_memories_by_type(
        &self,
        entity_id: Uuid,
        user_id: &str,
        node_type: MemoryNodeType,
        limit: usize,
    ) -> Result<Vec<MemoryNode>> {
        self.cold.get_by_type(entity_id, user_id, node_type, limit).await
    }

    pub async fn add_memory(&self, node: MemoryNode) -> Result<Option<Uuid>> {
        let (entity_id, user_id) = (node.entity_id, node.user_id.clone());
        let id = self.cold.upsert_memory(node).await?;
        if id.is_some() {
            self.hot.invalidate_active_context(entity_id, &user_id).await?;
        }
        Ok(id)
    }

    pub async fn delete_memory(&self, id: Uuid) -> Result<bool> {
        self.cold.delete_memory(id).await
    }

    pub async fn link_memories(&self, a: Uuid, b: Uuid) -> Result<bool> {
        self.cold.link_memories(a, b).await
    }

    pub async fn has_memories(&self, entity_id: Uuid, user_id: &str) -> Result<bool> {
        self.cold.has_memories(entity_id, user_id).await
    }

    /// The forget-me cascade: relational data deleted, synthesized
    /// artifacts anonymized, session hot-state cleared.  The entity
    /// document itself is untouched.
    pub async fn forget_user(&self, entity_id: Uuid, user_id: &str) -> Result<usize> {
        let removed = self.cold.cascading_forget(entity_id, user_id).await?;
        self.hot.clear_all(entity_id, user_id).await?;
        info!(%entity_id, user_id, removed, "user forgotten");
        Ok(removed)
    }
}

// ── Continuity pathways ──────────────────────────────────────────────────────

/// Register the pathways continuity owns: the narrative summarizer and
/// the memory tools (`memory_add` routed through `continuity_memory_upsert`
/// so cold writes share that pathway's rate-limited adapter).
pub fn register_continuity_pathways(registry: &PathwayRegistry, models: &ModelsConfig) -> Result<()> {
    let narrative_prompt = PromptTemplate::user(
        "Summarize the following memories into one short paragraph that is \
directly useful for answering the current message. Keep names and \
concrete facts; drop anything irrelevant.\n\n\
Current message: {{query}}\n\nMemories:\n\
{{#each memories}}- {{this}}\n{{/each}}",
    )?;
    registry.register_pathway(
        Pathway::named(NARRATIVE_PATHWAY)
            .with_model(models.narrative_model.clone())
            .with_prompt(narrative_prompt),
    );

    let add_definition = ToolDefinition::parse(json!({
        "type": "function",
        "function": {
            "name": "memory_add",
            "description": "Save a durable memory about the user or the relationship.",
            "parameters": {
                "type": "object",
                "properties": {
                    "content": {"type": "string", "description": "What to remember"},
                    "memory_type": {
                        "type": "string",
                        "enum": ["CORE", "ANCHOR", "ARTIFACT", "IDENTITY", "VALUE", "EPISODE"],
                        "description": "Kind of memory"
                    },
                    "importance": {"type": "number", "description": "1-10"}
                },
                "required": ["content"]
            }
        }
    }))?;
    registry.register_pathway(
        Pathway::named("continuity_memory_upsert")
            .with_tool_definition(add_definition)
            .with_executor(Arc::new(MemoryAddExecutor)),
    );

    let forget_definition = ToolDefinition::parse(json!({
        "type": "function",
        "function": {
            "name": "forget_me",
            "description": "Erase everything remembered about this user. Relational memories are deleted; synthesized insights are kept in anonymized form. Irreversible.",
            "parameters": {
                "type": "object",
                "properties": {
                    "confirm": {"type": "boolean", "description": "Must be true to proceed"}
                },
                "required": ["confirm"]
            }
        }
    }))?;
    registry.register_pathway(
        Pathway::named("continuity_forget_me")
            .with_tool_definition(forget_definition)
            .with_executor(Arc::new(ForgetMeExecutor)),
    );

    let search_definition = ToolDefinition::parse(json!({
        "type": "function",
        "function": {
            "name": "memory_search",
            "description": "Search long-term memory about this user.",
            "parameters": {
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "What to look for"},
                    "limit": {"type": "number", "description": "Max results"}
                },
                "required": ["query"]
            }
        }
    }))?;
    registry.register_pathway(
        Pathway::named("continuity_memory_search")
            .with_tool_definition(search_definition)
            .with_executor(Arc::new(MemorySearchExecutor)),
    );

    Ok(())
}

fn parse_node_type(label: Option<&str>) -> MemoryNodeType {
    match label.map(str::to_uppercase).as_deref() {
        Some("CORE") => MemoryNodeType::Core,
        Some("CAPABILITY") => MemoryNodeType::Capability,
        Some("ARTIFACT") => MemoryNodeType::Artifact,
        Some("IDENTITY") => MemoryNodeType::Identity,
        Some("EXPRESSION") => MemoryNodeType::Expression,
        Some("VALUE") => MemoryNodeType::Value,
        Some("EPISODE") => MemoryNodeType::Episode,
        _ => MemoryNodeType::Anchor,
    }
}

fn tool_failure(tool: &str, message: &str) -> PathwayInvocation {
    PathwayInvocation {
        result: json!({"success": false, "error": message}),
        tool: Some(tool.to_string()),
        errors: vec![message.to_string()],
        warnings: vec![],
    }
}

struct MemoryAddExecutor;

#[async_trait]
impl PathwayExecutor for MemoryAddExecutor {
    async fn execute(&self, args: Value, ctx: PathwayContext) -> Result<PathwayInvocation> {
        let Some(service) = continuity() else {
            return Ok(tool_failure("memory_add", "continuity service not initialized"));
        };
        let (Some(entity), Some(user_id)) = (ctx.entity.as_ref(), ctx.user_id.as_deref()) else {
            return Ok(tool_failure("memory_add", "no entity or user bound to this call"));
        };
        let Some(content) = args.get("content").and_then(Value::as_str) else {
            return Ok(tool_failure("memory_add", "content is required"));
        };

        let node_type = parse_node_type(args.get("memory_type").and_then(Value::as_str));
        let importance = args
            .get("importance")
            .and_then(Value::as_f64)
            .unwrap_or(5.0);
        let node = MemoryNode::new(entity.id, user_id, node_type, content)
            .with_importance(importance)
            .with_tags(["user-directed"]);

        match service.add_memory(node).await? {
            Some(id) => Ok(PathwayInvocation {
                result: json!({"success": true, "id": id}),
                tool: Some("memory_add".to_string()),
                errors: vec![],
                warnings: vec![],
            }),
            None => Ok(tool_failure("memory_add", "memory index not configured")),
        }
    }
}

struct ForgetMeExecutor;

#[async_trait]
impl PathwayExecutor for ForgetMeExecutor {
    async fn execute(&self, args: Value, ctx: PathwayContext) -> Result<PathwayInvocation> {
        let Some(service) = continuity() else {
            return Ok(tool_failure("forget_me", "continuity service not initialized"));
        };
        let (Some(entity), Some(user_id)) = (ctx.entity.as_ref(), ctx.user_id.as_deref()) else {
            return Ok(tool_failure("forget_me", "no entity or user bound to this call"));
        };
        if !args.get("confirm").and_then(Value::as_bool).unwrap_or(false) {
            return Ok(tool_failure("forget_me", "confirmation required"));
        }

        let removed = service.forget_user(entity.id, user_id).await?;
        Ok(PathwayInvocation {
            result: json!({"success": true, "removed": removed}),
            tool: Some("forget_me".to_string()),
            errors: vec![],
            warnings: vec![],
        })
    }
}

pub(crate) struct MemorySearchExecutor;

#[async_trait]
impl PathwayExecutor for MemorySearchExecutor {
    async fn execute(&self, args: Value, ctx: PathwayContext) -> Result<PathwayInvocation> {
        let Some(service) = continuity() else {
            return Ok(tool_failure("memory_search", "continuity service not initialized"));
        };
        let (Some(entity), Some(user_id)) = (ctx.entity.as_ref(), ctx.user_id.as_deref()) else {
            return Ok(tool_failure("memory_search", "no entity or user bound to this call"));
        };
        let Some(query) = args.get("query").and_then(Value::as_str) else {
            return Ok(tool_failure("memory_search", "query is required"));
        };
        let limit = args.get("limit").and_then(Value::as_u64).unwrap_or(5) as usize;

        let nodes = service
            .search_memory(entity.id, user_id, query, limit.clamp(1, 20), None)
            .await?;
        let results: Vec<Value> = nodes
            .iter()
            .map(|n| {
                json!({
                    "id": n.id,
                    "type": n.node_type,
                    "content": n.content,
                    "importance": n.importance,
                })
            })
            .collect();
        Ok(PathwayInvocation {
            result: json!({"success": true, "results": results}),
            tool: Some("memory_search".to_string()),
            errors: vec![],
            warnings: vec![],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cold::InMemoryIndex;
    use crate::hot::InMemoryKv;
    use crate::model::TurnRole;
    use anima_config::{AppConfig, HotStoreConfig};
    use anima_llm::testing::ScriptedEndpoint;
    use anima_llm::ModelEndpoint;

    fn build_service(endpoint: Arc<ScriptedEndpoint>) -> Arc<ContinuityService> {
        let config = AppConfig::default();
        let hot = Arc::new(HotMemoryStore::new(
            Arc::new(InMemoryKv::new()),
            &HotStoreConfig::default(),
            &config.continuity,
        ));
        let cold = Arc::new(ColdMemoryIndex::new(
            Some(Arc::new(InMemoryIndex::new())),
            Some(endpoint.clone()),
            &config.continuity,
        ));
        let registry = Arc::new(PathwayRegistry::new());
        let mut models = config.models.clone();
        models.synthesis_model = endpoint.model().to_string();
        models.narrative_model = endpoint.model().to_string();
        register_continuity_pathways(&registry, &models).unwrap();

        let mut router = EndpointRouter::new();
        router.register(endpoint);

        Arc::new(ContinuityService::new(
            hot,
            cold,
            registry,
            router,
            &config.continuity,
            &models,
        ))
    }

    fn service() -> Arc<ContinuityService> {
        build_service(Arc::new(ScriptedEndpoint::new("scripted")))
    }

    #[tokio::test]
    async fn recorded_turns_are_durable_and_ordered() -> Result<()> {
        let svc = service();
        let entity = Uuid::new_v4();
        svc.record_turn(entity, "ana", EpisodicTurn::user("Hi, I'm Ana.")).await?;
        svc.record_turn(entity, "ana", EpisodicTurn::assistant("Hi Ana!")).await?;

        let turns = svc.hot().last_n(entity, "ana", 10).await?;
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, TurnRole::User);
        assert_eq!(turns[1].role, TurnRole::Assistant);
        Ok(())
    }

    #[tokio::test]
    async fn forced_session_reset_clears_stream_but_keeps_personality() -> Result<()> {
        let svc = service();
        let entity = Uuid::new_v4();
        svc.hot()
            .update_expression(entity, "ana", |s| {
                s.base_personality = "warm".to_string();
            })
            .await?;
        svc.record_turn(entity, "ana", EpisodicTurn::user("hello")).await?;
        let before = svc.get_session_info(entity, "ana").await?;

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert!(svc.init_session(entity, "ana", true).await?);

        let info = svc.get_session_info(entity, "ana").await?;
        assert_eq!(info.turn_count, 0);
        assert!(info.session_start_at > before.session_start_at);
        let expression = svc.get_expression(entity, "ana").await?;
        assert_eq!(expression.base_personality, "warm");
        Ok(())
    }

    #[tokio::test]
    async fn idle_gap_starts_a_fresh_session_on_record() -> Result<()> {
        let svc = service();
        let entity = Uuid::new_v4();
        svc.record_turn(entity, "ana", EpisodicTurn::user("first")).await?;

        // Simulate a 5-hour absence.
        svc.hot()
            .update_expression(entity, "ana", |s| {
                s.last_interaction_at = Some(Utc::now() - Duration::hours(5));
            })
            .await?;
        svc.record_turn(entity, "ana", EpisodicTurn::user("back again")).await?;

        let turns = svc.hot().last_n(entity, "ana", 10).await?;
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].content, "back again");
        Ok(())
    }

    #[tokio::test]
    async fn synthesis_writes_anchor_and_invalidates_cache() -> Result<()> {
        let endpoint = Arc::new(ScriptedEndpoint::new("scripted"));
        endpoint.push_text(
            "INSIGHT: 0.7 :: 8 :: Ana introduced herself; this is the start of our relationship.\n\
             TONE: warm :: first meeting",
        );
        let svc = build_service(endpoint);
        let entity = Uuid::new_v4();
        svc.record_turn(entity, "ana", EpisodicTurn::user("Hi, I'm Ana.")).await?;
        svc.record_turn(entity, "ana", EpisodicTurn::assistant("Nice to meet you, Ana!")).await?;
        svc.hot()
            .set_active_context(entity, "ana", crate::model::ActiveContext {
                narrative_context: "stale".to_string(),
                ..Default::default()
            })
            .await?;

        assert!(svc.trigger_synthesis(entity, "ana", SynthesisKind::Turn, SynthesisContext::default()));
        // Wait for the background pass to drain.
        for _ in 0..100 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            if svc.in_flight.lock().unwrap().is_empty() {
                break;
            }
        }

        let anchors = svc
            .get_memories_by_type(entity, "ana", MemoryNodeType::Anchor, 10)
            .await?;
        assert_eq!(anchors.len(), 1);
        assert!(anchors[0].content.contains("Ana"));
        assert!(svc.hot().get_active_context(entity, "ana").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_synthesis_triggers_drop() -> Result<()> {
        let svc = service();
        let entity = Uuid::new_v4();
        svc.record_turn(entity, "ana", EpisodicTurn::user("hello")).await?;

        let first = svc.trigger_synthesis(entity, "ana", SynthesisKind::Turn, SynthesisContext::default());
        let second = svc.trigger_synthesis(entity, "ana", SynthesisKind::Turn, SynthesisContext::default());
        assert!(first);
        assert!(!second, "re-entrant trigger must drop");
        Ok(())
    }

    #[tokio::test]
    async fn forget_user_clears_memory_and_hot_state() -> Result<()> {
        let svc = service();
        let entity = Uuid::new_v4();
        svc.record_turn(entity, "ana", EpisodicTurn::user("hi")).await?;
        svc.add_memory(MemoryNode::new(entity, "ana", MemoryNodeType::Anchor, "anchor")).await?;
        let mut artifact = MemoryNode::new(entity, "ana", MemoryNodeType::Artifact, "distilled");
        artifact.synthesized_from = vec![Uuid::new_v4()];
        svc.add_memory(artifact).await?;

        svc.forget_user(entity, "ana").await?;

        assert!(!svc.has_memories(entity, "ana").await?);
        assert!(svc.hot().last_n(entity, "ana", 10).await?.is_empty());
        let anon = svc
            .get_memories_by_type(entity, crate::model::ANONYMIZED_USER, MemoryNodeType::Artifact, 10)
            .await?;
        assert_eq!(anon.len(), 1);
        assert_eq!(anon[0].content, "distilled");
        Ok(())
    }

    #[tokio::test]
    async fn context_window_reuses_cache_until_drift() -> Result<()> {
        let endpoint = Arc::new(ScriptedEndpoint::new("scripted"));
        // One narrative summarization for the first build; the second build
        // must reuse the cache and make no further model calls.
        endpoint.push_text("Ana introduced herself and is planning a hiking trip.");
        let svc = build_service(endpoint.clone());
        let entity = Uuid::new_v4();
        svc.add_memory(MemoryNode::new(entity, "ana", MemoryNodeType::Anchor, "Ana is planning a hiking trip"))
            .await?;

        let first = svc
            .get_context_window(entity, "ana", "how is the hiking trip planning")
            .await?;
        assert!(first.contains("hiking"));
        let calls_after_first = endpoint.call_count();

        let second = svc
            .get_context_window(entity, "ana", "tell me about the hiking trip plan")
            .await?;
        assert!(second.contains("hiking"));
        assert_eq!(endpoint.call_count(), calls_after_first, "cached narrative reused");
        Ok(())
    }
}
