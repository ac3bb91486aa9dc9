//! End-to-end agent turns against scripted model endpoints: cold start
//! with synthesis, context-cache reuse, and visibility rejection.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use anima_config::AppConfig;
use anima_continuity::{
    ColdMemoryIndex, ContinuityService, HotMemoryStore, InMemoryIndex, InMemoryKv, MemoryNodeType,
    continuity, init_continuity, register_continuity_pathways,
};
use anima_entity::{Entity, EntityService, InMemoryEntityStore};
use anima_llm::testing::ScriptedEndpoint;
use anima_llm::{ChatResponse, EndpointRouter, ToolCall, ToolCallFunction};
use anima_pathway::{Pathway, PathwayRegistry, ToolDefinition};
use anima_runtime::{AgentTurnParams, EntityAgentPathway, TurnEmitter};

struct TestEnv {
    agent: Arc<EntityAgentPathway>,
    registry: Arc<PathwayRegistry>,
    router: EndpointRouter,
    entities: Arc<EntityService>,
    loop_endpoint: Arc<ScriptedEndpoint>,
    synthesis_endpoint: Arc<ScriptedEndpoint>,
    narrative_endpoint: Arc<ScriptedEndpoint>,
}

static ENV: OnceLock<TestEnv> = OnceLock::new();

fn env() -> &'static TestEnv {
    ENV.get_or_init(|| {
        let config = AppConfig::default();

        let loop_endpoint = Arc::new(ScriptedEndpoint::new("loop-model"));
        let synthesis_endpoint = Arc::new(ScriptedEndpoint::new("synthesis-model"));
        let narrative_endpoint = Arc::new(ScriptedEndpoint::new("narrative-model"));
        let mut router = EndpointRouter::new();
        router.register(loop_endpoint.clone());
        router.register(synthesis_endpoint.clone());
        router.register(narrative_endpoint.clone());

        let registry = Arc::new(PathwayRegistry::new());
        let mut models = config.models.clone();
        models.tool_loop_model = "loop-model".to_string();
        models.synthesis_model = "synthesis-model".to_string();
        models.narrative_model = "narrative-model".to_string();
        register_continuity_pathways(&registry, &models).unwrap();

        // One plain tool so tool-bearing turns have something to call.
        let echo_tool = ToolDefinition::parse(json!({
            "type": "function",
            "function": {"name": "Echo", "description": "echo", "parameters": {"type": "object"}}
        }))
        .unwrap();
        registry.register_pathway(
            Pathway::named("echo_pathway")
                .with_model("loop-model")
                .with_prompt(anima_pathway::PromptTemplate::user("Echo back: {{text}}").unwrap())
                .with_tool_definition(echo_tool),
        );

        let hot = Arc::new(HotMemoryStore::new(
            Arc::new(InMemoryKv::new()),
            &config.hot_store,
            &config.continuity,
        ));
        let cold = Arc::new(ColdMemoryIndex::new(
            Some(Arc::new(InMemoryIndex::new())),
            Some(synthesis_endpoint.clone()),
            &config.continuity,
        ));
        let service = Arc::new(ContinuityService::new(
            Arc::clone(&hot),
            Arc::clone(&cold),
            Arc::clone(&registry),
            router.clone(),
            &config.continuity,
            &models,
        ));
        init_continuity(service).unwrap();

        let entities = Arc::new(EntityService::new(
            Arc::new(InMemoryEntityStore::new()),
            &config.entities,
        ));

        let agent = Arc::new(EntityAgentPathway::new(
            Arc::clone(&entities),
            Arc::clone(&registry),
            router.clone(),
            config.executor.clone(),
            "loop-model",
        ));
        Arc::clone(&agent).register(&registry);

        TestEnv {
            agent,
            registry,
            router,
            entities,
            loop_endpoint,
            synthesis_endpoint,
            narrative_endpoint,
        }
    })
}

async fn make_entity(env: &TestEnv, name: &str, user: &str) -> Entity {
    let mut entity = Entity::new(name);
    entity.base_model = Some("loop-model".to_string());
    entity.use_memory = true;
    entity.tools = vec!["echo".to_string()];
    entity.grant_user(user);
    env.entities.save_entity(entity).await.unwrap()
}

fn params(entity: &Entity, user: &str, query: &str) -> AgentTurnParams {
    AgentTurnParams {
        entity_id: Some(entity.id),
        user_id: user.to_string(),
        query: query.to_string(),
        history: Vec::new(),
        voice: false,
        available_files: Vec::new(),
    }
}

async fn wait_for_anchor(entity_id: Uuid, user: &str) -> Vec<anima_continuity::MemoryNode> {
    let service = continuity().unwrap();
    for _ in 0..200 {
        let anchors = service
            .get_memories_by_type(entity_id, user, MemoryNodeType::Anchor, 10)
            .await
            .unwrap();
        if !anchors.is_empty() {
            return anchors;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    Vec::new()
}

/// Wait until the in-flight synthesis pass for this key has fully
/// finished (its cache invalidation included).  A probe trigger only
/// succeeds once the previous pass has drained.
async fn drain_synthesis(entity_id: Uuid, user: &str) {
    let service = continuity().unwrap();
    for _ in 0..200 {
        if service.trigger_synthesis(
            entity_id,
            user,
            anima_continuity::SynthesisKind::Turn,
            anima_continuity::SynthesisContext::default(),
        ) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn full_turn_pipeline() {
    let env = env();
    let entity = make_entity(env, "Muse", "ana").await;

    // ── Cold start: no memories yet ──────────────────────────────────────
    env.loop_endpoint.push_text("Nice to meet you, Ana!");
    env.synthesis_endpoint
        .push_text("INSIGHT: 0.7 :: 8 :: Ana introduced herself; the relationship begins.");

    let result = env
        .agent
        .run_turn(
            params(&entity, "ana", "Hi, I'm Ana."),
            &TurnEmitter::sink(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(!result.text.is_empty());
    assert!(result.errors.is_empty());

    let service = continuity().unwrap();
    let turns = service.hot().last_n(entity.id, "ana", 10).await.unwrap();
    assert_eq!(turns.len(), 2, "user and assistant turns are durable");

    let anchors = wait_for_anchor(entity.id, "ana").await;
    assert_eq!(anchors.len(), 1, "turn synthesis wrote an anchor");
    assert!(anchors[0].content.contains("Ana"));
    drain_synthesis(entity.id, "ana").await;

    // ── Second turn: fresh retrieval populates the context cache ─────────
    env.narrative_endpoint
        .push_text("Ana introduced herself and asked to be remembered.");
    env.loop_endpoint.push_text("You told me your name is Ana.");

    let result = env
        .agent
        .run_turn(
            params(&entity, "ana", "What do you remember about me?"),
            &TurnEmitter::sink(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(result.text.contains("Ana"));
    assert_eq!(env.narrative_endpoint.call_count(), 1);

    // The loop model's system prompt carries the continuity block.
    let loop_calls = env.loop_endpoint.calls();
    let system = loop_calls.last().unwrap().messages[0].content.clone().unwrap();
    assert!(system.contains("Relational Context"));
    assert!(system.contains("Ana introduced herself"));

    // ── Third turn, semantically close: cached narrative is reused ───────
    env.loop_endpoint.push_text("Just that you introduced yourself, Ana.");
    let result = env
        .agent
        .run_turn(
            params(&entity, "ana", "do you remember anything else about Ana being introduced"),
            &TurnEmitter::sink(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(!result.text.is_empty());
    assert_eq!(
        env.narrative_endpoint.call_count(),
        1,
        "no drift -- semantic search and narrative call are skipped"
    );

    // ── Tool-using turn: observation flows back, turn records tools ──────
    env.loop_endpoint
        .push_response(ChatResponse::with_tool_calls(vec![ToolCall {
            id: "c1".to_string(),
            kind: "function".to_string(),
            function: ToolCallFunction {
                name: "Echo".to_string(),
                arguments: json!({"text": "ping"}),
            },
        }]));
    env.loop_endpoint.push_text("echoed");
    env.loop_endpoint.push_text("tool output relayed");

    let result = env
        .agent
        .run_turn(
            params(&entity, "ana", "please echo something"),
            &TurnEmitter::sink(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(result.tools_used, vec!["echo_pathway".to_string()]);
    assert_eq!(result.rounds, 2);

    // ── Voice callback: cortex_query filters history and delegates ───────
    let voice_entity = make_entity(env, "VoiceMuse", "vee").await;
    env.loop_endpoint.push_text("We talked about the garden.");

    let ctx = anima_pathway::PathwayContext::new(Arc::clone(&env.registry), env.router.clone())
        .with_entity(voice_entity.clone())
        .with_user("vee");
    let invocation = env
        .registry
        .invoke(
            anima_runtime::CORTEX_QUERY_PATHWAY,
            json!({
                "query": "what were we discussing?",
                "history": [
                    {"role": "user", "content": "<INSTRUCTIONS>speak slowly</INSTRUCTIONS>"},
                    {"role": "user", "content": "my garden is overgrown"},
                    {"role": "assistant", "content": "tell me more"}
                ]
            }),
            ctx,
        )
        .await
        .unwrap();
    assert_eq!(invocation.result_text(), "We talked about the garden.");

    let voice_call = env.loop_endpoint.calls().into_iter().last().unwrap();
    let contents: Vec<String> = voice_call
        .messages
        .iter()
        .filter_map(|m| m.content.clone())
        .collect();
    assert!(contents.iter().any(|c| c.contains("my garden is overgrown")));
    assert!(!contents.iter().any(|c| c.contains("<INSTRUCTIONS>")));
    assert_eq!(
        voice_call.messages.last().unwrap().content.as_deref(),
        Some("what were we discussing?")
    );
    // Voice-shaped common instructions replace the text-shaped ones.
    assert!(contents[0].contains("speaking aloud"));
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_entity_surfaces_as_structured_not_found() {
    let env = env();

    let ctx = anima_pathway::PathwayContext::new(Arc::clone(&env.registry), env.router.clone())
        .with_user("ana");
    let invocation = env
        .registry
        .invoke(
            anima_runtime::ENTITY_AGENT_PATHWAY,
            json!({"entity_id": Uuid::new_v4(), "query": "hello"}),
            ctx,
        )
        .await
        .unwrap();

    assert_eq!(invocation.result_text(), "");
    assert_eq!(invocation.errors.len(), 1);
    assert!(invocation.errors[0].starts_with("not found:"));
}

#[tokio::test(flavor = "multi_thread")]
async fn invisible_entity_is_rejected_without_model_calls() {
    let env = env();
    let entity = make_entity(env, "Private", "owner").await;

    let result = env
        .agent
        .run_turn(
            params(&entity, "intruder", "hello?"),
            &TurnEmitter::sink(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(result.text.is_empty());
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].contains("not available"));
}
