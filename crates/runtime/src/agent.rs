//! The entity agent pathway: the composition root for one turn.
//!
//! Resolves the entity, opens the session, assembles the system prompt
//! from common instructions + identity + continuity context, runs the
//! tool-calling loop, records both turns, and fires turn synthesis.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use anima_config::ExecutorConfig;
use anima_continuity::{EpisodicTurn, SynthesisContext, SynthesisKind, continuity};
use anima_entity::{Entity, EntityService};
use anima_llm::{ChatMessage, EndpointRouter};
use anima_pathway::{
    PathwayContext, PathwayExecutor, PathwayInvocation, PathwayRegistry, tools_for_entity,
};

use crate::RuntimeError;
use crate::emitter::TurnEmitter;
use crate::executor::{TurnExecutor, TurnOutcome, TurnRequest};

pub const ENTITY_AGENT_PATHWAY: &str = "entity_agent";

/// Inputs for one agent turn.
#[derive(Debug, Clone)]
pub struct AgentTurnParams {
    pub entity_id: Option<Uuid>,
    pub user_id: String,
    pub query: String,
    /// Prior chat history (the query is appended as the last user turn).
    pub history: Vec<ChatMessage>,
    /// Voice-shaped common instructions instead of text-shaped ones.
    pub voice: bool,
    /// One-line summaries of files available to the entity this turn.
    pub available_files: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AgentTurnResult {
    pub text: String,
    pub tools_used: Vec<String>,
    pub rounds: usize,
    pub budget_used: f64,
    pub cancelled: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

pub struct EntityAgentPathway {
    entities: Arc<EntityService>,
    registry: Arc<PathwayRegistry>,
    executor: TurnExecutor,
    config: ExecutorConfig,
    tool_loop_model: String,
}

impl EntityAgentPathway {
    pub fn new(
        entities: Arc<EntityService>,
        registry: Arc<PathwayRegistry>,
        router: EndpointRouter,
        config: ExecutorConfig,
        tool_loop_model: impl Into<String>,
    ) -> Self {
        let executor = TurnExecutor::new(Arc::clone(&registry), router, config.clone());
        Self {
            entities,
            registry,
            executor,
            config,
            tool_loop_model: tool_loop_model.into(),
        }
    }

    /// Run one full turn.
    #[instrument(skip_all, fields(user = %params.user_id, query_len = params.query.len()))]
    pub async fn run_turn(
        &self,
        params: AgentTurnParams,
        emitter: &TurnEmitter,
        cancel: CancellationToken,
    ) -> Result<AgentTurnResult> {
        let entity = self
            .entities
            .load_entity_config(params.entity_id)
            .await
            .map_err(|err| RuntimeError::NotFound(err.to_string()))?;
        if !entity.visible_to(&params.user_id) {
            return Ok(AgentTurnResult {
                errors: vec![format!("entity {} is not available to this user", entity.name)],
                ..Default::default()
            });
        }

        let service = continuity();
        let mut warnings = Vec::new();

        // Session + context assembly (continuity degrades to empty when
        // the service is not initialized).
        let context = match service {
            Some(ref service) if entity.use_memory => {
                if let Err(err) = service.init_session(entity.id, &params.user_id, false).await {
                    warn!(%err, "session init failed -- continuing");
                }
                match service
                    .get_context_window(entity.id, &params.user_id, &params.query)
                    .await
                {
                    Ok(context) => context,
                    Err(err) => {
                        warn!(%err, "context assembly failed -- continuing without memory");
                        warnings.push("continuity context unavailable".to_string());
                        String::new()
                    }
                }
            }
            _ => String::new(),
        };

        let tool_set = tools_for_entity(&entity, &self.registry);
        let system_prompt = build_system_prompt(&entity, &context, params.voice, &params.available_files);

        let mut history = params.history.clone();
        history.push(ChatMessage::user(params.query.clone()));

        let model = entity
            .base_model
            .clone()
            .unwrap_or_else(|| self.tool_loop_model.clone());
        let request = TurnRequest {
            entity: entity.clone(),
            user_id: params.user_id.clone(),
            system_prompt,
            history,
            tool_schema: tool_set.openai_schema,
            model,
            budget: self.config.tool_budget,
        };

        let outcome = self.executor.execute(request, emitter, cancel).await?;

        // Record both turns and fire synthesis only for completed turns of
        // memory-bearing entities.
        if let Some(ref service) = continuity() {
            if entity.use_memory && !outcome.cancelled {
                let tools_used: Vec<String> =
                    outcome.tools_used.iter().map(|t| t.name.clone()).collect();
                let mut assistant_turn = EpisodicTurn::assistant(&outcome.text);
                assistant_turn.tools_used = tools_used;

                let recorded = async {
                    service
                        .record_turn(entity.id, &params.user_id, EpisodicTurn::user(&params.query))
                        .await?;
                    service
                        .record_turn(entity.id, &params.user_id, assistant_turn)
                        .await
                }
                .await;
                if let Err(err) = recorded {
                    warn!(%err, "turn recording failed");
                }

                service.trigger_synthesis(
                    entity.id,
                    &params.user_id,
                    SynthesisKind::Turn,
                    SynthesisContext {
                        entity_name: entity.name.clone(),
                        user_name: params.user_id.clone(),
                    },
                );
            }
        }

        info!(
            rounds = outcome.rounds,
            cancelled = outcome.cancelled,
            "agent turn finished"
        );
        Ok(into_result(outcome, warnings))
    }

    /// Session context handed to voice providers on connect and on their
    /// periodic refresh.
    pub async fn session_context(
        &self,
        entity_id: Option<Uuid>,
        user_id: &str,
    ) -> Result<crate::voice::EntitySessionContext> {
        let entity = self.entities.load_entity_config(entity_id).await?;
        let continuity_context = match continuity() {
            Some(service) if entity.use_memory => service
                .get_context_window(entity.id, user_id, "session start")
                .await
                .unwrap_or_default(),
            _ => String::new(),
        };
        Ok(crate::voice::EntitySessionContext {
            entity_name: entity.name,
            identity: entity.identity,
            continuity_context,
            use_memory: entity.use_memory,
        })
    }

    /// Register this agent as the `entity_agent` pathway (plus the
    /// `cortex_query` callback used by voice providers) so transports
    /// invoke it the same way they invoke every other pathway.
    pub fn register(self: Arc<Self>, registry: &PathwayRegistry) {
        registry.register_pathway(
            anima_pathway::Pathway::named(ENTITY_AGENT_PATHWAY).with_executor(self),
        );
        registry.register_pathway(
            anima_pathway::Pathway::named(crate::voice::CORTEX_QUERY_PATHWAY)
                .with_executor(Arc::new(crate::voice::CortexQueryPathway)),
        );
    }
}

fn into_result(outcome: TurnOutcome, warnings: Vec<String>) -> AgentTurnResult {
    AgentTurnResult {
        text: outcome.text,
        tools_used: outcome.tools_used.into_iter().map(|t| t.name).collect(),
        rounds: outcome.rounds,
        budget_used: outcome.budget_used,
        cancelled: outcome.cancelled,
        errors: outcome.errors,
        warnings,
    }
}

#[async_trait]
impl PathwayExecutor for EntityAgentPathway {
    async fn execute(&self, args: Value, ctx: PathwayContext) -> Result<PathwayInvocation> {
        let params = AgentTurnParams {
            entity_id: args
                .get("entity_id")
                .and_then(Value::as_str)
                .and_then(|s| Uuid::parse_str(s).ok())
                .or(ctx.entity.as_ref().map(|e| e.id)),
            user_id: args
                .get("user_id")
                .and_then(Value::as_str)
                .or(ctx.user_id.as_deref())
                .unwrap_or("anonymous")
                .to_string(),
            query: args
                .get("query")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            history: args
                .get("history")
                .map(crate::voice::history_from_wire)
                .unwrap_or_default(),
            voice: args.get("voice").and_then(Value::as_bool).unwrap_or(false),
            available_files: Vec::new(),
        };
        // Turn failures never escape the pathway surface: not-found and
        // friends come back as structured errors, anything unclassified is
        // logged with a request id and wrapped as an internal error.
        match self
            .run_turn(params, &TurnEmitter::sink(), CancellationToken::new())
            .await
        {
            Ok(result) => Ok(PathwayInvocation {
                result: Value::String(result.text),
                tool: None,
                errors: result.errors,
                warnings: result.warnings,
            }),
            Err(err) => {
                let request_id = Uuid::new_v4();
                error!(%request_id, %err, "agent turn failed");
                Ok(PathwayInvocation {
                    result: Value::String(String::new()),
                    tool: None,
                    errors: vec![RuntimeError::describe(&err)],
                    warnings: vec![],
                })
            }
        }
    }
}

/// Assemble the full system prompt: common instructions (voice- or
/// text-shaped), entity identity, continuity context, date/time, and the
/// available-files summary.
fn build_system_prompt(
    entity: &Entity,
    continuity_context: &str,
    voice: bool,
    available_files: &[String],
) -> String {
    let common = if voice {
        "You are speaking aloud. Keep replies short, natural, and speakable; \
         never read out markup, URLs, or code verbatim."
    } else {
        "Respond directly and specifically to the latest user message. \
         Use your tools when they genuinely help; never invent tool output."
    };

    let identity = if entity.identity.is_empty() {
        format!("You are {}. {}", entity.name, entity.description)
    } else {
        format!("You are {}. {}", entity.name, entity.identity)
    };

    let mut prompt = format!(
        "{identity}\n\n{common}\n\nCurrent date/time: {}",
        Utc::now().to_rfc3339()
    );
    if !continuity_context.is_empty() {
        prompt.push_str("\n\n");
        prompt.push_str(continuity_context);
    }
    if !available_files.is_empty() {
        prompt.push_str("\n\nAvailable files:\n");
        for file in available_files {
            prompt.push_str(&format!("- {file}\n"));
        }
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_prompt_shapes_for_voice() {
        let mut entity = Entity::new("Muse");
        entity.identity = "a thoughtful companion".to_string();

        let text = build_system_prompt(&entity, "Relational Context:\n(none)", false, &[]);
        assert!(text.contains("You are Muse."));
        assert!(text.contains("Relational Context"));
        assert!(text.contains("latest user message"));

        let voice = build_system_prompt(&entity, "", true, &["notes.txt (2 KB)".to_string()]);
        assert!(voice.contains("speaking aloud"));
        assert!(voice.contains("notes.txt"));
    }

    #[test]
    fn empty_identity_falls_back_to_description() {
        let mut entity = Entity::new("Muse");
        entity.description = "helps with writing".to_string();
        let prompt = build_system_prompt(&entity, "", false, &[]);
        assert!(prompt.contains("helps with writing"));
    }
}
