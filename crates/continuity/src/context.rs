//! Context-window assembly: merge the hot episodic stream, cached
//! narrative, expression state, and fresh semantic retrieval into one
//! system-prompt fragment.

use std::sync::Arc;

use anyhow::Result;
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use anima_config::ContinuityConfig;
use anima_llm::EndpointRouter;
use anima_pathway::{PathwayContext, PathwayRegistry};

use crate::cold::ColdMemoryIndex;
use crate::hot::HotMemoryStore;
use crate::model::{ActiveContext, EpisodicTurn, ExpressionState, MemoryNode, MemoryNodeType, TurnRole};

/// Pathway used for narrative summarization of retrieved memories.
pub const NARRATIVE_PATHWAY: &str = "continuity_narrative";

/// Episodic turns shown in the context block.
const RECENT_TURN_WINDOW: usize = 20;

pub struct ContextBuilder {
    hot: Arc<HotMemoryStore>,
    cold: Arc<ColdMemoryIndex>,
    registry: Arc<PathwayRegistry>,
    router: EndpointRouter,
    memory_limit: usize,
    drift_threshold: f64,
    graph_expansion: bool,
    graph_expansion_depth: usize,
}

impl ContextBuilder {
    pub fn new(
        hot: Arc<HotMemoryStore>,
        cold: Arc<ColdMemoryIndex>,
        registry: Arc<PathwayRegistry>,
        router: EndpointRouter,
        config: &ContinuityConfig,
    ) -> Self {
        Self {
            hot,
            cold,
            registry,
            router,
            memory_limit: config.memory_limit,
            drift_threshold: config.drift_threshold,
            graph_expansion: config.graph_expansion,
            graph_expansion_depth: config.graph_expansion_depth,
        }
    }

    /// Build the full context block for one turn.
    pub async fn build(&self, entity_id: Uuid, user_id: &str, query: &str) -> Result<String> {
        let (turns, expression, cached) = tokio::join!(
            self.hot.last_n(entity_id, user_id, RECENT_TURN_WINDOW),
            self.hot.get_expression(entity_id, user_id),
            self.hot.get_active_context(entity_id, user_id),
        );
        let turns = turns?;
        let expression = expression?;
        let cached = cached?;

        let (narrative, memories) = match cached {
            Some(cache) if !has_topic_drifted(query, &cache.narrative_context, self.drift_threshold) => {
                debug!(%entity_id, user_id, "active context reused -- no topic drift");
                let ids: Vec<Uuid> = cache
                    .current_relational_anchors
                    .iter()
                    .chain(cache.active_resonance_artifacts.iter())
                    .copied()
                    .collect();
                let memories = self.cold.get_by_ids(&ids).await?;
                (cache.narrative_context, memories)
            }
            _ => self.refresh_context(entity_id, user_id, query).await?,
        };

        Ok(format_context_block(&narrative, &expression, &turns, &memories))
    }

    /// The expensive path: semantic retrieval, optional graph expansion,
    /// narrative summarization, and active-context write-back.
    async fn refresh_context(
        &self,
        entity_id: Uuid,
        user_id: &str,
        query: &str,
    ) -> Result<(String, Vec<MemoryNode>)> {
        let relevant = self
            .cold
            .search_semantic(entity_id, user_id, query, self.memory_limit, None)
            .await?;

        let mut memories = relevant.clone();
        if self.graph_expansion && !relevant.is_empty() {
            let expanded = self
                .cold
                .expand_graph(&relevant, self.graph_expansion_depth)
                .await?;
            memories.extend(expanded);
        }

        let narrative = if memories.is_empty() {
            String::new()
        } else {
            self.summarize_narrative(query, &memories).await
        };

        let context = ActiveContext {
            current_relational_anchors: memories
                .iter()
                .filter(|n| n.node_type == MemoryNodeType::Anchor)
                .map(|n| n.id)
                .collect(),
            active_resonance_artifacts: memories
                .iter()
                .filter(|n| n.node_type == MemoryNodeType::Artifact)
                .map(|n| n.id)
                .collect(),
            narrative_context: narrative.clone(),
            ..Default::default()
        };
        self.hot
            .set_active_context(entity_id, user_id, context)
            .await?;

        Ok((narrative, memories))
    }

    /// Ask the narrative pathway to compress retrieved memories into one
    /// short paragraph grounded in the current query.  On failure, fall
    /// back to a plain listing so the turn still gets its context.
    async fn summarize_narrative(&self, query: &str, memories: &[MemoryNode]) -> String {
        let contents: Vec<&str> = memories.iter().map(|n| n.content.as_str()).collect();
        let args = json!({ "query": query, "memories": contents });
        let ctx = PathwayContext::new(Arc::clone(&self.registry), self.router.clone());
        match self.registry.invoke(NARRATIVE_PATHWAY, args, ctx).await {
            Ok(invocation) => invocation.result_text(),
            Err(err) => {
                warn!(%err, "narrative summarization failed -- using raw listing");
                contents.join("; ")
            }
        }
    }
}

/// Cheap topic-drift check: Jaccard overlap of the query's token set
/// against the cached narrative.  Below the threshold counts as drift, as
/// does an empty cached narrative.
pub fn has_topic_drifted(query: &str, narrative: &str, threshold: f64) -> bool {
    if narrative.trim().is_empty() {
        return true;
    }
    let query_terms = tokenize(query);
    let narrative_terms = tokenize(narrative);
    if query_terms.is_empty() || narrative_terms.is_empty() {
        return true;
    }
    let intersection = query_terms.intersection(&narrative_terms).count() as f64;
    let union = query_terms.union(&narrative_terms).count() as f64;
    (intersection / union) < threshold
}

/// Common English stop words excluded from drift comparison.
const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "was", "has", "are", "not", "this", "that", "with", "from", "have",
    "you", "can", "its", "will", "but", "they", "all", "been", "also", "into", "more", "than",
    "when", "who", "what", "how", "out", "our", "new", "now", "about", "do", "me",
];

fn tokenize(text: &str) -> std::collections::BTreeSet<String> {
    text.split(|ch: char| !ch.is_alphanumeric())
        .filter(|t| t.len() >= 3)
        .map(str::to_lowercase)
        .filter(|t| !STOP_WORDS.contains(&t.as_str()))
        .collect()
}

fn format_context_block(
    narrative: &str,
    expression: &ExpressionState,
    turns: &[EpisodicTurn],
    memories: &[MemoryNode],
) -> String {
    let relational = if narrative.trim().is_empty() {
        "(no shared history yet)".to_string()
    } else {
        narrative.trim().to_string()
    };

    let mut expression_lines = Vec::new();
    if !expression.base_personality.is_empty() {
        expression_lines.push(format!("Base personality: {}", expression.base_personality));
    }
    if let Some(ref tone) = expression.last_interaction_tone {
        expression_lines.push(format!("Current tone: {tone}"));
    }
    if !expression.situational_adjustments.is_empty() {
        expression_lines.push(format!(
            "Recent adjustments: {}",
            expression.situational_adjustments.join("; ")
        ));
    }
    let expression_block = if expression_lines.is_empty() {
        "(neutral)".to_string()
    } else {
        expression_lines.join("\n")
    };

    let turns_block = if turns.is_empty() {
        "(none yet)".to_string()
    } else {
        turns
            .iter()
            .map(|turn| {
                let speaker = match turn.role {
                    TurnRole::User => "User",
                    TurnRole::Assistant => "Assistant",
                };
                let content: String = turn.content.chars().take(280).collect();
                format!("{speaker}: {content}")
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    let memories_block = if memories.is_empty() {
        "(none retrieved)".to_string()
    } else {
        memories
            .iter()
            .map(|node| {
                let content: String = node.content.chars().take(240).collect();
                format!("- [{:?}] {content}", node.node_type)
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        "Relational Context:\n{relational}\n\n\
         Expression State:\n{expression_block}\n\n\
         Recent Turns:\n{turns_block}\n\n\
         Retrieved Memories:\n{memories_block}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drift_detected_for_unrelated_query() {
        let narrative = "Ana has been planning a hiking trip through the mountains with her brother";
        assert!(has_topic_drifted("quarterly tax filing deadline", narrative, 0.15));
    }

    #[test]
    fn no_drift_for_overlapping_query() {
        let narrative = "Ana has been planning a hiking trip in the mountains";
        assert!(!has_topic_drifted("how is the mountains hiking trip planning going", narrative, 0.15));
    }

    #[test]
    fn empty_narrative_always_drifts() {
        assert!(has_topic_drifted("anything", "", 0.15));
    }

    #[test]
    fn block_carries_all_four_sections() {
        let expression = ExpressionState {
            base_personality: "warm".to_string(),
            last_interaction_tone: Some("playful".to_string()),
            ..Default::default()
        };
        let turns = vec![EpisodicTurn::user("hi"), EpisodicTurn::assistant("hello")];
        let memories = vec![MemoryNode::new(
            Uuid::new_v4(),
            "ana",
            MemoryNodeType::Anchor,
            "Ana loves hiking",
        )];

        let block = format_context_block("we talk about trips", &expression, &turns, &memories);
        assert!(block.contains("Relational Context:"));
        assert!(block.contains("Expression State:"));
        assert!(block.contains("Recent Turns:"));
        assert!(block.contains("Retrieved Memories:"));
        assert!(block.contains("[Anchor] Ana loves hiking"));
        assert!(block.contains("User: hi"));
        assert!(block.contains("Current tone: playful"));
    }
}
