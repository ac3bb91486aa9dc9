//! Post-turn narrative synthesis.
//!
//! One structured-output LLM call per synthesis pass, using line-keyed
//! sections and a lenient parser -- unknown lines are ignored, `NONE`
//! answers drop out.  Extracted material maps onto cold-memory nodes:
//! relational insights become ANCHORs, topic resonance becomes ARTIFACTs,
//! identity notes become IDENTITY nodes, and expression adjustments patch
//! the hot expression state.  Every stage is best-effort; failures are
//! logged by the service layer and never block a turn.

use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use anima_config::ContinuityConfig;
use anima_llm::{ChatMessage, EndpointRouter, ToolChoice};

use crate::cold::{ColdMemoryIndex, cosine_similarity};
use crate::hot::HotMemoryStore;
use crate::model::{
    EmotionalState, EpisodicTurn, MemoryNode, MemoryNodeType, ResonanceMetrics, ResonanceTrend,
    SynthesisType, TurnRole,
};

// ── Structured synthesis output ──────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RelationalInsight {
    pub content: String,
    /// -1.0 .. 1.0.
    pub valence: f64,
    /// 1 ..= 10.
    pub importance: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityKind {
    Growth,
    Realization,
    Preference,
    Boundary,
}

impl IdentityKind {
    fn parse(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "growth" => Some(Self::Growth),
            "realization" => Some(Self::Realization),
            "preference" => Some(Self::Preference),
            "boundary" => Some(Self::Boundary),
            _ => None,
        }
    }

    fn tag(self) -> &'static str {
        match self {
            Self::Growth => "growth",
            Self::Realization => "realization",
            Self::Preference => "preference",
            Self::Boundary => "boundary",
        }
    }
}

#[derive(Debug, Clone)]
pub struct IdentityNote {
    pub content: String,
    pub kind: IdentityKind,
}

#[derive(Debug, Clone)]
pub struct TopicResonance {
    pub topic: String,
    pub feeling: String,
    pub conclusion: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExpressionAdjustment {
    pub suggested_tone: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct TurnSynthesis {
    pub relational_insights: Vec<RelationalInsight>,
    pub identity_notes: Vec<IdentityNote>,
    pub topic_resonance: Vec<TopicResonance>,
    pub expression_adjustment: Option<ExpressionAdjustment>,
    pub shorthand: Vec<String>,
}

/// Session synthesis extends the turn schema with anchor updates, new
/// resonance artifacts, identity evolution, and expression refinement.
#[derive(Debug, Clone, Default)]
pub struct SessionSynthesis {
    pub base: TurnSynthesis,
    /// `(anchor id prefix, updated content)`.
    pub anchor_updates: Vec<(String, String)>,
    /// `(content, importance)`.
    pub resonance_artifacts: Vec<(String, u8)>,
    pub identity_evolution: Vec<String>,
    pub expression_refinement: Option<String>,
}

/// Names injected into synthesis prompts.
#[derive(Debug, Clone)]
pub struct SynthesisContext {
    pub entity_name: String,
    pub user_name: String,
}

impl Default for SynthesisContext {
    fn default() -> Self {
        Self {
            entity_name: "the entity".to_string(),
            user_name: "the user".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthesisKind {
    Turn,
    Session,
}

// ── Prompts ──────────────────────────────────────────────────────────────────

fn conversation_block(turns: &[EpisodicTurn]) -> String {
    turns
        .iter()
        .map(|turn| {
            let speaker = match turn.role {
                TurnRole::User => "User",
                TurnRole::Assistant => "Assistant",
            };
            let content: String = turn.content.chars().take(400).collect();
            format!("{speaker}: {content}")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn turn_synthesis_prompt(turns: &[EpisodicTurn], ctx: &SynthesisContext) -> String {
    let conversation = conversation_block(turns);
    format!(
        "You are {entity}, reflecting on your latest exchange with {user}. \
Review the conversation and answer each section in the EXACT format shown, \
one answer per line. Use \"NONE\" when nothing applies.

CONVERSATION:
{conversation}

INSIGHT: <valence -1.0..1.0> :: <importance 1-10> :: <something durable about your relationship with {user}, or NONE>
INSIGHT: <optionally more, one per line>
IDENTITY: <growth|realization|preference|boundary> :: <a note about how you yourself are changing, or NONE>
TOPIC: <topic> :: <how it felt> :: <the conclusion you reached, or NONE>
TONE: <suggested tone for your next replies> :: <reason, or NONE>
SHORTHAND: <a private term or phrase the two of you now share, or NONE>

Only report what the conversation actually supports; when in doubt, use NONE.",
        entity = ctx.entity_name,
        user = ctx.user_name,
    )
}

pub fn session_synthesis_prompt(
    turns: &[EpisodicTurn],
    existing_anchors: &[MemoryNode],
    ctx: &SynthesisContext,
) -> String {
    let conversation = conversation_block(turns);
    let anchors = if existing_anchors.is_empty() {
        "  (none yet)".to_string()
    } else {
        existing_anchors
            .iter()
            .map(|node| {
                let id_short: String = node.id.to_string().chars().take(8).collect();
                let content: String = node.content.chars().take(180).collect();
                format!("  [{id_short}] {content}")
            })
            .collect::<Vec<_>>()
            .join("\n")
    };
    format!(
        "You are {entity}, consolidating a whole session with {user}. \
Prefer UPDATING an existing anchor over creating a near-duplicate. \
Answer each section in the EXACT format shown; use \"NONE\" when nothing applies.

SESSION CONVERSATION:
{conversation}

EXISTING ANCHORS (id | content):
{anchors}

INSIGHT: <valence -1.0..1.0> :: <importance 1-10> :: <new relational anchor, or NONE>
ANCHOR_UPDATE: <id> :: <updated content for that anchor, or NONE>
ARTIFACT: <importance 1-10> :: <a distilled insight from this session, or NONE>
EVOLUTION: <how you as {entity} evolved this session, or NONE>
IDENTITY: <growth|realization|preference|boundary> :: <identity note, or NONE>
TOPIC: <topic> :: <how it felt> :: <conclusion, or NONE>
SHORTHAND: <shared term, or NONE>
EXPRESSION: <a refined one-line base personality, or NONE>
TONE: <suggested tone> :: <reason, or NONE>",
        entity = ctx.entity_name,
        user = ctx.user_name,
    )
}

// ── Parsers ──────────────────────────────────────────────────────────────────

fn strip_key<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    line.strip_prefix(key).map(str::trim)
}

fn is_none(s: &str) -> bool {
    let low = s.trim().to_lowercase();
    low == "none" || low.is_empty()
}

fn split3(rest: &str) -> Option<(&str, &str, &str)> {
    let (a, bc) = rest.split_once("::")?;
    let (b, c) = bc.split_once("::")?;
    Some((a.trim(), b.trim(), c.trim()))
}

/// Lenient line parser for turn synthesis; unknown lines are ignored.
pub fn parse_turn_synthesis(reply: &str) -> TurnSynthesis {
    let mut out = TurnSynthesis::default();
    for line in reply.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(rest) = strip_key(line, "INSIGHT:") {
            if is_none(rest) {
                continue;
            }
            let Some((valence, importance, content)) = split3(rest) else { continue };
            if is_none(content) {
                continue;
            }
            let Ok(valence) = valence.parse::<f64>() else { continue };
            let Ok(importance) = importance.parse::<u8>() else { continue };
            out.relational_insights.push(RelationalInsight {
                content: content.to_string(),
                valence: valence.clamp(-1.0, 1.0),
                importance: importance.clamp(1, 10),
            });
        } else if let Some(rest) = strip_key(line, "IDENTITY:") {
            if is_none(rest) {
                continue;
            }
            let Some((kind, content)) = rest.split_once("::") else { continue };
            let (kind, content) = (kind.trim(), content.trim());
            if is_none(content) {
                continue;
            }
            let Some(kind) = IdentityKind::parse(kind) else { continue };
            out.identity_notes.push(IdentityNote { content: content.to_string(), kind });
        } else if let Some(rest) = strip_key(line, "TOPIC:") {
            if is_none(rest) {
                continue;
            }
            let Some((topic, feeling, conclusion)) = split3(rest) else { continue };
            out.topic_resonance.push(TopicResonance {
                topic: topic.to_string(),
                feeling: feeling.to_string(),
                conclusion: (!is_none(conclusion)).then(|| conclusion.to_string()),
            });
        } else if let Some(rest) = strip_key(line, "TONE:") {
            if is_none(rest) || out.expression_adjustment.is_some() {
                continue;
            }
            let (tone, reason) = rest.split_once("::").unwrap_or((rest, ""));
            out.expression_adjustment = Some(ExpressionAdjustment {
                suggested_tone: tone.trim().to_string(),
                reason: reason.trim().to_string(),
            });
        } else if let Some(rest) = strip_key(line, "SHORTHAND:") {
            if !is_none(rest) {
                out.shorthand.push(rest.to_string());
            }
        }
    }
    out
}

pub fn parse_session_synthesis(reply: &str) -> SessionSynthesis {
    let mut out = SessionSynthesis {
        base: parse_turn_synthesis(reply),
        ..Default::default()
    };
    for line in reply.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(rest) = strip_key(line, "ANCHOR_UPDATE:") {
            if is_none(rest) {
                continue;
            }
            if let Some((id, content)) = rest.split_once("::") {
                let (id, content) = (id.trim(), content.trim());
                if !id.is_empty() && !is_none(content) {
                    out.anchor_updates.push((id.to_string(), content.to_string()));
                }
            }
        } else if let Some(rest) = strip_key(line, "ARTIFACT:") {
            if is_none(rest) {
                continue;
            }
            if let Some((importance, content)) = rest.split_once("::") {
                let (importance, content) = (importance.trim(), content.trim());
                if let Ok(importance) = importance.parse::<u8>() {
                    if !is_none(content) {
                        out.resonance_artifacts
                            .push((content.to_string(), importance.clamp(1, 10)));
                    }
                }
            }
        } else if let Some(rest) = strip_key(line, "EVOLUTION:") {
            if !is_none(rest) {
                out.identity_evolution.push(rest.to_string());
            }
        } else if let Some(rest) = strip_key(line, "EXPRESSION:") {
            if !is_none(rest) && out.expression_refinement.is_none() {
                out.expression_refinement = Some(rest.to_string());
            }
        }
    }
    out
}

// ── Resonance metrics ────────────────────────────────────────────────────────

/// Metrics for one synthesis event, before blending.
pub fn compute_resonance(synthesis: &TurnSynthesis, turn_count: usize) -> ResonanceMetrics {
    let turns = turn_count.max(1) as f64;
    let insights = &synthesis.relational_insights;
    let (emotional_range, attunement_ratio) = if insights.is_empty() {
        (0.0, 0.0)
    } else {
        let max = insights.iter().map(|i| i.valence).fold(f64::MIN, f64::max);
        let min = insights.iter().map(|i| i.valence).fold(f64::MAX, f64::min);
        let positive = insights.iter().filter(|i| i.valence > 0.0).count() as f64;
        (((max - min) / 2.0).clamp(0.0, 1.0), positive / insights.len() as f64)
    };
    ResonanceMetrics {
        anchor_rate: insights.len() as f64 / turns,
        shorthand_rate: synthesis.shorthand.len() as f64 / turns,
        emotional_range,
        attunement_ratio,
        trend: ResonanceTrend::Unknown,
    }
}

/// Threshold a per-signal delta must clear to count toward the trend.
const TREND_EPSILON: f64 = 0.05;

/// Exponential moving average blend; the trend derives from how many of
/// the three relational signals moved past the threshold.
pub fn blend_resonance(
    prior: Option<ResonanceMetrics>,
    current: ResonanceMetrics,
    alpha: f64,
) -> ResonanceMetrics {
    let Some(prior) = prior else {
        return ResonanceMetrics { trend: ResonanceTrend::Unknown, ..current };
    };
    let mix = |old: f64, new: f64| old * (1.0 - alpha) + new * alpha;
    let blended = ResonanceMetrics {
        anchor_rate: mix(prior.anchor_rate, current.anchor_rate),
        shorthand_rate: mix(prior.shorthand_rate, current.shorthand_rate),
        emotional_range: mix(prior.emotional_range, current.emotional_range),
        attunement_ratio: mix(prior.attunement_ratio, current.attunement_ratio),
        trend: ResonanceTrend::Stable,
    };
    let deltas = [
        blended.anchor_rate - prior.anchor_rate,
        blended.emotional_range - prior.emotional_range,
        blended.attunement_ratio - prior.attunement_ratio,
    ];
    let positive = deltas.iter().filter(|d| **d > TREND_EPSILON).count();
    let negative = deltas.iter().filter(|d| **d < -TREND_EPSILON).count();
    let trend = if positive >= 2 {
        ResonanceTrend::Warming
    } else if negative >= 2 {
        ResonanceTrend::Cooling
    } else {
        ResonanceTrend::Stable
    };
    ResonanceMetrics { trend, ..blended }
}

// ── Synthesizer ──────────────────────────────────────────────────────────────

/// How many episodic turns a turn-level pass consumes.
const TURN_WINDOW: usize = 10;
/// How many existing anchors the session pass shows the model.
const SESSION_ANCHOR_WINDOW: usize = 20;

pub struct NarrativeSynthesizer {
    hot: Arc<HotMemoryStore>,
    cold: Arc<ColdMemoryIndex>,
    router: EndpointRouter,
    synthesis_model: String,
    min_insight_importance: u8,
    ema_alpha: f64,
    deep_days_to_look_back: i64,
    deep_max_memories: usize,
    deep_merge_cosine: f64,
}

impl NarrativeSynthesizer {
    pub fn new(
        hot: Arc<HotMemoryStore>,
        cold: Arc<ColdMemoryIndex>,
        router: EndpointRouter,
        synthesis_model: impl Into<String>,
        config: &ContinuityConfig,
    ) -> Self {
        Self {
            hot,
            cold,
            router,
            synthesis_model: synthesis_model.into(),
            min_insight_importance: config.min_insight_importance,
            ema_alpha: config.resonance_ema_alpha,
            deep_days_to_look_back: config.deep_days_to_look_back,
            deep_max_memories: config.deep_max_memories,
            deep_merge_cosine: config.deep_merge_cosine,
        }
    }

    async fn ask(&self, prompt: String) -> Result<String> {
        let endpoint = self.router.resolve(Some(&self.synthesis_model))?;
        let response = endpoint
            .chat(&[ChatMessage::user(prompt)], None, ToolChoice::None)
            .await?;
        Ok(response.content)
    }

    /// Turn-level synthesis over the most recent episodic window.
    /// Returns the IDs of every node written.
    #[instrument(skip(self, ctx), fields(entity = %entity_id, user = user_id))]
    pub async fn run_turn_synthesis(
        &self,
        entity_id: Uuid,
        user_id: &str,
        ctx: &SynthesisContext,
    ) -> Result<Vec<Uuid>> {
        let turns = self.hot.last_n(entity_id, user_id, TURN_WINDOW).await?;
        if turns.is_empty() {
            return Ok(Vec::new());
        }

        let reply = self.ask(turn_synthesis_prompt(&turns, ctx)).await?;
        let synthesis = parse_turn_synthesis(&reply);
        let written = self
            .apply_turn_synthesis(entity_id, user_id, &synthesis)
            .await?;
        self.update_resonance(entity_id, user_id, &synthesis, turns.len())
            .await?;
        info!(written = written.len(), "turn synthesis complete");
        Ok(written)
    }

    /// Map parsed turn synthesis onto cold-memory nodes and the hot
    /// expression state.
    pub async fn apply_turn_synthesis(
        &self,
        entity_id: Uuid,
        user_id: &str,
        synthesis: &TurnSynthesis,
    ) -> Result<Vec<Uuid>> {
        let mut written = Vec::new();

        for insight in &synthesis.relational_insights {
            if insight.importance < self.min_insight_importance {
                debug!(importance = insight.importance, "insight below threshold -- dropped");
                continue;
            }
            let node = MemoryNode::new(entity_id, user_id, MemoryNodeType::Anchor, &insight.content)
                .with_importance(insight.importance as f64)
                .with_tags(["auto-synthesized", "turn-synthesis"]);
            let node = MemoryNode {
                emotional_state: Some(EmotionalState {
                    valence: insight.valence,
                    intensity: insight.importance as f64 / 10.0,
                    user_impact: 0.0,
                }),
                ..node
            };
            if let Some(id) = self.cold.upsert_memory(node).await? {
                written.push(id);
            }
        }

        for topic in &synthesis.topic_resonance {
            // Topics that never reached a conclusion are noise.
            let Some(ref conclusion) = topic.conclusion else { continue };
            let content = format!("{} ({}): {}", topic.topic, topic.feeling, conclusion);
            let node = MemoryNode::new(entity_id, user_id, MemoryNodeType::Artifact, content)
                .with_importance(5.0)
                .with_tags(["auto-synthesized", "turn-synthesis"]);
            if let Some(id) = self.cold.upsert_memory(node).await? {
                written.push(id);
            }
        }

        for note in &synthesis.identity_notes {
            let node = MemoryNode::new(entity_id, user_id, MemoryNodeType::Identity, &note.content)
                .with_tags(["auto-synthesized", note.kind.tag()]);
            if let Some(id) = self.cold.upsert_memory(node).await? {
                written.push(id);
            }
        }

        for shorthand in &synthesis.shorthand {
            let node = MemoryNode::new(entity_id, user_id, MemoryNodeType::Artifact, shorthand)
                .with_importance(4.0)
                .with_tags(["auto-synthesized", "shorthand"]);
            if let Some(id) = self.cold.upsert_memory(node).await? {
                written.push(id);
            }
        }

        if let Some(ref adjustment) = synthesis.expression_adjustment {
            let tone = adjustment.suggested_tone.clone();
            self.hot
                .update_expression(entity_id, user_id, |state| {
                    state.situational_adjustments.push(tone.clone());
                    if state.situational_adjustments.len() > 5 {
                        let overflow = state.situational_adjustments.len() - 5;
                        state.situational_adjustments.drain(..overflow);
                    }
                    state.last_interaction_tone = Some(tone.clone());
                })
                .await?;
        }

        Ok(written)
    }

    /// Session-level synthesis: the whole episodic stream plus existing
    /// anchors, so the model can update rather than duplicate.
    pub async fn run_session_synthesis(
        &self,
        entity_id: Uuid,
        user_id: &str,
        ctx: &SynthesisContext,
    ) -> Result<Vec<Uuid>> {
        let turns = self.hot.last_n(entity_id, user_id, usize::MAX).await?;
        self.run_session_synthesis_over(entity_id, user_id, &turns, ctx)
            .await
    }

    /// Session synthesis over an explicit turn list.  Used on session
    /// rollover, where the stream has already been cleared for the new
    /// session and the old turns were captured first.
    #[instrument(skip(self, turns, ctx), fields(entity = %entity_id, user = user_id, turns = turns.len()))]
    pub async fn run_session_synthesis_over(
        &self,
        entity_id: Uuid,
        user_id: &str,
        turns: &[EpisodicTurn],
        ctx: &SynthesisContext,
    ) -> Result<Vec<Uuid>> {
        if turns.is_empty() {
            return Ok(Vec::new());
        }
        let anchors = self
            .cold
            .get_by_type(entity_id, user_id, MemoryNodeType::Anchor, SESSION_ANCHOR_WINDOW)
            .await?;

        let reply = self
            .ask(session_synthesis_prompt(turns, &anchors, ctx))
            .await?;
        let synthesis = parse_session_synthesis(&reply);

        let mut written = self
            .apply_turn_synthesis(entity_id, user_id, &synthesis.base)
            .await?;

        for (id_prefix, content) in &synthesis.anchor_updates {
            let Some(anchor) = anchors
                .iter()
                .find(|a| a.id.to_string().starts_with(id_prefix.as_str()))
            else {
                warn!(id_prefix, "anchor update names unknown anchor -- skipping");
                continue;
            };
            let mut updated = anchor.clone();
            updated.content = content.clone();
            updated.content_vector = Vec::new();
            updated.last_accessed = Utc::now();
            if let Some(id) = self.cold.upsert_memory(updated).await? {
                written.push(id);
            }
        }

        for (content, importance) in &synthesis.resonance_artifacts {
            let node = MemoryNode::new(entity_id, user_id, MemoryNodeType::Artifact, content)
                .with_importance(*importance as f64)
                .with_tags(["auto-synthesized", "session-synthesis"]);
            let node = MemoryNode {
                synthesis_type: Some(SynthesisType::Insight),
                ..node
            };
            if let Some(id) = self.cold.upsert_memory(node).await? {
                written.push(id);
            }
        }

        for evolution in &synthesis.identity_evolution {
            let node = MemoryNode::new(entity_id, user_id, MemoryNodeType::Identity, evolution)
                .with_tags(["auto-synthesized", "identity-evolution"]);
            let node = MemoryNode {
                synthesis_type: Some(SynthesisType::Learning),
                ..node
            };
            if let Some(id) = self.cold.upsert_memory(node).await? {
                written.push(id);
            }
        }

        if let Some(ref refinement) = synthesis.expression_refinement {
            let refinement = refinement.clone();
            self.hot
                .update_expression(entity_id, user_id, |state| {
                    state.base_personality = refinement.clone();
                })
                .await?;
        }

        self.update_resonance(entity_id, user_id, &synthesis.base, turns.len())
            .await?;
        info!(written = written.len(), "session synthesis complete");
        Ok(written)
    }

    /// Periodic consolidation across sessions: merge near-duplicate
    /// anchors by true cosine similarity, then ask the model for
    /// cross-session patterns.
    #[instrument(skip(self, ctx), fields(entity = %entity_id, user = user_id))]
    pub async fn run_deep_synthesis(
        &self,
        entity_id: Uuid,
        user_id: &str,
        ctx: &SynthesisContext,
    ) -> Result<Vec<Uuid>> {
        let since = Utc::now() - Duration::days(self.deep_days_to_look_back);
        let nodes = self
            .cold
            .search_full_text(
                entity_id,
                user_id,
                "",
                crate::cold::FullTextOptions {
                    since: Some(since),
                    limit: self.deep_max_memories,
                    ..Default::default()
                },
            )
            .await?;
        if nodes.is_empty() {
            return Ok(Vec::new());
        }
        let mut written = Vec::new();
        let mut merged: std::collections::HashSet<Uuid> = std::collections::HashSet::new();

        // Cheap pass first: exact-content duplicates collapse by hash,
        // keeping the most important copy.
        let mut by_hash: std::collections::HashMap<String, &MemoryNode> =
            std::collections::HashMap::new();
        for node in nodes.iter().filter(|n| n.node_type == MemoryNodeType::Anchor) {
            let digest = Sha256::digest(node.content.trim().to_lowercase().as_bytes());
            let hash = format!("{digest:x}");
            match by_hash.get(&hash) {
                Some(kept) => {
                    let drop_id = if kept.importance >= node.importance { node.id } else { kept.id };
                    if kept.importance < node.importance {
                        by_hash.insert(hash, node);
                    }
                    self.cold.delete_memory(drop_id).await?;
                    merged.insert(drop_id);
                }
                None => {
                    by_hash.insert(hash, node);
                }
            }
        }

        // Merge near-duplicate anchors (cosine over stored vectors).
        let anchors: Vec<&MemoryNode> = nodes
            .iter()
            .filter(|n| {
                n.node_type == MemoryNodeType::Anchor
                    && !n.content_vector.is_empty()
                    && !merged.contains(&n.id)
            })
            .collect();
        for i in 0..anchors.len() {
            if merged.contains(&anchors[i].id) {
                continue;
            }
            for j in (i + 1)..anchors.len() {
                if merged.contains(&anchors[j].id) {
                    continue;
                }
                let similarity =
                    cosine_similarity(&anchors[i].content_vector, &anchors[j].content_vector);
                if similarity < self.deep_merge_cosine {
                    continue;
                }
                let keep = if anchors[i].importance >= anchors[j].importance {
                    (anchors[i], anchors[j])
                } else {
                    (anchors[j], anchors[i])
                };
                let node = MemoryNode::new(entity_id, user_id, MemoryNodeType::Anchor, &keep.0.content)
                    .with_importance(keep.0.importance.max(keep.1.importance))
                    .with_tags(["auto-synthesized", "deep-synthesis"]);
                let node = MemoryNode {
                    synthesized_from: vec![keep.0.id, keep.1.id],
                    synthesis_type: Some(SynthesisType::Consolidation),
                    emotional_state: keep.0.emotional_state,
                    ..node
                };
                if let Some(id) = self.cold.upsert_memory(node).await? {
                    written.push(id);
                }
                self.cold.delete_memories(&[anchors[i].id, anchors[j].id]).await?;
                merged.insert(anchors[i].id);
                merged.insert(anchors[j].id);
                break;
            }
        }

        // Pattern finding across what survived.
        let listing = nodes
            .iter()
            .filter(|n| !merged.contains(&n.id))
            .take(60)
            .map(|n| {
                let content: String = n.content.chars().take(160).collect();
                format!("  [{:?}] {content}", n.node_type)
            })
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "You are {entity} reviewing {user}'s long-term memory for recurring \
patterns across sessions. For each real pattern, output one line:\n\
PATTERN: <the pattern, stated as a durable insight>\n\
Output NONE if there are no patterns.\n\nMEMORIES:\n{listing}",
            entity = ctx.entity_name,
            user = ctx.user_name,
        );
        let reply = self.ask(prompt).await?;
        for line in reply.lines() {
            if let Some(rest) = strip_key(line.trim(), "PATTERN:") {
                if is_none(rest) {
                    continue;
                }
                let node = MemoryNode::new(entity_id, user_id, MemoryNodeType::Artifact, rest)
                    .with_importance(6.0)
                    .with_tags(["auto-synthesized", "deep-synthesis"]);
                let node = MemoryNode {
                    synthesis_type: Some(SynthesisType::Pattern),
                    ..node
                };
                if let Some(id) = self.cold.upsert_memory(node).await? {
                    written.push(id);
                }
            }
        }

        info!(written = written.len(), "deep synthesis complete");
        Ok(written)
    }

    async fn update_resonance(
        &self,
        entity_id: Uuid,
        user_id: &str,
        synthesis: &TurnSynthesis,
        turn_count: usize,
    ) -> Result<()> {
        let current = compute_resonance(synthesis, turn_count);
        let prior = self.hot.get_resonance(entity_id, user_id).await?;
        let blended = blend_resonance(prior, current, self.ema_alpha);
        self.hot.set_resonance(entity_id, user_id, &blended).await
    }
}
