//! Continuity memory data model: long-term memory nodes, the hot episodic
//! stream, expression state, and resonance metrics.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Reserved user key that anonymized artifacts are re-inserted under
/// during a forget-me cascade.
pub const ANONYMIZED_USER: &str = "anonymized";

// ── Long-term memory nodes ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum MemoryNodeType {
    Core,
    Capability,
    Anchor,
    Artifact,
    Identity,
    Expression,
    Value,
    Episode,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SynthesisType {
    Consolidation,
    Insight,
    Pattern,
    Learning,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct EmotionalState {
    /// -1.0 (negative) .. 1.0 (positive).
    pub valence: f64,
    /// 0.0 .. 1.0.
    pub intensity: f64,
    pub user_impact: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RelationalContext {
    pub bond_strength: f64,
    pub communication_style: Vec<String>,
    pub shared_references: Vec<String>,
    pub user_values: Vec<String>,
    pub user_struggles: Vec<String>,
}

/// The atom of long-term memory.  Graph structure is ID-based adjacency
/// (`related_memory_ids`, `parent_memory_id`) -- no in-memory cycles;
/// expansion is explicit via the cold index's `expand_graph`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryNode {
    pub id: Uuid,
    pub entity_id: Uuid,
    pub user_id: String,
    #[serde(rename = "type")]
    pub node_type: MemoryNodeType,
    pub content: String,
    /// Fixed-dimension embedding; empty when generation failed -- the node
    /// stays reachable by filter and text search.
    #[serde(default)]
    pub content_vector: Vec<f32>,
    #[serde(default)]
    pub related_memory_ids: BTreeSet<Uuid>,
    #[serde(default)]
    pub parent_memory_id: Option<Uuid>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub timestamp: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    #[serde(default)]
    pub recall_count: u64,
    /// 1.0 ..= 10.0.
    pub importance: f64,
    /// 0.0 ..= 1.0.
    pub confidence: f64,
    /// 0.0 ..= 1.0.
    pub decay_rate: f64,
    #[serde(default)]
    pub emotional_state: Option<EmotionalState>,
    #[serde(default)]
    pub relational_context: Option<RelationalContext>,
    /// Source-node IDs for synthesized memories.
    #[serde(default)]
    pub synthesized_from: Vec<Uuid>,
    #[serde(default)]
    pub synthesis_type: Option<SynthesisType>,
}

impl MemoryNode {
    pub fn new(
        entity_id: Uuid,
        user_id: impl Into<String>,
        node_type: MemoryNodeType,
        content: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            entity_id,
            user_id: user_id.into(),
            node_type,
            content: content.into(),
            content_vector: Vec::new(),
            related_memory_ids: BTreeSet::new(),
            parent_memory_id: None,
            tags: BTreeSet::new(),
            timestamp: now,
            last_accessed: now,
            recall_count: 0,
            importance: 5.0,
            confidence: 0.7,
            decay_rate: 0.1,
            emotional_state: None,
            relational_context: None,
            synthesized_from: Vec::new(),
            synthesis_type: None,
        }
    }

    pub fn with_importance(mut self, importance: f64) -> Self {
        self.importance = importance.clamp(1.0, 10.0);
        self
    }

    pub fn with_tags<I: IntoIterator<Item = S>, S: Into<String>>(mut self, tags: I) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Strip personal payloads and rebind to the anonymized user key.
    /// Used by the forget-me cascade for artifacts with provenance.
    pub fn anonymized(&self) -> Self {
        let mut node = self.clone();
        node.id = Uuid::new_v4();
        node.user_id = ANONYMIZED_USER.to_string();
        node.synthesized_from = Vec::new();
        node.relational_context = None;
        node.emotional_state = None;
        node
    }
}

// ── Episodic stream ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodicTurn {
    pub role: TurnRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub emotional_tone: Option<String>,
    #[serde(default)]
    pub tools_used: Vec<String>,
}

impl EpisodicTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
            timestamp: Utc::now(),
            emotional_tone: None,
            tools_used: Vec::new(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
            emotional_tone: None,
            tools_used: Vec::new(),
        }
    }
}

// ── Active context cache ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActiveContext {
    pub current_relational_anchors: Vec<Uuid>,
    pub active_resonance_artifacts: Vec<Uuid>,
    pub narrative_context: String,
    pub current_expression_style: String,
    pub active_values: Vec<String>,
    pub last_updated: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

// ── Expression state ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct EmotionalResonance {
    pub valence: f64,
    pub intensity: f64,
}

/// The short-lived stylistic tone an entity projects right now.  No TTL;
/// reset explicitly on session start after long idle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExpressionState {
    pub base_personality: String,
    pub situational_adjustments: Vec<String>,
    pub emotional_resonance: EmotionalResonance,
    pub last_interaction_at: Option<DateTime<Utc>>,
    pub last_interaction_tone: Option<String>,
    pub session_start_at: Option<DateTime<Utc>>,
}

// ── Pulse task state ─────────────────────────────────────────────────────────

/// Bookkeeping for background "pulse" wakes; 24 h TTL in the hot store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PulseState {
    pub last_pulse_at: Option<DateTime<Utc>>,
    pub pending_topics: Vec<String>,
}

// ── Resonance metrics ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResonanceTrend {
    Warming,
    Cooling,
    Stable,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResonanceMetrics {
    pub anchor_rate: f64,
    pub shorthand_rate: f64,
    /// 0.0 ..= 1.0.
    pub emotional_range: f64,
    /// 0.0 ..= 1.0.
    pub attunement_ratio: f64,
    pub trend: ResonanceTrend,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymized_copy_strips_personal_payloads() {
        let entity = Uuid::new_v4();
        let mut node = MemoryNode::new(entity, "ana", MemoryNodeType::Artifact, "insight");
        node.synthesized_from = vec![Uuid::new_v4()];
        node.emotional_state = Some(EmotionalState { valence: 0.5, intensity: 0.8, user_impact: 0.2 });
        node.relational_context = Some(RelationalContext::default());

        let anon = node.anonymized();
        assert_ne!(anon.id, node.id);
        assert_eq!(anon.user_id, ANONYMIZED_USER);
        assert_eq!(anon.content, node.content);
        assert!(anon.synthesized_from.is_empty());
        assert!(anon.emotional_state.is_none());
        assert!(anon.relational_context.is_none());
    }

    #[test]
    fn node_type_serializes_uppercase() {
        let json = serde_json::to_string(&MemoryNodeType::Anchor).unwrap();
        assert_eq!(json, "\"ANCHOR\"");
    }

    #[test]
    fn importance_clamps_to_range() {
        let node = MemoryNode::new(Uuid::new_v4(), "u", MemoryNodeType::Core, "x")
            .with_importance(42.0);
        assert!((node.importance - 10.0).abs() < f64::EPSILON);
    }
}
