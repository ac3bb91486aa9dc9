//! Two-tier continuity memory: a fast hot tier (episodic stream, active
//! context, expression state) over a KV backend, and a vector-indexed
//! cold tier of typed memory nodes with graph links, plus the synthesis
//! engine that turns conversations into durable memories.

pub mod cold;
pub mod context;
pub mod hot;
pub mod jsonl;
pub mod model;
pub mod service;
pub mod synthesis;

pub use cold::{
    ColdMemoryIndex, FullTextOptions, InMemoryIndex, IndexFilter, ScoredNode, SearchIndexBackend,
    cosine_similarity,
};
pub use context::{ContextBuilder, NARRATIVE_PATHWAY, has_topic_drifted};
pub use hot::{EncryptedKv, HotMemoryStore, InMemoryKv, KvBackend, RedbKv};
pub use jsonl::JsonlIndex;
pub use model::{
    ANONYMIZED_USER, ActiveContext, EmotionalResonance, EmotionalState, EpisodicTurn,
    ExpressionState, MemoryNode, MemoryNodeType, PulseState, RelationalContext, ResonanceMetrics,
    ResonanceTrend, SynthesisType, TurnRole,
};
pub use service::{
    ContinuityService, SessionInfo, continuity, init_continuity, register_continuity_pathways,
};
pub use synthesis::{
    ExpressionAdjustment, IdentityKind, IdentityNote, NarrativeSynthesizer, RelationalInsight,
    SessionSynthesis, SynthesisContext, SynthesisKind, TopicResonance, TurnSynthesis,
    blend_resonance, compute_resonance, parse_session_synthesis, parse_turn_synthesis,
};
