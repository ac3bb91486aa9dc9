use std::env;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// One configured model endpoint.
///
/// `api_key_env` names the environment variable holding the key so secrets
/// never land in the config file itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub name: String,
    /// Provider family: "chat", "completion", or "embedding".
    pub family: String,
    pub base_url: String,
    pub api_key_env: String,
    /// Requests per second enforced by the adapter; 0 disables limiting.
    pub requests_per_second: f64,
    /// Context window in tokens; drives observation compression.
    pub context_tokens: usize,
    /// Synthesize a streaming chat pathway for this model at startup.
    pub emulate_openai_chat_model: bool,
    /// Synthesize a completion pathway for this model at startup.
    pub emulate_openai_completion_model: bool,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            family: "chat".to_string(),
            base_url: "http://localhost:11434/v1".to_string(),
            api_key_env: String::new(),
            requests_per_second: 0.0,
            context_tokens: 128_000,
            emulate_openai_chat_model: false,
            emulate_openai_completion_model: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    /// Model used for the tool-calling loop and final synthesis.
    pub tool_loop_model: String,
    /// Model used by the narrative synthesizer.
    pub synthesis_model: String,
    /// Model used by the context builder's narrative summarization.
    pub narrative_model: String,
    /// Embedding model for memory vectors.
    pub embedding_model: String,
    pub endpoints: Vec<EndpointConfig>,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            tool_loop_model: "gpt-4o".to_string(),
            synthesis_model: "gpt-4o-mini".to_string(),
            narrative_model: "gpt-4o-mini".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            endpoints: Vec::new(),
        }
    }
}

/// Weights for the cold-index recall score.  Exposed as configuration
/// rather than hard-coded; the defaults follow the documented
/// `(0.7, 0.2, 0.1)` split.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RecallWeights {
    pub vector: f64,
    pub importance: f64,
    pub recency: f64,
}

impl Default for RecallWeights {
    fn default() -> Self {
        Self { vector: 0.7, importance: 0.2, recency: 0.1 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContinuityConfig {
    pub recall_weights: RecallWeights,
    /// Default decay rate used by the recency term: exp(-days * decay).
    pub default_decay_rate: f64,
    /// Bounded episodic stream capacity per (entity, user).
    pub episodic_capacity: usize,
    pub episodic_ttl_days: i64,
    pub active_context_ttl_secs: i64,
    pub pulse_ttl_hours: i64,
    /// Idle gap after which the next turn starts a fresh session.
    pub session_idle_hours: i64,
    /// Jaccard overlap below which the query is considered to have drifted.
    pub drift_threshold: f64,
    /// Semantic retrieval limit for context assembly.
    pub memory_limit: usize,
    pub graph_expansion: bool,
    pub graph_expansion_depth: usize,
    /// Insights below this importance are dropped during synthesis.
    pub min_insight_importance: u8,
    /// EMA blend factor for resonance metrics.
    pub resonance_ema_alpha: f64,
    pub deep_days_to_look_back: i64,
    pub deep_max_memories: usize,
    /// True-cosine threshold for merging near-duplicate anchors.
    pub deep_merge_cosine: f64,
    /// Skip the recall-count write when the node was accessed this recently.
    pub recall_debounce_secs: i64,
    /// How many of the top results get a recall-count bump.
    pub recall_top_n: usize,
}

impl Default for ContinuityConfig {
    fn default() -> Self {
        Self {
            recall_weights: RecallWeights::default(),
            default_decay_rate: 0.1,
            episodic_capacity: 50,
            episodic_ttl_days: 7,
            active_context_ttl_secs: 300,
            pulse_ttl_hours: 24,
            session_idle_hours: 4,
            drift_threshold: 0.15,
            memory_limit: 5,
            graph_expansion: true,
            graph_expansion_depth: 1,
            min_insight_importance: 6,
            resonance_ema_alpha: 0.3,
            deep_days_to_look_back: 7,
            deep_max_memories: 200,
            deep_merge_cosine: 0.9,
            recall_debounce_secs: 300,
            recall_top_n: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HotStoreConfig {
    /// Key namespace prefix: `{namespace}:{entityId}:{userId}:{field}`.
    pub namespace: String,
    /// "memory" or "redb".
    pub backend: String,
    pub redb_path: String,
    /// Name of the env var holding the hex-encoded 32-byte value key.
    /// Empty disables transparent encryption.
    pub encryption_key_env: String,
}

impl Default for HotStoreConfig {
    fn default() -> Self {
        Self {
            namespace: "anima".to_string(),
            backend: "memory".to_string(),
            redb_path: ".anima/hot.redb".to_string(),
            encryption_key_env: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathwaysConfig {
    /// Root directory scanned recursively for pathway TOML files.
    pub dir: String,
}

impl Default for PathwaysConfig {
    fn default() -> Self {
        Self { dir: "pathways".to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EntitiesConfig {
    /// Name of the default system entity bootstrapped at startup.
    pub default_entity_name: String,
    /// Entity cache staleness bound, bypassed by `fresh = true`.
    pub cache_ttl_secs: u64,
}

impl Default for EntitiesConfig {
    fn default() -> Self {
        Self {
            default_entity_name: "Anima".to_string(),
            cache_ttl_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Maximum tool rounds before the loop forces a final text answer.
    pub max_rounds: usize,
    /// Default per-turn tool budget.
    pub tool_budget: f64,
    /// Compress prior observations when the estimated context exceeds
    /// this fraction of the model's window.
    pub compression_fraction: f64,
    /// Prefix length kept when truncating an observation without a
    /// declared summarizer.
    pub truncate_prefix_chars: usize,
    /// Default tool timeout when a pathway declares none.
    pub default_tool_timeout_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_rounds: 5,
            tool_budget: 10.0,
            compression_fraction: 0.8,
            truncate_prefix_chars: 2000,
            default_tool_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self { log_level: "info".to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub models: ModelsConfig,
    pub continuity: ContinuityConfig,
    pub hot_store: HotStoreConfig,
    pub pathways: PathwaysConfig,
    pub entities: EntitiesConfig,
    pub executor: ExecutorConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(value) = env::var("ANIMA_PATHWAY_DIR") {
            if !value.is_empty() {
                config.pathways.dir = value;
            }
        }
        if let Ok(value) = env::var("ANIMA_LOG_LEVEL") {
            if !value.is_empty() {
                config.telemetry.log_level = value;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    /// Look up a configured endpoint by model name.
    pub fn endpoint_for(&self, model: &str) -> Option<&EndpointConfig> {
        self.models
            .endpoints
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(model))
    }
}
