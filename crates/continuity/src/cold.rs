//! Cold memory: typed, vector-searchable nodes with graph links.
//!
//! The raw index is an external service reached through
//! [`SearchIndexBackend`]; this module layers the behavior the runtime
//! owns -- recall re-ranking, graph expansion, debounced recall counting,
//! and the forget-me cascade.  An unconfigured index degrades every
//! operation to an empty result; nothing here raises to the caller on
//! missing infrastructure.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use anima_config::{ContinuityConfig, RecallWeights};
use anima_llm::ModelEndpoint;

use crate::model::{MemoryNode, MemoryNodeType};

// ── Backend contract ─────────────────────────────────────────────────────────

/// Filter applied by every query; `(entity_id, user_id)` partitions the
/// search space.
#[derive(Debug, Clone)]
pub struct IndexFilter {
    pub entity_id: Uuid,
    pub user_id: String,
    pub types: Option<Vec<MemoryNodeType>>,
    pub min_importance: Option<f64>,
    pub since: Option<DateTime<Utc>>,
    /// Case-insensitive substring over content and tags.
    pub text: Option<String>,
}

impl IndexFilter {
    pub fn scoped(entity_id: Uuid, user_id: impl Into<String>) -> Self {
        Self {
            entity_id,
            user_id: user_id.into(),
            types: None,
            min_importance: None,
            since: None,
            text: None,
        }
    }

    pub fn with_types(mut self, types: Vec<MemoryNodeType>) -> Self {
        self.types = Some(types);
        self
    }

    fn matches(&self, node: &MemoryNode) -> bool {
        if node.entity_id != self.entity_id || node.user_id != self.user_id {
            return false;
        }
        if let Some(ref types) = self.types {
            if !types.contains(&node.node_type) {
                return false;
            }
        }
        if let Some(min) = self.min_importance {
            if node.importance < min {
                return false;
            }
        }
        if let Some(since) = self.since {
            if node.timestamp < since {
                return false;
            }
        }
        if let Some(ref text) = self.text {
            let needle = text.to_lowercase();
            let in_content = node.content.to_lowercase().contains(&needle);
            let in_tags = node.tags.iter().any(|t| t.to_lowercase().contains(&needle));
            if !in_content && !in_tags {
                return false;
            }
        }
        true
    }
}

/// A candidate with the index's normalized vector score attached.
#[derive(Debug, Clone)]
pub struct ScoredNode {
    pub node: MemoryNode,
    /// 0.0 ..= 1.0; true cosine when a query embedding was available.
    pub vector_score: f64,
}

#[async_trait]
pub trait SearchIndexBackend: Send + Sync {
    async fn upsert(&self, node: MemoryNode) -> Result<()>;
    async fn delete(&self, id: Uuid) -> Result<bool>;
    async fn get_by_ids(&self, ids: &[Uuid]) -> Result<Vec<MemoryNode>>;
    /// Nearest candidates under `filter`.  An empty query vector falls
    /// back to recency order with zero vector scores.
    async fn vector_query(
        &self,
        filter: &IndexFilter,
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<ScoredNode>>;
    async fn filter_query(
        &self,
        filter: &IndexFilter,
        limit: usize,
        skip: usize,
    ) -> Result<Vec<MemoryNode>>;
    /// Bounded enumeration of one partition, newest first.
    async fn all_for(&self, entity_id: Uuid, user_id: &str, limit: usize) -> Result<Vec<MemoryNode>>;
}

/// Cosine similarity clamped to `[0, 1]`.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    (dot / (mag_a * mag_b)).clamp(0.0, 1.0) as f64
}

// ── In-memory backend ────────────────────────────────────────────────────────

#[derive(Default)]
pub struct InMemoryIndex {
    nodes: RwLock<HashMap<Uuid, MemoryNode>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every node, newest first.  Used by file-backed
    /// wrappers for compaction and by the export tooling.
    pub async fn dump(&self) -> Vec<MemoryNode> {
        let mut nodes: Vec<MemoryNode> = self.nodes.read().unwrap().values().cloned().collect();
        nodes.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        nodes
    }
}

#[async_trait]
impl SearchIndexBackend for InMemoryIndex {
    async fn upsert(&self, node: MemoryNode) -> Result<()> {
        self.nodes.write().unwrap().insert(node.id, node);
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        Ok(self.nodes.write().unwrap().remove(&id).is_some())
    }

    async fn get_by_ids(&self, ids: &[Uuid]) -> Result<Vec<MemoryNode>> {
        let nodes = self.nodes.read().unwrap();
        Ok(ids.iter().filter_map(|id| nodes.get(id).cloned()).collect())
    }

    async fn vector_query(
        &self,
        filter: &IndexFilter,
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<ScoredNode>> {
        let nodes = self.nodes.read().unwrap();
        let mut scored: Vec<ScoredNode> = nodes
            .values()
            .filter(|n| filter.matches(n))
            .map(|n| ScoredNode {
                vector_score: if vector.is_empty() {
                    0.0
                } else {
                    cosine_similarity(&n.content_vector, vector)
                },
                node: n.clone(),
            })
            .collect();
        scored.sort_by(|a, b| {
            b.vector_score
                .total_cmp(&a.vector_score)
                .then_with(|| b.node.timestamp.cmp(&a.node.timestamp))
        });
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn filter_query(
        &self,
        filter: &IndexFilter,
        limit: usize,
        skip: usize,
    ) -> Result<Vec<MemoryNode>> {
        let nodes = self.nodes.read().unwrap();
        let mut matches: Vec<MemoryNode> = nodes
            .values()
            .filter(|n| filter.matches(n))
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(matches.into_iter().skip(skip).take(limit).collect())
    }

    async fn all_for(&self, entity_id: Uuid, user_id: &str, limit: usize) -> Result<Vec<MemoryNode>> {
        let filter = IndexFilter::scoped(entity_id, user_id);
        self.filter_query(&filter, limit, 0).await
    }
}

// ── Cold memory index ────────────────────────────────────────────────────────

/// Options for [`ColdMemoryIndex::search_full_text`].
#[derive(Debug, Clone, Default)]
pub struct FullTextOptions {
    pub types: Option<Vec<MemoryNodeType>>,
    pub min_importance: Option<f64>,
    pub since: Option<DateTime<Utc>>,
    pub limit: usize,
    pub skip: usize,
}

pub struct ColdMemoryIndex {
    backend: Option<Arc<dyn SearchIndexBackend>>,
    embedder: Option<Arc<dyn ModelEndpoint>>,
    weights: RecallWeights,
    default_decay_rate: f64,
    recall_debounce: Duration,
    recall_top_n: usize,
}

impl ColdMemoryIndex {
    pub fn new(
        backend: Option<Arc<dyn SearchIndexBackend>>,
        embedder: Option<Arc<dyn ModelEndpoint>>,
        config: &ContinuityConfig,
    ) -> Self {
        Self {
            backend,
            embedder,
            weights: config.recall_weights,
            default_decay_rate: config.default_decay_rate,
            recall_debounce: Duration::seconds(config.recall_debounce_secs),
            recall_top_n: config.recall_top_n,
        }
    }

    /// An index with no backend: every operation is a no-op.
    pub fn unconfigured() -> Self {
        Self::new(None, None, &ContinuityConfig::default())
    }

    pub fn is_configured(&self) -> bool {
        self.backend.is_some()
    }

    async fn embed(&self, text: &str) -> Vec<f32> {
        let Some(ref embedder) = self.embedder else {
            return Vec::new();
        };
        match embedder.embed(&[text.to_string()]).await {
            Ok(mut vectors) if !vectors.is_empty() => vectors.remove(0),
            Ok(_) => Vec::new(),
            Err(err) => {
                warn!(%err, "embedding generation failed -- continuing without vector");
                Vec::new()
            }
        }
    }

    /// The authoritative recall score:
    /// `w_v·v + w_i·(importance/10) + w_r·exp(-Δdays·decay)`.
    fn recall_score(&self, candidate: &ScoredNode, now: DateTime<Utc>) -> f64 {
        let days = (now - candidate.node.last_accessed).num_seconds().max(0) as f64 / 86_400.0;
        let recency = (-days * self.default_decay_rate).exp();
        self.weights.vector * candidate.vector_score
            + self.weights.importance * (candidate.node.importance / 10.0)
            + self.weights.recency * recency
    }

    /// Semantic retrieval: embed the query, over-fetch 2× candidates,
    /// re-rank by recall score, trim to `limit`.  The top results get a
    /// best-effort, debounced recall-count bump.
    pub async fn search_semantic(
        &self,
        entity_id: Uuid,
        user_id: &str,
        query: &str,
        limit: usize,
        types: Option<Vec<MemoryNodeType>>,
    ) -> Result<Vec<MemoryNode>> {
        let Some(ref backend) = self.backend else {
            return Ok(Vec::new());
        };

        let query_vector = self.embed(query).await;
        let mut filter = IndexFilter::scoped(entity_id, user_id);
        filter.types = types;
        let candidates = backend
            .vector_query(&filter, &query_vector, limit.saturating_mul(2))
            .await?;

        let now = Utc::now();
        let mut ranked: Vec<(f64, ScoredNode)> = candidates
            .into_iter()
            .map(|c| (self.recall_score(&c, now), c))
            .collect();
        ranked.sort_by(|(sa, a), (sb, b)| {
            sb.total_cmp(sa)
                .then_with(|| b.node.timestamp.cmp(&a.node.timestamp))
        });
        ranked.truncate(limit);

        let results: Vec<MemoryNode> = ranked.into_iter().map(|(_, c)| c.node).collect();
        self.bump_recalls(backend, &results, now).await;
        Ok(results)
    }

    /// Best-effort `recall_count` increment for the top
    /// `min(limit, recall_top_n)` results, skipped when the node was
    /// accessed within the debounce window.  Failures are swallowed.
    async fn bump_recalls(
        &self,
        backend: &Arc<dyn SearchIndexBackend>,
        results: &[MemoryNode],
        now: DateTime<Utc>,
    ) {
        for node in results.iter().take(self.recall_top_n) {
            if now - node.last_accessed < self.recall_debounce {
                continue;
            }
            let mut updated = node.clone();
            updated.recall_count += 1;
            updated.last_accessed = now;
            if let Err(err) = backend.upsert(updated).await {
                debug!(%err, id = %node.id, "recall bump failed");
            }
        }
    }

    pub async fn search_full_text(
        &self,
        entity_id: Uuid,
        user_id: &str,
        query: &str,
        opts: FullTextOptions,
    ) -> Result<Vec<MemoryNode>> {
        let Some(ref backend) = self.backend else {
            return Ok(Vec::new());
        };
        let filter = IndexFilter {
            entity_id,
            user_id: user_id.to_string(),
            types: opts.types,
            min_importance: opts.min_importance,
            since: opts.since,
            // An empty query is a pure filter scan.
            text: (!query.is_empty()).then(|| query.to_string()),
        };
        let limit = if opts.limit == 0 { 20 } else { opts.limit };
        backend.filter_query(&filter, limit, opts.skip).await
    }

    pub async fn get_by_type(
        &self,
        entity_id: Uuid,
        user_id: &str,
        node_type: MemoryNodeType,
        limit: usize,
    ) -> Result<Vec<MemoryNode>> {
        let Some(ref backend) = self.backend else {
            return Ok(Vec::new());
        };
        let filter = IndexFilter::scoped(entity_id, user_id).with_types(vec![node_type]);
        backend.filter_query(&filter, limit, 0).await
    }

    pub async fn get_by_ids(&self, ids: &[Uuid]) -> Result<Vec<MemoryNode>> {
        match self.backend {
            Some(ref backend) => backend.get_by_ids(ids).await,
            None => Ok(Vec::new()),
        }
    }

    /// Importance-then-recency ordering, used for bootstrap context.
    pub async fn get_top_by_importance(
        &self,
        entity_id: Uuid,
        user_id: &str,
        types: Option<Vec<MemoryNodeType>>,
        limit: usize,
        min_importance: Option<f64>,
    ) -> Result<Vec<MemoryNode>> {
        let Some(ref backend) = self.backend else {
            return Ok(Vec::new());
        };
        let filter = IndexFilter {
            entity_id,
            user_id: user_id.to_string(),
            types,
            min_importance,
            since: None,
            text: None,
        };
        // Over-fetch so the importance sort sees the whole partition slice.
        let mut nodes = backend.filter_query(&filter, limit.saturating_mul(10).max(100), 0).await?;
        nodes.sort_by(|a, b| {
            b.importance
                .total_cmp(&a.importance)
                .then_with(|| b.timestamp.cmp(&a.timestamp))
        });
        nodes.truncate(limit);
        Ok(nodes)
    }

    pub async fn has_memories(&self, entity_id: Uuid, user_id: &str) -> Result<bool> {
        let Some(ref backend) = self.backend else {
            return Ok(false);
        };
        Ok(!backend.all_for(entity_id, user_id, 1).await?.is_empty())
    }

    /// Upsert a node, generating its embedding when absent.  Embedding
    /// failure inserts with an empty vector -- the node remains reachable
    /// by filter and text search.
    pub async fn upsert_memory(&self, mut node: MemoryNode) -> Result<Option<Uuid>> {
        let Some(ref backend) = self.backend else {
            return Ok(None);
        };
        if node.content_vector.is_empty() {
            node.content_vector = self.embed(&node.content).await;
        }
        let id = node.id;
        backend.upsert(node).await?;
        Ok(Some(id))
    }

    pub async fn delete_memory(&self, id: Uuid) -> Result<bool> {
        match self.backend {
            Some(ref backend) => backend.delete(id).await,
            None => Ok(false),
        }
    }

    pub async fn delete_memories(&self, ids: &[Uuid]) -> Result<usize> {
        let Some(ref backend) = self.backend else {
            return Ok(0);
        };
        let mut deleted = 0;
        for id in ids {
            if backend.delete(*id).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Bidirectional link; repeated links are idempotent because the
    /// adjacency sets dedupe.
    pub async fn link_memories(&self, a: Uuid, b: Uuid) -> Result<bool> {
        let Some(ref backend) = self.backend else {
            return Ok(false);
        };
        let nodes = backend.get_by_ids(&[a, b]).await?;
        let mut by_id: HashMap<Uuid, MemoryNode> =
            nodes.into_iter().map(|n| (n.id, n)).collect();
        let (Some(mut node_a), Some(mut node_b)) = (by_id.remove(&a), by_id.remove(&b)) else {
            return Ok(false);
        };
        node_a.related_memory_ids.insert(b);
        node_b.related_memory_ids.insert(a);
        backend.upsert(node_a).await?;
        backend.upsert(node_b).await?;
        Ok(true)
    }

    /// Per-hop cap on the batch fetch during graph expansion.
    const EXPANSION_BREADTH: usize = 50;

    /// Breadth-first expansion over `related ∪ {parent}` per node, `depth`
    /// hops, deduplicated against the seed set.  Returns only the newly
    /// discovered nodes; total breadth per hop is bounded by the batch
    /// fetch cap.
    pub async fn expand_graph(&self, seeds: &[MemoryNode], depth: usize) -> Result<Vec<MemoryNode>> {
        let Some(ref backend) = self.backend else {
            return Ok(Vec::new());
        };
        let mut seen: HashSet<Uuid> = seeds.iter().map(|n| n.id).collect();
        let mut frontier: Vec<MemoryNode> = seeds.to_vec();
        let mut discovered = Vec::new();

        for _ in 0..depth {
            let mut next_ids: Vec<Uuid> = Vec::new();
            for node in &frontier {
                for id in node
                    .related_memory_ids
                    .iter()
                    .chain(node.parent_memory_id.iter())
                {
                    if seen.insert(*id) {
                        next_ids.push(*id);
                    }
                }
            }
            next_ids.truncate(Self::EXPANSION_BREADTH);
            if next_ids.is_empty() {
                break;
            }
            frontier = backend.get_by_ids(&next_ids).await?;
            discovered.extend(frontier.iter().cloned());
        }
        Ok(discovered)
    }

    /// Bound on the forget-cascade enumeration.
    const FORGET_SCAN_LIMIT: usize = 10_000;

    /// The forget-me cascade: anchors are deleted; artifacts with
    /// provenance are anonymized and re-inserted under the anonymized
    /// user key; everything else is deleted.
    pub async fn cascading_forget(&self, entity_id: Uuid, user_id: &str) -> Result<usize> {
        let Some(ref backend) = self.backend else {
            return Ok(0);
        };
        let nodes = backend
            .all_for(entity_id, user_id, Self::FORGET_SCAN_LIMIT)
            .await?;
        let mut removed = 0;
        for node in nodes {
            if !node.synthesized_from.is_empty() && node.node_type != MemoryNodeType::Anchor {
                backend.upsert(node.anonymized()).await?;
            }
            if backend.delete(node.id).await? {
                removed += 1;
            }
        }
        debug!(%entity_id, user_id, removed, "cascading forget complete");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ANONYMIZED_USER;
    use anima_llm::testing::{ScriptedEndpoint, TEST_EMBED_DIM, embed_text};

    fn index() -> ColdMemoryIndex {
        ColdMemoryIndex::new(
            Some(Arc::new(InMemoryIndex::new())),
            Some(Arc::new(ScriptedEndpoint::new("embed"))),
            &ContinuityConfig::default(),
        )
    }

    fn node(entity: Uuid, user: &str, node_type: MemoryNodeType, content: &str) -> MemoryNode {
        let mut node = MemoryNode::new(entity, user, node_type, content);
        node.content_vector = embed_text(content, TEST_EMBED_DIM);
        node
    }

    #[tokio::test]
    async fn unconfigured_index_degrades_to_empty() -> Result<()> {
        let index = ColdMemoryIndex::unconfigured();
        let entity = Uuid::new_v4();
        assert!(index.search_semantic(entity, "u", "q", 5, None).await?.is_empty());
        assert!(!index.has_memories(entity, "u").await?);
        assert!(
            index
                .upsert_memory(MemoryNode::new(entity, "u", MemoryNodeType::Core, "x"))
                .await?
                .is_none()
        );
        assert_eq!(index.cascading_forget(entity, "u").await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn semantic_search_ranks_similar_content_first() -> Result<()> {
        let index = index();
        let entity = Uuid::new_v4();
        index
            .upsert_memory(node(entity, "ana", MemoryNodeType::Anchor, "ana loves hiking in the mountains"))
            .await?;
        index
            .upsert_memory(node(entity, "ana", MemoryNodeType::Artifact, "quarterly tax paperwork due"))
            .await?;

        let results = index
            .search_semantic(entity, "ana", "mountain hiking trip", 2, None)
            .await?;
        assert_eq!(results.len(), 2);
        assert!(results[0].content.contains("hiking"));
        Ok(())
    }

    #[tokio::test]
    async fn semantic_search_is_partition_scoped_and_type_filtered() -> Result<()> {
        let index = index();
        let entity = Uuid::new_v4();
        index
            .upsert_memory(node(entity, "ana", MemoryNodeType::Anchor, "shared joke about rubber ducks"))
            .await?;
        index
            .upsert_memory(node(entity, "bob", MemoryNodeType::Anchor, "shared joke about rubber ducks"))
            .await?;

        let all = index.search_semantic(entity, "ana", "rubber ducks", 10, None).await?;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].user_id, "ana");

        let typed = index
            .search_semantic(entity, "ana", "rubber ducks", 10, Some(vec![MemoryNodeType::Artifact]))
            .await?;
        assert!(typed.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn rank_is_stable_across_repeated_searches() -> Result<()> {
        let index = index();
        let entity = Uuid::new_v4();
        for content in ["rust async runtimes", "rust borrow checker", "gardening tips for spring"] {
            index
                .upsert_memory(node(entity, "ana", MemoryNodeType::Artifact, content))
                .await?;
        }

        let first: Vec<Uuid> = index
            .search_semantic(entity, "ana", "rust programming", 3, None)
            .await?
            .iter()
            .map(|n| n.id)
            .collect();
        let second: Vec<Uuid> = index
            .search_semantic(entity, "ana", "rust programming", 3, None)
            .await?
            .iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(first, second);
        Ok(())
    }

    #[tokio::test]
    async fn recall_bump_is_debounced_for_fresh_nodes() -> Result<()> {
        let backend = Arc::new(InMemoryIndex::new());
        let index = ColdMemoryIndex::new(
            Some(backend.clone()),
            Some(Arc::new(ScriptedEndpoint::new("embed"))),
            &ContinuityConfig::default(),
        );
        let entity = Uuid::new_v4();
        let fresh = node(entity, "ana", MemoryNodeType::Anchor, "fresh memory");
        let fresh_id = fresh.id;
        index.upsert_memory(fresh).await?;

        let mut stale = node(entity, "ana", MemoryNodeType::Anchor, "stale memory");
        stale.last_accessed = Utc::now() - Duration::hours(1);
        let stale_id = stale.id;
        index.upsert_memory(stale).await?;

        index.search_semantic(entity, "ana", "memory", 5, None).await?;

        let nodes = backend.get_by_ids(&[fresh_id, stale_id]).await?;
        let by_id: HashMap<Uuid, &MemoryNode> = nodes.iter().map(|n| (n.id, n)).collect();
        assert_eq!(by_id[&fresh_id].recall_count, 0, "fresh node is debounced");
        assert_eq!(by_id[&stale_id].recall_count, 1, "stale node gets the bump");
        Ok(())
    }

    #[tokio::test]
    async fn upsert_is_idempotent_by_id() -> Result<()> {
        let index = index();
        let entity = Uuid::new_v4();
        let mut n = node(entity, "ana", MemoryNodeType::Core, "first content");
        index.upsert_memory(n.clone()).await?;
        n.content = "second content".to_string();
        n.content_vector = Vec::new();
        index.upsert_memory(n.clone()).await?;

        let stored = index.get_by_ids(&[n.id]).await?;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].content, "second content");
        Ok(())
    }

    #[tokio::test]
    async fn link_memories_is_bidirectional_and_idempotent() -> Result<()> {
        let index = index();
        let entity = Uuid::new_v4();
        let a = node(entity, "ana", MemoryNodeType::Anchor, "a");
        let b = node(entity, "ana", MemoryNodeType::Artifact, "b");
        let (a_id, b_id) = (a.id, b.id);
        index.upsert_memory(a).await?;
        index.upsert_memory(b).await?;

        assert!(index.link_memories(a_id, b_id).await?);
        assert!(index.link_memories(a_id, b_id).await?);

        let nodes = index.get_by_ids(&[a_id, b_id]).await?;
        for n in &nodes {
            assert_eq!(n.related_memory_ids.len(), 1);
        }
        Ok(())
    }

    #[tokio::test]
    async fn graph_expansion_is_monotone_in_depth() -> Result<()> {
        let index = index();
        let entity = Uuid::new_v4();
        let a = node(entity, "ana", MemoryNodeType::Anchor, "seed");
        let b = node(entity, "ana", MemoryNodeType::Artifact, "hop one");
        let c = node(entity, "ana", MemoryNodeType::Artifact, "hop two");
        let (a_id, b_id, c_id) = (a.id, b.id, c.id);
        index.upsert_memory(a.clone()).await?;
        index.upsert_memory(b).await?;
        index.upsert_memory(c).await?;
        index.link_memories(a_id, b_id).await?;
        index.link_memories(b_id, c_id).await?;

        let seed = index.get_by_ids(&[a_id]).await?;
        let one = index.expand_graph(&seed, 1).await?;
        let two = index.expand_graph(&seed, 2).await?;

        let ids = |nodes: &[MemoryNode]| nodes.iter().map(|n| n.id).collect::<HashSet<_>>();
        assert_eq!(ids(&one), HashSet::from([b_id]));
        assert_eq!(ids(&two), HashSet::from([b_id, c_id]));
        assert!(ids(&two).is_superset(&ids(&one)));
        Ok(())
    }

    #[tokio::test]
    async fn forget_cascade_anonymizes_synthesized_artifacts() -> Result<()> {
        let index = index();
        let entity = Uuid::new_v4();
        for i in 0..3 {
            index
                .upsert_memory(node(entity, "ana", MemoryNodeType::Anchor, &format!("anchor {i}")))
                .await?;
        }
        let mut synthesized = node(entity, "ana", MemoryNodeType::Artifact, "distilled insight");
        synthesized.synthesized_from = vec![Uuid::new_v4()];
        index.upsert_memory(synthesized).await?;
        index
            .upsert_memory(node(entity, "ana", MemoryNodeType::Identity, "identity note"))
            .await?;

        index.cascading_forget(entity, "ana").await?;

        assert!(!index.has_memories(entity, "ana").await?);
        let anon = index
            .get_by_type(entity, ANONYMIZED_USER, MemoryNodeType::Artifact, 10)
            .await?;
        assert_eq!(anon.len(), 1);
        assert_eq!(anon[0].content, "distilled insight");
        assert!(anon[0].synthesized_from.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn full_text_search_filters_by_substring_and_importance() -> Result<()> {
        let index = index();
        let entity = Uuid::new_v4();
        let mut important = node(entity, "ana", MemoryNodeType::Artifact, "the duck plan for spring");
        important.importance = 8.0;
        let mut minor = node(entity, "ana", MemoryNodeType::Artifact, "duck pond maintenance notes");
        minor.importance = 2.0;
        index.upsert_memory(important).await?;
        index.upsert_memory(minor).await?;
        index
            .upsert_memory(node(entity, "ana", MemoryNodeType::Artifact, "tax paperwork"))
            .await?;

        let all = index
            .search_full_text(entity, "ana", "duck", FullTextOptions::default())
            .await?;
        assert_eq!(all.len(), 2);

        let filtered = index
            .search_full_text(
                entity,
                "ana",
                "duck",
                FullTextOptions { min_importance: Some(5.0), ..Default::default() },
            )
            .await?;
        assert_eq!(filtered.len(), 1);
        assert!(filtered[0].content.contains("plan"));
        Ok(())
    }

    #[tokio::test]
    async fn top_by_importance_sorts_importance_then_recency() -> Result<()> {
        let index = index();
        let entity = Uuid::new_v4();
        let mut low = node(entity, "ana", MemoryNodeType::Core, "low");
        low.importance = 3.0;
        let mut high = node(entity, "ana", MemoryNodeType::Core, "high");
        high.importance = 9.0;
        high.timestamp = Utc::now() - Duration::days(30);
        index.upsert_memory(low).await?;
        index.upsert_memory(high).await?;

        let top = index
            .get_top_by_importance(entity, "ana", None, 1, None)
            .await?;
        assert_eq!(top[0].content, "high");
        Ok(())
    }
}
