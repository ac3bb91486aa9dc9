//! TTL-cached entity resolution over an [`EntityStore`].

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use lru::LruCache;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use anima_config::EntitiesConfig;

use crate::{Entity, EntityStore};

/// Cached entity documents held on the hot path.
const CACHE_CAPACITY: usize = 128;

/// Resolution layer over the document store.
///
/// Reads may be stale up to `cache_ttl`; tools that mutate an entity must
/// pass `fresh = true` to bypass the cache.
pub struct EntityService {
    store: Arc<dyn EntityStore>,
    cache: Mutex<LruCache<Uuid, (Instant, Entity)>>,
    cache_ttl: Duration,
    default_entity_name: String,
}

impl EntityService {
    pub fn new(store: Arc<dyn EntityStore>, config: &EntitiesConfig) -> Self {
        Self {
            store,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(CACHE_CAPACITY).expect("capacity is non-zero"),
            )),
            cache_ttl: Duration::from_secs(config.cache_ttl_secs),
            default_entity_name: config.default_entity_name.clone(),
        }
    }

    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.store
    }

    /// Get an entity by id.  `fresh = true` bypasses the TTL cache -- used
    /// by any tool that mutates the entity before re-reading it.
    pub async fn get_entity(&self, id: Uuid, fresh: bool) -> Result<Option<Entity>> {
        if !fresh {
            let mut cache = self.cache.lock().await;
            if let Some((stored_at, entity)) = cache.get(&id) {
                if stored_at.elapsed() < self.cache_ttl {
                    return Ok(Some(entity.clone()));
                }
                cache.pop(&id);
            }
        }

        let entity = self.store.get(id).await?;
        if let Some(ref entity) = entity {
            self.cache
                .lock()
                .await
                .put(id, (Instant::now(), entity.clone()));
        }
        Ok(entity)
    }

    /// Resolve the effective entity for a request: an explicit id, or the
    /// default system entity when absent.
    pub async fn load_entity_config(&self, id: Option<Uuid>) -> Result<Entity> {
        match id {
            Some(id) => self
                .get_entity(id, false)
                .await?
                .with_context(|| format!("entity {id} not found")),
            None => self.default_entity().await,
        }
    }

    async fn default_entity(&self) -> Result<Entity> {
        if let Some(entity) = self.store.find_default().await? {
            return Ok(entity);
        }
        self.store
            .find_system_by_name(&self.default_entity_name)
            .await?
            .with_context(|| format!("default entity {} not found", self.default_entity_name))
    }

    pub async fn find_system_by_name(&self, name: &str) -> Result<Option<Entity>> {
        self.store.find_system_by_name(name).await
    }

    /// Write an entity document and drop any cached copy.
    pub async fn save_entity(&self, mut entity: Entity) -> Result<Entity> {
        entity.updated_at = chrono::Utc::now();
        self.cache.lock().await.pop(&entity.id);
        self.store.put(entity.clone()).await?;
        debug!(id = %entity.id, name = %entity.name, "entity saved");
        Ok(entity)
    }

    /// Ensure the default system entity exists, creating it on first boot.
    pub async fn bootstrap_default(&self) -> Result<Entity> {
        if let Some(existing) = self
            .store
            .find_system_by_name(&self.default_entity_name)
            .await?
        {
            return Ok(existing);
        }
        let mut entity = Entity::new(self.default_entity_name.clone());
        entity.is_system = true;
        entity.is_default = true;
        entity.tools = vec!["*".to_string()];
        entity.description = "Default hosted entity".to_string();
        self.store.put(entity.clone()).await?;
        info!(name = %entity.name, id = %entity.id, "default entity bootstrapped");
        Ok(entity)
    }
}
