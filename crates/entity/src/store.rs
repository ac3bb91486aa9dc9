//! Document-store contract for entities, plus the in-memory reference
//! implementation used by tests and single-process deployments.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crate::Entity;

/// One document per entity, keyed by `id`.  System entities are addressable
/// by `(name, is_system = true)` with case-insensitive name matching.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<Entity>>;
    async fn put(&self, entity: Entity) -> Result<()>;
    async fn delete(&self, id: Uuid) -> Result<bool>;
    async fn find_system_by_name(&self, name: &str) -> Result<Option<Entity>>;
    /// All entities visible to `user_id` (system entities included).
    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Entity>>;
    /// The entity flagged `is_default`, if any.
    async fn find_default(&self) -> Result<Option<Entity>>;
}

#[derive(Default)]
pub struct InMemoryEntityStore {
    entities: RwLock<HashMap<Uuid, Entity>>,
}

impl InMemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EntityStore for InMemoryEntityStore {
    async fn get(&self, id: Uuid) -> Result<Option<Entity>> {
        Ok(self.entities.read().unwrap().get(&id).cloned())
    }

    async fn put(&self, entity: Entity) -> Result<()> {
        self.entities.write().unwrap().insert(entity.id, entity);
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        Ok(self.entities.write().unwrap().remove(&id).is_some())
    }

    async fn find_system_by_name(&self, name: &str) -> Result<Option<Entity>> {
        Ok(self
            .entities
            .read()
            .unwrap()
            .values()
            .find(|e| e.is_system && e.name.eq_ignore_ascii_case(name))
            .cloned())
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Entity>> {
        let mut visible: Vec<Entity> = self
            .entities
            .read()
            .unwrap()
            .values()
            .filter(|e| e.visible_to(user_id))
            .cloned()
            .collect();
        visible.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(visible)
    }

    async fn find_default(&self) -> Result<Option<Entity>> {
        Ok(self
            .entities
            .read()
            .unwrap()
            .values()
            .find(|e| e.is_default)
            .cloned())
    }
}
