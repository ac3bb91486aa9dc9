//! Entity model and document-store contract.
//!
//! An entity is a persona bound to a UUID: identity text, tool grants,
//! model binding, memory flag, and user associations.  System entities are
//! looked up case-insensitively by name; non-system entities are visible to
//! a user only when that user appears in `assoc_user_ids`.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod service;
mod store;

pub use service::EntityService;
pub use store::{EntityStore, InMemoryEntityStore};

/// Reasoning depth requested from the bound model.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Low,
    #[default]
    Medium,
    High,
}

/// Optional sandboxed-workspace descriptor.  The workspace itself is an
/// external leaf; only the reference lives on the entity document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkspaceRef {
    pub container_id: String,
    pub image: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    /// Free-form self-description.  May be empty when continuity memory
    /// supplies the identity at prompt time.
    pub identity: String,
    pub is_system: bool,
    pub is_default: bool,
    pub use_memory: bool,
    pub base_model: Option<String>,
    pub reasoning_effort: ReasoningEffort,
    /// Ordered tool grants; `"*"` expands to every registered tool at
    /// resolution time.
    pub tools: Vec<String>,
    /// Entity-local tool definitions, keyed by function name.
    pub custom_tools: BTreeMap<String, serde_json::Value>,
    /// Users granted access.  Ignored for system entities.
    pub assoc_user_ids: BTreeSet<String>,
    pub avatar: Option<String>,
    pub voice: Option<String>,
    /// Name → encrypted blob; decryption happens in the leaf tools.
    pub secrets: BTreeMap<String, String>,
    pub workspace: Option<WorkspaceRef>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: String::new(),
            identity: String::new(),
            is_system: false,
            is_default: false,
            use_memory: true,
            base_model: None,
            reasoning_effort: ReasoningEffort::default(),
            tools: Vec::new(),
            custom_tools: BTreeMap::new(),
            assoc_user_ids: BTreeSet::new(),
            avatar: None,
            voice: None,
            secrets: BTreeMap::new(),
            workspace: None,
            created_by: "system".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether `user_id` may address this entity.
    pub fn visible_to(&self, user_id: &str) -> bool {
        self.is_system || self.assoc_user_ids.contains(user_id)
    }

    pub fn grant_user(&mut self, user_id: impl Into<String>) {
        self.assoc_user_ids.insert(user_id.into());
        self.updated_at = Utc::now();
    }
}
