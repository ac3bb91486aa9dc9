//! Per-entity tool resolution: migration, `"*"` expansion, and schema
//! serialization.

use serde_json::Value;
use tracing::warn;

use anima_entity::Entity;

use crate::{PathwayRegistry, ToolDefinition};

/// Retired tool names mapped to their current replacements.  Applied
/// before filtering so stale entity documents keep working; duplicates
/// produced by migration coalesce.
pub const TOOL_MIGRATIONS: &[(&str, &str)] = &[
    ("generateimage", "createmedia"),
    ("generatevideo", "createmedia"),
    ("searchweb", "searchinternet"),
    ("rememberthis", "memory_add"),
    ("recallmemory", "memory_search"),
];

/// Map a (lowercased) tool name through the migration table.
pub fn migrate_tool_name(name: &str) -> &str {
    TOOL_MIGRATIONS
        .iter()
        .find(|(old, _)| *old == name)
        .map(|(_, new)| *new)
        .unwrap_or(name)
}

/// The effective tool surface for one entity.
#[derive(Debug, Clone, Default)]
pub struct EntityToolSet {
    /// Resolved tool names, lowercased, insertion-ordered.
    pub tool_names: Vec<String>,
    /// Function-calling schemas ready to send to the model.
    pub openai_schema: Vec<Value>,
}

/// Resolve an entity's `tools` list against the registry.
///
/// Names are lowercased, migrated, and deduplicated preserving order;
/// `"*"` expands to every registered tool.  Entity-local `custom_tools`
/// are validated and appended.  Unknown names are dropped with a warning.
pub fn tools_for_entity(entity: &Entity, registry: &PathwayRegistry) -> EntityToolSet {
    let mut names: Vec<String> = Vec::new();
    let mut push_unique = |name: String, names: &mut Vec<String>| {
        if !names.contains(&name) {
            names.push(name);
        }
    };

    for raw in &entity.tools {
        let normalized = raw.trim().to_lowercase();
        if normalized == "*" {
            for name in registry.tool_names() {
                push_unique(name, &mut names);
            }
        } else if !normalized.is_empty() {
            push_unique(migrate_tool_name(&normalized).to_string(), &mut names);
        }
    }

    let mut set = EntityToolSet::default();
    for name in names {
        match registry.resolve_tool(&name) {
            Some(pathway) => {
                let Some(ref definition) = pathway.tool_definition else { continue };
                set.tool_names.push(name);
                set.openai_schema.push(definition.to_openai_schema());
            }
            None => warn!(entity = %entity.name, tool = %name, "unknown tool granted to entity -- dropped"),
        }
    }

    for (name, raw) in &entity.custom_tools {
        let key = name.to_lowercase();
        if set.tool_names.contains(&key) {
            continue;
        }
        match ToolDefinition::parse(raw.clone()) {
            Ok(definition) => {
                set.tool_names.push(key);
                set.openai_schema.push(definition.to_openai_schema());
            }
            Err(err) => warn!(entity = %entity.name, tool = %name, %err, "invalid custom tool -- dropped"),
        }
    }

    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Pathway, PromptTemplate};
    use serde_json::json;

    fn registry_with_tools(names: &[&str]) -> PathwayRegistry {
        let registry = PathwayRegistry::new();
        for name in names {
            let definition = ToolDefinition::parse(json!({
                "type": "function",
                "icon": "x",
                "function": {
                    "name": name,
                    "description": format!("tool {name}"),
                    "parameters": {"type": "object"}
                }
            }))
            .unwrap();
            registry.register_pathway(
                Pathway::named(format!("{}_pathway", name.to_lowercase()))
                    .with_prompt(PromptTemplate::user("{{q}}").unwrap())
                    .with_tool_definition(definition),
            );
        }
        registry
    }

    #[test]
    fn star_expands_to_all_registered_tools() {
        let registry = registry_with_tools(&["SearchInternet", "CreateMedia"]);
        let mut entity = Entity::new("E");
        entity.tools = vec!["*".to_string()];

        let set = tools_for_entity(&entity, &registry);
        assert_eq!(set.tool_names, vec!["createmedia", "searchinternet"]);
        assert_eq!(set.openai_schema.len(), 2);
    }

    #[test]
    fn migration_rewrites_retired_names_and_coalesces() {
        let registry = registry_with_tools(&["CreateMedia"]);
        let mut entity = Entity::new("E");
        entity.tools = vec![
            "GenerateImage".to_string(),
            "generatevideo".to_string(),
            "createmedia".to_string(),
        ];

        let set = tools_for_entity(&entity, &registry);
        assert_eq!(set.tool_names, vec!["createmedia"]);
    }

    #[test]
    fn unknown_tools_are_dropped() {
        let registry = registry_with_tools(&["SearchInternet"]);
        let mut entity = Entity::new("E");
        entity.tools = vec!["searchinternet".to_string(), "nosuchtool".to_string()];

        let set = tools_for_entity(&entity, &registry);
        assert_eq!(set.tool_names, vec!["searchinternet"]);
    }

    #[test]
    fn schemas_are_stripped_of_internal_keys() {
        let registry = registry_with_tools(&["SearchInternet"]);
        let mut entity = Entity::new("E");
        entity.tools = vec!["searchinternet".to_string()];

        let set = tools_for_entity(&entity, &registry);
        assert!(set.openai_schema[0].get("icon").is_none());
    }

    #[test]
    fn custom_tools_append_after_grants() {
        let registry = registry_with_tools(&["SearchInternet"]);
        let mut entity = Entity::new("E");
        entity.tools = vec!["searchinternet".to_string()];
        entity.custom_tools.insert(
            "HouseLights".to_string(),
            json!({
                "type": "function",
                "function": {"name": "HouseLights", "description": "toggle", "parameters": {"type": "object"}}
            }),
        );
        entity
            .custom_tools
            .insert("Broken".to_string(), json!({"type": "function"}));

        let set = tools_for_entity(&entity, &registry);
        assert_eq!(set.tool_names, vec!["searchinternet", "houselights"]);
    }
}
