//! Model-name → endpoint routing.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use anima_config::AppConfig;

use crate::{ModelEndpoint, OpenAiCompatEndpoint};

/// Read-mostly map from model name (case-insensitive) to its endpoint.
/// Built once at startup from configuration; shared via `Arc`.
#[derive(Default, Clone)]
pub struct EndpointRouter {
    endpoints: HashMap<String, Arc<dyn ModelEndpoint>>,
    default_model: Option<String>,
}

impl EndpointRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let mut router = Self::new();
        for endpoint_cfg in &config.models.endpoints {
            let endpoint = OpenAiCompatEndpoint::from_config(endpoint_cfg);
            router.register(Arc::new(endpoint));
        }
        if router.endpoints.is_empty() {
            anyhow::bail!("no model endpoints configured");
        }
        router.default_model = Some(config.models.tool_loop_model.clone());
        info!(endpoints = router.endpoints.len(), "endpoint router built");
        Ok(router)
    }

    pub fn register(&mut self, endpoint: Arc<dyn ModelEndpoint>) {
        self.endpoints
            .insert(endpoint.model().to_lowercase(), endpoint);
    }

    pub fn with_default(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    /// Resolve a model name to its endpoint.
    pub fn endpoint_for(&self, model: &str) -> Result<Arc<dyn ModelEndpoint>> {
        self.endpoints
            .get(&model.to_lowercase())
            .cloned()
            .with_context(|| format!("no endpoint registered for model {model}"))
    }

    /// Resolve an optional override against the configured default.
    pub fn resolve(&self, model: Option<&str>) -> Result<Arc<dyn ModelEndpoint>> {
        match model {
            Some(name) => self.endpoint_for(name),
            None => {
                let name = self
                    .default_model
                    .as_deref()
                    .context("no default model configured")?;
                self.endpoint_for(name)
            }
        }
    }

    pub fn models(&self) -> Vec<&str> {
        self.endpoints.values().map(|e| e.model()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedEndpoint;

    #[test]
    fn lookup_is_case_insensitive() {
        let mut router = EndpointRouter::new();
        router.register(Arc::new(ScriptedEndpoint::new("GPT-4o")));
        assert!(router.endpoint_for("gpt-4O").is_ok());
        assert!(router.endpoint_for("other").is_err());
    }

    #[test]
    fn resolve_falls_back_to_default() {
        let mut router = EndpointRouter::new();
        router.register(Arc::new(ScriptedEndpoint::new("base")));
        let router = router.with_default("base");
        assert_eq!(router.resolve(None).unwrap().model(), "base");
    }
}
