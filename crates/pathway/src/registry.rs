//! Pathway loading and registration.
//!
//! Declarative pathways are TOML files loaded recursively from a directory
//! (a `shared/` subdirectory is skipped -- it holds fragments included via
//! `{{renderTemplate}}`).  Every pathway inherits defaults from the `base`
//! pathway, then applies its own file, then any user-supplied override.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use tracing::{error, info, warn};
use walkdir::WalkDir;

use anima_config::EndpointConfig;
use anima_entity::Entity;
use anima_llm::{ChatRole, EndpointRouter};

use crate::template::{Template, TemplateLibrary};
use crate::{
    Pathway, PathwayInvocation, PromptTemplate, Summarizer, ToolDefinition, TruncateSummarizer,
    run_all_prompts,
};

// ── Declarative file shape ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PathwayFile {
    pub name: Option<String>,
    /// Partials are template fragments for `{{renderTemplate}}`, not
    /// invocable pathways.
    pub partial: bool,
    /// Shorthand: a single user-message prompt.
    pub prompt: Option<String>,
    pub prompts: Vec<PromptFileEntry>,
    pub model: Option<String>,
    pub input_parameters: Option<Value>,
    pub use_input_chunking: Option<bool>,
    pub enable_duplicate_requests: Option<bool>,
    pub timeout_secs: Option<u64>,
    pub tool_cost: Option<f64>,
    /// When set, tool observations from this pathway are compressed to at
    /// most this many characters.
    pub summarize_max_chars: Option<usize>,
    pub tool_definition: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PromptFileEntry {
    pub messages: Vec<MessageFile>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MessageFile {
    pub role: String,
    pub content: String,
}

impl PathwayFile {
    /// Merge `self` over `base`: any field present here wins.
    fn merged_over(&self, base: &PathwayFile) -> PathwayFile {
        PathwayFile {
            name: self.name.clone().or_else(|| base.name.clone()),
            partial: self.partial,
            prompt: self.prompt.clone().or_else(|| base.prompt.clone()),
            prompts: if self.prompts.is_empty() { base.prompts.clone() } else { self.prompts.clone() },
            model: self.model.clone().or_else(|| base.model.clone()),
            input_parameters: self
                .input_parameters
                .clone()
                .or_else(|| base.input_parameters.clone()),
            use_input_chunking: self.use_input_chunking.or(base.use_input_chunking),
            enable_duplicate_requests: self
                .enable_duplicate_requests
                .or(base.enable_duplicate_requests),
            timeout_secs: self.timeout_secs.or(base.timeout_secs),
            tool_cost: self.tool_cost.or(base.tool_cost),
            summarize_max_chars: self.summarize_max_chars.or(base.summarize_max_chars),
            tool_definition: self
                .tool_definition
                .clone()
                .or_else(|| base.tool_definition.clone()),
        }
    }
}

// ── Registry ─────────────────────────────────────────────────────────────────

/// Snapshot of the shared-fragment templates, handed out per render.
#[derive(Default, Clone)]
pub struct PartialsLibrary {
    templates: HashMap<String, Template>,
}

impl TemplateLibrary for PartialsLibrary {
    fn lookup(&self, name: &str) -> Option<&Template> {
        self.templates.get(name)
    }
}

#[derive(Default)]
struct RegistryInner {
    /// Lowercased pathway name → pathway.
    pathways: HashMap<String, Arc<Pathway>>,
    /// Lowercased tool function name → pathway name.
    tools: HashMap<String, String>,
    partials: Arc<PartialsLibrary>,
}

/// Read-mostly after startup; `register` rebuilds the maps and swaps them
/// under the write lock, so hot reloads never leave a half-built registry
/// visible.
#[derive(Default)]
pub struct PathwayRegistry {
    inner: RwLock<RegistryInner>,
}

/// Everything an imperative pathway body may need: the registry (to invoke
/// other pathways), the endpoint router, the resolved entity, and global
/// constants injected into template scopes.
#[derive(Clone)]
pub struct PathwayContext {
    pub registry: Arc<PathwayRegistry>,
    pub router: EndpointRouter,
    pub entity: Option<Entity>,
    /// The requesting user, for pathways that touch per-user state.
    pub user_id: Option<String>,
    pub constants: Value,
}

impl PathwayContext {
    pub fn new(registry: Arc<PathwayRegistry>, router: EndpointRouter) -> Self {
        Self { registry, router, entity: None, user_id: None, constants: Value::Null }
    }

    pub fn with_entity(mut self, entity: Entity) -> Self {
        self.entity = Some(entity);
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_constants(mut self, constants: Value) -> Self {
        self.constants = constants;
        self
    }
}

impl PathwayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every pathway TOML under `dir` (recursively, skipping
    /// `shared/`), apply `overrides` by name, and swap the registry maps.
    /// A missing directory is a startup error.
    pub fn register(&self, dir: impl AsRef<Path>, overrides: &[PathwayFile]) -> Result<usize> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            error!(dir = %dir.display(), "pathway directory missing");
            anyhow::bail!("pathway directory {} does not exist", dir.display());
        }

        let override_map: HashMap<String, &PathwayFile> = overrides
            .iter()
            .filter_map(|o| o.name.as_ref().map(|n| (n.to_lowercase(), o)))
            .collect();

        let mut files: Vec<(String, PathwayFile)> = Vec::new();
        let mut partials = PartialsLibrary::default();
        let mut base: Option<PathwayFile> = None;

        for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
            let path = entry.path();
            if !entry.file_type().is_file() || path.extension().and_then(|e| e.to_str()) != Some("toml") {
                continue;
            }
            let in_shared = path
                .strip_prefix(dir)
                .ok()
                .is_some_and(|rel| rel.components().any(|c| c.as_os_str() == "shared"));

            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading pathway file {}", path.display()))?;
            let mut file: PathwayFile = toml::from_str(&raw)
                .with_context(|| format!("parsing pathway file {}", path.display()))?;

            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
            let name = file.name.clone().unwrap_or(stem);
            file.name = Some(name.clone());

            // `shared/` files are never pathways: they are template
            // fragments reachable only through `{{renderTemplate}}`, as is
            // any file flagged `partial = true`.
            if in_shared || file.partial {
                match Template::compile(file.prompt.as_deref().unwrap_or_default()) {
                    Ok(template) => {
                        partials.templates.insert(name, template);
                    }
                    Err(err) => warn!(pathway = %name, %err, "invalid partial template -- skipping"),
                }
                continue;
            }

            if name.eq_ignore_ascii_case("base") {
                base = Some(file);
                continue;
            }
            files.push((name, file));
        }

        let base = base.unwrap_or_default();
        let mut next = RegistryInner {
            partials: Arc::new(partials),
            ..Default::default()
        };

        for (name, file) in files {
            let mut effective = file.merged_over(&base);
            if let Some(override_file) = override_map.get(&name.to_lowercase()) {
                effective = override_file.merged_over(&effective);
            }
            match build_pathway(&name, &effective) {
                Ok(pathway) => Self::insert(&mut next, Arc::new(pathway)),
                Err(err) => {
                    error!(pathway = %name, %err, "pathway failed to load");
                    return Err(err);
                }
            }
        }

        let count = next.pathways.len();
        // Imperative registrations made before this call survive the swap.
        {
            let mut inner = self.inner.write().unwrap();
            for (key, pathway) in std::mem::take(&mut inner.pathways) {
                next.pathways.entry(key).or_insert(pathway);
            }
            for (tool, pathway_name) in std::mem::take(&mut inner.tools) {
                next.tools.entry(tool).or_insert(pathway_name);
            }
            *inner = next;
        }
        info!(count, dir = %dir.display(), "pathways registered");
        Ok(count)
    }

    /// Register a pathway built in code (imperative executors, generated
    /// model pathways, the entity agent).
    pub fn register_pathway(&self, pathway: Pathway) {
        let mut inner = self.inner.write().unwrap();
        Self::insert(&mut inner, Arc::new(pathway));
    }

    fn insert(inner: &mut RegistryInner, pathway: Arc<Pathway>) {
        let key = pathway.name.to_lowercase();
        if inner.pathways.contains_key(&key) {
            warn!(pathway = %pathway.name, "duplicate pathway name -- keeping first registration");
            return;
        }

        if let Some(ref definition) = pathway.tool_definition {
            if definition.enabled() {
                let tool_key = definition.function_name().to_lowercase();
                if let Some(existing) = inner.tools.get(&tool_key) {
                    warn!(
                        tool = %tool_key,
                        first = %existing,
                        second = %pathway.name,
                        "duplicate tool name -- keeping first registration"
                    );
                } else {
                    inner.tools.insert(tool_key, pathway.name.clone());
                }
            }
        }
        inner.pathways.insert(key, pathway);
    }

    /// Synthesize streaming pathways for models flagged for OpenAI
    /// emulation: `{model}_chat` passes messages straight through,
    /// `{model}_completion` wraps a bare prompt.
    pub fn generate_model_pathways(&self, endpoints: &[EndpointConfig]) -> Result<usize> {
        let mut generated = 0;
        for endpoint in endpoints {
            let slug = endpoint.name.to_lowercase().replace(['.', '/', ':'], "_");
            if endpoint.emulate_openai_chat_model {
                let pathway = Pathway::named(format!("{slug}_chat"))
                    .with_model(endpoint.name.clone())
                    .with_prompt(PromptTemplate::user("{{text}}")?);
                self.register_pathway(pathway);
                generated += 1;
            }
            if endpoint.emulate_openai_completion_model {
                let pathway = Pathway::named(format!("{slug}_completion"))
                    .with_model(endpoint.name.clone())
                    .with_prompt(PromptTemplate::user("{{{text}}}")?);
                self.register_pathway(pathway);
                generated += 1;
            }
        }
        Ok(generated)
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<Pathway>> {
        self.inner
            .read()
            .unwrap()
            .pathways
            .get(&name.to_lowercase())
            .cloned()
    }

    /// Resolve a tool function name (case-insensitive) to its pathway.
    pub fn resolve_tool(&self, tool_name: &str) -> Option<Arc<Pathway>> {
        let inner = self.inner.read().unwrap();
        let pathway_name = inner.tools.get(&tool_name.to_lowercase())?;
        inner.pathways.get(&pathway_name.to_lowercase()).cloned()
    }

    /// All registered tool function names (lowercased), sorted for
    /// deterministic `"*"` expansion.
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().unwrap().tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn pathway_count(&self) -> usize {
        self.inner.read().unwrap().pathways.len()
    }

    pub fn partials(&self) -> Arc<PartialsLibrary> {
        Arc::clone(&self.inner.read().unwrap().partials)
    }

    /// Invoke a pathway by name: the imperative executor when one is
    /// defined, otherwise the declarative prompt chain.
    pub async fn invoke(
        &self,
        name: &str,
        args: Value,
        ctx: PathwayContext,
    ) -> Result<PathwayInvocation> {
        let pathway = self
            .resolve(name)
            .with_context(|| format!("pathway {name} not found"))?;

        if let Some(executor) = pathway.executor.clone() {
            return executor.execute(args, ctx).await;
        }

        let result = run_all_prompts(&pathway, &args, &ctx).await?;
        Ok(PathwayInvocation::text(result))
    }
}

fn build_pathway(name: &str, file: &PathwayFile) -> Result<Pathway> {
    let mut pathway = Pathway::named(name);
    pathway.model = file.model.clone();
    pathway.use_input_chunking = file.use_input_chunking.unwrap_or(false);
    pathway.enable_duplicate_requests = file.enable_duplicate_requests.unwrap_or(false);
    pathway.timeout_secs = file.timeout_secs.unwrap_or(60);
    pathway.tool_cost = file.tool_cost.unwrap_or(1.0);

    if let Some(Value::Object(params)) = &file.input_parameters {
        pathway.input_parameters = params.clone();
    }

    if let Some(source) = &file.prompt {
        pathway.prompts.push(PromptTemplate::user(source)?);
    }
    for entry in &file.prompts {
        let mut messages = Vec::with_capacity(entry.messages.len());
        for message in &entry.messages {
            let role = match message.role.to_lowercase().as_str() {
                "system" => ChatRole::System,
                "assistant" => ChatRole::Assistant,
                // A tool-role message needs a tool_call_id correlated to a
                // preceding tool_calls entry, which a static prompt cannot
                // have.
                "tool" => anyhow::bail!(
                    "pathway {name}: role = \"tool\" is not allowed in prompt messages"
                ),
                _ => ChatRole::User,
            };
            messages.push((role, Template::compile(&message.content)?));
        }
        pathway.prompts.push(PromptTemplate { messages });
    }

    if let Some(max_chars) = file.summarize_max_chars {
        pathway.summarize = Some(Arc::new(TruncateSummarizer { max_chars }) as Arc<dyn Summarizer>);
    }

    if let Some(raw) = &file.tool_definition {
        match ToolDefinition::parse(raw.clone()) {
            Ok(definition) => pathway.tool_definition = Some(definition),
            Err(err) => {
                warn!(pathway = %name, %err, "invalid tool definition -- skipping tool registration");
            }
        }
    }

    Ok(pathway)
}
