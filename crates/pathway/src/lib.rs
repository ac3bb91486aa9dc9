//! Pathways: declarative prompt/tool/model units.
//!
//! A pathway bundles one or more prompt templates, typed input defaults, a
//! model binding, and optionally a function-calling tool definition and an
//! imperative executor.  Pathways are the unit of invocation -- tools are
//! just pathways exposed through a function-calling schema.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde_json::Value;

use anima_entity::Entity;
use anima_llm::{ChatMessage, ChatRole, ToolChoice};

mod registry;
mod template;
mod tools;

pub use registry::{PathwayContext, PathwayRegistry};
pub use template::{EmptyLibrary, Scope, Template, TemplateLibrary};
pub use tools::{EntityToolSet, TOOL_MIGRATIONS, migrate_tool_name, tools_for_entity};

// ── Tool definitions ─────────────────────────────────────────────────────────

/// Keys accepted in pathway files but stripped before the schema is sent to
/// the model.
const NON_STANDARD_TOOL_KEYS: &[&str] =
    &["icon", "pathwayParams", "category", "enabled", "toolCost", "hideExecution"];

/// An OpenAI-compatible function-calling declaration, as written in a
/// pathway file.  Implementation-only sibling keys are tolerated on input
/// and removed by [`ToolDefinition::to_openai_schema`].
#[derive(Debug, Clone)]
pub struct ToolDefinition(Value);

impl ToolDefinition {
    /// Validate the raw definition: requires `type`, `function.name`, and
    /// `function.parameters`.
    pub fn parse(raw: Value) -> Result<Self> {
        if raw.get("type").and_then(Value::as_str).is_none() {
            bail!("tool definition missing type");
        }
        let function = raw.get("function").context("tool definition missing function")?;
        if function.get("name").and_then(Value::as_str).is_none() {
            bail!("tool definition missing function.name");
        }
        if !function.get("parameters").is_some_and(Value::is_object) {
            bail!("tool definition missing function.parameters");
        }
        Ok(Self(raw))
    }

    pub fn function_name(&self) -> &str {
        self.0["function"]["name"].as_str().unwrap_or_default()
    }

    pub fn enabled(&self) -> bool {
        self.0.get("enabled").and_then(Value::as_bool).unwrap_or(true)
    }

    /// The schema sent to the model: non-standard sibling keys stripped
    /// from both the top level and the function object.
    pub fn to_openai_schema(&self) -> Value {
        let mut schema = self.0.clone();
        if let Some(map) = schema.as_object_mut() {
            for key in NON_STANDARD_TOOL_KEYS {
                map.remove(*key);
            }
            if let Some(function) = map.get_mut("function").and_then(Value::as_object_mut) {
                for key in NON_STANDARD_TOOL_KEYS {
                    function.remove(*key);
                }
            }
        }
        schema
    }

    pub fn raw(&self) -> &Value {
        &self.0
    }
}

// ── Summaries ────────────────────────────────────────────────────────────────

/// Compresses a large tool observation before it re-enters the context.
pub trait Summarizer: Send + Sync {
    fn summarize(&self, output: &str) -> String;
}

/// Prefix truncation with a visible marker.
pub struct TruncateSummarizer {
    pub max_chars: usize,
}

impl Summarizer for TruncateSummarizer {
    fn summarize(&self, output: &str) -> String {
        if output.chars().count() <= self.max_chars {
            return output.to_string();
        }
        let prefix: String = output.chars().take(self.max_chars).collect();
        format!("{prefix}… [compressed]")
    }
}

// ── Pathway ──────────────────────────────────────────────────────────────────

/// One prompt in a pathway: an ordered list of role-tagged message
/// templates rendered against the call scope.
#[derive(Clone)]
pub struct PromptTemplate {
    pub messages: Vec<(ChatRole, Template)>,
}

impl PromptTemplate {
    /// Single user-message prompt from one template string.
    pub fn user(source: &str) -> Result<Self> {
        Ok(Self { messages: vec![(ChatRole::User, Template::compile(source)?)] })
    }

    pub fn render(&self, scope: &Scope, library: &dyn TemplateLibrary) -> Vec<ChatMessage> {
        self.messages
            .iter()
            .map(|(role, template)| {
                let content = template.render(scope, library);
                match role {
                    ChatRole::System => ChatMessage::system(content),
                    ChatRole::User => ChatMessage::user(content),
                    ChatRole::Assistant => ChatMessage::assistant(content),
                    // Tool-role prompt messages are rejected at load time;
                    // there is no tool_call_id a static prompt could carry.
                    ChatRole::Tool => ChatMessage::user(content),
                }
            })
            .collect()
    }
}

/// Result shape shared by every pathway invocation.
#[derive(Debug, Clone, Default)]
pub struct PathwayInvocation {
    pub result: Value,
    pub tool: Option<String>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl PathwayInvocation {
    pub fn text(result: impl Into<String>) -> Self {
        Self { result: Value::String(result.into()), ..Default::default() }
    }

    pub fn result_text(&self) -> String {
        match &self.result {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Imperative pathway body.  May call back into the registry (other
/// pathways, `run_all_prompts`) through the context.
#[async_trait]
pub trait PathwayExecutor: Send + Sync {
    async fn execute(&self, args: Value, ctx: PathwayContext) -> Result<PathwayInvocation>;
}

#[derive(Clone)]
pub struct Pathway {
    pub name: String,
    pub model: Option<String>,
    pub prompts: Vec<PromptTemplate>,
    /// Typed defaults merged under the caller's arguments.
    pub input_parameters: serde_json::Map<String, Value>,
    pub use_input_chunking: bool,
    pub enable_duplicate_requests: bool,
    pub timeout_secs: u64,
    pub tool_cost: f64,
    pub tool_definition: Option<ToolDefinition>,
    pub summarize: Option<Arc<dyn Summarizer>>,
    pub executor: Option<Arc<dyn PathwayExecutor>>,
}

impl Pathway {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: None,
            prompts: Vec::new(),
            input_parameters: serde_json::Map::new(),
            use_input_chunking: false,
            enable_duplicate_requests: false,
            timeout_secs: 60,
            tool_cost: 1.0,
            tool_definition: None,
            summarize: None,
            executor: None,
        }
    }

    pub fn with_prompt(mut self, prompt: PromptTemplate) -> Self {
        self.prompts.push(prompt);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn PathwayExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn with_tool_definition(mut self, definition: ToolDefinition) -> Self {
        self.tool_definition = Some(definition);
        self
    }
}

/// Build the evaluation scope for a pathway call: input defaults, global
/// constants, the resolved entity record, then the caller's arguments on
/// top.
pub fn call_scope(pathway: &Pathway, args: &Value, entity: Option<&Entity>, constants: &Value) -> Scope {
    let mut scope = Scope::new();
    if !pathway.input_parameters.is_empty() {
        scope.push(Value::Object(pathway.input_parameters.clone()));
    }
    if !constants.is_null() {
        scope.push(constants.clone());
    }
    if let Some(entity) = entity {
        if let Ok(record) = serde_json::to_value(entity) {
            scope.push(serde_json::json!({ "entity": record }));
        }
    }
    if !args.is_null() {
        scope.push(args.clone());
    }
    scope
}

/// Characters per chunk when `use_input_chunking` splits a long `text`
/// argument.
const INPUT_CHUNK_CHARS: usize = 16_000;

/// Run every prompt of a declarative pathway in order, threading each
/// response into the next prompt's scope as `previousResult`.  Returns the
/// final model output.  With `use_input_chunking`, a long `text` argument
/// is split and the prompt chain runs once per chunk.
pub async fn run_all_prompts(
    pathway: &Pathway,
    args: &Value,
    ctx: &PathwayContext,
) -> Result<String> {
    if pathway.use_input_chunking {
        if let Some(text) = args.get("text").and_then(Value::as_str) {
            if text.chars().count() > INPUT_CHUNK_CHARS {
                let chunks: Vec<String> = text
                    .chars()
                    .collect::<Vec<_>>()
                    .chunks(INPUT_CHUNK_CHARS)
                    .map(|c| c.iter().collect())
                    .collect();
                let mut parts = Vec::with_capacity(chunks.len());
                for chunk in chunks {
                    let mut chunk_args = args.clone();
                    chunk_args["text"] = Value::String(chunk);
                    parts.push(run_prompts_once(pathway, &chunk_args, ctx).await?);
                }
                return Ok(parts.join("\n\n"));
            }
        }
    }
    run_prompts_once(pathway, args, ctx).await
}

async fn run_prompts_once(pathway: &Pathway, args: &Value, ctx: &PathwayContext) -> Result<String> {
    let endpoint = ctx.router.resolve(pathway.model.as_deref())?;
    let mut scope = call_scope(pathway, args, ctx.entity.as_ref(), &ctx.constants);
    let library = ctx.registry.partials();

    let mut last = String::new();
    for prompt in &pathway.prompts {
        let messages = prompt.render(&scope, &*library);
        let response = endpoint.chat(&messages, None, ToolChoice::Auto).await?;
        last = response.content;
        scope.push(serde_json::json!({ "previousResult": last }));
    }
    Ok(last)
}
