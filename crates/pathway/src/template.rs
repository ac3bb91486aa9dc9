//! Handlebars-style prompt templating.
//!
//! A small tree-walking interpreter, deliberately without an embedded
//! expression language.  Supported syntax:
//!
//! ```text
//! {{path.to.var}}          substitute (triple-brace form accepted too)
//! {{#if x}}…{{else}}…{{/if}}
//! {{^if x}}…{{/if}}        inverted block
//! {{#each xs}}…{{/each}}   with {{this}} and {{@index}}
//! {{renderTemplate NAME}}  indirect inclusion through a template library
//! {{toJSON x}}             JSON-encode the looked-up value
//! {{upper x}} {{lower x}} {{trim x}}
//! ```
//!
//! Lookup walks a [`Scope`] -- a stack of JSON layers (call arguments,
//! global constants, the resolved entity record) resolved newest-first
//! with dotted-path traversal.

use anyhow::{Result, bail};
use serde_json::Value;

/// Guard against runaway `renderTemplate` recursion.
const MAX_INCLUDE_DEPTH: usize = 8;

// ── AST ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Text(String),
    Var(String),
    Helper { name: String, arg: String },
    If { path: String, negated: bool, then: Vec<Node>, otherwise: Vec<Node> },
    Each { path: String, body: Vec<Node> },
}

/// A compiled template, ready for repeated rendering.
#[derive(Debug, Clone)]
pub struct Template {
    nodes: Vec<Node>,
}

/// Source of templates for `{{renderTemplate NAME}}`.
pub trait TemplateLibrary {
    fn lookup(&self, name: &str) -> Option<&Template>;
}

/// Library with no templates; indirect includes render empty with no error
/// raised at render time (missing includes are caught at load).
pub struct EmptyLibrary;

impl TemplateLibrary for EmptyLibrary {
    fn lookup(&self, _name: &str) -> Option<&Template> {
        None
    }
}

// ── Scope ────────────────────────────────────────────────────────────────────

/// Layered variable scope with dotted-path lookup, newest layer first.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    layers: Vec<Value>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a layer; later layers shadow earlier ones.
    pub fn push(&mut self, layer: Value) {
        self.layers.push(layer);
    }

    pub fn with(mut self, layer: Value) -> Self {
        self.push(layer);
        self
    }

    pub fn lookup(&self, path: &str) -> Option<&Value> {
        for layer in self.layers.iter().rev() {
            if let Some(found) = lookup_in(layer, path) {
                return Some(found);
            }
        }
        None
    }
}

fn lookup_in<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        match current {
            Value::Object(map) => current = map.get(segment)?,
            Value::Array(items) => current = items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        }
    }
    Some(current)
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::Array(items)) => !items.is_empty(),
        Some(Value::Object(_)) => true,
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

// ── Parser ───────────────────────────────────────────────────────────────────

impl Template {
    pub fn compile(source: &str) -> Result<Self> {
        let tokens = tokenize(source);
        let mut cursor = 0;
        let nodes = parse_nodes(&tokens, &mut cursor, None)?;
        if cursor != tokens.len() {
            bail!("unexpected closing tag in template");
        }
        Ok(Self { nodes })
    }

    /// Names referenced by `{{renderTemplate …}}` tags, for load-time
    /// validation of indirect includes.
    pub fn includes(&self) -> Vec<String> {
        fn walk(nodes: &[Node], out: &mut Vec<String>) {
            for node in nodes {
                match node {
                    Node::Helper { name, arg } if name == "renderTemplate" => {
                        out.push(arg.clone());
                    }
                    Node::If { then, otherwise, .. } => {
                        walk(then, out);
                        walk(otherwise, out);
                    }
                    Node::Each { body, .. } => walk(body, out),
                    _ => {}
                }
            }
        }
        let mut out = Vec::new();
        walk(&self.nodes, &mut out);
        out
    }

    pub fn render(&self, scope: &Scope, library: &dyn TemplateLibrary) -> String {
        let mut out = String::new();
        render_nodes(&self.nodes, scope, library, 0, &mut out);
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Text(String),
    Tag(String),
}

/// Split the source into literal text and `{{…}}` tag tokens.  Triple
/// braces normalize to the same tag content as double braces.
fn tokenize(source: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut rest = source;
    while let Some(open) = rest.find("{{") {
        if open > 0 {
            tokens.push(Token::Text(rest[..open].to_string()));
        }
        let triple = rest[open..].starts_with("{{{");
        let (close_pat, skip) = if triple { ("}}}", 3) } else { ("}}", 2) };
        let after_open = &rest[open + skip..];
        match after_open.find(close_pat) {
            Some(close) => {
                tokens.push(Token::Tag(after_open[..close].trim().to_string()));
                rest = &after_open[close + close_pat.len()..];
            }
            None => {
                // Unterminated tag: emit the remainder as literal text.
                tokens.push(Token::Text(rest[open..].to_string()));
                rest = "";
            }
        }
    }
    if !rest.is_empty() {
        tokens.push(Token::Text(rest.to_string()));
    }
    tokens
}

const STRING_HELPERS: &[&str] = &["toJSON", "renderTemplate", "upper", "lower", "trim"];

/// Parse until `stop` (a closing tag like "/if") or end of input.
/// `{{else}}` is handled by the `if` parser and terminates a branch.
fn parse_nodes(tokens: &[Token], cursor: &mut usize, stop: Option<&str>) -> Result<Vec<Node>> {
    let mut nodes = Vec::new();
    while *cursor < tokens.len() {
        match &tokens[*cursor] {
            Token::Text(text) => {
                nodes.push(Node::Text(text.clone()));
                *cursor += 1;
            }
            Token::Tag(tag) => {
                if let Some(stop_tag) = stop {
                    if tag == stop_tag || tag == "else" {
                        return Ok(nodes);
                    }
                }
                *cursor += 1;
                nodes.push(parse_tag(tag, tokens, cursor)?);
            }
        }
    }
    if let Some(stop_tag) = stop {
        bail!("unclosed block: expected {{{{{stop_tag}}}}}");
    }
    Ok(nodes)
}

fn parse_tag(tag: &str, tokens: &[Token], cursor: &mut usize) -> Result<Node> {
    if let Some(path) = tag.strip_prefix("#if ") {
        return parse_if(path.trim(), false, tokens, cursor);
    }
    if let Some(path) = tag.strip_prefix("^if ") {
        return parse_if(path.trim(), true, tokens, cursor);
    }
    if let Some(path) = tag.strip_prefix("#each ") {
        let body = parse_nodes(tokens, cursor, Some("/each"))?;
        expect_close(tokens, cursor, "/each")?;
        return Ok(Node::Each { path: path.trim().to_string(), body });
    }
    if tag.starts_with('/') || tag == "else" {
        bail!("unexpected {{{{{tag}}}}}");
    }
    if let Some((name, arg)) = tag.split_once(' ') {
        let name = name.trim();
        if STRING_HELPERS.contains(&name) {
            return Ok(Node::Helper { name: name.to_string(), arg: arg.trim().to_string() });
        }
        bail!("unknown helper {{{{{tag}}}}}");
    }
    Ok(Node::Var(tag.to_string()))
}

fn parse_if(path: &str, negated: bool, tokens: &[Token], cursor: &mut usize) -> Result<Node> {
    let then = parse_nodes(tokens, cursor, Some("/if"))?;
    let otherwise = if matches!(tokens.get(*cursor), Some(Token::Tag(t)) if t == "else") {
        *cursor += 1;
        parse_nodes(tokens, cursor, Some("/if"))?
    } else {
        Vec::new()
    };
    expect_close(tokens, cursor, "/if")?;
    Ok(Node::If { path: path.to_string(), negated, then, otherwise })
}

fn expect_close(tokens: &[Token], cursor: &mut usize, tag: &str) -> Result<()> {
    match tokens.get(*cursor) {
        Some(Token::Tag(t)) if t == tag => {
            *cursor += 1;
            Ok(())
        }
        _ => bail!("unclosed block: expected {{{{{tag}}}}}"),
    }
}

// ── Renderer ─────────────────────────────────────────────────────────────────

fn render_nodes(
    nodes: &[Node],
    scope: &Scope,
    library: &dyn TemplateLibrary,
    depth: usize,
    out: &mut String,
) {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Var(path) => {
                if let Some(value) = scope.lookup(path) {
                    out.push_str(&stringify(value));
                }
            }
            Node::Helper { name, arg } => match name.as_str() {
                "toJSON" => {
                    let value = scope.lookup(arg).cloned().unwrap_or(Value::Null);
                    out.push_str(&value.to_string());
                }
                "renderTemplate" => {
                    if depth >= MAX_INCLUDE_DEPTH {
                        tracing::warn!(template = %arg, "renderTemplate depth limit reached");
                    } else if let Some(template) = library.lookup(arg) {
                        render_nodes(&template.nodes, scope, library, depth + 1, out);
                    }
                }
                "upper" => {
                    if let Some(value) = scope.lookup(arg) {
                        out.push_str(&stringify(value).to_uppercase());
                    }
                }
                "lower" => {
                    if let Some(value) = scope.lookup(arg) {
                        out.push_str(&stringify(value).to_lowercase());
                    }
                }
                "trim" => {
                    if let Some(value) = scope.lookup(arg) {
                        out.push_str(stringify(value).trim());
                    }
                }
                _ => {}
            },
            Node::If { path, negated, then, otherwise } => {
                let condition = truthy(scope.lookup(path)) != *negated;
                let branch = if condition { then } else { otherwise };
                render_nodes(branch, scope, library, depth, out);
            }
            Node::Each { path, body } => {
                let Some(Value::Array(items)) = scope.lookup(path).cloned().map(normalize_each) else {
                    continue;
                };
                for (index, item) in items.iter().enumerate() {
                    let mut inner = scope.clone();
                    inner.push(serde_json::json!({ "this": item, "@index": index }));
                    // Object items also expose their fields directly.
                    if item.is_object() {
                        inner.push(item.clone());
                    }
                    render_nodes(body, &inner, library, depth, out);
                }
            }
        }
    }
}

fn normalize_each(value: Value) -> Value {
    match value {
        Value::Array(_) => value,
        Value::Null => Value::Array(vec![]),
        other => Value::Array(vec![other]),
    }
}
