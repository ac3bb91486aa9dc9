//! Maintenance CLI: memory export/import, entity migration, and a
//! continuity micro-benchmark.
//!
//! Exit codes: 0 success, 1 configuration error, 2 runtime error.

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use uuid::Uuid;

use anima_config::AppConfig;
use anima_continuity::{
    ColdMemoryIndex, InMemoryIndex, JsonlIndex, MemoryNode, MemoryNodeType, SearchIndexBackend,
};
use anima_llm::testing::{ScriptedEndpoint, TEST_EMBED_DIM, embed_text};
use anima_pathway::migrate_tool_name;

#[derive(Parser)]
#[command(name = "anima", about = "Anima entity-runtime maintenance tools", version)]
struct Cli {
    /// Path to the runtime configuration file.
    #[arg(long, global = true, default_value = "config/anima.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Export memory nodes to a JSONL file.
    ExportMemories {
        /// Path of the JSONL memory log to read.
        #[arg(long)]
        memory_log: PathBuf,
        /// Output file; "-" writes to stdout.
        #[arg(long, default_value = "-")]
        out: String,
        /// Restrict to one entity.
        #[arg(long)]
        entity: Option<Uuid>,
        /// Restrict to one user (requires --entity).
        #[arg(long, requires = "entity")]
        user: Option<String>,
    },
    /// Import memory nodes from a JSONL file (idempotent by node id).
    ImportMemories {
        #[arg(long)]
        memory_log: PathBuf,
        /// Input file of one JSON node per line.
        #[arg(long)]
        input: PathBuf,
    },
    /// Rewrite entity documents, mapping retired tool names to current ones.
    MigrateEntities {
        /// Input file of one entity JSON document per line.
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
    },
    /// Measure semantic-search latency over a synthetic corpus.
    BenchmarkContinuity {
        #[arg(long, default_value_t = 1000)]
        nodes: usize,
        #[arg(long, default_value_t = 100)]
        queries: usize,
    },
}

fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let config = match AppConfig::load_from(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err:#}");
            return ExitCode::from(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.telemetry.log_level.clone().into()),
        )
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("configuration error: {err:#}");
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(run(cli.command, config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(2)
        }
    }
}

async fn run(command: Command, config: AppConfig) -> Result<()> {
    match command {
        Command::ExportMemories { memory_log, out, entity, user } => {
            export_memories(&memory_log, &out, entity, user.as_deref()).await
        }
        Command::ImportMemories { memory_log, input } => {
            import_memories(&memory_log, &input).await
        }
        Command::MigrateEntities { input, output } => migrate_entities(&input, &output),
        Command::BenchmarkContinuity { nodes, queries } => {
            benchmark_continuity(&config, nodes, queries).await
        }
    }
}

async fn export_memories(
    memory_log: &PathBuf,
    out: &str,
    entity: Option<Uuid>,
    user: Option<&str>,
) -> Result<()> {
    let index = JsonlIndex::open(memory_log)
        .await
        .context("opening memory log")?;

    let nodes: Vec<MemoryNode> = index
        .dump()
        .await
        .into_iter()
        .filter(|node| entity.is_none_or(|id| node.entity_id == id))
        .filter(|node| user.is_none_or(|u| node.user_id == u))
        .collect();

    let mut writer: Box<dyn Write> = if out == "-" {
        Box::new(std::io::stdout().lock())
    } else {
        Box::new(std::fs::File::create(out).context("creating output file")?)
    };
    for node in &nodes {
        writeln!(writer, "{}", serde_json::to_string(node)?)?;
    }
    info!(count = nodes.len(), "memories exported");
    Ok(())
}

async fn import_memories(memory_log: &PathBuf, input: &PathBuf) -> Result<()> {
    let index = JsonlIndex::open(memory_log)
        .await
        .context("opening memory log")?;
    let file = std::fs::File::open(input).context("opening input file")?;
    let reader = BufReader::new(file);

    let mut imported = 0usize;
    let mut skipped = 0usize;
    for (line_idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<MemoryNode>(&line) {
            Ok(node) => {
                index.upsert(node).await?;
                imported += 1;
            }
            Err(err) => {
                skipped += 1;
                warn!(line = line_idx + 1, %err, "invalid node record -- skipped");
            }
        }
    }
    info!(imported, skipped, "memories imported");
    println!("imported {imported} nodes ({skipped} skipped)");
    Ok(())
}

fn migrate_entities(input: &PathBuf, output: &PathBuf) -> Result<()> {
    let file = std::fs::File::open(input).context("opening input file")?;
    let reader = BufReader::new(file);
    let mut out = std::fs::File::create(output).context("creating output file")?;

    let mut migrated = 0usize;
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let mut document: serde_json::Value =
            serde_json::from_str(&line).context("parsing entity document")?;
        if let Some(tools) = document.get_mut("tools").and_then(|t| t.as_array_mut()) {
            let mut rewritten: Vec<String> = Vec::new();
            for tool in tools.iter() {
                let Some(name) = tool.as_str() else { continue };
                let new_name = if name == "*" {
                    name.to_string()
                } else {
                    migrate_tool_name(&name.to_lowercase()).to_string()
                };
                if !rewritten.contains(&new_name) {
                    rewritten.push(new_name);
                }
            }
            *tools = rewritten.into_iter().map(serde_json::Value::String).collect();
            migrated += 1;
        }
        writeln!(out, "{document}")?;
    }
    println!("migrated {migrated} entity documents");
    Ok(())
}

async fn benchmark_continuity(config: &AppConfig, node_count: usize, query_count: usize) -> Result<()> {
    let backend = Arc::new(InMemoryIndex::new());
    let embedder = Arc::new(ScriptedEndpoint::new("bench-embed"));
    let index = ColdMemoryIndex::new(Some(backend), Some(embedder), &config.continuity);

    let entity = Uuid::new_v4();
    let topics = ["hiking", "career", "music", "cooking", "travel", "family"];

    let ingest_start = Instant::now();
    for i in 0..node_count {
        let topic = topics[i % topics.len()];
        let mut node = MemoryNode::new(
            entity,
            "bench",
            if i % 3 == 0 { MemoryNodeType::Anchor } else { MemoryNodeType::Artifact },
            format!("memory {i} about {topic} and related plans"),
        );
        node.content_vector = embed_text(&node.content, TEST_EMBED_DIM);
        node.importance = 1.0 + (i % 10) as f64;
        index.upsert_memory(node).await?;
    }
    let ingest_elapsed = ingest_start.elapsed();

    let query_start = Instant::now();
    let mut retrieved = 0usize;
    for i in 0..query_count {
        let topic = topics[i % topics.len()];
        let results = index
            .search_semantic(entity, "bench", &format!("tell me about {topic}"), 5, None)
            .await?;
        retrieved += results.len();
    }
    let query_elapsed = query_start.elapsed();

    println!("ingest : {node_count} nodes in {ingest_elapsed:?}");
    println!(
        "search : {query_count} queries in {query_elapsed:?} ({:?}/query, {retrieved} results)",
        query_elapsed / query_count.max(1) as u32
    );
    Ok(())
}
