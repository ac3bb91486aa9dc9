//! JSONL-backed cold index for single-process deployments and the CLI
//! import/export tooling.
//!
//! The file is the durable record; an in-memory index serves queries.
//! Upserts append one line (replay is last-write-wins by id); deletes
//! compact the file through an atomic temp-file rename so a crash at any
//! point leaves a consistent log.

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::warn;
use uuid::Uuid;

use crate::cold::{InMemoryIndex, IndexFilter, ScoredNode, SearchIndexBackend};
use crate::model::MemoryNode;

pub struct JsonlIndex {
    path: PathBuf,
    memory: InMemoryIndex,
    /// Serializes file mutations; queries go straight to `memory`.
    write_lock: Mutex<()>,
}

impl JsonlIndex {
    /// Open (or create) the log at `path` and replay it into memory.
    /// Corrupt lines are skipped with a warning; the original file is
    /// left untouched.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let memory = InMemoryIndex::new();

        if path.exists() {
            let file = std::fs::File::open(&path)
                .with_context(|| format!("opening memory log {}", path.display()))?;
            let reader = BufReader::new(file);
            let mut corrupt = 0usize;
            for (line_idx, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<MemoryNode>(&line) {
                    Ok(node) => memory.upsert(node).await?,
                    Err(err) => {
                        corrupt += 1;
                        warn!(line = line_idx + 1, %err, path = %path.display(), "corrupt memory record -- skipped");
                    }
                }
            }
            if corrupt > 0 {
                warn!(corrupt, path = %path.display(), "memory log loaded with skipped lines");
            }
        }

        Ok(Self { path, memory, write_lock: Mutex::new(()) })
    }

    /// Snapshot of every node in the log, newest first.
    pub async fn dump(&self) -> Vec<MemoryNode> {
        self.memory.dump().await
    }

    fn append_line(&self, node: &MemoryNode) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", serde_json::to_string(node)?)?;
        file.sync_all()?;
        Ok(())
    }

    /// Rewrite the whole log from the in-memory state: write a `.tmp`
    /// sibling, fsync, rename over the original.
    async fn compact(&self) -> Result<()> {
        let nodes = self.memory.dump().await;
        let _guard = self.write_lock.lock().unwrap();
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = self.path.with_extension("jsonl.tmp");
        let result: Result<()> = (|| {
            let mut file = std::fs::File::create(&tmp_path)?;
            for node in &nodes {
                writeln!(file, "{}", serde_json::to_string(node)?)?;
            }
            file.sync_all()?;
            Ok(())
        })();
        if let Err(err) = result {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(err);
        }
        if let Err(err) = std::fs::rename(&tmp_path, &self.path) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(err.into());
        }
        Ok(())
    }
}

#[async_trait]
impl SearchIndexBackend for JsonlIndex {
    async fn upsert(&self, node: MemoryNode) -> Result<()> {
        self.memory.upsert(node.clone()).await?;
        self.append_line(&node)
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let removed = self.memory.delete(id).await?;
        if removed {
            self.compact().await?;
        }
        Ok(removed)
    }

    async fn get_by_ids(&self, ids: &[Uuid]) -> Result<Vec<MemoryNode>> {
        self.memory.get_by_ids(ids).await
    }

    async fn vector_query(
        &self,
        filter: &IndexFilter,
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<ScoredNode>> {
        self.memory.vector_query(filter, vector, top_k).await
    }

    async fn filter_query(
        &self,
        filter: &IndexFilter,
        limit: usize,
        skip: usize,
    ) -> Result<Vec<MemoryNode>> {
        self.memory.filter_query(filter, limit, skip).await
    }

    async fn all_for(&self, entity_id: Uuid, user_id: &str, limit: usize) -> Result<Vec<MemoryNode>> {
        self.memory.all_for(entity_id, user_id, limit).await
    }
}
