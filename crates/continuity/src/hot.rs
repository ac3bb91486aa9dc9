//! Hot memory: the fast KV tier holding the episodic stream, active
//! context cache, expression state, and pulse task state, all partitioned
//! by `(entityId, userId)`.
//!
//! Values are JSON-per-field.  The store may wrap its backend in
//! transparent symmetric encryption -- a property of the store, invisible
//! to the data model.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use chrono::Utc;
use redb::{Database, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use uuid::Uuid;

use anima_config::{ContinuityConfig, HotStoreConfig};

use crate::model::{ActiveContext, EpisodicTurn, ExpressionState, PulseState, ResonanceMetrics};

// ── KV contract ──────────────────────────────────────────────────────────────

/// Minimal KV surface the hot store needs from its backend.  TTLs are
/// enforced by the backend; a `None` TTL means the value never expires.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

// ── In-memory backend ────────────────────────────────────────────────────────

#[derive(Default)]
pub struct InMemoryKv {
    entries: Mutex<HashMap<String, (Option<Instant>, Vec<u8>)>>,
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvBackend for InMemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some((Some(expires), _)) if *expires <= Instant::now() => {
                entries.remove(key);
                Ok(None)
            }
            Some((_, value)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let expires = ttl.map(|d| Instant::now() + d);
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), (expires, value));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }
}

// ── redb backend ─────────────────────────────────────────────────────────────

/// Value layout: 8-byte little-endian expiry (unix millis, 0 = none)
/// followed by the payload.
const HOT_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("hot");

pub struct RedbKv {
    db: Database,
}

impl RedbKv {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)
            .with_context(|| format!("opening hot store at {}", path.display()))?;
        {
            let tx = db.begin_write()?;
            tx.open_table(HOT_TABLE)?;
            tx.commit()?;
        }
        Ok(Self { db })
    }
}

#[async_trait]
impl KvBackend for RedbKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(HOT_TABLE)?;
        let Some(stored) = table.get(key)? else {
            return Ok(None);
        };
        let bytes = stored.value();
        if bytes.len() < 8 {
            return Ok(None);
        }
        let expires_ms = u64::from_le_bytes(bytes[..8].try_into().expect("8-byte header"));
        if expires_ms != 0 && (Utc::now().timestamp_millis() as u64) >= expires_ms {
            return Ok(None);
        }
        Ok(Some(bytes[8..].to_vec()))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let expires_ms = ttl
            .map(|d| Utc::now().timestamp_millis() as u64 + d.as_millis() as u64)
            .unwrap_or(0);
        let mut bytes = Vec::with_capacity(8 + value.len());
        bytes.extend_from_slice(&expires_ms.to_le_bytes());
        bytes.extend_from_slice(&value);

        let tx = self.db.begin_write()?;
        {
            let mut table = tx.open_table(HOT_TABLE)?;
            table.insert(key, bytes.as_slice())?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let tx = self.db.begin_write()?;
        {
            let mut table = tx.open_table(HOT_TABLE)?;
            table.remove(key)?;
        }
        tx.commit()?;
        Ok(())
    }
}

// ── Encryption decorator ─────────────────────────────────────────────────────

/// Transparent ChaCha20-Poly1305 value encryption keyed by a system-level
/// key.  Stored layout: 12-byte nonce followed by the ciphertext.
pub struct EncryptedKv {
    inner: Arc<dyn KvBackend>,
    cipher: ChaCha20Poly1305,
}

impl EncryptedKv {
    /// `key` must be exactly 32 bytes.
    pub fn new(inner: Arc<dyn KvBackend>, key: &[u8]) -> Result<Self> {
        anyhow::ensure!(key.len() == 32, "hot store encryption key must be 32 bytes");
        Ok(Self {
            inner,
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        })
    }
}

#[async_trait]
impl KvBackend for EncryptedKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let Some(stored) = self.inner.get(key).await? else {
            return Ok(None);
        };
        anyhow::ensure!(stored.len() > 12, "encrypted value too short");
        let (nonce, ciphertext) = stored.split_at(12);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| anyhow::anyhow!("hot store value failed authentication"))?;
        Ok(Some(plaintext))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, value.as_slice())
            .map_err(|_| anyhow::anyhow!("hot store encryption failed"))?;
        let mut stored = Vec::with_capacity(12 + ciphertext.len());
        stored.extend_from_slice(nonce.as_slice());
        stored.extend_from_slice(&ciphertext);
        self.inner.set(key, stored, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key).await
    }
}

// ── Hot memory store ─────────────────────────────────────────────────────────

pub struct HotMemoryStore {
    kv: Arc<dyn KvBackend>,
    namespace: String,
    episodic_capacity: usize,
    episodic_ttl: Duration,
    active_context_ttl: Duration,
    pulse_ttl: Duration,
}

impl HotMemoryStore {
    pub fn new(kv: Arc<dyn KvBackend>, hot: &HotStoreConfig, continuity: &ContinuityConfig) -> Self {
        Self {
            kv,
            namespace: hot.namespace.clone(),
            episodic_capacity: continuity.episodic_capacity,
            episodic_ttl: Duration::from_secs(continuity.episodic_ttl_days.max(0) as u64 * 86_400),
            active_context_ttl: Duration::from_secs(continuity.active_context_ttl_secs.max(0) as u64),
            pulse_ttl: Duration::from_secs(continuity.pulse_ttl_hours.max(0) as u64 * 3_600),
        }
    }

    /// Build the backend stack described by config: in-memory or redb,
    /// optionally wrapped in transparent encryption.
    pub fn from_config(hot: &HotStoreConfig, continuity: &ContinuityConfig) -> Result<Self> {
        let base: Arc<dyn KvBackend> = match hot.backend.as_str() {
            "redb" => Arc::new(RedbKv::open(&hot.redb_path)?),
            _ => Arc::new(InMemoryKv::new()),
        };
        let kv: Arc<dyn KvBackend> = if hot.encryption_key_env.is_empty() {
            base
        } else {
            let hex = std::env::var(&hot.encryption_key_env)
                .with_context(|| format!("reading {}", hot.encryption_key_env))?;
            let key = decode_hex(&hex)?;
            Arc::new(EncryptedKv::new(base, &key)?)
        };
        Ok(Self::new(kv, hot, continuity))
    }

    fn key(&self, entity_id: Uuid, user_id: &str, field: &str) -> String {
        format!("{}:{entity_id}:{user_id}:{field}", self.namespace)
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.kv.get(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<()> {
        self.kv.set(key, serde_json::to_vec(value)?, ttl).await
    }

    // ── Episodic stream ──────────────────────────────────────────────────

    /// Append a turn; evict the oldest past capacity and refresh the TTL.
    pub async fn append_turn(&self, entity_id: Uuid, user_id: &str, turn: EpisodicTurn) -> Result<()> {
        let key = self.key(entity_id, user_id, "stream");
        let mut stream: Vec<EpisodicTurn> = self.get_json(&key).await?.unwrap_or_default();
        stream.push(turn);
        if stream.len() > self.episodic_capacity {
            let overflow = stream.len() - self.episodic_capacity;
            stream.drain(..overflow);
        }
        self.set_json(&key, &stream, Some(self.episodic_ttl)).await
    }

    /// The most recent `n` turns, oldest first.
    pub async fn last_n(&self, entity_id: Uuid, user_id: &str, n: usize) -> Result<Vec<EpisodicTurn>> {
        let key = self.key(entity_id, user_id, "stream");
        let stream: Vec<EpisodicTurn> = self.get_json(&key).await?.unwrap_or_default();
        let start = stream.len().saturating_sub(n);
        Ok(stream[start..].to_vec())
    }

    pub async fn clear_stream(&self, entity_id: Uuid, user_id: &str) -> Result<()> {
        self.kv.delete(&self.key(entity_id, user_id, "stream")).await
    }

    // ── Active context cache ─────────────────────────────────────────────

    pub async fn get_active_context(&self, entity_id: Uuid, user_id: &str) -> Result<Option<ActiveContext>> {
        let key = self.key(entity_id, user_id, "context");
        let Some(context): Option<ActiveContext> = self.get_json(&key).await? else {
            return Ok(None);
        };
        if context.expires_at <= Utc::now() {
            self.kv.delete(&key).await?;
            return Ok(None);
        }
        Ok(Some(context))
    }

    pub async fn set_active_context(&self, entity_id: Uuid, user_id: &str, mut context: ActiveContext) -> Result<()> {
        context.last_updated = Utc::now();
        context.expires_at =
            Utc::now() + chrono::Duration::seconds(self.active_context_ttl.as_secs() as i64);
        self.set_json(
            &self.key(entity_id, user_id, "context"),
            &context,
            Some(self.active_context_ttl),
        )
        .await
    }

    pub async fn invalidate_active_context(&self, entity_id: Uuid, user_id: &str) -> Result<()> {
        debug!(%entity_id, user_id, "active context invalidated");
        self.kv.delete(&self.key(entity_id, user_id, "context")).await
    }

    // ── Expression state ─────────────────────────────────────────────────

    pub async fn get_expression(&self, entity_id: Uuid, user_id: &str) -> Result<ExpressionState> {
        Ok(self
            .get_json(&self.key(entity_id, user_id, "expression"))
            .await?
            .unwrap_or_default())
    }

    pub async fn set_expression(&self, entity_id: Uuid, user_id: &str, state: &ExpressionState) -> Result<()> {
        self.set_json(&self.key(entity_id, user_id, "expression"), state, None)
            .await
    }

    /// Read-modify-write partial update.  Concurrent updates are
    /// last-write-wins by design.
    pub async fn update_expression<F>(&self, entity_id: Uuid, user_id: &str, apply: F) -> Result<ExpressionState>
    where
        F: FnOnce(&mut ExpressionState),
    {
        let mut state = self.get_expression(entity_id, user_id).await?;
        apply(&mut state);
        self.set_expression(entity_id, user_id, &state).await?;
        Ok(state)
    }

    pub async fn clear_expression(&self, entity_id: Uuid, user_id: &str) -> Result<()> {
        self.kv
            .delete(&self.key(entity_id, user_id, "expression"))
            .await
    }

    // ── Pulse task state ─────────────────────────────────────────────────

    pub async fn get_pulse(&self, entity_id: Uuid, user_id: &str) -> Result<Option<PulseState>> {
        self.get_json(&self.key(entity_id, user_id, "pulse")).await
    }

    pub async fn set_pulse(&self, entity_id: Uuid, user_id: &str, state: &PulseState) -> Result<()> {
        self.set_json(&self.key(entity_id, user_id, "pulse"), state, Some(self.pulse_ttl))
            .await
    }

    pub async fn clear_pulse(&self, entity_id: Uuid, user_id: &str) -> Result<()> {
        self.kv.delete(&self.key(entity_id, user_id, "pulse")).await
    }

    // ── Resonance metrics ────────────────────────────────────────────────

    pub async fn get_resonance(&self, entity_id: Uuid, user_id: &str) -> Result<Option<ResonanceMetrics>> {
        self.get_json(&self.key(entity_id, user_id, "resonance")).await
    }

    pub async fn set_resonance(&self, entity_id: Uuid, user_id: &str, metrics: &ResonanceMetrics) -> Result<()> {
        self.set_json(&self.key(entity_id, user_id, "resonance"), metrics, None)
            .await
    }

    /// Drop every per-user structure.  Used by the forget-me cascade.
    pub async fn clear_all(&self, entity_id: Uuid, user_id: &str) -> Result<()> {
        for field in ["stream", "context", "expression", "pulse", "resonance"] {
            self.kv.delete(&self.key(entity_id, user_id, field)).await?;
        }
        Ok(())
    }
}

fn decode_hex(hex: &str) -> Result<Vec<u8>> {
    let hex = hex.trim();
    anyhow::ensure!(hex.len() % 2 == 0, "hex key has odd length");
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).context("invalid hex in key"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TurnRole;

    fn store() -> HotMemoryStore {
        HotMemoryStore::new(
            Arc::new(InMemoryKv::new()),
            &HotStoreConfig::default(),
            &ContinuityConfig::default(),
        )
    }

    fn bounded_store(capacity: usize) -> HotMemoryStore {
        let continuity = ContinuityConfig { episodic_capacity: capacity, ..Default::default() };
        HotMemoryStore::new(Arc::new(InMemoryKv::new()), &HotStoreConfig::default(), &continuity)
    }

    #[tokio::test]
    async fn turns_append_in_order() -> Result<()> {
        let store = store();
        let entity = Uuid::new_v4();
        store.append_turn(entity, "ana", EpisodicTurn::user("hi")).await?;
        store
            .append_turn(entity, "ana", EpisodicTurn::assistant("hello"))
            .await?;

        let turns = store.last_n(entity, "ana", 2).await?;
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, TurnRole::User);
        assert_eq!(turns[1].role, TurnRole::Assistant);
        Ok(())
    }

    #[tokio::test]
    async fn stream_evicts_oldest_past_capacity() -> Result<()> {
        let store = bounded_store(3);
        let entity = Uuid::new_v4();
        for i in 0..5 {
            store
                .append_turn(entity, "ana", EpisodicTurn::user(format!("m{i}")))
                .await?;
        }
        let turns = store.last_n(entity, "ana", 10).await?;
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[0].content, "m2");
        assert_eq!(turns[2].content, "m4");
        Ok(())
    }

    #[tokio::test]
    async fn streams_are_partitioned_by_entity_and_user() -> Result<()> {
        let store = store();
        let entity = Uuid::new_v4();
        store.append_turn(entity, "ana", EpisodicTurn::user("a")).await?;
        store.append_turn(entity, "bob", EpisodicTurn::user("b")).await?;

        assert_eq!(store.last_n(entity, "ana", 10).await?.len(), 1);
        assert_eq!(store.last_n(entity, "bob", 10).await?.len(), 1);
        assert!(store.last_n(Uuid::new_v4(), "ana", 10).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn active_context_expires_by_embedded_deadline() -> Result<()> {
        let store = store();
        let entity = Uuid::new_v4();
        let mut context = ActiveContext {
            narrative_context: "we talked about rust".to_string(),
            ..Default::default()
        };
        store.set_active_context(entity, "ana", context.clone()).await?;
        assert!(store.get_active_context(entity, "ana").await?.is_some());

        // Force-expire by writing a past deadline directly.
        context.expires_at = Utc::now() - chrono::Duration::seconds(1);
        context.last_updated = Utc::now();
        store
            .set_json(&store.key(entity, "ana", "context"), &context, None)
            .await?;
        assert!(store.get_active_context(entity, "ana").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn expression_update_is_partial() -> Result<()> {
        let store = store();
        let entity = Uuid::new_v4();
        store
            .update_expression(entity, "ana", |s| {
                s.base_personality = "warm".to_string();
            })
            .await?;
        let state = store
            .update_expression(entity, "ana", |s| {
                s.last_interaction_tone = Some("playful".to_string());
            })
            .await?;

        assert_eq!(state.base_personality, "warm");
        assert_eq!(state.last_interaction_tone.as_deref(), Some("playful"));
        Ok(())
    }

    #[tokio::test]
    async fn encrypted_backend_round_trips_and_hides_plaintext() -> Result<()> {
        let plain = Arc::new(InMemoryKv::new());
        let encrypted = EncryptedKv::new(plain.clone(), &[7u8; 32])?;
        encrypted.set("k", b"secret payload".to_vec(), None).await?;

        let raw = plain.get("k").await?.unwrap();
        assert!(!raw.windows(6).any(|w| w == b"secret"));
        assert_eq!(encrypted.get("k").await?.unwrap(), b"secret payload");
        Ok(())
    }

    #[tokio::test]
    async fn redb_backend_persists_and_honors_ttl() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let kv = RedbKv::open(dir.path().join("hot.redb"))?;
        kv.set("live", b"v".to_vec(), None).await?;
        kv.set("dead", b"v".to_vec(), Some(Duration::ZERO)).await?;

        assert!(kv.get("live").await?.is_some());
        assert!(kv.get("dead").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn clear_all_removes_every_field() -> Result<()> {
        let store = store();
        let entity = Uuid::new_v4();
        store.append_turn(entity, "ana", EpisodicTurn::user("x")).await?;
        store.set_expression(entity, "ana", &ExpressionState::default()).await?;
        store.set_pulse(entity, "ana", &PulseState::default()).await?;

        store.clear_all(entity, "ana").await?;
        assert!(store.last_n(entity, "ana", 10).await?.is_empty());
        assert!(store.get_pulse(entity, "ana").await?.is_none());
        Ok(())
    }
}
