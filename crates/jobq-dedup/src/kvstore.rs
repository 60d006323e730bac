//! Backing key-value store abstraction.
//!
//! The engine needs blob get/set/delete with optional TTL, prefix scans,
//! atomic batches, and a hash of integer counters with atomic increment and
//! decrement. [`MemoryKvStore`] implements this in process; a Redis backend
//! implements the same trait outside this crate.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::KvError;
use crate::fingerprint::ChunkHash;

/// Result type for store operations.
pub type KvResult<T> = std::result::Result<T, KvError>;

/// A single operation in a write batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Put a key-value pair.
    Put {
        /// The key to insert or update.
        key: String,
        /// The value to store.
        value: Vec<u8>,
        /// Expiry, `None` for no TTL.
        ttl: Option<Duration>,
    },
    /// Delete a key.
    Delete {
        /// The key to delete.
        key: String,
    },
}

/// Operations the engine requires of its backing store.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Get a value by key. Returns None if the key doesn't exist or expired.
    async fn get(&self, key: &str) -> KvResult<Option<Vec<u8>>>;

    /// Put a value, replacing any existing value and TTL.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> KvResult<()>;

    /// Delete a key. Returns true if it existed.
    async fn delete(&self, key: &str) -> KvResult<bool>;

    /// Returns true if the key exists.
    async fn exists(&self, key: &str) -> KvResult<bool>;

    /// Reset the TTL of an existing key. Returns false if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> KvResult<bool>;

    /// Keys starting with `prefix`, in sorted order, at most `limit` of them.
    async fn scan_keys(&self, prefix: &str, limit: Option<usize>) -> KvResult<Vec<String>>;

    /// Atomically apply a batch of puts and deletes.
    async fn write_batch(&self, ops: Vec<BatchOp>) -> KvResult<()>;

    /// Add `delta` to a hash field (created at 0) and return the new value.
    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> KvResult<i64>;

    /// Decrement a hash field. When the result is <= 0 the field is removed
    /// in the same atomic step and 0 is returned. Absent fields return 0.
    async fn hdecr_floor(&self, key: &str, field: &str) -> KvResult<i64>;

    /// Read a hash field.
    async fn hget(&self, key: &str, field: &str) -> KvResult<Option<i64>>;

    /// Overwrite a hash field.
    async fn hset(&self, key: &str, field: &str, value: i64) -> KvResult<()>;

    /// Remove a hash field. Returns true if it existed.
    async fn hdel(&self, key: &str, field: &str) -> KvResult<bool>;

    /// All fields of a hash.
    async fn hgetall(&self, key: &str) -> KvResult<HashMap<String, i64>>;

    /// Delete `keys` atomically, but only if `guard_field` of hash `guard_key`
    /// is absent or <= 0. Returns whether the delete happened.
    async fn delete_if_unreferenced(
        &self,
        keys: &[String],
        guard_key: &str,
        guard_field: &str,
    ) -> KvResult<bool>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |t| t > now)
    }
}

#[derive(Debug, Default)]
struct Inner {
    entries: BTreeMap<String, Entry>,
    hashes: BTreeMap<String, HashMap<String, i64>>,
}

impl Inner {
    fn live(&self, key: &str, now: Instant) -> Option<&Entry> {
        self.entries.get(key).filter(|e| e.is_live(now))
    }

    fn purge(&mut self, key: &str, now: Instant) {
        if self.entries.get(key).is_some_and(|e| !e.is_live(now)) {
            self.entries.remove(key);
        }
    }
}

/// In-memory store backed by a BTreeMap. Thread-safe via RwLock.
///
/// Expired keys are purged lazily on access. Expiry follows the tokio clock,
/// so paused-time tests can advance past TTLs.
#[derive(Clone, Default)]
pub struct MemoryKvStore {
    inner: Arc<RwLock<Inner>>,
    offline: Arc<AtomicBool>,
}

impl MemoryKvStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail with `Unavailable` until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of live blob keys.
    pub fn key_count(&self) -> usize {
        let now = Instant::now();
        self.inner
            .read()
            .map(|inner| inner.entries.values().filter(|e| e.is_live(now)).count())
            .unwrap_or(0)
    }

    fn check(&self) -> KvResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(KvError::Unavailable("memory store offline".to_string()))
        } else {
            Ok(())
        }
    }

    fn read<T>(&self, f: impl FnOnce(&Inner) -> T) -> KvResult<T> {
        self.check()?;
        let inner = self
            .inner
            .read()
            .map_err(|e| KvError::Unavailable(e.to_string()))?;
        Ok(f(&inner))
    }

    fn write<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> KvResult<T> {
        self.check()?;
        let mut inner = self
            .inner
            .write()
            .map_err(|e| KvError::Unavailable(e.to_string()))?;
        Ok(f(&mut inner))
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> KvResult<Option<Vec<u8>>> {
        let now = Instant::now();
        self.read(|inner| inner.live(key, now).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> KvResult<()> {
        let expires_at = ttl.map(|t| Instant::now() + t);
        self.write(|inner| {
            inner
                .entries
                .insert(key.to_string(), Entry { value, expires_at });
        })
    }

    async fn delete(&self, key: &str) -> KvResult<bool> {
        let now = Instant::now();
        self.write(|inner| {
            let removed = inner.entries.remove(key);
            let hash = inner.hashes.remove(key);
            removed.is_some_and(|e| e.is_live(now)) || hash.is_some()
        })
    }

    async fn exists(&self, key: &str) -> KvResult<bool> {
        let now = Instant::now();
        self.read(|inner| inner.live(key, now).is_some() || inner.hashes.contains_key(key))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> KvResult<bool> {
        let now = Instant::now();
        self.write(|inner| {
            inner.purge(key, now);
            match inner.entries.get_mut(key) {
                Some(entry) => {
                    entry.expires_at = Some(now + ttl);
                    true
                }
                None => false,
            }
        })
    }

    async fn scan_keys(&self, prefix: &str, limit: Option<usize>) -> KvResult<Vec<String>> {
        let now = Instant::now();
        self.read(|inner| {
            inner
                .entries
                .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
                .take_while(|(k, _)| k.starts_with(prefix))
                .filter(|(_, e)| e.is_live(now))
                .map(|(k, _)| k.clone())
                .take(limit.unwrap_or(usize::MAX))
                .collect()
        })
    }

    async fn write_batch(&self, ops: Vec<BatchOp>) -> KvResult<()> {
        let now = Instant::now();
        self.write(|inner| {
            for op in ops {
                match op {
                    BatchOp::Put { key, value, ttl } => {
                        let expires_at = ttl.map(|t| now + t);
                        inner.entries.insert(key, Entry { value, expires_at });
                    }
                    BatchOp::Delete { key } => {
                        inner.entries.remove(&key);
                    }
                }
            }
        })
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> KvResult<i64> {
        self.write(|inner| {
            let value = inner
                .hashes
                .entry(key.to_string())
                .or_default()
                .entry(field.to_string())
                .or_insert(0);
            *value = value
                .checked_add(delta)
                .ok_or_else(|| KvError::Corrupt(format!("{key}/{field}: increment would overflow")))?;
            Ok(*value)
        })?
    }

    async fn hdecr_floor(&self, key: &str, field: &str) -> KvResult<i64> {
        self.write(|inner| {
            let Some(hash) = inner.hashes.get_mut(key) else {
                return 0;
            };
            let Some(value) = hash.get_mut(field) else {
                return 0;
            };
            *value -= 1;
            if *value > 0 {
                return *value;
            }
            hash.remove(field);
            if hash.is_empty() {
                inner.hashes.remove(key);
            }
            0
        })
    }

    async fn hget(&self, key: &str, field: &str) -> KvResult<Option<i64>> {
        self.read(|inner| inner.hashes.get(key).and_then(|h| h.get(field)).copied())
    }

    async fn hset(&self, key: &str, field: &str, value: i64) -> KvResult<()> {
        self.write(|inner| {
            inner
                .hashes
                .entry(key.to_string())
                .or_default()
                .insert(field.to_string(), value);
        })
    }

    async fn hdel(&self, key: &str, field: &str) -> KvResult<bool> {
        self.write(|inner| {
            let Some(hash) = inner.hashes.get_mut(key) else {
                return false;
            };
            let removed = hash.remove(field).is_some();
            if hash.is_empty() {
                inner.hashes.remove(key);
            }
            removed
        })
    }

    async fn hgetall(&self, key: &str) -> KvResult<HashMap<String, i64>> {
        self.read(|inner| inner.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn delete_if_unreferenced(
        &self,
        keys: &[String],
        guard_key: &str,
        guard_field: &str,
    ) -> KvResult<bool> {
        self.write(|inner| {
            let count = inner
                .hashes
                .get(guard_key)
                .and_then(|h| h.get(guard_field))
                .copied()
                .unwrap_or(0);
            if count > 0 {
                return false;
            }
            for key in keys {
                inner.entries.remove(key);
            }
            true
        })
    }
}

/// Key layout of the engine within a shared store, all under one prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    /// Keys rooted at `prefix`, e.g. `"jobq:dedup:"`.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Prefix shared by chunk data and chunk metadata keys
    pub fn chunk_prefix(&self) -> String {
        format!("{}chunk:", self.prefix)
    }

    /// `chunk:<hex>`, compressed chunk bytes
    pub fn chunk(&self, hash: &ChunkHash) -> String {
        format!("{}chunk:{}", self.prefix, hash.to_hex())
    }

    /// `chunk:<hex>:meta`, JSON chunk metadata
    pub fn chunk_meta(&self, hash: &ChunkHash) -> String {
        format!("{}chunk:{}:meta", self.prefix, hash.to_hex())
    }

    /// Parse a data key produced by [`KeySpace::chunk`]; metadata keys yield `None`.
    pub fn parse_chunk_key(&self, key: &str) -> Option<ChunkHash> {
        let hex = key.strip_prefix(&self.chunk_prefix())?;
        ChunkHash::from_hex(hex)
    }

    /// `refs:global`, the reference count hash
    pub fn refs(&self) -> String {
        format!("{}refs:global", self.prefix)
    }

    /// Prefix of payload map keys
    pub fn payload_prefix(&self) -> String {
        format!("{}payload:", self.prefix)
    }

    /// `payload:<job_id>`
    pub fn payload(&self, job_id: &str) -> String {
        format!("{}payload:{job_id}", self.prefix)
    }

    /// Prefix of persisted dictionaries
    pub fn dict_prefix(&self) -> String {
        format!("{}dict:", self.prefix)
    }

    /// `dict:<id>`
    pub fn dict(&self, id: u32) -> String {
        format!("{}dict:{id}", self.prefix)
    }

    /// Id of the dictionary used for new writes
    pub fn dict_active(&self) -> String {
        format!("{}dict:active", self.prefix)
    }
}

/// Decorator applying a deadline to every operation of the wrapped store.
///
/// An elapsed deadline becomes [`KvError::Timeout`]. The wrapped operation is
/// dropped at that point; a backend must leave the store valid if cancelled.
pub struct TimedKvStore {
    inner: Arc<dyn KvStore>,
    timeout: Duration,
}

impl TimedKvStore {
    /// Wrap `inner` with a per-operation `timeout`.
    pub fn new(inner: Arc<dyn KvStore>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn deadline<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = KvResult<T>> + Send,
    ) -> KvResult<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(KvError::Timeout {
                op,
                after: self.timeout,
            }),
        }
    }
}

#[async_trait]
impl KvStore for TimedKvStore {
    async fn get(&self, key: &str) -> KvResult<Option<Vec<u8>>> {
        self.deadline("get", self.inner.get(key)).await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> KvResult<()> {
        self.deadline("set", self.inner.set(key, value, ttl)).await
    }

    async fn delete(&self, key: &str) -> KvResult<bool> {
        self.deadline("delete", self.inner.delete(key)).await
    }

    async fn exists(&self, key: &str) -> KvResult<bool> {
        self.deadline("exists", self.inner.exists(key)).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> KvResult<bool> {
        self.deadline("expire", self.inner.expire(key, ttl)).await
    }

    async fn scan_keys(&self, prefix: &str, limit: Option<usize>) -> KvResult<Vec<String>> {
        self.deadline("scan_keys", self.inner.scan_keys(prefix, limit))
            .await
    }

    async fn write_batch(&self, ops: Vec<BatchOp>) -> KvResult<()> {
        self.deadline("write_batch", self.inner.write_batch(ops)).await
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> KvResult<i64> {
        self.deadline("hincr_by", self.inner.hincr_by(key, field, delta))
            .await
    }

    async fn hdecr_floor(&self, key: &str, field: &str) -> KvResult<i64> {
        self.deadline("hdecr_floor", self.inner.hdecr_floor(key, field))
            .await
    }

    async fn hget(&self, key: &str, field: &str) -> KvResult<Option<i64>> {
        self.deadline("hget", self.inner.hget(key, field)).await
    }

    async fn hset(&self, key: &str, field: &str, value: i64) -> KvResult<()> {
        self.deadline("hset", self.inner.hset(key, field, value)).await
    }

    async fn hdel(&self, key: &str, field: &str) -> KvResult<bool> {
        self.deadline("hdel", self.inner.hdel(key, field)).await
    }

    async fn hgetall(&self, key: &str) -> KvResult<HashMap<String, i64>> {
        self.deadline("hgetall", self.inner.hgetall(key)).await
    }

    async fn delete_if_unreferenced(
        &self,
        keys: &[String],
        guard_key: &str,
        guard_field: &str,
    ) -> KvResult<bool> {
        self.deadline(
            "delete_if_unreferenced",
            self.inner.delete_if_unreferenced(keys, guard_key, guard_field),
        )
        .await
    }
}
