//! Content-addressable chunk storage over a [`KvStore`].
//!
//! Chunk bytes live under `chunk:<hex>` with no TTL and are removed only by
//! garbage collection. Metadata lives under `chunk:<hex>:meta` with a
//! retention TTL that every touch refreshes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::chunker::Chunk;
use crate::compression::{ChunkCompressor, Compressor};
use crate::config::DedupConfig;
use crate::error::{DedupError, Result};
use crate::fingerprint::ChunkHash;
use crate::kvstore::{BatchOp, KeySpace, KvStore};

/// Per-chunk metadata record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// Content hash
    pub hash: ChunkHash,
    /// Plaintext length
    pub size: usize,
    /// Stored blob length
    pub compressed_size: usize,
    /// First store
    pub created_at: DateTime<Utc>,
    /// Last store or read that refreshed this record
    pub last_used_at: DateTime<Utc>,
}

/// Capability interface for chunk persistence.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Store a chunk if absent, otherwise touch it. Returns true if bytes were written.
    async fn store(&self, chunk: &Chunk) -> Result<bool>;

    /// Fetch and decompress a chunk. `None` if absent.
    async fn get(&self, hash: &ChunkHash) -> Result<Option<Bytes>>;

    /// True if chunk bytes exist.
    async fn exists(&self, hash: &ChunkHash) -> Result<bool>;

    /// Metadata record, `None` if absent, expired or unreadable.
    async fn metadata(&self, hash: &ChunkHash) -> Result<Option<ChunkMetadata>>;

    /// Delete data and metadata together, only if the chunk has no references
    /// at the moment of deletion. Returns whether it was deleted.
    async fn delete_unreferenced(&self, hash: &ChunkHash) -> Result<bool>;

    /// Hashes of stored chunks, at most `limit`.
    async fn list(&self, limit: Option<usize>) -> Result<Vec<ChunkHash>>;
}

/// [`ChunkStore`] writing compressed blobs to a [`KvStore`].
pub struct KvChunkStore {
    kv: Arc<dyn KvStore>,
    keys: KeySpace,
    compressor: Arc<ChunkCompressor>,
    meta_ttl: Duration,
    touch_debounce: Duration,
    recent_touches: DashMap<ChunkHash, Instant>,
}

impl KvChunkStore {
    /// Build from configuration.
    pub fn new(kv: Arc<dyn KvStore>, compressor: Arc<ChunkCompressor>, config: &DedupConfig) -> Self {
        Self {
            kv,
            keys: KeySpace::new(config.key_prefix.clone()),
            compressor,
            meta_ttl: config.store.chunk_meta_retention(),
            touch_debounce: Duration::from_secs(config.store.touch_debounce_secs),
            recent_touches: DashMap::new(),
        }
    }

    /// Compressor used for chunk blobs
    pub fn compressor(&self) -> &Arc<ChunkCompressor> {
        &self.compressor
    }

    /// Refresh `last_used_at` and the metadata TTL, recreating the record if it expired.
    ///
    /// Debounced per chunk; a skipped or failed touch only delays LRU information.
    /// A recreated record takes its blob length from `compressed_size`, or from
    /// the stored blob when the caller does not know it.
    async fn touch(&self, hash: &ChunkHash, size: usize, compressed_size: Option<usize>) -> Result<()> {
        let now = Instant::now();
        if let Some(last) = self.recent_touches.get(hash) {
            if now.duration_since(*last) < self.touch_debounce {
                return Ok(());
            }
        }

        let meta_key = self.keys.chunk_meta(hash);
        let current = self
            .kv
            .get(&meta_key)
            .await
            .map_err(|e| DedupError::store(format!("touch chunk {}", hash.short()), e))?;
        let stamp = Utc::now();
        let meta = match current.and_then(|raw| serde_json::from_slice::<ChunkMetadata>(&raw).ok()) {
            Some(mut meta) => {
                meta.last_used_at = stamp;
                meta
            }
            None => {
                let compressed_size = match compressed_size {
                    Some(len) => len,
                    None => match self
                        .kv
                        .get(&self.keys.chunk(hash))
                        .await
                        .map_err(|e| DedupError::store(format!("touch chunk {}", hash.short()), e))?
                    {
                        Some(blob) => blob.len(),
                        None => return Ok(()),
                    },
                };
                ChunkMetadata {
                    hash: *hash,
                    size,
                    compressed_size,
                    created_at: stamp,
                    last_used_at: stamp,
                }
            }
        };
        self.kv
            .set(&meta_key, serde_json::to_vec(&meta)?, Some(self.meta_ttl))
            .await
            .map_err(|e| DedupError::store(format!("touch chunk {}", hash.short()), e))?;
        self.recent_touches.insert(*hash, now);
        Ok(())
    }

    /// Persist a dictionary under `dict:<id>` and record it as active.
    pub async fn persist_dictionary(&self, id: u32, dict: &[u8]) -> Result<()> {
        self.kv
            .write_batch(vec![
                BatchOp::Put {
                    key: self.keys.dict(id),
                    value: dict.to_vec(),
                    ttl: None,
                },
                BatchOp::Put {
                    key: self.keys.dict_active(),
                    value: id.to_string().into_bytes(),
                    ttl: None,
                },
            ])
            .await
            .map_err(|e| DedupError::store(format!("persist dictionary {id}"), e))
    }

    /// Register every persisted dictionary with the compressor and activate the
    /// recorded one. Returns the number loaded.
    pub async fn load_dictionaries(&self) -> Result<usize> {
        let prefix = self.keys.dict_prefix();
        let active_key = self.keys.dict_active();
        let keys = self
            .kv
            .scan_keys(&prefix, None)
            .await
            .map_err(|e| DedupError::store("scan dictionaries", e))?;

        let mut loaded = 0;
        for key in keys.iter().filter(|k| **k != active_key) {
            let Some(dict) = self
                .kv
                .get(key)
                .await
                .map_err(|e| DedupError::store(format!("load dictionary {key}"), e))?
            else {
                continue;
            };
            let id = self.compressor.register_dictionary(dict);
            if key.strip_prefix(&prefix) != Some(id.to_string().as_str()) {
                warn!(key = %key, dict_id = id, "dictionary content does not match its key");
            }
            loaded += 1;
        }

        let active = self
            .kv
            .get(&active_key)
            .await
            .map_err(|e| DedupError::store("load active dictionary", e))?;
        if let Some(id) = active
            .and_then(|raw| String::from_utf8(raw).ok())
            .and_then(|s| s.parse::<u32>().ok())
        {
            if self.compressor.uses_dictionary() && !self.compressor.activate(id) {
                warn!(dict_id = id, "active dictionary is missing from the store");
            }
        }
        if loaded > 0 {
            info!(loaded, "compression dictionaries loaded");
        }
        Ok(loaded)
    }
}

#[async_trait]
impl ChunkStore for KvChunkStore {
    async fn store(&self, chunk: &Chunk) -> Result<bool> {
        let data_key = self.keys.chunk(&chunk.hash);
        let exists = self
            .kv
            .exists(&data_key)
            .await
            .map_err(|e| DedupError::store(format!("check chunk {}", chunk.hash.short()), e))?;
        if exists {
            if let Err(e) = self.touch(&chunk.hash, chunk.size(), None).await {
                debug!(hash = %chunk.hash.short(), error = %e, "chunk touch skipped");
            }
            return Ok(false);
        }

        let blob = self
            .compressor
            .compress(&chunk.data)
            .map_err(|e| DedupError::CompressionFailed(format!("chunk {}: {e}", chunk.hash)))?;
        let now = Utc::now();
        let meta = ChunkMetadata {
            hash: chunk.hash,
            size: chunk.size(),
            compressed_size: blob.len(),
            created_at: now,
            last_used_at: now,
        };
        let compressed_size = blob.len();
        self.kv
            .write_batch(vec![
                BatchOp::Put {
                    key: data_key,
                    value: blob,
                    ttl: None,
                },
                BatchOp::Put {
                    key: self.keys.chunk_meta(&chunk.hash),
                    value: serde_json::to_vec(&meta)?,
                    ttl: Some(self.meta_ttl),
                },
            ])
            .await
            .map_err(|e| DedupError::store(format!("store chunk {}", chunk.hash.short()), e))?;
        self.recent_touches.insert(chunk.hash, Instant::now());
        debug!(hash = %chunk.hash.short(), size = chunk.size(), compressed_size, "stored chunk");
        Ok(true)
    }

    async fn get(&self, hash: &ChunkHash) -> Result<Option<Bytes>> {
        let blob = self
            .kv
            .get(&self.keys.chunk(hash))
            .await
            .map_err(|e| DedupError::store(format!("get chunk {}", hash.short()), e))?;
        let Some(blob) = blob else {
            return Ok(None);
        };
        let data = self
            .compressor
            .decompress(&blob)
            .map_err(|e| DedupError::DecompressionFailed {
                hash: *hash,
                reason: e.to_string(),
            })?;

        if let Err(e) = self.touch(hash, data.len(), Some(blob.len())).await {
            debug!(hash = %hash.short(), error = %e, "chunk touch skipped");
        }
        Ok(Some(Bytes::from(data)))
    }

    async fn exists(&self, hash: &ChunkHash) -> Result<bool> {
        self.kv
            .exists(&self.keys.chunk(hash))
            .await
            .map_err(|e| DedupError::store(format!("check chunk {}", hash.short()), e))
    }

    async fn metadata(&self, hash: &ChunkHash) -> Result<Option<ChunkMetadata>> {
        let raw = self
            .kv
            .get(&self.keys.chunk_meta(hash))
            .await
            .map_err(|e| DedupError::store(format!("get chunk metadata {}", hash.short()), e))?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        match serde_json::from_slice(&raw) {
            Ok(meta) => Ok(Some(meta)),
            Err(e) => {
                warn!(hash = %hash.short(), error = %e, "unreadable chunk metadata, treating as absent");
                Ok(None)
            }
        }
    }

    async fn delete_unreferenced(&self, hash: &ChunkHash) -> Result<bool> {
        let keys = [self.keys.chunk(hash), self.keys.chunk_meta(hash)];
        let deleted = self
            .kv
            .delete_if_unreferenced(&keys, &self.keys.refs(), &hash.to_hex())
            .await
            .map_err(|e| DedupError::store(format!("delete chunk {}", hash.short()), e))?;
        if deleted {
            self.recent_touches.remove(hash);
        }
        Ok(deleted)
    }

    async fn list(&self, limit: Option<usize>) -> Result<Vec<ChunkHash>> {
        // metadata keys share the prefix, so scan without a limit and cut after parsing
        let keys = self
            .kv
            .scan_keys(&self.keys.chunk_prefix(), None)
            .await
            .map_err(|e| DedupError::store("list chunks", e))?;
        Ok(keys
            .iter()
            .filter_map(|k| self.keys.parse_chunk_key(k))
            .take(limit.unwrap_or(usize::MAX))
            .collect())
    }
}
