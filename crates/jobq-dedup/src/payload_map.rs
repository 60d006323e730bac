//! Per-job payload maps: ordered chunk references plus a payload checksum.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::chunker::Chunk;
use crate::config::DedupConfig;
use crate::error::{DedupError, Result};
use crate::fingerprint::{compute_checksum, ChunkHash, Checksum};
use crate::kvstore::{KeySpace, KvStore};

/// Where one chunk sits within a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkReference {
    /// Content hash of the chunk
    pub hash: ChunkHash,
    /// Byte offset within the payload
    pub offset: u64,
    /// Plaintext length
    pub size: usize,
}

/// Recipe for reconstructing one job's payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadMap {
    /// Owning job
    pub job_id: String,
    /// Payload length in bytes
    pub original_size: usize,
    /// Chunks in payload order
    pub chunk_refs: Vec<ChunkReference>,
    /// SHA-256 of the whole payload
    pub checksum: Checksum,
    /// When the map was written
    pub created_at: DateTime<Utc>,
    /// Whether chunk bytes were compressed at rest
    pub compressed: bool,
}

impl PayloadMap {
    /// Map for `payload` split into `chunks`.
    pub fn new(job_id: &str, payload: &[u8], chunks: &[Chunk], compressed: bool) -> Self {
        Self {
            job_id: job_id.to_string(),
            original_size: payload.len(),
            chunk_refs: chunks
                .iter()
                .map(|c| ChunkReference {
                    hash: c.hash,
                    offset: c.offset,
                    size: c.size(),
                })
                .collect(),
            checksum: compute_checksum(payload),
            created_at: Utc::now(),
            compressed,
        }
    }

    /// Distinct chunk hashes, in sorted order. A payload holds one reference
    /// per distinct chunk however often the chunk repeats.
    pub fn unique_hashes(&self) -> BTreeSet<ChunkHash> {
        self.chunk_refs.iter().map(|r| r.hash).collect()
    }

    /// True when references are contiguous from offset 0 and cover `original_size`.
    pub fn is_contiguous(&self) -> bool {
        let mut expected = 0u64;
        for r in &self.chunk_refs {
            if r.offset != expected {
                return false;
            }
            expected += r.size as u64;
        }
        expected == self.original_size as u64
    }
}

/// Capability interface for payload map persistence.
#[async_trait]
pub trait PayloadMapStore: Send + Sync {
    /// Write (or replace) the map for `map.job_id`.
    async fn save(&self, map: &PayloadMap) -> Result<()>;
    /// Read a map; `None` if absent or expired.
    async fn load(&self, job_id: &str) -> Result<Option<PayloadMap>>;
    /// Delete a map. Returns true if it existed.
    async fn delete(&self, job_id: &str) -> Result<bool>;
    /// Job ids with a stored map, at most `limit`.
    async fn list(&self, limit: Option<usize>) -> Result<Vec<String>>;
}

/// Payload maps stored as JSON under `payload:<job_id>` with a retention TTL.
pub struct KvPayloadMapStore {
    kv: Arc<dyn KvStore>,
    keys: KeySpace,
    retention: Duration,
}

impl KvPayloadMapStore {
    /// Build from configuration.
    pub fn new(kv: Arc<dyn KvStore>, config: &DedupConfig) -> Self {
        Self {
            kv,
            keys: KeySpace::new(config.key_prefix.clone()),
            retention: config.store.payload_retention(),
        }
    }
}

#[async_trait]
impl PayloadMapStore for KvPayloadMapStore {
    async fn save(&self, map: &PayloadMap) -> Result<()> {
        let value = serde_json::to_vec(map)?;
        self.kv
            .set(&self.keys.payload(&map.job_id), value, Some(self.retention))
            .await
            .map_err(|e| DedupError::store(format!("save payload map {}", map.job_id), e))?;
        debug!(job_id = %map.job_id, chunks = map.chunk_refs.len(), "saved payload map");
        Ok(())
    }

    async fn load(&self, job_id: &str) -> Result<Option<PayloadMap>> {
        let raw = self
            .kv
            .get(&self.keys.payload(job_id))
            .await
            .map_err(|e| DedupError::store(format!("load payload map {job_id}"), e))?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| DedupError::PayloadMapCorrupt {
                job_id: job_id.to_string(),
                reason: e.to_string(),
            })
    }

    async fn delete(&self, job_id: &str) -> Result<bool> {
        self.kv
            .delete(&self.keys.payload(job_id))
            .await
            .map_err(|e| DedupError::store(format!("delete payload map {job_id}"), e))
    }

    async fn list(&self, limit: Option<usize>) -> Result<Vec<String>> {
        let prefix = self.keys.payload_prefix();
        let keys = self
            .kv
            .scan_keys(&prefix, limit)
            .await
            .map_err(|e| DedupError::store("list payload maps", e))?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvstore::MemoryKvStore;
    use bytes::Bytes;

    fn sample_map(job_id: &str) -> PayloadMap {
        let payload = b"aaaabbbbaaaa";
        let chunks = vec![
            Chunk::new(Bytes::from_static(b"aaaa"), 0),
            Chunk::new(Bytes::from_static(b"bbbb"), 4),
            Chunk::new(Bytes::from_static(b"aaaa"), 8),
        ];
        PayloadMap::new(job_id, payload, &chunks, true)
    }

    #[test]
    fn test_map_shape() {
        let map = sample_map("job-1");
        assert_eq!(map.original_size, 12);
        assert_eq!(map.chunk_refs.len(), 3);
        assert_eq!(map.unique_hashes().len(), 2);
        assert!(map.is_contiguous());
        assert_eq!(map.checksum, compute_checksum(b"aaaabbbbaaaa"));

        let mut gap = map.clone();
        gap.chunk_refs.remove(1);
        assert!(!gap.is_contiguous());
    }

    #[test]
    fn test_empty_payload_map() {
        let map = PayloadMap::new("empty", b"", &[], false);
        assert!(map.chunk_refs.is_empty());
        assert!(map.is_contiguous());
    }

    #[tokio::test]
    async fn test_save_load_delete_list() {
        let config = DedupConfig::default();
        let store = KvPayloadMapStore::new(Arc::new(MemoryKvStore::new()), &config);
        let map = sample_map("job-1");
        store.save(&map).await.unwrap();
        store.save(&sample_map("job-2")).await.unwrap();

        assert_eq!(store.load("job-1").await.unwrap(), Some(map));
        assert_eq!(store.load("missing").await.unwrap(), None);
        assert_eq!(store.list(None).await.unwrap(), vec!["job-1", "job-2"]);
        assert_eq!(store.list(Some(1)).await.unwrap().len(), 1);

        assert!(store.delete("job-1").await.unwrap());
        assert!(!store.delete("job-1").await.unwrap());
        assert_eq!(store.list(None).await.unwrap(), vec!["job-2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_maps_expire_after_retention() {
        let mut config = DedupConfig::default();
        config.store.payload_retention_secs = 60;
        let store = KvPayloadMapStore::new(Arc::new(MemoryKvStore::new()), &config);
        store.save(&sample_map("job-1")).await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(store.load("job-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_corrupt_map_is_reported() {
        let config = DedupConfig::default();
        let mem = MemoryKvStore::new();
        let store = KvPayloadMapStore::new(Arc::new(mem.clone()), &config);
        mem.set(&KeySpace::new(config.key_prefix.clone()).payload("bad"), b"{not json".to_vec(), None)
            .await
            .unwrap();
        assert!(matches!(
            store.load("bad").await,
            Err(DedupError::PayloadMapCorrupt { job_id, .. }) if job_id == "bad"
        ));
    }
}
