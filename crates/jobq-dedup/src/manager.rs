//! Deduplication manager: the engine's public entry point.
//!
//! Orchestrates chunking, chunk storage, reference counting, payload maps,
//! garbage collection, and auditing over one shared [`KvStore`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::chunk_store::{ChunkStore, KvChunkStore};
use crate::chunker::{build_chunker, Chunk, Chunker};
use crate::compression::{ChunkCompressor, CompressionAlgorithm, CompressionStats, Compressor};
use crate::config::DedupConfig;
use crate::error::{DedupError, Result};
use crate::fingerprint::{validate_checksum, ChunkHash};
use crate::gc::{GarbageCollector, GcReport, GcState, OrphanedChunk};
use crate::kvstore::{KvStore, TimedKvStore};
use crate::metrics::{ChunkStats, DedupMetrics, DedupStats};
use crate::payload_map::{KvPayloadMapStore, PayloadMap, PayloadMapStore};
use crate::refcount::{AuditReport, KvReferenceCounter, ReferenceCounter};
use crate::similarity::{MinHashIndex, SimilarPayload, SimilarityDetector};

/// Result of [`DedupManager::validate_integrity`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    /// Audit pass that re-established reference counts
    pub audit: AuditReport,
    /// Unreferenced chunks past the grace window after the audit
    pub orphaned_chunks: usize,
}

/// Overall engine health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Everything nominal
    Healthy,
    /// Serving, but something needs attention
    Degraded,
    /// Backing store unreachable
    Unhealthy,
}

/// Serializable health summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Overall status
    pub status: HealthStatus,
    /// Whether a probe of the backing store succeeded
    pub store_reachable: bool,
    /// Collector state at the time of the check
    pub gc_state: GcState,
    /// Last completed GC cycle
    pub last_gc: Option<GcReport>,
    /// Current statistics
    pub stats: DedupStats,
    /// Compressor statistics
    pub compression: CompressionStats,
    /// Human-readable problems
    pub issues: Vec<String>,
}

/// Store-derived statistics, recomputed by [`DedupManager::refresh_stats`].
#[derive(Debug, Clone, Default)]
struct StoreStats {
    unique_chunks: u64,
    plaintext_bytes: u64,
    stored_bytes: u64,
    logical_bytes: u64,
    refreshed_at: Option<chrono::DateTime<Utc>>,
}

/// The deduplication engine.
pub struct DedupManager {
    config: DedupConfig,
    chunker: Arc<dyn Chunker>,
    compressor: Arc<ChunkCompressor>,
    chunks: Arc<KvChunkStore>,
    payloads: Arc<dyn PayloadMapStore>,
    refs: Arc<dyn ReferenceCounter>,
    gc: GarbageCollector,
    similarity: Arc<dyn SimilarityDetector>,
    metrics: Arc<DedupMetrics>,
    store_stats: RwLock<StoreStats>,
}

impl DedupManager {
    /// Validate `config`, wire every component over `kv`, and reload
    /// persisted compression dictionaries.
    pub async fn new(config: DedupConfig, kv: Arc<dyn KvStore>) -> Result<Self> {
        config.validate()?;
        let kv: Arc<dyn KvStore> = Arc::new(TimedKvStore::new(kv, config.store.operation_timeout()));

        let chunker = build_chunker(&config)?;
        let compressor = Arc::new(ChunkCompressor::new(&config.compression));
        let chunks = Arc::new(KvChunkStore::new(kv.clone(), compressor.clone(), &config));
        let payloads: Arc<dyn PayloadMapStore> = Arc::new(KvPayloadMapStore::new(kv.clone(), &config));
        let refs: Arc<dyn ReferenceCounter> =
            Arc::new(KvReferenceCounter::new(kv, payloads.clone(), &config));
        let gc = GarbageCollector::new(chunks.clone(), refs.clone(), config.gc.clone());
        let similarity: Arc<dyn SimilarityDetector> = Arc::new(MinHashIndex::new(&config.chunking));

        // registered even when disabled, so blobs written with a dictionary stay readable
        chunks.load_dictionaries().await?;

        info!(
            algorithm = ?config.chunking.algorithm,
            avg_chunk_size = config.chunking.avg_chunk_size,
            compression = ?compressor.algorithm(),
            "deduplication manager ready"
        );
        Ok(Self {
            config,
            chunker,
            compressor,
            chunks,
            payloads,
            refs,
            gc,
            similarity,
            metrics: Arc::new(DedupMetrics::new()),
            store_stats: RwLock::new(StoreStats::default()),
        })
    }

    /// Active configuration
    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    /// Shared metrics counters
    pub fn metrics(&self) -> Arc<DedupMetrics> {
        self.metrics.clone()
    }

    /// Chunk `payload`, store new chunks, count references, and persist the
    /// payload map.
    ///
    /// A reference is added before the chunk is stored, so a concurrent GC
    /// never sees a chunk this call depends on as unreferenced. If a store
    /// operation fails partway the call fails; chunks already written are
    /// harmless and counts that leaked are corrected by the next audit.
    /// Deduplicating an existing job id replaces its map and releases the old
    /// references.
    #[instrument(skip(self, payload), fields(job_id = %job_id, size = payload.len()))]
    pub async fn deduplicate_payload(&self, job_id: &str, payload: &[u8]) -> Result<PayloadMap> {
        if !self.config.enabled {
            return Err(DedupError::Disabled);
        }
        let limit = self.config.max_payload_bytes();
        if payload.len() > limit {
            return Err(DedupError::PayloadTooLarge {
                size: payload.len(),
                limit,
            });
        }

        let previous = match self.payloads.load(job_id).await {
            Ok(previous) => previous,
            // its references are left for the audit to reconcile
            Err(DedupError::PayloadMapCorrupt { reason, .. }) => {
                warn!(reason = %reason, "replacing unreadable payload map");
                None
            }
            Err(e) => return Err(e),
        };

        let chunks = self.chunker.chunk(payload);
        let mut seen = HashSet::with_capacity(chunks.len());
        let (mut new_chunks, mut reused_chunks) = (0u64, 0u64);
        let stored_before = self.compressor.stats().bytes_out;

        for chunk in chunks.iter().filter(|c| seen.insert(c.hash)) {
            self.refs.add(&chunk.hash).await?;
            if self.chunks.store(chunk).await? {
                new_chunks += 1;
            } else {
                reused_chunks += 1;
            }
        }
        // repeats within the payload reuse a chunk stored a moment ago
        reused_chunks += (chunks.len() - seen.len()) as u64;

        let compressed = self.compressor.algorithm() != CompressionAlgorithm::None;
        let map = PayloadMap::new(job_id, payload, &chunks, compressed);
        self.payloads.save(&map).await?;

        if let Some(old) = previous {
            self.release_references(&old).await?;
        }

        self.similarity.insert(job_id, self.similarity.signature(payload));
        self.compressor.add_sample(payload);
        let stored = self.compressor.stats().bytes_out.saturating_sub(stored_before);
        self.metrics
            .record_payload(payload.len() as u64, new_chunks, reused_chunks, stored);

        debug!(
            chunks = chunks.len(),
            new_chunks,
            reused_chunks,
            "payload deduplicated"
        );
        Ok(map)
    }

    /// Fetch every referenced chunk in order, concatenate, and verify the checksum.
    #[instrument(skip(self, map), fields(job_id = %map.job_id, chunks = map.chunk_refs.len()))]
    pub async fn reconstruct_payload(&self, map: &PayloadMap) -> Result<Bytes> {
        let result = self.reassemble(map).await;
        match &result {
            Ok(_) => self.metrics.record_reconstruct(),
            Err(e) if e.is_integrity_failure() => {
                self.metrics.record_integrity_failure();
                error!(error = %e, "payload integrity failure");
            }
            Err(_) => {}
        }
        result
    }

    async fn reassemble(&self, map: &PayloadMap) -> Result<Bytes> {
        let mut out = BytesMut::with_capacity(map.original_size);
        let mut fetched: HashMap<ChunkHash, Bytes> = HashMap::new();

        for r in &map.chunk_refs {
            let data = match fetched.get(&r.hash) {
                Some(data) => data.clone(),
                None => {
                    let data = match self.chunks.get(&r.hash).await {
                        Ok(Some(data)) => data,
                        Ok(None) => return Err(DedupError::ChunkNotFound { hash: r.hash }),
                        Err(DedupError::DecompressionFailed { hash, reason }) => {
                            warn!(hash = %hash.short(), reason = %reason, "stored chunk is undecodable");
                            return Err(DedupError::ChecksumMismatch {
                                job_id: map.job_id.clone(),
                            });
                        }
                        Err(e) => return Err(e),
                    };
                    fetched.insert(r.hash, data.clone());
                    data
                }
            };
            out.extend_from_slice(&data);
        }

        if out.len() != map.original_size || !validate_checksum(&out, &map.checksum) {
            return Err(DedupError::ChecksumMismatch {
                job_id: map.job_id.clone(),
            });
        }
        Ok(out.freeze())
    }

    /// Stored payload map for `job_id`.
    pub async fn get_payload_map(&self, job_id: &str) -> Result<Option<PayloadMap>> {
        self.payloads.load(job_id).await
    }

    /// Load the map for `job_id` and reconstruct its payload.
    pub async fn reconstruct_job(&self, job_id: &str) -> Result<Bytes> {
        let map = self
            .payloads
            .load(job_id)
            .await?
            .ok_or_else(|| DedupError::PayloadNotFound {
                job_id: job_id.to_string(),
            })?;
        self.reconstruct_payload(&map).await
    }

    /// Delete a job's payload map, then release its references. Returns false
    /// if no map was stored.
    #[instrument(skip(self))]
    pub async fn delete_payload(&self, job_id: &str) -> Result<bool> {
        let Some(map) = self.payloads.load(job_id).await? else {
            return Ok(false);
        };
        // map first: a crash in between over-counts, which audit repairs and GC tolerates
        self.payloads.delete(job_id).await?;
        self.release_references(&map).await?;
        self.similarity.remove(job_id);
        debug!(chunks = map.chunk_refs.len(), "payload deleted");
        Ok(true)
    }

    async fn release_references(&self, map: &PayloadMap) -> Result<()> {
        for hash in map.unique_hashes() {
            self.refs.remove(&hash).await?;
        }
        Ok(())
    }

    /// Job ids with a stored payload map.
    pub async fn list_payloads(&self, limit: Option<usize>) -> Result<Vec<String>> {
        self.payloads.list(limit).await
    }

    /// Store a chunk without adding a reference. Unreferenced chunks are
    /// reclaimed by GC once the grace window passes.
    pub async fn store_chunk(&self, data: Bytes) -> Result<ChunkHash> {
        let chunk = Chunk::new(data, 0);
        self.chunks.store(&chunk).await?;
        Ok(chunk.hash)
    }

    /// Fetch a chunk's plaintext.
    pub async fn get_chunk(&self, hash: &ChunkHash) -> Result<Bytes> {
        self.chunks
            .get(hash)
            .await?
            .ok_or(DedupError::ChunkNotFound { hash: *hash })
    }

    /// Release one reference; delete the chunk if none remain. Returns
    /// whether the chunk was deleted.
    pub async fn delete_chunk(&self, hash: &ChunkHash) -> Result<bool> {
        if self.refs.remove(hash).await? > 0 {
            return Ok(false);
        }
        self.chunks.delete_unreferenced(hash).await
    }

    /// Increment a chunk's reference count.
    pub async fn add_reference(&self, hash: &ChunkHash) -> Result<i64> {
        self.refs.add(hash).await
    }

    /// Decrement a chunk's reference count, floored at 0.
    pub async fn remove_reference(&self, hash: &ChunkHash) -> Result<i64> {
        self.refs.remove(hash).await
    }

    /// Current reference count.
    pub async fn reference_count(&self, hash: &ChunkHash) -> Result<i64> {
        self.refs.get(hash).await
    }

    /// Current statistics. Store-derived fields reflect the last refresh.
    pub fn stats(&self) -> DedupStats {
        let m = self.metrics.snapshot();
        let s = self
            .store_stats
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let savings = s.logical_bytes as i64 - s.stored_bytes as i64;
        DedupStats {
            total_payloads: m.payloads_deduplicated,
            unique_chunks: s.unique_chunks,
            total_bytes_in: m.bytes_in,
            total_bytes_stored: s.stored_bytes,
            compression_ratio: ratio(s.plaintext_bytes, s.stored_bytes),
            dedup_ratio: ratio(s.logical_bytes, s.plaintext_bytes),
            memory_savings: savings,
            savings_percent: if s.logical_bytes == 0 {
                0.0
            } else {
                savings as f64 / s.logical_bytes as f64 * 100.0
            },
            chunk_hit_rate: m.hit_rate(),
            average_chunk_size: if s.unique_chunks == 0 {
                0.0
            } else {
                s.plaintext_bytes as f64 / s.unique_chunks as f64
            },
            last_updated: s.refreshed_at,
        }
    }

    /// Recompute store-derived statistics from chunk metadata and reference counts.
    #[instrument(skip(self))]
    pub async fn refresh_stats(&self) -> Result<DedupStats> {
        let hashes = self.chunks.list(None).await?;
        let counts = self.refs.get_all().await?;
        let mut s = StoreStats {
            unique_chunks: hashes.len() as u64,
            ..StoreStats::default()
        };
        for hash in &hashes {
            if let Some(meta) = self.chunks.metadata(hash).await? {
                s.plaintext_bytes += meta.size as u64;
                s.stored_bytes += meta.compressed_size as u64;
                let refs = counts.get(hash).copied().unwrap_or(0).max(0) as u64;
                s.logical_bytes += refs * meta.size as u64;
            }
        }
        s.refreshed_at = Some(Utc::now());
        *self.store_stats.write().unwrap_or_else(|e| e.into_inner()) = s;
        let stats = self.stats();
        debug!(
            unique_chunks = stats.unique_chunks,
            dedup_ratio = stats.dedup_ratio,
            "statistics refreshed"
        );
        Ok(stats)
    }

    /// Metadata and reference count of one chunk; `None` if it is not stored.
    pub async fn chunk_stats(&self, hash: &ChunkHash) -> Result<Option<ChunkStats>> {
        let meta = self.chunks.metadata(hash).await?;
        if meta.is_none() && !self.chunks.exists(hash).await? {
            return Ok(None);
        }
        let ref_count = self.refs.get(hash).await?;
        Ok(Some(ChunkStats {
            hash: *hash,
            size: meta.as_ref().map(|m| m.size),
            compressed_size: meta.as_ref().map(|m| m.compressed_size),
            ref_count,
            created_at: meta.as_ref().map(|m| m.created_at),
            last_used_at: meta.map(|m| m.last_used_at),
        }))
    }

    /// Most referenced chunks, highest count first.
    pub async fn popular_chunks(&self, limit: usize) -> Result<Vec<(ChunkHash, i64)>> {
        let mut counts: Vec<_> = self.refs.get_all().await?.into_iter().collect();
        counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        counts.truncate(limit);
        Ok(counts)
    }

    /// Indexed payloads similar to `payload`.
    pub fn find_similar_payloads(&self, payload: &[u8]) -> Vec<SimilarPayload> {
        self.similarity.find_similar(&self.similarity.signature(payload))
    }

    /// Train a dictionary from sampled payloads, install it for new writes,
    /// and persist it. Returns `None` when dictionaries are disabled.
    pub async fn build_dictionary(&self) -> Result<Option<u32>> {
        if !self.compressor.uses_dictionary() {
            return Ok(None);
        }
        let dict = self
            .compressor
            .train_dictionary()
            .map_err(|e| DedupError::DictionaryBuildFailed(e.to_string()))?;
        let id = self.compressor.install_dictionary(dict.clone());
        self.chunks.persist_dictionary(id, &dict).await?;
        Ok(Some(id))
    }

    /// Run one garbage collection cycle.
    pub async fn run_garbage_collection(&self) -> Result<GcReport> {
        let report = self.gc.run().await?;
        self.metrics.record_gc_cycle(
            report.chunks_deleted as u64,
            report.bytes_reclaimed,
            report.failures as u64,
        );
        Ok(report)
    }

    /// Unreferenced chunks past the grace window.
    pub async fn orphaned_chunks(&self) -> Result<Vec<OrphanedChunk>> {
        Ok(self.gc.find_orphans().await?.1)
    }

    /// Collector state
    pub fn gc_state(&self) -> GcState {
        self.gc.state()
    }

    /// Recompute reference counts from payload maps and repair drift.
    ///
    /// Maps that expired since the last audit lose their references here, and
    /// their entries are dropped from the similarity index.
    pub async fn audit_references(&self) -> Result<AuditReport> {
        // only entries indexed before the scan, so payloads added during it survive
        let indexed = self.similarity.job_ids();
        let report = self.refs.audit_and_repair().await?;
        self.metrics
            .record_audit((report.counts_repaired + report.entries_removed) as u64);

        let mut pruned = 0usize;
        for job_id in indexed.iter().filter(|id| !report.live_jobs.contains(*id)) {
            self.similarity.remove(job_id);
            pruned += 1;
        }
        if pruned > 0 {
            debug!(pruned, "dropped similarity entries of expired payloads");
        }
        Ok(report)
    }

    /// Audit references, then count the orphans the audit left behind.
    pub async fn validate_integrity(&self) -> Result<IntegrityReport> {
        let audit = self.audit_references().await?;
        let orphaned_chunks = self.orphaned_chunks().await?.len();
        Ok(IntegrityReport {
            audit,
            orphaned_chunks,
        })
    }

    /// Probe the store and summarize engine health.
    pub async fn health(&self) -> HealthReport {
        let mut issues = Vec::new();
        let store_reachable = match self.payloads.list(Some(1)).await {
            Ok(_) => true,
            Err(e) => {
                issues.push(format!("backing store probe failed: {e}"));
                false
            }
        };

        let metrics = self.metrics.snapshot();
        if metrics.integrity_failures > 0 {
            issues.push(format!(
                "{} reconstruction integrity failures",
                metrics.integrity_failures
            ));
        }
        let last_gc = self.gc.last_report();
        if let Some(gc) = &last_gc {
            if gc.failures > 0 {
                issues.push(format!("last gc cycle had {} deletion failures", gc.failures));
            }
        }
        let compression = self.compressor.stats();
        if compression.failures > 0 {
            issues.push(format!("{} codec failures", compression.failures));
        }

        let status = if !store_reachable {
            HealthStatus::Unhealthy
        } else if issues.is_empty() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };
        HealthReport {
            status,
            store_reachable,
            gc_state: self.gc.state(),
            last_gc,
            stats: self.stats(),
            compression,
            issues,
        }
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        1.0
    } else {
        numerator as f64 / denominator as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KvError;
    use crate::kvstore::{BatchOp, KeySpace, KvResult, MemoryKvStore};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Memory store whose next payload map read fails once when armed.
    struct FlakyStore {
        inner: MemoryKvStore,
        fail_payload_read: AtomicBool,
    }

    #[async_trait]
    impl KvStore for FlakyStore {
        async fn get(&self, key: &str) -> KvResult<Option<Vec<u8>>> {
            if key.contains(":payload:") && self.fail_payload_read.swap(false, Ordering::SeqCst) {
                return Err(KvError::Unavailable("connection reset".to_string()));
            }
            self.inner.get(key).await
        }
        async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> KvResult<()> {
            self.inner.set(key, value, ttl).await
        }
        async fn delete(&self, key: &str) -> KvResult<bool> {
            self.inner.delete(key).await
        }
        async fn exists(&self, key: &str) -> KvResult<bool> {
            self.inner.exists(key).await
        }
        async fn expire(&self, key: &str, ttl: Duration) -> KvResult<bool> {
            self.inner.expire(key, ttl).await
        }
        async fn scan_keys(&self, prefix: &str, limit: Option<usize>) -> KvResult<Vec<String>> {
            self.inner.scan_keys(prefix, limit).await
        }
        async fn write_batch(&self, ops: Vec<BatchOp>) -> KvResult<()> {
            self.inner.write_batch(ops).await
        }
        async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> KvResult<i64> {
            self.inner.hincr_by(key, field, delta).await
        }
        async fn hdecr_floor(&self, key: &str, field: &str) -> KvResult<i64> {
            self.inner.hdecr_floor(key, field).await
        }
        async fn hget(&self, key: &str, field: &str) -> KvResult<Option<i64>> {
            self.inner.hget(key, field).await
        }
        async fn hset(&self, key: &str, field: &str, value: i64) -> KvResult<()> {
            self.inner.hset(key, field, value).await
        }
        async fn hdel(&self, key: &str, field: &str) -> KvResult<bool> {
            self.inner.hdel(key, field).await
        }
        async fn hgetall(&self, key: &str) -> KvResult<HashMap<String, i64>> {
            self.inner.hgetall(key).await
        }
        async fn delete_if_unreferenced(
            &self,
            keys: &[String],
            guard_key: &str,
            guard_field: &str,
        ) -> KvResult<bool> {
            self.inner.delete_if_unreferenced(keys, guard_key, guard_field).await
        }
    }

    fn small_config() -> DedupConfig {
        let mut config = DedupConfig::default();
        config.chunking.min_chunk_size = 256;
        config.chunking.avg_chunk_size = 1024;
        config.chunking.max_chunk_size = 4096;
        config.chunking.window_size = 48;
        config.gc.orphan_grace_secs = 0;
        config
    }

    async fn manager(config: DedupConfig) -> (MemoryKvStore, DedupManager) {
        let mem = MemoryKvStore::new();
        let manager = DedupManager::new(config, Arc::new(mem.clone())).await.unwrap();
        (mem, manager)
    }

    fn pseudo_random(len: usize, seed: u64) -> Vec<u8> {
        let mut state = seed;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect()
    }

    #[tokio::test]
    async fn test_round_trip() {
        let (_, m) = manager(small_config()).await;
        let payload = pseudo_random(50_000, 11);
        let map = m.deduplicate_payload("job-1", &payload).await.unwrap();
        assert!(map.is_contiguous());
        assert_eq!(m.reconstruct_payload(&map).await.unwrap(), payload);
        assert_eq!(m.reconstruct_job("job-1").await.unwrap(), payload);
    }

    #[tokio::test]
    async fn test_empty_and_single_byte() {
        let (_, m) = manager(small_config()).await;
        let empty = m.deduplicate_payload("empty", b"").await.unwrap();
        assert!(empty.chunk_refs.is_empty());
        assert_eq!(m.reconstruct_payload(&empty).await.unwrap(), Bytes::new());

        let one = m.deduplicate_payload("one", b"x").await.unwrap();
        assert_eq!(one.chunk_refs.len(), 1);
        assert_eq!(m.reconstruct_payload(&one).await.unwrap(), &b"x"[..]);
    }

    #[tokio::test]
    async fn test_disabled_and_too_large() {
        let mut config = small_config();
        config.enabled = false;
        let (_, m) = manager(config).await;
        assert!(matches!(
            m.deduplicate_payload("job", b"data").await,
            Err(DedupError::Disabled)
        ));

        let mut config = small_config();
        config.max_memory_mb = 1;
        let (_, m) = manager(config).await;
        let big = vec![0u8; 1024 * 1024 + 1];
        assert!(matches!(
            m.deduplicate_payload("job", &big).await,
            Err(DedupError::PayloadTooLarge { size, limit }) if size == big.len() && limit == 1024 * 1024
        ));
    }

    #[tokio::test]
    async fn test_shared_chunks_are_counted_per_payload() {
        let (_, m) = manager(small_config()).await;
        let payload = pseudo_random(20_000, 5);
        let a = m.deduplicate_payload("a", &payload).await.unwrap();
        m.deduplicate_payload("b", &payload).await.unwrap();
        m.deduplicate_payload("c", &payload).await.unwrap();

        for hash in a.unique_hashes() {
            assert_eq!(m.reference_count(&hash).await.unwrap(), 3);
        }
        let snapshot = m.metrics().snapshot();
        assert_eq!(snapshot.payloads_deduplicated, 3);
        assert!(snapshot.chunks_reused >= 2 * a.unique_hashes().len() as u64);
    }

    #[tokio::test]
    async fn test_rededuplicating_a_job_replaces_its_references() {
        let (_, m) = manager(small_config()).await;
        let first = m
            .deduplicate_payload("job", &pseudo_random(8000, 1))
            .await
            .unwrap();
        let second = m
            .deduplicate_payload("job", &pseudo_random(8000, 2))
            .await
            .unwrap();
        for hash in first.unique_hashes() {
            if !second.unique_hashes().contains(&hash) {
                assert_eq!(m.reference_count(&hash).await.unwrap(), 0);
            }
        }
        for hash in second.unique_hashes() {
            assert_eq!(m.reference_count(&hash).await.unwrap(), 1);
        }
    }

    #[tokio::test]
    async fn test_failed_previous_map_read_aborts_replacement() {
        let store = Arc::new(FlakyStore {
            inner: MemoryKvStore::new(),
            fail_payload_read: AtomicBool::new(false),
        });
        let m = DedupManager::new(small_config(), store.clone()).await.unwrap();
        let first = m
            .deduplicate_payload("job", &pseudo_random(8000, 1))
            .await
            .unwrap();

        store.fail_payload_read.store(true, Ordering::SeqCst);
        let err = m
            .deduplicate_payload("job", &pseudo_random(8000, 2))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(m.get_payload_map("job").await.unwrap(), Some(first.clone()));
        for hash in first.unique_hashes() {
            assert_eq!(m.reference_count(&hash).await.unwrap(), 1);
        }

        // the retry releases the first map's references
        let second = m
            .deduplicate_payload("job", &pseudo_random(8000, 2))
            .await
            .unwrap();
        for hash in first.unique_hashes() {
            if !second.unique_hashes().contains(&hash) {
                assert_eq!(m.reference_count(&hash).await.unwrap(), 0);
            }
        }
    }

    #[tokio::test]
    async fn test_unreadable_previous_map_is_replaced() {
        let (mem, m) = manager(small_config()).await;
        let keys = KeySpace::new(m.config().key_prefix.clone());
        mem.set(&keys.payload("job"), b"{truncated".to_vec(), None)
            .await
            .unwrap();
        let map = m.deduplicate_payload("job", b"fresh payload").await.unwrap();
        assert_eq!(m.get_payload_map("job").await.unwrap(), Some(map));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_maps_release_chunks_on_audit() {
        let mut config = small_config();
        config.store.payload_retention_secs = 60;
        let (_, m) = manager(config).await;
        let payload = pseudo_random(10_000, 21);
        let map = m.deduplicate_payload("short-lived", &payload).await.unwrap();
        assert_eq!(m.find_similar_payloads(&payload).len(), 1);
        tokio::time::advance(Duration::from_secs(50)).await;
        let kept = b"deduplicated fifty seconds later";
        m.deduplicate_payload("kept", kept).await.unwrap();

        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(m.get_payload_map("short-lived").await.unwrap(), None);
        assert!(m.get_payload_map("kept").await.unwrap().is_some());
        assert_eq!(m.run_garbage_collection().await.unwrap().chunks_deleted, 0);

        let audit = m.audit_references().await.unwrap();
        assert_eq!(audit.payloads_scanned, 1);
        assert_eq!(audit.entries_removed, map.unique_hashes().len());
        assert!(m.find_similar_payloads(&payload).is_empty());
        assert_eq!(m.find_similar_payloads(kept).len(), 1);

        let report = m.run_garbage_collection().await.unwrap();
        assert_eq!(report.chunks_deleted, map.unique_hashes().len());
        assert!(m.reconstruct_job("kept").await.is_ok());
        for hash in map.unique_hashes() {
            assert!(matches!(
                m.get_chunk(&hash).await,
                Err(DedupError::ChunkNotFound { .. })
            ));
        }
    }

    #[tokio::test]
    async fn test_refresh_stats_skips_unreadable_metadata() {
        let (mem, m) = manager(small_config()).await;
        let keys = KeySpace::new(m.config().key_prefix.clone());
        let map = m.deduplicate_payload("job", &pseudo_random(6000, 9)).await.unwrap();
        mem.set(&keys.chunk_meta(&map.chunk_refs[0].hash), b"not json".to_vec(), None)
            .await
            .unwrap();

        let stats = m.refresh_stats().await.unwrap();
        assert_eq!(stats.unique_chunks, map.unique_hashes().len() as u64);
        assert!(stats.total_bytes_stored > 0);
    }

    #[tokio::test]
    async fn test_delete_payload_then_gc() {
        let (_, m) = manager(small_config()).await;
        let payload = pseudo_random(10_000, 3);
        let map = m.deduplicate_payload("job", &payload).await.unwrap();
        assert!(m.delete_payload("job").await.unwrap());
        assert!(!m.delete_payload("job").await.unwrap());
        for hash in map.unique_hashes() {
            assert_eq!(m.reference_count(&hash).await.unwrap(), 0);
        }

        let report = m.run_garbage_collection().await.unwrap();
        assert_eq!(report.chunks_deleted, map.unique_hashes().len());
        assert!(matches!(
            m.reconstruct_job("job").await,
            Err(DedupError::PayloadNotFound { .. })
        ));
        assert_eq!(m.metrics().snapshot().gc_cycles, 1);
    }

    #[tokio::test]
    async fn test_missing_chunk_is_integrity_failure() {
        let (mem, m) = manager(small_config()).await;
        let map = m.deduplicate_payload("job", b"a small payload").await.unwrap();
        let keys = KeySpace::new(m.config().key_prefix.clone());
        mem.delete(&keys.chunk(&map.chunk_refs[0].hash)).await.unwrap();

        let err = m.reconstruct_payload(&map).await.unwrap_err();
        assert!(matches!(err, DedupError::ChunkNotFound { .. }));
        assert!(err.to_string().contains("payload corrupted or chunk missing"));
        assert_eq!(m.metrics().snapshot().integrity_failures, 1);
        assert_eq!(m.health().await.status, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn test_chunk_api() {
        let (_, m) = manager(small_config()).await;
        let hash = m.store_chunk(Bytes::from_static(b"standalone")).await.unwrap();
        assert_eq!(m.get_chunk(&hash).await.unwrap(), &b"standalone"[..]);
        assert_eq!(m.add_reference(&hash).await.unwrap(), 1);
        assert_eq!(m.add_reference(&hash).await.unwrap(), 2);
        assert!(!m.delete_chunk(&hash).await.unwrap());
        assert!(m.get_chunk(&hash).await.is_ok());
        assert!(m.delete_chunk(&hash).await.unwrap());
        assert!(matches!(
            m.get_chunk(&hash).await,
            Err(DedupError::ChunkNotFound { .. })
        ));
        assert_eq!(m.remove_reference(&hash).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stats_and_popular_chunks() {
        let (_, m) = manager(small_config()).await;
        let shared = pseudo_random(6000, 8);
        m.deduplicate_payload("a", &shared).await.unwrap();
        m.deduplicate_payload("b", &shared).await.unwrap();
        m.deduplicate_payload("c", b"unique and small").await.unwrap();

        let stats = m.refresh_stats().await.unwrap();
        assert_eq!(stats.total_payloads, 3);
        assert!(stats.unique_chunks >= 2);
        assert!(stats.dedup_ratio > 1.5);
        assert!(stats.memory_savings > 0);
        assert!(stats.last_updated.is_some());

        let popular = m.popular_chunks(1).await.unwrap();
        assert_eq!(popular.len(), 1);
        assert_eq!(popular[0].1, 2);

        let chunk = m.chunk_stats(&popular[0].0).await.unwrap().unwrap();
        assert_eq!(chunk.ref_count, 2);
        assert!(chunk.size.is_some());
    }

    #[tokio::test]
    async fn test_find_similar_payloads() {
        let (_, m) = manager(small_config()).await;
        let base: Vec<u8> = (0..5000u32).flat_map(|i| format!("k{i}=v{};", i % 97).into_bytes()).collect();
        m.deduplicate_payload("base", &base).await.unwrap();
        let mut near = base.clone();
        near.extend_from_slice(b"extra=1;");
        let similar = m.find_similar_payloads(&near);
        assert_eq!(similar.first().map(|s| s.job_id.as_str()), Some("base"));

        m.delete_payload("base").await.unwrap();
        assert!(m.find_similar_payloads(&near).is_empty());
    }

    #[tokio::test]
    async fn test_dictionary_build_and_reload() {
        let (mem, m) = manager(small_config()).await;
        for i in 0..50 {
            let payload = format!(r#"{{"job":"send_email","to":"user{i}@example.com","retries":3}}"#);
            m.deduplicate_payload(&format!("job-{i}"), payload.as_bytes())
                .await
                .unwrap();
        }
        let id = m.build_dictionary().await.unwrap().unwrap();
        m.deduplicate_payload("after", br#"{"job":"send_email","to":"late@example.com"}"#)
            .await
            .unwrap();

        let restarted = DedupManager::new(small_config(), Arc::new(mem)).await.unwrap();
        assert_eq!(restarted.compressor.active_dictionary(), Some(id));
        assert!(restarted.reconstruct_job("after").await.is_ok());
        assert!(restarted.reconstruct_job("job-7").await.is_ok());
    }

    #[tokio::test]
    async fn test_validate_integrity_and_health() {
        let (mem, m) = manager(small_config()).await;
        m.deduplicate_payload("job", &pseudo_random(3000, 4)).await.unwrap();
        m.store_chunk(Bytes::from_static(b"dangling")).await.unwrap();

        let report = m.validate_integrity().await.unwrap();
        assert!(!report.audit.repaired_anything());
        assert_eq!(report.orphaned_chunks, 1);

        assert_eq!(m.health().await.status, HealthStatus::Healthy);
        mem.set_offline(true);
        let health = m.health().await;
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert!(!health.store_reachable);
    }

    #[tokio::test]
    async fn test_invalid_config_fails_fast() {
        let mut config = small_config();
        config.chunking.avg_chunk_size = 100;
        let result = DedupManager::new(config, Arc::new(MemoryKvStore::new())).await;
        assert!(matches!(result, Err(DedupError::InvalidConfig(_))));
    }
}
