//! Chunk reference counting over a single store hash.
//!
//! Each count is updated with a single-key atomic operation; there is no
//! transaction spanning a count and the chunk or payload map it describes.
//! Drift from crashes or races is corrected by [`ReferenceCounter::audit_and_repair`],
//! which treats the stored payload maps as ground truth.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::config::DedupConfig;
use crate::error::{DedupError, Result};
use crate::fingerprint::ChunkHash;
use crate::kvstore::{KeySpace, KvStore};
use crate::payload_map::PayloadMapStore;

/// Outcome of one audit-and-repair pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditReport {
    /// Payload maps read
    pub payloads_scanned: usize,
    /// Maps skipped because they could not be decoded
    pub corrupt_maps: usize,
    /// Distinct hashes referenced by the scanned maps
    pub hashes_referenced: usize,
    /// Counts overwritten with the recomputed value
    pub counts_repaired: usize,
    /// Count entries removed because nothing references them
    pub entries_removed: usize,
    /// Wall time of the pass in milliseconds
    pub duration_ms: u64,
    /// Job ids whose maps were read
    #[serde(skip)]
    pub live_jobs: HashSet<String>,
}

impl AuditReport {
    /// True if the pass changed any stored count.
    pub fn repaired_anything(&self) -> bool {
        self.counts_repaired > 0 || self.entries_removed > 0
    }
}

/// Capability interface for reference counting.
#[async_trait]
pub trait ReferenceCounter: Send + Sync {
    /// Increment and return the new count.
    async fn add(&self, hash: &ChunkHash) -> Result<i64>;

    /// Decrement and return the new count, floored at 0. The entry is removed
    /// once it reaches 0.
    async fn remove(&self, hash: &ChunkHash) -> Result<i64>;

    /// Current count, 0 if absent.
    async fn get(&self, hash: &ChunkHash) -> Result<i64>;

    /// Every stored count.
    async fn get_all(&self) -> Result<HashMap<ChunkHash, i64>>;

    /// Recompute every count from the stored payload maps and overwrite those
    /// that disagree. A failure to read the maps aborts before any write.
    async fn audit_and_repair(&self) -> Result<AuditReport>;
}

/// [`ReferenceCounter`] backed by the `refs:global` hash.
pub struct KvReferenceCounter {
    kv: Arc<dyn KvStore>,
    refs_key: String,
    payloads: Arc<dyn PayloadMapStore>,
}

impl KvReferenceCounter {
    /// Build from configuration; `payloads` is the ground truth for audits.
    pub fn new(
        kv: Arc<dyn KvStore>,
        payloads: Arc<dyn PayloadMapStore>,
        config: &DedupConfig,
    ) -> Self {
        Self {
            kv,
            refs_key: KeySpace::new(config.key_prefix.clone()).refs(),
            payloads,
        }
    }

    async fn raw_counts(&self) -> Result<HashMap<String, i64>> {
        self.kv
            .hgetall(&self.refs_key)
            .await
            .map_err(|e| DedupError::store("read reference counts", e))
    }

    async fn recount(&self, report: &mut AuditReport) -> Result<HashMap<ChunkHash, i64>> {
        let job_ids = self.payloads.list(None).await?;
        let mut truth: HashMap<ChunkHash, i64> = HashMap::new();
        for job_id in job_ids {
            match self.payloads.load(&job_id).await {
                Ok(Some(map)) => {
                    report.payloads_scanned += 1;
                    for hash in map.unique_hashes() {
                        *truth.entry(hash).or_insert(0) += 1;
                    }
                    report.live_jobs.insert(job_id);
                }
                // expired between scan and load
                Ok(None) => {}
                Err(DedupError::PayloadMapCorrupt { job_id, reason }) => {
                    warn!(job_id = %job_id, reason = %reason, "skipping unreadable payload map during audit");
                    report.corrupt_maps += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(truth)
    }
}

#[async_trait]
impl ReferenceCounter for KvReferenceCounter {
    async fn add(&self, hash: &ChunkHash) -> Result<i64> {
        let count = self
            .kv
            .hincr_by(&self.refs_key, &hash.to_hex(), 1)
            .await
            .map_err(|e| DedupError::store(format!("add reference {}", hash.short()), e))?;
        // the stored count was negative, so GC may treat the chunk as unreferenced
        if count < 1 {
            return Err(DedupError::ReferenceCorruption {
                hash: hash.to_hex(),
                reason: format!("count is {count} after increment"),
            });
        }
        Ok(count)
    }

    async fn remove(&self, hash: &ChunkHash) -> Result<i64> {
        self.kv
            .hdecr_floor(&self.refs_key, &hash.to_hex())
            .await
            .map_err(|e| DedupError::store(format!("remove reference {}", hash.short()), e))
    }

    async fn get(&self, hash: &ChunkHash) -> Result<i64> {
        let count = self
            .kv
            .hget(&self.refs_key, &hash.to_hex())
            .await
            .map_err(|e| DedupError::store(format!("get reference {}", hash.short()), e))?;
        Ok(count.unwrap_or(0))
    }

    async fn get_all(&self) -> Result<HashMap<ChunkHash, i64>> {
        let raw = self.raw_counts().await?;
        let mut counts = HashMap::with_capacity(raw.len());
        for (field, count) in raw {
            match ChunkHash::from_hex(&field) {
                Some(hash) => {
                    counts.insert(hash, count);
                }
                None => warn!(field = %field, "ignoring malformed reference count field"),
            }
        }
        Ok(counts)
    }

    #[instrument(skip(self))]
    async fn audit_and_repair(&self) -> Result<AuditReport> {
        let started = Instant::now();
        let mut report = AuditReport::default();

        let stored = self.raw_counts().await?;
        let truth = self.recount(&mut report).await?;
        report.hashes_referenced = truth.len();

        for (hash, &count) in &truth {
            let field = hash.to_hex();
            if stored.get(&field) != Some(&count) {
                debug!(hash = %hash.short(), stored = ?stored.get(&field), actual = count, "repairing reference count");
                self.kv
                    .hset(&self.refs_key, &field, count)
                    .await
                    .map_err(|e| DedupError::store(format!("repair reference {}", hash.short()), e))?;
                report.counts_repaired += 1;
            }
        }

        for field in stored.keys() {
            let referenced = ChunkHash::from_hex(field).is_some_and(|h| truth.contains_key(&h));
            if !referenced {
                if ChunkHash::from_hex(field).is_none() {
                    warn!(field = %field, "removing malformed reference count field");
                }
                self.kv
                    .hdel(&self.refs_key, field)
                    .await
                    .map_err(|e| DedupError::store(format!("remove stale reference {field}"), e))?;
                report.entries_removed += 1;
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            payloads = report.payloads_scanned,
            corrupt = report.corrupt_maps,
            repaired = report.counts_repaired,
            removed = report.entries_removed,
            "reference audit complete"
        );
        Ok(report)
    }
}
