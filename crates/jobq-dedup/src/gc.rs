//! Garbage collection of unreferenced chunks.
//!
//! A cycle moves Idle -> Scanning -> Deleting -> Idle. Orphans are stored
//! chunks with no positive reference count whose last use is older than the
//! grace window. Each delete is conditioned on a zero count inside the store,
//! so a reference added after the scan always wins.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::chunk_store::ChunkStore;
use crate::config::GcConfig;
use crate::error::{DedupError, Result};
use crate::fingerprint::ChunkHash;
use crate::refcount::ReferenceCounter;

/// Collector state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GcState {
    /// No cycle running
    Idle,
    /// Enumerating orphan candidates
    Scanning,
    /// Deleting orphans in batches
    Deleting,
}

impl GcState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => GcState::Scanning,
            2 => GcState::Deleting,
            _ => GcState::Idle,
        }
    }
}

/// An unreferenced chunk eligible for deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrphanedChunk {
    /// Chunk hash
    pub hash: ChunkHash,
    /// Stored blob size, 0 if the metadata record expired
    pub compressed_size: usize,
    /// Last recorded use, `None` if the metadata record expired
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Statistics from a garbage collection cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcReport {
    /// Stored chunks examined
    pub chunks_scanned: usize,
    /// Orphans selected for deletion
    pub orphans_found: usize,
    /// Chunks deleted
    pub chunks_deleted: usize,
    /// Orphans that gained a reference before their delete ran
    pub skipped_referenced: usize,
    /// Per-chunk deletion failures; retried next cycle
    pub failures: usize,
    /// Stored bytes released
    pub bytes_reclaimed: u64,
    /// Wall time in milliseconds
    pub duration_ms: u64,
}

/// Resets the collector to Idle when a cycle ends, including on error or cancellation.
struct CycleGuard<'a>(&'a AtomicU8);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(GcState::Idle as u8, Ordering::SeqCst);
    }
}

/// Garbage collector over a chunk store and reference counter.
pub struct GarbageCollector {
    chunks: Arc<dyn ChunkStore>,
    refs: Arc<dyn ReferenceCounter>,
    config: GcConfig,
    state: AtomicU8,
    last_report: RwLock<Option<GcReport>>,
}

impl GarbageCollector {
    /// Create a collector.
    pub fn new(chunks: Arc<dyn ChunkStore>, refs: Arc<dyn ReferenceCounter>, config: GcConfig) -> Self {
        Self {
            chunks,
            refs,
            config,
            state: AtomicU8::new(GcState::Idle as u8),
            last_report: RwLock::new(None),
        }
    }

    /// Current state
    pub fn state(&self) -> GcState {
        GcState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Report of the last completed cycle
    pub fn last_report(&self) -> Option<GcReport> {
        self.last_report
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Stored chunks with no positive count and no use within the grace window.
    pub async fn find_orphans(&self) -> Result<(usize, Vec<OrphanedChunk>)> {
        let hashes = self.chunks.list(None).await?;
        let counts = self.refs.get_all().await?;
        let cutoff = chrono::Duration::from_std(self.config.orphan_grace())
            .ok()
            .and_then(|grace| Utc::now().checked_sub_signed(grace));

        let mut orphans = Vec::new();
        for hash in &hashes {
            if counts.get(hash).copied().unwrap_or(0) > 0 {
                continue;
            }
            let meta = self.chunks.metadata(hash).await?;
            let idle_long_enough = match (&meta, cutoff) {
                // metadata outlives the grace window unless the chunk went unused
                (None, _) => true,
                (Some(m), Some(cutoff)) => m.last_used_at <= cutoff,
                (Some(_), None) => false,
            };
            if idle_long_enough {
                orphans.push(OrphanedChunk {
                    hash: *hash,
                    compressed_size: meta.as_ref().map_or(0, |m| m.compressed_size),
                    last_used_at: meta.map(|m| m.last_used_at),
                });
            }
        }
        Ok((hashes.len(), orphans))
    }

    /// Run one cycle. Fails with [`DedupError::GcInProgress`] if one is running.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<GcReport> {
        self.state
            .compare_exchange(
                GcState::Idle as u8,
                GcState::Scanning as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map_err(|_| DedupError::GcInProgress)?;
        let _guard = CycleGuard(&self.state);
        let started = Instant::now();

        let (scanned, orphans) = self
            .find_orphans()
            .await
            .map_err(|e| DedupError::GcFailed(format!("orphan scan: {e}")))?;
        let mut report = GcReport {
            chunks_scanned: scanned,
            orphans_found: orphans.len(),
            ..GcReport::default()
        };

        self.state.store(GcState::Deleting as u8, Ordering::SeqCst);
        let batch_size = self.config.batch_size.max(1);
        let workers = self.config.worker_count.max(1);
        for (batch_no, batch) in orphans.chunks(batch_size).enumerate() {
            let store = Arc::clone(&self.chunks);
            let results: Vec<(OrphanedChunk, Result<bool>)> = stream::iter(batch.to_vec())
                .map(move |orphan| {
                    let store = Arc::clone(&store);
                    async move {
                        let result = store.delete_unreferenced(&orphan.hash).await;
                        (orphan, result)
                    }
                })
                .buffer_unordered(workers)
                .collect()
                .await;

            for (orphan, result) in results {
                match result {
                    Ok(true) => {
                        report.chunks_deleted += 1;
                        report.bytes_reclaimed += orphan.compressed_size as u64;
                    }
                    Ok(false) => report.skipped_referenced += 1,
                    Err(e) => {
                        warn!(hash = %orphan.hash.short(), error = %e, "failed to delete orphaned chunk");
                        report.failures += 1;
                    }
                }
            }
            debug!(batch = batch_no, size = batch.len(), "gc batch complete");
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            scanned = report.chunks_scanned,
            deleted = report.chunks_deleted,
            skipped = report.skipped_referenced,
            failures = report.failures,
            bytes = report.bytes_reclaimed,
            "garbage collection complete"
        );
        *self.last_report.write().unwrap_or_else(|e| e.into_inner()) = Some(report.clone());
        Ok(report)
    }
}
