//! Prometheus-compatible metrics and aggregate statistics for the dedup engine.
//!
//! [`DedupMetrics`] holds lock-free counters updated on the hot path.
//! [`DedupStats`] is the derived view served by `stats()`; it is safe to
//! recompute from the chunk store and reference map at any time.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fingerprint::ChunkHash;

/// The type of metric: counter or gauge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// A monotonically increasing counter.
    Counter,
    /// A gauge that can go up or down.
    Gauge,
}

/// The value of a metric.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    /// A counter value.
    Counter(u64),
    /// A gauge value.
    Gauge(f64),
}

/// A single metric with metadata and value.
#[derive(Debug, Clone, PartialEq)]
pub struct DedupMetric {
    /// The metric name.
    pub name: String,
    /// Help text describing the metric.
    pub help: String,
    /// The kind of metric.
    pub kind: MetricKind,
    /// The metric value.
    pub value: MetricValue,
}

/// Thread-safe counters for deduplication, reconstruction, GC, and audit.
#[derive(Debug, Default)]
pub struct DedupMetrics {
    payloads_deduplicated: AtomicU64,
    payloads_reconstructed: AtomicU64,
    bytes_in: AtomicU64,
    chunks_processed: AtomicU64,
    chunks_new: AtomicU64,
    chunks_reused: AtomicU64,
    bytes_stored: AtomicU64,
    integrity_failures: AtomicU64,
    gc_cycles: AtomicU64,
    gc_chunks_deleted: AtomicU64,
    gc_bytes_freed: AtomicU64,
    gc_failures: AtomicU64,
    audits: AtomicU64,
    references_repaired: AtomicU64,
}

impl DedupMetrics {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one deduplicated payload.
    #[inline]
    pub fn record_payload(&self, bytes: u64, new_chunks: u64, reused_chunks: u64, stored: u64) {
        self.payloads_deduplicated.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes, Ordering::Relaxed);
        self.chunks_processed
            .fetch_add(new_chunks + reused_chunks, Ordering::Relaxed);
        self.chunks_new.fetch_add(new_chunks, Ordering::Relaxed);
        self.chunks_reused.fetch_add(reused_chunks, Ordering::Relaxed);
        self.bytes_stored.fetch_add(stored, Ordering::Relaxed);
    }

    /// Record a successful reconstruction.
    #[inline]
    pub fn record_reconstruct(&self) {
        self.payloads_reconstructed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a checksum mismatch or missing chunk.
    #[inline]
    pub fn record_integrity_failure(&self) {
        self.integrity_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed GC cycle.
    #[inline]
    pub fn record_gc_cycle(&self, deleted: u64, bytes_freed: u64, failures: u64) {
        self.gc_cycles.fetch_add(1, Ordering::Relaxed);
        self.gc_chunks_deleted.fetch_add(deleted, Ordering::Relaxed);
        self.gc_bytes_freed.fetch_add(bytes_freed, Ordering::Relaxed);
        self.gc_failures.fetch_add(failures, Ordering::Relaxed);
    }

    /// Record a completed audit.
    #[inline]
    pub fn record_audit(&self, repaired: u64) {
        self.audits.fetch_add(1, Ordering::Relaxed);
        self.references_repaired
            .fetch_add(repaired, Ordering::Relaxed);
    }

    /// Take a point-in-time snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            payloads_deduplicated: self.payloads_deduplicated.load(Ordering::Relaxed),
            payloads_reconstructed: self.payloads_reconstructed.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            chunks_processed: self.chunks_processed.load(Ordering::Relaxed),
            chunks_new: self.chunks_new.load(Ordering::Relaxed),
            chunks_reused: self.chunks_reused.load(Ordering::Relaxed),
            bytes_stored: self.bytes_stored.load(Ordering::Relaxed),
            integrity_failures: self.integrity_failures.load(Ordering::Relaxed),
            gc_cycles: self.gc_cycles.load(Ordering::Relaxed),
            gc_chunks_deleted: self.gc_chunks_deleted.load(Ordering::Relaxed),
            gc_bytes_freed: self.gc_bytes_freed.load(Ordering::Relaxed),
            gc_failures: self.gc_failures.load(Ordering::Relaxed),
            audits: self.audits.load(Ordering::Relaxed),
            references_repaired: self.references_repaired.load(Ordering::Relaxed),
        }
    }

    /// Collect all metrics with Prometheus names and help text.
    pub fn collect(&self) -> Vec<DedupMetric> {
        let s = self.snapshot();
        let counter = |name: &str, help: &str, v: u64| DedupMetric {
            name: format!("jobq_dedup_{name}"),
            help: help.to_string(),
            kind: MetricKind::Counter,
            value: MetricValue::Counter(v),
        };
        vec![
            counter("payloads_total", "Payloads deduplicated", s.payloads_deduplicated),
            counter(
                "reconstructions_total",
                "Payloads reconstructed and verified",
                s.payloads_reconstructed,
            ),
            counter("bytes_in_total", "Payload bytes received", s.bytes_in),
            counter("chunks_total", "Chunks produced by the chunker", s.chunks_processed),
            counter("chunks_new_total", "Chunks written to the store", s.chunks_new),
            counter("chunks_reused_total", "Chunks already present in the store", s.chunks_reused),
            counter("bytes_stored_total", "Blob bytes written for new chunks", s.bytes_stored),
            counter(
                "integrity_failures_total",
                "Reconstructions failing checksum or missing a chunk",
                s.integrity_failures,
            ),
            counter("gc_cycles_total", "Completed garbage collection cycles", s.gc_cycles),
            counter("gc_chunks_deleted_total", "Chunks deleted by GC", s.gc_chunks_deleted),
            counter("gc_bytes_freed_total", "Blob bytes released by GC", s.gc_bytes_freed),
            counter("gc_failures_total", "Per-chunk GC deletion failures", s.gc_failures),
            counter("audits_total", "Reference audit passes", s.audits),
            counter(
                "references_repaired_total",
                "Reference counts rewritten by audit",
                s.references_repaired,
            ),
            DedupMetric {
                name: "jobq_dedup_chunk_hit_rate".to_string(),
                help: "Fraction of chunks already present (reused / processed)".to_string(),
                kind: MetricKind::Gauge,
                value: MetricValue::Gauge(s.hit_rate()),
            },
        ]
    }

    /// Render metrics in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for m in self.collect() {
            let (kind, value) = match m.value {
                MetricValue::Counter(v) => ("counter", v.to_string()),
                MetricValue::Gauge(v) => ("gauge", format!("{v}")),
            };
            out.push_str(&format!("# HELP {} {}\n", m.name, m.help));
            out.push_str(&format!("# TYPE {} {kind}\n", m.name));
            out.push_str(&format!("{} {value}\n", m.name));
        }
        out
    }
}

/// A point-in-time snapshot of [`DedupMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Payloads deduplicated
    pub payloads_deduplicated: u64,
    /// Payloads reconstructed
    pub payloads_reconstructed: u64,
    /// Payload bytes received
    pub bytes_in: u64,
    /// Chunks produced
    pub chunks_processed: u64,
    /// Chunks newly stored
    pub chunks_new: u64,
    /// Chunks already present
    pub chunks_reused: u64,
    /// Blob bytes written
    pub bytes_stored: u64,
    /// Integrity failures
    pub integrity_failures: u64,
    /// GC cycles
    pub gc_cycles: u64,
    /// Chunks deleted by GC
    pub gc_chunks_deleted: u64,
    /// Blob bytes freed by GC
    pub gc_bytes_freed: u64,
    /// GC deletion failures
    pub gc_failures: u64,
    /// Audit passes
    pub audits: u64,
    /// Counts repaired by audits
    pub references_repaired: u64,
}

impl MetricsSnapshot {
    /// `chunks_reused / chunks_processed`, 0.0 before any chunk is seen.
    pub fn hit_rate(&self) -> f64 {
        if self.chunks_processed == 0 {
            0.0
        } else {
            self.chunks_reused as f64 / self.chunks_processed as f64
        }
    }
}

/// Aggregate deduplication statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DedupStats {
    /// Payloads deduplicated by this process
    pub total_payloads: u64,
    /// Chunks currently stored
    pub unique_chunks: u64,
    /// Payload bytes received by this process
    pub total_bytes_in: u64,
    /// Blob bytes currently stored
    pub total_bytes_stored: u64,
    /// Plaintext bytes of stored chunks / blob bytes
    pub compression_ratio: f64,
    /// Logical bytes referenced by payloads / plaintext bytes stored
    pub dedup_ratio: f64,
    /// Logical referenced bytes minus stored bytes
    pub memory_savings: i64,
    /// `memory_savings` as a percentage of logical bytes
    pub savings_percent: f64,
    /// Fraction of processed chunks that were already stored
    pub chunk_hit_rate: f64,
    /// Mean plaintext size of stored chunks
    pub average_chunk_size: f64,
    /// When the store-derived fields were last recomputed
    pub last_updated: Option<DateTime<Utc>>,
}

/// Per-chunk view combining metadata and reference count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkStats {
    /// Chunk hash
    pub hash: ChunkHash,
    /// Plaintext size, if metadata is available
    pub size: Option<usize>,
    /// Blob size, if metadata is available
    pub compressed_size: Option<usize>,
    /// Current reference count
    pub ref_count: i64,
    /// First store
    pub created_at: Option<DateTime<Utc>>,
    /// Last use
    pub last_used_at: Option<DateTime<Utc>>,
}
