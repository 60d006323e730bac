//! Engine configuration: defaults, validation, file loading, and tuning helpers.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::compression::CompressionAlgorithm;
use crate::error::{DedupError, Result};

/// Rabin polynomial of degree 53 used by the rolling hash.
pub const DEFAULT_POLYNOMIAL: u64 = 0x3DA3358B4DC173;

// Bounds enforced by the fastcdc v2020 implementation.
const FASTCDC_MIN_MIN: usize = 64;
const FASTCDC_MAX_MIN: usize = 1_048_576;
const FASTCDC_MIN_AVG: usize = 256;
const FASTCDC_MAX_AVG: usize = 4_194_304;
const FASTCDC_MIN_MAX: usize = 1024;
const FASTCDC_MAX_MAX: usize = 16_777_216;

/// Boundary detection algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChunkingAlgorithm {
    /// Rabin rolling hash with a mask test (default)
    #[default]
    Rabin,
    /// FastCDC 2020 gear hash
    FastCdc,
}

/// Chunking and similarity settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Which chunker implementation to construct
    pub algorithm: ChunkingAlgorithm,
    /// Minimum chunk size in bytes
    pub min_chunk_size: usize,
    /// Maximum chunk size in bytes
    pub max_chunk_size: usize,
    /// Target average chunk size in bytes
    pub avg_chunk_size: usize,
    /// Rolling hash window in bytes
    pub window_size: usize,
    /// Irreducible polynomial for the Rabin fingerprint
    pub polynomial: u64,
    /// Minimum estimated Jaccard similarity reported by `find_similar`
    pub similarity_threshold: f64,
    /// MinHash signature length
    pub num_hashes: usize,
    /// LSH bands; must divide `num_hashes`
    pub bands: usize,
    /// Shingle width in bytes
    pub shingle_size: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            algorithm: ChunkingAlgorithm::Rabin,
            min_chunk_size: 1024,
            max_chunk_size: 64 * 1024,
            avg_chunk_size: 8 * 1024,
            window_size: 64,
            polynomial: DEFAULT_POLYNOMIAL,
            similarity_threshold: 0.8,
            num_hashes: 128,
            bands: 16,
            shingle_size: 3,
        }
    }
}

/// Codec family for stored chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CodecKind {
    /// LZ4 block format
    Lz4,
    /// Zstandard, optionally with a trained dictionary
    #[default]
    Zstd,
}

/// Compression settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Compress chunk bytes before storing
    pub enabled: bool,
    /// Codec family
    pub codec: CodecKind,
    /// Zstd level (1-19)
    pub level: i32,
    /// Train and use a shared dictionary (zstd only)
    pub use_dictionary: bool,
    /// Maximum dictionary size in bytes
    pub dictionary_size: usize,
    /// Sample pool cap: number of samples
    pub max_samples: usize,
    /// Sample pool cap: total bytes
    pub max_sample_bytes: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            codec: CodecKind::Zstd,
            level: 3,
            use_dictionary: true,
            dictionary_size: 64 * 1024,
            max_samples: 1000,
            max_sample_bytes: 10 * 1024 * 1024,
        }
    }
}

impl CompressionConfig {
    /// Algorithm used for newly stored chunks.
    pub fn algorithm(&self) -> CompressionAlgorithm {
        match (self.enabled, self.codec) {
            (false, _) => CompressionAlgorithm::None,
            (true, CodecKind::Lz4) => CompressionAlgorithm::Lz4,
            (true, CodecKind::Zstd) => CompressionAlgorithm::Zstd { level: self.level },
        }
    }

    /// Whether dictionaries apply to the configured codec.
    pub fn dictionary_active(&self) -> bool {
        self.enabled && self.use_dictionary && self.codec == CodecKind::Zstd
    }
}

/// Garbage collection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Run the periodic GC loop
    pub enabled: bool,
    /// Seconds between GC cycles
    pub interval_secs: u64,
    /// Unreferenced chunks younger than this (by last use) are kept
    pub orphan_grace_secs: u64,
    /// Chunks deleted per batch
    pub batch_size: usize,
    /// Concurrent deletions within a batch
    pub worker_count: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 3600,
            orphan_grace_secs: 24 * 3600,
            batch_size: 1000,
            worker_count: 4,
        }
    }
}

impl GcConfig {
    /// GC loop period
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Minimum idle age before an orphan is reclaimed
    pub fn orphan_grace(&self) -> Duration {
        Duration::from_secs(self.orphan_grace_secs)
    }
}

/// Backing store settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Deadline applied to every store operation, in milliseconds
    pub operation_timeout_ms: u64,
    /// TTL for payload maps
    pub payload_retention_secs: u64,
    /// TTL for chunk metadata (refreshed on touch)
    pub chunk_meta_retention_secs: u64,
    /// Skip `last_used` writes for chunks touched more recently than this
    pub touch_debounce_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            operation_timeout_ms: 5000,
            payload_retention_secs: 7 * 24 * 3600,
            chunk_meta_retention_secs: 7 * 24 * 3600,
            touch_debounce_secs: 60,
        }
    }
}

impl StoreConfig {
    /// Per-operation deadline
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// Payload map TTL
    pub fn payload_retention(&self) -> Duration {
        Duration::from_secs(self.payload_retention_secs)
    }

    /// Chunk metadata TTL
    pub fn chunk_meta_retention(&self) -> Duration {
        Duration::from_secs(self.chunk_meta_retention_secs)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

/// Logging settings consumed by [`crate::telemetry::init_tracing`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    pub level: String,
    /// Output format
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// Top-level configuration for the deduplication engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Master switch; when false `deduplicate_payload` returns `Disabled`
    pub enabled: bool,
    /// Prefix prepended to every backing store key
    pub key_prefix: String,
    /// Chunking and similarity
    pub chunking: ChunkingConfig,
    /// Compression
    pub compression: CompressionConfig,
    /// Garbage collection
    pub gc: GcConfig,
    /// Backing store
    pub store: StoreConfig,
    /// Largest payload accepted, in MiB
    pub max_memory_mb: u64,
    /// Seconds between stats refreshes
    pub stats_interval_secs: u64,
    /// Seconds between scheduled reference audits; `None` disables the loop.
    /// The audit is what releases references held by expired payload maps.
    pub audit_interval_secs: Option<u64>,
    /// Logging
    pub logging: LoggingConfig,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            key_prefix: "jobq:dedup:".to_string(),
            chunking: ChunkingConfig::default(),
            compression: CompressionConfig::default(),
            gc: GcConfig::default(),
            store: StoreConfig::default(),
            max_memory_mb: 1024,
            stats_interval_secs: 300,
            audit_interval_secs: Some(24 * 3600),
            logging: LoggingConfig::default(),
        }
    }
}

fn invalid(msg: impl Into<String>) -> DedupError {
    DedupError::InvalidConfig(msg.into())
}

impl DedupConfig {
    /// Load from a `.toml` or `.json` file and validate.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| DedupError::ConfigLoad(format!("{}: {e}", path.display())))?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: DedupConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)
                .map_err(|e| DedupError::ConfigLoad(format!("{}: {e}", path.display())))?,
            "json" => serde_json::from_str(&contents)
                .map_err(|e| DedupError::ConfigLoad(format!("{}: {e}", path.display())))?,
            _ => {
                return Err(DedupError::ConfigLoad(format!(
                    "unsupported config file extension: {ext}"
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Check every numeric bound. Invalid settings fail fast.
    pub fn validate(&self) -> Result<()> {
        let c = &self.chunking;
        if c.min_chunk_size == 0 {
            return Err(invalid("min_chunk_size must be positive"));
        }
        if c.max_chunk_size <= c.min_chunk_size {
            return Err(invalid(format!(
                "max_chunk_size ({}) must be greater than min_chunk_size ({})",
                c.max_chunk_size, c.min_chunk_size
            )));
        }
        if c.avg_chunk_size <= c.min_chunk_size || c.avg_chunk_size >= c.max_chunk_size {
            return Err(invalid(format!(
                "avg_chunk_size ({}) must lie strictly between min ({}) and max ({})",
                c.avg_chunk_size, c.min_chunk_size, c.max_chunk_size
            )));
        }
        if c.window_size == 0 || c.window_size > 256 {
            return Err(invalid(format!(
                "window_size must be between 1 and 256, got {}",
                c.window_size
            )));
        }
        if c.window_size > c.min_chunk_size {
            return Err(invalid(format!(
                "window_size ({}) must not exceed min_chunk_size ({})",
                c.window_size, c.min_chunk_size
            )));
        }
        let degree = 63 - c.polynomial.leading_zeros() as i64;
        if !(16..=56).contains(&degree) {
            return Err(invalid(format!(
                "polynomial {:#x} has degree {degree}, expected 16..=56",
                c.polynomial
            )));
        }
        if !(0.0..=1.0).contains(&c.similarity_threshold) {
            return Err(invalid(format!(
                "similarity_threshold must be between 0.0 and 1.0, got {:.2}",
                c.similarity_threshold
            )));
        }
        if c.num_hashes == 0 || c.bands == 0 || c.num_hashes % c.bands != 0 {
            return Err(invalid(format!(
                "bands ({}) must be positive and divide num_hashes ({})",
                c.bands, c.num_hashes
            )));
        }
        if c.shingle_size == 0 {
            return Err(invalid("shingle_size must be positive"));
        }
        if c.algorithm == ChunkingAlgorithm::FastCdc {
            if !(FASTCDC_MIN_MIN..=FASTCDC_MAX_MIN).contains(&c.min_chunk_size)
                || !(FASTCDC_MIN_AVG..=FASTCDC_MAX_AVG).contains(&c.avg_chunk_size)
                || !(FASTCDC_MIN_MAX..=FASTCDC_MAX_MAX).contains(&c.max_chunk_size)
            {
                return Err(invalid(format!(
                    "fastcdc requires min in {FASTCDC_MIN_MIN}..={FASTCDC_MAX_MIN}, \
                     avg in {FASTCDC_MIN_AVG}..={FASTCDC_MAX_AVG}, \
                     max in {FASTCDC_MIN_MAX}..={FASTCDC_MAX_MAX}"
                )));
            }
        }

        let z = &self.compression;
        if z.enabled && z.codec == CodecKind::Zstd && !(1..=19).contains(&z.level) {
            return Err(invalid(format!(
                "compression level must be between 1 and 19, got {}",
                z.level
            )));
        }
        if z.dictionary_active() {
            if z.dictionary_size == 0 || z.dictionary_size > 1 << 20 {
                return Err(invalid(format!(
                    "dictionary_size must be between 1 and 1MiB, got {}",
                    z.dictionary_size
                )));
            }
            if z.max_samples == 0 || z.max_sample_bytes == 0 {
                return Err(invalid("dictionary sample pool caps must be positive"));
            }
        }

        let g = &self.gc;
        if g.enabled {
            if g.interval_secs == 0 {
                return Err(invalid("gc interval must be positive"));
            }
            if g.batch_size == 0 {
                return Err(invalid("gc batch_size must be positive"));
            }
            if g.worker_count == 0 {
                return Err(invalid("gc worker_count must be positive"));
            }
        }

        if self.store.operation_timeout_ms == 0 {
            return Err(invalid("store operation_timeout_ms must be positive"));
        }
        if self.store.payload_retention_secs == 0 || self.store.chunk_meta_retention_secs == 0 {
            return Err(invalid("retention periods must be positive"));
        }
        if self.max_memory_mb == 0 {
            return Err(invalid("max_memory_mb must be positive"));
        }
        if self.stats_interval_secs == 0 {
            return Err(invalid("stats_interval must be positive"));
        }
        if self.audit_interval_secs == Some(0) {
            return Err(invalid("audit_interval must be positive when set"));
        }
        Ok(())
    }

    /// Bits in the boundary mask: smallest `b` with `2^b >= avg_chunk_size`.
    pub fn chunking_bits(&self) -> u32 {
        self.chunking
            .avg_chunk_size
            .max(1)
            .next_power_of_two()
            .trailing_zeros()
    }

    /// Boundary mask with `chunking_bits()` low bits set.
    pub fn chunking_mask(&self) -> u64 {
        (1u64 << self.chunking_bits()) - 1
    }

    /// Largest payload accepted, in bytes.
    pub fn max_payload_bytes(&self) -> usize {
        (self.max_memory_mb as usize).saturating_mul(1024 * 1024)
    }

    /// Stats refresh period
    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }

    /// Audit loop period, if enabled
    pub fn audit_interval(&self) -> Option<Duration> {
        self.audit_interval_secs.map(Duration::from_secs)
    }

    /// Rough storage footprint for `num_chunks` unique chunks.
    pub fn estimate_memory_usage(&self, num_chunks: u64, avg_payload_size: usize) -> u64 {
        let avg_chunk = self.chunking.avg_chunk_size as u64;
        let mut chunk_bytes = num_chunks * avg_chunk;
        if self.compression.enabled {
            chunk_bytes = (chunk_bytes as f64 * 0.7) as u64;
        }
        // hash + count + metadata record
        let metadata = num_chunks * (32 + 8 + 64);
        let chunks_per_payload = (avg_payload_size / self.chunking.avg_chunk_size).max(1) as u64;
        let payload_maps = num_chunks / chunks_per_payload * 256;
        chunk_bytes + metadata + payload_maps
    }

    /// Adjust chunk sizes, similarity threshold, and GC cadence for a workload.
    pub fn optimize_for_workload(&mut self, avg_payload_size: usize, repetition_rate: f64) {
        if avg_payload_size < 4096 {
            self.chunking.min_chunk_size = 256;
            self.chunking.avg_chunk_size = 1024;
            self.chunking.max_chunk_size = 8192;
        } else if avg_payload_size > 1 << 20 {
            self.chunking.min_chunk_size = 8192;
            self.chunking.avg_chunk_size = 32768;
            self.chunking.max_chunk_size = 262144;
        }
        self.chunking.window_size = self.chunking.window_size.min(self.chunking.min_chunk_size);

        if repetition_rate > 0.8 {
            self.chunking.similarity_threshold = 0.7;
            self.gc.interval_secs = 4 * 3600;
            self.gc.orphan_grace_secs = 48 * 3600;
        } else {
            if repetition_rate < 0.3 {
                self.chunking.similarity_threshold = 0.9;
            }
            self.gc.interval_secs = 30 * 60;
            self.gc.orphan_grace_secs = 6 * 3600;
        }
    }
}

/// Which sections differ between two configurations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConfigDiff {
    /// Chunking section changed
    pub chunking_changed: bool,
    /// Compression section changed
    pub compression_changed: bool,
    /// GC section changed
    pub gc_changed: bool,
    /// Store section changed
    pub store_changed: bool,
    /// Memory ceiling changed
    pub memory_limit_changed: bool,
}

impl ConfigDiff {
    /// Compare two configurations section by section.
    pub fn between(old: &DedupConfig, new: &DedupConfig) -> Self {
        Self {
            chunking_changed: old.chunking != new.chunking,
            compression_changed: old.compression != new.compression,
            gc_changed: old.gc != new.gc,
            store_changed: old.store != new.store,
            memory_limit_changed: old.max_memory_mb != new.max_memory_mb,
        }
    }

    /// Chunking or compression changes alter stored data and need a restart.
    pub fn has_significant_changes(&self) -> bool {
        self.chunking_changed || self.compression_changed
    }

    /// Human-readable list of changed sections.
    pub fn summary(&self) -> String {
        let mut changes = Vec::new();
        if self.chunking_changed {
            changes.push("chunking configuration");
        }
        if self.compression_changed {
            changes.push("compression settings");
        }
        if self.gc_changed {
            changes.push("garbage collection");
        }
        if self.store_changed {
            changes.push("store settings");
        }
        if self.memory_limit_changed {
            changes.push("memory limits");
        }
        if changes.is_empty() {
            "no changes".to_string()
        } else {
            format!("changed: {}", changes.join(", "))
        }
    }
}
