#![warn(missing_docs)]

//! Job queue payload deduplication: content-defined chunking (Rabin/FastCDC),
//! chunk CAS with LZ4/Zstd compression, reference counting, and garbage collection.
//!
//! Write path: Payload → Chunk → Fingerprint (BLAKE3) → Add reference → Compress → Store → Payload map
//! Read path:  Payload map → Fetch chunks → Decompress → Concatenate → Verify (SHA-256)

pub mod background;
pub mod chunk_store;
pub mod chunker;
pub mod compression;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod gc;
pub mod kvstore;
pub mod manager;
pub mod metrics;
pub mod payload_map;
pub mod refcount;
pub mod rolling_hash;
pub mod similarity;
pub mod telemetry;

pub use background::{BackgroundHandle, BackgroundProcessor, BackgroundStats, BackgroundTask};
pub use chunk_store::{ChunkMetadata, ChunkStore, KvChunkStore};
pub use chunker::{build_chunker, Chunk, Chunker, ChunkingAnalysis, FastCdcChunker, RabinChunker};
pub use compression::{ChunkCompressor, CompressionAlgorithm, CompressionStats, Compressor};
pub use config::{
    ChunkingAlgorithm, ChunkingConfig, CodecKind, CompressionConfig, ConfigDiff, DedupConfig,
    GcConfig, LogFormat, LoggingConfig, StoreConfig,
};
pub use error::{DedupError, ErrorKind, KvError, Result};
pub use fingerprint::{blake3_hash, compute_checksum, validate_checksum, Checksum, ChunkHash};
pub use gc::{GarbageCollector, GcReport, GcState, OrphanedChunk};
pub use kvstore::{BatchOp, KeySpace, KvStore, MemoryKvStore, TimedKvStore};
pub use manager::{DedupManager, HealthReport, HealthStatus, IntegrityReport};
pub use metrics::{ChunkStats, DedupMetric, DedupMetrics, DedupStats, MetricKind, MetricValue, MetricsSnapshot};
pub use payload_map::{ChunkReference, KvPayloadMapStore, PayloadMap, PayloadMapStore};
pub use refcount::{AuditReport, KvReferenceCounter, ReferenceCounter};
pub use rolling_hash::{RabinTables, RollingHash};
pub use similarity::{MinHashIndex, MinHashSignature, SimilarPayload, SimilarityDetector};
pub use telemetry::init_tracing;
