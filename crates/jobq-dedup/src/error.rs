//! Error types for the payload deduplication engine

use std::time::Duration;

use crate::fingerprint::ChunkHash;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, DedupError>;

/// Errors raised by a [`KvStore`](crate::kvstore::KvStore) backend.
#[derive(Debug, Clone, thiserror::Error)]
pub enum KvError {
    /// Backend unreachable or refused the operation
    #[error("backing store unavailable: {0}")]
    Unavailable(String),
    /// Operation did not complete before its deadline
    #[error("backing store operation `{op}` timed out after {after:?}")]
    Timeout {
        /// Store operation name
        op: &'static str,
        /// Deadline that elapsed
        after: Duration,
    },
    /// A stored value could not be interpreted (e.g. non-integer counter)
    #[error("corrupt value in backing store: {0}")]
    Corrupt(String),
}

/// Error category, one per row of the engine's error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid bounds or settings; fatal at startup
    Configuration,
    /// Backing store unavailable or timed out; retryable
    Storage,
    /// Encode/decode failure
    Compression,
    /// Reference counter drift or corruption; repaired by audit
    Reference,
    /// Checksum mismatch or missing chunk at reconstruction
    Integrity,
    /// Deletion failure or overlapping GC runs
    GarbageCollection,
    /// Request exceeds configured resource limits
    Resource,
}

/// All errors that can occur in deduplication, reconstruction, and reclamation
#[derive(Debug, thiserror::Error)]
pub enum DedupError {
    /// Configuration failed validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Configuration file could not be read or parsed
    #[error("failed to load configuration: {0}")]
    ConfigLoad(String),
    /// Deduplication is switched off in the configuration
    #[error("deduplication is disabled")]
    Disabled,
    /// Backing store operation failed; `context` names the operation and key
    #[error("{context}: {source}")]
    Store {
        /// Operation plus hash or job id
        context: String,
        /// Underlying store error
        #[source]
        source: KvError,
    },
    /// Compression failed
    #[error("compression failed: {0}")]
    CompressionFailed(String),
    /// Stored chunk bytes could not be decompressed; indicates store corruption
    #[error("decompression failed for chunk {hash}: {reason}")]
    DecompressionFailed {
        /// Chunk whose stored bytes are unreadable
        hash: ChunkHash,
        /// Decoder message
        reason: String,
    },
    /// Dictionary training or installation failed
    #[error("dictionary build failed: {0}")]
    DictionaryBuildFailed(String),
    /// Reference count could not be read or updated consistently
    #[error("reference count corruption for {hash}: {reason}")]
    ReferenceCorruption {
        /// Hex chunk hash (may be unparseable, hence a string)
        hash: String,
        /// What was wrong
        reason: String,
    },
    /// Reconstructed bytes do not match the payload map checksum
    #[error("payload corrupted or chunk missing: checksum mismatch for job {job_id}")]
    ChecksumMismatch {
        /// Job whose payload failed verification
        job_id: String,
    },
    /// A chunk referenced by a payload map is absent from the chunk store
    #[error("payload corrupted or chunk missing: chunk {hash} not found")]
    ChunkNotFound {
        /// Missing chunk
        hash: ChunkHash,
    },
    /// No payload map stored for this job
    #[error("payload map not found for job {job_id}")]
    PayloadNotFound {
        /// Requested job id
        job_id: String,
    },
    /// A payload map record could not be decoded
    #[error("payload map for job {job_id} is unreadable: {reason}")]
    PayloadMapCorrupt {
        /// Job id of the unreadable record
        job_id: String,
        /// Decoder message
        reason: String,
    },
    /// Another garbage collection cycle is already running
    #[error("garbage collection already in progress")]
    GcInProgress,
    /// Garbage collection could not enumerate candidates
    #[error("garbage collection failed: {0}")]
    GcFailed(String),
    /// Payload exceeds the configured memory ceiling
    #[error("payload of {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge {
        /// Payload size in bytes
        size: usize,
        /// Configured limit in bytes
        limit: usize,
    },
    /// The background processor has stopped
    #[error("background processor shut down")]
    ShutDown,
    /// Serialization of a persisted record failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DedupError {
    /// Wrap a store error with operation context.
    pub fn store(context: impl Into<String>, source: KvError) -> Self {
        DedupError::Store {
            context: context.into(),
            source,
        }
    }

    /// Category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DedupError::InvalidConfig(_)
            | DedupError::ConfigLoad(_)
            | DedupError::Disabled
            | DedupError::ShutDown => ErrorKind::Configuration,
            DedupError::Store { source, .. } => match source {
                KvError::Corrupt(_) => ErrorKind::Reference,
                _ => ErrorKind::Storage,
            },
            DedupError::CompressionFailed(_)
            | DedupError::DecompressionFailed { .. }
            | DedupError::DictionaryBuildFailed(_) => ErrorKind::Compression,
            DedupError::ReferenceCorruption { .. } => ErrorKind::Reference,
            DedupError::ChecksumMismatch { .. }
            | DedupError::ChunkNotFound { .. }
            | DedupError::PayloadNotFound { .. }
            | DedupError::PayloadMapCorrupt { .. } => ErrorKind::Integrity,
            DedupError::GcInProgress | DedupError::GcFailed(_) => ErrorKind::GarbageCollection,
            DedupError::PayloadTooLarge { .. } => ErrorKind::Resource,
            DedupError::Serialization(_) => ErrorKind::Storage,
        }
    }

    /// True when the caller may retry the whole operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DedupError::Store {
                source: KvError::Unavailable(_) | KvError::Timeout { .. },
                ..
            }
        )
    }

    /// True for reconstruction failures that need operator attention.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            DedupError::ChecksumMismatch { .. } | DedupError::ChunkNotFound { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_are_retryable() {
        let err = DedupError::store(
            "store chunk abc",
            KvError::Timeout {
                op: "write_batch",
                after: Duration::from_millis(5),
            },
        );
        assert!(err.is_retryable());
        assert_eq!(err.kind(), ErrorKind::Storage);
        assert!(err.to_string().starts_with("store chunk abc"));
    }

    #[test]
    fn corrupt_counter_is_reference_category() {
        let err = DedupError::store("get refcount", KvError::Corrupt("NaN".into()));
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), ErrorKind::Reference);
    }

    #[test]
    fn integrity_errors_render_clearly() {
        let err = DedupError::ChunkNotFound {
            hash: ChunkHash([7u8; 32]),
        };
        assert!(err.is_integrity_failure());
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("payload corrupted or chunk missing"));

        let err = DedupError::ChecksumMismatch {
            job_id: "job-1".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Integrity);
        assert!(err.to_string().contains("job-1"));
    }
}
