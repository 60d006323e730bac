//! Content-defined chunking

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use fastcdc::v2020::FastCDC;
use serde::{Deserialize, Serialize};

use crate::config::{ChunkingAlgorithm, DedupConfig};
use crate::error::Result;
use crate::fingerprint::{blake3_hash, ChunkHash};
use crate::rolling_hash::{RabinTables, RollingHash};

/// A content-defined chunk of a payload, in plaintext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// BLAKE3 hash of the chunk content (CAS key)
    pub hash: ChunkHash,
    /// Chunk content
    pub data: Bytes,
    /// Byte offset of this chunk in the payload
    pub offset: u64,
}

impl Chunk {
    /// Build a chunk, hashing its content.
    pub fn new(data: Bytes, offset: u64) -> Self {
        Self {
            hash: blake3_hash(&data),
            data,
            offset,
        }
    }

    /// Plaintext length in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Splits a payload into chunks that cover it with no gaps or overlaps.
///
/// Implementations must be deterministic: identical input yields identical
/// boundaries and hashes.
pub trait Chunker: Send + Sync {
    /// Chunk `data`. Empty input yields no chunks.
    fn chunk(&self, data: &[u8]) -> Vec<Chunk>;
}

/// Construct the chunker selected by `config.chunking.algorithm`.
pub fn build_chunker(config: &DedupConfig) -> Result<Arc<dyn Chunker>> {
    Ok(match config.chunking.algorithm {
        ChunkingAlgorithm::Rabin => Arc::new(RabinChunker::new(config)?),
        ChunkingAlgorithm::FastCdc => Arc::new(FastCdcChunker::new(config)),
    })
}

/// Rabin rolling hash chunker with a mask boundary test.
///
/// The hash state carries across chunk boundaries within one payload; a cut is
/// taken where the window is full, the chunk has reached the minimum size, and
/// the low `bits` of the hash are zero, or where the chunk reaches the maximum.
pub struct RabinChunker {
    tables: Arc<RabinTables>,
    min_size: usize,
    max_size: usize,
    mask: u64,
}

impl RabinChunker {
    /// Build from a validated configuration.
    pub fn new(config: &DedupConfig) -> Result<Self> {
        let c = &config.chunking;
        Ok(Self {
            tables: Arc::new(RabinTables::new(c.polynomial, c.window_size)?),
            min_size: c.min_chunk_size,
            max_size: c.max_chunk_size,
            mask: config.chunking_mask(),
        })
    }
}

impl Chunker for RabinChunker {
    fn chunk(&self, data: &[u8]) -> Vec<Chunk> {
        if data.is_empty() {
            return Vec::new();
        }
        let source = Bytes::copy_from_slice(data);
        if data.len() < self.tables.window() {
            return vec![Chunk::new(source, 0)];
        }

        let mut hash = RollingHash::with_tables(self.tables.clone());
        let mut chunks = Vec::with_capacity(data.len() / self.min_size + 1);
        let mut start = 0usize;

        for (i, &b) in data.iter().enumerate() {
            let digest = hash.roll(b);
            let len = i + 1 - start;
            let natural = hash.is_full() && len >= self.min_size && digest & self.mask == 0;
            if natural || len >= self.max_size {
                chunks.push(Chunk::new(source.slice(start..i + 1), start as u64));
                start = i + 1;
            }
        }
        if start < data.len() {
            chunks.push(Chunk::new(source.slice(start..), start as u64));
        }
        chunks
    }
}

/// FastCDC (2020) gear hash chunker.
pub struct FastCdcChunker {
    min_size: u32,
    avg_size: u32,
    max_size: u32,
}

impl FastCdcChunker {
    /// Build from a validated configuration.
    pub fn new(config: &DedupConfig) -> Self {
        let c = &config.chunking;
        Self {
            min_size: c.min_chunk_size as u32,
            avg_size: c.avg_chunk_size as u32,
            max_size: c.max_chunk_size as u32,
        }
    }
}

impl Chunker for FastCdcChunker {
    fn chunk(&self, data: &[u8]) -> Vec<Chunk> {
        if data.is_empty() {
            return Vec::new();
        }
        let source = Bytes::copy_from_slice(data);
        FastCDC::new(data, self.min_size, self.avg_size, self.max_size)
            .map(|c| {
                let start = c.offset;
                let end = start + c.length;
                Chunk::new(source.slice(start..end), start as u64)
            })
            .collect()
    }
}

/// Summary of a chunk sequence, for tuning chunk sizes against real payloads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkingAnalysis {
    /// Chunks in the sequence
    pub total_chunks: usize,
    /// Distinct hashes
    pub unique_chunks: usize,
    /// `total_chunks - unique_chunks`
    pub duplicate_chunks: usize,
    /// Sum of all chunk sizes
    pub total_size: u64,
    /// Sum of sizes of distinct chunks
    pub unique_size: u64,
    /// Smallest chunk
    pub min_chunk_size: usize,
    /// Largest chunk
    pub max_chunk_size: usize,
    /// Mean chunk size
    pub avg_chunk_size: f64,
    /// `total_size / unique_size`
    pub dedup_ratio: f64,
}

impl ChunkingAnalysis {
    /// Analyze a chunk sequence.
    pub fn analyze(chunks: &[Chunk]) -> Self {
        if chunks.is_empty() {
            return Self::default();
        }
        let mut seen = HashSet::new();
        let mut analysis = Self {
            total_chunks: chunks.len(),
            min_chunk_size: usize::MAX,
            ..Self::default()
        };
        for chunk in chunks {
            let size = chunk.size();
            analysis.total_size += size as u64;
            analysis.min_chunk_size = analysis.min_chunk_size.min(size);
            analysis.max_chunk_size = analysis.max_chunk_size.max(size);
            if seen.insert(chunk.hash) {
                analysis.unique_size += size as u64;
            }
        }
        analysis.unique_chunks = seen.len();
        analysis.duplicate_chunks = analysis.total_chunks - analysis.unique_chunks;
        analysis.avg_chunk_size = analysis.total_size as f64 / analysis.total_chunks as f64;
        if analysis.unique_size > 0 {
            analysis.dedup_ratio = analysis.total_size as f64 / analysis.unique_size as f64;
        }
        analysis
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn small_config() -> DedupConfig {
        let mut config = DedupConfig::default();
        config.chunking.min_chunk_size = 256;
        config.chunking.avg_chunk_size = 1024;
        config.chunking.max_chunk_size = 4096;
        config.chunking.window_size = 48;
        config
    }

    fn pseudo_random(len: usize, seed: u64) -> Vec<u8> {
        let mut state = seed;
        (0..len)
            .map(|_| {
                state = state
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                (state >> 33) as u8
            })
            .collect()
    }

    fn concat(chunks: &[Chunk]) -> Vec<u8> {
        chunks.iter().flat_map(|c| c.data.iter().copied()).collect()
    }

    #[test]
    fn test_empty_input() {
        let chunker = RabinChunker::new(&small_config()).unwrap();
        assert!(chunker.chunk(&[]).is_empty());
    }

    #[test]
    fn test_shorter_than_window_is_single_chunk() {
        let chunker = RabinChunker::new(&small_config()).unwrap();
        let chunks = chunker.chunk(b"tiny");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].offset, 0);
        assert_eq!(&chunks[0].data[..], b"tiny");
        assert_eq!(chunks[0].hash, blake3_hash(b"tiny"));
    }

    #[test]
    fn test_covers_input_with_bounds() {
        let config = small_config();
        let chunker = RabinChunker::new(&config).unwrap();
        let data = pseudo_random(200_000, 42);
        let chunks = chunker.chunk(&data);
        assert!(chunks.len() > 10);
        assert_eq!(concat(&chunks), data);

        let mut expected_offset = 0u64;
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.offset, expected_offset);
            expected_offset += chunk.size() as u64;
            assert!(chunk.size() <= 4096);
            if i + 1 < chunks.len() {
                assert!(chunk.size() >= 256, "chunk {i} too small: {}", chunk.size());
            }
        }
    }

    #[test]
    fn test_forced_cut_at_max() {
        let config = small_config();
        let chunker = RabinChunker::new(&config).unwrap();
        // constant input never produces a natural boundary unless the hash happens to hit the mask
        let data = vec![0u8; 10_000];
        let chunks = chunker.chunk(&data);
        assert_eq!(concat(&chunks), data);
        assert!(chunks.iter().all(|c| c.size() <= 4096));
    }

    #[test]
    fn test_deterministic_across_instances() {
        let data = pseudo_random(100_000, 7);
        let a = RabinChunker::new(&small_config()).unwrap().chunk(&data);
        let b = RabinChunker::new(&small_config()).unwrap().chunk(&data);
        assert_eq!(a, b);
    }

    #[test]
    fn test_insertion_only_shifts_local_boundaries() {
        let chunker = RabinChunker::new(&small_config()).unwrap();
        let base = pseudo_random(100_000, 99);
        let mut edited = base[..50_000].to_vec();
        edited.extend_from_slice(b"inserted bytes");
        edited.extend_from_slice(&base[50_000..]);

        let before: HashSet<_> = chunker.chunk(&base).iter().map(|c| c.hash).collect();
        let after: HashSet<_> = chunker.chunk(&edited).iter().map(|c| c.hash).collect();
        let shared = before.intersection(&after).count();
        assert!(shared * 2 > before.len(), "only {shared} of {} shared", before.len());
    }

    #[test]
    fn test_fastcdc_covers_input() {
        let mut config = small_config();
        config.chunking.algorithm = ChunkingAlgorithm::FastCdc;
        let chunker = build_chunker(&config).unwrap();
        let data = pseudo_random(64 * 1024, 3);
        let chunks = chunker.chunk(&data);
        assert_eq!(concat(&chunks), data);
        assert!(chunker.chunk(&[]).is_empty());
    }

    #[test]
    fn test_analysis_counts_duplicates() {
        let a = Chunk::new(Bytes::from_static(b"aaaa"), 0);
        let b = Chunk::new(Bytes::from_static(b"bb"), 4);
        let a2 = Chunk::new(Bytes::from_static(b"aaaa"), 6);
        let analysis = ChunkingAnalysis::analyze(&[a, b, a2]);
        assert_eq!(analysis.total_chunks, 3);
        assert_eq!(analysis.unique_chunks, 2);
        assert_eq!(analysis.duplicate_chunks, 1);
        assert_eq!(analysis.total_size, 10);
        assert_eq!(analysis.unique_size, 6);
        assert_eq!(analysis.min_chunk_size, 2);
        assert_eq!(analysis.max_chunk_size, 4);
        assert!((analysis.dedup_ratio - 10.0 / 6.0).abs() < 1e-9);
        assert_eq!(ChunkingAnalysis::analyze(&[]), ChunkingAnalysis::default());
    }

    proptest! {
        #[test]
        fn prop_chunks_reassemble(data in prop::collection::vec(any::<u8>(), 0..20_000)) {
            let chunker = RabinChunker::new(&small_config()).unwrap();
            let chunks = chunker.chunk(&data);
            prop_assert_eq!(concat(&chunks), data.clone());
            for (i, c) in chunks.iter().enumerate() {
                prop_assert!(c.size() <= 4096);
                if i + 1 < chunks.len() {
                    prop_assert!(c.size() >= 256);
                }
            }
        }
    }
}
