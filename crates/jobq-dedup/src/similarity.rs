//! Near-duplicate payload discovery using MinHash signatures and LSH banding.
//!
//! The index is advisory: it is kept in process memory, rebuilt as payloads
//! are deduplicated, and never consulted on the dedup or reconstruction path.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ChunkingConfig;

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

fn fnv1a(bytes: impl IntoIterator<Item = u8>) -> u64 {
    bytes
        .into_iter()
        .fold(FNV_OFFSET, |h, b| (h ^ b as u64).wrapping_mul(FNV_PRIME))
}

fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

fn mix(mut z: u64) -> u64 {
    z = (z ^ (z >> 33)).wrapping_mul(0xff51afd7ed558ccd);
    z = (z ^ (z >> 33)).wrapping_mul(0xc4ceb9fe1a85ec53);
    z ^ (z >> 33)
}

/// Fixed-length MinHash signature of one payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinHashSignature(pub Vec<u64>);

impl MinHashSignature {
    /// Estimated Jaccard similarity: fraction of positions that agree.
    pub fn jaccard(&self, other: &MinHashSignature) -> f64 {
        if self.0.is_empty() || self.0.len() != other.0.len() {
            return 0.0;
        }
        let equal = self.0.iter().zip(&other.0).filter(|(a, b)| a == b).count();
        equal as f64 / self.0.len() as f64
    }
}

/// A candidate returned by [`SimilarityDetector::find_similar`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarPayload {
    /// Job id of the indexed payload
    pub job_id: String,
    /// Estimated Jaccard similarity with the query
    pub similarity: f64,
}

/// Capability interface for payload similarity indexing.
pub trait SimilarityDetector: Send + Sync {
    /// Signature of `data`.
    fn signature(&self, data: &[u8]) -> MinHashSignature;
    /// Index a payload under `job_id`, replacing any previous entry.
    fn insert(&self, job_id: &str, signature: MinHashSignature);
    /// Drop a payload from the index.
    fn remove(&self, job_id: &str);
    /// Indexed payloads at or above the similarity threshold, most similar first.
    fn find_similar(&self, signature: &MinHashSignature) -> Vec<SimilarPayload>;
    /// Job ids currently indexed.
    fn job_ids(&self) -> Vec<String>;
    /// Number of indexed payloads.
    fn len(&self) -> usize;
    /// True if nothing is indexed.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
struct IndexState {
    buckets: HashMap<(usize, u64), HashSet<String>>,
    signatures: HashMap<String, MinHashSignature>,
}

/// MinHash/LSH index with `bands` bands of `num_hashes / bands` rows.
pub struct MinHashIndex {
    shingle_size: usize,
    rows: usize,
    threshold: f64,
    params: Vec<(u64, u64)>,
    state: RwLock<IndexState>,
}

impl MinHashIndex {
    /// Build from validated chunking settings. Hash parameters are derived
    /// from a fixed seed so signatures are stable across processes.
    pub fn new(config: &ChunkingConfig) -> Self {
        let mut seed = 0x5EED_D3D0_u64;
        let params = (0..config.num_hashes)
            .map(|_| (splitmix64(&mut seed) | 1, splitmix64(&mut seed)))
            .collect();
        Self {
            shingle_size: config.shingle_size,
            rows: config.num_hashes / config.bands,
            threshold: config.similarity_threshold,
            params,
            state: RwLock::new(IndexState::default()),
        }
    }

    fn shingles(&self, data: &[u8]) -> HashSet<u64> {
        if data.len() < self.shingle_size {
            return std::iter::once(fnv1a(data.iter().copied())).collect();
        }
        data.windows(self.shingle_size)
            .map(|w| fnv1a(w.iter().copied()))
            .collect()
    }

    fn band_keys(&self, signature: &MinHashSignature) -> Vec<(usize, u64)> {
        signature
            .0
            .chunks(self.rows)
            .enumerate()
            .map(|(band, rows)| (band, fnv1a(rows.iter().flat_map(|v| v.to_le_bytes()))))
            .collect()
    }

    fn unlink(state: &mut IndexState, job_id: &str, keys: Vec<(usize, u64)>) {
        for key in keys {
            if let Some(ids) = state.buckets.get_mut(&key) {
                ids.remove(job_id);
                if ids.is_empty() {
                    state.buckets.remove(&key);
                }
            }
        }
    }
}

impl SimilarityDetector for MinHashIndex {
    fn signature(&self, data: &[u8]) -> MinHashSignature {
        let mut mins = vec![u64::MAX; self.params.len()];
        if data.is_empty() {
            return MinHashSignature(mins);
        }
        for shingle in self.shingles(data) {
            for (slot, &(a, b)) in mins.iter_mut().zip(&self.params) {
                let h = mix(a.wrapping_mul(shingle).wrapping_add(b));
                if h < *slot {
                    *slot = h;
                }
            }
        }
        MinHashSignature(mins)
    }

    fn insert(&self, job_id: &str, signature: MinHashSignature) {
        let keys = self.band_keys(&signature);
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = state.signatures.remove(job_id) {
            let old_keys = self.band_keys(&old);
            Self::unlink(&mut state, job_id, old_keys);
        }
        for key in keys {
            state
                .buckets
                .entry(key)
                .or_default()
                .insert(job_id.to_string());
        }
        state.signatures.insert(job_id.to_string(), signature);
    }

    fn remove(&self, job_id: &str) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = state.signatures.remove(job_id) {
            let keys = self.band_keys(&old);
            Self::unlink(&mut state, job_id, keys);
        }
    }

    fn find_similar(&self, signature: &MinHashSignature) -> Vec<SimilarPayload> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let mut candidates = HashSet::new();
        for key in self.band_keys(signature) {
            if let Some(ids) = state.buckets.get(&key) {
                candidates.extend(ids.iter());
            }
        }

        let mut similar: Vec<SimilarPayload> = candidates
            .into_iter()
            .filter_map(|id| {
                let similarity = state.signatures.get(id)?.jaccard(signature);
                (similarity >= self.threshold).then(|| SimilarPayload {
                    job_id: id.clone(),
                    similarity,
                })
            })
            .collect();
        similar.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| a.job_id.cmp(&b.job_id))
        });
        debug!(candidates = similar.len(), "similarity lookup");
        similar
    }

    fn job_ids(&self) -> Vec<String> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .signatures
            .keys()
            .cloned()
            .collect()
    }

    fn len(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .signatures
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index(threshold: f64) -> MinHashIndex {
        let config = ChunkingConfig {
            similarity_threshold: threshold,
            ..ChunkingConfig::default()
        };
        MinHashIndex::new(&config)
    }

    fn text(seed: u64, len: usize) -> Vec<u8> {
        let mut state = seed;
        (0..len)
            .map(|_| b'a' + (splitmix64(&mut state) % 26) as u8)
            .collect()
    }

    #[test]
    fn test_signature_is_deterministic() {
        let a = index(0.8);
        let b = index(0.8);
        let data = text(1, 2000);
        assert_eq!(a.signature(&data), b.signature(&data));
        assert_eq!(a.signature(&data).0.len(), 128);
    }

    #[test]
    fn test_identical_payloads_fully_similar() {
        let idx = index(0.8);
        let data = text(2, 4000);
        let sig = idx.signature(&data);
        assert_eq!(sig.jaccard(&sig), 1.0);
        idx.insert("job-1", sig.clone());
        let found = idx.find_similar(&sig);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].job_id, "job-1");
        assert_eq!(found[0].similarity, 1.0);
    }

    #[test]
    fn test_near_duplicate_found_unrelated_not() {
        let idx = index(0.5);
        let base = text(3, 8000);
        let mut edited = base.clone();
        edited[4000..4040].copy_from_slice(&text(4, 40));

        idx.insert("base", idx.signature(&base));
        idx.insert("other", idx.signature(&text(5, 8000)));

        let found = idx.find_similar(&idx.signature(&edited));
        let ids: Vec<_> = found.iter().map(|s| s.job_id.as_str()).collect();
        assert_eq!(ids, vec!["base"]);
        assert!(found[0].similarity > 0.8);
    }

    #[test]
    fn test_remove_and_reinsert() {
        let idx = index(0.8);
        let data = text(6, 1000);
        let sig = idx.signature(&data);
        idx.insert("job", sig.clone());
        idx.insert("job", sig.clone());
        assert_eq!(idx.len(), 1);
        idx.remove("job");
        assert!(idx.is_empty());
        assert!(idx.find_similar(&sig).is_empty());
    }

    #[test]
    fn test_short_and_empty_payloads() {
        let idx = index(0.8);
        let short = idx.signature(b"ab");
        assert!(short.0.iter().all(|&v| v != u64::MAX));
        let empty = idx.signature(b"");
        assert!(empty.0.iter().all(|&v| v == u64::MAX));
        assert_eq!(MinHashSignature(vec![]).jaccard(&MinHashSignature(vec![])), 0.0);
    }
}
