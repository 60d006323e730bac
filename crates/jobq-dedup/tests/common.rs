//! Shared fixtures for the engine integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use jobq_dedup::{DedupConfig, DedupManager, MemoryKvStore};

/// Small chunks so short payloads still split into several pieces.
pub fn small_chunk_config() -> DedupConfig {
    let mut config = DedupConfig::default();
    config.chunking.min_chunk_size = 256;
    config.chunking.avg_chunk_size = 1024;
    config.chunking.max_chunk_size = 4096;
    config.chunking.window_size = 64;
    config.gc.orphan_grace_secs = 0;
    config
}

/// Manager over a fresh in-memory store; the store handle is returned for
/// fault injection.
pub async fn manager(config: DedupConfig) -> (MemoryKvStore, Arc<DedupManager>) {
    let mem = MemoryKvStore::new();
    let manager = DedupManager::new(config, Arc::new(mem.clone()))
        .await
        .expect("valid test config");
    (mem, Arc::new(manager))
}

/// Deterministic incompressible bytes (xorshift64).
pub fn pseudo_random(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed.max(1);
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 24) as u8
        })
        .collect()
}
