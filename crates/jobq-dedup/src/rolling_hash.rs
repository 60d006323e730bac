//! Rabin fingerprint over a sliding byte window.
//!
//! The hash is a polynomial over GF(2) reduced modulo an irreducible
//! polynomial. Each `roll` removes the byte leaving the window and appends the
//! new one in O(1) using two 256-entry tables derived from the polynomial and
//! the window size.

use std::sync::Arc;

use crate::error::{DedupError, Result};

fn degree(p: u64) -> i32 {
    63 - p.leading_zeros() as i32
}

// x mod p over GF(2)
fn pol_mod(mut x: u64, p: u64) -> u64 {
    let dp = degree(p);
    while degree(x) >= dp {
        x ^= p << (degree(x) - dp);
    }
    x
}

fn append_byte(hash: u64, b: u8, pol: u64) -> u64 {
    pol_mod((hash << 8) | b as u64, pol)
}

/// Precomputed lookup tables for one `(polynomial, window)` pair.
#[derive(Debug)]
pub struct RabinTables {
    out: [u64; 256],
    reduce: [u64; 256],
    shift: u32,
    window: usize,
}

impl RabinTables {
    /// Build tables; the polynomial degree must be in 16..=56.
    pub fn new(polynomial: u64, window: usize) -> Result<Self> {
        let k = degree(polynomial);
        if !(16..=56).contains(&k) {
            return Err(DedupError::InvalidConfig(format!(
                "rolling hash polynomial {polynomial:#x} has degree {k}"
            )));
        }
        if window == 0 {
            return Err(DedupError::InvalidConfig(
                "rolling hash window must be positive".to_string(),
            ));
        }

        let mut out = [0u64; 256];
        let mut reduce = [0u64; 256];
        for b in 0..256usize {
            // contribution of byte b once it has travelled through the whole window
            let mut h = append_byte(0, b as u8, polynomial);
            for _ in 0..window - 1 {
                h = append_byte(h, 0, polynomial);
            }
            out[b] = h;

            // (b * x^k mod p) with the b * x^k term kept so the XOR also clears the top bits
            let shifted = (b as u64) << k;
            reduce[b] = pol_mod(shifted, polynomial) | shifted;
        }

        Ok(Self {
            out,
            reduce,
            shift: (k - 8) as u32,
            window,
        })
    }

    /// Window size these tables were built for.
    pub fn window(&self) -> usize {
        self.window
    }
}

/// Incremental Rabin hash over the last `window` bytes.
#[derive(Debug, Clone)]
pub struct RollingHash {
    tables: Arc<RabinTables>,
    window: Vec<u8>,
    pos: usize,
    filled: usize,
    digest: u64,
}

impl RollingHash {
    /// Create a hash with freshly built tables.
    pub fn new(polynomial: u64, window: usize) -> Result<Self> {
        Ok(Self::with_tables(Arc::new(RabinTables::new(polynomial, window)?)))
    }

    /// Create a hash sharing prebuilt tables.
    pub fn with_tables(tables: Arc<RabinTables>) -> Self {
        let window = vec![0u8; tables.window];
        Self {
            tables,
            window,
            pos: 0,
            filled: 0,
            digest: 0,
        }
    }

    /// Slide `b` into the window and return the new hash.
    #[inline]
    pub fn roll(&mut self, b: u8) -> u64 {
        let leaving = self.window[self.pos];
        self.window[self.pos] = b;
        self.pos = (self.pos + 1) % self.window.len();
        if self.filled < self.window.len() {
            self.filled += 1;
        }

        self.digest ^= self.tables.out[leaving as usize];
        let index = (self.digest >> self.tables.shift) as usize & 0xff;
        self.digest = ((self.digest << 8) | b as u64) ^ self.tables.reduce[index];
        self.digest
    }

    /// Current hash value.
    pub fn digest(&self) -> u64 {
        self.digest
    }

    /// True once `window` bytes have been rolled in since the last reset.
    pub fn is_full(&self) -> bool {
        self.filled == self.window.len()
    }

    /// Clear the window and hash to zero.
    pub fn reset(&mut self) {
        self.window.fill(0);
        self.pos = 0;
        self.filled = 0;
        self.digest = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_POLYNOMIAL;
    use proptest::prelude::*;

    fn hash_of(window: usize, bytes: &[u8]) -> u64 {
        let mut h = RollingHash::new(DEFAULT_POLYNOMIAL, window).unwrap();
        let mut d = 0;
        for &b in bytes {
            d = h.roll(b);
        }
        d
    }

    #[test]
    fn test_rejects_bad_polynomial() {
        assert!(RollingHash::new(0xff, 64).is_err());
        assert!(RollingHash::new(1u64 << 60, 64).is_err());
        assert!(RollingHash::new(DEFAULT_POLYNOMIAL, 0).is_err());
    }

    #[test]
    fn test_digest_stays_below_degree() {
        let mut h = RollingHash::new(DEFAULT_POLYNOMIAL, 16).unwrap();
        for i in 0..10_000u32 {
            let d = h.roll((i * 31 % 251) as u8);
            assert!(d < 1u64 << degree(DEFAULT_POLYNOMIAL));
        }
    }

    #[test]
    fn test_depends_only_on_window_contents() {
        let window = 32;
        let tail: Vec<u8> = (0..window as u8).map(|i| i.wrapping_mul(7)).collect();

        let mut a = b"some unrelated prefix that is longer than the window".to_vec();
        a.extend_from_slice(&tail);
        let mut b = vec![0xAAu8; 500];
        b.extend_from_slice(&tail);

        assert_eq!(hash_of(window, &a), hash_of(window, &b));
        assert_eq!(hash_of(window, &a), hash_of(window, &tail));
    }

    #[test]
    fn test_reset_restores_initial_state() {
        let mut h = RollingHash::new(DEFAULT_POLYNOMIAL, 8).unwrap();
        let first: Vec<u64> = b"abcdefghij".iter().map(|&b| h.roll(b)).collect();
        assert!(h.is_full());
        h.reset();
        assert_eq!(h.digest(), 0);
        assert!(!h.is_full());
        let second: Vec<u64> = b"abcdefghij".iter().map(|&b| h.roll(b)).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_shared_tables() {
        let tables = Arc::new(RabinTables::new(DEFAULT_POLYNOMIAL, 48).unwrap());
        let mut a = RollingHash::with_tables(tables.clone());
        let mut b = RollingHash::with_tables(tables);
        for &byte in b"shared tables give identical hashes" {
            assert_eq!(a.roll(byte), b.roll(byte));
        }
    }

    proptest! {
        #[test]
        fn prop_window_property(prefix in prop::collection::vec(any::<u8>(), 0..256),
                                window in prop::collection::vec(any::<u8>(), 16)) {
            let mut full = prefix.clone();
            full.extend_from_slice(&window);
            prop_assert_eq!(hash_of(16, &full), hash_of(16, &window));
        }
    }
}
