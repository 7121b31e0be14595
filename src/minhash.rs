//! MinHash signature computation.
//!
//! Maps a set of opaque byte tokens to a fixed-length signature of
//! `bands × buckets_per_band` minhash values using a family of hash
//! functions derived from a single 64-bit seed. The computation is a pure
//! function of `(config, tokens)`: deterministic across processes,
//! invariant to token order and to duplicated tokens.

use rayon::prelude::*;
use xxhash_rust::xxh3::xxh3_64_with_seed;

use crate::config::IndexConfig;
use thiserror::Error;

/// Raised by [`MinHasher::hash`] for an empty token set. Callers must guard
/// against empty feature token lists; there is no meaningful minimum over
/// nothing and silently emitting a sentinel signature would poison buckets.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("cannot hash an empty token set")]
pub struct EmptyTokenSet;

/// A MinHash signature: `bands` groups of `buckets_per_band` values, each
/// in `[0, range)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    bands: Vec<Vec<u64>>,
}

impl Signature {
    /// All bands in order.
    pub fn bands(&self) -> &[Vec<u64>] {
        &self.bands
    }

    /// One band's bucket tuple.
    pub fn band(&self, index: usize) -> &[u64] {
        &self.bands[index]
    }

    pub fn num_bands(&self) -> usize {
        self.bands.len()
    }
}

/// Deterministic minhash function family.
#[derive(Debug, Clone)]
pub struct MinHasher {
    range: u64,
    bands: usize,
    buckets_per_band: usize,
    seed: u64,
    use_parallel: bool,
}

impl MinHasher {
    pub fn new(cfg: &IndexConfig) -> Self {
        Self {
            range: cfg.range,
            bands: cfg.bands,
            buckets_per_band: cfg.buckets_per_band,
            seed: cfg.seed,
            use_parallel: cfg.use_parallel,
        }
    }

    /// Compute the signature for a token set (parallel across hash
    /// functions when `use_parallel` is set).
    pub fn hash<T>(&self, tokens: &[T]) -> Result<Signature, EmptyTokenSet>
    where
        T: AsRef<[u8]> + Sync,
    {
        if tokens.is_empty() {
            return Err(EmptyTokenSet);
        }

        // Hash every token once; the per-function permutations then mix
        // these 64-bit values instead of re-reading token bytes.
        let base: Vec<u64> = tokens
            .iter()
            .map(|t| xxh3_64_with_seed(t.as_ref(), self.seed))
            .collect();

        let m = self.bands * self.buckets_per_band;
        let values: Vec<u64> = if self.use_parallel {
            (0..m)
                .into_par_iter()
                .map(|j| self.slot_minimum(&base, j))
                .collect()
        } else {
            (0..m).map(|j| self.slot_minimum(&base, j)).collect()
        };

        let bands = values
            .chunks(self.buckets_per_band)
            .map(|chunk| chunk.to_vec())
            .collect();
        Ok(Signature { bands })
    }

    /// Minimum bucket value over all tokens for hash function `j`.
    #[inline]
    fn slot_minimum(&self, base: &[u64], j: usize) -> u64 {
        // Each slot uses a different key to simulate a different permutation.
        let step = (j as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        let key = splitmix64(self.seed.wrapping_add(step));
        let mut minv = u64::MAX;
        for &h in base {
            let v = mix_u64(h, key) % self.range;
            if v < minv {
                minv = v;
            }
        }
        minv
    }
}

#[inline]
fn mix_u64(x: u64, key: u64) -> u64 {
    let mut h = xxh3_64_with_seed(&x.to_le_bytes(), key);
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51afd7ed558ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ceb9fe1a85ec53);
    h ^ (h >> 33)
}

#[inline]
fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

// --------------------------- Tests ---------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(words: &[&str]) -> Vec<Vec<u8>> {
        words.iter().map(|w| w.as_bytes().to_vec()).collect()
    }

    fn cfg() -> IndexConfig {
        IndexConfig {
            bands: 8,
            buckets_per_band: 4,
            ..Default::default()
        }
    }

    #[test]
    fn independent_instances_agree() {
        let a = MinHasher::new(&cfg());
        let b = MinHasher::new(&cfg());
        let toks = tokens(&["alpha", "beta", "gamma"]);
        assert_eq!(a.hash(&toks).unwrap(), b.hash(&toks).unwrap());
    }

    #[test]
    fn token_order_is_irrelevant() {
        let hasher = MinHasher::new(&cfg());
        let fwd = hasher.hash(&tokens(&["alpha", "beta", "gamma"])).unwrap();
        let rev = hasher.hash(&tokens(&["gamma", "alpha", "beta"])).unwrap();
        assert_eq!(fwd, rev);
    }

    #[test]
    fn duplicate_tokens_are_idempotent() {
        let hasher = MinHasher::new(&cfg());
        let once = hasher.hash(&tokens(&["alpha", "beta"])).unwrap();
        let dup = hasher
            .hash(&tokens(&["alpha", "beta", "alpha", "alpha"]))
            .unwrap();
        assert_eq!(once, dup);
    }

    #[test]
    fn disjoint_sets_diverge() {
        let hasher = MinHasher::new(&cfg());
        let a = hasher.hash(&tokens(&["alpha", "beta", "gamma"])).unwrap();
        let b = hasher.hash(&tokens(&["delta", "epsilon", "zeta"])).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn empty_token_set_is_rejected() {
        let hasher = MinHasher::new(&cfg());
        let none: Vec<Vec<u8>> = Vec::new();
        assert_eq!(hasher.hash(&none), Err(EmptyTokenSet));
    }

    #[test]
    fn values_stay_within_range() {
        let config = IndexConfig {
            range: 31,
            bands: 4,
            buckets_per_band: 4,
            ..Default::default()
        };
        let hasher = MinHasher::new(&config);
        let sig = hasher.hash(&tokens(&["alpha", "beta", "gamma"])).unwrap();
        assert_eq!(sig.num_bands(), 4);
        for band in sig.bands() {
            assert_eq!(band.len(), 4);
            assert!(band.iter().all(|&v| v < 31));
        }
    }

    #[test]
    fn parallel_matches_sequential() {
        let sequential = MinHasher::new(&cfg());
        let parallel = MinHasher::new(&IndexConfig {
            use_parallel: true,
            ..cfg()
        });
        let toks = tokens(&["the", "quick", "brown", "fox"]);
        assert_eq!(sequential.hash(&toks).unwrap(), parallel.hash(&toks).unwrap());
    }
}
