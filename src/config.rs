//! Configuration for the similarity index.
//!
//! All tunables live in one explicitly constructed, dependency-injected
//! [`IndexConfig`] value passed to [`crate::SimilarityIndex`] at build time.
//! There are no module-level mutable singletons; two indexes built from equal
//! configs are interchangeable.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Semantic configuration for the MinHash LSH index.
///
/// When two configs are equal, the same `(namespace, features)` input always
/// produces bit-identical signatures and bucket placements across processes.
/// Any algorithmic change that can affect signatures must bump `version`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexConfig {
    /// Configuration schema version.
    pub version: u32,
    /// Size of the bucket value space; minhash values reduce into `[0, range)`.
    pub range: u64,
    /// Number of independent LSH bands.
    pub bands: usize,
    /// Number of minhash values per band. Two items are candidates when an
    /// entire band's tuple matches, so larger values make bands stricter.
    pub buckets_per_band: usize,
    /// Seconds covered by one frequency time slot.
    pub slot_duration: u64,
    /// Number of historical slots retained in addition to the current one.
    /// Counts in older slots are excluded from reads and eventually
    /// overwritten by the backing store.
    pub retention: u64,
    /// Seed for the deterministic hash function family.
    pub seed: u64,
    /// Compute signature slots in parallel via rayon.
    pub use_parallel: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            version: 1,
            range: 0xFFFF,
            bands: 16,
            buckets_per_band: 8,
            slot_duration: 60 * 60,
            retention: 12,
            seed: 0x5EED_BA5E_D00D_FEED,
            use_parallel: false,
        }
    }
}

impl IndexConfig {
    /// Total number of hash functions in the family.
    pub fn signature_len(&self) -> usize {
        self.bands * self.buckets_per_band
    }

    /// Validate structural invariants. Called by the index constructor; kept
    /// public so embedding applications can validate deserialized configs
    /// before wiring them in.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version == 0 {
            return Err(ConfigError::InvalidVersion {
                version: self.version,
            });
        }
        if self.range < 2 {
            return Err(ConfigError::InvalidRange { range: self.range });
        }
        if self.bands == 0 {
            return Err(ConfigError::InvalidBands { bands: self.bands });
        }
        if self.buckets_per_band == 0 {
            return Err(ConfigError::InvalidBucketsPerBand {
                buckets: self.buckets_per_band,
            });
        }
        if self.bands.checked_mul(self.buckets_per_band).is_none() {
            return Err(ConfigError::SignatureLengthOverflow {
                bands: self.bands,
                buckets: self.buckets_per_band,
            });
        }
        if self.slot_duration == 0 {
            return Err(ConfigError::InvalidSlotDuration {
                seconds: self.slot_duration,
            });
        }
        Ok(())
    }
}

/// Errors produced by [`IndexConfig::validate`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("version must be >= 1 (got {version})")]
    InvalidVersion { version: u32 },

    #[error("range must be >= 2 (got {range})")]
    InvalidRange { range: u64 },

    #[error("bands must be >= 1 (got {bands})")]
    InvalidBands { bands: usize },

    #[error("buckets_per_band must be >= 1 (got {buckets})")]
    InvalidBucketsPerBand { buckets: usize },

    #[error("signature length overflow for bands={bands} buckets={buckets}")]
    SignatureLengthOverflow { bands: usize, buckets: usize },

    #[error("slot_duration must be >= 1 (got {seconds})")]
    InvalidSlotDuration { seconds: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(IndexConfig::default().validate(), Ok(()));
    }

    #[test]
    fn zero_bands_rejected() {
        let cfg = IndexConfig {
            bands: 0,
            ..Default::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::InvalidBands { bands: 0 }));
    }

    #[test]
    fn zero_slot_duration_rejected() {
        let cfg = IndexConfig {
            slot_duration: 0,
            ..Default::default()
        };
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::InvalidSlotDuration { seconds: 0 })
        );
    }

    #[test]
    fn signature_length_overflow_rejected() {
        let cfg = IndexConfig {
            bands: usize::MAX,
            buckets_per_band: 2,
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::SignatureLengthOverflow { .. })
        ));
    }

    #[test]
    fn config_round_trips_through_codec() {
        let cfg = IndexConfig::default();
        let bytes = rmp_serde::to_vec(&cfg).expect("encode config");
        let back: IndexConfig = rmp_serde::from_slice(&bytes).expect("decode config");
        assert_eq!(cfg, back);
    }
}
