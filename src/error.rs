//! Error taxonomy for the similarity index.
//!
//! Two kinds of failure cross the public boundary: caller bugs
//! ([`SimilarityError::InvalidFeature`]) and backing-store trouble
//! ([`StorageError`]). The core never retries or swallows either; retry
//! policy belongs to the caller because increments are not idempotent.

use thiserror::Error;

use crate::config::ConfigError;

/// Failures communicating with the backing key-value store, including the
/// export blob codec (a blob that cannot be decoded is storage-shaped data
/// corruption, not a caller bug).
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("backend failure: {0}")]
    Backend(String),

    #[error("backend call exceeded {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    #[error("failed to encode export blob: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("failed to decode export blob: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

impl StorageError {
    /// Convenience constructor for backend-originated failures.
    pub fn backend(message: impl ToString) -> Self {
        StorageError::Backend(message.to_string())
    }
}

/// Errors surfaced by the public index operations.
#[derive(Debug, Error)]
pub enum SimilarityError {
    /// The caller supplied an empty or structurally invalid feature for a
    /// label. Surfaced immediately; never retried.
    #[error("invalid feature for label {label:?}: {reason}")]
    InvalidFeature { label: String, reason: String },

    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),

    #[error("invalid index configuration: {0}")]
    Config(#[from] ConfigError),
}

impl SimilarityError {
    pub fn invalid_feature(label: impl Into<String>, reason: impl Into<String>) -> Self {
        SimilarityError::InvalidFeature {
            label: label.into(),
            reason: reason.into(),
        }
    }
}
