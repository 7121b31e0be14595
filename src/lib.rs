//! MinHash LSH similarity index with time-decayed frequency storage.
//!
//! `minsim` finds "similar" items — typically error events keyed by issue
//! id, featurized into opaque tokens by the caller — using banded MinHash
//! locality-sensitive hashing over a pluggable key-value backend. Bucket
//! frequencies are kept in wall-clock time slots so similarity naturally
//! decays out of the retention window.
//!
//! The public protocol is the nine operations on [`SimilarityOps`]:
//! `record`, `classify`, `compare`, `merge`, `delete`, `scan`, `flush`,
//! `export`, `import_`. The core is stateless, synchronous, and safe for
//! concurrent use; the only shared mutable resource is the backend handle.
//!
//! ```
//! use minsim::{Feature, IndexConfig, SimilarityIndex, SimilarityOps, shingle};
//!
//! let index = SimilarityIndex::in_memory(IndexConfig::default())?;
//! let now = minsim::unix_timestamp();
//!
//! index.record(
//!     "errors",
//!     "issue-1",
//!     &[Feature::new("message", shingle("connection reset by peer", 4))],
//!     now,
//! )?;
//!
//! let similar = index.classify("errors", "issue-1", &["message"], Some(10), now)?;
//! assert_eq!(similar[0].key, "issue-1");
//! assert_eq!(similar[0].score, 1.0);
//! # Ok::<(), minsim::SimilarityError>(())
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod frame;
pub mod index;
pub mod metrics;
pub mod minhash;
pub mod store;

pub use backend::{BucketBackend, InMemoryBackend, RowKey, ScanPage, SlotCounts};
pub use config::{ConfigError, IndexConfig};
pub use error::{SimilarityError, StorageError};
pub use frame::{serialize_frame, shingle, Frame};
pub use index::{unix_timestamp, Candidate, Feature, SimilarityIndex, SimilarityOps};
pub use metrics::InstrumentedIndex;
pub use minhash::{EmptyTokenSet, MinHasher, Signature};
pub use store::{BucketStore, ScanEntry, ScanIter};
