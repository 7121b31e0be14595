//! Public similarity index facade.
//!
//! [`SimilarityIndex`] wires the minhash family and the bucket store into
//! the record/query protocol. Every public operation lives on the
//! [`SimilarityOps`] trait so the instrumentation wrapper in
//! [`crate::metrics`] can implement the identical surface explicitly, with
//! no reflection-based forwarding.
//!
//! The index is stateless and synchronous: it holds only the config, the
//! hash family, and a shared backend handle, and is safe to call from many
//! threads at once. `delete`, `merge`, and `flush` span multiple rows and
//! are best effort, not transactional.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::backend::{BucketBackend, InMemoryBackend};
use crate::config::IndexConfig;
use crate::error::SimilarityError;
use crate::minhash::MinHasher;
use crate::store::{BucketStore, ScanEntry};

/// One feature of an item: a label naming the characteristic and the
/// opaque tokens produced for it by the caller's serializer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Feature {
    pub label: String,
    pub tokens: Vec<Vec<u8>>,
}

impl Feature {
    pub fn new(label: impl Into<String>, tokens: Vec<Vec<u8>>) -> Self {
        Self {
            label: label.into(),
            tokens,
        }
    }
}

/// One ranked classification result.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub key: String,
    /// Estimated Jaccard similarity: agreeing bands over total bands,
    /// averaged across the queried labels.
    pub score: f64,
}

/// Current wall-clock time in unix seconds, for callers that do not carry
/// their own notion of event time.
pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

/// The full operation surface of a similarity index.
///
/// Wrappers must intercept every method; keeping the set closed in a trait
/// makes that contract type-checked instead of implicit.
pub trait SimilarityOps {
    /// Associate `key` with its features' signatures, incrementing bucket
    /// frequencies. Recording the same item again accumulates counts.
    fn record(
        &self,
        namespace: &str,
        key: &str,
        features: &[Feature],
        timestamp: u64,
    ) -> Result<(), SimilarityError>;

    /// Rank previously recorded items by similarity to `key` over the given
    /// labels. `key` itself ranks first with score 1.0 when present; an
    /// unknown key yields an empty result.
    fn classify(
        &self,
        namespace: &str,
        key: &str,
        labels: &[&str],
        limit: Option<usize>,
        timestamp: u64,
    ) -> Result<Vec<Candidate>, SimilarityError>;

    /// [`Self::classify`] over every label ever recorded in the namespace.
    fn compare(
        &self,
        namespace: &str,
        key: &str,
        limit: Option<usize>,
        timestamp: u64,
    ) -> Result<Vec<Candidate>, SimilarityError>;

    /// Reassign all bucket frequencies held by `sources` to `destination`,
    /// then delete the sources. Used when the calling application merges
    /// items.
    fn merge(
        &self,
        namespace: &str,
        destination: &str,
        sources: &[&str],
        timestamp: u64,
    ) -> Result<(), SimilarityError>;

    /// Remove each `(label, key)` target from every bucket row it occupies.
    fn delete(&self, namespace: &str, targets: &[(&str, &str)]) -> Result<(), SimilarityError>;

    /// Lazily iterate every live bucket row for a label, in backend pages
    /// of `chunk_size` rows. Restartable only from the beginning.
    fn scan<'a>(
        &'a self,
        namespace: &str,
        label: &str,
        chunk_size: usize,
        timestamp: u64,
    ) -> Result<Box<dyn Iterator<Item = Result<ScanEntry, SimilarityError>> + 'a>, SimilarityError>;

    /// Wipe everything in the namespace.
    fn flush(&self, namespace: &str) -> Result<(), SimilarityError>;

    /// One opaque blob per `(label, key)` target, decodable by
    /// [`Self::import_`] with no external schema.
    fn export(
        &self,
        namespace: &str,
        targets: &[(&str, &str)],
        timestamp: u64,
    ) -> Result<Vec<Vec<u8>>, SimilarityError>;

    /// Additively merge exported blobs into live rows; importing a blob
    /// twice doubles its counts.
    fn import_(
        &self,
        namespace: &str,
        payloads: &[(&str, &str, &[u8])],
        timestamp: u64,
    ) -> Result<(), SimilarityError>;
}

/// MinHash LSH similarity index over a pluggable bucket backend.
pub struct SimilarityIndex {
    config: IndexConfig,
    hasher: MinHasher,
    store: BucketStore,
}

impl SimilarityIndex {
    /// Build an index over an existing backend, validating the config.
    pub fn new(
        config: IndexConfig,
        backend: Arc<dyn BucketBackend>,
    ) -> Result<Self, SimilarityError> {
        config.validate()?;
        let hasher = MinHasher::new(&config);
        let store = BucketStore::new(backend, config.slot_duration, config.retention);
        Ok(Self {
            config,
            hasher,
            store,
        })
    }

    /// Convenience constructor over the in-memory backend, for tests and
    /// ephemeral indexes.
    pub fn in_memory(config: IndexConfig) -> Result<Self, SimilarityError> {
        Self::new(config, Arc::new(InMemoryBackend::new()))
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    /// Per-label band-agreement tallies for `key`, merged into `totals`.
    /// Returns whether the query key had any recorded data for the label.
    fn tally_label(
        &self,
        namespace: &str,
        key: &str,
        label: &str,
        timestamp: u64,
        totals: &mut BTreeMap<String, f64>,
    ) -> Result<bool, SimilarityError> {
        let bands = self.config.bands;
        let mut agreed: HashMap<String, usize> = HashMap::new();
        let mut known = false;
        for band in 0..bands {
            let buckets = self
                .store
                .read_frequencies(namespace, label, key, band, timestamp)?;
            if buckets.is_empty() {
                continue;
            }
            known = true;
            // A candidate agrees in this band if it shares any of the
            // query's buckets here.
            let mut members: HashSet<String> = HashSet::new();
            for bucket in buckets.keys() {
                members.extend(
                    self.store
                        .read_bucket(namespace, label, band, bucket, timestamp)?
                        .into_keys(),
                );
            }
            for member in members {
                *agreed.entry(member).or_insert(0) += 1;
            }
        }
        for (member, count) in agreed {
            *totals.entry(member).or_insert(0.0) += count as f64 / bands as f64;
        }
        Ok(known)
    }

    fn rank(
        &self,
        key: &str,
        totals: BTreeMap<String, f64>,
        label_count: usize,
        limit: Option<usize>,
    ) -> Vec<Candidate> {
        let mut ranked: Vec<Candidate> = totals
            .into_iter()
            .map(|(candidate, total)| Candidate {
                key: candidate,
                score: total / label_count as f64,
            })
            .collect();
        // Descending score; the query key wins score ties, remaining ties
        // break by ascending key so ordering is deterministic.
        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| (a.key != key).cmp(&(b.key != key)))
                .then_with(|| a.key.cmp(&b.key))
        });
        if let Some(limit) = limit {
            ranked.truncate(limit);
        }
        ranked
    }
}

impl SimilarityOps for SimilarityIndex {
    fn record(
        &self,
        namespace: &str,
        key: &str,
        features: &[Feature],
        timestamp: u64,
    ) -> Result<(), SimilarityError> {
        if features.is_empty() {
            return Err(SimilarityError::invalid_feature(
                "",
                "record called with no features",
            ));
        }
        for feature in features {
            let signature = self.hasher.hash(&feature.tokens).map_err(|_| {
                SimilarityError::invalid_feature(&feature.label, "empty token set")
            })?;
            for (band, values) in signature.bands().iter().enumerate() {
                self.store
                    .record_bucket(namespace, &feature.label, band, values, key, timestamp)?;
            }
            self.store.register_label(namespace, &feature.label)?;
        }
        debug!(
            namespace,
            key,
            features = features.len(),
            "recorded item signatures"
        );
        Ok(())
    }

    fn classify(
        &self,
        namespace: &str,
        key: &str,
        labels: &[&str],
        limit: Option<usize>,
        timestamp: u64,
    ) -> Result<Vec<Candidate>, SimilarityError> {
        if labels.is_empty() {
            return Err(SimilarityError::invalid_feature(
                "",
                "classify called with no labels",
            ));
        }
        let mut totals: BTreeMap<String, f64> = BTreeMap::new();
        let mut known = false;
        for label in labels {
            known |= self.tally_label(namespace, key, label, timestamp, &mut totals)?;
        }
        if !known {
            // Read miss is normal: the key (or the whole namespace) was
            // never recorded.
            return Ok(Vec::new());
        }
        let ranked = self.rank(key, totals, labels.len(), limit);
        debug!(
            namespace,
            key,
            candidates = ranked.len(),
            "classified item"
        );
        Ok(ranked)
    }

    fn compare(
        &self,
        namespace: &str,
        key: &str,
        limit: Option<usize>,
        timestamp: u64,
    ) -> Result<Vec<Candidate>, SimilarityError> {
        let labels = self.store.known_labels(namespace)?;
        if labels.is_empty() {
            return Ok(Vec::new());
        }
        let label_refs: Vec<&str> = labels.iter().map(String::as_str).collect();
        self.classify(namespace, key, &label_refs, limit, timestamp)
    }

    fn merge(
        &self,
        namespace: &str,
        destination: &str,
        sources: &[&str],
        timestamp: u64,
    ) -> Result<(), SimilarityError> {
        let labels = self.store.known_labels(namespace)?;
        for label in &labels {
            for source in sources {
                self.store.merge_item(
                    namespace,
                    label,
                    destination,
                    source,
                    self.config.bands,
                    timestamp,
                )?;
            }
        }
        debug!(
            namespace,
            destination,
            sources = sources.len(),
            "merged items"
        );
        Ok(())
    }

    fn delete(&self, namespace: &str, targets: &[(&str, &str)]) -> Result<(), SimilarityError> {
        for (label, key) in targets {
            for band in 0..self.config.bands {
                self.store.delete_band_entry(namespace, label, key, band)?;
            }
        }
        debug!(namespace, targets = targets.len(), "deleted items");
        Ok(())
    }

    fn scan<'a>(
        &'a self,
        namespace: &str,
        label: &str,
        chunk_size: usize,
        timestamp: u64,
    ) -> Result<Box<dyn Iterator<Item = Result<ScanEntry, SimilarityError>> + 'a>, SimilarityError>
    {
        let iter = self
            .store
            .scan(namespace, label, chunk_size, timestamp)
            .map(|entry| entry.map_err(SimilarityError::from));
        Ok(Box::new(iter))
    }

    fn flush(&self, namespace: &str) -> Result<(), SimilarityError> {
        debug!(namespace, "flushing namespace");
        Ok(self.store.destroy(namespace)?)
    }

    fn export(
        &self,
        namespace: &str,
        targets: &[(&str, &str)],
        timestamp: u64,
    ) -> Result<Vec<Vec<u8>>, SimilarityError> {
        let mut blobs = Vec::with_capacity(targets.len());
        for (label, key) in targets {
            blobs.push(self.store.export_item(
                namespace,
                label,
                key,
                self.config.bands,
                timestamp,
            )?);
        }
        Ok(blobs)
    }

    fn import_(
        &self,
        namespace: &str,
        payloads: &[(&str, &str, &[u8])],
        timestamp: u64,
    ) -> Result<(), SimilarityError> {
        for (label, key, blob) in payloads {
            self.store
                .import_item(namespace, label, key, blob, timestamp)?;
            self.store.register_label(namespace, label)?;
        }
        Ok(())
    }
}
