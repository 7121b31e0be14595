//! Operation-level instrumentation for the similarity index.
//!
//! [`InstrumentedIndex`] wraps any [`SimilarityOps`] implementation and
//! records one timer per call through the `metrics` facade, named
//! `"{prefix}.{method}"` (default prefix `"similarity"`) and tagged with a
//! caller-supplied `scope`. Each method is wrapped explicitly — the trait
//! keeps the operation set closed, so a new operation cannot silently
//! escape instrumentation.
//!
//! Timers are recorded on failure paths too; the original error is
//! returned unchanged.

use std::time::Instant;

use metrics::histogram;

use crate::error::SimilarityError;
use crate::index::{Candidate, Feature, SimilarityOps};
use crate::store::ScanEntry;

/// Timing wrapper around a similarity index.
pub struct InstrumentedIndex<I> {
    inner: I,
    prefix: String,
    scope: String,
}

impl<I> InstrumentedIndex<I> {
    /// Wrap `inner` with the default `"similarity"` metric prefix.
    pub fn new(inner: I, scope: impl Into<String>) -> Self {
        Self::with_prefix(inner, "similarity", scope)
    }

    /// Wrap `inner` with an explicit metric name prefix.
    pub fn with_prefix(inner: I, prefix: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            inner,
            prefix: prefix.into(),
            scope: scope.into(),
        }
    }

    /// The wrapped index.
    pub fn inner(&self) -> &I {
        &self.inner
    }

    fn observe(&self, method: &'static str, started: Instant) {
        histogram!(
            format!("{}.{}", self.prefix, method),
            "scope" => self.scope.clone()
        )
        .record(started.elapsed().as_secs_f64());
    }
}

impl<I: SimilarityOps> SimilarityOps for InstrumentedIndex<I> {
    fn record(
        &self,
        namespace: &str,
        key: &str,
        features: &[Feature],
        timestamp: u64,
    ) -> Result<(), SimilarityError> {
        let started = Instant::now();
        let result = self.inner.record(namespace, key, features, timestamp);
        self.observe("record", started);
        result
    }

    fn classify(
        &self,
        namespace: &str,
        key: &str,
        labels: &[&str],
        limit: Option<usize>,
        timestamp: u64,
    ) -> Result<Vec<Candidate>, SimilarityError> {
        let started = Instant::now();
        let result = self
            .inner
            .classify(namespace, key, labels, limit, timestamp);
        self.observe("classify", started);
        result
    }

    fn compare(
        &self,
        namespace: &str,
        key: &str,
        limit: Option<usize>,
        timestamp: u64,
    ) -> Result<Vec<Candidate>, SimilarityError> {
        let started = Instant::now();
        let result = self.inner.compare(namespace, key, limit, timestamp);
        self.observe("compare", started);
        result
    }

    fn merge(
        &self,
        namespace: &str,
        destination: &str,
        sources: &[&str],
        timestamp: u64,
    ) -> Result<(), SimilarityError> {
        let started = Instant::now();
        let result = self.inner.merge(namespace, destination, sources, timestamp);
        self.observe("merge", started);
        result
    }

    fn delete(&self, namespace: &str, targets: &[(&str, &str)]) -> Result<(), SimilarityError> {
        let started = Instant::now();
        let result = self.inner.delete(namespace, targets);
        self.observe("delete", started);
        result
    }

    fn scan<'a>(
        &'a self,
        namespace: &str,
        label: &str,
        chunk_size: usize,
        timestamp: u64,
    ) -> Result<Box<dyn Iterator<Item = Result<ScanEntry, SimilarityError>> + 'a>, SimilarityError>
    {
        // Times the scan setup; page fetches are driven by the caller
        // consuming the iterator.
        let started = Instant::now();
        let result = self.inner.scan(namespace, label, chunk_size, timestamp);
        self.observe("scan", started);
        result
    }

    fn flush(&self, namespace: &str) -> Result<(), SimilarityError> {
        let started = Instant::now();
        let result = self.inner.flush(namespace);
        self.observe("flush", started);
        result
    }

    fn export(
        &self,
        namespace: &str,
        targets: &[(&str, &str)],
        timestamp: u64,
    ) -> Result<Vec<Vec<u8>>, SimilarityError> {
        let started = Instant::now();
        let result = self.inner.export(namespace, targets, timestamp);
        self.observe("export", started);
        result
    }

    fn import_(
        &self,
        namespace: &str,
        payloads: &[(&str, &str, &[u8])],
        timestamp: u64,
    ) -> Result<(), SimilarityError> {
        let started = Instant::now();
        let result = self.inner.import_(namespace, payloads, timestamp);
        self.observe("import", started);
        result
    }
}

// --------------------------- Tests ---------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexConfig;
    use crate::index::SimilarityIndex;

    fn wrapped() -> InstrumentedIndex<SimilarityIndex> {
        let index = SimilarityIndex::in_memory(IndexConfig::default()).expect("build index");
        InstrumentedIndex::new(index, "test-scope")
    }

    #[test]
    fn calls_pass_through() {
        let index = wrapped();
        let features = [Feature::new("index", vec![b"alpha".to_vec(), b"beta".to_vec()])];
        index.record("ns", "item", &features, 0).unwrap();
        let ranked = index.classify("ns", "item", &["index"], None, 0).unwrap();
        assert_eq!(ranked[0].key, "item");
        assert_eq!(ranked[0].score, 1.0);
    }

    #[test]
    fn errors_are_returned_unchanged() {
        let index = wrapped();
        let empty = [Feature::new("index", Vec::new())];
        let result = index.record("ns", "item", &empty, 0);
        assert!(matches!(
            result,
            Err(SimilarityError::InvalidFeature { label, .. }) if label == "index"
        ));
    }
}
