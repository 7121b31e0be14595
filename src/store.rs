//! Time-decayed frequency storage for LSH buckets.
//!
//! [`BucketStore`] keeps, per `(namespace, label, band, bucket)`, a ring of
//! per-time-slot frequency counters over item keys, and alongside it the
//! reverse index: per `(namespace, label, item, band)`, which buckets the
//! item hashed into and how often. The reverse index is what lets
//! `classify`, `delete`, `merge`, and `export` locate an item's rows in
//! O(bands) reads without re-deriving its original tokens.
//!
//! Counts age out on slot granularity: a slot older than
//! `retention × slot_duration` is excluded from reads and left for the
//! backing store to overwrite. Nothing is proactively deleted on age.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::ops::RangeInclusive;
use std::sync::Arc;

use crate::backend::{BucketBackend, RowKey, SlotCounts};
use crate::error::StorageError;

/// One membership row surfaced by [`BucketStore::scan`], with counts
/// aggregated over the retention window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanEntry {
    pub label: String,
    pub band: usize,
    pub bucket: String,
    pub counts: HashMap<String, u64>,
}

/// Export blob structure: per band, `retention + 1` slot entries of
/// `(slot_index, [(encoded bucket, count)])`, encoded as msgpack.
type ExportedBands = Vec<Vec<(u64, Vec<(String, u64)>)>>;

/// Render a band's bucket tuple as a stable row-key component.
pub(crate) fn encode_bucket(values: &[u64]) -> String {
    let mut out = String::with_capacity(values.len() * 5);
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            out.push(':');
        }
        out.push_str(&format!("{value:x}"));
    }
    out
}

/// Time-sliced frequency store over a shared backend.
///
/// Stateless apart from the backend handle; safe to share across threads.
pub struct BucketStore {
    backend: Arc<dyn BucketBackend>,
    slot_duration: u64,
    retention: u64,
}

impl BucketStore {
    pub fn new(backend: Arc<dyn BucketBackend>, slot_duration: u64, retention: u64) -> Self {
        Self {
            backend,
            slot_duration,
            retention,
        }
    }

    fn slot_for(&self, timestamp: u64) -> u64 {
        timestamp / self.slot_duration
    }

    /// Slots still inside the retention window at `timestamp`.
    fn retained(&self, timestamp: u64) -> RangeInclusive<u64> {
        let current = self.slot_for(timestamp);
        current.saturating_sub(self.retention)..=current
    }

    /// Record `item` into one band's bucket: one increment on the
    /// membership row, one on the item's reverse-index row.
    pub fn record_bucket(
        &self,
        namespace: &str,
        label: &str,
        band: usize,
        bucket_values: &[u64],
        item: &str,
        timestamp: u64,
    ) -> Result<(), StorageError> {
        let slot = self.slot_for(timestamp);
        let bucket = encode_bucket(bucket_values);
        self.backend.increment(
            &RowKey::Bucket {
                namespace: namespace.to_string(),
                label: label.to_string(),
                band,
                bucket: bucket.clone(),
            },
            slot,
            item,
            1,
        )?;
        self.backend.increment(
            &RowKey::Frequency {
                namespace: namespace.to_string(),
                label: label.to_string(),
                item: item.to_string(),
                band,
            },
            slot,
            &bucket,
            1,
        )
    }

    /// Aggregate member counts for one bucket row across the retention
    /// window. Items with no surviving counts are absent.
    pub fn read_bucket(
        &self,
        namespace: &str,
        label: &str,
        band: usize,
        bucket: &str,
        timestamp: u64,
    ) -> Result<HashMap<String, u64>, StorageError> {
        let row = RowKey::Bucket {
            namespace: namespace.to_string(),
            label: label.to_string(),
            band,
            bucket: bucket.to_string(),
        };
        let slots = self.backend.read_slots(&row, self.retained(timestamp))?;
        Ok(aggregate(slots))
    }

    /// The buckets `item` occupies in `band` within the retention window,
    /// with recording frequencies.
    pub fn read_frequencies(
        &self,
        namespace: &str,
        label: &str,
        item: &str,
        band: usize,
        timestamp: u64,
    ) -> Result<HashMap<String, u64>, StorageError> {
        let row = RowKey::Frequency {
            namespace: namespace.to_string(),
            label: label.to_string(),
            item: item.to_string(),
            band,
        };
        let slots = self.backend.read_slots(&row, self.retained(timestamp))?;
        Ok(aggregate(slots))
    }

    /// Remove `item` from every bucket row it occupies in `band`, then drop
    /// its reverse-index row. Best effort: a crash mid-way leaves a
    /// partially deleted item, never a corrupted row.
    pub fn delete_band_entry(
        &self,
        namespace: &str,
        label: &str,
        item: &str,
        band: usize,
    ) -> Result<(), StorageError> {
        let row = RowKey::Frequency {
            namespace: namespace.to_string(),
            label: label.to_string(),
            item: item.to_string(),
            band,
        };
        // All slots, not just retained ones: stale membership in expired
        // slots would otherwise resurface if the ring wraps.
        let slots = self.backend.read_slots(&row, 0..=u64::MAX)?;
        let buckets: BTreeSet<&String> = slots.values().flat_map(|counts| counts.keys()).collect();
        for bucket in buckets {
            self.backend.remove_member(
                &RowKey::Bucket {
                    namespace: namespace.to_string(),
                    label: label.to_string(),
                    band,
                    bucket: bucket.clone(),
                },
                item,
            )?;
        }
        self.backend.delete_row(&row)
    }

    /// Reassign every count `source` holds in `label` to `destination`,
    /// then delete `source`. Replay is slot-faithful so merged history
    /// decays on the source's original schedule.
    pub fn merge_item(
        &self,
        namespace: &str,
        label: &str,
        destination: &str,
        source: &str,
        bands: usize,
        timestamp: u64,
    ) -> Result<(), StorageError> {
        if destination == source {
            return Ok(());
        }
        let horizon = *self.retained(timestamp).start();
        for band in 0..bands {
            let source_row = RowKey::Frequency {
                namespace: namespace.to_string(),
                label: label.to_string(),
                item: source.to_string(),
                band,
            };
            let slots = self.backend.read_slots(&source_row, 0..=u64::MAX)?;
            for (slot, counts) in &slots {
                if *slot < horizon {
                    continue;
                }
                for (bucket, count) in counts {
                    self.backend.increment(
                        &RowKey::Frequency {
                            namespace: namespace.to_string(),
                            label: label.to_string(),
                            item: destination.to_string(),
                            band,
                        },
                        *slot,
                        bucket,
                        *count,
                    )?;
                    self.backend.increment(
                        &RowKey::Bucket {
                            namespace: namespace.to_string(),
                            label: label.to_string(),
                            band,
                            bucket: bucket.clone(),
                        },
                        *slot,
                        destination,
                        *count,
                    )?;
                }
            }
            let buckets: BTreeSet<&String> =
                slots.values().flat_map(|counts| counts.keys()).collect();
            for bucket in buckets {
                self.backend.remove_member(
                    &RowKey::Bucket {
                        namespace: namespace.to_string(),
                        label: label.to_string(),
                        band,
                        bucket: bucket.clone(),
                    },
                    source,
                )?;
            }
            self.backend.delete_row(&source_row)?;
        }
        Ok(())
    }

    /// Encode `item`'s retained bucket frequencies as an opaque blob.
    ///
    /// Slot entries are emitted for the whole window (empty slots included)
    /// and pairs are sorted, so equal logical state yields byte-equal blobs.
    pub fn export_item(
        &self,
        namespace: &str,
        label: &str,
        item: &str,
        bands: usize,
        timestamp: u64,
    ) -> Result<Vec<u8>, StorageError> {
        let window = self.retained(timestamp);
        let mut exported: ExportedBands = Vec::with_capacity(bands);
        for band in 0..bands {
            let row = RowKey::Frequency {
                namespace: namespace.to_string(),
                label: label.to_string(),
                item: item.to_string(),
                band,
            };
            let slots = self.backend.read_slots(&row, window.clone())?;
            let mut entries = Vec::with_capacity(self.retention as usize + 1);
            for slot in window.clone() {
                let mut pairs: Vec<(String, u64)> = slots
                    .get(&slot)
                    .map(|counts| {
                        counts
                            .iter()
                            .map(|(bucket, count)| (bucket.clone(), *count))
                            .collect()
                    })
                    .unwrap_or_default();
                pairs.sort();
                entries.push((slot, pairs));
            }
            exported.push(entries);
        }
        Ok(rmp_serde::to_vec(&exported)?)
    }

    /// Additively merge a blob produced by [`Self::export_item`] into
    /// `item`'s live rows. Importing the same blob twice doubles counts;
    /// this is deliberate merge semantics, not a set union.
    pub fn import_item(
        &self,
        namespace: &str,
        label: &str,
        item: &str,
        blob: &[u8],
        timestamp: u64,
    ) -> Result<(), StorageError> {
        let decoded: ExportedBands = rmp_serde::from_slice(blob)?;
        let horizon = *self.retained(timestamp).start();
        for (band, entries) in decoded.iter().enumerate() {
            for (slot, pairs) in entries {
                if *slot < horizon {
                    // Already expired at import time.
                    continue;
                }
                for (bucket, count) in pairs {
                    self.backend.increment(
                        &RowKey::Frequency {
                            namespace: namespace.to_string(),
                            label: label.to_string(),
                            item: item.to_string(),
                            band,
                        },
                        *slot,
                        bucket,
                        *count,
                    )?;
                    self.backend.increment(
                        &RowKey::Bucket {
                            namespace: namespace.to_string(),
                            label: label.to_string(),
                            band,
                            bucket: bucket.clone(),
                        },
                        *slot,
                        item,
                        *count,
                    )?;
                }
            }
        }
        Ok(())
    }

    /// Track `label` in the namespace registry so `compare` can run over
    /// every label ever recorded.
    pub fn register_label(
        &self,
        namespace: &str,
        label: &str,
    ) -> Result<(), StorageError> {
        // The registry is not time-decayed; slot 0 is a plain counter.
        self.backend.increment(
            &RowKey::Labels {
                namespace: namespace.to_string(),
            },
            0,
            label,
            1,
        )
    }

    /// Every label ever recorded in `namespace`, sorted.
    pub fn known_labels(&self, namespace: &str) -> Result<Vec<String>, StorageError> {
        let slots = self.backend.read_slots(
            &RowKey::Labels {
                namespace: namespace.to_string(),
            },
            0..=0,
        )?;
        let mut labels: Vec<String> = aggregate(slots).into_keys().collect();
        labels.sort();
        Ok(labels)
    }

    /// Lazily iterate every live membership row for `(namespace, label)` in
    /// backend pages of `chunk_size` rows. Restartable only from the
    /// beginning; rows whose counts have fully expired are skipped.
    pub fn scan(
        &self,
        namespace: &str,
        label: &str,
        chunk_size: usize,
        timestamp: u64,
    ) -> ScanIter<'_> {
        ScanIter {
            store: self,
            namespace: namespace.to_string(),
            label: label.to_string(),
            chunk_size: chunk_size.max(1),
            window: self.retained(timestamp),
            cursor: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Wipe every row in `namespace`.
    pub fn destroy(&self, namespace: &str) -> Result<(), StorageError> {
        self.backend.purge(namespace)
    }
}

fn aggregate(slots: SlotCounts) -> HashMap<String, u64> {
    let mut out: HashMap<String, u64> = HashMap::new();
    for counts in slots.into_values() {
        for (member, count) in counts {
            *out.entry(member).or_insert(0) += count;
        }
    }
    out
}

/// Iterator over membership rows, paging through the backend.
pub struct ScanIter<'a> {
    store: &'a BucketStore,
    namespace: String,
    label: String,
    chunk_size: usize,
    window: RangeInclusive<u64>,
    cursor: Option<RowKey>,
    buffer: VecDeque<(RowKey, SlotCounts)>,
    exhausted: bool,
}

impl Iterator for ScanIter<'_> {
    type Item = Result<ScanEntry, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            while let Some((key, slots)) = self.buffer.pop_front() {
                let RowKey::Bucket {
                    label, band, bucket, ..
                } = key
                else {
                    continue;
                };
                let live: SlotCounts = slots
                    .into_iter()
                    .filter(|(slot, _)| self.window.contains(slot))
                    .collect();
                let counts = aggregate(live);
                if counts.is_empty() {
                    continue;
                }
                return Some(Ok(ScanEntry {
                    label,
                    band,
                    bucket,
                    counts,
                }));
            }
            if self.exhausted {
                return None;
            }
            match self.store.backend.scan_page(
                &self.namespace,
                &self.label,
                self.cursor.as_ref(),
                self.chunk_size,
            ) {
                Ok(page) => {
                    self.buffer = page.rows.into();
                    match page.next {
                        Some(cursor) => self.cursor = Some(cursor),
                        None => self.exhausted = true,
                    }
                }
                Err(err) => {
                    self.exhausted = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

// --------------------------- Tests ---------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;

    const HOUR: u64 = 60 * 60;
    const T0: u64 = 1_700_000_000;

    fn store() -> BucketStore {
        BucketStore::new(Arc::new(InMemoryBackend::new()), HOUR, 12)
    }

    #[test]
    fn record_and_read_aggregate_counts() {
        let store = store();
        store
            .record_bucket("ns", "index", 0, &[17, 42], "item", T0)
            .unwrap();
        store
            .record_bucket("ns", "index", 0, &[17, 42], "item", T0 + HOUR)
            .unwrap();
        let bucket = encode_bucket(&[17, 42]);
        let counts = store
            .read_bucket("ns", "index", 0, &bucket, T0 + HOUR)
            .unwrap();
        assert_eq!(counts["item"], 2);
    }

    #[test]
    fn counts_age_out_of_the_window() {
        let store = store();
        store
            .record_bucket("ns", "index", 0, &[7], "item", T0)
            .unwrap();
        let bucket = encode_bucket(&[7]);
        let within = store
            .read_bucket("ns", "index", 0, &bucket, T0 + 12 * HOUR)
            .unwrap();
        assert_eq!(within["item"], 1);
        let expired = store
            .read_bucket("ns", "index", 0, &bucket, T0 + 13 * HOUR)
            .unwrap();
        assert!(expired.is_empty());
    }

    #[test]
    fn delete_band_entry_clears_membership_and_frequencies() {
        let store = store();
        store
            .record_bucket("ns", "index", 0, &[7], "gone", T0)
            .unwrap();
        store
            .record_bucket("ns", "index", 0, &[7], "kept", T0)
            .unwrap();
        store.delete_band_entry("ns", "index", "gone", 0).unwrap();

        let bucket = encode_bucket(&[7]);
        let counts = store.read_bucket("ns", "index", 0, &bucket, T0).unwrap();
        assert!(!counts.contains_key("gone"));
        assert!(counts.contains_key("kept"));
        assert!(store
            .read_frequencies("ns", "index", "gone", 0, T0)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn export_is_deterministic_and_window_shaped() {
        let store = store();
        store
            .record_bucket("ns", "index", 0, &[1], "item", T0)
            .unwrap();
        store
            .record_bucket("ns", "index", 1, &[2], "item", T0)
            .unwrap();
        let a = store.export_item("ns", "index", "item", 2, T0).unwrap();
        let b = store.export_item("ns", "index", "item", 2, T0).unwrap();
        assert_eq!(a, b);

        let decoded: Vec<Vec<(u64, Vec<(String, u64)>)>> = rmp_serde::from_slice(&a).unwrap();
        assert_eq!(decoded.len(), 2);
        for band in &decoded {
            // retention + 1 slot entries, expired or not.
            assert_eq!(band.len(), 13);
        }
    }

    #[test]
    fn import_replays_counts_into_live_rows() {
        let store = store();
        store
            .record_bucket("ns", "index", 0, &[9], "origin", T0)
            .unwrap();
        let blob = store.export_item("ns", "index", "origin", 1, T0).unwrap();
        store
            .import_item("ns", "index", "copy", &blob, T0)
            .unwrap();

        let bucket = encode_bucket(&[9]);
        let counts = store.read_bucket("ns", "index", 0, &bucket, T0).unwrap();
        assert_eq!(counts["origin"], 1);
        assert_eq!(counts["copy"], 1);
        let freqs = store.read_frequencies("ns", "index", "copy", 0, T0).unwrap();
        assert_eq!(freqs[&bucket], 1);
    }

    #[test]
    fn label_registry_accumulates() {
        let store = store();
        store.register_label("ns", "message").unwrap();
        store.register_label("ns", "frames").unwrap();
        store.register_label("ns", "message").unwrap();
        assert_eq!(
            store.known_labels("ns").unwrap(),
            vec!["frames".to_string(), "message".to_string()]
        );
    }

    #[test]
    fn scan_skips_fully_expired_rows() {
        let store = store();
        store
            .record_bucket("ns", "index", 0, &[1], "old", T0)
            .unwrap();
        store
            .record_bucket("ns", "index", 0, &[2], "new", T0 + 13 * HOUR)
            .unwrap();
        let entries: Vec<ScanEntry> = store
            .scan("ns", "index", 10, T0 + 13 * HOUR)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].counts.contains_key("new"));
    }
}
