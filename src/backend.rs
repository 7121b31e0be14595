//! Backing key-value store abstraction.
//!
//! The store layer talks to storage exclusively through [`BucketBackend`],
//! a small capability interface: atomic per-member increments, slot-range
//! reads, member removal, paged scans, and namespace purge. Any KV store
//! with atomic counters and ordered iteration can implement it — the
//! bundled [`InMemoryBackend`] serves tests and embedded use; a Redis
//! cluster implementation would map rows to hashes and increments to
//! `HINCRBY`.
//!
//! Backends must be safe for concurrent use from many threads. Reads may
//! observe concurrent writers mid-operation; the index tolerates momentary
//! staleness. A backend that cannot answer within its configured deadline
//! fails the call with [`StorageError::Timeout`] rather than partially
//! completing in silence.

use std::collections::{BTreeMap, HashMap};
use std::ops::{Bound, RangeInclusive};
use std::sync::RwLock;

use crate::error::StorageError;

/// Identity of one time-sliced frequency row.
///
/// Variant order matters: the derived `Ord` keeps all membership rows for a
/// `(namespace, label)` pair contiguous, which is what [`BucketBackend::scan_page`]
/// pages over.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RowKey {
    /// Membership row: members are the item keys that hashed into `bucket`
    /// for `band`.
    Bucket {
        namespace: String,
        label: String,
        band: usize,
        bucket: String,
    },
    /// Reverse-index row: members are the encoded buckets `item` occupies
    /// in `band`, with how often it was recorded into each.
    Frequency {
        namespace: String,
        label: String,
        item: String,
        band: usize,
    },
    /// Per-namespace label registry: members are label names.
    Labels { namespace: String },
}

impl RowKey {
    pub fn namespace(&self) -> &str {
        match self {
            RowKey::Bucket { namespace, .. }
            | RowKey::Frequency { namespace, .. }
            | RowKey::Labels { namespace } => namespace,
        }
    }
}

/// Per-slot member counts for one row.
pub type SlotCounts = BTreeMap<u64, HashMap<String, u64>>;

/// One page of membership rows produced by [`BucketBackend::scan_page`].
pub struct ScanPage {
    pub rows: Vec<(RowKey, SlotCounts)>,
    /// Cursor for the next page; `None` when the scan is exhausted.
    pub next: Option<RowKey>,
}

/// Storage capabilities required by the bucket store.
pub trait BucketBackend: Send + Sync {
    /// Atomically add `delta` to `member`'s count in `slot` of `row`,
    /// creating the row and slot lazily. Concurrent increments to the same
    /// member must not lose updates.
    fn increment(&self, row: &RowKey, slot: u64, member: &str, delta: u64)
        -> Result<(), StorageError>;

    /// Read per-slot member counts for every slot of `row` within `slots`.
    /// A missing row reads as empty; a read miss is normal, not an error.
    fn read_slots(&self, row: &RowKey, slots: RangeInclusive<u64>)
        -> Result<SlotCounts, StorageError>;

    /// Remove `member` from every slot of `row`.
    fn remove_member(&self, row: &RowKey, member: &str) -> Result<(), StorageError>;

    /// Drop an entire row.
    fn delete_row(&self, row: &RowKey) -> Result<(), StorageError>;

    /// One page of membership rows for `(namespace, label)`, in row-key
    /// order, starting strictly after `cursor`.
    fn scan_page(
        &self,
        namespace: &str,
        label: &str,
        cursor: Option<&RowKey>,
        chunk_size: usize,
    ) -> Result<ScanPage, StorageError>;

    /// Wipe every row in `namespace`.
    fn purge(&self, namespace: &str) -> Result<(), StorageError>;
}

/// Reference backend holding all rows in process memory.
///
/// Increments serialize through a single `RwLock`, which satisfies the
/// atomicity contract trivially. Suitable for tests and single-process
/// embedding; not a durability story.
pub struct InMemoryBackend {
    rows: RwLock<BTreeMap<RowKey, SlotCounts>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(BTreeMap::new()),
        }
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl BucketBackend for InMemoryBackend {
    fn increment(
        &self,
        row: &RowKey,
        slot: u64,
        member: &str,
        delta: u64,
    ) -> Result<(), StorageError> {
        let mut guard = self
            .rows
            .write()
            .map_err(|_| StorageError::backend("poisoned lock"))?;
        let counts = guard
            .entry(row.clone())
            .or_default()
            .entry(slot)
            .or_default();
        *counts.entry(member.to_string()).or_insert(0) += delta;
        Ok(())
    }

    fn read_slots(
        &self,
        row: &RowKey,
        slots: RangeInclusive<u64>,
    ) -> Result<SlotCounts, StorageError> {
        let guard = self
            .rows
            .read()
            .map_err(|_| StorageError::backend("poisoned lock"))?;
        let Some(row_slots) = guard.get(row) else {
            return Ok(SlotCounts::new());
        };
        Ok(row_slots
            .range(slots)
            .map(|(slot, counts)| (*slot, counts.clone()))
            .collect())
    }

    fn remove_member(&self, row: &RowKey, member: &str) -> Result<(), StorageError> {
        let mut guard = self
            .rows
            .write()
            .map_err(|_| StorageError::backend("poisoned lock"))?;
        if let Some(row_slots) = guard.get_mut(row) {
            for counts in row_slots.values_mut() {
                counts.remove(member);
            }
            row_slots.retain(|_, counts| !counts.is_empty());
            if row_slots.is_empty() {
                guard.remove(row);
            }
        }
        Ok(())
    }

    fn delete_row(&self, row: &RowKey) -> Result<(), StorageError> {
        let mut guard = self
            .rows
            .write()
            .map_err(|_| StorageError::backend("poisoned lock"))?;
        guard.remove(row);
        Ok(())
    }

    fn scan_page(
        &self,
        namespace: &str,
        label: &str,
        cursor: Option<&RowKey>,
        chunk_size: usize,
    ) -> Result<ScanPage, StorageError> {
        let guard = self
            .rows
            .read()
            .map_err(|_| StorageError::backend("poisoned lock"))?;
        let chunk_size = chunk_size.max(1);

        let start = match cursor {
            Some(key) => Bound::Excluded(key.clone()),
            None => Bound::Included(RowKey::Bucket {
                namespace: namespace.to_string(),
                label: label.to_string(),
                band: 0,
                bucket: String::new(),
            }),
        };

        let mut rows = Vec::new();
        let mut next = None;
        for (key, slots) in guard.range((start, Bound::Unbounded)) {
            let in_scope = matches!(
                key,
                RowKey::Bucket { namespace: ns, label: l, .. }
                    if ns.as_str() == namespace && l.as_str() == label
            );
            if !in_scope {
                // Row keys for one (namespace, label) are contiguous.
                break;
            }
            if rows.len() == chunk_size {
                next = rows.last().map(|(key, _): &(RowKey, SlotCounts)| key.clone());
                break;
            }
            rows.push((key.clone(), slots.clone()));
        }
        Ok(ScanPage { rows, next })
    }

    fn purge(&self, namespace: &str) -> Result<(), StorageError> {
        let mut guard = self
            .rows
            .write()
            .map_err(|_| StorageError::backend("poisoned lock"))?;
        guard.retain(|key, _| key.namespace() != namespace);
        Ok(())
    }
}

// --------------------------- Tests ---------------------------
