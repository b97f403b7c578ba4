//! Volatile MemTable implementation
//!
//! BTreeMap-based memtable with RwLock for concurrency.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::RwLock;

use crate::error::Result;
use crate::types::{InternalKey, Lookup, SequenceNumber, ValueType, MAX_SEQUENCE_NUMBER, TAG_SIZE};

use super::MemTable;

/// Fixed per-entry bookkeeping charged against the size budget
const ENTRY_OVERHEAD: usize = 32;

/// In-memory table for recent writes
pub struct VolatileMemTable {
    /// Internal key → value (empty for tombstones)
    data: RwLock<BTreeMap<InternalKey, Vec<u8>>>,
    /// Approximate size in bytes
    size: AtomicUsize,
    max_sequence: AtomicU64,
    earliest_sequence: AtomicU64,
}

impl VolatileMemTable {
    /// Create an empty table whose history starts after `earliest_sequence`
    pub fn new(earliest_sequence: SequenceNumber) -> Self {
        Self {
            data: RwLock::new(BTreeMap::new()),
            size: AtomicUsize::new(0),
            max_sequence: AtomicU64::new(0),
            earliest_sequence: AtomicU64::new(earliest_sequence),
        }
    }

    /// Create an empty table with unknown history
    pub fn without_history() -> Self {
        Self::new(MAX_SEQUENCE_NUMBER)
    }

    pub(crate) fn insert(&self, key: InternalKey, value: Vec<u8>) {
        let charge = key.user_key().len() + TAG_SIZE + value.len() + ENTRY_OVERHEAD;
        self.max_sequence.fetch_max(key.sequence(), Ordering::SeqCst);
        self.data.write().insert(key, value);
        self.size.fetch_add(charge, Ordering::Relaxed);
    }

    pub(crate) fn reset(&self, earliest: SequenceNumber) {
        self.data.write().clear();
        self.size.store(0, Ordering::Relaxed);
        self.max_sequence.store(0, Ordering::SeqCst);
        self.earliest_sequence.store(earliest, Ordering::SeqCst);
    }

    pub(crate) fn set_max_sequence(&self, sequence: SequenceNumber) {
        self.max_sequence.fetch_max(sequence, Ordering::SeqCst);
    }
}

impl Default for VolatileMemTable {
    fn default() -> Self {
        Self::without_history()
    }
}

impl MemTable for VolatileMemTable {
    fn add(
        &self,
        sequence: SequenceNumber,
        kind: ValueType,
        key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        self.insert(InternalKey::new(key, sequence, kind), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &[u8], sequence: SequenceNumber) -> Option<Lookup> {
        let data = self.data.read();
        let (ikey, value) = data.range(InternalKey::seek_key(key, sequence)..).next()?;
        if ikey.user_key() != key {
            return None;
        }
        Some(Lookup::from_parts(ikey.sequence(), ikey.kind(), value.clone()))
    }

    fn iter(&self) -> MemTableIterator {
        let entries: Vec<_> = self
            .data
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        MemTableIterator {
            inner: entries.into_iter(),
        }
    }

    fn approximate_memory_usage(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    fn is_persistent(&self) -> bool {
        false
    }

    fn max_sequence(&self) -> SequenceNumber {
        self.max_sequence.load(Ordering::SeqCst)
    }

    fn earliest_sequence(&self) -> SequenceNumber {
        self.earliest_sequence.load(Ordering::SeqCst)
    }

    fn clear(&self, earliest: SequenceNumber) -> Result<()> {
        self.reset(earliest);
        Ok(())
    }

    fn entry_count(&self) -> usize {
        self.data.read().len()
    }
}

/// Iterator over MemTable entries in internal-key order
pub struct MemTableIterator {
    inner: std::vec::IntoIter<(InternalKey, Vec<u8>)>,
}

impl Iterator for MemTableIterator {
    type Item = (InternalKey, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}
