//! Merging iterators
//!
//! [`MergingIterator`] performs a k-way merge of sorted entry sources with a
//! binary heap. Unlike the user-facing iterator it keeps every version of a
//! key; shadowing and snapshot filtering happen in the consumers.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;

use crate::error::{Result, StrataError};
use crate::types::InternalKey;

use super::sstable::SSTableIterator;
use super::table_cache::TableCache;
use super::version_edit::FileMetaData;

/// A sorted stream of internal entries
pub type EntrySource = Box<dyn Iterator<Item = Result<(InternalKey, Vec<u8>)>> + Send>;

struct HeapEntry {
    key: InternalKey,
    value: Vec<u8>,
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.source == other.source
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // BinaryHeap is a max-heap: reverse so the smallest key (then lowest source) pops first
    fn cmp(&self, other: &Self) -> Ordering {
        match self.key.cmp(&other.key) {
            Ordering::Equal => other.source.cmp(&self.source),
            ord => ord.reverse(),
        }
    }
}

pub struct MergingIterator {
    sources: Vec<EntrySource>,
    heap: BinaryHeap<HeapEntry>,
    /// Error from a source, returned before any further entry
    error: Option<StrataError>,
}

impl MergingIterator {
    pub fn new(sources: Vec<EntrySource>) -> Self {
        let mut merged = Self {
            heap: BinaryHeap::with_capacity(sources.len()),
            sources,
            error: None,
        };
        for source in 0..merged.sources.len() {
            merged.advance(source);
        }
        merged
    }

    fn advance(&mut self, source: usize) {
        match self.sources[source].next() {
            Some(Ok((key, value))) => self.heap.push(HeapEntry { key, value, source }),
            Some(Err(err)) => {
                if self.error.is_none() {
                    self.error = Some(err);
                }
            }
            None => {}
        }
    }
}

impl Iterator for MergingIterator {
    type Item = Result<(InternalKey, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(err) = self.error.take() {
            self.heap.clear();
            return Some(Err(err));
        }
        let entry = self.heap.pop()?;
        self.advance(entry.source);
        Some(Ok((entry.key, entry.value)))
    }
}

/// Concatenation of the tables of one sorted level, opened lazily
pub struct LevelIterator {
    cache: Arc<TableCache>,
    files: VecDeque<Arc<FileMetaData>>,
    current: Option<SSTableIterator>,
}

impl LevelIterator {
    pub fn new(cache: Arc<TableCache>, files: Vec<Arc<FileMetaData>>) -> Self {
        Self {
            cache,
            files: files.into(),
            current: None,
        }
    }
}

impl Iterator for LevelIterator {
    type Item = Result<(InternalKey, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(table) = self.current.as_mut() {
                match table.next() {
                    Some(entry) => return Some(entry),
                    None => self.current = None,
                }
            }
            let file = self.files.pop_front()?;
            match self.cache.iter(file.number) {
                Ok(table) => self.current = Some(table),
                Err(err) => {
                    self.files.clear();
                    return Some(Err(err));
                }
            }
        }
    }
}
