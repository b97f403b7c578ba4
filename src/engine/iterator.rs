//! User-facing iterator
//!
//! Merges the memtables and every level, then hides what a reader at one
//! sequence number must not see: entries newer than the sequence, versions
//! shadowed by a newer one, and deleted keys.

use std::sync::Arc;

use crate::error::Result;
use crate::memtable::MemTable;
use crate::storage::{EntrySource, LevelIterator, MergingIterator, TableCache, Version};
use crate::types::{SequenceNumber, ValueType};

/// Ordered `(key, value)` pairs live at one sequence number
pub struct DbIterator {
    merged: MergingIterator,
    sequence: SequenceNumber,
    /// User key of the last entry consumed, visible or not
    last_user_key: Option<Vec<u8>>,
    /// Keeps the version's files from being deleted while iterating
    _version: Arc<Version>,
}

impl DbIterator {
    pub(crate) fn new(
        cache: &Arc<TableCache>,
        mem: &Arc<dyn MemTable>,
        imm: Option<&Arc<dyn MemTable>>,
        version: Arc<Version>,
        sequence: SequenceNumber,
    ) -> Self {
        let mut sources: Vec<EntrySource> = vec![Box::new(mem.iter().map(Ok))];
        if let Some(imm) = imm {
            sources.push(Box::new(imm.iter().map(Ok)));
        }

        // Level-0 files may overlap, so each one is its own source
        let mut level0 = version.files(0).to_vec();
        level0.sort_by(|a, b| b.number.cmp(&a.number));
        for file in level0 {
            sources.push(Box::new(LevelIterator::new(Arc::clone(cache), vec![file])));
        }
        for level in 1..version.files.len() {
            let files = version.files(level);
            if !files.is_empty() {
                sources.push(Box::new(LevelIterator::new(Arc::clone(cache), files.to_vec())));
            }
        }

        Self {
            merged: MergingIterator::new(sources),
            sequence,
            last_user_key: None,
            _version: version,
        }
    }

    /// Sequence number this iterator reads at
    pub fn sequence(&self) -> SequenceNumber {
        self.sequence
    }
}

impl Iterator for DbIterator {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (key, value) = match self.merged.next()? {
                Ok(entry) => entry,
                Err(err) => return Some(Err(err)),
            };
            if key.sequence() > self.sequence {
                continue;
            }
            // Newest visible entry of each user key comes first
            if self.last_user_key.as_deref() == Some(key.user_key()) {
                continue;
            }
            self.last_user_key = Some(key.user_key().to_vec());
            if key.kind() == ValueType::Deletion {
                continue;
            }
            return Some(Ok((key.into_user_key(), value)));
        }
    }
}
