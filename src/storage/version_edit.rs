//! Version edits
//!
//! A [`VersionEdit`] is one atomic change to the set of live files plus the
//! counters that go with it. Edits are serialized with bincode and appended
//! to the manifest using the log framing.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StrataError};
use crate::types::{InternalKey, SequenceNumber};

/// Metadata for one live table file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetaData {
    pub number: u64,
    pub file_size: u64,
    /// Smallest internal key served by the table
    pub smallest: InternalKey,
    /// Largest internal key served by the table
    pub largest: InternalKey,
}

impl FileMetaData {
    /// Whether the table's user-key range covers `user_key` (inclusive)
    pub fn contains_user_key(&self, user_key: &[u8]) -> bool {
        user_key >= self.smallest.user_key() && user_key <= self.largest.user_key()
    }

    /// Whether the table's user-key range intersects `[begin, end]`;
    /// `None` bounds are open
    pub fn overlaps(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> bool {
        let before = matches!(end, Some(end) if self.smallest.user_key() > end);
        let after = matches!(begin, Some(begin) if self.largest.user_key() < begin);
        !before && !after
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionEdit {
    pub log_number: Option<u64>,
    pub prev_log_number: Option<u64>,
    pub next_file_number: Option<u64>,
    pub last_sequence: Option<SequenceNumber>,
    pub compact_pointers: Vec<(usize, InternalKey)>,
    pub deleted_files: BTreeSet<(usize, u64)>,
    pub new_files: Vec<(usize, FileMetaData)>,
}

impl VersionEdit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_log_number(&mut self, number: u64) {
        self.log_number = Some(number);
    }

    pub fn set_prev_log_number(&mut self, number: u64) {
        self.prev_log_number = Some(number);
    }

    pub fn set_next_file_number(&mut self, number: u64) {
        self.next_file_number = Some(number);
    }

    pub fn set_last_sequence(&mut self, sequence: SequenceNumber) {
        self.last_sequence = Some(sequence);
    }

    pub fn set_compact_pointer(&mut self, level: usize, key: InternalKey) {
        self.compact_pointers.push((level, key));
    }

    /// Add a table to `level`
    pub fn add_file(&mut self, level: usize, file: FileMetaData) {
        self.new_files.push((level, file));
    }

    /// Remove table `number` from `level`
    pub fn remove_file(&mut self, level: usize, number: u64) {
        self.deleted_files.insert((level, number));
    }

    /// Whether applying the edit changes nothing
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| StrataError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
            .map_err(|e| StrataError::Corruption(format!("bad manifest record: {}", e)))
    }
}
