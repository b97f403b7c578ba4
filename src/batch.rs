//! Write batches
//!
//! A [`WriteBatch`] is the unit of atomic commit. Its representation is the
//! exact payload appended to the write-ahead log:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ Header (12 bytes)                            │
//! │   Sequence: u64 (8) | Count: u32 (4)         │
//! ├──────────────────────────────────────────────┤
//! │ Records                                      │
//! │   Value:    [1][KeyLen u32][Key][ValLen u32][Value] │
//! │   Deletion: [0][KeyLen u32][Key]             │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Records occupy the contiguous sequence range starting at the header
//! sequence, in insertion order.

use bytes::{Buf, BufMut};

use crate::error::{Result, StrataError};
use crate::memtable::MemTable;
use crate::types::{EntryValue, SequenceNumber, ValueType};

/// Header size: Sequence (8) + Count (4) = 12 bytes
pub const BATCH_HEADER_SIZE: usize = 12;

/// Ordered set of puts and deletes applied atomically
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteBatch {
    rep: Vec<u8>,
}

/// One decoded batch record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchRecord<'a> {
    Put { key: &'a [u8], value: &'a [u8] },
    Delete { key: &'a [u8] },
}

impl<'a> BatchRecord<'a> {
    pub fn key(&self) -> &'a [u8] {
        match self {
            BatchRecord::Put { key, .. } | BatchRecord::Delete { key } => key,
        }
    }
}

impl Default for WriteBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteBatch {
    pub fn new() -> Self {
        Self {
            rep: vec![0u8; BATCH_HEADER_SIZE],
        }
    }

    /// Rebuild a batch from a log record payload
    pub fn from_contents(contents: Vec<u8>) -> Result<Self> {
        if contents.len() < BATCH_HEADER_SIZE {
            return Err(StrataError::Corruption(format!(
                "log record too small: {} bytes",
                contents.len()
            )));
        }
        Ok(Self { rep: contents })
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.put_u8(ValueType::Value as u8);
        self.rep.put_u32_le(key.len() as u32);
        self.rep.put_slice(key);
        self.rep.put_u32_le(value.len() as u32);
        self.rep.put_slice(value);
    }

    pub fn delete(&mut self, key: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.put_u8(ValueType::Deletion as u8);
        self.rep.put_u32_le(key.len() as u32);
        self.rep.put_slice(key);
    }

    pub fn clear(&mut self) {
        self.rep.clear();
        self.rep.resize(BATCH_HEADER_SIZE, 0);
    }

    /// Append every record of `other` after this batch's records
    pub fn append(&mut self, other: &WriteBatch) {
        self.set_count(self.count() + other.count());
        self.rep.extend_from_slice(&other.rep[BATCH_HEADER_SIZE..]);
    }

    pub fn count(&self) -> u32 {
        (&self.rep[8..BATCH_HEADER_SIZE]).get_u32_le()
    }

    fn set_count(&mut self, count: u32) {
        self.rep[8..BATCH_HEADER_SIZE].copy_from_slice(&count.to_le_bytes());
    }

    pub fn sequence(&self) -> SequenceNumber {
        (&self.rep[..8]).get_u64_le()
    }

    pub fn set_sequence(&mut self, sequence: SequenceNumber) {
        self.rep[..8].copy_from_slice(&sequence.to_le_bytes());
    }

    /// Serialized size, used for the group-commit byte cap
    pub fn approximate_size(&self) -> usize {
        self.rep.len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn contents(&self) -> &[u8] {
        &self.rep
    }

    pub fn iter(&self) -> BatchIter<'_> {
        BatchIter {
            input: &self.rep[BATCH_HEADER_SIZE..],
            remaining: self.count(),
            failed: false,
        }
    }

    /// Whether any record in the batch touches `key`
    pub fn touches(&self, key: &[u8]) -> bool {
        self.iter().any(|r| matches!(r, Ok(rec) if rec.key() == key))
    }

    /// Latest buffered write for `key`, if any
    pub fn get(&self, key: &[u8]) -> Result<Option<EntryValue>> {
        let mut found = None;
        for record in self.iter() {
            match record? {
                BatchRecord::Put { key: k, value } if k == key => {
                    found = Some(EntryValue::Value(value.to_vec()))
                }
                BatchRecord::Delete { key: k } if k == key => found = Some(EntryValue::Tombstone),
                _ => {}
            }
        }
        Ok(found)
    }

    /// Insert every record into `mem`, numbering from the header sequence
    pub fn insert_into(&self, mem: &dyn MemTable) -> Result<()> {
        let mut sequence = self.sequence();
        for record in self.iter() {
            match record? {
                BatchRecord::Put { key, value } => mem.add(sequence, ValueType::Value, key, value)?,
                BatchRecord::Delete { key } => mem.add(sequence, ValueType::Deletion, key, &[])?,
            }
            sequence += 1;
        }
        Ok(())
    }
}

/// Iterator over the records of a batch
pub struct BatchIter<'a> {
    input: &'a [u8],
    remaining: u32,
    failed: bool,
}

impl<'a> BatchIter<'a> {
    fn read_slice(&mut self) -> Result<&'a [u8]> {
        if self.input.remaining() < 4 {
            return Err(StrataError::Corruption("bad WriteBatch length prefix".to_string()));
        }
        let len = self.input.get_u32_le() as usize;
        if self.input.len() < len {
            return Err(StrataError::Corruption("bad WriteBatch slice".to_string()));
        }
        let (slice, rest) = self.input.split_at(len);
        self.input = rest;
        Ok(slice)
    }

    fn read_record(&mut self) -> Result<BatchRecord<'a>> {
        if !self.input.has_remaining() {
            return Err(StrataError::Corruption("WriteBatch has wrong count".to_string()));
        }
        match ValueType::from_u8(self.input.get_u8())? {
            ValueType::Value => {
                let key = self.read_slice()?;
                let value = self.read_slice()?;
                Ok(BatchRecord::Put { key, value })
            }
            ValueType::Deletion => Ok(BatchRecord::Delete {
                key: self.read_slice()?,
            }),
        }
    }
}

impl<'a> Iterator for BatchIter<'a> {
    type Item = Result<BatchRecord<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if self.remaining == 0 {
            if self.input.has_remaining() {
                self.failed = true;
                return Some(Err(StrataError::Corruption(
                    "WriteBatch has trailing bytes".to_string(),
                )));
            }
            return None;
        }
        self.remaining -= 1;
        let record = self.read_record();
        if record.is_err() {
            self.failed = true;
        }
        Some(record)
    }
}
