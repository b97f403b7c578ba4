//! Core key types
//!
//! Every stored entry is addressed by an [`InternalKey`]: the user key plus the
//! sequence number that wrote it and the kind of write. Internal keys sort by
//! user key ascending, then sequence descending, so the newest version of a
//! key is always met first.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StrataError};

/// Position of a mutation in the global commit order
pub type SequenceNumber = u64;

/// Largest assignable sequence number (56 bits; the low byte of a tag holds the kind)
pub const MAX_SEQUENCE_NUMBER: SequenceNumber = (1 << 56) - 1;

/// Size of the encoded (sequence, kind) tag appended to a user key
pub const TAG_SIZE: usize = 8;

/// Kind of write an entry records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum ValueType {
    Deletion = 0,
    Value = 1,
}

impl ValueType {
    pub fn from_u8(raw: u8) -> Result<Self> {
        match raw {
            0 => Ok(ValueType::Deletion),
            1 => Ok(ValueType::Value),
            other => Err(StrataError::Corruption(format!(
                "unknown value type {}",
                other
            ))),
        }
    }
}

/// Pack a sequence number and kind into the trailing 8-byte tag
pub fn pack_tag(sequence: SequenceNumber, kind: ValueType) -> u64 {
    (sequence << 8) | kind as u64
}

/// Inverse of [`pack_tag`]
pub fn unpack_tag(tag: u64) -> Result<(SequenceNumber, ValueType)> {
    Ok((tag >> 8, ValueType::from_u8((tag & 0xff) as u8)?))
}

/// (user key, sequence, kind) triple
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InternalKey {
    user_key: Vec<u8>,
    sequence: SequenceNumber,
    kind: ValueType,
}

impl InternalKey {
    pub fn new(user_key: impl Into<Vec<u8>>, sequence: SequenceNumber, kind: ValueType) -> Self {
        Self {
            user_key: user_key.into(),
            sequence,
            kind,
        }
    }

    /// Smallest internal key for `user_key` visible at `sequence`.
    ///
    /// Seeking to it lands on the newest entry with a sequence at or below
    /// `sequence`, because `Value` sorts ahead of `Deletion` at equal sequence.
    pub fn seek_key(user_key: &[u8], sequence: SequenceNumber) -> Self {
        Self::new(user_key, sequence, ValueType::Value)
    }

    pub fn user_key(&self) -> &[u8] {
        &self.user_key
    }

    pub fn sequence(&self) -> SequenceNumber {
        self.sequence
    }

    pub fn kind(&self) -> ValueType {
        self.kind
    }

    pub fn into_user_key(self) -> Vec<u8> {
        self.user_key
    }

    /// Encoded form: user key followed by the little-endian tag
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.user_key.len() + TAG_SIZE);
        out.extend_from_slice(&self.user_key);
        out.extend_from_slice(&pack_tag(self.sequence, self.kind).to_le_bytes());
        out
    }

    pub fn decode(encoded: &[u8]) -> Result<Self> {
        if encoded.len() < TAG_SIZE {
            return Err(StrataError::Corruption(format!(
                "internal key too short: {} bytes",
                encoded.len()
            )));
        }
        let split = encoded.len() - TAG_SIZE;
        let mut tag = [0u8; TAG_SIZE];
        tag.copy_from_slice(&encoded[split..]);
        let (sequence, kind) = unpack_tag(u64::from_le_bytes(tag))?;
        Ok(Self::new(&encoded[..split], sequence, kind))
    }

    /// Encoded length without allocating
    pub fn encoded_len(&self) -> usize {
        self.user_key.len() + TAG_SIZE
    }
}

impl Ord for InternalKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.user_key
            .cmp(&other.user_key)
            .then_with(|| other.sequence.cmp(&self.sequence))
            .then_with(|| other.kind.cmp(&self.kind))
    }
}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for InternalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "'{}' @ {} : {:?}",
            String::from_utf8_lossy(&self.user_key),
            self.sequence,
            self.kind
        )
    }
}

// =============================================================================
// Lookup Results
// =============================================================================

/// What a layer holds for a user key at a snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryValue {
    /// A live value
    Value(Vec<u8>),

    /// A tombstone (deleted key)
    Tombstone,
}

/// Newest entry for a user key found in one layer (memtable or table)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lookup {
    pub sequence: SequenceNumber,
    pub value: EntryValue,
}

impl Lookup {
    pub(crate) fn from_parts(sequence: SequenceNumber, kind: ValueType, value: Vec<u8>) -> Self {
        let value = match kind {
            ValueType::Value => EntryValue::Value(value),
            ValueType::Deletion => EntryValue::Tombstone,
        };
        Self { sequence, value }
    }

    /// Collapse into the caller-facing result (tombstone reads as absent)
    pub fn into_value(self) -> Option<Vec<u8>> {
        match self.value {
            EntryValue::Value(v) => Some(v),
            EntryValue::Tombstone => None,
        }
    }
}
