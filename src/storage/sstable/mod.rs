//! SSTable Module
//!
//! Sorted String Table - immutable on-disk sorted storage of internal keys.
//!
//! ## File Format
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │ Header (14 bytes)                                       │
//! │   Magic: "STKV" (4) | Version: u16 (2) | Count: u64 (8) │
//! ├─────────────────────────────────────────────────────────┤
//! │ Data Block (variable)                                   │
//! │   [KeyLen: u32][ValLen: u32][InternalKey][Value]        │
//! │   ... repeated for each entry, internal-key order ...   │
//! │   (InternalKey = user key + 8-byte sequence/kind tag)   │
//! ├─────────────────────────────────────────────────────────┤
//! │ Index Block (variable)                                  │
//! │   [KeyLen: u32][Offset: u64][InternalKey]               │
//! ├─────────────────────────────────────────────────────────┤
//! │ Footer (16 bytes)                                       │
//! │   IndexOffset: u64 (8) | DataCRC: u32 (4) | Padding (4) │
//! └─────────────────────────────────────────────────────────┘
//! ```

mod builder;
mod iterator;
mod reader;

pub use builder::{build_table, SSTableBuilder};
pub use iterator::SSTableIterator;
pub use reader::SSTableReader;

use crate::types::InternalKey;

// =============================================================================
// Shared Constants (used by builder, reader, iterator)
// =============================================================================

/// Magic bytes identifying a StrataKV SSTable file
pub(crate) const MAGIC: &[u8; 4] = b"STKV";

/// Current SSTable format version
pub(crate) const VERSION: u16 = 1;

/// Header size: Magic (4) + Version (2) + EntryCount (8) = 14 bytes
pub(crate) const HEADER_SIZE: u64 = 14;

/// Footer size: IndexOffset (8) + DataCRC (4) + Padding (4) = 16 bytes
pub(crate) const FOOTER_SIZE: u64 = 16;

// =============================================================================
// Table Summary
// =============================================================================

/// What a finished table holds: size and key range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSummary {
    /// Number of entries in this table
    pub entry_count: u64,
    /// File size in bytes
    pub file_size: u64,
    /// Smallest internal key (None for an empty table)
    pub smallest: Option<InternalKey>,
    /// Largest internal key (None for an empty table)
    pub largest: Option<InternalKey>,
}

impl TableSummary {
    /// Quick check if a user key might be in this table (range check)
    pub fn might_contain(&self, user_key: &[u8]) -> bool {
        match (&self.smallest, &self.largest) {
            (Some(s), Some(l)) => user_key >= s.user_key() && user_key <= l.user_key(),
            _ => false,
        }
    }
}
