//! MemTable Module
//!
//! In-memory (or file-backed) ordered table for recent writes.
//!
//! ## Responsibilities
//! - Insert-only storage keyed by internal key (user key, sequence, kind)
//! - Snapshot-bounded point lookups
//! - Track size for the rotation budget
//! - Ordered iteration for table generation
//! - Record sequence bounds used by transaction conflict checks
//!
//! ## Variants
//! - [`VolatileMemTable`]: BTreeMap in an RwLock, made durable by the WAL
//! - [`PersistentMemTable`]: the same index mirrored to a `.map` file, durable
//!   on its own so writes skip the WAL
//!
//! Handles are shared as `Arc<dyn MemTable>`; a memtable is dropped when the
//! active/immutable slots and every reader have released it.

mod persistent;
mod table;

pub use persistent::PersistentMemTable;
pub use table::{MemTableIterator, VolatileMemTable};

use crate::error::Result;
use crate::types::{EntryValue, Lookup, SequenceNumber, ValueType};

/// Entry stored in a MemTable, as seen by a lookup
pub type MemTableEntry = EntryValue;

/// Contract shared by both memtable variants
pub trait MemTable: Send + Sync {
    /// Insert one entry. The (key, sequence) pair must be new.
    fn add(&self, sequence: SequenceNumber, kind: ValueType, key: &[u8], value: &[u8])
        -> Result<()>;

    /// Newest entry for `key` with sequence at or below `sequence`
    fn get(&self, key: &[u8], sequence: SequenceNumber) -> Option<Lookup>;

    /// Sorted copy of every entry
    fn iter(&self) -> MemTableIterator;

    /// Approximate bytes held by the table
    fn approximate_memory_usage(&self) -> usize;

    /// Whether the table survives a restart without a WAL
    fn is_persistent(&self) -> bool;

    /// Highest sequence inserted so far (0 when empty)
    fn max_sequence(&self) -> SequenceNumber;

    /// Last sequence committed before this table started receiving writes.
    ///
    /// Every write with a larger sequence that is not yet in a table file is
    /// in this memtable or a newer one. `MAX_SEQUENCE_NUMBER` means unknown.
    fn earliest_sequence(&self) -> SequenceNumber;

    /// Force inserted entries to stable storage; a no-op when the WAL
    /// carries durability
    fn sync(&self) -> Result<()> {
        Ok(())
    }

    /// Drop every entry and restart history at `earliest`
    fn clear(&self, earliest: SequenceNumber) -> Result<()>;

    fn entry_count(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.entry_count() == 0
    }
}
