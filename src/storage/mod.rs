//! Storage Module
//!
//! On-disk side of the engine: tables, the levels they live in, and the
//! manifest that records them.
//!
//! ## Responsibilities
//! - Persist sorted runs of internal keys as immutable SSTables
//! - Cache open table readers for point lookups and scans
//! - Track live files per level as immutable [`Version`]s
//! - Record every change atomically in the manifest ([`VersionSet`])
//! - Pick which files to compact next
//! - Name and lock the files of a store directory
//!
//! ## Store Layout
//! ```text
//! {data_dir}/
//!   CURRENT ──► MANIFEST-000005 ──► [VersionEdit, VersionEdit, ...]
//!   LOCK
//!   000007.log / 000007.map    (active + immutable memtable backing)
//!   000004.sst, 000006.sst ... (tables, referenced by the manifest)
//! ```

pub mod filename;
pub mod flock;
pub mod merge;
pub mod sstable;
pub mod table_cache;
pub mod version;
pub mod version_edit;
pub mod version_set;

pub use merge::{EntrySource, LevelIterator, MergingIterator};
pub use sstable::{build_table, SSTableBuilder, SSTableIterator, SSTableReader, TableSummary};
pub use table_cache::TableCache;
pub use version::Version;
pub use version_edit::{FileMetaData, VersionEdit};
pub use version_set::{Compaction, VersionSet};
