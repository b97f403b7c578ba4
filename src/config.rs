//! Configuration for StrataKV
//!
//! Centralized configuration with sensible defaults, plus the per-call
//! read/write options.

use std::path::PathBuf;

use crate::engine::Snapshot;
use crate::error::{Result, StrataError};

// =============================================================================
// Structural Constants
// =============================================================================

/// Number of on-disk levels
pub const NUM_LEVELS: usize = 7;

/// Byte budget for level 1; each deeper level gets ten times its parent
pub const LEVEL1_MAX_BYTES: u64 = 10 * 1024 * 1024;

/// Grandparent overlap allowed for one output file, in multiples of max_file_size
pub const GRANDPARENT_OVERLAP_FACTOR: u64 = 10;

/// Main configuration for a StrataKV instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for all data files
    /// Internal structure:
    ///   {data_dir}/
    ///     ├── CURRENT          (name of the live manifest)
    ///     ├── LOCK             (process lock)
    ///     ├── MANIFEST-NNNNNN  (version edits)
    ///     ├── NNNNNN.log       (write-ahead log segments)
    ///     ├── NNNNNN.map       (persistent memtables)
    ///     └── NNNNNN.sst       (tables)
    pub data_dir: PathBuf,

    // -------------------------------------------------------------------------
    // Open Behaviour
    // -------------------------------------------------------------------------
    /// Bootstrap a new empty store when none exists
    pub create_if_missing: bool,

    /// Refuse to open a store that already exists
    pub error_if_exists: bool,

    /// Treat corrupt log records as fatal during recovery
    pub paranoid_checks: bool,

    /// Keep appending to the last log segment after a clean recovery
    pub reuse_logs: bool,

    // -------------------------------------------------------------------------
    // MemTable Configuration
    // -------------------------------------------------------------------------
    /// Which memtable variant backs new writes
    pub memtable_kind: MemTableKind,

    /// Size budget of a volatile memtable before rotation (in bytes)
    pub write_buffer_size: usize,

    /// Size budget of a persistent memtable before rotation (in bytes)
    pub persistent_write_buffer_size: usize,

    // -------------------------------------------------------------------------
    // Compaction Configuration
    // -------------------------------------------------------------------------
    /// Target size of one table produced by compaction (in bytes)
    pub max_file_size: usize,

    /// Level-0 file count that makes level 0 eligible for compaction
    pub level0_compaction_trigger: usize,

    /// Level-0 file count at which each write is delayed once by 1ms
    pub level0_slowdown_writes_trigger: usize,

    /// Level-0 file count at which writes stop until compaction catches up
    pub level0_stop_writes_trigger: usize,

    /// Deepest level a flushed memtable may be placed at
    pub max_mem_compact_level: usize,
}

/// Memtable variant selected for new active memtables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemTableKind {
    /// In-memory table backed by a write-ahead log segment
    Volatile,

    /// File-backed table that is durable on its own (no WAL)
    Persistent,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./stratakv_data"),
            create_if_missing: true,
            error_if_exists: false,
            paranoid_checks: false,
            reuse_logs: false,
            memtable_kind: MemTableKind::Volatile,
            write_buffer_size: 4 * 1024 * 1024,             // 4 MB
            persistent_write_buffer_size: 64 * 1024 * 1024, // 64 MB
            max_file_size: 2 * 1024 * 1024,                 // 2 MB
            level0_compaction_trigger: 4,
            level0_slowdown_writes_trigger: 8,
            level0_stop_writes_trigger: 12,
            max_mem_compact_level: 2,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Reject option combinations the engine cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.write_buffer_size == 0 || self.persistent_write_buffer_size == 0 {
            return Err(StrataError::InvalidArgument(
                "write buffer size must be non-zero".to_string(),
            ));
        }
        if self.max_file_size == 0 {
            return Err(StrataError::InvalidArgument(
                "max file size must be non-zero".to_string(),
            ));
        }
        if !(self.level0_compaction_trigger <= self.level0_slowdown_writes_trigger
            && self.level0_slowdown_writes_trigger <= self.level0_stop_writes_trigger)
        {
            return Err(StrataError::InvalidArgument(format!(
                "level-0 triggers out of order: compaction={} slowdown={} stop={}",
                self.level0_compaction_trigger,
                self.level0_slowdown_writes_trigger,
                self.level0_stop_writes_trigger
            )));
        }
        if self.level0_compaction_trigger == 0 {
            return Err(StrataError::InvalidArgument(
                "level-0 compaction trigger must be non-zero".to_string(),
            ));
        }
        if self.max_mem_compact_level >= NUM_LEVELS - 1 {
            return Err(StrataError::InvalidArgument(format!(
                "max_mem_compact_level must be below {}",
                NUM_LEVELS - 1
            )));
        }
        Ok(())
    }

    /// Rotation budget for the configured memtable variant
    pub fn active_write_buffer_size(&self) -> usize {
        match self.memtable_kind {
            MemTableKind::Volatile => self.write_buffer_size,
            MemTableKind::Persistent => self.persistent_write_buffer_size,
        }
    }

    /// Maximum bytes a level may hold before it is picked for compaction
    pub fn max_bytes_for_level(level: usize) -> u64 {
        let mut result = LEVEL1_MAX_BYTES;
        let mut level = level;
        while level > 1 {
            result *= 10;
            level -= 1;
        }
        result
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data directory (root for all storage)
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.config.create_if_missing = value;
        self
    }

    pub fn error_if_exists(mut self, value: bool) -> Self {
        self.config.error_if_exists = value;
        self
    }

    pub fn paranoid_checks(mut self, value: bool) -> Self {
        self.config.paranoid_checks = value;
        self
    }

    pub fn reuse_logs(mut self, value: bool) -> Self {
        self.config.reuse_logs = value;
        self
    }

    /// Select the memtable variant for new writes
    pub fn memtable_kind(mut self, kind: MemTableKind) -> Self {
        self.config.memtable_kind = kind;
        self
    }

    /// Set the volatile memtable budget (in bytes)
    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.config.write_buffer_size = size;
        self
    }

    /// Set the persistent memtable budget (in bytes)
    pub fn persistent_write_buffer_size(mut self, size: usize) -> Self {
        self.config.persistent_write_buffer_size = size;
        self
    }

    /// Set the target table size for compaction output (in bytes)
    pub fn max_file_size(mut self, size: usize) -> Self {
        self.config.max_file_size = size;
        self
    }

    pub fn level0_compaction_trigger(mut self, count: usize) -> Self {
        self.config.level0_compaction_trigger = count;
        self
    }

    pub fn level0_slowdown_writes_trigger(mut self, count: usize) -> Self {
        self.config.level0_slowdown_writes_trigger = count;
        self
    }

    pub fn level0_stop_writes_trigger(mut self, count: usize) -> Self {
        self.config.level0_stop_writes_trigger = count;
        self
    }

    pub fn max_mem_compact_level(mut self, level: usize) -> Self {
        self.config.max_mem_compact_level = level;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

// =============================================================================
// Per-call Options
// =============================================================================

/// Options for a single write
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// fsync the log before the write is acknowledged
    pub sync: bool,
}

impl WriteOptions {
    pub fn sync() -> Self {
        Self { sync: true }
    }
}

/// Options for a single read or iterator
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions<'a> {
    /// Read as of this snapshot instead of the latest sequence
    pub snapshot: Option<&'a Snapshot>,
}

impl<'a> ReadOptions<'a> {
    pub fn at(snapshot: &'a Snapshot) -> Self {
        Self {
            snapshot: Some(snapshot),
        }
    }
}
