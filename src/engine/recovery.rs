//! Recovery
//!
//! Rebuilds the in-memory state of a store on open.
//!
//! ## Steps
//! 1. Create the directory (or refuse to) and take the process lock
//! 2. Bootstrap a new manifest, or check the existing one is allowed
//! 3. Replay the manifest into a `VersionSet`
//! 4. Check every table the manifest names is present
//! 5. Replay log and map segments not yet covered by tables, oldest first
//! 6. Pick the active memtable and its segment
//! 7. Persist a version edit if replay produced tables

use std::collections::HashSet;
use std::fs;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::{Config, MemTableKind, NUM_LEVELS};
use crate::error::{Result, StrataError};
use crate::memtable::{MemTable, PersistentMemTable, VolatileMemTable};
use crate::storage::filename::{
    current_file_name, list_store_files, lock_file_name, log_file_name, map_file_name, FileType,
};
use crate::storage::flock::FileLock;
use crate::storage::{TableCache, VersionEdit, VersionSet};
use crate::types::SequenceNumber;
use crate::wal::{LogWriter, WalRecovery};

use super::compaction::{build_level0_table, CompactionStats};
use super::lock_error;

/// What recovery found and did
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    /// A new store was bootstrapped
    pub created: bool,
    /// Log and map segments replayed
    pub segments_replayed: usize,
    pub batches_replayed: u64,
    pub records_replayed: u64,
    /// Bytes at the end of log segments that could not be replayed
    pub bytes_dropped: u64,
    /// Tables written from replayed data
    pub tables_flushed: usize,
    /// Log segment appended to instead of starting a new one
    pub reused_log: Option<u64>,
    /// A version edit was written to the manifest
    pub manifest_updated: bool,
    pub last_sequence: SequenceNumber,
}

/// State handed to the engine once recovery succeeds
pub(crate) struct Recovered {
    pub(crate) lock: FileLock,
    pub(crate) versions: VersionSet,
    pub(crate) mem: Arc<dyn MemTable>,
    pub(crate) log: Option<LogWriter>,
    pub(crate) logfile_number: u64,
    pub(crate) stats: Vec<CompactionStats>,
    pub(crate) report: RecoveryReport,
}

pub(crate) struct RecoveryManager<'a> {
    config: &'a Config,
    table_cache: Arc<TableCache>,
    versions: VersionSet,
    edit: VersionEdit,
    save_manifest: bool,
    /// Memtable carried over from the newest segment, if any
    mem: Option<Arc<dyn MemTable>>,
    log: Option<LogWriter>,
    logfile_number: u64,
    max_sequence: SequenceNumber,
    stats: Vec<CompactionStats>,
    report: RecoveryReport,
}

impl<'a> RecoveryManager<'a> {
    pub(crate) fn new(config: &'a Config, table_cache: Arc<TableCache>) -> Self {
        Self {
            config,
            versions: VersionSet::new(config, Arc::clone(&table_cache)),
            table_cache,
            edit: VersionEdit::new(),
            save_manifest: false,
            mem: None,
            log: None,
            logfile_number: 0,
            max_sequence: 0,
            stats: vec![CompactionStats::default(); NUM_LEVELS],
            report: RecoveryReport::default(),
        }
    }

    pub(crate) fn run(mut self) -> Result<Recovered> {
        let dir = self.config.data_dir.clone();

        // Step 1: Directory and process lock
        if !dir.exists() {
            if !self.config.create_if_missing {
                return Err(StrataError::InvalidArgument(format!(
                    "{}: does not exist (create_if_missing is false)",
                    dir.display()
                )));
            }
            fs::create_dir_all(&dir)?;
        }
        let lock = FileLock::lock(lock_file_name(&dir)).map_err(|err| lock_error(&dir, err))?;

        // Step 2: Bootstrap or validate the existing store
        if !current_file_name(&dir).exists() {
            if !self.config.create_if_missing {
                return Err(StrataError::InvalidArgument(format!(
                    "{}: does not exist (create_if_missing is false)",
                    dir.display()
                )));
            }
            info!(path = %dir.display(), "creating new store");
            VersionSet::create_new(&dir)?;
            self.report.created = true;
        } else if self.config.error_if_exists {
            return Err(StrataError::InvalidArgument(format!(
                "{}: exists (error_if_exists is true)",
                dir.display()
            )));
        }

        // Step 3: Manifest replay
        self.save_manifest = self.versions.recover()?;
        self.max_sequence = self.versions.last_sequence();

        // Step 4: Every live table must be on disk
        let min_log = self.versions.log_number();
        let prev_log = self.versions.prev_log_number();
        let mut expected = HashSet::new();
        self.versions.add_live_files(&mut expected);

        let mut segments = Vec::new();
        for (number, kind, _) in list_store_files(&dir)? {
            expected.remove(&number);
            if matches!(kind, FileType::Log | FileType::Map) && (number >= min_log || number == prev_log) {
                segments.push((number, kind));
            }
        }
        if let Some(missing) = expected.iter().min() {
            return Err(StrataError::Corruption(format!(
                "{} missing files; e.g. table {}",
                expected.len(),
                missing
            )));
        }

        // Step 5: Replay segments in the order they were written
        segments.sort_unstable_by_key(|&(number, _)| number);
        let count = segments.len();
        for (i, (number, kind)) in segments.into_iter().enumerate() {
            match kind {
                FileType::Map => self.recover_map_file(number)?,
                _ => self.recover_log_file(number, i + 1 == count)?,
            }
            self.versions.mark_file_number_used(number);
            self.report.segments_replayed += 1;
        }
        if self.versions.last_sequence() < self.max_sequence {
            self.versions.set_last_sequence(self.max_sequence);
        }

        // Step 6: Active memtable
        let (mem, log, logfile_number) = match self.mem.take() {
            Some(mem) => (mem, self.log.take(), self.logfile_number),
            None => {
                // Replayed segments become obsolete only once the manifest
                // names the new one
                if self.report.segments_replayed > 0 {
                    self.save_manifest = true;
                }
                self.new_active_memtable()?
            }
        };

        // Step 7: Record the new log number and any tables replay produced
        if self.save_manifest {
            self.edit.set_prev_log_number(0);
            self.edit.set_log_number(logfile_number);
            self.versions.log_and_apply(&mut self.edit)?;
        }

        self.report.manifest_updated = self.save_manifest;
        self.report.last_sequence = self.versions.last_sequence();
        if self.report.segments_replayed > 0 {
            info!(
                segments = self.report.segments_replayed,
                records = self.report.records_replayed,
                tables = self.report.tables_flushed,
                last_sequence = self.report.last_sequence,
                "recovery complete"
            );
        }

        Ok(Recovered {
            lock,
            versions: self.versions,
            mem,
            log,
            logfile_number,
            stats: self.stats,
            report: self.report,
        })
    }

    /// Replay one log segment into a transient memtable, flushing it to
    /// level 0 whenever it fills.
    fn recover_log_file(&mut self, number: u64, last_log: bool) -> Result<()> {
        // A map memtable from an earlier segment holds older data
        if let Some(mem) = self.mem.take() {
            self.flush_to_level0(mem)?;
        }

        let path = log_file_name(&self.config.data_dir, number);
        info!(segment = number, "recovering log");
        let mut replay = WalRecovery::open(&path, self.config.paranoid_checks)?;
        let mut flushes = 0;

        for batch in replay.by_ref() {
            let batch = batch?;
            let history_start = self.max_sequence;
            let mem = self
                .mem
                .get_or_insert_with(|| Arc::new(VolatileMemTable::new(history_start)));
            batch.insert_into(&**mem)?;

            if batch.count() > 0 {
                let last = batch.sequence() + u64::from(batch.count()) - 1;
                self.max_sequence = self.max_sequence.max(last);
            }
            if mem.approximate_memory_usage() > self.config.write_buffer_size {
                flushes += 1;
                if let Some(mem) = self.mem.take() {
                    self.flush_to_level0(mem)?;
                }
            }
        }

        let valid_len = replay.valid_len();
        let result = replay.into_result();
        self.report.batches_replayed += result.batches_recovered;
        self.report.records_replayed += result.records_recovered;
        self.report.bytes_dropped += result.bytes_dropped;
        if let Some(corruption) = &result.corruption {
            warn!(segment = number, %corruption, "log segment ended early");
        }

        // An empty segment is picked up again even without reuse_logs, so
        // reopening an idle store neither grows the log set nor edits the manifest
        let empty = result.batches_recovered == 0
            && matches!(self.config.memtable_kind, MemTableKind::Volatile);
        if (self.config.reuse_logs || empty) && last_log && flushes == 0 && result.is_clean() {
            info!(segment = number, offset = valid_len, "reusing log");
            self.log = Some(LogWriter::append_to(&path, valid_len)?);
            self.logfile_number = number;
            self.report.reused_log = Some(number);
            if self.mem.is_none() {
                self.mem = Some(Arc::new(VolatileMemTable::new(self.max_sequence)));
            }
            return Ok(());
        }

        if let Some(mem) = self.mem.take() {
            self.flush_to_level0(mem)?;
        }
        Ok(())
    }

    /// Reopen a map segment; it becomes the active memtable unless a newer
    /// segment follows, in which case it is flushed first.
    fn recover_map_file(&mut self, number: u64) -> Result<()> {
        if let Some(mem) = self.mem.take() {
            self.flush_to_level0(mem)?;
        }

        let map = PersistentMemTable::open(&map_file_name(&self.config.data_dir, number))?;
        info!(segment = number, entries = map.entry_count(), "recovered map file");
        self.max_sequence = self.max_sequence.max(map.max_sequence());
        self.report.records_replayed += map.entry_count() as u64;

        self.mem = Some(Arc::new(map));
        self.log = None;
        self.logfile_number = number;
        Ok(())
    }

    fn flush_to_level0(&mut self, mem: Arc<dyn MemTable>) -> Result<()> {
        self.save_manifest = true;
        let number = self.versions.new_file_number();
        let meta = build_level0_table(&self.config.data_dir, &self.table_cache, number, mem.as_ref())?;
        if let Some(meta) = meta {
            info!(table = number, bytes = meta.file_size, "flushed recovered memtable");
            self.stats[0].add(0, 0, meta.file_size);
            self.edit.add_file(0, meta);
            self.report.tables_flushed += 1;
        }
        Ok(())
    }

    /// Start a fresh segment for new writes
    fn new_active_memtable(&mut self) -> Result<(Arc<dyn MemTable>, Option<LogWriter>, u64)> {
        let number = self.versions.new_file_number();
        let earliest = self.versions.last_sequence();
        let dir = &self.config.data_dir;
        match self.config.memtable_kind {
            MemTableKind::Volatile => {
                let log = LogWriter::create(&log_file_name(dir, number))?;
                Ok((Arc::new(VolatileMemTable::new(earliest)), Some(log), number))
            }
            MemTableKind::Persistent => {
                let map = PersistentMemTable::create(&map_file_name(dir, number), earliest)?;
                Ok((Arc::new(map), None, number))
            }
        }
    }
}
