//! Engine Module
//!
//! The core storage engine that coordinates all components.
//!
//! ## Responsibilities
//! - Serialize writers into commit groups (see `write`)
//! - Rotate memtables and throttle writers when level 0 backs up
//! - Run flushes and compactions on one background thread (see `compaction`)
//! - Rebuild state from the manifest and log segments on open (see `recovery`)
//! - Hand out snapshots and point-in-time reads
//!
//! ## Locking
//! ```text
//!   state: Mutex<EngineState>      versions, memtables, writer queue, bg error
//!     └── snapshots (own mutex)    taken while holding state, never the reverse
//!   log:   Mutex<Option<LogWriter>> used only by the writer at the queue head
//! ```
//! Long I/O (log appends, memtable inserts, table builds, the compaction merge
//! loop, file deletion) runs with `state` released.

mod compaction;
mod iterator;
mod recovery;
mod snapshot;
mod write;

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::fs;

use crossbeam::channel::{self, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::info;

use crate::batch::WriteBatch;
use crate::config::{Config, ReadOptions, WriteOptions, NUM_LEVELS};
use crate::error::{Result, StrataError};
use crate::memtable::MemTable;
use crate::storage::filename::{list_store_files, lock_file_name, FileType};
use crate::storage::flock::FileLock;
use crate::storage::{TableCache, VersionSet};
use crate::types::{InternalKey, Lookup, SequenceNumber, MAX_SEQUENCE_NUMBER};
use crate::wal::LogWriter;

pub use iterator::DbIterator;
pub use recovery::RecoveryReport;
pub use snapshot::Snapshot;

pub(crate) use compaction::{CompactionStats, CompactionTask, ManualCompaction};
pub(crate) use write::{ConflictCertifier, WriteOp, Writer};

use snapshot::SnapshotList;

// =============================================================================
// Shared State
// =============================================================================

/// Everything guarded by the engine mutex
pub(crate) struct EngineState {
    /// Pending writers; the head is the current group leader
    pub(crate) writers: VecDeque<Arc<Writer>>,
    /// Active memtable
    pub(crate) mem: Arc<dyn MemTable>,
    /// Memtable waiting to be flushed
    pub(crate) imm: Option<Arc<dyn MemTable>>,
    /// Number of the log or map segment backing `mem`
    pub(crate) logfile_number: u64,
    pub(crate) versions: VersionSet,
    /// Table numbers being written that no version references yet
    pub(crate) pending_outputs: HashSet<u64>,
    /// Sticky background failure; rejects every later write
    pub(crate) bg_error: Option<StrataError>,
    pub(crate) bg_compaction_scheduled: bool,
    pub(crate) manual_compaction: Option<ManualCompaction>,
    /// Outcomes of manual compactions, keyed by request id
    pub(crate) finished_manual: HashMap<u64, ManualCompaction>,
    pub(crate) next_manual_id: u64,
    pub(crate) stats: Vec<CompactionStats>,
}

impl EngineState {
    /// Oldest sequence the memtables can vouch for
    pub(crate) fn earliest_memtable_sequence(&self) -> SequenceNumber {
        match &self.imm {
            Some(imm) => imm.earliest_sequence(),
            None => self.mem.earliest_sequence(),
        }
    }

    /// Newest sequence at which `key` was written, looking only at memtables.
    ///
    /// The immutable memtable is skipped when the active one already covers
    /// every write after `lower_bound`.
    pub(crate) fn latest_sequence_for_key(
        &self,
        key: &[u8],
        lower_bound: SequenceNumber,
    ) -> Option<SequenceNumber> {
        let sequence = self.versions.last_sequence();
        if let Some(hit) = self.mem.get(key, sequence) {
            return Some(hit.sequence);
        }
        if self.mem.earliest_sequence() < lower_bound {
            return None;
        }
        self.imm
            .as_ref()
            .and_then(|imm| imm.get(key, sequence))
            .map(|hit| hit.sequence)
    }

    fn write_buffer_budget(&self, config: &Config) -> usize {
        if self.mem.is_persistent() {
            config.persistent_write_buffer_size
        } else {
            config.write_buffer_size
        }
    }
}

/// State shared between user threads and the background worker
pub(crate) struct DbInner {
    pub(crate) config: Config,
    pub(crate) dir: PathBuf,
    pub(crate) table_cache: Arc<TableCache>,
    pub(crate) state: Mutex<EngineState>,
    /// Signalled when background work finishes or the bg error is set
    pub(crate) bg_cv: Condvar,
    /// Log segment behind a volatile memtable
    pub(crate) log: Mutex<Option<LogWriter>>,
    pub(crate) snapshots: Arc<SnapshotList>,
    pub(crate) shutting_down: AtomicBool,
    /// Lock-free hint for the merge loop that a flush is waiting
    pub(crate) has_imm: AtomicBool,
    pub(crate) compaction_tx: Sender<CompactionTask>,
    _lock: FileLock,
}

// =============================================================================
// Engine
// =============================================================================

/// The main storage engine
///
/// ## Concurrency Model
///
/// - **Writes**: any number of threads call `write`; they queue up and the
///   head of the queue commits a whole group with one log append
/// - **Reads**: take the mutex only long enough to pin the memtables and the
///   current version, then read without it
/// - **Background**: one worker thread flushes and compacts, one job at a time
pub struct Engine {
    inner: Arc<DbInner>,
    worker: Option<JoinHandle<()>>,
    recovery: RecoveryReport,
}

impl Engine {
    /// Open or create an engine with the given config
    ///
    /// On startup:
    /// 1. Validate the config
    /// 2. Lock the directory, read the manifest, replay log and map segments
    /// 3. Start the background worker
    /// 4. Delete obsolete files and schedule any compaction already due
    pub fn open(config: Config) -> Result<Self> {
        // Step 1: Reject bad option combinations before touching the disk
        config.validate()?;

        // Step 2: Recover durable state
        let dir = config.data_dir.clone();
        let table_cache = Arc::new(TableCache::new(&dir));
        let recovered = recovery::RecoveryManager::new(&config, Arc::clone(&table_cache)).run()?;

        // Step 3: Shared state and the background worker
        let (compaction_tx, compaction_rx) = channel::unbounded();
        let has_imm = AtomicBool::new(false);
        let state = EngineState {
            writers: VecDeque::new(),
            mem: recovered.mem,
            imm: None,
            logfile_number: recovered.logfile_number,
            versions: recovered.versions,
            pending_outputs: HashSet::new(),
            bg_error: None,
            bg_compaction_scheduled: false,
            manual_compaction: None,
            finished_manual: HashMap::new(),
            next_manual_id: 1,
            stats: recovered.stats,
        };
        let inner = Arc::new(DbInner {
            config,
            dir,
            table_cache,
            state: Mutex::new(state),
            bg_cv: Condvar::new(),
            log: Mutex::new(recovered.log),
            snapshots: Arc::new(SnapshotList::default()),
            shutting_down: AtomicBool::new(false),
            has_imm,
            compaction_tx,
            _lock: recovered.lock,
        });
        let worker = compaction::spawn_worker(Arc::clone(&inner), compaction_rx)?;

        // Step 4: Housekeeping
        {
            let mut state = inner.state.lock();
            inner.remove_obsolete_files(&mut state);
            inner.maybe_schedule_compaction(&mut state);
            info!(
                path = %inner.dir.display(),
                last_sequence = state.versions.last_sequence(),
                levels = %state.versions.level_summary(),
                "engine opened"
            );
        }

        Ok(Self {
            inner,
            worker: Some(worker),
            recovery: recovered.report,
        })
    }

    /// Open with default settings at `path`
    pub fn open_path(path: impl Into<PathBuf>) -> Result<Self> {
        Self::open(Config::builder().data_dir(path).build())
    }

    /// Delete every file of the store at `path`
    pub fn destroy(path: &Path) -> Result<()> {
        destroy_store(path)
    }

    // =========================================================================
    // Write Path
    // =========================================================================

    /// Insert or update a key-value pair
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(&WriteOptions::default(), batch)
    }

    /// Delete a key (writes a tombstone)
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(&WriteOptions::default(), batch)
    }

    /// Apply `batch` atomically
    pub fn write(&self, options: &WriteOptions, batch: WriteBatch) -> Result<()> {
        self.inner.write(options, WriteOp::Plain(batch))
    }

    /// Apply `batch` only if no tracked key was written after its tracked sequence
    pub(crate) fn write_certified(
        &self,
        options: &WriteOptions,
        batch: WriteBatch,
        certifier: ConflictCertifier,
    ) -> Result<()> {
        self.inner
            .write(options, WriteOp::Certified { batch, certifier })
    }

    /// Run the conflict check alone, without writing
    pub(crate) fn check_conflicts(&self, certifier: &ConflictCertifier) -> Result<()> {
        let state = self.inner.state.lock();
        self.inner.certify(&state, certifier, None)
    }

    // =========================================================================
    // Read Path
    // =========================================================================

    /// Get the latest value for a key
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.get_with_options(&ReadOptions::default(), key)
    }

    /// Get a value as of the snapshot in `options` (or the latest state)
    pub fn get_with_options(&self, options: &ReadOptions<'_>, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.lookup(options, key)?.and_then(Lookup::into_value))
    }

    /// Newest entry for `key` visible to `options`, tombstones included
    pub(crate) fn lookup(&self, options: &ReadOptions<'_>, key: &[u8]) -> Result<Option<Lookup>> {
        let (sequence, mem, imm, version) = {
            let state = self.inner.state.lock();
            let sequence = options
                .snapshot
                .map_or_else(|| state.versions.last_sequence(), Snapshot::sequence);
            (
                sequence,
                Arc::clone(&state.mem),
                state.imm.clone(),
                state.versions.current(),
            )
        };

        if let Some(hit) = mem.get(key, sequence) {
            return Ok(Some(hit));
        }
        if let Some(hit) = imm.as_ref().and_then(|imm| imm.get(key, sequence)) {
            return Ok(Some(hit));
        }
        version.get(&self.inner.table_cache, key, sequence)
    }

    /// Iterate live keys in order as of the snapshot in `options`
    pub fn iter(&self, options: &ReadOptions<'_>) -> Result<DbIterator> {
        let state = self.inner.state.lock();
        let sequence = options
            .snapshot
            .map_or_else(|| state.versions.last_sequence(), Snapshot::sequence);
        Ok(DbIterator::new(
            &self.inner.table_cache,
            &state.mem,
            state.imm.as_ref(),
            state.versions.current(),
            sequence,
        ))
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// Pin the current sequence number as a read view
    pub fn get_snapshot(&self) -> Snapshot {
        let state = self.inner.state.lock();
        self.inner.snapshots.acquire(state.versions.last_sequence())
    }

    /// Release a snapshot (same as dropping it)
    pub fn release_snapshot(&self, snapshot: Snapshot) {
        drop(snapshot);
    }

    /// Sequence number of the most recent committed write
    pub fn latest_sequence_number(&self) -> SequenceNumber {
        self.inner.state.lock().versions.last_sequence()
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Flush the active memtable to a table and wait for it to land
    pub fn flush(&self) -> Result<()> {
        self.inner.write(&WriteOptions::default(), WriteOp::Barrier)?;
        let mut state = self.inner.state.lock();
        while state.imm.is_some()
            && state.bg_error.is_none()
            && !self.inner.shutting_down.load(Ordering::Acquire)
        {
            self.inner.bg_cv.wait(&mut state);
        }
        match &state.bg_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Compact every level overlapping the user-key range `[begin, end]`
    ///
    /// `None` bounds are open. The memtable is flushed first so the whole
    /// range ends up in tables.
    pub fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
        let max_level_with_files = {
            let state = self.inner.state.lock();
            let base = state.versions.current();
            (1..NUM_LEVELS)
                .filter(|&level| base.overlap_in_level(level, begin, end))
                .max()
                .unwrap_or(1)
        };
        self.flush()?;
        for level in 0..max_level_with_files {
            if self.compact_level_range(level, begin, end)?.is_some() {
                return Err(StrataError::ShuttingDown);
            }
        }
        Ok(())
    }

    /// Compact files of `level` overlapping `[begin, end]` into `level + 1`.
    ///
    /// Returns `None` when the whole range was compacted, or the user key
    /// where work stopped if the engine began shutting down first.
    pub fn compact_level_range(
        &self,
        level: usize,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>> {
        self.inner.run_manual_compaction(level, begin, end)
    }

    /// Block until no flush or compaction is pending or running
    pub fn wait_for_compactions(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        while (state.bg_compaction_scheduled || state.imm.is_some())
            && state.bg_error.is_none()
            && !self.inner.shutting_down.load(Ordering::Acquire)
        {
            self.inner.bg_cv.wait(&mut state);
        }
        match &state.bg_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Named engine property
    ///
    /// - `stratakv.num-files-at-level<N>`
    /// - `stratakv.stats`
    /// - `stratakv.sstables`
    /// - `stratakv.approximate-memory-usage`
    pub fn property(&self, name: &str) -> Option<String> {
        let rest = name.strip_prefix("stratakv.")?;
        let state = self.inner.state.lock();

        if let Some(level) = rest.strip_prefix("num-files-at-level") {
            let level: usize = level.parse().ok()?;
            if level >= NUM_LEVELS {
                return None;
            }
            return Some(state.versions.num_level_files(level).to_string());
        }

        match rest {
            "stats" => {
                let mut out = String::new();
                let _ = writeln!(out, "                               Compactions");
                let _ = writeln!(out, "Level  Files Size(MB) Time(sec) Read(MB) Write(MB)");
                let _ = writeln!(out, "--------------------------------------------------");
                for level in 0..NUM_LEVELS {
                    let files = state.versions.num_level_files(level);
                    let stats = &state.stats[level];
                    if stats.micros > 0 || files > 0 {
                        let _ = writeln!(
                            out,
                            "{:>3} {:>8} {:>8.0} {:>9.0} {:>8.0} {:>9.0}",
                            level,
                            files,
                            state.versions.num_level_bytes(level) as f64 / 1048576.0,
                            stats.micros as f64 / 1e6,
                            stats.bytes_read as f64 / 1048576.0,
                            stats.bytes_written as f64 / 1048576.0,
                        );
                    }
                }
                Some(out)
            }
            "sstables" => Some(state.versions.current().debug_string()),
            "approximate-memory-usage" => Some(approximate_memory_usage(&state).to_string()),
            _ => None,
        }
    }

    pub fn num_files_at_level(&self, level: usize) -> usize {
        if level >= NUM_LEVELS {
            return 0;
        }
        self.inner.state.lock().versions.num_level_files(level)
    }

    /// Bytes held by the active and immutable memtables
    pub fn approximate_memory_usage(&self) -> usize {
        approximate_memory_usage(&self.inner.state.lock())
    }

    /// Table bytes overlapping the user-key range `[begin, end]`
    pub fn approximate_size(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> u64 {
        let version = self.inner.state.lock().versions.current();
        version.approximate_size(begin, end)
    }

    /// Outcome of the recovery performed by `open`
    pub fn last_recovery(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Sticky background error, if one has been recorded
    pub fn background_error(&self) -> Option<StrataError> {
        self.inner.state.lock().bg_error.clone()
    }

    pub fn data_dir(&self) -> &Path {
        &self.inner.dir
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Stop background work, sync the log and release the directory lock
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };

        self.inner.shutting_down.store(true, Ordering::Release);
        {
            let mut state = self.inner.state.lock();
            while state.bg_compaction_scheduled {
                self.inner.bg_cv.wait(&mut state);
            }
        }
        let _ = self.inner.compaction_tx.send(CompactionTask::Shutdown);
        let _ = worker.join();

        if let Some(log) = self.inner.log.lock().as_mut() {
            log.sync()?;
        }
        let mem = Arc::clone(&self.inner.state.lock().mem);
        mem.sync()?;
        info!(path = %self.inner.dir.display(), "engine closed");
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

fn approximate_memory_usage(state: &EngineState) -> usize {
    state.mem.approximate_memory_usage()
        + state
            .imm
            .as_ref()
            .map_or(0, |imm| imm.approximate_memory_usage())
}

/// Remove every store file under `path`, then the directory if it is empty.
///
/// Fails with [`StrataError::Locked`] if an engine has the store open.
pub fn destroy_store(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let lock_path = lock_file_name(path);
    let lock = FileLock::lock(&lock_path).map_err(|err| lock_error(path, err))?;

    let mut result = Ok(());
    for (_, kind, file) in list_store_files(path)? {
        if kind == FileType::Lock {
            continue;
        }
        if let Err(err) = fs::remove_file(&file) {
            if result.is_ok() {
                result = Err(err.into());
            }
        }
    }
    drop(lock);
    let _ = fs::remove_file(&lock_path);
    let _ = fs::remove_dir(path);
    info!(path = %path.display(), "store destroyed");
    result
}

pub(crate) fn lock_error(dir: &Path, err: std::io::Error) -> StrataError {
    if err.kind() == std::io::ErrorKind::WouldBlock {
        StrataError::Locked(dir.to_path_buf())
    } else {
        err.into()
    }
}

/// Smallest internal key for `user_key`: sorts before every stored entry of it
pub(crate) fn range_start(user_key: &[u8]) -> InternalKey {
    InternalKey::seek_key(user_key, MAX_SEQUENCE_NUMBER)
}
