//! Background flushes and compactions
//!
//! ## Responsibilities
//! - Keep at most one background job scheduled or running
//! - Flush the immutable memtable into a table (minor compaction)
//! - Merge a level into the next one (major compaction), dropping entries
//!   no snapshot can see
//! - Serve manual range compactions handed over by user threads
//! - Delete files no live version, log or pending job refers to
//!
//! ```text
//!   user threads ──maybe_schedule──▶ channel ──▶ worker thread
//!                                                  │
//!                        imm pending? ── yes ──▶ compact_memtable
//!                                │ no
//!                        manual or picked compaction
//!                                │
//!                 trivial move ──┴── merge inputs ─▶ new tables ─▶ log_and_apply
//! ```

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam::channel::Receiver;
use parking_lot::MutexGuard;
use tracing::{debug, info, warn};

use crate::config::NUM_LEVELS;
use crate::error::{Result, StrataError};
use crate::memtable::MemTable;
use crate::storage::filename::{list_store_files, table_file_name, FileType};
use crate::storage::{build_table, Compaction, FileMetaData, SSTableBuilder, TableCache, Version, VersionEdit};
use crate::types::{InternalKey, SequenceNumber, ValueType, MAX_SEQUENCE_NUMBER};

use super::{range_start, DbInner, EngineState};

type StateGuard<'a> = MutexGuard<'a, EngineState>;

/// Message for the background worker
pub(crate) enum CompactionTask {
    Compact,
    Shutdown,
}

/// Time and bytes spent compacting into one level
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct CompactionStats {
    pub(crate) micros: u64,
    pub(crate) bytes_read: u64,
    pub(crate) bytes_written: u64,
}

impl CompactionStats {
    pub(crate) fn add(&mut self, micros: u64, bytes_read: u64, bytes_written: u64) {
        self.micros += micros;
        self.bytes_read += bytes_read;
        self.bytes_written += bytes_written;
    }
}

/// A user-requested compaction of one level's key range
#[derive(Debug, Clone)]
pub(crate) struct ManualCompaction {
    pub(crate) id: u64,
    pub(crate) level: usize,
    pub(crate) done: bool,
    /// `None` means the start of the key space
    pub(crate) begin: Option<InternalKey>,
    /// `None` means the end of the key space
    pub(crate) end: Option<InternalKey>,
}

pub(crate) fn spawn_worker(inner: Arc<DbInner>, tasks: Receiver<CompactionTask>) -> Result<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("stratakv-compaction".to_string())
        .spawn(move || {
            for task in tasks {
                match task {
                    CompactionTask::Compact => inner.background_call(),
                    CompactionTask::Shutdown => break,
                }
            }
            debug!("compaction worker exiting");
        })?;
    Ok(handle)
}

/// Build a table from a memtable's contents.
///
/// Returns `None` (and leaves no file behind) when the memtable is empty.
pub(crate) fn build_level0_table(
    dir: &Path,
    cache: &TableCache,
    number: u64,
    mem: &dyn MemTable,
) -> Result<Option<FileMetaData>> {
    let path = table_file_name(dir, number);
    let Some(summary) = build_table(&path, mem.iter().map(Ok))? else {
        return Ok(None);
    };
    let (Some(smallest), Some(largest)) = (summary.smallest, summary.largest) else {
        return Err(StrataError::Corruption(format!(
            "table {} built without a key range",
            number
        )));
    };
    // Make sure the table is readable before it is installed
    cache.find_table(number)?;
    Ok(Some(FileMetaData {
        number,
        file_size: summary.file_size,
        smallest,
        largest,
    }))
}

// =============================================================================
// Drop Rule
// =============================================================================

/// Decides which merged entries a compaction can discard.
///
/// Entries arrive in internal-key order. An entry is dropped when a newer
/// entry for the same user key is already visible to the oldest snapshot, or
/// when it is a deletion visible to every snapshot with nothing older left in
/// deeper levels to shadow.
pub(crate) struct KeyDropFilter {
    smallest_snapshot: SequenceNumber,
    current_user_key: Option<Vec<u8>>,
    last_sequence_for_key: SequenceNumber,
}

impl KeyDropFilter {
    pub(crate) fn new(smallest_snapshot: SequenceNumber) -> Self {
        Self {
            smallest_snapshot,
            current_user_key: None,
            last_sequence_for_key: MAX_SEQUENCE_NUMBER,
        }
    }

    pub(crate) fn should_drop(
        &mut self,
        key: &InternalKey,
        is_base_level: impl FnOnce(&[u8]) -> bool,
    ) -> bool {
        if self.current_user_key.as_deref() != Some(key.user_key()) {
            self.current_user_key = Some(key.user_key().to_vec());
            self.last_sequence_for_key = MAX_SEQUENCE_NUMBER;
        }

        let drop = if self.last_sequence_for_key <= self.smallest_snapshot {
            // Shadowed by a newer entry that every snapshot already sees
            true
        } else {
            key.kind() == ValueType::Deletion
                && key.sequence() <= self.smallest_snapshot
                && is_base_level(key.user_key())
        };
        self.last_sequence_for_key = key.sequence();
        drop
    }
}

// =============================================================================
// Compaction State
// =============================================================================

struct CompactionOutput {
    number: u64,
    file_size: u64,
    smallest: Option<InternalKey>,
    largest: Option<InternalKey>,
}

/// A major compaction in progress
struct CompactionState {
    compaction: Compaction,
    /// Entries at or below this sequence are visible to every snapshot
    smallest_snapshot: SequenceNumber,
    outputs: Vec<CompactionOutput>,
    builder: Option<SSTableBuilder>,
    total_bytes: u64,
}

impl CompactionState {
    fn new(compaction: Compaction) -> Self {
        Self {
            compaction,
            smallest_snapshot: 0,
            outputs: Vec::new(),
            builder: None,
            total_bytes: 0,
        }
    }
}

impl DbInner {
    // =========================================================================
    // Scheduling
    // =========================================================================

    /// Queue a background job if one is due and none is outstanding
    pub(crate) fn maybe_schedule_compaction(&self, state: &mut EngineState) {
        if state.bg_compaction_scheduled
            || self.shutting_down.load(Ordering::Acquire)
            || state.bg_error.is_some()
        {
            return;
        }
        if state.imm.is_none()
            && state.manual_compaction.is_none()
            && !state.versions.needs_compaction()
        {
            return;
        }
        state.bg_compaction_scheduled = true;
        if self.compaction_tx.send(CompactionTask::Compact).is_err() {
            state.bg_compaction_scheduled = false;
        }
    }

    fn background_call(&self) {
        let mut state = self.state.lock();
        if !self.shutting_down.load(Ordering::Acquire) && state.bg_error.is_none() {
            self.background_compaction(&mut state);
        }
        state.bg_compaction_scheduled = false;

        // The job may have left a level over budget
        self.maybe_schedule_compaction(&mut state);
        self.bg_cv.notify_all();
    }

    fn background_compaction(&self, state: &mut StateGuard<'_>) {
        if state.imm.is_some() {
            self.compact_memtable(state);
            return;
        }

        let manual = state.manual_compaction.clone();
        let mut manual_end = None;
        let picked = match &manual {
            Some(m) => {
                let picked = state
                    .versions
                    .compact_range(m.level, m.begin.as_ref(), m.end.as_ref());
                if let Some(c) = &picked {
                    manual_end = c.inputs[0].last().map(|f| f.largest.clone());
                }
                info!(
                    level = m.level,
                    begin = ?m.begin,
                    end = ?m.end,
                    stop = ?manual_end,
                    "manual compaction"
                );
                picked
            }
            None => state.versions.pick_compaction(),
        };

        let mut status = Ok(());
        match picked {
            None => {}
            Some(mut c) if manual.is_none() && c.is_trivial_move() => {
                let file = Arc::clone(c.input(0, 0));
                let level = c.level();
                c.edit.remove_file(level, file.number);
                c.edit.add_file(level + 1, (*file).clone());
                status = state.versions.log_and_apply(&mut c.edit);
                match &status {
                    Ok(()) => info!(
                        table = file.number,
                        to_level = level + 1,
                        bytes = file.file_size,
                        levels = %state.versions.level_summary(),
                        "moved table"
                    ),
                    Err(err) => self.record_background_error(state, err.clone()),
                }
            }
            Some(c) => {
                let mut compact = CompactionState::new(c);
                status = self.do_compaction_work(state, &mut compact);
                if let Err(err) = &status {
                    self.record_compaction_error(state, err.clone());
                }
                self.cleanup_compaction(state, compact);
                self.remove_obsolete_files(state);
            }
        }

        if let Err(err) = &status {
            if !self.shutting_down.load(Ordering::Acquire) {
                warn!(error = %err, "compaction failed");
            }
        }

        if let Some(mut m) = manual {
            if status.is_err() || manual_end.is_none() {
                m.done = true;
            }
            if !m.done {
                // Only part of the range fit in one step; resume after it
                m.begin = manual_end;
            }
            state.manual_compaction = None;
            state.finished_manual.insert(m.id, m);
        }
    }

    // =========================================================================
    // Minor Compaction
    // =========================================================================

    /// Flush the immutable memtable and drop the log segments it covered
    pub(crate) fn compact_memtable(&self, state: &mut StateGuard<'_>) {
        let Some(imm) = state.imm.clone() else {
            return;
        };

        let base = state.versions.current();
        let mut edit = VersionEdit::new();
        let mut status = self.write_level0_table(state, &imm, &mut edit, Some(base.as_ref()));

        if status.is_ok() && self.shutting_down.load(Ordering::Acquire) {
            status = Err(StrataError::ShuttingDown);
        }
        if status.is_ok() {
            // Everything up to the active segment is now in tables
            edit.set_prev_log_number(0);
            edit.set_log_number(state.logfile_number);
            status = state.versions.log_and_apply(&mut edit);
        }

        match status {
            Ok(()) => {
                state.imm = None;
                self.has_imm.store(false, Ordering::Release);
                self.remove_obsolete_files(state);
            }
            Err(err) => self.record_compaction_error(state, err),
        }
    }

    fn write_level0_table(
        &self,
        state: &mut StateGuard<'_>,
        mem: &Arc<dyn MemTable>,
        edit: &mut VersionEdit,
        base: Option<&Version>,
    ) -> Result<()> {
        let start = Instant::now();
        let number = state.versions.new_file_number();
        state.pending_outputs.insert(number);
        debug!(table = number, entries = mem.entry_count(), "level-0 table started");

        let result = MutexGuard::unlocked(state, || {
            build_level0_table(&self.dir, &self.table_cache, number, mem.as_ref())
        });
        state.pending_outputs.remove(&number);
        let meta = result?;

        let mut level = 0;
        let mut bytes = 0;
        if let Some(meta) = meta {
            if let Some(base) = base {
                level = base.pick_level_for_memtable_output(
                    meta.smallest.user_key(),
                    meta.largest.user_key(),
                    self.config.max_mem_compact_level,
                    state.versions.max_grandparent_overlap_bytes(),
                );
            }
            bytes = meta.file_size;
            info!(table = number, level, bytes, "flushed memtable");
            edit.add_file(level, meta);
        }
        state.stats[level].add(start.elapsed().as_micros() as u64, 0, bytes);
        Ok(())
    }

    // =========================================================================
    // Major Compaction
    // =========================================================================

    fn do_compaction_work(&self, state: &mut StateGuard<'_>, compact: &mut CompactionState) -> Result<()> {
        let start = Instant::now();
        info!(
            level = compact.compaction.level(),
            inputs = compact.compaction.num_input_files(0),
            next_level_inputs = compact.compaction.num_input_files(1),
            "compacting"
        );

        compact.smallest_snapshot = self
            .snapshots
            .oldest()
            .unwrap_or_else(|| state.versions.last_sequence());

        let result = MutexGuard::unlocked(state, || self.merge_inputs(compact));

        let output_level = compact.compaction.output_level();
        state.stats[output_level].add(
            start.elapsed().as_micros() as u64,
            compact.compaction.input_bytes(),
            compact.total_bytes,
        );
        result?;
        self.install_compaction_results(state, compact)
    }

    /// Merge the inputs into new tables; runs without the engine mutex
    fn merge_inputs(&self, compact: &mut CompactionState) -> Result<()> {
        let input = compact.compaction.input_iterator(&self.table_cache)?;
        let mut filter = KeyDropFilter::new(compact.smallest_snapshot);
        // Every version of a user key lands in the same output table, so a
        // roll waits for the next user key
        let mut roll_pending = false;
        let mut last_user_key: Vec<u8> = Vec::new();

        for entry in input {
            if self.shutting_down.load(Ordering::Acquire) {
                return Err(StrataError::ShuttingDown);
            }
            // A full memtable blocks writers; flush it before going on
            if self.has_imm.load(Ordering::Acquire) {
                let mut state = self.state.lock();
                if state.imm.is_some() {
                    self.compact_memtable(&mut state);
                    self.bg_cv.notify_all();
                }
            }

            let (key, value) = entry?;
            let stop_before = compact.compaction.should_stop_before(&key);
            if compact.builder.is_some() {
                roll_pending |= stop_before;
                if roll_pending && key.user_key() != last_user_key.as_slice() {
                    self.finish_compaction_output(compact)?;
                    roll_pending = false;
                }
            }

            let compaction = &compact.compaction;
            if filter.should_drop(&key, |user_key| compaction.is_base_level_for_key(user_key)) {
                continue;
            }

            if compact.builder.is_none() {
                self.open_compaction_output(compact)?;
            }
            if let Some(builder) = compact.builder.as_mut() {
                builder.add(&key, &value)?;
                if key.user_key() != last_user_key.as_slice() {
                    last_user_key.clear();
                    last_user_key.extend_from_slice(key.user_key());
                }
                if builder.file_size() >= compact.compaction.max_output_file_size() {
                    roll_pending = true;
                }
            }
        }

        if self.shutting_down.load(Ordering::Acquire) {
            return Err(StrataError::ShuttingDown);
        }
        if compact.builder.is_some() {
            self.finish_compaction_output(compact)?;
        }
        Ok(())
    }

    fn open_compaction_output(&self, compact: &mut CompactionState) -> Result<()> {
        let number = {
            let mut state = self.state.lock();
            let number = state.versions.new_file_number();
            state.pending_outputs.insert(number);
            number
        };
        compact.outputs.push(CompactionOutput {
            number,
            file_size: 0,
            smallest: None,
            largest: None,
        });
        compact.builder = Some(SSTableBuilder::new(&table_file_name(&self.dir, number))?);
        Ok(())
    }

    fn finish_compaction_output(&self, compact: &mut CompactionState) -> Result<()> {
        let Some(builder) = compact.builder.take() else {
            return Ok(());
        };
        let entries = builder.entry_count();
        let summary = builder.finish()?;

        let Some(output) = compact.outputs.last_mut() else {
            return Err(StrataError::Corruption("compaction output without a number".to_string()));
        };
        output.file_size = summary.file_size;
        output.smallest = summary.smallest;
        output.largest = summary.largest;
        compact.total_bytes += summary.file_size;

        if entries > 0 {
            self.table_cache.find_table(output.number)?;
            debug!(
                table = output.number,
                level = compact.compaction.output_level(),
                entries,
                bytes = summary.file_size,
                "generated table"
            );
        }
        Ok(())
    }

    fn install_compaction_results(&self, state: &mut StateGuard<'_>, compact: &mut CompactionState) -> Result<()> {
        let level = compact.compaction.level();
        let mut edit = std::mem::take(&mut compact.compaction.edit);
        compact.compaction.add_input_deletions(&mut edit);
        for output in &compact.outputs {
            if let (Some(smallest), Some(largest)) = (&output.smallest, &output.largest) {
                edit.add_file(
                    level + 1,
                    FileMetaData {
                        number: output.number,
                        file_size: output.file_size,
                        smallest: smallest.clone(),
                        largest: largest.clone(),
                    },
                );
            }
        }
        state.versions.log_and_apply(&mut edit)?;
        info!(
            inputs = compact.compaction.num_input_files(0),
            level,
            next_level_inputs = compact.compaction.num_input_files(1),
            bytes = compact.total_bytes,
            levels = %state.versions.level_summary(),
            "compacted"
        );
        Ok(())
    }

    /// Abandon an unfinished output and release the output numbers
    fn cleanup_compaction(&self, state: &mut EngineState, mut compact: CompactionState) {
        if let Some(builder) = compact.builder.take() {
            builder.abandon();
        }
        for output in &compact.outputs {
            state.pending_outputs.remove(&output.number);
        }
    }

    // =========================================================================
    // Manual Compaction
    // =========================================================================

    /// Hand a range compaction to the worker and wait until it is finished
    pub(crate) fn run_manual_compaction(
        &self,
        level: usize,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>> {
        if level + 1 >= NUM_LEVELS {
            return Err(StrataError::InvalidArgument(format!(
                "cannot compact level {}: no level below it",
                level
            )));
        }

        let mut state = self.state.lock();
        let id = state.next_manual_id;
        state.next_manual_id += 1;
        let mut manual = ManualCompaction {
            id,
            level,
            done: false,
            begin: begin.map(range_start),
            end: end.map(|key| InternalKey::new(key, 0, ValueType::Deletion)),
        };

        let mut installed = false;
        loop {
            if installed {
                if let Some(finished) = state.finished_manual.remove(&id) {
                    manual = finished;
                    installed = false;
                }
            }
            if manual.done
                || self.shutting_down.load(Ordering::Acquire)
                || state.bg_error.is_some()
            {
                break;
            }
            if !installed && state.manual_compaction.is_none() {
                state.manual_compaction = Some(manual.clone());
                installed = true;
                self.maybe_schedule_compaction(&mut state);
            } else {
                self.bg_cv.wait(&mut state);
            }
        }

        // Withdraw a request the worker never picked up
        if installed && state.manual_compaction.as_ref().map_or(false, |m| m.id == id) {
            state.manual_compaction = None;
        }
        state.finished_manual.remove(&id);

        if let Some(err) = &state.bg_error {
            return Err(err.clone());
        }
        if manual.done {
            Ok(None)
        } else {
            Ok(Some(
                manual
                    .begin
                    .map(InternalKey::into_user_key)
                    .unwrap_or_default(),
            ))
        }
    }

    // =========================================================================
    // Errors and File Cleanup
    // =========================================================================

    /// Remember the first background failure and wake every waiter
    pub(crate) fn record_background_error(&self, state: &mut EngineState, err: StrataError) {
        if state.bg_error.is_none() {
            warn!(error = %err, "background error; further writes will fail");
            state.bg_error = Some(StrataError::background(err));
            self.bg_cv.notify_all();
        }
    }

    /// Record a failed flush or merge; work cut short by shutdown is not a failure
    fn record_compaction_error(&self, state: &mut EngineState, err: StrataError) {
        if self.shutting_down.load(Ordering::Acquire) {
            debug!(error = %err, "background work interrupted by shutdown");
            return;
        }
        self.record_background_error(state, err);
    }

    /// Delete files that nothing references any more
    pub(crate) fn remove_obsolete_files(&self, state: &mut StateGuard<'_>) {
        if state.bg_error.is_some() {
            // After a failure it is unclear which new files are live
            return;
        }

        let mut live: HashSet<u64> = state.pending_outputs.clone();
        state.versions.add_live_files(&mut live);
        let files = match list_store_files(&self.dir) {
            Ok(files) => files,
            Err(err) => {
                warn!(error = %err, "cannot list store directory");
                return;
            }
        };

        let log_number = state.versions.log_number();
        let prev_log_number = state.versions.prev_log_number();
        let manifest_number = state.versions.manifest_file_number();

        let mut obsolete = Vec::new();
        for (number, kind, path) in files {
            let keep = match kind {
                FileType::Log | FileType::Map => number >= log_number || number == prev_log_number,
                FileType::Descriptor => number >= manifest_number,
                FileType::Table | FileType::Temp => live.contains(&number),
                FileType::Current | FileType::Lock => true,
            };
            if !keep {
                if kind == FileType::Table {
                    self.table_cache.evict(number);
                }
                obsolete.push((number, kind, path));
            }
        }
        if obsolete.is_empty() {
            return;
        }

        MutexGuard::unlocked(state, || {
            for (number, kind, path) in obsolete {
                match fs::remove_file(&path) {
                    Ok(()) => debug!(file = number, kind = ?kind, "deleted obsolete file"),
                    Err(err) => warn!(path = %path.display(), error = %err, "failed to delete obsolete file"),
                }
            }
        });
    }
}
