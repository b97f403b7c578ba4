//! Write path
//!
//! ## Group commit
//! ```text
//!   writers: [ W1 | W2 | W3 | W4 ... ]
//!              │
//!              └── leader: make room, fold W2..Wk into one batch,
//!                  append it to the log once, insert into the memtable,
//!                  then hand the shared result to every folded writer
//! ```
//! Only the head of the queue touches the log, so appends never interleave.
//! The mutex is released while the group is appended and applied; writers
//! arriving meanwhile queue up behind the group.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::batch::WriteBatch;
use crate::config::{MemTableKind, WriteOptions};
use crate::error::{Result, StrataError};
use crate::memtable::{MemTable, PersistentMemTable, VolatileMemTable};
use crate::storage::filename::{log_file_name, map_file_name};
use crate::types::{SequenceNumber, MAX_SEQUENCE_NUMBER};
use crate::wal::LogWriter;

use super::{DbInner, EngineState};

/// Smallest byte cap for one commit group
const MIN_GROUP_BYTES: usize = 1 << 20;

/// Headroom a group may add on top of the leader's own batch
const GROUP_HEADROOM_BYTES: usize = 128 << 10;

/// Byte cap for a group led by a batch of `leader_size` bytes
pub(crate) fn group_commit_limit(leader_size: usize) -> usize {
    MIN_GROUP_BYTES.max(leader_size + GROUP_HEADROOM_BYTES)
}

// =============================================================================
// Writers
// =============================================================================

/// What a queued writer wants done
pub(crate) enum WriteOp {
    /// Force a memtable rotation; carries no data and is never folded
    Barrier,
    Plain(WriteBatch),
    /// Applied only if `certifier` finds no conflicting write
    Certified {
        batch: WriteBatch,
        certifier: ConflictCertifier,
    },
}

impl WriteOp {
    fn batch(&self) -> Option<&WriteBatch> {
        match self {
            WriteOp::Barrier => None,
            WriteOp::Plain(batch) | WriteOp::Certified { batch, .. } => Some(batch),
        }
    }
}

/// Keys read by an optimistic transaction with the sequence each was read at
#[derive(Debug, Clone, Default)]
pub(crate) struct ConflictCertifier {
    keys: Vec<(Vec<u8>, SequenceNumber)>,
}

impl ConflictCertifier {
    pub(crate) fn new(keys: Vec<(Vec<u8>, SequenceNumber)>) -> Self {
        Self { keys }
    }
}

/// One queued write request
pub(crate) struct Writer {
    op: WriteOp,
    sync: bool,
    cv: Condvar,
    /// Set by the leader that committed (or rejected) this writer
    outcome: Mutex<Option<Result<()>>>,
}

impl Writer {
    fn new(op: WriteOp, sync: bool) -> Self {
        Self {
            op,
            sync,
            cv: Condvar::new(),
            outcome: Mutex::new(None),
        }
    }

    fn complete(&self, result: Result<()>) {
        *self.outcome.lock() = Some(result);
        self.cv.notify_one();
    }

    fn take_outcome(&self) -> Option<Result<()>> {
        self.outcome.lock().take()
    }
}

/// Batches folded together by one leader
struct BatchGroup {
    batch: WriteBatch,
    last_writer: Arc<Writer>,
    /// Follower whose certifier failed while folding, with its error
    rejected: Option<(Arc<Writer>, StrataError)>,
}

type StateGuard<'a> = MutexGuard<'a, EngineState>;

impl DbInner {
    // =========================================================================
    // Commit
    // =========================================================================

    pub(crate) fn write(&self, options: &WriteOptions, op: WriteOp) -> Result<()> {
        let writer = Arc::new(Writer::new(op, options.sync));
        let mut state = self.state.lock();
        state.writers.push_back(Arc::clone(&writer));

        // Wait until an earlier leader commits us or we reach the head
        loop {
            if let Some(result) = writer.take_outcome() {
                return result;
            }
            if state
                .writers
                .front()
                .map_or(false, |head| Arc::ptr_eq(head, &writer))
            {
                break;
            }
            writer.cv.wait(&mut state);
        }

        let force = matches!(writer.op, WriteOp::Barrier);
        let mut status = self.make_room_for_write(&mut state, force);
        if status.is_ok() {
            if let WriteOp::Certified { certifier, .. } = &writer.op {
                status = self.certify(&state, certifier, None);
            }
        }

        let mut last_writer = Arc::clone(&writer);
        let mut rejected = None;
        if status.is_ok() && writer.op.batch().is_some() {
            let group = self.build_batch_group(&state, &writer);
            last_writer = group.last_writer;
            rejected = group.rejected;
            status = self.commit_group(&mut state, group.batch, writer.sync);
        }

        // Hand the result to every writer folded into the group
        while let Some(ready) = state.writers.pop_front() {
            let is_last = Arc::ptr_eq(&ready, &last_writer);
            if !Arc::ptr_eq(&ready, &writer) {
                ready.complete(status.clone());
            }
            if is_last {
                break;
            }
        }
        if let Some((follower, err)) = rejected {
            if state
                .writers
                .front()
                .map_or(false, |head| Arc::ptr_eq(head, &follower))
            {
                state.writers.pop_front();
            }
            follower.complete(Err(err));
        }
        if let Some(head) = state.writers.front() {
            head.cv.notify_one();
        }
        status
    }

    /// Number the group, append it to the log and apply it to the memtable
    fn commit_group(&self, state: &mut StateGuard<'_>, mut batch: WriteBatch, sync: bool) -> Result<()> {
        let last_sequence = state.versions.last_sequence();
        batch.set_sequence(last_sequence + 1);
        let new_last_sequence = last_sequence + u64::from(batch.count());
        let mem = Arc::clone(&state.mem);

        let result = MutexGuard::unlocked(state, || -> Result<()> {
            if !mem.is_persistent() {
                let mut log = self.log.lock();
                let log = log.as_mut().ok_or_else(|| {
                    StrataError::Corruption("no log segment behind the active memtable".to_string())
                })?;
                log.add_record(batch.contents())?;
                if sync {
                    log.sync()?;
                }
            }
            batch.insert_into(&*mem)?;
            if sync && mem.is_persistent() {
                mem.sync()?;
            }
            Ok(())
        });

        match result {
            Ok(()) => {
                state.versions.set_last_sequence(new_last_sequence);
                Ok(())
            }
            Err(err) => {
                // The log or memtable may now hold part of the group
                self.record_background_error(state, err.clone());
                Err(err)
            }
        }
    }

    /// Fold queued followers into the leader's batch.
    ///
    /// Stops at the first follower that wants a sync the leader won't do, a
    /// barrier, one that would push the group past its byte cap, or one whose
    /// certifier fails.
    fn build_batch_group(&self, state: &EngineState, leader: &Arc<Writer>) -> BatchGroup {
        let mut group = BatchGroup {
            batch: leader.op.batch().cloned().unwrap_or_default(),
            last_writer: Arc::clone(leader),
            rejected: None,
        };
        let mut size = group.batch.approximate_size();
        let max_size = group_commit_limit(size);

        for follower in state.writers.iter().skip(1) {
            if follower.sync && !leader.sync {
                break;
            }
            let Some(batch) = follower.op.batch() else {
                break;
            };
            size += batch.approximate_size();
            if size > max_size {
                break;
            }
            if let WriteOp::Certified { certifier, .. } = &follower.op {
                if let Err(err) = self.certify(state, certifier, Some(&group.batch)) {
                    group.rejected = Some((Arc::clone(follower), err));
                    break;
                }
            }
            group.batch.append(batch);
            group.last_writer = Arc::clone(follower);
        }

        if !Arc::ptr_eq(&group.last_writer, leader) {
            debug!(
                bytes = group.batch.approximate_size(),
                records = group.batch.count(),
                "built commit group"
            );
        }
        group
    }

    // =========================================================================
    // Conflict Checking
    // =========================================================================

    /// Fail if any tracked key was written after the sequence it was read at.
    ///
    /// `group` holds batches already folded ahead of this writer; touching one
    /// of their keys is a conflict too.
    pub(crate) fn certify(
        &self,
        state: &EngineState,
        certifier: &ConflictCertifier,
        group: Option<&WriteBatch>,
    ) -> Result<()> {
        if certifier.keys.is_empty() {
            return Ok(());
        }
        let earliest = state.earliest_memtable_sequence();
        for (key, tracked) in &certifier.keys {
            if earliest == MAX_SEQUENCE_NUMBER || *tracked < earliest {
                return Err(StrataError::TryAgain(format!(
                    "memtable history starts after sequence {}; cannot check for conflicts",
                    tracked
                )));
            }
            if group.map_or(false, |batch| batch.touches(key)) {
                return Err(StrataError::Busy(
                    "write conflict with a batch in the same commit group".to_string(),
                ));
            }
            if let Some(latest) = state.latest_sequence_for_key(key, *tracked) {
                if latest > *tracked {
                    return Err(StrataError::Busy(format!(
                        "write conflict: key written at sequence {} after {}",
                        latest, tracked
                    )));
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Admission Control
    // =========================================================================

    /// Make sure the active memtable can take the next group.
    ///
    /// Delays the writer once when level 0 nears its limit, waits for a
    /// pending flush or for level 0 to drain, and otherwise rotates the
    /// memtable. `force` rotates even when there is room.
    fn make_room_for_write(&self, state: &mut StateGuard<'_>, mut force: bool) -> Result<()> {
        let mut allow_delay = !force;
        loop {
            if let Some(err) = &state.bg_error {
                return Err(err.clone());
            }

            let level0_files = state.versions.num_level_files(0);
            if allow_delay && level0_files >= self.config.level0_slowdown_writes_trigger {
                // Spread the stall out over many writes instead of one long wait
                MutexGuard::unlocked(state, || thread::sleep(Duration::from_millis(1)));
                allow_delay = false;
            } else if !force
                && state.mem.approximate_memory_usage() <= state.write_buffer_budget(&self.config)
            {
                break;
            } else if state.imm.is_some() {
                debug!("memtable full; waiting for flush");
                self.bg_cv.wait(state);
            } else if level0_files >= self.config.level0_stop_writes_trigger {
                info!(level0_files, "too many level-0 files; waiting");
                self.bg_cv.wait(state);
            } else {
                self.rotate_memtable(state)?;
                force = false;
            }
        }
        Ok(())
    }

    /// Swap in a new active memtable and queue the old one for flushing
    fn rotate_memtable(&self, state: &mut StateGuard<'_>) -> Result<()> {
        let number = state.versions.new_file_number();
        let earliest = state.versions.last_sequence();

        let (mem, log): (Arc<dyn MemTable>, Option<LogWriter>) = match self.config.memtable_kind {
            MemTableKind::Volatile => match LogWriter::create(&log_file_name(&self.dir, number)) {
                Ok(log) => (Arc::new(VolatileMemTable::new(earliest)), Some(log)),
                Err(err) => {
                    state.versions.reuse_file_number(number);
                    return Err(err);
                }
            },
            MemTableKind::Persistent => {
                match PersistentMemTable::create(&map_file_name(&self.dir, number), earliest) {
                    Ok(map) => (Arc::new(map), None),
                    Err(err) => {
                        state.versions.reuse_file_number(number);
                        return Err(err);
                    }
                }
            }
        };

        *self.log.lock() = log;
        state.logfile_number = number;
        let old = std::mem::replace(&mut state.mem, mem);
        debug!(
            segment = number,
            entries = old.entry_count(),
            bytes = old.approximate_memory_usage(),
            "rotated memtable"
        );
        state.imm = Some(old);
        self.has_imm.store(true, Ordering::Release);
        self.maybe_schedule_compaction(state);
        Ok(())
    }
}
