//! One optimistic transaction

use tracing::debug;

use crate::batch::WriteBatch;
use crate::config::{ReadOptions, WriteOptions};
use crate::engine::{ConflictCertifier, Engine, Snapshot};
use crate::error::{Result, StrataError};
use crate::types::{EntryValue, SequenceNumber};

use super::lock_tracker::{PointLockRequest, PointLockTracker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Committing,
    Committed,
    Aborted,
}

/// Buffered writes plus the keys they depend on, certified at commit
pub struct OptimisticTransaction<'a> {
    engine: &'a Engine,
    write_options: WriteOptions,
    batch: WriteBatch,
    tracker: PointLockTracker,
    /// Read view set by `set_snapshot`; keys are tracked at its sequence
    snapshot: Option<Snapshot>,
    num_puts: usize,
    num_deletes: usize,
    state: TxnState,
}

impl<'a> OptimisticTransaction<'a> {
    pub(crate) fn new(engine: &'a Engine, write_options: WriteOptions) -> Self {
        Self {
            engine,
            write_options,
            batch: WriteBatch::new(),
            tracker: PointLockTracker::new(),
            snapshot: None,
            num_puts: 0,
            num_deletes: 0,
            state: TxnState::Active,
        }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.ensure_active()?;
        self.track(key, false, true);
        self.batch.put(key, value);
        self.num_puts += 1;
        Ok(())
    }

    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.ensure_active()?;
        self.track(key, false, true);
        self.batch.delete(key);
        self.num_deletes += 1;
        Ok(())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Read `key`, seeing this transaction's own buffered writes first
    pub fn get(&self, options: &ReadOptions<'_>, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.ensure_active()?;
        match self.batch.get(key)? {
            Some(EntryValue::Value(value)) => Ok(Some(value)),
            Some(EntryValue::Tombstone) => Ok(None),
            None => self.engine.get_with_options(options, key),
        }
    }

    /// Read `key` and make the commit depend on it not changing
    pub fn get_for_update(
        &mut self,
        options: &ReadOptions<'_>,
        key: &[u8],
        exclusive: bool,
    ) -> Result<Option<Vec<u8>>> {
        self.ensure_active()?;
        self.track(key, true, exclusive);
        self.get(options, key)
    }

    /// Pin the current state; keys touched from now on are tracked at it
    pub fn set_snapshot(&mut self) {
        self.snapshot = Some(self.engine.get_snapshot());
    }

    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_ref()
    }

    // =========================================================================
    // Commit / Rollback
    // =========================================================================

    /// Write the buffered batch if no tracked key changed since it was observed.
    ///
    /// Fails with `Busy` on a conflict and `TryAgain` when the memtables no
    /// longer hold enough history to tell. Either way nothing is written and
    /// the transaction ends up `Aborted`.
    pub fn commit(&mut self) -> Result<()> {
        self.ensure_active()?;
        self.state = TxnState::Committing;

        let certifier = self.certifier();
        let batch = std::mem::take(&mut self.batch);
        let result = self
            .engine
            .write_certified(&self.write_options, batch, certifier);

        self.clear();
        match &result {
            Ok(()) => self.state = TxnState::Committed,
            Err(err) => {
                debug!(error = %err, "transaction aborted");
                self.state = TxnState::Aborted;
            }
        }
        result
    }

    /// Drop buffered writes and tracked keys without touching the store
    pub fn rollback(&mut self) -> Result<()> {
        self.ensure_active()?;
        self.clear();
        self.state = TxnState::Aborted;
        Ok(())
    }

    /// Check the tracked keys for conflicts now, without committing
    pub fn validate(&self) -> Result<()> {
        self.ensure_active()?;
        self.engine.check_conflicts(&self.certifier())
    }

    /// Make the transaction reusable with fresh state
    pub fn reinitialize(&mut self, write_options: WriteOptions) {
        self.write_options = write_options;
        self.clear();
        self.snapshot = None;
        self.state = TxnState::Active;
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn state(&self) -> TxnState {
        self.state
    }

    pub fn num_puts(&self) -> usize {
        self.num_puts
    }

    pub fn num_deletes(&self) -> usize {
        self.num_deletes
    }

    pub fn tracked_keys(&self) -> &PointLockTracker {
        &self.tracker
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn ensure_active(&self) -> Result<()> {
        if self.state == TxnState::Active {
            Ok(())
        } else {
            Err(StrataError::InvalidArgument(format!(
                "transaction is {:?}, not active",
                self.state
            )))
        }
    }

    fn track(&mut self, key: &[u8], read_only: bool, exclusive: bool) {
        let seq = self.tracking_sequence();
        self.tracker.track(PointLockRequest {
            key: key.to_vec(),
            seq,
            read_only,
            exclusive,
        });
    }

    fn tracking_sequence(&self) -> SequenceNumber {
        match &self.snapshot {
            Some(snapshot) => snapshot.sequence(),
            None => self.engine.latest_sequence_number(),
        }
    }

    fn certifier(&self) -> ConflictCertifier {
        ConflictCertifier::new(self.tracker.tracked_sequences())
    }

    fn clear(&mut self) {
        self.batch.clear();
        self.tracker.clear();
        self.num_puts = 0;
        self.num_deletes = 0;
    }
}
