//! Optimistic Transactions
//!
//! ## Responsibilities
//! - Buffer a transaction's writes in a private batch
//! - Track every key the transaction reads for update or writes, with the
//!   sequence number it was observed at
//! - Certify at commit, inside the write queue, that no tracked key was
//!   written by anyone else since it was observed
//!
//! ## Lifecycle
//! ```text
//!   Active ──commit──▶ Committing ──▶ Committed
//!     │                     └──────▶ Aborted (Busy / TryAgain / I/O)
//!     └──rollback──▶ Aborted
//!   any state ──reinitialize──▶ Active
//! ```
//!
//! Conflicts are detected only against the memtables. When they no longer
//! reach back to a tracked sequence the commit fails with `TryAgain`.

mod lock_tracker;
mod transaction;

use std::ops::Deref;

pub use lock_tracker::{PointLockRequest, PointLockStatus, PointLockTracker, TrackedKeyInfo};
pub use transaction::{OptimisticTransaction, TxnState};

use crate::config::{Config, WriteOptions};
use crate::engine::Engine;
use crate::error::Result;

/// An engine that hands out optimistic transactions
pub struct OptimisticTransactionDb {
    engine: Engine,
}

impl OptimisticTransactionDb {
    pub fn open(config: Config) -> Result<Self> {
        Ok(Self {
            engine: Engine::open(config)?,
        })
    }

    pub fn from_engine(engine: Engine) -> Self {
        Self { engine }
    }

    /// Start a transaction whose commit uses `write_options`
    pub fn begin_transaction(&self, write_options: WriteOptions) -> OptimisticTransaction<'_> {
        OptimisticTransaction::new(&self.engine, write_options)
    }

    /// The underlying engine, for non-transactional reads and writes
    pub fn base_db(&self) -> &Engine {
        &self.engine
    }

    pub fn into_inner(self) -> Engine {
        self.engine
    }
}

impl Deref for OptimisticTransactionDb {
    type Target = Engine;

    fn deref(&self) -> &Engine {
        &self.engine
    }
}
