//! # StrataKV
//!
//! An embedded log-structured-merge key-value store with:
//! - Group commit: concurrent writers share one log append and fsync
//! - Write throttling when level 0 backs up
//! - Leveled background compaction with snapshot-aware garbage collection
//! - Crash recovery from the manifest and write-ahead log segments
//! - Snapshots and optimistic transactions
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │        Engine::write / OptimisticTransaction::commit         │
//! │                 (many concurrent writers)                    │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │            Writer Queue → Admission → Group Commit           │
//! │          (leader certifies, numbers and appends)             │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//!          ┌────────────┴────────────┐
//!          │                         │
//!          ▼                         ▼
//!   ┌─────────────┐          ┌─────────────┐
//!   │     WAL     │          │  MemTable   │──rotate──▶ immutable
//!   │  (Append)   │          │  (RwLock)   │                │
//!   └─────────────┘          └─────────────┘                ▼
//!                                                   ┌──────────────┐
//!                                                   │  Compaction  │
//!                                                   │   (worker)   │
//!                                                   └──────┬───────┘
//!                                                          ▼
//!                                            ┌─────────────────────────┐
//!                                            │ Levels 0..6 (SSTables)  │
//!                                            │  + MANIFEST / CURRENT   │
//!                                            └─────────────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;
pub mod types;
pub mod batch;

pub mod wal;
pub mod memtable;
pub mod storage;
pub mod engine;
pub mod txn;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use batch::WriteBatch;
pub use config::{Config, ConfigBuilder, MemTableKind, ReadOptions, WriteOptions};
pub use engine::{destroy_store, DbIterator, Engine, RecoveryReport, Snapshot};
pub use error::{Result, StrataError};
pub use txn::{OptimisticTransaction, OptimisticTransactionDb, TxnState};
pub use types::SequenceNumber;

// =============================================================================
// Version Info
// =============================================================================

/// Current version of StrataKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
