//! Tests for optimistic transactions
//!
//! These tests verify:
//! - Buffered writes are invisible until commit and applied atomically
//! - Reads inside a transaction see its own writes first
//! - Commits fail with Busy when a tracked key changed underneath
//! - Commits fail with TryAgain when memtable history is too short
//! - State transitions and reuse after reinitialize

use std::sync::{Arc, Barrier};
use std::thread;

use stratakv::config::{Config, ReadOptions, WriteOptions};
use stratakv::{OptimisticTransactionDb, StrataError, TxnState};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_db() -> (TempDir, OptimisticTransactionDb) {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder().data_dir(temp_dir.path()).build();
    let db = OptimisticTransactionDb::open(config).unwrap();
    (temp_dir, db)
}

// =============================================================================
// Basic Commit Tests
// =============================================================================

#[test]
fn test_commit_applies_buffered_writes() {
    let (_temp, db) = setup_temp_db();
    db.put(b"old", b"x").unwrap();

    let mut txn = db.begin_transaction(WriteOptions::default());
    txn.put(b"a", b"1").unwrap();
    txn.put(b"b", b"2").unwrap();
    txn.delete(b"old").unwrap();
    assert_eq!(txn.num_puts(), 2);
    assert_eq!(txn.num_deletes(), 1);

    // Nothing visible before commit
    assert_eq!(db.get(b"a").unwrap(), None);
    assert_eq!(db.get(b"old").unwrap(), Some(b"x".to_vec()));

    txn.commit().unwrap();
    assert_eq!(txn.state(), TxnState::Committed);
    assert_eq!(db.get(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(db.get(b"b").unwrap(), Some(b"2".to_vec()));
    assert_eq!(db.get(b"old").unwrap(), None);
    assert_eq!(db.latest_sequence_number(), 4);
}

#[test]
fn test_empty_commit_succeeds() {
    let (_temp, db) = setup_temp_db();
    let mut txn = db.begin_transaction(WriteOptions::default());
    txn.commit().unwrap();
    assert_eq!(db.latest_sequence_number(), 0);
}

#[test]
fn test_sync_commit() {
    let (_temp, db) = setup_temp_db();
    let mut txn = db.begin_transaction(WriteOptions::sync());
    txn.put(b"k", b"v").unwrap();
    txn.commit().unwrap();
    assert_eq!(db.get(b"k").unwrap(), Some(b"v".to_vec()));
}

#[test]
fn test_read_your_own_writes() {
    let (_temp, db) = setup_temp_db();
    db.put(b"shared", b"base").unwrap();
    db.put(b"doomed", b"base").unwrap();

    let mut txn = db.begin_transaction(WriteOptions::default());
    let read = ReadOptions::default();
    assert_eq!(txn.get(&read, b"shared").unwrap(), Some(b"base".to_vec()));

    txn.put(b"shared", b"mine").unwrap();
    txn.delete(b"doomed").unwrap();
    assert_eq!(txn.get(&read, b"shared").unwrap(), Some(b"mine".to_vec()));
    assert_eq!(txn.get(&read, b"doomed").unwrap(), None);
    assert_eq!(db.get(b"doomed").unwrap(), Some(b"base".to_vec()));
}

#[test]
fn test_rollback_discards_writes() {
    let (_temp, db) = setup_temp_db();

    let mut txn = db.begin_transaction(WriteOptions::default());
    txn.put(b"a", b"1").unwrap();
    txn.rollback().unwrap();

    assert_eq!(txn.state(), TxnState::Aborted);
    assert!(txn.tracked_keys().is_empty());
    assert_eq!(db.get(b"a").unwrap(), None);
    assert_eq!(db.latest_sequence_number(), 0);
}

#[test]
fn test_dropped_transaction_writes_nothing() {
    let (_temp, db) = setup_temp_db();
    {
        let mut txn = db.begin_transaction(WriteOptions::default());
        txn.put(b"a", b"1").unwrap();
    }
    assert_eq!(db.get(b"a").unwrap(), None);
}

// =============================================================================
// Conflict Tests
// =============================================================================

#[test]
fn test_conflicting_write_aborts_commit() {
    let (_temp, db) = setup_temp_db();

    let mut txn = db.begin_transaction(WriteOptions::default());
    txn.put(b"foo", b"x").unwrap();
    db.put(b"foo", b"y").unwrap();

    let err = txn.commit().err().unwrap();
    assert!(err.is_busy());
    assert_eq!(txn.state(), TxnState::Aborted);
    assert_eq!(db.get(b"foo").unwrap(), Some(b"y".to_vec()));
}

#[test]
fn test_write_to_untracked_key_does_not_conflict() {
    let (_temp, db) = setup_temp_db();

    let mut txn = db.begin_transaction(WriteOptions::default());
    txn.put(b"mine", b"x").unwrap();
    db.put(b"theirs", b"y").unwrap();

    txn.commit().unwrap();
    assert_eq!(db.get(b"mine").unwrap(), Some(b"x".to_vec()));
}

#[test]
fn test_get_for_update_tracks_reads() {
    let (_temp, db) = setup_temp_db();
    db.put(b"balance", b"100").unwrap();

    let mut txn = db.begin_transaction(WriteOptions::default());
    let read = ReadOptions::default();
    let balance = txn.get_for_update(&read, b"balance", true).unwrap();
    assert_eq!(balance, Some(b"100".to_vec()));
    txn.put(b"audit", b"read 100").unwrap();

    // Someone else changes the key that was read
    db.put(b"balance", b"50").unwrap();

    assert!(txn.validate().unwrap_err().is_busy());
    assert!(txn.commit().unwrap_err().is_busy());
    assert_eq!(db.get(b"audit").unwrap(), None);
}

#[test]
fn test_plain_get_is_not_tracked() {
    let (_temp, db) = setup_temp_db();
    db.put(b"k", b"1").unwrap();

    let mut txn = db.begin_transaction(WriteOptions::default());
    txn.get(&ReadOptions::default(), b"k").unwrap();
    txn.put(b"other", b"v").unwrap();
    db.put(b"k", b"2").unwrap();

    txn.commit().unwrap();
}

#[test]
fn test_snapshot_tracks_from_snapshot_sequence() {
    let (_temp, db) = setup_temp_db();

    let mut txn = db.begin_transaction(WriteOptions::default());
    txn.set_snapshot();
    let pinned = txn.snapshot().unwrap().sequence();

    // Written after the snapshot but before the key is touched
    db.put(b"key", b"theirs").unwrap();
    txn.put(b"key", b"mine").unwrap();
    assert_eq!(txn.tracked_keys().get(b"key").unwrap().seq, pinned);

    assert!(txn.commit().unwrap_err().is_busy());
    assert_eq!(db.get(b"key").unwrap(), Some(b"theirs".to_vec()));
}

#[test]
fn test_without_snapshot_tracks_at_first_touch() {
    let (_temp, db) = setup_temp_db();

    let mut txn = db.begin_transaction(WriteOptions::default());
    db.put(b"key", b"theirs").unwrap();
    txn.put(b"key", b"mine").unwrap();

    txn.commit().unwrap();
    assert_eq!(db.get(b"key").unwrap(), Some(b"mine".to_vec()));
}

#[test]
fn test_two_transactions_same_key_first_wins() {
    let (_temp, db) = setup_temp_db();

    let mut t1 = db.begin_transaction(WriteOptions::default());
    let mut t2 = db.begin_transaction(WriteOptions::default());
    t1.put(b"k", b"one").unwrap();
    t2.put(b"k", b"two").unwrap();

    t1.commit().unwrap();
    assert!(t2.commit().unwrap_err().is_busy());
    assert_eq!(db.get(b"k").unwrap(), Some(b"one".to_vec()));
}

#[test]
fn test_concurrent_increments_never_lose_updates() {
    let (_temp, db) = setup_temp_db();
    db.put(b"counter", &0u64.to_le_bytes()).unwrap();
    let db = Arc::new(db);
    let threads = 4;
    let per_thread = 25;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let db = Arc::clone(&db);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let mut done = 0;
                while done < per_thread {
                    let mut txn = db.begin_transaction(WriteOptions::default());
                    let read = ReadOptions::default();
                    let raw = txn.get_for_update(&read, b"counter", true).unwrap().unwrap();
                    let value = u64::from_le_bytes(raw.as_slice().try_into().unwrap());
                    txn.put(b"counter", &(value + 1).to_le_bytes()).unwrap();
                    match txn.commit() {
                        Ok(()) => done += 1,
                        Err(err) => assert!(err.is_busy() || err.is_try_again()),
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let raw = db.get(b"counter").unwrap().unwrap();
    let value = u64::from_le_bytes(raw.as_slice().try_into().unwrap());
    assert_eq!(value, (threads * per_thread) as u64);
}

// =============================================================================
// History Window Tests
// =============================================================================

#[test]
fn test_try_again_when_memtable_history_flushed() {
    let (_temp, db) = setup_temp_db();

    let mut txn = db.begin_transaction(WriteOptions::default());
    txn.put(b"k", b"mine").unwrap();

    // Writes after the key was tracked, then flushed out of the memtables
    db.put(b"unrelated", b"x").unwrap();
    db.flush().unwrap();

    let err = txn.commit().err().unwrap();
    assert!(err.is_try_again());
    assert_eq!(txn.state(), TxnState::Aborted);
    assert_eq!(db.get(b"k").unwrap(), None);
}

#[test]
fn test_flush_without_new_writes_keeps_history() {
    let (_temp, db) = setup_temp_db();
    db.put(b"k", b"base").unwrap();

    let mut txn = db.begin_transaction(WriteOptions::default());
    txn.put(b"k", b"mine").unwrap();
    db.flush().unwrap();

    // The new memtable starts exactly at the tracked sequence
    txn.commit().unwrap();
    assert_eq!(db.get(b"k").unwrap(), Some(b"mine".to_vec()));
}

// =============================================================================
// State Tests
// =============================================================================

#[test]
fn test_operations_after_commit_rejected() {
    let (_temp, db) = setup_temp_db();

    let mut txn = db.begin_transaction(WriteOptions::default());
    txn.put(b"a", b"1").unwrap();
    txn.commit().unwrap();

    assert!(matches!(txn.put(b"b", b"2"), Err(StrataError::InvalidArgument(_))));
    assert!(matches!(txn.commit(), Err(StrataError::InvalidArgument(_))));
    assert!(matches!(txn.rollback(), Err(StrataError::InvalidArgument(_))));
    assert!(matches!(
        txn.get(&ReadOptions::default(), b"a"),
        Err(StrataError::InvalidArgument(_))
    ));
}

#[test]
fn test_reinitialize_after_abort() {
    let (_temp, db) = setup_temp_db();

    let mut txn = db.begin_transaction(WriteOptions::default());
    txn.put(b"k", b"first").unwrap();
    db.put(b"k", b"other").unwrap();
    assert!(txn.commit().is_err());

    txn.reinitialize(WriteOptions::default());
    assert_eq!(txn.state(), TxnState::Active);
    assert!(txn.snapshot().is_none());
    assert_eq!(txn.num_puts(), 0);

    txn.put(b"k", b"second").unwrap();
    txn.commit().unwrap();
    assert_eq!(db.get(b"k").unwrap(), Some(b"second".to_vec()));
}

#[test]
fn test_into_inner_returns_engine() {
    let (_temp, db) = setup_temp_db();
    db.put(b"k", b"v").unwrap();
    let engine = db.into_inner();
    assert_eq!(engine.get(b"k").unwrap(), Some(b"v".to_vec()));
}
