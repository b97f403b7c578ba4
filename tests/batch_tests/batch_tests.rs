//! Tests for WriteBatch and internal key ordering
//!
//! These tests verify:
//! - Records decode in insertion order with their sequence numbers
//! - Appending batches concatenates records and counts
//! - Malformed log payloads are reported as corruption
//! - Internal keys order newest-first within a user key

use stratakv::batch::{BatchRecord, BATCH_HEADER_SIZE};
use stratakv::memtable::{MemTable, VolatileMemTable};
use stratakv::types::{EntryValue, InternalKey, ValueType, MAX_SEQUENCE_NUMBER};
use stratakv::WriteBatch;

// =============================================================================
// WriteBatch Tests
// =============================================================================

#[test]
fn test_new_batch_is_empty() {
    let batch = WriteBatch::new();
    assert!(batch.is_empty());
    assert_eq!(batch.count(), 0);
    assert_eq!(batch.sequence(), 0);
    assert_eq!(batch.approximate_size(), BATCH_HEADER_SIZE);
    assert_eq!(batch.iter().count(), 0);
}

#[test]
fn test_records_in_insertion_order() {
    let mut batch = WriteBatch::new();
    batch.put(b"b", b"2");
    batch.delete(b"a");
    batch.put(b"a", b"1");

    let records: Vec<BatchRecord<'_>> = batch.iter().map(|r| r.unwrap()).collect();
    assert_eq!(
        records,
        vec![
            BatchRecord::Put { key: b"b", value: b"2" },
            BatchRecord::Delete { key: b"a" },
            BatchRecord::Put { key: b"a", value: b"1" },
        ]
    );
    assert_eq!(batch.count(), 3);
}

#[test]
fn test_header_layout() {
    let mut batch = WriteBatch::new();
    batch.put(b"k", b"v");
    batch.set_sequence(0x0102030405060708);

    let contents = batch.contents();
    assert_eq!(&contents[..8], &0x0102030405060708u64.to_le_bytes());
    assert_eq!(&contents[8..12], &1u32.to_le_bytes());
    // Kind, key length, key, value length, value
    assert_eq!(contents[12], ValueType::Value as u8);
    assert_eq!(contents.len(), BATCH_HEADER_SIZE + 1 + 4 + 1 + 4 + 1);
}

#[test]
fn test_append_concatenates() {
    let mut first = WriteBatch::new();
    first.put(b"a", b"1");
    let mut second = WriteBatch::new();
    second.delete(b"b");
    second.put(b"c", b"3");

    first.append(&second);
    assert_eq!(first.count(), 3);
    let keys: Vec<&[u8]> = first.iter().map(|r| r.unwrap().key()).collect();
    assert_eq!(keys, vec![b"a".as_slice(), b"b".as_slice(), b"c".as_slice()]);
}

#[test]
fn test_clear_resets_records_and_header() {
    let mut batch = WriteBatch::new();
    batch.put(b"a", b"1");
    batch.set_sequence(9);
    batch.clear();
    assert_eq!(batch, WriteBatch::new());
}

#[test]
fn test_get_returns_latest_buffered_write() {
    let mut batch = WriteBatch::new();
    batch.put(b"k", b"1");
    batch.put(b"k", b"2");
    assert_eq!(batch.get(b"k").unwrap(), Some(EntryValue::Value(b"2".to_vec())));

    batch.delete(b"k");
    assert_eq!(batch.get(b"k").unwrap(), Some(EntryValue::Tombstone));
    assert_eq!(batch.get(b"other").unwrap(), None);
    assert!(batch.touches(b"k"));
    assert!(!batch.touches(b"other"));
}

#[test]
fn test_insert_numbers_records_from_header() {
    let mut batch = WriteBatch::new();
    batch.put(b"a", b"1");
    batch.delete(b"a");
    batch.put(b"b", b"2");
    batch.set_sequence(10);

    let mem = VolatileMemTable::new(9);
    batch.insert_into(&mem).unwrap();

    assert_eq!(mem.max_sequence(), 12);
    assert_eq!(mem.get(b"a", 10).unwrap().into_value(), Some(b"1".to_vec()));
    assert_eq!(mem.get(b"a", 11).unwrap().value, EntryValue::Tombstone);
    assert_eq!(mem.get(b"b", 12).unwrap().sequence, 12);
}

#[test]
fn test_round_trip_through_contents() {
    let mut batch = WriteBatch::new();
    batch.put(b"key", &[0u8, 255, 7]);
    batch.set_sequence(42);

    let decoded = WriteBatch::from_contents(batch.contents().to_vec()).unwrap();
    assert_eq!(decoded, batch);
}

// =============================================================================
// Corruption Tests
// =============================================================================

#[test]
fn test_short_payload_rejected() {
    let err = WriteBatch::from_contents(vec![0u8; 5]).unwrap_err();
    assert!(err.is_corruption());
}

#[test]
fn test_count_larger_than_records() {
    let mut batch = WriteBatch::new();
    batch.put(b"a", b"1");
    let mut contents = batch.contents().to_vec();
    contents[8..12].copy_from_slice(&2u32.to_le_bytes());

    let batch = WriteBatch::from_contents(contents).unwrap();
    let results: Vec<_> = batch.iter().collect();
    assert_eq!(results.len(), 2);
    assert!(results[0].is_ok());
    assert!(results[1].as_ref().unwrap_err().is_corruption());
}

#[test]
fn test_trailing_bytes_rejected() {
    let mut batch = WriteBatch::new();
    batch.put(b"a", b"1");
    let mut contents = batch.contents().to_vec();
    contents.push(0xAA);

    let batch = WriteBatch::from_contents(contents).unwrap();
    assert!(batch.iter().any(|r| r.is_err()));

    let mem = VolatileMemTable::new(0);
    assert!(batch.insert_into(&mem).is_err());
}

#[test]
fn test_truncated_slice_rejected() {
    let mut batch = WriteBatch::new();
    batch.put(b"key", b"value");
    let mut contents = batch.contents().to_vec();
    contents.truncate(contents.len() - 2);

    let batch = WriteBatch::from_contents(contents).unwrap();
    let first = batch.iter().next().unwrap();
    assert!(first.unwrap_err().is_corruption());
}

// =============================================================================
// InternalKey Ordering Tests
// =============================================================================

#[test]
fn test_internal_key_order() {
    let mut keys = vec![
        InternalKey::new(b"b".to_vec(), 1, ValueType::Value),
        InternalKey::new(b"a".to_vec(), 1, ValueType::Value),
        InternalKey::new(b"a".to_vec(), 5, ValueType::Deletion),
        InternalKey::new(b"a".to_vec(), 5, ValueType::Value),
    ];
    keys.sort();

    assert_eq!(keys[0], InternalKey::new(b"a".to_vec(), 5, ValueType::Value));
    assert_eq!(keys[1], InternalKey::new(b"a".to_vec(), 5, ValueType::Deletion));
    assert_eq!(keys[2], InternalKey::new(b"a".to_vec(), 1, ValueType::Value));
    assert_eq!(keys[3], InternalKey::new(b"b".to_vec(), 1, ValueType::Value));
}

#[test]
fn test_seek_key_sorts_before_visible_entries() {
    let seek = InternalKey::seek_key(b"k", 7);
    assert!(seek <= InternalKey::new(b"k".to_vec(), 7, ValueType::Value));
    assert!(seek < InternalKey::new(b"k".to_vec(), 6, ValueType::Deletion));
    assert!(seek > InternalKey::new(b"k".to_vec(), 8, ValueType::Value));

    let start = InternalKey::seek_key(b"k", MAX_SEQUENCE_NUMBER);
    assert!(start < InternalKey::new(b"k".to_vec(), MAX_SEQUENCE_NUMBER - 1, ValueType::Value));
}

#[test]
fn test_internal_key_encoding() {
    let key = InternalKey::new(b"user".to_vec(), 300, ValueType::Deletion);
    let encoded = key.encode();
    assert_eq!(encoded.len(), key.encoded_len());
    assert_eq!(InternalKey::decode(&encoded).unwrap(), key);

    assert!(InternalKey::decode(b"short").unwrap_err().is_corruption());
}
