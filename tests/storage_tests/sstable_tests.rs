//! Tests for SSTable implementation
//!
//! These tests verify:
//! - Table creation in internal-key order
//! - Snapshot-bounded lookups via the in-memory index
//! - Tombstone handling
//! - Iterator over all entries
//! - Key range filtering
//! - File format validation

use std::fs;
use std::path::PathBuf;

use stratakv::storage::{build_table, SSTableBuilder, SSTableReader, TableSummary};
use stratakv::types::{EntryValue, InternalKey, ValueType, MAX_SEQUENCE_NUMBER};
use stratakv::Result;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_sstable() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("000005.sst");
    (temp_dir, path)
}

fn put(key: &str, sequence: u64) -> InternalKey {
    InternalKey::new(key.as_bytes(), sequence, ValueType::Value)
}

fn del(key: &str, sequence: u64) -> InternalKey {
    InternalKey::new(key.as_bytes(), sequence, ValueType::Deletion)
}

/// Create a table with numbered keys, one version each
fn create_sstable_with_entries(path: &PathBuf, count: usize) -> TableSummary {
    let mut builder = SSTableBuilder::new(path).unwrap();
    for i in 0..count {
        let key = format!("key{:05}", i);
        let value = format!("value{}", i);
        builder.add(&put(&key, i as u64 + 1), value.as_bytes()).unwrap();
    }
    builder.finish().unwrap()
}

// =============================================================================
// SSTableBuilder Tests
// =============================================================================

#[test]
fn test_builder_creates_file() {
    let (_temp, path) = setup_temp_sstable();

    let summary = create_sstable_with_entries(&path, 5);

    assert!(path.exists());
    assert_eq!(summary.entry_count, 5);
    assert_eq!(summary.file_size, fs::metadata(&path).unwrap().len());
    assert_eq!(summary.smallest, Some(put("key00000", 1)));
    assert_eq!(summary.largest, Some(put("key00004", 5)));
}

#[test]
fn test_builder_tracks_size_while_adding() {
    let (_temp, path) = setup_temp_sstable();

    let mut builder = SSTableBuilder::new(&path).unwrap();
    let empty = builder.file_size();
    builder.add(&put("a", 1), &[0u8; 100]).unwrap();
    assert!(builder.file_size() >= empty + 100);
    assert_eq!(builder.entry_count(), 1);
    assert_eq!(builder.path(), path.as_path());
}

#[test]
fn test_builder_rejects_out_of_order_keys() {
    let (_temp, path) = setup_temp_sstable();

    let mut builder = SSTableBuilder::new(&path).unwrap();
    builder.add(&put("b", 1), b"1").unwrap();

    let err = builder.add(&put("a", 2), b"2").unwrap_err();
    assert!(matches!(err, stratakv::StrataError::InvalidArgument(_)));

    // Same user key must come newest first
    let mut builder = SSTableBuilder::new(&path).unwrap();
    builder.add(&put("k", 1), b"old").unwrap();
    assert!(builder.add(&put("k", 2), b"new").is_err());
}

#[test]
fn test_builder_accepts_versions_newest_first() {
    let (_temp, path) = setup_temp_sstable();

    let mut builder = SSTableBuilder::new(&path).unwrap();
    builder.add(&put("k", 9), b"newest").unwrap();
    builder.add(&del("k", 5), b"").unwrap();
    builder.add(&put("k", 2), b"oldest").unwrap();
    let summary = builder.finish().unwrap();

    assert_eq!(summary.entry_count, 3);
    assert_eq!(summary.smallest.unwrap().sequence(), 9);
    assert_eq!(summary.largest.unwrap().sequence(), 2);
}

#[test]
fn test_abandon_removes_file() {
    let (_temp, path) = setup_temp_sstable();

    let mut builder = SSTableBuilder::new(&path).unwrap();
    builder.add(&put("a", 1), b"1").unwrap();
    builder.abandon();

    assert!(!path.exists());
}

#[test]
fn test_build_table_from_source() {
    let (_temp, path) = setup_temp_sstable();

    let entries: Vec<Result<(InternalKey, Vec<u8>)>> = vec![
        Ok((put("a", 3), b"1".to_vec())),
        Ok((del("b", 2), Vec::new())),
        Ok((put("c", 1), b"3".to_vec())),
    ];
    let summary = build_table(&path, entries).unwrap().unwrap();

    assert_eq!(summary.entry_count, 3);
    assert!(summary.might_contain(b"b"));
    assert!(!summary.might_contain(b"d"));
}

#[test]
fn test_build_table_empty_source_leaves_no_file() {
    let (_temp, path) = setup_temp_sstable();

    let summary = build_table(&path, Vec::<Result<(InternalKey, Vec<u8>)>>::new()).unwrap();

    assert!(summary.is_none());
    assert!(!path.exists());
}

#[test]
fn test_build_table_source_error_leaves_no_file() {
    let (_temp, path) = setup_temp_sstable();

    let entries: Vec<Result<(InternalKey, Vec<u8>)>> = vec![
        Ok((put("a", 1), b"1".to_vec())),
        Err(stratakv::StrataError::Corruption("bad input".to_string())),
    ];
    let err = build_table(&path, entries).unwrap_err();

    assert!(err.is_corruption());
    assert!(!path.exists());
}

// =============================================================================
// SSTableReader Tests
// =============================================================================

#[test]
fn test_reader_opens_file() {
    let (_temp, path) = setup_temp_sstable();
    let summary = create_sstable_with_entries(&path, 10);

    let reader = SSTableReader::open(&path).unwrap();
    assert_eq!(reader.entry_count(), 10);
    assert_eq!(reader.file_size(), summary.file_size);
    assert_eq!(reader.smallest(), summary.smallest.as_ref());
    assert_eq!(reader.largest(), summary.largest.as_ref());
    reader.verify_checksum().unwrap();
}

#[test]
fn test_reader_get_existing_key() {
    let (_temp, path) = setup_temp_sstable();
    create_sstable_with_entries(&path, 100);

    let reader = SSTableReader::open(&path).unwrap();
    let hit = reader.get(b"key00042", MAX_SEQUENCE_NUMBER).unwrap().unwrap();
    assert_eq!(hit.sequence, 43);
    assert_eq!(hit.into_value(), Some(b"value42".to_vec()));
}

#[test]
fn test_reader_get_missing_key() {
    let (_temp, path) = setup_temp_sstable();
    create_sstable_with_entries(&path, 10);

    let reader = SSTableReader::open(&path).unwrap();
    assert!(reader.get(b"key", MAX_SEQUENCE_NUMBER).unwrap().is_none());
    assert!(reader.get(b"key00003x", MAX_SEQUENCE_NUMBER).unwrap().is_none());
    assert!(reader.get(b"zzz", MAX_SEQUENCE_NUMBER).unwrap().is_none());
}

#[test]
fn test_reader_get_respects_sequence() {
    let (_temp, path) = setup_temp_sstable();
    {
        let mut builder = SSTableBuilder::new(&path).unwrap();
        builder.add(&put("k", 30), b"v30").unwrap();
        builder.add(&del("k", 20), b"").unwrap();
        builder.add(&put("k", 10), b"v10").unwrap();
        builder.finish().unwrap();
    }

    let reader = SSTableReader::open(&path).unwrap();
    assert_eq!(
        reader.get(b"k", 100).unwrap().unwrap().into_value(),
        Some(b"v30".to_vec())
    );
    assert_eq!(reader.get(b"k", 25).unwrap().unwrap().value, EntryValue::Tombstone);
    assert_eq!(
        reader.get(b"k", 15).unwrap().unwrap().into_value(),
        Some(b"v10".to_vec())
    );
    // Older than every version
    assert!(reader.get(b"k", 5).unwrap().is_none());
}

#[test]
fn test_reader_might_contain() {
    let (_temp, path) = setup_temp_sstable();
    create_sstable_with_entries(&path, 10);

    let reader = SSTableReader::open(&path).unwrap();
    assert!(reader.might_contain(b"key00000"));
    assert!(reader.might_contain(b"key00005x"));
    assert!(!reader.might_contain(b"a"));
    assert!(!reader.might_contain(b"z"));
}

// =============================================================================
// Iterator Tests
// =============================================================================

#[test]
fn test_iterator_yields_all_entries_in_order() {
    let (_temp, path) = setup_temp_sstable();
    create_sstable_with_entries(&path, 50);

    let reader = SSTableReader::open(&path).unwrap();
    let entries: Vec<(InternalKey, Vec<u8>)> = reader.iter().unwrap().map(|e| e.unwrap()).collect();

    assert_eq!(entries.len(), 50);
    assert!(entries.windows(2).all(|w| w[0].0 < w[1].0));
    assert_eq!(entries[7].0, put("key00007", 8));
    assert_eq!(entries[7].1, b"value7");
}

#[test]
fn test_iterator_keeps_tombstones() {
    let (_temp, path) = setup_temp_sstable();
    {
        let mut builder = SSTableBuilder::new(&path).unwrap();
        builder.add(&put("a", 2), b"1").unwrap();
        builder.add(&del("b", 1), b"").unwrap();
        builder.finish().unwrap();
    }

    let reader = SSTableReader::open(&path).unwrap();
    let kinds: Vec<ValueType> = reader.iter().unwrap().map(|e| e.unwrap().0.kind()).collect();
    assert_eq!(kinds, vec![ValueType::Value, ValueType::Deletion]);
}

#[test]
fn test_iterator_outlives_reader() {
    let (_temp, path) = setup_temp_sstable();
    create_sstable_with_entries(&path, 3);

    let iter = {
        let reader = SSTableReader::open(&path).unwrap();
        reader.iter().unwrap()
    };
    assert_eq!(iter.count(), 3);
}

// =============================================================================
// File Format Validation Tests
// =============================================================================

#[test]
fn test_open_short_file_is_corruption() {
    let (_temp, path) = setup_temp_sstable();
    fs::write(&path, b"tiny").unwrap();

    let err = SSTableReader::open(&path).err().unwrap();
    assert!(err.is_corruption());
}

#[test]
fn test_open_bad_magic_is_corruption() {
    let (_temp, path) = setup_temp_sstable();
    create_sstable_with_entries(&path, 3);

    let mut data = fs::read(&path).unwrap();
    data[0..4].copy_from_slice(b"NOPE");
    fs::write(&path, &data).unwrap();

    let err = SSTableReader::open(&path).err().unwrap();
    assert!(err.is_corruption());
}

#[test]
fn test_open_bad_version_is_corruption() {
    let (_temp, path) = setup_temp_sstable();
    create_sstable_with_entries(&path, 3);

    let mut data = fs::read(&path).unwrap();
    data[4..6].copy_from_slice(&99u16.to_le_bytes());
    fs::write(&path, &data).unwrap();

    assert!(SSTableReader::open(&path).err().unwrap().is_corruption());
}

#[test]
fn test_verify_checksum_detects_damaged_data() {
    let (_temp, path) = setup_temp_sstable();
    create_sstable_with_entries(&path, 3);

    // First value byte: header(14) + lens(8) + "key00000"+tag(16)
    let mut data = fs::read(&path).unwrap();
    data[14 + 8 + 16] ^= 0xFF;
    fs::write(&path, &data).unwrap();

    let reader = SSTableReader::open(&path).unwrap();
    assert!(reader.verify_checksum().unwrap_err().is_corruption());
}

#[test]
fn test_open_missing_file() {
    let temp_dir = TempDir::new().unwrap();
    assert!(SSTableReader::open(&temp_dir.path().join("absent.sst")).is_err());
}
