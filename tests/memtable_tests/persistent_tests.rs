//! Persistent MemTable Tests
//!
//! Tests verify:
//! - Inserts survive reopening the map file
//! - Sequence bounds are restored from the header
//! - Damaged tails are cut back to the last intact entry
//! - Clearing truncates the file

use std::fs::{self, OpenOptions};
use std::io::Write;

use stratakv::memtable::{MemTable, MemTableEntry, PersistentMemTable};
use stratakv::types::ValueType;
use tempfile::TempDir;

#[test]
fn test_create_is_empty_and_persistent() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("000001.map");

    let map = PersistentMemTable::create(&path, 7).unwrap();
    assert!(map.is_empty());
    assert!(map.is_persistent());
    assert_eq!(map.earliest_sequence(), 7);
    assert_eq!(map.path(), path.as_path());
    assert!(path.exists());
}

#[test]
fn test_reopen_restores_entries() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("000001.map");

    {
        let map = PersistentMemTable::create(&path, 0).unwrap();
        map.add(1, ValueType::Value, b"a", b"1").unwrap();
        map.add(2, ValueType::Value, b"b", b"2").unwrap();
        map.add(3, ValueType::Deletion, b"a", b"").unwrap();
        map.sync().unwrap();
    }

    let map = PersistentMemTable::open(&path).unwrap();
    assert_eq!(map.entry_count(), 3);
    assert_eq!(map.max_sequence(), 3);
    assert_eq!(map.earliest_sequence(), 0);
    assert_eq!(map.get(b"a", 3).unwrap().value, MemTableEntry::Tombstone);
    assert_eq!(map.get(b"a", 2).unwrap().into_value(), Some(b"1".to_vec()));
    assert_eq!(map.get(b"b", 3).unwrap().into_value(), Some(b"2".to_vec()));
}

#[test]
fn test_reopened_map_accepts_more_writes() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("000001.map");

    {
        let map = PersistentMemTable::create(&path, 0).unwrap();
        map.add(1, ValueType::Value, b"a", b"1").unwrap();
    }
    {
        let map = PersistentMemTable::open(&path).unwrap();
        map.add(2, ValueType::Value, b"b", b"2").unwrap();
    }

    let map = PersistentMemTable::open(&path).unwrap();
    assert_eq!(map.entry_count(), 2);
    assert_eq!(map.max_sequence(), 2);
}

#[test]
fn test_torn_tail_is_truncated() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("000001.map");

    {
        let map = PersistentMemTable::create(&path, 0).unwrap();
        map.add(1, ValueType::Value, b"a", b"1").unwrap();
    }
    let intact_len = fs::metadata(&path).unwrap().len();

    let mut file = OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(&[1, 2, 3, 4, 5]).unwrap();
    drop(file);

    let map = PersistentMemTable::open(&path).unwrap();
    assert_eq!(map.entry_count(), 1);
    assert_eq!(fs::metadata(&path).unwrap().len(), intact_len);
}

#[test]
fn test_corrupt_entry_ends_table() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("000001.map");

    {
        let map = PersistentMemTable::create(&path, 0).unwrap();
        map.add(1, ValueType::Value, b"a", b"1").unwrap();
        map.add(2, ValueType::Value, b"b", b"2").unwrap();
    }

    // Flip the last value byte of the second entry
    let mut data = fs::read(&path).unwrap();
    let last = data.len() - 1;
    data[last] ^= 0xFF;
    fs::write(&path, &data).unwrap();

    let map = PersistentMemTable::open(&path).unwrap();
    assert_eq!(map.entry_count(), 1);
    assert!(map.get(b"a", 10).is_some());
    assert!(map.get(b"b", 10).is_none());
}

#[test]
fn test_bad_header_is_corruption() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("000001.map");
    fs::write(&path, b"not a map file at all, just text").unwrap();

    let err = PersistentMemTable::open(&path).err().unwrap();
    assert!(err.is_corruption());
}

#[test]
fn test_clear_truncates_file() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("000001.map");

    let map = PersistentMemTable::create(&path, 0).unwrap();
    let empty_len = fs::metadata(&path).unwrap().len();
    map.add(1, ValueType::Value, b"a", b"1").unwrap();
    map.add(2, ValueType::Value, b"b", b"2").unwrap();
    assert!(fs::metadata(&path).unwrap().len() > empty_len);

    map.clear(2).unwrap();
    assert!(map.is_empty());
    assert_eq!(map.earliest_sequence(), 2);
    assert_eq!(fs::metadata(&path).unwrap().len(), empty_len);

    drop(map);
    let map = PersistentMemTable::open(&path).unwrap();
    assert!(map.is_empty());
    assert_eq!(map.earliest_sequence(), 2);
}
