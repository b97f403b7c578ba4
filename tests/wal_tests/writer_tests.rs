//! Tests for WAL Writer
//!
//! These tests verify:
//! - Records are framed as [CRC][Len][Payload]
//! - Offsets track bytes written
//! - Sync leaves every record readable
//! - Reopening for append cuts off a torn tail first
//! - Integration with reader

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use stratakv::wal::{frame_record, record_checksum, LogReader, LogWriter, HEADER_SIZE};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_wal() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let wal_path = temp_dir.path().join("000001.log");
    (temp_dir, wal_path)
}

fn read_all(path: &PathBuf) -> Vec<Vec<u8>> {
    let mut reader = LogReader::open(path).unwrap();
    let mut records = Vec::new();
    while let Some(record) = reader.read_record().unwrap() {
        records.push(record);
    }
    records
}

// =============================================================================
// Basic Writing Tests
// =============================================================================

#[test]
fn test_create_empty_segment() {
    let (_temp, wal_path) = setup_temp_wal();

    let writer = LogWriter::create(&wal_path).unwrap();
    assert_eq!(writer.offset(), 0);
    assert_eq!(writer.path(), wal_path.as_path());
    assert_eq!(fs::metadata(&wal_path).unwrap().len(), 0);
}

#[test]
fn test_write_single_record() {
    let (_temp, wal_path) = setup_temp_wal();

    let mut writer = LogWriter::create(&wal_path).unwrap();
    writer.add_record(b"hello").unwrap();

    assert_eq!(writer.offset(), (HEADER_SIZE + 5) as u64);
    let on_disk = fs::read(&wal_path).unwrap();
    assert_eq!(on_disk, frame_record(b"hello"));
}

#[test]
fn test_frame_layout() {
    let framed = frame_record(b"abc");
    assert_eq!(framed.len(), HEADER_SIZE + 3);
    assert_eq!(&framed[0..4], &record_checksum(b"abc").to_le_bytes());
    assert_eq!(&framed[4..8], &3u32.to_le_bytes());
    assert_eq!(&framed[8..], b"abc");
}

#[test]
fn test_checksum_covers_length() {
    // Same bytes, different split between records, must not collide
    assert_ne!(record_checksum(b""), record_checksum(b"\0"));
    assert_ne!(record_checksum(b"ab"), record_checksum(b"ba"));
}

#[test]
fn test_write_multiple_records() {
    let (_temp, wal_path) = setup_temp_wal();

    let mut writer = LogWriter::create(&wal_path).unwrap();
    writer.add_record(b"one").unwrap();
    writer.add_record(b"").unwrap();
    writer.add_record(&vec![7u8; 10_000]).unwrap();
    writer.sync().unwrap();

    let records = read_all(&wal_path);
    assert_eq!(records.len(), 3);
    assert_eq!(records[0], b"one");
    assert!(records[1].is_empty());
    assert_eq!(records[2], vec![7u8; 10_000]);
    assert_eq!(writer.offset(), fs::metadata(&wal_path).unwrap().len());
}

#[test]
fn test_create_truncates_existing_file() {
    let (_temp, wal_path) = setup_temp_wal();
    fs::write(&wal_path, b"stale contents").unwrap();

    let mut writer = LogWriter::create(&wal_path).unwrap();
    writer.add_record(b"fresh").unwrap();

    assert_eq!(read_all(&wal_path), vec![b"fresh".to_vec()]);
}

// =============================================================================
// Append Tests
// =============================================================================

#[test]
fn test_append_to_continues_segment() {
    let (_temp, wal_path) = setup_temp_wal();

    {
        let mut writer = LogWriter::create(&wal_path).unwrap();
        writer.add_record(b"first").unwrap();
    }
    let len = fs::metadata(&wal_path).unwrap().len();

    let mut writer = LogWriter::append_to(&wal_path, len).unwrap();
    assert_eq!(writer.offset(), len);
    writer.add_record(b"second").unwrap();

    assert_eq!(read_all(&wal_path), vec![b"first".to_vec(), b"second".to_vec()]);
}

#[test]
fn test_append_to_cuts_torn_tail() {
    let (_temp, wal_path) = setup_temp_wal();

    {
        let mut writer = LogWriter::create(&wal_path).unwrap();
        writer.add_record(b"first").unwrap();
    }
    let valid_len = fs::metadata(&wal_path).unwrap().len();
    let mut file = OpenOptions::new().append(true).open(&wal_path).unwrap();
    file.write_all(&[0xFF; 5]).unwrap();
    drop(file);

    let mut writer = LogWriter::append_to(&wal_path, valid_len).unwrap();
    writer.add_record(b"second").unwrap();
    writer.sync().unwrap();

    assert_eq!(read_all(&wal_path), vec![b"first".to_vec(), b"second".to_vec()]);
}
