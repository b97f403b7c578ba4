//! Persistent MemTable implementation
//!
//! Mirrors every insert into a `.map` file so the table survives a restart
//! without a write-ahead log.
//!
//! ## File Format
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Header (24 bytes)                                            │
//! │   Magic: "SKVM" (4) | Reserved (4) | MaxSeq: u64 | Earliest: u64 │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Entries, log-framed: [CRC][Len][Tag u64][KeyLen u32][Key][Value] │
//! └──────────────────────────────────────────────────────────────┘
//! ```

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut};
use parking_lot::Mutex;
use tracing::warn;

use crate::error::{Result, StrataError};
use crate::types::{pack_tag, unpack_tag, InternalKey, Lookup, SequenceNumber, ValueType};
use crate::wal::{frame_record, record_checksum, HEADER_SIZE as FRAME_HEADER_SIZE};

use super::{MemTable, MemTableIterator, VolatileMemTable};

const MAP_MAGIC: &[u8; 4] = b"SKVM";

/// Header size: Magic (4) + Reserved (4) + MaxSeq (8) + Earliest (8) = 24 bytes
const MAP_HEADER_SIZE: u64 = 24;

/// Offset of the max-sequence marker inside the header
const MAX_SEQUENCE_OFFSET: u64 = 8;

/// File-backed memtable
pub struct PersistentMemTable {
    path: PathBuf,
    file: Mutex<File>,
    index: VolatileMemTable,
}

impl PersistentMemTable {
    /// Create a fresh map file
    pub fn create(path: &Path, earliest_sequence: SequenceNumber) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        write_header(&mut file, 0, earliest_sequence)?;
        file.sync_all()?;

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            index: VolatileMemTable::new(earliest_sequence),
        })
    }

    /// Reopen a map file left by a previous run and rebuild its index.
    ///
    /// A torn or corrupt entry ends the table; the file is cut back to the
    /// last intact entry.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;

        if contents.len() < MAP_HEADER_SIZE as usize || &contents[0..4] != MAP_MAGIC {
            return Err(StrataError::Corruption(format!(
                "bad map file header: {}",
                path.display()
            )));
        }
        let mut header = &contents[MAX_SEQUENCE_OFFSET as usize..MAP_HEADER_SIZE as usize];
        let max_sequence = header.get_u64_le();
        let earliest_sequence = header.get_u64_le();

        let index = VolatileMemTable::new(earliest_sequence);
        let mut pos = MAP_HEADER_SIZE as usize;
        while pos < contents.len() {
            match decode_entry(&contents[pos..]) {
                Some((key, value, consumed)) => {
                    index.insert(key, value);
                    pos += consumed;
                }
                None => {
                    warn!(
                        path = %path.display(),
                        offset = pos,
                        bytes_dropped = contents.len() - pos,
                        "truncating damaged map file tail"
                    );
                    file.set_len(pos as u64)?;
                    break;
                }
            }
        }
        index.set_max_sequence(max_sequence);

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            index,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn write_header(file: &mut File, max_sequence: SequenceNumber, earliest: SequenceNumber) -> Result<()> {
    let mut header = Vec::with_capacity(MAP_HEADER_SIZE as usize);
    header.put_slice(MAP_MAGIC);
    header.put_u32_le(0);
    header.put_u64_le(max_sequence);
    header.put_u64_le(earliest);
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&header)?;
    Ok(())
}

/// Parse one framed entry; `None` if it is torn or fails its checksum
fn decode_entry(input: &[u8]) -> Option<(InternalKey, Vec<u8>, usize)> {
    if input.len() < FRAME_HEADER_SIZE {
        return None;
    }
    let mut header = &input[..FRAME_HEADER_SIZE];
    let crc = header.get_u32_le();
    let len = header.get_u32_le() as usize;
    let payload = input.get(FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + len)?;
    if record_checksum(payload) != crc || payload.len() < 12 {
        return None;
    }

    let mut buf = payload;
    let (sequence, kind) = unpack_tag(buf.get_u64_le()).ok()?;
    let key_len = buf.get_u32_le() as usize;
    if buf.remaining() < key_len {
        return None;
    }
    let key = InternalKey::new(&buf[..key_len], sequence, kind);
    let value = buf[key_len..].to_vec();
    Some((key, value, FRAME_HEADER_SIZE + len))
}

impl MemTable for PersistentMemTable {
    fn add(
        &self,
        sequence: SequenceNumber,
        kind: ValueType,
        key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        let mut payload = Vec::with_capacity(12 + key.len() + value.len());
        payload.put_u64_le(pack_tag(sequence, kind));
        payload.put_u32_le(key.len() as u32);
        payload.put_slice(key);
        payload.put_slice(value);

        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::End(0))?;
            file.write_all(&frame_record(&payload))?;
            if sequence > self.index.max_sequence() {
                file.seek(SeekFrom::Start(MAX_SEQUENCE_OFFSET))?;
                file.write_all(&sequence.to_le_bytes())?;
            }
        }

        self.index.insert(InternalKey::new(key, sequence, kind), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &[u8], sequence: SequenceNumber) -> Option<Lookup> {
        self.index.get(key, sequence)
    }

    fn iter(&self) -> MemTableIterator {
        self.index.iter()
    }

    fn approximate_memory_usage(&self) -> usize {
        self.index.approximate_memory_usage()
    }

    fn is_persistent(&self) -> bool {
        true
    }

    fn max_sequence(&self) -> SequenceNumber {
        self.index.max_sequence()
    }

    fn earliest_sequence(&self) -> SequenceNumber {
        self.index.earliest_sequence()
    }

    fn clear(&self, earliest: SequenceNumber) -> Result<()> {
        let mut file = self.file.lock();
        file.set_len(MAP_HEADER_SIZE)?;
        write_header(&mut file, 0, earliest)?;
        file.sync_all()?;
        self.index.reset(earliest);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.lock().sync_data()?;
        Ok(())
    }

    fn entry_count(&self) -> usize {
        self.index.entry_count()
    }
}
