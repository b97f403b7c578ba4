//! SSTable Reader
//!
//! Opens SSTable files and provides O(log n) lookups via an in-memory index.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::{Result, StrataError};
use crate::types::{InternalKey, Lookup, SequenceNumber};

use super::iterator::SSTableIterator;
use super::{FOOTER_SIZE, HEADER_SIZE, MAGIC, VERSION};

/// Reader for SSTable files with in-memory index for O(log n) lookups
///
/// The file handle sits behind a Mutex so lookups take `&self` and one
/// reader can be shared by every thread through the table cache.
pub struct SSTableReader {
    path: PathBuf,
    /// File handle for reading entries
    file: Mutex<BufReader<File>>,
    /// In-memory index: internal key → file offset
    index: BTreeMap<InternalKey, u64>,
    entry_count: u64,
    /// Index block starting offset (end of data)
    index_offset: u64,
    data_crc: u32,
    file_size: u64,
}

fn read_u32(buf: &[u8], pos: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[pos..pos + 4]);
    u32::from_le_bytes(bytes)
}

fn read_u64(buf: &[u8], pos: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[pos..pos + 8]);
    u64::from_le_bytes(bytes)
}

impl SSTableReader {
    /// Open an SSTable for reading
    ///
    /// Loads the entire index into memory for fast lookups.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let file_size = file.metadata()?.len();
        if file_size < HEADER_SIZE + FOOTER_SIZE {
            return Err(StrataError::Corruption(format!(
                "table too short: {} ({} bytes)",
                path.display(),
                file_size
            )));
        }

        // Read and validate header
        let mut header = [0u8; HEADER_SIZE as usize];
        file.read_exact(&mut header)?;

        if &header[0..4] != MAGIC {
            return Err(StrataError::Corruption(format!(
                "invalid table magic in {}: {:?}",
                path.display(),
                &header[0..4]
            )));
        }

        let version = u16::from_le_bytes([header[4], header[5]]);
        if version != VERSION {
            return Err(StrataError::Corruption(format!(
                "unsupported table version {} in {}",
                version,
                path.display()
            )));
        }

        let entry_count = read_u64(&header, 6);

        // Read footer to get index offset
        file.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        let mut footer = [0u8; FOOTER_SIZE as usize];
        file.read_exact(&mut footer)?;

        let index_offset = read_u64(&footer, 0);
        let data_crc = read_u32(&footer, 8);
        if index_offset < HEADER_SIZE || index_offset > file_size - FOOTER_SIZE {
            return Err(StrataError::Corruption(format!(
                "bad index offset {} in {}",
                index_offset,
                path.display()
            )));
        }

        // Load index into memory
        file.seek(SeekFrom::Start(index_offset))?;
        let index_block_size = file_size - FOOTER_SIZE - index_offset;
        let mut index_data = vec![0u8; index_block_size as usize];
        file.read_exact(&mut index_data)?;

        // Parse index entries: [key_len(4)][offset(8)][key]
        let mut index = BTreeMap::new();
        let mut pos = 0;
        while pos < index_data.len() {
            if pos + 12 > index_data.len() {
                return Err(StrataError::Corruption(format!(
                    "truncated index entry in {}",
                    path.display()
                )));
            }
            let key_len = read_u32(&index_data, pos) as usize;
            let offset = read_u64(&index_data, pos + 4);
            pos += 12;

            if pos + key_len > index_data.len() {
                return Err(StrataError::Corruption(format!(
                    "truncated index key in {}",
                    path.display()
                )));
            }
            let key = InternalKey::decode(&index_data[pos..pos + key_len])?;
            pos += key_len;

            index.insert(key, offset);
        }

        if index.len() as u64 != entry_count {
            return Err(StrataError::Corruption(format!(
                "index holds {} keys but header says {} in {}",
                index.len(),
                entry_count,
                path.display()
            )));
        }

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(BufReader::new(file)),
            index,
            entry_count,
            index_offset,
            data_crc,
            file_size,
        })
    }

    /// Newest entry for `user_key` with sequence at or below `sequence`
    pub fn get(&self, user_key: &[u8], sequence: SequenceNumber) -> Result<Option<Lookup>> {
        let (key, offset) = match self
            .index
            .range(InternalKey::seek_key(user_key, sequence)..)
            .next()
        {
            Some((key, &offset)) if key.user_key() == user_key => (key, offset),
            _ => return Ok(None),
        };

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;

        let mut header = [0u8; 8];
        file.read_exact(&mut header)?;
        let key_len = read_u32(&header, 0) as i64;
        let val_len = read_u32(&header, 4) as usize;

        // Skip the key (we already know it matches)
        file.seek(SeekFrom::Current(key_len))?;

        let mut value = vec![0u8; val_len];
        file.read_exact(&mut value)?;

        Ok(Some(Lookup::from_parts(key.sequence(), key.kind(), value)))
    }

    /// Recompute the data-block checksum and compare with the footer
    pub fn verify_checksum(&self) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(HEADER_SIZE))?;
        let mut data = vec![0u8; (self.index_offset - HEADER_SIZE) as usize];
        file.read_exact(&mut data)?;
        if crc32fast::hash(&data) != self.data_crc {
            return Err(StrataError::Corruption(format!(
                "table data checksum mismatch in {}",
                self.path.display()
            )));
        }
        Ok(())
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Smallest internal key in this table
    pub fn smallest(&self) -> Option<&InternalKey> {
        self.index.keys().next()
    }

    /// Largest internal key in this table
    pub fn largest(&self) -> Option<&InternalKey> {
        self.index.keys().next_back()
    }

    /// Quick check if a user key might be in this table (range check)
    pub fn might_contain(&self, user_key: &[u8]) -> bool {
        match (self.smallest(), self.largest()) {
            (Some(min), Some(max)) => user_key >= min.user_key() && user_key <= max.user_key(),
            _ => false,
        }
    }

    /// Create an iterator over all entries on its own file handle
    pub fn iter(&self) -> Result<SSTableIterator> {
        SSTableIterator::open(&self.path, self.index_offset)
    }
}
