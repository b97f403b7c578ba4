//! SSTable Builder
//!
//! Writes sorted internal-key entries to a new SSTable file.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Result, StrataError};
use crate::types::InternalKey;

use super::{TableSummary, HEADER_SIZE, MAGIC, VERSION};

/// Builder for creating new SSTables from sorted entries
pub struct SSTableBuilder {
    /// Output file path
    path: PathBuf,
    /// Buffered writer for performance
    writer: BufWriter<File>,
    /// Number of entries written
    entry_count: u64,
    /// Current write position (for index)
    current_offset: u64,
    /// Index: encoded internal key → file offset of entry
    index: Vec<(Vec<u8>, u64)>,
    /// Track key range for metadata
    smallest: Option<InternalKey>,
    largest: Option<InternalKey>,
    /// Running CRC hasher for data section
    data_hasher: crc32fast::Hasher,
}

impl SSTableBuilder {
    /// Create a new SSTable builder
    ///
    /// Writes header immediately; call `add()` in internal-key order,
    /// then `finish()` to write index and footer.
    pub fn new(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        let mut writer = BufWriter::new(file);

        // Write header (entry_count placeholder, will be updated in finish)
        writer.write_all(MAGIC)?;
        writer.write_all(&VERSION.to_le_bytes())?;
        writer.write_all(&0u64.to_le_bytes())?;

        Ok(Self {
            path: path.to_path_buf(),
            writer,
            entry_count: 0,
            current_offset: HEADER_SIZE,
            index: Vec::new(),
            smallest: None,
            largest: None,
            data_hasher: crc32fast::Hasher::new(),
        })
    }

    /// Add an entry (must be called in internal-key order)
    pub fn add(&mut self, key: &InternalKey, value: &[u8]) -> Result<()> {
        if let Some(last) = &self.largest {
            if key <= last {
                return Err(StrataError::InvalidArgument(format!(
                    "table keys out of order: {:?} after {:?}",
                    key, last
                )));
            }
        }

        let encoded = key.encode();
        self.index.push((encoded.clone(), self.current_offset));

        if self.smallest.is_none() {
            self.smallest = Some(key.clone());
        }
        self.largest = Some(key.clone());

        // Entry: [key_len(4)][val_len(4)][key][value]
        let key_len_bytes = (encoded.len() as u32).to_le_bytes();
        let val_len_bytes = (value.len() as u32).to_le_bytes();

        self.writer.write_all(&key_len_bytes)?;
        self.writer.write_all(&val_len_bytes)?;
        self.writer.write_all(&encoded)?;
        self.writer.write_all(value)?;

        self.data_hasher.update(&key_len_bytes);
        self.data_hasher.update(&val_len_bytes);
        self.data_hasher.update(&encoded);
        self.data_hasher.update(value);

        self.current_offset += 8 + encoded.len() as u64 + value.len() as u64;
        self.entry_count += 1;

        Ok(())
    }

    /// Bytes written so far (used to roll compaction outputs)
    pub fn file_size(&self) -> u64 {
        self.current_offset
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Finish building: write index block, footer, sync, and return metadata
    pub fn finish(mut self) -> Result<TableSummary> {
        let index_offset = self.current_offset;

        // Index block: [key_len(4)][offset(8)][key] for each entry
        for (key, offset) in &self.index {
            self.writer.write_all(&(key.len() as u32).to_le_bytes())?;
            self.writer.write_all(&offset.to_le_bytes())?;
            self.writer.write_all(key)?;
        }

        let data_crc = self.data_hasher.finalize();

        // Footer: index_offset (8) + data_crc (4) + padding (4)
        self.writer.write_all(&index_offset.to_le_bytes())?;
        self.writer.write_all(&data_crc.to_le_bytes())?;
        self.writer.write_all(&[0u8; 4])?;

        self.writer.flush()?;

        // Seek back and update entry count in header
        let mut file = self
            .writer
            .into_inner()
            .map_err(|e| StrataError::Io(std::sync::Arc::new(e.into_error())))?;
        file.seek(SeekFrom::Start(6))?;
        file.write_all(&self.entry_count.to_le_bytes())?;
        file.sync_all()?;

        let file_size = file.metadata()?.len();

        Ok(TableSummary {
            entry_count: self.entry_count,
            file_size,
            smallest: self.smallest,
            largest: self.largest,
        })
    }

    /// Give up on this table and delete the partial file
    pub fn abandon(self) {
        let path = self.path;
        drop(self.writer);
        let _ = fs::remove_file(path);
    }
}

/// Write every entry of a sorted source into a new table at `path`.
///
/// Returns `None` (and leaves no file behind) when the source is empty.
pub fn build_table<I>(path: &Path, entries: I) -> Result<Option<TableSummary>>
where
    I: IntoIterator<Item = Result<(InternalKey, Vec<u8>)>>,
{
    let mut builder = SSTableBuilder::new(path)?;
    for entry in entries {
        let result = entry.and_then(|(key, value)| builder.add(&key, &value));
        if let Err(err) = result {
            builder.abandon();
            return Err(err);
        }
    }

    if builder.entry_count() == 0 {
        builder.abandon();
        return Ok(None);
    }

    match builder.finish() {
        Ok(summary) => Ok(Some(summary)),
        Err(err) => {
            let _ = fs::remove_file(path);
            Err(err)
        }
    }
}
