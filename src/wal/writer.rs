//! WAL Writer
//!
//! Appends framed records to a log segment.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::Result;

use super::record::frame_record;

/// Appends records to one log segment (or manifest)
pub struct LogWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    /// Bytes in the file, including buffered ones
    offset: u64,
}

impl LogWriter {
    /// Create a new, empty segment (truncating any existing file)
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            offset: 0,
        })
    }

    /// Reopen an existing segment and continue appending after its last
    /// valid record; anything past `valid_len` (a torn tail) is cut off first
    pub fn append_to(path: &Path, valid_len: u64) -> Result<Self> {
        let file = OpenOptions::new().write(true).open(path)?;
        if file.metadata()?.len() > valid_len {
            file.set_len(valid_len)?;
        }
        file.sync_all()?;
        drop(file);

        let file = OpenOptions::new().append(true).open(path)?;
        let offset = valid_len;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            offset,
        })
    }

    /// Append one record and hand it to the OS
    pub fn add_record(&mut self, payload: &[u8]) -> Result<()> {
        let framed = frame_record(payload);
        self.writer.write_all(&framed)?;
        self.writer.flush()?;
        self.offset += framed.len() as u64;
        Ok(())
    }

    /// Force appended records to stable storage
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }

    /// Current size of the segment in bytes
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
