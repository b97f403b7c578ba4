//! WAL Reader
//!
//! Reads framed records back from a log segment in order.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::error::{Result, StrataError};

use super::record::{record_checksum, HEADER_SIZE};

/// Sequential reader over one log segment
///
/// A record cut short at the end of the file is a torn final write and ends
/// the stream quietly. A checksum mismatch is reported as corruption with the
/// byte offset of the bad record; the reader yields nothing after that.
pub struct LogReader {
    reader: BufReader<File>,
    file_len: u64,
    /// Offset of the next unread record
    offset: u64,
    /// Set once a torn tail was seen
    truncated_tail: bool,
    /// Set once a corrupt record was reported
    corrupted: bool,
}

impl LogReader {
    /// Open a log segment for reading
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        Ok(Self {
            reader: BufReader::new(file),
            file_len,
            offset: 0,
            truncated_tail: false,
            corrupted: false,
        })
    }

    /// Read the next record payload
    ///
    /// - `Ok(Some(payload))`: a valid record
    /// - `Ok(None)`: end of segment (clean end or torn tail)
    /// - `Err(Corruption)`: checksum mismatch at [`LogReader::offset`]
    pub fn read_record(&mut self) -> Result<Option<Vec<u8>>> {
        if self.corrupted || self.truncated_tail {
            return Ok(None);
        }

        let remaining = self.file_len - self.offset;
        if remaining == 0 {
            return Ok(None);
        }
        if remaining < HEADER_SIZE as u64 {
            self.truncated_tail = true;
            return Ok(None);
        }

        let mut header = [0u8; HEADER_SIZE];
        self.reader.read_exact(&mut header)?;
        let expected_crc = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as u64;

        if len > remaining - HEADER_SIZE as u64 {
            self.truncated_tail = true;
            return Ok(None);
        }

        let mut payload = vec![0u8; len as usize];
        self.reader.read_exact(&mut payload)?;

        if record_checksum(&payload) != expected_crc {
            self.corrupted = true;
            return Err(StrataError::Corruption(format!(
                "checksum mismatch in log record at offset {}",
                self.offset
            )));
        }

        self.offset += HEADER_SIZE as u64 + len;
        Ok(Some(payload))
    }

    /// Offset of the next record, or of the corrupt record once one was reported
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Bytes after the last valid record that were not returned
    pub fn bytes_dropped(&self) -> u64 {
        self.file_len - self.offset
    }

    pub fn was_truncated(&self) -> bool {
        self.truncated_tail
    }

    pub fn was_corrupted(&self) -> bool {
        self.corrupted
    }
}
