//! WAL Recovery
//!
//! Replays the write batches stored in one log segment.

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::batch::WriteBatch;
use crate::error::{Result, StrataError};
use crate::types::SequenceNumber;

use super::LogReader;

/// Streams the write batches of one log segment
///
/// In relaxed mode a corrupt record ends the segment: the rest is dropped and
/// reported in [`RecoveryResult`]. In paranoid mode the corruption is returned
/// as an error.
pub struct WalRecovery {
    path: PathBuf,
    reader: LogReader,
    paranoid: bool,
    result: RecoveryResult,
    finished: bool,
}

/// Result of a recovery operation
#[derive(Debug, Clone, Default)]
pub struct RecoveryResult {
    /// Number of batches successfully recovered
    pub batches_recovered: u64,

    /// Number of puts/deletes inside the recovered batches
    pub records_recovered: u64,

    /// Number of framed records skipped because their contents were invalid
    pub batches_corrupted: u64,

    /// Bytes at the end of the segment that were not replayed
    pub bytes_dropped: u64,

    /// Highest sequence number seen in the segment (0 if none)
    pub last_sequence: SequenceNumber,

    /// Whether a torn final write was cut off
    pub was_truncated: bool,

    /// First corruption seen, with its offset
    pub corruption: Option<String>,
}

impl RecoveryResult {
    /// No record was dropped for corruption
    pub fn is_clean(&self) -> bool {
        self.corruption.is_none()
    }
}

impl WalRecovery {
    /// Open a segment for replay
    pub fn open(path: &Path, paranoid: bool) -> Result<Self> {
        Ok(Self {
            path: path.to_path_buf(),
            reader: LogReader::open(path)?,
            paranoid,
            result: RecoveryResult::default(),
            finished: false,
        })
    }

    /// Verify integrity of a segment without keeping its batches
    pub fn verify(path: &Path) -> Result<RecoveryResult> {
        let mut replay = Self::open(path, false)?;
        for batch in replay.by_ref() {
            batch?;
        }
        Ok(replay.into_result())
    }

    /// Statistics gathered so far
    pub fn result(&self) -> &RecoveryResult {
        &self.result
    }

    pub fn into_result(self) -> RecoveryResult {
        self.result
    }

    /// Offset just past the last valid record
    pub fn valid_len(&self) -> u64 {
        self.reader.offset()
    }

    /// Handle a corrupt record: fatal when paranoid, otherwise logged and counted
    fn report(&mut self, err: StrataError, drop_rest: bool) -> Option<Result<WriteBatch>> {
        if self.result.corruption.is_none() {
            self.result.corruption = Some(err.to_string());
        }
        if self.paranoid {
            self.finished = true;
            return Some(Err(err));
        }
        if drop_rest {
            self.finished = true;
            self.result.bytes_dropped = self.reader.bytes_dropped();
            warn!(
                path = %self.path.display(),
                bytes_dropped = self.result.bytes_dropped,
                error = %err,
                "dropping rest of log segment"
            );
        } else {
            self.result.batches_corrupted += 1;
            warn!(path = %self.path.display(), error = %err, "skipping corrupt log record");
        }
        None
    }

    fn check_batch(batch: &WriteBatch) -> Result<u64> {
        let mut records = 0;
        for record in batch.iter() {
            record?;
            records += 1;
        }
        Ok(records)
    }
}

impl Iterator for WalRecovery {
    type Item = Result<WriteBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.finished {
            let payload = match self.reader.read_record() {
                Ok(Some(payload)) => payload,
                Ok(None) => {
                    self.finished = true;
                    self.result.was_truncated = self.reader.was_truncated();
                    self.result.bytes_dropped = self.reader.bytes_dropped();
                    return None;
                }
                Err(err @ StrataError::Corruption(_)) => {
                    if let Some(out) = self.report(err, true) {
                        return Some(out);
                    }
                    continue;
                }
                Err(err) => {
                    self.finished = true;
                    return Some(Err(err));
                }
            };

            let batch = match WriteBatch::from_contents(payload) {
                Ok(batch) => batch,
                Err(err) => {
                    if let Some(out) = self.report(err, false) {
                        return Some(out);
                    }
                    continue;
                }
            };

            match Self::check_batch(&batch) {
                Ok(records) => {
                    self.result.batches_recovered += 1;
                    self.result.records_recovered += records;
                    if records > 0 {
                        let last = batch.sequence() + records - 1;
                        self.result.last_sequence = self.result.last_sequence.max(last);
                    }
                    return Some(Ok(batch));
                }
                Err(err) => {
                    if let Some(out) = self.report(err, false) {
                        return Some(out);
                    }
                }
            }
        }
        None
    }
}
