//! Versions
//!
//! A [`Version`] is an immutable snapshot of which table files are live at
//! each level. Readers and compactions hold an `Arc<Version>` so the files
//! they use cannot be removed underneath them.

use std::fmt::Write as _;
use std::sync::Arc;

use crate::config::NUM_LEVELS;
use crate::error::Result;
use crate::types::{InternalKey, Lookup, SequenceNumber};

use super::table_cache::TableCache;
use super::version_edit::FileMetaData;

/// Sum of file sizes
pub fn total_file_size(files: &[Arc<FileMetaData>]) -> u64 {
    files.iter().map(|f| f.file_size).sum()
}

#[derive(Debug)]
pub struct Version {
    /// Level 0 ordered by file number, deeper levels by smallest key
    pub(crate) files: Vec<Vec<Arc<FileMetaData>>>,
    /// Level that most needs compaction and its score (>= 1.0 means needed)
    pub(crate) compaction_level: usize,
    pub(crate) compaction_score: f64,
}

impl Default for Version {
    fn default() -> Self {
        Self {
            files: vec![Vec::new(); NUM_LEVELS],
            compaction_level: 0,
            compaction_score: -1.0,
        }
    }
}

impl Version {
    pub fn files(&self, level: usize) -> &[Arc<FileMetaData>] {
        &self.files[level]
    }

    pub fn num_files(&self, level: usize) -> usize {
        self.files[level].len()
    }

    pub fn level_bytes(&self, level: usize) -> u64 {
        total_file_size(&self.files[level])
    }

    pub fn compaction_score(&self) -> f64 {
        self.compaction_score
    }

    /// Look `user_key` up in the tables, newest data first.
    ///
    /// Level-0 files may overlap, so every candidate is checked newest file
    /// first; deeper levels hold at most one candidate each, found by the
    /// internal key so a user key spanning two files resolves to the one
    /// holding versions at or below `sequence`.
    pub fn get(
        &self,
        cache: &TableCache,
        user_key: &[u8],
        sequence: SequenceNumber,
    ) -> Result<Option<Lookup>> {
        let mut level0: Vec<&Arc<FileMetaData>> = self.files[0]
            .iter()
            .filter(|f| f.contains_user_key(user_key))
            .collect();
        level0.sort_by(|a, b| b.number.cmp(&a.number));
        for file in level0 {
            if let Some(hit) = cache.get(file.number, user_key, sequence)? {
                return Ok(Some(hit));
            }
        }

        let target = InternalKey::seek_key(user_key, sequence);
        for level in 1..NUM_LEVELS {
            let files = &self.files[level];
            let idx = files.partition_point(|f| f.largest < target);
            if let Some(file) = files.get(idx) {
                if file.contains_user_key(user_key) {
                    if let Some(hit) = cache.get(file.number, user_key, sequence)? {
                        return Ok(Some(hit));
                    }
                }
            }
        }
        Ok(None)
    }

    /// Whether any file in `level` overlaps the user-key range `[smallest, largest]`;
    /// `None` bounds are open
    pub fn overlap_in_level(
        &self,
        level: usize,
        smallest: Option<&[u8]>,
        largest: Option<&[u8]>,
    ) -> bool {
        self.files[level].iter().any(|f| f.overlaps(smallest, largest))
    }

    /// Bytes of table data overlapping `[begin, end]` across all levels
    pub fn approximate_size(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> u64 {
        self.files
            .iter()
            .flatten()
            .filter(|f| f.overlaps(begin, end))
            .map(|f| f.file_size)
            .sum()
    }

    /// Files in `level` overlapping `[begin, end]`.
    ///
    /// For level 0 the range grows to cover every file it touches, since
    /// level-0 files may overlap each other.
    pub fn get_overlapping_inputs(
        &self,
        level: usize,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Vec<Arc<FileMetaData>> {
        let mut begin = begin.map(|b| b.to_vec());
        let mut end = end.map(|e| e.to_vec());
        let mut inputs: Vec<Arc<FileMetaData>> = Vec::new();
        let mut i = 0;
        while i < self.files[level].len() {
            let file = &self.files[level][i];
            i += 1;
            if !file.overlaps(begin.as_deref(), end.as_deref()) {
                continue;
            }
            inputs.push(Arc::clone(file));
            if level == 0 {
                let file_start = file.smallest.user_key();
                let file_limit = file.largest.user_key();
                let mut restart = false;
                if matches!(&begin, Some(b) if file_start < b.as_slice()) {
                    begin = Some(file_start.to_vec());
                    restart = true;
                }
                if matches!(&end, Some(e) if file_limit > e.as_slice()) {
                    end = Some(file_limit.to_vec());
                    restart = true;
                }
                if restart {
                    inputs.clear();
                    i = 0;
                }
            }
        }
        inputs
    }

    /// Level a flushed memtable covering `[smallest, largest]` should land at.
    ///
    /// Pushed below level 0 while the next level has no overlap and the
    /// level after that would not drag in more than `max_grandparent_bytes`.
    pub fn pick_level_for_memtable_output(
        &self,
        smallest: &[u8],
        largest: &[u8],
        max_level: usize,
        max_grandparent_bytes: u64,
    ) -> usize {
        let mut level = 0;
        if self.overlap_in_level(0, Some(smallest), Some(largest)) {
            return level;
        }
        while level < max_level {
            if self.overlap_in_level(level + 1, Some(smallest), Some(largest)) {
                break;
            }
            if level + 2 < NUM_LEVELS {
                let overlaps =
                    self.get_overlapping_inputs(level + 2, Some(smallest), Some(largest));
                if total_file_size(&overlaps) > max_grandparent_bytes {
                    break;
                }
            }
            level += 1;
        }
        level
    }

    /// Whether no file in a level deeper than `output_level` covers `user_key`
    pub fn is_base_level_for_key(&self, output_level: usize, user_key: &[u8]) -> bool {
        self.files
            .iter()
            .skip(output_level + 1)
            .all(|files| !files.iter().any(|f| f.contains_user_key(user_key)))
    }

    /// Per-level file listing
    pub fn debug_string(&self) -> String {
        let mut out = String::new();
        for (level, files) in self.files.iter().enumerate() {
            let _ = writeln!(out, "--- level {} ---", level);
            for f in files {
                let _ = writeln!(
                    out,
                    " {}:{}[{:?} .. {:?}]",
                    f.number, f.file_size, f.smallest, f.largest
                );
            }
        }
        out
    }
}
