//! Version set
//!
//! Owns the current [`Version`], the file-number allocator, the sequence and
//! log-number bookkeeping, and the manifest that makes all of them durable.
//! Also picks compactions: which files of which level to merge next.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use tracing::{info, warn};

use crate::config::{Config, GRANDPARENT_OVERLAP_FACTOR, NUM_LEVELS};
use crate::error::{Result, StrataError};
use crate::types::{InternalKey, SequenceNumber};
use crate::wal::{LogReader, LogWriter};

use super::filename::{
    descriptor_file_name, parse_file_name, read_current_file, set_current_file, FileType,
};
use super::merge::{EntrySource, LevelIterator, MergingIterator};
use super::table_cache::TableCache;
use super::version::{total_file_size, Version};
use super::version_edit::{FileMetaData, VersionEdit};

pub struct VersionSet {
    dir: PathBuf,
    table_cache: Arc<TableCache>,
    max_file_size: u64,
    level0_compaction_trigger: usize,

    next_file_number: u64,
    manifest_file_number: u64,
    last_sequence: SequenceNumber,
    log_number: u64,
    /// Log still being compacted when a previous manifest was written (0 if none)
    prev_log_number: u64,

    manifest: Option<LogWriter>,
    current: Arc<Version>,
    /// Every version handed out that may still be referenced
    live: Vec<Weak<Version>>,
    /// Per level, where the next size compaction starts
    compact_pointer: Vec<Option<InternalKey>>,
}

impl VersionSet {
    pub fn new(config: &Config, table_cache: Arc<TableCache>) -> Self {
        let current = Arc::new(Version::default());
        Self {
            dir: config.data_dir.clone(),
            table_cache,
            max_file_size: config.max_file_size as u64,
            level0_compaction_trigger: config.level0_compaction_trigger,
            next_file_number: 2,
            manifest_file_number: 0,
            last_sequence: 0,
            log_number: 0,
            prev_log_number: 0,
            manifest: None,
            live: vec![Arc::downgrade(&current)],
            current,
            compact_pointer: vec![None; NUM_LEVELS],
        }
    }

    /// Bootstrap an empty store: MANIFEST-000001 plus CURRENT
    pub fn create_new(dir: &Path) -> Result<()> {
        let mut edit = VersionEdit::new();
        edit.set_log_number(0);
        edit.set_next_file_number(2);
        edit.set_last_sequence(0);

        let manifest = descriptor_file_name(dir, 1);
        let result = (|| -> Result<()> {
            let mut writer = LogWriter::create(&manifest)?;
            writer.add_record(&edit.encode()?)?;
            writer.sync()?;
            set_current_file(dir, 1)
        })();
        if result.is_err() {
            let _ = fs::remove_file(&manifest);
        }
        result
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    /// Load the manifest named by CURRENT.
    ///
    /// Returns whether a new manifest must be written: false when the existing
    /// one is small enough to keep appending to.
    pub fn recover(&mut self) -> Result<bool> {
        let name = read_current_file(&self.dir)?;
        let path = self.dir.join(&name);
        let mut reader = LogReader::open(&path).map_err(|e| match e {
            StrataError::Io(io) if io.kind() == std::io::ErrorKind::NotFound => {
                StrataError::Corruption(format!("CURRENT points to a missing manifest: {}", name))
            }
            other => other,
        })?;

        let mut version = Version::default();
        let mut log_number = None;
        let mut prev_log_number = None;
        let mut next_file_number = None;
        let mut last_sequence = None;

        while let Some(record) = reader.read_record()? {
            let edit = VersionEdit::decode(&record)?;
            version = Self::apply(&version, &edit);
            for (level, key) in &edit.compact_pointers {
                self.compact_pointer[*level] = Some(key.clone());
            }
            log_number = edit.log_number.or(log_number);
            prev_log_number = edit.prev_log_number.or(prev_log_number);
            next_file_number = edit.next_file_number.or(next_file_number);
            last_sequence = edit.last_sequence.or(last_sequence);
        }
        if reader.was_truncated() {
            warn!(manifest = %name, "ignoring torn record at end of manifest");
        }

        let next_file_number = next_file_number.ok_or_else(|| {
            StrataError::Corruption("no next-file entry in manifest".to_string())
        })?;
        let log_number = log_number
            .ok_or_else(|| StrataError::Corruption("no log-number entry in manifest".to_string()))?;
        let last_sequence = last_sequence.ok_or_else(|| {
            StrataError::Corruption("no last-sequence entry in manifest".to_string())
        })?;
        let prev_log_number = prev_log_number.unwrap_or(0);

        self.manifest_file_number = next_file_number;
        self.next_file_number = next_file_number + 1;
        self.last_sequence = last_sequence;
        self.log_number = log_number;
        self.prev_log_number = prev_log_number;
        self.mark_file_number_used(prev_log_number);
        self.mark_file_number_used(log_number);

        self.finalize(&mut version);
        self.install(version);

        // Keep appending to the existing manifest while it stays small
        if let Some((number, FileType::Descriptor)) = parse_file_name(&name) {
            if reader.offset() < self.max_file_size {
                let writer = LogWriter::append_to(&path, reader.offset())?;
                self.manifest = Some(writer);
                self.manifest_file_number = number;
                info!(manifest = %name, "reusing manifest");
                return Ok(false);
            }
        }
        Ok(true)
    }

    // =========================================================================
    // Applying Edits
    // =========================================================================

    fn apply(base: &Version, edit: &VersionEdit) -> Version {
        let mut files = base.files.clone();
        for &(level, number) in &edit.deleted_files {
            files[level].retain(|f| f.number != number);
        }
        for (level, file) in &edit.new_files {
            files[*level].push(Arc::new(file.clone()));
        }
        for (level, level_files) in files.iter_mut().enumerate() {
            if level == 0 {
                level_files.sort_by_key(|f| f.number);
            } else {
                level_files.sort_by(|a, b| a.smallest.cmp(&b.smallest));
            }
        }
        Version {
            files,
            ..Version::default()
        }
    }

    /// Compute which level most needs compaction
    fn finalize(&self, version: &mut Version) {
        let mut best_level = 0;
        let mut best_score = -1.0;
        for level in 0..NUM_LEVELS - 1 {
            let score = if level == 0 {
                version.num_files(0) as f64 / self.level0_compaction_trigger as f64
            } else {
                version.level_bytes(level) as f64 / Config::max_bytes_for_level(level) as f64
            };
            if score > best_score {
                best_level = level;
                best_score = score;
            }
        }
        version.compaction_level = best_level;
        version.compaction_score = best_score;
    }

    fn install(&mut self, version: Version) {
        self.current = Arc::new(version);
        self.live.retain(|v| v.strong_count() > 0);
        self.live.push(Arc::downgrade(&self.current));
    }

    /// Everything needed to rebuild the current state from scratch
    fn snapshot_edit(&self) -> VersionEdit {
        let mut edit = VersionEdit::new();
        for (level, pointer) in self.compact_pointer.iter().enumerate() {
            if let Some(key) = pointer {
                edit.set_compact_pointer(level, key.clone());
            }
        }
        for (level, files) in self.current.files.iter().enumerate() {
            for file in files {
                edit.add_file(level, (**file).clone());
            }
        }
        edit
    }

    /// Durably record `edit` in the manifest, then make it current.
    ///
    /// Nothing changes in memory unless the manifest write succeeded.
    pub fn log_and_apply(&mut self, edit: &mut VersionEdit) -> Result<()> {
        match edit.log_number {
            Some(number) if number < self.log_number || number >= self.next_file_number => {
                return Err(StrataError::InvalidArgument(format!(
                    "log number {} outside [{}, {})",
                    number, self.log_number, self.next_file_number
                )));
            }
            Some(_) => {}
            None => edit.set_log_number(self.log_number),
        }
        if edit.prev_log_number.is_none() {
            edit.set_prev_log_number(self.prev_log_number);
        }
        edit.set_next_file_number(self.next_file_number);
        edit.set_last_sequence(self.last_sequence);

        let mut version = Self::apply(&self.current, edit);
        self.finalize(&mut version);

        let record = edit.encode()?;
        let (mut writer, created) = match self.manifest.take() {
            Some(writer) => (writer, false),
            None => {
                let path = descriptor_file_name(&self.dir, self.manifest_file_number);
                let mut writer = LogWriter::create(&path)?;
                if let Err(err) = self
                    .snapshot_edit()
                    .encode()
                    .and_then(|snapshot| writer.add_record(&snapshot))
                {
                    let _ = fs::remove_file(&path);
                    return Err(err);
                }
                (writer, true)
            }
        };

        let result = writer
            .add_record(&record)
            .and_then(|_| writer.sync())
            .and_then(|_| {
                if created {
                    set_current_file(&self.dir, self.manifest_file_number)
                } else {
                    Ok(())
                }
            });

        if let Err(err) = result {
            if created {
                let _ = fs::remove_file(writer.path());
            }
            // Start a fresh manifest next time rather than append after a torn record
            self.manifest_file_number = self.new_file_number();
            return Err(err);
        }

        self.manifest = Some(writer);
        for (level, key) in &edit.compact_pointers {
            self.compact_pointer[*level] = Some(key.clone());
        }
        if let Some(number) = edit.log_number {
            self.log_number = number;
        }
        if let Some(number) = edit.prev_log_number {
            self.prev_log_number = number;
        }
        self.install(version);
        Ok(())
    }

    // =========================================================================
    // Counters
    // =========================================================================

    pub fn current(&self) -> Arc<Version> {
        Arc::clone(&self.current)
    }

    pub fn new_file_number(&mut self) -> u64 {
        let number = self.next_file_number;
        self.next_file_number += 1;
        number
    }

    /// Give back a number from `new_file_number` that ended up unused
    pub fn reuse_file_number(&mut self, number: u64) {
        if self.next_file_number == number + 1 {
            self.next_file_number = number;
        }
    }

    /// Ensure future allocations stay above `number`
    pub fn mark_file_number_used(&mut self, number: u64) {
        if self.next_file_number <= number {
            self.next_file_number = number + 1;
        }
    }

    pub fn manifest_file_number(&self) -> u64 {
        self.manifest_file_number
    }

    pub fn log_number(&self) -> u64 {
        self.log_number
    }

    pub fn prev_log_number(&self) -> u64 {
        self.prev_log_number
    }

    pub fn last_sequence(&self) -> SequenceNumber {
        self.last_sequence
    }

    pub fn set_last_sequence(&mut self, sequence: SequenceNumber) {
        debug_assert!(sequence >= self.last_sequence);
        self.last_sequence = sequence;
    }

    pub fn num_level_files(&self, level: usize) -> usize {
        self.current.num_files(level)
    }

    pub fn num_level_bytes(&self, level: usize) -> u64 {
        self.current.level_bytes(level)
    }

    /// Add every table referenced by any live version
    pub fn add_live_files(&mut self, live: &mut HashSet<u64>) {
        self.live.retain(|v| v.strong_count() > 0);
        for version in self.live.iter().filter_map(Weak::upgrade) {
            for files in &version.files {
                live.extend(files.iter().map(|f| f.number));
            }
        }
    }

    pub fn needs_compaction(&self) -> bool {
        self.current.compaction_score >= 1.0
    }

    pub fn table_cache(&self) -> &Arc<TableCache> {
        &self.table_cache
    }

    pub fn max_grandparent_overlap_bytes(&self) -> u64 {
        GRANDPARENT_OVERLAP_FACTOR * self.max_file_size
    }

    /// "files[ n0 n1 ... ]"
    pub fn level_summary(&self) -> String {
        let counts: Vec<String> = (0..NUM_LEVELS)
            .map(|level| self.current.num_files(level).to_string())
            .collect();
        format!("files[ {} ]", counts.join(" "))
    }

    // =========================================================================
    // Compaction Picking
    // =========================================================================

    /// Pick the next size-triggered compaction, if any level is over budget
    pub fn pick_compaction(&mut self) -> Option<Compaction> {
        if !self.needs_compaction() {
            return None;
        }
        let level = self.current.compaction_level;
        let files = self.current.files(level);

        // Start after the key where the last compaction of this level stopped
        let first = match &self.compact_pointer[level] {
            Some(pointer) => files.iter().find(|f| &f.largest > pointer),
            None => None,
        }
        .or_else(|| files.first())?;

        let mut inputs = vec![Arc::clone(first)];
        if level == 0 {
            let (smallest, largest) = key_range(&inputs);
            inputs = self.current.get_overlapping_inputs(
                0,
                Some(smallest.user_key()),
                Some(largest.user_key()),
            );
        }

        let mut compaction = self.new_compaction(level, inputs);
        self.setup_other_inputs(&mut compaction);
        Some(compaction)
    }

    /// Compaction of the files in `level` overlapping `[begin, end]`.
    ///
    /// Above level 0 the inputs are cut once they reach one output file's
    /// worth of data, so one manual step never rewrites a whole level.
    pub fn compact_range(
        &mut self,
        level: usize,
        begin: Option<&InternalKey>,
        end: Option<&InternalKey>,
    ) -> Option<Compaction> {
        let mut inputs = self.current.get_overlapping_inputs(
            level,
            begin.map(InternalKey::user_key),
            end.map(InternalKey::user_key),
        );
        if inputs.is_empty() {
            return None;
        }

        if level > 0 {
            let limit = self.max_file_size;
            let mut total = 0;
            for i in 0..inputs.len() {
                total += inputs[i].file_size;
                if total >= limit {
                    inputs.truncate(i + 1);
                    break;
                }
            }
        }

        let mut compaction = self.new_compaction(level, inputs);
        self.setup_other_inputs(&mut compaction);
        Some(compaction)
    }

    fn new_compaction(&self, level: usize, inputs: Vec<Arc<FileMetaData>>) -> Compaction {
        Compaction {
            level,
            max_output_file_size: self.max_file_size,
            max_grandparent_overlap: self.max_grandparent_overlap_bytes(),
            input_version: self.current(),
            inputs: [inputs, Vec::new()],
            grandparents: Vec::new(),
            grandparent_index: 0,
            seen_key: false,
            overlapped_bytes: 0,
            edit: VersionEdit::new(),
        }
    }

    fn setup_other_inputs(&mut self, c: &mut Compaction) {
        let level = c.level;
        let (smallest, largest) = key_range(&c.inputs[0]);
        c.inputs[1] = self.current.get_overlapping_inputs(
            level + 1,
            Some(smallest.user_key()),
            Some(largest.user_key()),
        );

        let all: Vec<Arc<FileMetaData>> =
            c.inputs[0].iter().chain(c.inputs[1].iter()).cloned().collect();
        let (all_start, all_limit) = key_range(&all);
        if level + 2 < NUM_LEVELS {
            c.grandparents = self.current.get_overlapping_inputs(
                level + 2,
                Some(all_start.user_key()),
                Some(all_limit.user_key()),
            );
        }

        // Next compaction of this level starts after this one's range
        self.compact_pointer[level] = Some(largest.clone());
        c.edit.set_compact_pointer(level, largest);
    }
}

/// Smallest and largest internal key across `files` (must be non-empty)
fn key_range(files: &[Arc<FileMetaData>]) -> (InternalKey, InternalKey) {
    let mut smallest = &files[0].smallest;
    let mut largest = &files[0].largest;
    for f in &files[1..] {
        if f.smallest < *smallest {
            smallest = &f.smallest;
        }
        if f.largest > *largest {
            largest = &f.largest;
        }
    }
    (smallest.clone(), largest.clone())
}

// =============================================================================
// Compaction
// =============================================================================

/// One picked compaction: inputs from `level` and `level + 1`
pub struct Compaction {
    level: usize,
    max_output_file_size: u64,
    max_grandparent_overlap: u64,
    /// Pins the input files for the duration of the job
    input_version: Arc<Version>,
    pub(crate) inputs: [Vec<Arc<FileMetaData>>; 2],
    /// Overlapping files in `level + 2`
    grandparents: Vec<Arc<FileMetaData>>,
    grandparent_index: usize,
    seen_key: bool,
    overlapped_bytes: u64,
    pub(crate) edit: VersionEdit,
}

impl Compaction {
    pub fn level(&self) -> usize {
        self.level
    }

    pub fn output_level(&self) -> usize {
        self.level + 1
    }

    pub fn num_input_files(&self, which: usize) -> usize {
        self.inputs[which].len()
    }

    pub fn input(&self, which: usize, i: usize) -> &Arc<FileMetaData> {
        &self.inputs[which][i]
    }

    pub fn max_output_file_size(&self) -> u64 {
        self.max_output_file_size
    }

    pub fn input_bytes(&self) -> u64 {
        total_file_size(&self.inputs[0]) + total_file_size(&self.inputs[1])
    }

    /// A single input file with nothing to merge against can simply be
    /// relinked one level down, unless that would leave it overlapping too
    /// much of the grandparent level.
    pub fn is_trivial_move(&self) -> bool {
        self.num_input_files(0) == 1
            && self.num_input_files(1) == 0
            && total_file_size(&self.grandparents) <= self.max_grandparent_overlap
    }

    /// Mark every input file deleted in `edit`
    pub fn add_input_deletions(&self, edit: &mut VersionEdit) {
        for (which, files) in self.inputs.iter().enumerate() {
            for file in files {
                edit.remove_file(self.level + which, file.number);
            }
        }
    }

    /// True if no level below the output holds data for `user_key`
    pub fn is_base_level_for_key(&self, user_key: &[u8]) -> bool {
        self.input_version
            .is_base_level_for_key(self.output_level(), user_key)
    }

    /// Whether the current output should be closed before `key` to bound the
    /// overlap between one output file and the grandparent level
    pub fn should_stop_before(&mut self, key: &InternalKey) -> bool {
        while self.grandparent_index < self.grandparents.len()
            && *key > self.grandparents[self.grandparent_index].largest
        {
            if self.seen_key {
                self.overlapped_bytes += self.grandparents[self.grandparent_index].file_size;
            }
            self.grandparent_index += 1;
        }
        self.seen_key = true;

        if self.overlapped_bytes > self.max_grandparent_overlap {
            self.overlapped_bytes = 0;
            true
        } else {
            false
        }
    }

    /// Merged stream over every input file
    pub fn input_iterator(&self, cache: &Arc<TableCache>) -> Result<MergingIterator> {
        let mut sources: Vec<EntrySource> = Vec::new();
        if self.level == 0 {
            for file in &self.inputs[0] {
                sources.push(Box::new(cache.iter(file.number)?));
            }
        } else {
            sources.push(Box::new(LevelIterator::new(
                Arc::clone(cache),
                self.inputs[0].clone(),
            )));
        }
        if !self.inputs[1].is_empty() {
            sources.push(Box::new(LevelIterator::new(
                Arc::clone(cache),
                self.inputs[1].clone(),
            )));
        }
        Ok(MergingIterator::new(sources))
    }

    /// Files of the input version (for logging)
    pub fn input_version(&self) -> &Arc<Version> {
        &self.input_version
    }
}
