//! Table cache
//!
//! Keeps one open [`SSTableReader`] per live table file so lookups do not
//! reload indexes. Readers are shared as `Arc`s; evicting a table only drops
//! the cache's handle.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::types::{Lookup, SequenceNumber};

use super::filename::table_file_name;
use super::sstable::{SSTableIterator, SSTableReader};

pub struct TableCache {
    dir: PathBuf,
    tables: Mutex<HashMap<u64, Arc<SSTableReader>>>,
}

impl TableCache {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            tables: Mutex::new(HashMap::new()),
        }
    }

    /// Open (or fetch the cached) reader for a table file
    pub fn find_table(&self, number: u64) -> Result<Arc<SSTableReader>> {
        if let Some(reader) = self.tables.lock().get(&number) {
            return Ok(Arc::clone(reader));
        }

        // Load outside the lock; a concurrent loader may win the insert
        let reader = Arc::new(SSTableReader::open(&table_file_name(&self.dir, number))?);
        let mut tables = self.tables.lock();
        Ok(Arc::clone(tables.entry(number).or_insert(reader)))
    }

    /// Point lookup in one table
    pub fn get(
        &self,
        number: u64,
        user_key: &[u8],
        sequence: SequenceNumber,
    ) -> Result<Option<Lookup>> {
        self.find_table(number)?.get(user_key, sequence)
    }

    /// Iterator over one table's entries
    pub fn iter(&self, number: u64) -> Result<SSTableIterator> {
        self.find_table(number)?.iter()
    }

    /// Forget a table that is about to be deleted
    pub fn evict(&self, number: u64) {
        self.tables.lock().remove(&number);
    }

    pub fn len(&self) -> usize {
        self.tables.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
