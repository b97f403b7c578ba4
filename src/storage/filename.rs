//! Store file naming
//!
//! Every file in a store directory is one of:
//! `NNNNNN.log`, `NNNNNN.map`, `NNNNNN.sst`, `NNNNNN.dbtmp`,
//! `MANIFEST-NNNNNN`, `CURRENT`, `LOCK`.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Result, StrataError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Log,
    Map,
    Table,
    Descriptor,
    Current,
    Lock,
    Temp,
}

pub fn log_file_name(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{:06}.log", number))
}

pub fn map_file_name(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{:06}.map", number))
}

pub fn table_file_name(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{:06}.sst", number))
}

pub fn temp_file_name(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{:06}.dbtmp", number))
}

pub fn descriptor_file_name(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("MANIFEST-{:06}", number))
}

pub fn current_file_name(dir: &Path) -> PathBuf {
    dir.join("CURRENT")
}

pub fn lock_file_name(dir: &Path) -> PathBuf {
    dir.join("LOCK")
}

/// Classify a directory entry by name
pub fn parse_file_name(name: &str) -> Option<(u64, FileType)> {
    match name {
        "CURRENT" => return Some((0, FileType::Current)),
        "LOCK" => return Some((0, FileType::Lock)),
        _ => {}
    }
    if let Some(rest) = name.strip_prefix("MANIFEST-") {
        return rest.parse().ok().map(|n| (n, FileType::Descriptor));
    }
    let (stem, ext) = name.split_once('.')?;
    let number: u64 = stem.parse().ok()?;
    let kind = match ext {
        "log" => FileType::Log,
        "map" => FileType::Map,
        "sst" => FileType::Table,
        "dbtmp" => FileType::Temp,
        _ => return None,
    };
    Some((number, kind))
}

/// List `(number, type, path)` for every recognised file in `dir`
pub fn list_store_files(dir: &Path) -> Result<Vec<(u64, FileType, PathBuf)>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            if let Some((number, kind)) = parse_file_name(name) {
                files.push((number, kind, entry.path()));
            }
        }
    }
    Ok(files)
}

/// Point CURRENT at `MANIFEST-{number}` atomically (temp file + rename)
pub fn set_current_file(dir: &Path, descriptor_number: u64) -> Result<()> {
    let manifest = descriptor_file_name(dir, descriptor_number);
    let name = manifest
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| StrataError::InvalidArgument("bad manifest name".to_string()))?;

    let tmp = temp_file_name(dir, descriptor_number);
    let result = (|| -> Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(name.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_all()?;
        fs::rename(&tmp, current_file_name(dir))?;
        Ok(())
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// Read the manifest name stored in CURRENT
pub fn read_current_file(dir: &Path) -> Result<String> {
    let contents = fs::read_to_string(current_file_name(dir))?;
    let name = contents
        .strip_suffix('\n')
        .ok_or_else(|| StrataError::Corruption("CURRENT file does not end with newline".to_string()))?;
    if name.is_empty() {
        return Err(StrataError::Corruption("CURRENT file is empty".to_string()));
    }
    Ok(name.to_string())
}
