//! Point lock tracking
//!
//! Records which keys a transaction has read or written and the earliest
//! sequence number at which it observed each one.

use std::collections::HashMap;

use crate::types::SequenceNumber;

/// One observation of a key by a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointLockRequest {
    pub key: Vec<u8>,
    /// Sequence the key's state was observed at
    pub seq: SequenceNumber,
    /// A read (`GetForUpdate`) rather than a write
    pub read_only: bool,
    pub exclusive: bool,
}

/// Everything tracked about one key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackedKeyInfo {
    /// Earliest sequence the key was observed at
    pub seq: SequenceNumber,
    pub num_reads: u32,
    pub num_writes: u32,
    pub exclusive: bool,
}

impl TrackedKeyInfo {
    fn new(seq: SequenceNumber) -> Self {
        Self {
            seq,
            num_reads: 0,
            num_writes: 0,
            exclusive: false,
        }
    }
}

/// Lookup result for a single key
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PointLockStatus {
    pub locked: bool,
    pub exclusive: bool,
    pub seq: SequenceNumber,
}

/// Keys tracked by one transaction
#[derive(Debug, Default)]
pub struct PointLockTracker {
    tracked_keys: HashMap<Vec<u8>, TrackedKeyInfo>,
}

impl PointLockTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an observation. A later observation never raises the tracked
    /// sequence; it only adds to the counts and exclusivity.
    pub fn track(&mut self, request: PointLockRequest) {
        let info = self
            .tracked_keys
            .entry(request.key)
            .or_insert_with(|| TrackedKeyInfo::new(request.seq));
        if request.seq < info.seq {
            info.seq = request.seq;
        }
        if request.read_only {
            info.num_reads += 1;
        } else {
            info.num_writes += 1;
        }
        info.exclusive |= request.exclusive;
    }

    pub fn status(&self, key: &[u8]) -> PointLockStatus {
        match self.tracked_keys.get(key) {
            Some(info) => PointLockStatus {
                locked: true,
                exclusive: info.exclusive,
                seq: info.seq,
            },
            None => PointLockStatus::default(),
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<&TrackedKeyInfo> {
        self.tracked_keys.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &[u8]> {
        self.tracked_keys.keys().map(Vec::as_slice)
    }

    /// Each tracked key with its tracked sequence
    pub fn tracked_sequences(&self) -> Vec<(Vec<u8>, SequenceNumber)> {
        self.tracked_keys
            .iter()
            .map(|(key, info)| (key.clone(), info.seq))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tracked_keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracked_keys.is_empty()
    }

    pub fn clear(&mut self) {
        self.tracked_keys.clear();
    }
}
