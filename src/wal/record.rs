//! Log record framing
//!
//! Shared by the log writer, the log reader and the persistent memtable.

use bytes::BufMut;

/// Record header: CRC (4) + Len (4) = 8 bytes
pub const HEADER_SIZE: usize = 8;

/// CRC over the little-endian length followed by the payload
pub fn record_checksum(payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&(payload.len() as u32).to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}

/// Build the on-disk bytes for one record
pub fn frame_record(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.put_u32_le(record_checksum(payload));
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(payload);
    buf
}
