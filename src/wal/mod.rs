//! Write-Ahead Log (WAL) Module
//!
//! Provides durability guarantees through append-only logging.
//!
//! ## Responsibilities
//! - Append one framed record per committed write group
//! - CRC32 checksums for corruption detection
//! - Sequential replay with corruption offsets for recovery
//!
//! The same framing carries manifest records (serialized version edits).
//!
//! ## File Format
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ Record 1                                │
//! │ ┌─────────┬─────────┬─────────────────┐ │
//! │ │ CRC (4) │ Len (4) │ Payload         │ │
//! │ └─────────┴─────────┴─────────────────┘ │
//! ├─────────────────────────────────────────┤
//! │ Record 2                                │
//! │ ┌─────────┬─────────┬─────────────────┐ │
//! │ │ CRC (4) │ Len (4) │ Payload         │ │
//! │ └─────────┴─────────┴─────────────────┘ │
//! └─────────────────────────────────────────┘
//! ```
//! The CRC covers the length field and the payload.

mod record;
mod writer;
mod reader;
mod recovery;

pub use record::{frame_record, record_checksum, HEADER_SIZE};
pub use writer::LogWriter;
pub use reader::LogReader;
pub use recovery::{RecoveryResult, WalRecovery};
