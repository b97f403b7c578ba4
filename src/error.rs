//! Error types for StrataKV
//!
//! Provides a unified error type for all operations. Errors are `Clone` so a
//! single failure can be handed to every writer folded into one commit group
//! and kept around as the sticky background error.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

/// Result type alias using StrataError
pub type Result<T> = std::result::Result<T, StrataError>;

/// Unified error type for StrataKV operations
#[derive(Debug, Clone, Error)]
pub enum StrataError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    // -------------------------------------------------------------------------
    // Data Errors
    // -------------------------------------------------------------------------
    /// Checksum or format violation in a log, manifest, table or map file
    #[error("Corruption: {0}")]
    Corruption(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Open / Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Another engine instance holds the LOCK file
    #[error("Database already in use: {}", .0.display())]
    Locked(PathBuf),

    // -------------------------------------------------------------------------
    // Transaction Errors
    // -------------------------------------------------------------------------
    /// Non-retryable conflict: the transaction must redo its logic
    #[error("Busy: {0}")]
    Busy(String),

    /// Retryable: not enough memtable history to certify the transaction
    #[error("Try again: {0}")]
    TryAgain(String),

    // -------------------------------------------------------------------------
    // Engine State Errors
    // -------------------------------------------------------------------------
    /// Sticky failure recorded by a flush, compaction or log append
    #[error("Background error: {0}")]
    Background(Box<StrataError>),

    #[error("Database is shutting down")]
    ShuttingDown,
}

impl From<std::io::Error> for StrataError {
    fn from(err: std::io::Error) -> Self {
        StrataError::Io(Arc::new(err))
    }
}

impl StrataError {
    /// Wrap an error as the sticky background error (idempotent)
    pub fn background(err: StrataError) -> Self {
        match err {
            StrataError::Background(_) => err,
            other => StrataError::Background(Box::new(other)),
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, StrataError::Busy(_))
    }

    pub fn is_try_again(&self) -> bool {
        matches!(self, StrataError::TryAgain(_))
    }

    pub fn is_corruption(&self) -> bool {
        match self {
            StrataError::Corruption(_) => true,
            StrataError::Background(inner) => inner.is_corruption(),
            _ => false,
        }
    }
}
