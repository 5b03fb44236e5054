//! Error types for store operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A log record could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// The record log is corrupted beyond a torn tail.
    #[error("store corrupted: {0}")]
    Corrupted(String),

    /// Another process holds the store directory.
    #[error("store directory is locked by another process: {0}")]
    Locked(PathBuf),

    /// `create` found an existing record.
    #[error("record already exists: {table}:{key}")]
    RecordExists {
        /// Table name.
        table: String,
        /// Record key.
        key: String,
    },

    /// Record content is not a document, or a key is unusable.
    #[error("invalid content: {0}")]
    InvalidContent(String),
}

impl StoreError {
    /// Creates a codec error.
    pub fn codec(message: impl std::fmt::Display) -> Self {
        Self::Codec(message.to_string())
    }

    /// Creates an invalid content error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidContent(message.into())
    }
}
