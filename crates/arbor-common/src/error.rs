//! Error types for ArborDB.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using ArborError.
pub type Result<T> = std::result::Result<T, ArborError>;

/// Errors that can occur in ArborDB operations.
#[derive(Debug, Error)]
pub enum ArborError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{op} failed for {}: {source}", .path.display())]
    IoAt {
        op: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },

    // Structural errors
    #[error("corrupt changeset: {0}")]
    Corrupt(String),

    #[error("kv log corrupted at offset {offset}: {reason}")]
    KvLogCorrupted { offset: u64, reason: String },

    #[error("node {node_id:#018x} not found in changeset starting at version {start_version}")]
    NodeNotFound { node_id: u64, start_version: u32 },

    #[error("no changeset found for version {0}")]
    NoChangeset(u32),

    #[error("hash mismatch: expected {expected}, computed {computed}")]
    HashMismatch { expected: String, computed: String },

    #[error("AVL balance violated at node {node_id:#018x}: balance factor {balance}")]
    BadBalance { node_id: u64, balance: i32 },

    #[error("tree structure error: {0}")]
    Structure(String),

    // Contract errors
    #[error("key must not be empty")]
    EmptyKey,

    #[error("value must not be empty")]
    EmptyValue,

    #[error("key size {size} exceeds maximum {max}")]
    KeyTooLarge { size: usize, max: usize },

    #[error("value size {size} exceeds maximum {max}")]
    ValueTooLarge { size: usize, max: usize },

    #[error("version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u32, actual: u32 },

    #[error("invalid option: {name} = {value}")]
    InvalidOption { name: &'static str, value: String },

    // Race errors
    #[error("changeset disposed")]
    Disposed,

    // Compaction errors
    #[error("compaction aborted: {0}")]
    CompactionAborted(String),

    // Lifecycle errors
    #[error("tree store closed")]
    Closed,
}

impl ArborError {
    /// Wraps an I/O error with the failing operation and file path.
    pub fn io_at(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ArborError::IoAt {
            op,
            path: path.into(),
            source,
        }
    }

    /// Returns true if this error indicates a lookup/dispose race that
    /// callers may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ArborError::Disposed)
    }
}
