//! Error types for vmstore
//!
//! Provides a unified error type for all storage engine operations.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using StoreError
pub type Result<T> = std::result::Result<T, StoreError>;

/// Unified error type for vmstore operations
#[derive(Debug, Error)]
pub enum StoreError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Data file not found: {0}")]
    FileNotFound(PathBuf),

    // -------------------------------------------------------------------------
    // Contract Violations
    // -------------------------------------------------------------------------
    #[error("Index {index} is out of bounds (capacity {capacity}, min valid index {min_valid})")]
    IndexOutOfBounds {
        index: u64,
        capacity: u64,
        min_valid: u64,
    },

    #[error("Cannot store the reserved sentinel value {0}")]
    ImpermissibleValue(u64),

    #[error("Leaf records are not sorted by path: got path {path} after path {previous}")]
    UnsortedBatch { previous: u64, path: u64 },

    #[error("Contract violation: {0}")]
    ContractViolation(String),

    #[error("Writing session error: {0}")]
    WritingSession(String),

    #[error("Another commit is already in progress")]
    ConcurrentCommit,

    // -------------------------------------------------------------------------
    // Format Errors
    // -------------------------------------------------------------------------
    #[error("Unsupported file format version {found}, latest supported version is {supported}")]
    UnsupportedFormatVersion { found: u32, supported: u32 },

    #[error("Data corruption detected: {0}")]
    Corruption(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Data location overflow: {0}")]
    LocationOverflow(String),

    // -------------------------------------------------------------------------
    // Lifecycle Errors
    // -------------------------------------------------------------------------
    #[error("Data source is closed")]
    Closed,

    #[error("Timed out waiting for {0} to finish")]
    ShutdownTimeout(String),

    #[error("Background worker failed: {0}")]
    Worker(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<bincode::Error> for StoreError {
    fn from(e: bincode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}
