//! Error types for port scanning.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from scanning the host's socket tables.
#[derive(Debug, Error)]
pub enum ScanError {
    /// A socket table under /proc could not be read.
    #[error("failed to read {path}: {source}")]
    ReadFailed {
        /// The table that could not be read.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A socket table line did not parse.
    #[error("parse error: {0}")]
    Parse(String),
}

/// Result type for scan operations.
pub type ScanResult<T> = Result<T, ScanError>;
