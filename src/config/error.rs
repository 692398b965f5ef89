//! Settings error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from loading the settings file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read a settings file.
    #[error("failed to read settings file {path}: {source}")]
    Read {
        /// Path to the file that could not be read.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse a settings file.
    #[error("failed to parse settings file {path}: {source}")]
    Parse {
        /// Path to the file that could not be parsed.
        path: PathBuf,
        /// The underlying TOML parse error.
        #[source]
        source: toml::de::Error,
    },
}
