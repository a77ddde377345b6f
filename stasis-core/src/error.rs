//! Error types for Stasis

use std::path::PathBuf;
use thiserror::Error;

/// Result type for Stasis operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Stasis
///
/// Not-found, not-modified and unsatisfiable ranges are negotiated
/// outcomes and never show up here.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Request path is malformed or escapes the root
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// A file could not be read during a build
    #[error("Failed to read {}: {source}", path.display())]
    ScanIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// One encoding failed for one file
    #[error("{encoding} compression failed for {}: {message}", path.display())]
    Compression {
        path: PathBuf,
        encoding: String,
        message: String,
    },

    /// A request arrived before the first snapshot was published
    #[error("Asset index is not ready")]
    IndexNotReady,

    /// Manifest error
    #[error("Manifest error: {0}")]
    Manifest(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a scan error for `path`
    pub fn scan_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::ScanIo {
            path: path.into(),
            source,
        }
    }
}
