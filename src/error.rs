//! Error types for the Ratewatch service.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for Ratewatch operations.
#[derive(Error, Debug)]
pub enum RatewatchError {
    /// Invalid window configuration (zero resolution, tick period below 1ms, ...)
    #[error("Invalid window configuration: {0}")]
    Construction(String),

    /// A snapshot could not be written to disk
    #[error("Failed to write snapshot {path}: {source}")]
    PersistenceWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A snapshot exists but could not be read
    #[error("Failed to read snapshot {path}: {source}")]
    PersistenceRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A snapshot was read but its content is malformed or inconsistent
    #[error("Failed to decode snapshot: {0}")]
    Decode(String),

    /// A snapshot could not be serialized
    #[error("Failed to encode snapshot: {0}")]
    Encode(#[from] serde_json::Error),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Ratewatch operations.
pub type Result<T> = std::result::Result<T, RatewatchError>;
