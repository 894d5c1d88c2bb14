//! Application-wide error types
//!
//! This module defines a centralized error type using `thiserror` for
//! clean error handling across the proxy engines and the store.

use thiserror::Error;

/// Application-wide error type
///
/// Storage and serialization variants carry the name of the failing
/// operation so write-path failures are diagnosable from the log line
/// alone.
#[derive(Debug, Error)]
pub enum AppError {
    /// Named session does not exist
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Configuration error (bad mode, missing target, invalid pattern)
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Storage/database error
    #[error("storage error: {0}")]
    StorageError(String),

    /// JSON serialization error
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Upstream transport failure while forwarding
    #[error("upstream error: {0}")]
    UpstreamError(String),

    /// Malformed client input
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Export/import file handling error
    #[error("export error: {0}")]
    ExportError(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(String),

    /// Generic error with custom message
    #[error("{0}")]
    Other(String),
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    /// Wrap a storage-layer cause with the operation that failed.
    pub fn storage(op: &str, err: impl std::fmt::Display) -> Self {
        Self::StorageError(format!("{op}: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        Self::StorageError(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        Self::UpstreamError(err.to_string())
    }
}
