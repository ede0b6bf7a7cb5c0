//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid hash: {0}")]
    InvalidHash(String),

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("invalid blob state: {0}")]
    InvalidBlobState(String),

    #[error("invalid file id: {0}")]
    InvalidFileId(String),

    #[error("unknown query parameter: {0}")]
    UnknownQueryParam(String),

    #[error("invalid value for {param}: {reason}")]
    InvalidQueryValue { param: String, reason: String },
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
