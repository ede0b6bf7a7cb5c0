//! API error types.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use larder_metadata::MetadataError;
use larder_storage::{SpoolError, StorageError};
use serde::Serialize;

/// API error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error code for programmatic handling.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
}

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("no file provided")]
    NoFile,

    #[error("upload exceeds the maximum size of {limit} bytes")]
    PayloadTooLarge { limit: u64 },

    #[error("conflict: {0}")]
    Conflict(String),

    /// The ledger references bytes that storage cannot produce intact.
    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("{0}")]
    Core(#[from] larder_core::Error),
}

impl ApiError {
    /// Get the error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::BadRequest(_) => "bad_request",
            Self::InvalidQuery(_) => "invalid_query",
            Self::NoFile => "no_file",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::Conflict(_) => "conflict",
            Self::Integrity(_) => "integrity_error",
            Self::Unavailable(_) => "service_unavailable",
            Self::Internal(_) => "internal_error",
            Self::Storage(StorageError::Timeout { .. }) => "storage_timeout",
            Self::Storage(_) => "storage_error",
            Self::Metadata(MetadataError::NotFound(_)) => "not_found",
            Self::Metadata(e) if e.is_retryable() => "conflict",
            Self::Metadata(_) => "metadata_error",
            Self::Core(
                larder_core::Error::UnknownQueryParam(_)
                | larder_core::Error::InvalidQueryValue { .. },
            ) => "invalid_query",
            Self::Core(larder_core::Error::InvalidFileId(_)) => "not_found",
            Self::Core(_) => "bad_request",
        }
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) | Self::InvalidQuery(_) | Self::NoFile => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Integrity(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Storage(e) => match e {
                StorageError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Metadata(e) => match e {
                MetadataError::NotFound(_) => StatusCode::NOT_FOUND,
                e if e.is_retryable() => StatusCode::CONFLICT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Core(larder_core::Error::InvalidFileId(_)) => StatusCode::NOT_FOUND,
            Self::Core(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl From<SpoolError> for ApiError {
    fn from(e: SpoolError) -> Self {
        match e {
            SpoolError::TooLarge { limit } => ApiError::PayloadTooLarge { limit },
            SpoolError::Body(source) => {
                ApiError::BadRequest(format!("failed to read upload: {source}"))
            }
            SpoolError::Io(e) => ApiError::Internal(format!("failed to spool upload: {e}")),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::warn!(code = self.code(), error = %self, "request failed");
        }
        let body = ErrorResponse {
            code: self.code().to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;
