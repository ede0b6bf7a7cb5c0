//! Multipart upload endpoint.

use crate::error::{ApiError, ApiResult};
use crate::handlers::common::FileResponse;
use crate::ingest::ingest;
use crate::state::AppState;
use axum::Json;
use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use larder_core::NewFile;
use larder_storage::SpoolError;
use serde::Serialize;
use tracing::instrument;

/// Name of the multipart part that carries the file.
pub const FILE_FIELD: &str = "file";

/// Response body for a recorded upload.
#[derive(Debug, Serialize)]
pub struct UploadResponse {
    #[serde(flatten)]
    pub file: FileResponse,
    /// True when the content was already stored and no bytes were written.
    pub deduplicated: bool,
}

/// POST /api/upload/ - Receive a file, deduplicate it and record it.
#[instrument(skip(state, multipart))]
pub async fn upload_file(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<(StatusCode, Json<UploadResponse>)> {
    let mut multipart =
        multipart.map_err(|e| ApiError::BadRequest(format!("expected multipart form data: {e}")))?;

    let limit = state.spool.limit();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(e, limit))?
    {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }

        let filename = field.file_name().map(str::to_owned);
        let content_type = field.content_type().map(str::to_owned);
        let spooled = state
            .spool
            .ingest(field)
            .await
            .map_err(|e| spool_error(e, limit))?;

        let new = NewFile::new(
            filename.as_deref(),
            content_type.as_deref(),
            *spooled.digest(),
            spooled.size(),
        );
        let ingested = ingest(&state, new, &spooled).await?;

        let body = UploadResponse {
            file: FileResponse::from_file(&ingested.file)?,
            deduplicated: ingested.deduplicated,
        };
        return Ok((StatusCode::CREATED, Json(body)));
    }

    Err(ApiError::NoFile)
}

// The request body limit surfaces as a multipart read error.
fn multipart_error(e: MultipartError, limit: u64) -> ApiError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::PayloadTooLarge { limit }
    } else {
        ApiError::BadRequest(format!("malformed multipart body: {}", e.body_text()))
    }
}

fn spool_error(e: SpoolError, limit: u64) -> ApiError {
    if let SpoolError::Body(source) = &e
        && let Some(multipart) = source.downcast_ref::<MultipartError>()
        && multipart.status() == StatusCode::PAYLOAD_TOO_LARGE
    {
        return ApiError::PayloadTooLarge { limit };
    }
    e.into()
}
