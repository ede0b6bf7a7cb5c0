//! File listing, retrieval and deletion.

use crate::error::{ApiError, ApiResult};
use crate::handlers::common::{FileResponse, parse_file_id};
use crate::metrics;
use crate::reclaim::Reclaimer;
use crate::state::AppState;
use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use larder_core::ListQuery;
use tracing::instrument;

/// GET /api/files/ - List files matching the query filters.
#[instrument(skip(state, params))]
pub async fn list_files(
    State(state): State<AppState>,
    Query(params): Query<Vec<(String, String)>>,
) -> ApiResult<Json<Vec<FileResponse>>> {
    let query = ListQuery::from_pairs(params)?;
    let files = state.metadata.list_files(&query).await?;
    let body = files
        .iter()
        .map(FileResponse::from_file)
        .collect::<ApiResult<Vec<_>>>()?;
    Ok(Json(body))
}

/// GET /api/files/{id}/ - Retrieve one file.
#[instrument(skip(state))]
pub async fn get_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<FileResponse>> {
    let id = parse_file_id(&id)?;
    let file = state
        .metadata
        .get_file(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("file {id} not found")))?;
    Ok(Json(FileResponse::from_file(&file)?))
}

/// DELETE /api/files/{id}/ - Delete a file and drop its blob reference.
///
/// When the last reference goes, the blob is reclaimed right away if
/// `reclaim.immediate` is set. A failed reclaim is left to the background
/// reclaimer and never fails the request.
#[instrument(skip(state))]
pub async fn delete_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let id = parse_file_id(&id)?;
    let deleted = state.metadata.delete_file(&id).await?;
    metrics::DELETES.inc();
    tracing::info!(
        file_id = %id,
        digest = %deleted.file.digest,
        remaining_refs = deleted.remaining_refs,
        "file deleted"
    );

    if deleted.released_blob() && state.config.reclaim.immediate {
        let reclaimer = Reclaimer::from_state(&state);
        if let Err(e) = reclaimer.reclaim_digest(&deleted.file.digest).await {
            metrics::RECLAIM_ERRORS.inc();
            tracing::warn!(
                digest = %deleted.file.digest,
                error = %e,
                "immediate reclaim failed, leaving blob for the background reclaimer"
            );
        }
    }

    Ok(StatusCode::NO_CONTENT)
}
