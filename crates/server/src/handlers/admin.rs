//! Health and maintenance endpoints.

use crate::error::{ApiError, ApiResult};
use crate::reclaim::{ReclaimReport, Reclaimer};
use crate::state::AppState;
use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use larder_metadata::{AuditMode, RefcountAudit};
use serde::{Deserialize, Serialize};

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// GET /api/health - Health check.
///
/// Unauthenticated so load balancers and probes can reach it. Returns 503
/// when the ledger cannot be queried.
pub async fn health_check(State(state): State<AppState>) -> ApiResult<Json<HealthResponse>> {
    state
        .metadata
        .health_check()
        .await
        .map_err(|e| ApiError::Unavailable(format!("ledger unreachable: {e}")))?;

    Ok(Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    }))
}

/// POST /api/admin/reclaim - Run one reclaim pass now.
pub async fn trigger_reclaim(State(state): State<AppState>) -> ApiResult<Json<ReclaimReport>> {
    let report = Reclaimer::from_state(&state).run_pass().await?;
    Ok(Json(report))
}

/// Audit request body. An empty body means a dry run.
#[derive(Debug, Default, Deserialize)]
pub struct AuditRequest {
    #[serde(default)]
    pub mode: AuditMode,
}

/// POST /api/admin/audit - Compare blob reference counts with file rows.
pub async fn audit_refcounts(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<Json<RefcountAudit>> {
    let request: AuditRequest = if body.is_empty() {
        AuditRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("invalid JSON: {e}")))?
    };

    let audit = state.metadata.audit_refcounts(request.mode).await?;
    if !audit.discrepancies.is_empty() {
        tracing::warn!(
            mode = ?audit.mode,
            discrepancies = audit.discrepancies.len(),
            corrected = audit.corrected,
            "refcount audit found discrepancies"
        );
    }
    Ok(Json(audit))
}
