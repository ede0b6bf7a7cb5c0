//! Storage savings endpoint.

use crate::error::ApiResult;
use crate::state::AppState;
use axum::Json;
use axum::extract::State;
use larder_core::Savings;

/// GET /api/stats/savings/ - Logical vs unique bytes, computed from the ledger.
pub async fn get_savings(State(state): State<AppState>) -> ApiResult<Json<Savings>> {
    let savings = state.metadata.get_savings().await?;
    Ok(Json(savings))
}
