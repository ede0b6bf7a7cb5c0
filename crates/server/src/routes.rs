//! Route configuration.

use crate::handlers;
use crate::metrics::metrics_handler;
use crate::state::AppState;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

/// Room for multipart boundaries and part headers on top of the file bytes.
const MULTIPART_OVERHEAD: u64 = 64 * 1024;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let body_limit = state
        .config
        .server
        .max_upload_size
        .saturating_add(MULTIPART_OVERHEAD);
    let body_limit = usize::try_from(body_limit).unwrap_or(usize::MAX);

    let api_routes = Router::new()
        .route("/api/files/", get(handlers::list_files))
        .route(
            "/api/files/{id}/",
            get(handlers::get_file).delete(handlers::delete_file),
        )
        .route(
            "/api/upload/",
            post(handlers::upload_file).layer(DefaultBodyLimit::max(body_limit)),
        )
        .route("/api/download/{id}/", get(handlers::download_file))
        .route("/api/stats/savings/", get(handlers::get_savings))
        // Health check (unauthenticated for load balancers/k8s probes)
        .route("/api/health", get(handlers::health_check))
        // Maintenance
        .route("/api/admin/reclaim", post(handlers::trigger_reclaim))
        .route("/api/admin/audit", post(handlers::audit_refcounts));

    let mut router = Router::new().merge(api_routes);

    // When enabled, /metrics should be network-restricted to the scraper.
    if state.config.server.metrics_enabled {
        router = router.route("/metrics", get(metrics_handler));
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}
