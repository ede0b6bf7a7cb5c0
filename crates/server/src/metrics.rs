//! Prometheus metrics for the larder server.
//!
//! Counters cover ingest, deletion, reclamation and integrity failures. The
//! `/metrics` endpoint is unauthenticated and should be network-restricted to
//! the scraper.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{self, Encoder, IntCounter, Registry, TextEncoder};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

fn counter(name: &str, help: &str) -> IntCounter {
    IntCounter::new(name, help).expect("metric creation failed")
}

// Ingest
pub static UPLOADS: LazyLock<IntCounter> =
    LazyLock::new(|| counter("larder_uploads_total", "Total uploads recorded"));

pub static UPLOADS_DEDUPLICATED: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "larder_uploads_deduplicated_total",
        "Uploads whose content was already stored",
    )
});

pub static BYTES_INGESTED: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "larder_bytes_ingested_total",
        "Logical bytes received in recorded uploads",
    )
});

pub static BYTES_WRITTEN: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "larder_bytes_written_total",
        "Bytes written to the blob store",
    )
});

pub static CONFLICT_RETRIES: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "larder_conflict_retries_total",
        "Ingest attempts retried after a ledger conflict",
    )
});

// Deletion and reclamation
pub static DELETES: LazyLock<IntCounter> =
    LazyLock::new(|| counter("larder_deletes_total", "Logical files deleted"));

pub static BLOBS_RECLAIMED: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "larder_blobs_reclaimed_total",
        "Unreferenced blobs removed from storage",
    )
});

pub static BYTES_RECLAIMED: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "larder_bytes_reclaimed_total",
        "Bytes freed by removing unreferenced blobs",
    )
});

pub static RECLAIM_ERRORS: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "larder_reclaim_errors_total",
        "Failures while reclaiming blobs or sweeping orphans",
    )
});

pub static ORPHANS_SWEPT: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "larder_orphans_swept_total",
        "Storage objects removed because no ledger row referenced them",
    )
});

// Integrity
pub static INTEGRITY_ERRORS: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "larder_integrity_errors_total",
        "Downloads whose blob was missing or had the wrong length",
    )
});

/// Guard to ensure metrics are only registered once.
static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry.
///
/// Idempotent, so tests can build as many routers as they like.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        let metrics: [&IntCounter; 11] = [
            &UPLOADS,
            &UPLOADS_DEDUPLICATED,
            &BYTES_INGESTED,
            &BYTES_WRITTEN,
            &CONFLICT_RETRIES,
            &DELETES,
            &BLOBS_RECLAIMED,
            &BYTES_RECLAIMED,
            &RECLAIM_ERRORS,
            &ORPHANS_SWEPT,
            &INTEGRITY_ERRORS,
        ];
        for metric in metrics {
            if let Err(e) = REGISTRY.register(Box::new(metric.clone())) {
                tracing::warn!(error = %e, "metric registration failed");
            }
        }
    });
}

/// GET /metrics - Prometheus metrics endpoint.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("Failed to encode metrics: {e}").into_bytes(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        register_metrics();
        register_metrics();
        UPLOADS.inc();

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&REGISTRY.gather(), &mut buffer)
            .unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.contains("larder_uploads_total"));
        assert!(text.contains("larder_integrity_errors_total"));
    }
}
