//! Ingest pipeline: ledger pin, blob write, ledger commit.
//!
//! A spooled upload is recorded in up to three steps. `begin_ingest` either
//! takes a reference on a blob that already has references (no write needed)
//! or pins the digest so the reclaimer leaves it alone. After a pin the bytes
//! are stored, rewritten if an unreferenced row had lost them, and
//! `create_file` commits the reference and drops the pin in one transaction. Ledger conflicts and blobs caught mid-reclaim are retried
//! with backoff.

use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::state::AppState;
use larder_core::{LogicalFile, NewFile};
use larder_metadata::{IngestStart, MetadataError, PinId};
use larder_storage::{SpooledUpload, StoreOutcome};
use time::OffsetDateTime;
use tracing::instrument;

/// A recorded upload.
#[derive(Debug, Clone)]
pub struct Ingested {
    pub file: LogicalFile,
    /// True when no new bytes were written for this upload.
    pub deduplicated: bool,
}

enum Attempt {
    Done(Ingested),
    Retry(String),
}

/// Record `upload` as a new logical file described by `new`.
#[instrument(skip(state, new, upload), fields(digest = %upload.digest(), size = upload.size()))]
pub async fn ingest(state: &AppState, new: NewFile, upload: &SpooledUpload) -> ApiResult<Ingested> {
    let ingest_config = &state.config.ingest;
    let mut last_conflict = String::new();

    for attempt in 0..=ingest_config.max_retries {
        if attempt > 0 {
            metrics::CONFLICT_RETRIES.inc();
            let delay = ingest_config.backoff(attempt);
            tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, reason = %last_conflict, "retrying ingest");
            tokio::time::sleep(delay).await;
        }

        match attempt_once(state, &new, upload).await? {
            Attempt::Done(ingested) => {
                metrics::UPLOADS.inc();
                metrics::BYTES_INGESTED.inc_by(ingested.file.size);
                if ingested.deduplicated {
                    metrics::UPLOADS_DEDUPLICATED.inc();
                }
                tracing::info!(
                    file_id = %ingested.file.id,
                    filename = %ingested.file.original_filename,
                    deduplicated = ingested.deduplicated,
                    "upload recorded"
                );
                return Ok(ingested);
            }
            Attempt::Retry(reason) => last_conflict = reason,
        }
    }

    tracing::warn!(
        retries = ingest_config.max_retries,
        reason = %last_conflict,
        "ingest gave up after repeated conflicts"
    );
    Err(ApiError::Conflict(format!(
        "upload could not be recorded after {} retries: {last_conflict}",
        ingest_config.max_retries
    )))
}

async fn attempt_once(
    state: &AppState,
    new: &NewFile,
    upload: &SpooledUpload,
) -> ApiResult<Attempt> {
    let pin_expires_at = OffsetDateTime::now_utc()
        .checked_add(state.config.ingest.pin_ttl())
        .ok_or_else(|| ApiError::Internal("upload pin expiry is out of range".to_string()))?;

    let pin = match state.metadata.begin_ingest(new, pin_expires_at).await {
        Ok(IngestStart::Deduplicated(file)) => {
            return Ok(Attempt::Done(Ingested {
                file,
                deduplicated: true,
            }));
        }
        Ok(IngestStart::Reclaiming) => {
            return Ok(Attempt::Retry("blob is being reclaimed".to_string()));
        }
        Ok(IngestStart::Pinned(pin)) => pin,
        Err(e) => return retry_or_fail(e),
    };

    match write_and_commit(state, new, upload, pin).await {
        Ok(ingested) => Ok(Attempt::Done(ingested)),
        Err(e) => {
            if let Err(release_err) = state.metadata.release_pin(pin).await {
                tracing::warn!(pin = %pin, error = %release_err, "failed to release upload pin");
            }
            match e {
                ApiError::Metadata(e) => retry_or_fail(e),
                other => Err(other),
            }
        }
    }
}

async fn write_and_commit(
    state: &AppState,
    new: &NewFile,
    upload: &SpooledUpload,
    pin: PinId,
) -> ApiResult<Ingested> {
    let content = upload.stream().await?;
    let outcome = state.blobs.store(upload.blob_info(), content).await?;
    if outcome == StoreOutcome::Written {
        metrics::BYTES_WRITTEN.inc_by(upload.size());
    }

    let created = state.metadata.create_file(new, Some(pin)).await?;
    Ok(Ingested {
        file: created.file,
        deduplicated: outcome == StoreOutcome::AlreadyPresent,
    })
}

fn retry_or_fail(e: MetadataError) -> ApiResult<Attempt> {
    if e.is_retryable() {
        Ok(Attempt::Retry(e.to_string()))
    } else {
        Err(e.into())
    }
}
