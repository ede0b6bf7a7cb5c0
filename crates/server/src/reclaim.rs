//! Blob reclamation.
//!
//! Bytes are removed only for blobs the ledger has claimed. A pass:
//! 1. Drops expired upload pins.
//! 2. Claims unreferenced blobs in batches, removes their bytes, and deletes
//!    the rows (or returns them to `live` if removal failed).
//!
//! A `live` row with no references is never trusted to have bytes: removal
//! may have partly succeeded before a revert. Ingest rewrites the bytes in
//! that case, so reverting a failed claim is always safe.
//! 3. Sweeps storage for blob objects with no ledger row and for staging
//!    leftovers, both older than the orphan grace period.

use crate::metrics;
use crate::state::AppState;
use futures::StreamExt;
use larder_core::ContentHash;
use larder_core::config::ReclaimConfig;
use larder_metadata::models::BlobRow;
use larder_metadata::{MetadataResult, MetadataStore};
use larder_storage::backends::filesystem::STAGING_MARKER;
use larder_storage::{BlobStore, StorageResult};
use serde::Serialize;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::task::JoinHandle;

/// Counters for a reclaim pass.
#[derive(Debug, Default, Clone, Serialize, PartialEq, Eq)]
pub struct ReclaimReport {
    pub blobs_reclaimed: u64,
    pub bytes_reclaimed: u64,
    pub errors: u64,
    pub expired_pins_removed: u64,
    pub orphans_swept: u64,
    pub staging_files_removed: u64,
}

/// Removes bytes the ledger no longer references.
#[derive(Clone)]
pub struct Reclaimer {
    metadata: Arc<dyn MetadataStore>,
    blobs: BlobStore,
    config: ReclaimConfig,
}

impl Reclaimer {
    pub fn new(metadata: Arc<dyn MetadataStore>, blobs: BlobStore, config: ReclaimConfig) -> Self {
        Self {
            metadata,
            blobs,
            config,
        }
    }

    pub fn from_state(state: &AppState) -> Self {
        Self::new(
            state.metadata.clone(),
            state.blobs.clone(),
            state.config.reclaim.clone(),
        )
    }

    /// Reclaim a single blob if it is unreferenced and unpinned.
    ///
    /// Returns the number of bytes freed; zero if the blob was not claimable.
    pub async fn reclaim_digest(&self, digest: &ContentHash) -> MetadataResult<u64> {
        let Some(row) = self
            .metadata
            .claim_blob(digest, OffsetDateTime::now_utc())
            .await?
        else {
            return Ok(0);
        };

        let mut report = ReclaimReport::default();
        self.remove_claimed(&row, &mut report).await?;
        Ok(report.bytes_reclaimed)
    }

    /// Claim and remove unreferenced blobs until none remain.
    pub async fn reclaim_unreferenced(&self, report: &mut ReclaimReport) -> MetadataResult<()> {
        let batch_size = self.config.batch_size;
        loop {
            let claimed = self
                .metadata
                .claim_unreferenced(OffsetDateTime::now_utc(), batch_size)
                .await?;
            if claimed.is_empty() {
                return Ok(());
            }

            let errors_before = report.errors;
            for row in &claimed {
                self.remove_claimed(row, report).await?;
            }

            // Failed removals were reverted to live and would be claimed again.
            if claimed.len() < batch_size as usize || report.errors > errors_before {
                return Ok(());
            }
        }
    }

    async fn remove_claimed(&self, row: &BlobRow, report: &mut ReclaimReport) -> MetadataResult<()> {
        let digest = row.content_hash()?;
        match self.blobs.remove(&digest).await {
            Ok(()) => {
                if self.metadata.finish_reclaim(&digest).await? {
                    let bytes = u64::try_from(row.byte_length).unwrap_or_default();
                    report.blobs_reclaimed += 1;
                    report.bytes_reclaimed += bytes;
                    metrics::BLOBS_RECLAIMED.inc();
                    metrics::BYTES_RECLAIMED.inc_by(bytes);
                    tracing::debug!(digest = %digest, bytes, "blob reclaimed");
                }
            }
            Err(e) => {
                report.errors += 1;
                metrics::RECLAIM_ERRORS.inc();
                tracing::warn!(digest = %digest, error = %e, "failed to remove blob, keeping row");
                self.metadata.revert_reclaim(&digest).await?;
            }
        }
        Ok(())
    }

    /// Remove storage objects the ledger does not know about.
    pub async fn sweep_orphans(&self, report: &mut ReclaimReport) -> StorageResult<()> {
        let grace = self.config.orphan_grace();
        let mut keys = self.blobs.list_keys().await?;

        while let Some(key) = keys.next().await {
            let key = match key {
                Ok(key) => key,
                Err(e) => {
                    report.errors += 1;
                    metrics::RECLAIM_ERRORS.inc();
                    tracing::warn!(error = %e, "failed to list blob keys");
                    return Ok(());
                }
            };

            let digest = ContentHash::from_object_key(&key);
            let is_staging = key.contains(STAGING_MARKER);
            if digest.is_none() && !is_staging {
                continue;
            }

            if let Some(digest) = &digest {
                match self
                    .metadata
                    .is_tracked(digest, OffsetDateTime::now_utc())
                    .await
                {
                    Ok(false) => {}
                    Ok(true) => continue,
                    Err(e) => {
                        report.errors += 1;
                        tracing::warn!(key = %key, error = %e, "ledger lookup failed during sweep");
                        continue;
                    }
                }
            }

            let meta = match self.blobs.head_key(&key).await {
                Ok(meta) => meta,
                Err(e) if e.is_not_found() => continue,
                Err(e) => {
                    report.errors += 1;
                    tracing::warn!(key = %key, error = %e, "failed to stat object during sweep");
                    continue;
                }
            };
            let Some(modified) = meta.last_modified else {
                tracing::warn!(key = %key, "object has no modification time, skipping");
                continue;
            };
            let now = OffsetDateTime::now_utc();
            if now - modified < grace {
                continue;
            }

            match digest {
                Some(digest) => self.sweep_orphan(&digest, meta.size, now, report).await,
                None => match self.blobs.delete_key(&key).await {
                    Ok(()) => {
                        report.staging_files_removed += 1;
                        tracing::info!(key = %key, "removed stale staging file");
                    }
                    Err(e) => {
                        report.errors += 1;
                        metrics::RECLAIM_ERRORS.inc();
                        tracing::warn!(key = %key, error = %e, "failed to remove staging file");
                    }
                },
            }
        }
        Ok(())
    }

    async fn sweep_orphan(
        &self,
        digest: &ContentHash,
        size: u64,
        now: OffsetDateTime,
        report: &mut ReclaimReport,
    ) {
        let outcome: Result<bool, String> = async {
            if !self
                .metadata
                .claim_orphan(digest, size, now)
                .await
                .map_err(|e| e.to_string())?
            {
                return Ok(false);
            }
            if let Err(e) = self.blobs.remove(digest).await {
                self.metadata
                    .revert_reclaim(digest)
                    .await
                    .map_err(|e| e.to_string())?;
                return Err(e.to_string());
            }
            self.metadata
                .finish_reclaim(digest)
                .await
                .map_err(|e| e.to_string())?;
            Ok(true)
        }
        .await;

        match outcome {
            Ok(true) => {
                report.orphans_swept += 1;
                report.bytes_reclaimed += size;
                metrics::ORPHANS_SWEPT.inc();
                metrics::BYTES_RECLAIMED.inc_by(size);
                tracing::info!(digest = %digest, bytes = size, "removed orphaned blob");
            }
            Ok(false) => {}
            Err(e) => {
                report.errors += 1;
                metrics::RECLAIM_ERRORS.inc();
                tracing::warn!(digest = %digest, error = %e, "failed to sweep orphaned blob");
            }
        }
    }

    /// Run one full pass.
    pub async fn run_pass(&self) -> MetadataResult<ReclaimReport> {
        let mut report = ReclaimReport {
            expired_pins_removed: self
                .metadata
                .delete_expired_pins(OffsetDateTime::now_utc())
                .await?,
            ..Default::default()
        };

        self.reclaim_unreferenced(&mut report).await?;

        if let Err(e) = self.sweep_orphans(&mut report).await {
            report.errors += 1;
            metrics::RECLAIM_ERRORS.inc();
            tracing::warn!(error = %e, "orphan sweep failed");
        }

        tracing::info!(
            blobs_reclaimed = report.blobs_reclaimed,
            bytes_reclaimed = report.bytes_reclaimed,
            orphans_swept = report.orphans_swept,
            staging_files_removed = report.staging_files_removed,
            expired_pins_removed = report.expired_pins_removed,
            errors = report.errors,
            "reclaim pass finished"
        );
        Ok(report)
    }

    /// Finish claims left behind by a previous process.
    ///
    /// The interrupted pass may already have removed the bytes, so each claim
    /// is carried forward rather than released. Must run before any pass
    /// starts. Returns how many claims were finished.
    pub async fn recover(&self) -> MetadataResult<u64> {
        let stale = self.metadata.stale_claims().await?;
        if stale.is_empty() {
            return Ok(0);
        }

        let mut report = ReclaimReport::default();
        for row in &stale {
            self.remove_claimed(row, &mut report).await?;
        }
        tracing::warn!(
            claims = stale.len(),
            finished = report.blobs_reclaimed,
            errors = report.errors,
            "finished reclaim claims from a previous run"
        );
        Ok(report.blobs_reclaimed)
    }

    /// Run passes forever on the configured interval.
    pub fn spawn(self) -> JoinHandle<()> {
        let interval = self.config.interval();
        tokio::spawn(async move {
            tracing::info!(interval_secs = interval.as_secs(), "background reclaimer started");
            loop {
                tokio::time::sleep(interval).await;
                if let Err(e) = self.run_pass().await {
                    metrics::RECLAIM_ERRORS.inc();
                    tracing::error!(error = %e, "reclaim pass failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use larder_core::{BlobInfo, NewFile};
    use larder_metadata::{IngestStart, SqliteStore};
    use larder_storage::{FilesystemBackend, ObjectStore};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        metadata: Arc<dyn MetadataStore>,
        backend: Arc<dyn ObjectStore>,
        reclaimer: Reclaimer,
    }

    async fn fixture(orphan_grace_secs: u64) -> Fixture {
        let temp = tempfile::tempdir().unwrap();
        let backend: Arc<dyn ObjectStore> =
            Arc::new(FilesystemBackend::new(temp.path().join("blobs")).await.unwrap());
        let metadata: Arc<dyn MetadataStore> = Arc::new(
            SqliteStore::new(temp.path().join("ledger.db"), None)
                .await
                .unwrap(),
        );
        let config = ReclaimConfig {
            orphan_grace_secs,
            batch_size: 2,
            ..Default::default()
        };
        let blobs = BlobStore::new(backend.clone(), Duration::from_secs(5));
        let reclaimer = Reclaimer::new(metadata.clone(), blobs, config);
        Fixture {
            _temp: temp,
            metadata,
            backend,
            reclaimer,
        }
    }

    async fn store_file(f: &Fixture, name: &str, data: &'static [u8]) -> NewFile {
        let digest = ContentHash::compute(data);
        let info = BlobInfo::new(digest, data.len() as u64);
        f.reclaimer
            .blobs
            .store(
                &info,
                futures::stream::iter([Ok(Bytes::from_static(data))]),
            )
            .await
            .unwrap();
        let new = NewFile::new(Some(name), None, digest, data.len() as u64);
        f.metadata.create_file(&new, None).await.unwrap();
        new
    }

    #[tokio::test]
    async fn test_reclaim_digest_removes_unreferenced_bytes() {
        let f = fixture(3600).await;
        let new = store_file(&f, "a.txt", b"reclaim me").await;
        let file = f.metadata.list_files(&Default::default()).await.unwrap()[0].clone();

        assert_eq!(f.reclaimer.reclaim_digest(&new.digest).await.unwrap(), 0);

        f.metadata.delete_file(&file.id).await.unwrap();
        assert_eq!(f.reclaimer.reclaim_digest(&new.digest).await.unwrap(), 10);
        assert!(!f.reclaimer.blobs.exists(&new.digest).await.unwrap());
        assert!(f.metadata.get_blob(&new.digest).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_run_pass_reclaims_across_batches() {
        let f = fixture(3600).await;
        for (name, data) in [
            ("a", &b"one"[..]),
            ("b", &b"two"[..]),
            ("c", &b"three"[..]),
        ] {
            let digest = ContentHash::compute(data);
            let info = BlobInfo::new(digest, data.len() as u64);
            f.reclaimer
                .blobs
                .store(&info, futures::stream::iter([Ok(Bytes::copy_from_slice(data))]))
                .await
                .unwrap();
            let new = NewFile::new(Some(name), None, digest, data.len() as u64);
            let created = f.metadata.create_file(&new, None).await.unwrap();
            f.metadata.delete_file(&created.file.id).await.unwrap();
        }

        let report = f.reclaimer.run_pass().await.unwrap();
        assert_eq!(report.blobs_reclaimed, 3);
        assert_eq!(report.bytes_reclaimed, 11);
        assert_eq!(report.errors, 0);
    }

    #[tokio::test]
    async fn test_pinned_blob_survives_pass() {
        let f = fixture(0).await;
        let data = b"in flight";
        let digest = ContentHash::compute(data);
        let new = NewFile::new(Some("x"), None, digest, data.len() as u64);
        let expires = OffsetDateTime::now_utc() + time::Duration::minutes(5);
        let IngestStart::Pinned(_) = f.metadata.begin_ingest(&new, expires).await.unwrap() else {
            panic!("expected a pin");
        };
        f.reclaimer
            .blobs
            .store(
                &BlobInfo::new(digest, data.len() as u64),
                futures::stream::iter([Ok(Bytes::from_static(data))]),
            )
            .await
            .unwrap();

        let report = f.reclaimer.run_pass().await.unwrap();
        assert_eq!(report.orphans_swept, 0);
        assert!(f.reclaimer.blobs.exists(&digest).await.unwrap());
    }

    #[tokio::test]
    async fn test_sweep_removes_orphans_after_grace() {
        let f = fixture(0).await;
        let data = b"nobody owns this";
        let digest = ContentHash::compute(data);
        f.backend
            .put(&digest.to_object_key(), Bytes::from_static(data))
            .await
            .unwrap();
        let staging = format!("{}{STAGING_MARKER}leftover", digest.to_object_key());
        f.backend
            .put(&staging, Bytes::from_static(b"partial"))
            .await
            .unwrap();

        let mut report = ReclaimReport::default();
        f.reclaimer.sweep_orphans(&mut report).await.unwrap();

        assert_eq!(report.orphans_swept, 1);
        assert_eq!(report.staging_files_removed, 1);
        assert!(!f.backend.exists(&digest.to_object_key()).await.unwrap());
        assert!(!f.backend.exists(&staging).await.unwrap());
        assert!(f.metadata.get_blob(&digest).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sweep_keeps_recent_and_tracked_objects() {
        let f = fixture(3600).await;
        let data = b"fresh orphan";
        let digest = ContentHash::compute(data);
        f.backend
            .put(&digest.to_object_key(), Bytes::from_static(data))
            .await
            .unwrap();
        let tracked = store_file(&f, "kept.txt", b"tracked").await;

        let mut report = ReclaimReport::default();
        f.reclaimer.sweep_orphans(&mut report).await.unwrap();

        assert_eq!(report.orphans_swept, 0);
        assert!(f.backend.exists(&digest.to_object_key()).await.unwrap());
        assert!(f.reclaimer.blobs.exists(&tracked.digest).await.unwrap());
    }

    #[tokio::test]
    async fn test_recover_finishes_claims_whose_bytes_are_gone() {
        let f = fixture(3600).await;
        let new = store_file(&f, "a.txt", b"stale").await;
        let file = f.metadata.list_files(&Default::default()).await.unwrap()[0].clone();
        f.metadata.delete_file(&file.id).await.unwrap();
        f.metadata
            .claim_blob(&new.digest, OffsetDateTime::now_utc())
            .await
            .unwrap()
            .unwrap();
        // The previous run stopped between removing bytes and deleting the row.
        f.reclaimer.blobs.remove(&new.digest).await.unwrap();

        assert_eq!(f.reclaimer.recover().await.unwrap(), 1);
        assert!(f.metadata.get_blob(&new.digest).await.unwrap().is_none());
        assert!(f.metadata.stale_claims().await.unwrap().is_empty());

        // The same bytes uploaded again are written, not deduplicated.
        let expires = OffsetDateTime::now_utc() + time::Duration::minutes(5);
        assert!(matches!(
            f.metadata.begin_ingest(&new, expires).await.unwrap(),
            IngestStart::Pinned(_)
        ));
    }

    #[tokio::test]
    async fn test_recover_removes_bytes_still_present() {
        let f = fixture(3600).await;
        let new = store_file(&f, "b.txt", b"still here").await;
        let file = f.metadata.list_files(&Default::default()).await.unwrap()[0].clone();
        f.metadata.delete_file(&file.id).await.unwrap();
        f.metadata
            .claim_blob(&new.digest, OffsetDateTime::now_utc())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(f.reclaimer.recover().await.unwrap(), 1);
        assert!(!f.reclaimer.blobs.exists(&new.digest).await.unwrap());
        assert!(f.metadata.get_blob(&new.digest).await.unwrap().is_none());
        assert_eq!(f.reclaimer.recover().await.unwrap(), 0);
    }
}
