//! Blob repository.
//!
//! Reclamation is a claim/remove/finish protocol. A claim moves an
//! unreferenced, unpinned row from `live` to `reclaiming` inside a write
//! transaction, so no new reference can be taken on it afterwards. The caller
//! removes the bytes outside any transaction and then either finishes (row
//! deleted) or reverts (row back to `live`).

use crate::error::MetadataResult;
use crate::models::BlobRow;
use async_trait::async_trait;
use larder_core::ContentHash;
use time::OffsetDateTime;

#[async_trait]
pub trait BlobRepo: Send + Sync {
    async fn get_blob(&self, digest: &ContentHash) -> MetadataResult<Option<BlobRow>>;

    /// Claim up to `limit` blobs with no references and no active pin.
    async fn claim_unreferenced(
        &self,
        now: OffsetDateTime,
        limit: u32,
    ) -> MetadataResult<Vec<BlobRow>>;

    /// Claim a single blob if it is unreferenced and unpinned.
    async fn claim_blob(
        &self,
        digest: &ContentHash,
        now: OffsetDateTime,
    ) -> MetadataResult<Option<BlobRow>>;

    /// Claim storage bytes that have no ledger row and no active pin.
    ///
    /// Inserts a `reclaiming` row with `ref_count = 0`, so an ingest racing
    /// with the orphan sweep waits for the sweep instead of reusing bytes
    /// that are about to disappear. Returns false if a row or pin exists.
    async fn claim_orphan(
        &self,
        digest: &ContentHash,
        byte_length: u64,
        now: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Delete a claimed row once its bytes are gone.
    ///
    /// Returns false if the row is no longer claimed or has references.
    async fn finish_reclaim(&self, digest: &ContentHash) -> MetadataResult<bool>;

    /// Return a claimed row to `live` after a failed storage removal.
    async fn revert_reclaim(&self, digest: &ContentHash) -> MetadataResult<()>;

    /// Rows left `reclaiming` by an interrupted pass.
    ///
    /// Their bytes may already be gone, so they are finished, never revived.
    async fn stale_claims(&self) -> MetadataResult<Vec<BlobRow>>;

    /// Whether a digest has a row or an active pin.
    async fn is_tracked(&self, digest: &ContentHash, now: OffsetDateTime)
    -> MetadataResult<bool>;
}
