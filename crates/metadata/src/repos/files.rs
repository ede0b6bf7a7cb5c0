//! Logical file repository.

use crate::error::MetadataResult;
use crate::repos::pins::PinId;
use async_trait::async_trait;
use larder_core::{FileId, ListQuery, LogicalFile, NewFile};
use time::OffsetDateTime;

/// Outcome of [`FileRepo::begin_ingest`].
#[derive(Debug, Clone)]
pub enum IngestStart {
    /// A referenced blob already held the bytes; the file is recorded and no
    /// storage write is needed.
    Deduplicated(LogicalFile),
    /// No referenced blob exists. The digest is pinned until the caller commits
    /// with [`FileRepo::create_file`] or releases the pin.
    Pinned(PinId),
    /// The blob is being reclaimed. Nothing was recorded; retry later.
    Reclaiming,
}

/// A file created by [`FileRepo::create_file`].
#[derive(Debug, Clone)]
pub struct CreatedFile {
    pub file: LogicalFile,
    /// True when the blob row existed before this call.
    pub deduplicated: bool,
}

/// A file removed by [`FileRepo::delete_file`].
#[derive(Debug, Clone)]
pub struct DeletedFile {
    pub file: LogicalFile,
    /// The blob's reference count after the decrement.
    pub remaining_refs: u64,
}

impl DeletedFile {
    /// Whether this deletion dropped the last reference to the blob.
    pub fn released_blob(&self) -> bool {
        self.remaining_refs == 0
    }
}

/// Repository for logical files and the references they hold on blobs.
#[async_trait]
pub trait FileRepo: Send + Sync {
    /// Start recording an upload whose bytes hash to `new.digest`.
    ///
    /// In one transaction: if a live blob with references exists its
    /// `ref_count` is incremented and the file inserted. Otherwise, unless the
    /// row is being reclaimed, a pin expiring at `pin_expires_at` is inserted
    /// and the caller must write the bytes before committing.
    async fn begin_ingest(
        &self,
        new: &NewFile,
        pin_expires_at: OffsetDateTime,
    ) -> MetadataResult<IngestStart>;

    /// Insert a file and take a reference on its blob.
    ///
    /// The blob row is created with `ref_count = 1` or incremented if another
    /// writer created it first. The bytes must already be in the blob store.
    /// When `pin` is given it is deleted in the same transaction.
    async fn create_file(&self, new: &NewFile, pin: Option<PinId>)
    -> MetadataResult<CreatedFile>;

    /// Delete a file and drop its reference. `NotFound` if the id is unknown.
    ///
    /// When the count reaches zero `zeroed_at` is recorded; bytes are removed
    /// later by the reclaimer, never inside this transaction.
    async fn delete_file(&self, id: &FileId) -> MetadataResult<DeletedFile>;

    async fn get_file(&self, id: &FileId) -> MetadataResult<Option<LogicalFile>>;

    /// Filtered and ordered listing. Ties on the sort key are broken by
    /// insertion order in the same direction.
    async fn list_files(&self, query: &ListQuery) -> MetadataResult<Vec<LogicalFile>>;
}
