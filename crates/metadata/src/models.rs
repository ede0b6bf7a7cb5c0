//! Database models mapping to the ledger schema.

use crate::error::{MetadataError, MetadataResult};
use larder_core::{BlobInfo, BlobState, ContentHash, FileId, LogicalFile};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// Logical file record.
#[derive(Debug, Clone, FromRow)]
pub struct FileRow {
    pub file_id: Uuid,
    pub original_filename: String,
    pub file_type: String,
    pub size: i64,
    pub digest: Vec<u8>,
    pub uploaded_at: OffsetDateTime,
}

impl TryFrom<FileRow> for LogicalFile {
    type Error = MetadataError;

    fn try_from(row: FileRow) -> MetadataResult<Self> {
        Ok(LogicalFile {
            id: FileId::from_uuid(row.file_id),
            original_filename: row.original_filename,
            file_type: row.file_type,
            size: to_u64("files.size", row.size)?,
            uploaded_at: row.uploaded_at,
            digest: decode_digest(&row.digest)?,
        })
    }
}

/// Physical blob record, one per distinct digest.
#[derive(Debug, Clone, FromRow)]
pub struct BlobRow {
    pub digest: Vec<u8>,
    pub byte_length: i64,
    pub object_key: String,
    pub ref_count: i64,
    pub state: String,
    pub created_at: OffsetDateTime,
    pub zeroed_at: Option<OffsetDateTime>,
}

impl BlobRow {
    pub fn content_hash(&self) -> MetadataResult<ContentHash> {
        decode_digest(&self.digest)
    }

    pub fn blob_state(&self) -> MetadataResult<BlobState> {
        self.state
            .parse()
            .map_err(|e: larder_core::Error| MetadataError::Internal(e.to_string()))
    }

    pub fn info(&self) -> MetadataResult<BlobInfo> {
        Ok(BlobInfo::new(
            self.content_hash()?,
            to_u64("blobs.byte_length", self.byte_length)?,
        ))
    }
}

pub(crate) fn decode_digest(bytes: &[u8]) -> MetadataResult<ContentHash> {
    ContentHash::from_slice(bytes).map_err(|e| MetadataError::Internal(e.to_string()))
}

pub(crate) fn to_u64(column: &str, value: i64) -> MetadataResult<u64> {
    u64::try_from(value)
        .map_err(|_| MetadataError::Internal(format!("{column} is negative: {value}")))
}

pub(crate) fn to_i64(column: &str, value: u64) -> MetadataResult<i64> {
    i64::try_from(value)
        .map_err(|_| MetadataError::Constraint(format!("{column} out of range: {value}")))
}
