//! Shared handler helpers.

use crate::error::{ApiError, ApiResult};
use larder_core::{FileId, LogicalFile};
use serde::Serialize;
use time::format_description::well_known::Rfc3339;

/// Client-facing view of a logical file.
#[derive(Debug, Serialize)]
pub struct FileResponse {
    pub id: FileId,
    pub original_filename: String,
    pub file_type: String,
    pub size: u64,
    pub uploaded_at: String,
    /// Download URL for the file's bytes.
    pub file: String,
    pub sha256: String,
}

impl FileResponse {
    pub fn from_file(file: &LogicalFile) -> ApiResult<Self> {
        let uploaded_at = file
            .uploaded_at
            .format(&Rfc3339)
            .map_err(|e| ApiError::Internal(format!("failed to format upload time: {e}")))?;

        Ok(Self {
            id: file.id,
            original_filename: file.original_filename.clone(),
            file_type: file.file_type.clone(),
            size: file.size,
            uploaded_at,
            file: download_path(&file.id),
            sha256: file.digest.to_hex(),
        })
    }
}

pub fn download_path(id: &FileId) -> String {
    format!("/api/download/{id}/")
}

/// Parse a file id from a path segment.
///
/// A malformed id cannot name an existing file, so it is reported as 404.
pub fn parse_file_id(raw: &str) -> ApiResult<FileId> {
    FileId::parse(raw).map_err(|_| ApiError::NotFound(format!("file {raw} not found")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use larder_core::ContentHash;
    use time::macros::datetime;

    #[test]
    fn test_projection_links_download_and_digest() {
        let file = LogicalFile {
            id: FileId::new(),
            original_filename: "report.pdf".to_string(),
            file_type: "application/pdf".to_string(),
            size: 3,
            uploaded_at: datetime!(2024-03-01 12:30:00 UTC),
            digest: ContentHash::compute(b"pdf"),
        };

        let view = FileResponse::from_file(&file).unwrap();
        assert_eq!(view.file, format!("/api/download/{}/", file.id));
        assert_eq!(view.sha256, ContentHash::compute(b"pdf").to_hex());
        assert_eq!(view.uploaded_at, "2024-03-01T12:30:00Z");
    }

    #[test]
    fn test_malformed_id_is_not_found() {
        let err = parse_file_id("not-a-uuid").unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::NOT_FOUND);
    }
}
