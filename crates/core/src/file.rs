//! Logical file records.
//!
//! A logical file is what a client sees as "a file": one record per upload,
//! whether or not its bytes were deduplicated against an earlier upload.

use crate::hash::ContentHash;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

/// Content type recorded when the client does not declare one.
pub const DEFAULT_FILE_TYPE: &str = "application/octet-stream";

/// Maximum length of a stored filename, in characters.
pub const MAX_FILENAME_LEN: usize = 255;

/// Filename recorded when the client-declared name is empty.
const UNNAMED: &str = "unnamed";

/// Unique identifier for a logical file.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(Uuid);

impl FileId {
    /// Generate a new random file ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Parse from a string.
    pub fn parse(s: &str) -> crate::Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| crate::Error::InvalidFileId(format!("{s:?}: {e}")))
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for FileId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileId({})", self.0)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for FileId {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::parse(s)
    }
}

/// A logical file as recorded in the ledger. Never mutated after creation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalFile {
    pub id: FileId,
    pub original_filename: String,
    pub file_type: String,
    /// Logical byte length; always equal to the length of the blob at `digest`.
    pub size: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub uploaded_at: OffsetDateTime,
    pub digest: ContentHash,
}

/// Input for creating a logical file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewFile {
    pub original_filename: String,
    pub file_type: String,
    pub digest: ContentHash,
    pub size: u64,
}

impl NewFile {
    /// Build from client-declared metadata, normalising the filename and
    /// defaulting the content type.
    pub fn new(
        declared_filename: Option<&str>,
        declared_type: Option<&str>,
        digest: ContentHash,
        size: u64,
    ) -> Self {
        Self {
            original_filename: normalize_filename(declared_filename.unwrap_or_default()),
            file_type: normalize_file_type(declared_type),
            digest,
            size,
        }
    }
}

/// Reduce a client-declared filename to a safe display name.
///
/// Keeps only the final path component (either separator), drops control
/// characters and truncates to [`MAX_FILENAME_LEN`] characters.
pub fn normalize_filename(declared: &str) -> String {
    let base = declared.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .filter(|c| !c.is_control())
        .take(MAX_FILENAME_LEN)
        .collect();
    let trimmed = cleaned.trim();
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        UNNAMED.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Use the declared content type, or [`DEFAULT_FILE_TYPE`] when absent or blank.
pub fn normalize_file_type(declared: Option<&str>) -> String {
    match declared.map(str::trim) {
        Some(t) if !t.is_empty() => t.chars().filter(|c| !c.is_control()).collect(),
        _ => DEFAULT_FILE_TYPE.to_string(),
    }
}
