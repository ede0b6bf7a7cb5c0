//! Core domain types and shared logic for Larder.
//!
//! This crate defines the canonical data model used across all other crates:
//! - Content digests and streaming hashing
//! - Blob object keys derived from digests
//! - Logical file records and identifiers
//! - List filters and ordering for file queries
//! - Savings accounting

pub mod blob;
pub mod config;
pub mod error;
pub mod file;
pub mod hash;
pub mod query;
pub mod savings;

pub use blob::{BLOB_KEY_PREFIX, BlobInfo, BlobState};
pub use error::{Error, Result};
pub use file::{DEFAULT_FILE_TYPE, FileId, LogicalFile, MAX_FILENAME_LEN, NewFile};
pub use hash::{ContentHash, ContentHasher, hash_stream};
pub use query::{FileFilter, FileOrdering, ListQuery, OrderDirection, SortKey};
pub use savings::Savings;

/// Default maximum upload size: 1 GiB
pub const DEFAULT_MAX_UPLOAD_SIZE: u64 = 1024 * 1024 * 1024;
