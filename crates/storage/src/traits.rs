//! The key/value seam that backends implement.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;
use time::OffsetDateTime;

/// Object content, delivered in backend-sized chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// Keys produced by a listing, in no particular order.
pub type KeyStream = Pin<Box<dyn Stream<Item = StorageResult<String>> + Send>>;

/// A flat key space of immutable objects.
///
/// Backends know nothing about digests; [`crate::BlobStore`] maps digests
/// to keys and adds verification on top.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Size and modification time, or `NotFound`.
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta>;

    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream>;

    /// Write a small object in one call.
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()>;

    /// Begin a chunked write. Nothing is visible under `key` until
    /// [`StreamingUpload::finish`] succeeds, and [`StreamingUpload::abort`]
    /// leaves no trace.
    async fn put_stream(&self, key: &str) -> StorageResult<Box<dyn StreamingUpload>>;

    /// Remove `key`, or fail with `NotFound` if it is absent.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Every key under `prefix`, including unpublished staging objects the
    /// backend exposes.
    async fn list_stream(&self, prefix: &str) -> StorageResult<KeyStream>;

    /// Short backend identifier for logs ("filesystem", "s3").
    fn backend_name(&self) -> &'static str;

    /// Startup probe. A misconfigured backend should fail here rather than
    /// on the first upload.
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct ObjectMeta {
    pub size: u64,
    /// Used by the orphan sweep's grace period; `None` when the backend
    /// cannot report it.
    pub last_modified: Option<OffsetDateTime>,
}

/// A write in progress.
#[async_trait]
pub trait StreamingUpload: Send {
    async fn write(&mut self, data: Bytes) -> StorageResult<()>;

    /// Publish the object, returning the number of bytes written.
    async fn finish(self: Box<Self>) -> StorageResult<u64>;

    /// Discard everything written so far.
    async fn abort(self: Box<Self>) -> StorageResult<()>;
}
