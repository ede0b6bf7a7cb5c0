//! Digest-addressed blob storage on top of an [`ObjectStore`].
//!
//! Every blob lives under a key derived only from its digest. Writes are
//! staged, re-hashed while streaming, and published only when the digest and
//! length match what the caller claimed. Every backend call is bounded by a
//! timeout so a hung disk or network surfaces as [`StorageError::Timeout`].

use crate::error::{StorageError, StorageResult};
use crate::traits::{ByteStream, KeyStream, ObjectMeta, ObjectStore};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use larder_core::{BLOB_KEY_PREFIX, BlobInfo, ContentHash};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

/// Result of [`BlobStore::store`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreOutcome {
    /// The bytes were written and published by this call.
    Written,
    /// The blob was already present; the input stream was drained and discarded.
    AlreadyPresent,
}

/// Content-addressed blob store.
#[derive(Clone)]
pub struct BlobStore {
    backend: Arc<dyn ObjectStore>,
    timeout: Duration,
}

impl std::fmt::Debug for BlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobStore")
            .field("backend", &self.backend.backend_name())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl BlobStore {
    pub fn new(backend: Arc<dyn ObjectStore>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    pub fn backend(&self) -> &Arc<dyn ObjectStore> {
        &self.backend
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.backend_name()
    }

    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> StorageResult<T>
    where
        F: Future<Output = StorageResult<T>>,
    {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| StorageError::Timeout {
                operation,
                secs: self.timeout.as_secs(),
            })?
    }

    /// Check whether bytes exist for a digest.
    pub async fn exists(&self, digest: &ContentHash) -> StorageResult<bool> {
        let key = digest.to_object_key();
        self.bounded("blob exists", self.backend.exists(&key)).await
    }

    /// Persist `content` as the blob for `info.digest`.
    ///
    /// Safe to race with another `store` of the same digest: both writers
    /// stage privately and publish identical, verified bytes under the same
    /// key. If the blob is already present the stream is drained and
    /// discarded without touching the stored copy.
    #[instrument(skip(self, content), fields(digest = %info.digest, size = info.byte_length))]
    pub async fn store<S>(&self, info: &BlobInfo, content: S) -> StorageResult<StoreOutcome>
    where
        S: Stream<Item = StorageResult<Bytes>> + Send,
    {
        let key = info.digest.to_object_key();
        let mut content = std::pin::pin!(content);

        if self.bounded("blob exists", self.backend.exists(&key)).await? {
            while let Some(chunk) = self.bounded("blob read", next_chunk(&mut content)).await? {
                drop(chunk);
            }
            return Ok(StoreOutcome::AlreadyPresent);
        }

        let mut upload = self
            .bounded("blob stage", self.backend.put_stream(&key))
            .await?;
        let mut hasher = ContentHash::hasher();

        let staged: StorageResult<()> = async {
            while let Some(chunk) = self.bounded("blob read", next_chunk(&mut content)).await? {
                hasher.update(&chunk);
                if hasher.len() > info.byte_length {
                    return Err(StorageError::SizeMismatch {
                        key: key.clone(),
                        expected: info.byte_length,
                        actual: hasher.len(),
                    });
                }
                self.bounded("blob write", upload.write(chunk)).await?;
            }
            Ok(())
        }
        .await;

        let verified = staged.and_then(|()| {
            let len = hasher.len();
            info.verify(&hasher.finalize(), len)
                .map_err(|e| verification_error(&key, e))
        });

        if let Err(e) = verified {
            if let Err(abort_err) = self.bounded("blob abort", upload.abort()).await {
                tracing::warn!(key = %key, error = %abort_err, "failed to abort staged blob");
            }
            return Err(e);
        }

        let written = self.bounded("blob publish", upload.finish()).await?;
        tracing::debug!(key = %key, bytes = written, "blob published");
        Ok(StoreOutcome::Written)
    }

    /// Open the bytes for a digest as a stream.
    ///
    /// `NotFound` here means the ledger and the store disagree; callers treat
    /// it as an integrity failure rather than an ordinary miss.
    #[instrument(skip(self), fields(digest = %digest))]
    pub async fn fetch(&self, digest: &ContentHash) -> StorageResult<ByteStream> {
        let key = digest.to_object_key();
        let stream = self
            .bounded("blob open", self.backend.get_stream(&key))
            .await?;
        Ok(self.with_read_timeout(stream))
    }

    /// Open a blob whose length is known from the ledger.
    ///
    /// The stored length is checked before any byte is returned, and the
    /// stream fails instead of ending early if fewer or more bytes arrive.
    #[instrument(skip(self), fields(digest = %info.digest))]
    pub async fn fetch_verified(&self, info: &BlobInfo) -> StorageResult<ByteStream> {
        let key = info.digest.to_object_key();
        let meta = self.bounded("blob head", self.backend.head(&key)).await?;
        if meta.size != info.byte_length {
            return Err(StorageError::SizeMismatch {
                key,
                expected: info.byte_length,
                actual: meta.size,
            });
        }

        let mut inner = self.fetch(&info.digest).await?;
        let expected = info.byte_length;
        let stream = async_stream::try_stream! {
            let mut seen = 0u64;
            while let Some(chunk) = inner.next().await {
                let chunk = chunk?;
                seen += chunk.len() as u64;
                if seen > expected {
                    Err::<(), _>(StorageError::SizeMismatch { key: key.clone(), expected, actual: seen })?;
                }
                yield chunk;
            }
            if seen != expected {
                Err::<(), _>(StorageError::SizeMismatch { key: key.clone(), expected, actual: seen })?;
            }
        };
        Ok(Box::pin(stream))
    }

    /// Delete the bytes for a digest. Absent bytes count as success.
    #[instrument(skip(self), fields(digest = %digest))]
    pub async fn remove(&self, digest: &ContentHash) -> StorageResult<()> {
        let key = digest.to_object_key();
        match self.bounded("blob remove", self.backend.delete(&key)).await {
            Ok(()) => Ok(()),
            Err(StorageError::NotFound(_)) => {
                tracing::debug!(key = %key, "blob already absent");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Stream every key under the blob prefix, including staging leftovers.
    pub async fn list_keys(&self) -> StorageResult<KeyStream> {
        self.bounded("blob list", self.backend.list_stream(BLOB_KEY_PREFIX))
            .await
    }

    pub async fn head_key(&self, key: &str) -> StorageResult<ObjectMeta> {
        self.bounded("blob head", self.backend.head(key)).await
    }

    /// Delete a raw key. Used by the orphan sweep for staging leftovers.
    pub async fn delete_key(&self, key: &str) -> StorageResult<()> {
        match self.bounded("blob remove", self.backend.delete(key)).await {
            Err(StorageError::NotFound(_)) => Ok(()),
            other => other,
        }
    }

    pub async fn health_check(&self) -> StorageResult<()> {
        self.bounded("health check", self.backend.health_check())
            .await
    }

    /// Bound the wait for each chunk of a read stream.
    fn with_read_timeout(&self, mut inner: ByteStream) -> ByteStream {
        let timeout = self.timeout;
        Box::pin(async_stream::try_stream! {
            loop {
                let next = tokio::time::timeout(timeout, inner.next())
                    .await
                    .map_err(|_| StorageError::Timeout {
                        operation: "blob read",
                        secs: timeout.as_secs(),
                    })?;
                let Some(chunk) = next else { break };
                yield chunk?;
            }
        })
    }
}

async fn next_chunk<S>(content: &mut std::pin::Pin<&mut S>) -> StorageResult<Option<Bytes>>
where
    S: Stream<Item = StorageResult<Bytes>>,
{
    content.next().await.transpose()
}

fn verification_error(key: &str, err: larder_core::Error) -> StorageError {
    match err {
        larder_core::Error::SizeMismatch { expected, actual } => StorageError::SizeMismatch {
            key: key.to_string(),
            expected,
            actual,
        },
        larder_core::Error::HashMismatch { expected, actual } => {
            StorageError::HashMismatch { expected, actual }
        }
        other => StorageError::InvalidKey(other.to_string()),
    }
}
