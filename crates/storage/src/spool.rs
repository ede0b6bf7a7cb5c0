//! Temporary on-disk spool for incoming uploads.
//!
//! A blob's key is its digest, so an upload has to be read completely before
//! anything can be written to the blob store. The spool holds the bytes in a
//! private temp file while hashing them, then replays them from disk.

use crate::error::{StorageError, StorageResult};
use crate::traits::ByteStream;
use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use larder_core::{BlobInfo, ContentHash};
use std::path::PathBuf;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

const SPOOL_PREFIX: &str = "larder-spool-";
const READ_BUFFER: usize = 64 * 1024;

/// Errors raised while spooling a request body.
#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("upload exceeds the maximum size of {limit} bytes")]
    TooLarge { limit: u64 },

    #[error("failed to read upload body: {0}")]
    Body(Box<dyn std::error::Error + Send + Sync>),

    #[error("spool I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Creates spooled uploads in a directory, enforcing a size cap.
#[derive(Clone, Debug)]
pub struct Spool {
    dir: PathBuf,
    limit: u64,
}

impl Spool {
    /// `dir` defaults to the system temp directory.
    pub fn new(dir: Option<PathBuf>, limit: u64) -> Self {
        Self {
            dir: dir.unwrap_or_else(std::env::temp_dir),
            limit,
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Drain `body` to disk, hashing as it goes.
    ///
    /// The temp file is removed when the returned [`SpooledUpload`] is dropped,
    /// and immediately on any error.
    pub async fn ingest<S, E>(&self, body: S) -> Result<SpooledUpload, SpoolError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let dir = self.dir.clone();
        let temp = tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&dir)?;
            tempfile::Builder::new().prefix(SPOOL_PREFIX).tempfile_in(&dir)
        })
        .await
        .map_err(std::io::Error::other)??;

        let mut file = tokio::fs::File::from_std(temp.reopen()?);
        let mut hasher = ContentHash::hasher();
        let mut body = std::pin::pin!(body);

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| SpoolError::Body(e.into()))?;
            if hasher.len() + chunk.len() as u64 > self.limit {
                return Err(SpoolError::TooLarge { limit: self.limit });
            }
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_data().await?;

        let size = hasher.len();
        let digest = hasher.finalize();
        tracing::debug!(digest = %digest, size, "upload spooled");

        Ok(SpooledUpload {
            temp,
            info: BlobInfo::new(digest, size),
        })
    }
}

/// A fully received, hashed upload waiting on disk.
#[derive(Debug)]
pub struct SpooledUpload {
    temp: tempfile::NamedTempFile,
    info: BlobInfo,
}

impl SpooledUpload {
    pub fn digest(&self) -> &ContentHash {
        &self.info.digest
    }

    pub fn size(&self) -> u64 {
        self.info.byte_length
    }

    pub fn blob_info(&self) -> &BlobInfo {
        &self.info
    }

    /// Replay the spooled bytes from the start.
    pub async fn stream(&self) -> StorageResult<ByteStream> {
        let file = tokio::fs::File::open(self.temp.path()).await?;
        let stream = ReaderStream::with_capacity(file, READ_BUFFER).map_err(StorageError::Io);
        Ok(Box::pin(stream))
    }
}
