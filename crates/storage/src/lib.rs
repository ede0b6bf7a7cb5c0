//! Blob storage for larder.
//!
//! This crate provides:
//! - An [`ObjectStore`] trait over a flat key space, with local filesystem
//!   and S3-compatible backends
//! - [`BlobStore`], which maps content digests to keys and verifies bytes on
//!   the way in and out
//! - [`Spool`], which receives and hashes uploads before they are stored

pub mod backends;
pub mod blobs;
pub mod error;
pub mod spool;
pub mod traits;

pub use backends::filesystem::FilesystemBackend;
pub use backends::s3::{S3Backend, S3Settings};
pub use blobs::{BlobStore, StoreOutcome};
pub use error::{StorageError, StorageResult};
pub use spool::{Spool, SpoolError, SpooledUpload};
pub use traits::{ByteStream, KeyStream, ObjectMeta, ObjectStore, StreamingUpload};

use larder_core::config::StorageConfig;
use std::sync::Arc;

/// Open the backend selected by `config`.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<dyn ObjectStore>> {
    config.validate().map_err(StorageError::Config)?;

    let backend: Arc<dyn ObjectStore> = match config {
        StorageConfig::Filesystem { path } => Arc::new(FilesystemBackend::new(path).await?),
        StorageConfig::S3 {
            bucket,
            endpoint,
            region,
            prefix,
            access_key_id,
            secret_access_key,
            force_path_style,
        } => {
            let settings = S3Settings {
                bucket: bucket.clone(),
                endpoint: endpoint.clone(),
                region: region.clone(),
                prefix: prefix.clone(),
                credentials: access_key_id.clone().zip(secret_access_key.clone()),
                force_path_style: *force_path_style,
            };
            Arc::new(S3Backend::new(settings).await?)
        }
    };
    tracing::debug!(backend = backend.backend_name(), "object store opened");
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_from_config_filesystem_ok() {
        let temp = tempdir().unwrap();
        let config = StorageConfig::Filesystem {
            path: temp.path().join("blobs-root"),
        };

        let store = from_config(&config).await.unwrap();
        assert_eq!(store.backend_name(), "filesystem");
        store
            .put("blobs/sample", Bytes::from_static(b"hi"))
            .await
            .unwrap();
        assert!(store.exists("blobs/sample").await.unwrap());
    }

    #[tokio::test]
    async fn test_from_config_s3_ok() {
        let config = StorageConfig::S3 {
            bucket: "larder".to_string(),
            endpoint: Some("minio:9000".to_string()),
            region: Some("us-east-1".to_string()),
            prefix: Some("dedup".to_string()),
            access_key_id: None,
            secret_access_key: None,
            force_path_style: true,
        };

        let store = from_config(&config).await.unwrap();
        assert_eq!(store.backend_name(), "s3");
    }

    #[tokio::test]
    async fn test_from_config_rejects_partial_credentials() {
        let config = StorageConfig::S3 {
            bucket: "larder".to_string(),
            endpoint: None,
            region: None,
            prefix: None,
            access_key_id: Some("access".to_string()),
            secret_access_key: None,
            force_path_style: false,
        };

        match from_config(&config).await {
            Ok(_) => panic!("expected error"),
            Err(StorageError::Config(_)) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
}
