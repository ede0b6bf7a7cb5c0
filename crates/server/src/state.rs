//! Application state shared across handlers.

use larder_core::config::AppConfig;
use larder_metadata::MetadataStore;
use larder_storage::{BlobStore, ObjectStore, Spool};
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Digest-addressed view over the object store.
    pub blobs: BlobStore,
    /// Reference ledger.
    pub metadata: Arc<dyn MetadataStore>,
    /// Where uploads wait while they are hashed.
    pub spool: Spool,
}

impl AppState {
    /// Create a new application state.
    ///
    /// The configuration is assumed to have been validated by the caller.
    pub fn new(
        config: AppConfig,
        storage: Arc<dyn ObjectStore>,
        metadata: Arc<dyn MetadataStore>,
    ) -> Self {
        let blobs = BlobStore::new(storage, config.blob_store.operation_timeout());
        let spool = Spool::new(
            config.server.spool_dir.clone(),
            config.server.max_upload_size,
        );

        Self {
            config: Arc::new(config),
            blobs,
            metadata,
            spool,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use larder_metadata::SqliteStore;
    use larder_storage::FilesystemBackend;
    use std::time::Duration;
    use tempfile::tempdir;

    async fn build_state(config: AppConfig) -> (tempfile::TempDir, AppState) {
        let temp = tempdir().unwrap();
        let storage: Arc<dyn ObjectStore> =
            Arc::new(FilesystemBackend::new(temp.path().join("blobs")).await.unwrap());
        let metadata: Arc<dyn MetadataStore> = Arc::new(
            SqliteStore::new(temp.path().join("ledger.db"), None)
                .await
                .unwrap(),
        );
        (temp, AppState::new(config, storage, metadata))
    }

    #[tokio::test]
    async fn test_spool_follows_server_config() {
        let spool_dir = tempdir().unwrap();
        let mut config = AppConfig::default();
        config.server.max_upload_size = 4096;
        config.server.spool_dir = Some(spool_dir.path().to_path_buf());

        let (_temp, state) = build_state(config).await;
        assert_eq!(state.spool.limit(), 4096);

        let body = futures::stream::iter([Ok::<_, std::io::Error>(bytes::Bytes::from_static(
            b"spooled",
        ))]);
        let upload = state.spool.ingest(body).await.unwrap();
        assert_eq!(std::fs::read_dir(spool_dir.path()).unwrap().count(), 1);
        drop(upload);
        assert_eq!(std::fs::read_dir(spool_dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_blob_store_uses_configured_backend() {
        let mut config = AppConfig::default();
        config.blob_store.operation_timeout_secs = 5;

        let (_temp, state) = build_state(config).await;
        assert_eq!(state.blobs.backend_name(), "filesystem");
        assert_eq!(
            state.config.blob_store.operation_timeout(),
            Duration::from_secs(5)
        );
    }
}
