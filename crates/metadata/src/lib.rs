//! Reference ledger for larder.
//!
//! This crate records which logical files exist and how many of them point at
//! each stored blob:
//! - Logical files and their blob references
//! - Blob reference counts and the reclaim claim protocol
//! - Upload pins that protect in-flight writes from reclamation
//! - Savings totals and reference count audits

pub mod error;
pub mod models;
pub mod repos;
pub mod store;

pub use error::{MetadataError, MetadataResult};
pub use repos::{
    AuditMode, CreatedFile, DeletedFile, IngestStart, PinId, RefcountAudit, RefcountDiscrepancy,
};
pub use store::{MetadataStore, SqliteStore};

use larder_core::config::MetadataConfig;
use std::sync::Arc;

/// Create a metadata store from configuration.
pub async fn from_config(config: &MetadataConfig) -> MetadataResult<Arc<dyn MetadataStore>> {
    config.validate().map_err(MetadataError::Config)?;

    match config {
        MetadataConfig::Sqlite {
            path,
            query_timeout_secs,
        } => {
            let store = SqliteStore::new(path, *query_timeout_secs).await?;
            Ok(Arc::new(store) as Arc<dyn MetadataStore>)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_from_config_sqlite() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("nested").join("ledger.db");
        let config = MetadataConfig::Sqlite {
            path: db_path.clone(),
            query_timeout_secs: None,
        };

        let store = from_config(&config).await.unwrap();
        store.health_check().await.unwrap();
        assert!(db_path.exists());
    }

    #[tokio::test]
    async fn test_from_config_rejects_empty_path() {
        let config = MetadataConfig::Sqlite {
            path: std::path::PathBuf::new(),
            query_timeout_secs: None,
        };

        assert!(matches!(
            from_config(&config).await,
            Err(MetadataError::Config(_))
        ));
    }
}
