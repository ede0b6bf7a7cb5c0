//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Maximum accepted upload body size in bytes.
    #[serde(default = "default_max_upload_size")]
    pub max_upload_size: u64,
    /// Enable the /metrics endpoint for Prometheus scraping (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
    /// Directory for spooling uploads while they are hashed.
    /// Defaults to the system temp directory.
    #[serde(default)]
    pub spool_dir: Option<PathBuf>,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_max_upload_size() -> u64 {
    crate::DEFAULT_MAX_UPLOAD_SIZE
}

fn default_metrics_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_upload_size: default_max_upload_size(),
            metrics_enabled: default_metrics_enabled(),
            spool_dir: None,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_upload_size == 0 {
            return Err("server.max_upload_size must be greater than 0".to_string());
        }
        if usize::try_from(self.max_upload_size).is_err() {
            return Err(format!(
                "server.max_upload_size {} does not fit in memory addressing on this platform",
                self.max_upload_size
            ));
        }
        Ok(())
    }
}

/// Storage backend configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage.
    Filesystem {
        /// Root directory for storage.
        path: PathBuf,
    },
    /// S3-compatible storage.
    S3 {
        /// Bucket name.
        bucket: String,
        /// Optional endpoint URL (for MinIO, etc.).
        endpoint: Option<String>,
        /// AWS region.
        region: Option<String>,
        /// Optional key prefix.
        prefix: Option<String>,
        /// AWS access key ID. Falls back to AWS_ACCESS_KEY_ID env var if not set.
        access_key_id: Option<String>,
        /// AWS secret access key. Falls back to AWS_SECRET_ACCESS_KEY env var if not set.
        secret_access_key: Option<String>,
        /// Force path-style URLs. Required for MinIO and some S3-compatible services.
        #[serde(default)]
        force_path_style: bool,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/blobs"),
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            StorageConfig::S3 {
                bucket,
                access_key_id,
                secret_access_key,
                ..
            } => {
                if bucket.is_empty() {
                    return Err("s3 config requires a non-empty bucket".to_string());
                }
                match (access_key_id.as_ref(), secret_access_key.as_ref()) {
                    (Some(_), Some(_)) | (None, None) => Ok(()),
                    _ => Err("s3 config requires both access_key_id and secret_access_key \
                              when either is set"
                        .to_string()),
                }
            }
            StorageConfig::Filesystem { path } => {
                if path.as_os_str().is_empty() {
                    return Err("filesystem storage requires a path".to_string());
                }
                Ok(())
            }
        }
    }
}

/// Blob store behaviour independent of the backend.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlobStoreConfig {
    /// Upper bound for any single storage operation, in seconds.
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,
}

fn default_operation_timeout_secs() -> u64 {
    60
}

impl Default for BlobStoreConfig {
    fn default() -> Self {
        Self {
            operation_timeout_secs: default_operation_timeout_secs(),
        }
    }
}

impl BlobStoreConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.operation_timeout_secs == 0 {
            return Err("blob_store.operation_timeout_secs cannot be 0".to_string());
        }
        Ok(())
    }
}

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database.
    Sqlite {
        /// Database file path.
        path: PathBuf,
        /// Seconds a ledger operation waits to acquire the connection before
        /// failing. Running statements are not interrupted.
        #[serde(default = "default_sqlite_query_timeout_secs")]
        query_timeout_secs: Option<u64>,
    },
}

fn default_sqlite_query_timeout_secs() -> Option<u64> {
    Some(30)
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/ledger.db"),
            query_timeout_secs: default_sqlite_query_timeout_secs(),
        }
    }
}

impl MetadataConfig {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            MetadataConfig::Sqlite { path, .. } if path.as_os_str().is_empty() => {
                Err("sqlite metadata requires a path".to_string())
            }
            MetadataConfig::Sqlite { .. } => Ok(()),
        }
    }
}

/// Upload ingest configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Attempts for a contended ledger transaction before reporting a conflict.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base backoff between attempts in milliseconds (doubles each attempt).
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Lifetime of an in-flight upload pin. A pin that outlives this is
    /// assumed to belong to a crashed upload. At most 30 days.
    #[serde(default = "default_pin_ttl_secs")]
    pub pin_ttl_secs: u64,
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_backoff_ms() -> u64 {
    50
}

/// Longest accepted pin lifetime.
pub const MAX_PIN_TTL_SECS: u64 = 30 * 24 * 3600;

fn default_pin_ttl_secs() -> u64 {
    3600 // 1 hour
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            pin_ttl_secs: default_pin_ttl_secs(),
        }
    }
}

impl IngestConfig {
    /// Backoff before the given retry attempt (1-based), capped at 2 seconds.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor)).min(Duration::from_secs(2))
    }

    pub fn pin_ttl(&self) -> time::Duration {
        time::Duration::seconds(i64::try_from(self.pin_ttl_secs).unwrap_or(i64::MAX))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_retries == 0 {
            return Err("ingest.max_retries must be at least 1".to_string());
        }
        if self.pin_ttl_secs == 0 || self.pin_ttl_secs > MAX_PIN_TTL_SECS {
            return Err(format!(
                "ingest.pin_ttl_secs {} is out of range (1..={MAX_PIN_TTL_SECS})",
                self.pin_ttl_secs
            ));
        }
        Ok(())
    }
}

/// Blob reclamation configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReclaimConfig {
    /// Reclaim a blob right after the delete that dropped its last reference.
    #[serde(default = "default_true")]
    pub immediate: bool,
    /// Run the background reclaimer.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Interval between background passes in seconds.
    #[serde(default = "default_reclaim_interval_secs")]
    pub interval_secs: u64,
    /// Maximum blobs claimed per pass.
    #[serde(default = "default_reclaim_batch_size")]
    pub batch_size: u32,
    /// Minimum age of an unreferenced storage object before the orphan sweep
    /// deletes it.
    #[serde(default = "default_orphan_grace_secs")]
    pub orphan_grace_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_reclaim_interval_secs() -> u64 {
    300 // 5 minutes
}

fn default_reclaim_batch_size() -> u32 {
    500
}

fn default_orphan_grace_secs() -> u64 {
    3600 // 1 hour
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        Self {
            immediate: true,
            enabled: true,
            interval_secs: default_reclaim_interval_secs(),
            batch_size: default_reclaim_batch_size(),
            orphan_grace_secs: default_orphan_grace_secs(),
        }
    }
}

impl ReclaimConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn orphan_grace(&self) -> time::Duration {
        time::Duration::seconds(i64::try_from(self.orphan_grace_secs).unwrap_or(i64::MAX))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.enabled && self.interval_secs == 0 {
            return Err("reclaim.interval_secs cannot be 0 when the reclaimer is enabled"
                .to_string());
        }
        if self.batch_size == 0 {
            return Err("reclaim.batch_size must be at least 1".to_string());
        }
        if self.orphan_grace_secs > i64::MAX as u64 {
            return Err(format!(
                "reclaim.orphan_grace_secs {} exceeds maximum value {}",
                self.orphan_grace_secs,
                i64::MAX
            ));
        }
        Ok(())
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub blob_store: BlobStoreConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub reclaim: ReclaimConfig,
}

impl AppConfig {
    /// Validate every section, returning the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        self.server.validate()?;
        self.storage.validate()?;
        self.blob_store.validate()?;
        self.metadata.validate()?;
        self.ingest.validate()?;
        self.reclaim.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        AppConfig::default().validate().unwrap();
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: AppConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:8080");
        assert!(config.reclaim.immediate);
        assert_eq!(config.ingest.max_retries, 5);
        assert_eq!(config.blob_store.operation_timeout_secs, 60);
    }

    #[test]
    fn test_storage_config_s3_validate_partial_credentials() {
        let invalid = StorageConfig::S3 {
            bucket: "bucket".to_string(),
            endpoint: None,
            region: None,
            prefix: None,
            access_key_id: Some("access-key".to_string()),
            secret_access_key: None,
            force_path_style: false,
        };
        assert!(invalid.validate().is_err());

        let valid = StorageConfig::S3 {
            bucket: "bucket".to_string(),
            endpoint: None,
            region: None,
            prefix: None,
            access_key_id: Some("access-key".to_string()),
            secret_access_key: Some("secret-key".to_string()),
            force_path_style: false,
        };
        assert!(valid.validate().is_ok());
    }

    #[test]
    fn test_storage_config_s3_force_path_style_defaults_to_false() {
        let json = r#"{"type":"s3","bucket":"test","endpoint":"https://s3.amazonaws.com"}"#;
        let config: StorageConfig = serde_json::from_str(json).unwrap();

        match config {
            StorageConfig::S3 {
                force_path_style, ..
            } => assert!(!force_path_style),
            _ => panic!("expected S3 config"),
        }
    }

    #[test]
    fn test_ingest_backoff_doubles_and_caps() {
        let config = IngestConfig::default();
        assert_eq!(config.backoff(1), Duration::from_millis(50));
        assert_eq!(config.backoff(2), Duration::from_millis(100));
        assert_eq!(config.backoff(3), Duration::from_millis(200));
        assert_eq!(config.backoff(30), Duration::from_secs(2));
    }

    #[test]
    fn test_ingest_pin_ttl_is_bounded() {
        let mut config = IngestConfig {
            pin_ttl_secs: MAX_PIN_TTL_SECS,
            ..IngestConfig::default()
        };
        assert!(config.validate().is_ok());
        assert!(
            time::OffsetDateTime::now_utc()
                .checked_add(config.pin_ttl())
                .is_some()
        );

        config.pin_ttl_secs = 1_000_000_000_000;
        assert!(config.validate().is_err());
        config.pin_ttl_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_reclaim_rejects_zero_interval_when_enabled() {
        let mut config = ReclaimConfig {
            interval_secs: 0,
            ..ReclaimConfig::default()
        };
        assert!(config.validate().is_err());
        config.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_upload_limit_rejected() {
        let config = ServerConfig {
            max_upload_size: 0,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
