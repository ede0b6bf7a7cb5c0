//! Larder server binary.

use anyhow::{Context, Result};
use clap::Parser;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use larder_core::config::AppConfig;
use larder_server::{AppState, Reclaimer, create_router};
use std::net::SocketAddr;
use std::path::Path;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Larder - a content-addressed, deduplicating file store
#[derive(Parser, Debug)]
#[command(name = "larderd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "LARDER_CONFIG",
        default_value = "config/larder.toml"
    )]
    config: String,
}

/// Load configuration from an optional TOML file overlaid with `LARDER_*`
/// environment variables. Missing keys fall back to defaults.
fn load_config(path: &str) -> Result<AppConfig> {
    let mut figment = Figment::new();

    if Path::new(path).exists() {
        tracing::info!(config_path = %path, "loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::info!(config_path = %path, "no config file found, using defaults and environment");
    }

    let config: AppConfig = figment
        .merge(Env::prefixed("LARDER_").split("__").ignore(&["config"]))
        .extract()
        .context("failed to load configuration")?;

    config
        .validate()
        .map_err(|e| anyhow::anyhow!(e))
        .context("invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Larder v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args.config)?;

    larder_server::metrics::register_metrics();
    tracing::info!("Prometheus metrics registered");

    let storage = larder_storage::from_config(&config.storage)
        .await
        .context("failed to initialize storage")?;
    storage
        .health_check()
        .await
        .context("storage health check failed")?;
    tracing::info!(backend = storage.backend_name(), "storage backend ready");

    let metadata = larder_metadata::from_config(&config.metadata)
        .await
        .context("failed to initialize ledger")?;
    tracing::info!("ledger ready");

    let state = AppState::new(config.clone(), storage, metadata);

    // Claims left by a crashed process must be finished before any pass runs.
    let reclaimer = Reclaimer::from_state(&state);
    reclaimer
        .recover()
        .await
        .context("failed to finish stale reclaim claims")?;

    if config.reclaim.enabled {
        let _reclaimer_handle = reclaimer.spawn();
    } else {
        tracing::info!("background reclaimer disabled");
    }

    let ledger = state.metadata.clone();
    let app = create_router(state);

    let addr: SocketAddr = config.server.bind.parse().context("invalid bind address")?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server stopped");
    ledger.close().await;
    tracing::info!("ledger closed");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use larder_core::config::{MetadataConfig, StorageConfig};

    #[test]
    fn test_load_config_from_file() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("larder.toml");
        std::fs::write(
            &path,
            r#"
[server]
bind = "0.0.0.0:9000"
max_upload_size = 1048576

[storage]
type = "filesystem"
path = "/srv/larder/blobs"

[metadata]
type = "sqlite"
path = "/srv/larder/ledger.db"

[reclaim]
immediate = false
interval_secs = 60
"#,
        )
        .unwrap();

        let config = load_config(path.to_str().unwrap()).unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:9000");
        assert_eq!(config.server.max_upload_size, 1_048_576);
        assert!(!config.reclaim.immediate);
        assert_eq!(config.reclaim.interval_secs, 60);
        assert_eq!(config.ingest.max_retries, 5);
        match config.storage {
            StorageConfig::Filesystem { path } => {
                assert_eq!(path, std::path::PathBuf::from("/srv/larder/blobs"));
            }
            other => panic!("unexpected storage config: {other:?}"),
        }
        assert!(matches!(config.metadata, MetadataConfig::Sqlite { .. }));
    }

    #[test]
    fn test_load_config_missing_file_uses_defaults() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("absent.toml");
        let config = load_config(path.to_str().unwrap()).unwrap();
        assert_eq!(config.blob_store.operation_timeout_secs, 60);
    }

    #[test]
    fn test_load_config_rejects_invalid_values() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("larder.toml");
        std::fs::write(&path, "[reclaim]\nbatch_size = 0\n").unwrap();
        assert!(load_config(path.to_str().unwrap()).is_err());
    }

    #[test]
    fn test_load_config_rejects_unbounded_pin_ttl() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("larder.toml");
        std::fs::write(&path, "[ingest]\npin_ttl_secs = 1000000000000\n").unwrap();
        let err = load_config(path.to_str().unwrap()).unwrap_err();
        assert!(format!("{err:#}").contains("pin_ttl_secs"));
    }
}
