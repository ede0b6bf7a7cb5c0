//! Server test utilities.

use crate::common::fixtures::{BOUNDARY, Part, multipart_body};
use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use bytes::Bytes;
use larder_core::config::{AppConfig, MetadataConfig, ServerConfig, StorageConfig};
use larder_metadata::{MetadataStore, SqliteStore};
use sqlx::SqlitePool;
use sqlx::sqlite::SqliteConnectOptions;
use larder_server::{AppState, create_router};
use larder_storage::{FilesystemBackend, ObjectStore};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

/// A test server wrapper with all dependencies.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestServer {
    pub router: axum::Router,
    pub state: AppState,
    ledger_path: PathBuf,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestServer {
    /// Create a new test server with temporary storage.
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Create a test server with custom config modifications.
    pub async fn with_config<F>(modifier: F) -> Self
    where
        F: FnOnce(&mut AppConfig),
    {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");

        let storage_path = temp_dir.path().join("storage");
        let storage: Arc<dyn ObjectStore> = Arc::new(
            FilesystemBackend::new(&storage_path)
                .await
                .expect("Failed to create storage backend"),
        );

        let db_path = temp_dir.path().join("ledger.db");
        let metadata: Arc<dyn MetadataStore> = Arc::new(
            SqliteStore::new(&db_path, None)
                .await
                .expect("Failed to create ledger"),
        );

        let mut config = AppConfig {
            server: ServerConfig {
                spool_dir: Some(temp_dir.path().join("spool")),
                ..Default::default()
            },
            storage: StorageConfig::Filesystem {
                path: storage_path,
            },
            metadata: MetadataConfig::Sqlite {
                path: db_path.clone(),
                query_timeout_secs: None,
            },
            ..Default::default()
        };

        modifier(&mut config);
        config.validate().expect("invalid test configuration");

        larder_server::metrics::register_metrics();
        let state = AppState::new(config, storage, metadata);
        let router = create_router(state.clone());

        Self {
            router,
            state,
            ledger_path: db_path,
            _temp_dir: temp_dir,
        }
    }

    /// Get access to the underlying metadata.
    pub fn metadata(&self) -> Arc<dyn MetadataStore> {
        self.state.metadata.clone()
    }

    /// A second connection to the ledger file, for tests that tamper with rows.
    pub async fn ledger_pool(&self) -> SqlitePool {
        SqlitePool::connect_with(SqliteConnectOptions::new().filename(&self.ledger_path))
            .await
            .expect("Failed to open ledger")
    }

    /// Send a request and collect the full response.
    pub async fn send(&self, request: Request<Body>) -> (StatusCode, HeaderMap, Bytes) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, headers, body)
    }

    /// Send a request with an optional JSON body and decode a JSON response.
    pub async fn json(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(v) => builder
                .header("Content-Type", "application/json")
                .body(Body::from(serde_json::to_vec(&v).unwrap()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let (status, _, bytes) = self.send(request).await;
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, json)
    }

    /// POST a multipart body made of `parts` to the upload endpoint.
    pub async fn upload_parts(&self, parts: &[Part<'_>]) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri("/api/upload/")
            .header(
                "Content-Type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(multipart_body(parts)))
            .unwrap();

        let (status, _, bytes) = self.send(request).await;
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    /// Upload `data` as the `file` part with the given filename.
    pub async fn upload(&self, filename: &str, content_type: &str, data: &[u8]) -> (StatusCode, Value) {
        self.upload_parts(&[Part {
            name: "file",
            filename: Some(filename),
            content_type: Some(content_type),
            data,
        }])
        .await
    }

    /// Upload and return the created projection, asserting success.
    pub async fn upload_ok(&self, filename: &str, data: &[u8]) -> Value {
        let (status, body) = self.upload(filename, "text/plain", data).await;
        assert_eq!(status, StatusCode::CREATED, "upload failed: {body}");
        body
    }

    pub async fn delete(&self, id: &str) -> StatusCode {
        self.json("DELETE", &format!("/api/files/{id}/"), None).await.0
    }

    pub async fn download(&self, id: &str) -> (StatusCode, HeaderMap, Bytes) {
        let request = Request::builder()
            .uri(format!("/api/download/{id}/"))
            .body(Body::empty())
            .unwrap();
        self.send(request).await
    }

    pub async fn savings(&self) -> Value {
        let (status, body) = self.json("GET", "/api/stats/savings/", None).await;
        assert_eq!(status, StatusCode::OK);
        body
    }
}
