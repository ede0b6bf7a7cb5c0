//! S3-compatible storage backend using AWS SDK.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ByteStream, KeyStream, ObjectMeta, ObjectStore, StreamingUpload};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::provider::ProvideCredentials;
use aws_credential_types::provider::error::CredentialsError;
use aws_credential_types::provider::future::ProvideCredentials as ProvideCredentialsFuture;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_smithy_http_client::Builder as SmithyHttpClientBuilder;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio_util::io::ReaderStream;
use tracing::instrument;

const BACKEND: &str = "s3";

/// Part size for multipart uploads (8 MiB).
/// S3 requires every part except the last to be at least 5 MiB.
const PART_SIZE: usize = 8 * 1024 * 1024;

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Tag carried by lazy-credentials errors so they can be reported as
/// configuration problems rather than generic transport failures.
const CREDENTIALS_ERROR_MARKER: &str = "larder-s3-lazy-credentials";

/// Resolves the AWS default credentials chain on first signed request
/// instead of at construction time.
#[derive(Debug)]
struct LazyDefaultCredentialsProvider {
    region: String,
    chain: OnceCell<aws_config::default_provider::credentials::DefaultCredentialsChain>,
}

impl LazyDefaultCredentialsProvider {
    fn new(region: String) -> Self {
        Self {
            region,
            chain: OnceCell::new(),
        }
    }

    async fn credentials(&self) -> aws_credential_types::provider::Result {
        let chain = self
            .chain
            .get_or_try_init(|| async {
                let region = aws_config::Region::new(self.region.clone());
                tokio::task::spawn(async move {
                    aws_config::default_provider::credentials::DefaultCredentialsChain::builder()
                        .region(region)
                        .build()
                        .await
                })
                .await
                .map_err(|e| {
                    CredentialsError::provider_error(format!(
                        "{CREDENTIALS_ERROR_MARKER}: failed to initialize credential chain: {e}"
                    ))
                })
            })
            .await?;

        chain.provide_credentials().await.map_err(|e| {
            CredentialsError::provider_error(format!(
                "{CREDENTIALS_ERROR_MARKER}: credential resolution failed: {e}"
            ))
        })
    }
}

impl ProvideCredentials for LazyDefaultCredentialsProvider {
    fn provide_credentials<'a>(&'a self) -> ProvideCredentialsFuture<'a>
    where
        Self: 'a,
    {
        ProvideCredentialsFuture::new(self.credentials())
    }
}

fn map_s3_error<E>(err: SdkError<E>) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    if err.to_string().contains(CREDENTIALS_ERROR_MARKER) {
        return StorageError::Config(
            "S3 credential initialization failed; configure credentials explicitly or \
             provide ambient AWS credentials"
                .to_string(),
        );
    }
    StorageError::S3(Box::new(err))
}

fn is_404<E>(err: &SdkError<E>) -> bool {
    matches!(err, SdkError::ServiceError(se) if se.raw().status().as_u16() == 404)
}

/// Map an SDK error for a keyed operation, turning 404 into `NotFound`.
fn map_keyed_error<E>(err: SdkError<E>, key: &str) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    if is_404(&err) {
        StorageError::NotFound(key.to_string())
    } else {
        map_s3_error(err)
    }
}

/// S3-compatible object store.
pub struct S3Backend {
    client: Client,
    bucket: String,
    prefix: Option<String>,
}

impl std::fmt::Debug for S3Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Backend")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

/// Connection settings for [`S3Backend`].
#[derive(Clone, Debug, Default)]
pub struct S3Settings {
    pub bucket: String,
    /// Bare `host:port` endpoints are treated as plain HTTP (typical for a
    /// local MinIO).
    pub endpoint: Option<String>,
    pub region: Option<String>,
    pub prefix: Option<String>,
    /// Static `(access_key_id, secret_access_key)`. When unset the ambient
    /// AWS credential chain is resolved on the first signed request.
    pub credentials: Option<(String, String)>,
    /// Use `endpoint/bucket/key` addressing.
    pub force_path_style: bool,
}

impl S3Backend {
    /// Build a client for `settings`. No network traffic happens here.
    pub async fn new(settings: S3Settings) -> StorageResult<Self> {
        let S3Settings {
            bucket,
            endpoint,
            region,
            prefix,
            credentials,
            force_path_style,
        } = settings;
        if bucket.is_empty() {
            return Err(StorageError::Config("s3 bucket must not be empty".to_string()));
        }

        let region = region.unwrap_or_else(|| "us-east-1".to_string());
        let mut builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(aws_config::Region::new(region.clone()));

        builder = match credentials {
            Some((key_id, secret)) => builder.credentials_provider(
                aws_sdk_s3::config::Credentials::new(key_id, secret, None, None, "larder-config"),
            ),
            None => builder.credentials_provider(LazyDefaultCredentialsProvider::new(region)),
        };

        if let Some(endpoint) = endpoint.as_deref().map(normalize_endpoint) {
            // Plain-HTTP endpoints get an HTTP-only client so startup does
            // not depend on native trust roots.
            if endpoint.to_ascii_lowercase().starts_with("http://") {
                builder = builder.http_client(SmithyHttpClientBuilder::new().build_http());
            }
            builder = builder.endpoint_url(endpoint);
        }

        if force_path_style {
            builder = builder.force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket,
            prefix: prefix
                .map(|p| p.trim_end_matches('/').to_string())
                .filter(|p| !p.is_empty()),
        })
    }

    /// Full object key (applies prefix if configured).
    fn full_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}/{key}"),
            None => key.to_string(),
        }
    }

    /// Strip the configured prefix from a full object key.
    fn strip_prefix(prefix: Option<&str>, full_key: &str) -> String {
        prefix
            .and_then(|p| full_key.strip_prefix(p))
            .and_then(|rest| rest.strip_prefix('/'))
            .unwrap_or(full_key)
            .to_string()
    }
}

fn normalize_endpoint(endpoint: &str) -> String {
    let lower = endpoint.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("http://{endpoint}")
    }
}

#[async_trait]
impl ObjectStore for S3Backend {
    #[instrument(skip(self), fields(backend = BACKEND))]
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        match self.head(key).await {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self), fields(backend = BACKEND))]
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(|e| map_keyed_error(e, key))?;

        let last_modified = output
            .last_modified()
            .and_then(|dt| time::OffsetDateTime::from_unix_timestamp(dt.secs()).ok());

        Ok(ObjectMeta {
            size: output.content_length().unwrap_or(0).max(0) as u64,
            last_modified,
        })
    }

    #[instrument(skip(self), fields(backend = BACKEND))]
    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(|e| map_keyed_error(e, key))?;

        let stream = ReaderStream::new(output.body.into_async_read())
            .map(|chunk| chunk.map_err(StorageError::Io));
        Ok(Box::pin(stream))
    }

    #[instrument(skip(self, data), fields(backend = BACKEND, size = data.len()))]
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .body(data.into())
            .send()
            .await
            .map_err(map_s3_error)?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = BACKEND))]
    async fn put_stream(&self, key: &str) -> StorageResult<Box<dyn StreamingUpload>> {
        let full_key = self.full_key(key);
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
            .map_err(map_s3_error)?;

        let upload_id = created
            .upload_id()
            .ok_or_else(|| StorageError::Config("S3 did not return an upload id".to_string()))?
            .to_string();

        Ok(Box::new(S3Upload {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            key: full_key,
            upload_id,
            parts: Vec::new(),
            buffer: BytesMut::with_capacity(PART_SIZE),
            bytes_written: 0,
        }))
    }

    #[instrument(skip(self), fields(backend = BACKEND))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        // DeleteObject succeeds for absent keys, so check first to report NotFound.
        if !self.exists(key).await? {
            return Err(StorageError::NotFound(key.to_string()));
        }

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(map_s3_error)?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = BACKEND))]
    async fn list_stream(&self, prefix: &str) -> StorageResult<KeyStream> {
        let full_prefix = self.full_key(prefix);
        let client = self.client.clone();
        let bucket = self.bucket.clone();
        let key_prefix = self.prefix.clone();

        let stream = async_stream::try_stream! {
            let mut continuation: Option<String> = None;
            loop {
                let output = client
                    .list_objects_v2()
                    .bucket(&bucket)
                    .prefix(&full_prefix)
                    .set_continuation_token(continuation.take())
                    .send()
                    .await
                    .map_err(map_s3_error)?;

                for object in output.contents() {
                    if let Some(key) = object.key() {
                        yield S3Backend::strip_prefix(key_prefix.as_deref(), key);
                    }
                }

                match output.next_continuation_token() {
                    Some(token) if output.is_truncated() == Some(true) => {
                        continuation = Some(token.to_string());
                    }
                    _ => break,
                }
            }
        };

        Ok(Box::pin(stream))
    }

    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    #[instrument(skip(self), fields(backend = BACKEND))]
    async fn health_check(&self) -> StorageResult<()> {
        let marker_key = self.full_key(".larder-health-check");

        let check = async {
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&marker_key)
                .body(Bytes::from_static(b"health-check").into())
                .send()
                .await
                .map_err(map_s3_error)?;

            match self
                .client
                .delete_object()
                .bucket(&self.bucket)
                .key(&marker_key)
                .send()
                .await
            {
                Err(e) if !is_404(&e) => Err(map_s3_error(e)),
                _ => Ok(()),
            }
        };

        tokio::time::timeout(HEALTH_CHECK_TIMEOUT, check)
            .await
            .map_err(|_| StorageError::Timeout {
                operation: "s3 health check",
                secs: HEALTH_CHECK_TIMEOUT.as_secs(),
            })?
    }
}

/// Multipart upload; nothing is visible under the key until completion.
struct S3Upload {
    client: Client,
    bucket: String,
    key: String,
    upload_id: String,
    parts: Vec<CompletedPart>,
    buffer: BytesMut,
    bytes_written: u64,
}

impl S3Upload {
    async fn upload_part(&mut self, data: Bytes) -> StorageResult<()> {
        let part_number = i32::try_from(self.parts.len() + 1)
            .map_err(|_| StorageError::Config("too many multipart parts".to_string()))?;

        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .part_number(part_number)
            .body(data.into())
            .send()
            .await
            .map_err(map_s3_error)?;

        self.parts.push(
            CompletedPart::builder()
                .e_tag(output.e_tag().unwrap_or_default())
                .part_number(part_number)
                .build(),
        );
        Ok(())
    }

    async fn abort_multipart(&self) -> StorageResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .send()
            .await
            .map_err(map_s3_error)?;
        Ok(())
    }
}

#[async_trait]
impl StreamingUpload for S3Upload {
    async fn write(&mut self, data: Bytes) -> StorageResult<()> {
        self.bytes_written += data.len() as u64;
        self.buffer.extend_from_slice(&data);
        while self.buffer.len() >= PART_SIZE {
            let part = self.buffer.split_to(PART_SIZE).freeze();
            self.upload_part(part).await?;
        }
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> StorageResult<u64> {
        if !self.buffer.is_empty() {
            let last = self.buffer.split().freeze();
            self.upload_part(last).await?;
        }

        // Multipart uploads need at least one non-empty part; an empty object
        // is written with a plain PutObject instead.
        if self.parts.is_empty() {
            if let Err(e) = self.abort_multipart().await {
                tracing::warn!(key = %self.key, error = %e, "failed to abort empty multipart upload");
            }
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&self.key)
                .body(Bytes::new().into())
                .send()
                .await
                .map_err(map_s3_error)?;
            return Ok(0);
        }

        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(std::mem::take(&mut self.parts)))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(map_s3_error)?;

        Ok(self.bytes_written)
    }

    async fn abort(self: Box<Self>) -> StorageResult<()> {
        self.abort_multipart().await
    }
}
