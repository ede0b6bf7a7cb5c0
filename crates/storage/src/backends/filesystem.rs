//! Local filesystem storage backend.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ByteStream, KeyStream, ObjectMeta, ObjectStore, StreamingUpload};
use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::instrument;
use uuid::Uuid;

const BACKEND: &str = "filesystem";

/// Read buffer size for streaming reads (64 KiB).
const READ_BUFFER: usize = 64 * 1024;

/// Marker inserted into staging file names. Staging files never parse as
/// blob keys, so listings can tell them apart from published objects.
pub const STAGING_MARKER: &str = ".tmp.";

/// Object store rooted at a local directory.
///
/// Writes go to a uniquely named staging file next to the target, are
/// fsynced, then renamed into place, so readers never observe a partial
/// object and concurrent writers of the same key cannot interleave.
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    /// Open the backend at `root`, creating the directory if needed.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Resolve `key` on the blocking pool, since resolution canonicalizes
    /// and stats paths.
    async fn locate(&self, key: &str) -> StorageResult<PathBuf> {
        let (root, owned) = (self.root.clone(), key.to_owned());
        match tokio::task::spawn_blocking(move || resolve_key(&root, &owned)).await {
            Ok(resolved) => resolved,
            Err(e) => Err(StorageError::Io(std::io::Error::other(format!(
                "key resolution task failed: {e}"
            )))),
        }
    }
}

fn invalid_key(reason: &str, key: &str) -> StorageError {
    StorageError::InvalidKey(format!("{reason}: {key}"))
}

/// Map a key to a path under `root`, rejecting anything that could escape it.
///
/// Besides lexical checks (`..`, absolute paths), the nearest existing
/// ancestor of the target is canonicalized so a symlink planted inside the
/// root cannot redirect reads or writes outside of it.
fn resolve_key(root: &Path, key: &str) -> StorageResult<PathBuf> {
    if key.is_empty() {
        return Ok(root.to_path_buf());
    }
    let lexically_safe = !key.starts_with(['/', '\\'])
        && !key.contains("..")
        && Path::new(key)
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if !lexically_safe {
        return Err(invalid_key("path traversal not allowed", key));
    }

    let target = root.join(key);
    let canonical_root = root.canonicalize()?;

    for ancestor in target.ancestors() {
        let meta = match std::fs::symlink_metadata(ancestor) {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        let resolved = match ancestor.canonicalize() {
            Ok(resolved) => resolved,
            Err(_) if meta.file_type().is_symlink() => {
                return Err(invalid_key("dangling symlink", key));
            }
            Err(e) => return Err(e.into()),
        };
        if !resolved.starts_with(&canonical_root) {
            return Err(invalid_key("resolved path escapes storage root", key));
        }
        break;
    }

    Ok(target)
}

fn missing_as_not_found(key: &str) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |e| match e.kind() {
        ErrorKind::NotFound => StorageError::NotFound(key.to_owned()),
        _ => StorageError::Io(e),
    }
}

/// Staging path for a write to `path`, unique per writer.
fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!("{STAGING_MARKER}{}", Uuid::new_v4()));
    path.with_file_name(name)
}

async fn remove_if_present(path: &Path) -> StorageResult<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

#[async_trait]
impl ObjectStore for FilesystemBackend {
    #[instrument(skip(self), fields(backend = BACKEND))]
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.locate(key).await?;
        Ok(fs::try_exists(&path).await?)
    }

    #[instrument(skip(self), fields(backend = BACKEND))]
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let path = self.locate(key).await?;
        let meta = fs::metadata(&path).await.map_err(missing_as_not_found(key))?;
        if !meta.is_file() {
            return Err(StorageError::NotFound(key.to_owned()));
        }
        Ok(ObjectMeta {
            size: meta.len(),
            last_modified: meta.modified().ok().map(Into::into),
        })
    }

    #[instrument(skip(self), fields(backend = BACKEND))]
    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        let path = self.locate(key).await?;
        let file = fs::File::open(&path).await.map_err(missing_as_not_found(key))?;
        let stream = ReaderStream::with_capacity(file, READ_BUFFER).map_err(StorageError::Io);
        Ok(Box::pin(stream))
    }

    #[instrument(skip(self, data), fields(backend = BACKEND, size = data.len()))]
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        let mut upload = self.put_stream(key).await?;
        match upload.write(data).await {
            Ok(()) => upload.finish().await.map(|_| ()),
            Err(e) => {
                let _ = upload.abort().await;
                Err(e)
            }
        }
    }

    #[instrument(skip(self), fields(backend = BACKEND))]
    async fn put_stream(&self, key: &str) -> StorageResult<Box<dyn StreamingUpload>> {
        let final_path = self.locate(key).await?;
        if let Some(dir) = final_path.parent() {
            fs::create_dir_all(dir).await?;
        }

        let staging = staging_path(&final_path);
        let file = fs::File::create(&staging).await?;
        Ok(Box::new(StagedFile {
            file,
            staging,
            final_path,
            written: 0,
        }))
    }

    #[instrument(skip(self), fields(backend = BACKEND))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.locate(key).await?;
        fs::remove_file(&path)
            .await
            .map_err(missing_as_not_found(key))
    }

    #[instrument(skip(self), fields(backend = BACKEND))]
    async fn list_stream(&self, prefix: &str) -> StorageResult<KeyStream> {
        let start = self.locate(prefix).await?;
        let root = self.root.clone();
        let present = match fs::try_exists(&start).await {
            Ok(present) => present,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };

        let keys = async_stream::try_stream! {
            let mut pending = if present { vec![start] } else { Vec::new() };
            while let Some(dir) = pending.pop() {
                let mut entries = fs::read_dir(&dir).await?;
                while let Some(entry) = entries.next_entry().await? {
                    // Does not follow symlinks, so links are never listed.
                    let kind = entry.file_type().await?;
                    let path = entry.path();
                    if kind.is_dir() {
                        pending.push(path);
                    } else if kind.is_file()
                        && let Ok(relative) = path.strip_prefix(&root)
                    {
                        yield relative.to_string_lossy().replace('\\', "/");
                    }
                }
            }
        };
        Ok(Box::pin(keys))
    }

    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    #[instrument(skip(self), fields(backend = BACKEND))]
    async fn health_check(&self) -> StorageResult<()> {
        let meta = fs::metadata(&self.root).await.map_err(|e| {
            std::io::Error::new(e.kind(), format!("storage root {:?} not accessible: {e}", self.root))
        })?;
        if meta.is_dir() {
            Ok(())
        } else {
            Err(std::io::Error::new(
                ErrorKind::NotADirectory,
                format!("storage root {:?} is not a directory", self.root),
            )
            .into())
        }
    }
}

/// An in-progress write, published by renaming the staging file.
struct StagedFile {
    file: fs::File,
    staging: PathBuf,
    final_path: PathBuf,
    written: u64,
}

#[async_trait]
impl StreamingUpload for StagedFile {
    async fn write(&mut self, data: Bytes) -> StorageResult<()> {
        self.file.write_all(&data).await?;
        self.written += data.len() as u64;
        Ok(())
    }

    async fn finish(self: Box<Self>) -> StorageResult<u64> {
        let StagedFile {
            file,
            staging,
            final_path,
            written,
        } = *self;

        let synced = file.sync_all().await;
        drop(file);
        let published = match synced {
            Ok(()) => fs::rename(&staging, &final_path).await,
            Err(e) => Err(e),
        };
        if let Err(e) = published {
            let _ = fs::remove_file(&staging).await;
            return Err(e.into());
        }
        Ok(written)
    }

    async fn abort(self: Box<Self>) -> StorageResult<()> {
        let StagedFile { file, staging, .. } = *self;
        drop(file);
        remove_if_present(&staging).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn backend() -> (TempDir, FilesystemBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();
        (dir, backend)
    }

    async fn keys(backend: &FilesystemBackend, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = backend
            .list_stream(prefix)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        keys.sort();
        keys
    }

    #[tokio::test]
    async fn test_put_then_read_back() {
        let (_dir, backend) = backend().await;

        backend
            .put("test/object", Bytes::from_static(b"hello world"))
            .await
            .unwrap();
        assert!(backend.exists("test/object").await.unwrap());
        let body: Vec<Bytes> = backend
            .get_stream("test/object")
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(body.concat(), b"hello world");

        let meta = backend.head("test/object").await.unwrap();
        assert_eq!(meta.size, 11);
        assert!(meta.last_modified.is_some());
    }

    #[tokio::test]
    async fn test_streaming_upload_invisible_until_finish() {
        let (_dir, backend) = backend().await;

        let mut upload = backend.put_stream("a/b/c").await.unwrap();
        upload.write(Bytes::from_static(b"part one ")).await.unwrap();
        assert!(!backend.exists("a/b/c").await.unwrap());
        upload.write(Bytes::from_static(b"part two")).await.unwrap();
        assert_eq!(upload.finish().await.unwrap(), 17);

        let body: Vec<Bytes> = backend
            .get_stream("a/b/c")
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(body.concat(), b"part one part two");
    }

    #[tokio::test]
    async fn test_staging_file_is_listed_until_published() {
        let (_dir, backend) = backend().await;

        let mut upload = backend.put_stream("blobs/k").await.unwrap();
        upload.write(Bytes::from_static(b"x")).await.unwrap();
        let during = keys(&backend, "blobs/").await;
        assert_eq!(during.len(), 1);
        assert!(during[0].contains(STAGING_MARKER));

        upload.finish().await.unwrap();
        assert_eq!(keys(&backend, "blobs/").await, vec!["blobs/k"]);
    }

    #[tokio::test]
    async fn test_abort_leaves_nothing_behind() {
        let (_dir, backend) = backend().await;

        let mut upload = backend.put_stream("x/y").await.unwrap();
        upload.write(Bytes::from_static(b"partial")).await.unwrap();
        upload.abort().await.unwrap();

        let left = keys(&backend, "").await;
        assert!(left.is_empty(), "staging file survived abort: {left:?}");
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let (_dir, backend) = backend().await;
        assert!(matches!(
            backend.delete("nope").await,
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            backend.head("nope").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_by_prefix() {
        let (_dir, backend) = backend().await;

        for key in ["blobs/aa/1", "blobs/bb/2", "other/3"] {
            backend.put(key, Bytes::from_static(b"1")).await.unwrap();
        }

        assert_eq!(keys(&backend, "blobs/").await, vec!["blobs/aa/1", "blobs/bb/2"]);
        assert!(keys(&backend, "missing/").await.is_empty());
    }

    #[tokio::test]
    async fn test_traversal_keys_rejected() {
        let (_dir, backend) = backend().await;

        for key in ["../escape", "/absolute/path", "foo/../bar"] {
            assert!(
                matches!(backend.exists(key).await, Err(StorageError::InvalidKey(_))),
                "{key} was accepted"
            );
        }
        assert!(!backend.exists("valid/nested/key").await.unwrap());
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_symlink_out_of_root_rejected() {
        let (dir, backend) = backend().await;
        let outside = tempfile::tempdir().unwrap();
        let secret = outside.path().join("secret.txt");
        std::fs::write(&secret, "secret data").unwrap();
        std::os::unix::fs::symlink(&secret, dir.path().join("link")).unwrap();

        match backend.head("link").await {
            Err(StorageError::InvalidKey(msg)) => assert!(msg.contains("escapes storage root")),
            other => panic!("expected InvalidKey, got {other:?}"),
        }
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_symlinked_ancestor_rejected_on_write() {
        let (dir, backend) = backend().await;
        let outside = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("escape")).unwrap();

        let result = backend
            .put("escape/nested/deep/file.txt", Bytes::from_static(b"data"))
            .await;
        assert!(matches!(result, Err(StorageError::InvalidKey(_))));
        assert!(!outside.path().join("nested").exists());
    }

    #[tokio::test]
    async fn test_health_check_requires_directory() {
        let (dir, backend) = backend().await;
        backend.health_check().await.unwrap();

        let file_root = dir.path().join("plain-file");
        std::fs::write(&file_root, b"").unwrap();
        let broken = FilesystemBackend { root: file_root };
        assert!(broken.health_check().await.is_err());
    }
}
