//! Blob storage backends.
//!
//! [`StorageBackend`] is the uniform contract; [`Backend`] is the one variant a deployment
//! runs with, chosen from configuration at startup. All variants share these semantics:
//!
//! - `save` is an upsert and streams its input in bounded chunks
//! - `delete` of a missing key succeeds
//! - `get`/`stat` of a missing key fail with [`Error::NotFound`]
//! - `stat` reports an etag usable to verify content integrity

mod local;
mod s3;

pub use local::LocalBackend;
pub use s3::S3Backend;

use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

use crate::config::{BackendKind, MultipartConfig, StorageConfig};
use crate::context::OpContext;
use crate::error::{Error, Operation, Result};
use crate::keys;

/// Object content as a stream of chunks.
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Wrap in-memory bytes as a single-chunk stream.
pub fn stream_from_bytes(data: impl Into<Bytes>) -> ByteStream {
    let data: Bytes = data.into();
    Box::pin(futures::stream::once(async move { Ok(data) }))
}

/// Metadata reported by [`StorageBackend::stat`] and [`StorageBackend::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub is_dir: bool,
    pub mime_type: Option<String>,
    /// Content integrity tag. Always set by `stat` for objects; `list` may omit it.
    pub etag: Option<String>,
}

/// Outcome of writing a whole object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutResult {
    pub size: u64,
    /// Same value a later `stat` reports for the object
    pub etag: String,
}

/// Backend-assigned identifier of one uploaded part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartId {
    pub part_number: u32,
    pub etag: String,
    pub size: u64,
}

/// One entry of the ordered part list passed to `complete_multipart`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

impl From<&PartId> for CompletedPart {
    fn from(part: &PartId) -> Self {
        Self {
            part_number: part.part_number,
            etag: part.etag.clone(),
        }
    }
}

/// Abstraction over blob storage backends.
/// Keys are produced by [`crate::keys`]; the blobs are meaningless without the metadata DB.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Smallest size accepted for every multipart part except the last
    fn min_part_size(&self) -> u64;

    async fn save(
        &self,
        cx: &OpContext,
        key: &str,
        data: ByteStream,
        size_hint: Option<u64>,
    ) -> Result<PutResult>;

    async fn get(&self, cx: &OpContext, key: &str) -> Result<ByteStream>;

    async fn delete(&self, cx: &OpContext, key: &str) -> Result<()>;

    async fn exists(&self, cx: &OpContext, key: &str) -> Result<bool>;

    async fn stat(&self, cx: &OpContext, key: &str) -> Result<ObjectInfo>;

    async fn copy(&self, cx: &OpContext, from: &str, to: &str) -> Result<()>;

    /// Move an object to a new key (overwriting the destination)
    async fn rename(&self, cx: &OpContext, from: &str, to: &str) -> Result<()>;

    /// Objects whose key starts with `prefix`, sorted by key
    async fn list(&self, cx: &OpContext, prefix: &str) -> Result<Vec<ObjectInfo>>;

    async fn create_dir(&self, cx: &OpContext, path: &str) -> Result<()>;

    /// Remove a directory and everything under it. Missing directories are not an error.
    async fn delete_dir(&self, cx: &OpContext, path: &str) -> Result<()>;

    async fn url(&self, cx: &OpContext, key: &str) -> Result<String>;

    /// URL that makes clients save the content as `filename`
    async fn download_url(&self, cx: &OpContext, key: &str, filename: &str) -> Result<String>;

    async fn create_multipart(&self, cx: &OpContext, key: &str) -> Result<String>;

    async fn upload_part(
        &self,
        cx: &OpContext,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: ByteStream,
    ) -> Result<PartId>;

    async fn complete_multipart(
        &self,
        cx: &OpContext,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<PutResult>;

    /// Release staged parts. Unknown or finished uploads are not an error.
    async fn abort_multipart(&self, cx: &OpContext, key: &str, upload_id: &str) -> Result<()>;
}

/// The configured backend. Every key passes [`keys::ensure_safe`] here before any I/O,
/// and every call runs under its [`OpContext`].
pub enum Backend {
    Local(LocalBackend),
    S3(S3Backend),
}

impl Backend {
    /// Build the backend selected by configuration
    pub async fn from_config(storage: &StorageConfig, multipart: &MultipartConfig) -> Result<Self> {
        let backend = match storage.backend {
            BackendKind::Local => {
                let store = LocalBackend::new(
                    &storage.local_storage_path,
                    storage.local_public_base_url.clone(),
                )
                .map_err(|e| Error::backend(Operation::CreateDir, &storage.local_storage_path, e))?
                .with_min_part_size(multipart.min_part_size);
                tracing::info!(
                    path = %storage.local_storage_path,
                    "Using local storage backend"
                );
                Backend::Local(store)
            }
            BackendKind::S3 | BackendKind::Minio => {
                let store = S3Backend::new(storage, multipart).await?;
                tracing::info!(
                    bucket = %store.bucket(),
                    endpoint = storage.s3.endpoint.as_deref().unwrap_or("aws"),
                    "Using S3 storage backend"
                );
                Backend::S3(store)
            }
        };
        Ok(backend)
    }

    fn inner(&self) -> &dyn StorageBackend {
        match self {
            Backend::Local(store) => store,
            Backend::S3(store) => store,
        }
    }
}

fn check_prefix(prefix: &str) -> Result<()> {
    let trimmed = prefix.trim_end_matches('/');
    if trimmed.is_empty() && prefix.is_empty() {
        return Ok(());
    }
    keys::ensure_safe(trimmed)
}

fn log_done(op: Operation, key: &str, start: Instant) {
    tracing::debug!(
        op = %op,
        key = %key,
        duration_ms = start.elapsed().as_secs_f64() * 1000.0,
        "Storage operation finished"
    );
}

#[async_trait]
impl StorageBackend for Backend {
    fn kind(&self) -> BackendKind {
        self.inner().kind()
    }

    fn min_part_size(&self) -> u64 {
        self.inner().min_part_size()
    }

    async fn save(
        &self,
        cx: &OpContext,
        key: &str,
        data: ByteStream,
        size_hint: Option<u64>,
    ) -> Result<PutResult> {
        keys::ensure_safe(key)?;
        let start = Instant::now();
        let result = cx
            .run(Operation::Save, key, self.inner().save(cx, key, data, size_hint))
            .await?;
        log_done(Operation::Save, key, start);
        Ok(result)
    }

    async fn get(&self, cx: &OpContext, key: &str) -> Result<ByteStream> {
        keys::ensure_safe(key)?;
        let stream = cx
            .run(Operation::Get, key, self.inner().get(cx, key))
            .await?;
        Ok(cx.guard_stream(Operation::Get, key, stream))
    }

    async fn delete(&self, cx: &OpContext, key: &str) -> Result<()> {
        keys::ensure_safe(key)?;
        let start = Instant::now();
        cx.run(Operation::Delete, key, self.inner().delete(cx, key))
            .await?;
        log_done(Operation::Delete, key, start);
        Ok(())
    }

    async fn exists(&self, cx: &OpContext, key: &str) -> Result<bool> {
        keys::ensure_safe(key)?;
        cx.run(Operation::Exists, key, self.inner().exists(cx, key))
            .await
    }

    async fn stat(&self, cx: &OpContext, key: &str) -> Result<ObjectInfo> {
        keys::ensure_safe(key)?;
        cx.run(Operation::Stat, key, self.inner().stat(cx, key)).await
    }

    async fn copy(&self, cx: &OpContext, from: &str, to: &str) -> Result<()> {
        keys::ensure_safe(from)?;
        keys::ensure_safe(to)?;
        let start = Instant::now();
        cx.run(Operation::Copy, from, self.inner().copy(cx, from, to))
            .await?;
        log_done(Operation::Copy, to, start);
        Ok(())
    }

    async fn rename(&self, cx: &OpContext, from: &str, to: &str) -> Result<()> {
        keys::ensure_safe(from)?;
        keys::ensure_safe(to)?;
        let start = Instant::now();
        cx.run(Operation::Rename, from, self.inner().rename(cx, from, to))
            .await?;
        log_done(Operation::Rename, to, start);
        Ok(())
    }

    async fn list(&self, cx: &OpContext, prefix: &str) -> Result<Vec<ObjectInfo>> {
        check_prefix(prefix)?;
        cx.run(Operation::List, prefix, self.inner().list(cx, prefix))
            .await
    }

    async fn create_dir(&self, cx: &OpContext, path: &str) -> Result<()> {
        keys::ensure_safe(path)?;
        cx.run(Operation::CreateDir, path, self.inner().create_dir(cx, path))
            .await
    }

    async fn delete_dir(&self, cx: &OpContext, path: &str) -> Result<()> {
        keys::ensure_safe(path)?;
        let start = Instant::now();
        cx.run(Operation::DeleteDir, path, self.inner().delete_dir(cx, path))
            .await?;
        log_done(Operation::DeleteDir, path, start);
        Ok(())
    }

    async fn url(&self, cx: &OpContext, key: &str) -> Result<String> {
        keys::ensure_safe(key)?;
        cx.run(Operation::Url, key, self.inner().url(cx, key)).await
    }

    async fn download_url(&self, cx: &OpContext, key: &str, filename: &str) -> Result<String> {
        keys::ensure_safe(key)?;
        cx.run(
            Operation::Url,
            key,
            self.inner().download_url(cx, key, filename),
        )
        .await
    }

    async fn create_multipart(&self, cx: &OpContext, key: &str) -> Result<String> {
        keys::ensure_safe(key)?;
        cx.run(
            Operation::CreateMultipart,
            key,
            self.inner().create_multipart(cx, key),
        )
        .await
    }

    async fn upload_part(
        &self,
        cx: &OpContext,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: ByteStream,
    ) -> Result<PartId> {
        keys::ensure_safe(key)?;
        cx.run(
            Operation::UploadPart,
            key,
            self.inner()
                .upload_part(cx, key, upload_id, part_number, data),
        )
        .await
    }

    async fn complete_multipart(
        &self,
        cx: &OpContext,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<PutResult> {
        keys::ensure_safe(key)?;
        let start = Instant::now();
        let result = cx
            .run(
                Operation::CompleteMultipart,
                key,
                self.inner().complete_multipart(cx, key, upload_id, parts),
            )
            .await?;
        log_done(Operation::CompleteMultipart, key, start);
        Ok(result)
    }

    async fn abort_multipart(&self, cx: &OpContext, key: &str, upload_id: &str) -> Result<()> {
        keys::ensure_safe(key)?;
        cx.run(
            Operation::AbortMultipart,
            key,
            self.inner().abort_multipart(cx, key, upload_id),
        )
        .await
    }
}
