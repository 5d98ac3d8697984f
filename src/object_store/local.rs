use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use ring::digest;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use super::{ByteStream, CompletedPart, ObjectInfo, PartId, PutResult, StorageBackend};
use crate::config::BackendKind;
use crate::context::OpContext;
use crate::error::{Error, Operation, Result};
use crate::keys;

/// Staged writes and multipart parts live here, under the storage root so renames stay atomic.
const STAGING_DIR: &str = ".multipart";
const TARGET_FILE: &str = "target";
const CHUNK_SIZE: usize = 64 * 1024;
const DEFAULT_MIN_PART_SIZE: u64 = 5 * 1024 * 1024;
const MAX_PART_NUMBER: u32 = 10_000;

/// Local filesystem object store.
///
/// Objects are written to a staging file and renamed into place, so readers never observe
/// a partial object. Etags are the hex SHA-256 of the content.
pub struct LocalBackend {
    base_path: PathBuf,
    staging_path: PathBuf,
    public_base_url: String,
    min_part_size: u64,
}

impl LocalBackend {
    pub fn new<P: AsRef<Path>>(
        base_path: P,
        public_base_url: impl Into<String>,
    ) -> Result<Self, io::Error> {
        let base_path = base_path.as_ref().to_path_buf();
        let staging_path = base_path.join(STAGING_DIR);
        std::fs::create_dir_all(&staging_path)?;
        Ok(Self {
            base_path,
            staging_path,
            public_base_url: public_base_url.into(),
            min_part_size: DEFAULT_MIN_PART_SIZE,
        })
    }

    pub fn with_min_part_size(mut self, min_part_size: u64) -> Self {
        self.min_part_size = min_part_size;
        self
    }

    /// Map a key onto the filesystem. Keys starting with `.` are reserved for staging.
    fn object_path(&self, key: &str) -> Result<PathBuf> {
        keys::ensure_safe(key)?;
        if key.starts_with('.') {
            return Err(Error::InvalidKey(format!("{key}: reserved prefix")));
        }
        Ok(self.base_path.join(key))
    }

    fn upload_dir(&self, upload_id: &str) -> Result<PathBuf> {
        let id = Uuid::try_parse(upload_id)
            .map_err(|_| Error::NotFound(format!("multipart upload {upload_id}")))?;
        Ok(self.staging_path.join(id.simple().to_string()))
    }

    fn staging_file(&self, label: &str) -> StagedFile {
        StagedFile::new(
            self.staging_path
                .join(format!("{label}-{}", Uuid::new_v4().simple())),
        )
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.base_path).ok()?;
        let segments = rel
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<Vec<_>>>()?;
        Some(segments.join("/"))
    }

    fn public_url(&self, key: &str) -> String {
        let encoded: Vec<String> = key
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();
        format!(
            "{}/{}",
            self.public_base_url.trim_end_matches('/'),
            encoded.join("/")
        )
    }

    /// Move a fully written staging file to its final location
    async fn publish(&self, staged: &Path, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(staged, path).await
    }

    /// Confirm a multipart upload exists and was created for `key`
    async fn check_target(
        &self,
        dir: &Path,
        key: &str,
        upload_id: &str,
        op: Operation,
    ) -> Result<()> {
        let target = match fs::read_to_string(dir.join(TARGET_FILE)).await {
            Ok(target) => target,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("multipart upload {upload_id}")));
            }
            Err(e) => return Err(Error::backend(op, key, e)),
        };
        if target != key {
            return Err(Error::upload_rejected(
                op,
                key,
                format!("upload {upload_id} was created for a different key"),
            ));
        }
        Ok(())
    }
}

fn part_file_name(part_number: u32) -> String {
    format!("part-{part_number:05}")
}

/// Classify an I/O error, keeping missing paths distinguishable
fn io_error(op: Operation, key: &str, e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::NotFound {
        Error::NotFound(key.to_string())
    } else {
        Error::backend(op, key, e)
    }
}

/// A staging file that is removed when dropped, whether the write failed, was
/// cancelled or had its future dropped mid-stream. A published file has already been
/// renamed away, so the removal finds nothing.
struct StagedFile {
    path: PathBuf,
}

impl StagedFile {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove staging file");
            }
        }
    }
}

/// Drain `data` into a new file at `path`, returning its size and SHA-256.
async fn write_stream(
    cx: &OpContext,
    path: &Path,
    mut data: ByteStream,
    op: Operation,
    key: &str,
) -> Result<(u64, String)> {
    let mut file = fs::File::create(path)
        .await
        .map_err(|e| Error::backend(op, key, e))?;
    let mut hasher = digest::Context::new(&digest::SHA256);
    let mut size = 0u64;

    while let Some(chunk) = data.next().await {
        if cx.is_cancelled() {
            return Err(Error::Cancelled {
                op,
                key: key.to_string(),
            });
        }
        let chunk = chunk.map_err(|e| Error::backend(op, key, e))?;
        hasher.update(&chunk);
        file.write_all(&chunk)
            .await
            .map_err(|e| Error::backend(op, key, e))?;
        size += chunk.len() as u64;
    }

    file.sync_all()
        .await
        .map_err(|e| Error::backend(op, key, e))?;
    Ok((size, hex::encode(hasher.finish())))
}

async fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = digest::Context::new(&digest::SHA256);
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finish()))
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn min_part_size(&self) -> u64 {
        self.min_part_size
    }

    async fn save(
        &self,
        cx: &OpContext,
        key: &str,
        data: ByteStream,
        size_hint: Option<u64>,
    ) -> Result<PutResult> {
        let path = self.object_path(key)?;
        let start = Instant::now();
        let staged = self.staging_file("put");

        let result: Result<PutResult> = async {
            let (size, etag) =
                write_stream(cx, staged.path(), data, Operation::Save, key).await?;
            if let Some(expected) = size_hint {
                if expected != size {
                    return Err(Error::upload_rejected(
                        Operation::Save,
                        key,
                        format!("expected {expected} bytes, received {size}"),
                    ));
                }
            }
            self.publish(staged.path(), &path)
                .await
                .map_err(|e| Error::backend(Operation::Save, key, e))?;
            Ok(PutResult { size, etag })
        }
        .await;

        if let Ok(put) = &result {
            tracing::info!(
                key = %key,
                size_bytes = put.size,
                duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                "Local storage save successful"
            );
        }
        result
    }

    async fn get(&self, _cx: &OpContext, key: &str) -> Result<ByteStream> {
        let path = self.object_path(key)?;
        let file = fs::File::open(&path)
            .await
            .map_err(|e| io_error(Operation::Get, key, e))?;
        let meta = file
            .metadata()
            .await
            .map_err(|e| Error::backend(Operation::Get, key, e))?;
        if meta.is_dir() {
            return Err(Error::NotFound(key.to_string()));
        }
        Ok(Box::pin(ReaderStream::with_capacity(file, CHUNK_SIZE)))
    }

    async fn delete(&self, _cx: &OpContext, key: &str) -> Result<()> {
        let path = self.object_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                tracing::info!(key = %key, "Local storage delete successful");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::backend(Operation::Delete, key, e)),
        }
    }

    async fn exists(&self, _cx: &OpContext, key: &str) -> Result<bool> {
        let path = self.object_path(key)?;
        fs::try_exists(&path)
            .await
            .map_err(|e| Error::backend(Operation::Exists, key, e))
    }

    async fn stat(&self, _cx: &OpContext, key: &str) -> Result<ObjectInfo> {
        let path = self.object_path(key)?;
        let meta = fs::metadata(&path)
            .await
            .map_err(|e| io_error(Operation::Stat, key, e))?;
        let last_modified = meta.modified().ok().map(DateTime::<Utc>::from);

        if meta.is_dir() {
            return Ok(ObjectInfo {
                key: key.to_string(),
                size: 0,
                last_modified,
                is_dir: true,
                mime_type: None,
                etag: None,
            });
        }

        let etag = hash_file(&path)
            .await
            .map_err(|e| io_error(Operation::Stat, key, e))?;
        Ok(ObjectInfo {
            key: key.to_string(),
            size: meta.len(),
            last_modified,
            is_dir: false,
            mime_type: mime_guess::from_path(key).first().map(|m| m.to_string()),
            etag: Some(etag),
        })
    }

    async fn copy(&self, _cx: &OpContext, from: &str, to: &str) -> Result<()> {
        let src = self.object_path(from)?;
        let dst = self.object_path(to)?;
        let staged = self.staging_file("copy");

        fs::copy(&src, staged.path())
            .await
            .map_err(|e| io_error(Operation::Copy, from, e))?;
        self.publish(staged.path(), &dst)
            .await
            .map_err(|e| Error::backend(Operation::Copy, to, e))
    }

    async fn rename(&self, _cx: &OpContext, from: &str, to: &str) -> Result<()> {
        let src = self.object_path(from)?;
        let dst = self.object_path(to)?;
        fs::metadata(&src)
            .await
            .map_err(|e| io_error(Operation::Rename, from, e))?;
        self.publish(&src, &dst)
            .await
            .map_err(|e| Error::backend(Operation::Rename, from, e))
    }

    async fn list(&self, cx: &OpContext, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let root = match prefix.rfind('/') {
            Some(idx) => self.object_path(&prefix[..idx])?,
            None => self.base_path.clone(),
        };

        let mut objects = Vec::new();
        let mut pending = vec![root];
        while let Some(dir) = pending.pop() {
            if cx.is_cancelled() {
                return Err(Error::Cancelled {
                    op: Operation::List,
                    key: prefix.to_string(),
                });
            }
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(Error::backend(Operation::List, prefix, e)),
            };

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| Error::backend(Operation::List, prefix, e))?
            {
                let path = entry.path();
                let Some(key) = self.key_for(&path) else {
                    continue;
                };
                if key.starts_with('.') {
                    continue;
                }
                let meta = entry
                    .metadata()
                    .await
                    .map_err(|e| Error::backend(Operation::List, prefix, e))?;

                if meta.is_dir() {
                    if key.starts_with(prefix) || prefix.starts_with(&key) {
                        pending.push(path);
                    }
                } else if key.starts_with(prefix) {
                    objects.push(ObjectInfo {
                        mime_type: mime_guess::from_path(&key).first().map(|m| m.to_string()),
                        key,
                        size: meta.len(),
                        last_modified: meta.modified().ok().map(DateTime::<Utc>::from),
                        is_dir: false,
                        etag: None,
                    });
                }
            }
        }

        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn create_dir(&self, _cx: &OpContext, path: &str) -> Result<()> {
        let dir = self.object_path(path)?;
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::backend(Operation::CreateDir, path, e))
    }

    async fn delete_dir(&self, _cx: &OpContext, path: &str) -> Result<()> {
        let dir = self.object_path(path)?;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::backend(Operation::DeleteDir, path, e)),
        }
    }

    async fn url(&self, _cx: &OpContext, key: &str) -> Result<String> {
        self.object_path(key)?;
        Ok(self.public_url(key))
    }

    async fn download_url(&self, _cx: &OpContext, key: &str, filename: &str) -> Result<String> {
        self.object_path(key)?;
        Ok(format!(
            "{}?download={}",
            self.public_url(key),
            urlencoding::encode(filename)
        ))
    }

    async fn create_multipart(&self, _cx: &OpContext, key: &str) -> Result<String> {
        self.object_path(key)?;
        let upload_id = Uuid::new_v4().simple().to_string();
        let dir = self.staging_path.join(&upload_id);

        fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::backend(Operation::CreateMultipart, key, e))?;
        fs::write(dir.join(TARGET_FILE), key.as_bytes())
            .await
            .map_err(|e| Error::backend(Operation::CreateMultipart, key, e))?;

        tracing::debug!(key = %key, upload_id = %upload_id, "Local multipart upload created");
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        cx: &OpContext,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: ByteStream,
    ) -> Result<PartId> {
        if part_number == 0 || part_number > MAX_PART_NUMBER {
            return Err(Error::upload_rejected(
                Operation::UploadPart,
                key,
                format!("part number {part_number} outside 1..={MAX_PART_NUMBER}"),
            ));
        }
        let dir = self.upload_dir(upload_id)?;
        self.check_target(&dir, key, upload_id, Operation::UploadPart)
            .await?;

        let staged = StagedFile::new(dir.join(format!(
            "{}.{}",
            part_file_name(part_number),
            Uuid::new_v4().simple()
        )));
        let (size, etag) =
            write_stream(cx, staged.path(), data, Operation::UploadPart, key).await?;
        // A retried part replaces the earlier attempt
        fs::rename(staged.path(), dir.join(part_file_name(part_number)))
            .await
            .map_err(|e| Error::backend(Operation::UploadPart, key, e))?;
        Ok(PartId {
            part_number,
            etag,
            size,
        })
    }

    async fn complete_multipart(
        &self,
        cx: &OpContext,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<PutResult> {
        let op = Operation::CompleteMultipart;
        let path = self.object_path(key)?;
        let dir = self.upload_dir(upload_id)?;
        self.check_target(&dir, key, upload_id, op).await?;

        if parts.is_empty() {
            return Err(Error::upload_rejected(op, key, "no parts to assemble"));
        }
        if parts
            .windows(2)
            .any(|pair| pair[0].part_number >= pair[1].part_number)
        {
            return Err(Error::upload_rejected(
                op,
                key,
                "parts must be in strictly ascending order",
            ));
        }

        let start = Instant::now();
        let staged = self.staging_file("complete");
        let result: Result<PutResult> = async {
            let mut out = fs::File::create(staged.path())
                .await
                .map_err(|e| Error::backend(op, key, e))?;
            let mut whole = digest::Context::new(&digest::SHA256);
            let mut size = 0u64;
            let mut buf = vec![0u8; CHUNK_SIZE];

            for (idx, part) in parts.iter().enumerate() {
                let mut file = match fs::File::open(dir.join(part_file_name(part.part_number))).await
                {
                    Ok(file) => file,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        return Err(Error::upload_rejected(
                            op,
                            key,
                            format!("part {} was never uploaded", part.part_number),
                        ));
                    }
                    Err(e) => return Err(Error::backend(op, key, e)),
                };

                let mut part_hash = digest::Context::new(&digest::SHA256);
                let mut part_size = 0u64;
                loop {
                    if cx.is_cancelled() {
                        return Err(Error::Cancelled {
                            op,
                            key: key.to_string(),
                        });
                    }
                    let n = file
                        .read(&mut buf)
                        .await
                        .map_err(|e| Error::backend(op, key, e))?;
                    if n == 0 {
                        break;
                    }
                    part_hash.update(&buf[..n]);
                    whole.update(&buf[..n]);
                    out.write_all(&buf[..n])
                        .await
                        .map_err(|e| Error::backend(op, key, e))?;
                    part_size += n as u64;
                }

                if hex::encode(part_hash.finish()) != part.etag {
                    return Err(Error::upload_rejected(
                        op,
                        key,
                        format!("etag mismatch for part {}", part.part_number),
                    ));
                }
                if idx + 1 < parts.len() && part_size < self.min_part_size {
                    return Err(Error::upload_rejected(
                        op,
                        key,
                        format!(
                            "part {} is {part_size} bytes, below the {} byte minimum",
                            part.part_number, self.min_part_size
                        ),
                    ));
                }
                size += part_size;
            }

            out.sync_all()
                .await
                .map_err(|e| Error::backend(op, key, e))?;
            drop(out);
            self.publish(staged.path(), &path)
                .await
                .map_err(|e| Error::backend(op, key, e))?;

            Ok(PutResult {
                size,
                etag: hex::encode(whole.finish()),
            })
        }
        .await;

        if let Ok(put) = &result {
            if let Err(e) = fs::remove_dir_all(&dir).await {
                tracing::warn!(upload_id = %upload_id, error = %e, "Failed to clean up multipart parts");
            }
            tracing::info!(
                key = %key,
                size_bytes = put.size,
                parts = parts.len(),
                duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                "Local multipart upload completed"
            );
        }
        result
    }

    async fn abort_multipart(&self, _cx: &OpContext, key: &str, upload_id: &str) -> Result<()> {
        let Ok(dir) = self.upload_dir(upload_id) else {
            return Ok(());
        };
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                tracing::debug!(key = %key, upload_id = %upload_id, "Local multipart upload aborted");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::backend(Operation::AbortMultipart, key, e)),
        }
    }
}
