use std::time::{Duration, Instant};

use async_trait::async_trait;
use aws_config::retry::{RetryConfig, RetryMode};
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream as S3Body;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart as S3CompletedPart};
use aws_sdk_s3::Client;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio_util::io::ReaderStream;

use super::{ByteStream, CompletedPart, ObjectInfo, PartId, PutResult, StorageBackend};
use crate::config::{BackendKind, ConfigError, MultipartConfig, StorageConfig};
use crate::context::OpContext;
use crate::error::{Error, Operation, Result};

/// Smallest non-final part S3 accepts
const S3_MIN_PART_SIZE: u64 = 5 * 1024 * 1024;
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// S3 and S3-compatible (MinIO) object store.
pub struct S3Backend {
    client: Client,
    bucket: String,
    kind: BackendKind,
    url_ttl: Duration,
    min_part_size: u64,
    max_part_size: u64,
}

impl S3Backend {
    /// Create a client for the configured bucket.
    ///
    /// A custom endpoint switches to path-style addressing, which MinIO requires. Static
    /// credentials are used when both halves are configured; otherwise the default AWS
    /// provider chain applies.
    pub async fn new(storage: &StorageConfig, multipart: &MultipartConfig) -> Result<Self> {
        let s3 = &storage.s3;
        let bucket = s3.bucket.clone().ok_or_else(|| {
            ConfigError::ValidationError("S3_BUCKET is required for the s3 backend".to_string())
        })?;

        let retry_config = RetryConfig::standard()
            .with_max_attempts(s3.max_attempts)
            .with_retry_mode(RetryMode::Adaptive);

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(s3.region.clone()))
            .retry_config(retry_config);
        if let (Some(id), Some(secret)) = (&s3.access_key_id, &s3.secret_access_key) {
            loader = loader.credentials_provider(Credentials::new(
                id.clone(),
                secret.clone(),
                None,
                None,
                "file-vault-static",
            ));
        }
        let shared = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = &s3.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket,
            kind: storage.backend,
            url_ttl: storage.url_ttl,
            min_part_size: multipart.min_part_size.max(S3_MIN_PART_SIZE),
            max_part_size: multipart.max_part_size.max(S3_MIN_PART_SIZE),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn failure<E>(&self, op: Operation, key: &str, start: Instant, e: E) -> Error
    where
        E: std::error::Error,
    {
        let detail = DisplayErrorContext(&e).to_string();
        tracing::error!(
            error = %detail,
            bucket = %self.bucket,
            key = %key,
            op = %op,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "S3 request failed"
        );
        Error::backend(op, key, detail)
    }

    async fn start_multipart(&self, op: Operation, key: &str) -> Result<String> {
        let start = Instant::now();
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .set_content_type(content_type_for(key))
            .send()
            .await
            .map_err(|e| self.failure(op, key, start, e))?;

        created
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| Error::upload_rejected(op, key, "no upload id returned"))
    }

    async fn send_part(
        &self,
        op: Operation,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> Result<String> {
        let start = Instant::now();
        let size = body.len();
        let uploaded = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number as i32)
            .content_length(size as i64)
            .body(S3Body::from(body))
            .send()
            .await
            .map_err(|e| self.failure(op, key, start, e))?;

        tracing::debug!(
            key = %key,
            part_number,
            size_bytes = size,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "S3 part uploaded"
        );

        uploaded.e_tag().map(trim_etag).ok_or_else(|| {
            Error::upload_rejected(op, key, format!("no etag returned for part {part_number}"))
        })
    }

    async fn finish_multipart(
        &self,
        op: Operation,
        key: &str,
        upload_id: &str,
        parts: Vec<S3CompletedPart>,
    ) -> Result<String> {
        let start = Instant::now();
        let completed = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| self.failure(op, key, start, e))?;

        completed
            .e_tag()
            .map(trim_etag)
            .ok_or_else(|| Error::upload_rejected(op, key, "no etag returned on completion"))
    }

    async fn abort_quietly(&self, key: &str, upload_id: &str) {
        let result = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await;
        if let Err(e) = result {
            tracing::warn!(
                key = %key,
                upload_id = %upload_id,
                error = %DisplayErrorContext(&e),
                "Failed to abort multipart upload"
            );
        }
    }

    async fn head(&self, op: Operation, key: &str) -> Result<Option<ObjectInfo>> {
        let start = Instant::now();
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(out) => Ok(Some(ObjectInfo {
                key: key.to_string(),
                size: out.content_length().unwrap_or(0).max(0) as u64,
                last_modified: out.last_modified().and_then(to_chrono),
                is_dir: key.ends_with('/'),
                mime_type: out.content_type().map(str::to_string),
                etag: out.e_tag().map(trim_etag),
            })),
            Err(e) => {
                let missing = e
                    .as_service_error()
                    .map(|se| se.is_not_found())
                    .unwrap_or(false);
                if missing {
                    Ok(None)
                } else {
                    Err(self.failure(op, key, start, e))
                }
            }
        }
    }

    async fn presign(&self, key: &str, disposition: Option<String>) -> Result<String> {
        let config = PresigningConfig::expires_in(self.url_ttl)
            .map_err(|e| Error::backend(Operation::Url, key, e))?;
        let start = Instant::now();
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .set_response_content_disposition(disposition)
            .presigned(config)
            .await
            .map_err(|e| self.failure(Operation::Url, key, start, e))?;
        Ok(request.uri().to_string())
    }
}

fn trim_etag(etag: &str) -> String {
    etag.trim_matches('"').to_string()
}

fn to_chrono(at: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(at.secs(), at.subsec_nanos())
}

fn content_type_for(key: &str) -> Option<String> {
    mime_guess::from_path(key).first().map(|m| m.to_string())
}

fn attachment_disposition(filename: &str) -> String {
    let cleaned: String = filename
        .chars()
        .filter(|c| !matches!(c, '"' | '\\') && !c.is_control())
        .collect();
    format!("attachment; filename=\"{cleaned}\"")
}

#[async_trait]
impl StorageBackend for S3Backend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn min_part_size(&self) -> u64 {
        self.min_part_size
    }

    async fn save(
        &self,
        _cx: &OpContext,
        key: &str,
        mut data: ByteStream,
        size_hint: Option<u64>,
    ) -> Result<PutResult> {
        let op = Operation::Save;
        let start = Instant::now();
        let part_size = self.min_part_size as usize;
        let mut buf = BytesMut::new();
        let mut upload_id: Option<String> = None;
        let mut parts: Vec<S3CompletedPart> = Vec::new();
        let mut size = 0u64;

        // Content beyond one part goes up as a multipart upload so memory stays bounded
        // by the part size. If this future is dropped mid-upload, the staged parts remain
        // until the bucket's incomplete-upload lifecycle rule removes them.
        let result: Result<String> = async {
            while let Some(chunk) = data.next().await {
                let chunk = chunk.map_err(|e| Error::backend(op, key, e))?;
                size += chunk.len() as u64;
                buf.extend_from_slice(&chunk);

                while buf.len() >= part_size {
                    let body = buf.split_to(part_size).freeze();
                    let id = match &upload_id {
                        Some(id) => id.clone(),
                        None => {
                            let id = self.start_multipart(op, key).await?;
                            upload_id = Some(id.clone());
                            id
                        }
                    };
                    let part_number = parts.len() as u32 + 1;
                    let etag = self.send_part(op, key, &id, part_number, body).await?;
                    parts.push(
                        S3CompletedPart::builder()
                            .part_number(part_number as i32)
                            .e_tag(etag)
                            .build(),
                    );
                }
            }

            if let Some(expected) = size_hint {
                if expected != size {
                    return Err(Error::upload_rejected(
                        op,
                        key,
                        format!("expected {expected} bytes, received {size}"),
                    ));
                }
            }

            match &upload_id {
                None => {
                    let out = self
                        .client
                        .put_object()
                        .bucket(&self.bucket)
                        .key(key)
                        .set_content_type(content_type_for(key))
                        .content_length(buf.len() as i64)
                        .body(S3Body::from(buf.split().freeze()))
                        .send()
                        .await
                        .map_err(|e| self.failure(op, key, start, e))?;
                    out.e_tag()
                        .map(trim_etag)
                        .ok_or_else(|| Error::upload_rejected(op, key, "no etag returned"))
                }
                Some(id) => {
                    if !buf.is_empty() {
                        let part_number = parts.len() as u32 + 1;
                        let etag = self
                            .send_part(op, key, id, part_number, buf.split().freeze())
                            .await?;
                        parts.push(
                            S3CompletedPart::builder()
                                .part_number(part_number as i32)
                                .e_tag(etag)
                                .build(),
                        );
                    }
                    self.finish_multipart(op, key, id, std::mem::take(&mut parts))
                        .await
                }
            }
        }
        .await;

        match result {
            Ok(etag) => {
                tracing::info!(
                    bucket = %self.bucket,
                    key = %key,
                    size_bytes = size,
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "S3 save successful"
                );
                Ok(PutResult { size, etag })
            }
            Err(e) => {
                if let Some(id) = &upload_id {
                    self.abort_quietly(key, id).await;
                }
                Err(e)
            }
        }
    }

    async fn get(&self, _cx: &OpContext, key: &str) -> Result<ByteStream> {
        let start = Instant::now();
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                let missing = e
                    .as_service_error()
                    .map(|se| se.is_no_such_key())
                    .unwrap_or(false);
                return Err(if missing {
                    Error::NotFound(key.to_string())
                } else {
                    self.failure(Operation::Get, key, start, e)
                });
            }
        };

        let reader = response.body.into_async_read();
        Ok(Box::pin(ReaderStream::with_capacity(reader, READ_CHUNK_SIZE)))
    }

    async fn delete(&self, _cx: &OpContext, key: &str) -> Result<()> {
        let start = Instant::now();
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| self.failure(Operation::Delete, key, start, e))?;

        tracing::info!(
            bucket = %self.bucket,
            key = %key,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "S3 delete successful"
        );
        Ok(())
    }

    async fn exists(&self, _cx: &OpContext, key: &str) -> Result<bool> {
        Ok(self.head(Operation::Exists, key).await?.is_some())
    }

    async fn stat(&self, _cx: &OpContext, key: &str) -> Result<ObjectInfo> {
        self.head(Operation::Stat, key)
            .await?
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    async fn copy(&self, _cx: &OpContext, from: &str, to: &str) -> Result<()> {
        if self.head(Operation::Copy, from).await?.is_none() {
            return Err(Error::NotFound(from.to_string()));
        }

        let start = Instant::now();
        let copy_source = format!("{}/{}", self.bucket, urlencoding::encode(from));
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(&copy_source)
            .key(to)
            .send()
            .await
            .map_err(|e| self.failure(Operation::Copy, to, start, e))?;

        tracing::info!(
            from_key = %from,
            to_key = %to,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "S3 copy successful"
        );
        Ok(())
    }

    async fn rename(&self, cx: &OpContext, from: &str, to: &str) -> Result<()> {
        self.copy(cx, from, to).await?;
        self.delete(cx, from).await
    }

    async fn list(&self, _cx: &OpContext, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let start = Instant::now();
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let out = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| self.failure(Operation::List, prefix, start, e))?;

            for object in out.contents() {
                let Some(key) = object.key() else {
                    continue;
                };
                objects.push(ObjectInfo {
                    key: key.to_string(),
                    size: object.size().unwrap_or(0).max(0) as u64,
                    last_modified: object.last_modified().and_then(to_chrono),
                    is_dir: key.ends_with('/'),
                    mime_type: content_type_for(key),
                    etag: object.e_tag().map(trim_etag),
                });
            }

            match out.next_continuation_token() {
                Some(token) if out.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn create_dir(&self, _cx: &OpContext, path: &str) -> Result<()> {
        let marker = format!("{}/", path.trim_end_matches('/'));
        let start = Instant::now();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&marker)
            .body(S3Body::from(Bytes::new()))
            .send()
            .await
            .map_err(|e| self.failure(Operation::CreateDir, path, start, e))?;
        Ok(())
    }

    async fn delete_dir(&self, cx: &OpContext, path: &str) -> Result<()> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        for object in self.list(cx, &prefix).await? {
            self.delete(cx, &object.key).await?;
        }
        Ok(())
    }

    async fn url(&self, _cx: &OpContext, key: &str) -> Result<String> {
        self.presign(key, None).await
    }

    async fn download_url(&self, _cx: &OpContext, key: &str, filename: &str) -> Result<String> {
        self.presign(key, Some(attachment_disposition(filename)))
            .await
    }

    async fn create_multipart(&self, _cx: &OpContext, key: &str) -> Result<String> {
        let upload_id = self.start_multipart(Operation::CreateMultipart, key).await?;
        tracing::debug!(key = %key, upload_id = %upload_id, "S3 multipart upload created");
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        _cx: &OpContext,
        key: &str,
        upload_id: &str,
        part_number: u32,
        mut data: ByteStream,
    ) -> Result<PartId> {
        let op = Operation::UploadPart;
        let mut buf = BytesMut::new();
        while let Some(chunk) = data.next().await {
            let chunk = chunk.map_err(|e| Error::backend(op, key, e))?;
            if (buf.len() + chunk.len()) as u64 > self.max_part_size {
                return Err(Error::upload_rejected(
                    op,
                    key,
                    format!("part {part_number} exceeds {} bytes", self.max_part_size),
                ));
            }
            buf.extend_from_slice(&chunk);
        }

        let size = buf.len() as u64;
        let etag = self
            .send_part(op, key, upload_id, part_number, buf.freeze())
            .await?;
        Ok(PartId {
            part_number,
            etag,
            size,
        })
    }

    async fn complete_multipart(
        &self,
        _cx: &OpContext,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<PutResult> {
        let op = Operation::CompleteMultipart;
        let completed = parts
            .iter()
            .map(|part| {
                S3CompletedPart::builder()
                    .part_number(part.part_number as i32)
                    .e_tag(part.etag.clone())
                    .build()
            })
            .collect();
        let etag = self.finish_multipart(op, key, upload_id, completed).await?;

        let info = self
            .head(op, key)
            .await?
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        Ok(PutResult {
            size: info.size,
            etag,
        })
    }

    async fn abort_multipart(&self, _cx: &OpContext, key: &str, upload_id: &str) -> Result<()> {
        let start = Instant::now();
        let result = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                let gone = e
                    .as_service_error()
                    .map(|se| se.is_no_such_upload())
                    .unwrap_or(false);
                if gone {
                    Ok(())
                } else {
                    Err(self.failure(Operation::AbortMultipart, key, start, e))
                }
            }
        }
    }
}
