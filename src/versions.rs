//! Per-file version history.
//!
//! New content always lands at a fresh [`keys::version_key`], so the blob of an earlier
//! version is never overwritten and rollback only moves the file's current-version
//! pointer. Number assignment is serialized per file id.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::context::OpContext;
use crate::error::{Error, Result};
use crate::keys;
use crate::locks::KeyedLocks;
use crate::object_store::{Backend, ByteStream, StorageBackend};
use crate::quota::QuotaTracker;
use crate::storage::models::{FileRecord, FileVersion};
use crate::storage::Database;

/// Metadata of content already stored at its final key.
#[derive(Debug, Clone)]
pub struct NewVersion {
    pub file_id: Uuid,
    pub byte_size: u64,
    pub content_hash: String,
    pub storage_key: String,
    pub mime_type: Option<String>,
    pub created_by: Uuid,
}

/// An upload sitting at a temp key, waiting to become the next version of a file.
#[derive(Debug, Clone)]
pub struct PendingVersion {
    pub file_id: Uuid,
    /// Owner of the file; version keys live under the owner's namespace
    pub owner_id: Uuid,
    pub temp_key: String,
    pub mime_type: Option<String>,
    pub created_by: Uuid,
}

/// Result of pruning old versions.
#[derive(Debug, Default)]
pub struct PrunedVersions {
    pub removed: Vec<FileVersion>,
    pub released_bytes: u64,
}

/// A verified version with its content stream.
pub struct OpenedVersion {
    pub version: FileVersion,
    pub content: ByteStream,
}

pub struct VersionManager {
    db: Database,
    backend: Arc<Backend>,
    quota: Arc<QuotaTracker>,
    locks: KeyedLocks<Uuid>,
}

impl VersionManager {
    pub fn new(db: Database, backend: Arc<Backend>, quota: Arc<QuotaTracker>) -> Self {
        Self {
            db,
            backend,
            quota,
            locks: KeyedLocks::new(),
        }
    }

    /// Record content already stored under `new.storage_key` as the next version.
    pub async fn record_version(&self, new: NewVersion) -> Result<FileVersion> {
        let _guard = self.locks.lock(&new.file_id).await;
        self.insert_locked(new)
    }

    /// Move an upload from its temp key to the next version key and record it, all inside
    /// the file's critical section. The stored hash is whatever the backend reports for
    /// the final key.
    pub async fn commit_upload(&self, cx: &OpContext, pending: PendingVersion) -> Result<FileVersion> {
        let _guard = self.locks.lock(&pending.file_id).await;

        let number = self.db.next_version_number(pending.file_id)?;
        let key = keys::version_key(pending.owner_id, pending.file_id, number);
        self.backend.rename(cx, &pending.temp_key, &key).await?;

        let info = match self.backend.stat(cx, &key).await {
            Ok(info) => info,
            Err(e) => {
                self.restore_temp(&key, &pending.temp_key).await;
                return Err(e);
            }
        };
        let Some(etag) = info.etag else {
            self.restore_temp(&key, &pending.temp_key).await;
            return Err(Error::InvalidOperation(format!(
                "backend reported no content hash for {key}"
            )));
        };

        let new = NewVersion {
            file_id: pending.file_id,
            byte_size: info.size,
            content_hash: etag,
            storage_key: key.clone(),
            // Version keys carry no extension; the temp key still ends in the filename
            mime_type: pending.mime_type.or_else(|| {
                mime_guess::from_path(&pending.temp_key)
                    .first()
                    .map(|m| m.to_string())
            }),
            created_by: pending.created_by,
        };
        match self.insert_locked(new) {
            Ok(version) => Ok(version),
            Err(e) => {
                self.restore_temp(&key, &pending.temp_key).await;
                Err(e)
            }
        }
    }

    fn insert_locked(&self, new: NewVersion) -> Result<FileVersion> {
        let version = FileVersion {
            id: Uuid::new_v4(),
            file_id: new.file_id,
            version_number: self.db.next_version_number(new.file_id)?,
            byte_size: new.byte_size,
            content_hash: new.content_hash,
            storage_key: new.storage_key,
            mime_type: new.mime_type,
            created_by: new.created_by,
            created_at: Utc::now(),
        };
        self.db.insert_version(&version)?;

        tracing::info!(
            file_id = %version.file_id,
            version = version.version_number,
            key = %version.storage_key,
            size_bytes = version.byte_size,
            "Version recorded"
        );
        Ok(version)
    }

    /// Put the blob back at its temp key so the caller can retry or clean up.
    async fn restore_temp(&self, key: &str, temp_key: &str) {
        let cx = OpContext::new();
        if let Err(e) = self.backend.rename(&cx, key, temp_key).await {
            tracing::error!(
                key = %key,
                temp_key = %temp_key,
                error = %e,
                "Failed to move unrecorded version back to its temp key"
            );
        }
    }

    /// Point the file at an earlier version. Metadata only.
    pub async fn rollback(&self, file_id: Uuid, version_number: u64) -> Result<FileRecord> {
        let _guard = self.locks.lock(&file_id).await;
        let file = self
            .db
            .set_current_version(file_id, version_number)?
            .ok_or_else(|| {
                Error::NotFound(format!("version {version_number} of file {file_id}"))
            })?;
        tracing::info!(file_id = %file_id, version = version_number, "File rolled back");
        Ok(file)
    }

    /// Retained versions, oldest first
    pub fn list(&self, file_id: Uuid) -> Result<Vec<FileVersion>> {
        Ok(self.db.list_versions(file_id)?)
    }

    pub fn get(&self, file_id: Uuid, version_number: u64) -> Result<FileVersion> {
        self.db
            .get_version(file_id, version_number)?
            .ok_or_else(|| Error::NotFound(format!("version {version_number} of file {file_id}")))
    }

    /// Delete all but the newest `keep` versions, never the current one, removing their
    /// blobs and releasing their bytes from the owner's quota.
    pub async fn prune(&self, cx: &OpContext, file_id: Uuid, keep: usize) -> Result<PrunedVersions> {
        let _guard = self.locks.lock(&file_id).await;
        let file = self
            .db
            .get_file(file_id)?
            .ok_or_else(|| Error::NotFound(format!("file {file_id}")))?;

        let mut versions = self.db.list_versions(file_id)?;
        versions.sort_by(|a, b| b.version_number.cmp(&a.version_number));
        let doomed: Vec<u64> = versions
            .iter()
            .skip(keep)
            .map(|v| v.version_number)
            .filter(|&n| n != file.current_version)
            .collect();
        if doomed.is_empty() {
            return Ok(PrunedVersions::default());
        }

        let removed = self.db.remove_versions(file_id, &doomed)?;
        let released_bytes: u64 = removed.iter().map(|v| v.byte_size).sum();
        self.quota.release_bytes(file.owner_id, released_bytes).await?;

        for version in &removed {
            self.backend.delete(cx, &version.storage_key).await?;
        }

        tracing::info!(
            file_id = %file_id,
            removed = removed.len(),
            size_bytes = released_bytes,
            "Versions pruned"
        );
        Ok(PrunedVersions {
            removed,
            released_bytes,
        })
    }

    /// Open a version for reading after checking the backend's hash against the stored
    /// one. A mismatch fails with [`Error::Corruption`]; there is no fallback to another
    /// version.
    pub async fn open(&self, cx: &OpContext, file_id: Uuid, version_number: u64) -> Result<OpenedVersion> {
        let version = self.get(file_id, version_number)?;
        let info = self.backend.stat(cx, &version.storage_key).await?;

        if info.etag.as_deref() != Some(version.content_hash.as_str()) {
            let actual = info.etag.unwrap_or_default();
            tracing::error!(
                file_id = %file_id,
                version = version_number,
                key = %version.storage_key,
                expected = %version.content_hash,
                actual = %actual,
                "Stored content does not match its recorded hash"
            );
            return Err(Error::Corruption {
                key: version.storage_key,
                expected: version.content_hash,
                actual,
            });
        }

        let content = self.backend.get(cx, &version.storage_key).await?;
        tracing::debug!(file_id = %file_id, version = version_number, "Version opened");
        Ok(OpenedVersion { version, content })
    }

    /// Open the version the file currently points at
    pub async fn open_current(&self, cx: &OpContext, file_id: Uuid) -> Result<OpenedVersion> {
        let file = self
            .db
            .get_file(file_id)?
            .ok_or_else(|| Error::NotFound(format!("file {file_id}")))?;
        if file.current_version == 0 {
            return Err(Error::NotFound(format!("file {file_id} has no content")));
        }
        self.open(cx, file_id, file.current_version).await
    }
}
