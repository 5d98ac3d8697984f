//! The coordination flow in one place: key, quota admission, streamed write, version record.

use std::sync::Arc;

use uuid::Uuid;

use crate::config::Config;
use crate::context::OpContext;
use crate::error::{Error, Result};
use crate::keys;
use crate::multipart::{MultipartCoordinator, UploadTarget};
use crate::object_store::{Backend, ByteStream, CompletedPart, PartId, StorageBackend};
use crate::quota::{Identity, QuotaTracker};
use crate::shares::{ShareGrant, ShareTokenManager};
use crate::storage::models::{Capability, FileKind, FileRecord, FileVersion};
use crate::storage::{Database, PurgedTree};
use crate::tree::FileTree;
use crate::versions::{OpenedVersion, PendingVersion, VersionManager};

pub struct Vault {
    db: Database,
    backend: Arc<Backend>,
    quota: Arc<QuotaTracker>,
    multipart: MultipartCoordinator,
    versions: VersionManager,
    shares: ShareTokenManager,
    tree: FileTree,
}

/// A share download that passed validation and integrity checks.
pub struct SharedDownload {
    pub grant: ShareGrant,
    pub opened: OpenedVersion,
    /// Downloads counted so far, this one included
    pub download_count: u64,
}

impl Vault {
    /// Open the database and the configured backend
    pub async fn open(config: &Config) -> Result<Self> {
        let db = Database::open(&config.data_dir)?;
        let backend = Backend::from_config(&config.storage, &config.multipart).await?;
        Ok(Self::new(db, backend, config))
    }

    pub fn new(db: Database, backend: Backend, config: &Config) -> Self {
        let backend = Arc::new(backend);
        let quota = Arc::new(QuotaTracker::new(db.clone(), config.default_storage_ceiling));
        Self {
            multipart: MultipartCoordinator::new(
                Arc::clone(&backend),
                Arc::clone(&quota),
                config.multipart.session_ttl,
            ),
            versions: VersionManager::new(db.clone(), Arc::clone(&backend), Arc::clone(&quota)),
            shares: ShareTokenManager::new(db.clone()),
            tree: FileTree::new(db.clone()),
            db,
            backend,
            quota,
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn quota(&self) -> &QuotaTracker {
        &self.quota
    }

    pub fn multipart(&self) -> &MultipartCoordinator {
        &self.multipart
    }

    pub fn versions(&self) -> &VersionManager {
        &self.versions
    }

    pub fn shares(&self) -> &ShareTokenManager {
        &self.shares
    }

    pub fn tree(&self) -> &FileTree {
        &self.tree
    }

    fn owned_file(&self, identity: &Identity, file_id: Uuid) -> Result<FileRecord> {
        let file = self.tree.get(file_id)?;
        if !file.lifecycle.is_active() {
            return Err(Error::NotFound(format!("file {file_id}")));
        }
        if file.owner_id != identity.id {
            return Err(Error::PermissionDenied(format!("file {file_id}")));
        }
        if file.kind != FileKind::File {
            return Err(Error::InvalidOperation(format!(
                "{} is a directory",
                file.path
            )));
        }
        Ok(file)
    }

    /// Store `size` bytes as the next version of `file_id`.
    ///
    /// The write is admitted against the owner's quota first; the reservation is given
    /// back if anything fails, including cancellation. The bytes are charged before the
    /// version is recorded, so a stored version is never free.
    pub async fn upload(
        &self,
        cx: &OpContext,
        identity: &Identity,
        file_id: Uuid,
        data: ByteStream,
        size: u64,
        mime_type: Option<String>,
    ) -> Result<FileVersion> {
        let file = self.owned_file(identity, file_id)?;
        let reservation = self.quota.reserve(identity, size).await?;

        let temp_key = keys::temp_key(identity.id, &file.name);
        let put = self.backend.save(cx, &temp_key, data, Some(size)).await?;

        if let Err(e) = self.quota.commit(reservation, put.size).await {
            self.remove_temp(&temp_key).await;
            return Err(e);
        }
        match self
            .commit_temp(cx, identity, &file, temp_key, mime_type)
            .await
        {
            Ok(version) => Ok(version),
            Err(e) => {
                self.quota.release_bytes(identity.id, put.size).await?;
                Err(e)
            }
        }
    }

    /// Open a multipart session for the next version of `file_id`, admitting
    /// `expected_size` bytes up front.
    pub async fn begin_multipart(
        &self,
        cx: &OpContext,
        identity: &Identity,
        file_id: Uuid,
        expected_size: u64,
    ) -> Result<String> {
        let file = self.owned_file(identity, file_id)?;
        let reservation = self.quota.reserve(identity, expected_size).await?;
        let temp_key = keys::temp_key(identity.id, &file.name);
        let target = UploadTarget {
            user_id: identity.id,
            file_id: file.id,
        };
        self.multipart
            .initiate_for(cx, &temp_key, target, Some(reservation))
            .await
    }

    /// Upload one part of a session opened by `identity`
    pub async fn upload_part(
        &self,
        cx: &OpContext,
        identity: &Identity,
        upload_id: &str,
        part_number: u32,
        data: ByteStream,
    ) -> Result<PartId> {
        self.multipart.authorize(upload_id, identity.id, None)?;
        self.multipart
            .upload_part(cx, upload_id, part_number, data)
            .await
    }

    /// Abort a session opened by `identity`. Unknown ids succeed.
    pub async fn abort_multipart(
        &self,
        cx: &OpContext,
        identity: &Identity,
        upload_id: &str,
    ) -> Result<()> {
        match self.multipart.authorize(upload_id, identity.id, None) {
            Err(Error::NotFound(_)) => return Ok(()),
            other => other?,
        }
        self.multipart.abort(cx, upload_id).await
    }

    /// Complete a session opened by [`Vault::begin_multipart`] and record the result.
    pub async fn finish_multipart(
        &self,
        cx: &OpContext,
        identity: &Identity,
        file_id: Uuid,
        upload_id: &str,
        parts: &[CompletedPart],
        mime_type: Option<String>,
    ) -> Result<FileVersion> {
        let file = self.owned_file(identity, file_id)?;
        // The session's reservation is charged to whoever opened it
        self.multipart
            .authorize(upload_id, identity.id, Some(file.id))?;
        let completed = self.multipart.complete(cx, upload_id, parts).await?;
        match self
            .commit_temp(cx, identity, &file, completed.key.clone(), mime_type)
            .await
        {
            Ok(version) => Ok(version),
            Err(e) => {
                // The upload was charged on completion
                self.quota.release_bytes(identity.id, completed.size).await?;
                Err(e)
            }
        }
    }

    async fn commit_temp(
        &self,
        cx: &OpContext,
        identity: &Identity,
        file: &FileRecord,
        temp_key: String,
        mime_type: Option<String>,
    ) -> Result<FileVersion> {
        let pending = PendingVersion {
            file_id: file.id,
            owner_id: file.owner_id,
            temp_key: temp_key.clone(),
            mime_type,
            created_by: identity.id,
        };
        match self.versions.commit_upload(cx, pending).await {
            Ok(version) => Ok(version),
            Err(e) => {
                self.remove_temp(&temp_key).await;
                Err(e)
            }
        }
    }

    async fn remove_temp(&self, temp_key: &str) {
        if let Err(e) = self.backend.delete(&OpContext::new(), temp_key).await {
            tracing::warn!(key = %temp_key, error = %e, "Failed to remove temp upload");
        }
    }

    /// Read a version (the current one when `version` is `None`), verified against its hash
    pub async fn download(
        &self,
        cx: &OpContext,
        file_id: Uuid,
        version: Option<u64>,
    ) -> Result<OpenedVersion> {
        match version {
            Some(number) => self.versions.open(cx, file_id, number).await,
            None => self.versions.open_current(cx, file_id).await,
        }
    }

    /// Read a file through a share link. The download is counted once the content has
    /// passed its integrity check and is ready to stream.
    pub async fn download_shared(
        &self,
        cx: &OpContext,
        token: &str,
        password: Option<&str>,
    ) -> Result<SharedDownload> {
        let grant = self.shares.validate(token, password)?;
        if grant.capability == Capability::View {
            return Err(Error::PermissionDenied(
                "share does not allow downloads".to_string(),
            ));
        }

        let opened = self.versions.open_current(cx, grant.file_id).await?;
        let download_count = self.shares.record_download(token).await?;
        Ok(SharedDownload {
            grant,
            opened,
            download_count,
        })
    }

    /// Permanently delete a node and its subtree: records, versions, shares, blobs and the
    /// bytes charged for them.
    pub async fn purge(&self, cx: &OpContext, identity: &Identity, file_id: Uuid) -> Result<PurgedTree> {
        let file = self.tree.get(file_id)?;
        if file.owner_id != identity.id {
            return Err(Error::PermissionDenied(format!("file {file_id}")));
        }

        let purged = self.tree.purge(file_id)?;
        self.quota
            .release_bytes(identity.id, purged.stored_bytes())
            .await?;
        for version in &purged.versions {
            self.backend.delete(cx, &version.storage_key).await?;
        }
        Ok(purged)
    }

    /// One sweep of stale multipart sessions
    pub async fn reap_stale_uploads(&self, cx: &OpContext) -> usize {
        self.multipart.reap_stale(cx).await
    }
}
