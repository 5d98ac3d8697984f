//! Chunked upload sessions on top of a backend's multipart protocol.
//!
//! A session moves `Initiated -> Uploading -> (Completing) -> Completed | Aborted`. The
//! terminal states destroy it, so a finished upload id is simply unknown afterwards.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::context::OpContext;
use crate::error::{Error, Operation, Result};
use crate::object_store::{Backend, ByteStream, CompletedPart, PartId, StorageBackend};
use crate::quota::{QuotaTracker, Reservation};
use crate::storage::models::QuotaState;

pub const MAX_PART_NUMBER: u32 = 10_000;

/// Budget for the best-effort abort issued after a cancelled call
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initiated,
    Uploading,
    /// `complete` is in flight; parts and aborts are refused until it settles
    Completing,
}

/// The user and file a session was opened for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadTarget {
    pub user_id: Uuid,
    pub file_id: Uuid,
}

struct UploadSession {
    key: String,
    target: Option<UploadTarget>,
    state: SessionState,
    parts: BTreeMap<u32, PartId>,
    created_at: DateTime<Utc>,
    reservation: Option<Reservation>,
}

/// Read-only view of an open session.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub upload_id: String,
    pub key: String,
    pub target: Option<UploadTarget>,
    pub state: SessionState,
    pub parts: Vec<PartId>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub reserved_bytes: Option<u64>,
}

/// A session that outlived its TTL without reaching a terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleSession {
    pub upload_id: String,
    pub key: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CompletedUpload {
    pub upload_id: String,
    pub key: String,
    pub size: u64,
    pub etag: String,
    /// Quota state after committing the session's reservation, if it carried one
    pub quota: Option<QuotaState>,
}

pub struct MultipartCoordinator {
    backend: Arc<Backend>,
    quota: Arc<QuotaTracker>,
    sessions: Mutex<HashMap<String, UploadSession>>,
    session_ttl: Duration,
}

impl MultipartCoordinator {
    pub fn new(backend: Arc<Backend>, quota: Arc<QuotaTracker>, session_ttl: Duration) -> Self {
        Self {
            backend,
            quota,
            sessions: Mutex::new(HashMap::new()),
            session_ttl,
        }
    }

    fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, UploadSession>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn expires_at(&self, created_at: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.session_ttl)
            .ok()
            .and_then(|ttl| created_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Open a session for `key`. The reservation, if any, is held until the session ends.
    pub async fn initiate(
        &self,
        cx: &OpContext,
        key: &str,
        reservation: Option<Reservation>,
    ) -> Result<String> {
        self.open_session(cx, key, None, reservation).await
    }

    /// Open a session bound to `target`; see [`MultipartCoordinator::authorize`].
    pub async fn initiate_for(
        &self,
        cx: &OpContext,
        key: &str,
        target: UploadTarget,
        reservation: Option<Reservation>,
    ) -> Result<String> {
        self.open_session(cx, key, Some(target), reservation).await
    }

    async fn open_session(
        &self,
        cx: &OpContext,
        key: &str,
        target: Option<UploadTarget>,
        reservation: Option<Reservation>,
    ) -> Result<String> {
        let upload_id = self.backend.create_multipart(cx, key).await?;

        let session = UploadSession {
            key: key.to_string(),
            target,
            state: SessionState::Initiated,
            parts: BTreeMap::new(),
            created_at: Utc::now(),
            reservation,
        };
        self.sessions().insert(upload_id.clone(), session);

        tracing::info!(key = %key, upload_id = %upload_id, "Multipart upload initiated");
        Ok(upload_id)
    }

    /// Upload one part. Parts may arrive in any order and concurrently; re-uploading a part
    /// number replaces the earlier identifier. A failed part leaves the session open.
    pub async fn upload_part(
        &self,
        cx: &OpContext,
        upload_id: &str,
        part_number: u32,
        data: ByteStream,
    ) -> Result<PartId> {
        let key = {
            let mut sessions = self.sessions();
            let session = sessions
                .get_mut(upload_id)
                .ok_or_else(|| unknown_upload(upload_id))?;
            if !(1..=MAX_PART_NUMBER).contains(&part_number) {
                return Err(Error::upload_rejected(
                    Operation::UploadPart,
                    session.key.clone(),
                    format!("part number {part_number} outside 1..={MAX_PART_NUMBER}"),
                ));
            }
            if session.state == SessionState::Completing {
                return Err(Error::InvalidOperation(format!(
                    "upload {upload_id} is completing"
                )));
            }
            session.state = SessionState::Uploading;
            session.key.clone()
        };

        let result = self
            .backend
            .upload_part(cx, &key, upload_id, part_number, data)
            .await;

        match result {
            Ok(part) => {
                let mut sessions = self.sessions();
                let Some(session) = sessions.get_mut(upload_id) else {
                    return Err(unknown_upload(upload_id));
                };
                session.parts.insert(part_number, part.clone());
                tracing::debug!(
                    key = %key,
                    upload_id = %upload_id,
                    part_number,
                    size_bytes = part.size,
                    "Multipart part recorded"
                );
                Ok(part)
            }
            Err(e) => {
                if e.is_cancelled() {
                    self.abort_after_cancel(upload_id).await;
                }
                Err(e)
            }
        }
    }

    /// Assemble the object. `parts` must be numbered exactly `1..=N` in order, each
    /// matching the identifier recorded for that number, and every part but the last must
    /// meet the backend's minimum part size. A rejected or failed completion leaves the
    /// session open for another attempt.
    pub async fn complete(
        &self,
        cx: &OpContext,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<CompletedUpload> {
        let min_part_size = self.backend.min_part_size();
        let key = {
            let mut sessions = self.sessions();
            let session = sessions
                .get_mut(upload_id)
                .ok_or_else(|| unknown_upload(upload_id))?;
            if session.state == SessionState::Completing {
                return Err(Error::InvalidOperation(format!(
                    "upload {upload_id} is already completing"
                )));
            }
            validate_parts(session, parts, min_part_size)?;
            session.state = SessionState::Completing;
            session.key.clone()
        };

        let result = self
            .backend
            .complete_multipart(cx, &key, upload_id, parts)
            .await;

        let put = match result {
            Ok(put) => put,
            Err(e) => {
                if e.is_cancelled() {
                    self.abort_after_cancel(upload_id).await;
                } else {
                    self.reopen(upload_id);
                }
                return Err(e);
            }
        };

        let session = self.sessions().remove(upload_id);
        let reservation = session.and_then(|s| s.reservation);
        let quota = match reservation {
            Some(reservation) => match self.quota.commit(reservation, put.size).await {
                Ok(state) => Some(state),
                Err(e) => {
                    // The object no longer fits; do not keep bytes nobody is charged for
                    if let Err(cleanup) = self.backend.delete(&cleanup_context(), &key).await {
                        tracing::error!(key = %key, error = %cleanup, "Failed to remove over-quota upload");
                    }
                    return Err(e);
                }
            },
            None => None,
        };

        tracing::info!(
            key = %key,
            upload_id = %upload_id,
            size_bytes = put.size,
            parts = parts.len(),
            "Multipart upload completed"
        );
        Ok(CompletedUpload {
            upload_id: upload_id.to_string(),
            key,
            size: put.size,
            etag: put.etag,
            quota,
        })
    }

    /// Destroy a session and release its staged parts and reservation. Unknown,
    /// completed and already aborted ids succeed.
    pub async fn abort(&self, cx: &OpContext, upload_id: &str) -> Result<()> {
        let session = {
            let mut sessions = self.sessions();
            let completing = match sessions.get(upload_id) {
                None => return Ok(()),
                Some(session) => session.state == SessionState::Completing,
            };
            if completing {
                return Err(Error::InvalidOperation(format!(
                    "upload {upload_id} is completing"
                )));
            }
            sessions.remove(upload_id)
        };
        let Some(session) = session else {
            return Ok(());
        };

        // The reservation is released when `session` drops, whatever the backend says
        self.backend
            .abort_multipart(cx, &session.key, upload_id)
            .await?;
        tracing::info!(key = %session.key, upload_id = %upload_id, "Multipart upload aborted");
        Ok(())
    }

    /// Sessions older than the TTL at `now`, for an external sweep.
    pub fn stale_sessions(&self, now: DateTime<Utc>) -> Vec<StaleSession> {
        let mut stale: Vec<StaleSession> = self
            .sessions()
            .iter()
            .filter(|(_, s)| s.state != SessionState::Completing && self.expires_at(s.created_at) < now)
            .map(|(id, s)| StaleSession {
                upload_id: id.clone(),
                key: s.key.clone(),
                created_at: s.created_at,
            })
            .collect();
        stale.sort_by_key(|s| s.created_at);
        stale
    }

    /// Abort every stale session. Returns how many were reclaimed.
    pub async fn reap_stale(&self, cx: &OpContext) -> usize {
        let mut reaped = 0;
        for stale in self.stale_sessions(Utc::now()) {
            match self.abort(cx, &stale.upload_id).await {
                Ok(()) => reaped += 1,
                Err(e) => tracing::warn!(
                    upload_id = %stale.upload_id,
                    key = %stale.key,
                    error = %e,
                    "Failed to reap stale multipart upload"
                ),
            }
        }
        if reaped > 0 {
            tracing::info!(reaped, "Reaped stale multipart uploads");
        }
        reaped
    }

    /// Confirm the session was opened by `user_id`, and for `file_id` when given.
    /// Sessions opened without a target belong to nobody.
    pub fn authorize(&self, upload_id: &str, user_id: Uuid, file_id: Option<Uuid>) -> Result<()> {
        let sessions = self.sessions();
        let session = sessions
            .get(upload_id)
            .ok_or_else(|| unknown_upload(upload_id))?;
        let allowed = session.target.is_some_and(|target| {
            target.user_id == user_id && file_id.map_or(true, |id| id == target.file_id)
        });
        if !allowed {
            tracing::warn!(
                upload_id = %upload_id,
                user_id = %user_id,
                "Multipart session used by someone other than its owner"
            );
            return Err(Error::PermissionDenied(format!("multipart upload {upload_id}")));
        }
        Ok(())
    }

    pub fn session(&self, upload_id: &str) -> Option<SessionSnapshot> {
        let sessions = self.sessions();
        let session = sessions.get(upload_id)?;
        Some(SessionSnapshot {
            upload_id: upload_id.to_string(),
            key: session.key.clone(),
            target: session.target,
            state: session.state,
            parts: session.parts.values().cloned().collect(),
            created_at: session.created_at,
            expires_at: self.expires_at(session.created_at),
            reserved_bytes: session.reservation.as_ref().map(Reservation::bytes),
        })
    }

    pub fn open_sessions(&self) -> usize {
        self.sessions().len()
    }

    fn reopen(&self, upload_id: &str) {
        if let Some(session) = self.sessions().get_mut(upload_id) {
            session.state = SessionState::Uploading;
        }
    }

    async fn abort_after_cancel(&self, upload_id: &str) {
        let session = self.sessions().remove(upload_id);
        let Some(session) = session else {
            return;
        };
        tracing::warn!(key = %session.key, upload_id = %upload_id, "Upload cancelled, aborting session");
        if let Err(e) = self
            .backend
            .abort_multipart(&cleanup_context(), &session.key, upload_id)
            .await
        {
            tracing::warn!(upload_id = %upload_id, error = %e, "Best-effort abort failed");
        }
    }
}

fn unknown_upload(upload_id: &str) -> Error {
    Error::NotFound(format!("multipart upload {upload_id}"))
}

fn cleanup_context() -> OpContext {
    OpContext::new().with_timeout(CLEANUP_TIMEOUT)
}

fn validate_parts(
    session: &UploadSession,
    parts: &[CompletedPart],
    min_part_size: u64,
) -> Result<()> {
    let op = Operation::CompleteMultipart;
    if parts.is_empty() {
        return Err(Error::upload_rejected(op, session.key.clone(), "no parts supplied"));
    }

    for (idx, part) in parts.iter().enumerate() {
        let expected = idx as u32 + 1;
        if part.part_number != expected {
            return Err(Error::upload_rejected(
                op,
                session.key.clone(),
                format!(
                    "part numbers must run 1..={} without gaps; found {} at position {expected}",
                    parts.len(),
                    part.part_number
                ),
            ));
        }

        let recorded = session.parts.get(&part.part_number).ok_or_else(|| {
            Error::upload_rejected(
                op,
                session.key.clone(),
                format!("part {} was never uploaded", part.part_number),
            )
        })?;
        if recorded.etag != part.etag {
            return Err(Error::upload_rejected(
                op,
                session.key.clone(),
                format!("part {} does not match the uploaded identifier", part.part_number),
            ));
        }
        if idx + 1 < parts.len() && recorded.size < min_part_size {
            return Err(Error::upload_rejected(
                op,
                session.key.clone(),
                format!(
                    "part {} is {} bytes, below the {min_part_size} byte minimum",
                    part.part_number, recorded.size
                ),
            ));
        }
    }
    Ok(())
}
