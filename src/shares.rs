//! Share links: issue, validate, count downloads, revoke.

use std::num::NonZeroU32;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::locks::KeyedLocks;
use crate::storage::models::{Capability, ShareRecord};
use crate::storage::{Database, DownloadOutcome};

/// Random bytes per token; encodes to 43 URL-safe characters.
const TOKEN_BYTES: usize = 32;
const MAX_TOKEN_ATTEMPTS: usize = 8;

const PASSWORD_SCHEME: &str = "pbkdf2-sha256";
const PBKDF2_ITERATIONS: u32 = 100_000;
const SALT_LEN: usize = 16;
const HASH_LEN: usize = 32;

/// Request to issue a share. Passwords must be hashed with [`NewShare::with_password`]
/// before issuing; nothing is hashed implicitly on write.
#[derive(Debug, Clone)]
pub struct NewShare {
    pub file_id: Uuid,
    pub created_by: Uuid,
    pub capability: Capability,
    pub password_hash: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub max_downloads: Option<u64>,
}

impl NewShare {
    pub fn new(file_id: Uuid, created_by: Uuid, capability: Capability) -> Self {
        Self {
            file_id,
            created_by,
            capability,
            password_hash: None,
            expires_at: None,
            max_downloads: None,
        }
    }

    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn max_downloads(mut self, max: u64) -> Self {
        self.max_downloads = Some(max);
        self
    }

    /// Protect the share with a password, storing only its PBKDF2 hash.
    pub fn with_password(mut self, password: &str) -> Result<Self> {
        self.password_hash = Some(hash_password(password)?);
        Ok(self)
    }
}

/// What a validated token grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShareGrant {
    pub share_id: Uuid,
    pub file_id: Uuid,
    pub capability: Capability,
}

pub struct ShareTokenManager {
    db: Database,
    locks: KeyedLocks<Uuid>,
    rng: SystemRandom,
}

impl ShareTokenManager {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            locks: KeyedLocks::new(),
            rng: SystemRandom::new(),
        }
    }

    /// Issue a share on an active file with a fresh unguessable token.
    pub fn issue(&self, new: NewShare) -> Result<ShareRecord> {
        let file = self
            .db
            .get_file(new.file_id)?
            .filter(|f| f.lifecycle.is_active())
            .ok_or_else(|| Error::NotFound(format!("file {}", new.file_id)))?;

        for attempt in 1..=MAX_TOKEN_ATTEMPTS {
            let share = ShareRecord {
                id: Uuid::new_v4(),
                file_id: file.id,
                created_by: new.created_by,
                token: generate_token(&self.rng)?,
                password_hash: new.password_hash.clone(),
                capability: new.capability,
                expires_at: new.expires_at,
                max_downloads: new.max_downloads,
                download_count: 0,
                is_active: true,
                created_at: Utc::now(),
            };
            if self.db.insert_share(&share)? {
                tracing::info!(
                    share_id = %share.id,
                    file_id = %share.file_id,
                    user_id = %share.created_by,
                    "Share issued"
                );
                return Ok(share);
            }
            tracing::warn!(attempt, "Share token collision, regenerating");
        }

        Err(Error::InvalidOperation(
            "could not allocate a unique share token".to_string(),
        ))
    }

    /// Check a token. Conditions are checked in a fixed order: unknown token, exhausted,
    /// expired, revoked, then password.
    pub fn validate(&self, token: &str, password: Option<&str>) -> Result<ShareGrant> {
        let share = self
            .db
            .get_share_by_token(token)?
            .ok_or_else(|| Error::NotFound("share".to_string()))?;

        check_usable(&share, Utc::now())?;

        if let Some(hash) = &share.password_hash {
            let matches = password.is_some_and(|p| verify_password(hash, p));
            if !matches {
                tracing::warn!(share_id = %share.id, "Share password rejected");
                return Err(Error::ShareForbidden);
            }
        }

        Ok(ShareGrant {
            share_id: share.id,
            file_id: share.file_id,
            capability: share.capability,
        })
    }

    /// Count one completed download. Never lets the count pass `max_downloads`.
    /// Returns the new count.
    pub async fn record_download(&self, token: &str) -> Result<u64> {
        let share = self
            .db
            .get_share_by_token(token)?
            .ok_or_else(|| Error::NotFound("share".to_string()))?;

        let _guard = self.locks.lock(&share.id).await;
        match self.db.record_share_download(share.id, Utc::now())? {
            DownloadOutcome::Recorded(share) => {
                tracing::debug!(
                    share_id = %share.id,
                    downloads = share.download_count,
                    "Share download recorded"
                );
                Ok(share.download_count)
            }
            DownloadOutcome::NotFound => Err(Error::NotFound("share".to_string())),
            DownloadOutcome::Exhausted => Err(Error::ShareExhausted),
            DownloadOutcome::Expired => Err(Error::ShareExpired),
            DownloadOutcome::Revoked => Err(Error::ShareRevoked),
        }
    }

    /// Deactivate a share. Revoking twice is fine.
    pub fn revoke(&self, share_id: Uuid) -> Result<ShareRecord> {
        let share = self
            .db
            .deactivate_share(share_id)?
            .ok_or_else(|| Error::NotFound(format!("share {share_id}")))?;
        tracing::info!(share_id = %share_id, file_id = %share.file_id, "Share revoked");
        Ok(share)
    }

    /// Deactivate every active share of a file. Returns how many changed.
    pub fn revoke_for_file(&self, file_id: Uuid) -> Result<usize> {
        let mut revoked = 0;
        for share in self.db.list_shares_for_file(file_id)? {
            if share.is_active {
                self.db.deactivate_share(share.id)?;
                revoked += 1;
            }
        }
        if revoked > 0 {
            tracing::info!(file_id = %file_id, revoked, "Shares revoked for file");
        }
        Ok(revoked)
    }

    pub fn list_for_file(&self, file_id: Uuid) -> Result<Vec<ShareRecord>> {
        Ok(self.db.list_shares_for_file(file_id)?)
    }
}

fn check_usable(share: &ShareRecord, now: DateTime<Utc>) -> Result<()> {
    if share.is_exhausted() {
        return Err(Error::ShareExhausted);
    }
    if share.is_expired(now) {
        return Err(Error::ShareExpired);
    }
    if !share.is_active {
        return Err(Error::ShareRevoked);
    }
    Ok(())
}

fn generate_token(rng: &SystemRandom) -> Result<String> {
    let mut bytes = [0u8; TOKEN_BYTES];
    rng.fill(&mut bytes)
        .map_err(|_| Error::InvalidOperation("system random source failed".to_string()))?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

fn iterations() -> NonZeroU32 {
    NonZeroU32::new(PBKDF2_ITERATIONS).unwrap_or(NonZeroU32::MIN)
}

/// Hash a share password as `pbkdf2-sha256$<iterations>$<salt>$<hash>`.
pub fn hash_password(password: &str) -> Result<String> {
    let mut salt = [0u8; SALT_LEN];
    SystemRandom::new()
        .fill(&mut salt)
        .map_err(|_| Error::InvalidOperation("system random source failed".to_string()))?;

    let mut hash = [0u8; HASH_LEN];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations(),
        &salt,
        password.as_bytes(),
        &mut hash,
    );
    Ok(format!(
        "{PASSWORD_SCHEME}${PBKDF2_ITERATIONS}${}${}",
        URL_SAFE_NO_PAD.encode(salt),
        URL_SAFE_NO_PAD.encode(hash)
    ))
}

/// Check `password` against a hash produced by [`hash_password`]. Malformed hashes never match.
pub fn verify_password(stored: &str, password: &str) -> bool {
    let mut parts = stored.split('$');
    let (Some(scheme), Some(iterations), Some(salt), Some(hash), None) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return false;
    };
    if scheme != PASSWORD_SCHEME {
        return false;
    }
    let Some(iterations) = iterations.parse().ok().and_then(NonZeroU32::new) else {
        return false;
    };
    let (Ok(salt), Ok(hash)) = (URL_SAFE_NO_PAD.decode(salt), URL_SAFE_NO_PAD.decode(hash)) else {
        return false;
    };

    pbkdf2::verify(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        &salt,
        password.as_bytes(),
        &hash,
    )
    .is_ok()
}
