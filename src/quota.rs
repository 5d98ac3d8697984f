//! Per-user storage accounting.
//!
//! Committed usage is durable ([`QuotaState`] in the database). Reservations for writes
//! still in flight live in memory only and are released when the [`Reservation`] drops,
//! so a cancelled or failed upload can never leak admitted bytes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::locks::KeyedLocks;
use crate::storage::models::QuotaState;
use crate::storage::Database;

/// A resolved user identity, supplied by the caller's auth layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub id: Uuid,
    /// Ceiling on the user's aggregate stored bytes
    pub storage_ceiling: u64,
}

impl Identity {
    pub fn new(id: Uuid, storage_ceiling: u64) -> Self {
        Self {
            id,
            storage_ceiling,
        }
    }
}

/// Snapshot of a user's accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Usage {
    pub ceiling: u64,
    pub consumed: u64,
    /// Admitted by outstanding reservations, not yet committed
    pub reserved: u64,
}

#[derive(Debug, Default)]
struct Pending(Mutex<HashMap<Uuid, u64>>);

impl Pending {
    fn get(&self, user: Uuid) -> u64 {
        let pending = self.0.lock().unwrap_or_else(|e| e.into_inner());
        pending.get(&user).copied().unwrap_or(0)
    }

    fn add(&self, user: Uuid, bytes: u64) {
        let mut pending = self.0.lock().unwrap_or_else(|e| e.into_inner());
        *pending.entry(user).or_insert(0) += bytes;
    }

    fn sub(&self, user: Uuid, bytes: u64) {
        let mut pending = self.0.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(reserved) = pending.get_mut(&user) {
            *reserved = reserved.saturating_sub(bytes);
            if *reserved == 0 {
                pending.remove(&user);
            }
        }
    }
}

/// Bytes admitted for one write. Commit it with [`QuotaTracker::commit`]; dropping it
/// without committing gives the bytes back.
#[derive(Debug)]
pub struct Reservation {
    user: Uuid,
    ceiling: u64,
    bytes: u64,
    pending: Arc<Pending>,
    settled: bool,
}

impl Reservation {
    pub fn user(&self) -> Uuid {
        self.user
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    fn settle(mut self) {
        self.pending.sub(self.user, self.bytes);
        self.settled = true;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.settled {
            self.pending.sub(self.user, self.bytes);
            tracing::debug!(
                user_id = %self.user,
                size_bytes = self.bytes,
                "Quota reservation released"
            );
        }
    }
}

pub struct QuotaTracker {
    db: Database,
    locks: KeyedLocks<Uuid>,
    pending: Arc<Pending>,
    /// Ceiling recorded for users first seen outside a request (e.g. on release)
    default_ceiling: u64,
}

impl QuotaTracker {
    pub fn new(db: Database, default_ceiling: u64) -> Self {
        Self {
            db,
            locks: KeyedLocks::new(),
            pending: Arc::new(Pending::default()),
            default_ceiling,
        }
    }

    /// Admit `bytes` for `identity` if `consumed + reserved + bytes` stays within the
    /// identity's ceiling. Serialized per user.
    pub async fn reserve(&self, identity: &Identity, bytes: u64) -> Result<Reservation> {
        let _guard = self.locks.lock(&identity.id).await;

        let consumed = self
            .db
            .get_quota(identity.id)?
            .map(|q| q.consumed)
            .unwrap_or(0);
        let reserved = self.pending.get(identity.id);
        let ceiling = identity.storage_ceiling;

        let fits = consumed
            .checked_add(reserved)
            .and_then(|total| total.checked_add(bytes))
            .is_some_and(|total| total <= ceiling);
        if !fits {
            tracing::warn!(
                user_id = %identity.id,
                requested = bytes,
                consumed,
                reserved,
                ceiling,
                "Quota reservation rejected"
            );
            return Err(Error::StorageFull {
                user: identity.id,
                requested: bytes,
                consumed: consumed.saturating_add(reserved),
                ceiling,
            });
        }

        self.pending.add(identity.id, bytes);
        Ok(Reservation {
            user: identity.id,
            ceiling,
            bytes,
            pending: Arc::clone(&self.pending),
            settled: false,
        })
    }

    /// Convert a reservation into committed usage of `actual` bytes.
    ///
    /// `actual` may differ from the reserved amount (multipart sizes are only known on
    /// completion); growth beyond the reservation is admitted only if it still fits.
    pub async fn commit(&self, reservation: Reservation, actual: u64) -> Result<QuotaState> {
        let user = reservation.user;
        let ceiling = reservation.ceiling;
        let _guard = self.locks.lock(&user).await;

        if actual > reservation.bytes {
            let consumed = self.db.get_quota(user)?.map(|q| q.consumed).unwrap_or(0);
            let others = self.pending.get(user).saturating_sub(reservation.bytes);
            let fits = consumed
                .checked_add(others)
                .and_then(|total| total.checked_add(actual))
                .is_some_and(|total| total <= ceiling);
            if !fits {
                return Err(Error::StorageFull {
                    user,
                    requested: actual,
                    consumed: consumed.saturating_add(others),
                    ceiling,
                });
            }
        }

        let state = self.db.update_quota(user, ceiling, |q| {
            q.ceiling = ceiling;
            q.consumed = q.consumed.saturating_add(actual);
        })?;
        reservation.settle();

        tracing::info!(
            user_id = %user,
            size_bytes = actual,
            consumed = state.consumed,
            ceiling = state.ceiling,
            "Quota committed"
        );
        Ok(state)
    }

    /// Give back a reservation without committing anything.
    pub fn release(&self, reservation: Reservation) {
        drop(reservation);
    }

    /// Decrement committed usage after a permanent delete or version prune.
    pub async fn release_bytes(&self, user: Uuid, amount: u64) -> Result<QuotaState> {
        let _guard = self.locks.lock(&user).await;
        let state = self.db.update_quota(user, self.default_ceiling, |q| {
            q.consumed = q.consumed.saturating_sub(amount);
        })?;
        tracing::info!(
            user_id = %user,
            size_bytes = amount,
            consumed = state.consumed,
            "Quota released"
        );
        Ok(state)
    }

    pub fn usage(&self, user: Uuid) -> Result<Usage> {
        let state = self.db.get_quota(user)?.unwrap_or(QuotaState {
            ceiling: self.default_ceiling,
            consumed: 0,
        });
        Ok(Usage {
            ceiling: state.ceiling,
            consumed: state.consumed,
            reserved: self.pending.get(user),
        })
    }

    /// Record a new ceiling. Existing usage above it is kept; later reservations fail.
    pub async fn set_ceiling(&self, user: Uuid, ceiling: u64) -> Result<QuotaState> {
        let _guard = self.locks.lock(&user).await;
        Ok(self.db.update_quota(user, ceiling, |q| q.ceiling = ceiling)?)
    }
}
