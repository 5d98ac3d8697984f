use uuid::Uuid;

use super::db::{get_record, put_record, Database, DatabaseError};
use super::models::QuotaState;
use super::tables::*;

impl Database {
    // ========================================================================
    // Quota operations
    // ========================================================================

    /// Get the stored quota state of a user
    pub fn get_quota(&self, user_id: Uuid) -> Result<Option<QuotaState>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(QUOTAS)?;
        get_record(&table, &user_id.to_string())
    }

    /// Apply `update` to a user's quota state (created with `ceiling` and zero usage when
    /// absent) and store the result
    pub fn update_quota<F>(
        &self,
        user_id: Uuid,
        ceiling: u64,
        update: F,
    ) -> Result<QuotaState, DatabaseError>
    where
        F: FnOnce(&mut QuotaState),
    {
        let write_txn = self.begin_write()?;
        let key = user_id.to_string();
        let state = {
            let mut table = write_txn.open_table(QUOTAS)?;
            let mut state: QuotaState = get_record(&table, &key)?.unwrap_or(QuotaState {
                ceiling,
                consumed: 0,
            });
            update(&mut state);
            put_record(&mut table, &key, &state)?;
            state
        };
        write_txn.commit()?;
        Ok(state)
    }
}
