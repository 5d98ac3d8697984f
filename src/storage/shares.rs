use chrono::{DateTime, Utc};
use redb::{ReadableTable, WriteTransaction};
use uuid::Uuid;

use super::db::{get_index, get_record, put_index, put_record, Database, DatabaseError};
use super::files::{load_file, store_file};
use super::models::ShareRecord;
use super::tables::*;

/// Result of an atomic download-count increment.
#[derive(Debug)]
pub enum DownloadOutcome {
    Recorded(ShareRecord),
    NotFound,
    Exhausted,
    Expired,
    Revoked,
}

impl Database {
    // ========================================================================
    // Share operations
    // ========================================================================

    /// Store a new share. Returns `false` without writing when the token is already taken.
    pub fn insert_share(&self, share: &ShareRecord) -> Result<bool, DatabaseError> {
        let write_txn = self.begin_write()?;

        let taken = {
            let tokens = write_txn.open_table(SHARE_TOKENS)?;
            let taken = tokens.get(share.token.as_str())?.is_some();
            taken
        };
        if taken {
            write_txn.abort()?;
            return Ok(false);
        }

        let share_key = share.id.to_string();
        let file_key = share.file_id.to_string();
        {
            let mut shares = write_txn.open_table(SHARES)?;
            put_record(&mut shares, &share_key, share)?;

            let mut tokens = write_txn.open_table(SHARE_TOKENS)?;
            tokens.insert(share.token.as_str(), share_key.as_str())?;

            let mut by_file = write_txn.open_table(FILE_SHARES)?;
            let mut ids = get_index(&by_file, &file_key)?;
            ids.push(share.id);
            put_index(&mut by_file, &file_key, &ids)?;
        }

        if let Some(mut file) = load_file(&write_txn, share.file_id)? {
            file.share_token = Some(share.token.clone());
            store_file(&write_txn, &file)?;
        }

        write_txn.commit()?;
        Ok(true)
    }

    /// Get a share by its UUID
    pub fn get_share(&self, id: Uuid) -> Result<Option<ShareRecord>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(SHARES)?;
        get_record(&table, &id.to_string())
    }

    /// Get a share by its token (resolves token -> uuid -> share)
    pub fn get_share_by_token(&self, token: &str) -> Result<Option<ShareRecord>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let tokens = read_txn.open_table(SHARE_TOKENS)?;

        let id = match tokens.get(token)? {
            Some(data) => data.value().to_string(),
            None => return Ok(None),
        };

        let shares = read_txn.open_table(SHARES)?;
        get_record(&shares, &id)
    }

    /// All shares ever issued for a file, revoked ones included
    pub fn list_shares_for_file(&self, file_id: Uuid) -> Result<Vec<ShareRecord>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let by_file = read_txn.open_table(FILE_SHARES)?;
        let shares = read_txn.open_table(SHARES)?;

        let mut records = Vec::new();
        for id in get_index(&by_file, &file_id.to_string())? {
            if let Some(share) = get_record::<_, ShareRecord>(&shares, &id.to_string())? {
                records.push(share);
            }
        }
        Ok(records)
    }

    /// Check a share's terminal conditions and bump its download count in one transaction
    pub fn record_share_download(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<DownloadOutcome, DatabaseError> {
        let write_txn = self.begin_write()?;
        let key = id.to_string();

        let share: Option<ShareRecord> = {
            let table = write_txn.open_table(SHARES)?;
            get_record(&table, &key)?
        };

        let outcome = match share {
            None => DownloadOutcome::NotFound,
            Some(share) if share.is_exhausted() => DownloadOutcome::Exhausted,
            Some(share) if share.is_expired(now) => DownloadOutcome::Expired,
            Some(share) if !share.is_active => DownloadOutcome::Revoked,
            Some(mut share) => {
                share.download_count += 1;
                let mut table = write_txn.open_table(SHARES)?;
                put_record(&mut table, &key, &share)?;
                DownloadOutcome::Recorded(share)
            }
        };

        match outcome {
            DownloadOutcome::Recorded(_) => write_txn.commit()?,
            _ => write_txn.abort()?,
        }
        Ok(outcome)
    }

    /// Mark a share inactive. Returns the updated record, or `None` if it does not exist.
    pub fn deactivate_share(&self, id: Uuid) -> Result<Option<ShareRecord>, DatabaseError> {
        let write_txn = self.begin_write()?;
        let share = deactivate_in(&write_txn, id)?;
        write_txn.commit()?;
        Ok(share)
    }
}

/// Deactivate every share of a file (tombstone path).
pub(super) fn deactivate_for_file(txn: &WriteTransaction, file_id: Uuid) -> Result<(), DatabaseError> {
    let ids = {
        let by_file = txn.open_table(FILE_SHARES)?;
        get_index(&by_file, &file_id.to_string())?
    };
    for id in ids {
        deactivate_in(txn, id)?;
    }
    Ok(())
}

/// Delete every share of a file and its token entries (purge path).
pub(super) fn remove_for_file(txn: &WriteTransaction, file_id: Uuid) -> Result<(), DatabaseError> {
    let file_key = file_id.to_string();
    let ids = {
        let by_file = txn.open_table(FILE_SHARES)?;
        get_index(&by_file, &file_key)?
    };

    let mut shares = txn.open_table(SHARES)?;
    let mut tokens = txn.open_table(SHARE_TOKENS)?;
    for id in ids {
        let key = id.to_string();
        let share: Option<ShareRecord> = get_record(&shares, &key)?;
        if let Some(share) = share {
            tokens.remove(share.token.as_str())?;
            shares.remove(key.as_str())?;
        }
    }

    let mut by_file = txn.open_table(FILE_SHARES)?;
    by_file.remove(file_key.as_str())?;
    Ok(())
}

fn deactivate_in(txn: &WriteTransaction, id: Uuid) -> Result<Option<ShareRecord>, DatabaseError> {
    let key = id.to_string();
    let mut table = txn.open_table(SHARES)?;
    let share: Option<ShareRecord> = get_record(&table, &key)?;
    let Some(mut share) = share else {
        return Ok(None);
    };
    if share.is_active {
        share.is_active = false;
        put_record(&mut table, &key, &share)?;
    }
    drop(table);

    if let Some(mut file) = load_file(txn, share.file_id)? {
        if file.share_token.as_deref() == Some(share.token.as_str()) {
            file.share_token = None;
            store_file(txn, &file)?;
        }
    }
    Ok(Some(share))
}
