use redb::{Database as RedbDatabase, ReadTransaction, ReadableTable, Table, WriteTransaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use super::tables::*;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Commit error: {0}")]
    Commit(Box<redb::CommitError>),
    #[error("Database error: {0}")]
    Redb(Box<redb::Error>),
    #[error("Database error: {0}")]
    RedbDatabase(Box<redb::DatabaseError>),
    #[error("Deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),
    #[error("Storage error: {0}")]
    Storage(Box<redb::StorageError>),
    #[error("Table error: {0}")]
    Table(Box<redb::TableError>),
    #[error("Transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("Integrity error: {0}")]
    Integrity(String),
}

impl From<redb::CommitError> for DatabaseError {
    fn from(e: redb::CommitError) -> Self {
        DatabaseError::Commit(Box::new(e))
    }
}

impl From<redb::DatabaseError> for DatabaseError {
    fn from(e: redb::DatabaseError) -> Self {
        DatabaseError::RedbDatabase(Box::new(e))
    }
}

impl From<redb::Error> for DatabaseError {
    fn from(e: redb::Error) -> Self {
        DatabaseError::Redb(Box::new(e))
    }
}

impl From<redb::StorageError> for DatabaseError {
    fn from(e: redb::StorageError) -> Self {
        DatabaseError::Storage(Box::new(e))
    }
}

impl From<redb::TableError> for DatabaseError {
    fn from(e: redb::TableError) -> Self {
        DatabaseError::Table(Box::new(e))
    }
}

impl From<redb::TransactionError> for DatabaseError {
    fn from(e: redb::TransactionError) -> Self {
        DatabaseError::Transaction(Box::new(e))
    }
}

/// Durable store for file, version, share and quota records.
pub struct Database {
    db: Arc<RedbDatabase>,
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Self {
            db: Arc::clone(&self.db),
        }
    }
}

impl Database {
    /// Open or create a database at the given path
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self, DatabaseError> {
        std::fs::create_dir_all(data_dir.as_ref())?;
        let db_path = data_dir.as_ref().join("file-vault.redb");
        let db = Arc::new(RedbDatabase::create(db_path)?);

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(FILES)?;
            let _ = write_txn.open_table(CHILDREN)?;
            let _ = write_txn.open_table(CHILD_NAMES)?;
            let _ = write_txn.open_table(VERSIONS)?;
            let _ = write_txn.open_table(VERSION_COUNTERS)?;
            let _ = write_txn.open_table(SHARES)?;
            let _ = write_txn.open_table(SHARE_TOKENS)?;
            let _ = write_txn.open_table(FILE_SHARES)?;
            let _ = write_txn.open_table(QUOTAS)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }

    /// Begin a read transaction
    pub fn begin_read(&self) -> Result<ReadTransaction, DatabaseError> {
        Ok(self.db.begin_read()?)
    }

    /// Begin a write transaction
    pub fn begin_write(&self) -> Result<WriteTransaction, DatabaseError> {
        Ok(self.db.begin_write()?)
    }
}

// ============================================================================
// Record helpers shared by the per-entity modules
// ============================================================================

/// Decode a msgpack record stored under `key`.
pub(super) fn get_record<T, R>(table: &T, key: &str) -> Result<Option<R>, DatabaseError>
where
    T: ReadableTable<&'static str, &'static [u8]>,
    R: DeserializeOwned,
{
    let record = match table.get(key)? {
        Some(data) => Some(rmp_serde::from_slice(data.value())?),
        None => None,
    };
    Ok(record)
}

/// Encode `record` as msgpack and store it under `key`.
pub(super) fn put_record<R: Serialize>(
    table: &mut Table<'_, &'static str, &'static [u8]>,
    key: &str,
    record: &R,
) -> Result<(), DatabaseError> {
    let data = rmp_serde::to_vec_named(record)?;
    table.insert(key, data.as_slice())?;
    Ok(())
}

/// Load a msgpack id list (index value), empty when absent.
pub(super) fn get_index<T>(table: &T, key: &str) -> Result<Vec<uuid::Uuid>, DatabaseError>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    Ok(get_record(table, key)?.unwrap_or_default())
}

/// Store a msgpack id list, removing the entry when the list is empty.
pub(super) fn put_index(
    table: &mut Table<'_, &'static str, &'static [u8]>,
    key: &str,
    ids: &[uuid::Uuid],
) -> Result<(), DatabaseError> {
    if ids.is_empty() {
        table.remove(key)?;
    } else {
        put_record(table, key, &ids)?;
    }
    Ok(())
}

/// Commit when the outcome was applied, roll back when it was rejected.
pub(super) fn finish<T, E>(
    write_txn: WriteTransaction,
    outcome: Result<T, E>,
) -> Result<Result<T, E>, DatabaseError> {
    match outcome {
        Ok(_) => write_txn.commit()?,
        Err(_) => write_txn.abort()?,
    }
    Ok(outcome)
}
