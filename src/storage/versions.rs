use chrono::Utc;
use redb::{ReadableTable, WriteTransaction};
use uuid::Uuid;

use super::db::{get_record, put_record, Database, DatabaseError};
use super::files::{load_file, store_file};
use super::models::{FileRecord, FileVersion};
use super::tables::*;

impl Database {
    // ========================================================================
    // Version operations
    // ========================================================================

    /// The number the next recorded version of `file_id` must carry
    pub fn next_version_number(&self, file_id: Uuid) -> Result<u64, DatabaseError> {
        let read_txn = self.begin_read()?;
        let counters = read_txn.open_table(VERSION_COUNTERS)?;
        let last = counters
            .get(file_id.to_string().as_str())?
            .map(|v| v.value())
            .unwrap_or(0);
        Ok(last + 1)
    }

    /// Insert a version row and advance the file's counter in one transaction.
    ///
    /// Fails with an integrity error unless `version.version_number` is exactly one past
    /// the last assigned number, so `(file_id, version_number)` stays unique and gapless.
    /// When the file record exists its current-version pointer moves to the new row.
    pub fn insert_version(&self, version: &FileVersion) -> Result<Option<FileRecord>, DatabaseError> {
        let write_txn = self.begin_write()?;
        let file_key = version.file_id.to_string();

        let last = {
            let counters = write_txn.open_table(VERSION_COUNTERS)?;
            let last = counters.get(file_key.as_str())?.map(|v| v.value()).unwrap_or(0);
            last
        };
        if version.version_number != last + 1 {
            return Err(DatabaseError::Integrity(format!(
                "version {} of {} is out of sequence (last assigned {last})",
                version.version_number, version.file_id
            )));
        }

        {
            let mut counters = write_txn.open_table(VERSION_COUNTERS)?;
            counters.insert(file_key.as_str(), version.version_number)?;

            let mut table = write_txn.open_table(VERSIONS)?;
            put_record(
                &mut table,
                &row_key(version.file_id, version.version_number),
                version,
            )?;
        }

        let file = point_file_at(&write_txn, version)?;
        write_txn.commit()?;
        Ok(file)
    }

    /// Get one version of a file
    pub fn get_version(
        &self,
        file_id: Uuid,
        version_number: u64,
    ) -> Result<Option<FileVersion>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(VERSIONS)?;
        get_record(&table, &row_key(file_id, version_number))
    }

    /// All retained versions of a file, oldest first
    pub fn list_versions(&self, file_id: Uuid) -> Result<Vec<FileVersion>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(VERSIONS)?;
        let (start, end) = file_range(file_id);

        let mut versions = Vec::new();
        for result in table.range(start.as_str()..end.as_str())? {
            let (_, value) = result?;
            let version: FileVersion = rmp_serde::from_slice(value.value())?;
            versions.push(version);
        }
        Ok(versions)
    }

    /// Point the file's current version at an existing row. Metadata only.
    ///
    /// Returns `None` when either the file or the version does not exist.
    pub fn set_current_version(
        &self,
        file_id: Uuid,
        version_number: u64,
    ) -> Result<Option<FileRecord>, DatabaseError> {
        let write_txn = self.begin_write()?;

        let version: Option<FileVersion> = {
            let table = write_txn.open_table(VERSIONS)?;
            get_record(&table, &row_key(file_id, version_number))?
        };

        let updated = match version {
            Some(version) => point_file_at(&write_txn, &version)?,
            None => None,
        };

        match updated {
            Some(_) => write_txn.commit()?,
            None => write_txn.abort()?,
        }
        Ok(updated)
    }

    /// Remove the given version rows. The counter is untouched so numbers are never reused.
    pub fn remove_versions(
        &self,
        file_id: Uuid,
        version_numbers: &[u64],
    ) -> Result<Vec<FileVersion>, DatabaseError> {
        let write_txn = self.begin_write()?;
        let mut removed = Vec::new();
        {
            let mut table = write_txn.open_table(VERSIONS)?;
            for &number in version_numbers {
                let key = row_key(file_id, number);
                let version: Option<FileVersion> = get_record(&table, &key)?;
                if let Some(version) = version {
                    table.remove(key.as_str())?;
                    removed.push(version);
                }
            }
        }
        write_txn.commit()?;
        Ok(removed)
    }
}

/// Remove every version row and the counter of a file inside a purge.
pub(super) fn remove_all_in(
    txn: &WriteTransaction,
    file_id: Uuid,
) -> Result<Vec<FileVersion>, DatabaseError> {
    let (start, end) = file_range(file_id);
    let mut table = txn.open_table(VERSIONS)?;

    let mut removed = Vec::new();
    for result in table.range(start.as_str()..end.as_str())? {
        let (_, value) = result?;
        let version: FileVersion = rmp_serde::from_slice(value.value())?;
        removed.push(version);
    }
    for version in &removed {
        table.remove(row_key(file_id, version.version_number).as_str())?;
    }

    let mut counters = txn.open_table(VERSION_COUNTERS)?;
    counters.remove(file_id.to_string().as_str())?;
    Ok(removed)
}

fn point_file_at(
    txn: &WriteTransaction,
    version: &FileVersion,
) -> Result<Option<FileRecord>, DatabaseError> {
    let Some(mut file) = load_file(txn, version.file_id)? else {
        return Ok(None);
    };
    file.current_version = version.version_number;
    file.byte_size = version.byte_size;
    file.content_hash = Some(version.content_hash.clone());
    if version.mime_type.is_some() {
        file.mime_type = version.mime_type.clone();
    }
    file.updated_at = Utc::now();
    store_file(txn, &file)?;
    Ok(Some(file))
}

fn row_key(file_id: Uuid, version_number: u64) -> String {
    format!("{file_id}/{version_number:020}")
}

/// Key range covering every row of one file (`'0'` sorts right after `'/'`).
fn file_range(file_id: Uuid) -> (String, String) {
    (format!("{file_id}/"), format!("{file_id}0"))
}
