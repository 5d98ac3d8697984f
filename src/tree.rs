//! Hierarchical namespace rules over the durable file records.
//!
//! Active siblings have unique names and the parent relation never forms a cycle. The
//! checks run inside the same database transaction as the mutation they guard.

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::storage::models::{FileRecord, Include, NewFile};
use crate::storage::{Database, PurgedTree, TreeRejection};

impl From<TreeRejection> for Error {
    fn from(rejection: TreeRejection) -> Self {
        match rejection {
            TreeRejection::NotFound(id) => Error::NotFound(format!("file {id}")),
            TreeRejection::ParentNotFound(id) => Error::NotFound(format!("parent directory {id}")),
            TreeRejection::ParentNotDirectory(id) => {
                Error::InvalidOperation(format!("{id} is not a directory"))
            }
            TreeRejection::OwnerMismatch => {
                Error::PermissionDenied("parent belongs to another user".to_string())
            }
            TreeRejection::NameTaken(name) => {
                Error::InvalidOperation(format!("'{name}' already exists in this directory"))
            }
            TreeRejection::InvalidName(name) => {
                Error::InvalidOperation(format!("'{name}' is not a valid name"))
            }
            TreeRejection::Cycle => Error::InvalidOperation(
                "cannot move a directory into itself or one of its descendants".to_string(),
            ),
            TreeRejection::NotTombstoned(id) => {
                Error::InvalidOperation(format!("file {id} is not deleted"))
            }
        }
    }
}

pub struct FileTree {
    db: Database,
}

impl FileTree {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn create(&self, new: &NewFile) -> Result<FileRecord> {
        let file = self.db.create_file(new)??;
        tracing::info!(
            file_id = %file.id,
            user_id = %file.owner_id,
            path = %file.path,
            "File created"
        );
        Ok(file)
    }

    /// Fetch a node regardless of lifecycle
    pub fn get(&self, id: Uuid) -> Result<FileRecord> {
        self.db
            .get_file(id)?
            .ok_or_else(|| Error::NotFound(format!("file {id}")))
    }

    pub fn find_child(&self, owner_id: Uuid, parent_id: Option<Uuid>, name: &str) -> Result<Option<FileRecord>> {
        Ok(self.db.find_child(owner_id, parent_id, name)?)
    }

    pub fn children(
        &self,
        owner_id: Uuid,
        parent_id: Option<Uuid>,
        include: Include,
    ) -> Result<Vec<FileRecord>> {
        Ok(self.db.list_children(owner_id, parent_id, include)?)
    }

    /// Move `id` under `new_parent` (`None` for the owner's root). Fails with
    /// [`Error::InvalidOperation`] when the target is the node or one of its descendants.
    pub fn move_node(&self, id: Uuid, new_parent: Option<Uuid>) -> Result<FileRecord> {
        let file = self.db.move_file(id, new_parent)??;
        tracing::info!(file_id = %id, path = %file.path, "File moved");
        Ok(file)
    }

    pub fn rename(&self, id: Uuid, name: &str) -> Result<FileRecord> {
        let file = self.db.rename_file(id, name)??;
        tracing::info!(file_id = %id, path = %file.path, "File renamed");
        Ok(file)
    }

    /// Soft-delete a node and its subtree; their shares are revoked in the same transaction.
    pub fn tombstone(&self, id: Uuid) -> Result<Vec<Uuid>> {
        let changed = self.db.tombstone_file(id)??;
        tracing::info!(file_id = %id, affected = changed.len(), "File tombstoned");
        Ok(changed)
    }

    /// Undo a tombstone. The name must still be free among active siblings.
    pub fn restore(&self, id: Uuid) -> Result<FileRecord> {
        let file = self.db.restore_file(id)??;
        tracing::info!(file_id = %id, path = %file.path, "File restored");
        Ok(file)
    }

    /// Remove a node, its subtree, their versions and shares for good. The caller deletes
    /// the returned versions' blobs and releases their bytes.
    pub fn purge(&self, id: Uuid) -> Result<PurgedTree> {
        let purged = self.db.purge_file(id)??;
        tracing::info!(
            file_id = %id,
            files = purged.files.len(),
            versions = purged.versions.len(),
            size_bytes = purged.stored_bytes(),
            "File purged"
        );
        Ok(purged)
    }
}
