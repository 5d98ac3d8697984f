use chrono::{DateTime, Utc};
use redb::{ReadableTable, WriteTransaction};
use uuid::Uuid;

use super::db::{finish, get_index, get_record, put_index, put_record, Database, DatabaseError};
use super::models::{FileKind, FileRecord, FileVersion, Include, Lifecycle, NewFile};
use super::tables::*;
use super::{shares, versions};

/// Parent chains longer than this are treated as corrupted.
const MAX_TREE_DEPTH: usize = 4096;

const MAX_NAME_LEN: usize = 255;

/// Why a tree mutation was not applied. The transaction is rolled back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeRejection {
    NotFound(Uuid),
    ParentNotFound(Uuid),
    ParentNotDirectory(Uuid),
    OwnerMismatch,
    NameTaken(String),
    InvalidName(String),
    /// The target parent is the node itself or one of its descendants.
    Cycle,
    NotTombstoned(Uuid),
}

pub type TreeOutcome<T> = Result<T, TreeRejection>;

/// Everything removed by a permanent delete.
#[derive(Debug, Default)]
pub struct PurgedTree {
    pub files: Vec<FileRecord>,
    pub versions: Vec<FileVersion>,
}

impl PurgedTree {
    pub fn stored_bytes(&self) -> u64 {
        self.versions.iter().map(|v| v.byte_size).sum()
    }
}

impl Database {
    // ========================================================================
    // File tree operations
    // ========================================================================

    /// Create a file or directory node under `parent_id` (or at the owner's root)
    pub fn create_file(&self, new: &NewFile) -> Result<TreeOutcome<FileRecord>, DatabaseError> {
        if let Err(rejection) = validate_name(&new.name) {
            return Ok(Err(rejection));
        }
        let write_txn = self.begin_write()?;
        let outcome = create_in(&write_txn, new)?;
        finish(write_txn, outcome)
    }

    /// Get a file by its UUID, tombstoned or not
    pub fn get_file(&self, id: Uuid) -> Result<Option<FileRecord>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(FILES)?;
        get_record(&table, &id.to_string())
    }

    /// Resolve an active child of `parent_id` by name
    pub fn find_child(
        &self,
        owner_id: Uuid,
        parent_id: Option<Uuid>,
        name: &str,
    ) -> Result<Option<FileRecord>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let names = read_txn.open_table(CHILD_NAMES)?;
        let key = name_key(&scope_of(owner_id, parent_id), name);
        let id = match names.get(key.as_str())? {
            Some(data) => data.value().to_string(),
            None => return Ok(None),
        };

        let files = read_txn.open_table(FILES)?;
        get_record(&files, &id)
    }

    /// List the children of `parent_id` (or the owner's roots), sorted by name
    pub fn list_children(
        &self,
        owner_id: Uuid,
        parent_id: Option<Uuid>,
        include: Include,
    ) -> Result<Vec<FileRecord>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let children = read_txn.open_table(CHILDREN)?;
        let files = read_txn.open_table(FILES)?;

        let ids = get_index(&children, &scope_of(owner_id, parent_id))?;
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(file) = get_record::<_, FileRecord>(&files, &id.to_string())? {
                if include.admits(&file.lifecycle) {
                    records.push(file);
                }
            }
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    /// Move a node under a new parent, rejecting cycles and name collisions
    pub fn move_file(
        &self,
        id: Uuid,
        new_parent: Option<Uuid>,
    ) -> Result<TreeOutcome<FileRecord>, DatabaseError> {
        let write_txn = self.begin_write()?;
        let outcome = move_in(&write_txn, id, new_parent)?;
        finish(write_txn, outcome)
    }

    /// Rename a node, rejecting collisions with active siblings
    pub fn rename_file(
        &self,
        id: Uuid,
        new_name: &str,
    ) -> Result<TreeOutcome<FileRecord>, DatabaseError> {
        if let Err(rejection) = validate_name(new_name) {
            return Ok(Err(rejection));
        }
        let write_txn = self.begin_write()?;
        let outcome = rename_in(&write_txn, id, new_name)?;
        finish(write_txn, outcome)
    }

    /// Tombstone a node and its active descendants, deactivating their shares.
    /// Returns the ids that changed state.
    pub fn tombstone_file(&self, id: Uuid) -> Result<TreeOutcome<Vec<Uuid>>, DatabaseError> {
        let write_txn = self.begin_write()?;
        let outcome = tombstone_in(&write_txn, id)?;
        finish(write_txn, outcome)
    }

    /// Bring a tombstoned node back, with the descendants tombstoned alongside it
    pub fn restore_file(&self, id: Uuid) -> Result<TreeOutcome<FileRecord>, DatabaseError> {
        let write_txn = self.begin_write()?;
        let outcome = restore_in(&write_txn, id)?;
        finish(write_txn, outcome)
    }

    /// Permanently remove a node, its descendants, their versions and shares
    pub fn purge_file(&self, id: Uuid) -> Result<TreeOutcome<PurgedTree>, DatabaseError> {
        let write_txn = self.begin_write()?;
        let outcome = purge_in(&write_txn, id)?;
        finish(write_txn, outcome)
    }
}

// ============================================================================
// Transaction bodies
// ============================================================================

fn create_in(txn: &WriteTransaction, new: &NewFile) -> Result<TreeOutcome<FileRecord>, DatabaseError> {
    let parent_path = match new.parent_id {
        Some(parent_id) => match load_file(txn, parent_id)? {
            Some(parent) => {
                if let Err(rejection) = check_parent(&parent, new.owner_id) {
                    return Ok(Err(rejection));
                }
                Some(parent.path)
            }
            None => return Ok(Err(TreeRejection::ParentNotFound(parent_id))),
        },
        None => None,
    };

    let scope = scope_of(new.owner_id, new.parent_id);
    if name_holder(txn, &scope, &new.name)?.is_some() {
        return Ok(Err(TreeRejection::NameTaken(new.name.clone())));
    }

    let now = Utc::now();
    let record = FileRecord {
        id: Uuid::new_v4(),
        owner_id: new.owner_id,
        parent_id: new.parent_id,
        name: new.name.clone(),
        path: child_path(parent_path.as_deref(), &new.name),
        kind: new.kind,
        byte_size: 0,
        mime_type: new.mime_type.clone(),
        content_hash: None,
        visibility: new.visibility,
        share_token: None,
        current_version: 0,
        lifecycle: Lifecycle::Active,
        created_at: now,
        updated_at: now,
    };

    store_file(txn, &record)?;
    add_child(txn, &scope, record.id)?;
    claim_name(txn, &scope, &record.name, record.id)?;
    Ok(Ok(record))
}

fn move_in(
    txn: &WriteTransaction,
    id: Uuid,
    new_parent: Option<Uuid>,
) -> Result<TreeOutcome<FileRecord>, DatabaseError> {
    let mut node = match load_file(txn, id)? {
        Some(node) if node.lifecycle.is_active() => node,
        _ => return Ok(Err(TreeRejection::NotFound(id))),
    };
    if new_parent == Some(id) {
        return Ok(Err(TreeRejection::Cycle));
    }

    let parent_path = match new_parent {
        Some(parent_id) => {
            let parent = match load_file(txn, parent_id)? {
                Some(parent) => parent,
                None => return Ok(Err(TreeRejection::ParentNotFound(parent_id))),
            };
            if let Err(rejection) = check_parent(&parent, node.owner_id) {
                return Ok(Err(rejection));
            }
            if is_ancestor_or_self(txn, id, parent_id)? {
                return Ok(Err(TreeRejection::Cycle));
            }
            Some(parent.path)
        }
        None => None,
    };

    if node.parent_id == new_parent {
        return Ok(Ok(node));
    }

    let old_scope = scope_of(node.owner_id, node.parent_id);
    let new_scope = scope_of(node.owner_id, new_parent);
    if name_holder(txn, &new_scope, &node.name)?.is_some() {
        return Ok(Err(TreeRejection::NameTaken(node.name.clone())));
    }

    release_name(txn, &old_scope, &node.name)?;
    remove_child(txn, &old_scope, id)?;
    add_child(txn, &new_scope, id)?;
    claim_name(txn, &new_scope, &node.name, id)?;

    node.parent_id = new_parent;
    node.path = child_path(parent_path.as_deref(), &node.name);
    node.updated_at = Utc::now();
    store_file(txn, &node)?;
    repath_descendants(txn, &node)?;

    Ok(Ok(node))
}

fn rename_in(
    txn: &WriteTransaction,
    id: Uuid,
    new_name: &str,
) -> Result<TreeOutcome<FileRecord>, DatabaseError> {
    let mut node = match load_file(txn, id)? {
        Some(node) if node.lifecycle.is_active() => node,
        _ => return Ok(Err(TreeRejection::NotFound(id))),
    };
    if node.name == new_name {
        return Ok(Ok(node));
    }

    let scope = scope_of(node.owner_id, node.parent_id);
    if name_holder(txn, &scope, new_name)?.is_some() {
        return Ok(Err(TreeRejection::NameTaken(new_name.to_string())));
    }

    release_name(txn, &scope, &node.name)?;
    claim_name(txn, &scope, new_name, id)?;

    let parent_path = match node.parent_id {
        Some(parent_id) => load_file(txn, parent_id)?.map(|parent| parent.path),
        None => None,
    };
    node.name = new_name.to_string();
    node.path = child_path(parent_path.as_deref(), new_name);
    node.updated_at = Utc::now();
    store_file(txn, &node)?;
    repath_descendants(txn, &node)?;

    Ok(Ok(node))
}

fn tombstone_in(txn: &WriteTransaction, id: Uuid) -> Result<TreeOutcome<Vec<Uuid>>, DatabaseError> {
    let node = match load_file(txn, id)? {
        Some(node) if node.lifecycle.is_active() => node,
        _ => return Ok(Err(TreeRejection::NotFound(id))),
    };

    let at = Utc::now();
    let mut changed = Vec::new();
    for mut file in collect_subtree(txn, node)? {
        if !file.lifecycle.is_active() {
            continue;
        }
        release_name(txn, &scope_of(file.owner_id, file.parent_id), &file.name)?;
        file.lifecycle = Lifecycle::Tombstoned { at };
        file.share_token = None;
        file.updated_at = at;
        store_file(txn, &file)?;
        shares::deactivate_for_file(txn, file.id)?;
        changed.push(file.id);
    }

    Ok(Ok(changed))
}

fn restore_in(txn: &WriteTransaction, id: Uuid) -> Result<TreeOutcome<FileRecord>, DatabaseError> {
    let mut node = match load_file(txn, id)? {
        Some(node) => node,
        None => return Ok(Err(TreeRejection::NotFound(id))),
    };
    let at = match node.lifecycle {
        Lifecycle::Tombstoned { at } => at,
        Lifecycle::Active => return Ok(Err(TreeRejection::NotTombstoned(id))),
    };

    if let Some(parent_id) = node.parent_id {
        match load_file(txn, parent_id)? {
            Some(parent) if parent.lifecycle.is_active() => {}
            _ => return Ok(Err(TreeRejection::ParentNotFound(parent_id))),
        }
    }

    let scope = scope_of(node.owner_id, node.parent_id);
    if name_holder(txn, &scope, &node.name)?.is_some() {
        return Ok(Err(TreeRejection::NameTaken(node.name.clone())));
    }

    claim_name(txn, &scope, &node.name, id)?;
    node.lifecycle = Lifecycle::Active;
    node.updated_at = Utc::now();
    store_file(txn, &node)?;
    restore_descendants(txn, &node, at)?;

    Ok(Ok(node))
}

fn purge_in(txn: &WriteTransaction, id: Uuid) -> Result<TreeOutcome<PurgedTree>, DatabaseError> {
    let node = match load_file(txn, id)? {
        Some(node) => node,
        None => return Ok(Err(TreeRejection::NotFound(id))),
    };

    remove_child(txn, &scope_of(node.owner_id, node.parent_id), id)?;

    let mut purged = PurgedTree::default();
    for file in collect_subtree(txn, node)? {
        let key = file.id.to_string();
        if file.lifecycle.is_active() {
            release_name(txn, &scope_of(file.owner_id, file.parent_id), &file.name)?;
        }
        {
            let mut files = txn.open_table(FILES)?;
            files.remove(key.as_str())?;
        }
        {
            let mut children = txn.open_table(CHILDREN)?;
            children.remove(key.as_str())?;
        }
        purged.versions.extend(versions::remove_all_in(txn, file.id)?);
        shares::remove_for_file(txn, file.id)?;
        purged.files.push(file);
    }

    Ok(Ok(purged))
}

// ============================================================================
// Helpers
// ============================================================================

pub(super) fn load_file(txn: &WriteTransaction, id: Uuid) -> Result<Option<FileRecord>, DatabaseError> {
    let table = txn.open_table(FILES)?;
    get_record(&table, &id.to_string())
}

pub(super) fn store_file(txn: &WriteTransaction, file: &FileRecord) -> Result<(), DatabaseError> {
    let mut table = txn.open_table(FILES)?;
    put_record(&mut table, &file.id.to_string(), file)
}

fn validate_name(name: &str) -> Result<(), TreeRejection> {
    let invalid = name.is_empty()
        || name.len() > MAX_NAME_LEN
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);
    if invalid {
        Err(TreeRejection::InvalidName(name.to_string()))
    } else {
        Ok(())
    }
}

fn check_parent(parent: &FileRecord, owner_id: Uuid) -> Result<(), TreeRejection> {
    if !parent.lifecycle.is_active() {
        return Err(TreeRejection::ParentNotFound(parent.id));
    }
    if parent.kind != FileKind::Directory {
        return Err(TreeRejection::ParentNotDirectory(parent.id));
    }
    if parent.owner_id != owner_id {
        return Err(TreeRejection::OwnerMismatch);
    }
    Ok(())
}

/// Walk from `start` up to the root, looking for `target`.
fn is_ancestor_or_self(txn: &WriteTransaction, target: Uuid, start: Uuid) -> Result<bool, DatabaseError> {
    let mut cursor = Some(start);
    let mut depth = 0;
    while let Some(current) = cursor {
        if current == target {
            return Ok(true);
        }
        depth += 1;
        if depth > MAX_TREE_DEPTH {
            return Err(DatabaseError::Integrity(format!(
                "parent chain of {start} exceeds {MAX_TREE_DEPTH} levels"
            )));
        }
        cursor = match load_file(txn, current)? {
            Some(file) => file.parent_id,
            None => {
                return Err(DatabaseError::Integrity(format!(
                    "ancestor {current} of {start} is missing"
                )))
            }
        };
    }
    Ok(false)
}

/// The node followed by all of its descendants, breadth first.
fn collect_subtree(txn: &WriteTransaction, root: FileRecord) -> Result<Vec<FileRecord>, DatabaseError> {
    let mut nodes = vec![root];
    let mut next = 0;
    while next < nodes.len() {
        if nodes[next].kind == FileKind::Directory {
            let child_ids = {
                let children = txn.open_table(CHILDREN)?;
                get_index(&children, &nodes[next].id.to_string())?
            };
            for child_id in child_ids {
                if let Some(child) = load_file(txn, child_id)? {
                    nodes.push(child);
                }
            }
        }
        next += 1;
    }
    Ok(nodes)
}

fn repath_descendants(txn: &WriteTransaction, dir: &FileRecord) -> Result<(), DatabaseError> {
    if dir.kind != FileKind::Directory {
        return Ok(());
    }
    let mut pending = vec![(dir.id, dir.path.clone())];
    while let Some((parent_id, parent_path)) = pending.pop() {
        let child_ids = {
            let children = txn.open_table(CHILDREN)?;
            get_index(&children, &parent_id.to_string())?
        };
        for child_id in child_ids {
            if let Some(mut child) = load_file(txn, child_id)? {
                child.path = child_path(Some(&parent_path), &child.name);
                store_file(txn, &child)?;
                if child.kind == FileKind::Directory {
                    pending.push((child.id, child.path.clone()));
                }
            }
        }
    }
    Ok(())
}

fn restore_descendants(
    txn: &WriteTransaction,
    dir: &FileRecord,
    at: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    if dir.kind != FileKind::Directory {
        return Ok(());
    }
    let mut pending = vec![dir.id];
    while let Some(parent_id) = pending.pop() {
        let child_ids = {
            let children = txn.open_table(CHILDREN)?;
            get_index(&children, &parent_id.to_string())?
        };
        for child_id in child_ids {
            let Some(mut child) = load_file(txn, child_id)? else {
                continue;
            };
            if child.lifecycle != (Lifecycle::Tombstoned { at }) {
                continue;
            }
            let scope = scope_of(child.owner_id, child.parent_id);
            if name_holder(txn, &scope, &child.name)?.is_some() {
                continue;
            }
            claim_name(txn, &scope, &child.name, child.id)?;
            child.lifecycle = Lifecycle::Active;
            child.updated_at = Utc::now();
            store_file(txn, &child)?;
            if child.kind == FileKind::Directory {
                pending.push(child.id);
            }
        }
    }
    Ok(())
}

fn scope_of(owner_id: Uuid, parent_id: Option<Uuid>) -> String {
    match parent_id {
        Some(parent_id) => parent_id.to_string(),
        None => format!("root:{owner_id}"),
    }
}

fn name_key(scope: &str, name: &str) -> String {
    format!("{scope}/{name}")
}

fn child_path(parent_path: Option<&str>, name: &str) -> String {
    match parent_path {
        Some(parent_path) => format!("{}/{name}", parent_path.trim_end_matches('/')),
        None => format!("/{name}"),
    }
}

fn name_holder(txn: &WriteTransaction, scope: &str, name: &str) -> Result<Option<Uuid>, DatabaseError> {
    let table = txn.open_table(CHILD_NAMES)?;
    let holder = match table.get(name_key(scope, name).as_str())? {
        Some(data) => Some(
            Uuid::parse_str(data.value())
                .map_err(|e| DatabaseError::Integrity(format!("bad name index entry: {e}")))?,
        ),
        None => None,
    };
    Ok(holder)
}

fn claim_name(txn: &WriteTransaction, scope: &str, name: &str, id: Uuid) -> Result<(), DatabaseError> {
    let mut table = txn.open_table(CHILD_NAMES)?;
    let id = id.to_string();
    table.insert(name_key(scope, name).as_str(), id.as_str())?;
    Ok(())
}

fn release_name(txn: &WriteTransaction, scope: &str, name: &str) -> Result<(), DatabaseError> {
    let mut table = txn.open_table(CHILD_NAMES)?;
    table.remove(name_key(scope, name).as_str())?;
    Ok(())
}

fn add_child(txn: &WriteTransaction, scope: &str, id: Uuid) -> Result<(), DatabaseError> {
    let mut table = txn.open_table(CHILDREN)?;
    let mut ids = get_index(&table, scope)?;
    if !ids.contains(&id) {
        ids.push(id);
        put_index(&mut table, scope, &ids)?;
    }
    Ok(())
}

fn remove_child(txn: &WriteTransaction, scope: &str, id: Uuid) -> Result<(), DatabaseError> {
    let mut table = txn.open_table(CHILDREN)?;
    let mut ids = get_index(&table, scope)?;
    ids.retain(|child| *child != id);
    put_index(&mut table, scope, &ids)
}
