use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Directory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    #[default]
    Private,
}

/// Soft-delete state of a file. Tombstoned records stay for history and restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Lifecycle {
    Active,
    Tombstoned { at: DateTime<Utc> },
}

impl Lifecycle {
    pub fn is_active(&self) -> bool {
        matches!(self, Lifecycle::Active)
    }
}

/// Whether a query should see tombstoned records. Every listing takes one explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Include {
    ActiveOnly,
    WithTombstoned,
}

impl Include {
    pub fn admits(self, lifecycle: &Lifecycle) -> bool {
        match self {
            Include::ActiveOnly => lifecycle.is_active(),
            Include::WithTombstoned => true,
        }
    }
}

/// A node of a user's file tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: Uuid,
    pub owner_id: Uuid,
    /// `None` for a root-level node
    pub parent_id: Option<Uuid>,
    pub name: String,
    /// Logical path from the owner's root, e.g. `/docs/report.pdf`
    pub path: String,
    pub kind: FileKind,
    pub byte_size: u64,
    pub mime_type: Option<String>,
    pub content_hash: Option<String>,
    pub visibility: Visibility,
    pub share_token: Option<String>,
    /// 0 until the first version is recorded
    pub current_version: u64,
    pub lifecycle: Lifecycle,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a tree node.
#[derive(Debug, Clone)]
pub struct NewFile {
    pub owner_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub name: String,
    pub kind: FileKind,
    pub mime_type: Option<String>,
    pub visibility: Visibility,
}

impl NewFile {
    pub fn file(owner_id: Uuid, parent_id: Option<Uuid>, name: impl Into<String>) -> Self {
        Self {
            owner_id,
            parent_id,
            name: name.into(),
            kind: FileKind::File,
            mime_type: None,
            visibility: Visibility::Private,
        }
    }

    pub fn directory(owner_id: Uuid, parent_id: Option<Uuid>, name: impl Into<String>) -> Self {
        Self {
            kind: FileKind::Directory,
            ..Self::file(owner_id, parent_id, name)
        }
    }
}

/// An immutable stored revision of a file's content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileVersion {
    pub id: Uuid,
    pub file_id: Uuid,
    pub version_number: u64,
    pub byte_size: u64,
    /// Integrity tag reported by the backend for `storage_key`
    pub content_hash: String,
    pub storage_key: String,
    pub mime_type: Option<String>,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    View,
    Download,
    Edit,
}

/// A share link granting a capability on one file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareRecord {
    pub id: Uuid,
    pub file_id: Uuid,
    pub created_by: Uuid,
    pub token: String,
    pub password_hash: Option<String>,
    pub capability: Capability,
    pub expires_at: Option<DateTime<Utc>>,
    pub max_downloads: Option<u64>,
    pub download_count: u64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl ShareRecord {
    pub fn is_exhausted(&self) -> bool {
        self.max_downloads
            .is_some_and(|max| self.download_count >= max)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }
}

/// Durable per-user storage accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaState {
    pub ceiling: u64,
    pub consumed: u64,
}
