use std::fmt;

use thiserror::Error;

use crate::config::ConfigError;
use crate::storage::DatabaseError;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The backend operation an I/O error occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Save,
    Get,
    Delete,
    Exists,
    Stat,
    Copy,
    Rename,
    List,
    CreateDir,
    DeleteDir,
    Url,
    CreateMultipart,
    UploadPart,
    CompleteMultipart,
    AbortMultipart,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Save => "save",
            Operation::Get => "get",
            Operation::Delete => "delete",
            Operation::Exists => "exists",
            Operation::Stat => "stat",
            Operation::Copy => "copy",
            Operation::Rename => "rename",
            Operation::List => "list",
            Operation::CreateDir => "create_dir",
            Operation::DeleteDir => "delete_dir",
            Operation::Url => "url",
            Operation::CreateMultipart => "create_multipart",
            Operation::UploadPart => "upload_part",
            Operation::CompleteMultipart => "complete_multipart",
            Operation::AbortMultipart => "abort_multipart",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unsupported storage backend: {0}")]
    UnsupportedBackend(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error(
        "Storage full for user {user}: {consumed} used + {requested} requested exceeds ceiling of {ceiling} bytes"
    )]
    StorageFull {
        user: uuid::Uuid,
        requested: u64,
        consumed: u64,
        ceiling: u64,
    },

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("Upload failed ({op} {key}): {source}")]
    UploadFailed {
        op: Operation,
        key: String,
        #[source]
        source: BoxError,
    },

    #[error("Download failed ({op} {key}): {source}")]
    DownloadFailed {
        op: Operation,
        key: String,
        #[source]
        source: BoxError,
    },

    #[error("Delete failed ({op} {key}): {source}")]
    DeleteFailed {
        op: Operation,
        key: String,
        #[source]
        source: BoxError,
    },

    #[error("Content at {key} is corrupted: expected hash {expected}, backend reports {actual}")]
    Corruption {
        key: String,
        expected: String,
        actual: String,
    },

    #[error("Share has expired")]
    ShareExpired,

    #[error("Share download limit reached")]
    ShareExhausted,

    #[error("Share has been revoked")]
    ShareRevoked,

    #[error("Share password does not match")]
    ShareForbidden,

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Operation cancelled ({op} {key})")]
    Cancelled { op: Operation, key: String },

    #[error("Deadline exceeded ({op} {key})")]
    TimedOut { op: Operation, key: String },

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    /// Wrap a backend failure, classified by the operation it happened in.
    pub fn backend(op: Operation, key: impl Into<String>, source: impl Into<BoxError>) -> Self {
        let key = key.into();
        let source = source.into();
        match op {
            Operation::Get | Operation::Exists | Operation::Stat | Operation::List | Operation::Url => {
                Error::DownloadFailed { op, key, source }
            }
            Operation::Delete | Operation::DeleteDir | Operation::AbortMultipart => {
                Error::DeleteFailed { op, key, source }
            }
            Operation::Save
            | Operation::Copy
            | Operation::Rename
            | Operation::CreateDir
            | Operation::CreateMultipart
            | Operation::UploadPart
            | Operation::CompleteMultipart => Error::UploadFailed { op, key, source },
        }
    }

    /// An upload rejected by protocol validation rather than by the backend.
    pub fn upload_rejected(op: Operation, key: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::UploadFailed {
            op,
            key: key.into(),
            source: reason.into().into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled { .. } | Error::TimedOut { .. })
    }
}
