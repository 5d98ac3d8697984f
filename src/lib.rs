//! file-vault - storage coordination core for multi-user file storage
//!
//! This crate sits between a file service and the blob store it writes to:
//! - Swappable blob backends (local filesystem, S3, MinIO) behind one contract
//! - Path-safe key naming per user, file and version
//! - Multipart upload sessions with reclamation of stale ones
//! - Gapless per-file version history with integrity-checked reads
//! - Per-user quota reservations that cannot be oversubscribed
//! - Share links with expiry, download limits, passwords and revocation
//! - redb embedded database for the durable records (ACID, crash-safe)

pub mod config;
pub mod context;
pub mod error;
pub mod keys;
pub mod locks;
pub mod multipart;
pub mod object_store;
pub mod quota;
pub mod shares;
pub mod storage;
pub mod tree;
pub mod vault;
pub mod versions;

pub use context::OpContext;
pub use error::{Error, Result};
pub use quota::Identity;
pub use vault::Vault;
