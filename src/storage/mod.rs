pub mod db;
mod files;
pub mod models;
mod quotas;
mod shares;
mod tables;
mod versions;

pub use db::{Database, DatabaseError};
pub use files::{PurgedTree, TreeOutcome, TreeRejection};
pub use shares::DownloadOutcome;
pub use tables::*;
