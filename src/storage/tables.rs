use redb::TableDefinition;

/// File records: uuid -> FileRecord (msgpack)
pub const FILES: TableDefinition<&str, &[u8]> = TableDefinition::new("files");

/// Children index: scope (parent uuid or `root:{owner}`) -> msgpack Vec of child UUIDs,
/// tombstoned children included
pub const CHILDREN: TableDefinition<&str, &[u8]> = TableDefinition::new("children");

/// Active name index: `{scope}/{name}` -> uuid
pub const CHILD_NAMES: TableDefinition<&str, &str> = TableDefinition::new("child_names");

/// Versions: `{file_uuid}/{version:020}` -> FileVersion (msgpack)
pub const VERSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("versions");

/// Highest version number ever assigned per file: uuid -> number
pub const VERSION_COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("version_counters");

/// Share records: uuid -> ShareRecord (msgpack)
pub const SHARES: TableDefinition<&str, &[u8]> = TableDefinition::new("shares");

/// Token index: token -> share uuid
pub const SHARE_TOKENS: TableDefinition<&str, &str> = TableDefinition::new("share_tokens");

/// File index: file uuid -> msgpack Vec of share UUIDs
pub const FILE_SHARES: TableDefinition<&str, &[u8]> = TableDefinition::new("file_shares");

/// Quota state: user uuid -> QuotaState (msgpack)
pub const QUOTAS: TableDefinition<&str, &[u8]> = TableDefinition::new("quotas");
