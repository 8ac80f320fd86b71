/// Schema for the local database shared by the cache backend and local storage.
pub const SCHEMA: &str = r#"
-- Cache entries (serialized JSON values with per-entry TTL)
CREATE TABLE IF NOT EXISTS cache_entries (
    cache_key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    stored_at_ms INTEGER NOT NULL,
    ttl_ms INTEGER NOT NULL
);

-- Key/value local storage (offline queue lives under a single key)
CREATE TABLE IF NOT EXISTS local_storage (
    item_key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;
