/// Schema for all worker tables.
pub const SCHEMA: &str = r#"
-- Named resource caches (one row per cached request per cache version)
CREATE TABLE IF NOT EXISTS resource_cache (
    cache_name TEXT NOT NULL,
    request_key TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (cache_name, request_key)
);

CREATE INDEX IF NOT EXISTS idx_resource_cache_key
    ON resource_cache(request_key);

-- Complaints submitted while offline, waiting to be re-submitted
CREATE TABLE IF NOT EXISTS offline_complaints (
    id TEXT PRIMARY KEY,
    data BLOB NOT NULL,
    queued_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Pending background sync registrations
CREATE TABLE IF NOT EXISTS sync_registrations (
    tag TEXT PRIMARY KEY,
    attempts INTEGER NOT NULL DEFAULT 0,
    next_attempt_at TEXT,
    registered_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;
