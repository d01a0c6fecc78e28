//! SQLite schema shared by the cache generations and the vault.

pub const SCHEMA: &str = r#"
-- Named cache generations, e.g. "precache-v1" (rowid gives creation order)
CREATE TABLE IF NOT EXISTS cache_generations (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Response snapshots, keyed by normalized request within a generation
CREATE TABLE IF NOT EXISTS cache_entries (
    generation TEXT NOT NULL,
    request_key TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (generation, request_key),
    FOREIGN KEY (generation) REFERENCES cache_generations(name) ON DELETE CASCADE
);

-- Single-row state: the cache version whose generations serve clients
CREATE TABLE IF NOT EXISTS cache_state (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    active_version TEXT NOT NULL,
    activated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Encrypted vault records; ids are assigned by SQLite and never reused
CREATE TABLE IF NOT EXISTS vault_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    salt BLOB NOT NULL,
    nonce BLOB NOT NULL,
    ciphertext BLOB NOT NULL,
    created_at INTEGER NOT NULL
);
"#;
