//! SQLite schema DDL for an entity store.
//!
//! The same schema backs both the master store and the feature store.

use rusqlite::{params, Connection, OptionalExtension};

use crate::errors::{GraphError, GraphResult};

/// Schema version written to `store_meta`.  A store reporting a newer
/// version was written by a newer build and is refused.
pub const SCHEMA_VERSION: i32 = 1;

/// Core DDL statements: 8 CREATE TABLE + 8 CREATE INDEX.
///
/// Executed with `CREATE … IF NOT EXISTS` so they are safe to replay on an
/// already-initialised database.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    // ── tables (8) ──────────────────────────────────────────────────────
    "CREATE TABLE IF NOT EXISTS store_meta (
        key TEXT PRIMARY KEY,
        value TEXT
    );",
    "CREATE TABLE IF NOT EXISTS commit_snapshots (
        commit_hash TEXT PRIMARY KEY,
        sequence_position INTEGER NOT NULL UNIQUE,
        is_synthetic INTEGER NOT NULL DEFAULT 0,
        indexed_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
    );",
    "CREATE TABLE IF NOT EXISTS documents (
        path TEXT PRIMARY KEY,
        module TEXT NOT NULL,
        target_type TEXT NOT NULL DEFAULT 'unknown',
        content_hash TEXT,
        entity_keys TEXT NOT NULL DEFAULT '[]',
        deleted INTEGER NOT NULL DEFAULT 0,
        last_commit_hash TEXT NOT NULL,
        updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
    );",
    "CREATE TABLE IF NOT EXISTS document_versions (
        path TEXT NOT NULL,
        commit_hash TEXT NOT NULL
            REFERENCES commit_snapshots(commit_hash) ON DELETE CASCADE,
        sequence_position INTEGER NOT NULL,
        module TEXT NOT NULL,
        target_type TEXT NOT NULL DEFAULT 'unknown',
        content_hash TEXT,
        entity_keys TEXT NOT NULL DEFAULT '[]',
        deleted INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY(path, commit_hash)
    );",
    "CREATE TABLE IF NOT EXISTS entities (
        identity_key TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        qualified_name TEXT NOT NULL,
        kind TEXT NOT NULL,
        declaring_path TEXT NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS entity_versions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        entity_identity_key TEXT NOT NULL REFERENCES entities(identity_key),
        commit_hash TEXT NOT NULL
            REFERENCES commit_snapshots(commit_hash) ON DELETE CASCADE,
        sequence_position INTEGER NOT NULL,
        properties TEXT NOT NULL,
        tombstoned INTEGER NOT NULL DEFAULT 0,
        UNIQUE(entity_identity_key, commit_hash)
    );",
    "CREATE TABLE IF NOT EXISTS members (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        owning_entity_identity_key TEXT NOT NULL REFERENCES entities(identity_key),
        commit_hash TEXT NOT NULL
            REFERENCES commit_snapshots(commit_hash) ON DELETE CASCADE,
        name TEXT NOT NULL,
        kind TEXT NOT NULL,
        signature TEXT,
        visibility TEXT,
        start_line INTEGER,
        is_static INTEGER NOT NULL DEFAULT 0
    );",
    "CREATE TABLE IF NOT EXISTS index_state (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        last_commit_hash TEXT,
        last_sequence_position INTEGER NOT NULL DEFAULT 0,
        last_indexed_at TEXT,
        tracked_branch TEXT,
        indexed_files TEXT NOT NULL DEFAULT '[]'
    );",
    // ── indexes (8) ─────────────────────────────────────────────────────
    "CREATE INDEX IF NOT EXISTS idx_versions_key_seq ON entity_versions(entity_identity_key, sequence_position DESC);",
    "CREATE INDEX IF NOT EXISTS idx_versions_commit ON entity_versions(commit_hash);",
    "CREATE INDEX IF NOT EXISTS idx_members_owner_commit ON members(owning_entity_identity_key, commit_hash);",
    "CREATE INDEX IF NOT EXISTS idx_members_commit ON members(commit_hash);",
    "CREATE INDEX IF NOT EXISTS idx_members_name ON members(name);",
    "CREATE INDEX IF NOT EXISTS idx_entities_name ON entities(name);",
    "CREATE INDEX IF NOT EXISTS idx_entities_path ON entities(declaring_path);",
    "CREATE INDEX IF NOT EXISTS idx_document_versions_commit ON document_versions(commit_hash);",
];

/// Tables wiped by a store reset, children first.
pub const DATA_TABLES: &[&str] = &[
    "members",
    "entity_versions",
    "document_versions",
    "documents",
    "entities",
    "commit_snapshots",
    "index_state",
];

/// Create every table and index and stamp the schema version.  Safe to
/// replay on an initialised store of the same version.
pub fn init_schema(conn: &Connection) -> GraphResult<()> {
    if let Some(version) = schema_version(conn)? {
        if version > SCHEMA_VERSION {
            return Err(GraphError::Config(format!(
                "store schema version {version} is newer than supported version {SCHEMA_VERSION}"
            )));
        }
    }
    for stmt in SCHEMA_STATEMENTS {
        conn.execute_batch(stmt)?;
    }
    conn.execute(
        "INSERT INTO store_meta(key, value) VALUES ('schema_version', ?1) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
        params![SCHEMA_VERSION.to_string()],
    )?;
    Ok(())
}

/// Version recorded in `store_meta`; `None` for a fresh database.
pub fn schema_version(conn: &Connection) -> GraphResult<Option<i32>> {
    let has_meta: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'store_meta');",
        [],
        |row| row.get(0),
    )?;
    if !has_meta {
        return Ok(None);
    }
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM store_meta WHERE key = 'schema_version';",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value.and_then(|v| v.parse().ok()))
}
