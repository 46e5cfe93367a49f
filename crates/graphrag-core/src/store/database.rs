//! Writable entity store over one SQLite file.
//!
//! Every public method opens its own connection, so the caller never has to
//! manage connection lifetime.  Writes are serialised through a process-local
//! lock and always run inside a single `BEGIN IMMEDIATE` transaction; readers
//! on other connections see either the pre- or post-commit state (WAL).

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, info};

use crate::errors::{GraphError, GraphResult};
use crate::models::{
    CommitBatch, CommitReceipt, CommitSnapshot, CurrentEntity, EntityProperties,
    EntityVersionRecord, FileFacts, IndexState, QueryFilter, StoreStats,
};
use crate::store::reader::{self, StoreReader};
use crate::store::schema;

pub(crate) const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const NOW_SQL: &str = "strftime('%Y-%m-%dT%H:%M:%fZ', 'now')";

/// Document row as kept in `documents` and `document_versions`.
#[derive(Clone, Debug, PartialEq, Eq)]
struct DocumentRow {
    module: String,
    target_type: String,
    content_hash: Option<String>,
    entity_keys: Vec<String>,
    deleted: bool,
}

// ---------------------------------------------------------------------------
// EntityStore
// ---------------------------------------------------------------------------

/// Versioned entity store.  One instance per physical database file; the
/// indexer that owns the instance is its only writer.
pub struct EntityStore {
    db_path: PathBuf,
    write_lock: Mutex<()>,
}

impl EntityStore {
    /// Open (creating if needed) the store at `db_path` and bring its schema
    /// up to date.  Parent directories are created.
    pub fn open(db_path: impl AsRef<Path>) -> GraphResult<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let store = Self {
            db_path,
            write_lock: Mutex::new(()),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// A read-only handle for query consumers.
    pub fn reader(&self) -> StoreReader {
        StoreReader::new(&self.db_path)
    }

    fn connect(&self) -> GraphResult<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(conn)
    }

    fn init_schema(&self) -> GraphResult<()> {
        let _guard = self.write_lock.lock();
        let conn = self.connect()?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        schema::init_schema(&conn)
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Apply one commit-tagged batch atomically.
    ///
    /// Re-applying a hash that is already recorded replaces its rows inside
    /// the same transaction.  A constraint or value failure while writing one
    /// file's rows rolls everything back and is reported as
    /// [`GraphError::RowWrite`] so the caller can drop that file and retry.
    /// Any other failure is returned unchanged.
    pub fn apply_commit(&self, batch: &CommitBatch) -> GraphResult<CommitReceipt> {
        let _guard = self.write_lock.lock();
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let replaced = snapshot_position(&tx, &batch.commit_hash)?.is_some();
        if replaced {
            purge_commit(&tx, &batch.commit_hash)?;
        }

        let sequence_position: i64 = tx.query_row(
            "SELECT COALESCE(MAX(sequence_position), 0) + 1 FROM commit_snapshots;",
            [],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO commit_snapshots(commit_hash, sequence_position, is_synthetic) \
             VALUES (?1, ?2, ?3);",
            params![batch.commit_hash, sequence_position, batch.is_synthetic],
        )?;

        let mut receipt = CommitReceipt {
            commit_hash: batch.commit_hash.clone(),
            sequence_position,
            ..Default::default()
        };

        for file in &batch.files {
            write_file(&tx, batch, sequence_position, file, &mut receipt)
                .map_err(|e| row_error(&file.path, e))?;
        }
        for path in &batch.deleted {
            tombstone_file(&tx, &batch.commit_hash, sequence_position, path, &mut receipt)
                .map_err(|e| row_error(path, e))?;
        }

        let touched = serde_json::to_string(&batch.touched)?;
        tx.execute(
            &format!(
                "INSERT INTO index_state(id, last_commit_hash, last_sequence_position, \
                     last_indexed_at, indexed_files) \
                 VALUES (1, ?1, ?2, {NOW_SQL}, ?3) \
                 ON CONFLICT(id) DO UPDATE SET \
                     last_commit_hash = excluded.last_commit_hash, \
                     last_sequence_position = excluded.last_sequence_position, \
                     last_indexed_at = excluded.last_indexed_at, \
                     indexed_files = excluded.indexed_files;"
            ),
            params![batch.commit_hash, sequence_position, touched],
        )?;

        tx.commit()?;
        info!(
            commit = %batch.commit_hash,
            sequence = sequence_position,
            replaced,
            files = receipt.files_written,
            unchanged = receipt.files_unchanged,
            versions = receipt.versions_written,
            tombstones = receipt.tombstones_written,
            "applied commit"
        );
        Ok(receipt)
    }

    /// Remove one snapshot and every row tagged with it.  Documents and the
    /// index state fall back to the latest remaining snapshot.  Returns false
    /// when the hash was not recorded.
    pub fn discard_commit(&self, commit_hash: &str) -> GraphResult<bool> {
        let _guard = self.write_lock.lock();
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if snapshot_position(&tx, commit_hash)?.is_none() {
            return Ok(false);
        }
        purge_commit(&tx, commit_hash)?;

        let latest: Option<(String, i64)> = tx
            .query_row(
                "SELECT commit_hash, sequence_position FROM commit_snapshots \
                 ORDER BY sequence_position DESC LIMIT 1;",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (hash, position) = match latest {
            Some((hash, position)) => (Some(hash), position),
            None => (None, 0),
        };
        tx.execute(
            &format!(
                "INSERT INTO index_state(id, last_commit_hash, last_sequence_position, last_indexed_at) \
                 VALUES (1, ?1, ?2, {NOW_SQL}) \
                 ON CONFLICT(id) DO UPDATE SET \
                     last_commit_hash = excluded.last_commit_hash, \
                     last_sequence_position = excluded.last_sequence_position, \
                     last_indexed_at = excluded.last_indexed_at;"
            ),
            params![hash, position],
        )?;
        tx.commit()?;
        info!(commit = %commit_hash, "discarded commit snapshot");
        Ok(true)
    }

    /// Atomically drop every row, including snapshots and the index state.
    pub fn reset(&self) -> GraphResult<()> {
        let _guard = self.write_lock.lock();
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        for table in schema::DATA_TABLES {
            tx.execute(&format!("DELETE FROM {table};"), [])?;
        }
        tx.commit()?;
        info!(db = %self.db_path.display(), "store reset");
        Ok(())
    }

    /// Record the branch this store mirrors.
    pub fn track_branch(&self, branch: &str) -> GraphResult<()> {
        let _guard = self.write_lock.lock();
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO index_state(id, tracked_branch) VALUES (1, ?1) \
             ON CONFLICT(id) DO UPDATE SET tracked_branch = excluded.tracked_branch;",
            params![branch],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reads (same connection discipline as the writer)
    // -----------------------------------------------------------------------

    pub fn index_state(&self) -> GraphResult<IndexState> {
        reader::load_index_state(&self.connect()?)
    }

    pub fn commit_snapshots(&self) -> GraphResult<Vec<CommitSnapshot>> {
        reader::load_commit_snapshots(&self.connect()?)
    }

    pub fn live_document_paths(&self) -> GraphResult<Vec<String>> {
        reader::load_document_paths(&self.connect()?, false)
    }

    pub fn stats(&self) -> GraphResult<StoreStats> {
        reader::load_stats(&self.connect()?)
    }

    pub fn query_current(&self, filter: &QueryFilter) -> GraphResult<Vec<CurrentEntity>> {
        self.reader().query_current(filter)
    }

    pub fn entity_history(&self, identity_key: &str) -> GraphResult<Vec<EntityVersionRecord>> {
        reader::load_entity_history(&self.connect()?, identity_key)
    }
}

// ---------------------------------------------------------------------------
// Transaction helpers
// ---------------------------------------------------------------------------

/// Attribute a recoverable failure to `path`; fatal ones pass through.
fn row_error(path: &str, err: GraphError) -> GraphError {
    if err.is_fatal() {
        err
    } else {
        GraphError::RowWrite {
            path: path.to_string(),
            source: Box::new(err),
        }
    }
}

fn snapshot_position(conn: &Connection, commit_hash: &str) -> GraphResult<Option<i64>> {
    Ok(conn
        .query_row(
            "SELECT sequence_position FROM commit_snapshots WHERE commit_hash = ?1;",
            params![commit_hash],
            |row| row.get(0),
        )
        .optional()?)
}

fn load_document(conn: &Connection, path: &str) -> GraphResult<Option<DocumentRow>> {
    let row = conn
        .query_row(
            "SELECT module, target_type, content_hash, entity_keys, deleted \
             FROM documents WHERE path = ?1;",
            params![path],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, bool>(4)?,
                ))
            },
        )
        .optional()?;
    match row {
        Some((module, target_type, content_hash, keys, deleted)) => Ok(Some(DocumentRow {
            module,
            target_type,
            content_hash,
            entity_keys: serde_json::from_str(&keys)?,
            deleted,
        })),
        None => Ok(None),
    }
}

fn write_document(
    conn: &Connection,
    path: &str,
    commit_hash: &str,
    sequence_position: i64,
    doc: &DocumentRow,
) -> GraphResult<()> {
    let keys = serde_json::to_string(&doc.entity_keys)?;
    conn.execute(
        "INSERT OR REPLACE INTO document_versions(path, commit_hash, sequence_position, \
             module, target_type, content_hash, entity_keys, deleted) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8);",
        params![
            path,
            commit_hash,
            sequence_position,
            doc.module,
            doc.target_type,
            doc.content_hash,
            keys,
            doc.deleted,
        ],
    )?;
    upsert_document(conn, path, commit_hash, doc, &keys)
}

fn upsert_document(
    conn: &Connection,
    path: &str,
    commit_hash: &str,
    doc: &DocumentRow,
    keys_json: &str,
) -> GraphResult<()> {
    conn.execute(
        &format!(
            "INSERT INTO documents(path, module, target_type, content_hash, entity_keys, \
                 deleted, last_commit_hash, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, {NOW_SQL}) \
             ON CONFLICT(path) DO UPDATE SET \
                 module = excluded.module, \
                 target_type = excluded.target_type, \
                 content_hash = excluded.content_hash, \
                 entity_keys = excluded.entity_keys, \
                 deleted = excluded.deleted, \
                 last_commit_hash = excluded.last_commit_hash, \
                 updated_at = excluded.updated_at;"
        ),
        params![
            path,
            doc.module,
            doc.target_type,
            doc.content_hash,
            keys_json,
            doc.deleted,
            commit_hash,
        ],
    )?;
    Ok(())
}

/// Append a tombstoned copy of the entity's latest version.
fn tombstone_entity(
    conn: &Connection,
    identity_key: &str,
    commit_hash: &str,
    sequence_position: i64,
) -> GraphResult<usize> {
    Ok(conn.execute(
        "INSERT INTO entity_versions(entity_identity_key, commit_hash, sequence_position, \
             properties, tombstoned) \
         SELECT entity_identity_key, ?2, ?3, properties, 1 FROM entity_versions \
         WHERE entity_identity_key = ?1 \
         ORDER BY sequence_position DESC LIMIT 1;",
        params![identity_key, commit_hash, sequence_position],
    )?)
}

fn write_file(
    conn: &Connection,
    batch: &CommitBatch,
    sequence_position: i64,
    file: &FileFacts,
    receipt: &mut CommitReceipt,
) -> GraphResult<()> {
    let commit_hash = batch.commit_hash.as_str();
    let previous = load_document(conn, &file.path)?;
    if let Some(prev) = previous.as_ref().filter(|_| !batch.rescan) {
        if !prev.deleted
            && prev.content_hash.as_deref() == Some(file.content_hash.as_str())
            && prev.module == file.module.module
            && prev.target_type == file.module.target_type.as_str()
        {
            debug!(path = %file.path, "content unchanged, keeping current versions");
            receipt.files_unchanged += 1;
            return Ok(());
        }
    }

    let mut entity_stmt = conn.prepare_cached(
        "INSERT INTO entities(identity_key, name, qualified_name, kind, declaring_path) \
         VALUES (?1, ?2, ?3, ?4, ?5) \
         ON CONFLICT(identity_key) DO UPDATE SET \
             name = excluded.name, \
             qualified_name = excluded.qualified_name, \
             kind = excluded.kind, \
             declaring_path = excluded.declaring_path;",
    )?;
    let mut version_stmt = conn.prepare_cached(
        "INSERT INTO entity_versions(entity_identity_key, commit_hash, sequence_position, \
             properties, tombstoned) \
         VALUES (?1, ?2, ?3, ?4, 0);",
    )?;
    let mut member_stmt = conn.prepare_cached(
        "INSERT INTO members(owning_entity_identity_key, commit_hash, name, kind, \
             signature, visibility, start_line, is_static) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8);",
    )?;

    let mut keys: Vec<String> = Vec::with_capacity(file.entities.len());
    for entity in &file.entities {
        entity_stmt.execute(params![
            entity.identity_key,
            entity.name,
            entity.qualified_name,
            entity.kind.as_str(),
            file.path,
        ])?;
        let properties = EntityProperties::from_facts(entity, &file.module);
        version_stmt.execute(params![
            entity.identity_key,
            commit_hash,
            sequence_position,
            serde_json::to_string(&properties)?,
        ])?;
        for member in &entity.members {
            member_stmt.execute(params![
                entity.identity_key,
                commit_hash,
                member.name,
                member.kind.as_str(),
                member.signature,
                member.visibility,
                member.start_line,
                member.is_static,
            ])?;
        }
        receipt.versions_written += 1;
        keys.push(entity.identity_key.clone());
    }

    if let Some(prev) = previous.as_ref().filter(|p| !p.deleted) {
        let current: HashSet<&str> = keys.iter().map(String::as_str).collect();
        for key in prev.entity_keys.iter().filter(|k| !current.contains(k.as_str())) {
            receipt.tombstones_written +=
                tombstone_entity(conn, key, commit_hash, sequence_position)?;
        }
    }

    let doc = DocumentRow {
        module: file.module.module.clone(),
        target_type: file.module.target_type.as_str().to_string(),
        content_hash: Some(file.content_hash.clone()),
        entity_keys: keys,
        deleted: false,
    };
    write_document(conn, &file.path, commit_hash, sequence_position, &doc)?;
    receipt.files_written += 1;
    debug!(path = %file.path, entities = file.entities.len(), "wrote file");
    Ok(())
}

/// Tombstone every entity a removed file declared and mark its document
/// deleted.  Unknown paths still get a deleted document so stores layered
/// over another one can hide that path.
fn tombstone_file(
    conn: &Connection,
    commit_hash: &str,
    sequence_position: i64,
    path: &str,
    receipt: &mut CommitReceipt,
) -> GraphResult<()> {
    let previous = load_document(conn, path)?;
    let (module, target_type) = match &previous {
        Some(prev) if prev.deleted => return Ok(()),
        Some(prev) => {
            for key in &prev.entity_keys {
                receipt.tombstones_written +=
                    tombstone_entity(conn, key, commit_hash, sequence_position)?;
            }
            (prev.module.clone(), prev.target_type.clone())
        }
        None => (String::new(), "unknown".to_string()),
    };
    let doc = DocumentRow {
        module,
        target_type,
        content_hash: None,
        entity_keys: Vec::new(),
        deleted: true,
    };
    write_document(conn, path, commit_hash, sequence_position, &doc)?;
    debug!(path = %path, "tombstoned file");
    Ok(())
}

/// Delete one snapshot (cascading to its versions, members and document
/// versions), then rebuild the affected document rows from what remains.
fn purge_commit(conn: &Connection, commit_hash: &str) -> GraphResult<()> {
    let paths: Vec<String> = {
        let mut stmt =
            conn.prepare("SELECT path FROM document_versions WHERE commit_hash = ?1;")?;
        let rows = stmt.query_map(params![commit_hash], |row| row.get(0))?;
        rows.collect::<Result<_, _>>()?
    };

    conn.execute(
        "DELETE FROM commit_snapshots WHERE commit_hash = ?1;",
        params![commit_hash],
    )?;

    for path in &paths {
        let latest = conn
            .query_row(
                "SELECT commit_hash, module, target_type, content_hash, entity_keys, deleted \
                 FROM document_versions WHERE path = ?1 \
                 ORDER BY sequence_position DESC LIMIT 1;",
                params![path],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        DocumentRow {
                            module: row.get(1)?,
                            target_type: row.get(2)?,
                            content_hash: row.get(3)?,
                            entity_keys: Vec::new(),
                            deleted: row.get(5)?,
                        },
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;
        match latest {
            Some((hash, doc, keys_json)) => upsert_document(conn, path, &hash, &doc, &keys_json)?,
            None => {
                conn.execute("DELETE FROM documents WHERE path = ?1;", params![path])?;
            }
        }
    }

    conn.execute(
        "DELETE FROM entities WHERE NOT EXISTS ( \
             SELECT 1 FROM entity_versions v WHERE v.entity_identity_key = entities.identity_key \
         ) AND NOT EXISTS ( \
             SELECT 1 FROM members m WHERE m.owning_entity_identity_key = entities.identity_key \
         );",
        [],
    )?;
    debug!(commit = %commit_hash, documents = paths.len(), "purged commit rows");
    Ok(())
}
