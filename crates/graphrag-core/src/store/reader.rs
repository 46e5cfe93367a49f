//! Read-only access to an entity store.
//!
//! Multi-statement reads run inside one deferred transaction, so under WAL
//! they observe a single committed state even while a writer is active.

use std::path::{Path, PathBuf};

use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension};

use crate::errors::GraphResult;
use crate::models::{
    CommitSnapshot, CurrentEntity, EntityProperties, EntityVersionRecord, IndexState,
    MemberRecord, QueryFilter, StoreStats,
};
use crate::store::database::BUSY_TIMEOUT;

/// Read-only handle on a store file.  Cheap to clone and to create.
#[derive(Clone, Debug)]
pub struct StoreReader {
    db_path: PathBuf,
}

impl StoreReader {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    pub fn exists(&self) -> bool {
        self.db_path.is_file()
    }

    /// Never creates the file: a missing store is an error, not an empty one.
    fn connect(&self) -> GraphResult<Connection> {
        let conn = Connection::open_with_flags(
            &self.db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA query_only = ON;")?;
        Ok(conn)
    }

    /// Latest non-tombstoned version per identity key, up to the store's
    /// last indexed sequence position.
    pub fn query_current(&self, filter: &QueryFilter) -> GraphResult<Vec<CurrentEntity>> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        let state = load_index_state(&tx)?;
        let entities = query_current_at(&tx, state.last_sequence_position, filter)?;
        tx.commit()?;
        Ok(entities)
    }

    pub fn index_state(&self) -> GraphResult<IndexState> {
        load_index_state(&self.connect()?)
    }

    pub fn commit_snapshots(&self) -> GraphResult<Vec<CommitSnapshot>> {
        load_commit_snapshots(&self.connect()?)
    }

    /// Every path with a document row, deleted ones included.
    pub fn document_paths(&self) -> GraphResult<Vec<String>> {
        load_document_paths(&self.connect()?, true)
    }

    pub fn stats(&self) -> GraphResult<StoreStats> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        let stats = load_stats(&tx)?;
        tx.commit()?;
        Ok(stats)
    }

    pub fn entity_history(&self, identity_key: &str) -> GraphResult<Vec<EntityVersionRecord>> {
        load_entity_history(&self.connect()?, identity_key)
    }
}

// ---------------------------------------------------------------------------
// Connection-level queries, shared with the writer
// ---------------------------------------------------------------------------

pub(crate) fn load_index_state(conn: &Connection) -> GraphResult<IndexState> {
    let row = conn
        .query_row(
            "SELECT last_commit_hash, last_sequence_position, last_indexed_at, \
                    tracked_branch, indexed_files \
             FROM index_state WHERE id = 1;",
            [],
            |row| {
                Ok((
                    row.get::<_, Option<String>>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        )
        .optional()?;
    match row {
        Some((last_commit_hash, position, last_indexed_at, tracked_branch, files)) => {
            Ok(IndexState {
                last_commit_hash,
                last_sequence_position: position,
                last_indexed_at,
                tracked_branch,
                indexed_files: serde_json::from_str(&files)?,
            })
        }
        None => Ok(IndexState::default()),
    }
}

pub(crate) fn load_commit_snapshots(conn: &Connection) -> GraphResult<Vec<CommitSnapshot>> {
    let mut stmt = conn.prepare(
        "SELECT commit_hash, sequence_position, is_synthetic, indexed_at \
         FROM commit_snapshots ORDER BY sequence_position;",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(CommitSnapshot {
            commit_hash: row.get(0)?,
            sequence_position: row.get(1)?,
            is_synthetic: row.get(2)?,
            indexed_at: row.get(3)?,
        })
    })?;
    Ok(rows.collect::<Result<_, _>>()?)
}

pub(crate) fn load_document_paths(
    conn: &Connection,
    include_deleted: bool,
) -> GraphResult<Vec<String>> {
    let sql = if include_deleted {
        "SELECT path FROM documents ORDER BY path;"
    } else {
        "SELECT path FROM documents WHERE deleted = 0 ORDER BY path;"
    };
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map([], |row| row.get(0))?;
    Ok(rows.collect::<Result<_, _>>()?)
}

pub(crate) fn load_stats(conn: &Connection) -> GraphResult<StoreStats> {
    Ok(conn.query_row(
        "SELECT \
             (SELECT COUNT(*) FROM documents), \
             (SELECT COUNT(*) FROM documents WHERE deleted = 0), \
             (SELECT COUNT(*) FROM entities), \
             (SELECT COUNT(*) FROM entity_versions), \
             (SELECT COUNT(*) FROM entity_versions WHERE tombstoned = 1), \
             (SELECT COUNT(*) FROM members), \
             (SELECT COUNT(*) FROM commit_snapshots);",
        [],
        |row| {
            Ok(StoreStats {
                documents: row.get(0)?,
                live_documents: row.get(1)?,
                entities: row.get(2)?,
                entity_versions: row.get(3)?,
                tombstones: row.get(4)?,
                members: row.get(5)?,
                commit_snapshots: row.get(6)?,
            })
        },
    )?)
}

pub(crate) fn load_entity_history(
    conn: &Connection,
    identity_key: &str,
) -> GraphResult<Vec<EntityVersionRecord>> {
    let mut stmt = conn.prepare(
        "SELECT commit_hash, sequence_position, tombstoned, properties \
         FROM entity_versions WHERE entity_identity_key = ?1 \
         ORDER BY sequence_position;",
    )?;
    let rows = stmt.query_map(params![identity_key], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, bool>(2)?,
            row.get::<_, String>(3)?,
        ))
    })?;
    let mut history = Vec::new();
    for row in rows {
        let (commit_hash, sequence_position, tombstoned, properties) = row?;
        history.push(EntityVersionRecord {
            commit_hash,
            sequence_position,
            tombstoned,
            properties: serde_json::from_str(&properties)?,
        });
    }
    Ok(history)
}

fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

pub(crate) fn query_current_at(
    conn: &Connection,
    up_to_position: i64,
    filter: &QueryFilter,
) -> GraphResult<Vec<CurrentEntity>> {
    let mut sql = String::from(
        "SELECT e.identity_key, e.name, e.qualified_name, e.kind, e.declaring_path, \
                v.commit_hash, v.sequence_position, v.properties \
         FROM entity_versions v \
         JOIN entities e ON e.identity_key = v.entity_identity_key \
         WHERE v.sequence_position = ( \
                 SELECT MAX(v2.sequence_position) FROM entity_versions v2 \
                 WHERE v2.entity_identity_key = v.entity_identity_key \
                   AND v2.sequence_position <= ?1) \
           AND v.tombstoned = 0",
    );
    let mut values: Vec<Value> = vec![Value::Integer(up_to_position)];
    let mut bind = |sql: &mut String, clause: &str, value: Value| {
        values.push(value);
        sql.push_str(&clause.replace("?#", &format!("?{}", values.len())));
    };

    if let Some(name) = filter.name.as_deref().filter(|n| !n.is_empty()) {
        if filter.exact_name {
            bind(&mut sql, " AND e.name = ?#", Value::Text(name.to_string()));
        } else {
            bind(
                &mut sql,
                " AND e.name LIKE ?# ESCAPE '\\'",
                Value::Text(format!("%{}%", escape_like(name))),
            );
        }
    }
    if let Some(kind) = &filter.kind {
        bind(&mut sql, " AND e.kind = ?#", Value::Text(kind.clone()));
    }
    if let Some(glob) = &filter.path_glob {
        bind(&mut sql, " AND e.declaring_path GLOB ?#", Value::Text(glob.clone()));
    }
    if let Some(module) = &filter.module {
        bind(
            &mut sql,
            " AND json_extract(v.properties, '$.module') = ?#",
            Value::Text(module.clone()),
        );
    }
    if let Some(target_type) = filter.target_type {
        bind(
            &mut sql,
            " AND json_extract(v.properties, '$.target_type') = ?#",
            Value::Text(target_type.as_str().to_string()),
        );
    }
    if let Some(parent) = &filter.inherits {
        bind(
            &mut sql,
            " AND EXISTS (SELECT 1 FROM json_each(v.properties, '$.inherits') \
                 WHERE json_each.value = ?#)",
            Value::Text(parent.clone()),
        );
    }
    let limit = if filter.limit == 0 {
        -1
    } else {
        filter.limit as i64
    };
    bind(
        &mut sql,
        " ORDER BY e.name, e.declaring_path, e.identity_key LIMIT ?#;",
        Value::Integer(limit),
    );

    let raw: Vec<(String, String, String, String, String, String, i64, String)> = {
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
                row.get(7)?,
            ))
        })?;
        rows.collect::<Result<_, _>>()?
    };

    let mut entities = Vec::with_capacity(raw.len());
    for (key, name, qualified_name, kind, path, commit_hash, position, properties) in raw {
        let properties: EntityProperties = serde_json::from_str(&properties)?;
        let members = if filter.include_members {
            load_members(conn, &key, &commit_hash)?
        } else {
            Vec::new()
        };
        entities.push(CurrentEntity {
            identity_key: key,
            name,
            qualified_name,
            kind,
            declaring_path: path,
            commit_hash,
            sequence_position: position,
            properties,
            members,
        });
    }
    Ok(entities)
}

fn load_members(
    conn: &Connection,
    identity_key: &str,
    commit_hash: &str,
) -> GraphResult<Vec<MemberRecord>> {
    let mut stmt = conn.prepare_cached(
        "SELECT name, kind, signature, visibility, start_line, is_static FROM members \
         WHERE owning_entity_identity_key = ?1 AND commit_hash = ?2 \
         ORDER BY start_line, id;",
    )?;
    let rows = stmt.query_map(params![identity_key, commit_hash], |row| {
        Ok(MemberRecord {
            name: row.get(0)?,
            kind: row.get(1)?,
            signature: row.get(2)?,
            visibility: row.get(3)?,
            start_line: row.get(4)?,
            is_static: row.get(5)?,
        })
    })?;
    Ok(rows.collect::<Result<_, _>>()?)
}
