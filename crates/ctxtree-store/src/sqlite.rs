//! SQLite backend
//!
//! Bodies are stored as JSON text. Reads go through `json_type` and
//! `json_extract`, inner writes through `json_set`, inner deletes through
//! `json_remove`. One connection serves the process; the mutex serializes
//! transactions and the file lock serializes writers across processes.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use serde_json::Value;
use tracing::{debug, info};

use ctxtree_core::{
    BackendKind, CtxError, JsonType, RecordFilter, RecordKind, RecordKey, Result, StoragePath,
    StoredRecord,
};

use crate::adapter::{ensure_settable, Backend, StorageTx, TxMode};
use crate::schema::{Schema, SCHEMA_VERSION};
use crate::sql::{filter_clause, sqlite_path, SQLITE_KEY_WHERE};

/// Classify a driver error: lock contention and I/O are retryable.
fn sql_err(context: &str, err: rusqlite::Error) -> CtxError {
    let retryable = matches!(
        &err,
        rusqlite::Error::SqliteFailure(e, _) if matches!(
            e.code,
            ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::CannotOpen
                | ErrorCode::SystemIoFailure
        )
    );
    if retryable {
        CtxError::BackendUnavailable(format!("{}: {}", context, err))
    } else {
        CtxError::Backend(format!("{}: {}", context, err))
    }
}

/// SQLite-backed implementation of the Backend trait.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    /// Open (or create) a database. `:memory:` opens a private in-memory one.
    pub fn open(url: &str) -> Result<Self> {
        if url == ":memory:" {
            return Self::open_in_memory();
        }
        let path = Path::new(url);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                CtxError::BackendUnavailable(format!("create {}: {}", parent.display(), e))
            })?;
        }
        let conn = Connection::open(path).map_err(|e| sql_err("open", e))?;
        info!(path = %path.display(), "opened sqlite store");
        Self::init_with_connection(conn)
    }

    /// Create an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| sql_err("open_in_memory", e))?;
        Self::init_with_connection(conn)
    }

    fn init_with_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(|e| sql_err("busy_timeout", e))?;
        let _mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .map_err(|e| sql_err("journal_mode", e))?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        let current_version = Self::schema_version(conn)?;

        if current_version == 0 {
            conn.execute_batch(Schema::sqlite())
                .map_err(|e| sql_err("init_schema", e))?;
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                [SCHEMA_VERSION],
            )
            .map_err(|e| sql_err("set_schema_version", e))?;
            debug!(version = SCHEMA_VERSION, "created sqlite schema");
        } else if current_version < SCHEMA_VERSION {
            for version in current_version..SCHEMA_VERSION {
                if let Some(migration) = Schema::migration(version, version + 1) {
                    conn.execute_batch(migration)
                        .map_err(|e| sql_err("schema migration", e))?;
                }
            }
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                [SCHEMA_VERSION],
            )
            .map_err(|e| sql_err("set_schema_version", e))?;
            info!(from = current_version, to = SCHEMA_VERSION, "migrated sqlite schema");
        } else if current_version > SCHEMA_VERSION {
            return Err(CtxError::Backend(format!(
                "database schema v{} is newer than supported v{}",
                current_version, SCHEMA_VERSION
            )));
        }

        Ok(())
    }

    /// Highest applied schema version; 0 for a database with no
    /// `schema_version` table yet.
    fn schema_version(conn: &Connection) -> Result<u32> {
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .map_err(|e| sql_err("read schema version", e))?;
        if tables == 0 {
            return Ok(0);
        }
        let version: Option<u32> = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .map_err(|e| sql_err("read schema version", e))?;
        Ok(version.unwrap_or(0))
    }
}

impl Backend for SqliteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    fn run(
        &self,
        mode: TxMode,
        work: &mut dyn FnMut(&mut dyn StorageTx) -> Result<()>,
    ) -> Result<()> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| CtxError::Backend(format!("connection lock poisoned: {}", e)))?;
        let behavior = match mode {
            TxMode::ReadOnly => TransactionBehavior::Deferred,
            TxMode::ReadWrite => TransactionBehavior::Immediate,
        };
        let tx = conn
            .transaction_with_behavior(behavior)
            .map_err(|e| sql_err("begin", e))?;
        {
            let mut handle = SqliteTx { conn: &tx };
            // dropping `tx` without commit rolls back
            work(&mut handle)?;
        }
        tx.commit().map_err(|e| sql_err("commit", e))
    }
}

/// Open SQLite transaction
struct SqliteTx<'c> {
    conn: &'c Connection,
}

impl SqliteTx<'_> {
    fn root_body(&self, key: &RecordKey) -> Result<Option<Value>> {
        let body: Option<String> = self
            .conn
            .query_row(
                &format!("SELECT body FROM records {}", SQLITE_KEY_WHERE),
                params![key.kind.as_str(), key.project_id, key.task_tree_id, key.task_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| sql_err("get", e))?;
        Ok(body.map(|text| serde_json::from_str(&text)).transpose()?)
    }

    fn upsert(&self, key: &RecordKey, body: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO records (kind, project_id, task_tree_id, task_id, body)
                 VALUES (?1, ?2, ?3, ?4, json(?5))
                 ON CONFLICT (kind, project_id, task_tree_id, task_id)
                 DO UPDATE SET body = excluded.body",
                params![key.kind.as_str(), key.project_id, key.task_tree_id, key.task_id, body],
            )
            .map_err(|e| sql_err("upsert", e))?;
        Ok(())
    }
}

/// Decode one `json_type` / `json_quote(json_extract(..))` pair.
fn decode_extracted(kind: &str, text: Option<String>) -> Result<Value> {
    match kind {
        "true" => Ok(Value::Bool(true)),
        "false" => Ok(Value::Bool(false)),
        "null" => Ok(Value::Null),
        _ => {
            let text = text.ok_or_else(|| {
                CtxError::Backend(format!("json_extract returned NULL for a {} value", kind))
            })?;
            Ok(serde_json::from_str(&text)?)
        }
    }
}

impl StorageTx for SqliteTx<'_> {
    fn get_opt(&mut self, path: &StoragePath) -> Result<Option<Value>> {
        let key = &path.key;
        if path.is_root() {
            return self.root_body(key);
        }
        let json_path = sqlite_path(&path.path)?;
        let row: Option<(Option<String>, Option<String>)> = self
            .conn
            .query_row(
                &format!(
                    "SELECT json_type(body, ?5), json_quote(json_extract(body, ?5)) FROM records {}",
                    SQLITE_KEY_WHERE
                ),
                params![
                    key.kind.as_str(),
                    key.project_id,
                    key.task_tree_id,
                    key.task_id,
                    json_path
                ],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|e| sql_err("get", e))?;
        match row {
            Some((Some(kind), text)) => decode_extracted(&kind, text).map(Some),
            _ => Ok(None),
        }
    }

    fn generation(&mut self, key: &RecordKey) -> Result<Option<i64>> {
        self.conn
            .query_row(
                &format!("SELECT seq FROM records {}", SQLITE_KEY_WHERE),
                params![key.kind.as_str(), key.project_id, key.task_tree_id, key.task_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| sql_err("generation", e))
    }

    fn node_type(&mut self, path: &StoragePath) -> Result<Option<JsonType>> {
        let key = &path.key;
        let json_path = sqlite_path(&path.path)?;
        let name: Option<Option<String>> = self
            .conn
            .query_row(
                &format!("SELECT json_type(body, ?5) FROM records {}", SQLITE_KEY_WHERE),
                params![
                    key.kind.as_str(),
                    key.project_id,
                    key.task_tree_id,
                    key.task_id,
                    json_path
                ],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| sql_err("json_type", e))?;
        match name.flatten() {
            None => Ok(None),
            Some(name) => JsonType::from_backend_name(&name)
                .map(Some)
                .ok_or_else(|| CtxError::Backend(format!("unknown json_type: {}", name))),
        }
    }

    fn set(&mut self, path: &StoragePath, value: &Value) -> Result<()> {
        let body = serde_json::to_string(value)?;
        if path.is_root() {
            return self.upsert(&path.key, &body);
        }
        ensure_settable(self, path)?;
        let key = &path.key;
        let json_path = sqlite_path(&path.path)?;
        self.conn
            .execute(
                &format!(
                    "UPDATE records SET body = json_set(body, ?5, json(?6)) {}",
                    SQLITE_KEY_WHERE
                ),
                params![
                    key.kind.as_str(),
                    key.project_id,
                    key.task_tree_id,
                    key.task_id,
                    json_path,
                    body
                ],
            )
            .map_err(|e| sql_err("json_set", e))?;
        Ok(())
    }

    fn delete(&mut self, path: &StoragePath) -> Result<bool> {
        let key = &path.key;
        if path.is_root() {
            let removed = self
                .conn
                .execute(
                    &format!("DELETE FROM records {}", SQLITE_KEY_WHERE),
                    params![key.kind.as_str(), key.project_id, key.task_tree_id, key.task_id],
                )
                .map_err(|e| sql_err("delete", e))?;
            return Ok(removed > 0);
        }
        if self.node_type(path)?.is_none() {
            return Ok(false);
        }
        let json_path = sqlite_path(&path.path)?;
        self.conn
            .execute(
                &format!(
                    "UPDATE records SET body = json_remove(body, ?5) {}",
                    SQLITE_KEY_WHERE
                ),
                params![
                    key.kind.as_str(),
                    key.project_id,
                    key.task_tree_id,
                    key.task_id,
                    json_path
                ],
            )
            .map_err(|e| sql_err("json_remove", e))?;
        Ok(true)
    }

    fn list(&mut self, filter: &RecordFilter) -> Result<Vec<StoredRecord>> {
        let (clause, values) = filter_clause(filter, |n| format!("?{}", n));
        let sql = format!(
            "SELECT kind, project_id, task_tree_id, task_id, seq, body FROM records{} ORDER BY seq",
            clause
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|e| sql_err("prepare list", e))?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .map_err(|e| sql_err("list", e))?;

        let mut records = Vec::new();
        for row in rows {
            let (kind, project_id, task_tree_id, task_id, seq, body) =
                row.map_err(|e| sql_err("list row", e))?;
            records.push(StoredRecord {
                key: RecordKey::new(RecordKind::parse(&kind)?, project_id, task_tree_id, task_id),
                seq,
                body: serde_json::from_str(&body)?,
            });
        }
        Ok(records)
    }

    fn delete_where(&mut self, filter: &RecordFilter) -> Result<usize> {
        let (clause, values) = filter_clause(filter, |n| format!("?{}", n));
        self.conn
            .execute(
                &format!("DELETE FROM records{}", clause),
                params_from_iter(values.iter()),
            )
            .map_err(|e| sql_err("delete_where", e))
    }
}
