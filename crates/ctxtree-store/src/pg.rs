//! Postgres backend
//!
//! Bodies are stored as JSONB and addressed with the native operators:
//! `#>` to extract, `jsonb_set` to write, `#-` to remove. Paths travel as
//! `text[]` parameters, never spliced into SQL.
//!
//! A `text[]` element that reads as an integer addresses an object key and an
//! array index alike, so paths holding one are checked prefix by prefix
//! against the container each segment needs before the operator is trusted.
//!
//! Writes run SERIALIZABLE. Read-modify-write callers (merge, version bumps)
//! that lose a race get a serialization failure, which `Storage` retries.

use std::sync::Mutex;

use postgres::error::SqlState;
use postgres::types::ToSql;
use postgres::{Client, IsolationLevel, NoTls, Transaction};
use serde_json::Value;
use tracing::{debug, info, warn};

use ctxtree_core::{
    BackendKind, CtxError, JsonType, RecordFilter, RecordKey, RecordKind, Result, Segment,
    StoragePath, StoredRecord,
};

use crate::adapter::{ensure_settable, Backend, StorageTx, TxMode};
use crate::schema::{Schema, SCHEMA_VERSION};
use crate::sql::{filter_clause, postgres_path, POSTGRES_KEY_WHERE};

/// Classify a driver error: lost connections, serialization failures and
/// server shutdown are retryable.
fn pg_err(context: &str, err: postgres::Error) -> CtxError {
    let transient_state = err.code().map_or(false, |state| {
        let code = state.code();
        code.starts_with("08")
            || *state == SqlState::T_R_SERIALIZATION_FAILURE
            || *state == SqlState::T_R_DEADLOCK_DETECTED
            || *state == SqlState::ADMIN_SHUTDOWN
            || *state == SqlState::TOO_MANY_CONNECTIONS
    });
    let io_failure = std::error::Error::source(&err)
        .map_or(false, |source| source.downcast_ref::<std::io::Error>().is_some());

    if err.is_closed() || transient_state || io_failure {
        CtxError::BackendUnavailable(format!("{}: {}", context, err))
    } else {
        CtxError::Backend(format!("{}: {}", context, err))
    }
}

/// Isolation level and read-only flag for a transaction mode.
fn isolation(mode: TxMode) -> (IsolationLevel, bool) {
    match mode {
        TxMode::ReadOnly => (IsolationLevel::RepeatableRead, true),
        TxMode::ReadWrite => (IsolationLevel::Serializable, false),
    }
}

/// Whether `#>` could resolve this segment against the wrong container.
fn ambiguous(segment: &Segment) -> bool {
    match segment {
        Segment::Index(_) => true,
        Segment::Key(key) => key.trim_start().parse::<i64>().is_ok(),
    }
}

/// Postgres-backed implementation of the Backend trait.
pub struct PgBackend {
    url: String,
    client: Mutex<Client>,
}

impl PgBackend {
    /// Connect with a libpq-style connection string and ensure the schema.
    pub fn connect(url: &str) -> Result<Self> {
        let mut client = Client::connect(url, NoTls).map_err(|e| pg_err("connect", e))?;
        Self::init_schema(&mut client)?;
        info!("connected to postgres store");
        Ok(Self {
            url: url.to_string(),
            client: Mutex::new(client),
        })
    }

    fn init_schema(client: &mut Client) -> Result<()> {
        client
            .batch_execute(Schema::postgres())
            .map_err(|e| pg_err("init_schema", e))?;

        let row = client
            .query_one("SELECT MAX(version) FROM schema_version", &[])
            .map_err(|e| pg_err("get_schema_version", e))?;
        let current_version = row.get::<_, Option<i32>>(0).unwrap_or(0) as u32;

        if current_version > SCHEMA_VERSION {
            return Err(CtxError::Backend(format!(
                "database schema v{} is newer than supported v{}",
                current_version, SCHEMA_VERSION
            )));
        }
        if current_version < SCHEMA_VERSION {
            for version in current_version.max(1)..SCHEMA_VERSION {
                if let Some(migration) = Schema::migration(version, version + 1) {
                    client
                        .batch_execute(migration)
                        .map_err(|e| pg_err("schema migration", e))?;
                }
            }
            client
                .execute(
                    "INSERT INTO schema_version (version) VALUES ($1)",
                    &[&(SCHEMA_VERSION as i32)],
                )
                .map_err(|e| pg_err("set_schema_version", e))?;
            debug!(from = current_version, to = SCHEMA_VERSION, "postgres schema ready");
        }
        Ok(())
    }
}

impl Backend for PgBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Postgres
    }

    fn run(
        &self,
        mode: TxMode,
        work: &mut dyn FnMut(&mut dyn StorageTx) -> Result<()>,
    ) -> Result<()> {
        let mut client = self
            .client
            .lock()
            .map_err(|e| CtxError::Backend(format!("connection lock poisoned: {}", e)))?;

        if client.is_closed() {
            warn!("postgres connection closed, reconnecting");
            *client = Client::connect(&self.url, NoTls).map_err(|e| pg_err("reconnect", e))?;
        }

        let (level, read_only) = isolation(mode);
        let tx = client
            .build_transaction()
            .isolation_level(level)
            .read_only(read_only)
            .start()
            .map_err(|e| pg_err("begin", e))?;

        let mut handle = PgTx { tx };
        work(&mut handle)?;
        handle.tx.commit().map_err(|e| pg_err("commit", e))
    }
}

/// Open Postgres transaction
struct PgTx<'c> {
    tx: Transaction<'c>,
}

impl PgTx<'_> {
    /// Parameters `$1..$4` for [`POSTGRES_KEY_WHERE`].
    fn key_params<'a>(key: &'a RecordKey, kind: &'a &'a str) -> Vec<&'a (dyn ToSql + Sync)> {
        vec![
            kind as &(dyn ToSql + Sync),
            &key.project_id,
            &key.task_tree_id,
            &key.task_id,
        ]
    }

    /// `jsonb_typeof` at `path` with no container checks.
    fn typeof_unchecked(&mut self, path: &StoragePath) -> Result<Option<JsonType>> {
        let key = &path.key;
        let kind = key.kind.as_str();
        let pg_path = postgres_path(&path.path);
        let mut params = Self::key_params(key, &kind);
        params.push(&pg_path);
        let row = self
            .tx
            .query_opt(
                &format!(
                    "SELECT jsonb_typeof(body #> $5::text[]) FROM records {}",
                    POSTGRES_KEY_WHERE
                ),
                &params,
            )
            .map_err(|e| pg_err("jsonb_typeof", e))?;
        match row.and_then(|row| row.get::<_, Option<String>>(0)) {
            None => Ok(None),
            Some(name) => JsonType::from_backend_name(&name)
                .map(Some)
                .ok_or_else(|| CtxError::Backend(format!("unknown jsonb type: {}", name))),
        }
    }

    /// Whether every prefix of `path` is the container its next segment
    /// needs. Only paths with an integer-like segment are checked.
    fn addressable(&mut self, path: &StoragePath) -> Result<bool> {
        let segments = path.path.segments();
        if !segments.iter().any(ambiguous) {
            return Ok(true);
        }
        for (depth, segment) in segments.iter().enumerate() {
            match self.typeof_unchecked(&path.prefix(depth))? {
                Some(found) if found == segment.container() => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }
}

impl StorageTx for PgTx<'_> {
    fn get_opt(&mut self, path: &StoragePath) -> Result<Option<Value>> {
        if !self.addressable(path)? {
            return Ok(None);
        }
        let key = &path.key;
        let kind = key.kind.as_str();
        let pg_path = postgres_path(&path.path);
        let mut params = Self::key_params(key, &kind);
        params.push(&pg_path);
        let row = self
            .tx
            .query_opt(
                &format!("SELECT body #> $5::text[] FROM records {}", POSTGRES_KEY_WHERE),
                &params,
            )
            .map_err(|e| pg_err("get", e))?;
        Ok(row.and_then(|row| row.get::<_, Option<Value>>(0)))
    }

    fn generation(&mut self, key: &RecordKey) -> Result<Option<i64>> {
        let kind = key.kind.as_str();
        let params = Self::key_params(key, &kind);
        let row = self
            .tx
            .query_opt(&format!("SELECT seq FROM records {}", POSTGRES_KEY_WHERE), &params)
            .map_err(|e| pg_err("generation", e))?;
        Ok(row.map(|row| row.get(0)))
    }

    fn node_type(&mut self, path: &StoragePath) -> Result<Option<JsonType>> {
        if !self.addressable(path)? {
            return Ok(None);
        }
        self.typeof_unchecked(path)
    }

    fn set(&mut self, path: &StoragePath, value: &Value) -> Result<()> {
        let key = &path.key;
        let kind = key.kind.as_str();
        if path.is_root() {
            let mut params = Self::key_params(key, &kind);
            params.push(value);
            self.tx
                .execute(
                    "INSERT INTO records (kind, project_id, task_tree_id, task_id, seq, body)
                     VALUES ($1, $2, $3, $4, nextval('record_seq'), $5)
                     ON CONFLICT (kind, project_id, task_tree_id, task_id)
                     DO UPDATE SET body = EXCLUDED.body",
                    &params,
                )
                .map_err(|e| pg_err("upsert", e))?;
            return Ok(());
        }

        ensure_settable(self, path)?;
        let pg_path = postgres_path(&path.path);
        let mut params = Self::key_params(key, &kind);
        params.push(&pg_path);
        params.push(value);
        self.tx
            .execute(
                &format!(
                    "UPDATE records SET body = jsonb_set(body, $5::text[], $6::jsonb, true) {}",
                    POSTGRES_KEY_WHERE
                ),
                &params,
            )
            .map_err(|e| pg_err("jsonb_set", e))?;
        Ok(())
    }

    fn delete(&mut self, path: &StoragePath) -> Result<bool> {
        let key = &path.key;
        let kind = key.kind.as_str();
        if path.is_root() {
            let params = Self::key_params(key, &kind);
            let removed = self
                .tx
                .execute(&format!("DELETE FROM records {}", POSTGRES_KEY_WHERE), &params)
                .map_err(|e| pg_err("delete", e))?;
            return Ok(removed > 0);
        }
        if self.node_type(path)?.is_none() {
            return Ok(false);
        }
        let pg_path = postgres_path(&path.path);
        let mut params = Self::key_params(key, &kind);
        params.push(&pg_path);
        self.tx
            .execute(
                &format!(
                    "UPDATE records SET body = body #- $5::text[] {}",
                    POSTGRES_KEY_WHERE
                ),
                &params,
            )
            .map_err(|e| pg_err("#-", e))?;
        Ok(true)
    }

    fn list(&mut self, filter: &RecordFilter) -> Result<Vec<StoredRecord>> {
        let (clause, values) = filter_clause(filter, |n| format!("${}", n));
        let params: Vec<&(dyn ToSql + Sync)> =
            values.iter().map(|v| v as &(dyn ToSql + Sync)).collect();
        let rows = self
            .tx
            .query(
                &format!(
                    "SELECT kind, project_id, task_tree_id, task_id, seq, body FROM records{} ORDER BY seq",
                    clause
                ),
                &params,
            )
            .map_err(|e| pg_err("list", e))?;

        rows.into_iter()
            .map(|row| -> Result<StoredRecord> {
                let kind: String = row.get(0);
                Ok(StoredRecord {
                    key: RecordKey::new(
                        RecordKind::parse(&kind)?,
                        row.get::<_, String>(1),
                        row.get::<_, String>(2),
                        row.get::<_, String>(3),
                    ),
                    seq: row.get(4),
                    body: row.get(5),
                })
            })
            .collect()
    }

    fn delete_where(&mut self, filter: &RecordFilter) -> Result<usize> {
        let (clause, values) = filter_clause(filter, |n| format!("${}", n));
        let params: Vec<&(dyn ToSql + Sync)> =
            values.iter().map(|v| v as &(dyn ToSql + Sync)).collect();
        let removed = self
            .tx
            .execute(&format!("DELETE FROM records{}", clause), &params)
            .map_err(|e| pg_err("delete_where", e))?;
        Ok(removed as usize)
    }
}
