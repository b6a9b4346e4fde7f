//! Context Hierarchy Store
//!
//! CRUD for the Global, Project and Task context records. Each write bumps
//! the record's `version` and stamps `updated_at`. Global reads never fail:
//! an absent Global context is an empty map at version 0. Project and Task
//! contexts that were never written are `NotFound`.

use std::collections::BTreeSet;

use chrono::Utc;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use ctxtree_core::{
    ContextBody, ContextRecord, CtxError, JsonPath, RecordFilter, RecordKey, RecordKind, Result,
    ScopeKey,
};

use crate::adapter::{Storage, StorageTx};

/// Context CRUD over a [`Storage`]
#[derive(Debug, Clone)]
pub struct ContextStore {
    storage: Storage,
}

impl ContextStore {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// The stored record for `scope`.
    pub fn get_context(&self, scope: &ScopeKey) -> Result<ContextRecord> {
        scope.validate()?;
        self.storage.read_transaction(|tx| load_context(tx, scope))
    }

    /// Deep-merge `patch` into the scope's data and return the new version.
    pub fn write_context(&self, scope: &ScopeKey, patch: &Value) -> Result<u64> {
        scope.validate()?;
        if !patch.is_object() {
            return Err(CtxError::InvalidInput(
                "context patch must be a JSON object".to_string(),
            ));
        }
        let version = self.storage.transaction(|tx| {
            let key = prepare_write(tx, scope)?;
            tx.merge(&data_path(&key, &JsonPath::root()), patch)?;
            bump_version(tx, &key)
        })?;
        debug!(%scope, version, "context written");
        Ok(version)
    }

    /// Replace the scope's data wholesale and return the new version.
    pub fn replace_context(&self, scope: &ScopeKey, data: Map<String, Value>) -> Result<u64> {
        scope.validate()?;
        let data = Value::Object(data);
        self.storage.transaction(|tx| {
            let key = prepare_write(tx, scope)?;
            tx.set(&data_path(&key, &JsonPath::root()), &data)?;
            bump_version(tx, &key)
        })
    }

    /// Value at `expr` inside the scope's data.
    pub fn read_context_value(&self, scope: &ScopeKey, expr: &str) -> Result<Value> {
        scope.validate()?;
        let path = JsonPath::parse(expr)?;
        self.storage.read_transaction(|tx| {
            let key = scope.record_key();
            if let Some(value) = tx.get_opt(&data_path(&key, &path))? {
                return Ok(value);
            }
            // explain the miss against the caller's path, not the stored one
            let record = load_context(tx, scope)?;
            let data = Value::Object(record.data);
            path.resolve(&data).cloned()
        })
    }

    /// Remove the value at `expr` and return the new version.
    pub fn delete_context_key(&self, scope: &ScopeKey, expr: &str) -> Result<u64> {
        scope.validate()?;
        let path = JsonPath::parse(expr)?;
        if path.is_root() {
            return Err(CtxError::InvalidInput(
                "cannot delete the context root; use replace_context".to_string(),
            ));
        }
        self.storage.transaction(|tx| {
            let key = scope.record_key();
            if tx.get_record(&key)?.is_none() {
                return Err(absent(scope, &path));
            }
            if !tx.delete(&data_path(&key, &path))? {
                return Err(CtxError::PathNotFound(path.to_string()));
            }
            bump_version(tx, &key)
        })
    }

    /// Create an empty project context (version 0) if none exists.
    pub fn touch_project(&self, project_id: &str) -> Result<()> {
        ScopeKey::project(project_id).validate()?;
        self.storage.transaction(|tx| ensure_project(tx, project_id))
    }

    /// Known project ids, in creation order.
    pub fn list_projects(&self) -> Result<Vec<String>> {
        let records = self
            .storage
            .list(&RecordFilter::kind(RecordKind::Project))?;
        Ok(records.into_iter().map(|r| r.key.project_id).collect())
    }

    /// Tree ids holding tasks or task contexts in `project_id`, sorted.
    pub fn list_trees(&self, project_id: &str) -> Result<Vec<String>> {
        self.storage.read_transaction(|tx| {
            require_project(tx, project_id)?;
            let mut trees = BTreeSet::new();
            for kind in [RecordKind::Task, RecordKind::TaskContext] {
                for record in tx.list(&RecordFilter::kind(kind).in_project(project_id))? {
                    trees.insert(record.key.task_tree_id);
                }
            }
            Ok(trees.into_iter().collect())
        })
    }

    /// Delete a project with its tasks and task contexts in one transaction.
    /// Returns the number of records removed.
    pub fn delete_project(&self, project_id: &str) -> Result<usize> {
        ScopeKey::project(project_id).validate()?;
        let removed = self.storage.transaction(|tx| {
            require_project(tx, project_id)?;
            let contexts =
                tx.delete_where(&RecordFilter::kind(RecordKind::TaskContext).in_project(project_id))?;
            let tasks =
                tx.delete_where(&RecordFilter::kind(RecordKind::Task).in_project(project_id))?;
            tx.delete(&RecordKey::project(project_id).root())?;
            Ok((contexts, tasks))
        })?;
        info!(
            project_id,
            task_contexts = removed.0,
            tasks = removed.1,
            "project deleted"
        );
        Ok(removed.0 + removed.1 + 1)
    }

    /// Remove one task's context layer. Returns whether it existed.
    pub fn delete_task_context(&self, scope: &ScopeKey) -> Result<bool> {
        if !matches!(scope, ScopeKey::Task { .. }) {
            return Err(CtxError::InvalidInput(format!(
                "{} is not a task scope",
                scope
            )));
        }
        scope.validate()?;
        self.storage
            .transaction(|tx| tx.delete(&scope.record_key().root()))
    }
}

/// `data.<inner>` inside the record for `key`.
fn data_path(key: &RecordKey, inner: &JsonPath) -> ctxtree_core::StoragePath {
    key.at(ContextBody::data_path(inner))
}

fn absent(scope: &ScopeKey, path: &JsonPath) -> CtxError {
    match scope {
        ScopeKey::Global => CtxError::PathNotFound(path.to_string()),
        _ => CtxError::NotFound(format!("{} context", scope)),
    }
}

/// Load a context record inside an open transaction.
pub(crate) fn load_context(tx: &mut dyn StorageTx, scope: &ScopeKey) -> Result<ContextRecord> {
    match load_body(tx, scope)? {
        Some(body) => Ok(ContextRecord::from_body(scope.clone(), body)),
        None if *scope == ScopeKey::Global => Ok(ContextRecord::empty(ScopeKey::Global)),
        None => Err(CtxError::NotFound(format!("{} context", scope))),
    }
}

pub(crate) fn load_body(tx: &mut dyn StorageTx, scope: &ScopeKey) -> Result<Option<ContextBody>> {
    tx.get_record(&scope.record_key())?
        .map(ContextBody::from_value)
        .transpose()
}

pub(crate) fn project_exists(tx: &mut dyn StorageTx, project_id: &str) -> Result<bool> {
    tx.exists(&RecordKey::project(project_id).root())
}

pub(crate) fn require_project(tx: &mut dyn StorageTx, project_id: &str) -> Result<()> {
    if project_exists(tx, project_id)? {
        Ok(())
    } else {
        Err(CtxError::NotFound(format!("project {}", project_id)))
    }
}

pub(crate) fn ensure_project(tx: &mut dyn StorageTx, project_id: &str) -> Result<()> {
    if !project_exists(tx, project_id)? {
        tx.set(
            &RecordKey::project(project_id).root(),
            &ContextBody::default().to_value()?,
        )?;
        debug!(project_id, "project created");
    }
    Ok(())
}

/// Make sure the owning project and the record itself exist.
fn prepare_write(tx: &mut dyn StorageTx, scope: &ScopeKey) -> Result<RecordKey> {
    if let Some(project_id) = scope.project_id() {
        ensure_project(tx, project_id)?;
    }
    let key = scope.record_key();
    if !tx.exists(&key.root())? {
        tx.set(&key.root(), &ContextBody::default().to_value()?)?;
    }
    Ok(key)
}

fn bump_version(tx: &mut dyn StorageTx, key: &RecordKey) -> Result<u64> {
    let version_path = key.at(JsonPath::key(ContextBody::VERSION));
    let current = tx
        .get_opt(&version_path)?
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let next = current + 1;
    tx.set(&version_path, &json!(next))?;
    tx.set(
        &key.at(JsonPath::key(ContextBody::UPDATED_AT)),
        &serde_json::to_value(Utc::now())?,
    )?;
    Ok(next)
}
