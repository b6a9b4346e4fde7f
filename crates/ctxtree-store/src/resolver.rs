//! Inheritance Resolver
//!
//! Global ⊕ Project ⊕ Task, most specific scope wins per key. The three
//! versions and record generations (and, on a cache miss, the three data
//! maps) are read inside one read transaction, so a concurrent write is seen
//! entirely or not at all.
//! Merging and cache population happen after the transaction returns.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;

use ctxtree_core::{
    layer, ContextBody, CtxError, EffectiveContext, JsonPath, RecordKey, Result, ScopeKey,
    VersionSet,
};

use crate::adapter::{Storage, StorageTx};
use crate::cache::{CacheKey, ContextCache};

enum Snapshot {
    Hit(Arc<EffectiveContext>),
    Miss(CacheKey, [Value; 3]),
}

#[derive(Clone)]
pub struct Resolver {
    storage: Storage,
    cache: Arc<ContextCache>,
}

impl Resolver {
    pub fn new(storage: Storage, cache: Arc<ContextCache>) -> Self {
        Self { storage, cache }
    }

    pub fn cache(&self) -> &ContextCache {
        &self.cache
    }

    /// Effective context for one task.
    ///
    /// `NotFound` if the project is unknown, or if neither the task nor a
    /// context for it exists.
    pub fn resolve(
        &self,
        project_id: &str,
        task_tree_id: &str,
        task_id: &str,
    ) -> Result<Arc<EffectiveContext>> {
        ScopeKey::task(project_id, task_tree_id, task_id).validate()?;

        let global_key = RecordKey::global();
        let project_key = RecordKey::project(project_id);
        let task_ctx_key = RecordKey::task_context(project_id, task_tree_id, task_id);
        let task_key = RecordKey::task(project_id, task_tree_id, task_id);

        let snapshot = self.storage.read_transaction(|tx| {
            let (global, global_gen) = stamp_of(tx, &global_key)?.unwrap_or((0, 0));
            let (project, project_gen) = stamp_of(tx, &project_key)?
                .ok_or_else(|| CtxError::NotFound(format!("project {}", project_id)))?;
            let (task, task_gen) = match stamp_of(tx, &task_ctx_key)? {
                Some(stamp) => stamp,
                None if tx.exists(&task_key.root())? => (0, 0),
                None => {
                    return Err(CtxError::NotFound(format!(
                        "task {}/{}/{}",
                        project_id, task_tree_id, task_id
                    )))
                }
            };

            let key = CacheKey {
                project_id: project_id.to_string(),
                task_tree_id: task_tree_id.to_string(),
                task_id: task_id.to_string(),
                versions: VersionSet {
                    global,
                    project,
                    task,
                },
                generations: [global_gen, project_gen, task_gen],
            };
            if let Some(hit) = self.cache.get(&key) {
                return Ok(Snapshot::Hit(hit));
            }

            let layers = [
                data_of(tx, &global_key)?,
                data_of(tx, &project_key)?,
                data_of(tx, &task_ctx_key)?,
            ];
            Ok(Snapshot::Miss(key, layers))
        })?;

        match snapshot {
            Snapshot::Hit(hit) => Ok(hit),
            Snapshot::Miss(key, [global, project, task]) => {
                let effective = Arc::new(EffectiveContext {
                    project_id: key.project_id.clone(),
                    task_tree_id: key.task_tree_id.clone(),
                    task_id: key.task_id.clone(),
                    data: layer(&[&global, &project, &task]),
                    versions: key.versions,
                });
                debug!(
                    project_id,
                    task_tree_id,
                    task_id,
                    global = key.versions.global,
                    project = key.versions.project,
                    task = key.versions.task,
                    "resolved effective context"
                );
                self.cache.insert(key, effective.clone());
                Ok(effective)
            }
        }
    }
}

/// Stored version and generation of a context record; `None` if the record
/// is absent.
fn stamp_of(tx: &mut dyn StorageTx, key: &RecordKey) -> Result<Option<(u64, i64)>> {
    let Some(generation) = tx.generation(key)? else {
        return Ok(None);
    };
    let version = tx
        .get_opt(&key.at(JsonPath::key(ContextBody::VERSION)))?
        .and_then(|version| version.as_u64())
        .unwrap_or(0);
    Ok(Some((version, generation)))
}

/// Data map of a context record; an empty object if absent.
fn data_of(tx: &mut dyn StorageTx, key: &RecordKey) -> Result<Value> {
    Ok(tx
        .get_opt(&key.at(JsonPath::key(ContextBody::DATA)))?
        .unwrap_or_else(|| json!({})))
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::contexts::ContextStore;
    use ctxtree_core::CacheConfig;

    fn setup() -> (ContextStore, Resolver) {
        let storage = Storage::sqlite_in_memory().unwrap();
        let cache = Arc::new(ContextCache::new(&CacheConfig::default()));
        (
            ContextStore::new(storage.clone()),
            Resolver::new(storage, cache),
        )
    }

    #[test]
    fn test_scenario_most_specific_wins() {
        let (contexts, resolver) = setup();
        contexts
            .write_context(&ScopeKey::global(), &json!({"theme": "dark"}))
            .unwrap();
        contexts
            .write_context(&ScopeKey::project("p1"), &json!({"theme": "light", "retries": 3}))
            .unwrap();
        contexts
            .write_context(&ScopeKey::task("p1", "tree-a", "t1"), &json!({"retries": 5}))
            .unwrap();

        let ctx = resolver.resolve("p1", "tree-a", "t1").unwrap();
        assert_eq!(ctx.data, json!({"theme": "light", "retries": 5}));
        assert_eq!(
            ctx.versions,
            VersionSet {
                global: 1,
                project: 1,
                task: 1
            }
        );
    }

    #[test]
    fn test_unknown_scopes_are_not_found() {
        let (contexts, resolver) = setup();
        assert!(matches!(
            resolver.resolve("p1", "tree", "t1"),
            Err(CtxError::NotFound(_))
        ));
        contexts.touch_project("p1").unwrap();
        // project known, but no task and no task context
        assert!(matches!(
            resolver.resolve("p1", "tree", "t1"),
            Err(CtxError::NotFound(_))
        ));
    }

    #[test]
    fn test_cache_hit_until_write() {
        let (contexts, resolver) = setup();
        let scope = ScopeKey::task("p1", "tree", "t1");
        contexts.write_context(&scope, &json!({"a": 1})).unwrap();

        let first = resolver.resolve("p1", "tree", "t1").unwrap();
        let second = resolver.resolve("p1", "tree", "t1").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(resolver.cache().stats().hits, 1);

        contexts
            .write_context(&ScopeKey::global(), &json!({"b": 2}))
            .unwrap();
        let third = resolver.resolve("p1", "tree", "t1").unwrap();
        assert_eq!(third.data, json!({"a": 1, "b": 2}));
        assert_eq!(third.versions.global, 1);
    }
}
