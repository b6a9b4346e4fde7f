//! `ContextTree`, the single entry point collaborators hold.
//!
//! One [`Storage`], one resolver cache, and the context and task stores over
//! them. Deletes purge this handle's cache for what they removed; other
//! handles drop those entries through the record generation in the key.

use std::sync::Arc;

use serde_json::{Map, Value};

use ctxtree_core::{
    ContextRecord, EffectiveContext, NewTask, Result, Scope, ScopeKey, StoreConfig, Task,
    TaskPatch, TaskStatus,
};

use crate::adapter::Storage;
use crate::cache::{CacheStats, ContextCache};
use crate::contexts::ContextStore;
use crate::migrate::{self, MigrationOptions, MigrationReport};
use crate::resolver::Resolver;
use crate::tasks::TaskStore;

/// Hierarchical context and task-tree store
#[derive(Clone)]
pub struct ContextTree {
    storage: Storage,
    contexts: ContextStore,
    tasks: TaskStore,
    resolver: Resolver,
}

impl std::fmt::Debug for ContextTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextTree")
            .field("storage", &self.storage)
            .field("cache", &self.resolver.cache().stats())
            .finish()
    }
}

impl ContextTree {
    /// Open the backend named in `config`.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let storage = Storage::open(config)?;
        let cache = Arc::new(ContextCache::new(&config.cache));
        Ok(Self::with_storage(storage, cache))
    }

    /// Fresh in-memory SQLite store (for testing).
    #[cfg(feature = "sqlite")]
    pub fn open_in_memory() -> Result<Self> {
        Self::open(&StoreConfig::sqlite_in_memory())
    }

    pub fn with_storage(storage: Storage, cache: Arc<ContextCache>) -> Self {
        Self {
            contexts: ContextStore::new(storage.clone()),
            tasks: TaskStore::new(storage.clone()),
            resolver: Resolver::new(storage.clone(), cache),
            storage,
        }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    // Contexts

    pub fn resolve_context(
        &self,
        project_id: &str,
        task_tree_id: &str,
        task_id: &str,
    ) -> Result<Arc<EffectiveContext>> {
        self.resolver.resolve(project_id, task_tree_id, task_id)
    }

    pub fn write_context(&self, scope: &ScopeKey, patch: &Value) -> Result<u64> {
        self.contexts.write_context(scope, patch)
    }

    /// [`ContextTree::write_context`] with the scope given as loose parts.
    pub fn write_context_at(
        &self,
        scope: Scope,
        project_id: Option<&str>,
        task_tree_id: Option<&str>,
        task_id: Option<&str>,
        patch: &Value,
    ) -> Result<u64> {
        let scope = ScopeKey::from_parts(scope, project_id, task_tree_id, task_id)?;
        self.contexts.write_context(&scope, patch)
    }

    pub fn replace_context(&self, scope: &ScopeKey, data: Map<String, Value>) -> Result<u64> {
        self.contexts.replace_context(scope, data)
    }

    pub fn get_context(&self, scope: &ScopeKey) -> Result<ContextRecord> {
        self.contexts.get_context(scope)
    }

    pub fn read_context_value(&self, scope: &ScopeKey, expr: &str) -> Result<Value> {
        self.contexts.read_context_value(scope, expr)
    }

    pub fn delete_context_key(&self, scope: &ScopeKey, expr: &str) -> Result<u64> {
        self.contexts.delete_context_key(scope, expr)
    }

    pub fn delete_task_context(&self, scope: &ScopeKey) -> Result<bool> {
        let removed = self.contexts.delete_task_context(scope)?;
        if let ScopeKey::Task {
            project_id,
            task_tree_id,
            task_id,
        } = scope
        {
            self.resolver
                .cache()
                .purge_task(project_id, task_tree_id, task_id);
        }
        Ok(removed)
    }

    // Projects

    pub fn touch_project(&self, project_id: &str) -> Result<()> {
        self.contexts.touch_project(project_id)
    }

    pub fn list_projects(&self) -> Result<Vec<String>> {
        self.contexts.list_projects()
    }

    pub fn list_trees(&self, project_id: &str) -> Result<Vec<String>> {
        self.contexts.list_trees(project_id)
    }

    pub fn delete_project(&self, project_id: &str) -> Result<usize> {
        let removed = self.contexts.delete_project(project_id)?;
        self.resolver.cache().purge_project(project_id);
        Ok(removed)
    }

    // Tasks

    pub fn create_task(&self, project_id: &str, task_tree_id: &str, task: NewTask) -> Result<Task> {
        self.tasks.create_task(project_id, task_tree_id, task)
    }

    pub fn create_tasks(
        &self,
        project_id: &str,
        task_tree_id: &str,
        batch: Vec<NewTask>,
    ) -> Result<Vec<Task>> {
        self.tasks.create_tasks(project_id, task_tree_id, batch)
    }

    pub fn get_task(&self, project_id: &str, task_tree_id: &str, task_id: &str) -> Result<Task> {
        self.tasks.get_task(project_id, task_tree_id, task_id)
    }

    pub fn update_status(
        &self,
        project_id: &str,
        task_tree_id: &str,
        task_id: &str,
        status: TaskStatus,
    ) -> Result<Task> {
        self.tasks
            .update_status(project_id, task_tree_id, task_id, status)
    }

    pub fn reopen_task(&self, project_id: &str, task_tree_id: &str, task_id: &str) -> Result<Task> {
        self.tasks.reopen(project_id, task_tree_id, task_id)
    }

    pub fn update_task(
        &self,
        project_id: &str,
        task_tree_id: &str,
        task_id: &str,
        patch: &TaskPatch,
    ) -> Result<Task> {
        self.tasks
            .update_task(project_id, task_tree_id, task_id, patch)
    }

    pub fn add_dependency(
        &self,
        project_id: &str,
        task_tree_id: &str,
        task_id: &str,
        dependency: &str,
    ) -> Result<Task> {
        self.tasks
            .add_dependency(project_id, task_tree_id, task_id, dependency)
    }

    pub fn remove_dependency(
        &self,
        project_id: &str,
        task_tree_id: &str,
        task_id: &str,
        dependency: &str,
    ) -> Result<Task> {
        self.tasks
            .remove_dependency(project_id, task_tree_id, task_id, dependency)
    }

    /// Delete a task and its context. See [`TaskStore::delete_task`].
    pub fn delete_task(
        &self,
        project_id: &str,
        task_tree_id: &str,
        task_id: &str,
        cascade: bool,
    ) -> Result<Vec<String>> {
        let pruned = self
            .tasks
            .delete_task(project_id, task_tree_id, task_id, cascade)?;
        self.resolver
            .cache()
            .purge_task(project_id, task_tree_id, task_id);
        Ok(pruned)
    }

    pub fn list_tasks(&self, project_id: &str, task_tree_id: &str) -> Result<Vec<Task>> {
        self.tasks.list_tasks(project_id, task_tree_id)
    }

    // Maintenance

    pub fn cache_stats(&self) -> CacheStats {
        self.resolver.cache().stats()
    }

    /// Copy everything in this store into `dest`.
    pub fn migrate_to(&self, dest: &ContextTree, options: MigrationOptions) -> Result<MigrationReport> {
        let report = migrate::migrate_between(&self.storage, &dest.storage, options)?;
        dest.resolver.cache().clear();
        Ok(report)
    }
}
