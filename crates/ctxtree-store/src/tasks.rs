//! Task Tree Store
//!
//! Tasks are partitioned by `(project_id, task_tree_id)`; ids are unique
//! within a tree. Dependencies name task ids anywhere in the same project and
//! must form a DAG, checked with a topological sort over the project's whole
//! dependency graph.

use std::collections::{BTreeSet, HashSet};

use chrono::Utc;
use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use tracing::{debug, info};

use ctxtree_core::{
    CtxError, NewTask, RecordFilter, RecordKey, RecordKind, Result, ScopeKey, Task, TaskPatch,
    TaskStatus,
};

use crate::adapter::{Storage, StorageTx};
use crate::contexts::{ensure_project, require_project};

/// Task CRUD over a [`Storage`]
#[derive(Debug, Clone)]
pub struct TaskStore {
    storage: Storage,
}

impl TaskStore {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    pub fn create_task(&self, project_id: &str, task_tree_id: &str, task: NewTask) -> Result<Task> {
        self.create_tasks(project_id, task_tree_id, vec![task])?
            .pop()
            .ok_or_else(|| CtxError::Backend("batch insert returned no task".to_string()))
    }

    /// Create several tasks atomically. Dependencies may point at tasks in
    /// the same batch; either every task is created or none is.
    pub fn create_tasks(
        &self,
        project_id: &str,
        task_tree_id: &str,
        batch: Vec<NewTask>,
    ) -> Result<Vec<Task>> {
        validate_tree(project_id, task_tree_id)?;
        let mut batch_ids = HashSet::new();
        for new in &batch {
            new.validate()?;
            if !batch_ids.insert(new.id.as_str()) {
                return Err(CtxError::DuplicateId(format!(
                    "{}/{}/{} appears twice in the batch",
                    project_id, task_tree_id, new.id
                )));
            }
        }
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let created = self.storage.transaction(|tx| {
            ensure_project(tx, project_id)?;
            let existing = project_tasks(tx, project_id)?;

            for new in &batch {
                if existing
                    .iter()
                    .any(|t| t.task_tree_id == task_tree_id && t.id == new.id)
                {
                    return Err(CtxError::DuplicateId(format!(
                        "{}/{}/{}",
                        project_id, task_tree_id, new.id
                    )));
                }
            }

            let known: HashSet<&str> = existing
                .iter()
                .map(|t| t.id.as_str())
                .chain(batch.iter().map(|n| n.id.as_str()))
                .collect();
            for new in &batch {
                if let Some(missing) = new.dependencies.iter().find(|d| !known.contains(d.as_str())) {
                    return Err(CtxError::InvalidDependency(format!(
                        "task {} depends on unknown task {} in project {}",
                        new.id, missing, project_id
                    )));
                }
            }

            check_acyclic(
                existing
                    .iter()
                    .map(|t| (t.id.as_str(), &t.dependencies))
                    .chain(batch.iter().map(|n| (n.id.as_str(), &n.dependencies))),
            )?;

            let now = Utc::now();
            let mut created = Vec::with_capacity(batch.len());
            for new in &batch {
                let task = Task::from_new(project_id, task_tree_id, new.clone(), now);
                save_task(tx, &task)?;
                created.push(task);
            }
            Ok(created)
        })?;

        debug!(project_id, task_tree_id, count = created.len(), "tasks created");
        Ok(created)
    }

    pub fn get_task(&self, project_id: &str, task_tree_id: &str, task_id: &str) -> Result<Task> {
        let key = task_key(project_id, task_tree_id, task_id)?;
        self.storage.read_transaction(|tx| load_task(tx, &key))
    }

    /// Move a task along the status table. Leaving `done` needs
    /// [`TaskStore::reopen`].
    pub fn update_status(
        &self,
        project_id: &str,
        task_tree_id: &str,
        task_id: &str,
        status: TaskStatus,
    ) -> Result<Task> {
        let key = task_key(project_id, task_tree_id, task_id)?;
        self.storage.transaction(|tx| {
            let mut task = load_task(tx, &key)?;
            if task.status == status {
                return Ok(task);
            }
            if !task.status.can_transition_to(status) {
                return Err(CtxError::InvalidTransition {
                    from: task.status,
                    to: status,
                });
            }
            task.status = status;
            task.updated_at = Utc::now();
            save_task(tx, &task)?;
            Ok(task)
        })
    }

    /// `done → todo`, the only way out of `done`.
    pub fn reopen(&self, project_id: &str, task_tree_id: &str, task_id: &str) -> Result<Task> {
        let key = task_key(project_id, task_tree_id, task_id)?;
        self.storage.transaction(|tx| {
            let mut task = load_task(tx, &key)?;
            if task.status != TaskStatus::Done {
                return Err(CtxError::InvalidTransition {
                    from: task.status,
                    to: TaskStatus::Todo,
                });
            }
            task.status = TaskStatus::Todo;
            task.updated_at = Utc::now();
            save_task(tx, &task)?;
            Ok(task)
        })
    }

    pub fn update_task(
        &self,
        project_id: &str,
        task_tree_id: &str,
        task_id: &str,
        patch: &TaskPatch,
    ) -> Result<Task> {
        patch.validate()?;
        let key = task_key(project_id, task_tree_id, task_id)?;
        self.storage.transaction(|tx| {
            let mut task = load_task(tx, &key)?;
            if patch.apply(&mut task) {
                task.updated_at = Utc::now();
                save_task(tx, &task)?;
            }
            Ok(task)
        })
    }

    pub fn add_dependency(
        &self,
        project_id: &str,
        task_tree_id: &str,
        task_id: &str,
        dependency: &str,
    ) -> Result<Task> {
        let key = task_key(project_id, task_tree_id, task_id)?;
        ctxtree_core::ids::validate_id("dependency id", dependency)?;
        self.storage.transaction(|tx| {
            let mut task = load_task(tx, &key)?;
            if task.depends_on(dependency) {
                return Ok(task);
            }
            let tasks = project_tasks(tx, project_id)?;
            if !tasks.iter().any(|t| t.id == dependency) {
                return Err(CtxError::InvalidDependency(format!(
                    "task {} depends on unknown task {} in project {}",
                    task_id, dependency, project_id
                )));
            }
            task.dependencies.insert(dependency.to_string());
            check_acyclic(tasks.iter().map(|t| {
                if t.task_tree_id == task.task_tree_id && t.id == task.id {
                    (task.id.as_str(), &task.dependencies)
                } else {
                    (t.id.as_str(), &t.dependencies)
                }
            }))?;
            task.updated_at = Utc::now();
            save_task(tx, &task)?;
            Ok(task)
        })
    }

    pub fn remove_dependency(
        &self,
        project_id: &str,
        task_tree_id: &str,
        task_id: &str,
        dependency: &str,
    ) -> Result<Task> {
        let key = task_key(project_id, task_tree_id, task_id)?;
        self.storage.transaction(|tx| {
            let mut task = load_task(tx, &key)?;
            if task.dependencies.remove(dependency) {
                task.updated_at = Utc::now();
                save_task(tx, &task)?;
            }
            Ok(task)
        })
    }

    /// Delete a task and its context.
    ///
    /// Fails with `HasDependents` while other tasks in the project depend on
    /// it, unless `cascade` is set; then their dependency lists are pruned.
    /// Returns the ids of the pruned dependents.
    pub fn delete_task(
        &self,
        project_id: &str,
        task_tree_id: &str,
        task_id: &str,
        cascade: bool,
    ) -> Result<Vec<String>> {
        let key = task_key(project_id, task_tree_id, task_id)?;
        let pruned = self.storage.transaction(|tx| {
            load_task(tx, &key)?;
            let tasks = project_tasks(tx, project_id)?;

            // another tree still provides this id, so dependents stay satisfied
            let provided_elsewhere = tasks
                .iter()
                .any(|t| t.id == task_id && t.task_tree_id != task_tree_id);
            let dependents: Vec<Task> = if provided_elsewhere {
                Vec::new()
            } else {
                tasks
                    .into_iter()
                    .filter(|t| t.depends_on(task_id))
                    .filter(|t| !(t.id == task_id && t.task_tree_id == task_tree_id))
                    .collect()
            };

            if !dependents.is_empty() && !cascade {
                return Err(CtxError::HasDependents {
                    task_id: task_id.to_string(),
                    dependents: dependents.iter().map(|t| t.id.clone()).collect(),
                });
            }

            let now = Utc::now();
            let mut pruned = Vec::with_capacity(dependents.len());
            for mut dependent in dependents {
                dependent.dependencies.remove(task_id);
                dependent.updated_at = now;
                save_task(tx, &dependent)?;
                pruned.push(dependent.id);
            }

            tx.delete(&key.root())?;
            tx.delete(&RecordKey::task_context(project_id, task_tree_id, task_id).root())?;
            Ok(pruned)
        })?;

        info!(
            project_id,
            task_tree_id,
            task_id,
            pruned = pruned.len(),
            "task deleted"
        );
        Ok(pruned)
    }

    /// Tasks of one tree in insertion order.
    pub fn list_tasks(&self, project_id: &str, task_tree_id: &str) -> Result<Vec<Task>> {
        validate_tree(project_id, task_tree_id)?;
        self.storage.read_transaction(|tx| {
            require_project(tx, project_id)?;
            tx.list(
                &RecordFilter::kind(RecordKind::Task)
                    .in_project(project_id)
                    .in_tree(task_tree_id),
            )?
            .into_iter()
            .map(|record| Ok(serde_json::from_value(record.body)?))
            .collect()
        })
    }
}

fn validate_tree(project_id: &str, task_tree_id: &str) -> Result<()> {
    ctxtree_core::ids::validate_id("project_id", project_id)?;
    ctxtree_core::ids::validate_id("task_tree_id", task_tree_id)
}

fn task_key(project_id: &str, task_tree_id: &str, task_id: &str) -> Result<RecordKey> {
    ScopeKey::task(project_id, task_tree_id, task_id).validate()?;
    Ok(RecordKey::task(project_id, task_tree_id, task_id))
}

fn load_task(tx: &mut dyn StorageTx, key: &RecordKey) -> Result<Task> {
    match tx.get_record(key)? {
        Some(body) => Ok(serde_json::from_value(body)?),
        None => Err(CtxError::NotFound(format!(
            "task {}/{}/{}",
            key.project_id, key.task_tree_id, key.task_id
        ))),
    }
}

fn save_task(tx: &mut dyn StorageTx, task: &Task) -> Result<()> {
    tx.set(&task.record_key().root(), &serde_json::to_value(task)?)
}

/// Every task in a project, all trees, in insertion order.
fn project_tasks(tx: &mut dyn StorageTx, project_id: &str) -> Result<Vec<Task>> {
    tx.list(&RecordFilter::kind(RecordKind::Task).in_project(project_id))?
        .into_iter()
        .map(|record| Ok(serde_json::from_value(record.body)?))
        .collect()
}

/// Reject dependency graphs that do not admit a topological order.
fn check_acyclic<'a>(
    tasks: impl Iterator<Item = (&'a str, &'a BTreeSet<String>)>,
) -> Result<()> {
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for (id, dependencies) in tasks {
        graph.add_node(id);
        for dependency in dependencies {
            graph.add_edge(dependency.as_str(), id, ());
        }
    }
    toposort(&graph, None).map(|_| ()).map_err(|cycle| {
        CtxError::InvalidDependency(format!(
            "dependency cycle through task {}",
            cycle.node_id()
        ))
    })
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;

    fn store() -> TaskStore {
        TaskStore::new(Storage::sqlite_in_memory().unwrap())
    }

    #[test]
    fn test_create_and_get() {
        let store = store();
        let created = store
            .create_task("p1", "tree-a", NewTask::new("t1", "Write docs"))
            .unwrap();
        assert_eq!(created.status, TaskStatus::Todo);
        assert_eq!(store.get_task("p1", "tree-a", "t1").unwrap(), created);
        assert!(matches!(
            store.get_task("p1", "tree-b", "t1"),
            Err(CtxError::NotFound(_))
        ));
    }

    #[test]
    fn test_duplicate_id() {
        let store = store();
        store.create_task("p1", "tree", NewTask::new("t1", "A")).unwrap();
        let err = store
            .create_task("p1", "tree", NewTask::new("t1", "B"))
            .unwrap_err();
        assert!(matches!(err, CtxError::DuplicateId(_)));
        // same id in another tree is fine
        store.create_task("p1", "other", NewTask::new("t1", "C")).unwrap();
    }

    #[test]
    fn test_cycle_rejected_atomically() {
        let store = store();
        let batch = vec![
            NewTask::new("a", "A").depends_on("b"),
            NewTask::new("b", "B").depends_on("c"),
            NewTask::new("c", "C").depends_on("a"),
        ];
        let err = store.create_tasks("p1", "tree", batch).unwrap_err();
        assert!(matches!(err, CtxError::InvalidDependency(_)));
        // the project record was touched inside the rolled-back transaction
        assert!(matches!(
            store.list_tasks("p1", "tree"),
            Err(CtxError::NotFound(_))
        ));
    }

    #[test]
    fn test_self_dependency_rejected() {
        let store = store();
        let err = store
            .create_task("p1", "tree", NewTask::new("a", "A").depends_on("a"))
            .unwrap_err();
        assert!(matches!(err, CtxError::InvalidDependency(_)));
    }

    #[test]
    fn test_cross_project_dependency_rejected() {
        let store = store();
        store.create_task("p1", "tree", NewTask::new("t1", "A")).unwrap();
        let err = store
            .create_task("p2", "tree", NewTask::new("t2", "B").depends_on("t1"))
            .unwrap_err();
        assert!(matches!(err, CtxError::InvalidDependency(_)));
    }

    #[test]
    fn test_dependency_across_trees_same_project() {
        let store = store();
        store.create_task("p1", "backend", NewTask::new("api", "API")).unwrap();
        let ui = store
            .create_task("p1", "frontend", NewTask::new("ui", "UI").depends_on("api"))
            .unwrap();
        assert!(ui.depends_on("api"));
    }

    #[test]
    fn test_status_rules() {
        let store = store();
        store.create_task("p1", "tree", NewTask::new("t1", "A")).unwrap();
        store
            .update_status("p1", "tree", "t1", TaskStatus::Blocked)
            .unwrap();
        let err = store
            .update_status("p1", "tree", "t1", TaskStatus::Done)
            .unwrap_err();
        assert!(matches!(err, CtxError::InvalidTransition { .. }));

        store
            .update_status("p1", "tree", "t1", TaskStatus::InProgress)
            .unwrap();
        store.update_status("p1", "tree", "t1", TaskStatus::Done).unwrap();
        // same status is a no-op
        store.update_status("p1", "tree", "t1", TaskStatus::Done).unwrap();
        assert!(store
            .update_status("p1", "tree", "t1", TaskStatus::Todo)
            .is_err());

        let reopened = store.reopen("p1", "tree", "t1").unwrap();
        assert_eq!(reopened.status, TaskStatus::Todo);
        assert!(store.reopen("p1", "tree", "t1").is_err());
    }

    #[test]
    fn test_list_in_insertion_order() {
        let store = store();
        for id in ["t3", "t1", "t2"] {
            store.create_task("p1", "tree", NewTask::new(id, id)).unwrap();
        }
        store
            .update_status("p1", "tree", "t3", TaskStatus::InProgress)
            .unwrap();
        let ids: Vec<String> = store
            .list_tasks("p1", "tree")
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec!["t3", "t1", "t2"]);
        assert!(store.list_tasks("p1", "empty").unwrap().is_empty());
    }

    #[test]
    fn test_delete_with_dependents() {
        let store = store();
        store
            .create_tasks(
                "p1",
                "tree",
                vec![
                    NewTask::new("t1", "A"),
                    NewTask::new("t2", "B").depends_on("t1"),
                ],
            )
            .unwrap();

        match store.delete_task("p1", "tree", "t1", false).unwrap_err() {
            CtxError::HasDependents { dependents, .. } => assert_eq!(dependents, vec!["t2"]),
            other => panic!("unexpected: {other}"),
        }

        let pruned = store.delete_task("p1", "tree", "t1", true).unwrap();
        assert_eq!(pruned, vec!["t2"]);
        assert!(store.get_task("p1", "tree", "t2").unwrap().dependencies.is_empty());
        assert!(store.get_task("p1", "tree", "t1").is_err());
    }

    #[test]
    fn test_add_and_remove_dependency() {
        let store = store();
        store
            .create_tasks(
                "p1",
                "tree",
                vec![NewTask::new("a", "A"), NewTask::new("b", "B").depends_on("a")],
            )
            .unwrap();

        let err = store.add_dependency("p1", "tree", "a", "b").unwrap_err();
        assert!(matches!(err, CtxError::InvalidDependency(_)));
        assert!(store.add_dependency("p1", "tree", "a", "zzz").is_err());

        let b = store.remove_dependency("p1", "tree", "b", "a").unwrap();
        assert!(b.dependencies.is_empty());
        let a = store.add_dependency("p1", "tree", "a", "b").unwrap();
        assert!(a.depends_on("b"));
    }

    #[test]
    fn test_update_task_fields() {
        let store = store();
        store
            .create_task("p1", "tree", NewTask::new("t1", "Draft").with_assignee("kai"))
            .unwrap();
        let patch = TaskPatch {
            title: Some("Final".into()),
            priority: Some(ctxtree_core::Priority::High),
            assignee: Some(None),
            ..Default::default()
        };
        let task = store.update_task("p1", "tree", "t1", &patch).unwrap();
        assert_eq!(task.title, "Final");
        assert_eq!(task.assignee, None);
        assert_eq!(store.get_task("p1", "tree", "t1").unwrap(), task);
    }
}
