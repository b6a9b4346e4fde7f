//! Cross-store migration integration tests

mod common;

use ctxtree_core::{CtxError, RecordKey, RecordKind, Result, ScopeKey, StoreConfig};
use ctxtree_store::{migrate, CancelFlag, Checkpoint, ContextTree, MigrationOptions, Storage};
use serde_json::{json, Value};
use tempfile::TempDir;

use common::{file_config, seed_projects};

const PROJECTS: [&str; 3] = ["alpha", "beta", "gamma"];

fn seeded_source(dir: &TempDir) -> StoreConfig {
    let config = file_config(dir.path(), "source.db");
    let tree = ContextTree::open(&config).unwrap();
    seed_projects(&tree, &PROJECTS);
    config
}

/// Every task and context visible through `tree`, for comparison.
fn snapshot(tree: &ContextTree) -> Value {
    let mut projects = serde_json::Map::new();
    for project in tree.list_projects().unwrap() {
        let mut trees = serde_json::Map::new();
        for tree_id in tree.list_trees(&project).unwrap() {
            let tasks = tree.list_tasks(&project, &tree_id).unwrap();
            let mut contexts = serde_json::Map::new();
            for task in &tasks {
                let ctx = tree.resolve_context(&project, &tree_id, &task.id).unwrap();
                contexts.insert(task.id.clone(), ctx.data.clone());
            }
            trees.insert(
                tree_id,
                json!({"tasks": serde_json::to_value(&tasks).unwrap(), "effective": contexts}),
            );
        }
        let data = tree.get_context(&ScopeKey::project(&project)).unwrap().data;
        projects.insert(project, json!({"data": data, "trees": trees}));
    }
    let global = tree.get_context(&ScopeKey::global()).unwrap().data;
    json!({"global": global, "projects": projects})
}

#[test]
fn test_round_trip_between_files() {
    let dir = TempDir::new().unwrap();
    let source = seeded_source(&dir);
    let dest = file_config(dir.path(), "dest.db");

    let report = migrate(&source, &dest, MigrationOptions::default())
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(report.succeeded, PROJECTS);
    assert!(report.records_copied > 0);

    let source_tree = ContextTree::open(&source).unwrap();
    let dest_tree = ContextTree::open(&dest).unwrap();
    assert_eq!(snapshot(&source_tree), snapshot(&dest_tree));
    assert_eq!(Checkpoint::load(dest_tree.storage()).unwrap(), None);
}

#[test]
fn test_same_store_is_rejected() {
    let dir = TempDir::new().unwrap();
    let config = file_config(dir.path(), "one.db");
    assert!(matches!(
        migrate(&config, &config, MigrationOptions::default()),
        Err(CtxError::Config(_))
    ));
}

#[test]
fn test_cancel_then_resume_completes() {
    let dir = TempDir::new().unwrap();
    let source = seeded_source(&dir);
    let dest = file_config(dir.path(), "dest.db");

    let flag = CancelFlag::new();
    let trigger = flag.clone();
    let options = MigrationOptions::default().with_cancel(flag).with_transform(
        move |key: &RecordKey, body: Value| -> Result<Value> {
            if key.project_id == "beta" {
                trigger.cancel();
            }
            Ok(body)
        },
    );
    let first = migrate(&source, &dest, options).unwrap();
    assert!(first.cancelled);
    assert_eq!(first.succeeded, ["alpha", "beta"]);

    let dest_storage = Storage::open(&dest).unwrap();
    let checkpoint = Checkpoint::load(&dest_storage).unwrap().unwrap();
    assert_eq!(checkpoint.last_project_id.as_deref(), Some("beta"));
    drop(dest_storage);

    let second = migrate(&source, &dest, MigrationOptions::default().resume()).unwrap();
    assert_eq!(second.run_id, first.run_id);
    assert_eq!(second.skipped, ["alpha", "beta"]);
    assert_eq!(second.succeeded, ["gamma"]);
    assert!(!second.is_partial_failure());

    let source_tree = ContextTree::open(&source).unwrap();
    let dest_tree = ContextTree::open(&dest).unwrap();
    assert_eq!(snapshot(&source_tree), snapshot(&dest_tree));
}

#[test]
fn test_resume_retries_failed_projects() {
    let dir = TempDir::new().unwrap();
    let source = seeded_source(&dir);
    let dest = file_config(dir.path(), "dest.db");

    let failing = MigrationOptions::default().with_transform(
        |key: &RecordKey, body: Value| -> Result<Value> {
            if key.project_id == "beta" && key.kind == RecordKind::TaskContext {
                return Err(CtxError::InvalidInput("unsupported context".into()));
            }
            Ok(body)
        },
    );
    let first = migrate(&source, &dest, failing).unwrap();
    assert_eq!(first.succeeded, ["alpha", "gamma"]);
    assert_eq!(first.failed.len(), 1);
    assert!(first.is_partial_failure());

    // the failed project left nothing half-written behind
    let dest_tree = ContextTree::open(&dest).unwrap();
    assert!(matches!(
        dest_tree.list_tasks("beta", "main"),
        Err(CtxError::NotFound(_))
    ));
    drop(dest_tree);

    let second = migrate(&source, &dest, MigrationOptions::default().resume()).unwrap();
    assert_eq!(second.skipped, ["alpha", "gamma"]);
    assert_eq!(second.succeeded, ["beta"]);
    assert!(second.into_result().is_ok());
}

#[test]
fn test_resumed_run_reports_drift_in_skipped_project() {
    let dir = TempDir::new().unwrap();
    let source = seeded_source(&dir);
    let dest = file_config(dir.path(), "dest.db");

    let flag = CancelFlag::new();
    let trigger = flag.clone();
    let options = MigrationOptions::default().with_cancel(flag).with_transform(
        move |key: &RecordKey, body: Value| -> Result<Value> {
            if key.project_id == "alpha" {
                trigger.cancel();
            }
            Ok(body)
        },
    );
    assert!(migrate(&source, &dest, options).unwrap().cancelled);

    let dest_tree = ContextTree::open(&dest).unwrap();
    dest_tree
        .write_context(&ScopeKey::project("alpha"), &json!({"owner": "someone-else"}))
        .unwrap();
    drop(dest_tree);

    let resumed = migrate(&source, &dest, MigrationOptions::default().resume()).unwrap();
    assert_eq!(resumed.skipped, ["alpha"]);
    assert_eq!(resumed.succeeded, ["beta", "gamma"]);
    assert_eq!(resumed.mismatches.len(), 1);
    assert_eq!(resumed.mismatches[0].key, RecordKey::project("alpha"));
    assert!(resumed.is_partial_failure());

    let dest_storage = Storage::open(&dest).unwrap();
    assert!(Checkpoint::load(&dest_storage).unwrap().is_some());
    match resumed.into_result() {
        Err(CtxError::MigrationPartialFailure { failed, mismatches }) => {
            assert!(failed.is_empty());
            assert_eq!(mismatches, 1);
        }
        other => panic!("expected partial failure, got {other:?}"),
    }
}

#[test]
fn test_fresh_run_ignores_old_checkpoint() {
    let dir = TempDir::new().unwrap();
    let source = seeded_source(&dir);
    let dest = file_config(dir.path(), "dest.db");

    let flag = CancelFlag::new();
    flag.cancel();
    let cancelled = migrate(&source, &dest, MigrationOptions::default().with_cancel(flag)).unwrap();
    assert!(cancelled.cancelled);
    assert!(cancelled.succeeded.is_empty());

    let full = migrate(&source, &dest, MigrationOptions::default()).unwrap();
    assert_ne!(full.run_id, cancelled.run_id);
    assert_eq!(full.succeeded, PROJECTS);
    assert!(full.skipped.is_empty());
}

#[cfg(feature = "postgres")]
#[test]
#[ignore = "needs CTXTREE_TEST_POSTGRES_URL"]
fn test_sqlite_to_postgres_round_trip() {
    let Ok(url) = std::env::var("CTXTREE_TEST_POSTGRES_URL") else {
        return;
    };
    let dir = TempDir::new().unwrap();
    let source = seeded_source(&dir);
    let dest = StoreConfig::postgres(url);

    let dest_tree = ContextTree::open(&dest).unwrap();
    for project in PROJECTS {
        let _ = dest_tree.delete_project(project);
    }

    let report = migrate(&source, &dest, MigrationOptions::default()).unwrap();
    assert!(!report.is_partial_failure(), "{:?}", report);

    let source_tree = ContextTree::open(&source).unwrap();
    assert_eq!(snapshot(&source_tree), snapshot(&dest_tree));
}
