//! Concurrent access from several threads

mod common;

use std::sync::Arc;
use std::thread;

use ctxtree_core::{NewTask, ScopeKey};
use ctxtree_store::ContextTree;
use serde_json::json;
use tempfile::TempDir;

use common::file_config;

#[test]
fn test_writers_on_distinct_projects() {
    let dir = TempDir::new().unwrap();
    let tree = Arc::new(ContextTree::open(&file_config(dir.path(), "shared.db")).unwrap());
    tree.write_context(&ScopeKey::global(), &json!({"shared": true}))
        .unwrap();

    let handles: Vec<_> = (0..4)
        .map(|n| {
            let tree = Arc::clone(&tree);
            thread::spawn(move || {
                let project = format!("p{}", n);
                for i in 0..10 {
                    let task_id = format!("t{}", i);
                    tree.create_task(&project, "main", NewTask::new(&task_id, "work"))
                        .unwrap();
                    tree.write_context(
                        &ScopeKey::task(&project, "main", &task_id),
                        &json!({"owner": n, "step": i}),
                    )
                    .unwrap();
                    let ctx = tree.resolve_context(&project, "main", &task_id).unwrap();
                    assert_eq!(ctx.data["owner"], json!(n));
                    assert_eq!(ctx.data["shared"], json!(true));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(tree.list_projects().unwrap().len(), 4);
    for n in 0..4 {
        let tasks = tree.list_tasks(&format!("p{}", n), "main").unwrap();
        assert_eq!(tasks.len(), 10);
        assert_eq!(tasks[0].id, "t0");
    }
}

#[test]
fn test_resolve_never_sees_torn_writes() {
    let tree = Arc::new(ContextTree::open_in_memory().unwrap());
    let scope = ScopeKey::task("p1", "main", "t1");
    tree.write_context(&scope, &json!({"a": 0, "b": 0})).unwrap();

    let writer = {
        let tree = Arc::clone(&tree);
        let scope = scope.clone();
        thread::spawn(move || {
            for i in 1..=50 {
                tree.write_context(&scope, &json!({"a": i, "b": i})).unwrap();
            }
        })
    };
    for _ in 0..50 {
        let ctx = tree.resolve_context("p1", "main", "t1").unwrap();
        assert_eq!(ctx.data["a"], ctx.data["b"]);
    }
    writer.join().unwrap();
}
