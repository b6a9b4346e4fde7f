//! Shared fixtures for store integration tests

use std::path::Path;

use ctxtree_core::{NewTask, ScopeKey, StoreConfig};
use ctxtree_store::ContextTree;
use serde_json::json;

#[allow(dead_code)]
pub fn memory_tree() -> ContextTree {
    ContextTree::open_in_memory().expect("open in-memory store")
}

#[allow(dead_code)]
pub fn file_config(dir: &Path, name: &str) -> StoreConfig {
    StoreConfig::sqlite(dir.join(name))
}

/// Global `{theme: dark}`, project p1 `{theme: light, retries: 3}`, task
/// p1/tree-a/t1 `{retries: 5}`.
#[allow(dead_code)]
pub fn seed_scenario(tree: &ContextTree) {
    tree.write_context(&ScopeKey::global(), &json!({"theme": "dark"}))
        .unwrap();
    tree.write_context(
        &ScopeKey::project("p1"),
        &json!({"theme": "light", "retries": 3}),
    )
    .unwrap();
    tree.write_context(&ScopeKey::task("p1", "tree-a", "t1"), &json!({"retries": 5}))
        .unwrap();
}

/// A few projects, each with a two-task chain and one task context.
#[allow(dead_code)]
pub fn seed_projects(tree: &ContextTree, projects: &[&str]) {
    tree.write_context(&ScopeKey::global(), &json!({"theme": "dark", "limits": {"cpu": 2}}))
        .unwrap();
    for project in projects {
        tree.write_context(&ScopeKey::project(*project), &json!({"owner": project}))
            .unwrap();
        tree.create_tasks(
            project,
            "main",
            vec![
                NewTask::new("build", "Build"),
                NewTask::new("ship", "Ship").depends_on("build"),
            ],
        )
        .unwrap();
        tree.write_context(
            &ScopeKey::task(*project, "main", "ship"),
            &json!({"limits": {"cpu": 8}, "ratio": 0.5}),
        )
        .unwrap();
    }
}
