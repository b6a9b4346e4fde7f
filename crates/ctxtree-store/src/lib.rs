//! ctxtree store - persistence, resolution and migration
//!
//! Layers, bottom up:
//!
//! - [`adapter`]: the `Storage` handle over one backend (SQLite or Postgres),
//!   path-addressed get/set/merge/delete and retrying transactions
//! - [`contexts`]: Global / Project / Task context records
//! - [`tasks`]: task trees and their dependency DAG
//! - [`resolver`] + [`cache`]: effective contexts, cached by version tuple
//! - [`migrate`]: checkpointed copy between two stores
//! - [`tree`]: the [`ContextTree`] facade over all of the above
//!
//! ```no_run
//! use ctxtree_store::ContextTree;
//! use ctxtree_core::{ScopeKey, StoreConfig};
//! use serde_json::json;
//!
//! # fn main() -> ctxtree_core::Result<()> {
//! let tree = ContextTree::open(&StoreConfig::load_default()?)?;
//! tree.write_context(&ScopeKey::global(), &json!({"theme": "dark"}))?;
//! tree.write_context(&ScopeKey::task("p1", "tree-a", "t1"), &json!({"retries": 5}))?;
//! let ctx = tree.resolve_context("p1", "tree-a", "t1")?;
//! assert_eq!(ctx.data, json!({"theme": "dark", "retries": 5}));
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod cache;
pub mod contexts;
pub mod migrate;
pub mod resolver;
pub mod schema;
pub mod tasks;
pub mod tree;

mod sql;

#[cfg(feature = "postgres")]
pub mod pg;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use adapter::{Backend, Storage, StorageTx, TxMode};
pub use cache::{CacheStats, ContextCache};
pub use contexts::ContextStore;
pub use migrate::{
    migrate, migrate_between, CancelFlag, Checkpoint, MigrationOptions, MigrationReport,
    MigrationStage, Mismatch, RecordTransform,
};
pub use resolver::Resolver;
pub use tasks::TaskStore;
pub use tree::ContextTree;

#[cfg(feature = "postgres")]
pub use pg::PgBackend;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteBackend;
