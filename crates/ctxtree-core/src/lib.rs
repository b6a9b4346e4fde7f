//! ctxtree core - data model for the hierarchical context and task-tree store
//!
//! This crate holds everything that does not touch a database:
//!
//! - **Scope**: the Global → Project → Task inheritance chain and its context records
//! - **Task**: task records, status transitions and input/patch types
//! - **Record**: the `(kind, project_id, task_tree_id, task_id)` identity every
//!   persisted entity is addressed by, on every backend
//! - **Path**: dotted/bracket JSON path expressions (`a.b[0]["x.y"]`)
//! - **Merge**: deep merge with most-specific-wins and whole-array replacement
//! - **Config**: backend selection, cache sizing and retry policy
//! - **Error**: the error taxonomy shared by every layer
//!
//! # Inheritance
//!
//! ```text
//! Global ⊕ Project ⊕ Task → EffectiveContext
//!   L1       L2       L3
//! ```

pub mod config;
pub mod error;
pub mod ids;
pub mod merge;
pub mod path;
pub mod record;
pub mod scope;
pub mod task;

pub use config::{BackendConfig, BackendKind, CacheConfig, RetryConfig, StoreConfig};
pub use error::{CtxError, Result};
pub use merge::{deep_merge, layer};
pub use path::{JsonPath, JsonType, Lookup, Segment};
pub use record::{RecordFilter, RecordKey, RecordKind, StoragePath, StoredRecord};
pub use scope::{ContextBody, ContextRecord, EffectiveContext, Scope, ScopeKey, VersionSet};
pub use task::{NewTask, Priority, Task, TaskPatch, TaskStatus};
