//! Scope levels and context records
//!
//! ```text
//! Global
//!   └── Project (project_id)
//!         └── Task (project_id, task_tree_id, task_id)
//! ```
//!
//! Scope is positional: a project context belongs to Global because of where
//! it sits in the chain, not because of a stored reference.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CtxError, Result};
use crate::ids::validate_id;
use crate::path::JsonPath;
use crate::record::RecordKey;

/// A level in the inheritance chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Global,
    Project,
    Task,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Global => write!(f, "global"),
            Scope::Project => write!(f, "project"),
            Scope::Task => write!(f, "task"),
        }
    }
}

/// A fully identified scope
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum ScopeKey {
    Global,
    Project {
        project_id: String,
    },
    Task {
        project_id: String,
        task_tree_id: String,
        task_id: String,
    },
}

impl ScopeKey {
    pub fn global() -> Self {
        ScopeKey::Global
    }

    pub fn project(project_id: impl Into<String>) -> Self {
        ScopeKey::Project {
            project_id: project_id.into(),
        }
    }

    pub fn task(
        project_id: impl Into<String>,
        task_tree_id: impl Into<String>,
        task_id: impl Into<String>,
    ) -> Self {
        ScopeKey::Task {
            project_id: project_id.into(),
            task_tree_id: task_tree_id.into(),
            task_id: task_id.into(),
        }
    }

    /// Build a key from a scope level plus whichever ids the caller has.
    ///
    /// Ids the level needs must be present; ids it does not use are ignored.
    pub fn from_parts(
        scope: Scope,
        project_id: Option<&str>,
        task_tree_id: Option<&str>,
        task_id: Option<&str>,
    ) -> Result<Self> {
        let require = |name: &str, value: Option<&str>| {
            value
                .map(str::to_string)
                .ok_or_else(|| CtxError::InvalidInput(format!("{scope} scope requires {name}")))
        };
        let key = match scope {
            Scope::Global => ScopeKey::Global,
            Scope::Project => ScopeKey::Project {
                project_id: require("project_id", project_id)?,
            },
            Scope::Task => ScopeKey::Task {
                project_id: require("project_id", project_id)?,
                task_tree_id: require("task_tree_id", task_tree_id)?,
                task_id: require("task_id", task_id)?,
            },
        };
        key.validate()?;
        Ok(key)
    }

    pub fn scope(&self) -> Scope {
        match self {
            ScopeKey::Global => Scope::Global,
            ScopeKey::Project { .. } => Scope::Project,
            ScopeKey::Task { .. } => Scope::Task,
        }
    }

    pub fn project_id(&self) -> Option<&str> {
        match self {
            ScopeKey::Global => None,
            ScopeKey::Project { project_id } | ScopeKey::Task { project_id, .. } => {
                Some(project_id)
            }
        }
    }

    pub fn record_key(&self) -> RecordKey {
        match self {
            ScopeKey::Global => RecordKey::global(),
            ScopeKey::Project { project_id } => RecordKey::project(project_id.as_str()),
            ScopeKey::Task {
                project_id,
                task_tree_id,
                task_id,
            } => RecordKey::task_context(
                project_id.as_str(),
                task_tree_id.as_str(),
                task_id.as_str(),
            ),
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            ScopeKey::Global => Ok(()),
            ScopeKey::Project { project_id } => validate_id("project_id", project_id),
            ScopeKey::Task {
                project_id,
                task_tree_id,
                task_id,
            } => {
                validate_id("project_id", project_id)?;
                validate_id("task_tree_id", task_tree_id)?;
                validate_id("task_id", task_id)
            }
        }
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeKey::Global => write!(f, "global"),
            ScopeKey::Project { project_id } => write!(f, "project {}", project_id),
            ScopeKey::Task {
                project_id,
                task_tree_id,
                task_id,
            } => write!(f, "task {}/{}/{}", project_id, task_tree_id, task_id),
        }
    }
}

/// Persisted body of a context record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextBody {
    pub data: Map<String, Value>,
    pub version: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

impl ContextBody {
    pub const DATA: &'static str = "data";
    pub const VERSION: &'static str = "version";
    pub const UPDATED_AT: &'static str = "updated_at";

    pub fn from_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Path of `data` inside the stored body, optionally extended by `inner`.
    pub fn data_path(inner: &JsonPath) -> JsonPath {
        JsonPath::key(Self::DATA).join(inner)
    }
}

/// A context as seen by callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextRecord {
    pub scope: ScopeKey,
    pub data: Map<String, Value>,
    pub version: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

impl ContextRecord {
    /// The implicit record for a scope that has never been written.
    pub fn empty(scope: ScopeKey) -> Self {
        Self {
            scope,
            data: Map::new(),
            version: 0,
            updated_at: None,
        }
    }

    pub fn from_body(scope: ScopeKey, body: ContextBody) -> Self {
        Self {
            scope,
            data: body.data,
            version: body.version,
            updated_at: body.updated_at,
        }
    }
}

/// Versions of the three contexts an effective context was merged from.
/// Absent scopes count as version 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionSet {
    pub global: u64,
    pub project: u64,
    pub task: u64,
}

/// Merged Global ⊕ Project ⊕ Task view for one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectiveContext {
    pub project_id: String,
    pub task_tree_id: String,
    pub task_id: String,
    pub data: Value,
    pub versions: VersionSet,
}

impl EffectiveContext {
    /// Value at a path expression; `PathNotFound` if absent.
    pub fn get(&self, expr: &str) -> Result<&Value> {
        JsonPath::parse(expr)?.resolve(&self.data)
    }

    pub fn as_object(&self) -> Option<&Map<String, Value>> {
        self.data.as_object()
    }
}
