//! Record identity shared by every backend
//!
//! Each persisted entity lives in one row addressed by
//! `(kind, project_id, task_tree_id, task_id)`. Components a kind does not
//! use are empty strings, so the tuple is always complete and can serve as a
//! composite primary key. Migration copies this tuple verbatim.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CtxError, Result};
use crate::path::JsonPath;

/// What a record holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// The singleton global context
    Global,
    /// One project's context
    Project,
    /// Override layer for one task
    TaskContext,
    /// A task entity
    Task,
    /// Migration progress marker
    Checkpoint,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Global => "global",
            RecordKind::Project => "project",
            RecordKind::TaskContext => "task_context",
            RecordKind::Task => "task",
            RecordKind::Checkpoint => "checkpoint",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "global" => Ok(RecordKind::Global),
            "project" => Ok(RecordKind::Project),
            "task_context" => Ok(RecordKind::TaskContext),
            "task" => Ok(RecordKind::Task),
            "checkpoint" => Ok(RecordKind::Checkpoint),
            other => Err(CtxError::Backend(format!("unknown record kind: {}", other))),
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable identity of one stored record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub kind: RecordKind,
    pub project_id: String,
    pub task_tree_id: String,
    pub task_id: String,
}

impl RecordKey {
    pub fn new(
        kind: RecordKind,
        project_id: impl Into<String>,
        task_tree_id: impl Into<String>,
        task_id: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            project_id: project_id.into(),
            task_tree_id: task_tree_id.into(),
            task_id: task_id.into(),
        }
    }

    pub fn global() -> Self {
        Self::new(RecordKind::Global, "", "", "")
    }

    pub fn project(project_id: impl Into<String>) -> Self {
        Self::new(RecordKind::Project, project_id, "", "")
    }

    pub fn task_context(
        project_id: impl Into<String>,
        task_tree_id: impl Into<String>,
        task_id: impl Into<String>,
    ) -> Self {
        Self::new(RecordKind::TaskContext, project_id, task_tree_id, task_id)
    }

    pub fn task(
        project_id: impl Into<String>,
        task_tree_id: impl Into<String>,
        task_id: impl Into<String>,
    ) -> Self {
        Self::new(RecordKind::Task, project_id, task_tree_id, task_id)
    }

    /// Named checkpoint; the name goes in `task_id`.
    pub fn checkpoint(name: impl Into<String>) -> Self {
        Self::new(RecordKind::Checkpoint, "", "", name)
    }

    /// Address `path` inside this record.
    pub fn at(&self, path: JsonPath) -> StoragePath {
        StoragePath {
            key: self.clone(),
            path,
        }
    }

    /// Address the whole record.
    pub fn root(&self) -> StoragePath {
        self.at(JsonPath::root())
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            RecordKind::Global => write!(f, "global"),
            RecordKind::Project => write!(f, "project/{}", self.project_id),
            RecordKind::Checkpoint => write!(f, "checkpoint/{}", self.task_id),
            RecordKind::Task | RecordKind::TaskContext => write!(
                f,
                "{}/{}/{}/{}",
                self.kind, self.project_id, self.task_tree_id, self.task_id
            ),
        }
    }
}

/// A record key plus a path inside its JSON body
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoragePath {
    pub key: RecordKey,
    pub path: JsonPath,
}

impl StoragePath {
    pub fn new(key: RecordKey, path: JsonPath) -> Self {
        Self { key, path }
    }

    pub fn is_root(&self) -> bool {
        self.path.is_root()
    }

    /// Same record, first `depth` path segments.
    pub fn prefix(&self, depth: usize) -> StoragePath {
        StoragePath {
            key: self.key.clone(),
            path: self.path.prefix(depth),
        }
    }
}

impl fmt::Display for StoragePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.key, self.path)
    }
}

/// Selects records for `list` and `delete_where`. `None` matches anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub kind: Option<RecordKind>,
    pub project_id: Option<String>,
    pub task_tree_id: Option<String>,
    pub task_id: Option<String>,
}

impl RecordFilter {
    pub fn kind(kind: RecordKind) -> Self {
        Self {
            kind: Some(kind),
            ..Default::default()
        }
    }

    /// Every record belonging to one project, regardless of kind.
    pub fn project(project_id: impl Into<String>) -> Self {
        Self {
            project_id: Some(project_id.into()),
            ..Default::default()
        }
    }

    pub fn in_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn in_tree(mut self, task_tree_id: impl Into<String>) -> Self {
        self.task_tree_id = Some(task_tree_id.into());
        self
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn matches(&self, key: &RecordKey) -> bool {
        self.kind.map_or(true, |kind| kind == key.kind)
            && self.project_id.as_deref().map_or(true, |p| p == key.project_id)
            && self
                .task_tree_id
                .as_deref()
                .map_or(true, |t| t == key.task_tree_id)
            && self.task_id.as_deref().map_or(true, |t| t == key.task_id)
    }
}

/// One row as returned by `list`
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub key: RecordKey,
    /// Store-wide insertion sequence, assigned once on first insert
    pub seq: i64,
    pub body: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip() {
        for kind in [
            RecordKind::Global,
            RecordKind::Project,
            RecordKind::TaskContext,
            RecordKind::Task,
            RecordKind::Checkpoint,
        ] {
            assert_eq!(RecordKind::parse(kind.as_str()).unwrap(), kind);
        }
        assert!(RecordKind::parse("thread").is_err());
    }

    #[test]
    fn test_unused_components_are_empty() {
        let key = RecordKey::project("p1");
        assert_eq!(key.task_tree_id, "");
        assert_eq!(key.task_id, "");
        assert_eq!(RecordKey::global().project_id, "");
    }

    #[test]
    fn test_filter_matches() {
        let task = RecordKey::task("p1", "tree-a", "t1");
        assert!(RecordFilter::project("p1").matches(&task));
        assert!(!RecordFilter::project("p2").matches(&task));
        assert!(RecordFilter::kind(RecordKind::Task)
            .in_project("p1")
            .in_tree("tree-a")
            .matches(&task));
        assert!(!RecordFilter::kind(RecordKind::TaskContext).matches(&task));
    }

    #[test]
    fn test_display() {
        assert_eq!(
            RecordKey::task_context("p1", "tree-a", "t1").to_string(),
            "task_context/p1/tree-a/t1"
        );
        let path = RecordKey::project("p1").at(JsonPath::parse("data.theme").unwrap());
        assert_eq!(path.to_string(), "project/p1:data.theme");
    }
}
