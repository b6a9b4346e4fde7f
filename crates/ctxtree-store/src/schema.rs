//! Table definitions for both backends
//!
//! Every entity shares one `records` table keyed by
//! `(kind, project_id, task_tree_id, task_id)`. The body column holds the
//! JSON document in the engine's native representation. `seq` is assigned on
//! first insert, kept across updates and never reused after a delete.

/// Schema version for migrations
pub const SCHEMA_VERSION: u32 = 1;

/// Schema definitions
pub struct Schema;

impl Schema {
    /// SQLite: JSON kept as TEXT, validated on write
    pub fn sqlite() -> &'static str {
        r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- All scopes, tasks and checkpoints
-- AUTOINCREMENT: a deleted record's seq is never handed out again
CREATE TABLE IF NOT EXISTS records (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    project_id TEXT NOT NULL,
    task_tree_id TEXT NOT NULL,
    task_id TEXT NOT NULL,
    body TEXT NOT NULL CHECK (json_valid(body)),
    UNIQUE (kind, project_id, task_tree_id, task_id)
);

CREATE INDEX IF NOT EXISTS idx_records_project ON records(project_id, kind, seq);
"#
    }

    /// Postgres: JSON kept as JSONB, insertion order from a sequence
    pub fn postgres() -> &'static str {
        r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL,
    applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE SEQUENCE IF NOT EXISTS record_seq;

CREATE TABLE IF NOT EXISTS records (
    kind TEXT NOT NULL,
    project_id TEXT NOT NULL,
    task_tree_id TEXT NOT NULL,
    task_id TEXT NOT NULL,
    seq BIGINT NOT NULL,
    body JSONB NOT NULL,
    PRIMARY KEY (kind, project_id, task_tree_id, task_id)
);

CREATE INDEX IF NOT EXISTS idx_records_project ON records(project_id, kind, seq);
CREATE INDEX IF NOT EXISTS idx_records_seq ON records(seq);
CREATE INDEX IF NOT EXISTS idx_records_body ON records USING GIN (body jsonb_path_ops);
"#
    }

    /// Get migration SQL for a specific version
    pub fn migration(from_version: u32, to_version: u32) -> Option<&'static str> {
        match (from_version, to_version) {
            // (1, 2) => Some("ALTER TABLE records ..."),
            _ => None,
        }
    }
}
