//! Migration Engine
//!
//! Copies the whole dataset from one [`Storage`] to another:
//!
//! 1. Global context (a failure here aborts the run)
//! 2. Per project, in sorted `project_id` order: project context, tasks in
//!    insertion order, then task contexts, all in one destination transaction
//! 3. A checkpoint record on the destination after every project
//! 4. Optional validation pass comparing both sides value-for-value, over
//!    every project not reported failed, including those a resumed run
//!    skipped
//!
//! A failing project is rolled back and reported; the run continues with the
//! next one. Cancellation is honoured between projects only. The checkpoint
//! is removed only once a run finishes with no failures and no mismatches.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use ctxtree_core::{
    CtxError, RecordFilter, RecordKey, RecordKind, Result, StoreConfig, StoredRecord,
};

use crate::adapter::Storage;

/// Name of the checkpoint record kept on the destination
pub const CHECKPOINT_NAME: &str = "migration";

/// Cooperative stop signal, checked between projects
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Rewrites record bodies on their way to the destination.
///
/// An error fails the project the record belongs to.
pub trait RecordTransform: Send + Sync {
    fn transform(&self, key: &RecordKey, body: Value) -> Result<Value>;
}

impl<F> RecordTransform for F
where
    F: Fn(&RecordKey, Value) -> Result<Value> + Send + Sync,
{
    fn transform(&self, key: &RecordKey, body: Value) -> Result<Value> {
        self(key, body)
    }
}

pub struct MigrationOptions {
    /// Continue from the destination's checkpoint instead of starting over
    pub resume: bool,
    /// Re-read both sides after copying and report differences
    pub validate: bool,
    pub cancel: Option<CancelFlag>,
    pub transform: Option<Box<dyn RecordTransform>>,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            resume: false,
            validate: true,
            cancel: None,
            transform: None,
        }
    }
}

impl fmt::Debug for MigrationOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationOptions")
            .field("resume", &self.resume)
            .field("validate", &self.validate)
            .field("cancel", &self.cancel)
            .field("transform", &self.transform.is_some())
            .finish()
    }
}

impl MigrationOptions {
    pub fn resume(mut self) -> Self {
        self.resume = true;
        self
    }

    pub fn without_validation(mut self) -> Self {
        self.validate = false;
        self
    }

    pub fn with_cancel(mut self, flag: CancelFlag) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn with_transform(mut self, transform: impl RecordTransform + 'static) -> Self {
        self.transform = Some(Box::new(transform));
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map_or(false, CancelFlag::is_cancelled)
    }

    fn apply(&self, key: &RecordKey, body: Value) -> Result<Value> {
        match &self.transform {
            Some(transform) => transform.transform(key, body),
            None => Ok(body),
        }
    }
}

/// Entity group being migrated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStage {
    Global,
    ProjectContext,
    Tasks,
    TaskContexts,
    Done,
}

impl MigrationStage {
    fn of(kind: RecordKind) -> Self {
        match kind {
            RecordKind::Global => MigrationStage::Global,
            RecordKind::Project => MigrationStage::ProjectContext,
            RecordKind::Task => MigrationStage::Tasks,
            RecordKind::TaskContext => MigrationStage::TaskContexts,
            RecordKind::Checkpoint => MigrationStage::Done,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStage::Global => "global",
            MigrationStage::ProjectContext => "project_context",
            MigrationStage::Tasks => "tasks",
            MigrationStage::TaskContexts => "task_contexts",
            MigrationStage::Done => "done",
        }
    }
}

impl fmt::Display for MigrationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable progress marker stored on the destination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: String,
    pub last_project_id: Option<String>,
    /// Stage `last_project_id` reached: `Done`, or the stage it failed in
    pub stage: MigrationStage,
    #[serde(default)]
    pub failed_projects: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    fn new(run_id: String) -> Self {
        Self {
            run_id,
            last_project_id: None,
            stage: MigrationStage::Global,
            failed_projects: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    /// Whether a resumed run should skip `project_id`.
    pub fn covers(&self, project_id: &str) -> bool {
        self.last_project_id
            .as_deref()
            .map_or(false, |last| project_id <= last)
            && !self.failed_projects.iter().any(|p| p == project_id)
    }

    pub fn load(storage: &Storage) -> Result<Option<Self>> {
        storage
            .get_opt(&RecordKey::checkpoint(CHECKPOINT_NAME).root())?
            .map(serde_json::from_value::<Checkpoint>)
            .transpose()
            .map_err(CtxError::from)
    }

    fn save(&mut self, storage: &Storage) -> Result<()> {
        self.updated_at = Utc::now();
        storage.set(
            &RecordKey::checkpoint(CHECKPOINT_NAME).root(),
            &serde_json::to_value(&*self)?,
        )?;
        debug!(
            run_id = %self.run_id,
            last_project_id = ?self.last_project_id,
            stage = %self.stage,
            "checkpoint saved"
        );
        Ok(())
    }

    fn clear(storage: &Storage) -> Result<bool> {
        storage.delete(&RecordKey::checkpoint(CHECKPOINT_NAME).root())
    }
}

/// A record whose destination copy differs from its source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mismatch {
    pub key: RecordKey,
    pub detail: String,
}

/// Final summary of a migration run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MigrationReport {
    pub run_id: String,
    pub succeeded: Vec<String>,
    /// `(project_id, error)` per failed project
    pub failed: Vec<(String, String)>,
    pub mismatches: Vec<Mismatch>,
    pub cancelled: bool,
    /// Projects a resumed run found already migrated
    pub skipped: Vec<String>,
    pub records_copied: usize,
}

impl MigrationReport {
    pub fn is_partial_failure(&self) -> bool {
        !self.failed.is_empty() || !self.mismatches.is_empty()
    }

    /// `MigrationPartialFailure` if any project failed or any record differs.
    pub fn into_result(self) -> Result<Self> {
        if self.is_partial_failure() {
            Err(CtxError::MigrationPartialFailure {
                failed: self.failed,
                mismatches: self.mismatches.len(),
            })
        } else {
            Ok(self)
        }
    }
}

/// Open both stores from configuration and migrate between them.
pub fn migrate(
    source: &StoreConfig,
    dest: &StoreConfig,
    options: MigrationOptions,
) -> Result<MigrationReport> {
    if source.backend.kind == dest.backend.kind && source.backend.url == dest.backend.url {
        return Err(CtxError::Config(
            "migration source and destination are the same store".to_string(),
        ));
    }
    let source = Storage::open(source)?;
    let dest = Storage::open(dest)?;
    migrate_between(&source, &dest, options)
}

/// Migrate between two open stores.
pub fn migrate_between(
    source: &Storage,
    dest: &Storage,
    options: MigrationOptions,
) -> Result<MigrationReport> {
    let previous = if options.resume {
        Checkpoint::load(dest)?
    } else {
        None
    };
    let mut checkpoint = match &previous {
        Some(previous) => previous.clone(),
        None => Checkpoint::new(Uuid::new_v4().to_string()),
    };
    let mut report = MigrationReport {
        run_id: checkpoint.run_id.clone(),
        ..Default::default()
    };
    info!(
        run_id = %report.run_id,
        resume = previous.is_some(),
        source = %source.kind(),
        dest = %dest.kind(),
        "migration started"
    );

    report.records_copied += migrate_global(source, dest, &options)?;
    if previous.is_none() {
        checkpoint.save(dest)?;
    }

    let projects: BTreeSet<String> = source
        .list(&RecordFilter::kind(RecordKind::Project))?
        .into_iter()
        .map(|record| record.key.project_id)
        .collect();

    let mut failed_projects = BTreeSet::new();
    for project_id in &projects {
        if options.is_cancelled() {
            warn!(run_id = %report.run_id, next = %project_id, "migration cancelled");
            report.cancelled = true;
            break;
        }
        if previous.as_ref().map_or(false, |cp| cp.covers(project_id)) {
            debug!(project_id = %project_id, "already migrated, skipping");
            report.skipped.push(project_id.clone());
            continue;
        }

        let reached = match migrate_project(source, dest, project_id, &options) {
            Ok(copied) => {
                debug!(project_id = %project_id, records = copied, "project migrated");
                report.records_copied += copied;
                report.succeeded.push(project_id.clone());
                MigrationStage::Done
            }
            Err((stage, err)) => {
                error!(
                    project_id = %project_id,
                    stage = %stage,
                    error = %err,
                    "project migration failed"
                );
                failed_projects.insert(project_id.clone());
                report.failed.push((project_id.clone(), err.to_string()));
                stage
            }
        };

        checkpoint.last_project_id = Some(project_id.clone());
        checkpoint.stage = reached;
        checkpoint.failed_projects = failed_projects.iter().cloned().collect();
        checkpoint.save(dest)?;
    }

    if options.validate && !report.cancelled {
        let copied: Vec<String> = projects
            .iter()
            .filter(|project_id| !failed_projects.contains(*project_id))
            .cloned()
            .collect();
        report.mismatches = validate(source, dest, &copied, &options)?;
    }

    if !report.cancelled && !report.is_partial_failure() {
        Checkpoint::clear(dest)?;
    }

    info!(
        run_id = %report.run_id,
        succeeded = report.succeeded.len(),
        failed = report.failed.len(),
        skipped = report.skipped.len(),
        mismatches = report.mismatches.len(),
        cancelled = report.cancelled,
        "migration finished"
    );
    Ok(report)
}

fn migrate_global(source: &Storage, dest: &Storage, options: &MigrationOptions) -> Result<usize> {
    let key = RecordKey::global();
    let body = match source.get_opt(&key.root())? {
        Some(body) => Some(options.apply(&key, body)?),
        None => None,
    };
    dest.transaction(|tx| match &body {
        Some(body) => tx.set(&key.root(), body).map(|_| 1),
        None => tx.delete(&key.root()).map(|_| 0),
    })
}

/// Copy one project; the destination copy is replaced wholesale. A failure
/// comes back with the stage it happened in.
fn migrate_project(
    source: &Storage,
    dest: &Storage,
    project_id: &str,
    options: &MigrationOptions,
) -> std::result::Result<usize, (MigrationStage, CtxError)> {
    let records = project_records(source, project_id)
        .map_err(|e| (MigrationStage::ProjectContext, e))?;

    let mut writes = Vec::with_capacity(records.len());
    for record in records {
        let stage = MigrationStage::of(record.key.kind);
        let body = options
            .apply(&record.key, record.body)
            .map_err(|e| (stage, stage_error(stage, &record.key, e)))?;
        writes.push((stage, record.key, body));
    }

    let mut reached = MigrationStage::ProjectContext;
    let result = dest.transaction(|tx| {
        reached = MigrationStage::ProjectContext;
        tx.delete_where(&RecordFilter::project(project_id))?;
        for (stage, key, body) in &writes {
            reached = *stage;
            tx.set(&key.root(), body)
                .map_err(|e| stage_error(*stage, key, e))?;
        }
        Ok(writes.len())
    });
    result.map_err(|e| (reached, e))
}

/// A project's records in migration order: project context, tasks, task
/// contexts, each group in insertion order.
fn project_records(storage: &Storage, project_id: &str) -> Result<Vec<StoredRecord>> {
    let mut records = storage.list(&RecordFilter::project(project_id))?;
    records.retain(|record| MigrationStage::of(record.key.kind) != MigrationStage::Done);
    // stable sort keeps seq order within a group
    records.sort_by_key(|record| match record.key.kind {
        RecordKind::Project => 0,
        RecordKind::Task => 1,
        _ => 2,
    });
    Ok(records)
}

fn stage_error(stage: MigrationStage, key: &RecordKey, err: CtxError) -> CtxError {
    match err {
        // keep retryable errors retryable for the storage retry loop
        CtxError::BackendUnavailable(_) => err,
        other => CtxError::Backend(format!("{} stage, {}: {}", stage, key, other)),
    }
}

/// Compare every migrated record on both sides.
fn validate(
    source: &Storage,
    dest: &Storage,
    projects: &[String],
    options: &MigrationOptions,
) -> Result<Vec<Mismatch>> {
    let mut mismatches = Vec::new();

    let global = RecordKey::global();
    let expected = match source.get_opt(&global.root())? {
        Some(body) => Some(options.apply(&global, body)?),
        None => None,
    };
    compare(&global, expected, dest.get_opt(&global.root())?, &mut mismatches);

    for project_id in projects {
        let mut expected = BTreeMap::new();
        for record in project_records(source, project_id)? {
            match options.apply(&record.key, record.body) {
                Ok(body) => {
                    expected.insert(record.key, body);
                }
                Err(err) => mismatches.push(Mismatch {
                    key: record.key,
                    detail: format!("transform failed during validation: {}", err),
                }),
            }
        }
        let mut actual: BTreeMap<RecordKey, Value> = project_records(dest, project_id)?
            .into_iter()
            .map(|record| (record.key, record.body))
            .collect();

        for (key, body) in expected {
            let found = actual.remove(&key);
            compare(&key, Some(body), found, &mut mismatches);
        }
        for (key, _) in actual {
            mismatches.push(Mismatch {
                key,
                detail: "present in destination only".to_string(),
            });
        }
    }

    for mismatch in &mismatches {
        warn!(key = %mismatch.key, detail = %mismatch.detail, "migration mismatch");
    }
    Ok(mismatches)
}

fn compare(key: &RecordKey, expected: Option<Value>, actual: Option<Value>, out: &mut Vec<Mismatch>) {
    let detail = match (expected, actual) {
        (None, None) => return,
        (Some(_), None) => "missing in destination".to_string(),
        (None, Some(_)) => "present in destination only".to_string(),
        (Some(expected), Some(actual)) => {
            if normalized(&expected) == normalized(&actual) {
                return;
            }
            format!("expected {}, found {}", expected, actual)
        }
    };
    out.push(Mismatch {
        key: key.clone(),
        detail,
    });
}

/// Integral floats become integers so `3.0` and `3` compare equal.
fn normalized(value: &Value) -> Value {
    match value {
        Value::Number(n) if n.is_f64() => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 => {
                Value::from(f as i64)
            }
            _ => value.clone(),
        },
        Value::Array(items) => Value::Array(items.iter().map(normalized).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), normalized(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}
