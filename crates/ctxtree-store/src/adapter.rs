//! Storage Adapter
//!
//! One backend-neutral API over engines with different native JSON storage.
//! Backends implement [`Backend`] (open a transaction, hand it to a closure,
//! commit or roll back) and [`StorageTx`] (path-addressed reads and writes
//! inside that transaction). [`Storage`] wraps a backend with the retry
//! policy and the single-shot convenience calls.
//!
//! Nothing above this module sees SQL or backend path syntax.

use std::sync::Arc;
use std::thread;

use serde_json::Value;
use tracing::{debug, warn};

use ctxtree_core::{
    deep_merge, BackendConfig, BackendKind, CtxError, JsonType, RecordFilter, RecordKey, Result,
    RetryConfig, Segment, StoragePath, StoreConfig, StoredRecord,
};

/// Whether a transaction is expected to write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    ReadOnly,
    ReadWrite,
}

/// Operations available inside one backend transaction.
pub trait StorageTx {
    /// Value at `path`; `None` when absent. A stored null is `Some(Value::Null)`.
    fn get_opt(&mut self, path: &StoragePath) -> Result<Option<Value>>;

    /// Store-wide sequence number the record was inserted under; `None` when
    /// absent. Updates keep it, and a deleted then recreated record gets a
    /// new one.
    fn generation(&mut self, key: &RecordKey) -> Result<Option<i64>>;

    /// JSON type at `path`; `None` when absent.
    fn node_type(&mut self, path: &StoragePath) -> Result<Option<JsonType>>;

    /// Write `value` at `path`. A root set upserts the record; an inner set
    /// needs its parent container to exist already.
    fn set(&mut self, path: &StoragePath, value: &Value) -> Result<()>;

    /// Remove the value at `path` (the whole record at the root). Returns
    /// whether anything was there.
    fn delete(&mut self, path: &StoragePath) -> Result<bool>;

    /// Matching records in insertion order.
    fn list(&mut self, filter: &RecordFilter) -> Result<Vec<StoredRecord>>;

    /// Delete matching records, returning how many went.
    fn delete_where(&mut self, filter: &RecordFilter) -> Result<usize>;

    /// Value at `path`, or `PathNotFound` / `TypeMismatch` explaining the miss.
    fn get(&mut self, path: &StoragePath) -> Result<Value> {
        match self.get_opt(path)? {
            Some(value) => Ok(value),
            None => Err(miss_error(self, path)?),
        }
    }

    fn exists(&mut self, path: &StoragePath) -> Result<bool> {
        Ok(self.node_type(path)?.is_some())
    }

    /// Deep, key-preserving patch. Behaves as `set` when nothing is stored
    /// at `path`.
    fn merge(&mut self, path: &StoragePath, patch: &Value) -> Result<()> {
        match self.get_opt(path)? {
            Some(mut current) => {
                if patch.is_object() && !current.is_object() {
                    return Err(CtxError::TypeMismatch {
                        path: path.path.to_string(),
                        expected: "object",
                        found: JsonType::of(&current).as_str(),
                    });
                }
                deep_merge(&mut current, patch);
                self.set(path, &current)
            }
            None => self.set(path, patch),
        }
    }

    /// Whole record body, if the record exists.
    fn get_record(&mut self, key: &RecordKey) -> Result<Option<Value>> {
        self.get_opt(&key.root())
    }
}

/// Explain why nothing was found at `path`: the first prefix holding a
/// non-container gives `TypeMismatch`, otherwise `PathNotFound`.
pub fn miss_error<T: StorageTx + ?Sized>(tx: &mut T, path: &StoragePath) -> Result<CtxError> {
    let segments = path.path.segments();
    for (depth, segment) in segments.iter().enumerate() {
        match tx.node_type(&path.prefix(depth))? {
            None => break,
            Some(found) if found != segment.container() => {
                return Ok(path.path.mismatch_at(depth, found));
            }
            Some(_) => {}
        }
    }
    Ok(CtxError::PathNotFound(path.to_string()))
}

/// Check an inner `set` target: the parent must be the right container and an
/// array index must already exist.
pub fn ensure_settable<T: StorageTx + ?Sized>(tx: &mut T, path: &StoragePath) -> Result<()> {
    let (Some(parent), Some(last)) = (path.path.parent(), path.path.last()) else {
        return Ok(());
    };
    let depth = parent.len();
    match tx.node_type(&path.key.at(parent))? {
        None => Err(miss_error(tx, &path.prefix(depth))?),
        Some(found) if found != last.container() => Err(path.path.mismatch_at(depth, found)),
        Some(_) => {
            if matches!(last, Segment::Index(_)) && tx.node_type(path)?.is_none() {
                return Err(CtxError::PathNotFound(path.to_string()));
            }
            Ok(())
        }
    }
}

/// A storage engine able to run closures inside transactions.
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Run `work` in one transaction: commit if it returns `Ok`, roll back
    /// otherwise.
    fn run(
        &self,
        mode: TxMode,
        work: &mut dyn FnMut(&mut dyn StorageTx) -> Result<()>,
    ) -> Result<()>;
}

/// Retrying, shareable handle over one backend
#[derive(Clone)]
pub struct Storage {
    backend: Arc<dyn Backend>,
    retry: RetryConfig,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("backend", &self.backend.kind())
            .field("retry", &self.retry)
            .finish()
    }
}

impl Storage {
    pub fn new(backend: Arc<dyn Backend>, retry: RetryConfig) -> Self {
        Self { backend, retry }
    }

    /// Open the configured backend.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        config.validate()?;
        let backend = open_backend(&config.backend)?;
        Ok(Self::new(backend, config.retry.clone()))
    }

    /// Fresh in-memory SQLite database (for testing).
    #[cfg(feature = "sqlite")]
    pub fn sqlite_in_memory() -> Result<Self> {
        let backend = crate::sqlite::SqliteBackend::open_in_memory()?;
        Ok(Self::new(Arc::new(backend), RetryConfig::default()))
    }

    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Run `f` atomically. `BackendUnavailable` restarts it on a fresh
    /// transaction with backoff; any other error rolls back and returns.
    pub fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnMut(&mut dyn StorageTx) -> Result<T>,
    {
        self.run_with_retry(TxMode::ReadWrite, f)
    }

    /// Like [`Storage::transaction`] for closures that only read.
    pub fn read_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnMut(&mut dyn StorageTx) -> Result<T>,
    {
        self.run_with_retry(TxMode::ReadOnly, f)
    }

    fn run_with_retry<T, F>(&self, mode: TxMode, mut f: F) -> Result<T>
    where
        F: FnMut(&mut dyn StorageTx) -> Result<T>,
    {
        let mut backoff = self.retry.initial_backoff();
        let mut attempt = 1;
        loop {
            let mut output = None;
            let result = self.backend.run(mode, &mut |tx: &mut dyn StorageTx| -> Result<()> {
                output = Some(f(tx)?);
                Ok(())
            });
            match result {
                Ok(()) => {
                    return output.ok_or_else(|| {
                        CtxError::Backend("transaction committed without a result".to_string())
                    })
                }
                Err(err) if err.is_retryable() && attempt < self.retry.max_attempts => {
                    warn!(
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "backend unavailable, retrying transaction"
                    );
                    thread::sleep(backoff);
                    backoff = self.retry.next_backoff(backoff);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub fn get(&self, path: &StoragePath) -> Result<Value> {
        self.read_transaction(|tx| tx.get(path))
    }

    pub fn get_opt(&self, path: &StoragePath) -> Result<Option<Value>> {
        self.read_transaction(|tx| tx.get_opt(path))
    }

    pub fn exists(&self, path: &StoragePath) -> Result<bool> {
        self.read_transaction(|tx| tx.exists(path))
    }

    pub fn set(&self, path: &StoragePath, value: &Value) -> Result<()> {
        self.transaction(|tx| tx.set(path, value))
    }

    pub fn merge(&self, path: &StoragePath, patch: &Value) -> Result<()> {
        self.transaction(|tx| tx.merge(path, patch))
    }

    pub fn delete(&self, path: &StoragePath) -> Result<bool> {
        self.transaction(|tx| tx.delete(path))
    }

    pub fn list(&self, filter: &RecordFilter) -> Result<Vec<StoredRecord>> {
        self.read_transaction(|tx| tx.list(filter))
    }

    pub fn delete_where(&self, filter: &RecordFilter) -> Result<usize> {
        self.transaction(|tx| tx.delete_where(filter))
    }
}

fn open_backend(config: &BackendConfig) -> Result<Arc<dyn Backend>> {
    debug!(kind = %config.kind, "opening backend");
    match config.kind {
        #[cfg(feature = "sqlite")]
        BackendKind::Sqlite => Ok(Arc::new(crate::sqlite::SqliteBackend::open(&config.url)?)),
        #[cfg(feature = "postgres")]
        BackendKind::Postgres => Ok(Arc::new(crate::pg::PgBackend::connect(&config.url)?)),
        #[allow(unreachable_patterns)]
        other => Err(CtxError::Config(format!(
            "{} backend not compiled in (enable the `{}` feature)",
            other, other
        ))),
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use ctxtree_core::JsonPath;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn at(key: &RecordKey, expr: &str) -> StoragePath {
        key.at(JsonPath::parse(expr).unwrap())
    }

    /// Fails the first `failures` transactions with `BackendUnavailable`.
    struct FlakyBackend {
        inner: Arc<dyn Backend>,
        failures: AtomicU32,
        attempts: AtomicU32,
    }

    impl Backend for FlakyBackend {
        fn kind(&self) -> BackendKind {
            self.inner.kind()
        }

        fn run(
            &self,
            mode: TxMode,
            work: &mut dyn FnMut(&mut dyn StorageTx) -> Result<()>,
        ) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(CtxError::BackendUnavailable("connection reset".into()));
            }
            self.inner.run(mode, work)
        }
    }

    fn flaky(failures: u32) -> (Arc<FlakyBackend>, Storage) {
        let inner = crate::sqlite::SqliteBackend::open_in_memory().unwrap();
        let backend = Arc::new(FlakyBackend {
            inner: Arc::new(inner),
            failures: AtomicU32::new(failures),
            attempts: AtomicU32::new(0),
        });
        let retry = RetryConfig {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        };
        (backend.clone(), Storage::new(backend, retry))
    }

    #[test]
    fn test_retries_transient_failures() {
        let (backend, storage) = flaky(2);
        let key = RecordKey::project("p1");
        storage.set(&key.root(), &json!({"a": 1})).unwrap();
        assert_eq!(backend.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(storage.get(&key.root()).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let (backend, storage) = flaky(10);
        let err = storage
            .set(&RecordKey::project("p1").root(), &json!({}))
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(backend.attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_other_errors_are_not_retried() {
        let (backend, storage) = flaky(0);
        let err = storage
            .transaction(|_tx| -> Result<()> { Err(CtxError::InvalidInput("nope".into())) })
            .unwrap_err();
        assert!(matches!(err, CtxError::InvalidInput(_)));
        assert_eq!(backend.attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_null_versus_absent() {
        let storage = Storage::sqlite_in_memory().unwrap();
        let key = RecordKey::project("p1");
        storage.set(&key.root(), &json!({"owner": null})).unwrap();

        assert_eq!(storage.get(&at(&key, "owner")).unwrap(), Value::Null);
        assert_eq!(storage.get_opt(&at(&key, "missing")).unwrap(), None);
        assert!(matches!(
            storage.get(&at(&key, "missing")),
            Err(CtxError::PathNotFound(_))
        ));
    }

    #[test]
    fn test_merge_preserves_siblings() {
        let storage = Storage::sqlite_in_memory().unwrap();
        let key = RecordKey::project("p1");
        storage
            .set(&key.root(), &json!({"limits": {"cpu": 1, "mem": 2}, "tags": ["a"]}))
            .unwrap();
        storage
            .merge(&key.root(), &json!({"limits": {"cpu": 4}, "tags": ["b", "c"]}))
            .unwrap();
        assert_eq!(
            storage.get(&key.root()).unwrap(),
            json!({"limits": {"cpu": 4, "mem": 2}, "tags": ["b", "c"]})
        );

        // merging into an absent path behaves as set
        storage.merge(&at(&key, "extra"), &json!({"x": 1})).unwrap();
        assert_eq!(storage.get(&at(&key, "extra.x")).unwrap(), json!(1));
    }

    #[test]
    fn test_merge_object_into_scalar_is_mismatch() {
        let storage = Storage::sqlite_in_memory().unwrap();
        let key = RecordKey::project("p1");
        storage.set(&key.root(), &json!({"theme": "dark"})).unwrap();
        let err = storage
            .merge(&at(&key, "theme"), &json!({"color": "red"}))
            .unwrap_err();
        assert!(matches!(err, CtxError::TypeMismatch { found: "string", .. }));
    }

    #[test]
    fn test_get_through_scalar_is_mismatch() {
        let storage = Storage::sqlite_in_memory().unwrap();
        let key = RecordKey::project("p1");
        storage.set(&key.root(), &json!({"theme": "dark"})).unwrap();
        let err = storage.get(&at(&key, "theme.color")).unwrap_err();
        match err {
            CtxError::TypeMismatch { path, expected, .. } => {
                assert_eq!(path, "theme");
                assert_eq!(expected, "object");
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let storage = Storage::sqlite_in_memory().unwrap();
        let key = RecordKey::project("p1");
        let result: Result<()> = storage.transaction(|tx| {
            tx.set(&key.root(), &json!({"a": 1}))?;
            Err(CtxError::InvalidInput("abort".into()))
        });
        assert!(result.is_err());
        assert_eq!(storage.get_opt(&key.root()).unwrap(), None);
    }
}
