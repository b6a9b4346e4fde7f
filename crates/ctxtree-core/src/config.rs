//! Configuration for ctxtree
//!
//! Backend selection, cache sizing and retry policy. Loaded from TOML, with
//! `CTXTREE_*` environment variables layered on top.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CtxError, Result};

/// Environment variable overriding `backend.kind`
pub const ENV_BACKEND: &str = "CTXTREE_BACKEND";
/// Environment variable overriding `backend.url`
pub const ENV_URL: &str = "CTXTREE_URL";
/// Environment variable overriding `cache.capacity`
pub const ENV_CACHE_CAPACITY: &str = "CTXTREE_CACHE_CAPACITY";

/// Store-wide configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Which engine to open and where
    pub backend: BackendConfig,
    /// Effective-context cache sizing
    pub cache: CacheConfig,
    /// Backoff for transient backend failures
    pub retry: RetryConfig,
}

/// Supported storage engines
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// JSON stored as text, embedded database file
    #[default]
    Sqlite,
    /// JSON stored as JSONB, server database
    Postgres,
}

impl FromStr for BackendKind {
    type Err = CtxError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(BackendKind::Sqlite),
            "postgres" | "postgresql" => Ok(BackendKind::Postgres),
            other => Err(CtxError::Config(format!("unknown backend kind: {}", other))),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Sqlite => write!(f, "sqlite"),
            BackendKind::Postgres => write!(f, "postgres"),
        }
    }
}

/// Backend connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,
    /// SQLite: a file path or `:memory:`. Postgres: a libpq connection string.
    pub url: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Sqlite,
            url: default_sqlite_path().to_string_lossy().into_owned(),
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Total entries across all shards
    pub capacity: usize,
    /// Number of independently locked shards
    pub shards: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 4096,
            shards: 16,
        }
    }
}

impl CacheConfig {
    /// Capacity of each shard, at least one.
    pub fn shard_capacity(&self) -> usize {
        (self.capacity / self.shards.max(1)).max(1)
    }
}

/// Retry configuration for `BackendUnavailable`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 20,
            max_backoff_ms: 1000,
        }
    }
}

impl RetryConfig {
    /// Single attempt, no sleeping.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    /// Double `current`, capped at `max_backoff_ms`.
    pub fn next_backoff(&self, current: Duration) -> Duration {
        let max = Duration::from_millis(self.max_backoff_ms);
        current.saturating_mul(2).min(max)
    }
}

impl StoreConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sqlite(path: impl AsRef<Path>) -> Self {
        Self {
            backend: BackendConfig {
                kind: BackendKind::Sqlite,
                url: path.as_ref().to_string_lossy().into_owned(),
            },
            ..Default::default()
        }
    }

    pub fn sqlite_in_memory() -> Self {
        Self::sqlite(":memory:")
    }

    pub fn postgres(url: impl Into<String>) -> Self {
        Self {
            backend: BackendConfig {
                kind: BackendKind::Postgres,
                url: url.into(),
            },
            ..Default::default()
        }
    }

    /// Load configuration from a TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Serialize configuration to TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| CtxError::Config(e.to_string()))
    }

    /// Load configuration from a JSON string
    pub fn from_json(json_str: &str) -> Result<Self> {
        serde_json::from_str(json_str).map_err(|e| CtxError::Config(e.to_string()))
    }

    /// Read and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| CtxError::Config(format!("read {}: {}", path.display(), e)))?;
        let config = Self::from_toml(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// The user config file if present, defaults otherwise, then env overrides.
    pub fn load_default() -> Result<Self> {
        let mut config = match default_config_path() {
            Some(path) if path.exists() => {
                debug!(path = %path.display(), "loading config");
                let text = std::fs::read_to_string(&path)
                    .map_err(|e| CtxError::Config(format!("read {}: {}", path.display(), e)))?;
                Self::from_toml(&text)?
            }
            _ => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `CTXTREE_BACKEND`, `CTXTREE_URL` and `CTXTREE_CACHE_CAPACITY`.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from any variable source.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(kind) = lookup(ENV_BACKEND) {
            self.backend.kind = kind.parse()?;
        }
        if let Some(url) = lookup(ENV_URL) {
            self.backend.url = url;
        }
        if let Some(capacity) = lookup(ENV_CACHE_CAPACITY) {
            self.cache.capacity = capacity.parse().map_err(|_| {
                CtxError::Config(format!("{} is not a number: {}", ENV_CACHE_CAPACITY, capacity))
            })?;
        }
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.backend.url.trim().is_empty() {
            return Err(CtxError::Config("backend.url must not be empty".to_string()));
        }

        if self.cache.capacity == 0 {
            return Err(CtxError::Config("cache.capacity must be positive".to_string()));
        }

        if self.cache.shards == 0 {
            return Err(CtxError::Config("cache.shards must be positive".to_string()));
        }

        if self.retry.max_attempts == 0 {
            return Err(CtxError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }

        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(CtxError::Config(
                "retry.initial_backoff_ms must not exceed retry.max_backoff_ms".to_string(),
            ));
        }

        Ok(())
    }
}

/// `<config dir>/ctxtree/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("ctxtree").join("config.toml"))
}

fn default_sqlite_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ctxtree")
        .join("ctxtree.db")
}
