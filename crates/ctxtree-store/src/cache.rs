//! Sharded LRU cache of effective contexts
//!
//! Entries are keyed by the task identity plus the versions and generations of
//! all three contexts they were merged from, so a write anywhere in the chain
//! simply makes old entries unreachable; LRU eviction reclaims them. The
//! generation covers a context that was deleted and recreated, whose version
//! count starts again at 1. Each shard has
//! its own mutex, picked by hashing `project_id`, so unrelated projects never
//! contend. The lock is held only for the map operation itself.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use lru::LruCache;
use serde::{Deserialize, Serialize};
use tracing::trace;

use ctxtree_core::{CacheConfig, EffectiveContext, VersionSet};

/// Cache key: task identity plus the version tuple
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub project_id: String,
    pub task_tree_id: String,
    pub task_id: String,
    pub versions: VersionSet,
    /// Record generations in global, project, task order; 0 where the
    /// context record is absent.
    pub generations: [i64; 3],
}

/// Counters exposed through `cache_stats()`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

type Shard = Mutex<LruCache<CacheKey, Arc<EffectiveContext>>>;

pub struct ContextCache {
    shards: Vec<Shard>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ContextCache {
    pub fn new(config: &CacheConfig) -> Self {
        let per_shard = NonZeroUsize::new(config.shard_capacity()).unwrap_or(NonZeroUsize::MIN);
        let shards = (0..config.shards.max(1))
            .map(|_| Mutex::new(LruCache::new(per_shard)))
            .collect();
        Self {
            shards,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn shard(&self, project_id: &str) -> MutexGuard<'_, LruCache<CacheKey, Arc<EffectiveContext>>> {
        let mut hasher = DefaultHasher::new();
        project_id.hash(&mut hasher);
        let index = (hasher.finish() % self.shards.len() as u64) as usize;
        // a panic mid-operation cannot leave an LruCache inconsistent
        self.shards[index]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<EffectiveContext>> {
        let found = self.shard(&key.project_id).get(key).cloned();
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            trace!(project_id = %key.project_id, task_id = %key.task_id, "cache hit");
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            trace!(project_id = %key.project_id, task_id = %key.task_id, "cache miss");
        }
        found
    }

    pub fn insert(&self, key: CacheKey, value: Arc<EffectiveContext>) {
        let mut shard = self.shard(&key.project_id);
        shard.put(key, value);
    }

    /// Drop every entry for a project.
    pub fn purge_project(&self, project_id: &str) {
        self.purge_where(project_id, |_| true);
    }

    /// Drop every entry for one task.
    pub fn purge_task(&self, project_id: &str, task_tree_id: &str, task_id: &str) {
        self.purge_where(project_id, |key| {
            key.task_tree_id == task_tree_id && key.task_id == task_id
        });
    }

    fn purge_where(&self, project_id: &str, matches: impl Fn(&CacheKey) -> bool) {
        let mut shard = self.shard(project_id);
        let stale: Vec<CacheKey> = shard
            .iter()
            .filter(|(key, _)| key.project_id == project_id && matches(key))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            shard.pop(key);
        }
        if !stale.is_empty() {
            trace!(project_id, purged = stale.len(), "cache entries purged");
        }
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            shard
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clear();
        }
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self
            .shards
            .iter()
            .map(|shard| {
                shard
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .len()
            })
            .sum();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries,
        }
    }
}
