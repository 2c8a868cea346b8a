//! Cache-aside lookups for remote version queries.
//!
//! Every lookup goes through [`CachedLookup::get_or_fetch`]: a TTL-bound hit
//! (value or cached failure) returns immediately, otherwise the fetch runs
//! behind a [`RequestCoalescer`] so concurrent misses share one round-trip.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::time::Instant;

use crate::errors::{LauncherError, Result};
use crate::services::coalescer::{RequestCoalescer, SharedResult};

pub const VERSION_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// `(os, arch, branch[, version])`, rendered as `os-arch-branch[-version]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionKey {
    pub os: String,
    pub arch: String,
    pub branch: String,
    pub version: Option<u32>,
}

impl VersionKey {
    pub fn new(os: &str, arch: &str, branch: &str) -> Self {
        Self {
            os: os.to_string(),
            arch: arch.to_string(),
            branch: branch.to_string(),
            version: None,
        }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }
}

impl fmt::Display for VersionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.os, self.arch, self.branch)?;
        if let Some(version) = self.version {
            write!(f, "-{version}")?;
        }
        Ok(())
    }
}

struct CacheEntry<V> {
    captured_at: Instant,
    value: SharedResult<V>,
}

pub struct TtlCache<V> {
    ttl: Duration,
    entries: RwLock<HashMap<String, CacheEntry<V>>>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<SharedResult<V>> {
        let entries = self
            .entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries
            .get(key)
            .filter(|entry| entry.captured_at.elapsed() < self.ttl)
            .map(|entry| entry.value.clone())
    }

    pub fn insert(&self, key: String, value: SharedResult<V>) {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.retain(|_, entry| entry.captured_at.elapsed() < self.ttl);
        entries.insert(
            key,
            CacheEntry {
                captured_at: Instant::now(),
                value,
            },
        );
    }

    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}

pub struct CachedLookup<V: Clone> {
    cache: Arc<TtlCache<V>>,
    inflight: RequestCoalescer<V>,
}

impl<V> CachedLookup<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: Arc::new(TtlCache::new(ttl)),
            inflight: RequestCoalescer::new(),
        }
    }

    pub async fn get_or_fetch<F, Fut>(&self, key: &str, fetch: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        if let Some(hit) = self.cache.get(key) {
            tracing::debug!(key, "version cache hit");
            return hit.map_err(LauncherError::Shared);
        }

        let cache = Arc::clone(&self.cache);
        let owned_key = key.to_string();
        self.inflight
            .run(key, move || {
                let request = fetch();
                async move {
                    // Another leader may have filled the slot between our miss and now.
                    if let Some(hit) = cache.get(&owned_key) {
                        return hit;
                    }
                    let result = request.await.map_err(Arc::new);
                    if let Err(err) = &result {
                        tracing::warn!(key = %owned_key, error = %err, "caching failed version lookup");
                    }
                    cache.insert(owned_key, result.clone());
                    result
                }
            })
            .await
            .map_err(LauncherError::Shared)
    }

    pub fn clear(&self) {
        self.cache.clear();
    }
}

/// Lookups shared by every resolver instance. Built once and injected.
pub struct VersionCache {
    pub latest: CachedLookup<u32>,
    pub all: CachedLookup<Vec<u32>>,
    pub exists: CachedLookup<bool>,
}

impl Default for VersionCache {
    fn default() -> Self {
        Self::new(VERSION_CACHE_TTL)
    }
}

impl VersionCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            latest: CachedLookup::new(ttl),
            all: CachedLookup::new(ttl),
            exists: CachedLookup::new(ttl),
        }
    }

    pub fn clear(&self) {
        self.latest.clear();
        self.all.clear();
        self.exists.clear();
        tracing::debug!("version cache cleared");
    }
}
