//! Caching layer for ultra-runtime.
//!
//! Shared, concurrent cache of model call results and whole pipeline
//! results, keyed by [`Fingerprint`]. Identical requests within the TTL are
//! answered without calling any provider.
//!
//! TTL is checked lazily on read: an expired entry is evicted and reported as
//! a miss. Capacity is bounded by `moka`.

use futures::future;
use moka::future::Cache;
use moka::ops::compute::Op;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use ultra_core::{AnalysisResponse, Fingerprint, StageResponse};

/// Cache configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// When false every lookup misses and nothing is stored
    pub enabled: bool,

    /// Default time to live
    #[serde(with = "crate::config::humantime_duration")]
    pub ttl: Duration,

    pub max_entries: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(3600),
            max_entries: 10_000,
        }
    }
}

/// A cached result.
#[derive(Debug, Clone, PartialEq)]
pub enum CachedValue {
    /// One successful model call
    Call(StageResponse),
    /// A complete pipeline run
    Pipeline(Box<AnalysisResponse>),
}

#[derive(Debug)]
struct CacheEntry {
    value: CachedValue,
    created_at: Instant,
    ttl: Duration,
    hits: AtomicU64,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) >= self.ttl
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: u64,
    pub hits: u64,
    pub misses: u64,
}

/// Remove `key` only while it still maps to `expired`, so a concurrent
/// `put` between lookup and eviction survives.
async fn evict_if_current(
    cache: &Cache<Fingerprint, Arc<CacheEntry>>,
    key: &Fingerprint,
    expired: &Arc<CacheEntry>,
) {
    cache
        .entry_by_ref(key)
        .and_compute_with(|current| {
            let op = match current {
                Some(current) if Arc::ptr_eq(current.value(), expired) => Op::Remove,
                _ => Op::Nop,
            };
            future::ready(op)
        })
        .await;
}

/// Response cache using moka.
pub struct ResponseCache {
    cache: Option<Cache<Fingerprint, Arc<CacheEntry>>>,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResponseCache {
    /// Create a cache with the given configuration.
    pub fn new(config: &CacheConfig) -> Self {
        let cache = config
            .enabled
            .then(|| Cache::builder().max_capacity(config.max_entries).build());

        Self {
            cache,
            default_ttl: config.ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// A cache that never stores anything.
    pub fn disabled() -> Self {
        Self::new(&CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.cache.is_some()
    }

    /// Look up a value. Expired entries are evicted and count as misses.
    pub async fn get(&self, key: &Fingerprint) -> Option<CachedValue> {
        let cache = self.cache.as_ref()?;

        let Some(entry) = cache.get(key).await else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        if entry.is_expired(Instant::now()) {
            evict_if_current(cache, key, &entry).await;
            self.misses.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "Cache entry expired");
            return None;
        }

        entry.hits.fetch_add(1, Ordering::Relaxed);
        self.hits.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, "Cache hit");
        Some(entry.value.clone())
    }

    /// Store a value; `ttl` defaults to the configured TTL. Last write wins.
    pub async fn put(&self, key: Fingerprint, value: CachedValue, ttl: Option<Duration>) {
        let Some(cache) = &self.cache else {
            return;
        };

        let entry = CacheEntry {
            value,
            created_at: Instant::now(),
            ttl: ttl.unwrap_or(self.default_ttl),
            hits: AtomicU64::new(0),
        };
        cache.insert(key, Arc::new(entry)).await;
    }

    /// Hits served by one entry, if it is present.
    pub async fn entry_hits(&self, key: &Fingerprint) -> Option<u64> {
        let entry = self.cache.as_ref()?.get(key).await?;
        Some(entry.hits.load(Ordering::Relaxed))
    }

    /// Remove entries whose label matches `filter`, or everything for `None`.
    ///
    /// The filter is a glob over fingerprint labels where `*` matches any
    /// run of characters, e.g. `gut:*` or `*:initial:claude`. Returns the
    /// number of entries removed.
    pub async fn clear(&self, filter: Option<&str>) -> u64 {
        let Some(cache) = &self.cache else {
            return 0;
        };

        let matcher = match filter.map(glob_to_regex).transpose() {
            Ok(matcher) => matcher,
            Err(e) => {
                warn!(filter = ?filter, error = %e, "Invalid cache clear filter");
                return 0;
            }
        };

        let keys: Vec<Arc<Fingerprint>> = cache
            .iter()
            .map(|(key, _)| key)
            .filter(|key| matcher.as_ref().map_or(true, |re| re.is_match(key.label())))
            .collect();

        for key in &keys {
            cache.invalidate(key.as_ref()).await;
        }
        cache.run_pending_tasks().await;

        debug!(filter = ?filter, removed = keys.len(), "Cache cleared");
        keys.len() as u64
    }

    pub async fn stats(&self) -> CacheStats {
        let entries = match &self.cache {
            Some(cache) => {
                cache.run_pending_tasks().await;
                cache.entry_count()
            }
            None => 0,
        };

        CacheStats {
            entries,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(&CacheConfig::default())
    }
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("enabled", &self.is_enabled())
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

fn glob_to_regex(glob: &str) -> Result<Regex, regex::Error> {
    let body = glob
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^{}$", body))
}
