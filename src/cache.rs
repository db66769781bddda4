//! Feed caching with TTL and optional stale fallback
//!
//! Entries are kept past their TTL: an expired entry is a miss for reads, but
//! it remains available as last-known-good data for callers that choose
//! [`StalePolicy::ServeStale`].

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::Result;

/// What to do when a refetch fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StalePolicy {
    /// Answer with the last known good value, even past its TTL
    ServeStale,
    /// Return the fetch error
    Propagate,
}

/// How a value returned by [`TtlCache::get_or_fetch`] was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Freshness {
    /// Served from cache within TTL
    Fresh,
    /// Fetched just now
    Fetched,
    /// Fetch failed; served an expired entry
    Stale,
}

impl Freshness {
    /// Value for the `X-Cache` response header
    #[must_use]
    pub fn header_value(self) -> &'static str {
        match self {
            Self::Fresh => "HIT",
            Self::Fetched => "MISS",
            Self::Stale => "STALE",
        }
    }
}

/// A value together with how it was obtained
#[derive(Debug, Clone)]
pub struct Cached<V> {
    /// The value
    pub value: V,
    /// Cache outcome
    pub freshness: Freshness,
    /// Age of the value when returned
    pub age: Duration,
}

/// A cached value with TTL metadata
struct CacheEntry<V> {
    value: V,
    cached_at: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    /// An entry is expired once `now - cached_at >= ttl`
    fn is_expired(&self) -> bool {
        self.cached_at.elapsed() >= self.ttl
    }
}

/// Cache statistics tracked atomically
#[derive(Debug, Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    stale_served: AtomicU64,
    evictions: AtomicU64,
}

/// Thread-safe TTL cache keyed by string
pub struct TtlCache<V> {
    entries: DashMap<String, CacheEntry<V>>,
    /// One refresh at a time per key
    refresh_locks: DashMap<String, Arc<Mutex<()>>>,
    stats: CacheStats,
}

impl<V: Clone> TtlCache<V> {
    /// Create a new empty cache
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            refresh_locks: DashMap::new(),
            stats: CacheStats::default(),
        }
    }

    /// Get a value if present and within its TTL
    pub fn get(&self, key: &str) -> Option<V> {
        match self.entries.get(key) {
            Some(entry) if !entry.is_expired() => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            _ => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a value with the given TTL, replacing any previous entry
    pub fn set(&self, key: &str, value: V, ttl: Duration) {
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                cached_at: Instant::now(),
                ttl,
            },
        );
    }

    /// Return the cached value if `now - cached_at < ttl`; otherwise call
    /// `fetch`, store its result and return it. On fetch failure, `policy`
    /// decides between serving the expired entry and returning the error.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        policy: StalePolicy,
        fetch: F,
    ) -> Result<Cached<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        if let Some(cached) = self.fresh(key) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(cached);
        }

        let lock = self
            .refresh_locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Another caller may have refreshed while we waited
        if let Some(cached) = self.fresh(key) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(cached);
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);

        match fetch().await {
            Ok(value) => {
                self.set(key, value.clone(), ttl);
                debug!(key, ttl_ms = ttl.as_millis() as u64, "Cache refreshed");
                Ok(Cached {
                    value,
                    freshness: Freshness::Fetched,
                    age: Duration::ZERO,
                })
            }
            Err(e) => {
                if policy == StalePolicy::ServeStale {
                    if let Some(entry) = self.entries.get(key) {
                        self.stats.stale_served.fetch_add(1, Ordering::Relaxed);
                        let age = entry.cached_at.elapsed();
                        warn!(key, age_ms = age.as_millis() as u64, error = %e, "Refetch failed, serving stale value");
                        return Ok(Cached {
                            value: entry.value.clone(),
                            freshness: Freshness::Stale,
                            age,
                        });
                    }
                }
                Err(e)
            }
        }
    }

    fn fresh(&self, key: &str) -> Option<Cached<V>> {
        self.entries
            .get(key)
            .filter(|entry| !entry.is_expired())
            .map(|entry| Cached {
                value: entry.value.clone(),
                freshness: Freshness::Fresh,
                age: entry.cached_at.elapsed(),
            })
    }

    /// Remove entries older than `max_age`, regardless of TTL.
    /// Entries are kept past TTL for stale serving; this bounds how long.
    pub fn evict_older_than(&self, max_age: Duration) {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.cached_at.elapsed() < max_age);
        let evicted = before.saturating_sub(self.entries.len());

        self.refresh_locks
            .retain(|key, lock| self.entries.contains_key(key) || Arc::strong_count(lock) > 1);

        if evicted > 0 {
            self.stats
                .evictions
                .fetch_add(evicted as u64, Ordering::Relaxed);
        }
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStatsSnapshot {
        let hits = self.stats.hits.load(Ordering::Relaxed);
        let misses = self.stats.misses.load(Ordering::Relaxed);
        #[allow(clippy::cast_precision_loss)]
        let hit_rate = if hits + misses == 0 {
            0.0
        } else {
            hits as f64 / (hits + misses) as f64
        };

        CacheStatsSnapshot {
            hits,
            misses,
            stale_served: self.stats.stale_served.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            size: self.entries.len(),
            hit_rate,
        }
    }
}

impl<V: Clone> Default for TtlCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of cache statistics
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatsSnapshot {
    /// Reads served within TTL
    pub hits: u64,
    /// Reads that were absent or expired
    pub misses: u64,
    /// Expired values served after a failed refetch
    pub stale_served: u64,
    /// Entries removed by maintenance
    pub evictions: u64,
    /// Current number of entries
    pub size: usize,
    /// Hit rate (0.0-1.0)
    pub hit_rate: f64,
}
