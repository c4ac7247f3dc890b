//! In-memory key/value cache with per-entry time-to-live.
//!
//! An entry is live while `now - stored_at <= ttl`. Dead entries are
//! logically absent: `get` purges them on sight, and `purge_expired` sweeps
//! them in bulk. The cache never blocks on I/O and never evicts live
//! entries on its own.
//!
//! # Example
//!
//! ```
//! use boxoffice_runtime::cache::Cache;
//! use std::time::Duration;
//!
//! let cache = Cache::new("events", Duration::from_secs(300));
//! cache.set("evt-42", 120_u32, None);
//!
//! assert_eq!(cache.get(&"evt-42"), Some(120));
//! cache.invalidate(&"evt-42");
//! assert_eq!(cache.get(&"evt-42"), None);
//! ```

use boxoffice_core::config::CacheSettings;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// A stored value with the time it was written and its lifetime.
#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    stored_at: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn is_live(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) <= self.ttl
    }
}

#[derive(Debug)]
struct CacheInner<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    hits: u64,
    misses: u64,
    expirations: u64,
}

/// Hit/miss counters for a cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    /// Reads that found a live entry
    pub hits: u64,
    /// Reads that found nothing, or only a dead entry
    pub misses: u64,
    /// Dead entries purged, by reads or sweeps
    pub expirations: u64,
    /// Entries currently stored (live or not yet purged)
    pub entries: usize,
}

impl CacheStats {
    /// Fraction of reads that hit (0.0 to 1.0).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

/// Key/value store with per-entry TTL.
///
/// Cloning a `Cache` yields another handle to the same storage.
#[derive(Debug)]
pub struct Cache<K, V> {
    name: String,
    default_ttl: Duration,
    inner: Arc<Mutex<CacheInner<K, V>>>,
}

impl<K, V> Clone for Cache<K, V> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            default_ttl: self.default_ttl,
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    /// Create an empty cache.
    ///
    /// # Arguments
    ///
    /// * `name` - Label used in logs and metrics (e.g., "events", "availability")
    /// * `default_ttl` - Lifetime of entries stored without an explicit TTL
    pub fn new(name: impl Into<String>, default_ttl: Duration) -> Self {
        Self {
            name: name.into(),
            default_ttl,
            inner: Arc::new(Mutex::new(CacheInner {
                entries: HashMap::new(),
                hits: 0,
                misses: 0,
                expirations: 0,
            })),
        }
    }

    /// Create an empty cache whose default TTL comes from configuration.
    pub fn from_settings(name: impl Into<String>, settings: &CacheSettings) -> Self {
        Self::new(name, settings.default_ttl())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner<K, V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `value` under `key`, replacing any previous entry.
    ///
    /// `ttl` overrides the cache-wide default for this entry only.
    pub fn set(&self, key: K, value: V, ttl: Option<Duration>) {
        let entry = CacheEntry {
            value,
            stored_at: Instant::now(),
            ttl: ttl.unwrap_or(self.default_ttl),
        };
        self.lock().entries.insert(key, entry);
    }

    /// Store `value` unless `key` holds an entry written at or after `since`.
    ///
    /// Returns whether the value was stored. Lets a slow producer that
    /// started at `since` avoid clobbering a fresher write.
    pub fn set_unless_newer(
        &self,
        key: K,
        value: V,
        ttl: Option<Duration>,
        since: Instant,
    ) -> bool {
        let now = Instant::now();
        let mut inner = self.lock();
        let newer = inner
            .entries
            .get(&key)
            .is_some_and(|entry| entry.stored_at >= since && entry.is_live(now));
        if newer {
            return false;
        }
        inner.entries.insert(
            key,
            CacheEntry {
                value,
                stored_at: now,
                ttl: ttl.unwrap_or(self.default_ttl),
            },
        );
        true
    }

    /// Return the value for `key` if it is live.
    ///
    /// A dead entry is removed and reported as absent.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let mut inner = self.lock();

        let live = inner.entries.get(key).map(|entry| entry.is_live(now));
        match live {
            Some(true) => {
                inner.hits += 1;
                metrics::counter!("cache_hits_total", "cache" => self.name.clone()).increment(1);
                inner.entries.get(key).map(|entry| entry.value.clone())
            }
            Some(false) => {
                inner.entries.remove(key);
                inner.expirations += 1;
                inner.misses += 1;
                metrics::counter!("cache_misses_total", "cache" => self.name.clone()).increment(1);
                None
            }
            None => {
                inner.misses += 1;
                metrics::counter!("cache_misses_total", "cache" => self.name.clone()).increment(1);
                None
            }
        }
    }

    /// Return the live value for `key`, or compute, store and return it.
    pub fn get_or_insert_with<F>(&self, key: K, ttl: Option<Duration>, f: F) -> V
    where
        K: Clone,
        F: FnOnce() -> V,
    {
        if let Some(value) = self.get(&key) {
            return value;
        }
        let value = f();
        self.set(key, value.clone(), ttl);
        value
    }

    /// Whether a live entry exists. Does not count as a read.
    #[must_use]
    pub fn contains_key(&self, key: &K) -> bool {
        let now = Instant::now();
        self.lock()
            .entries
            .get(key)
            .is_some_and(|entry| entry.is_live(now))
    }

    /// Remove the entry for `key`. Returns whether one was present.
    pub fn invalidate(&self, key: &K) -> bool {
        self.lock().entries.remove(key).is_some()
    }

    /// Remove every entry whose key matches `predicate`. Returns the number
    /// removed.
    pub fn invalidate_by_pattern<P>(&self, predicate: P) -> usize
    where
        P: Fn(&K) -> bool,
    {
        let mut inner = self.lock();
        let before = inner.entries.len();
        inner.entries.retain(|key, _| !predicate(key));
        before - inner.entries.len()
    }

    /// Remove every entry.
    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    /// Remove all dead entries. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.lock();
        let before = inner.entries.len();
        inner.entries.retain(|_, entry| entry.is_live(now));
        let removed = before - inner.entries.len();
        inner.expirations += removed as u64;
        if removed > 0 {
            tracing::debug!(cache = %self.name, removed, "Purged expired cache entries");
        }
        removed
    }

    /// Number of stored entries, including dead ones not yet purged.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether the cache stores nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Default TTL for new entries.
    #[must_use]
    pub const fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Cache name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Snapshot of the counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            expirations: inner.expirations,
            entries: inner.entries.len(),
        }
    }
}
