//! Read-through loader with per-window batching and in-flight deduplication.
//!
//! `load(key)` resolves in one of three ways:
//!
//! 1. a live cache entry is returned without suspending,
//! 2. a load already in flight for the same key is joined,
//! 3. otherwise the key is queued; after the batch window one fetch is issued
//!    for every distinct queued key, found values are cached, and all waiters
//!    resolve.
//!
//! The fetch function returns one slot per requested key, positionally.
//! `None` means "not found": the caller gets `Ok(None)` and nothing is cached.

use async_trait::async_trait;
use boxoffice_core::config::LoaderSettings;
use boxoffice_core::error::BatchError;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use crate::batch::{BatchConfig, BatchProcessor};
use crate::cache::{Cache, CacheStats};
use crate::shutdown::{ShutdownError, ShutdownHandler};

/// Outcome of a single load.
pub type LoadResult<V, E> = Result<Option<V>, BatchError<E>>;

type InFlight<V, E> = Shared<BoxFuture<'static, LoadResult<V, E>>>;

/// Loader configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyedLoaderConfig {
    /// How long keys accumulate before a fetch is issued
    pub window: Duration,
    /// Most keys per fetch; a full window is fetched immediately
    pub max_batch_size: usize,
    /// Lifetime of fetched values in the cache
    pub cache_ttl: Duration,
}

impl Default for KeyedLoaderConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(10),
            max_batch_size: 100,
            cache_ttl: Duration::from_secs(300),
        }
    }
}

impl From<&LoaderSettings> for KeyedLoaderConfig {
    fn from(settings: &LoaderSettings) -> Self {
        Self {
            window: settings.window(),
            max_batch_size: settings.max_batch_size,
            cache_ttl: settings.cache_ttl(),
        }
    }
}

impl KeyedLoaderConfig {
    /// Create a new configuration builder.
    #[must_use]
    pub const fn builder() -> KeyedLoaderConfigBuilder {
        KeyedLoaderConfigBuilder {
            window: None,
            max_batch_size: None,
            cache_ttl: None,
        }
    }
}

/// Builder for [`KeyedLoaderConfig`].
#[derive(Debug, Clone, Copy)]
pub struct KeyedLoaderConfigBuilder {
    window: Option<Duration>,
    max_batch_size: Option<usize>,
    cache_ttl: Option<Duration>,
}

impl KeyedLoaderConfigBuilder {
    /// Set the batch window.
    #[must_use]
    pub const fn window(mut self, window: Duration) -> Self {
        self.window = Some(window);
        self
    }

    /// Set the per-fetch key limit.
    #[must_use]
    pub const fn max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = Some(size);
        self
    }

    /// Set the cache TTL.
    #[must_use]
    pub const fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> KeyedLoaderConfig {
        let defaults = KeyedLoaderConfig::default();
        KeyedLoaderConfig {
            window: self.window.unwrap_or(defaults.window),
            max_batch_size: self.max_batch_size.unwrap_or(defaults.max_batch_size),
            cache_ttl: self.cache_ttl.unwrap_or(defaults.cache_ttl),
        }
    }
}

/// Batching, deduplicating, caching loader.
///
/// Cloning yields another handle to the same cache and in-flight set.
pub struct KeyedLoader<K, V, E> {
    name: String,
    cache: Cache<K, V>,
    batcher: BatchProcessor<K, Option<V>, E>,
    in_flight: Arc<Mutex<HashMap<K, InFlight<V, E>>>>,
}

impl<K, V, E> Clone for KeyedLoader<K, V, E> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            cache: self.cache.clone(),
            batcher: self.batcher.clone(),
            in_flight: Arc::clone(&self.in_flight),
        }
    }
}

impl<K, V, E> std::fmt::Debug for KeyedLoader<K, V, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedLoader")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl<K, V, E> KeyedLoader<K, V, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Create a loader around a batched fetch function.
    ///
    /// `fetch` receives distinct keys and must return one slot per key in the
    /// same order.
    pub fn new<F, Fut>(name: impl Into<String>, config: KeyedLoaderConfig, fetch: F) -> Self
    where
        F: Fn(Vec<K>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<Option<V>>, E>> + Send + 'static,
    {
        let name = name.into();
        let batch_config = BatchConfig::builder()
            .max_batch_size(config.max_batch_size)
            .max_wait(config.window)
            .build();
        Self {
            cache: Cache::new(name.clone(), config.cache_ttl),
            batcher: BatchProcessor::new(name.clone(), batch_config, fetch),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            name,
        }
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<K, InFlight<V, E>>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Load the value for `key`.
    ///
    /// # Errors
    ///
    /// Returns the [`BatchError`] of the fetch that carried this key. The
    /// next load of the key issues a fresh fetch.
    pub async fn load(&self, key: K) -> LoadResult<V, E> {
        if let Some(value) = self.cache.get(&key) {
            return Ok(Some(value));
        }
        self.join_or_enqueue(key).await
    }

    fn join_or_enqueue(&self, key: K) -> InFlight<V, E> {
        let mut in_flight = self.lock_in_flight();
        if let Some(existing) = in_flight.get(&key) {
            tracing::trace!(loader = %self.name, "Joining in-flight load");
            return existing.clone();
        }

        let started = Instant::now();
        let queued = self.batcher.add(key.clone());
        let cache = self.cache.clone();
        let registry = Arc::clone(&self.in_flight);
        let settled_key = key.clone();
        let load = async move {
            let result = queued.await;
            if let Ok(Some(value)) = &result {
                cache.set_unless_newer(settled_key.clone(), value.clone(), None, started);
            }
            registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&settled_key);
            result
        }
        .boxed()
        .shared();

        // Drive the load to completion even if every caller walks away, so the
        // in-flight entry is always settled.
        tokio::spawn(load.clone());
        in_flight.insert(key, load.clone());
        load
    }

    /// Load several keys. Results are in the order of `keys`.
    pub async fn load_many<I>(&self, keys: I) -> Vec<LoadResult<V, E>>
    where
        I: IntoIterator<Item = K>,
    {
        futures::future::join_all(keys.into_iter().map(|key| self.load(key))).await
    }

    /// Seed the cache directly, bypassing the fetch path.
    ///
    /// A load of `key` already in flight still returns the fetched value to
    /// its callers but leaves the primed entry in the cache.
    pub fn prime(&self, key: K, value: V) {
        self.cache.set(key, value, None);
    }

    /// Invalidate one cached key, or every key when `key` is `None`.
    pub fn clear_cache(&self, key: Option<&K>) {
        match key {
            Some(key) => {
                self.cache.invalidate(key);
            }
            None => self.cache.clear(),
        }
    }

    /// Cached value for `key`, if live. Never fetches.
    #[must_use]
    pub fn peek(&self, key: &K) -> Option<V> {
        self.cache.get(key)
    }

    /// Distinct keys with a load in flight.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.lock_in_flight().len()
    }

    /// Fetches issued since creation.
    #[must_use]
    pub fn fetch_count(&self) -> u64 {
        self.batcher.flush_count()
    }

    /// Cache counters.
    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Loader name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl<K, V, E> ShutdownHandler for KeyedLoader<K, V, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn shutdown(&self) -> Result<(), ShutdownError> {
        self.batcher.close();
        Ok(())
    }
}
