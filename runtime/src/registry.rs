//! Per-key registries of breakers, limiters and request queues.
//!
//! Each downstream (payments, inventory, catalog) gets its own breaker,
//! limiter or queue, created on first use from a shared configuration. The
//! registry is an ordinary value: build one at start-up, share it behind an
//! `Arc`, and register it with the [`ShutdownCoordinator`] for teardown.
//! Tests build their own.
//!
//! [`ShutdownCoordinator`]: crate::shutdown::ShutdownCoordinator
//!
//! # Example
//!
//! ```
//! use boxoffice_runtime::registry::ResilienceRegistry;
//!
//! let registry = ResilienceRegistry::default();
//! let payments = registry.circuit_breaker("payments");
//!
//! // Same key, same breaker
//! assert_eq!(registry.circuit_breaker("payments").key(), payments.key());
//! assert_eq!(registry.keys().breakers, vec!["payments".to_string()]);
//! ```

use async_trait::async_trait;
use boxoffice_core::config::OrchestrationConfig;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, State};
use crate::limiter::{ConcurrencyLimiter, LimiterStats};
use crate::request_queue::{RequestQueue, RequestQueueConfig};
use crate::shutdown::{ShutdownError, ShutdownHandler};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Keys registered so far, sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryKeys {
    /// Circuit breaker keys
    pub breakers: Vec<String>,
    /// Limiter keys
    pub limiters: Vec<String>,
    /// Request queue keys
    pub queues: Vec<String>,
}

/// Breaker status for monitoring.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerSnapshot {
    /// Downstream key
    pub key: String,
    /// Current state
    pub state: State,
    /// Consecutive failures
    pub failures: usize,
    /// Call counters
    pub metrics: CircuitBreakerMetrics,
}

/// Request queue status for monitoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSnapshot {
    /// Queue key
    pub key: String,
    /// Tasks not yet started
    pub pending: usize,
    /// Tasks running
    pub active: usize,
}

/// Point-in-time view of every registered component, sorted by key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistrySnapshot {
    /// Breakers
    pub breakers: Vec<BreakerSnapshot>,
    /// Limiters, with their key
    pub limiters: Vec<(String, LimiterStats)>,
    /// Request queues
    pub queues: Vec<QueueSnapshot>,
}

/// Lazily-populated per-key resilience components.
#[derive(Debug)]
pub struct ResilienceRegistry {
    breaker_config: CircuitBreakerConfig,
    limiter_max_concurrent: usize,
    queue_config: RequestQueueConfig,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
    limiters: Mutex<HashMap<String, ConcurrencyLimiter>>,
    queues: Mutex<HashMap<String, Arc<RequestQueue>>>,
}

impl Default for ResilienceRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default(), 6, RequestQueueConfig::default())
    }
}

impl ResilienceRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(
        breaker_config: CircuitBreakerConfig,
        limiter_max_concurrent: usize,
        queue_config: RequestQueueConfig,
    ) -> Self {
        Self {
            breaker_config,
            limiter_max_concurrent,
            queue_config,
            breakers: Mutex::new(HashMap::new()),
            limiters: Mutex::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Create an empty registry using the orchestration configuration.
    #[must_use]
    pub fn from_config(config: &OrchestrationConfig) -> Self {
        Self::new(
            CircuitBreakerConfig::from(&config.circuit_breaker),
            config.limiter.max_concurrent,
            RequestQueueConfig::from(&config.request_queue),
        )
    }

    /// The breaker for `key`, created on first use. Handles share state.
    #[must_use]
    pub fn circuit_breaker(&self, key: &str) -> CircuitBreaker {
        lock(&self.breakers)
            .entry(key.to_string())
            .or_insert_with(|| {
                tracing::debug!(key, "Creating circuit breaker");
                CircuitBreaker::new(key, self.breaker_config.clone())
            })
            .clone()
    }

    /// The limiter for `key`, created on first use. Handles share slots.
    #[must_use]
    pub fn limiter(&self, key: &str) -> ConcurrencyLimiter {
        lock(&self.limiters)
            .entry(key.to_string())
            .or_insert_with(|| {
                tracing::debug!(key, "Creating concurrency limiter");
                ConcurrencyLimiter::new(key, self.limiter_max_concurrent)
            })
            .clone()
    }

    /// The request queue for `key`, created (and its dispatch loop started)
    /// on first use. Must be called from within a Tokio runtime.
    #[must_use]
    pub fn request_queue(&self, key: &str) -> Arc<RequestQueue> {
        Arc::clone(lock(&self.queues).entry(key.to_string()).or_insert_with(|| {
            tracing::debug!(key, "Creating request queue");
            Arc::new(RequestQueue::new(key, self.queue_config))
        }))
    }

    /// Registered keys.
    #[must_use]
    pub fn keys(&self) -> RegistryKeys {
        fn sorted<V>(map: &Mutex<HashMap<String, V>>) -> Vec<String> {
            let mut keys: Vec<String> = lock(map).keys().cloned().collect();
            keys.sort();
            keys
        }
        RegistryKeys {
            breakers: sorted(&self.breakers),
            limiters: sorted(&self.limiters),
            queues: sorted(&self.queues),
        }
    }

    /// Current status of every component.
    #[must_use]
    pub fn snapshot(&self) -> RegistrySnapshot {
        let mut breakers: Vec<BreakerSnapshot> = lock(&self.breakers)
            .iter()
            .map(|(key, breaker)| BreakerSnapshot {
                key: key.clone(),
                state: breaker.state(),
                failures: breaker.failure_count(),
                metrics: breaker.metrics(),
            })
            .collect();
        breakers.sort_by(|a, b| a.key.cmp(&b.key));

        let mut limiters: Vec<(String, LimiterStats)> = lock(&self.limiters)
            .iter()
            .map(|(key, limiter)| (key.clone(), limiter.stats()))
            .collect();
        limiters.sort_by(|a, b| a.0.cmp(&b.0));

        let mut queues: Vec<QueueSnapshot> = lock(&self.queues)
            .iter()
            .map(|(key, queue)| QueueSnapshot {
                key: key.clone(),
                pending: queue.pending(),
                active: queue.active_count(),
            })
            .collect();
        queues.sort_by(|a, b| a.key.cmp(&b.key));

        RegistrySnapshot {
            breakers,
            limiters,
            queues,
        }
    }

    /// Force every breaker closed.
    pub fn reset_all(&self) {
        let breakers: Vec<CircuitBreaker> = lock(&self.breakers).values().cloned().collect();
        tracing::info!(count = breakers.len(), "Resetting all circuit breakers");
        for breaker in breakers {
            breaker.reset();
        }
    }
}

#[async_trait]
impl ShutdownHandler for ResilienceRegistry {
    fn name(&self) -> &str {
        "resilience-registry"
    }

    async fn shutdown(&self) -> Result<(), ShutdownError> {
        let limiters: Vec<ConcurrencyLimiter> = lock(&self.limiters).values().cloned().collect();
        for limiter in limiters {
            limiter.close();
        }
        let queues: Vec<Arc<RequestQueue>> = lock(&self.queues).values().cloned().collect();
        for queue in queues {
            queue.shutdown();
        }
        Ok(())
    }
}
