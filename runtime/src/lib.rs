//! # Boxoffice Runtime
//!
//! Request-orchestration and resilience primitives for the boxoffice
//! storefront.
//!
//! Checkout and catalog flows call an unreliable backend under heavy
//! contention. This crate provides the pieces those calls are routed through:
//!
//! ## Core Components
//!
//! - **Cache**: keyed values with per-entry expiry
//! - **Retry**: exponential backoff for transient failures
//! - **Circuit Breaker**: fail fast against a failing downstream
//! - **Concurrency Limiter**: at most N tasks in flight, FIFO admission
//! - **Request Queue**: bounded concurrency plus spacing between starts
//! - **Batch Processor**: coalesce single-item calls into one bulk call
//! - **Keyed Loader**: batched, deduplicated, cached reads
//! - **Reservations**: session-owned holds on ticket quantities
//! - **Optimistic Updates**: show a change now, roll it back on failure
//! - **Checkout**: all of the above composed into one purchase flow
//!
//! Components are plain values built from configuration. Per-downstream
//! breakers, limiters and queues come from a [`ResilienceRegistry`], and
//! anything holding background tasks registers with a
//! [`ShutdownCoordinator`].
//!
//! ## Example
//!
//! ```
//! use boxoffice_runtime::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, State};
//! use boxoffice_runtime::retry::{RetryPolicy, retry_with_predicate};
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let breaker = CircuitBreaker::new("catalog", CircuitBreakerConfig::default());
//! let policy = RetryPolicy::builder()
//!     .max_retries(2)
//!     .initial_delay(Duration::from_millis(1))
//!     .build();
//!
//! let listing = retry_with_predicate(
//!     &policy,
//!     || breaker.call(|| async { Ok::<_, String>("evt-42") }),
//!     |_| true,
//! )
//! .await;
//!
//! assert_eq!(listing.ok(), Some("evt-42"));
//! assert_eq!(breaker.state(), State::Closed);
//! # }
//! ```

/// Batch processing with size and time triggers
pub mod batch;

/// In-memory cache with per-entry expiry
pub mod cache;

/// The checkout pipeline
pub mod checkout;

/// Circuit breaker pattern for preventing cascading failures
pub mod circuit_breaker;

/// FIFO concurrency limiting
pub mod limiter;

/// Batched, deduplicating, caching reads
pub mod loader;

/// Prometheus metrics for observability
pub mod metrics;

/// Optimistic updates with rollback
pub mod optimistic;

/// Per-key breakers, limiters and queues
pub mod registry;

/// Concurrency-limited, throttled dispatch
pub mod request_queue;

/// Session-owned inventory holds
pub mod reservation;

/// Retry logic with exponential backoff
pub mod retry;

/// Graceful shutdown of background tasks
pub mod shutdown;

pub use batch::{BatchConfig, BatchProcessor};
pub use cache::{Cache, CacheStats};
pub use checkout::{CartStatus, CheckoutCoordinator, CheckoutError, CheckoutRequest, PurchaseReceipt};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, State};
pub use limiter::{ConcurrencyLimiter, LimiterPermit, LimiterStats};
pub use loader::{KeyedLoader, KeyedLoaderConfig, LoadResult};
pub use optimistic::OptimisticUpdateTracker;
pub use registry::{RegistrySnapshot, ResilienceRegistry};
pub use request_queue::{RequestQueue, RequestQueueConfig};
pub use reservation::{ReservationBook, ReservationConfig, ReservationHold, SessionReservations};
pub use retry::{RetryPolicy, retry_with_backoff, retry_with_predicate};
pub use shutdown::{ShutdownCoordinator, ShutdownError, ShutdownHandler};
