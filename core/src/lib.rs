//! # Boxoffice Core
//!
//! Shared vocabulary for the boxoffice request-orchestration layer.
//!
//! The storefront issues its checkout and catalog calls through a handful of
//! composable primitives (caching, retries, circuit breaking, bounded
//! concurrency, batching, inventory reservations, optimistic updates). Those
//! primitives live in `boxoffice-runtime`; this crate holds what they share
//! without pulling in any async machinery:
//!
//! - **Identifiers**: [`SessionId`] and [`ReservationKey`]
//! - **Keys**: [`CanonicalKey`], an order-independent encoding for
//!   JSON-shaped lookup keys
//! - **Errors**: the error taxonomy every component reports through
//! - **Configuration**: [`OrchestrationConfig`], loaded from defaults, TOML
//!   and environment variables
//!
//! ## Example
//!
//! ```
//! use boxoffice_core::{ReservationKey, SessionId};
//!
//! let session = SessionId::new();
//! let key = ReservationKey::new("evt-42", "GA");
//!
//! assert_eq!(key.to_string(), "evt-42:GA");
//! assert_ne!(session, SessionId::new());
//! ```

pub mod config;
pub mod error;
pub mod ids;
pub mod key;

pub use config::{Environment, OrchestrationConfig};
pub use error::{
    BatchError, CircuitBreakerError, ConfigError, OptimisticError, QueueError, ReservationError,
    RetryError, Retryable, default_should_retry,
};
pub use ids::{ReservationKey, SessionId};
pub use key::CanonicalKey;
