//! Error types shared by the orchestration primitives.
//!
//! Every component surfaces failures to its immediate caller as an `Err`.
//! A cache miss is not an error; caches return `Option`.

use crate::ids::ReservationKey;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors from a call guarded by a circuit breaker.
#[derive(Error, Debug)]
pub enum CircuitBreakerError<E> {
    /// The circuit is open and not yet eligible for a probe. The wrapped
    /// operation was not invoked.
    #[error("Circuit breaker `{key}` is open")]
    Open {
        /// Downstream key the breaker protects
        key: String,
    },
    /// The wrapped call did not finish within the per-call deadline.
    #[error("Call through circuit breaker `{key}` timed out after {timeout:?}")]
    Timeout {
        /// Downstream key the breaker protects
        key: String,
        /// The deadline that elapsed
        timeout: Duration,
    },
    /// The wrapped operation failed.
    #[error("Operation failed: {0}")]
    Inner(E),
}

impl<E> CircuitBreakerError<E> {
    /// Whether the call was rejected without running.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    /// Whether the call exceeded its deadline.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// The operation's own error, if it got that far.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(err) => Some(err),
            Self::Open { .. } | Self::Timeout { .. } => None,
        }
    }
}

/// Errors from the retry helpers.
///
/// Both variants carry the underlying error untouched.
#[derive(Error, Debug)]
pub enum RetryError<E> {
    /// Every attempt failed; `last` is the error from the final attempt.
    #[error("Operation failed after {attempts} attempts: {last}")]
    Exhausted {
        /// Total attempts made (initial call plus retries)
        attempts: usize,
        /// Error returned by the last attempt
        last: E,
    },
    /// The error was classified as not retryable and returned immediately.
    #[error("{0}")]
    NotRetryable(E),
}

impl<E> RetryError<E> {
    /// The underlying error.
    pub fn into_inner(self) -> E {
        match self {
            Self::Exhausted { last, .. } => last,
            Self::NotRetryable(err) => err,
        }
    }

    /// Borrow the underlying error.
    pub fn inner(&self) -> &E {
        match self {
            Self::Exhausted { last, .. } => last,
            Self::NotRetryable(err) => err,
        }
    }

    /// Number of attempts made before giving up.
    #[must_use]
    pub const fn attempts(&self) -> usize {
        match self {
            Self::Exhausted { attempts, .. } => *attempts,
            Self::NotRetryable(_) => 1,
        }
    }
}

/// Errors from the inventory reservation book.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReservationError {
    /// Another session holds a live reservation for the key.
    #[error("Reservation {key} is held by another session (expires in {expires_in:?})")]
    Conflict {
        /// Contended key
        key: ReservationKey,
        /// Time until the other session's hold lapses
        expires_in: Duration,
    },
    /// This session holds no live reservation for the key.
    #[error("Reservation {key} is not held by this session")]
    NotHeld {
        /// Key that was not held
        key: ReservationKey,
    },
    /// Reservations must be for at least one unit.
    #[error("Reservation quantity must be greater than zero")]
    InvalidQuantity,
}

/// Errors delivered to callers of a batched operation.
///
/// A failing batch handler fails every caller in that batch with the same
/// error, shared through an `Arc`.
#[derive(Error, Debug)]
pub enum BatchError<E> {
    /// The batch handler failed.
    #[error("Batch failed: {0}")]
    Failed(Arc<E>),
    /// The handler returned a different number of results than items.
    #[error("Batch handler returned {actual} results for {expected} items")]
    LengthMismatch {
        /// Items in the batch
        expected: usize,
        /// Results returned
        actual: usize,
    },
    /// The processor was shut down before the item's batch ran.
    #[error("Batch processor shut down before the batch ran")]
    Dropped,
}

impl<E> Clone for BatchError<E> {
    fn clone(&self) -> Self {
        match self {
            Self::Failed(err) => Self::Failed(Arc::clone(err)),
            Self::LengthMismatch { expected, actual } => Self::LengthMismatch {
                expected: *expected,
                actual: *actual,
            },
            Self::Dropped => Self::Dropped,
        }
    }
}

/// Errors from the concurrency limiter and request queue.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// The waiter was released by `clear()` without running.
    #[error("Queued task was cleared before it ran")]
    Cleared,
    /// The queue has been shut down.
    #[error("Queue is shut down")]
    Closed,
}

/// Errors from the optimistic update tracker.
#[derive(Error, Debug)]
pub enum OptimisticError<E> {
    /// No pending update has this id.
    #[error("No pending optimistic update with id `{id}`")]
    UnknownUpdate {
        /// Requested id
        id: String,
    },
    /// The server rejected the update; it has been rolled back.
    #[error("Server rejected optimistic update: {0}")]
    Rejected(E),
}

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Environment variable not set
    #[error("Environment variable not set: {0}")]
    EnvVarNotSet(String),
    /// Invalid environment value
    #[error("Invalid environment: {0}")]
    InvalidEnvironment(String),
    /// Configuration validation failed
    #[error("Configuration validation failed: {0}")]
    Validation(String),
    /// Failed to parse configuration
    #[error("Failed to parse configuration: {0}")]
    Parse(String),
    /// Failed to read a configuration file
    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
}

/// Classifies errors for the default retry predicate.
///
/// Implement this for backend error types that carry an HTTP-like status.
pub trait Retryable {
    /// Status code attached to the error, if any.
    fn status_code(&self) -> Option<u16>;

    /// Whether a retry may succeed. Defaults to [`default_should_retry`].
    fn is_retryable(&self) -> bool {
        default_should_retry(self.status_code())
    }
}

/// Default retry classification: HTTP 429 and 5xx are transient, everything
/// else (including errors without a status) fails immediately.
#[must_use]
pub const fn default_should_retry(status: Option<u16>) -> bool {
    matches!(status, Some(429 | 500..=599))
}

impl<E: Retryable> Retryable for CircuitBreakerError<E> {
    fn status_code(&self) -> Option<u16> {
        match self {
            Self::Inner(err) => err.status_code(),
            Self::Open { .. } | Self::Timeout { .. } => None,
        }
    }

    fn is_retryable(&self) -> bool {
        match self {
            Self::Inner(err) => err.is_retryable(),
            Self::Open { .. } | Self::Timeout { .. } => false,
        }
    }
}
