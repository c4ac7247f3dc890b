//! Circuit breaker pattern for preventing cascading failures.
//!
//! A circuit breaker monitors calls to one downstream and "opens" (stops
//! allowing calls) when consecutive failures reach a threshold, so a struggling
//! backend is not hammered during checkout spikes.
//!
//! # States
//!
//! ```text
//! Closed (normal) ──[failures >= threshold]──> Open (failing)
//!                                                     │
//!                                                     │ [reset_timeout elapsed]
//!                                                     ▼
//!                                              HalfOpen (one probe at a time)
//!                                                     │
//!                      ┌──────────────────────────────┴───────────────┐
//!                      │                                              │
//!           [success >= threshold]                          [any failure]
//!                      │                                              │
//!                      ▼                                              ▼
//!                   Closed                                          Open
//! ```
//!
//! Every call also races a hard deadline (`call_timeout`); a timeout counts
//! as a failure.
//!
//! # Example
//!
//! ```rust
//! use boxoffice_runtime::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let config = CircuitBreakerConfig::builder()
//!     .failure_threshold(5)
//!     .reset_timeout(Duration::from_secs(60))
//!     .success_threshold(2)
//!     .build();
//!
//! let breaker = CircuitBreaker::new("payments", config);
//!
//! match breaker.call(|| async {
//!     // Your fallible operation
//!     Ok::<_, String>(42)
//! }).await {
//!     Ok(result) => println!("Success: {result}"),
//!     Err(e) => println!("Failed: {e}"),
//! }
//! # }
//! ```

use boxoffice_core::config::CircuitBreakerSettings;
use boxoffice_core::error::CircuitBreakerError;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit
    pub failure_threshold: usize,
    /// Number of consecutive successes in `HalfOpen` state before closing the circuit
    pub success_threshold: usize,
    /// Duration to wait before transitioning from Open to `HalfOpen`
    pub reset_timeout: Duration,
    /// Deadline for each guarded call
    pub call_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(60),
            call_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&CircuitBreakerSettings> for CircuitBreakerConfig {
    fn from(settings: &CircuitBreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold,
            success_threshold: settings.success_threshold,
            reset_timeout: settings.reset_timeout(),
            call_timeout: settings.call_timeout(),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration builder.
    #[must_use]
    pub const fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder {
            failure_threshold: None,
            success_threshold: None,
            reset_timeout: None,
            call_timeout: None,
        }
    }
}

/// Builder for [`CircuitBreakerConfig`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfigBuilder {
    failure_threshold: Option<usize>,
    success_threshold: Option<usize>,
    reset_timeout: Option<Duration>,
    call_timeout: Option<Duration>,
}

impl CircuitBreakerConfigBuilder {
    /// Set the failure threshold.
    ///
    /// Circuit opens after this many consecutive failures. Clamped to at
    /// least 1.
    #[must_use]
    pub const fn failure_threshold(mut self, threshold: usize) -> Self {
        self.failure_threshold = Some(threshold);
        self
    }

    /// Set the success threshold.
    ///
    /// Number of successes in `HalfOpen` state before closing the circuit.
    /// Clamped to at least 1.
    #[must_use]
    pub const fn success_threshold(mut self, threshold: usize) -> Self {
        self.success_threshold = Some(threshold);
        self
    }

    /// Set how long the circuit stays Open before a probe is allowed.
    #[must_use]
    pub const fn reset_timeout(mut self, duration: Duration) -> Self {
        self.reset_timeout = Some(duration);
        self
    }

    /// Set the per-call deadline.
    #[must_use]
    pub const fn call_timeout(mut self, duration: Duration) -> Self {
        self.call_timeout = Some(duration);
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> CircuitBreakerConfig {
        let defaults = CircuitBreakerConfig::default();
        CircuitBreakerConfig {
            failure_threshold: self
                .failure_threshold
                .unwrap_or(defaults.failure_threshold)
                .max(1),
            success_threshold: self
                .success_threshold
                .unwrap_or(defaults.success_threshold)
                .max(1),
            reset_timeout: self.reset_timeout.unwrap_or(defaults.reset_timeout),
            call_timeout: self.call_timeout.unwrap_or(defaults.call_timeout),
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Circuit is closed, requests pass through normally
    Closed,
    /// Circuit is open, requests fail immediately
    Open,
    /// Circuit is half-open, testing if service recovered
    HalfOpen,
}

impl State {
    /// Numeric encoding used for the `circuit_breaker_state` gauge.
    #[must_use]
    pub const fn as_gauge(self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }
}

/// Internal state of the circuit breaker.
#[derive(Debug)]
struct CircuitBreakerState {
    state: State,
    consecutive_failures: usize,
    consecutive_successes: usize,
    next_attempt_at: Option<Instant>,
    probe_in_flight: bool,
}

impl CircuitBreakerState {
    const fn closed() -> Self {
        Self {
            state: State::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            next_attempt_at: None,
            probe_in_flight: false,
        }
    }
}

/// How a call was admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Probe,
}

/// Releases the half-open probe slot if the probing call is dropped before
/// it reports an outcome.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl ProbeGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.lock().probe_in_flight = false;
        }
    }
}

/// Circuit breaker for preventing cascading failures.
///
/// Wraps operations and monitors their success/failure. When failures exceed
/// a threshold, the circuit "opens" and rejects requests for a timeout period.
/// Clones share state.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    key: Arc<str>,
    config: Arc<CircuitBreakerConfig>,
    state: Arc<Mutex<CircuitBreakerState>>,
    // Metrics
    total_calls: Arc<AtomicU64>,
    total_successes: Arc<AtomicU64>,
    total_failures: Arc<AtomicU64>,
    total_rejections: Arc<AtomicU64>,
    total_timeouts: Arc<AtomicU64>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker.
    ///
    /// # Arguments
    ///
    /// * `key` - Downstream this breaker protects (e.g., "payments", "inventory")
    /// * `config` - Circuit breaker configuration
    #[must_use]
    pub fn new(key: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let key: String = key.into();
        Self {
            key: Arc::from(key),
            config: Arc::new(config),
            state: Arc::new(Mutex::new(CircuitBreakerState::closed())),
            total_calls: Arc::new(AtomicU64::new(0)),
            total_successes: Arc::new(AtomicU64::new(0)),
            total_failures: Arc::new(AtomicU64::new(0)),
            total_rejections: Arc::new(AtomicU64::new(0)),
            total_timeouts: Arc::new(AtomicU64::new(0)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CircuitBreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Downstream key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get the current state of the circuit breaker.
    #[must_use]
    pub fn state(&self) -> State {
        self.lock().state
    }

    /// Consecutive failures recorded since the last success or reset.
    #[must_use]
    pub fn failure_count(&self) -> usize {
        self.lock().consecutive_failures
    }

    /// Consecutive successes recorded while half-open.
    #[must_use]
    pub fn success_count(&self) -> usize {
        self.lock().consecutive_successes
    }

    /// Time remaining until an Open circuit admits a probe, if Open.
    #[must_use]
    pub fn next_attempt_in(&self) -> Option<Duration> {
        let state = self.lock();
        match (state.state, state.next_attempt_at) {
            (State::Open, Some(at)) => Some(at.saturating_duration_since(Instant::now())),
            _ => None,
        }
    }

    /// Call an operation through the circuit breaker.
    ///
    /// # Errors
    ///
    /// Returns `CircuitBreakerError::Open` if the circuit is open (the
    /// operation is not invoked), `CircuitBreakerError::Timeout` if it runs
    /// past the call deadline, and `CircuitBreakerError::Inner` if it fails.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("circuit_breaker_calls_total", "key" => self.key.to_string()).increment(1);

        let Some(admission) = self.try_admit() else {
            self.total_rejections.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("circuit_breaker_rejections_total", "key" => self.key.to_string())
                .increment(1);
            tracing::warn!(key = %self.key, "Circuit breaker is OPEN, rejecting request");
            return Err(CircuitBreakerError::Open {
                key: self.key.to_string(),
            });
        };

        let mut guard = ProbeGuard {
            breaker: self,
            armed: admission == Admission::Probe,
        };

        let outcome = tokio::time::timeout(self.config.call_timeout, operation()).await;
        guard.disarm();

        match outcome {
            Ok(Ok(result)) => {
                self.on_success();
                self.total_successes.fetch_add(1, Ordering::Relaxed);
                Ok(result)
            }
            Ok(Err(err)) => {
                self.on_failure();
                self.total_failures.fetch_add(1, Ordering::Relaxed);
                Err(CircuitBreakerError::Inner(err))
            }
            Err(_elapsed) => {
                tracing::warn!(
                    key = %self.key,
                    timeout_ms = self.config.call_timeout.as_millis(),
                    "Call through circuit breaker timed out"
                );
                self.on_failure();
                self.total_failures.fetch_add(1, Ordering::Relaxed);
                self.total_timeouts.fetch_add(1, Ordering::Relaxed);
                Err(CircuitBreakerError::Timeout {
                    key: self.key.to_string(),
                    timeout: self.config.call_timeout,
                })
            }
        }
    }

    /// Decide whether a call may proceed, moving Open -> `HalfOpen` once the
    /// reset timeout has passed.
    fn try_admit(&self) -> Option<Admission> {
        let mut state = self.lock();

        match state.state {
            State::Closed => Some(Admission::Normal),
            State::Open => {
                let ready = state
                    .next_attempt_at
                    .is_none_or(|at| Instant::now() >= at);
                if !ready {
                    return None;
                }
                tracing::info!(key = %self.key, "Circuit breaker transitioning OPEN -> HALF_OPEN");
                state.state = State::HalfOpen;
                state.consecutive_successes = 0;
                state.probe_in_flight = true;
                self.publish_state(State::HalfOpen);
                Some(Admission::Probe)
            }
            State::HalfOpen => {
                if state.probe_in_flight {
                    None
                } else {
                    state.probe_in_flight = true;
                    Some(Admission::Probe)
                }
            }
        }
    }

    /// Handle successful operation.
    fn on_success(&self) {
        let mut state = self.lock();

        match state.state {
            State::Closed => {
                // Reset failure count on success
                state.consecutive_failures = 0;
            }
            State::HalfOpen => {
                state.probe_in_flight = false;
                state.consecutive_successes += 1;
                if state.consecutive_successes >= self.config.success_threshold {
                    tracing::info!(
                        key = %self.key,
                        successes = state.consecutive_successes,
                        "Circuit breaker transitioning HALF_OPEN -> CLOSED"
                    );
                    *state = CircuitBreakerState::closed();
                    self.publish_state(State::Closed);
                }
            }
            State::Open => {
                // A call admitted before the circuit opened; the open window stands
            }
        }
    }

    /// Handle failed operation.
    fn on_failure(&self) {
        let mut state = self.lock();
        let now = Instant::now();
        state.consecutive_failures += 1;

        match state.state {
            State::Closed => {
                if state.consecutive_failures >= self.config.failure_threshold {
                    tracing::warn!(
                        key = %self.key,
                        failures = state.consecutive_failures,
                        threshold = self.config.failure_threshold,
                        "Circuit breaker transitioning CLOSED -> OPEN"
                    );
                    state.state = State::Open;
                    state.next_attempt_at = Some(now + self.config.reset_timeout);
                    self.publish_state(State::Open);
                }
            }
            State::HalfOpen => {
                tracing::warn!(
                    key = %self.key,
                    "Circuit breaker transitioning HALF_OPEN -> OPEN (recovery failed)"
                );
                state.state = State::Open;
                state.consecutive_successes = 0;
                state.probe_in_flight = false;
                state.next_attempt_at = Some(now + self.config.reset_timeout);
                self.publish_state(State::Open);
            }
            State::Open => {
                // Already open; the failure is counted but the window is unchanged
            }
        }
    }

    fn publish_state(&self, state: State) {
        metrics::gauge!("circuit_breaker_state", "key" => self.key.to_string()).set(state.as_gauge());
    }

    /// Get circuit breaker metrics.
    #[must_use]
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        CircuitBreakerMetrics {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
            total_timeouts: self.total_timeouts.load(Ordering::Relaxed),
        }
    }

    /// Reset the circuit breaker to closed state.
    ///
    /// Useful for testing or manual intervention.
    pub fn reset(&self) {
        let mut state = self.lock();
        tracing::info!(key = %self.key, "Circuit breaker manually reset to CLOSED");
        *state = CircuitBreakerState::closed();
        self.publish_state(State::Closed);
    }
}

/// Metrics for circuit breaker monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerMetrics {
    /// Total number of calls attempted
    pub total_calls: u64,
    /// Total number of successful calls
    pub total_successes: u64,
    /// Total number of failed calls (timeouts included)
    pub total_failures: u64,
    /// Total number of rejected calls (circuit open)
    pub total_rejections: u64,
    /// Total number of calls that hit the deadline
    pub total_timeouts: u64,
}

impl CircuitBreakerMetrics {
    /// Calculate success rate (0.0 to 1.0).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 1.0;
        }
        self.total_successes as f64 / self.total_calls as f64
    }

    /// Calculate rejection rate (0.0 to 1.0).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn rejection_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 0.0;
        }
        self.total_rejections as f64 / self.total_calls as f64
    }
}
