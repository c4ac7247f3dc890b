//! # Boxoffice Testing
//!
//! Test doubles and helpers for the boxoffice orchestration primitives.
//!
//! This crate provides:
//! - [`HttpFailure`]: a backend error carrying a status code
//! - [`FlakyOperation`]: fails a fixed number of times, then succeeds
//! - [`RecordingFetcher`]: an in-memory batch fetch that records its calls
//! - [`ConcurrencyProbe`]: measures how many tasks overlap
//! - [`init_tracing`]: log output for tests, honouring `RUST_LOG`
//! - [`properties`]: proptest strategies for domain types
//!
//! ## Example
//!
//! ```
//! use boxoffice_testing::{FlakyOperation, HttpFailure};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let op = FlakyOperation::new(1, HttpFailure::new(503), "ok");
//!
//! assert_eq!(op.call().await, Err(HttpFailure::new(503)));
//! assert_eq!(op.call().await, Ok("ok"));
//! assert_eq!(op.calls(), 2);
//! # }
//! ```

/// Backend doubles.
pub mod mocks {
    use boxoffice_core::error::Retryable;
    use std::collections::HashMap;
    use std::future::{Ready, ready};
    use std::hash::Hash;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
    use thiserror::Error;

    fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A failed backend call with an HTTP status.
    ///
    /// Retry classification follows the status: 429 and 5xx are transient.
    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    #[error("HTTP {status}: {message}")]
    pub struct HttpFailure {
        /// Status code
        pub status: u16,
        /// Response message
        pub message: String,
    }

    impl HttpFailure {
        /// A failure with a generic message.
        #[must_use]
        pub fn new(status: u16) -> Self {
            Self::with_message(status, "backend error")
        }

        /// A failure with a custom message.
        pub fn with_message(status: u16, message: impl Into<String>) -> Self {
            Self {
                status,
                message: message.into(),
            }
        }
    }

    impl Retryable for HttpFailure {
        fn status_code(&self) -> Option<u16> {
            Some(self.status)
        }
    }

    struct FlakyInner<T, E> {
        failures: usize,
        error: E,
        value: T,
        calls: AtomicUsize,
    }

    /// An operation that fails `failures` times, then keeps succeeding.
    ///
    /// Clones share the call counter.
    pub struct FlakyOperation<T, E> {
        inner: Arc<FlakyInner<T, E>>,
    }

    impl<T, E> Clone for FlakyOperation<T, E> {
        fn clone(&self) -> Self {
            Self {
                inner: Arc::clone(&self.inner),
            }
        }
    }

    impl<T: Clone, E: Clone> FlakyOperation<T, E> {
        /// Fail with `error` for the first `failures` calls, then return
        /// `value`. Pass `usize::MAX` for an operation that never recovers.
        pub fn new(failures: usize, error: E, value: T) -> Self {
            Self {
                inner: Arc::new(FlakyInner {
                    failures,
                    error,
                    value,
                    calls: AtomicUsize::new(0),
                }),
            }
        }

        /// Make one call.
        pub fn call(&self) -> Ready<Result<T, E>> {
            let attempt = self.inner.calls.fetch_add(1, Ordering::SeqCst);
            if attempt < self.inner.failures {
                ready(Err(self.inner.error.clone()))
            } else {
                ready(Ok(self.inner.value.clone()))
            }
        }

        /// Calls made so far.
        #[must_use]
        pub fn calls(&self) -> usize {
            self.inner.calls.load(Ordering::SeqCst)
        }
    }

    struct FetcherState<K, V> {
        values: HashMap<K, V>,
        batches: Vec<Vec<K>>,
        fail_next: Option<HttpFailure>,
    }

    /// In-memory batch fetch for `KeyedLoader` and `BatchProcessor` tests.
    ///
    /// Returns one slot per requested key and records every batch it saw.
    pub struct RecordingFetcher<K, V> {
        state: Arc<Mutex<FetcherState<K, V>>>,
    }

    impl<K, V> Clone for RecordingFetcher<K, V> {
        fn clone(&self) -> Self {
            Self {
                state: Arc::clone(&self.state),
            }
        }
    }

    impl<K, V> RecordingFetcher<K, V>
    where
        K: Eq + Hash + Clone,
        V: Clone,
    {
        /// A fetcher that knows `values`.
        pub fn new(values: impl IntoIterator<Item = (K, V)>) -> Self {
            Self {
                state: Arc::new(Mutex::new(FetcherState {
                    values: values.into_iter().collect(),
                    batches: Vec::new(),
                    fail_next: None,
                })),
            }
        }

        /// Fetch `keys`, in order. Unknown keys yield `None`.
        ///
        /// # Errors
        ///
        /// Returns the failure queued by [`fail_next`](Self::fail_next).
        pub fn fetch(&self, keys: Vec<K>) -> Ready<Result<Vec<Option<V>>, HttpFailure>> {
            let mut state = lock(&self.state);
            let slots: Vec<Option<V>> = keys.iter().map(|key| state.values.get(key).cloned()).collect();
            state.batches.push(keys);
            ready(state.fail_next.take().map_or(Ok(slots), Err))
        }

        /// Fail the next fetch with `failure`.
        pub fn fail_next(&self, failure: HttpFailure) {
            lock(&self.state).fail_next = Some(failure);
        }

        /// Change the value served for `key`.
        pub fn set(&self, key: K, value: V) {
            lock(&self.state).values.insert(key, value);
        }

        /// Every batch fetched so far.
        #[must_use]
        pub fn batches(&self) -> Vec<Vec<K>> {
            lock(&self.state).batches.clone()
        }

        /// Number of fetches so far.
        #[must_use]
        pub fn fetch_count(&self) -> usize {
            lock(&self.state).batches.len()
        }
    }
}

/// Test helpers and utilities.
pub mod helpers {
    use std::future::Future;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tracing_subscriber::EnvFilter;

    /// Install a test log subscriber. Safe to call from every test.
    ///
    /// Uses `RUST_LOG` when set, otherwise `warn`.
    pub fn init_tracing() {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        // Another test may have installed one already
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    }

    #[derive(Debug, Default)]
    struct ProbeCounts {
        current: AtomicUsize,
        max: AtomicUsize,
        total: AtomicUsize,
    }

    /// Tracks how many tasks run at once.
    ///
    /// Clones share counters.
    #[derive(Debug, Clone, Default)]
    pub struct ConcurrencyProbe {
        counts: Arc<ProbeCounts>,
    }

    /// Marks one running task until dropped.
    #[derive(Debug)]
    pub struct ProbeGuard {
        counts: Arc<ProbeCounts>,
    }

    impl Drop for ProbeGuard {
        fn drop(&mut self) {
            self.counts.current.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl ConcurrencyProbe {
        /// A probe with zeroed counters.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Record a task starting.
        #[must_use]
        pub fn enter(&self) -> ProbeGuard {
            let now = self.counts.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.counts.max.fetch_max(now, Ordering::SeqCst);
            self.counts.total.fetch_add(1, Ordering::SeqCst);
            ProbeGuard {
                counts: Arc::clone(&self.counts),
            }
        }

        /// Run `fut` as one tracked task.
        pub async fn track<F: Future>(&self, fut: F) -> F::Output {
            let _guard = self.enter();
            fut.await
        }

        /// Tasks running now.
        #[must_use]
        pub fn current(&self) -> usize {
            self.counts.current.load(Ordering::SeqCst)
        }

        /// Highest overlap seen.
        #[must_use]
        pub fn max_observed(&self) -> usize {
            self.counts.max.load(Ordering::SeqCst)
        }

        /// Tasks started.
        #[must_use]
        pub fn total(&self) -> usize {
            self.counts.total.load(Ordering::SeqCst)
        }
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use boxoffice_core::ids::ReservationKey;
    use proptest::prelude::*;
    use serde_json::{Map, Value};

    /// Reservation keys over a small alphabet, so collisions happen.
    pub fn reservation_key() -> impl Strategy<Value = ReservationKey> {
        ("evt-[0-9]", prop_oneof![Just("GA"), Just("VIP"), Just("BALCONY")])
            .prop_map(|(event, class)| ReservationKey::new(event, class))
    }

    /// JSON values up to a few levels deep.
    pub fn json_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::from),
            "[a-z]{0,6}".prop_map(Value::String),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-z]{1,4}", inner, 0..4)
                    .prop_map(|members| Value::Object(members.into_iter().collect::<Map<_, _>>())),
            ]
        })
    }

    /// A JSON object together with the same members inserted in reverse.
    ///
    /// The two only differ in member order when `serde_json` is built with
    /// `preserve_order`.
    pub fn json_object_pair() -> impl Strategy<Value = (Value, Value)> {
        prop::collection::btree_map("[a-z]{1,4}", json_value(), 0..6).prop_map(|members| {
            let forward: Map<String, Value> = members.clone().into_iter().collect();
            let reversed: Map<String, Value> = members.into_iter().rev().collect();
            (Value::Object(forward), Value::Object(reversed))
        })
    }
}

pub use helpers::{ConcurrencyProbe, ProbeGuard, init_tracing};
pub use mocks::{FlakyOperation, HttpFailure, RecordingFetcher};
