//! Behavioural properties of the resilience primitives.
//!
//! Timer-driven tests run on a paused clock so observed delays are exact.

#![allow(clippy::unwrap_used)]

use boxoffice_core::{CanonicalKey, SessionId};
use boxoffice_core::error::{CircuitBreakerError, RetryError};
use boxoffice_runtime::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, State};
use boxoffice_runtime::limiter::ConcurrencyLimiter;
use boxoffice_runtime::loader::{KeyedLoader, KeyedLoaderConfig};
use boxoffice_runtime::reservation::{ReservationBook, ReservationConfig};
use boxoffice_runtime::retry::{RetryPolicy, retry_with_backoff};
use boxoffice_testing::properties::{json_object_pair, reservation_key};
use boxoffice_testing::{ConcurrencyProbe, HttpFailure, RecordingFetcher, init_tracing};
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{Instant, advance};

fn breaker(failure_threshold: usize, success_threshold: usize) -> CircuitBreaker {
    CircuitBreaker::new(
        "payments",
        CircuitBreakerConfig::builder()
            .failure_threshold(failure_threshold)
            .success_threshold(success_threshold)
            .reset_timeout(Duration::from_secs(30))
            .build(),
    )
}

async fn fail(breaker: &CircuitBreaker, invoked: &AtomicUsize) -> Result<(), CircuitBreakerError<HttpFailure>> {
    breaker
        .call(|| async {
            invoked.fetch_add(1, Ordering::SeqCst);
            Err(HttpFailure::new(500))
        })
        .await
}

async fn succeed(breaker: &CircuitBreaker) -> Result<(), CircuitBreakerError<HttpFailure>> {
    breaker.call(|| async { Ok(()) }).await
}

#[tokio::test(start_paused = true)]
async fn breaker_opens_at_threshold_and_rejects_without_invoking() {
    init_tracing();
    let breaker = breaker(3, 2);
    let invoked = AtomicUsize::new(0);

    for _ in 0..3 {
        assert!(matches!(
            fail(&breaker, &invoked).await,
            Err(CircuitBreakerError::Inner(_))
        ));
    }
    assert_eq!(breaker.state(), State::Open);

    for _ in 0..5 {
        assert!(fail(&breaker, &invoked).await.unwrap_err().is_open());
    }
    assert_eq!(invoked.load(Ordering::SeqCst), 3);

    advance(Duration::from_secs(29)).await;
    assert!(fail(&breaker, &invoked).await.unwrap_err().is_open());
    assert_eq!(invoked.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn breaker_recovers_after_consecutive_half_open_successes() {
    let breaker = breaker(2, 2);
    let invoked = AtomicUsize::new(0);
    let _ = fail(&breaker, &invoked).await;
    let _ = fail(&breaker, &invoked).await;

    advance(Duration::from_secs(30)).await;

    succeed(&breaker).await.unwrap();
    assert_eq!(breaker.state(), State::HalfOpen);
    assert_eq!(breaker.success_count(), 1);
    succeed(&breaker).await.unwrap();

    assert_eq!(breaker.state(), State::Closed);
    assert_eq!(breaker.failure_count(), 0);
    assert_eq!(breaker.success_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn breaker_reopens_on_half_open_failure() {
    let breaker = breaker(2, 3);
    let invoked = AtomicUsize::new(0);
    let _ = fail(&breaker, &invoked).await;
    let _ = fail(&breaker, &invoked).await;
    advance(Duration::from_secs(30)).await;

    succeed(&breaker).await.unwrap();
    let _ = fail(&breaker, &invoked).await;

    assert_eq!(breaker.state(), State::Open);
    assert_eq!(breaker.next_attempt_in(), Some(Duration::from_secs(30)));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn limiter_never_exceeds_its_bound_and_admits_in_order(
        max_concurrent in 1usize..6,
        durations in prop::collection::vec(1u64..50, 1..40),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .unwrap();

        let (peak, started) = runtime.block_on(async {
            let limiter = ConcurrencyLimiter::new("property", max_concurrent);
            let probe = ConcurrencyProbe::new();
            let started = Arc::new(Mutex::new(Vec::new()));

            let tasks = durations.iter().enumerate().map(|(index, millis)| {
                let probe = probe.clone();
                let started = Arc::clone(&started);
                let limiter = limiter.clone();
                let millis = *millis;
                async move {
                    limiter
                        .run(async move {
                            started.lock().unwrap().push(index);
                            probe.track(tokio::time::sleep(Duration::from_millis(millis))).await;
                        })
                        .await
                }
            });
            let results = futures::future::join_all(tasks).await;
            assert!(results.iter().all(Result::is_ok));

            let started = started.lock().unwrap().clone();
            (probe.max_observed(), started)
        });

        prop_assert!(peak <= max_concurrent);
        prop_assert_eq!(peak, max_concurrent.min(durations.len()));
        prop_assert_eq!(started, (0..durations.len()).collect::<Vec<_>>());
    }

    #[test]
    fn retry_delays_grow_geometrically_up_to_the_cap(
        initial_ms in 1u64..2_000,
        multiplier in 1.0f64..4.0,
        max_ms in 1u64..20_000,
        attempts in 1usize..12,
    ) {
        let policy = RetryPolicy::builder()
            .initial_delay(Duration::from_millis(initial_ms))
            .multiplier(multiplier)
            .max_delay(Duration::from_millis(max_ms))
            .build();
        let cap = Duration::from_millis(max_ms);

        let mut previous = Duration::ZERO;
        for attempt in 0..attempts {
            let delay = policy.delay_for_attempt(attempt);
            let exponent = i32::try_from(attempt).unwrap();
            #[allow(clippy::cast_precision_loss)]
            let expected_ms = (initial_ms as f64 * multiplier.powi(exponent)).min(max_ms as f64);

            prop_assert!(delay <= cap);
            // Float conversion may round down by a nanosecond
            prop_assert!(delay + Duration::from_nanos(1) >= previous);
            prop_assert!((delay.as_secs_f64() * 1_000.0 - expected_ms).abs() < 0.001);
            previous = delay;
        }
    }

    #[test]
    fn holds_exclude_other_sessions_on_every_key(
        keys in prop::collection::vec(reservation_key(), 1..20),
    ) {
        let book = ReservationBook::new(ReservationConfig::default());
        let a = book.session(SessionId::new());
        let b = book.session(SessionId::new());

        for key in &keys {
            prop_assert!(a.acquire(key.resource_id(), key.sub_type(), 1));
        }
        for key in &keys {
            prop_assert!(!b.acquire(key.resource_id(), key.sub_type(), 1));
            prop_assert!(a.holds(key.resource_id(), key.sub_type()));
        }
        let held = book.len();
        prop_assert_eq!(a.release_all(), held);
        prop_assert!(book.is_empty());
    }

    #[test]
    fn canonical_keys_ignore_member_order((forward, reversed) in json_object_pair()) {
        if forward.as_object().is_some_and(|members| members.len() > 1) {
            prop_assert_ne!(forward.to_string(), reversed.to_string());
        }
        prop_assert_eq!(CanonicalKey::from_value(&forward), CanonicalKey::from_value(&reversed));
    }
}

#[tokio::test(start_paused = true)]
async fn loader_dedups_within_window_and_serves_from_cache() {
    let fetcher = RecordingFetcher::new([("evt-1".to_string(), 120u32)]);
    let source = fetcher.clone();
    let loader = KeyedLoader::new(
        "events",
        KeyedLoaderConfig::builder()
            .window(Duration::from_millis(10))
            .cache_ttl(Duration::from_secs(300))
            .build(),
        move |keys: Vec<String>| source.fetch(keys),
    );

    let (a, b) = tokio::join!(loader.load("evt-1".into()), loader.load("evt-1".into()));
    assert_eq!(a.unwrap(), Some(120));
    assert_eq!(b.unwrap(), Some(120));
    assert_eq!(fetcher.batches(), vec![vec!["evt-1".to_string()]]);

    // The backend changes, but the cached value is still live
    fetcher.set("evt-1".to_string(), 80);
    advance(Duration::from_secs(299)).await;
    assert_eq!(loader.load("evt-1".into()).await.unwrap(), Some(120));
    assert_eq!(fetcher.fetch_count(), 1);

    advance(Duration::from_secs(2)).await;
    assert_eq!(loader.load("evt-1".into()).await.unwrap(), Some(80));
    assert_eq!(fetcher.fetch_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn reservation_is_exclusive_until_expiry_or_release() {
    let book = ReservationBook::new(
        ReservationConfig::builder()
            .lock_duration(Duration::from_secs(300))
            .build(),
    );
    let a = book.session(SessionId::new());
    let b = book.session(SessionId::new());

    assert!(a.acquire("event1", "VIP", 2));
    assert!(!b.acquire("event1", "VIP", 1));

    // A keeps refreshing well past the original lock duration
    for _ in 0..5 {
        advance(Duration::from_secs(200)).await;
        assert!(a.acquire("event1", "VIP", 2));
        assert!(!b.acquire("event1", "VIP", 1));
    }

    advance(Duration::from_secs(300)).await;
    assert!(b.acquire("event1", "VIP", 1));
    assert!(!a.holds("event1", "VIP"));

    assert!(b.release("event1", "VIP"));
    assert!(a.acquire("event1", "VIP", 3));
    book.shutdown();
}

#[tokio::test(start_paused = true)]
async fn retry_delays_match_the_backoff_schedule() {
    let policy = RetryPolicy::builder()
        .max_retries(3)
        .initial_delay(Duration::from_millis(1000))
        .multiplier(2.0)
        .max_delay(Duration::from_millis(10_000))
        .build();
    let started = Instant::now();
    let seen = Mutex::new(Vec::new());

    let result = retry_with_backoff(&policy, || {
        seen.lock().unwrap().push(started.elapsed());
        async { Err::<(), _>(HttpFailure::with_message(503, "try later")) }
    })
    .await;

    let seen = seen.into_inner().unwrap();
    let gaps: Vec<Duration> = seen.windows(2).map(|pair| pair[1] - pair[0]).collect();
    assert_eq!(
        gaps,
        vec![
            Duration::from_millis(1000),
            Duration::from_millis(2000),
            Duration::from_millis(4000)
        ]
    );

    match result {
        Err(RetryError::Exhausted { attempts, last }) => {
            assert_eq!(attempts, 4);
            assert_eq!(last, HttpFailure::with_message(503, "try later"));
        }
        #[allow(clippy::panic)] // Test assertion
        other => panic!("expected exhausted retries, got {other:?}"),
    }
    // No sleep after the final failure
    assert_eq!(started.elapsed(), Duration::from_millis(7000));
}
