//! Checkout pipeline end to end: sessions, availability reads, throttled
//! purchase dispatch and the shared purchase breaker.

#![allow(clippy::unwrap_used)]

use boxoffice_core::{CircuitBreakerError, ReservationError, ReservationKey, SessionId};
use boxoffice_runtime::checkout::{
    CartStatus, CheckoutCoordinator, CheckoutError, CheckoutRequest, PURCHASE_DOWNSTREAM,
    PurchaseReceipt,
};
use boxoffice_runtime::circuit_breaker::{CircuitBreakerConfig, State};
use boxoffice_runtime::loader::{KeyedLoader, KeyedLoaderConfig};
use boxoffice_runtime::registry::ResilienceRegistry;
use boxoffice_runtime::request_queue::RequestQueueConfig;
use boxoffice_runtime::reservation::{ReservationBook, ReservationConfig};
use boxoffice_runtime::retry::RetryPolicy;
use boxoffice_runtime::shutdown::ShutdownCoordinator;
use boxoffice_testing::{HttpFailure, RecordingFetcher, init_tracing};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

struct Storefront {
    book: ReservationBook,
    registry: Arc<ResilienceRegistry>,
    inventory: RecordingFetcher<ReservationKey, u32>,
    availability: KeyedLoader<ReservationKey, u32, HttpFailure>,
}

impl Storefront {
    fn new() -> Self {
        init_tracing();
        let inventory = RecordingFetcher::new([
            (ReservationKey::new("evt-42", "GA"), 10),
            (ReservationKey::new("evt-42", "VIP"), 2),
        ]);
        let source = inventory.clone();
        let availability = KeyedLoader::new(
            "availability",
            KeyedLoaderConfig::builder()
                .window(Duration::from_millis(10))
                .build(),
            move |keys: Vec<ReservationKey>| source.fetch(keys),
        );
        let registry = Arc::new(ResilienceRegistry::new(
            CircuitBreakerConfig::builder()
                .failure_threshold(2)
                .reset_timeout(Duration::from_secs(30))
                .build(),
            4,
            RequestQueueConfig::builder()
                .max_concurrent(2)
                .min_delay(Duration::from_millis(100))
                .build(),
        ));
        Self {
            book: ReservationBook::new(ReservationConfig::default()),
            registry,
            inventory,
            availability,
        }
    }

    fn session(&self, max_retries: usize) -> CheckoutCoordinator<HttpFailure> {
        CheckoutCoordinator::new(
            self.book.session(SessionId::new()),
            self.availability.clone(),
            &self.registry,
            RetryPolicy::builder()
                .max_retries(max_retries)
                .initial_delay(Duration::from_millis(250))
                .build(),
        )
    }
}

fn confirm(remaining: u32) -> impl Fn(CheckoutRequest) -> std::future::Ready<Result<PurchaseReceipt, HttpFailure>>
+ Send
+ Sync
+ 'static {
    move |request| {
        std::future::ready(Ok(PurchaseReceipt {
            confirmation: format!("ORD-{}", request.key),
            remaining,
        }))
    }
}

#[tokio::test(start_paused = true)]
async fn racing_sessions_one_wins_the_hold() {
    let store = Storefront::new();
    let alice = store.session(1);
    let bob = store.session(1);
    let request = CheckoutRequest::new("evt-42", "VIP", 2);

    let (a, b) = tokio::join!(
        alice.checkout(&request, confirm(0)),
        bob.checkout(&request, confirm(0))
    );

    assert_eq!(a.unwrap().remaining, 0);
    assert!(matches!(
        b,
        Err(CheckoutError::Reservation(ReservationError::Conflict { .. }))
    ));
    // Only the winner read availability
    assert_eq!(store.inventory.fetch_count(), 1);
    assert_eq!(bob.cart().current(), CartStatus::Idle);

    // The winner's hold is gone, and the confirmed stock is cached
    let retry = bob.checkout(&request, confirm(0)).await.unwrap_err();
    assert!(matches!(
        retry,
        CheckoutError::Unavailable {
            requested: 2,
            available: 0,
            ..
        }
    ));
    assert_eq!(store.inventory.fetch_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn purchases_from_many_sessions_are_spaced_by_the_queue() {
    let store = Storefront::new();
    let sessions: Vec<_> = (0..3).map(|_| store.session(0)).collect();
    let started = Instant::now();
    let starts = Arc::new(std::sync::Mutex::new(Vec::new()));

    let requests: Vec<CheckoutRequest> = (0..3)
        .map(|index| CheckoutRequest::new("evt-42", format!("GA-{index}"), 1))
        .collect();
    for request in &requests {
        store.inventory.set(request.key.clone(), 5);
    }

    let checkouts = sessions.iter().zip(&requests).map(|(session, request)| {
        let starts = Arc::clone(&starts);
        session.checkout(request, move |request: CheckoutRequest| {
            starts.lock().unwrap().push(started.elapsed());
            std::future::ready(Ok(PurchaseReceipt {
                confirmation: request.key.to_string(),
                remaining: 4,
            }))
        })
    });
    let results = futures::future::join_all(checkouts).await;

    assert!(results.iter().all(Result::is_ok));
    let mut starts = starts.lock().unwrap().clone();
    starts.sort();
    for pair in starts.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_millis(100));
    }
}

#[tokio::test(start_paused = true)]
async fn failing_backend_trips_the_shared_breaker() {
    let store = Storefront::new();
    let first = store.session(0);
    let second = store.session(0);
    let third = store.session(0);
    let down = |_: CheckoutRequest| std::future::ready(Err::<PurchaseReceipt, _>(HttpFailure::new(500)));

    let a = first
        .checkout(&CheckoutRequest::new("evt-42", "GA", 1), down)
        .await
        .unwrap_err();
    let b = second
        .checkout(&CheckoutRequest::new("evt-42", "VIP", 1), down)
        .await
        .unwrap_err();

    assert!(a.is_retryable() && b.is_retryable());
    assert_eq!(
        store.registry.circuit_breaker(PURCHASE_DOWNSTREAM).state(),
        State::Open
    );

    // A third session is turned away without reaching the backend
    let rejected = third
        .checkout(&CheckoutRequest::new("evt-42", "GA", 1), confirm(9))
        .await
        .unwrap_err();
    assert!(matches!(
        rejected,
        CheckoutError::Reservation(ReservationError::Conflict { .. })
    ));
    let c = third
        .checkout(&CheckoutRequest::new("evt-42", "BALCONY", 1), confirm(9))
        .await
        .unwrap_err();
    assert!(matches!(c, CheckoutError::NotFound { .. }));

    store.inventory.set(ReservationKey::new("evt-42", "BALCONY"), 3);
    let d = third
        .checkout(&CheckoutRequest::new("evt-42", "BALCONY", 1), confirm(2))
        .await
        .unwrap_err();
    assert!(matches!(
        d,
        CheckoutError::Purchase {
            last: CircuitBreakerError::Open { .. },
            ..
        }
    ));

    // After the reset timeout the breaker lets a probe through
    tokio::time::advance(Duration::from_secs(30)).await;
    let receipt = third
        .checkout(&CheckoutRequest::new("evt-42", "BALCONY", 1), confirm(2))
        .await
        .unwrap();
    assert_eq!(receipt.remaining, 2);
}

#[tokio::test(start_paused = true)]
async fn backend_outage_on_availability_keeps_the_hold() {
    let store = Storefront::new();
    let session = store.session(0);
    store.inventory.fail_next(HttpFailure::new(503));

    let err = session
        .checkout(&CheckoutRequest::new("evt-42", "GA", 2), confirm(8))
        .await
        .unwrap_err();

    assert!(matches!(err, CheckoutError::Availability(_)));
    assert!(err.is_retryable());
    assert!(session.session().holds("evt-42", "GA"));

    let receipt = session
        .checkout(&CheckoutRequest::new("evt-42", "GA", 2), confirm(8))
        .await
        .unwrap();
    assert_eq!(receipt.remaining, 8);
    assert!(!session.session().holds("evt-42", "GA"));
}

#[tokio::test(start_paused = true)]
async fn coordinated_shutdown_stops_background_work() {
    let store = Storefront::new();
    let session = store.session(0);
    session
        .checkout(&CheckoutRequest::new("evt-42", "GA", 1), confirm(9))
        .await
        .unwrap();
    assert!(session.session().acquire("evt-42", "VIP", 1));
    assert!(store.book.is_sweeping());

    let mut shutdown = ShutdownCoordinator::new(Duration::from_secs(1));
    shutdown.register(Arc::new(store.book.clone()));
    shutdown.register(Arc::new(store.availability.clone()));
    let registry: Arc<ResilienceRegistry> = Arc::clone(&store.registry);
    shutdown.register(registry);
    shutdown.shutdown().await.unwrap();

    assert!(!store.book.is_sweeping());
    let err = session
        .checkout(&CheckoutRequest::new("evt-42", "GA", 1), confirm(8))
        .await
        .unwrap_err();
    assert!(matches!(err, CheckoutError::Queue(_)));
}
