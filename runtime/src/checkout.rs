//! The checkout pipeline.
//!
//! [`CheckoutCoordinator::checkout`] runs one purchase for a session:
//!
//! 1. hold the tickets in the session's [`SessionReservations`],
//! 2. read availability through a [`KeyedLoader`],
//! 3. flip the displayed cart to [`CartStatus::Purchasing`],
//! 4. send the purchase through the `purchases` [`RequestQueue`], retrying
//!    transient failures, behind the `purchases` [`CircuitBreaker`],
//! 5. settle the cart: a confirmed purchase releases the hold and caches the
//!    remaining availability; a failure rolls the cart back.
//!
//! A failed checkout keeps the hold when the failure is transient (see
//! [`CheckoutError::is_retryable`]) so the session can try again before it
//! lapses. Any other failure releases it.

use boxoffice_core::error::{
    BatchError, CircuitBreakerError, QueueError, ReservationError, Retryable,
};
use boxoffice_core::ids::ReservationKey;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

use crate::circuit_breaker::CircuitBreaker;
use crate::loader::KeyedLoader;
use crate::optimistic::OptimisticUpdateTracker;
use crate::registry::ResilienceRegistry;
use crate::request_queue::RequestQueue;
use crate::reservation::SessionReservations;
use crate::retry::{RetryPolicy, retry_with_predicate};

/// Registry key of the purchase downstream's queue and breaker.
pub const PURCHASE_DOWNSTREAM: &str = "purchases";

/// Availability reads: remaining units per key.
pub type AvailabilityLoader<E> = KeyedLoader<ReservationKey, u32, E>;

/// What to buy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutRequest {
    /// Event and ticket class
    pub key: ReservationKey,
    /// Units to buy
    pub quantity: u32,
}

impl CheckoutRequest {
    /// Request `quantity` units of `(resource_id, sub_type)`.
    pub fn new(resource_id: impl Into<String>, sub_type: impl Into<String>, quantity: u32) -> Self {
        Self {
            key: ReservationKey::new(resource_id, sub_type),
            quantity,
        }
    }
}

/// The backend's confirmation of a purchase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseReceipt {
    /// Order confirmation code
    pub confirmation: String,
    /// Units still on sale after this purchase
    pub remaining: u32,
}

/// Cart state shown to the user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CartStatus {
    /// Nothing in progress
    #[default]
    Idle,
    /// A purchase has been sent and is awaiting confirmation
    Purchasing {
        /// Key being bought
        key: ReservationKey,
        /// Units being bought
        quantity: u32,
    },
    /// The backend confirmed the purchase
    Purchased {
        /// Key bought
        key: ReservationKey,
        /// Units bought
        quantity: u32,
        /// Order confirmation code
        confirmation: String,
    },
}

/// Errors from a checkout.
#[derive(Error, Debug)]
pub enum CheckoutError<E> {
    /// The tickets could not be held for this session.
    #[error(transparent)]
    Reservation(#[from] ReservationError),
    /// Availability could not be read.
    #[error("Availability lookup failed: {0}")]
    Availability(BatchError<E>),
    /// The key is not on sale.
    #[error("{key} is not on sale")]
    NotFound {
        /// Requested key
        key: ReservationKey,
    },
    /// Fewer units are on sale than requested.
    #[error("Only {available} of {requested} requested units of {key} are available")]
    Unavailable {
        /// Requested key
        key: ReservationKey,
        /// Units requested
        requested: u32,
        /// Units on sale
        available: u32,
    },
    /// The purchase queue dropped the call.
    #[error("Purchase was not dispatched: {0}")]
    Queue(QueueError),
    /// The purchase call failed.
    #[error("Purchase failed after {attempts} attempt(s): {last}")]
    Purchase {
        /// Calls made, including retries
        attempts: usize,
        /// Error from the final call
        last: CircuitBreakerError<E>,
    },
}

impl<E: Retryable> CheckoutError<E> {
    /// Whether the same session may succeed by trying again shortly.
    ///
    /// Backend errors follow their own classification. An open circuit and a
    /// timed-out purchase count as transient here: the breaker recovers on
    /// its own, and a timed-out purchase may still have gone through.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Availability(BatchError::Failed(err)) => err.is_retryable(),
            Self::Purchase { last, .. } => match last {
                CircuitBreakerError::Inner(err) => err.is_retryable(),
                CircuitBreakerError::Open { .. } | CircuitBreakerError::Timeout { .. } => true,
            },
            Self::Reservation(_)
            | Self::Availability(_)
            | Self::NotFound { .. }
            | Self::Unavailable { .. }
            | Self::Queue(_) => false,
        }
    }
}

/// Failure of one dispatched purchase attempt.
enum Attempt<E> {
    Queue(QueueError),
    Call(CircuitBreakerError<E>),
}

impl<E: Retryable> Attempt<E> {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Queue(_) => false,
            Self::Call(err) => err.is_retryable(),
        }
    }
}

impl<E: fmt::Display> fmt::Display for Attempt<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queue(err) => write!(f, "{err}"),
            Self::Call(err) => write!(f, "{err}"),
        }
    }
}

/// Runs checkouts for one session.
pub struct CheckoutCoordinator<E> {
    session: SessionReservations,
    availability: AvailabilityLoader<E>,
    queue: Arc<RequestQueue>,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    cart: OptimisticUpdateTracker<CartStatus>,
    next_update: AtomicU64,
}

impl<E> fmt::Debug for CheckoutCoordinator<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckoutCoordinator")
            .field("session", &self.session.session_id())
            .field("queue", &self.queue.name())
            .field("breaker", &self.breaker.key())
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl<E> CheckoutCoordinator<E>
where
    E: Retryable + fmt::Display + Send + Sync + 'static,
{
    /// Build a coordinator for `session`. The purchase queue and breaker are
    /// taken from `registry` under [`PURCHASE_DOWNSTREAM`], so every session
    /// shares them. Must be called from within a Tokio runtime.
    #[must_use]
    pub fn new(
        session: SessionReservations,
        availability: AvailabilityLoader<E>,
        registry: &ResilienceRegistry,
        retry: RetryPolicy,
    ) -> Self {
        let cart = OptimisticUpdateTracker::new(
            format!("cart-{}", session.session_id()),
            CartStatus::Idle,
        );
        Self {
            session,
            availability,
            queue: registry.request_queue(PURCHASE_DOWNSTREAM),
            breaker: registry.circuit_breaker(PURCHASE_DOWNSTREAM),
            retry,
            cart,
            next_update: AtomicU64::new(0),
        }
    }

    /// The session's reservations.
    #[must_use]
    pub const fn session(&self) -> &SessionReservations {
        &self.session
    }

    /// The availability loader.
    #[must_use]
    pub const fn availability(&self) -> &AvailabilityLoader<E> {
        &self.availability
    }

    /// The displayed cart.
    #[must_use]
    pub const fn cart(&self) -> &OptimisticUpdateTracker<CartStatus> {
        &self.cart
    }

    /// Buy `request` using `purchase` as the backend call. `purchase` is
    /// called once per attempt.
    ///
    /// # Errors
    ///
    /// Returns `CheckoutError::Reservation` if another session holds the
    /// tickets, `NotFound` or `Unavailable` if they are not on sale in the
    /// requested quantity, and `Availability`, `Queue` or `Purchase` when a
    /// call fails.
    pub async fn checkout<F, Fut>(
        &self,
        request: &CheckoutRequest,
        purchase: F,
    ) -> Result<PurchaseReceipt, CheckoutError<E>>
    where
        F: Fn(CheckoutRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<PurchaseReceipt, E>> + Send + 'static,
    {
        let key = &request.key;
        self.session
            .try_acquire(key.resource_id(), key.sub_type(), request.quantity)?;

        let outcome = self.purchase_held(request, purchase).await;
        match &outcome {
            Ok(receipt) => {
                self.session.release(key.resource_id(), key.sub_type());
                self.availability.prime(key.clone(), receipt.remaining);
                tracing::info!(
                    key = %key,
                    session = %self.session.session_id(),
                    quantity = request.quantity,
                    confirmation = %receipt.confirmation,
                    "Checkout confirmed"
                );
            }
            Err(err) if err.is_retryable() => {
                tracing::warn!(
                    key = %key,
                    session = %self.session.session_id(),
                    error = %err,
                    "Checkout failed, keeping reservation for another attempt"
                );
            }
            Err(err) => {
                self.session.release(key.resource_id(), key.sub_type());
                tracing::warn!(
                    key = %key,
                    session = %self.session.session_id(),
                    error = %err,
                    "Checkout failed, reservation released"
                );
            }
        }
        outcome
    }

    /// Leave checkout: drop every hold and undo any unconfirmed cart change.
    /// Returns the number of holds released.
    pub fn abandon(&self) -> usize {
        self.cart.rollback_all();
        self.session.release_all()
    }

    async fn purchase_held<F, Fut>(
        &self,
        request: &CheckoutRequest,
        purchase: F,
    ) -> Result<PurchaseReceipt, CheckoutError<E>>
    where
        F: Fn(CheckoutRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<PurchaseReceipt, E>> + Send + 'static,
    {
        let key = request.key.clone();
        let quantity = request.quantity;

        let available = self
            .availability
            .load(key.clone())
            .await
            .map_err(CheckoutError::Availability)?
            .ok_or_else(|| CheckoutError::NotFound { key: key.clone() })?;
        if available < quantity {
            return Err(CheckoutError::Unavailable {
                key,
                requested: quantity,
                available,
            });
        }

        let update_id = format!("checkout-{}", self.next_update.fetch_add(1, Ordering::Relaxed));
        let purchasing = key.clone();
        self.cart.apply(
            update_id.clone(),
            move |_| CartStatus::Purchasing {
                key: purchasing,
                quantity,
            },
            |_| {},
        );

        let outcome = self.dispatch(request.clone(), purchase).await;

        let confirmed = match &outcome {
            Ok(receipt) => Ok(CartStatus::Purchased {
                key,
                quantity,
                confirmation: receipt.confirmation.clone(),
            }),
            Err(_) => Err(()),
        };
        // A rejected commit has already rolled the cart back
        let _ = self.cart.commit(&update_id, async { confirmed }).await;

        outcome
    }

    async fn dispatch<F, Fut>(
        &self,
        request: CheckoutRequest,
        purchase: F,
    ) -> Result<PurchaseReceipt, CheckoutError<E>>
    where
        F: Fn(CheckoutRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<PurchaseReceipt, E>> + Send + 'static,
    {
        let purchase = Arc::new(purchase);

        let result = retry_with_predicate(
            &self.retry,
            || {
                let purchase = Arc::clone(&purchase);
                let breaker = self.breaker.clone();
                let request = request.clone();
                let queued = self
                    .queue
                    .add(async move { breaker.call(|| purchase(request)).await });
                async move {
                    match queued.await {
                        Ok(Ok(receipt)) => Ok(receipt),
                        Ok(Err(err)) => Err(Attempt::Call(err)),
                        Err(err) => Err(Attempt::Queue(err)),
                    }
                }
            },
            Attempt::is_retryable,
        )
        .await;

        result.map_err(|err| {
            let attempts = err.attempts();
            match err.into_inner() {
                Attempt::Queue(err) => CheckoutError::Queue(err),
                Attempt::Call(last) => CheckoutError::Purchase { attempts, last },
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{CircuitBreakerConfig, State};
    use crate::loader::KeyedLoaderConfig;
    use crate::request_queue::RequestQueueConfig;
    use crate::reservation::{ReservationBook, ReservationConfig};
    use boxoffice_core::ids::SessionId;
    use boxoffice_testing::{FlakyOperation, HttpFailure};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct Fixture {
        book: ReservationBook,
        registry: ResilienceRegistry,
        availability: AvailabilityLoader<HttpFailure>,
        fetches: Arc<AtomicUsize>,
    }

    impl Fixture {
        fn new(on_sale: u32) -> Self {
            let fetches = Arc::new(AtomicUsize::new(0));
            let counted = Arc::clone(&fetches);
            let availability = KeyedLoader::new(
                "availability",
                KeyedLoaderConfig::default(),
                move |keys: Vec<ReservationKey>| {
                    counted.fetch_add(1, Ordering::SeqCst);
                    async move {
                        Ok(keys
                            .iter()
                            .map(|key| (key.sub_type() != "VOID").then_some(on_sale))
                            .collect())
                    }
                },
            );
            let registry = ResilienceRegistry::new(
                CircuitBreakerConfig::builder().failure_threshold(3).build(),
                6,
                RequestQueueConfig::builder()
                    .min_delay(Duration::from_millis(10))
                    .build(),
            );
            Self {
                book: ReservationBook::new(ReservationConfig::default()),
                registry,
                availability,
                fetches,
            }
        }

        fn coordinator(&self) -> CheckoutCoordinator<HttpFailure> {
            CheckoutCoordinator::new(
                self.book.session(SessionId::new()),
                self.availability.clone(),
                &self.registry,
                RetryPolicy::builder()
                    .max_retries(2)
                    .initial_delay(Duration::from_millis(100))
                    .build(),
            )
        }
    }

    fn receipt(remaining: u32) -> PurchaseReceipt {
        PurchaseReceipt {
            confirmation: "ORD-1".to_string(),
            remaining,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_checkout() {
        let fixture = Fixture::new(10);
        let coordinator = fixture.coordinator();
        let request = CheckoutRequest::new("evt-1", "GA", 2);

        let result = coordinator
            .checkout(&request, |_| async { Ok(receipt(8)) })
            .await
            .unwrap();

        assert_eq!(result, receipt(8));
        assert!(!coordinator.session().holds("evt-1", "GA"));
        assert_eq!(
            coordinator.cart().current(),
            CartStatus::Purchased {
                key: request.key.clone(),
                quantity: 2,
                confirmation: "ORD-1".to_string(),
            }
        );
        // Remaining availability is served from the cache
        assert_eq!(coordinator.availability().peek(&request.key), Some(8));
        assert_eq!(fixture.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let fixture = Fixture::new(10);
        let coordinator = fixture.coordinator();
        let flaky = FlakyOperation::new(2, HttpFailure::new(503), receipt(7));
        let calls = flaky.clone();

        let result = coordinator
            .checkout(&CheckoutRequest::new("evt-1", "GA", 3), move |_| flaky.call())
            .await;

        assert_eq!(result.unwrap(), receipt(7));
        assert_eq!(calls.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_keep_the_reservation() {
        let fixture = Fixture::new(10);
        let coordinator = fixture.coordinator();

        let err = coordinator
            .checkout(&CheckoutRequest::new("evt-1", "GA", 1), |_| async {
                Err::<PurchaseReceipt, _>(HttpFailure::new(503))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, CheckoutError::Purchase { attempts: 3, .. }));
        assert!(err.is_retryable());
        assert!(coordinator.session().holds("evt-1", "GA"));
        assert_eq!(coordinator.cart().current(), CartStatus::Idle);
        assert!(coordinator.cart().pending().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_purchase_releases_the_reservation() {
        let fixture = Fixture::new(10);
        let coordinator = fixture.coordinator();
        let flaky = FlakyOperation::new(usize::MAX, HttpFailure::new(402), receipt(0));
        let calls = flaky.clone();

        let err = coordinator
            .checkout(&CheckoutRequest::new("evt-1", "GA", 1), move |_| flaky.call())
            .await
            .unwrap_err();

        assert!(matches!(err, CheckoutError::Purchase { attempts: 1, .. }));
        assert!(!err.is_retryable());
        assert_eq!(calls.calls(), 1);
        assert!(!coordinator.session().holds("evt-1", "GA"));
        assert_eq!(coordinator.cart().current(), CartStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_conflicting_session_is_refused_before_any_call() {
        let fixture = Fixture::new(10);
        let first = fixture.coordinator();
        let second = fixture.coordinator();
        assert!(first.session().acquire("evt-1", "GA", 2));
        let flaky = FlakyOperation::new(0, HttpFailure::new(500), receipt(9));
        let calls = flaky.clone();

        let err = second
            .checkout(&CheckoutRequest::new("evt-1", "GA", 1), move |_| flaky.call())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            CheckoutError::Reservation(ReservationError::Conflict { .. })
        ));
        assert_eq!(calls.calls(), 0);
        assert_eq!(fixture.fetches.load(Ordering::SeqCst), 0);
        assert!(first.session().holds("evt-1", "GA"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_insufficient_availability() {
        let fixture = Fixture::new(1);
        let coordinator = fixture.coordinator();

        let err = coordinator
            .checkout(&CheckoutRequest::new("evt-1", "GA", 4), |_| async {
                Ok(receipt(0))
            })
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            CheckoutError::Unavailable {
                requested: 4,
                available: 1,
                ..
            }
        ));
        assert!(!coordinator.session().holds("evt-1", "GA"));
        assert!(coordinator.cart().pending().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_key_is_not_found() {
        let fixture = Fixture::new(5);
        let coordinator = fixture.coordinator();

        let err = coordinator
            .checkout(&CheckoutRequest::new("evt-1", "VOID", 1), |_| async {
                Ok(receipt(0))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, CheckoutError::NotFound { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_keeps_the_reservation() {
        let fixture = Fixture::new(10);
        let coordinator = fixture.coordinator();
        for _ in 0..3 {
            let _ = fixture
                .registry
                .circuit_breaker(PURCHASE_DOWNSTREAM)
                .call(|| async { Err::<(), _>("down") })
                .await;
        }
        assert_eq!(
            fixture.registry.circuit_breaker(PURCHASE_DOWNSTREAM).state(),
            State::Open
        );

        let err = coordinator
            .checkout(&CheckoutRequest::new("evt-1", "GA", 1), |_| async {
                Ok(receipt(9))
            })
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            CheckoutError::Purchase {
                attempts: 1,
                last: CircuitBreakerError::Open { .. }
            }
        ));
        assert!(coordinator.session().holds("evt-1", "GA"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandon_releases_holds() {
        let fixture = Fixture::new(10);
        let coordinator = fixture.coordinator();
        assert!(coordinator.session().acquire("evt-1", "GA", 1));
        assert!(coordinator.session().acquire("evt-2", "VIP", 2));

        assert_eq!(coordinator.abandon(), 2);
        assert!(coordinator.session().held_by_session().is_empty());
    }
}
