//! Session-scoped, time-boxed inventory holds.
//!
//! A [`ReservationBook`] records which session holds which
//! `(resource, sub-type)` pair during checkout. It is an advisory, in-process
//! hold that stops a session racing itself across UI flows; it is not a
//! distributed lock.
//!
//! Rules for a key:
//!
//! - no live hold: the caller gets it for `lock_duration`
//! - live hold owned by the caller: expiry and quantity are refreshed
//! - live hold owned by another session: refused until it lapses or is released
//! - expired hold: treated as absent and reclaimable by anyone
//!
//! A background sweeper purges expired holds every `sweep_interval`. It starts
//! on the first acquisition and stops on [`ReservationBook::shutdown`] or when
//! the last handle to the book is dropped.
//!
//! # Example
//!
//! ```
//! use boxoffice_core::SessionId;
//! use boxoffice_runtime::reservation::{ReservationBook, ReservationConfig};
//!
//! # async fn example() {
//! let book = ReservationBook::new(ReservationConfig::default());
//! let alice = book.session(SessionId::new());
//! let bob = book.session(SessionId::new());
//!
//! assert!(alice.acquire("evt-42", "GA", 4));
//! assert!(!bob.acquire("evt-42", "GA", 2));
//!
//! alice.release("evt-42", "GA");
//! assert!(bob.acquire("evt-42", "GA", 2));
//! # }
//! ```

use async_trait::async_trait;
use boxoffice_core::config::ReservationSettings;
use boxoffice_core::error::ReservationError;
use boxoffice_core::ids::{ReservationKey, SessionId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::shutdown::{ShutdownError, ShutdownHandler};

/// Reservation configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservationConfig {
    /// How long a hold lasts after acquisition or refresh
    pub lock_duration: Duration,
    /// How often expired holds are purged
    pub sweep_interval: Duration,
}

impl Default for ReservationConfig {
    fn default() -> Self {
        Self {
            lock_duration: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl From<&ReservationSettings> for ReservationConfig {
    fn from(settings: &ReservationSettings) -> Self {
        Self {
            lock_duration: settings.lock_duration(),
            sweep_interval: settings.sweep_interval(),
        }
    }
}

impl ReservationConfig {
    /// Create a new configuration builder.
    #[must_use]
    pub const fn builder() -> ReservationConfigBuilder {
        ReservationConfigBuilder {
            lock_duration: None,
            sweep_interval: None,
        }
    }
}

/// Builder for [`ReservationConfig`].
#[derive(Debug, Clone, Copy)]
pub struct ReservationConfigBuilder {
    lock_duration: Option<Duration>,
    sweep_interval: Option<Duration>,
}

impl ReservationConfigBuilder {
    /// Set the hold lifetime.
    #[must_use]
    pub const fn lock_duration(mut self, duration: Duration) -> Self {
        self.lock_duration = Some(duration);
        self
    }

    /// Set the sweep period.
    #[must_use]
    pub const fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = Some(interval);
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> ReservationConfig {
        let defaults = ReservationConfig::default();
        ReservationConfig {
            lock_duration: self.lock_duration.unwrap_or(defaults.lock_duration),
            sweep_interval: self.sweep_interval.unwrap_or(defaults.sweep_interval),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ReservationEntry {
    quantity: u32,
    expires_at: Instant,
    owner: SessionId,
}

impl ReservationEntry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// A live hold, as seen by its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationHold {
    /// Held key
    pub key: ReservationKey,
    /// Units held
    pub quantity: u32,
    /// When the hold lapses unless refreshed
    pub expires_at: Instant,
}

#[derive(Debug, Default)]
struct Sweeper {
    handle: Option<JoinHandle<()>>,
    stopped: bool,
}

#[derive(Debug)]
struct BookInner {
    config: ReservationConfig,
    entries: Mutex<HashMap<ReservationKey, ReservationEntry>>,
    sweeper: Mutex<Sweeper>,
}

impl BookInner {
    fn entries(&self) -> MutexGuard<'_, HashMap<ReservationKey, ReservationEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sweeper(&self) -> MutexGuard<'_, Sweeper> {
        self.sweeper.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        let removed = before - entries.len();
        if removed > 0 {
            metrics::counter!("reservations_swept_total").increment(removed as u64);
            tracing::debug!(removed, remaining = entries.len(), "Swept expired reservations");
        }
        removed
    }
}

impl Drop for BookInner {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper().handle.take() {
            handle.abort();
        }
    }
}

/// Process-wide record of inventory holds.
///
/// Construct one at start-up and hand out per-session views with
/// [`ReservationBook::session`]. Clones share the same holds.
#[derive(Debug, Clone)]
pub struct ReservationBook {
    inner: Arc<BookInner>,
}

impl ReservationBook {
    /// Create an empty book. The sweeper starts on first acquisition.
    #[must_use]
    pub fn new(config: ReservationConfig) -> Self {
        Self {
            inner: Arc::new(BookInner {
                config,
                entries: Mutex::new(HashMap::new()),
                sweeper: Mutex::new(Sweeper::default()),
            }),
        }
    }

    /// A view of the book acting as `session`.
    #[must_use]
    pub fn session(&self, session: SessionId) -> SessionReservations {
        SessionReservations {
            book: self.clone(),
            session,
        }
    }

    /// Purge expired holds now. Returns the number removed.
    pub fn sweep(&self) -> usize {
        self.inner.sweep()
    }

    /// Stored holds, including expired ones not yet swept.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.entries().len()
    }

    /// Whether no holds are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured hold lifetime.
    #[must_use]
    pub fn lock_duration(&self) -> Duration {
        self.inner.config.lock_duration
    }

    /// Whether the background sweeper is running.
    #[must_use]
    pub fn is_sweeping(&self) -> bool {
        self.inner
            .sweeper()
            .handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stop the background sweeper. Holds stay in place and expired ones are
    /// still ignored on lookup; they are just no longer purged in bulk.
    pub fn shutdown(&self) {
        let mut sweeper = self.inner.sweeper();
        sweeper.stopped = true;
        if let Some(handle) = sweeper.handle.take() {
            handle.abort();
            tracing::debug!("Reservation sweeper stopped");
        }
    }

    fn ensure_sweeper(&self) {
        let mut sweeper = self.inner.sweeper();
        if sweeper.stopped || sweeper.handle.is_some() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("No Tokio runtime; reservation sweeper not started");
            return;
        };
        let period = self.inner.config.sweep_interval;
        let book = Arc::downgrade(&self.inner);
        sweeper.handle = Some(runtime.spawn(sweep_loop(book, period)));
        tracing::debug!(interval = ?period, "Reservation sweeper started");
    }
}

async fn sweep_loop(book: Weak<BookInner>, period: Duration) {
    let period = period.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = book.upgrade() else {
            break;
        };
        inner.sweep();
    }
}

#[async_trait]
impl ShutdownHandler for ReservationBook {
    fn name(&self) -> &str {
        "reservations"
    }

    async fn shutdown(&self) -> Result<(), ShutdownError> {
        Self::shutdown(self);
        Ok(())
    }
}

/// The reservation book as seen by one session.
///
/// Every operation is checked against this session's ownership.
#[derive(Debug, Clone)]
pub struct SessionReservations {
    book: ReservationBook,
    session: SessionId,
}

impl SessionReservations {
    /// The session this view acts as.
    #[must_use]
    pub const fn session_id(&self) -> SessionId {
        self.session
    }

    /// The shared book.
    #[must_use]
    pub const fn book(&self) -> &ReservationBook {
        &self.book
    }

    /// Hold `quantity` units of `(resource_id, sub_type)`. Returns whether the
    /// hold was granted or refreshed.
    pub fn acquire(&self, resource_id: &str, sub_type: &str, quantity: u32) -> bool {
        self.try_acquire(resource_id, sub_type, quantity).is_ok()
    }

    /// Like [`acquire`](Self::acquire), reporting why a hold was refused.
    ///
    /// # Errors
    ///
    /// Returns `ReservationError::Conflict` if another session holds a live
    /// reservation for the key, and `ReservationError::InvalidQuantity` for a
    /// zero quantity.
    pub fn try_acquire(
        &self,
        resource_id: &str,
        sub_type: &str,
        quantity: u32,
    ) -> Result<ReservationHold, ReservationError> {
        if quantity == 0 {
            return Err(ReservationError::InvalidQuantity);
        }
        let key = ReservationKey::new(resource_id, sub_type);
        let now = Instant::now();
        let expires_at = now + self.book.inner.config.lock_duration;

        {
            let mut entries = self.book.inner.entries();
            let holder_expiry = entries
                .get(&key)
                .filter(|entry| entry.is_live(now) && entry.owner != self.session)
                .map(|entry| entry.expires_at);
            if let Some(holder_expiry) = holder_expiry {
                drop(entries);
                let expires_in = holder_expiry.saturating_duration_since(now);
                metrics::counter!("reservation_conflicts_total").increment(1);
                tracing::debug!(
                    key = %key,
                    session = %self.session,
                    expires_in = ?expires_in,
                    "Reservation conflict"
                );
                return Err(ReservationError::Conflict { key, expires_in });
            }
            entries.insert(
                key.clone(),
                ReservationEntry {
                    quantity,
                    expires_at,
                    owner: self.session,
                },
            );
        }

        self.book.ensure_sweeper();
        tracing::debug!(key = %key, session = %self.session, quantity, "Reservation held");
        Ok(ReservationHold {
            key,
            quantity,
            expires_at,
        })
    }

    /// Drop this session's hold on the key. Holds owned by other sessions are
    /// left alone. Returns whether a hold was removed.
    pub fn release(&self, resource_id: &str, sub_type: &str) -> bool {
        let key = ReservationKey::new(resource_id, sub_type);
        let mut entries = self.book.inner.entries();
        let owned = entries
            .get(&key)
            .is_some_and(|entry| entry.owner == self.session);
        if owned {
            entries.remove(&key);
            tracing::debug!(key = %key, session = %self.session, "Reservation released");
        }
        owned
    }

    /// Push this session's live hold out to a full `lock_duration` from now.
    /// Returns whether the hold existed.
    pub fn extend(&self, resource_id: &str, sub_type: &str) -> bool {
        self.try_extend(resource_id, sub_type).is_ok()
    }

    /// Like [`extend`](Self::extend), returning the refreshed hold.
    ///
    /// # Errors
    ///
    /// Returns `ReservationError::NotHeld` if this session has no live hold
    /// on the key.
    pub fn try_extend(
        &self,
        resource_id: &str,
        sub_type: &str,
    ) -> Result<ReservationHold, ReservationError> {
        let key = ReservationKey::new(resource_id, sub_type);
        let now = Instant::now();
        let mut entries = self.book.inner.entries();
        match entries.get_mut(&key) {
            Some(entry) if entry.is_live(now) && entry.owner == self.session => {
                entry.expires_at = now + self.book.inner.config.lock_duration;
                Ok(ReservationHold {
                    quantity: entry.quantity,
                    expires_at: entry.expires_at,
                    key,
                })
            }
            _ => Err(ReservationError::NotHeld { key }),
        }
    }

    /// Drop every hold this session owns. Returns the number removed.
    pub fn release_all(&self) -> usize {
        let mut entries = self.book.inner.entries();
        let before = entries.len();
        entries.retain(|_, entry| entry.owner != self.session);
        let removed = before - entries.len();
        if removed > 0 {
            tracing::debug!(session = %self.session, removed, "Released all session reservations");
        }
        removed
    }

    /// Whether this session holds a live reservation on the key.
    #[must_use]
    pub fn holds(&self, resource_id: &str, sub_type: &str) -> bool {
        self.quantity(resource_id, sub_type).is_some()
    }

    /// Units this session holds on the key, if the hold is live.
    #[must_use]
    pub fn quantity(&self, resource_id: &str, sub_type: &str) -> Option<u32> {
        let key = ReservationKey::new(resource_id, sub_type);
        let now = Instant::now();
        self.book
            .inner
            .entries()
            .get(&key)
            .filter(|entry| entry.is_live(now) && entry.owner == self.session)
            .map(|entry| entry.quantity)
    }

    /// Every live hold this session owns, ordered by key.
    #[must_use]
    pub fn held_by_session(&self) -> Vec<ReservationHold> {
        let now = Instant::now();
        let mut holds: Vec<ReservationHold> = self
            .book
            .inner
            .entries()
            .iter()
            .filter(|(_, entry)| entry.is_live(now) && entry.owner == self.session)
            .map(|(key, entry)| ReservationHold {
                key: key.clone(),
                quantity: entry.quantity,
                expires_at: entry.expires_at,
            })
            .collect();
        holds.sort_by(|a, b| a.key.cmp(&b.key));
        holds
    }
}
