//! Speculative local updates reconciled against the server.
//!
//! [`OptimisticUpdateTracker::apply`] changes the displayed value right away
//! and remembers the value it replaced. [`commit`](OptimisticUpdateTracker::commit)
//! then awaits the authoritative call: success adopts the server's value,
//! failure rolls the update back.
//!
//! Rollback is per update, not an undo log. Each update restores the value it
//! saw when it was applied. If two pending updates touch the same state and
//! are rolled back out of order, the value left behind is whatever the last
//! rolled-back update saw, which may include the effect of an update that was
//! already undone. Callers that stack updates should roll them back newest
//! first.

use boxoffice_core::error::OptimisticError;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;

type RollbackFn<T> = Box<dyn FnOnce(&T) + Send>;

struct PendingUpdate<T> {
    id: String,
    previous: T,
    rollback: RollbackFn<T>,
    applied_at: Instant,
}

struct TrackerState<T> {
    current: T,
    /// Insertion order is rollback order for `rollback_all`.
    pending: Vec<PendingUpdate<T>>,
}

/// Tracks optimistic updates to one value.
///
/// Clones share the same value and pending set. Update and rollback closures
/// run while the tracker is locked and must not call back into it.
pub struct OptimisticUpdateTracker<T> {
    name: String,
    state: Arc<Mutex<TrackerState<T>>>,
}

impl<T> Clone for OptimisticUpdateTracker<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> OptimisticUpdateTracker<T> {
    fn lock(&self) -> MutexGuard<'_, TrackerState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for OptimisticUpdateTracker<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("OptimisticUpdateTracker")
            .field("name", &self.name)
            .field("current", &state.current)
            .field("pending", &state.pending.len())
            .finish()
    }
}

impl<T> OptimisticUpdateTracker<T>
where
    T: Clone + Send + 'static,
{
    /// Start tracking `initial`.
    pub fn new(name: impl Into<String>, initial: T) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(TrackerState {
                current: initial,
                pending: Vec::new(),
            })),
        }
    }

    /// Apply `update` to the current value and record how to undo it.
    ///
    /// `rollback` is called with the replaced value if the update is rolled
    /// back. Re-applying a pending id replaces that entry and keeps its place
    /// in the rollback order.
    pub fn apply<U, R>(&self, id: impl Into<String>, update: U, rollback: R) -> T
    where
        U: FnOnce(&T) -> T,
        R: FnOnce(&T) + Send + 'static,
    {
        let id = id.into();
        let mut state = self.lock();
        let next = update(&state.current);
        let previous = std::mem::replace(&mut state.current, next.clone());
        let entry = PendingUpdate {
            id,
            previous,
            rollback: Box::new(rollback),
            applied_at: Instant::now(),
        };
        match state.pending.iter_mut().find(|pending| pending.id == entry.id) {
            Some(slot) => *slot = entry,
            None => state.pending.push(entry),
        }
        next
    }

    /// Await the server's confirmation of update `id`.
    ///
    /// On success the update is settled and the server's value becomes
    /// current. On failure the update is rolled back.
    ///
    /// # Errors
    ///
    /// Returns `OptimisticError::UnknownUpdate` without running `server_call`
    /// if `id` is not pending, and `OptimisticError::Rejected` with the
    /// server's error after rolling back.
    pub async fn commit<F, E>(&self, id: &str, server_call: F) -> Result<T, OptimisticError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        if !self.is_pending(id) {
            return Err(OptimisticError::UnknownUpdate { id: id.to_string() });
        }

        match server_call.await {
            Ok(confirmed) => {
                let mut state = self.lock();
                state.pending.retain(|pending| pending.id != id);
                state.current = confirmed.clone();
                tracing::debug!(tracker = %self.name, update = id, "Optimistic update confirmed");
                Ok(confirmed)
            }
            Err(err) => {
                self.rollback(id);
                Err(OptimisticError::Rejected(err))
            }
        }
    }

    /// Undo update `id`: restore the value it replaced and run its rollback
    /// action. Returns the restored value, or `None` if `id` is not pending.
    pub fn rollback(&self, id: &str) -> Option<T> {
        let mut state = self.lock();
        let position = state.pending.iter().position(|pending| pending.id == id)?;
        let entry = state.pending.remove(position);
        state.current = entry.previous.clone();
        (entry.rollback)(&entry.previous);

        metrics::counter!("optimistic_rollbacks_total", "tracker" => self.name.clone())
            .increment(1);
        tracing::warn!(
            tracker = %self.name,
            update = id,
            pending_for = ?entry.applied_at.elapsed(),
            "Optimistic update rolled back"
        );
        Some(entry.previous)
    }

    /// Roll back every pending update in the order they were applied.
    /// Returns the number rolled back.
    pub fn rollback_all(&self) -> usize {
        let ids = self.pending();
        ids.iter().filter(|id| self.rollback(id).is_some()).count()
    }

    /// The displayed value.
    #[must_use]
    pub fn current(&self) -> T {
        self.lock().current.clone()
    }

    /// Ids of pending updates, in the order they were applied.
    #[must_use]
    pub fn pending(&self) -> Vec<String> {
        self.lock()
            .pending
            .iter()
            .map(|pending| pending.id.clone())
            .collect()
    }

    /// Whether update `id` awaits confirmation.
    #[must_use]
    pub fn is_pending(&self, id: &str) -> bool {
        self.lock().pending.iter().any(|pending| pending.id == id)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn tracker() -> OptimisticUpdateTracker<i64> {
        OptimisticUpdateTracker::new("seats", 10)
    }

    #[test]
    fn test_apply_updates_current_immediately() {
        let tracker = tracker();

        let next = tracker.apply("buy-2", |seats| seats - 2, |_| {});

        assert_eq!(next, 8);
        assert_eq!(tracker.current(), 8);
        assert!(tracker.is_pending("buy-2"));
    }

    #[tokio::test]
    async fn test_commit_adopts_server_value() {
        let tracker = tracker();
        tracker.apply("buy-2", |seats| seats - 2, |_| {});

        let confirmed = tracker
            .commit("buy-2", async { Ok::<_, String>(7) })
            .await
            .unwrap();

        assert_eq!(confirmed, 7);
        assert_eq!(tracker.current(), 7);
        assert!(tracker.pending().is_empty());
    }

    #[tokio::test]
    async fn test_failed_commit_rolls_back() {
        let tracker = tracker();
        let restored = Arc::new(Mutex::new(None));
        let seen = Arc::clone(&restored);
        tracker.apply("buy-2", |seats| seats - 2, move |previous| {
            *seen.lock().unwrap() = Some(*previous);
        });

        let err = tracker
            .commit("buy-2", async { Err::<i64, _>("sold out") })
            .await
            .unwrap_err();

        assert!(matches!(err, OptimisticError::Rejected("sold out")));
        assert_eq!(tracker.current(), 10);
        assert_eq!(*restored.lock().unwrap(), Some(10));
        assert!(!tracker.is_pending("buy-2"));
    }

    #[tokio::test]
    async fn test_commit_of_unknown_update_does_not_call_server() {
        let tracker = tracker();
        let mut called = false;

        let err = tracker
            .commit("missing", async {
                called = true;
                Ok::<_, String>(1)
            })
            .await
            .unwrap_err();

        assert!(matches!(err, OptimisticError::UnknownUpdate { id } if id == "missing"));
        assert!(!called);
    }

    #[test]
    fn test_rollback_all_in_apply_order() {
        let tracker = tracker();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (id, delta) in [("a", 1), ("b", 2), ("c", 3)] {
            let order = Arc::clone(&order);
            tracker.apply(id, move |v| v + delta, move |_| order.lock().unwrap().push(id));
        }

        assert_eq!(tracker.rollback_all(), 3);

        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
        // The last rollback restores the value "c" replaced
        assert_eq!(tracker.current(), 13);
    }

    #[test]
    fn test_out_of_order_rollback_restores_each_previous_value() {
        let tracker = tracker();
        tracker.apply("first", |v| v + 1, |_| {});
        tracker.apply("second", |v| v + 1, |_| {});

        assert_eq!(tracker.rollback("first"), Some(10));
        assert_eq!(tracker.current(), 10);

        // "second" saw 11, which includes the already-undone "first"
        assert_eq!(tracker.rollback("second"), Some(11));
        assert_eq!(tracker.current(), 11);
    }

    #[test]
    fn test_reapplying_an_id_keeps_its_position() {
        let tracker = tracker();
        tracker.apply("a", |v| v + 1, |_| {});
        tracker.apply("b", |v| v + 1, |_| {});
        tracker.apply("a", |v| v * 2, |_| {});

        assert_eq!(tracker.pending(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(tracker.current(), 24);
        assert_eq!(tracker.rollback("a"), Some(12));
    }

    #[test]
    fn test_rollback_unknown_is_none() {
        assert_eq!(tracker().rollback("nope"), None);
    }
}
