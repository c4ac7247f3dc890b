//! Bounded-parallelism gate with a FIFO admission queue.
//!
//! At most `max_concurrent` tasks run at once. Callers beyond that wait in
//! arrival order. When a running task finishes, its slot is handed directly
//! to the head waiter, so `active` never exceeds the cap and a caller that
//! arrives during the hand-off cannot overtake the queue.
//!
//! ## Usage
//!
//! ```
//! use boxoffice_runtime::limiter::ConcurrencyLimiter;
//!
//! # async fn example() -> Result<(), boxoffice_core::QueueError> {
//! let limiter = ConcurrencyLimiter::new("inventory", 6);
//!
//! let seats = limiter.run(async { 4_u32 }).await?;
//! assert_eq!(seats, 4);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use boxoffice_core::config::LimiterSettings;
use boxoffice_core::error::QueueError;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;

use crate::shutdown::{ShutdownError, ShutdownHandler};

#[derive(Debug)]
struct Waiter {
    id: u64,
    wake: oneshot::Sender<()>,
}

#[derive(Debug)]
struct LimiterState {
    active: usize,
    waiters: VecDeque<Waiter>,
    next_waiter_id: u64,
    completed: u64,
    cleared: u64,
    closed: bool,
}

#[derive(Debug)]
struct LimiterInner {
    name: String,
    max_concurrent: usize,
    state: Mutex<LimiterState>,
}

impl LimiterInner {
    fn lock(&self) -> MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Give a finished slot to the head waiter, or return it to the pool.
    fn release(&self, state: &mut LimiterState) {
        state.completed += 1;
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.wake.send(()).is_ok() {
                self.publish(state);
                return;
            }
        }
        state.active = state.active.saturating_sub(1);
        self.publish(state);
    }

    #[allow(clippy::cast_precision_loss)]
    fn publish(&self, state: &LimiterState) {
        metrics::gauge!("limiter_active", "limiter" => self.name.clone()).set(state.active as f64);
        metrics::gauge!("limiter_queued", "limiter" => self.name.clone())
            .set(state.waiters.len() as f64);
    }
}

/// Snapshot of a limiter's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterStats {
    /// Tasks currently holding a slot
    pub active: usize,
    /// Callers waiting for a slot
    pub queued: usize,
    /// Configured cap
    pub max_concurrent: usize,
    /// Slots released since creation
    pub completed: u64,
    /// Waiters released by `clear()` without running
    pub cleared: u64,
}

/// A concurrency slot. Releasing it (by drop) wakes the next waiter.
#[derive(Debug)]
#[must_use = "the slot is released as soon as the permit is dropped"]
pub struct LimiterPermit {
    inner: Arc<LimiterInner>,
}

impl Drop for LimiterPermit {
    fn drop(&mut self) {
        let mut state = self.inner.lock();
        self.inner.release(&mut state);
    }
}

/// A queued acquisition. If the caller goes away after the slot was handed
/// over but before it was observed, the slot is passed on.
struct PendingSlot {
    inner: Arc<LimiterInner>,
    id: u64,
    wake: Option<oneshot::Receiver<()>>,
}

impl PendingSlot {
    async fn wait(&mut self) -> Result<(), QueueError> {
        let Some(wake) = self.wake.as_mut() else {
            return Err(QueueError::Cleared);
        };
        let outcome = wake.await;
        self.wake = None;
        outcome.map_err(|_| QueueError::Cleared)
    }
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        let Some(mut wake) = self.wake.take() else {
            return;
        };
        let mut state = self.inner.lock();
        let before = state.waiters.len();
        state.waiters.retain(|waiter| waiter.id != self.id);
        if state.waiters.len() != before {
            self.inner.publish(&state);
            return;
        }
        wake.close();
        if wake.try_recv().is_ok() {
            self.inner.release(&mut state);
        }
    }
}

/// Bounded-parallelism gate. Clones share the same slots and queue.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    inner: Arc<LimiterInner>,
}

impl ConcurrencyLimiter {
    /// Create a limiter.
    ///
    /// # Arguments
    ///
    /// * `name` - Label for logs and metrics (e.g., "inventory", "payments")
    /// * `max_concurrent` - Slot count; values below one are raised to one
    #[must_use]
    pub fn new(name: impl Into<String>, max_concurrent: usize) -> Self {
        let name = name.into();
        if max_concurrent == 0 {
            tracing::warn!(limiter = %name, "max_concurrent of 0 would never admit; using 1");
        }
        Self {
            inner: Arc::new(LimiterInner {
                name,
                max_concurrent: max_concurrent.max(1),
                state: Mutex::new(LimiterState {
                    active: 0,
                    waiters: VecDeque::new(),
                    next_waiter_id: 0,
                    completed: 0,
                    cleared: 0,
                    closed: false,
                }),
            }),
        }
    }

    /// Create a limiter from configuration.
    #[must_use]
    pub fn from_settings(name: impl Into<String>, settings: &LimiterSettings) -> Self {
        Self::new(name, settings.max_concurrent)
    }

    /// Wait for a slot.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Cleared` if `clear()` released this waiter and
    /// `QueueError::Closed` after `close()`.
    pub async fn acquire(&self) -> Result<LimiterPermit, QueueError> {
        let mut pending = {
            let mut state = self.inner.lock();
            if state.closed {
                return Err(QueueError::Closed);
            }
            if state.active < self.inner.max_concurrent && state.waiters.is_empty() {
                state.active += 1;
                self.inner.publish(&state);
                return Ok(LimiterPermit {
                    inner: Arc::clone(&self.inner),
                });
            }

            let (wake, woken) = oneshot::channel();
            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            state.waiters.push_back(Waiter { id, wake });
            self.inner.publish(&state);
            tracing::trace!(
                limiter = %self.inner.name,
                queued = state.waiters.len(),
                "Waiting for a concurrency slot"
            );
            PendingSlot {
                inner: Arc::clone(&self.inner),
                id,
                wake: Some(woken),
            }
        };

        pending.wait().await?;
        Ok(LimiterPermit {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Run `task` once a slot is free. The slot is released when the task
    /// finishes, whether it succeeds or fails.
    ///
    /// # Errors
    ///
    /// Returns a [`QueueError`] if the caller was released without running.
    /// The task's own output, including any error it carries, is returned in
    /// `Ok`.
    pub async fn run<F, T>(&self, task: F) -> Result<T, QueueError>
    where
        F: Future<Output = T>,
    {
        let permit = self.acquire().await?;
        let output = task.await;
        drop(permit);
        Ok(output)
    }

    /// Release every waiter without running its task. Running tasks are not
    /// affected. Returns the number of waiters released.
    pub fn clear(&self) -> usize {
        let mut state = self.inner.lock();
        let released = state.waiters.len();
        // Dropping the senders fails each waiter with `Cleared`
        state.waiters.clear();
        state.cleared += released as u64;
        self.inner.publish(&state);
        if released > 0 {
            tracing::info!(limiter = %self.inner.name, released, "Cleared limiter queue");
        }
        released
    }

    /// Refuse new callers and release current waiters.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.clear();
    }

    /// Tasks currently holding a slot.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.inner.lock().active
    }

    /// Callers waiting for a slot.
    #[must_use]
    pub fn queued_count(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    /// Configured cap.
    #[must_use]
    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }

    /// Limiter name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> LimiterStats {
        let state = self.inner.lock();
        LimiterStats {
            active: state.active,
            queued: state.waiters.len(),
            max_concurrent: self.inner.max_concurrent,
            completed: state.completed,
            cleared: state.cleared,
        }
    }
}

#[async_trait]
impl ShutdownHandler for ConcurrencyLimiter {
    async fn shutdown(&self) -> Result<(), ShutdownError> {
        self.close();
        Ok(())
    }

    fn name(&self) -> &str {
        &self.inner.name
    }
}
