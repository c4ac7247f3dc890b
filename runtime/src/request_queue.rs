//! Throttled dispatcher: a concurrency cap plus a minimum spacing between
//! dispatch starts.
//!
//! Tasks are taken from the queue one at a time, in submission order. For each
//! task the dispatch loop:
//!
//! 1. waits for a concurrency slot,
//! 2. waits until `min_delay` has passed since the previous start,
//! 3. records the start time and spawns the task, which holds its slot until
//!    it completes.
//!
//! The cap bounds in-flight work; the spacing bounds the issue rate. Neither
//! depends on the other.

use async_trait::async_trait;
use boxoffice_core::config::RequestQueueSettings;
use boxoffice_core::error::QueueError;
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::limiter::ConcurrencyLimiter;
use crate::shutdown::{ShutdownError, ShutdownHandler};

/// Request queue configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestQueueConfig {
    /// Maximum tasks in flight
    pub max_concurrent: usize,
    /// Minimum time between two dispatch starts
    pub min_delay: Duration,
}

impl Default for RequestQueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 6,
            min_delay: Duration::from_millis(100),
        }
    }
}

impl From<&RequestQueueSettings> for RequestQueueConfig {
    fn from(settings: &RequestQueueSettings) -> Self {
        Self {
            max_concurrent: settings.max_concurrent,
            min_delay: settings.min_delay(),
        }
    }
}

impl RequestQueueConfig {
    /// Create a new configuration builder.
    #[must_use]
    pub const fn builder() -> RequestQueueConfigBuilder {
        RequestQueueConfigBuilder {
            max_concurrent: None,
            min_delay: None,
        }
    }
}

/// Builder for [`RequestQueueConfig`].
#[derive(Debug, Clone, Copy)]
pub struct RequestQueueConfigBuilder {
    max_concurrent: Option<usize>,
    min_delay: Option<Duration>,
}

impl RequestQueueConfigBuilder {
    /// Set the in-flight cap.
    #[must_use]
    pub const fn max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = Some(max);
        self
    }

    /// Set the minimum spacing between dispatch starts.
    #[must_use]
    pub const fn min_delay(mut self, delay: Duration) -> Self {
        self.min_delay = Some(delay);
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> RequestQueueConfig {
        let defaults = RequestQueueConfig::default();
        RequestQueueConfig {
            max_concurrent: self.max_concurrent.unwrap_or(defaults.max_concurrent),
            min_delay: self.min_delay.unwrap_or(defaults.min_delay),
        }
    }
}

type Job = BoxFuture<'static, ()>;

#[derive(Default)]
struct QueueState {
    jobs: VecDeque<Job>,
    /// A job has been taken by the dispatch loop but not yet started.
    staged: bool,
    /// Bumped by `clear()` so a staged job can tell it was cleared.
    generation: u64,
    closed: bool,
    dispatched: u64,
}

struct QueueInner {
    name: String,
    min_delay: Duration,
    limiter: ConcurrencyLimiter,
    state: Mutex<QueueState>,
    wake: Notify,
}

impl QueueInner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_next(&self) -> Option<(Job, u64)> {
        let mut state = self.lock();
        let job = state.jobs.pop_front()?;
        state.staged = true;
        Some((job, state.generation))
    }

    /// Decide whether a staged job still runs. Clears the staged flag.
    fn start_staged(&self, generation: u64) -> bool {
        let mut state = self.lock();
        state.staged = false;
        if state.closed || state.generation != generation {
            return false;
        }
        state.dispatched += 1;
        true
    }
}

/// Throttled FIFO dispatcher with its own background loop.
///
/// The loop is spawned on construction and stops on [`RequestQueue::shutdown`]
/// or when the queue is dropped. Tasks already started run to completion.
pub struct RequestQueue {
    inner: Arc<QueueInner>,
    dispatcher: JoinHandle<()>,
}

impl std::fmt::Debug for RequestQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestQueue")
            .field("name", &self.inner.name)
            .field("min_delay", &self.inner.min_delay)
            .field("pending", &self.pending())
            .field("active", &self.active_count())
            .finish()
    }
}

impl RequestQueue {
    /// Create a queue and start its dispatch loop.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn new(name: impl Into<String>, config: RequestQueueConfig) -> Self {
        let name = name.into();
        let inner = Arc::new(QueueInner {
            limiter: ConcurrencyLimiter::new(name.clone(), config.max_concurrent),
            name,
            min_delay: config.min_delay,
            state: Mutex::new(QueueState::default()),
            wake: Notify::new(),
        });
        let dispatcher = tokio::spawn(dispatch_loop(Arc::clone(&inner)));
        Self { inner, dispatcher }
    }

    /// Enqueue `task`. It is queued immediately; the returned future resolves
    /// with the task's output once it has run.
    ///
    /// Dropping the returned future does not cancel the task.
    ///
    /// # Errors
    ///
    /// The returned future yields `QueueError::Cleared` if the task was
    /// removed by `clear()` and `QueueError::Closed` if the queue was shut
    /// down before it ran.
    pub fn add<F, T>(
        &self,
        task: F,
    ) -> impl Future<Output = Result<T, QueueError>> + Send + use<F, T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let receiver = self.enqueue(task);
        async move {
            let receiver = receiver?;
            receiver.await.map_err(|_| QueueError::Cleared)
        }
    }

    fn enqueue<F, T>(&self, task: F) -> Result<oneshot::Receiver<T>, QueueError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.inner.lock();
            if state.closed {
                return Err(QueueError::Closed);
            }
            state.jobs.push_back(Box::pin(async move {
                // The caller may have stopped listening
                let _ = tx.send(task.await);
            }));
        }
        self.inner.wake.notify_one();
        Ok(rx)
    }

    /// Tasks accepted but not yet started.
    #[must_use]
    pub fn pending(&self) -> usize {
        let state = self.inner.lock();
        state.jobs.len() + usize::from(state.staged)
    }

    /// Tasks currently running.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.inner.limiter.active_count()
    }

    /// Tasks started since creation.
    #[must_use]
    pub fn dispatched(&self) -> u64 {
        self.inner.lock().dispatched
    }

    /// Queue name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Drop every task that has not started. Their callers receive
    /// `QueueError::Cleared`. Returns the number dropped.
    pub fn clear(&self) -> usize {
        let dropped = {
            let mut state = self.inner.lock();
            state.generation += 1;
            let dropped = state.jobs.len() + usize::from(state.staged);
            state.jobs.clear();
            dropped
        };
        if dropped > 0 {
            tracing::info!(queue = %self.inner.name, dropped, "Cleared request queue");
        }
        dropped
    }

    /// Stop accepting tasks, drop queued ones and stop the dispatch loop.
    pub fn shutdown(&self) {
        self.inner.lock().closed = true;
        self.clear();
        self.inner.limiter.close();
        self.inner.wake.notify_one();
    }
}

impl Drop for RequestQueue {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

#[async_trait]
impl ShutdownHandler for RequestQueue {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn shutdown(&self) -> Result<(), ShutdownError> {
        Self::shutdown(self);
        Ok(())
    }
}

async fn dispatch_loop(inner: Arc<QueueInner>) {
    let mut last_dispatch: Option<Instant> = None;

    loop {
        let Some((job, generation)) = inner.take_next() else {
            if inner.lock().closed {
                break;
            }
            inner.wake.notified().await;
            continue;
        };

        let Ok(permit) = inner.limiter.acquire().await else {
            inner.start_staged(generation);
            break;
        };

        if let Some(last) = last_dispatch {
            let since = last.elapsed();
            if since < inner.min_delay {
                tokio::time::sleep(inner.min_delay - since).await;
            }
        }

        if !inner.start_staged(generation) {
            drop(permit);
            continue;
        }
        last_dispatch = Some(Instant::now());
        tokio::spawn(async move {
            job.await;
            drop(permit);
        });
    }

    tracing::debug!(queue = %inner.name, "Request queue dispatch loop stopped");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn queue(max_concurrent: usize, min_delay_ms: u64) -> RequestQueue {
        RequestQueue::new(
            "test",
            RequestQueueConfig::builder()
                .max_concurrent(max_concurrent)
                .min_delay(Duration::from_millis(min_delay_ms))
                .build(),
        )
    }

    fn record_start(
        starts: &Arc<Mutex<Vec<(usize, Duration)>>>,
        origin: Instant,
        id: usize,
        work: Duration,
    ) -> impl Future<Output = usize> + Send + 'static {
        let starts = Arc::clone(starts);
        async move {
            starts.lock().unwrap().push((id, origin.elapsed()));
            tokio::time::sleep(work).await;
            id
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_spaces_dispatch_starts() {
        let queue = queue(6, 100);
        let origin = Instant::now();
        let starts = Arc::new(Mutex::new(Vec::new()));

        let results: Vec<_> = (0..4)
            .map(|id| queue.add(record_start(&starts, origin, id, Duration::from_millis(10))))
            .collect();
        let outputs: Vec<usize> = futures::future::join_all(results)
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();

        assert_eq!(outputs, vec![0, 1, 2, 3]);
        let starts = starts.lock().unwrap().clone();
        let offsets: Vec<u128> = starts.iter().map(|(_, at)| at.as_millis()).collect();
        assert_eq!(offsets, vec![0, 100, 200, 300]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_caps_in_flight_tasks() {
        let queue = queue(2, 100);
        let origin = Instant::now();
        let starts = Arc::new(Mutex::new(Vec::new()));

        let results: Vec<_> = (0..4)
            .map(|id| queue.add(record_start(&starts, origin, id, Duration::from_millis(1000))))
            .collect();
        futures::future::join_all(results).await;

        let starts = starts.lock().unwrap().clone();
        let order: Vec<usize> = starts.iter().map(|(id, _)| *id).collect();
        let offsets: Vec<u128> = starts.iter().map(|(_, at)| at.as_millis()).collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
        assert_eq!(offsets, vec![0, 100, 1000, 1100]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_drops_queued_tasks() {
        let queue = queue(1, 0);
        let ran = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let blocker = queue.add(async move {
            let _ = release_rx.await;
        });
        tokio::task::yield_now().await;
        assert_eq!(queue.active_count(), 1);

        let queued: Vec<_> = (0..3)
            .map(|_| {
                let ran = Arc::clone(&ran);
                queue.add(async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        tokio::task::yield_now().await;
        assert_eq!(queue.pending(), 3);

        assert_eq!(queue.clear(), 3);
        release_tx.send(()).unwrap();
        blocker.await.unwrap();

        for result in futures::future::join_all(queued).await {
            assert_eq!(result, Err(QueueError::Cleared));
        }
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_tasks() {
        let queue = queue(2, 0);
        assert_eq!(queue.add(async { 1 }).await, Ok(1));

        queue.shutdown();

        assert_eq!(queue.add(async { 2 }).await, Err(QueueError::Closed));
    }

    #[tokio::test]
    async fn test_task_runs_even_if_caller_stops_waiting() {
        let queue = queue(1, 0);
        let (done_tx, done_rx) = oneshot::channel();

        drop(queue.add(async move {
            let _ = done_tx.send("ran");
        }));

        assert_eq!(done_rx.await.unwrap(), "ran");
        assert_eq!(queue.dispatched(), 1);
    }
}
