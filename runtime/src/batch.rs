//! Collect items and hand them to a handler as one batch.
//!
//! A flush fires when `max_batch_size` items are queued or `max_wait` after
//! the first unflushed item arrived, whichever comes first. The handler gets
//! the items in arrival order and must return one result per item,
//! positionally. If it fails, every caller in that batch receives the same
//! error. One flush runs at a time; items queued while it runs are flushed as
//! soon as it completes.
//!
//! # Example
//!
//! ```
//! use boxoffice_runtime::batch::{BatchConfig, BatchProcessor};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let doubler = BatchProcessor::new(
//!     "doubler",
//!     BatchConfig::builder().max_batch_size(10).max_wait(Duration::from_millis(5)).build(),
//!     |items: Vec<u32>| async move { Ok::<_, String>(items.into_iter().map(|i| i * 2).collect()) },
//! );
//!
//! let (a, b) = tokio::join!(doubler.add(1), doubler.add(2));
//! assert_eq!((a.unwrap(), b.unwrap()), (2, 4));
//! # }
//! ```

use async_trait::async_trait;
use boxoffice_core::config::BatchSettings;
use boxoffice_core::error::BatchError;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;

use crate::shutdown::{ShutdownError, ShutdownHandler};

/// Batch processor configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    /// Queue length that triggers an immediate flush
    pub max_batch_size: usize,
    /// Longest an item waits before its batch is flushed
    pub max_wait: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 50,
            max_wait: Duration::from_millis(10),
        }
    }
}

impl From<&BatchSettings> for BatchConfig {
    fn from(settings: &BatchSettings) -> Self {
        Self {
            max_batch_size: settings.max_batch_size,
            max_wait: settings.max_wait(),
        }
    }
}

impl BatchConfig {
    /// Create a new configuration builder.
    #[must_use]
    pub const fn builder() -> BatchConfigBuilder {
        BatchConfigBuilder {
            max_batch_size: None,
            max_wait: None,
        }
    }
}

/// Builder for [`BatchConfig`].
#[derive(Debug, Clone, Copy)]
pub struct BatchConfigBuilder {
    max_batch_size: Option<usize>,
    max_wait: Option<Duration>,
}

impl BatchConfigBuilder {
    /// Set the size trigger.
    #[must_use]
    pub const fn max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = Some(size);
        self
    }

    /// Set the time trigger.
    #[must_use]
    pub const fn max_wait(mut self, wait: Duration) -> Self {
        self.max_wait = Some(wait);
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> BatchConfig {
        let defaults = BatchConfig::default();
        BatchConfig {
            max_batch_size: self.max_batch_size.unwrap_or(defaults.max_batch_size).max(1),
            max_wait: self.max_wait.unwrap_or(defaults.max_wait),
        }
    }
}

type BatchResult<R, E> = Result<R, BatchError<E>>;
type Handler<T, R, E> = dyn Fn(Vec<T>) -> BoxFuture<'static, Result<Vec<R>, E>> + Send + Sync;

struct Entry<T, R, E> {
    item: T,
    reply: oneshot::Sender<BatchResult<R, E>>,
}

struct BatchState<T, R, E> {
    entries: Vec<Entry<T, R, E>>,
    processing: bool,
    /// Bumped on every flush so a timer armed for an earlier batch is ignored.
    epoch: u64,
    closed: bool,
    flushes: u64,
}

struct BatchInner<T, R, E> {
    name: String,
    config: BatchConfig,
    handler: Arc<Handler<T, R, E>>,
    state: Mutex<BatchState<T, R, E>>,
}

impl<T, R, E> BatchInner<T, R, E>
where
    T: Send + 'static,
    R: Send + 'static,
    E: Send + Sync + 'static,
{
    fn lock(&self) -> MutexGuard<'_, BatchState<T, R, E>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Flush until the queue is empty. A no-op if another flush is running;
    /// that flush picks up whatever is queued when it finishes.
    async fn run_flush(self: Arc<Self>) {
        loop {
            let batch = {
                let mut state = self.lock();
                if state.processing || state.entries.is_empty() {
                    return;
                }
                state.processing = true;
                state.epoch += 1;
                state.flushes += 1;
                let take = state.entries.len().min(self.config.max_batch_size);
                state.entries.drain(..take).collect::<Vec<_>>()
            };

            self.execute(batch).await;

            let mut state = self.lock();
            state.processing = false;
            if state.entries.is_empty() || state.closed {
                return;
            }
        }
    }

    #[allow(clippy::cast_precision_loss)]
    async fn execute(&self, batch: Vec<Entry<T, R, E>>) {
        let expected = batch.len();
        metrics::counter!("batch_flushes_total", "batch" => self.name.clone()).increment(1);
        metrics::histogram!("batch_size", "batch" => self.name.clone()).record(expected as f64);
        tracing::debug!(batch = %self.name, size = expected, "Flushing batch");

        let (items, replies): (Vec<T>, Vec<_>) =
            batch.into_iter().map(|entry| (entry.item, entry.reply)).unzip();

        match (self.handler)(items).await {
            Ok(results) if results.len() == expected => {
                for (reply, result) in replies.into_iter().zip(results) {
                    let _ = reply.send(Ok(result));
                }
            }
            Ok(results) => {
                let actual = results.len();
                tracing::warn!(
                    batch = %self.name,
                    expected,
                    actual,
                    "Batch handler returned the wrong number of results"
                );
                for reply in replies {
                    let _ = reply.send(Err(BatchError::LengthMismatch { expected, actual }));
                }
            }
            Err(err) => {
                tracing::warn!(batch = %self.name, size = expected, "Batch handler failed");
                let err = Arc::new(err);
                for reply in replies {
                    let _ = reply.send(Err(BatchError::Failed(Arc::clone(&err))));
                }
            }
        }
    }
}

/// Size- and time-triggered batcher.
///
/// Cloning yields another handle to the same queue.
pub struct BatchProcessor<T, R, E> {
    inner: Arc<BatchInner<T, R, E>>,
}

impl<T, R, E> Clone for BatchProcessor<T, R, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, R, E> std::fmt::Debug for BatchProcessor<T, R, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchProcessor")
            .field("name", &self.inner.name)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl<T, R, E> BatchProcessor<T, R, E>
where
    T: Send + 'static,
    R: Send + 'static,
    E: Send + Sync + 'static,
{
    /// Create a processor around `handler`.
    ///
    /// Flushes run on spawned tasks, so items must be added from within a
    /// Tokio runtime.
    pub fn new<H, Fut>(name: impl Into<String>, config: BatchConfig, handler: H) -> Self
    where
        H: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<R>, E>> + Send + 'static,
    {
        let handler: Arc<Handler<T, R, E>> = Arc::new(move |items| Box::pin(handler(items)));
        Self {
            inner: Arc::new(BatchInner {
                name: name.into(),
                config,
                handler,
                state: Mutex::new(BatchState {
                    entries: Vec::new(),
                    processing: false,
                    epoch: 0,
                    closed: false,
                    flushes: 0,
                }),
            }),
        }
    }

    /// Queue `item`. The returned future resolves with the item's result once
    /// its batch has run; the item is queued even if the future is never
    /// polled.
    ///
    /// # Errors
    ///
    /// The returned future yields `BatchError::Failed` if the handler failed,
    /// `BatchError::LengthMismatch` if it returned the wrong number of
    /// results, and `BatchError::Dropped` if the processor was shut down first.
    pub fn add(
        &self,
        item: T,
    ) -> impl Future<Output = BatchResult<R, E>> + Send + use<T, R, E> {
        let (reply, result) = oneshot::channel();
        let accepted = self.enqueue(Entry { item, reply });
        async move {
            if !accepted {
                return Err(BatchError::Dropped);
            }
            result.await.unwrap_or(Err(BatchError::Dropped))
        }
    }

    fn enqueue(&self, entry: Entry<T, R, E>) -> bool {
        let mut state = self.inner.lock();
        if state.closed {
            return false;
        }
        state.entries.push(entry);

        if state.processing {
            return true;
        }
        if state.entries.len() >= self.inner.config.max_batch_size {
            tokio::spawn(Arc::clone(&self.inner).run_flush());
        } else if state.entries.len() == 1 {
            let epoch = state.epoch;
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                tokio::time::sleep(inner.config.max_wait).await;
                let still_due = inner.lock().epoch == epoch;
                if still_due {
                    inner.run_flush().await;
                }
            });
        }
        true
    }

    /// Flush queued items now instead of waiting for a trigger.
    pub async fn flush(&self) {
        Arc::clone(&self.inner).run_flush().await;
    }

    /// Items queued and not yet handed to the handler.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Batches flushed since creation.
    #[must_use]
    pub fn flush_count(&self) -> u64 {
        self.inner.lock().flushes
    }

    /// Processor name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Refuse new items and fail queued ones with `BatchError::Dropped`.
    /// A batch already running completes normally.
    pub fn close(&self) -> usize {
        let dropped: Vec<_> = {
            let mut state = self.inner.lock();
            state.closed = true;
            state.entries.drain(..).collect()
        };
        let count = dropped.len();
        for entry in dropped {
            let _ = entry.reply.send(Err(BatchError::Dropped));
        }
        count
    }
}

#[async_trait]
impl<T, R, E> ShutdownHandler for BatchProcessor<T, R, E>
where
    T: Send + 'static,
    R: Send + 'static,
    E: Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn shutdown(&self) -> Result<(), ShutdownError> {
        let dropped = self.close();
        if dropped > 0 {
            tracing::info!(batch = %self.inner.name, dropped, "Dropped queued batch items");
        }
        Ok(())
    }
}
