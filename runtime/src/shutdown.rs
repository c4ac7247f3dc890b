//! Graceful shutdown coordination.
//!
//! Components with background work (reservation sweeper, request-queue
//! dispatch loops) or parked waiters (limiters, batch processors) implement
//! [`ShutdownHandler`]. The application builds one [`ShutdownCoordinator`]
//! at start-up, registers them, and calls [`ShutdownCoordinator::shutdown`]
//! on teardown.
//!
//! ## Usage
//!
//! ```
//! use boxoffice_runtime::limiter::ConcurrencyLimiter;
//! use boxoffice_runtime::shutdown::ShutdownCoordinator;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() {
//! let limiter = ConcurrencyLimiter::new("payments", 4);
//!
//! let mut coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
//! coordinator.register(Arc::new(limiter.clone()));
//!
//! coordinator.shutdown().await.ok();
//! assert!(limiter.run(async {}).await.is_err());
//! # }
//! ```

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// A component that failed to stop cleanly.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShutdownError {
    /// The handler reported a failure.
    #[error("{component}: {reason}")]
    Failed {
        /// Component name
        component: String,
        /// What went wrong
        reason: String,
    },
    /// The handler did not finish within the grace period.
    #[error("{component}: timeout after {timeout:?}")]
    TimedOut {
        /// Component name
        component: String,
        /// Grace period that elapsed
        timeout: Duration,
    },
}

impl ShutdownError {
    /// Build a `Failed` error.
    pub fn failed(component: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Failed {
            component: component.into(),
            reason: reason.into(),
        }
    }
}

/// Trait for components that need graceful shutdown
#[async_trait]
pub trait ShutdownHandler: Send + Sync {
    /// Component name for logging
    fn name(&self) -> &str;

    /// Stop background work and release parked callers.
    ///
    /// # Errors
    ///
    /// Returns error if the component could not stop cleanly
    async fn shutdown(&self) -> Result<(), ShutdownError>;
}

/// Coordinates shutdown across multiple components
///
/// Handlers are stopped in parallel, each bounded by the grace period, and
/// every failure is reported.
pub struct ShutdownCoordinator {
    handlers: Vec<Arc<dyn ShutdownHandler>>,
    shutdown_tx: broadcast::Sender<()>,
    timeout_duration: Duration,
}

impl ShutdownCoordinator {
    /// Create new shutdown coordinator
    ///
    /// # Arguments
    ///
    /// * `timeout` - Maximum time each component may take to shut down
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);

        Self {
            handlers: Vec::new(),
            shutdown_tx,
            timeout_duration: timeout,
        }
    }

    /// Register a shutdown handler
    pub fn register(&mut self, handler: Arc<dyn ShutdownHandler>) {
        info!(component = handler.name(), "Registered shutdown handler");
        self.handlers.push(handler);
    }

    /// Get a receiver notified when shutdown starts
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Signal subscribers, then shut down every handler.
    ///
    /// # Errors
    ///
    /// Returns every component that failed or timed out
    pub async fn shutdown(&self) -> Result<(), Vec<ShutdownError>> {
        info!(
            components = self.handlers.len(),
            timeout = ?self.timeout_duration,
            "Initiating graceful shutdown"
        );

        if self.shutdown_tx.send(()).is_err() {
            warn!("No active shutdown signal receivers");
        }

        let shutdown_futures = self.handlers.iter().map(|handler| async move {
            let name = handler.name();
            match tokio::time::timeout(self.timeout_duration, handler.shutdown()).await {
                Ok(Ok(())) => {
                    info!(component = name, "Component shut down");
                    Ok(())
                }
                Ok(Err(e)) => {
                    error!(component = name, error = %e, "Component shutdown failed");
                    Err(e)
                }
                Err(_) => {
                    error!(component = name, "Component shutdown timed out");
                    Err(ShutdownError::TimedOut {
                        component: name.to_string(),
                        timeout: self.timeout_duration,
                    })
                }
            }
        });

        let errors: Vec<ShutdownError> = futures::future::join_all(shutdown_futures)
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect();

        if errors.is_empty() {
            info!("All components shut down");
            Ok(())
        } else {
            error!(failures = errors.len(), "Shutdown completed with errors");
            Err(errors)
        }
    }

    /// Get number of registered handlers
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

type ShutdownFn = dyn Fn() -> BoxFuture<'static, Result<(), ShutdownError>> + Send + Sync;

/// Shutdown handler backed by a closure.
///
/// # Example
///
/// ```
/// use boxoffice_runtime::shutdown::{GenericShutdownHandler, ShutdownHandler};
///
/// # async fn example() {
/// let handler = GenericShutdownHandler::new("backend", || async { Ok(()) });
/// assert!(handler.shutdown().await.is_ok());
/// # }
/// ```
pub struct GenericShutdownHandler {
    name: String,
    on_shutdown: Arc<ShutdownFn>,
}

impl GenericShutdownHandler {
    /// Create new generic shutdown handler
    pub fn new<F, Fut>(name: impl Into<String>, on_shutdown: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), ShutdownError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            on_shutdown: Arc::new(move || Box::pin(on_shutdown())),
        }
    }
}

#[async_trait]
impl ShutdownHandler for GenericShutdownHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn shutdown(&self) -> Result<(), ShutdownError> {
        (self.on_shutdown)().await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct MockShutdownHandler {
        name: String,
        should_fail: bool,
        shutdown_called: Arc<AtomicBool>,
    }

    impl MockShutdownHandler {
        fn new(name: impl Into<String>, should_fail: bool) -> Self {
            Self {
                name: name.into(),
                should_fail,
                shutdown_called: Arc::new(AtomicBool::new(false)),
            }
        }

        fn was_called(&self) -> bool {
            self.shutdown_called.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ShutdownHandler for MockShutdownHandler {
        fn name(&self) -> &str {
            &self.name
        }

        async fn shutdown(&self) -> Result<(), ShutdownError> {
            self.shutdown_called.store(true, Ordering::SeqCst);

            if self.should_fail {
                Err(ShutdownError::failed(&self.name, "simulated failure"))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_coordinator_shutdown_all_success() {
        let handler1 = Arc::new(MockShutdownHandler::new("handler1", false));
        let handler2 = Arc::new(MockShutdownHandler::new("handler2", false));

        let mut coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        coordinator.register(Arc::clone(&handler1) as Arc<dyn ShutdownHandler>);
        coordinator.register(Arc::clone(&handler2) as Arc<dyn ShutdownHandler>);

        assert!(coordinator.shutdown().await.is_ok());
        assert!(handler1.was_called());
        assert!(handler2.was_called());
    }

    #[tokio::test]
    async fn test_coordinator_shutdown_one_failure() {
        let mut coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        coordinator.register(Arc::new(MockShutdownHandler::new("handler1", false)));
        coordinator.register(Arc::new(MockShutdownHandler::new("handler2", true)));

        let errors = coordinator.shutdown().await.unwrap_err();

        assert_eq!(
            errors,
            vec![ShutdownError::failed("handler2", "simulated failure")]
        );
    }

    #[tokio::test]
    async fn test_coordinator_broadcast_signal() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        let mut rx = coordinator.subscribe();

        let task = tokio::spawn(async move {
            rx.recv().await.ok();
            "signal_received"
        });

        let _ = coordinator.shutdown().await;

        assert_eq!(task.await.unwrap(), "signal_received");
    }

    #[tokio::test(start_paused = true)]
    async fn test_coordinator_timeout() {
        struct SlowShutdownHandler;

        #[async_trait]
        impl ShutdownHandler for SlowShutdownHandler {
            fn name(&self) -> &str {
                "slow"
            }

            async fn shutdown(&self) -> Result<(), ShutdownError> {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            }
        }

        let mut coordinator = ShutdownCoordinator::new(Duration::from_millis(100));
        coordinator.register(Arc::new(SlowShutdownHandler));

        let errors = coordinator.shutdown().await.unwrap_err();

        assert!(matches!(&errors[..], [ShutdownError::TimedOut { component, .. }] if component == "slow"));
    }

    #[tokio::test]
    async fn test_generic_shutdown_handler() {
        let called = Arc::new(AtomicBool::new(false));
        let called_clone = Arc::clone(&called);

        let handler = GenericShutdownHandler::new("test", move || {
            let called = Arc::clone(&called_clone);
            async move {
                called.store(true, Ordering::SeqCst);
                Ok(())
            }
        });

        assert!(handler.shutdown().await.is_ok());
        assert!(called.load(Ordering::SeqCst));
    }

    #[test]
    fn test_coordinator_handler_count() {
        let mut coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        assert_eq!(coordinator.handler_count(), 0);

        coordinator.register(Arc::new(MockShutdownHandler::new("h1", false)));
        assert_eq!(coordinator.handler_count(), 1);
    }
}
