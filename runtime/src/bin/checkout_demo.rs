//! Checkout Demo
//!
//! Two sessions race for the same tickets through the checkout pipeline
//! against an in-process backend that fails every other purchase call:
//! - the first session holds the tickets; the second is refused
//! - the winner's purchase is retried through the transient failure
//! - once the winner is done, the second session buys from the cached
//!   remaining availability
//!
//! Configuration comes from `BOXOFFICE_*` environment variables (see
//! `OrchestrationConfig::from_env`).
//!
//! # Usage
//!
//! ```bash
//! RUST_LOG=info cargo run --bin checkout-demo
//! ```

use anyhow::Context;
use boxoffice_core::{OrchestrationConfig, ReservationKey, Retryable, SessionId};
use boxoffice_runtime::checkout::{CheckoutCoordinator, CheckoutRequest, PurchaseReceipt};
use boxoffice_runtime::loader::{KeyedLoader, KeyedLoaderConfig};
use boxoffice_runtime::metrics::install_from_settings;
use boxoffice_runtime::registry::ResilienceRegistry;
use boxoffice_runtime::reservation::{ReservationBook, ReservationConfig};
use boxoffice_runtime::retry::RetryPolicy;
use boxoffice_runtime::shutdown::{GenericShutdownHandler, ShutdownCoordinator};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Error, Debug)]
#[error("backend returned {status}")]
struct BackendError {
    status: u16,
}

impl Retryable for BackendError {
    fn status_code(&self) -> Option<u16> {
        Some(self.status)
    }
}

/// Ticket inventory with a flaky purchase endpoint.
#[derive(Default)]
struct Backend {
    stock: Mutex<HashMap<ReservationKey, u32>>,
    purchase_calls: AtomicU64,
}

impl Backend {
    fn with_stock(key: ReservationKey, units: u32) -> Arc<Self> {
        let backend = Self::default();
        backend
            .stock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, units);
        Arc::new(backend)
    }

    async fn availability(&self, keys: Vec<ReservationKey>) -> Result<Vec<Option<u32>>, BackendError> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let stock = self.stock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(keys.iter().map(|key| stock.get(key).copied()).collect())
    }

    async fn purchase(&self, request: CheckoutRequest) -> Result<PurchaseReceipt, BackendError> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let call = self.purchase_calls.fetch_add(1, Ordering::SeqCst);
        if call % 2 == 0 {
            return Err(BackendError { status: 503 });
        }

        let mut stock = self.stock.lock().unwrap_or_else(PoisonError::into_inner);
        let units = stock.get_mut(&request.key).ok_or(BackendError { status: 404 })?;
        if *units < request.quantity {
            return Err(BackendError { status: 409 });
        }
        *units -= request.quantity;
        Ok(PurchaseReceipt {
            confirmation: format!("ORD-{call:04}"),
            remaining: *units,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = OrchestrationConfig::from_env().context("loading configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.observability.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let metrics = install_from_settings(&config.observability)?;

    println!("\n🎫 ============================================");
    println!("   Boxoffice - Checkout Demo");
    println!("============================================\n");

    let key = ReservationKey::new("evt-42", "GA");
    let backend = Backend::with_stock(key.clone(), 10);

    let registry = Arc::new(ResilienceRegistry::from_config(&config));
    let book = ReservationBook::new(ReservationConfig::from(&config.reservation));
    let availability = {
        let backend = Arc::clone(&backend);
        KeyedLoader::new(
            "availability",
            KeyedLoaderConfig::from(&config.loader),
            move |keys: Vec<ReservationKey>| {
                let backend = Arc::clone(&backend);
                async move { backend.availability(keys).await }
            },
        )
    };
    let retry = RetryPolicy::from(&config.retry);

    let alice = CheckoutCoordinator::new(
        book.session(SessionId::new()),
        availability.clone(),
        &registry,
        retry.clone(),
    );
    let bob = CheckoutCoordinator::new(
        book.session(SessionId::new()),
        availability.clone(),
        &registry,
        retry,
    );

    let purchase = |backend: Arc<Backend>| {
        move |request: CheckoutRequest| {
            let backend = Arc::clone(&backend);
            async move { backend.purchase(request).await }
        }
    };

    println!("1️⃣  Two sessions race for 2 x {key}...");
    let request = CheckoutRequest {
        key: key.clone(),
        quantity: 2,
    };
    let (first, second) = tokio::join!(
        alice.checkout(&request, purchase(Arc::clone(&backend))),
        bob.checkout(&request, purchase(Arc::clone(&backend))),
    );
    report("alice", &first);
    report("bob", &second);

    println!("\n2️⃣  Bob tries again...");
    let retried = bob.checkout(&request, purchase(Arc::clone(&backend))).await;
    report("bob", &retried);

    println!("\n3️⃣  Resilience state");
    for breaker in registry.snapshot().breakers {
        println!(
            "   {}: {:?}, {} calls, {} failures",
            breaker.key, breaker.state, breaker.metrics.total_calls, breaker.metrics.total_failures
        );
    }
    println!(
        "   availability cache: {:?}, purchase calls: {}",
        availability.cache_stats(),
        backend.purchase_calls.load(Ordering::SeqCst)
    );

    let mut shutdown = ShutdownCoordinator::new(Duration::from_secs(5));
    shutdown.register(Arc::new(book));
    shutdown.register(Arc::new(availability));
    shutdown.register(registry);
    if let Some(metrics) = metrics {
        shutdown.register(Arc::new(GenericShutdownHandler::new("metrics", move || {
            let rendered = metrics.render();
            async move {
                println!("\n4️⃣  Metrics\n{rendered}");
                Ok(())
            }
        })));
    }

    shutdown
        .shutdown()
        .await
        .map_err(|errors| anyhow::anyhow!("{} components failed to shut down", errors.len()))?;

    println!("✓ Shut down cleanly");
    Ok(())
}

fn report<E: std::fmt::Display>(
    who: &str,
    outcome: &Result<PurchaseReceipt, boxoffice_runtime::CheckoutError<E>>,
) {
    match outcome {
        Ok(receipt) => println!(
            "   ✓ {who}: confirmed {} ({} left)",
            receipt.confirmation, receipt.remaining
        ),
        Err(err) => println!("   ✗ {who}: {err}"),
    }
}
