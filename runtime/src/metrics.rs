//! Prometheus metrics for the orchestration primitives.
//!
//! Components record through the `metrics` facade at all times; nothing is
//! kept unless a recorder is installed. [`install_prometheus`] installs the
//! Prometheus recorder once per process and returns a handle that renders the
//! exposition text. No HTTP listener is started; the host application decides
//! how to expose it.
//!
//! Recorded metrics:
//!
//! | name | kind | labels |
//! |------|------|--------|
//! | `circuit_breaker_calls_total` | counter | `key` |
//! | `circuit_breaker_rejections_total` | counter | `key` |
//! | `circuit_breaker_state` | gauge (0=closed, 1=half-open, 2=open) | `key` |
//! | `retry_attempts_total` | counter | |
//! | `cache_hits_total` / `cache_misses_total` | counter | `cache` |
//! | `limiter_active` / `limiter_queued` | gauge | `limiter` |
//! | `batch_flushes_total` | counter | `batch` |
//! | `batch_size` | histogram | `batch` |
//! | `reservation_conflicts_total` | counter | |
//! | `reservations_swept_total` | counter | |
//! | `optimistic_rollbacks_total` | counter | `tracker` |
//!
//! # Example
//!
//! ```rust,no_run
//! use boxoffice_runtime::metrics::install_prometheus;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let handle = install_prometheus()?;
//! println!("{}", handle.render());
//! # Ok(())
//! # }
//! ```

use boxoffice_core::config::ObservabilitySettings;
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

static INSTALLED: Mutex<Option<PrometheusHandle>> = Mutex::new(None);

/// Install the Prometheus recorder, or return the handle of the one this
/// function already installed.
///
/// # Errors
///
/// Returns `MetricsError::Install` if a different recorder is already
/// installed in this process.
pub fn install_prometheus() -> Result<PrometheusHandle, MetricsError> {
    let mut installed = INSTALLED.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(handle) = installed.as_ref() {
        tracing::debug!("Prometheus recorder already installed, reusing handle");
        return Ok(handle.clone());
    }

    register_metrics();

    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("batch_size".to_string()),
            &[1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0],
        )
        .map_err(|e| MetricsError::Build(e.to_string()))?
        .install_recorder()
        .map_err(|e| MetricsError::Install(e.to_string()))?;

    tracing::info!("Prometheus metrics recorder installed");
    *installed = Some(handle.clone());
    Ok(handle)
}

/// Install the Prometheus recorder when `settings.metrics_enabled` is set.
///
/// Returns `None` without touching the global recorder when metrics are
/// disabled.
///
/// # Errors
///
/// See [`install_prometheus`].
pub fn install_from_settings(
    settings: &ObservabilitySettings,
) -> Result<Option<PrometheusHandle>, MetricsError> {
    if !settings.metrics_enabled {
        tracing::info!("Metrics disabled, Prometheus recorder not installed");
        return Ok(None);
    }
    install_prometheus().map(Some)
}

/// Register all metric descriptions.
fn register_metrics() {
    // Circuit Breaker Metrics
    describe_gauge!(
        "circuit_breaker_state",
        "Current circuit breaker state (0=closed, 1=half-open, 2=open)"
    );
    describe_counter!(
        "circuit_breaker_calls_total",
        "Total number of calls through circuit breaker"
    );
    describe_counter!(
        "circuit_breaker_rejections_total",
        "Total number of rejected calls (circuit open)"
    );

    // Retry Metrics
    describe_counter!("retry_attempts_total", "Total number of retry attempts");

    // Cache Metrics
    describe_counter!("cache_hits_total", "Reads that found a live cache entry");
    describe_counter!("cache_misses_total", "Reads that found no live cache entry");

    // Limiter Metrics
    describe_gauge!("limiter_active", "Tasks currently holding a concurrency slot");
    describe_gauge!("limiter_queued", "Callers waiting for a concurrency slot");

    // Batch Metrics
    describe_counter!("batch_flushes_total", "Total number of batches flushed");
    describe_histogram!("batch_size", "Items per flushed batch");

    // Reservation Metrics
    describe_counter!(
        "reservation_conflicts_total",
        "Acquisitions refused because another session holds the key"
    );
    describe_counter!(
        "reservations_swept_total",
        "Expired reservations purged by the sweeper"
    );

    // Optimistic Update Metrics
    describe_counter!(
        "optimistic_rollbacks_total",
        "Optimistic updates rolled back"
    );
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_install_is_idempotent_and_renders() {
        let first = install_prometheus().unwrap();
        let second = install_prometheus().unwrap();

        metrics::counter!("reservation_conflicts_total").increment(1);

        let rendered = second.render();
        assert!(rendered.contains("reservation_conflicts_total"));
        assert_eq!(first.render().is_empty(), rendered.is_empty());
    }

    #[test]
    fn test_disabled_settings_skip_install() {
        let settings = ObservabilitySettings {
            metrics_enabled: false,
            ..ObservabilitySettings::default()
        };
        assert!(install_from_settings(&settings).unwrap().is_none());
    }

    #[test]
    fn test_enabled_settings_install() {
        let handle = install_from_settings(&ObservabilitySettings::default()).unwrap();
        assert!(handle.is_some());
    }
}
