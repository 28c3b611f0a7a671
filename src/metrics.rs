//! Production observability metrics for bulk runs
//!
//! This module provides metrics for attempts, retries, 429 responses,
//! rate limiter wait time, page fetches and terminal results.
//!
//! ## Architecture
//!
//! - Uses `metrics` crate for low-overhead metric collection
//! - Optional Prometheus exporter for a scraping endpoint (`--metrics-addr`)
//! - Recording is a no-op until a recorder is installed

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use once_cell::sync::Lazy;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::{Classification, TerminalResult};

/// Global metrics registry initialization flag
static METRICS_INITIALIZED: Lazy<Arc<RwLock<bool>>> = Lazy::new(|| Arc::new(RwLock::new(false)));

/// Metrics initialization errors
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// The Prometheus exporter could not be installed
    #[error("failed to install Prometheus exporter: {0}")]
    InstallError(String),
}

/// Initialize metrics system with Prometheus exporter
///
/// This should be called once at application startup, typically in main().
/// The function is idempotent and will not reinitialize if already called.
///
/// # Arguments
/// * `addr` - Socket address to bind Prometheus scrape endpoint (e.g., "0.0.0.0:9090")
pub async fn init_metrics(addr: SocketAddr) -> Result<(), MetricsError> {
    let mut initialized = METRICS_INITIALIZED.write().await;
    if *initialized {
        debug!("Metrics already initialized, skipping");
        return Ok(());
    }

    info!("Initializing metrics system on {}", addr);

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| MetricsError::InstallError(e.to_string()))?;

    describe_counter!(
        "bulk_attempts_total",
        Unit::Count,
        "Execution attempts by classification"
    );

    describe_counter!(
        "bulk_http_429_total",
        Unit::Count,
        "HTTP 429 responses received"
    );

    describe_counter!("bulk_retries_total", Unit::Count, "Retries scheduled");

    describe_histogram!(
        "bulk_retry_backoff_seconds",
        Unit::Seconds,
        "Backoff applied before a retry"
    );

    describe_histogram!(
        "bulk_rate_limit_wait_seconds",
        Unit::Seconds,
        "Time spent waiting for a rate limit permit"
    );

    describe_counter!(
        "bulk_items_completed_total",
        Unit::Count,
        "Items that reached a terminal result, by status"
    );

    describe_counter!(
        "bulk_items_skipped_total",
        Unit::Count,
        "Items skipped as already recorded or duplicate"
    );

    describe_counter!(
        "bulk_page_fetches_total",
        Unit::Count,
        "Page fetch attempts by outcome"
    );

    *initialized = true;
    info!("Metrics system initialized successfully on {}", addr);
    Ok(())
}

/// Check if metrics system is initialized
pub async fn is_initialized() -> bool {
    *METRICS_INITIALIZED.read().await
}

/// Record one classified attempt
pub fn record_attempt(classification: Classification, status: Option<u16>) {
    let status = status
        .map(|s| s.to_string())
        .unwrap_or_else(|| "network_error".to_string());
    counter!(
        "bulk_attempts_total",
        "classification" => classification.as_str(),
        "status" => status,
    )
    .increment(1);
}

/// Record a 429 response
pub fn record_rate_limited() {
    counter!("bulk_http_429_total").increment(1);
}

/// Record retry backoff duration
pub fn record_retry_backoff(duration: Duration, attempt: u32) {
    counter!(
        "bulk_retries_total",
        "attempt" => attempt.to_string(),
    )
    .increment(1);

    histogram!("bulk_retry_backoff_seconds").record(duration.as_secs_f64());

    debug!(
        attempt = attempt,
        backoff_ms = duration.as_millis(),
        "Retry backoff recorded"
    );
}

/// Record time spent waiting for a rate limit permit
pub fn record_permit_wait(waited: Duration) {
    histogram!("bulk_rate_limit_wait_seconds").record(waited.as_secs_f64());
}

/// Record a terminal result
pub fn record_item_completed(result: &TerminalResult) {
    let kind = result
        .failure_kind
        .map(|k| k.as_str())
        .unwrap_or("none");
    counter!(
        "bulk_items_completed_total",
        "status" => result.status.as_str(),
        "failure_kind" => kind,
    )
    .increment(1);
}

/// Record a skipped key
pub fn record_skipped(reason: &'static str) {
    counter!("bulk_items_skipped_total", "reason" => reason).increment(1);
}

/// Record a page fetch attempt
pub fn record_page_fetch(outcome: &'static str) {
    counter!("bulk_page_fetches_total", "outcome" => outcome).increment(1);
}
