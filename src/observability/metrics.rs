//! Metrics collection and exposition.
//!
//! # Metrics
//! - `pool_connections` (gauge): open connections
//! - `pool_healthy_connections` (gauge): connections passing `is_healthy`
//! - `pool_utilization` (gauge): leased / open
//! - `pool_avg_response_seconds` (gauge): mean of per-connection averages
//! - `pool_acquire_timeouts_total` (counter)
//! - `pool_acquire_wait_seconds` (histogram)
//! - `connection_response_seconds` (histogram): successful call latency
//! - `connection_events_total` (counter): lifecycle events by `event`
//! - `retry_attempts_total` (counter): by `outcome` (`success` or category)
//! - `exceptions_total` (counter): by `category` and `severity`

use std::net::SocketAddr;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;

use crate::resilience::classifier::{ErrorCategory, Severity};

/// Install the Prometheus recorder and its HTTP scrape listener.
///
/// Must be called from within a tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(err) => tracing::error!(address = %addr, error = %err, "Failed to install metrics exporter"),
    }
}

pub fn record_retry_attempt(category: Option<ErrorCategory>) {
    let outcome = category.map(|c| c.as_str()).unwrap_or("success");
    ::metrics::counter!("retry_attempts_total", "outcome" => outcome).increment(1);
}

pub fn record_exception(category: ErrorCategory, severity: Severity) {
    ::metrics::counter!(
        "exceptions_total",
        "category" => category.as_str(),
        "severity" => severity.as_str()
    )
    .increment(1);
}

/// Lifecycle event of a single connection (`created`, `evicted`, `reconnected`, ...).
pub fn record_connection_event(event: &'static str) {
    ::metrics::counter!("connection_events_total", "event" => event).increment(1);
}

pub fn record_response_time(elapsed: Duration) {
    ::metrics::histogram!("connection_response_seconds").record(elapsed.as_secs_f64());
}

pub fn record_acquire_wait(waited: Duration) {
    ::metrics::histogram!("pool_acquire_wait_seconds").record(waited.as_secs_f64());
}

pub fn record_acquire_timeout() {
    ::metrics::counter!("pool_acquire_timeouts_total").increment(1);
}

/// Publish the pool-wide aggregate computed by the stats loop.
pub fn record_pool_stats(total: usize, healthy: usize, utilization: f64, avg_response: Duration) {
    ::metrics::gauge!("pool_connections").set(total as f64);
    ::metrics::gauge!("pool_healthy_connections").set(healthy as f64);
    ::metrics::gauge!("pool_utilization").set(utilization);
    ::metrics::gauge!("pool_avg_response_seconds").set(avg_response.as_secs_f64());
}
