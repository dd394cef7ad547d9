//! Periodic health checking.
//!
//! # Responsibilities
//! - Drive the owner's health check on a fixed interval
//! - Probe connections concurrently with a forced (uncached) liveness check

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::{self, MissedTickBehavior};

use crate::pool::Connection;
use crate::upstream::Upstream;

/// Result of one health-check pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HealthReport {
    pub healthy: usize,
    pub unhealthy: usize,
    /// Idle connections removed because they failed.
    pub evicted: usize,
    /// Connections created to restore the minimum.
    pub replenished: usize,
    /// `healthy / (healthy + unhealthy)`, 1.0 for an empty pool.
    pub health_rate: f64,
}

impl HealthReport {
    pub fn new(healthy: usize, unhealthy: usize) -> Self {
        let total = healthy + unhealthy;
        let health_rate = if total == 0 { 1.0 } else { healthy as f64 / total as f64 };
        Self {
            healthy,
            unhealthy,
            evicted: 0,
            replenished: 0,
            health_rate,
        }
    }
}

/// Something with a periodic health check.
pub trait HealthTarget: Send + Sync + 'static {
    fn run_health_check(self: Arc<Self>) -> impl Future<Output = HealthReport> + Send;
}

/// Force-probe every connection concurrently.
///
/// A connection counts as healthy when the probe passes and it still meets
/// its health thresholds.
pub async fn probe_all<U: Upstream>(connections: Vec<Arc<Connection<U>>>) -> Vec<(Arc<Connection<U>>, bool)> {
    let probes = connections.into_iter().map(|conn| async move {
        let healthy = conn.check_health(true).await && conn.is_healthy();
        (conn, healthy)
    });
    join_all(probes).await
}

pub struct HealthChecker<T> {
    target: Weak<T>,
    interval: Duration,
}

impl<T: HealthTarget> HealthChecker<T> {
    pub fn new(target: &Arc<T>, interval: Duration) -> Self {
        Self {
            target: Arc::downgrade(target),
            interval,
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(interval = ?self.interval, "Health checker starting");

        let mut ticker = time::interval_at(time::Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(target) = self.target.upgrade() else {
                        break;
                    };
                    let report = target.run_health_check().await;
                    if report.unhealthy > 0 || report.replenished > 0 {
                        tracing::info!(
                            healthy = report.healthy,
                            unhealthy = report.unhealthy,
                            evicted = report.evicted,
                            replenished = report.replenished,
                            "Health check completed"
                        );
                    } else {
                        tracing::debug!(healthy = report.healthy, "Health check completed");
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Health checker received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }
}
