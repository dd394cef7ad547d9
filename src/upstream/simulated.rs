//! Flaky, rate-limited in-process upstream.
//!
//! Used by the demo binary to exercise the pool without a real remote source:
//! calls take a random latency, fail with a configurable probability and are
//! throttled by a shared token bucket.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use rand::Rng;

use crate::upstream::{Upstream, UpstreamError};

/// Knobs for the simulated source.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Probability that `connect` fails.
    pub connect_failure_rate: f64,
    /// Probability that a query fails with a transient error.
    pub failure_rate: f64,
    /// Probability that a live handle silently dies after a query.
    pub drop_rate: f64,
    /// Query latency bounds in milliseconds.
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
    /// Token bucket refill rate and capacity.
    pub requests_per_second: f64,
    pub burst: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            connect_failure_rate: 0.1,
            failure_rate: 0.1,
            drop_rate: 0.01,
            min_latency_ms: 5,
            max_latency_ms: 50,
            requests_per_second: 200.0,
            burst: 50.0,
        }
    }
}

/// A simple token bucket rate limiter.
struct TokenBucket {
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last_update: Instant::now(),
        }
    }

    fn try_acquire(&mut self, capacity: f64, refill_rate: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();

        self.tokens = (self.tokens + elapsed * refill_rate).min(capacity);
        self.last_update = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Session state of one simulated connection.
#[derive(Debug)]
pub struct SimulatedHandle {
    pub session: u64,
    alive: AtomicBool,
}

impl SimulatedHandle {
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }
}

/// In-process upstream with injected latency, failures and throttling.
pub struct SimulatedUpstream {
    config: SimulationConfig,
    bucket: Mutex<TokenBucket>,
    next_session: AtomicU64,
    queries: AtomicU64,
}

impl SimulatedUpstream {
    pub fn new(config: SimulationConfig) -> Self {
        let bucket = TokenBucket::new(config.burst);
        Self {
            config,
            bucket: Mutex::new(bucket),
            next_session: AtomicU64::new(1),
            queries: AtomicU64::new(0),
        }
    }

    /// Number of queries that reached the source.
    pub fn query_count(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    fn roll(&self, probability: f64) -> bool {
        probability > 0.0 && rand::thread_rng().gen_bool(probability.min(1.0))
    }

    fn latency(&self) -> Duration {
        let (lo, hi) = (self.config.min_latency_ms, self.config.max_latency_ms.max(self.config.min_latency_ms));
        Duration::from_millis(rand::thread_rng().gen_range(lo..=hi))
    }

    /// Fetch the value stored under `key`.
    pub async fn query(&self, handle: &SimulatedHandle, key: &str) -> Result<String, UpstreamError> {
        if !handle.is_alive() {
            return Err(UpstreamError::ConnectionLost(format!("session {} closed", handle.session)));
        }

        let admitted = self
            .bucket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_acquire(self.config.burst, self.config.requests_per_second);
        if !admitted {
            return Err(UpstreamError::RateLimited("quota exceeded".to_string()));
        }

        tokio::time::sleep(self.latency()).await;
        self.queries.fetch_add(1, Ordering::Relaxed);

        if self.roll(self.config.drop_rate) {
            handle.alive.store(false, Ordering::Relaxed);
            return Err(UpstreamError::ConnectionLost(format!("session {} reset by peer", handle.session)));
        }
        if self.roll(self.config.failure_rate) {
            let err = match fastrand::u8(0..3) {
                0 => UpstreamError::Server { status: 503, message: "service unavailable".to_string() },
                1 => UpstreamError::Network("upstream unreachable".to_string()),
                _ => UpstreamError::other("read timed out"),
            };
            return Err(err);
        }

        Ok(format!("{key}@{}", handle.session))
    }
}

impl Upstream for SimulatedUpstream {
    type Handle = SimulatedHandle;

    async fn connect(&self) -> Result<SimulatedHandle, UpstreamError> {
        tokio::time::sleep(self.latency()).await;
        if self.roll(self.config.connect_failure_rate) {
            return Err(UpstreamError::ConnectionRefused("simulated refusal".to_string()));
        }
        let session = self.next_session.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(session, "Simulated session opened");
        Ok(SimulatedHandle {
            session,
            alive: AtomicBool::new(true),
        })
    }

    async fn disconnect(&self, handle: &SimulatedHandle) {
        handle.alive.store(false, Ordering::Relaxed);
        tracing::trace!(session = handle.session, "Simulated session closed");
    }

    async fn is_alive(&self, handle: &SimulatedHandle) -> bool {
        handle.is_alive()
    }
}
