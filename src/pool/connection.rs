//! A single stateful connection to the upstream.
//!
//! # Responsibilities
//! - Own one upstream handle and the state machine around it
//! - Connect (with retry) and warm up before advertising `Healthy`
//! - Execute operations through the retry wrapper and record metrics
//! - Answer cheap health probes, cached for a TTL
//!
//! # State Machine
//! ```text
//! Disconnected → Connecting → WarmingUp → Healthy ⇄ Unhealthy
//!                    │            │          │          │
//!                    └→ Error ←───┘          └──→ Connecting (reconnect)
//! any non-Closed state → Closed
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime};

use futures_util::future::BoxFuture;
use serde::{Serialize, Serializer};
use uuid::Uuid;

use crate::config::schema::ConnectionConfig;
use crate::observability::metrics;
use crate::pool::{ConnectionError, ExecuteError};
use crate::resilience::classifier::ErrorCategory;
use crate::resilience::recovery::Reconnect;
use crate::resilience::retry::RetryManager;
use crate::upstream::{Upstream, UpstreamError};

/// Maximum response-time samples kept per connection.
const RESPONSE_WINDOW: usize = 100;
/// Maximum state transitions kept for diagnostics.
const TRANSITION_HISTORY: usize = 32;

/// Connection lifecycle state.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    WarmingUp = 2,
    Healthy = 3,
    Unhealthy = 4,
    Error = 5,
    Closed = 6,
}

impl From<u8> for ConnectionState {
    fn from(val: u8) -> Self {
        match val {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::WarmingUp,
            3 => ConnectionState::Healthy,
            4 => ConnectionState::Unhealthy,
            5 => ConnectionState::Error,
            6 => ConnectionState::Closed,
            _ => ConnectionState::Disconnected,
        }
    }
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::WarmingUp => "warming_up",
            ConnectionState::Healthy => "healthy",
            ConnectionState::Unhealthy => "unhealthy",
            ConnectionState::Error => "error",
            ConnectionState::Closed => "closed",
        }
    }

    /// Whether `self → next` is one of the allowed edges.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, WarmingUp)
                | (Connecting, Error)
                | (WarmingUp, Healthy)
                | (WarmingUp, Error)
                | (Healthy, Unhealthy)
                | (Unhealthy, Healthy)
                | (Healthy, Connecting)
                | (Unhealthy, Connecting)
        ) || (self != Closed && next == Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection identity, rendered as `conn-<uuid>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

impl Serialize for ConnectionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Sliding window of recent response times.
#[derive(Debug, Default)]
struct ResponseWindow {
    samples: VecDeque<Duration>,
}

impl ResponseWindow {
    fn record(&mut self, elapsed: Duration) {
        if self.samples.len() >= RESPONSE_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(elapsed);
    }

    fn average(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        self.samples.iter().sum::<Duration>() / self.samples.len() as u32
    }

    fn min(&self) -> Duration {
        self.samples.iter().min().copied().unwrap_or_default()
    }

    fn max(&self) -> Duration {
        self.samples.iter().max().copied().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy)]
struct ProbeResult {
    at: Instant,
    healthy: bool,
}

/// Decrements the active request counter when dropped.
struct ActiveRequestGuard<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> ActiveRequestGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for ActiveRequestGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Serializable point-in-time view of a connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub id: ConnectionId,
    pub state: ConnectionState,
    pub healthy: bool,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub consecutive_failures: u64,
    pub active_requests: usize,
    pub success_rate: f64,
    pub avg_response_ms: f64,
    pub min_response_ms: f64,
    pub max_response_ms: f64,
    pub load_score: f64,
    pub age_secs: u64,
    pub idle_secs: u64,
    pub created_at: SystemTime,
    pub last_health_check: Option<SystemTime>,
    pub error_counts: BTreeMap<ErrorCategory, u64>,
}

/// One upstream handle with its state machine and metrics.
pub struct Connection<U: Upstream> {
    id: ConnectionId,
    upstream: Arc<U>,
    config: ConnectionConfig,
    retry: Arc<RetryManager>,

    state: AtomicU8,
    handle: Mutex<Option<Arc<U::Handle>>>,
    transitions: Mutex<VecDeque<(ConnectionState, ConnectionState)>>,

    total_requests: AtomicU64,
    failed_requests: AtomicU64,
    consecutive_failures: AtomicU64,
    active_requests: AtomicUsize,
    reconnects: AtomicU64,
    responses: Mutex<ResponseWindow>,
    error_counts: Mutex<BTreeMap<ErrorCategory, u64>>,

    created_at: Instant,
    created_at_wall: SystemTime,
    last_used: Mutex<Instant>,
    probe: Mutex<Option<ProbeResult>>,
    last_health_check: Mutex<Option<SystemTime>>,
}

impl<U: Upstream> fmt::Debug for Connection<U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("active_requests", &self.active_requests())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<U: Upstream> Connection<U> {
    pub fn new(upstream: Arc<U>, config: ConnectionConfig, retry: Arc<RetryManager>) -> Self {
        let now = Instant::now();
        Self {
            id: ConnectionId::new(),
            upstream,
            config,
            retry,
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            handle: Mutex::new(None),
            transitions: Mutex::new(VecDeque::new()),
            total_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            consecutive_failures: AtomicU64::new(0),
            active_requests: AtomicUsize::new(0),
            reconnects: AtomicU64::new(0),
            responses: Mutex::new(ResponseWindow::default()),
            error_counts: Mutex::new(BTreeMap::new()),
            created_at: now,
            created_at_wall: SystemTime::now(),
            last_used: Mutex::new(now),
            probe: Mutex::new(None),
            last_health_check: Mutex::new(None),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from(self.state.load(Ordering::SeqCst))
    }

    /// Move to `to` if the edge is allowed.
    fn transition(&self, to: ConnectionState) -> Result<ConnectionState, ConnectionError> {
        let mut current = self.state.load(Ordering::SeqCst);
        let from = loop {
            let from = ConnectionState::from(current);
            if !from.can_transition_to(to) {
                return Err(ConnectionError::InvalidTransition { from, to });
            }
            match self
                .state
                .compare_exchange(current, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => break from,
                Err(actual) => current = actual,
            }
        };

        {
            let mut transitions = lock(&self.transitions);
            if transitions.len() >= TRANSITION_HISTORY {
                transitions.pop_front();
            }
            transitions.push_back((from, to));
        }
        tracing::debug!(connection_id = %self.id, from = %from, to = %to, "Connection state changed");
        Ok(from)
    }

    /// Recent `(from, to)` state changes, oldest first.
    pub fn recent_transitions(&self) -> Vec<(ConnectionState, ConnectionState)> {
        lock(&self.transitions).iter().copied().collect()
    }

    fn current_handle(&self) -> Option<Arc<U::Handle>> {
        lock(&self.handle).clone()
    }

    fn take_handle(&self) -> Option<Arc<U::Handle>> {
        lock(&self.handle).take()
    }

    fn record_response(&self, elapsed: Duration) {
        lock(&self.responses).record(elapsed);
    }

    /// Open the upstream handle and warm it up. Only valid from `Disconnected`.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let state = self.state();
        if state != ConnectionState::Disconnected {
            return Err(ConnectionError::InvalidTransition {
                from: state,
                to: ConnectionState::Connecting,
            });
        }
        self.transition(ConnectionState::Connecting)?;
        self.establish().await
    }

    /// Drop the current handle and run connect + warmup again.
    pub async fn reconnect(&self) -> Result<(), ConnectionError> {
        self.transition(ConnectionState::Connecting)?;
        if let Some(old) = self.take_handle() {
            self.upstream.disconnect(&old).await;
        }
        self.consecutive_failures.store(0, Ordering::SeqCst);
        *lock(&self.probe) = None;

        self.establish().await?;
        self.reconnects.fetch_add(1, Ordering::Relaxed);
        metrics::record_connection_event("reconnected");
        tracing::info!(connection_id = %self.id, "Connection re-established");
        Ok(())
    }

    /// Connect (with retry) then warm up. Expects state `Connecting`.
    async fn establish(&self) -> Result<(), ConnectionError> {
        let result = self
            .retry
            .execute_with_retry(&self.config.connect_retry, || self.upstream.connect())
            .await;

        let handle = match result.into_result() {
            Ok(handle) => Arc::new(handle),
            Err(failure) => {
                // A concurrent close wins; the error is reported either way.
                let _ = self.transition(ConnectionState::Error);
                tracing::warn!(
                    connection_id = %self.id,
                    attempts = failure.attempt_count(),
                    category = %failure.category,
                    error = %failure.source,
                    "Connect failed"
                );
                return Err(ConnectionError::Connect(failure));
            }
        };

        if let Err(err) = self.transition(ConnectionState::WarmingUp) {
            self.upstream.disconnect(&handle).await;
            return Err(err);
        }
        *lock(&self.handle) = Some(handle.clone());

        match self.warmup(&handle).await {
            Ok(()) => {
                if let Err(err) = self.transition(ConnectionState::Healthy) {
                    self.take_handle();
                    self.upstream.disconnect(&handle).await;
                    return Err(err);
                }
                *lock(&self.last_used) = Instant::now();
                Ok(())
            }
            Err(err) => {
                let _ = self.transition(ConnectionState::Error);
                self.take_handle();
                self.upstream.disconnect(&handle).await;
                tracing::warn!(connection_id = %self.id, error = %err, "Warmup failed");
                Err(err)
            }
        }
    }

    /// Issue the configured warmup calls within the warmup budget.
    async fn warmup(&self, handle: &Arc<U::Handle>) -> Result<(), ConnectionError> {
        let calls = self.config.warmup_calls;
        if calls == 0 {
            return Ok(());
        }

        let budget = self.config.warmup_timeout();
        let deadline = Instant::now() + budget;
        let mut succeeded = 0u32;
        let mut last_error = None;

        for _ in 0..calls {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                last_error = Some(UpstreamError::Timeout(budget));
                break;
            }

            let start = Instant::now();
            match tokio::time::timeout(remaining, self.upstream.warmup(handle.as_ref())).await {
                Ok(Ok(())) => {
                    succeeded += 1;
                    self.record_response(start.elapsed());
                }
                Ok(Err(err)) => last_error = Some(err),
                Err(_) => {
                    last_error = Some(UpstreamError::Timeout(budget));
                    break;
                }
            }
        }

        tracing::debug!(connection_id = %self.id, calls, succeeded, "Warmup finished");
        if succeeded > 0 {
            Ok(())
        } else {
            Err(ConnectionError::Warmup {
                attempted: calls,
                last: last_error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "no call completed".to_string()),
            })
        }
    }

    /// Run `operation` against the handle through the retry wrapper.
    pub async fn execute<T, F, Fut>(&self, mut operation: F) -> Result<T, ExecuteError>
    where
        F: FnMut(Arc<U::Handle>) -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        if !self.is_healthy() {
            return Err(ExecuteError::Unavailable(ConnectionError::Unhealthy(format!(
                "{} is {}",
                self.id,
                self.state()
            ))));
        }
        let handle = self
            .current_handle()
            .ok_or(ExecuteError::Unavailable(ConnectionError::Closed))?;

        let _active = ActiveRequestGuard::new(&self.active_requests);
        let start = Instant::now();

        let result = self
            .retry
            .execute_with_retry(&self.config.execute_retry, || operation(handle.clone()))
            .await;

        self.total_requests.fetch_add(1, Ordering::Relaxed);
        *lock(&self.last_used) = Instant::now();

        match result.into_result() {
            Ok(value) => {
                let elapsed = start.elapsed();
                self.record_response(elapsed);
                self.consecutive_failures.store(0, Ordering::Relaxed);
                metrics::record_response_time(elapsed);
                Ok(value)
            }
            Err(failure) => {
                self.failed_requests.fetch_add(1, Ordering::Relaxed);
                self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
                *lock(&self.error_counts).entry(failure.category).or_insert(0) += 1;
                Err(ExecuteError::Failed(failure))
            }
        }
    }

    /// Lightweight liveness probe; cached for the probe TTL unless forced.
    ///
    /// Moves `Healthy → Unhealthy` on a failed probe or slow average, and
    /// `Unhealthy → Healthy` on a good one.
    pub async fn check_health(&self, force_refresh: bool) -> bool {
        let state = self.state();
        if !matches!(state, ConnectionState::Healthy | ConnectionState::Unhealthy) {
            return false;
        }

        if !force_refresh {
            if let Some(cached) = *lock(&self.probe) {
                if cached.at.elapsed() < self.config.probe_cache_ttl() {
                    return cached.healthy;
                }
            }
        }

        let alive = match self.current_handle() {
            Some(handle) => {
                tokio::time::timeout(self.config.warmup_timeout(), self.upstream.is_alive(handle.as_ref()))
                    .await
                    .unwrap_or(false)
            }
            None => false,
        };
        let fast_enough = self.avg_response_time() <= self.config.thresholds.max_avg_response();
        let healthy = alive && fast_enough;

        *lock(&self.probe) = Some(ProbeResult {
            at: Instant::now(),
            healthy,
        });
        *lock(&self.last_health_check) = Some(SystemTime::now());

        let target = if healthy {
            ConnectionState::Healthy
        } else {
            ConnectionState::Unhealthy
        };
        if self.state() != target && self.transition(target).is_ok() {
            tracing::info!(
                connection_id = %self.id,
                alive,
                avg_response_ms = self.avg_response_time().as_millis() as u64,
                state = %target,
                "Health probe changed connection state"
            );
        }
        healthy
    }

    /// Close the connection and release the upstream handle. Idempotent.
    pub async fn disconnect(&self) {
        if self.transition(ConnectionState::Closed).is_err() {
            return;
        }
        if let Some(handle) = self.take_handle() {
            self.upstream.disconnect(&handle).await;
        }
        tracing::debug!(connection_id = %self.id, "Connection closed");
    }

    // --- Metrics ---

    pub fn active_requests(&self) -> usize {
        self.active_requests.load(Ordering::SeqCst)
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }

    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// `1 - failed/total`, 1.0 before any request.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            return 1.0;
        }
        1.0 - self.failed_requests() as f64 / total as f64
    }

    pub fn avg_response_time(&self) -> Duration {
        lock(&self.responses).average()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_time(&self) -> Duration {
        lock(&self.last_used).elapsed()
    }

    pub fn error_counts(&self) -> BTreeMap<ErrorCategory, u64> {
        lock(&self.error_counts).clone()
    }

    /// Whether the connection may serve traffic.
    pub fn is_healthy(&self) -> bool {
        let thresholds = &self.config.thresholds;
        if self.state() != ConnectionState::Healthy {
            return false;
        }
        if self.consecutive_failures() >= thresholds.max_consecutive_failures {
            return false;
        }
        if self.total_requests() >= thresholds.min_requests_for_rate && self.success_rate() < thresholds.min_success_rate {
            return false;
        }
        self.avg_response_time() <= thresholds.max_avg_response()
    }

    /// Weighted load estimate; lower is better.
    pub fn load_score(&self) -> f64 {
        let w = &self.config.load_score;
        w.active_requests * self.active_requests() as f64
            + w.avg_response_secs * self.avg_response_time().as_secs_f64()
            + w.failure_rate * (1.0 - self.success_rate())
            + w.consecutive_failures * self.consecutive_failures() as f64
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        let (avg, min, max) = {
            let window = lock(&self.responses);
            (window.average(), window.min(), window.max())
        };
        ConnectionSnapshot {
            id: self.id,
            state: self.state(),
            healthy: self.is_healthy(),
            total_requests: self.total_requests(),
            failed_requests: self.failed_requests(),
            consecutive_failures: self.consecutive_failures(),
            active_requests: self.active_requests(),
            success_rate: self.success_rate(),
            avg_response_ms: avg.as_secs_f64() * 1000.0,
            min_response_ms: min.as_secs_f64() * 1000.0,
            max_response_ms: max.as_secs_f64() * 1000.0,
            load_score: self.load_score(),
            age_secs: self.age().as_secs(),
            idle_secs: self.idle_time().as_secs(),
            created_at: self.created_at_wall,
            last_health_check: *lock(&self.last_health_check),
            error_counts: self.error_counts(),
        }
    }
}

impl<U: Upstream> Reconnect for Connection<U> {
    fn reconnect(&self) -> BoxFuture<'_, Result<(), ConnectionError>> {
        Box::pin(Connection::reconnect(self))
    }

    fn label(&self) -> String {
        self.id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{BackoffStrategy, RetryConfig};
    use crate::resilience::classifier::ErrorClassifier;
    use std::sync::atomic::AtomicBool;

    /// Upstream whose liveness and failures are switchable.
    #[derive(Default)]
    struct Switchable {
        refuse: AtomicBool,
        dead: AtomicBool,
        disconnects: AtomicU64,
    }

    impl Upstream for Switchable {
        type Handle = u64;

        async fn connect(&self) -> Result<u64, UpstreamError> {
            if self.refuse.load(Ordering::SeqCst) {
                Err(UpstreamError::ConnectionRefused("nope".into()))
            } else {
                Ok(7)
            }
        }

        async fn disconnect(&self, _handle: &u64) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }

        async fn is_alive(&self, _handle: &u64) -> bool {
            !self.dead.load(Ordering::SeqCst)
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay_ms: 1,
            max_delay_ms: 2,
            strategy: BackoffStrategy::Fixed,
            jitter: false,
            attempt_timeout_ms: Some(1_000),
            ..RetryConfig::default()
        }
    }

    fn connection(upstream: Arc<Switchable>) -> Connection<Switchable> {
        let config = ConnectionConfig {
            warmup_calls: 2,
            connect_retry: fast_retry(2),
            execute_retry: fast_retry(3),
            ..ConnectionConfig::default()
        };
        let retry = Arc::new(RetryManager::new(Arc::new(ErrorClassifier::new())));
        Connection::new(upstream, config, retry)
    }

    #[tokio::test]
    async fn test_connect_reaches_healthy() {
        let conn = connection(Arc::new(Switchable::default()));
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        conn.connect().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Healthy);
        assert!(conn.is_healthy());
        assert_eq!(
            conn.recent_transitions(),
            vec![
                (ConnectionState::Disconnected, ConnectionState::Connecting),
                (ConnectionState::Connecting, ConnectionState::WarmingUp),
                (ConnectionState::WarmingUp, ConnectionState::Healthy),
            ]
        );
        assert!(conn.id().to_string().starts_with("conn-"));
    }

    #[tokio::test]
    async fn test_connect_failure_goes_to_error() {
        let upstream = Arc::new(Switchable::default());
        upstream.refuse.store(true, Ordering::SeqCst);
        let conn = connection(upstream);

        let err = conn.connect().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Connect(ref f) if f.attempt_count() == 2));
        assert_eq!(conn.state(), ConnectionState::Error);
        // Error is terminal until removed.
        assert!(conn.reconnect().await.is_err());
    }

    #[tokio::test]
    async fn test_warmup_failure_goes_to_error() {
        let upstream = Arc::new(Switchable::default());
        upstream.dead.store(true, Ordering::SeqCst);
        let conn = connection(upstream.clone());

        let err = conn.connect().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Warmup { attempted: 2, .. }));
        assert_eq!(conn.state(), ConnectionState::Error);
        assert_eq!(upstream.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_execute_tracks_metrics() {
        let conn = connection(Arc::new(Switchable::default()));
        conn.connect().await.unwrap();

        let value = conn.execute(|h| async move { Ok(*h * 2) }).await.unwrap();
        assert_eq!(value, 14);
        assert_eq!(conn.total_requests(), 1);
        assert_eq!(conn.active_requests(), 0);

        let err = conn
            .execute(|_| async { Err::<(), _>(UpstreamError::Data("garbled".into())) })
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Data);
        assert_eq!(conn.failed_requests(), 1);
        assert_eq!(conn.consecutive_failures(), 1);
        assert_eq!(conn.active_requests(), 0);
        assert_eq!(conn.error_counts().get(&ErrorCategory::Data), Some(&1));
        assert!((conn.success_rate() - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_consecutive_failures_make_unhealthy() {
        let conn = connection(Arc::new(Switchable::default()));
        conn.connect().await.unwrap();

        for _ in 0..5 {
            let _ = conn
                .execute(|_| async { Err::<(), _>(UpstreamError::Authentication("denied".into())) })
                .await;
        }
        assert!(!conn.is_healthy());
        let err = conn.execute(|h| async move { Ok(*h) }).await.unwrap_err();
        assert!(matches!(err, ExecuteError::Unavailable(ConnectionError::Unhealthy(_))));
    }

    #[tokio::test]
    async fn test_health_probe_cache_and_transitions() {
        let upstream = Arc::new(Switchable::default());
        let conn = connection(upstream.clone());
        conn.connect().await.unwrap();

        assert!(conn.check_health(false).await);
        upstream.dead.store(true, Ordering::SeqCst);
        // Cached result still says healthy.
        assert!(conn.check_health(false).await);
        assert!(!conn.check_health(true).await);
        assert_eq!(conn.state(), ConnectionState::Unhealthy);

        upstream.dead.store(false, Ordering::SeqCst);
        assert!(conn.check_health(true).await);
        assert_eq!(conn.state(), ConnectionState::Healthy);
    }

    #[tokio::test]
    async fn test_reconnect_and_disconnect() {
        let upstream = Arc::new(Switchable::default());
        let conn = connection(upstream.clone());
        conn.connect().await.unwrap();

        Connection::reconnect(&conn).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Healthy);
        assert_eq!(conn.reconnect_count(), 1);
        assert_eq!(upstream.disconnects.load(Ordering::SeqCst), 1);

        conn.disconnect().await;
        conn.disconnect().await;
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(upstream.disconnects.load(Ordering::SeqCst), 2);
        assert!(conn.connect().await.is_err());
    }

    #[test]
    fn test_transition_table() {
        use ConnectionState::*;
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(!Disconnected.can_transition_to(Healthy));
        assert!(!Error.can_transition_to(Connecting));
        assert!(Error.can_transition_to(Closed));
        assert!(!Closed.can_transition_to(Closed));
        assert!(!Closed.can_transition_to(Connecting));
        assert!(Unhealthy.can_transition_to(Connecting));
    }
}
