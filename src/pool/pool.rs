//! Connection pool orchestration.
//!
//! # Responsibilities
//! - Keep between `min_size` and `max_size` connections open
//! - Lease connections exclusively through [`PooledConnection`]
//! - Run the health-check, idle-cleanup and stats loops
//! - Route execution failures to the exception handler
//!
//! # Design Decisions
//! - Size accounting counts open entries plus reserved creation slots
//! - Creation for `acquire` runs in its own task; if the caller times out the
//!   new connection is returned to the idle set instead of being dropped
//! - Leased connections are never evicted by background loops; release decides

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::{broadcast, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::config::schema::PoolConfig;
use crate::health::{probe_all, HealthChecker, HealthReport, HealthTarget};
use crate::lifecycle::Shutdown;
use crate::load_balancer::{Candidate, LoadBalanceStrategy, LoadBalancer};
use crate::observability::metrics;
use crate::pool::connection::{Connection, ConnectionId, ConnectionSnapshot};
use crate::pool::lease::PooledConnection;
use crate::pool::{ConnectionError, ExecuteError, PoolError};
use crate::resilience::exceptions::{ExceptionContext, ExceptionHandler};
use crate::resilience::recovery::Reconnect;
use crate::resilience::retry::RetryManager;
use crate::upstream::{Upstream, UpstreamError};

struct PoolEntry<U: Upstream> {
    conn: Arc<Connection<U>>,
    leased: bool,
    idle_since: Instant,
}

struct PoolState<U: Upstream> {
    entries: BTreeMap<ConnectionId, PoolEntry<U>>,
    /// Slots reserved for connections being created.
    pending: usize,
}

impl<U: Upstream> PoolState<U> {
    fn size(&self) -> usize {
        self.entries.len() + self.pending
    }

    fn healthy(&self) -> usize {
        self.entries.values().filter(|e| e.conn.is_healthy()).count()
    }

    fn remove_all(&mut self, ids: impl IntoIterator<Item = ConnectionId>) -> Vec<Arc<Connection<U>>> {
        ids.into_iter()
            .filter_map(|id| self.entries.remove(&id))
            .map(|e| e.conn)
            .collect()
    }
}

#[derive(Debug, Default)]
struct CounterSet {
    created: AtomicU64,
    creation_failures: AtomicU64,
    evicted: AtomicU64,
    acquired: AtomicU64,
    acquire_timeouts: AtomicU64,
    reconnects: AtomicU64,
}

/// Lifetime pool counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolCounters {
    pub created: u64,
    pub creation_failures: u64,
    pub evicted: u64,
    pub acquired: u64,
    pub acquire_timeouts: u64,
    pub reconnects: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolInfo {
    pub total: usize,
    pub leased: usize,
    pub idle: usize,
    pub pending: usize,
    pub min_size: usize,
    pub max_size: usize,
    pub strategy: LoadBalanceStrategy,
    pub shutting_down: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolPerformance {
    pub healthy: usize,
    pub health_rate: f64,
    /// Leased / open connections.
    pub utilization: f64,
    pub active_requests: usize,
    pub avg_response_ms: f64,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub success_rate: f64,
}

/// Full pool report.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub pool_info: PoolInfo,
    pub performance: PoolPerformance,
    pub lifetime: PoolCounters,
    pub connections: Vec<ConnectionSnapshot>,
}

/// A reserved creation slot; released on drop unless committed.
struct SlotReservation<U: Upstream> {
    pool: Arc<PoolInner<U>>,
    active: bool,
}

impl<U: Upstream> Drop for SlotReservation<U> {
    fn drop(&mut self) {
        if self.active {
            self.pool.state().pending -= 1;
            self.pool.available.notify_one();
        }
    }
}

enum ReleaseOutcome {
    /// Back in the idle set.
    Returned,
    /// Removed from the pool; needs disconnect.
    Removed,
    /// Not part of the pool any more (shutdown); needs disconnect.
    Orphaned,
    /// Not leased; nothing to do.
    Ignored,
}

pub(crate) struct PoolInner<U: Upstream> {
    upstream: Arc<U>,
    config: PoolConfig,
    balancer: Box<dyn LoadBalancer>,
    retry: Arc<RetryManager>,
    exceptions: Arc<ExceptionHandler>,
    state: Mutex<PoolState<U>>,
    available: Notify,
    shutdown: Shutdown,
    started: AtomicBool,
    counters: CounterSet,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<U: Upstream> PoolInner<U> {
    fn state(&self) -> MutexGuard<'_, PoolState<U>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_shutting_down(&self) -> bool {
        self.shutdown.is_triggered()
    }

    // --- Slots and creation ---

    /// Reserve a creation slot if below `max_size`.
    fn try_reserve(self: &Arc<Self>) -> Option<SlotReservation<U>> {
        let mut state = self.state();
        if self.is_shutting_down() || state.size() >= self.config.max_size {
            return None;
        }
        state.pending += 1;
        Some(SlotReservation {
            pool: Arc::clone(self),
            active: true,
        })
    }

    /// Reserve a slot only while healthy plus pending connections are below `min_size`.
    fn try_reserve_for_min(self: &Arc<Self>) -> Option<SlotReservation<U>> {
        let mut state = self.state();
        if self.is_shutting_down()
            || state.healthy() + state.pending >= self.config.min_size
            || state.size() >= self.config.max_size
        {
            return None;
        }
        state.pending += 1;
        Some(SlotReservation {
            pool: Arc::clone(self),
            active: true,
        })
    }

    /// Turn a reservation into a pool entry. Fails once shutdown started.
    fn commit(&self, mut slot: SlotReservation<U>, conn: &Arc<Connection<U>>, leased: bool) -> bool {
        let mut state = self.state();
        slot.active = false;
        state.pending -= 1;
        if self.is_shutting_down() {
            return false;
        }
        state.entries.insert(
            conn.id(),
            PoolEntry {
                conn: Arc::clone(conn),
                leased,
                idle_since: Instant::now(),
            },
        );
        true
    }

    async fn create_connection(&self) -> Result<Arc<Connection<U>>, ConnectionError> {
        let conn = Arc::new(Connection::new(
            Arc::clone(&self.upstream),
            self.config.connection.clone(),
            Arc::clone(&self.retry),
        ));

        match conn.connect().await {
            Ok(()) => {
                self.counters.created.fetch_add(1, Ordering::Relaxed);
                metrics::record_connection_event("created");
                tracing::info!(connection_id = %conn.id(), "Connection created");
                Ok(conn)
            }
            Err(err) => {
                self.counters.creation_failures.fetch_add(1, Ordering::Relaxed);
                metrics::record_connection_event("create_failed");
                let ctx = ExceptionContext::new()
                    .with_field("operation", "create_connection")
                    .with_field("connection_id", conn.id());
                self.exceptions.handle(&err, ctx, false).await;
                Err(err)
            }
        }
    }

    async fn open_with_slot(&self, slot: SlotReservation<U>, leased: bool) -> Result<Arc<Connection<U>>, PoolError> {
        let conn = self.create_connection().await.map_err(PoolError::Create)?;
        if !self.commit(slot, &conn, leased) {
            conn.disconnect().await;
            return Err(PoolError::ShuttingDown);
        }
        Ok(conn)
    }

    /// Create connections until healthy + pending reaches `min_size`.
    async fn replenish(self: &Arc<Self>) -> usize {
        let mut created = 0;
        while let Some(slot) = self.try_reserve_for_min() {
            match self.open_with_slot(slot, false).await {
                Ok(_) => {
                    created += 1;
                    self.available.notify_one();
                }
                Err(err) => {
                    tracing::warn!(error = %err, "Failed to replenish pool");
                    break;
                }
            }
        }
        if created > 0 {
            tracing::info!(created, min_size = self.config.min_size, "Pool replenished");
        }
        created
    }

    fn spawn_replenish(self: &Arc<Self>) {
        if self.is_shutting_down() {
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let pool = Arc::clone(self);
            runtime.spawn(async move {
                pool.replenish().await;
            });
        }
    }

    async fn evict(&self, conns: Vec<Arc<Connection<U>>>, reason: &'static str) -> usize {
        let count = conns.len();
        if count == 0 {
            return 0;
        }
        for conn in &conns {
            tracing::info!(connection_id = %conn.id(), reason, "Evicting connection");
            metrics::record_connection_event("evicted");
        }
        join_all(conns.iter().map(|c| c.disconnect())).await;
        self.counters.evicted.fetch_add(count as u64, Ordering::Relaxed);
        count
    }

    // --- Acquire / release ---

    /// Lease the balancer's pick among idle, healthy connections.
    fn lease_candidate(&self) -> Option<Arc<Connection<U>>> {
        let mut state = self.state();
        if self.is_shutting_down() {
            return None;
        }

        let (ids, candidates): (Vec<ConnectionId>, Vec<Candidate>) = state
            .entries
            .iter()
            .filter(|(_, e)| {
                !e.leased
                    && e.conn.active_requests() < self.config.max_active_per_connection
                    && e.conn.is_healthy()
            })
            .map(|(id, e)| {
                let candidate = Candidate {
                    active_requests: e.conn.active_requests(),
                    avg_response_time: e.conn.avg_response_time(),
                    load_score: e.conn.load_score(),
                };
                (*id, candidate)
            })
            .unzip();

        let index = self.balancer.select(&candidates)?;
        let entry = state.entries.get_mut(ids.get(index)?)?;
        entry.leased = true;
        Some(Arc::clone(&entry.conn))
    }

    /// Remove a specific leased connection (failed probe and reconnect).
    fn remove_leased(&self, id: ConnectionId) -> Option<Arc<Connection<U>>> {
        let mut state = self.state();
        match state.entries.get(&id) {
            Some(entry) if entry.leased => state.entries.remove(&id).map(|e| e.conn),
            _ => None,
        }
    }

    fn lease(self: &Arc<Self>, conn: Arc<Connection<U>>, started: Instant) -> PooledConnection<U> {
        self.counters.acquired.fetch_add(1, Ordering::Relaxed);
        metrics::record_acquire_wait(started.elapsed());
        tracing::trace!(connection_id = %conn.id(), waited = ?started.elapsed(), "Connection leased");
        PooledConnection::new(conn, Arc::clone(self))
    }

    async fn acquire(self: &Arc<Self>, timeout: Duration) -> Result<PooledConnection<U>, PoolError> {
        let started = Instant::now();
        let deadline = started + timeout;

        loop {
            if self.is_shutting_down() {
                return Err(PoolError::ShuttingDown);
            }
            if Instant::now() >= deadline {
                return Err(self.acquire_timeout(started));
            }

            // (a) existing idle connection
            if let Some(conn) = self.lease_candidate() {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match time::timeout(remaining, conn.check_health(false)).await {
                    Ok(true) if conn.is_healthy() => return Ok(self.lease(conn, started)),
                    Ok(_) => {}
                    Err(_) => {
                        self.release_connection(&conn).await;
                        return Err(self.acquire_timeout(started));
                    }
                }

                tracing::warn!(connection_id = %conn.id(), "Selected connection failed health check, reconnecting");
                let remaining = deadline.saturating_duration_since(Instant::now());
                let reconnected = time::timeout(remaining, Connection::reconnect(&*conn)).await;
                if matches!(reconnected, Ok(Ok(()))) && conn.is_healthy() {
                    self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
                    return Ok(self.lease(conn, started));
                }

                // A reconnect cut short by the deadline leaves the connection mid-transition.
                if let Some(conn) = self.remove_leased(conn.id()) {
                    self.evict(vec![conn], "failed_health_check").await;
                    self.spawn_replenish();
                }
                if reconnected.is_err() {
                    return Err(self.acquire_timeout(started));
                }
                continue;
            }

            // (b) room to grow
            if let Some(slot) = self.try_reserve() {
                let (tx, rx) = oneshot::channel();
                let pool = Arc::clone(self);
                tokio::spawn(async move {
                    let result = pool.open_with_slot(slot, true).await;
                    if let Err(Ok(conn)) = tx.send(result) {
                        // The caller gave up; hand the connection to the next waiter.
                        pool.release_connection(&conn).await;
                    }
                });

                let remaining = deadline.saturating_duration_since(Instant::now());
                match time::timeout(remaining, rx).await {
                    Ok(Ok(Ok(conn))) => return Ok(self.lease(conn, started)),
                    Ok(Ok(Err(err))) => return Err(err),
                    Ok(Err(_)) => continue,
                    Err(_) => return Err(self.acquire_timeout(started)),
                }
            }

            // (c) wait for a release
            let now = Instant::now();
            if now >= deadline {
                return Err(self.acquire_timeout(started));
            }
            let wait = self.config.acquire_poll_interval().min(deadline - now);
            let _ = time::timeout(wait, self.available.notified()).await;
        }
    }

    fn acquire_timeout(&self, started: Instant) -> PoolError {
        let waited = started.elapsed();
        let size = self.state().size();
        self.counters.acquire_timeouts.fetch_add(1, Ordering::Relaxed);
        metrics::record_acquire_timeout();
        tracing::warn!(waited = ?waited, size, max_size = self.config.max_size, "Acquire timed out");
        PoolError::AcquireTimeout {
            waited,
            size,
            max_size: self.config.max_size,
        }
    }

    fn return_to_pool(&self, conn: &Connection<U>) -> ReleaseOutcome {
        let mut state = self.state();
        let id = conn.id();
        let Some(entry) = state.entries.get_mut(&id) else {
            return ReleaseOutcome::Orphaned;
        };
        if !entry.leased {
            return ReleaseOutcome::Ignored;
        }
        if self.is_shutting_down() || !conn.is_healthy() {
            state.entries.remove(&id);
            return ReleaseOutcome::Removed;
        }
        entry.leased = false;
        entry.idle_since = Instant::now();
        ReleaseOutcome::Returned
    }

    /// Return a leased connection. `false` if it was not leased.
    pub(crate) async fn release_connection(self: &Arc<Self>, conn: &Arc<Connection<U>>) -> bool {
        match self.return_to_pool(conn) {
            ReleaseOutcome::Returned => {
                self.available.notify_one();
                true
            }
            ReleaseOutcome::Removed => {
                self.evict(vec![Arc::clone(conn)], "unhealthy_on_release").await;
                self.available.notify_one();
                self.spawn_replenish();
                true
            }
            ReleaseOutcome::Orphaned => {
                conn.disconnect().await;
                true
            }
            ReleaseOutcome::Ignored => false,
        }
    }

    /// Release from a synchronous context (lease drop).
    pub(crate) fn release_detached(self: &Arc<Self>, conn: Arc<Connection<U>>) {
        let outcome = self.return_to_pool(&conn);
        if matches!(outcome, ReleaseOutcome::Returned) {
            self.available.notify_one();
            return;
        }
        if matches!(outcome, ReleaseOutcome::Ignored) {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(connection_id = %conn.id(), "No runtime to disconnect dropped lease");
            return;
        };
        let pool = Arc::clone(self);
        runtime.spawn(async move {
            if matches!(outcome, ReleaseOutcome::Removed) {
                pool.evict(vec![conn], "unhealthy_on_release").await;
                pool.available.notify_one();
                pool.spawn_replenish();
            } else {
                conn.disconnect().await;
            }
        });
    }

    pub(crate) async fn report_failure(&self, conn: &Arc<Connection<U>>, err: &ExecuteError) {
        let target: Arc<dyn Reconnect> = conn.clone();
        let ctx = ExceptionContext::new()
            .with_field("operation", "execute")
            .with_field("connection_id", conn.id())
            .with_target(target);
        let record = self.exceptions.handle(err, ctx, self.config.auto_recover).await;
        if record.recovery_action.as_deref() == Some("reset_connection") {
            self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
        }
    }

    // --- Maintenance ---

    async fn cleanup_idle(self: &Arc<Self>) -> usize {
        let max_age = self.config.max_connection_age();
        let max_idle = self.config.max_idle_time();

        let (aged, idle) = {
            let mut state = self.state();

            let aged_ids: Vec<ConnectionId> = state
                .entries
                .iter()
                .filter(|(_, e)| !e.leased && e.conn.age() >= max_age)
                .map(|(id, _)| *id)
                .collect();
            let aged = state.remove_all(aged_ids);

            let mut idle_ids: Vec<(ConnectionId, Duration)> = state
                .entries
                .iter()
                .filter(|(_, e)| !e.leased && e.idle_since.elapsed() >= max_idle)
                .map(|(id, e)| (*id, e.idle_since.elapsed()))
                .collect();
            idle_ids.sort_by(|a, b| b.1.cmp(&a.1));
            let removable = state.entries.len().saturating_sub(self.config.min_size);
            let idle = state.remove_all(idle_ids.into_iter().take(removable).map(|(id, _)| id));

            (aged, idle)
        };

        let removed = self.evict(aged, "max_age").await + self.evict(idle, "idle").await;
        self.replenish().await;
        removed
    }

    async fn cleanup_loop(pool: Weak<Self>, interval: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(pool) = pool.upgrade() else { break };
                    let removed = pool.cleanup_idle().await;
                    if removed > 0 {
                        tracing::debug!(removed, "Idle cleanup evicted connections");
                    }
                }
                _ = shutdown.recv() => {
                    tracing::debug!("Idle cleanup received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    async fn stats_loop(pool: Weak<Self>, interval: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(pool) = pool.upgrade() else { break };
                    let status = pool.status();
                    metrics::record_pool_stats(
                        status.pool_info.total,
                        status.performance.healthy,
                        status.performance.utilization,
                        Duration::from_secs_f64(status.performance.avg_response_ms / 1000.0),
                    );
                    tracing::debug!(
                        total = status.pool_info.total,
                        healthy = status.performance.healthy,
                        leased = status.pool_info.leased,
                        utilization = status.performance.utilization,
                        "Pool stats"
                    );
                    if status.performance.healthy < pool.config.min_size {
                        pool.replenish().await;
                    }
                }
                _ = shutdown.recv() => {
                    tracing::debug!("Stats loop received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    fn spawn_loops(self: &Arc<Self>) {
        let mut tasks = Vec::new();

        if self.config.health_check.enabled {
            let checker = HealthChecker::new(self, self.config.health_check.interval());
            tasks.push(tokio::spawn(checker.run(self.shutdown.subscribe())));
        }
        tasks.push(tokio::spawn(Self::cleanup_loop(
            Arc::downgrade(self),
            self.config.cleanup_interval(),
            self.shutdown.subscribe(),
        )));
        tasks.push(tokio::spawn(Self::stats_loop(
            Arc::downgrade(self),
            self.config.stats_interval(),
            self.shutdown.subscribe(),
        )));

        self.tasks.lock().unwrap_or_else(PoisonError::into_inner).extend(tasks);
    }

    // --- Reporting ---

    fn status(&self) -> PoolStatus {
        let state = self.state();
        let connections: Vec<ConnectionSnapshot> = state.entries.values().map(|e| e.conn.snapshot()).collect();
        let leased = state.entries.values().filter(|e| e.leased).count();
        let total = state.entries.len();
        let pending = state.pending;
        drop(state);

        let healthy = connections.iter().filter(|c| c.healthy).count();
        let total_requests: u64 = connections.iter().map(|c| c.total_requests).sum();
        let failed_requests: u64 = connections.iter().map(|c| c.failed_requests).sum();
        let sampled: Vec<f64> = connections
            .iter()
            .filter(|c| c.avg_response_ms > 0.0)
            .map(|c| c.avg_response_ms)
            .collect();

        let ratio = |num: usize, den: usize| if den == 0 { 0.0 } else { num as f64 / den as f64 };

        PoolStatus {
            pool_info: PoolInfo {
                total,
                leased,
                idle: total - leased,
                pending,
                min_size: self.config.min_size,
                max_size: self.config.max_size,
                strategy: self.config.strategy,
                shutting_down: self.is_shutting_down(),
            },
            performance: PoolPerformance {
                healthy,
                health_rate: if total == 0 { 1.0 } else { ratio(healthy, total) },
                utilization: ratio(leased, total),
                active_requests: connections.iter().map(|c| c.active_requests).sum(),
                avg_response_ms: if sampled.is_empty() {
                    0.0
                } else {
                    sampled.iter().sum::<f64>() / sampled.len() as f64
                },
                total_requests,
                failed_requests,
                success_rate: if total_requests == 0 {
                    1.0
                } else {
                    1.0 - failed_requests as f64 / total_requests as f64
                },
            },
            lifetime: self.counters(),
            connections,
        }
    }

    fn counters(&self) -> PoolCounters {
        let c = &self.counters;
        PoolCounters {
            created: c.created.load(Ordering::Relaxed),
            creation_failures: c.creation_failures.load(Ordering::Relaxed),
            evicted: c.evicted.load(Ordering::Relaxed),
            acquired: c.acquired.load(Ordering::Relaxed),
            acquire_timeouts: c.acquire_timeouts.load(Ordering::Relaxed),
            reconnects: c.reconnects.load(Ordering::Relaxed),
        }
    }
}

impl<U: Upstream> HealthTarget for PoolInner<U> {
    async fn run_health_check(self: Arc<Self>) -> HealthReport {
        let connections: Vec<Arc<Connection<U>>> = self.state().entries.values().map(|e| Arc::clone(&e.conn)).collect();
        let results = probe_all(connections).await;

        let healthy = results.iter().filter(|(_, ok)| *ok).count();
        let failed: Vec<ConnectionId> = results.iter().filter(|(_, ok)| !*ok).map(|(c, _)| c.id()).collect();

        // Leased failures are removed when released.
        let removed = {
            let mut state = self.state();
            let idle_failed: Vec<ConnectionId> = failed
                .iter()
                .copied()
                .filter(|id| state.entries.get(id).is_some_and(|e| !e.leased))
                .collect();
            state.remove_all(idle_failed)
        };

        let mut report = HealthReport::new(healthy, results.len() - healthy);
        report.evicted = self.evict(removed, "failed_health_check").await;
        report.replenished = self.replenish().await;
        report
    }
}

/// Bounded pool of upstream connections.
pub struct ConnectionPool<U: Upstream> {
    inner: Arc<PoolInner<U>>,
}

impl<U: Upstream> Clone for ConnectionPool<U> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<U: Upstream> ConnectionPool<U> {
    pub fn new(
        upstream: Arc<U>,
        config: PoolConfig,
        retry: Arc<RetryManager>,
        exceptions: Arc<ExceptionHandler>,
    ) -> Self {
        let balancer = config.strategy.build();
        Self {
            inner: Arc::new(PoolInner {
                upstream,
                config,
                balancer,
                retry,
                exceptions,
                state: Mutex::new(PoolState {
                    entries: BTreeMap::new(),
                    pending: 0,
                }),
                available: Notify::new(),
                shutdown: Shutdown::new(),
                started: AtomicBool::new(false),
                counters: CounterSet::default(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Open `min_size` connections and start the background loops.
    ///
    /// Partial failure is tolerated (the loops replenish later); an error is
    /// returned only when no connection could be opened at all.
    pub async fn initialize(&self) -> Result<(), PoolError> {
        let inner = &self.inner;
        if inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let opens: Vec<_> = (0..inner.config.min_size)
            .filter_map(|_| inner.try_reserve())
            .map(|slot| inner.open_with_slot(slot, false))
            .collect();
        let results = join_all(opens).await;
        let created = results.iter().filter(|r| r.is_ok()).count();
        let last_error = results.into_iter().filter_map(Result::err).last();

        inner.spawn_loops();
        tracing::info!(
            created,
            min_size = inner.config.min_size,
            max_size = inner.config.max_size,
            strategy = %inner.config.strategy,
            "Connection pool initialized"
        );

        match last_error {
            Some(err) if created == 0 => Err(err),
            _ => Ok(()),
        }
    }

    /// Lease a connection, waiting at most `timeout`.
    pub async fn acquire(&self, timeout: Duration) -> Result<PooledConnection<U>, PoolError> {
        self.inner.acquire(timeout).await
    }

    /// Return a lease. Safe to call more than once.
    pub async fn release(&self, lease: &mut PooledConnection<U>) -> bool {
        lease.release().await
    }

    /// Acquire, execute and release in one call.
    pub async fn execute<T, F, Fut>(&self, timeout: Duration, operation: F) -> Result<T, ExecuteError>
    where
        F: FnMut(Arc<U::Handle>) -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        let mut lease = match self.acquire(timeout).await {
            Ok(lease) => lease,
            Err(err) => {
                let err = ExecuteError::from(err);
                let ctx = ExceptionContext::new().with_field("operation", "acquire");
                self.inner.exceptions.handle(&err, ctx, false).await;
                return Err(err);
            }
        };
        let result = lease.execute(operation).await;
        lease.release().await;
        result
    }

    /// Open up to `count` extra connections, bounded by `max_size`.
    pub async fn scale_up(&self, count: usize) -> usize {
        let mut created = 0;
        for _ in 0..count {
            let Some(slot) = self.inner.try_reserve() else {
                break;
            };
            match self.inner.open_with_slot(slot, false).await {
                Ok(_) => {
                    created += 1;
                    self.inner.available.notify_one();
                }
                Err(err) => {
                    tracing::warn!(error = %err, "Scale up stopped early");
                    break;
                }
            }
        }
        tracing::info!(requested = count, created, "Scaled up");
        created
    }

    /// Close up to `count` idle connections, most idle first, never below `min_size`.
    pub async fn scale_down(&self, count: usize) -> usize {
        let victims = {
            let mut state = self.inner.state();
            let removable = state.entries.len().saturating_sub(self.inner.config.min_size).min(count);
            let mut idle: Vec<(ConnectionId, Instant)> = state
                .entries
                .iter()
                .filter(|(_, e)| !e.leased)
                .map(|(id, e)| (*id, e.idle_since))
                .collect();
            idle.sort_by_key(|(_, since)| *since);
            state.remove_all(idle.into_iter().take(removable).map(|(id, _)| id))
        };
        let removed = self.inner.evict(victims, "scale_down").await;
        tracing::info!(requested = count, removed, "Scaled down");
        removed
    }

    /// Force-probe every connection, evict idle failures and top up.
    pub async fn health_check(&self) -> HealthReport {
        Arc::clone(&self.inner).run_health_check().await
    }

    /// Evict idle and aged connections now.
    pub async fn cleanup_idle(&self) -> usize {
        self.inner.cleanup_idle().await
    }

    pub fn status(&self) -> PoolStatus {
        self.inner.status()
    }

    pub fn counters(&self) -> PoolCounters {
        self.inner.counters()
    }

    /// Open connections (excluding pending creations).
    pub fn size(&self) -> usize {
        self.inner.state().entries.len()
    }

    pub fn healthy_count(&self) -> usize {
        self.inner.state().healthy()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn exceptions(&self) -> &Arc<ExceptionHandler> {
        &self.inner.exceptions
    }

    pub fn retry(&self) -> &Arc<RetryManager> {
        &self.inner.retry
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.is_shutting_down()
    }

    /// Stop the background loops and disconnect every connection.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if !inner.shutdown.trigger() {
            return;
        }
        tracing::info!("Connection pool shutting down");

        let tasks = std::mem::take(&mut *inner.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "Background task ended abnormally");
            }
        }

        let connections: Vec<Arc<Connection<U>>> = std::mem::take(&mut inner.state().entries)
            .into_values()
            .map(|e| e.conn)
            .collect();
        let count = connections.len();
        join_all(connections.iter().map(|c| c.disconnect())).await;
        inner.available.notify_waiters();

        tracing::info!(closed = count, "Connection pool shut down");
    }
}
