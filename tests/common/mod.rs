//! Shared utilities for pool integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use upstream_pool::config::{BackoffStrategy, ExceptionConfig, PoolConfig, RetryConfig};
use upstream_pool::pool::ConnectionPool;
use upstream_pool::resilience::{ErrorClassifier, ExceptionHandler, RecoveryManager, RetryManager};
use upstream_pool::upstream::{Upstream, UpstreamError};

/// Handle of a mock session.
#[derive(Debug)]
pub struct MockHandle {
    pub session: u64,
}

/// Scriptable upstream: connect failures, connect latency and per-session death.
#[derive(Default)]
pub struct MockUpstream {
    next_session: AtomicU64,
    refuse: AtomicBool,
    connect_delay_ms: AtomicU64,
    dead: Mutex<HashSet<u64>>,
    pub connects: AtomicU64,
    pub disconnects: AtomicU64,
}

impl MockUpstream {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.connect_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Make every later probe of `session` fail.
    pub fn kill(&self, session: u64) {
        self.dead.lock().unwrap().insert(session);
    }

    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> u64 {
        self.disconnects.load(Ordering::SeqCst)
    }
}

impl Upstream for MockUpstream {
    type Handle = MockHandle;

    async fn connect(&self) -> Result<MockHandle, UpstreamError> {
        let delay = self.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.refuse.load(Ordering::SeqCst) {
            return Err(UpstreamError::ConnectionRefused("mock refused".into()));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(MockHandle {
            session: self.next_session.fetch_add(1, Ordering::SeqCst),
        })
    }

    async fn disconnect(&self, _handle: &MockHandle) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    async fn is_alive(&self, handle: &MockHandle) -> bool {
        !self.dead.lock().unwrap().contains(&handle.session)
    }
}

pub fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        base_delay_ms: 1,
        max_delay_ms: 5,
        strategy: BackoffStrategy::Fixed,
        jitter: false,
        attempt_timeout_ms: Some(1_000),
        ..RetryConfig::default()
    }
}

/// Pool config with fast retries and the background loops effectively off.
pub fn pool_config(min_size: usize, max_size: usize) -> PoolConfig {
    let mut config = PoolConfig {
        min_size,
        max_size,
        acquire_poll_interval_ms: 10,
        cleanup_interval_ms: 3_600_000,
        stats_interval_ms: 3_600_000,
        ..PoolConfig::default()
    };
    config.health_check.enabled = false;
    config.connection.warmup_calls = 1;
    config.connection.warmup_timeout_ms = 1_000;
    config.connection.connect_retry = fast_retry(2);
    config.connection.execute_retry = fast_retry(3);
    config
}

pub fn exception_config() -> ExceptionConfig {
    ExceptionConfig {
        recovery_attempts: 2,
        recovery_base_delay_ms: 1,
        retry_pause_ms: 1,
        cool_down_ms: 1,
        action_timeout_ms: 1_000,
        ..ExceptionConfig::default()
    }
}

pub fn build_pool(upstream: Arc<MockUpstream>, config: PoolConfig) -> ConnectionPool<MockUpstream> {
    let classifier = Arc::new(ErrorClassifier::new());
    let retry = Arc::new(RetryManager::new(Arc::clone(&classifier)));
    let exceptions_config = exception_config();
    let recovery = Arc::new(RecoveryManager::with_defaults(&exceptions_config));
    let exceptions = Arc::new(ExceptionHandler::new(classifier, recovery, exceptions_config));
    ConnectionPool::new(upstream, config, retry, exceptions)
}

/// Initialized pool over a fresh mock upstream.
pub async fn started_pool(min_size: usize, max_size: usize) -> (Arc<MockUpstream>, ConnectionPool<MockUpstream>) {
    let upstream = MockUpstream::new();
    let pool = build_pool(Arc::clone(&upstream), pool_config(min_size, max_size));
    pool.initialize().await.unwrap();
    (upstream, pool)
}
