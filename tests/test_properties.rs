//! Property-based tests for the connection state machine, pool sizing and backoff.
//!
//! - Every recorded state change is an allowed edge
//! - Pool size stays within `[min_size, max_size]` under arbitrary operation sequences
//! - Exponential backoff doubles then clamps; jitter stays within ±10%

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use upstream_pool::config::{BackoffStrategy, ConnectionConfig, RetryConfig};
use upstream_pool::pool::{Connection, ConnectionState};
use upstream_pool::resilience::backoff::calculate_delay;
use upstream_pool::resilience::{ErrorClassifier, RetryManager};
use upstream_pool::upstream::UpstreamError;

mod common;

use common::{build_pool, fast_retry, pool_config, MockUpstream};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap()
}

#[derive(Debug, Clone)]
enum ConnOp {
    Connect,
    Reconnect,
    Disconnect,
    Probe { force: bool },
    Execute { fail: bool },
    Kill,
    Refuse(bool),
}

fn conn_op() -> impl Strategy<Value = ConnOp> {
    prop_oneof![
        Just(ConnOp::Connect),
        Just(ConnOp::Reconnect),
        Just(ConnOp::Disconnect),
        any::<bool>().prop_map(|force| ConnOp::Probe { force }),
        any::<bool>().prop_map(|fail| ConnOp::Execute { fail }),
        Just(ConnOp::Kill),
        any::<bool>().prop_map(ConnOp::Refuse),
    ]
}

#[derive(Debug, Clone)]
enum PoolOp {
    Acquire,
    Release,
    HealthCheck,
    ScaleUp(usize),
    ScaleDown(usize),
    Cleanup,
}

fn pool_op() -> impl Strategy<Value = PoolOp> {
    prop_oneof![
        3 => Just(PoolOp::Acquire),
        3 => Just(PoolOp::Release),
        1 => Just(PoolOp::HealthCheck),
        1 => (0usize..4).prop_map(PoolOp::ScaleUp),
        1 => (0usize..4).prop_map(PoolOp::ScaleDown),
        1 => Just(PoolOp::Cleanup),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Property: a connection only ever moves along allowed edges, and Closed is terminal
    #[test]
    fn prop_state_transitions_follow_edges(ops in prop::collection::vec(conn_op(), 1..24)) {
        let rt = runtime();
        let upstream = MockUpstream::new();
        let config = ConnectionConfig {
            warmup_calls: 1,
            connect_retry: fast_retry(1),
            execute_retry: fast_retry(1),
            ..ConnectionConfig::default()
        };
        let retry = Arc::new(RetryManager::new(Arc::new(ErrorClassifier::new())));
        let conn = Connection::new(Arc::clone(&upstream), config, retry);

        let mut session = None;
        let mut closed = false;
        for op in ops {
            rt.block_on(async {
                match op {
                    ConnOp::Connect => { let _ = conn.connect().await; }
                    ConnOp::Reconnect => { let _ = conn.reconnect().await; }
                    ConnOp::Disconnect => conn.disconnect().await,
                    ConnOp::Probe { force } => { conn.check_health(force).await; }
                    ConnOp::Execute { fail } => {
                        let result = conn
                            .execute(|h| async move {
                                if fail {
                                    Err(UpstreamError::Data("bad".into()))
                                } else {
                                    Ok(h.session)
                                }
                            })
                            .await;
                        if let Ok(s) = result {
                            session = Some(s);
                        }
                    }
                    ConnOp::Kill => {
                        if let Some(s) = session {
                            upstream.kill(s);
                        }
                    }
                    ConnOp::Refuse(refuse) => upstream.refuse_connections(refuse),
                }
            });

            let state = conn.state();
            if closed {
                prop_assert_eq!(state, ConnectionState::Closed);
            }
            closed = state == ConnectionState::Closed;
        }

        for (from, to) in conn.recent_transitions() {
            prop_assert!(from.can_transition_to(to), "illegal edge {} -> {}", from, to);
        }
        if conn.state() == ConnectionState::Healthy {
            prop_assert!(conn.active_requests() == 0);
        }
    }

    /// Property: pool size stays within bounds after any operation sequence
    #[test]
    fn prop_pool_size_within_bounds(
        min_size in 0usize..3,
        extra in 1usize..4,
        ops in prop::collection::vec(pool_op(), 1..20),
    ) {
        let max_size = min_size + extra;
        let rt = runtime();

        rt.block_on(async {
            let upstream = MockUpstream::new();
            let mut config = pool_config(min_size, max_size);
            config.max_idle_time_secs = 0;
            let pool = build_pool(upstream, config);
            pool.initialize().await.unwrap();

            let mut held = Vec::new();
            for op in ops {
                match op {
                    PoolOp::Acquire => {
                        if let Ok(lease) = pool.acquire(Duration::from_millis(20)).await {
                            held.push(lease);
                        }
                    }
                    PoolOp::Release => {
                        if let Some(mut lease) = held.pop() {
                            lease.release().await;
                        }
                    }
                    PoolOp::HealthCheck => { pool.health_check().await; }
                    PoolOp::ScaleUp(n) => { pool.scale_up(n).await; }
                    PoolOp::ScaleDown(n) => { pool.scale_down(n).await; }
                    PoolOp::Cleanup => { pool.cleanup_idle().await; }
                }

                let status = pool.status();
                prop_assert!(status.pool_info.total + status.pool_info.pending <= max_size);
                prop_assert!(pool.size() >= min_size, "size {} below min {}", pool.size(), min_size);
                prop_assert_eq!(status.pool_info.leased, held.len());
            }

            drop(held);
            pool.shutdown().await;
            Ok(())
        })?;
    }

    /// Property: exponential delays double from the base and clamp at the max
    #[test]
    fn prop_exponential_backoff_clamps(attempt in 1u32..20) {
        let config = RetryConfig {
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
            strategy: BackoffStrategy::Exponential,
            jitter: false,
            ..RetryConfig::default()
        };
        let expected = (1_000u64 << (attempt - 1).min(16)).min(60_000);
        prop_assert_eq!(calculate_delay(&config, attempt), Duration::from_millis(expected));
    }

    /// Property: jittered delays stay within ±10% of the unjittered value
    #[test]
    fn prop_jitter_within_ten_percent(attempt in 1u32..7) {
        let base = RetryConfig {
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
            strategy: BackoffStrategy::Exponential,
            jitter: false,
            ..RetryConfig::default()
        };
        let jittered = RetryConfig { strategy: BackoffStrategy::JitteredExponential, ..base.clone() };

        let plain = calculate_delay(&base, attempt).as_secs_f64();
        let noisy = calculate_delay(&jittered, attempt).as_secs_f64();
        prop_assert!(noisy >= plain * 0.9 - 1e-9 && noisy <= plain * 1.1 + 1e-9);
    }
}
