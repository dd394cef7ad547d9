//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the pool.
//! All types derive Serde traits for deserialization from config files.
//! Durations are stored as integer `_ms`/`_secs` fields; accessors convert
//! them to [`Duration`] at the point of use.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::load_balancer::LoadBalanceStrategy;
use crate::resilience::classifier::ErrorCategory;

/// Root configuration for the service.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServiceConfig {
    /// Connection pool sizing, maintenance loops and per-connection policy.
    pub pool: PoolConfig,

    /// Exception handling and recovery settings.
    pub exceptions: ExceptionConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Connection pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Connections kept open at all times.
    pub min_size: usize,

    /// Hard cap on open connections.
    pub max_size: usize,

    /// Selection strategy among healthy connections.
    pub strategy: LoadBalanceStrategy,

    /// Connections at or above this many in-flight requests are not selected.
    pub max_active_per_connection: usize,

    /// Upper bound on a single wait inside `acquire` before re-polling.
    pub acquire_poll_interval_ms: u64,

    /// Idle connections beyond this are evicted (never below `min_size`).
    pub max_idle_time_secs: u64,

    /// Connections older than this are retired even if healthy.
    pub max_connection_age_secs: u64,

    /// Idle-cleanup loop period in milliseconds.
    pub cleanup_interval_ms: u64,

    /// Stats loop period in milliseconds.
    pub stats_interval_ms: u64,

    /// Route execution failures through automatic recovery.
    pub auto_recover: bool,

    /// Health check settings.
    pub health_check: HealthCheckConfig,

    /// Per-connection policy.
    pub connection: ConnectionConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 2,
            max_size: 10,
            strategy: LoadBalanceStrategy::Adaptive,
            max_active_per_connection: 8,
            acquire_poll_interval_ms: 25,
            max_idle_time_secs: 300,
            max_connection_age_secs: 3600,
            cleanup_interval_ms: 60_000,
            stats_interval_ms: 30_000,
            auto_recover: true,
            health_check: HealthCheckConfig::default(),
            connection: ConnectionConfig::default(),
        }
    }
}

impl PoolConfig {
    pub fn acquire_poll_interval(&self) -> Duration {
        Duration::from_millis(self.acquire_poll_interval_ms)
    }

    pub fn max_idle_time(&self) -> Duration {
        Duration::from_secs(self.max_idle_time_secs)
    }

    pub fn max_connection_age(&self) -> Duration {
        Duration::from_secs(self.max_connection_age_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }
}

/// Health check configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Enable the background health-check loop.
    pub enabled: bool,

    /// Health check interval in milliseconds.
    pub interval_ms: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 30_000,
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Per-connection policy: warmup, probing, health thresholds and retry.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Synthetic calls issued after connect before advertising healthy.
    pub warmup_calls: u32,

    /// Total time budget for warmup in milliseconds.
    pub warmup_timeout_ms: u64,

    /// How long a liveness probe result is reused.
    pub probe_cache_ttl_ms: u64,

    /// Thresholds used by `Connection::is_healthy`.
    pub thresholds: HealthThresholds,

    /// Weights of the adaptive load score.
    pub load_score: LoadScoreWeights,

    /// Retry policy for establishing the upstream handle.
    pub connect_retry: RetryConfig,

    /// Retry policy for operations executed on the connection.
    pub execute_retry: RetryConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            warmup_calls: 3,
            warmup_timeout_ms: 5_000,
            probe_cache_ttl_ms: 30_000,
            thresholds: HealthThresholds::default(),
            load_score: LoadScoreWeights::default(),
            connect_retry: RetryConfig::connect_default(),
            execute_retry: RetryConfig::default(),
        }
    }
}

impl ConnectionConfig {
    pub fn warmup_timeout(&self) -> Duration {
        Duration::from_millis(self.warmup_timeout_ms)
    }

    pub fn probe_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.probe_cache_ttl_ms)
    }
}

/// Thresholds a connection must satisfy to be considered healthy.
///
/// These are defaults, not contracts; deployments tune them.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthThresholds {
    /// Consecutive failures at which the connection stops being healthy.
    pub max_consecutive_failures: u64,

    /// Minimum success rate once enough requests were observed.
    pub min_success_rate: f64,

    /// Requests required before the success rate is enforced.
    pub min_requests_for_rate: u64,

    /// Ceiling on the average response time in milliseconds.
    pub max_avg_response_ms: u64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 5,
            min_success_rate: 0.8,
            min_requests_for_rate: 10,
            max_avg_response_ms: 10_000,
        }
    }
}

impl HealthThresholds {
    pub fn max_avg_response(&self) -> Duration {
        Duration::from_millis(self.max_avg_response_ms)
    }
}

/// Weights of the composite load score (lower score is preferred).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoadScoreWeights {
    pub active_requests: f64,
    pub avg_response_secs: f64,
    pub failure_rate: f64,
    pub consecutive_failures: f64,
}

impl Default for LoadScoreWeights {
    fn default() -> Self {
        Self {
            active_requests: 1.0,
            avg_response_secs: 2.0,
            failure_rate: 5.0,
            consecutive_failures: 0.5,
        }
    }
}

/// Delay growth between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    Linear,
    Exponential,
    JitteredExponential,
}

/// Retry configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,

    /// Base delay for backoff in milliseconds.
    pub base_delay_ms: u64,

    /// Maximum delay between attempts in milliseconds.
    pub max_delay_ms: u64,

    /// Backoff growth strategy.
    pub strategy: BackoffStrategy,

    /// Growth factor for exponential strategies.
    pub backoff_multiplier: f64,

    /// Apply ±10% jitter regardless of strategy.
    pub jitter: bool,

    /// Per-attempt timeout in milliseconds.
    pub attempt_timeout_ms: Option<u64>,

    /// Categories worth another attempt.
    pub retryable_categories: BTreeSet<ErrorCategory>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 10_000,
            strategy: BackoffStrategy::Exponential,
            backoff_multiplier: 2.0,
            jitter: true,
            attempt_timeout_ms: Some(30_000),
            retryable_categories: ErrorCategory::default_retryable(),
        }
    }
}

impl RetryConfig {
    /// Policy used while establishing a connection.
    pub fn connect_default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 5_000,
            strategy: BackoffStrategy::JitteredExponential,
            backoff_multiplier: 2.0,
            jitter: true,
            attempt_timeout_ms: Some(10_000),
            retryable_categories: ErrorCategory::default_retryable(),
        }
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn attempt_timeout(&self) -> Option<Duration> {
        self.attempt_timeout_ms.map(Duration::from_millis)
    }

    pub fn is_retryable(&self, category: ErrorCategory) -> bool {
        self.retryable_categories.contains(&category)
    }
}

/// Exception handling and recovery configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExceptionConfig {
    /// Records kept in the rolling history.
    pub history_size: usize,

    /// Outer recovery attempts per handled exception.
    pub recovery_attempts: u32,

    /// Base pause between outer recovery attempts (doubles each time).
    pub recovery_base_delay_ms: u64,

    /// Pause used by the built-in `retry_with_pause` action.
    pub retry_pause_ms: u64,

    /// Pause used by the built-in `cool_down` action.
    pub cool_down_ms: u64,

    /// Timeout applied to each built-in action attempt.
    pub action_timeout_ms: u64,
}

impl Default for ExceptionConfig {
    fn default() -> Self {
        Self {
            history_size: 1000,
            recovery_attempts: 3,
            recovery_base_delay_ms: 100,
            retry_pause_ms: 500,
            cool_down_ms: 5_000,
            action_timeout_ms: 10_000,
        }
    }
}

impl ExceptionConfig {
    pub fn recovery_base_delay(&self) -> Duration {
        Duration::from_millis(self.recovery_base_delay_ms)
    }

    pub fn retry_pause(&self) -> Duration {
        Duration::from_millis(self.retry_pause_ms)
    }

    pub fn cool_down(&self) -> Duration {
        Duration::from_millis(self.cool_down_ms)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action_timeout_ms)
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.pool.min_size, 2);
        assert_eq!(config.pool.max_size, 10);
        assert_eq!(config.pool.strategy, LoadBalanceStrategy::Adaptive);
        assert_eq!(config.pool.connection.connect_retry.max_attempts, 3);
        assert_eq!(
            config.pool.connection.connect_retry.strategy,
            BackoffStrategy::JitteredExponential
        );
        assert_eq!(config.exceptions.history_size, 1000);
    }

    #[test]
    fn test_retryable_defaults_exclude_auth() {
        let retry = RetryConfig::default();
        assert!(retry.is_retryable(ErrorCategory::Network));
        assert!(retry.is_retryable(ErrorCategory::RateLimit));
        assert!(!retry.is_retryable(ErrorCategory::Authentication));
        assert!(!retry.is_retryable(ErrorCategory::Data));
    }

    #[test]
    fn test_partial_toml() {
        let config: ServiceConfig = toml::from_str(
            r#"
            [pool]
            min_size = 1
            max_size = 4
            strategy = "least_connections"

            [pool.connection.execute_retry]
            max_attempts = 5
            strategy = "linear"
            retryable_categories = ["network", "timeout"]
            "#,
        )
        .unwrap();

        assert_eq!(config.pool.max_size, 4);
        assert_eq!(config.pool.strategy, LoadBalanceStrategy::LeastConnections);
        let retry = &config.pool.connection.execute_retry;
        assert_eq!(retry.max_attempts, 5);
        assert_eq!(retry.strategy, BackoffStrategy::Linear);
        assert_eq!(retry.base_delay_ms, 200);
        assert!(!retry.is_retryable(ErrorCategory::Server));
        assert_eq!(config.pool.health_check.interval_ms, 30_000);
    }
}
