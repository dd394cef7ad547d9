//! Retry execution.
//!
//! # Responsibilities
//! - Run an operation up to `max_attempts` times
//! - Bound each attempt with the configured timeout
//! - Classify every failure once and stop early on non-retryable categories
//! - Sleep the backoff delay between attempts (the only place backoff happens)
//! - Keep rolling diagnostics of recent attempts
//!
//! # Design Decisions
//! - Explicit higher-order call: `execute_with_retry(&config, || op())`
//! - The full attempt history travels with the result
//! - Timeouts count as `Timeout` failures, not crashes

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime};

use serde::Serialize;
use thiserror::Error;

use crate::config::schema::RetryConfig;
use crate::observability::metrics;
use crate::resilience::backoff;
use crate::resilience::classifier::{ErrorCategory, ErrorClassifier};
use crate::upstream::UpstreamError;

const DEFAULT_HISTORY_LIMIT: usize = 1000;

/// One attempt of a retried call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryAttempt {
    /// 1-based attempt number.
    pub attempt: u32,
    pub timestamp: SystemTime,
    /// Classified category of the failure, `None` on success.
    pub category: Option<ErrorCategory>,
    /// Delay slept before the next attempt, `None` if this was the last one.
    pub delay: Option<Duration>,
    pub success: bool,
    pub response_time: Duration,
    pub error: Option<String>,
}

/// Outcome of [`RetryManager::execute_with_retry`].
#[derive(Debug)]
pub struct RetryResult<T> {
    pub outcome: Result<T, UpstreamError>,
    pub attempts: Vec<RetryAttempt>,
    pub elapsed: Duration,
}

impl<T> RetryResult<T> {
    pub fn success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn total_attempts(&self) -> u32 {
        self.attempts.len() as u32
    }

    /// Response time of the final attempt.
    pub fn last_response_time(&self) -> Option<Duration> {
        self.attempts.last().map(|a| a.response_time)
    }

    /// Category of the final failure.
    pub fn final_category(&self) -> Option<ErrorCategory> {
        self.attempts.last().and_then(|a| a.category)
    }

    /// Collapse into a plain result carrying the history on failure.
    pub fn into_result(self) -> Result<T, RetryFailure> {
        let category = self.final_category().unwrap_or(ErrorCategory::Unknown);
        match self.outcome {
            Ok(value) => Ok(value),
            Err(source) => Err(RetryFailure {
                category,
                attempts: self.attempts,
                elapsed: self.elapsed,
                source,
            }),
        }
    }
}

/// Terminal failure of a retried call.
#[derive(Debug, Clone, Error)]
#[error("{category} failure after {count} attempt(s) in {elapsed:?}: {source}", count = .attempts.len())]
pub struct RetryFailure {
    pub category: ErrorCategory,
    pub attempts: Vec<RetryAttempt>,
    pub elapsed: Duration,
    pub source: UpstreamError,
}

impl RetryFailure {
    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }
}

/// Lifetime counters of a retry manager.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetryStats {
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub attempts: u64,
}

#[derive(Debug, Default)]
struct RetryCounters {
    calls: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    attempts: AtomicU64,
}

/// Executes operations with bounded, classified retries.
#[derive(Debug)]
pub struct RetryManager {
    classifier: Arc<ErrorClassifier>,
    counters: RetryCounters,
    recent: Mutex<VecDeque<RetryAttempt>>,
    history_limit: usize,
}

impl RetryManager {
    pub fn new(classifier: Arc<ErrorClassifier>) -> Self {
        Self {
            classifier,
            counters: RetryCounters::default(),
            recent: Mutex::new(VecDeque::new()),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    pub fn classifier(&self) -> &Arc<ErrorClassifier> {
        &self.classifier
    }

    /// Delay slept after a failed `attempt` under `config`.
    pub fn calculate_delay(&self, config: &RetryConfig, attempt: u32) -> Duration {
        backoff::calculate_delay(config, attempt)
    }

    /// Run `operation` until it succeeds, fails with a non-retryable
    /// category, or `max_attempts` is reached.
    pub async fn execute_with_retry<T, F, Fut>(&self, config: &RetryConfig, mut operation: F) -> RetryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        let started = Instant::now();
        let max_attempts = config.max_attempts.max(1);
        let mut attempts = Vec::with_capacity(max_attempts as usize);
        let mut attempt = 0;

        self.counters.calls.fetch_add(1, Ordering::Relaxed);

        loop {
            attempt += 1;
            let timestamp = SystemTime::now();
            let attempt_start = Instant::now();

            let result = match config.attempt_timeout() {
                Some(limit) => match tokio::time::timeout(limit, operation()).await {
                    Ok(result) => result,
                    Err(_) => Err(UpstreamError::Timeout(limit)),
                },
                None => operation().await,
            };
            let response_time = attempt_start.elapsed();

            match result {
                Ok(value) => {
                    attempts.push(RetryAttempt {
                        attempt,
                        timestamp,
                        category: None,
                        delay: None,
                        success: true,
                        response_time,
                        error: None,
                    });
                    metrics::record_retry_attempt(None);
                    self.counters.successes.fetch_add(1, Ordering::Relaxed);
                    self.finish(&attempts);

                    if attempt > 1 {
                        tracing::debug!(attempts = attempt, "Operation succeeded after retry");
                    }
                    return RetryResult {
                        outcome: Ok(value),
                        attempts,
                        elapsed: started.elapsed(),
                    };
                }
                Err(error) => {
                    let category = self.classifier.categorize(&error);
                    let retryable = config.is_retryable(category);
                    let delay = (retryable && attempt < max_attempts)
                        .then(|| self.calculate_delay(config, attempt));

                    attempts.push(RetryAttempt {
                        attempt,
                        timestamp,
                        category: Some(category),
                        delay,
                        success: false,
                        response_time,
                        error: Some(error.to_string()),
                    });
                    metrics::record_retry_attempt(Some(category));

                    match delay {
                        Some(delay) => {
                            tracing::debug!(
                                attempt,
                                max_attempts,
                                category = %category,
                                delay = ?delay,
                                error = %error,
                                "Attempt failed, backing off"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            if retryable {
                                tracing::warn!(
                                    attempts = attempt,
                                    category = %category,
                                    error = %error,
                                    "Retries exhausted"
                                );
                            } else {
                                tracing::debug!(
                                    attempt,
                                    category = %category,
                                    error = %error,
                                    "Failure is not retryable"
                                );
                            }
                            self.counters.failures.fetch_add(1, Ordering::Relaxed);
                            self.finish(&attempts);
                            return RetryResult {
                                outcome: Err(error),
                                attempts,
                                elapsed: started.elapsed(),
                            };
                        }
                    }
                }
            }
        }
    }

    fn finish(&self, attempts: &[RetryAttempt]) {
        self.counters
            .attempts
            .fetch_add(attempts.len() as u64, Ordering::Relaxed);

        let mut recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
        for attempt in attempts {
            if recent.len() >= self.history_limit {
                recent.pop_front();
            }
            recent.push_back(attempt.clone());
        }
    }

    pub fn stats(&self) -> RetryStats {
        RetryStats {
            calls: self.counters.calls.load(Ordering::Relaxed),
            successes: self.counters.successes.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            attempts: self.counters.attempts.load(Ordering::Relaxed),
        }
    }

    /// The most recent `count` attempts, oldest first.
    pub fn recent_attempts(&self, count: usize) -> Vec<RetryAttempt> {
        let recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
        let skip = recent.len().saturating_sub(count);
        recent.iter().skip(skip).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::BackoffStrategy;
    use std::sync::atomic::AtomicU32;

    fn manager() -> RetryManager {
        RetryManager::new(Arc::new(ErrorClassifier::new()))
    }

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay_ms: 1,
            max_delay_ms: 5,
            strategy: BackoffStrategy::Exponential,
            jitter: false,
            attempt_timeout_ms: None,
            ..RetryConfig::default()
        }
    }

    #[tokio::test]
    async fn test_network_failures_exhaust_attempts() {
        let retry = manager();
        let calls = AtomicU32::new(0);

        let result: RetryResult<()> = retry
            .execute_with_retry(&fast_config(3), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(UpstreamError::Network("unreachable".into())) }
            })
            .await;

        assert!(!result.success());
        assert_eq!(result.total_attempts(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(result.attempts.iter().all(|a| a.category == Some(ErrorCategory::Network)));
        assert!(result.attempts[0].delay.is_some());
        assert!(result.attempts[2].delay.is_none());

        let failure = result.into_result().unwrap_err();
        assert_eq!(failure.category, ErrorCategory::Network);
        assert_eq!(failure.attempt_count(), 3);
        assert!(failure.to_string().contains("after 3 attempt(s)"));
    }

    #[tokio::test]
    async fn test_authentication_not_retried() {
        let retry = manager();
        let calls = AtomicU32::new(0);

        let result: RetryResult<()> = retry
            .execute_with_retry(&fast_config(10), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(UpstreamError::Authentication("bad token".into())) }
            })
            .await;

        assert_eq!(result.total_attempts(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.final_category(), Some(ErrorCategory::Authentication));
    }

    #[tokio::test]
    async fn test_success_after_transient_failures() {
        let retry = manager();
        let calls = AtomicU32::new(0);

        let result = retry
            .execute_with_retry(&fast_config(5), || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(UpstreamError::Server { status: 503, message: "busy".into() })
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert!(result.success());
        assert_eq!(result.total_attempts(), 3);
        assert!(result.attempts[2].success);
        assert_eq!(result.outcome.unwrap(), 2);

        let stats = retry.stats();
        assert_eq!(stats.calls, 1);
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.attempts, 3);
        assert_eq!(retry.recent_attempts(2).len(), 2);
    }

    #[tokio::test]
    async fn test_attempt_timeout_counts_as_failure() {
        let retry = manager();
        let config = RetryConfig {
            attempt_timeout_ms: Some(20),
            ..fast_config(2)
        };

        let result: RetryResult<()> = retry
            .execute_with_retry(&config, || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert!(!result.success());
        assert_eq!(result.total_attempts(), 2);
        assert_eq!(result.final_category(), Some(ErrorCategory::Timeout));
        assert!(matches!(result.outcome, Err(UpstreamError::Timeout(_))));
        assert!(result.elapsed < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_zero_attempts_still_runs_once() {
        let retry = manager();
        let result = retry
            .execute_with_retry(&fast_config(0), || async { Ok::<_, UpstreamError>(7) })
            .await;
        assert_eq!(result.total_attempts(), 1);
    }
}
