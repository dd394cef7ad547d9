//! Central exception dispatch.
//!
//! # Responsibilities
//! - Classify a failure once and build an [`ExceptionRecord`]
//! - Keep a bounded rolling history plus lifetime per-category totals
//! - Log at a level derived from severity
//! - Optionally drive the [`RecoveryManager`] with bounded outer attempts
//!
//! # Data Flow
//! ```text
//! handle(error, context, auto_recover)
//!     → ErrorClassifier::classify
//!     → history.push(record)         (bounded, oldest dropped)
//!     → log by severity
//!     → RecoveryManager::execute × N (exponential pause between)
//!     → record.resolved / resolution_time updated in history
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use serde::Serialize;

use crate::config::schema::ExceptionConfig;
use crate::observability::metrics;
use crate::resilience::classifier::{type_label, Classification, ErrorCategory, ErrorClassifier, RecoveryStrategy, Severity};
use crate::resilience::recovery::{Reconnect, RecoveryContext, RecoveryError, RecoveryManager};

/// Caller-supplied context for one failure.
#[derive(Clone, Default)]
pub struct ExceptionContext {
    pub fields: BTreeMap<String, String>,
    /// Connection the failure happened on, used by `reset_connection`.
    pub target: Option<Arc<dyn Reconnect>>,
}

impl ExceptionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        self.fields.insert(key.into(), value.to_string());
        self
    }

    pub fn with_target(mut self, target: Arc<dyn Reconnect>) -> Self {
        self.target = Some(target);
        self
    }
}

impl fmt::Debug for ExceptionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExceptionContext")
            .field("fields", &self.fields)
            .field("target", &self.target.as_ref().map(|t| t.label()))
            .finish()
    }
}

/// One handled failure.
#[derive(Debug, Clone, Serialize)]
pub struct ExceptionRecord {
    pub id: u64,
    pub exception_type: String,
    pub message: String,
    pub category: ErrorCategory,
    pub severity: Severity,
    pub recovery_strategy: RecoveryStrategy,
    pub timestamp: SystemTime,
    pub context: BTreeMap<String, String>,
    pub recovery_attempts: u32,
    /// Action that resolved the failure.
    pub recovery_action: Option<String>,
    pub resolved: bool,
    pub resolution_time: Option<SystemTime>,
}

impl ExceptionRecord {
    pub fn classification(&self) -> Classification {
        Classification {
            category: self.category,
            severity: self.severity,
            strategy: self.recovery_strategy,
        }
    }
}

/// Windowed summary of handled failures.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExceptionStats {
    pub window_secs: u64,
    pub total_exceptions: usize,
    pub resolved: usize,
    pub resolution_rate: f64,
    pub category_breakdown: BTreeMap<ErrorCategory, usize>,
    pub severity_breakdown: BTreeMap<Severity, usize>,
    /// Resolved / attempted, per strategy, over records where recovery ran.
    pub recovery_success_rates: BTreeMap<RecoveryStrategy, f64>,
    /// Lifetime totals per category, unaffected by the window.
    pub lifetime_totals: BTreeMap<ErrorCategory, u64>,
}

pub struct ExceptionHandler {
    classifier: Arc<ErrorClassifier>,
    recovery: Arc<RecoveryManager>,
    config: ExceptionConfig,
    history: Mutex<VecDeque<ExceptionRecord>>,
    totals: DashMap<ErrorCategory, u64>,
    next_id: AtomicU64,
}

impl fmt::Debug for ExceptionHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExceptionHandler")
            .field("config", &self.config)
            .field("recorded", &self.next_id.load(Ordering::Relaxed))
            .finish()
    }
}

impl ExceptionHandler {
    pub fn new(classifier: Arc<ErrorClassifier>, recovery: Arc<RecoveryManager>, config: ExceptionConfig) -> Self {
        Self {
            classifier,
            recovery,
            config,
            history: Mutex::new(VecDeque::new()),
            totals: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn classifier(&self) -> &Arc<ErrorClassifier> {
        &self.classifier
    }

    pub fn recovery(&self) -> &Arc<RecoveryManager> {
        &self.recovery
    }

    /// Classify, record, log and optionally recover from `error`.
    pub async fn handle(
        &self,
        error: &(dyn Error + Send + Sync + 'static),
        context: ExceptionContext,
        auto_recover: bool,
    ) -> ExceptionRecord {
        let classification = self.classifier.classify(error);
        let mut record = ExceptionRecord {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            exception_type: type_label(error).to_string(),
            message: error.to_string(),
            category: classification.category,
            severity: classification.severity,
            recovery_strategy: classification.strategy,
            timestamp: SystemTime::now(),
            context: context.fields.clone(),
            recovery_attempts: 0,
            recovery_action: None,
            resolved: false,
            resolution_time: None,
        };

        self.push(record.clone());
        *self.totals.entry(record.category).or_insert(0) += 1;
        metrics::record_exception(record.category, record.severity);
        log_record(&record);

        if auto_recover && record.recovery_strategy != RecoveryStrategy::Escalate {
            let ctx = RecoveryContext {
                classification,
                message: record.message.clone(),
                target: context.target,
            };
            self.recover(&mut record, ctx).await;
            self.update(&record);
        }

        record
    }

    async fn recover(&self, record: &mut ExceptionRecord, ctx: RecoveryContext) {
        let max_attempts = self.config.recovery_attempts.max(1);

        for attempt in 1..=max_attempts {
            record.recovery_attempts = attempt;
            match self.recovery.execute(record.recovery_strategy, ctx.clone()).await {
                Ok(action) => {
                    record.resolved = true;
                    record.resolution_time = Some(SystemTime::now());
                    tracing::info!(
                        exception_id = record.id,
                        category = %record.category,
                        action = %action,
                        attempts = attempt,
                        "Exception resolved"
                    );
                    record.recovery_action = Some(action);
                    return;
                }
                Err(err @ (RecoveryError::Unrecoverable | RecoveryError::NoActions(_))) => {
                    tracing::warn!(exception_id = record.id, error = %err, "Recovery abandoned");
                    return;
                }
                Err(err) => {
                    tracing::debug!(exception_id = record.id, attempt, error = %err, "Recovery attempt failed");
                    if attempt < max_attempts {
                        tokio::time::sleep(self.outer_pause(attempt)).await;
                    }
                }
            }
        }

        tracing::warn!(
            exception_id = record.id,
            category = %record.category,
            attempts = max_attempts,
            "Exception unresolved after recovery attempts"
        );
    }

    fn outer_pause(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.config.recovery_base_delay().saturating_mul(factor)
    }

    fn push(&self, record: ExceptionRecord) {
        let limit = self.config.history_size.max(1);
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        while history.len() >= limit {
            history.pop_front();
        }
        history.push_back(record);
    }

    fn update(&self, record: &ExceptionRecord) {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        // Newest entries sit at the back; it may already have rotated out.
        if let Some(slot) = history.iter_mut().rev().find(|r| r.id == record.id) {
            *slot = record.clone();
        }
    }

    /// Summary of failures recorded within `window` of now.
    pub fn stats(&self, window: Duration) -> ExceptionStats {
        let cutoff = SystemTime::now().checked_sub(window);
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);

        let mut stats = ExceptionStats {
            window_secs: window.as_secs(),
            ..ExceptionStats::default()
        };
        let mut recovery: BTreeMap<RecoveryStrategy, (usize, usize)> = BTreeMap::new();

        for record in history.iter().filter(|r| cutoff.map_or(true, |c| r.timestamp >= c)) {
            stats.total_exceptions += 1;
            if record.resolved {
                stats.resolved += 1;
            }
            *stats.category_breakdown.entry(record.category).or_insert(0) += 1;
            *stats.severity_breakdown.entry(record.severity).or_insert(0) += 1;
            if record.recovery_attempts > 0 {
                let entry = recovery.entry(record.recovery_strategy).or_insert((0, 0));
                entry.0 += 1;
                if record.resolved {
                    entry.1 += 1;
                }
            }
        }
        drop(history);

        if stats.total_exceptions > 0 {
            stats.resolution_rate = stats.resolved as f64 / stats.total_exceptions as f64;
        }
        stats.recovery_success_rates = recovery
            .into_iter()
            .map(|(strategy, (attempted, resolved))| (strategy, resolved as f64 / attempted as f64))
            .collect();
        stats.lifetime_totals = self.totals.iter().map(|e| (*e.key(), *e.value())).collect();
        stats
    }

    /// The most recent `count` records, oldest first.
    pub fn recent(&self, count: usize) -> Vec<ExceptionRecord> {
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        let skip = history.len().saturating_sub(count);
        history.iter().skip(skip).cloned().collect()
    }

    /// Lifetime count for one category.
    pub fn total_for(&self, category: ErrorCategory) -> u64 {
        self.totals.get(&category).map(|v| *v).unwrap_or(0)
    }
}

fn log_record(record: &ExceptionRecord) {
    match record.severity {
        Severity::Low => tracing::info!(
            exception_id = record.id,
            category = %record.category,
            strategy = %record.recovery_strategy,
            error = %record.message,
            "Exception handled"
        ),
        Severity::Medium => tracing::warn!(
            exception_id = record.id,
            category = %record.category,
            strategy = %record.recovery_strategy,
            error = %record.message,
            "Exception handled"
        ),
        Severity::High => tracing::error!(
            exception_id = record.id,
            category = %record.category,
            strategy = %record.recovery_strategy,
            error = %record.message,
            "Exception handled"
        ),
        Severity::Critical => tracing::error!(
            exception_id = record.id,
            category = %record.category,
            strategy = %record.recovery_strategy,
            error = %record.message,
            critical = true,
            "Critical exception"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::UpstreamError;

    fn handler(history_size: usize) -> ExceptionHandler {
        let config = ExceptionConfig {
            history_size,
            recovery_base_delay_ms: 1,
            retry_pause_ms: 1,
            cool_down_ms: 1,
            ..ExceptionConfig::default()
        };
        ExceptionHandler::new(
            Arc::new(ErrorClassifier::new()),
            Arc::new(RecoveryManager::with_defaults(&config)),
            config,
        )
    }

    #[tokio::test]
    async fn test_retry_strategy_resolves() {
        let handler = handler(10);
        let err = UpstreamError::Network("unreachable".into());

        let record = handler
            .handle(&err, ExceptionContext::new().with_field("op", "query"), true)
            .await;

        assert_eq!(record.category, ErrorCategory::Network);
        assert_eq!(record.recovery_strategy, RecoveryStrategy::Retry);
        assert!(record.resolved);
        assert!(record.resolution_time.is_some());
        assert_eq!(record.recovery_attempts, 1);
        assert_eq!(record.recovery_action.as_deref(), Some("retry_with_pause"));
        assert_eq!(record.context.get("op").map(String::as_str), Some("query"));

        // History holds the updated copy.
        let recent = handler.recent(1);
        assert!(recent[0].resolved);
    }

    #[tokio::test]
    async fn test_escalate_never_recovers() {
        let handler = handler(10);
        let err = UpstreamError::Authentication("bad token".into());

        let record = handler.handle(&err, ExceptionContext::new(), true).await;
        assert_eq!(record.recovery_strategy, RecoveryStrategy::Escalate);
        assert_eq!(record.recovery_attempts, 0);
        assert!(!record.resolved);
    }

    #[tokio::test]
    async fn test_no_auto_recover() {
        let handler = handler(10);
        let record = handler
            .handle(&UpstreamError::Network("x".into()), ExceptionContext::new(), false)
            .await;
        assert_eq!(record.recovery_attempts, 0);
        assert!(!record.resolved);
    }

    #[tokio::test]
    async fn test_system_failure_marks_unrecoverable() {
        let handler = handler(10);
        let err = UpstreamError::other("worker panicked: out of memory");

        let record = handler.handle(&err, ExceptionContext::new(), true).await;
        assert_eq!(record.category, ErrorCategory::System);
        assert_eq!(record.severity, Severity::Critical);
        assert_eq!(record.recovery_attempts, 1);
        assert!(!record.resolved);
        assert!(handler.recovery().is_unrecoverable());
    }

    #[tokio::test]
    async fn test_history_is_bounded_and_stats_windowed() {
        let handler = handler(3);
        for _ in 0..5 {
            handler
                .handle(&UpstreamError::Data("bad".into()), ExceptionContext::new(), false)
                .await;
        }
        handler
            .handle(&UpstreamError::RateLimited("slow".into()), ExceptionContext::new(), true)
            .await;

        assert_eq!(handler.recent(100).len(), 3);
        assert_eq!(handler.total_for(ErrorCategory::Data), 5);

        let stats = handler.stats(Duration::from_secs(60));
        assert_eq!(stats.total_exceptions, 3);
        assert_eq!(stats.category_breakdown.get(&ErrorCategory::Data), Some(&2));
        assert_eq!(stats.category_breakdown.get(&ErrorCategory::RateLimit), Some(&1));
        assert_eq!(stats.recovery_success_rates.get(&RecoveryStrategy::Retry), Some(&1.0));
        assert_eq!(stats.lifetime_totals.get(&ErrorCategory::Data), Some(&5));
        assert!((stats.resolution_rate - 1.0 / 3.0).abs() < 1e-9);

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["category_breakdown"]["data"], 2);
    }
}
