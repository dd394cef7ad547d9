//! Failure classification.
//!
//! Maps any failure to a `(category, severity, recovery strategy)` triple.
//! Classification runs once per failure and the resulting [`ErrorCategory`]
//! is threaded through retry, metrics and exception handling.
//!
//! # Rules
//! 1. Typed failures (`UpstreamError`, `RetryFailure`, `ConnectionError`,
//!    `PoolError`, `std::io::Error`, tokio `Elapsed`) anywhere in the source
//!    chain declare their category directly.
//! 2. Otherwise ordered keyword rules run over the lower-cased
//!    `"<type>: <message>"` text. First match wins.
//! 3. Anything left is `Unknown`.

use std::collections::{BTreeSet, HashMap};
use std::error::Error;
use std::fmt;
use std::io::ErrorKind;

use serde::{Deserialize, Serialize};

use crate::pool::{ConnectionError, PoolError};
use crate::resilience::retry::RetryFailure;
use crate::upstream::UpstreamError;

/// Closed failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    Timeout,
    Connection,
    Data,
    RateLimit,
    Server,
    Authentication,
    Resource,
    Security,
    /// Process-level fatal conditions (out of memory, panics).
    System,
    Unknown,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 11] = [
        ErrorCategory::Network,
        ErrorCategory::Timeout,
        ErrorCategory::Connection,
        ErrorCategory::Data,
        ErrorCategory::RateLimit,
        ErrorCategory::Server,
        ErrorCategory::Authentication,
        ErrorCategory::Resource,
        ErrorCategory::Security,
        ErrorCategory::System,
        ErrorCategory::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "network",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Connection => "connection",
            ErrorCategory::Data => "data",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Server => "server",
            ErrorCategory::Authentication => "authentication",
            ErrorCategory::Resource => "resource",
            ErrorCategory::Security => "security",
            ErrorCategory::System => "system",
            ErrorCategory::Unknown => "unknown",
        }
    }

    /// Transient categories that retry locally by default.
    pub fn default_retryable() -> BTreeSet<ErrorCategory> {
        [
            ErrorCategory::Network,
            ErrorCategory::Timeout,
            ErrorCategory::Connection,
            ErrorCategory::RateLimit,
            ErrorCategory::Server,
        ]
        .into_iter()
        .collect()
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How bad a failure is; drives the log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do about a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    Ignore,
    Retry,
    Restart,
    Escalate,
    CircuitBreak,
}

impl RecoveryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryStrategy::Ignore => "ignore",
            RecoveryStrategy::Retry => "retry",
            RecoveryStrategy::Restart => "restart",
            RecoveryStrategy::Escalate => "escalate",
            RecoveryStrategy::CircuitBreak => "circuit_break",
        }
    }
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of classifying one failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub category: ErrorCategory,
    pub severity: Severity,
    pub strategy: RecoveryStrategy,
}

/// Built-in `(severity, strategy)` for a category.
pub fn default_policy(category: ErrorCategory) -> (Severity, RecoveryStrategy) {
    match category {
        ErrorCategory::Network | ErrorCategory::Timeout | ErrorCategory::Server => {
            (Severity::Medium, RecoveryStrategy::Retry)
        }
        ErrorCategory::Connection => (Severity::High, RecoveryStrategy::Retry),
        ErrorCategory::RateLimit => (Severity::Low, RecoveryStrategy::Retry),
        ErrorCategory::Data => (Severity::Medium, RecoveryStrategy::Escalate),
        ErrorCategory::Resource | ErrorCategory::Authentication => {
            (Severity::High, RecoveryStrategy::Escalate)
        }
        ErrorCategory::Security => (Severity::Critical, RecoveryStrategy::Escalate),
        ErrorCategory::System => (Severity::Critical, RecoveryStrategy::Restart),
        ErrorCategory::Unknown => (Severity::Medium, RecoveryStrategy::Escalate),
    }
}

/// Keyword rule over failure text.
#[derive(Debug, Clone)]
pub struct ClassificationRule {
    pub category: ErrorCategory,
    keywords: Vec<String>,
}

impl ClassificationRule {
    pub fn new(category: ErrorCategory, keywords: &[&str]) -> Self {
        Self {
            category,
            keywords: keywords.iter().map(|k| k.to_lowercase()).collect(),
        }
    }

    fn matches(&self, text: &str) -> bool {
        self.keywords.iter().any(|k| text.contains(k.as_str()))
    }
}

fn default_rules() -> Vec<ClassificationRule> {
    vec![
        ClassificationRule::new(
            ErrorCategory::Timeout,
            &["timed out", "timeout", "deadline exceeded", "elapsed"],
        ),
        ClassificationRule::new(
            ErrorCategory::Connection,
            &[
                "connection reset",
                "connection closed",
                "connection aborted",
                "connection lost",
                "broken pipe",
                "not connected",
            ],
        ),
        ClassificationRule::new(
            ErrorCategory::Network,
            &["network", "dns", "unreachable", "host not found", "socket", "connection refused", "connection-refused"],
        ),
        ClassificationRule::new(
            ErrorCategory::RateLimit,
            &["rate limit", "rate-limit", "ratelimit", "too many requests", "quota", "429", "throttl"],
        ),
        ClassificationRule::new(
            ErrorCategory::Server,
            &[
                "internal server error",
                "bad gateway",
                "unavailable",
                "server error",
                "500",
                "502",
                "503",
                "504",
            ],
        ),
        ClassificationRule::new(
            ErrorCategory::Authentication,
            &[
                "unauthorized",
                "unauthenticated",
                "authentication",
                "auth failed",
                "invalid credentials",
                "forbidden",
                "permission denied",
                "401",
                "403",
            ],
        ),
        ClassificationRule::new(
            ErrorCategory::Security,
            &["security", "certificate", "tls", "ssl", "signature"],
        ),
        ClassificationRule::new(
            ErrorCategory::Data,
            &["parse", "decode", "deserializ", "malformed", "invalid json", "invalid data"],
        ),
        ClassificationRule::new(
            ErrorCategory::System,
            &["out of memory", "oom-kill", "fatal", "panicked"],
        ),
        ClassificationRule::new(
            ErrorCategory::Resource,
            &["resource", "exhausted", "too many open files", "capacity", "memory"],
        ),
    ]
}

/// Rule-based classifier with per-category policy overrides.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    rules: Vec<ClassificationRule>,
    overrides: HashMap<ErrorCategory, (Severity, RecoveryStrategy)>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self {
            rules: default_rules(),
            overrides: HashMap::new(),
        }
    }
}

impl ErrorClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule evaluated before the built-in ones.
    pub fn with_rule(mut self, rule: ClassificationRule) -> Self {
        self.rules.insert(0, rule);
        self
    }

    /// Replace the default severity/strategy of a category.
    pub fn with_override(
        mut self,
        category: ErrorCategory,
        severity: Severity,
        strategy: RecoveryStrategy,
    ) -> Self {
        self.overrides.insert(category, (severity, strategy));
        self
    }

    /// Full classification of a failure.
    pub fn classify(&self, error: &(dyn Error + 'static)) -> Classification {
        let category = self.categorize(error);
        let (severity, strategy) = self.policy(category);
        Classification {
            category,
            severity,
            strategy,
        }
    }

    /// Category only.
    pub fn categorize(&self, error: &(dyn Error + 'static)) -> ErrorCategory {
        if let Some(category) = typed_category(error) {
            return category;
        }
        self.categorize_text(type_label(error), &error.to_string())
    }

    /// Apply the keyword rules to a type label and message.
    pub fn categorize_text(&self, type_name: &str, message: &str) -> ErrorCategory {
        let text = format!("{type_name}: {message}").to_lowercase();
        self.rules
            .iter()
            .find(|rule| rule.matches(&text))
            .map(|rule| rule.category)
            .unwrap_or(ErrorCategory::Unknown)
    }

    /// Severity and strategy for a category, honoring overrides.
    pub fn policy(&self, category: ErrorCategory) -> (Severity, RecoveryStrategy) {
        self.overrides
            .get(&category)
            .copied()
            .unwrap_or_else(|| default_policy(category))
    }
}

/// Category declared by a known error type anywhere in the source chain.
fn typed_category(error: &(dyn Error + 'static)) -> Option<ErrorCategory> {
    let mut current = Some(error);
    while let Some(err) = current {
        if let Some(e) = err.downcast_ref::<RetryFailure>() {
            return Some(e.category);
        }
        if let Some(e) = err.downcast_ref::<UpstreamError>() {
            if let Some(category) = e.category() {
                return Some(category);
            }
        }
        if let Some(e) = err.downcast_ref::<ConnectionError>() {
            if let Some(category) = e.category() {
                return Some(category);
            }
        }
        if let Some(e) = err.downcast_ref::<PoolError>() {
            if let Some(category) = e.category() {
                return Some(category);
            }
        }
        if let Some(e) = err.downcast_ref::<std::io::Error>() {
            if let Some(category) = io_category(e.kind()) {
                return Some(category);
            }
        }
        if err.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
            return Some(ErrorCategory::Timeout);
        }
        current = err.source();
    }
    None
}

fn io_category(kind: ErrorKind) -> Option<ErrorCategory> {
    match kind {
        ErrorKind::TimedOut | ErrorKind::WouldBlock => Some(ErrorCategory::Timeout),
        ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected
        | ErrorKind::BrokenPipe => Some(ErrorCategory::Connection),
        ErrorKind::ConnectionRefused | ErrorKind::AddrInUse | ErrorKind::AddrNotAvailable => {
            Some(ErrorCategory::Network)
        }
        ErrorKind::PermissionDenied => Some(ErrorCategory::Authentication),
        ErrorKind::InvalidData | ErrorKind::UnexpectedEof => Some(ErrorCategory::Data),
        ErrorKind::OutOfMemory => Some(ErrorCategory::System),
        _ => None,
    }
}

/// Short type label for text rules and exception records.
pub fn type_label(error: &(dyn Error + 'static)) -> &'static str {
    if error.is::<UpstreamError>() {
        "UpstreamError"
    } else if error.is::<RetryFailure>() {
        "RetryFailure"
    } else if error.is::<ConnectionError>() {
        "ConnectionError"
    } else if error.is::<PoolError>() {
        "PoolError"
    } else if error.is::<std::io::Error>() {
        "IoError"
    } else if error.is::<tokio::time::error::Elapsed>() {
        "Elapsed"
    } else {
        "Error"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Debug)]
    struct TextError(&'static str);

    impl fmt::Display for TextError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.0)
        }
    }

    impl Error for TextError {}

    fn categorize(msg: &'static str) -> ErrorCategory {
        ErrorClassifier::new().categorize(&TextError(msg))
    }

    #[test]
    fn test_keyword_rules() {
        assert_eq!(categorize("request timed out"), ErrorCategory::Timeout);
        assert_eq!(categorize("Connection refused by peer"), ErrorCategory::Network);
        assert_eq!(categorize("connection reset by peer"), ErrorCategory::Connection);
        assert_eq!(categorize("network is unreachable"), ErrorCategory::Network);
        assert_eq!(categorize("HTTP 429 Too Many Requests"), ErrorCategory::RateLimit);
        assert_eq!(categorize("daily quota used up"), ErrorCategory::RateLimit);
        assert_eq!(categorize("503 Service Unavailable"), ErrorCategory::Server);
        assert_eq!(categorize("403 Forbidden"), ErrorCategory::Authentication);
        assert_eq!(categorize("certificate verify failed"), ErrorCategory::Security);
        assert_eq!(categorize("failed to decode payload"), ErrorCategory::Data);
        assert_eq!(categorize("process ran out of memory"), ErrorCategory::System);
        assert_eq!(categorize("file descriptors exhausted"), ErrorCategory::Resource);
        assert_eq!(categorize("something odd"), ErrorCategory::Unknown);
    }

    #[test]
    fn test_first_match_wins() {
        // Both timeout and server keywords; timeout rule comes first.
        assert_eq!(categorize("gateway timeout (504)"), ErrorCategory::Timeout);
    }

    #[test]
    fn test_typed_errors_skip_text() {
        let classifier = ErrorClassifier::new();
        // Text mentions "timeout" but the variant declares authentication.
        let err = UpstreamError::Authentication("token timeout".into());
        assert_eq!(classifier.categorize(&err), ErrorCategory::Authentication);

        let io = std::io::Error::new(ErrorKind::ConnectionReset, "boom");
        assert_eq!(classifier.categorize(&io), ErrorCategory::Connection);

        let io = std::io::Error::new(ErrorKind::ConnectionRefused, "boom");
        assert_eq!(classifier.categorize(&io), ErrorCategory::Network);

        let err = UpstreamError::Timeout(Duration::from_millis(5));
        let c = classifier.classify(&err);
        assert_eq!(c.category, ErrorCategory::Timeout);
        assert_eq!(c.strategy, RecoveryStrategy::Retry);
    }

    #[test]
    fn test_untyped_upstream_error_uses_text() {
        let classifier = ErrorClassifier::new();
        let err = UpstreamError::other("upstream said: invalid credentials");
        assert_eq!(classifier.categorize(&err), ErrorCategory::Authentication);
    }

    #[test]
    fn test_default_policies() {
        for category in ErrorCategory::default_retryable() {
            assert_eq!(default_policy(category).1, RecoveryStrategy::Retry);
        }
        assert_eq!(default_policy(ErrorCategory::Authentication).1, RecoveryStrategy::Escalate);
        assert_eq!(default_policy(ErrorCategory::Security).1, RecoveryStrategy::Escalate);
        assert_eq!(default_policy(ErrorCategory::Data).1, RecoveryStrategy::Escalate);
        assert_eq!(default_policy(ErrorCategory::Resource).1, RecoveryStrategy::Escalate);
        assert_eq!(default_policy(ErrorCategory::System), (Severity::Critical, RecoveryStrategy::Restart));
    }

    #[test]
    fn test_custom_rule_and_override() {
        let classifier = ErrorClassifier::new()
            .with_rule(ClassificationRule::new(ErrorCategory::RateLimit, &["slow down"]))
            .with_override(ErrorCategory::RateLimit, Severity::Medium, RecoveryStrategy::CircuitBreak);

        let c = classifier.classify(&TextError("please slow down, timeout imminent"));
        assert_eq!(c.category, ErrorCategory::RateLimit);
        assert_eq!(c.severity, Severity::Medium);
        assert_eq!(c.strategy, RecoveryStrategy::CircuitBreak);
    }
}
