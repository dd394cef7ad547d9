//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (sizes, intervals, thresholds)
//! - Check retry policies are internally consistent
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServiceConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;

use crate::config::schema::{RetryConfig, ServiceConfig};

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: String,
    /// Human readable explanation.
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validate a full service configuration.
pub fn validate_config(config: &ServiceConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let pool = &config.pool;

    if pool.max_size == 0 {
        errors.push(ValidationError::new("pool.max_size", "must be greater than 0"));
    }
    if pool.min_size > pool.max_size {
        errors.push(ValidationError::new(
            "pool.min_size",
            format!("{} exceeds max_size {}", pool.min_size, pool.max_size),
        ));
    }
    if pool.max_active_per_connection == 0 {
        errors.push(ValidationError::new(
            "pool.max_active_per_connection",
            "must be greater than 0",
        ));
    }
    if pool.acquire_poll_interval_ms == 0 {
        errors.push(ValidationError::new(
            "pool.acquire_poll_interval_ms",
            "must be greater than 0",
        ));
    }
    if pool.cleanup_interval_ms == 0 {
        errors.push(ValidationError::new("pool.cleanup_interval_ms", "must be greater than 0"));
    }
    if pool.stats_interval_ms == 0 {
        errors.push(ValidationError::new("pool.stats_interval_ms", "must be greater than 0"));
    }
    if pool.health_check.enabled && pool.health_check.interval_ms == 0 {
        errors.push(ValidationError::new(
            "pool.health_check.interval_ms",
            "must be greater than 0 when health checks are enabled",
        ));
    }

    let thresholds = &pool.connection.thresholds;
    if !(0.0..=1.0).contains(&thresholds.min_success_rate) {
        errors.push(ValidationError::new(
            "pool.connection.thresholds.min_success_rate",
            "must be within [0, 1]",
        ));
    }
    if thresholds.max_consecutive_failures == 0 {
        errors.push(ValidationError::new(
            "pool.connection.thresholds.max_consecutive_failures",
            "must be greater than 0",
        ));
    }

    validate_retry("pool.connection.connect_retry", &pool.connection.connect_retry, &mut errors);
    validate_retry("pool.connection.execute_retry", &pool.connection.execute_retry, &mut errors);

    if config.exceptions.history_size == 0 {
        errors.push(ValidationError::new("exceptions.history_size", "must be greater than 0"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_retry(prefix: &str, retry: &RetryConfig, errors: &mut Vec<ValidationError>) {
    if retry.max_attempts == 0 {
        errors.push(ValidationError::new(
            format!("{prefix}.max_attempts"),
            "must be at least 1",
        ));
    }
    if retry.base_delay_ms > retry.max_delay_ms {
        errors.push(ValidationError::new(
            format!("{prefix}.base_delay_ms"),
            format!("{} exceeds max_delay_ms {}", retry.base_delay_ms, retry.max_delay_ms),
        ));
    }
    if !retry.backoff_multiplier.is_finite() || retry.backoff_multiplier < 1.0 {
        errors.push(ValidationError::new(
            format!("{prefix}.backoff_multiplier"),
            "must be a finite value >= 1.0",
        ));
    }
    if retry.attempt_timeout_ms == Some(0) {
        errors.push(ValidationError::new(
            format!("{prefix}.attempt_timeout_ms"),
            "must be greater than 0 when set",
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&ServiceConfig::default()).is_ok());
    }

    #[test]
    fn test_collects_all_errors() {
        let mut config = ServiceConfig::default();
        config.pool.min_size = 8;
        config.pool.max_size = 4;
        config.pool.connection.execute_retry.max_attempts = 0;
        config.pool.connection.connect_retry.backoff_multiplier = 0.5;

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().any(|e| e.field == "pool.min_size"));
        assert!(errors
            .iter()
            .any(|e| e.field == "pool.connection.execute_retry.max_attempts"));
        assert!(errors
            .iter()
            .any(|e| e.field == "pool.connection.connect_retry.backoff_multiplier"));
    }
}
