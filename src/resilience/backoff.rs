//! Backoff delay policies with optional jitter.

use std::time::Duration;

use rand::Rng;

use crate::config::schema::{BackoffStrategy, RetryConfig};

/// Fraction of the delay used as the jitter band (±10%).
const JITTER_RATIO: f64 = 0.1;

/// Unjittered delay after a failed `attempt` (1-based), clamped to `max_delay`.
pub fn base_delay(config: &RetryConfig, attempt: u32) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let base_ms = config.base_delay_ms as f64;
    let delay_ms = match config.strategy {
        BackoffStrategy::Fixed => base_ms,
        BackoffStrategy::Linear => base_ms * attempt as f64,
        BackoffStrategy::Exponential | BackoffStrategy::JitteredExponential => {
            let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
            base_ms * config.backoff_multiplier.powi(exponent)
        }
    };

    clamp_ms(delay_ms, config.max_delay_ms)
}

/// Delay to sleep after a failed `attempt` (1-based).
///
/// Jitter applies when the config enables it or the strategy is
/// `JitteredExponential`; the jittered value never exceeds `max_delay`.
pub fn calculate_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let delay = base_delay(config, attempt);
    if delay.is_zero() || !jitter_enabled(config) {
        return delay;
    }

    let factor = rand::thread_rng().gen_range((1.0 - JITTER_RATIO)..=(1.0 + JITTER_RATIO));
    clamp_ms(delay.as_secs_f64() * 1000.0 * factor, config.max_delay_ms)
}

fn jitter_enabled(config: &RetryConfig) -> bool {
    config.jitter || config.strategy == BackoffStrategy::JitteredExponential
}

fn clamp_ms(delay_ms: f64, max_ms: u64) -> Duration {
    let capped = if delay_ms.is_finite() {
        delay_ms.clamp(0.0, max_ms as f64)
    } else {
        max_ms as f64
    };
    Duration::from_secs_f64(capped / 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(strategy: BackoffStrategy, jitter: bool) -> RetryConfig {
        RetryConfig {
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            strategy,
            backoff_multiplier: 2.0,
            jitter,
            ..RetryConfig::default()
        }
    }

    #[test]
    fn test_exponential_sequence() {
        let cfg = config(BackoffStrategy::Exponential, false);
        let delays: Vec<u64> = (1..=6)
            .map(|a| calculate_delay(&cfg, a).as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32]);
        assert_eq!(calculate_delay(&cfg, 7), Duration::from_secs(60));
        assert_eq!(calculate_delay(&cfg, 40), Duration::from_secs(60));
    }

    #[test]
    fn test_fixed_and_linear() {
        let fixed = config(BackoffStrategy::Fixed, false);
        assert_eq!(calculate_delay(&fixed, 1), Duration::from_secs(1));
        assert_eq!(calculate_delay(&fixed, 5), Duration::from_secs(1));

        let linear = config(BackoffStrategy::Linear, false);
        assert_eq!(calculate_delay(&linear, 3), Duration::from_secs(3));
        assert_eq!(calculate_delay(&linear, 100), Duration::from_secs(60));
    }

    #[test]
    fn test_jittered_within_band() {
        let cfg = config(BackoffStrategy::JitteredExponential, false);
        for attempt in 1..=8 {
            let plain = base_delay(&cfg, attempt).as_secs_f64();
            for _ in 0..50 {
                let jittered = calculate_delay(&cfg, attempt).as_secs_f64();
                assert!(jittered >= plain * 0.9 - 1e-9, "{jittered} below band of {plain}");
                assert!(jittered <= plain * 1.1 + 1e-9, "{jittered} above band of {plain}");
                assert!(jittered <= 60.0 + 1e-9);
            }
        }
    }

    #[test]
    fn test_jitter_flag_applies_to_linear() {
        let cfg = config(BackoffStrategy::Linear, true);
        let plain = base_delay(&cfg, 2).as_secs_f64();
        let jittered = calculate_delay(&cfg, 2).as_secs_f64();
        assert!((plain * 0.9 - 1e-9..=plain * 1.1 + 1e-9).contains(&jittered));
    }

    #[test]
    fn test_attempt_zero() {
        let cfg = config(BackoffStrategy::Exponential, true);
        assert_eq!(calculate_delay(&cfg, 0), Duration::ZERO);
    }
}
