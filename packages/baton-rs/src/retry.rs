//! Retry policy: bounded exponential backoff with jitter.
//!
//! A step descriptor may pin `max_attempts`, `retry_on` and `backoff`;
//! when it is silent the per-class defaults below apply. Jitter is drawn
//! from the injected [`Env`] so tests with a seeded RNG see identical
//! delays.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::classify::ErrorClass;
use crate::env::Env;

/// Default per-step timeout when neither the step nor the definition's
/// policies set one.
pub const DEFAULT_STEP_TIMEOUT_MS: u64 = 30_000;

/// Exponential backoff parameters. Delays are clamped to `max_delay_ms`
/// before jitter is applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Backoff {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Fraction of the base delay added as uniform jitter, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_delay_ms: 200,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl Backoff {
    /// Slower curve for failures that punish eager retries.
    pub fn slow() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            ..Self::default()
        }
    }
}

/// Whether a class is retried when the step does not list `retry_on`.
pub fn default_retries(class: ErrorClass) -> bool {
    !matches!(
        class,
        ErrorClass::NonRetryable | ErrorClass::CompensationRequired
    )
}

/// Attempt ceiling when the step does not pin `max_attempts`.
pub fn default_max_attempts(class: ErrorClass) -> u32 {
    match class {
        ErrorClass::Transient | ErrorClass::Retryable => 3,
        ErrorClass::RateLimited | ErrorClass::DependencyFailed => 5,
        ErrorClass::NonRetryable | ErrorClass::CompensationRequired => 1,
    }
}

/// Backoff curve when the step does not pin one.
pub fn default_backoff(class: ErrorClass) -> Backoff {
    match class {
        ErrorClass::RateLimited | ErrorClass::DependencyFailed => Backoff::slow(),
        _ => Backoff::default(),
    }
}

/// Delay before the attempt after `attempt` (1-based) failed:
/// `min(initial * multiplier^(attempt-1), max) + uniform(0, jitter * base)`.
pub fn delay_after(attempt: u32, backoff: &Backoff, env: &Env) -> Duration {
    let exponent = attempt.saturating_sub(1) as i32;
    let base = (backoff.initial_delay_ms as f64 * backoff.multiplier.powi(exponent))
        .min(backoff.max_delay_ms as f64);
    let jitter = env.unit() * backoff.jitter.clamp(0.0, 1.0) * base;
    Duration::milliseconds((base + jitter).round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::SystemClock;
    use std::sync::Arc;

    fn env() -> Env {
        Env::new(Arc::new(SystemClock), Some(99))
    }

    #[test]
    fn test_delay_grows_exponentially_and_clamps() {
        let backoff = Backoff {
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            multiplier: 2.0,
            jitter: 0.0,
        };
        let env = env();
        assert_eq!(delay_after(1, &backoff, &env).num_milliseconds(), 100);
        assert_eq!(delay_after(2, &backoff, &env).num_milliseconds(), 200);
        assert_eq!(delay_after(3, &backoff, &env).num_milliseconds(), 400);
        // Clamped at max_delay_ms from the fifth attempt on.
        assert_eq!(delay_after(5, &backoff, &env).num_milliseconds(), 1_000);
        assert_eq!(delay_after(12, &backoff, &env).num_milliseconds(), 1_000);
    }

    #[test]
    fn test_jitter_bounded_by_fraction_of_base() {
        let backoff = Backoff {
            initial_delay_ms: 1_000,
            max_delay_ms: 10_000,
            multiplier: 2.0,
            jitter: 0.1,
        };
        let env = env();
        for attempt in 1..=4 {
            let base = (1_000f64 * 2f64.powi(attempt as i32 - 1)).min(10_000.0) as i64;
            let d = delay_after(attempt, &backoff, &env).num_milliseconds();
            assert!(d >= base, "delay below base: {d} < {base}");
            assert!(d <= base + base / 10, "jitter above 10%: {d} vs {base}");
        }
    }

    #[test]
    fn test_seeded_jitter_is_reproducible() {
        let backoff = Backoff::default();
        let a: Vec<i64> = {
            let env = env();
            (1..6)
                .map(|n| delay_after(n, &backoff, &env).num_milliseconds())
                .collect()
        };
        let b: Vec<i64> = {
            let env = env();
            (1..6)
                .map(|n| delay_after(n, &backoff, &env).num_milliseconds())
                .collect()
        };
        assert_eq!(a, b);
    }

    #[test]
    fn test_class_defaults() {
        assert_eq!(default_max_attempts(ErrorClass::Transient), 3);
        assert_eq!(default_max_attempts(ErrorClass::RateLimited), 5);
        assert_eq!(default_max_attempts(ErrorClass::NonRetryable), 1);
        assert!(!default_retries(ErrorClass::CompensationRequired));
        assert!(default_retries(ErrorClass::DependencyFailed));
        assert_eq!(
            default_backoff(ErrorClass::RateLimited).initial_delay_ms,
            1_000
        );
    }
}
