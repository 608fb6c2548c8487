//! Error classification.
//!
//! Every handler failure is mapped to one of six fixed classes; the class,
//! not the error itself, drives the retry matrix. Classes travel as
//! strings (`TRANSIENT`, `RATE_LIMITED`, ...) in stores and over the wire.
//!
//! Classification is a fixed, ordered match list over the lowercased
//! error summary. A step may prepend its own ordered marker list via
//! `classifier_overrides`, but cannot invent new classes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The six error classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorClass {
    /// Timeouts, connection errors, socket resets.
    Transient,
    /// HTTP 429 or an explicit rate-limit signal.
    RateLimited,
    /// Upstream 5xx, database unavailable.
    DependencyFailed,
    /// Generic domain-retryable (optimistic lock, conflict). The default
    /// when nothing else matches.
    Retryable,
    /// Validation errors, permission denied, 4xx other than 429.
    NonRetryable,
    /// Raised explicitly by a handler to report partial, externally
    /// visible side effects. Never inferred from a summary.
    CompensationRequired,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "TRANSIENT",
            ErrorClass::RateLimited => "RATE_LIMITED",
            ErrorClass::DependencyFailed => "DEPENDENCY_FAILED",
            ErrorClass::Retryable => "RETRYABLE",
            ErrorClass::NonRetryable => "NON_RETRYABLE",
            ErrorClass::CompensationRequired => "COMPENSATION_REQUIRED",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TRANSIENT" => Ok(ErrorClass::Transient),
            "RATE_LIMITED" => Ok(ErrorClass::RateLimited),
            "DEPENDENCY_FAILED" => Ok(ErrorClass::DependencyFailed),
            "RETRYABLE" => Ok(ErrorClass::Retryable),
            "NON_RETRYABLE" => Ok(ErrorClass::NonRetryable),
            "COMPENSATION_REQUIRED" => Ok(ErrorClass::CompensationRequired),
            other => Err(format!("unknown error class: {other}")),
        }
    }
}

/// One entry of an ordered marker list: summaries containing `marker`
/// (case-insensitive) classify as `class`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClassifierRule {
    pub marker: String,
    pub class: ErrorClass,
}

/// The default ordered match list. Order matters: a timeout mentioning a
/// connection is still a timeout.
const DEFAULT_RULES: &[(&[&str], ErrorClass)] = &[
    (&["timeout", "timed out", "deadline"], ErrorClass::Transient),
    (
        &["429", "rate limit", "rate-limit", "too many requests"],
        ErrorClass::RateLimited,
    ),
    (
        &[
            "permission",
            "forbidden",
            "unauthorized",
            "denied",
            "validation",
            "invalid",
            "bad request",
            "not found",
            "400",
            "401",
            "403",
            "404",
            "422",
        ],
        ErrorClass::NonRetryable,
    ),
    (
        &[
            "connection", "network", "reset", "refused", "broken pipe", "socket",
        ],
        ErrorClass::Transient,
    ),
    (
        &[
            "500",
            "502",
            "503",
            "504",
            "upstream",
            "unavailable",
            "database",
        ],
        ErrorClass::DependencyFailed,
    ),
];

/// Classify an error summary using the step's overrides (first) and the
/// default list, falling back to [`ErrorClass::Retryable`].
pub fn classify(summary: &str, overrides: &[ClassifierRule]) -> ErrorClass {
    let lowered = summary.to_lowercase();

    for rule in overrides {
        if lowered.contains(&rule.marker.to_lowercase()) {
            return rule.class;
        }
    }

    for (markers, class) in DEFAULT_RULES {
        if markers.iter().any(|m| lowered.contains(m)) {
            return *class;
        }
    }

    ErrorClass::Retryable
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_beats_connection() {
        assert_eq!(
            classify("connection timed out", &[]),
            ErrorClass::Transient
        );
    }

    #[test]
    fn test_rate_limit_markers() {
        assert_eq!(classify("HTTP 429 Too Many Requests", &[]), ErrorClass::RateLimited);
        assert_eq!(classify("rate limit exceeded", &[]), ErrorClass::RateLimited);
    }

    #[test]
    fn test_validation_is_non_retryable() {
        assert_eq!(
            classify("validation failed: missing field", &[]),
            ErrorClass::NonRetryable
        );
        assert_eq!(classify("permission denied", &[]), ErrorClass::NonRetryable);
        assert_eq!(classify("HTTP 404 Not Found", &[]), ErrorClass::NonRetryable);
    }

    #[test]
    fn test_connection_reset_is_transient() {
        assert_eq!(
            classify("connection reset by peer", &[]),
            ErrorClass::Transient
        );
    }

    #[test]
    fn test_upstream_5xx_is_dependency_failed() {
        assert_eq!(
            classify("upstream returned 503", &[]),
            ErrorClass::DependencyFailed
        );
        assert_eq!(
            classify("database unavailable", &[]),
            ErrorClass::DependencyFailed
        );
    }

    #[test]
    fn test_fallback_is_retryable() {
        assert_eq!(
            classify("optimistic lock conflict", &[]),
            ErrorClass::Retryable
        );
        assert_eq!(classify("something odd happened", &[]), ErrorClass::Retryable);
    }

    #[test]
    fn test_step_overrides_win() {
        let overrides = vec![ClassifierRule {
            marker: "ledger drift".into(),
            class: ErrorClass::NonRetryable,
        }];
        assert_eq!(
            classify("detected ledger drift", &overrides),
            ErrorClass::NonRetryable
        );
        // Non-matching summaries still use the default list.
        assert_eq!(
            classify("connection refused", &overrides),
            ErrorClass::Transient
        );
    }

    #[test]
    fn test_string_round_trip() {
        for class in [
            ErrorClass::Transient,
            ErrorClass::RateLimited,
            ErrorClass::DependencyFailed,
            ErrorClass::Retryable,
            ErrorClass::NonRetryable,
            ErrorClass::CompensationRequired,
        ] {
            assert_eq!(class.as_str().parse::<ErrorClass>().unwrap(), class);
        }
    }
}
