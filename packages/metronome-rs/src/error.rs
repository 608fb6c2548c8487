//! Structured error types for the recurrence engine.
//!
//! `Error` is the only error type that crosses the crate's public boundary.
//! Store adapters report failures through [`StoreError`], which distinguishes
//! a uniqueness conflict from a backend outage; conflating the two breaks
//! the exactly-once guarantees the ledger provides.

use thiserror::Error;

// =============================================================================
// Store Error
// =============================================================================

/// Errors from the rule store and the generation ledger.
///
/// - [`StoreError::Conflict`] means a uniqueness constraint rejected the
///   write. Under concurrency this is expected; the caller reads the
///   surviving row and moves on.
/// - [`StoreError::Backend`] means storage failed (timeout, connection,
///   serialization). This is a system-level failure.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A uniqueness constraint rejected the write.
    #[error("uniqueness conflict: another writer won the row")]
    Conflict,

    /// Storage backend failed (timeout, connection, serialization).
    #[error("storage backend error: {0}")]
    Backend(#[source] anyhow::Error),
}

impl StoreError {
    /// Wrap a backend failure with a message.
    pub fn backend(message: impl Into<String>) -> Self {
        StoreError::Backend(anyhow::anyhow!(message.into()))
    }
}

impl From<anyhow::Error> for StoreError {
    fn from(err: anyhow::Error) -> Self {
        StoreError::Backend(err)
    }
}

// =============================================================================
// Engine Error
// =============================================================================

/// Errors surfaced by the recurrence engine's public operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The rule is malformed: missing or unknown timezone, zero interval,
    /// fiscal cadence without a fiscal year start month, or an unsupported
    /// anchor kind. Rejected at creation; such rules never reach the
    /// generator.
    #[error("bad rule: {0}")]
    BadRule(String),

    /// The requested rule or generation does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// The operation conflicts with live state, e.g. deleting a rule while
    /// a claimed period awaits fulfillment.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A store operation failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Invariant violation inside the engine. Never a caller mistake.
    #[error("internal error: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_conflict_is_pattern_matchable() {
        let err = StoreError::Conflict;
        assert!(matches!(err, StoreError::Conflict));
        assert!(err.to_string().contains("conflict"));
    }

    #[test]
    fn test_backend_error_preserves_source() {
        let err = StoreError::backend("connection refused");
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_bad_rule_display() {
        let err = Error::BadRule("interval must be at least 1".into());
        assert!(err.to_string().contains("bad rule"));
        assert!(err.to_string().contains("interval"));
    }

    #[test]
    fn test_store_error_converts() {
        let err: Error = StoreError::Conflict.into();
        assert!(matches!(err, Error::Store(StoreError::Conflict)));
    }
}
