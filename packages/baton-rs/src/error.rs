//! Structured error types for the orchestration engine.
//!
//! `Error` is the only error type that crosses the crate's public
//! boundary. Handler failures never surface as `Error` directly; they are
//! recorded per attempt with an error class and summary and drive the
//! retry matrix instead.

use thiserror::Error;

use crate::classify::ErrorClass;

// =============================================================================
// Store Error
// =============================================================================

/// Errors from the definition, execution and DLQ stores.
///
/// - [`StoreError::Conflict`] means a uniqueness constraint rejected the
///   write. Expected under concurrency; the caller reads the surviving row.
/// - [`StoreError::Backend`] means storage failed.
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

/// Errors surfaced by the orchestration engine's public operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A workflow definition failed validation: duplicate step codes,
    /// unknown dependencies, a dependency cycle, a malformed schema or
    /// retry policy.
    #[error("bad definition: {0}")]
    BadDefinition(String),

    /// An execution input failed schema validation.
    #[error("bad input: {0}")]
    BadInput(String),

    /// The requested definition, execution or DLQ entry does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// The operation conflicts with existing state: mutating a published
    /// definition, or deleting a definition with live executions.
    /// Idempotency replays are not reported here; `start` returns the
    /// surviving execution as a success.
    #[error("conflict: {0}")]
    Conflict(String),

    /// No handler is registered for a step's handler code.
    #[error("no handler registered for code {0}")]
    HandlerMissing(String),

    /// A handler failed; carried per attempt, surfaced on terminal
    /// failures.
    #[error("handler failed ({class}): {summary}")]
    HandlerFailed { class: ErrorClass, summary: String },

    /// A step attempt exceeded its timeout.
    #[error("step timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// A store operation failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Invariant violation inside the engine. Never a caller mistake.
    #[error("internal error: {0}")]
    Internal(String),
}
