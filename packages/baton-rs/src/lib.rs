//! # Baton
//!
//! A versioned, idempotent workflow orchestrator: published definitions
//! describe a step DAG, executions run it with a per-error-class retry
//! matrix and bounded backoff, failed runs compensate in reverse
//! completion order, and terminal failures land in a dead letter queue
//! with reprocessing metadata.
//!
//! ## Architecture
//!
//! ```text
//! start(tenant, code, input, idempotency_key)
//!     │  unique (tenant, code, key): the loser returns the winner
//!     ▼
//! Execution(pending)
//!     │
//! advance(execution_id)            ◄── scheduler, repeatedly
//!     │ next ready step (deps succeeded, ready_at reached)
//!     ▼
//! StepRunner ── handler(ctx, input) with timeout + cancellation
//!     │
//!     ├─ succeeded ─► all steps done? ─► output_mapping ─► succeeded
//!     │
//!     └─ failed ─► classify ─► retry matrix
//!            │ retry: next attempt row, ready_at = now + backoff
//!            └ terminal: DLQ entry, then
//!                  compensation handlers? ─► compensating ─► compensated
//!                  NON_RETRYABLE, nothing to undo ─► failed
//!                  otherwise ─► dlq
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Idempotent starts** - one execution per `(tenant, code, key)`
//! 2. **Bounded attempts** - no attempt row ever exceeds the step's
//!    ceiling for the failing class
//! 3. **DAG order** - a step never starts before its dependencies
//!    succeeded
//! 4. **Reverse compensation** - undo runs in reverse completion order
//! 5. **One DLQ entry** - at most one entry per execution, written at the
//!    terminal step failure
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use baton::{
//!     handler_fn, Env, HandlerRegistry, InMemoryDefinitionStore,
//!     InMemoryDlqStore, InMemoryExecutionStore, Orchestrator,
//! };
//! use serde_json::json;
//!
//! let mut handlers = HandlerRegistry::new();
//! handlers.register("clients.create", handler_fn(|_ctx, input| async move {
//!     Ok(json!({"client_id": 42}))
//! }));
//!
//! let orchestrator = Orchestrator::new(
//!     Env::system(None),
//!     Arc::new(InMemoryDefinitionStore::new()),
//!     Arc::new(InMemoryExecutionStore::new()),
//!     Arc::new(InMemoryDlqStore::new()),
//!     Arc::new(handlers),
//! );
//!
//! orchestrator.publish("tenant-1", definition_json).await?;
//! let started = orchestrator
//!     .start("tenant-1", "accept_proposal", json!({"client_name": "Acme"}), "accept-7")
//!     .await?;
//! orchestrator.drain(started.execution.id).await?;
//! ```

mod classify;
mod definition;
mod dlq;
mod env;
mod error;
mod events;
mod execution;
mod handler;
mod orchestrator;
mod retry;
mod runner;
mod schema;
mod store;

// Scenario tests (test-only)
#[cfg(test)]
mod scenario_tests;

// Randomized property tests (test-only)
#[cfg(test)]
mod property_tests;

pub use classify::{classify, ClassifierRule, ErrorClass};
pub use definition::{
    DefinitionPolicies, DefinitionSpec, DefinitionStatus, StepDescriptor, WorkflowDefinition,
};
pub use dlq::{DlqEntry, DlqReason};
pub use env::{Clock, Env, FixedClock, SystemClock};
pub use error::{Error, StoreError};
pub use events::DomainEvent;
pub use execution::{AttemptStatus, Execution, ExecutionStatus, StepAttempt};
pub use handler::{
    cancel_channel, handler_fn, CancelHandle, CancelSignal, FnHandler, HandlerContext,
    HandlerFailure, HandlerRegistry, StepHandler,
};
pub use orchestrator::{Advanced, AdvanceOutcome, Orchestrator, Started};
pub use retry::{
    default_backoff, default_max_attempts, default_retries, delay_after, Backoff,
    DEFAULT_STEP_TIMEOUT_MS,
};
pub use schema::Schema;
pub use store::{
    DefinitionStore, DlqStore, ExecutionStore, InMemoryDefinitionStore, InMemoryDlqStore,
    InMemoryExecutionStore, InsertExecution,
};
