//! Domain events returned by orchestrator operations.
//!
//! The engine owns no bus: `start` and `advance` return the events they
//! raised and the caller fans them out however it likes. Events are facts
//! about state transitions that already happened.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::classify::ErrorClass;
use crate::dlq::DlqReason;

/// A fact raised by `start` or `advance`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DomainEvent {
    ExecutionCreated {
        execution_id: Uuid,
    },
    /// A duplicate idempotency key collapsed onto an existing execution.
    ExecutionReplayed {
        execution_id: Uuid,
    },
    ExecutionStarted {
        execution_id: Uuid,
    },
    StepStarted {
        execution_id: Uuid,
        step_code: String,
        attempt: u32,
    },
    StepSucceeded {
        execution_id: Uuid,
        step_code: String,
        attempt: u32,
    },
    StepFailed {
        execution_id: Uuid,
        step_code: String,
        attempt: u32,
        class: ErrorClass,
        summary: String,
    },
    RetryScheduled {
        execution_id: Uuid,
        step_code: String,
        /// The attempt that will run at `ready_at`.
        attempt: u32,
        ready_at: DateTime<Utc>,
    },
    ExecutionSucceeded {
        execution_id: Uuid,
    },
    ExecutionFailed {
        execution_id: Uuid,
        class: ErrorClass,
    },
    CompensationStarted {
        execution_id: Uuid,
    },
    StepCompensated {
        execution_id: Uuid,
        step_code: String,
    },
    /// A succeeded step had no compensation handler.
    CompensationSkipped {
        execution_id: Uuid,
        step_code: String,
    },
    ExecutionCompensated {
        execution_id: Uuid,
    },
    RoutedToDlq {
        execution_id: Uuid,
        reason: DlqReason,
    },
    /// A cancel request stopped DAG traversal between steps.
    CancelObserved {
        execution_id: Uuid,
    },
}
