//! Execution and step attempt rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::classify::ErrorClass;

/// Lifecycle of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Compensating,
    Compensated,
    Dlq,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Succeeded => "succeeded",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Compensating => "compensating",
            ExecutionStatus::Compensated => "compensated",
            ExecutionStatus::Dlq => "dlq",
        }
    }

    /// Whether the execution can still make progress.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Succeeded
                | ExecutionStatus::Failed
                | ExecutionStatus::Compensated
                | ExecutionStatus::Dlq
        )
    }
}

/// One run of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub tenant_id: String,
    pub definition_id: Uuid,
    pub definition_code: String,
    pub definition_version: i32,
    /// Unique within `(tenant_id, definition_code)`.
    pub idempotency_key: String,
    pub status: ExecutionStatus,
    pub input: Value,
    pub output: Option<Value>,
    pub current_step: Option<String>,
    /// Terminal error, when any.
    pub error_class: Option<ErrorClass>,
    pub error_summary: Option<String>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub dlq_at: Option<DateTime<Utc>>,
}

/// Lifecycle of a step attempt. `Skipped` and `Compensated` only appear
/// during compensation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Compensated,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Pending => "pending",
            AttemptStatus::Running => "running",
            AttemptStatus::Succeeded => "succeeded",
            AttemptStatus::Failed => "failed",
            AttemptStatus::Skipped => "skipped",
            AttemptStatus::Compensated => "compensated",
        }
    }
}

/// One attempt at one step. Unique by
/// `(execution_id, step_code, attempt_number)`; retries are scheduled by
/// inserting the next attempt as `Pending` with a future `ready_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepAttempt {
    pub execution_id: Uuid,
    pub step_code: String,
    /// 1-based.
    pub attempt_number: u32,
    pub status: AttemptStatus,
    /// Earliest instant this attempt may start.
    pub ready_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub timeout_at: Option<DateTime<Utc>>,
    pub output: Option<Value>,
    pub error_class: Option<ErrorClass>,
    pub error_summary: Option<String>,
}

impl StepAttempt {
    /// A freshly scheduled attempt.
    pub fn scheduled(
        execution_id: Uuid,
        step_code: &str,
        attempt_number: u32,
        ready_at: DateTime<Utc>,
    ) -> Self {
        Self {
            execution_id,
            step_code: step_code.to_string(),
            attempt_number,
            status: AttemptStatus::Pending,
            ready_at,
            started_at: None,
            completed_at: None,
            timeout_at: None,
            output: None,
            error_class: None,
            error_summary: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(ExecutionStatus::Succeeded.is_terminal());
        assert!(ExecutionStatus::Dlq.is_terminal());
        assert!(ExecutionStatus::Compensated.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(!ExecutionStatus::Compensating.is_terminal());
        assert!(!ExecutionStatus::Pending.is_terminal());
    }

    #[test]
    fn test_status_strings_are_stable() {
        assert_eq!(ExecutionStatus::Compensating.as_str(), "compensating");
        assert_eq!(AttemptStatus::Skipped.as_str(), "skipped");
    }
}
