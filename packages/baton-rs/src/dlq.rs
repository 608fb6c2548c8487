//! Dead letter queue entries.
//!
//! An entry is written once per terminal step failure and annotated, never
//! duplicated, by later compensation failures. Review fields record the
//! human decision when an operator reprocesses the entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::classify::ErrorClass;

/// Why an execution landed in the DLQ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqReason {
    MaxAttemptsExceeded,
    NonRetryableError,
    CompensationRequired,
    Timeout,
    Unknown,
}

impl DlqReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DlqReason::MaxAttemptsExceeded => "max_attempts_exceeded",
            DlqReason::NonRetryableError => "non_retryable_error",
            DlqReason::CompensationRequired => "compensation_required",
            DlqReason::Timeout => "timeout",
            DlqReason::Unknown => "unknown",
        }
    }
}

impl std::str::FromStr for DlqReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "max_attempts_exceeded" => Ok(DlqReason::MaxAttemptsExceeded),
            "non_retryable_error" => Ok(DlqReason::NonRetryableError),
            "compensation_required" => Ok(DlqReason::CompensationRequired),
            "timeout" => Ok(DlqReason::Timeout),
            "unknown" => Ok(DlqReason::Unknown),
            other => Err(format!("unknown dlq reason: {other}")),
        }
    }
}

/// A terminally failed step awaiting review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub id: Uuid,
    pub tenant_id: String,
    pub execution_id: Uuid,
    pub step_code: String,
    pub reason: DlqReason,
    pub error_class: ErrorClass,
    pub error_summary: String,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub reprocessed_at: Option<DateTime<Utc>>,
    pub reprocessed_by: Option<String>,
    pub reprocess_outcome: Option<String>,
}
