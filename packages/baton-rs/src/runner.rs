//! Step runner: one attempt of one step, with timeout and cancellation.
//!
//! The runner owns the attempt row lifecycle: it claims the row (the
//! uniqueness insert plus the pending-to-running transition are the
//! dispatch linearization points), invokes the handler outside any store
//! lock, enforces the timeout, and records the outcome. What happens next
//! (retry, compensation, DLQ) is the orchestrator's decision.

use std::time::Duration as StdDuration;

use chrono::Duration;
use serde_json::Value;
use tracing::{debug, warn};

use crate::classify::{classify, ErrorClass};
use crate::definition::{StepDescriptor, WorkflowDefinition};
use crate::env::Env;
use crate::error::Error;
use crate::execution::{AttemptStatus, Execution, StepAttempt};
use crate::handler::{cancel_channel, HandlerContext, HandlerRegistry};
use crate::store::ExecutionStore;

/// Outcome of one attempt, as recorded on its row.
#[derive(Debug, Clone)]
pub(crate) enum AttemptResult {
    Succeeded {
        output: Value,
    },
    Failed {
        class: ErrorClass,
        summary: String,
        timed_out: bool,
    },
    /// Another worker moved this attempt to running first.
    LostRace,
}

pub(crate) struct StepRunner<'a> {
    pub env: &'a Env,
    pub executions: &'a dyn ExecutionStore,
    pub handlers: &'a HandlerRegistry,
}

impl StepRunner<'_> {
    /// Run attempt `attempt_number` of `step`, recording the outcome on
    /// the attempt row.
    pub async fn run(
        &self,
        execution: &Execution,
        definition: &WorkflowDefinition,
        step: &StepDescriptor,
        attempt_number: u32,
        input: Value,
    ) -> Result<AttemptResult, Error> {
        let now = self.env.now();
        let timeout_ms = step.effective_timeout_ms(&definition.policies);
        let timeout_at = now + Duration::milliseconds(timeout_ms as i64);

        // First attempts insert their row here; retries were pre-inserted
        // as pending when they were scheduled. Either way the
        // pending-to-running transition below is the race arbiter.
        self.executions
            .insert_attempt(StepAttempt::scheduled(
                execution.id,
                &step.code,
                attempt_number,
                now,
            ))
            .await?;
        let won = self
            .executions
            .start_attempt(execution.id, &step.code, attempt_number, now, timeout_at)
            .await?;
        if !won {
            debug!(
                execution_id = %execution.id,
                step_code = %step.code,
                attempt = attempt_number,
                "lost dispatch race"
            );
            return Ok(AttemptResult::LostRace);
        }

        let result = match self.handlers.lookup(&step.handler) {
            None => AttemptResult::Failed {
                class: ErrorClass::NonRetryable,
                summary: format!("no handler registered for code {}", step.handler),
                timed_out: false,
            },
            Some(handler) => {
                let (cancel_handle, cancellation) = cancel_channel();
                let ctx = HandlerContext {
                    tenant_id: execution.tenant_id.clone(),
                    execution_id: execution.id,
                    step_code: step.code.clone(),
                    attempt: attempt_number,
                    deadline: timeout_at,
                    cancellation,
                };

                let run = handler.run(ctx, input);
                match tokio::time::timeout(StdDuration::from_millis(timeout_ms), run).await {
                    Ok(Ok(output)) => AttemptResult::Succeeded { output },
                    Ok(Err(failure)) => {
                        let class = failure
                            .class
                            .unwrap_or_else(|| classify(&failure.message, &step.classifier_overrides));
                        AttemptResult::Failed {
                            class,
                            summary: failure.message,
                            timed_out: false,
                        }
                    }
                    Err(_elapsed) => {
                        cancel_handle.cancel();
                        AttemptResult::Failed {
                            class: ErrorClass::Transient,
                            summary: format!("attempt timed out after {timeout_ms}ms"),
                            timed_out: true,
                        }
                    }
                }
            }
        };

        self.record(execution, step, attempt_number, timeout_at, &result)
            .await?;
        Ok(result)
    }

    async fn record(
        &self,
        execution: &Execution,
        step: &StepDescriptor,
        attempt_number: u32,
        timeout_at: chrono::DateTime<chrono::Utc>,
        result: &AttemptResult,
    ) -> Result<(), Error> {
        let attempts = self.executions.list_attempts(execution.id).await?;
        let Some(mut attempt) = attempts
            .into_iter()
            .find(|a| a.step_code == step.code && a.attempt_number == attempt_number)
        else {
            return Err(Error::Internal("attempt row vanished mid-run".into()));
        };

        attempt.completed_at = Some(self.env.now());
        attempt.timeout_at = Some(timeout_at);
        match result {
            AttemptResult::Succeeded { output } => {
                attempt.status = AttemptStatus::Succeeded;
                attempt.output = Some(output.clone());
            }
            AttemptResult::Failed { class, summary, .. } => {
                warn!(
                    execution_id = %execution.id,
                    step_code = %step.code,
                    attempt = attempt_number,
                    class = %class,
                    "step attempt failed: {summary}"
                );
                attempt.status = AttemptStatus::Failed;
                attempt.error_class = Some(*class);
                attempt.error_summary = Some(summary.clone());
            }
            AttemptResult::LostRace => return Ok(()),
        }
        self.executions.update_attempt(&attempt).await?;
        Ok(())
    }
}
