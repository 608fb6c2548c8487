//! The orchestrator: definition publishing, idempotent starts, DAG
//! traversal, compensation and DLQ routing.
//!
//! `advance` is the engine's driver. Each call makes at most one step
//! dispatch decision under the store's uniqueness primitives, runs the
//! handler outside any lock, and folds the outcome back into execution
//! state. Schedulers call it whenever an execution might be able to move:
//! the returned [`AdvanceOutcome`] says when to come back.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::classify::ErrorClass;
use crate::definition::{DefinitionSpec, DefinitionStatus, StepDescriptor, WorkflowDefinition};
use crate::dlq::{DlqEntry, DlqReason};
use crate::env::Env;
use crate::error::{Error, StoreError};
use crate::events::DomainEvent;
use crate::execution::{AttemptStatus, Execution, ExecutionStatus, StepAttempt};
use crate::handler::{cancel_channel, HandlerContext, HandlerRegistry};
use crate::retry::delay_after;
use crate::runner::{AttemptResult, StepRunner};
use crate::store::{DefinitionStore, DlqStore, ExecutionStore, InsertExecution};

/// Result of `start`.
#[derive(Debug, Clone)]
pub struct Started {
    pub execution: Execution,
    /// True when the idempotency key collapsed onto an existing row; the
    /// execution is the original, unchanged.
    pub replayed: bool,
    pub events: Vec<DomainEvent>,
}

/// What an `advance` call did, and when to call again.
#[derive(Debug, Clone, PartialEq)]
pub enum AdvanceOutcome {
    /// A step settled; call `advance` again now.
    Progressed,
    /// Nothing is ready before this instant.
    WaitUntil(DateTime<Utc>),
    /// Another worker is mid-dispatch on this execution.
    Busy,
    /// Lost a dispatch race; call `advance` again.
    Raced,
    /// A cancel request stopped traversal.
    CancelStopped,
    /// The execution reached a terminal status.
    Completed(ExecutionStatus),
}

/// Outcome plus the domain events the call raised, for the caller to fan
/// out.
#[derive(Debug, Clone)]
pub struct Advanced {
    pub outcome: AdvanceOutcome,
    pub events: Vec<DomainEvent>,
}

/// The orchestration engine's service facade.
pub struct Orchestrator {
    env: Env,
    definitions: Arc<dyn DefinitionStore>,
    executions: Arc<dyn ExecutionStore>,
    dlq: Arc<dyn DlqStore>,
    handlers: Arc<HandlerRegistry>,
}

impl Orchestrator {
    pub fn new(
        env: Env,
        definitions: Arc<dyn DefinitionStore>,
        executions: Arc<dyn ExecutionStore>,
        dlq: Arc<dyn DlqStore>,
        handlers: Arc<HandlerRegistry>,
    ) -> Self {
        Self {
            env,
            definitions,
            executions,
            dlq,
            handlers,
        }
    }

    // =========================================================================
    // Definitions
    // =========================================================================

    /// Validate and publish a definition spec as the next version of its
    /// code. Previously published versions are deprecated in the same
    /// operation.
    pub async fn publish(
        &self,
        tenant_id: &str,
        spec: Value,
    ) -> Result<WorkflowDefinition, Error> {
        let spec: DefinitionSpec = serde_json::from_value(spec)
            .map_err(|e| Error::BadDefinition(e.to_string()))?;
        let now = self.env.now();
        let version = self.definitions.next_version(tenant_id, &spec.code).await?;
        let mut definition = WorkflowDefinition::from_spec(tenant_id, spec, version, now)?;
        definition.status = DefinitionStatus::Published;
        definition.published_at = Some(now);

        self.definitions
            .deprecate_published(tenant_id, &definition.code)
            .await?;
        match self.definitions.insert(definition.clone()).await {
            Ok(()) => {}
            Err(StoreError::Conflict) => {
                return Err(Error::Conflict(format!(
                    "version {} of {} already exists",
                    definition.version, definition.code
                )));
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            tenant_id = %tenant_id,
            code = %definition.code,
            version = definition.version,
            "published workflow definition"
        );
        Ok(definition)
    }

    /// Delete a definition. Refused while any non-terminal execution
    /// references it.
    pub async fn delete_definition(
        &self,
        tenant_id: &str,
        definition_id: Uuid,
    ) -> Result<(), Error> {
        let definition = self
            .definitions
            .get(tenant_id, definition_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("definition {definition_id}")))?;
        if self
            .executions
            .has_live_for_definition(definition.id)
            .await?
        {
            return Err(Error::Conflict(
                "executions are in flight; retry after they settle".into(),
            ));
        }
        self.definitions.delete(tenant_id, definition_id).await?;
        Ok(())
    }

    // =========================================================================
    // Start
    // =========================================================================

    /// Start an execution of the latest published definition for `code`.
    ///
    /// A duplicate `(tenant, code, idempotency_key)` returns the original
    /// execution unchanged with `replayed = true`.
    pub async fn start(
        &self,
        tenant_id: &str,
        definition_code: &str,
        input: Value,
        idempotency_key: &str,
    ) -> Result<Started, Error> {
        let definition = self
            .definitions
            .latest_published(tenant_id, definition_code)
            .await?
            .ok_or_else(|| {
                Error::NotFound(format!("published definition {definition_code}"))
            })?;

        if let Some(schema) = &definition.input_schema {
            schema
                .validate(&input)
                .map_err(|errors| Error::BadInput(errors.join("; ")))?;
        }

        let now = self.env.now();
        let execution = Execution {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            definition_id: definition.id,
            definition_code: definition.code.clone(),
            definition_version: definition.version,
            idempotency_key: idempotency_key.to_string(),
            status: ExecutionStatus::Pending,
            input,
            output: None,
            current_step: None,
            error_class: None,
            error_summary: None,
            cancel_requested: false,
            created_at: now,
            started_at: None,
            completed_at: None,
            dlq_at: None,
        };

        match self.executions.insert(execution).await? {
            InsertExecution::Inserted(execution) => {
                info!(
                    tenant_id = %tenant_id,
                    code = %definition_code,
                    execution_id = %execution.id,
                    "execution created"
                );
                let events = vec![DomainEvent::ExecutionCreated {
                    execution_id: execution.id,
                }];
                Ok(Started {
                    execution,
                    replayed: false,
                    events,
                })
            }
            InsertExecution::Replayed(execution) => {
                let events = vec![DomainEvent::ExecutionReplayed {
                    execution_id: execution.id,
                }];
                Ok(Started {
                    execution,
                    replayed: true,
                    events,
                })
            }
        }
    }

    /// Request cancellation. Any in-flight attempt settles normally; the
    /// next `advance` observes the flag and stops traversal.
    pub async fn cancel(&self, execution_id: Uuid) -> Result<(), Error> {
        let mut execution = self
            .executions
            .get(execution_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("execution {execution_id}")))?;
        if execution.status.is_terminal() {
            return Ok(());
        }
        execution.cancel_requested = true;
        self.executions.update(&execution).await?;
        Ok(())
    }

    // =========================================================================
    // Advance
    // =========================================================================

    /// Make one step dispatch decision for the execution.
    pub async fn advance(&self, execution_id: Uuid) -> Result<Advanced, Error> {
        let mut events = Vec::new();
        let mut execution = self
            .executions
            .get(execution_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("execution {execution_id}")))?;

        if execution.status.is_terminal() {
            return Ok(Advanced {
                outcome: AdvanceOutcome::Completed(execution.status),
                events,
            });
        }

        let definition = self
            .definitions
            .get(&execution.tenant_id, execution.definition_id)
            .await?
            .ok_or_else(|| {
                Error::Internal(format!(
                    "definition {} missing for execution {execution_id}",
                    execution.definition_id
                ))
            })?;

        if execution.status == ExecutionStatus::Compensating {
            return self
                .continue_compensation(&mut execution, &definition, events)
                .await;
        }

        if execution.cancel_requested {
            events.push(DomainEvent::CancelObserved { execution_id });
            return Ok(Advanced {
                outcome: AdvanceOutcome::CancelStopped,
                events,
            });
        }

        let now = self.env.now();
        let attempts = self.executions.list_attempts(execution_id).await?;

        // A running attempt whose timeout has passed belongs to a worker
        // that died mid-dispatch: fail it and route it like any other
        // failure.
        for attempt in &attempts {
            if attempt.status == AttemptStatus::Running
                && attempt.timeout_at.is_some_and(|t| t <= now)
            {
                let summary = "attempt lease expired".to_string();
                let mut failed = attempt.clone();
                failed.status = AttemptStatus::Failed;
                failed.completed_at = Some(now);
                failed.error_class = Some(ErrorClass::Transient);
                failed.error_summary = Some(summary.clone());
                self.executions.update_attempt(&failed).await?;

                let step = definition
                    .step(&attempt.step_code)
                    .ok_or_else(|| Error::Internal("attempt for unknown step".into()))?;
                events.push(DomainEvent::StepFailed {
                    execution_id,
                    step_code: step.code.clone(),
                    attempt: attempt.attempt_number,
                    class: ErrorClass::Transient,
                    summary: summary.clone(),
                });
                return self
                    .after_failure(
                        &mut execution,
                        &definition,
                        step,
                        attempt.attempt_number,
                        ErrorClass::Transient,
                        summary,
                        true,
                        events,
                    )
                    .await;
            }
        }

        if attempts.iter().any(|a| a.status == AttemptStatus::Running) {
            return Ok(Advanced {
                outcome: AdvanceOutcome::Busy,
                events,
            });
        }

        let succeeded: HashMap<&str, &StepAttempt> = attempts
            .iter()
            .filter(|a| a.status == AttemptStatus::Succeeded)
            .map(|a| (a.step_code.as_str(), a))
            .collect();

        if definition
            .steps
            .iter()
            .all(|s| succeeded.contains_key(s.code.as_str()))
        {
            return self
                .finalize_success(&mut execution, &definition, &attempts, events)
                .await;
        }

        // Find the first dispatchable step in definition order.
        let mut wait_until: Option<DateTime<Utc>> = None;
        for step in &definition.steps {
            if succeeded.contains_key(step.code.as_str()) {
                continue;
            }
            if !step
                .depends_on
                .iter()
                .all(|d| succeeded.contains_key(d.as_str()))
            {
                continue;
            }

            let latest = attempts
                .iter()
                .filter(|a| a.step_code == step.code)
                .max_by_key(|a| a.attempt_number);
            match latest {
                None => {
                    return self
                        .dispatch(&mut execution, &definition, step, 1, &attempts, now, events)
                        .await;
                }
                Some(latest) if latest.status == AttemptStatus::Pending => {
                    if latest.ready_at <= now {
                        return self
                            .dispatch(
                                &mut execution,
                                &definition,
                                step,
                                latest.attempt_number,
                                &attempts,
                                now,
                                events,
                            )
                            .await;
                    }
                    wait_until = Some(match wait_until {
                        Some(t) => t.min(latest.ready_at),
                        None => latest.ready_at,
                    });
                }
                Some(latest) if latest.status == AttemptStatus::Failed => {
                    // A failure whose routing never committed (crash
                    // window between recording and deciding): decide now.
                    let class = latest.error_class.unwrap_or(ErrorClass::Retryable);
                    let summary = latest.error_summary.clone().unwrap_or_default();
                    let timed_out = summary.contains("timed out");
                    return self
                        .after_failure(
                            &mut execution,
                            &definition,
                            step,
                            latest.attempt_number,
                            class,
                            summary,
                            timed_out,
                            events,
                        )
                        .await;
                }
                Some(_) => {}
            }
        }

        match wait_until {
            Some(t) => Ok(Advanced {
                outcome: AdvanceOutcome::WaitUntil(t),
                events,
            }),
            None => Err(Error::Internal(
                "no runnable step and nothing scheduled".into(),
            )),
        }
    }

    /// Advance until the execution blocks or completes, merging events.
    pub async fn drain(&self, execution_id: Uuid) -> Result<Advanced, Error> {
        let mut events = Vec::new();
        loop {
            let mut advanced = self.advance(execution_id).await?;
            events.append(&mut advanced.events);
            match advanced.outcome {
                AdvanceOutcome::Progressed | AdvanceOutcome::Raced => continue,
                outcome => {
                    return Ok(Advanced { outcome, events });
                }
            }
        }
    }

    async fn dispatch(
        &self,
        execution: &mut Execution,
        definition: &WorkflowDefinition,
        step: &StepDescriptor,
        attempt_number: u32,
        attempts: &[StepAttempt],
        now: DateTime<Utc>,
        mut events: Vec<DomainEvent>,
    ) -> Result<Advanced, Error> {
        if execution.status == ExecutionStatus::Pending {
            execution.status = ExecutionStatus::Running;
            execution.started_at = Some(now);
            events.push(DomainEvent::ExecutionStarted {
                execution_id: execution.id,
            });
        }
        execution.current_step = Some(step.code.clone());
        self.executions.update(execution).await?;

        let input = assemble_input(execution, step, attempts);
        let runner = StepRunner {
            env: &self.env,
            executions: self.executions.as_ref(),
            handlers: &self.handlers,
        };
        let result = runner
            .run(execution, definition, step, attempt_number, input)
            .await?;

        match result {
            AttemptResult::LostRace => Ok(Advanced {
                outcome: AdvanceOutcome::Raced,
                events,
            }),
            AttemptResult::Succeeded { .. } => {
                events.push(DomainEvent::StepStarted {
                    execution_id: execution.id,
                    step_code: step.code.clone(),
                    attempt: attempt_number,
                });
                events.push(DomainEvent::StepSucceeded {
                    execution_id: execution.id,
                    step_code: step.code.clone(),
                    attempt: attempt_number,
                });

                let attempts = self.executions.list_attempts(execution.id).await?;
                let all_done = definition.steps.iter().all(|s| {
                    attempts
                        .iter()
                        .any(|a| a.step_code == s.code && a.status == AttemptStatus::Succeeded)
                });
                if all_done {
                    self.finalize_success(execution, definition, &attempts, events)
                        .await
                } else {
                    Ok(Advanced {
                        outcome: AdvanceOutcome::Progressed,
                        events,
                    })
                }
            }
            AttemptResult::Failed {
                class,
                summary,
                timed_out,
            } => {
                events.push(DomainEvent::StepStarted {
                    execution_id: execution.id,
                    step_code: step.code.clone(),
                    attempt: attempt_number,
                });
                events.push(DomainEvent::StepFailed {
                    execution_id: execution.id,
                    step_code: step.code.clone(),
                    attempt: attempt_number,
                    class,
                    summary: summary.clone(),
                });
                self.after_failure(
                    execution,
                    definition,
                    step,
                    attempt_number,
                    class,
                    summary,
                    timed_out,
                    events,
                )
                .await
            }
        }
    }

    /// Retry or route to a terminal outcome after a failed attempt.
    #[allow(clippy::too_many_arguments)]
    async fn after_failure(
        &self,
        execution: &mut Execution,
        definition: &WorkflowDefinition,
        step: &StepDescriptor,
        attempt_number: u32,
        class: ErrorClass,
        summary: String,
        timed_out: bool,
        mut events: Vec<DomainEvent>,
    ) -> Result<Advanced, Error> {
        if step.should_retry(class, attempt_number) {
            let backoff = step.backoff_for(class);
            let delay = delay_after(attempt_number, &backoff, &self.env);
            let ready_at = self.env.now() + delay;
            self.executions
                .insert_attempt(StepAttempt::scheduled(
                    execution.id,
                    &step.code,
                    attempt_number + 1,
                    ready_at,
                ))
                .await?;
            events.push(DomainEvent::RetryScheduled {
                execution_id: execution.id,
                step_code: step.code.clone(),
                attempt: attempt_number + 1,
                ready_at,
            });
            return Ok(Advanced {
                outcome: AdvanceOutcome::WaitUntil(ready_at),
                events,
            });
        }

        // Terminal failure of this step.
        let now = self.env.now();
        execution.error_class = Some(class);
        execution.error_summary = Some(summary.clone());

        let reason = if timed_out {
            DlqReason::Timeout
        } else if class == ErrorClass::NonRetryable {
            DlqReason::NonRetryableError
        } else if class == ErrorClass::CompensationRequired {
            DlqReason::CompensationRequired
        } else if attempt_number >= step.max_attempts_for(class) {
            DlqReason::MaxAttemptsExceeded
        } else {
            DlqReason::Unknown
        };

        self.dlq
            .insert_once(DlqEntry {
                id: Uuid::new_v4(),
                tenant_id: execution.tenant_id.clone(),
                execution_id: execution.id,
                step_code: step.code.clone(),
                reason,
                error_class: class,
                error_summary: summary,
                metadata: json!({
                    "attempts": attempt_number,
                    "definition_version": execution.definition_version,
                }),
                created_at: now,
                reprocessed_at: None,
                reprocessed_by: None,
                reprocess_outcome: None,
            })
            .await?;

        let attempts = self.executions.list_attempts(execution.id).await?;
        let has_compensation = attempts
            .iter()
            .filter(|a| a.status == AttemptStatus::Succeeded)
            .any(|a| {
                definition
                    .step(&a.step_code)
                    .is_some_and(|s| s.compensation_handler.is_some())
            });

        if has_compensation {
            execution.status = ExecutionStatus::Compensating;
            self.executions.update(execution).await?;
            events.push(DomainEvent::CompensationStarted {
                execution_id: execution.id,
            });
            return self
                .continue_compensation(execution, definition, events)
                .await;
        }

        if class == ErrorClass::NonRetryable {
            execution.status = ExecutionStatus::Failed;
            execution.completed_at = Some(now);
            execution.current_step = None;
            self.executions.update(execution).await?;
            events.push(DomainEvent::ExecutionFailed {
                execution_id: execution.id,
                class,
            });
            Ok(Advanced {
                outcome: AdvanceOutcome::Completed(ExecutionStatus::Failed),
                events,
            })
        } else {
            execution.status = ExecutionStatus::Dlq;
            execution.dlq_at = Some(now);
            execution.completed_at = Some(now);
            execution.current_step = None;
            self.executions.update(execution).await?;
            events.push(DomainEvent::RoutedToDlq {
                execution_id: execution.id,
                reason,
            });
            Ok(Advanced {
                outcome: AdvanceOutcome::Completed(ExecutionStatus::Dlq),
                events,
            })
        }
    }

    /// Run compensation handlers over succeeded steps in reverse
    /// completion order.
    async fn continue_compensation(
        &self,
        execution: &mut Execution,
        definition: &WorkflowDefinition,
        mut events: Vec<DomainEvent>,
    ) -> Result<Advanced, Error> {
        let attempts = self.executions.list_attempts(execution.id).await?;
        let mut to_compensate: Vec<StepAttempt> = attempts
            .into_iter()
            .filter(|a| a.status == AttemptStatus::Succeeded)
            .collect();
        // Reverse completion order. Completion times can collide at clock
        // granularity; the DAG guarantees dependencies completed first, so
        // reverse definition order breaks the tie.
        let index_of = |code: &str| {
            definition
                .steps
                .iter()
                .position(|s| s.code == code)
                .unwrap_or(usize::MAX)
        };
        to_compensate.sort_by(|a, b| {
            b.completed_at
                .cmp(&a.completed_at)
                .then_with(|| index_of(&b.step_code).cmp(&index_of(&a.step_code)))
        });

        for mut attempt in to_compensate {
            let step = definition
                .step(&attempt.step_code)
                .ok_or_else(|| Error::Internal("attempt for unknown step".into()))?;

            let Some(comp_code) = &step.compensation_handler else {
                attempt.status = AttemptStatus::Skipped;
                self.executions.update_attempt(&attempt).await?;
                events.push(DomainEvent::CompensationSkipped {
                    execution_id: execution.id,
                    step_code: step.code.clone(),
                });
                continue;
            };

            let Some(handler) = self.handlers.lookup(comp_code) else {
                return self
                    .compensation_failed(
                        execution,
                        events,
                        format!("no handler registered for code {comp_code}"),
                    )
                    .await;
            };

            let now = self.env.now();
            let timeout_ms = step.effective_timeout_ms(&definition.policies);
            let (cancel_handle, cancellation) = cancel_channel();
            let ctx = HandlerContext {
                tenant_id: execution.tenant_id.clone(),
                execution_id: execution.id,
                step_code: step.code.clone(),
                attempt: 1,
                deadline: now + chrono::Duration::milliseconds(timeout_ms as i64),
                cancellation,
            };
            let mut input = serde_json::Map::new();
            input.insert("$input".to_string(), execution.input.clone());
            input.insert(
                attempt.step_code.clone(),
                attempt.output.clone().unwrap_or(Value::Null),
            );

            let run = handler.run(ctx, Value::Object(input));
            match tokio::time::timeout(std::time::Duration::from_millis(timeout_ms), run).await {
                Ok(Ok(_)) => {
                    attempt.status = AttemptStatus::Compensated;
                    self.executions.update_attempt(&attempt).await?;
                    events.push(DomainEvent::StepCompensated {
                        execution_id: execution.id,
                        step_code: step.code.clone(),
                    });
                }
                Ok(Err(failure)) => {
                    return self
                        .compensation_failed(execution, events, failure.message)
                        .await;
                }
                Err(_elapsed) => {
                    cancel_handle.cancel();
                    return self
                        .compensation_failed(
                            execution,
                            events,
                            format!("compensation timed out after {timeout_ms}ms"),
                        )
                        .await;
                }
            }
        }

        execution.status = ExecutionStatus::Compensated;
        execution.completed_at = Some(self.env.now());
        execution.current_step = None;
        self.executions.update(execution).await?;
        events.push(DomainEvent::ExecutionCompensated {
            execution_id: execution.id,
        });
        Ok(Advanced {
            outcome: AdvanceOutcome::Completed(ExecutionStatus::Compensated),
            events,
        })
    }

    /// A compensation handler failed terminally: annotate the existing DLQ
    /// entry and park the execution.
    async fn compensation_failed(
        &self,
        execution: &mut Execution,
        mut events: Vec<DomainEvent>,
        summary: String,
    ) -> Result<Advanced, Error> {
        warn!(
            execution_id = %execution.id,
            "compensation failed: {summary}"
        );
        let now = self.env.now();

        let mut reason = DlqReason::Unknown;
        if let Some(mut entry) = self.dlq.for_execution(execution.id).await? {
            reason = entry.reason;
            if let Some(metadata) = entry.metadata.as_object_mut() {
                metadata.insert("compensation_failed".to_string(), json!(true));
                metadata.insert("compensation_error".to_string(), json!(summary));
            }
            self.dlq.update(&entry).await?;
        }

        execution.status = ExecutionStatus::Dlq;
        execution.dlq_at = Some(now);
        execution.completed_at = Some(now);
        execution.current_step = None;
        self.executions.update(execution).await?;
        events.push(DomainEvent::RoutedToDlq {
            execution_id: execution.id,
            reason,
        });
        Ok(Advanced {
            outcome: AdvanceOutcome::Completed(ExecutionStatus::Dlq),
            events,
        })
    }

    async fn finalize_success(
        &self,
        execution: &mut Execution,
        definition: &WorkflowDefinition,
        attempts: &[StepAttempt],
        mut events: Vec<DomainEvent>,
    ) -> Result<Advanced, Error> {
        let mut output = serde_json::Map::new();
        for (key, step_code) in &definition.output_mapping {
            let value = attempts
                .iter()
                .find(|a| &a.step_code == step_code && a.status == AttemptStatus::Succeeded)
                .and_then(|a| a.output.clone())
                .unwrap_or(Value::Null);
            output.insert(key.clone(), value);
        }
        let output = Value::Object(output);

        if let Some(schema) = &definition.output_schema {
            if let Err(errors) = schema.validate(&output) {
                // The graph produced output its own schema rejects; a host
                // bug worth surfacing loudly, but not worth failing an
                // otherwise complete execution over.
                warn!(
                    execution_id = %execution.id,
                    "output does not match output_schema: {}",
                    errors.join("; ")
                );
            }
        }

        execution.status = ExecutionStatus::Succeeded;
        execution.output = Some(output);
        execution.completed_at = Some(self.env.now());
        execution.current_step = None;
        self.executions.update(execution).await?;

        info!(execution_id = %execution.id, "execution succeeded");
        events.push(DomainEvent::ExecutionSucceeded {
            execution_id: execution.id,
        });
        Ok(Advanced {
            outcome: AdvanceOutcome::Completed(ExecutionStatus::Succeeded),
            events,
        })
    }

    // =========================================================================
    // DLQ review
    // =========================================================================

    pub async fn list_dlq(
        &self,
        tenant_id: &str,
        reason: Option<DlqReason>,
    ) -> Result<Vec<DlqEntry>, Error> {
        Ok(self.dlq.list(tenant_id, reason).await?)
    }

    /// Record a human review decision on a DLQ entry.
    pub async fn reprocess_dlq(
        &self,
        tenant_id: &str,
        entry_id: Uuid,
        reprocessed_by: &str,
        outcome: &str,
    ) -> Result<DlqEntry, Error> {
        let mut entry = self
            .dlq
            .get(tenant_id, entry_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("dlq entry {entry_id}")))?;
        entry.reprocessed_at = Some(self.env.now());
        entry.reprocessed_by = Some(reprocessed_by.to_string());
        entry.reprocess_outcome = Some(outcome.to_string());
        self.dlq.update(&entry).await?;
        Ok(entry)
    }
}

/// Merge the outputs of a step's dependencies, keyed by their codes, plus
/// the execution input under `$input`.
fn assemble_input(execution: &Execution, step: &StepDescriptor, attempts: &[StepAttempt]) -> Value {
    let mut input = serde_json::Map::new();
    input.insert("$input".to_string(), execution.input.clone());
    for dep in &step.depends_on {
        let output = attempts
            .iter()
            .find(|a| &a.step_code == dep && a.status == AttemptStatus::Succeeded)
            .and_then(|a| a.output.clone())
            .unwrap_or(Value::Null);
        input.insert(dep.clone(), output);
    }
    Value::Object(input)
}
