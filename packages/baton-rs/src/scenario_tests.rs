//! End-to-end orchestrator scenarios.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::classify::ErrorClass;
use crate::dlq::DlqReason;
use crate::env::{Env, FixedClock};
use crate::execution::{AttemptStatus, ExecutionStatus};
use crate::handler::{handler_fn, HandlerFailure, HandlerRegistry};
use crate::orchestrator::{AdvanceOutcome, Orchestrator};
use crate::store::{
    DlqStore, ExecutionStore, InMemoryDefinitionStore, InMemoryDlqStore, InMemoryExecutionStore,
};

struct Harness {
    orchestrator: Orchestrator,
    executions: Arc<InMemoryExecutionStore>,
    dlq: Arc<InMemoryDlqStore>,
    clock: FixedClock,
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
}

fn harness(handlers: HandlerRegistry) -> Harness {
    let clock = FixedClock::at(t0());
    let executions = Arc::new(InMemoryExecutionStore::new());
    let dlq = Arc::new(InMemoryDlqStore::new());
    let orchestrator = Orchestrator::new(
        Env::new(Arc::new(clock.clone()), Some(17)),
        Arc::new(InMemoryDefinitionStore::new()),
        executions.clone(),
        dlq.clone(),
        Arc::new(handlers),
    );
    Harness {
        orchestrator,
        executions,
        dlq,
        clock,
    }
}

fn ok_handler(output: Value) -> Arc<dyn crate::handler::StepHandler> {
    handler_fn(move |_ctx, _input| {
        let output = output.clone();
        async move { Ok(output) }
    })
}

fn accept_proposal_definition() -> Value {
    json!({
        "code": "accept_proposal",
        "steps": [
            {"code": "validate", "handler": "proposal.validate"},
            {"code": "create_client", "handler": "clients.create",
             "depends_on": ["validate"]},
            {"code": "create_engagement", "handler": "engagements.create",
             "depends_on": ["create_client"],
             "max_attempts": 3,
             "backoff": {"initial_delay_ms": 100, "max_delay_ms": 5000,
                          "multiplier": 2.0, "jitter": 0.0}},
            {"code": "send_welcome", "handler": "mail.welcome",
             "depends_on": ["create_engagement"]}
        ],
        "input_schema": {
            "type": "object",
            "properties": {"client_name": {"type": "string", "minLength": 1}},
            "required": ["client_name"]
        },
        "output_mapping": {"engagement": "create_engagement"}
    })
}

fn happy_registry() -> HandlerRegistry {
    let mut handlers = HandlerRegistry::new();
    handlers.register("proposal.validate", ok_handler(json!({"valid": true})));
    handlers.register("clients.create", ok_handler(json!({"client_id": 11})));
    handlers.register(
        "engagements.create",
        ok_handler(json!({"engagement_id": 77})),
    );
    handlers.register("mail.welcome", ok_handler(json!({"sent": true})));
    handlers
}

/// S4: happy path plus idempotent start.
#[tokio::test]
async fn test_workflow_happy_path_with_idempotent_start() {
    let h = harness(happy_registry());
    h.orchestrator
        .publish("firm-1", accept_proposal_definition())
        .await
        .unwrap();

    let input = json!({"client_name": "Acme"});
    let first = h
        .orchestrator
        .start("firm-1", "accept_proposal", input.clone(), "accept-7")
        .await
        .unwrap();
    assert!(!first.replayed);

    let second = h
        .orchestrator
        .start("firm-1", "accept_proposal", input, "accept-7")
        .await
        .unwrap();
    assert!(second.replayed);
    assert_eq!(second.execution.id, first.execution.id);

    let advanced = h.orchestrator.drain(first.execution.id).await.unwrap();
    assert_eq!(
        advanced.outcome,
        AdvanceOutcome::Completed(ExecutionStatus::Succeeded)
    );

    let execution = h
        .executions
        .get(first.execution.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_eq!(
        execution.output,
        Some(json!({"engagement": {"engagement_id": 77}}))
    );

    let attempts = h.executions.list_attempts(execution.id).await.unwrap();
    assert_eq!(attempts.len(), 4);
    assert!(attempts
        .iter()
        .all(|a| a.status == AttemptStatus::Succeeded));
    assert!(h.dlq.list("firm-1", None).await.unwrap().is_empty());
}

/// S5: a transient failure retries with backoff and then succeeds.
#[tokio::test]
async fn test_transient_retry_then_success() {
    let mut handlers = HandlerRegistry::new();
    handlers.register("proposal.validate", ok_handler(json!({})));
    handlers.register("clients.create", ok_handler(json!({"client_id": 1})));
    handlers.register("mail.welcome", ok_handler(json!({})));

    let calls = Arc::new(AtomicUsize::new(0));
    let call_counter = calls.clone();
    handlers.register(
        "engagements.create",
        handler_fn(move |_ctx, _input| {
            let calls = call_counter.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(HandlerFailure::new("connection reset by peer"))
                } else {
                    Ok(json!({"engagement_id": 5}))
                }
            }
        }),
    );

    let h = harness(handlers);
    h.orchestrator
        .publish("firm-1", accept_proposal_definition())
        .await
        .unwrap();
    let started = h
        .orchestrator
        .start("firm-1", "accept_proposal", json!({"client_name": "Acme"}), "k-5")
        .await
        .unwrap();

    let advanced = h.orchestrator.drain(started.execution.id).await.unwrap();
    let ready_at = match advanced.outcome {
        AdvanceOutcome::WaitUntil(t) => t,
        other => panic!("expected a retry wait, got {other:?}"),
    };
    // initial_delay_ms=100, jitter 0.
    assert_eq!(ready_at, t0() + Duration::milliseconds(100));

    h.clock.set(ready_at);
    let advanced = h.orchestrator.drain(started.execution.id).await.unwrap();
    assert_eq!(
        advanced.outcome,
        AdvanceOutcome::Completed(ExecutionStatus::Succeeded)
    );

    let attempts = h
        .executions
        .list_attempts(started.execution.id)
        .await
        .unwrap();
    let engagement_attempts: Vec<_> = attempts
        .iter()
        .filter(|a| a.step_code == "create_engagement")
        .collect();
    assert_eq!(engagement_attempts.len(), 2);
    assert_eq!(engagement_attempts[0].status, AttemptStatus::Failed);
    assert_eq!(
        engagement_attempts[0].error_class,
        Some(ErrorClass::Transient)
    );
    assert_eq!(engagement_attempts[1].status, AttemptStatus::Succeeded);
    assert!(h.dlq.list("firm-1", None).await.unwrap().is_empty());
}

fn compensation_definition() -> Value {
    json!({
        "code": "provision",
        "steps": [
            {"code": "step_a", "handler": "h.a"},
            {"code": "step_b", "handler": "h.b", "depends_on": ["step_a"],
             "compensation_handler": "h.undo_b"},
            {"code": "step_c", "handler": "h.c", "depends_on": ["step_b"]}
        ]
    })
}

/// S6: compensation runs in reverse completion order; the DLQ entry
/// records the precipitating non-retryable failure.
#[tokio::test]
async fn test_compensation_reverse_order() {
    let order = Arc::new(Mutex::new(Vec::<String>::new()));

    let mut handlers = HandlerRegistry::new();
    handlers.register("h.a", ok_handler(json!({"a": 1})));
    handlers.register("h.b", ok_handler(json!({"b": 2})));
    handlers.register(
        "h.c",
        handler_fn(|_ctx, _input| async {
            Err(HandlerFailure::new("validation failed: missing ledger"))
        }),
    );
    let undo_order = order.clone();
    handlers.register(
        "h.undo_b",
        handler_fn(move |_ctx, input| {
            let order = undo_order.clone();
            async move {
                // The compensation input carries the step's own output.
                assert_eq!(input["step_b"], json!({"b": 2}));
                order.lock().push("undo_b".to_string());
                Ok(json!({}))
            }
        }),
    );

    let h = harness(handlers);
    h.orchestrator
        .publish("firm-1", compensation_definition())
        .await
        .unwrap();
    let started = h
        .orchestrator
        .start("firm-1", "provision", json!({}), "k-6")
        .await
        .unwrap();

    let advanced = h.orchestrator.drain(started.execution.id).await.unwrap();
    assert_eq!(
        advanced.outcome,
        AdvanceOutcome::Completed(ExecutionStatus::Compensated)
    );
    assert_eq!(*order.lock(), vec!["undo_b".to_string()]);

    let attempts = h
        .executions
        .list_attempts(started.execution.id)
        .await
        .unwrap();
    assert_eq!(
        attempts
            .iter()
            .find(|a| a.step_code == "step_b")
            .unwrap()
            .status,
        AttemptStatus::Compensated
    );
    assert_eq!(
        attempts
            .iter()
            .find(|a| a.step_code == "step_a")
            .unwrap()
            .status,
        AttemptStatus::Skipped
    );

    let entries = h.dlq.list("firm-1", None).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].reason, DlqReason::NonRetryableError);
    assert_eq!(entries[0].error_class, ErrorClass::NonRetryable);
    assert_eq!(entries[0].step_code, "step_c");
}

/// A failing compensation parks the execution in the DLQ and annotates
/// the existing entry instead of writing a second one.
#[tokio::test]
async fn test_compensation_failure_routes_to_dlq() {
    let mut handlers = HandlerRegistry::new();
    handlers.register("h.a", ok_handler(json!({})));
    handlers.register("h.b", ok_handler(json!({})));
    handlers.register(
        "h.c",
        handler_fn(|_ctx, _input| async { Err(HandlerFailure::new("permission denied")) }),
    );
    handlers.register(
        "h.undo_b",
        handler_fn(|_ctx, _input| async { Err(HandlerFailure::new("undo exploded")) }),
    );

    let h = harness(handlers);
    h.orchestrator
        .publish("firm-1", compensation_definition())
        .await
        .unwrap();
    let started = h
        .orchestrator
        .start("firm-1", "provision", json!({}), "k-7")
        .await
        .unwrap();

    let advanced = h.orchestrator.drain(started.execution.id).await.unwrap();
    assert_eq!(
        advanced.outcome,
        AdvanceOutcome::Completed(ExecutionStatus::Dlq)
    );

    let entries = h.dlq.list("firm-1", None).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].metadata["compensation_failed"], json!(true));
    assert_eq!(
        entries[0].metadata["compensation_error"],
        json!("undo exploded")
    );
}

/// A non-retryable failure with nothing to undo fails the execution and
/// still leaves a review entry.
#[tokio::test]
async fn test_non_retryable_without_compensation_fails() {
    let mut handlers = HandlerRegistry::new();
    handlers.register(
        "h.only",
        handler_fn(|_ctx, _input| async { Err(HandlerFailure::new("invalid input: bad date")) }),
    );

    let h = harness(handlers);
    h.orchestrator
        .publish(
            "firm-1",
            json!({
                "code": "single",
                "steps": [{"code": "only", "handler": "h.only"}]
            }),
        )
        .await
        .unwrap();
    let started = h
        .orchestrator
        .start("firm-1", "single", json!({}), "k-8")
        .await
        .unwrap();

    let advanced = h.orchestrator.drain(started.execution.id).await.unwrap();
    assert_eq!(
        advanced.outcome,
        AdvanceOutcome::Completed(ExecutionStatus::Failed)
    );

    let execution = h
        .executions
        .get(started.execution.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(execution.error_class, Some(ErrorClass::NonRetryable));

    let entries = h.dlq.list("firm-1", None).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].reason, DlqReason::NonRetryableError);
}

/// Exhausted retries of a retryable class route to the DLQ.
#[tokio::test]
async fn test_max_attempts_exhausted_routes_to_dlq() {
    let mut handlers = HandlerRegistry::new();
    handlers.register(
        "h.flaky",
        handler_fn(|_ctx, _input| async { Err(HandlerFailure::new("connection refused")) }),
    );

    let h = harness(handlers);
    h.orchestrator
        .publish(
            "firm-1",
            json!({
                "code": "flaky",
                "steps": [{
                    "code": "flaky", "handler": "h.flaky",
                    "max_attempts": 2,
                    "backoff": {"initial_delay_ms": 10, "max_delay_ms": 100,
                                 "multiplier": 2.0, "jitter": 0.0}
                }]
            }),
        )
        .await
        .unwrap();
    let started = h
        .orchestrator
        .start("firm-1", "flaky", json!({}), "k-9")
        .await
        .unwrap();

    let advanced = h.orchestrator.drain(started.execution.id).await.unwrap();
    let ready_at = match advanced.outcome {
        AdvanceOutcome::WaitUntil(t) => t,
        other => panic!("expected retry wait, got {other:?}"),
    };
    h.clock.set(ready_at);

    let advanced = h.orchestrator.drain(started.execution.id).await.unwrap();
    assert_eq!(
        advanced.outcome,
        AdvanceOutcome::Completed(ExecutionStatus::Dlq)
    );

    let entries = h.dlq.list("firm-1", None).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].reason, DlqReason::MaxAttemptsExceeded);
    assert_eq!(entries[0].metadata["attempts"], json!(2));

    let attempts = h
        .executions
        .list_attempts(started.execution.id)
        .await
        .unwrap();
    assert_eq!(attempts.len(), 2);
}

/// A missing handler code is a non-retryable failure with a fixed
/// message.
#[tokio::test]
async fn test_unknown_handler_is_non_retryable() {
    let h = harness(HandlerRegistry::new());
    h.orchestrator
        .publish(
            "firm-1",
            json!({
                "code": "ghost",
                "steps": [{"code": "only", "handler": "nobody.home"}]
            }),
        )
        .await
        .unwrap();
    let started = h
        .orchestrator
        .start("firm-1", "ghost", json!({}), "k-10")
        .await
        .unwrap();

    let advanced = h.orchestrator.drain(started.execution.id).await.unwrap();
    assert_eq!(
        advanced.outcome,
        AdvanceOutcome::Completed(ExecutionStatus::Failed)
    );

    let execution = h
        .executions
        .get(started.execution.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        execution.error_summary.as_deref(),
        Some("no handler registered for code nobody.home")
    );
}

/// A step timeout fails the attempt as TRANSIENT; when attempts are
/// exhausted the DLQ reason is `timeout`.
#[tokio::test(start_paused = true)]
async fn test_step_timeout_routes_to_dlq_with_timeout_reason() {
    let mut handlers = HandlerRegistry::new();
    handlers.register(
        "h.slow",
        handler_fn(|_ctx, _input| async {
            tokio::time::sleep(std::time::Duration::from_millis(10_000)).await;
            Ok(json!({}))
        }),
    );

    let h = harness(handlers);
    h.orchestrator
        .publish(
            "firm-1",
            json!({
                "code": "slow",
                "steps": [{"code": "slow", "handler": "h.slow",
                            "timeout_ms": 50, "max_attempts": 1}]
            }),
        )
        .await
        .unwrap();
    let started = h
        .orchestrator
        .start("firm-1", "slow", json!({}), "k-11")
        .await
        .unwrap();

    let advanced = h.orchestrator.drain(started.execution.id).await.unwrap();
    assert_eq!(
        advanced.outcome,
        AdvanceOutcome::Completed(ExecutionStatus::Dlq)
    );

    let attempts = h
        .executions
        .list_attempts(started.execution.id)
        .await
        .unwrap();
    assert_eq!(attempts[0].status, AttemptStatus::Failed);
    assert_eq!(attempts[0].error_class, Some(ErrorClass::Transient));

    let entries = h.dlq.list("firm-1", None).await.unwrap();
    assert_eq!(entries[0].reason, DlqReason::Timeout);
}

/// Cancellation stops traversal between steps; the in-flight graph stays
/// where it is.
#[tokio::test]
async fn test_cancel_stops_traversal() {
    let h = harness(happy_registry());
    h.orchestrator
        .publish("firm-1", accept_proposal_definition())
        .await
        .unwrap();
    let started = h
        .orchestrator
        .start("firm-1", "accept_proposal", json!({"client_name": "Acme"}), "k-12")
        .await
        .unwrap();

    // Run a single step, then cancel.
    let advanced = h.orchestrator.advance(started.execution.id).await.unwrap();
    assert_eq!(advanced.outcome, AdvanceOutcome::Progressed);
    h.orchestrator.cancel(started.execution.id).await.unwrap();

    let advanced = h.orchestrator.advance(started.execution.id).await.unwrap();
    assert_eq!(advanced.outcome, AdvanceOutcome::CancelStopped);

    let attempts = h
        .executions
        .list_attempts(started.execution.id)
        .await
        .unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].step_code, "validate");
}

/// Bad input is rejected against the published input schema.
#[tokio::test]
async fn test_start_validates_input_schema() {
    let h = harness(happy_registry());
    h.orchestrator
        .publish("firm-1", accept_proposal_definition())
        .await
        .unwrap();

    let err = h
        .orchestrator
        .start("firm-1", "accept_proposal", json!({"client_name": ""}), "k-13")
        .await
        .unwrap_err();
    assert!(matches!(err, crate::error::Error::BadInput(_)));
}

/// DLQ review records who reprocessed an entry and the outcome.
#[tokio::test]
async fn test_dlq_reprocess_records_review() {
    let mut handlers = HandlerRegistry::new();
    handlers.register(
        "h.only",
        handler_fn(|_ctx, _input| async { Err(HandlerFailure::new("permission denied")) }),
    );
    let h = harness(handlers);
    h.orchestrator
        .publish(
            "firm-1",
            json!({"code": "single", "steps": [{"code": "only", "handler": "h.only"}]}),
        )
        .await
        .unwrap();
    let started = h
        .orchestrator
        .start("firm-1", "single", json!({}), "k-14")
        .await
        .unwrap();
    h.orchestrator.drain(started.execution.id).await.unwrap();

    let entry = &h.dlq.list("firm-1", None).await.unwrap()[0];
    let reviewed = h
        .orchestrator
        .reprocess_dlq("firm-1", entry.id, "ops@firm.example", "fixed upstream, restarted")
        .await
        .unwrap();
    assert_eq!(reviewed.reprocessed_by.as_deref(), Some("ops@firm.example"));
    assert!(reviewed.reprocessed_at.is_some());

    let listed = h
        .orchestrator
        .list_dlq("firm-1", Some(DlqReason::NonRetryableError))
        .await
        .unwrap();
    assert_eq!(
        listed[0].reprocess_outcome.as_deref(),
        Some("fixed upstream, restarted")
    );
}
