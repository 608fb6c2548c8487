//! Randomized checks for the orchestrator's quantified invariants.
//!
//! Seeds are fixed so failures reproduce.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::env::{Env, FixedClock};
use crate::execution::ExecutionStatus;
use crate::handler::{handler_fn, HandlerFailure, HandlerRegistry};
use crate::orchestrator::{AdvanceOutcome, Orchestrator};
use crate::store::{
    DlqStore, ExecutionStore, InMemoryDefinitionStore, InMemoryDlqStore, InMemoryExecutionStore,
};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
}

struct Harness {
    orchestrator: Orchestrator,
    executions: Arc<InMemoryExecutionStore>,
    dlq: Arc<InMemoryDlqStore>,
    clock: FixedClock,
}

fn harness(handlers: HandlerRegistry) -> Harness {
    let clock = FixedClock::at(t0());
    let executions = Arc::new(InMemoryExecutionStore::new());
    let dlq = Arc::new(InMemoryDlqStore::new());
    let orchestrator = Orchestrator::new(
        Env::new(Arc::new(clock.clone()), Some(23)),
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

/// Drive an execution to a terminal status, advancing the fixed clock
/// through retry waits.
async fn drive(h: &Harness, execution_id: Uuid) -> ExecutionStatus {
    loop {
        let advanced = h.orchestrator.drain(execution_id).await.unwrap();
        match advanced.outcome {
            AdvanceOutcome::Completed(status) => return status,
            AdvanceOutcome::WaitUntil(t) => h.clock.set(t),
            other => panic!("unexpected outcome while driving: {other:?}"),
        }
    }
}

/// Invariant 6: with handlers that are pure functions of their inputs,
/// two executions with different idempotency keys produce identical
/// output.
#[tokio::test]
async fn test_outcome_is_deterministic_across_executions() {
    let mut handlers = HandlerRegistry::new();
    handlers.register(
        "calc.double",
        handler_fn(|_ctx, input| async move {
            let n = input["$input"]["n"].as_i64().unwrap_or(0);
            Ok(json!({"doubled": n * 2}))
        }),
    );
    handlers.register(
        "calc.add_label",
        handler_fn(|_ctx, input| async move {
            let doubled = input["double"]["doubled"].as_i64().unwrap_or(0);
            Ok(json!({"label": format!("value-{doubled}")}))
        }),
    );

    let h = harness(handlers);
    h.orchestrator
        .publish(
            "t1",
            json!({
                "code": "calc",
                "steps": [
                    {"code": "double", "handler": "calc.double"},
                    {"code": "label", "handler": "calc.add_label",
                     "depends_on": ["double"]}
                ],
                "output_mapping": {"result": "label"}
            }),
        )
        .await
        .unwrap();

    let mut outputs = Vec::new();
    for key in ["k-a", "k-b"] {
        let started = h
            .orchestrator
            .start("t1", "calc", json!({"n": 21}), key)
            .await
            .unwrap();
        assert_eq!(drive(&h, started.execution.id).await, ExecutionStatus::Succeeded);
        let execution = h
            .executions
            .get(started.execution.id)
            .await
            .unwrap()
            .unwrap();
        outputs.push(execution.output.unwrap());
    }
    assert_eq!(outputs[0], outputs[1]);
    assert_eq!(outputs[0], json!({"result": {"label": "value-42"}}));
}

/// Invariant 7: `start` with the same key always lands on the same row.
#[tokio::test]
async fn test_idempotent_start_over_random_keys() {
    let mut handlers = HandlerRegistry::new();
    handlers.register("h.ok", handler_fn(|_c, _i| async { Ok(json!({})) }));
    let h = harness(handlers);
    h.orchestrator
        .publish(
            "t1",
            json!({"code": "wf", "steps": [{"code": "s", "handler": "h.ok"}]}),
        )
        .await
        .unwrap();

    let mut rng = fastrand::Rng::with_seed(5);
    for _ in 0..50 {
        let key = format!("key-{}", rng.u32(0..10));
        let first = h
            .orchestrator
            .start("t1", "wf", json!({}), &key)
            .await
            .unwrap();
        let second = h
            .orchestrator
            .start("t1", "wf", json!({}), &key)
            .await
            .unwrap();
        assert_eq!(first.execution.id, second.execution.id);
    }
}

/// Invariant 8: no attempt row ever exceeds the step's ceiling.
#[tokio::test]
async fn test_attempt_count_never_exceeds_max() {
    let mut rng = fastrand::Rng::with_seed(31);
    for round in 0..10 {
        let max_attempts = rng.u32(1..5);

        let mut handlers = HandlerRegistry::new();
        handlers.register(
            "h.always_fails",
            handler_fn(|_c, _i| async { Err(HandlerFailure::new("optimistic lock conflict")) }),
        );
        let h = harness(handlers);
        h.orchestrator
            .publish(
                "t1",
                json!({
                    "code": "wf",
                    "steps": [{
                        "code": "s", "handler": "h.always_fails",
                        "max_attempts": max_attempts,
                        "backoff": {"initial_delay_ms": 10, "max_delay_ms": 50,
                                     "multiplier": 2.0, "jitter": 0.5}
                    }]
                }),
            )
            .await
            .unwrap();

        let started = h
            .orchestrator
            .start("t1", "wf", json!({}), &format!("k-{round}"))
            .await
            .unwrap();
        let status = drive(&h, started.execution.id).await;
        assert_eq!(status, ExecutionStatus::Dlq);

        let attempts = h
            .executions
            .list_attempts(started.execution.id)
            .await
            .unwrap();
        assert_eq!(attempts.len() as u32, max_attempts);
        assert!(attempts.iter().all(|a| a.attempt_number <= max_attempts));
    }
}

/// Invariant 9: compensation handler invocations happen in the reverse of
/// the completion order of the succeeded steps.
#[tokio::test]
async fn test_compensation_runs_in_reverse_completion_order() {
    let completion_order = Arc::new(Mutex::new(Vec::<String>::new()));
    let compensation_order = Arc::new(Mutex::new(Vec::<String>::new()));

    let mut handlers = HandlerRegistry::new();
    for i in 0..4 {
        let step = format!("s{i}");
        let completions = completion_order.clone();
        handlers.register(
            format!("h.{step}"),
            handler_fn(move |ctx, _input| {
                let completions = completions.clone();
                async move {
                    completions.lock().push(ctx.step_code.clone());
                    Ok(json!({}))
                }
            }),
        );
        let compensations = compensation_order.clone();
        handlers.register(
            format!("h.undo_{step}"),
            handler_fn(move |ctx, _input| {
                let compensations = compensations.clone();
                async move {
                    compensations.lock().push(ctx.step_code.clone());
                    Ok(json!({}))
                }
            }),
        );
    }
    handlers.register(
        "h.boom",
        handler_fn(|_c, _i| async { Err(HandlerFailure::new("validation failed")) }),
    );

    let h = harness(handlers);
    // A linear chain s0 -> s1 -> s2 -> s3 -> boom, every link undoable.
    let steps: Vec<Value> = (0..4)
        .map(|i| {
            let mut step = json!({
                "code": format!("s{i}"),
                "handler": format!("h.s{i}"),
                "compensation_handler": format!("h.undo_s{i}")
            });
            if i > 0 {
                step["depends_on"] = json!([format!("s{}", i - 1)]);
            }
            step
        })
        .chain(std::iter::once(
            json!({"code": "boom", "handler": "h.boom", "depends_on": ["s3"]}),
        ))
        .collect();
    h.orchestrator
        .publish("t1", json!({"code": "chain", "steps": steps}))
        .await
        .unwrap();

    let started = h
        .orchestrator
        .start("t1", "chain", json!({}), "k-chain")
        .await
        .unwrap();
    // Advance one step at a time, moving the clock so completion times
    // are distinct.
    loop {
        let advanced = h.orchestrator.advance(started.execution.id).await.unwrap();
        h.clock.advance(chrono::Duration::seconds(1));
        match advanced.outcome {
            AdvanceOutcome::Progressed => continue,
            AdvanceOutcome::Completed(status) => {
                assert_eq!(status, ExecutionStatus::Compensated);
                break;
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    let completed = completion_order.lock().clone();
    let mut expected: Vec<String> = completed.clone();
    expected.reverse();
    assert_eq!(*compensation_order.lock(), expected);
}

/// Invariant 10: executions in `dlq` have exactly one entry; succeeded
/// executions have none.
#[tokio::test]
async fn test_dlq_completeness_over_mixed_outcomes() {
    let mut handlers = HandlerRegistry::new();
    handlers.register("h.ok", handler_fn(|_c, _i| async { Ok(json!({})) }));
    handlers.register(
        "h.fail",
        handler_fn(|_c, _i| async { Err(HandlerFailure::new("conflict")) }),
    );

    let h = harness(handlers);
    h.orchestrator
        .publish(
            "t1",
            json!({"code": "ok", "steps": [{"code": "s", "handler": "h.ok"}]}),
        )
        .await
        .unwrap();
    h.orchestrator
        .publish(
            "t1",
            json!({
                "code": "doomed",
                "steps": [{
                    "code": "s", "handler": "h.fail", "max_attempts": 2,
                    "backoff": {"initial_delay_ms": 5, "max_delay_ms": 10,
                                 "multiplier": 2.0, "jitter": 0.0}
                }]
            }),
        )
        .await
        .unwrap();

    let mut rng = fastrand::Rng::with_seed(13);
    let mut launched = Vec::new();
    for i in 0..30 {
        let code = if rng.bool() { "ok" } else { "doomed" };
        let started = h
            .orchestrator
            .start("t1", code, json!({}), &format!("k-{i}"))
            .await
            .unwrap();
        launched.push(started.execution.id);
    }
    for id in &launched {
        drive(&h, *id).await;
    }

    for id in launched {
        let execution = h.executions.get(id).await.unwrap().unwrap();
        let entry = h.dlq.for_execution(id).await.unwrap();
        match execution.status {
            ExecutionStatus::Succeeded => {
                assert!(entry.is_none(), "succeeded execution has a dlq entry")
            }
            ExecutionStatus::Dlq => {
                assert!(entry.is_some(), "dlq execution missing its entry")
            }
            other => panic!("unexpected terminal status: {other:?}"),
        }
    }
}
