//! Built-in factory and handlers for smoke-testing a deployment.
//!
//! Real targets and step handlers are wired by the host application; the
//! admin binary ships a work item factory backed by the `work_items`
//! table plus two trivial handlers so `rules tick` and `executions start`
//! can be exercised end to end against a fresh database.

use std::sync::Arc;

use baton::{handler_fn, HandlerRegistry};
use metronome::{FactoryRegistry, Period, ProducedRef, RecurrenceRule, TargetFactory};
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

/// Materializes a period into a `work_items` row.
pub struct WorkItemFactory {
    pool: PgPool,
}

impl WorkItemFactory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl TargetFactory for WorkItemFactory {
    async fn materialize(
        &self,
        rule: &RecurrenceRule,
        period: &Period,
    ) -> anyhow::Result<ProducedRef> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO work_items (
                id, tenant_id, rule_id, template_ref, period_label,
                period_start, period_end
            )
            VALUES ($1,$2,$3,$4,$5,$6,$7)
            "#,
        )
        .bind(id)
        .bind(&rule.tenant_id)
        .bind(rule.id)
        .bind(&rule.target.id)
        .bind(&period.label)
        .bind(period.start)
        .bind(period.end)
        .execute(&self.pool)
        .await?;

        Ok(ProducedRef {
            kind: "work_item".into(),
            id: id.to_string(),
        })
    }
}

pub fn factories(pool: PgPool) -> FactoryRegistry {
    let mut registry = FactoryRegistry::new();
    registry.register("work_item", Arc::new(WorkItemFactory::new(pool)));
    registry
}

pub fn handlers() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register("builtin.noop", handler_fn(|_ctx, _input| async { Ok(json!({})) }));
    registry.register(
        "builtin.echo",
        handler_fn(|_ctx, input| async move { Ok(json!({"echo": input})) }),
    );
    registry
}
