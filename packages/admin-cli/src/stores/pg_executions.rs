//! Execution and step attempt store on PostgreSQL.

use async_trait::async_trait;
use baton::{
    AttemptStatus, ErrorClass, Execution, ExecutionStatus, ExecutionStore, InsertExecution,
    StepAttempt, StoreError,
};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::is_unique_violation;

fn map_err(err: sqlx::Error) -> StoreError {
    if is_unique_violation(&err) {
        StoreError::Conflict
    } else {
        StoreError::Backend(err.into())
    }
}

fn parse_execution_status(s: &str) -> Result<ExecutionStatus, StoreError> {
    match s {
        "pending" => Ok(ExecutionStatus::Pending),
        "running" => Ok(ExecutionStatus::Running),
        "succeeded" => Ok(ExecutionStatus::Succeeded),
        "failed" => Ok(ExecutionStatus::Failed),
        "compensating" => Ok(ExecutionStatus::Compensating),
        "compensated" => Ok(ExecutionStatus::Compensated),
        "dlq" => Ok(ExecutionStatus::Dlq),
        other => Err(StoreError::backend(format!("bad status in row: {other}"))),
    }
}

fn parse_attempt_status(s: &str) -> Result<AttemptStatus, StoreError> {
    match s {
        "pending" => Ok(AttemptStatus::Pending),
        "running" => Ok(AttemptStatus::Running),
        "succeeded" => Ok(AttemptStatus::Succeeded),
        "failed" => Ok(AttemptStatus::Failed),
        "skipped" => Ok(AttemptStatus::Skipped),
        "compensated" => Ok(AttemptStatus::Compensated),
        other => Err(StoreError::backend(format!("bad status in row: {other}"))),
    }
}

fn parse_error_class(s: Option<String>) -> Result<Option<ErrorClass>, StoreError> {
    s.map(|raw| {
        raw.parse::<ErrorClass>()
            .map_err(|e| StoreError::backend(format!("bad error class in row: {e}")))
    })
    .transpose()
}

fn execution_from_row(row: &PgRow) -> Result<Execution, StoreError> {
    let status: String = row.try_get("status").map_err(map_err)?;
    let error_class: Option<String> = row.try_get("error_class").map_err(map_err)?;
    Ok(Execution {
        id: row.try_get("id").map_err(map_err)?,
        tenant_id: row.try_get("tenant_id").map_err(map_err)?,
        definition_id: row.try_get("definition_id").map_err(map_err)?,
        definition_code: row.try_get("definition_code").map_err(map_err)?,
        definition_version: row.try_get("definition_version").map_err(map_err)?,
        idempotency_key: row.try_get("idempotency_key").map_err(map_err)?,
        status: parse_execution_status(&status)?,
        input: row.try_get("input").map_err(map_err)?,
        output: row.try_get("output").map_err(map_err)?,
        current_step: row.try_get("current_step").map_err(map_err)?,
        error_class: parse_error_class(error_class)?,
        error_summary: row.try_get("error_summary").map_err(map_err)?,
        cancel_requested: row.try_get("cancel_requested").map_err(map_err)?,
        created_at: row.try_get("created_at").map_err(map_err)?,
        started_at: row.try_get("started_at").map_err(map_err)?,
        completed_at: row.try_get("completed_at").map_err(map_err)?,
        dlq_at: row.try_get("dlq_at").map_err(map_err)?,
    })
}

fn attempt_from_row(row: &PgRow) -> Result<StepAttempt, StoreError> {
    let status: String = row.try_get("status").map_err(map_err)?;
    let error_class: Option<String> = row.try_get("error_class").map_err(map_err)?;
    let attempt_number: i32 = row.try_get("attempt_number").map_err(map_err)?;
    Ok(StepAttempt {
        execution_id: row.try_get("execution_id").map_err(map_err)?,
        step_code: row.try_get("step_code").map_err(map_err)?,
        attempt_number: attempt_number as u32,
        status: parse_attempt_status(&status)?,
        ready_at: row.try_get("ready_at").map_err(map_err)?,
        started_at: row.try_get("started_at").map_err(map_err)?,
        completed_at: row.try_get("completed_at").map_err(map_err)?,
        timeout_at: row.try_get("timeout_at").map_err(map_err)?,
        output: row.try_get("output").map_err(map_err)?,
        error_class: parse_error_class(error_class)?,
        error_summary: row.try_get("error_summary").map_err(map_err)?,
    })
}

/// Execution persistence on PostgreSQL.
#[derive(Clone)]
pub struct PgExecutionStore {
    pool: PgPool,
}

impl PgExecutionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ExecutionStore for PgExecutionStore {
    async fn insert(&self, execution: Execution) -> Result<InsertExecution, StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO executions (
                id, tenant_id, definition_id, definition_code,
                definition_version, idempotency_key, status, input, output,
                current_step, error_class, error_summary, cancel_requested,
                created_at, started_at, completed_at, dlq_at
            )
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17)
            ON CONFLICT (tenant_id, definition_code, idempotency_key) DO NOTHING
            "#,
        )
        .bind(execution.id)
        .bind(&execution.tenant_id)
        .bind(execution.definition_id)
        .bind(&execution.definition_code)
        .bind(execution.definition_version)
        .bind(&execution.idempotency_key)
        .bind(execution.status.as_str())
        .bind(&execution.input)
        .bind(&execution.output)
        .bind(&execution.current_step)
        .bind(execution.error_class.map(|c| c.as_str()))
        .bind(&execution.error_summary)
        .bind(execution.cancel_requested)
        .bind(execution.created_at)
        .bind(execution.started_at)
        .bind(execution.completed_at)
        .bind(execution.dlq_at)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;

        if inserted.rows_affected() == 1 {
            return Ok(InsertExecution::Inserted(execution));
        }

        let row = sqlx::query(
            r#"
            SELECT * FROM executions
            WHERE tenant_id = $1 AND definition_code = $2 AND idempotency_key = $3
            "#,
        )
        .bind(&execution.tenant_id)
        .bind(&execution.definition_code)
        .bind(&execution.idempotency_key)
        .fetch_one(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(InsertExecution::Replayed(execution_from_row(&row)?))
    }

    async fn get(&self, execution_id: Uuid) -> Result<Option<Execution>, StoreError> {
        let row = sqlx::query("SELECT * FROM executions WHERE id = $1")
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?;
        row.as_ref().map(execution_from_row).transpose()
    }

    async fn update(&self, execution: &Execution) -> Result<(), StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE executions SET
                status = $2, input = $3, output = $4, current_step = $5,
                error_class = $6, error_summary = $7, cancel_requested = $8,
                started_at = $9, completed_at = $10, dlq_at = $11
            WHERE id = $1
            "#,
        )
        .bind(execution.id)
        .bind(execution.status.as_str())
        .bind(&execution.input)
        .bind(&execution.output)
        .bind(&execution.current_step)
        .bind(execution.error_class.map(|c| c.as_str()))
        .bind(&execution.error_summary)
        .bind(execution.cancel_requested)
        .bind(execution.started_at)
        .bind(execution.completed_at)
        .bind(execution.dlq_at)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::backend(format!(
                "update of unknown execution {}",
                execution.id
            )));
        }
        Ok(())
    }

    async fn insert_attempt(&self, attempt: StepAttempt) -> Result<bool, StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO step_attempts (
                execution_id, step_code, attempt_number, status, ready_at,
                started_at, completed_at, timeout_at, output, error_class,
                error_summary
            )
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11)
            ON CONFLICT (execution_id, step_code, attempt_number) DO NOTHING
            "#,
        )
        .bind(attempt.execution_id)
        .bind(&attempt.step_code)
        .bind(attempt.attempt_number as i32)
        .bind(attempt.status.as_str())
        .bind(attempt.ready_at)
        .bind(attempt.started_at)
        .bind(attempt.completed_at)
        .bind(attempt.timeout_at)
        .bind(&attempt.output)
        .bind(attempt.error_class.map(|c| c.as_str()))
        .bind(&attempt.error_summary)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(inserted.rows_affected() == 1)
    }

    async fn start_attempt(
        &self,
        execution_id: Uuid,
        step_code: &str,
        attempt_number: u32,
        started_at: DateTime<Utc>,
        timeout_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE step_attempts
            SET status = 'running', started_at = $4, timeout_at = $5
            WHERE execution_id = $1 AND step_code = $2 AND attempt_number = $3
              AND status = 'pending'
            "#,
        )
        .bind(execution_id)
        .bind(step_code)
        .bind(attempt_number as i32)
        .bind(started_at)
        .bind(timeout_at)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(updated.rows_affected() == 1)
    }

    async fn update_attempt(&self, attempt: &StepAttempt) -> Result<(), StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE step_attempts SET
                status = $4, ready_at = $5, started_at = $6, completed_at = $7,
                timeout_at = $8, output = $9, error_class = $10,
                error_summary = $11
            WHERE execution_id = $1 AND step_code = $2 AND attempt_number = $3
            "#,
        )
        .bind(attempt.execution_id)
        .bind(&attempt.step_code)
        .bind(attempt.attempt_number as i32)
        .bind(attempt.status.as_str())
        .bind(attempt.ready_at)
        .bind(attempt.started_at)
        .bind(attempt.completed_at)
        .bind(attempt.timeout_at)
        .bind(&attempt.output)
        .bind(attempt.error_class.map(|c| c.as_str()))
        .bind(&attempt.error_summary)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::backend("update of unknown attempt"));
        }
        Ok(())
    }

    async fn list_attempts(&self, execution_id: Uuid) -> Result<Vec<StepAttempt>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM step_attempts
            WHERE execution_id = $1
            ORDER BY step_code, attempt_number
            "#,
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?;
        rows.iter().map(attempt_from_row).collect()
    }

    async fn has_live_for_definition(&self, definition_id: Uuid) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM executions
                WHERE definition_id = $1
                  AND status IN ('pending', 'running', 'compensating')
            ) AS live
            "#,
        )
        .bind(definition_id)
        .fetch_one(&self.pool)
        .await
        .map_err(map_err)?;
        row.try_get("live").map_err(map_err)
    }
}
