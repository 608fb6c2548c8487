//! DLQ store on PostgreSQL. The unique `execution_id` column keeps the
//! one-entry-per-execution invariant.

use async_trait::async_trait;
use baton::{DlqEntry, DlqReason, DlqStore, ErrorClass, StoreError};
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

fn entry_from_row(row: &PgRow) -> Result<DlqEntry, StoreError> {
    let reason: String = row.try_get("reason").map_err(map_err)?;
    let error_class: String = row.try_get("error_class").map_err(map_err)?;
    Ok(DlqEntry {
        id: row.try_get("id").map_err(map_err)?,
        tenant_id: row.try_get("tenant_id").map_err(map_err)?,
        execution_id: row.try_get("execution_id").map_err(map_err)?,
        step_code: row.try_get("step_code").map_err(map_err)?,
        reason: reason
            .parse::<DlqReason>()
            .map_err(|e| StoreError::backend(format!("bad reason in row: {e}")))?,
        error_class: error_class
            .parse::<ErrorClass>()
            .map_err(|e| StoreError::backend(format!("bad error class in row: {e}")))?,
        error_summary: row.try_get("error_summary").map_err(map_err)?,
        metadata: row.try_get("metadata").map_err(map_err)?,
        created_at: row.try_get("created_at").map_err(map_err)?,
        reprocessed_at: row.try_get("reprocessed_at").map_err(map_err)?,
        reprocessed_by: row.try_get("reprocessed_by").map_err(map_err)?,
        reprocess_outcome: row.try_get("reprocess_outcome").map_err(map_err)?,
    })
}

/// DLQ persistence on PostgreSQL.
#[derive(Clone)]
pub struct PgDlqStore {
    pool: PgPool,
}

impl PgDlqStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DlqStore for PgDlqStore {
    async fn insert_once(&self, entry: DlqEntry) -> Result<DlqEntry, StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO dlq_entries (
                id, tenant_id, execution_id, step_code, reason, error_class,
                error_summary, metadata, created_at
            )
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)
            ON CONFLICT (execution_id) DO NOTHING
            "#,
        )
        .bind(entry.id)
        .bind(&entry.tenant_id)
        .bind(entry.execution_id)
        .bind(&entry.step_code)
        .bind(entry.reason.as_str())
        .bind(entry.error_class.as_str())
        .bind(&entry.error_summary)
        .bind(&entry.metadata)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;

        if inserted.rows_affected() == 1 {
            return Ok(entry);
        }
        self.for_execution(entry.execution_id)
            .await?
            .ok_or_else(|| StoreError::backend("dlq insert conflicted with a vanished row"))
    }

    async fn get(&self, tenant_id: &str, entry_id: Uuid) -> Result<Option<DlqEntry>, StoreError> {
        let row = sqlx::query("SELECT * FROM dlq_entries WHERE id = $1 AND tenant_id = $2")
            .bind(entry_id)
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?;
        row.as_ref().map(entry_from_row).transpose()
    }

    async fn for_execution(&self, execution_id: Uuid) -> Result<Option<DlqEntry>, StoreError> {
        let row = sqlx::query("SELECT * FROM dlq_entries WHERE execution_id = $1")
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?;
        row.as_ref().map(entry_from_row).transpose()
    }

    async fn list(
        &self,
        tenant_id: &str,
        reason: Option<DlqReason>,
    ) -> Result<Vec<DlqEntry>, StoreError> {
        let rows = match reason {
            Some(reason) => {
                sqlx::query(
                    r#"
                    SELECT * FROM dlq_entries
                    WHERE tenant_id = $1 AND reason = $2
                    ORDER BY created_at DESC
                    "#,
                )
                .bind(tenant_id)
                .bind(reason.as_str())
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT * FROM dlq_entries WHERE tenant_id = $1 ORDER BY created_at DESC",
                )
                .bind(tenant_id)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(map_err)?;
        rows.iter().map(entry_from_row).collect()
    }

    async fn update(&self, entry: &DlqEntry) -> Result<(), StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE dlq_entries SET
                reason = $2, error_class = $3, error_summary = $4,
                metadata = $5, reprocessed_at = $6, reprocessed_by = $7,
                reprocess_outcome = $8
            WHERE id = $1
            "#,
        )
        .bind(entry.id)
        .bind(entry.reason.as_str())
        .bind(entry.error_class.as_str())
        .bind(&entry.error_summary)
        .bind(&entry.metadata)
        .bind(entry.reprocessed_at)
        .bind(&entry.reprocessed_by)
        .bind(&entry.reprocess_outcome)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::backend("update of unknown dlq entry"));
        }
        Ok(())
    }
}
