//! Workflow definition store on PostgreSQL.
//!
//! The step list, policies, schemas and output mapping persist as one
//! JSONB document; the row carries the identity and versioning columns
//! the uniqueness constraints live on.

use std::collections::BTreeMap;

use async_trait::async_trait;
use baton::{
    DefinitionPolicies, DefinitionStatus, DefinitionStore, Schema, StepDescriptor, StoreError,
    WorkflowDefinition,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
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

#[derive(Serialize, Deserialize)]
struct DefinitionDocument {
    steps: Vec<StepDescriptor>,
    policies: DefinitionPolicies,
    input_schema: Option<Value>,
    output_schema: Option<Value>,
    output_mapping: BTreeMap<String, String>,
}

fn parse_status(s: &str) -> Result<DefinitionStatus, StoreError> {
    match s {
        "draft" => Ok(DefinitionStatus::Draft),
        "published" => Ok(DefinitionStatus::Published),
        "deprecated" => Ok(DefinitionStatus::Deprecated),
        other => Err(StoreError::backend(format!("bad status in row: {other}"))),
    }
}

fn definition_from_row(row: &PgRow) -> Result<WorkflowDefinition, StoreError> {
    let status: String = row.try_get("status").map_err(map_err)?;
    let document: Value = row.try_get("document").map_err(map_err)?;
    let document: DefinitionDocument = serde_json::from_value(document)
        .map_err(|e| StoreError::backend(format!("bad definition document: {e}")))?;

    let parse_schema = |value: &Option<Value>| -> Result<Option<Schema>, StoreError> {
        value
            .as_ref()
            .map(Schema::parse)
            .transpose()
            .map_err(|e| StoreError::backend(format!("bad schema in document: {e}")))
    };

    Ok(WorkflowDefinition {
        id: row.try_get("id").map_err(map_err)?,
        tenant_id: row.try_get("tenant_id").map_err(map_err)?,
        code: row.try_get("code").map_err(map_err)?,
        version: row.try_get("version").map_err(map_err)?,
        status: parse_status(&status)?,
        input_schema: parse_schema(&document.input_schema)?,
        output_schema: parse_schema(&document.output_schema)?,
        steps: document.steps,
        policies: document.policies,
        output_mapping: document.output_mapping,
        created_at: row.try_get("created_at").map_err(map_err)?,
        published_at: row.try_get("published_at").map_err(map_err)?,
    })
}

fn document_of(definition: &WorkflowDefinition) -> Result<Value, StoreError> {
    let document = DefinitionDocument {
        steps: definition.steps.clone(),
        policies: definition.policies.clone(),
        input_schema: definition.input_schema.as_ref().map(|s| s.source().clone()),
        output_schema: definition.output_schema.as_ref().map(|s| s.source().clone()),
        output_mapping: definition.output_mapping.clone(),
    };
    serde_json::to_value(&document)
        .map_err(|e| StoreError::backend(format!("definition does not serialize: {e}")))
}

/// Definition persistence on PostgreSQL.
#[derive(Clone)]
pub struct PgDefinitionStore {
    pool: PgPool,
}

impl PgDefinitionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DefinitionStore for PgDefinitionStore {
    async fn insert(&self, definition: WorkflowDefinition) -> Result<(), StoreError> {
        let document = document_of(&definition)?;
        sqlx::query(
            r#"
            INSERT INTO workflow_definitions (
                id, tenant_id, code, version, status, document,
                created_at, published_at
            )
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8)
            "#,
        )
        .bind(definition.id)
        .bind(&definition.tenant_id)
        .bind(&definition.code)
        .bind(definition.version)
        .bind(definition.status.as_str())
        .bind(document)
        .bind(definition.created_at)
        .bind(definition.published_at)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn latest_published(
        &self,
        tenant_id: &str,
        code: &str,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM workflow_definitions
            WHERE tenant_id = $1 AND code = $2 AND status = 'published'
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(tenant_id)
        .bind(code)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_err)?;
        row.as_ref().map(definition_from_row).transpose()
    }

    async fn get(
        &self,
        tenant_id: &str,
        definition_id: Uuid,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        let row =
            sqlx::query("SELECT * FROM workflow_definitions WHERE id = $1 AND tenant_id = $2")
                .bind(definition_id)
                .bind(tenant_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_err)?;
        row.as_ref().map(definition_from_row).transpose()
    }

    async fn next_version(&self, tenant_id: &str, code: &str) -> Result<i32, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(MAX(version), 0) + 1 AS next
            FROM workflow_definitions
            WHERE tenant_id = $1 AND code = $2
            "#,
        )
        .bind(tenant_id)
        .bind(code)
        .fetch_one(&self.pool)
        .await
        .map_err(map_err)?;
        row.try_get("next").map_err(map_err)
    }

    async fn deprecate_published(&self, tenant_id: &str, code: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE workflow_definitions SET status = 'deprecated'
            WHERE tenant_id = $1 AND code = $2 AND status = 'published'
            "#,
        )
        .bind(tenant_id)
        .bind(code)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn delete(&self, tenant_id: &str, definition_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM workflow_definitions WHERE id = $1 AND tenant_id = $2")
            .bind(definition_id)
            .bind(tenant_id)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(())
    }
}
