//! Rule store and generation ledger on PostgreSQL.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metronome::{
    AnchorKind, ClaimOutcome, Frequency, Generation, GenerationLedger, Period, ProducedRef,
    RecurrenceRule, RuleStatus, RuleStore, StoreError, TargetRef, UnfulfilledMode,
};
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

fn parse_frequency(s: &str) -> Result<Frequency, StoreError> {
    s.parse()
        .map_err(|_| StoreError::backend(format!("bad frequency in row: {s}")))
}

fn parse_anchor_kind(s: &str) -> Result<AnchorKind, StoreError> {
    match s {
        "calendar" => Ok(AnchorKind::Calendar),
        "fiscal" => Ok(AnchorKind::Fiscal),
        "custom" => Ok(AnchorKind::Custom),
        other => Err(StoreError::backend(format!("bad anchor_kind in row: {other}"))),
    }
}

fn anchor_kind_str(kind: AnchorKind) -> &'static str {
    match kind {
        AnchorKind::Calendar => "calendar",
        AnchorKind::Fiscal => "fiscal",
        AnchorKind::Custom => "custom",
    }
}

fn parse_status(s: &str) -> Result<RuleStatus, StoreError> {
    match s {
        "active" => Ok(RuleStatus::Active),
        "paused" => Ok(RuleStatus::Paused),
        "canceled" => Ok(RuleStatus::Canceled),
        other => Err(StoreError::backend(format!("bad status in row: {other}"))),
    }
}

fn parse_unfulfilled(s: &str) -> Result<UnfulfilledMode, StoreError> {
    match s {
        "release_and_reclaim" => Ok(UnfulfilledMode::ReleaseAndReclaim),
        "rerun_factory" => Ok(UnfulfilledMode::RerunFactory),
        other => Err(StoreError::backend(format!(
            "bad on_unfulfilled in row: {other}"
        ))),
    }
}

fn unfulfilled_str(mode: UnfulfilledMode) -> &'static str {
    match mode {
        UnfulfilledMode::ReleaseAndReclaim => "release_and_reclaim",
        UnfulfilledMode::RerunFactory => "rerun_factory",
    }
}

fn rule_from_row(row: &PgRow) -> Result<RecurrenceRule, StoreError> {
    let frequency: String = row.try_get("frequency").map_err(map_err)?;
    let anchor_kind: String = row.try_get("anchor_kind").map_err(map_err)?;
    let status: String = row.try_get("status").map_err(map_err)?;
    let on_unfulfilled: String = row.try_get("on_unfulfilled").map_err(map_err)?;
    let interval: i32 = row.try_get("interval").map_err(map_err)?;
    let fiscal: Option<i32> = row.try_get("fiscal_year_start_month").map_err(map_err)?;

    Ok(RecurrenceRule {
        id: row.try_get("id").map_err(map_err)?,
        tenant_id: row.try_get("tenant_id").map_err(map_err)?,
        code: row.try_get("code").map_err(map_err)?,
        target: TargetRef {
            kind: row.try_get("target_kind").map_err(map_err)?,
            id: row.try_get("target_id").map_err(map_err)?,
        },
        frequency: parse_frequency(&frequency)?,
        interval: interval as u32,
        anchor_kind: parse_anchor_kind(&anchor_kind)?,
        anchor_date: row.try_get("anchor_date").map_err(map_err)?,
        fiscal_year_start_month: fiscal.map(|m| m as u32),
        starts_at: row.try_get("starts_at").map_err(map_err)?,
        ends_at: row.try_get("ends_at").map_err(map_err)?,
        timezone: row.try_get("timezone").map_err(map_err)?,
        status: parse_status(&status)?,
        on_unfulfilled: parse_unfulfilled(&on_unfulfilled)?,
        created_at: row.try_get("created_at").map_err(map_err)?,
    })
}

/// Rule persistence on PostgreSQL.
#[derive(Clone)]
pub struct PgRuleStore {
    pool: PgPool,
}

impl PgRuleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RuleStore for PgRuleStore {
    async fn insert(&self, rule: RecurrenceRule) -> Result<RecurrenceRule, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO recurrence_rules (
                id, tenant_id, code, target_kind, target_id, frequency,
                interval, anchor_kind, anchor_date, fiscal_year_start_month,
                starts_at, ends_at, timezone, status, on_unfulfilled, created_at
            )
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16)
            RETURNING *
            "#,
        )
        .bind(rule.id)
        .bind(&rule.tenant_id)
        .bind(&rule.code)
        .bind(&rule.target.kind)
        .bind(&rule.target.id)
        .bind(rule.frequency.as_str())
        .bind(rule.interval as i32)
        .bind(anchor_kind_str(rule.anchor_kind))
        .bind(rule.anchor_date)
        .bind(rule.fiscal_year_start_month.map(|m| m as i32))
        .bind(rule.starts_at)
        .bind(rule.ends_at)
        .bind(&rule.timezone)
        .bind(rule.status.as_str())
        .bind(unfulfilled_str(rule.on_unfulfilled))
        .bind(rule.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(map_err)?;

        rule_from_row(&row)
    }

    async fn get(
        &self,
        tenant_id: &str,
        rule_id: Uuid,
    ) -> Result<Option<RecurrenceRule>, StoreError> {
        let row = sqlx::query("SELECT * FROM recurrence_rules WHERE id = $1 AND tenant_id = $2")
            .bind(rule_id)
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?;
        row.as_ref().map(rule_from_row).transpose()
    }

    async fn list_active(
        &self,
        tenant_id: &str,
        rule_ids: Option<&[Uuid]>,
    ) -> Result<Vec<RecurrenceRule>, StoreError> {
        let rows = match rule_ids {
            Some(ids) => {
                sqlx::query(
                    r#"
                    SELECT * FROM recurrence_rules
                    WHERE tenant_id = $1 AND status = 'active' AND id = ANY($2)
                    ORDER BY created_at
                    "#,
                )
                .bind(tenant_id)
                .bind(ids)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT * FROM recurrence_rules
                    WHERE tenant_id = $1 AND status = 'active'
                    ORDER BY created_at
                    "#,
                )
                .bind(tenant_id)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(map_err)?;

        rows.iter().map(rule_from_row).collect()
    }

    async fn set_status(
        &self,
        tenant_id: &str,
        rule_id: Uuid,
        status: RuleStatus,
    ) -> Result<Option<RecurrenceRule>, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE recurrence_rules SET status = $3
            WHERE id = $1 AND tenant_id = $2
            RETURNING *
            "#,
        )
        .bind(rule_id)
        .bind(tenant_id)
        .bind(status.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_err)?;
        row.as_ref().map(rule_from_row).transpose()
    }

    async fn delete(&self, tenant_id: &str, rule_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM recurrence_rules WHERE id = $1 AND tenant_id = $2")
            .bind(rule_id)
            .bind(tenant_id)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(())
    }
}

// =============================================================================
// Ledger
// =============================================================================

fn generation_from_row(row: &PgRow) -> Result<Generation, StoreError> {
    let produced_kind: Option<String> = row.try_get("produced_kind").map_err(map_err)?;
    let produced_id: Option<String> = row.try_get("produced_id").map_err(map_err)?;
    Ok(Generation {
        rule_id: row.try_get("rule_id").map_err(map_err)?,
        tenant_id: row.try_get("tenant_id").map_err(map_err)?,
        period_start: row.try_get("period_start").map_err(map_err)?,
        period_end: row.try_get("period_end").map_err(map_err)?,
        period_label: row.try_get("period_label").map_err(map_err)?,
        produced_ref: match (produced_kind, produced_id) {
            (Some(kind), Some(id)) => Some(ProducedRef { kind, id }),
            _ => None,
        },
        generated_at: row.try_get("generated_at").map_err(map_err)?,
    })
}

/// Generation ledger on PostgreSQL. The `(rule_id, period_start)` primary
/// key arbitrates claims.
#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl GenerationLedger for PgLedger {
    async fn claim(
        &self,
        tenant_id: &str,
        rule_id: Uuid,
        period: &Period,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, StoreError> {
        // A release can race between our failed insert and the read, so
        // the insert-then-read pair loops.
        for _ in 0..3 {
            let inserted = sqlx::query(
                r#"
                INSERT INTO recurrence_generations (
                    rule_id, tenant_id, period_start, period_end,
                    period_label, generated_at
                )
                VALUES ($1,$2,$3,$4,$5,$6)
                ON CONFLICT (rule_id, period_start) DO NOTHING
                "#,
            )
            .bind(rule_id)
            .bind(tenant_id)
            .bind(period.start)
            .bind(period.end)
            .bind(&period.label)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;

            if inserted.rows_affected() == 1 {
                return Ok(ClaimOutcome::Claimed);
            }

            let row = sqlx::query(
                "SELECT * FROM recurrence_generations WHERE rule_id = $1 AND period_start = $2",
            )
            .bind(rule_id)
            .bind(period.start)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?;

            if let Some(row) = row {
                let generation = generation_from_row(&row)?;
                return Ok(if generation.produced_ref.is_some() {
                    ClaimOutcome::AlreadyDone(generation)
                } else {
                    ClaimOutcome::PendingFulfillment(generation)
                });
            }
        }
        Err(StoreError::backend(
            "claim raced with releases three times in a row",
        ))
    }

    async fn fulfill(
        &self,
        rule_id: Uuid,
        period_start: DateTime<Utc>,
        produced: ProducedRef,
    ) -> Result<(), StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE recurrence_generations
            SET produced_kind = $3, produced_id = $4
            WHERE rule_id = $1 AND period_start = $2
            "#,
        )
        .bind(rule_id)
        .bind(period_start)
        .bind(&produced.kind)
        .bind(&produced.id)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::backend(format!(
                "fulfill on unclaimed period {period_start} for rule {rule_id}"
            )));
        }
        Ok(())
    }

    async fn release(&self, rule_id: Uuid, period_start: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query(
            "DELETE FROM recurrence_generations WHERE rule_id = $1 AND period_start = $2",
        )
        .bind(rule_id)
        .bind(period_start)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn list_for_rule(&self, rule_id: Uuid) -> Result<Vec<Generation>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM recurrence_generations WHERE rule_id = $1 ORDER BY period_start",
        )
        .bind(rule_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?;
        rows.iter().map(generation_from_row).collect()
    }

    async fn has_pending(&self, rule_id: Uuid) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM recurrence_generations
                WHERE rule_id = $1 AND produced_kind IS NULL
            ) AS pending
            "#,
        )
        .bind(rule_id)
        .fetch_one(&self.pool)
        .await
        .map_err(map_err)?;
        row.try_get("pending").map_err(map_err)
    }

    async fn purge_rule(&self, rule_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM recurrence_generations WHERE rule_id = $1")
            .bind(rule_id)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(())
    }
}
