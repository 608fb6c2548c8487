//! Dedupe ledger: the single source of truth for "already produced".
//!
//! Every successful materialization leaves exactly one row keyed by
//! `(rule_id, period_start)`. Claiming is a serializable write: of any
//! number of concurrent claims for the same key, exactly one wins; the rest
//! observe the surviving row. The claim-then-fulfill pattern plus this
//! uniqueness is what makes materialization exactly-once.
//!
//! Implementations back the contract with a unique constraint
//! (`INSERT .. ON CONFLICT DO NOTHING` or equivalent). [`InMemoryLedger`]
//! serializes through a single mutex and is the reference implementation
//! used by the test suite.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;
use crate::period::Period;

/// Reference to the object a target factory produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducedRef {
    pub kind: String,
    pub id: String,
}

/// A ledger row. `produced_ref` is absent between `claim` and `fulfill`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Generation {
    pub rule_id: Uuid,
    pub tenant_id: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub period_label: String,
    pub produced_ref: Option<ProducedRef>,
    pub generated_at: DateTime<Utc>,
}

/// Result of a claim.
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    /// This caller won the row and owns the materialization.
    Claimed,
    /// The period was already materialized; the row carries the produced
    /// reference.
    AlreadyDone(Generation),
    /// A claim exists but was never fulfilled (a crash between claim and
    /// fulfill). The generator applies the rule's recovery mode.
    PendingFulfillment(Generation),
}

/// Persistence contract for the dedupe ledger.
#[async_trait]
pub trait GenerationLedger: Send + Sync {
    /// Atomically insert a claim row for `(rule_id, period.start)`.
    ///
    /// Exactly one concurrent caller receives [`ClaimOutcome::Claimed`];
    /// every other caller observes the surviving row.
    async fn claim(
        &self,
        tenant_id: &str,
        rule_id: Uuid,
        period: &Period,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, StoreError>;

    /// Record the materialized target on a claimed row. Called only after
    /// the target factory has committed.
    async fn fulfill(
        &self,
        rule_id: Uuid,
        period_start: DateTime<Utc>,
        produced: ProducedRef,
    ) -> Result<(), StoreError>;

    /// Delete a claimed row so a later tick can retry the period.
    async fn release(&self, rule_id: Uuid, period_start: DateTime<Utc>) -> Result<(), StoreError>;

    /// All rows for a rule, ordered by period start.
    async fn list_for_rule(&self, rule_id: Uuid) -> Result<Vec<Generation>, StoreError>;

    /// Whether any claimed-but-unfulfilled row exists for the rule.
    async fn has_pending(&self, rule_id: Uuid) -> Result<bool, StoreError>;

    /// Remove every row owned by the rule. Callers check [`has_pending`]
    /// first; see the generator's delete operation.
    ///
    /// [`has_pending`]: GenerationLedger::has_pending
    async fn purge_rule(&self, rule_id: Uuid) -> Result<(), StoreError>;
}

// =============================================================================
// In-memory implementation
// =============================================================================

/// Mutex-serialized ledger for embedded use and tests.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    rows: Mutex<HashMap<(Uuid, DateTime<Utc>), Generation>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GenerationLedger for InMemoryLedger {
    async fn claim(
        &self,
        tenant_id: &str,
        rule_id: Uuid,
        period: &Period,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, StoreError> {
        let mut rows = self.rows.lock();
        match rows.get(&(rule_id, period.start)) {
            Some(existing) if existing.produced_ref.is_some() => {
                Ok(ClaimOutcome::AlreadyDone(existing.clone()))
            }
            Some(existing) => Ok(ClaimOutcome::PendingFulfillment(existing.clone())),
            None => {
                rows.insert(
                    (rule_id, period.start),
                    Generation {
                        rule_id,
                        tenant_id: tenant_id.to_string(),
                        period_start: period.start,
                        period_end: period.end,
                        period_label: period.label.clone(),
                        produced_ref: None,
                        generated_at: now,
                    },
                );
                Ok(ClaimOutcome::Claimed)
            }
        }
    }

    async fn fulfill(
        &self,
        rule_id: Uuid,
        period_start: DateTime<Utc>,
        produced: ProducedRef,
    ) -> Result<(), StoreError> {
        let mut rows = self.rows.lock();
        match rows.get_mut(&(rule_id, period_start)) {
            Some(row) => {
                row.produced_ref = Some(produced);
                Ok(())
            }
            None => Err(StoreError::backend(format!(
                "fulfill on unclaimed period {period_start} for rule {rule_id}"
            ))),
        }
    }

    async fn release(&self, rule_id: Uuid, period_start: DateTime<Utc>) -> Result<(), StoreError> {
        self.rows.lock().remove(&(rule_id, period_start));
        Ok(())
    }

    async fn list_for_rule(&self, rule_id: Uuid) -> Result<Vec<Generation>, StoreError> {
        let rows = self.rows.lock();
        let mut out: Vec<Generation> = rows
            .values()
            .filter(|g| g.rule_id == rule_id)
            .cloned()
            .collect();
        out.sort_by_key(|g| g.period_start);
        Ok(out)
    }

    async fn has_pending(&self, rule_id: Uuid) -> Result<bool, StoreError> {
        let rows = self.rows.lock();
        Ok(rows
            .values()
            .any(|g| g.rule_id == rule_id && g.produced_ref.is_none()))
    }

    async fn purge_rule(&self, rule_id: Uuid) -> Result<(), StoreError> {
        self.rows.lock().retain(|_, g| g.rule_id != rule_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn period(day: u32) -> Period {
        Period {
            start: Utc.with_ymd_and_hms(2026, 3, day, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2026, 3, day + 1, 0, 0, 0).unwrap(),
            label: format!("2026-03-{day:02}"),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_first_claim_wins() {
        let ledger = InMemoryLedger::new();
        let rule_id = Uuid::new_v4();
        let outcome = ledger.claim("t", rule_id, &period(1), now()).await.unwrap();
        assert!(matches!(outcome, ClaimOutcome::Claimed));
    }

    #[tokio::test]
    async fn test_second_claim_sees_pending_then_done() {
        let ledger = InMemoryLedger::new();
        let rule_id = Uuid::new_v4();
        let p = period(1);
        ledger.claim("t", rule_id, &p, now()).await.unwrap();

        let outcome = ledger.claim("t", rule_id, &p, now()).await.unwrap();
        assert!(matches!(outcome, ClaimOutcome::PendingFulfillment(_)));

        ledger
            .fulfill(
                rule_id,
                p.start,
                ProducedRef {
                    kind: "work_item".into(),
                    id: "w-1".into(),
                },
            )
            .await
            .unwrap();

        let outcome = ledger.claim("t", rule_id, &p, now()).await.unwrap();
        match outcome {
            ClaimOutcome::AlreadyDone(gen) => {
                assert_eq!(gen.produced_ref.unwrap().id, "w-1");
            }
            other => panic!("expected AlreadyDone, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_release_allows_reclaim() {
        let ledger = InMemoryLedger::new();
        let rule_id = Uuid::new_v4();
        let p = period(2);
        ledger.claim("t", rule_id, &p, now()).await.unwrap();
        ledger.release(rule_id, p.start).await.unwrap();
        let outcome = ledger.claim("t", rule_id, &p, now()).await.unwrap();
        assert!(matches!(outcome, ClaimOutcome::Claimed));
    }

    #[tokio::test]
    async fn test_has_pending_tracks_unfulfilled_rows() {
        let ledger = InMemoryLedger::new();
        let rule_id = Uuid::new_v4();
        let p = period(3);
        assert!(!ledger.has_pending(rule_id).await.unwrap());
        ledger.claim("t", rule_id, &p, now()).await.unwrap();
        assert!(ledger.has_pending(rule_id).await.unwrap());
        ledger
            .fulfill(
                rule_id,
                p.start,
                ProducedRef {
                    kind: "work_item".into(),
                    id: "w-2".into(),
                },
            )
            .await
            .unwrap();
        assert!(!ledger.has_pending(rule_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_fulfill_without_claim_is_backend_error() {
        let ledger = InMemoryLedger::new();
        let result = ledger
            .fulfill(
                Uuid::new_v4(),
                now(),
                ProducedRef {
                    kind: "work_item".into(),
                    id: "w-3".into(),
                },
            )
            .await;
        assert!(matches!(result, Err(StoreError::Backend(_))));
    }
}
