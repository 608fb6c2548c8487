//! Recurrence generator: drives the claim, materialize, fulfill pipeline.
//!
//! The generator composes the period computer, the dedupe ledger and a
//! host-supplied target factory. For every period in a window it runs
//!
//! ```text
//! claim ──claimed──► factory ──ok──► fulfill
//!   │                   │
//!   │                   └──err──► release   (retried on a later tick)
//!   └──already done──► skip
//! ```
//!
//! Exactly-once materialization follows from the ledger's uniqueness
//! constraint plus this ordering; the generator itself holds no state
//! between calls and any number of workers may tick concurrently.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{Error, StoreError};
use crate::ledger::{ClaimOutcome, GenerationLedger, ProducedRef};
use crate::period::{periods, Period};
use crate::rule::{RecurrenceRule, RuleStatus, UnfulfilledMode};
use crate::store::RuleStore;

// =============================================================================
// Target factory
// =============================================================================

/// Host-supplied callback that produces the downstream object for a period.
///
/// The engine passes the exact period boundaries; the factory is expected
/// to create the object atomically. Factories registered for a rule's
/// `target.kind` under [`UnfulfilledMode::RerunFactory`] must additionally
/// be idempotent keyed by `(rule_id, period_start)`.
#[async_trait::async_trait]
pub trait TargetFactory: Send + Sync {
    async fn materialize(
        &self,
        rule: &RecurrenceRule,
        period: &Period,
    ) -> anyhow::Result<ProducedRef>;
}

/// Registry mapping a rule's `target.kind` to its factory.
#[derive(Default)]
pub struct FactoryRegistry {
    factories: HashMap<String, Arc<dyn TargetFactory>>,
}

impl FactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for a target kind.
    ///
    /// # Panics
    ///
    /// Panics if a factory is already registered for this kind; wiring is
    /// a startup concern and duplicate registration is a bug.
    pub fn register(&mut self, target_kind: impl Into<String>, factory: Arc<dyn TargetFactory>) {
        let kind = target_kind.into();
        if self.factories.contains_key(&kind) {
            panic!("factory already registered for target kind: {kind}");
        }
        self.factories.insert(kind, factory);
    }

    pub fn lookup(&self, target_kind: &str) -> Option<Arc<dyn TargetFactory>> {
        self.factories.get(target_kind).cloned()
    }
}

impl std::fmt::Debug for FactoryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FactoryRegistry")
            .field("kinds", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

// =============================================================================
// Reports
// =============================================================================

/// Per-rule counts from a tick or backfill.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RuleReport {
    pub rule_id: Uuid,
    pub examined: u64,
    pub skipped_already_done: u64,
    pub produced: u64,
    pub failed: u64,
}

/// Counts for every rule a generator pass examined.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GenerateReport {
    pub rules: Vec<RuleReport>,
}

impl GenerateReport {
    /// Sum of `(examined, skipped_already_done, produced, failed)` across
    /// rules.
    pub fn totals(&self) -> (u64, u64, u64, u64) {
        self.rules.iter().fold((0, 0, 0, 0), |acc, r| {
            (
                acc.0 + r.examined,
                acc.1 + r.skipped_already_done,
                acc.2 + r.produced,
                acc.3 + r.failed,
            )
        })
    }
}

// =============================================================================
// Generator
// =============================================================================

/// How long a claimed-but-unfulfilled row is presumed to belong to a live
/// worker before recovery kicks in.
fn default_stale_claim_after() -> Duration {
    Duration::minutes(15)
}

/// The recurrence engine's service facade.
pub struct Generator {
    clock: Arc<dyn Clock>,
    rules: Arc<dyn RuleStore>,
    ledger: Arc<dyn GenerationLedger>,
    factories: FactoryRegistry,
    stale_claim_after: Duration,
}

impl Generator {
    pub fn new(
        clock: Arc<dyn Clock>,
        rules: Arc<dyn RuleStore>,
        ledger: Arc<dyn GenerationLedger>,
        factories: FactoryRegistry,
    ) -> Self {
        Self {
            clock,
            rules,
            ledger,
            factories,
            stale_claim_after: default_stale_claim_after(),
        }
    }

    /// Override the age at which an unfulfilled claim is considered
    /// abandoned rather than in flight on another worker.
    pub fn with_stale_claim_after(mut self, age: Duration) -> Self {
        self.stale_claim_after = age;
        self
    }

    /// Validate and persist a new rule. Invalid rules never reach the
    /// store.
    pub async fn create_rule(&self, rule: RecurrenceRule) -> Result<RecurrenceRule, Error> {
        rule.validate()?;
        match self.rules.insert(rule).await {
            Ok(rule) => Ok(rule),
            Err(StoreError::Conflict) => Err(Error::Conflict(
                "a rule with this code already exists for the tenant".into(),
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// Materialize every missing period with `start` in `[now, now+horizon]`
    /// for the tenant's active rules (optionally a subset).
    pub async fn tick(
        &self,
        tenant_id: &str,
        horizon: Duration,
        rule_ids: Option<&[Uuid]>,
    ) -> Result<GenerateReport, Error> {
        let now = self.clock.now();
        let upper = now + horizon;
        let rules = self.rules.list_active(tenant_id, rule_ids).await?;

        let mut report = GenerateReport::default();
        for rule in rules {
            let window = match periods(&rule, now) {
                Ok(iter) => iter.take_while(|p| p.start <= upper).collect::<Vec<_>>(),
                Err(e) => {
                    // Creation-time validation should make this unreachable;
                    // a rule that fails here is stored data drift.
                    warn!(rule_id = %rule.id, error = %e, "skipping unenumerable rule");
                    continue;
                }
            };
            let rule_report = self.run_pipeline(&rule, &window, now).await?;
            report.rules.push(rule_report);
        }
        Ok(report)
    }

    /// Materialize every missing period from the rule's earliest valid
    /// start up to `min(until, now)`. Idempotent by construction.
    pub async fn backfill(
        &self,
        tenant_id: &str,
        rule_id: Uuid,
        until: DateTime<Utc>,
    ) -> Result<GenerateReport, Error> {
        let now = self.clock.now();
        let rule = self
            .rules
            .get(tenant_id, rule_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("rule {rule_id}")))?;
        if rule.status == RuleStatus::Canceled {
            return Err(Error::Conflict("rule is canceled".into()));
        }

        let upper = until.min(now);
        let window = periods(&rule, rule.starts_at)?
            .take_while(|p| p.start <= upper)
            .collect::<Vec<_>>();
        let rule_report = self.run_pipeline(&rule, &window, now).await?;
        Ok(GenerateReport {
            rules: vec![rule_report],
        })
    }

    pub async fn pause(&self, tenant_id: &str, rule_id: Uuid) -> Result<(), Error> {
        self.transition(tenant_id, rule_id, RuleStatus::Paused, &[RuleStatus::Active])
            .await
    }

    pub async fn resume(&self, tenant_id: &str, rule_id: Uuid) -> Result<(), Error> {
        self.transition(tenant_id, rule_id, RuleStatus::Active, &[RuleStatus::Paused])
            .await
    }

    /// Cancel a rule: refuses future claims but retains the ledger.
    pub async fn cancel(&self, tenant_id: &str, rule_id: Uuid) -> Result<(), Error> {
        self.transition(
            tenant_id,
            rule_id,
            RuleStatus::Canceled,
            &[RuleStatus::Active, RuleStatus::Paused],
        )
        .await
    }

    /// Delete a rule and cascade its ledger rows. Refused while a claimed
    /// period awaits fulfillment.
    pub async fn delete_rule(&self, tenant_id: &str, rule_id: Uuid) -> Result<(), Error> {
        let rule = self
            .rules
            .get(tenant_id, rule_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("rule {rule_id}")))?;
        if self.ledger.has_pending(rule.id).await? {
            return Err(Error::Conflict(
                "a generation is in flight; retry after it settles".into(),
            ));
        }
        self.ledger.purge_rule(rule.id).await?;
        self.rules.delete(tenant_id, rule_id).await?;
        Ok(())
    }

    async fn transition(
        &self,
        tenant_id: &str,
        rule_id: Uuid,
        to: RuleStatus,
        allowed_from: &[RuleStatus],
    ) -> Result<(), Error> {
        let rule = self
            .rules
            .get(tenant_id, rule_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("rule {rule_id}")))?;
        if !allowed_from.contains(&rule.status) {
            return Err(Error::Conflict(format!(
                "cannot move rule from {} to {}",
                rule.status.as_str(),
                to.as_str()
            )));
        }
        self.rules.set_status(tenant_id, rule_id, to).await?;
        Ok(())
    }

    // =========================================================================
    // Pipeline
    // =========================================================================

    async fn run_pipeline(
        &self,
        rule: &RecurrenceRule,
        window: &[Period],
        now: DateTime<Utc>,
    ) -> Result<RuleReport, Error> {
        let mut report = RuleReport {
            rule_id: rule.id,
            ..RuleReport::default()
        };

        for period in window {
            report.examined += 1;
            match self
                .ledger
                .claim(&rule.tenant_id, rule.id, period, now)
                .await?
            {
                ClaimOutcome::AlreadyDone(_) => report.skipped_already_done += 1,
                ClaimOutcome::Claimed => {
                    self.materialize_claimed(rule, period, &mut report).await?;
                }
                ClaimOutcome::PendingFulfillment(existing) => {
                    if now - existing.generated_at < self.stale_claim_after {
                        // Another live worker owns the claim.
                        report.skipped_already_done += 1;
                    } else {
                        self.recover_pending(rule, period, &mut report).await?;
                    }
                }
            }
        }

        info!(
            rule_id = %rule.id,
            examined = report.examined,
            produced = report.produced,
            skipped = report.skipped_already_done,
            failed = report.failed,
            "generator pass complete"
        );
        Ok(report)
    }

    /// Run the factory for a period this worker owns.
    async fn materialize_claimed(
        &self,
        rule: &RecurrenceRule,
        period: &Period,
        report: &mut RuleReport,
    ) -> Result<(), Error> {
        let Some(factory) = self.factories.lookup(&rule.target.kind) else {
            warn!(
                rule_id = %rule.id,
                target_kind = %rule.target.kind,
                "no factory registered; releasing claim"
            );
            self.ledger.release(rule.id, period.start).await?;
            report.failed += 1;
            return Ok(());
        };

        match factory.materialize(rule, period).await {
            Ok(produced) => {
                self.ledger.fulfill(rule.id, period.start, produced).await?;
                report.produced += 1;
            }
            Err(e) => {
                warn!(
                    rule_id = %rule.id,
                    period = %period.label,
                    error = %e,
                    "factory failed; releasing claim for a later tick"
                );
                self.ledger.release(rule.id, period.start).await?;
                report.failed += 1;
            }
        }
        Ok(())
    }

    /// Apply the rule's recovery mode to a claim that was never fulfilled.
    async fn recover_pending(
        &self,
        rule: &RecurrenceRule,
        period: &Period,
        report: &mut RuleReport,
    ) -> Result<(), Error> {
        match rule.on_unfulfilled {
            UnfulfilledMode::RerunFactory => {
                let Some(factory) = self.factories.lookup(&rule.target.kind) else {
                    report.failed += 1;
                    return Ok(());
                };
                match factory.materialize(rule, period).await {
                    Ok(produced) => {
                        self.ledger.fulfill(rule.id, period.start, produced).await?;
                        report.produced += 1;
                    }
                    Err(e) => {
                        // The row stays pending; the factory is idempotent
                        // in this mode so the next tick simply tries again.
                        warn!(rule_id = %rule.id, period = %period.label, error = %e,
                              "idempotent factory re-run failed");
                        report.failed += 1;
                    }
                }
            }
            UnfulfilledMode::ReleaseAndReclaim => {
                self.ledger.release(rule.id, period.start).await?;
                let now = self.clock.now();
                match self
                    .ledger
                    .claim(&rule.tenant_id, rule.id, period, now)
                    .await?
                {
                    ClaimOutcome::Claimed => {
                        self.materialize_claimed(rule, period, report).await?;
                    }
                    // Another worker got there between release and claim.
                    ClaimOutcome::AlreadyDone(_) | ClaimOutcome::PendingFulfillment(_) => {
                        report.skipped_already_done += 1;
                    }
                }
            }
        }
        Ok(())
    }
}
