//! Rule persistence contract and the in-memory reference store.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::StoreError;
use crate::rule::{RecurrenceRule, RuleStatus};

/// Persistence contract for recurrence rules.
///
/// Every query is tenant-scoped; a store must never return another
/// tenant's rows.
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Insert a rule. Fails with [`StoreError::Conflict`] when the tenant
    /// already has a rule with the same non-empty code.
    async fn insert(&self, rule: RecurrenceRule) -> Result<RecurrenceRule, StoreError>;

    async fn get(&self, tenant_id: &str, rule_id: Uuid)
        -> Result<Option<RecurrenceRule>, StoreError>;

    /// Active rules for a tenant, optionally restricted to a subset of ids.
    async fn list_active(
        &self,
        tenant_id: &str,
        rule_ids: Option<&[Uuid]>,
    ) -> Result<Vec<RecurrenceRule>, StoreError>;

    /// Update a rule's status, returning the updated row.
    async fn set_status(
        &self,
        tenant_id: &str,
        rule_id: Uuid,
        status: RuleStatus,
    ) -> Result<Option<RecurrenceRule>, StoreError>;

    /// Remove the rule row. Ledger cascade and the in-flight check live in
    /// the generator's delete operation, not here.
    async fn delete(&self, tenant_id: &str, rule_id: Uuid) -> Result<(), StoreError>;
}

/// Mutex-serialized rule store for embedded use and tests.
#[derive(Debug, Default)]
pub struct InMemoryRuleStore {
    rules: Mutex<HashMap<Uuid, RecurrenceRule>>,
}

impl InMemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RuleStore for InMemoryRuleStore {
    async fn insert(&self, rule: RecurrenceRule) -> Result<RecurrenceRule, StoreError> {
        let mut rules = self.rules.lock();
        if let Some(code) = rule.code.as_deref().filter(|c| !c.is_empty()) {
            let duplicate = rules.values().any(|r| {
                r.tenant_id == rule.tenant_id && r.code.as_deref() == Some(code) && r.id != rule.id
            });
            if duplicate {
                return Err(StoreError::Conflict);
            }
        }
        if rules.contains_key(&rule.id) {
            return Err(StoreError::Conflict);
        }
        rules.insert(rule.id, rule.clone());
        Ok(rule)
    }

    async fn get(
        &self,
        tenant_id: &str,
        rule_id: Uuid,
    ) -> Result<Option<RecurrenceRule>, StoreError> {
        let rules = self.rules.lock();
        Ok(rules
            .get(&rule_id)
            .filter(|r| r.tenant_id == tenant_id)
            .cloned())
    }

    async fn list_active(
        &self,
        tenant_id: &str,
        rule_ids: Option<&[Uuid]>,
    ) -> Result<Vec<RecurrenceRule>, StoreError> {
        let rules = self.rules.lock();
        let mut out: Vec<RecurrenceRule> = rules
            .values()
            .filter(|r| r.tenant_id == tenant_id && r.status == RuleStatus::Active)
            .filter(|r| rule_ids.map_or(true, |ids| ids.contains(&r.id)))
            .cloned()
            .collect();
        out.sort_by_key(|r| r.created_at);
        Ok(out)
    }

    async fn set_status(
        &self,
        tenant_id: &str,
        rule_id: Uuid,
        status: RuleStatus,
    ) -> Result<Option<RecurrenceRule>, StoreError> {
        let mut rules = self.rules.lock();
        match rules.get_mut(&rule_id) {
            Some(rule) if rule.tenant_id == tenant_id => {
                rule.status = status;
                Ok(Some(rule.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn delete(&self, tenant_id: &str, rule_id: Uuid) -> Result<(), StoreError> {
        let mut rules = self.rules.lock();
        if let Some(rule) = rules.get(&rule_id) {
            if rule.tenant_id == tenant_id {
                rules.remove(&rule_id);
            }
        }
        Ok(())
    }
}
