//! Persistence contracts for definitions, executions and the DLQ, plus
//! the in-memory reference implementations.
//!
//! Every linearizability obligation the engine has is discharged through
//! one of three uniqueness primitives here:
//!
//! - `ExecutionStore::insert` on `(tenant_id, definition_code,
//!   idempotency_key)`: the loser reads and returns the winner;
//! - `ExecutionStore::insert_attempt` / `start_attempt` on
//!   `(execution_id, step_code, attempt_number)`: at most one worker moves
//!   a given attempt into `running`;
//! - `DlqStore::insert_once` on `execution_id`: one entry per execution.
//!
//! The in-memory stores serialize through a single mutex per store, which
//! trivially satisfies the contracts; SQL adapters use unique constraints.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::definition::{DefinitionStatus, WorkflowDefinition};
use crate::dlq::{DlqEntry, DlqReason};
use crate::error::StoreError;
use crate::execution::{AttemptStatus, Execution, ExecutionStatus, StepAttempt};

// =============================================================================
// Definition store
// =============================================================================

#[async_trait]
pub trait DefinitionStore: Send + Sync {
    /// Insert a definition row. Enforces unique `(tenant_id, code,
    /// version)`; a row id can never be replaced, so published rows are
    /// immutable.
    async fn insert(&self, definition: WorkflowDefinition) -> Result<(), StoreError>;

    /// The highest published version for a code, if any.
    async fn latest_published(
        &self,
        tenant_id: &str,
        code: &str,
    ) -> Result<Option<WorkflowDefinition>, StoreError>;

    async fn get(
        &self,
        tenant_id: &str,
        definition_id: Uuid,
    ) -> Result<Option<WorkflowDefinition>, StoreError>;

    /// Next version number for a code (1 when none exist).
    async fn next_version(&self, tenant_id: &str, code: &str) -> Result<i32, StoreError>;

    /// Flip currently published versions of a code to deprecated.
    async fn deprecate_published(&self, tenant_id: &str, code: &str) -> Result<(), StoreError>;

    /// Remove a definition row. The live-execution check lives in the
    /// orchestrator's delete operation, not here.
    async fn delete(&self, tenant_id: &str, definition_id: Uuid) -> Result<(), StoreError>;
}

/// Mutex-serialized definition store.
#[derive(Debug, Default)]
pub struct InMemoryDefinitionStore {
    definitions: Mutex<Vec<WorkflowDefinition>>,
}

impl InMemoryDefinitionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DefinitionStore for InMemoryDefinitionStore {
    async fn insert(&self, definition: WorkflowDefinition) -> Result<(), StoreError> {
        let mut definitions = self.definitions.lock();
        let clash = definitions.iter().any(|d| {
            d.id == definition.id
                || (d.tenant_id == definition.tenant_id
                    && d.code == definition.code
                    && d.version == definition.version)
        });
        if clash {
            return Err(StoreError::Conflict);
        }
        definitions.push(definition);
        Ok(())
    }

    async fn latest_published(
        &self,
        tenant_id: &str,
        code: &str,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        let definitions = self.definitions.lock();
        Ok(definitions
            .iter()
            .filter(|d| {
                d.tenant_id == tenant_id
                    && d.code == code
                    && d.status == DefinitionStatus::Published
            })
            .max_by_key(|d| d.version)
            .cloned())
    }

    async fn get(
        &self,
        tenant_id: &str,
        definition_id: Uuid,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        let definitions = self.definitions.lock();
        Ok(definitions
            .iter()
            .find(|d| d.id == definition_id && d.tenant_id == tenant_id)
            .cloned())
    }

    async fn next_version(&self, tenant_id: &str, code: &str) -> Result<i32, StoreError> {
        let definitions = self.definitions.lock();
        Ok(definitions
            .iter()
            .filter(|d| d.tenant_id == tenant_id && d.code == code)
            .map(|d| d.version)
            .max()
            .unwrap_or(0)
            + 1)
    }

    async fn deprecate_published(&self, tenant_id: &str, code: &str) -> Result<(), StoreError> {
        let mut definitions = self.definitions.lock();
        for d in definitions.iter_mut() {
            if d.tenant_id == tenant_id && d.code == code && d.status == DefinitionStatus::Published
            {
                d.status = DefinitionStatus::Deprecated;
            }
        }
        Ok(())
    }

    async fn delete(&self, tenant_id: &str, definition_id: Uuid) -> Result<(), StoreError> {
        let mut definitions = self.definitions.lock();
        definitions.retain(|d| !(d.id == definition_id && d.tenant_id == tenant_id));
        Ok(())
    }
}

// =============================================================================
// Execution store
// =============================================================================

/// Outcome of an idempotent execution insert.
#[derive(Debug, Clone)]
pub enum InsertExecution {
    Inserted(Execution),
    /// The idempotency key already has a row; this is it, unchanged.
    Replayed(Execution),
}

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Insert unless `(tenant_id, definition_code, idempotency_key)`
    /// already exists; the loser reads and returns the winner.
    async fn insert(&self, execution: Execution) -> Result<InsertExecution, StoreError>;

    async fn get(&self, execution_id: Uuid) -> Result<Option<Execution>, StoreError>;

    /// Replace the execution row.
    async fn update(&self, execution: &Execution) -> Result<(), StoreError>;

    /// Insert an attempt row; `false` when the unique key
    /// `(execution_id, step_code, attempt_number)` already exists.
    async fn insert_attempt(&self, attempt: StepAttempt) -> Result<bool, StoreError>;

    /// Atomically move a pending attempt to running; `false` when another
    /// worker won the transition.
    async fn start_attempt(
        &self,
        execution_id: Uuid,
        step_code: &str,
        attempt_number: u32,
        started_at: DateTime<Utc>,
        timeout_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Replace an attempt row.
    async fn update_attempt(&self, attempt: &StepAttempt) -> Result<(), StoreError>;

    /// Attempts for an execution, ordered by `(step_code, attempt_number)`.
    async fn list_attempts(&self, execution_id: Uuid) -> Result<Vec<StepAttempt>, StoreError>;

    /// Whether any non-terminal execution references the definition.
    async fn has_live_for_definition(&self, definition_id: Uuid) -> Result<bool, StoreError>;
}

#[derive(Debug, Default)]
struct ExecutionState {
    executions: HashMap<Uuid, Execution>,
    idempotency: HashMap<(String, String, String), Uuid>,
    attempts: HashMap<Uuid, Vec<StepAttempt>>,
}

/// Mutex-serialized execution store.
#[derive(Debug, Default)]
pub struct InMemoryExecutionStore {
    state: Mutex<ExecutionState>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn insert(&self, execution: Execution) -> Result<InsertExecution, StoreError> {
        let mut state = self.state.lock();
        let key = (
            execution.tenant_id.clone(),
            execution.definition_code.clone(),
            execution.idempotency_key.clone(),
        );
        if let Some(existing_id) = state.idempotency.get(&key) {
            let existing = state
                .executions
                .get(existing_id)
                .cloned()
                .ok_or_else(|| StoreError::backend("idempotency index points at nothing"))?;
            return Ok(InsertExecution::Replayed(existing));
        }
        state.idempotency.insert(key, execution.id);
        state.executions.insert(execution.id, execution.clone());
        Ok(InsertExecution::Inserted(execution))
    }

    async fn get(&self, execution_id: Uuid) -> Result<Option<Execution>, StoreError> {
        Ok(self.state.lock().executions.get(&execution_id).cloned())
    }

    async fn update(&self, execution: &Execution) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        match state.executions.get_mut(&execution.id) {
            Some(row) => {
                *row = execution.clone();
                Ok(())
            }
            None => Err(StoreError::backend(format!(
                "update of unknown execution {}",
                execution.id
            ))),
        }
    }

    async fn insert_attempt(&self, attempt: StepAttempt) -> Result<bool, StoreError> {
        let mut state = self.state.lock();
        let attempts = state.attempts.entry(attempt.execution_id).or_default();
        let exists = attempts
            .iter()
            .any(|a| a.step_code == attempt.step_code && a.attempt_number == attempt.attempt_number);
        if exists {
            return Ok(false);
        }
        attempts.push(attempt);
        Ok(true)
    }

    async fn start_attempt(
        &self,
        execution_id: Uuid,
        step_code: &str,
        attempt_number: u32,
        started_at: DateTime<Utc>,
        timeout_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock();
        let Some(attempts) = state.attempts.get_mut(&execution_id) else {
            return Ok(false);
        };
        let Some(attempt) = attempts
            .iter_mut()
            .find(|a| a.step_code == step_code && a.attempt_number == attempt_number)
        else {
            return Ok(false);
        };
        if attempt.status != AttemptStatus::Pending {
            return Ok(false);
        }
        attempt.status = AttemptStatus::Running;
        attempt.started_at = Some(started_at);
        attempt.timeout_at = Some(timeout_at);
        Ok(true)
    }

    async fn update_attempt(&self, attempt: &StepAttempt) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let attempts = state
            .attempts
            .get_mut(&attempt.execution_id)
            .ok_or_else(|| StoreError::backend("update of attempt for unknown execution"))?;
        match attempts
            .iter_mut()
            .find(|a| a.step_code == attempt.step_code && a.attempt_number == attempt.attempt_number)
        {
            Some(row) => {
                *row = attempt.clone();
                Ok(())
            }
            None => Err(StoreError::backend("update of unknown attempt")),
        }
    }

    async fn list_attempts(&self, execution_id: Uuid) -> Result<Vec<StepAttempt>, StoreError> {
        let state = self.state.lock();
        let mut attempts = state
            .attempts
            .get(&execution_id)
            .cloned()
            .unwrap_or_default();
        attempts.sort_by(|a, b| {
            a.step_code
                .cmp(&b.step_code)
                .then(a.attempt_number.cmp(&b.attempt_number))
        });
        Ok(attempts)
    }

    async fn has_live_for_definition(&self, definition_id: Uuid) -> Result<bool, StoreError> {
        let state = self.state.lock();
        Ok(state
            .executions
            .values()
            .any(|e| e.definition_id == definition_id && !e.status.is_terminal()))
    }
}

// =============================================================================
// DLQ store
// =============================================================================

#[async_trait]
pub trait DlqStore: Send + Sync {
    /// Insert unless the execution already has an entry; returns the
    /// surviving entry either way.
    async fn insert_once(&self, entry: DlqEntry) -> Result<DlqEntry, StoreError>;

    async fn get(&self, tenant_id: &str, entry_id: Uuid) -> Result<Option<DlqEntry>, StoreError>;

    async fn for_execution(&self, execution_id: Uuid) -> Result<Option<DlqEntry>, StoreError>;

    /// Entries for a tenant, newest first, optionally filtered by reason.
    async fn list(
        &self,
        tenant_id: &str,
        reason: Option<DlqReason>,
    ) -> Result<Vec<DlqEntry>, StoreError>;

    /// Replace an entry row.
    async fn update(&self, entry: &DlqEntry) -> Result<(), StoreError>;
}

/// Mutex-serialized DLQ store.
#[derive(Debug, Default)]
pub struct InMemoryDlqStore {
    entries: Mutex<Vec<DlqEntry>>,
}

impl InMemoryDlqStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DlqStore for InMemoryDlqStore {
    async fn insert_once(&self, entry: DlqEntry) -> Result<DlqEntry, StoreError> {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries
            .iter()
            .find(|e| e.execution_id == entry.execution_id)
        {
            return Ok(existing.clone());
        }
        entries.push(entry.clone());
        Ok(entry)
    }

    async fn get(&self, tenant_id: &str, entry_id: Uuid) -> Result<Option<DlqEntry>, StoreError> {
        let entries = self.entries.lock();
        Ok(entries
            .iter()
            .find(|e| e.id == entry_id && e.tenant_id == tenant_id)
            .cloned())
    }

    async fn for_execution(&self, execution_id: Uuid) -> Result<Option<DlqEntry>, StoreError> {
        let entries = self.entries.lock();
        Ok(entries
            .iter()
            .find(|e| e.execution_id == execution_id)
            .cloned())
    }

    async fn list(
        &self,
        tenant_id: &str,
        reason: Option<DlqReason>,
    ) -> Result<Vec<DlqEntry>, StoreError> {
        let entries = self.entries.lock();
        let mut out: Vec<DlqEntry> = entries
            .iter()
            .filter(|e| e.tenant_id == tenant_id)
            .filter(|e| reason.map_or(true, |r| e.reason == r))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    async fn update(&self, entry: &DlqEntry) -> Result<(), StoreError> {
        let mut entries = self.entries.lock();
        match entries.iter_mut().find(|e| e.id == entry.id) {
            Some(row) => {
                *row = entry.clone();
                Ok(())
            }
            None => Err(StoreError::backend("update of unknown dlq entry")),
        }
    }
}
