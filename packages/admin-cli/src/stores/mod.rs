//! PostgreSQL adapters for the engine store contracts.
//!
//! Every uniqueness obligation maps to a constraint in
//! `migrations/0001_engine_tables.sql`; claims and idempotent inserts use
//! `INSERT .. ON CONFLICT DO NOTHING` and read the surviving row on
//! conflict.

mod pg_definitions;
mod pg_dlq;
mod pg_executions;
mod pg_recurrence;

pub use pg_definitions::PgDefinitionStore;
pub use pg_dlq::PgDlqStore;
pub use pg_executions::PgExecutionStore;
pub use pg_recurrence::{PgLedger, PgRuleStore};

/// PostgreSQL unique_violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}
