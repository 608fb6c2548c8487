//! # Metronome
//!
//! A deterministic, timezone-correct recurrence engine: rules describe a
//! cadence, the period computer turns them into `[start, end)` UTC
//! intervals, and the generator materializes each interval into a
//! downstream object exactly once.
//!
//! ## Architecture
//!
//! ```text
//! tick(now, horizon) / backfill(until)
//!     │
//!     ▼
//! Period computer (pure, civil dates in the rule's zone)
//!     │
//!     ▼ for each period
//! Ledger.claim ──already done──► skip
//!     │ claimed
//!     ▼
//! TargetFactory.materialize ──err──► Ledger.release
//!     │ ok
//!     ▼
//! Ledger.fulfill
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Exactly-once materialization** - at most one produced object per
//!    `(rule, period_start)` across retries, crashes and concurrent ticks
//! 2. **Determinism** - for a fixed `(rule, from)` the emitted period
//!    sequence is identical on every enumeration
//! 3. **Zone correctness** - period math happens on civil dates in the
//!    rule's IANA zone; nonexistent wall times shift forward, ambiguous
//!    wall times resolve to the earlier instant
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use metronome::{
//!     FactoryRegistry, Generator, InMemoryLedger, InMemoryRuleStore, SystemClock,
//! };
//!
//! let mut factories = FactoryRegistry::new();
//! factories.register("work_item", Arc::new(WorkItemFactory::new(pool)));
//!
//! let generator = Generator::new(
//!     Arc::new(SystemClock),
//!     Arc::new(InMemoryRuleStore::new()),
//!     Arc::new(InMemoryLedger::new()),
//!     factories,
//! );
//!
//! let rule = generator.create_rule(rule).await?;
//! let report = generator.tick("tenant-1", chrono::Duration::days(30), None).await?;
//! ```

mod calendar;
mod clock;
mod error;
mod generator;
mod ledger;
mod period;
mod rule;
mod store;



pub use calendar::{
    add_months_clamped, add_years_clamped, civil_date_in, days_in_month, fiscal_quarter_of,
    iso_week_label, quarter_of_month, resolve_local, zoned_midnight, FiscalQuarter,
};
pub use clock::{Clock, FixedClock, SystemClock};
pub use error::{Error, StoreError};
pub use generator::{FactoryRegistry, GenerateReport, Generator, RuleReport, TargetFactory};
pub use ledger::{ClaimOutcome, Generation, GenerationLedger, InMemoryLedger, ProducedRef};
pub use period::{periods, Period, Periods};
pub use rule::{AnchorKind, Frequency, RecurrenceRule, RuleStatus, TargetRef, UnfulfilledMode};
pub use store::{InMemoryRuleStore, RuleStore};
