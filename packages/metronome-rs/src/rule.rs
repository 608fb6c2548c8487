//! Recurrence rules.
//!
//! A rule describes a cadence (frequency, interval, anchor) in a mandatory
//! IANA timezone, a generation window, and an opaque pointer to the kind of
//! downstream object each period materializes into. Validation happens at
//! creation; an invalid rule never reaches the generator.

use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

/// Cadence of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    Yearly,
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
            Frequency::Monthly => "monthly",
            Frequency::Quarterly => "quarterly",
            Frequency::Yearly => "yearly",
        }
    }
}

impl FromStr for Frequency {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily" => Ok(Frequency::Daily),
            "weekly" => Ok(Frequency::Weekly),
            "monthly" => Ok(Frequency::Monthly),
            "quarterly" => Ok(Frequency::Quarterly),
            "yearly" => Ok(Frequency::Yearly),
            other => Err(Error::BadRule(format!("unknown frequency: {other}"))),
        }
    }
}

/// What the anchor date is measured against.
///
/// `Custom` exists in stored histories but is rejected at creation; the
/// engine does not implement custom anchors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorKind {
    Calendar,
    Fiscal,
    Custom,
}

/// Lifecycle status. Only `Active` rules generate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleStatus {
    Active,
    Paused,
    Canceled,
}

impl RuleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleStatus::Active => "active",
            RuleStatus::Paused => "paused",
            RuleStatus::Canceled => "canceled",
        }
    }
}

/// Recovery mode for a period that was claimed but never fulfilled
/// (a crash between claim and fulfill).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnfulfilledMode {
    /// Release the stale claim and claim again before re-running the
    /// factory. The default.
    #[default]
    ReleaseAndReclaim,
    /// Re-run the factory against the existing claim. Only safe when the
    /// factory is itself idempotent keyed by `(rule_id, period_start)`.
    RerunFactory,
}

/// Opaque pointer to the kind of object a rule materializes. The engine
/// passes it through to the registered target factory untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetRef {
    pub kind: String,
    pub id: String,
}

/// A recurrence rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurrenceRule {
    pub id: Uuid,
    pub tenant_id: String,
    /// Optional stable code, unique per tenant when non-empty.
    pub code: Option<String>,
    pub target: TargetRef,
    pub frequency: Frequency,
    /// Every N periods, at least 1.
    pub interval: u32,
    pub anchor_kind: AnchorKind,
    /// Civil date in `timezone` from which boundaries are computed.
    pub anchor_date: NaiveDate,
    /// Required for fiscal anchors, 1..=12.
    pub fiscal_year_start_month: Option<u32>,
    pub starts_at: DateTime<Utc>,
    /// Open-ended when absent.
    pub ends_at: Option<DateTime<Utc>>,
    /// IANA zone name, mandatory.
    pub timezone: String,
    pub status: RuleStatus,
    pub on_unfulfilled: UnfulfilledMode,
    pub created_at: DateTime<Utc>,
}

impl RecurrenceRule {
    /// Parse and return the rule's zone.
    pub fn tz(&self) -> Result<Tz, Error> {
        if self.timezone.is_empty() {
            return Err(Error::BadRule("timezone is required".into()));
        }
        self.timezone
            .parse::<Tz>()
            .map_err(|_| Error::BadRule(format!("unknown timezone: {}", self.timezone)))
    }

    /// Check every invariant a rule must satisfy before it may generate.
    pub fn validate(&self) -> Result<(), Error> {
        self.tz()?;
        if self.interval < 1 {
            return Err(Error::BadRule("interval must be at least 1".into()));
        }
        match self.anchor_kind {
            AnchorKind::Custom => {
                return Err(Error::BadRule("custom anchors are not supported".into()));
            }
            AnchorKind::Fiscal => match self.fiscal_year_start_month {
                Some(m) if (1..=12).contains(&m) => {}
                Some(m) => {
                    return Err(Error::BadRule(format!(
                        "fiscal_year_start_month out of range: {m}"
                    )));
                }
                None => {
                    return Err(Error::BadRule(
                        "fiscal anchor requires fiscal_year_start_month".into(),
                    ));
                }
            },
            AnchorKind::Calendar => {}
        }
        if let Some(ends_at) = self.ends_at {
            if ends_at <= self.starts_at {
                return Err(Error::BadRule("ends_at must be after starts_at".into()));
            }
        }
        if self.target.kind.is_empty() {
            return Err(Error::BadRule("target kind is required".into()));
        }
        Ok(())
    }
}
