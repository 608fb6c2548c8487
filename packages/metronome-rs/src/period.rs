//! Period computation.
//!
//! Given a rule and a reference instant, [`periods`] yields the lazy
//! sequence of half-open `[start, end)` intervals the rule generates, in
//! UTC, each with a human label. The sequence is deterministic: for a fixed
//! `(rule, from)` two enumerations are identical.
//!
//! All stepping happens on civil dates in the rule's zone; each boundary is
//! resolved to UTC through [`crate::calendar::zoned_midnight`], which
//! carries the DST policy.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use chrono_tz::Tz;

use crate::calendar::{
    add_months_clamped, add_years_clamped, civil_date_in, fiscal_quarter_of, iso_week_label,
    quarter_of_month, zoned_midnight,
};
use crate::error::Error;
use crate::rule::{AnchorKind, Frequency, RecurrenceRule};

/// A half-open `[start, end)` interval in UTC with its label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Period {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// `YYYY-MM-DD`, `YYYY-Www`, `YYYY-MM`, `YYYY-Qn` or `YYYY` depending
    /// on the cadence.
    pub label: String,
}

/// Lazy iterator over a rule's periods.
///
/// Bounded above by the rule's `ends_at` when present; callers bound open
/// windows themselves (`take_while` on `start`).
#[derive(Debug, Clone)]
pub struct Periods {
    tz: Tz,
    frequency: Frequency,
    interval: i64,
    /// Base civil date occurrences are stepped from. For fiscal quarterly
    /// cadences this is the first day of the fiscal quarter containing the
    /// rule's anchor.
    base: NaiveDate,
    fiscal_year_start_month: Option<u32>,
    ends_at: Option<DateTime<Utc>>,
    k: i64,
}

/// Enumerate the periods of `rule` whose start lies at or after
/// `max(from, rule.starts_at)`.
///
/// Fiscal-quarterly cadences are calendar-aligned rather than
/// anchor-generated, so their window's lower bound snaps back to the start
/// of the fiscal quarter containing it; every other cadence applies the
/// bound strictly.
pub fn periods(rule: &RecurrenceRule, from: DateTime<Utc>) -> Result<Periods, Error> {
    rule.validate()?;
    let tz = rule.tz()?;
    let fiscal = rule.frequency == Frequency::Quarterly && rule.anchor_kind == AnchorKind::Fiscal;

    let base = if fiscal {
        let month = rule
            .fiscal_year_start_month
            .ok_or_else(|| Error::BadRule("fiscal anchor requires fiscal_year_start_month".into()))?;
        fiscal_quarter_of(rule.anchor_date, month).quarter_start
    } else {
        rule.anchor_date
    };

    let mut lower = from.max(rule.starts_at);
    if fiscal {
        let month = rule.fiscal_year_start_month.unwrap_or(1);
        let civil = civil_date_in(lower, tz);
        lower = zoned_midnight(fiscal_quarter_of(civil, month).quarter_start, tz);
    }

    let mut iter = Periods {
        tz,
        frequency: rule.frequency,
        interval: rule.interval as i64,
        base,
        fiscal_year_start_month: rule.fiscal_year_start_month,
        ends_at: rule.ends_at,
        k: 0,
    };
    iter.k = iter.initial_index(lower);
    Ok(iter)
}

impl Periods {
    /// Civil start date of occurrence `k`.
    fn civil_start(&self, k: i64) -> NaiveDate {
        let step = k * self.interval;
        match self.frequency {
            Frequency::Daily => self.base + Duration::days(step),
            Frequency::Weekly => self.base + Duration::days(7 * step),
            Frequency::Monthly => add_months_clamped(self.base, step),
            Frequency::Quarterly => add_months_clamped(self.base, 3 * step),
            Frequency::Yearly => add_years_clamped(self.base, step),
        }
    }

    fn start_utc(&self, k: i64) -> DateTime<Utc> {
        zoned_midnight(self.civil_start(k), self.tz)
    }

    /// Smallest `k >= 0` whose start is at or after `lower`. An arithmetic
    /// estimate lands close; the loops below make it exact.
    fn initial_index(&self, lower: DateTime<Utc>) -> i64 {
        let civil = civil_date_in(lower, self.tz);
        let month_diff = (civil.year() as i64 * 12 + civil.month() as i64)
            - (self.base.year() as i64 * 12 + self.base.month() as i64);
        let day_diff = (civil - self.base).num_days();

        let estimate = match self.frequency {
            Frequency::Daily => day_diff / self.interval,
            Frequency::Weekly => day_diff / (7 * self.interval),
            Frequency::Monthly => month_diff / self.interval,
            Frequency::Quarterly => month_diff / (3 * self.interval),
            Frequency::Yearly => {
                (civil.year() as i64 - self.base.year() as i64) / self.interval
            }
        };

        let mut k = (estimate - 2).max(0);
        while k > 0 && self.start_utc(k - 1) >= lower {
            k -= 1;
        }
        while self.start_utc(k) < lower {
            k += 1;
        }
        k
    }

    fn label_for(&self, start: NaiveDate) -> String {
        match self.frequency {
            Frequency::Daily => start.format("%Y-%m-%d").to_string(),
            Frequency::Weekly => iso_week_label(start),
            Frequency::Monthly => format!("{:04}-{:02}", start.year(), start.month()),
            Frequency::Quarterly => match self.fiscal_year_start_month {
                Some(month) => fiscal_quarter_of(start, month).label(),
                None => format!("{:04}-Q{}", start.year(), quarter_of_month(start.month())),
            },
            Frequency::Yearly => format!("{:04}", start.year()),
        }
    }
}

impl Iterator for Periods {
    type Item = Period;

    fn next(&mut self) -> Option<Period> {
        let start_date = self.civil_start(self.k);
        let start = zoned_midnight(start_date, self.tz);
        if let Some(ends_at) = self.ends_at {
            if start >= ends_at {
                return None;
            }
        }
        let end = zoned_midnight(self.civil_start(self.k + 1), self.tz);
        let label = self.label_for(start_date);
        self.k += 1;
        Some(Period { start, end, label })
    }
}
