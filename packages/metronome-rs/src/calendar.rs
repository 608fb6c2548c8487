//! Civil-date arithmetic and timezone resolution.
//!
//! All period math happens on civil dates in the rule's IANA zone and is
//! mapped to UTC at the very end. Two rules make the mapping deterministic
//! across DST transitions:
//!
//! - a wall time that does not exist (spring-forward gap) shifts forward to
//!   the next valid instant;
//! - an ambiguous wall time (fall-back overlap) resolves to the earlier
//!   instant.

use chrono::{
    DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc,
};
use chrono_tz::Tz;

/// Number of days in a civil month.
pub fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|first_of_next| first_of_next.pred_opt())
        .map(|last| last.day())
        .unwrap_or(28)
}

/// Add calendar months, clamping the day to the target month's length
/// (Jan 31 + 1 month = Feb 28/29).
pub fn add_months_clamped(date: NaiveDate, months: i64) -> NaiveDate {
    let total = date.year() as i64 * 12 + (date.month() as i64 - 1) + months;
    let year = total.div_euclid(12) as i32;
    let month = (total.rem_euclid(12) + 1) as u32;
    let day = date.day().min(days_in_month(year, month));
    NaiveDate::from_ymd_opt(year, month, day).expect("day clamped to month length")
}

/// Add calendar years, clamping Feb 29 to Feb 28 in non-leap years.
pub fn add_years_clamped(date: NaiveDate, years: i64) -> NaiveDate {
    let year = date.year() + years as i32;
    let day = date.day().min(days_in_month(year, date.month()));
    NaiveDate::from_ymd_opt(year, date.month(), day).expect("day clamped to month length")
}

/// Calendar quarter (1..=4) containing a month.
pub fn quarter_of_month(month: u32) -> u32 {
    (month - 1) / 3 + 1
}

// =============================================================================
// Fiscal calendar
// =============================================================================

/// A position in a fiscal calendar.
///
/// The fiscal year is named after the calendar year in which it starts:
/// with a fiscal year starting in April, Jan-Mar 2026 belongs to fiscal
/// 2025 and is its fourth quarter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiscalQuarter {
    pub fiscal_year: i32,
    /// 1-based quarter index within the fiscal year.
    pub quarter: u32,
    /// First civil day of the quarter.
    pub quarter_start: NaiveDate,
}

impl FiscalQuarter {
    /// Label in `YYYY-Qn` form, fiscal year and quarter.
    pub fn label(&self) -> String {
        format!("{:04}-Q{}", self.fiscal_year, self.quarter)
    }
}

/// Locate the fiscal quarter containing a civil date.
///
/// `fiscal_year_start_month` is 1..=12; callers validate the range before
/// reaching this function.
pub fn fiscal_quarter_of(date: NaiveDate, fiscal_year_start_month: u32) -> FiscalQuarter {
    let month = date.month();
    let months_into_year = (month + 12 - fiscal_year_start_month) % 12;
    let fiscal_year = if month >= fiscal_year_start_month {
        date.year()
    } else {
        date.year() - 1
    };
    let quarter = months_into_year / 3 + 1;

    // Months from January of the fiscal year's starting calendar year.
    let start_total = fiscal_year_start_month - 1 + (quarter - 1) * 3;
    let quarter_start = NaiveDate::from_ymd_opt(
        fiscal_year + (start_total / 12) as i32,
        start_total % 12 + 1,
        1,
    )
    .expect("first of month is always valid");

    FiscalQuarter {
        fiscal_year,
        quarter,
        quarter_start,
    }
}

// =============================================================================
// Zone resolution
// =============================================================================

/// Resolve a civil wall time in a zone to a UTC instant, applying the
/// deterministic DST policy described in the module docs.
pub fn resolve_local(naive: NaiveDateTime, tz: Tz) -> DateTime<Utc> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt.with_timezone(&Utc),
        LocalResult::Ambiguous(earlier, _later) => earlier.with_timezone(&Utc),
        LocalResult::None => {
            // Spring-forward gap. Probe forward in 15-minute steps until the
            // wall time exists again; real gaps are at most a few hours and
            // end on a 15-minute boundary.
            let mut probe = naive;
            for _ in 0..(24 * 4) {
                probe += Duration::minutes(15);
                match tz.from_local_datetime(&probe) {
                    LocalResult::Single(dt) => return dt.with_timezone(&Utc),
                    LocalResult::Ambiguous(earlier, _later) => {
                        return earlier.with_timezone(&Utc)
                    }
                    LocalResult::None => continue,
                }
            }
            naive.and_utc()
        }
    }
}

/// UTC instant of civil midnight in a zone.
pub fn zoned_midnight(date: NaiveDate, tz: Tz) -> DateTime<Utc> {
    resolve_local(date.and_time(NaiveTime::MIN), tz)
}

/// Civil date of an instant as seen from a zone.
pub fn civil_date_in(instant: DateTime<Utc>, tz: Tz) -> NaiveDate {
    instant.with_timezone(&tz).date_naive()
}

/// ISO week label in `YYYY-Www` form. The ISO week year can differ from the
/// calendar year around New Year.
pub fn iso_week_label(date: NaiveDate) -> String {
    let week = date.iso_week();
    format!("{:04}-W{:02}", week.year(), week.week())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_days_in_month_handles_leap_years() {
        assert_eq!(days_in_month(2024, 2), 29);
        assert_eq!(days_in_month(2026, 2), 28);
        assert_eq!(days_in_month(2026, 4), 30);
        assert_eq!(days_in_month(2026, 12), 31);
    }

    #[test]
    fn test_add_months_clamps_to_month_end() {
        assert_eq!(add_months_clamped(date(2026, 1, 31), 1), date(2026, 2, 28));
        assert_eq!(add_months_clamped(date(2026, 1, 31), 2), date(2026, 3, 31));
        assert_eq!(add_months_clamped(date(2026, 1, 31), 3), date(2026, 4, 30));
    }

    #[test]
    fn test_add_months_crosses_year_boundaries() {
        assert_eq!(add_months_clamped(date(2026, 11, 15), 3), date(2027, 2, 15));
        assert_eq!(add_months_clamped(date(2026, 1, 15), -2), date(2025, 11, 15));
    }

    #[test]
    fn test_add_years_clamps_leap_day() {
        assert_eq!(add_years_clamped(date(2024, 2, 29), 1), date(2025, 2, 28));
        assert_eq!(add_years_clamped(date(2024, 2, 29), 4), date(2028, 2, 29));
    }

    #[test]
    fn test_fiscal_quarter_april_start() {
        // Fiscal year starts in April: Jan-Mar 2026 is 2025-Q4.
        let q = fiscal_quarter_of(date(2026, 2, 10), 4);
        assert_eq!(q.fiscal_year, 2025);
        assert_eq!(q.quarter, 4);
        assert_eq!(q.quarter_start, date(2026, 1, 1));
        assert_eq!(q.label(), "2025-Q4");

        let q = fiscal_quarter_of(date(2026, 4, 1), 4);
        assert_eq!(q.fiscal_year, 2026);
        assert_eq!(q.quarter, 1);
        assert_eq!(q.quarter_start, date(2026, 4, 1));
        assert_eq!(q.label(), "2026-Q1");
    }

    #[test]
    fn test_fiscal_quarter_january_start_matches_calendar() {
        let q = fiscal_quarter_of(date(2026, 8, 20), 1);
        assert_eq!(q.fiscal_year, 2026);
        assert_eq!(q.quarter, 3);
        assert_eq!(q.quarter_start, date(2026, 7, 1));
    }

    #[test]
    fn test_zoned_midnight_plain_day() {
        let tz: Tz = "America/New_York".parse().unwrap();
        let instant = zoned_midnight(date(2026, 2, 15), tz);
        assert_eq!(instant.to_rfc3339(), "2026-02-15T05:00:00+00:00");
    }

    #[test]
    fn test_zoned_midnight_after_spring_forward() {
        // EDT from Mar 8 2026; midnight itself is unaffected but the
        // offset changes from -05 to -04.
        let tz: Tz = "America/New_York".parse().unwrap();
        let instant = zoned_midnight(date(2026, 3, 15), tz);
        assert_eq!(instant.to_rfc3339(), "2026-03-15T04:00:00+00:00");
    }

    #[test]
    fn test_zoned_midnight_in_gap_shifts_forward() {
        // Chile springs forward at midnight: 2019-09-08 00:00 did not
        // exist in America/Santiago; the next valid wall time is 01:00.
        let tz: Tz = "America/Santiago".parse().unwrap();
        let instant = zoned_midnight(date(2019, 9, 8), tz);
        let local = instant.with_timezone(&tz);
        assert_eq!(local.time(), NaiveTime::from_hms_opt(1, 0, 0).unwrap());
    }

    #[test]
    fn test_zoned_midnight_ambiguous_picks_earlier() {
        // The Azores fall back at 01:00 to 00:00, so midnight on the
        // transition day occurs twice. The earlier instant (summer offset,
        // +00:00) wins.
        let tz: Tz = "Atlantic/Azores".parse().unwrap();
        let instant = zoned_midnight(date(2026, 10, 25), tz);
        assert_eq!(instant.to_rfc3339(), "2026-10-25T00:00:00+00:00");
    }

    #[test]
    fn test_iso_week_label_year_boundary() {
        // Jan 1 2027 falls in ISO week 53 of 2026.
        assert_eq!(iso_week_label(date(2027, 1, 1)), "2026-W53");
        assert_eq!(iso_week_label(date(2026, 1, 19)), "2026-W04");
    }
}
