//! Cron expression parser.
//! Supports: "MIN HOUR DOM MON DOW" (5-field, no seconds)
//! Per field: `*`, `N`, `a-b`, comma lists, and `/step` on `*` or ranges.
//! Example: "0 1 * * *" = every day at 01:00
//!
//! Day-of-month and day-of-week follow classic cron: when both are
//! restricted a day matches if either one does.

use brgy_core::error::{BrgyError, Result};
use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, TimeZone, Timelike, Utc};

/// Days searched ahead before giving up (covers Feb 29 schedules).
const SEARCH_DAYS: u32 = 366 * 5;

/// A parsed cron schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(BrgyError::Scheduler(format!(
                "Invalid cron expression '{expression}' (need 5 fields: MIN HOUR DOM MON DOW)"
            )));
        }

        let field = |idx: usize, min: u32, max: u32| {
            parse_field(parts[idx], min, max).ok_or_else(|| {
                BrgyError::Scheduler(format!(
                    "Invalid cron field '{}' in '{expression}' (allowed {min}-{max})",
                    parts[idx]
                ))
            })
        };

        let mut days_of_week = field(4, 0, 7)?;
        // 7 is an alias for Sunday
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }

        Ok(Self {
            minutes: field(0, 0, 59)?,
            hours: field(1, 0, 23)?,
            days_of_month: field(2, 1, 31)?,
            months: field(3, 1, 12)?,
            days_of_week,
            dom_restricted: parts[2] != "*",
            dow_restricted: parts[4] != "*",
        })
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        if !has(self.months, date.month()) {
            return false;
        }
        let dom = has(self.days_of_month, date.day());
        let dow = has(self.days_of_week, date.weekday().num_days_from_sunday());
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }

    /// First matching minute strictly after `after`, in `after`'s offset.
    pub fn next_after(&self, after: DateTime<FixedOffset>) -> Option<DateTime<FixedOffset>> {
        let start = after.naive_local().with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);
        let offset = *after.offset();

        let mut date = start.date();
        for day in 0..SEARCH_DAYS {
            if self.day_matches(date) {
                let first_day = day == 0;
                let from_hour = if first_day { start.hour() } else { 0 };
                for hour in from_hour..24 {
                    if !has(self.hours, hour) {
                        continue;
                    }
                    let from_minute = if first_day && hour == start.hour() { start.minute() } else { 0 };
                    for minute in from_minute..60 {
                        if has(self.minutes, minute) {
                            let naive = date.and_hms_opt(hour, minute, 0)?;
                            return offset.from_local_datetime(&naive).single();
                        }
                    }
                }
            }
            date = date.succ_opt()?;
        }
        None
    }
}

/// Parse a cron expression and compute the next run time after `after`,
/// evaluating the fields in the given local offset.
pub fn next_run_from_cron(
    expression: &str,
    after: DateTime<Utc>,
    offset: FixedOffset,
) -> Option<DateTime<Utc>> {
    match CronSchedule::parse(expression) {
        Ok(schedule) => schedule
            .next_after(after.with_timezone(&offset))
            .map(|t| t.with_timezone(&Utc)),
        Err(e) => {
            tracing::warn!("{e}");
            None
        }
    }
}

fn has(mask: u64, value: u32) -> bool {
    value < 64 && mask & (1u64 << value) != 0
}

/// Parse a cron field into a bitmask of matching values.
fn parse_field(field: &str, min: u32, max: u32) -> Option<u64> {
    let mut mask = 0u64;
    for item in field.split(',') {
        mask |= parse_item(item.trim(), min, max)?;
    }
    (mask != 0).then_some(mask)
}

fn parse_item(item: &str, min: u32, max: u32) -> Option<u64> {
    let (range, step) = match item.split_once('/') {
        Some((range, step)) => {
            let n: u32 = step.parse().ok()?;
            if n == 0 {
                return None;
            }
            (range, Some(n))
        }
        None => (item, None),
    };

    let (lo, hi) = if range == "*" {
        (min, max)
    } else if let Some((a, b)) = range.split_once('-') {
        (a.parse().ok()?, b.parse().ok()?)
    } else {
        let n: u32 = range.parse().ok()?;
        // "N/step" runs from N to the end of the range
        if step.is_some() { (n, max) } else { (n, n) }
    };

    if lo < min || hi > max || lo > hi {
        return None;
    }

    let mut mask = 0u64;
    for v in (lo..=hi).step_by(step.unwrap_or(1) as usize) {
        mask |= 1u64 << v;
    }
    Some(mask)
}
