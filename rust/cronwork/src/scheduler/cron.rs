//! Cron expression parsing and evaluation.
//!
//! Supports the standard format `minute hour day month weekday` and a
//! six-field variant with a leading seconds field. Each field is a comma list
//! of `*`, `?`, `n` or `a-b`, optionally followed by `/step`.

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};

/// How far ahead `next_after` searches before giving up.
const SEARCH_HORIZON_DAYS: i64 = 366 * 5;

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    /// Second (0-59). Fixed at 0 for five-field expressions.
    second: CronField,
    /// Minute (0-59).
    minute: CronField,
    /// Hour (0-23).
    hour: CronField,
    /// Day of month (1-31).
    day: CronField,
    /// Month (1-12).
    month: CronField,
    /// Day of week (0-6, Sunday = 0; 7 is accepted as Sunday).
    weekday: CronField,
}

/// Allowed values of a single field, as a bitmask indexed by value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CronField {
    mask: u64,
    /// Written as a bare `*` or `?`.
    unrestricted: bool,
}

impl CronField {
    fn single(value: u32) -> Self {
        Self {
            mask: 1 << value,
            unrestricted: false,
        }
    }

    /// Check if the field matches the given value.
    fn matches(self, value: u32) -> bool {
        value < 64 && self.mask & (1 << value) != 0
    }
}

/// Cron expression parser.
#[derive(Debug)]
pub struct CronParser;

impl CronParser {
    /// Parse a cron expression string.
    ///
    /// # Examples
    ///
    /// - `0 0 * * *` - Daily at midnight
    /// - `*/5 * * * *` - Every 5 minutes
    /// - `0 9-17 * * 1-5` - Every hour 9am-5pm, Monday-Friday
    /// - `*/30 * * * * *` - Every 30 seconds
    pub fn parse(expr: &str) -> Result<CronExpression> {
        let parts: Vec<&str> = expr.split_whitespace().collect();
        let (second, rest) = match parts.len() {
            5 => (CronField::single(0), parts.as_slice()),
            6 => (
                Self::parse_field(parts[0], 0, 59).context("Invalid second field")?,
                &parts[1..],
            ),
            _ => anyhow::bail!("Cron expression must have 5 or 6 fields: {}", expr),
        };

        let mut weekday = Self::parse_field(rest[4], 0, 7).context("Invalid weekday field")?;
        if weekday.matches(7) {
            weekday.mask = (weekday.mask & !(1 << 7)) | 1;
        }

        Ok(CronExpression {
            second,
            minute: Self::parse_field(rest[0], 0, 59).context("Invalid minute field")?,
            hour: Self::parse_field(rest[1], 0, 23).context("Invalid hour field")?,
            day: Self::parse_field(rest[2], 1, 31).context("Invalid day field")?,
            month: Self::parse_field(rest[3], 1, 12).context("Invalid month field")?,
            weekday,
        })
    }

    fn parse_field(field: &str, min: u32, max: u32) -> Result<CronField> {
        let mut mask = 0u64;
        let mut unrestricted = false;

        for item in field.split(',') {
            let (range, step) = match item.split_once('/') {
                Some((range, step)) => {
                    let step: u32 = step.parse().context("Invalid step value")?;
                    if step == 0 || step > max {
                        anyhow::bail!("Step value must be 1-{}", max);
                    }
                    (range, Some(step))
                }
                None => (item, None),
            };

            let (start, end) = if range == "*" || range == "?" {
                unrestricted |= step.is_none();
                (min, max)
            } else if let Some((start, end)) = range.split_once('-') {
                let start = Self::parse_value(start, min, max).context("Invalid range start")?;
                let end = Self::parse_value(end, min, max).context("Invalid range end")?;
                if start > end {
                    anyhow::bail!("Range values must be {}-{} with start <= end", min, max);
                }
                (start, end)
            } else {
                let value = Self::parse_value(range, min, max)?;
                // `n/step` runs from n to the top of the field
                (value, if step.is_some() { max } else { value })
            };

            let step = step.unwrap_or(1);
            let mut value = start;
            while value <= end {
                mask |= 1 << value;
                value += step;
            }
        }

        Ok(CronField { mask, unrestricted })
    }

    fn parse_value(raw: &str, min: u32, max: u32) -> Result<u32> {
        let value: u32 = raw.parse().context("Invalid numeric value")?;
        if value < min || value > max {
            anyhow::bail!("Value must be {}-{}", min, max);
        }
        Ok(value)
    }
}

impl CronExpression {
    /// Check if the cron expression matches the given time.
    pub fn matches(&self, time: &DateTime<Utc>) -> bool {
        self.second.matches(time.second())
            && self.minute.matches(time.minute())
            && self.hour.matches(time.hour())
            && self.month.matches(time.month())
            && self.day_matches(time)
    }

    /// Day-of-month and day-of-week combine with OR when both are restricted.
    fn day_matches(&self, time: &DateTime<Utc>) -> bool {
        let dom = self.day.matches(time.day());
        let dow = self.weekday.matches(time.weekday().num_days_from_sunday());
        match (self.day.unrestricted, self.weekday.unrestricted) {
            (false, false) => dom || dow,
            (true, false) => dow,
            (false, true) => dom,
            (true, true) => true,
        }
    }

    /// Calculate the first matching time strictly after the given time.
    pub fn next_after(&self, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        let limit = *after + Duration::days(SEARCH_HORIZON_DAYS);
        let mut current = after.with_nanosecond(0)? + Duration::seconds(1);

        while current <= limit {
            if !self.month.matches(current.month()) {
                current = start_of_next_month(&current)?;
            } else if !self.day_matches(&current) {
                current = current.date_naive().succ_opt()?.and_hms_opt(0, 0, 0)?.and_utc();
            } else if !self.hour.matches(current.hour()) {
                current = current.with_minute(0)?.with_second(0)? + Duration::hours(1);
            } else if !self.minute.matches(current.minute()) {
                current = current.with_second(0)? + Duration::minutes(1);
            } else if !self.second.matches(current.second()) {
                current += Duration::seconds(1);
            } else {
                return Some(current);
            }
        }
        None
    }
}

fn start_of_next_month(time: &DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if time.month() == 12 {
        (time.year() + 1, 1)
    } else {
        (time.year(), time.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()
}

/// Next run time of `expr` after `after`; `None` (logged) for invalid expressions.
pub fn next_run_time_after(expr: &str, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match CronParser::parse(expr) {
        Ok(cron) => cron.next_after(&after),
        Err(e) => {
            tracing::error!(cron = expr, error = %e, "Invalid cron expression");
            None
        }
    }
}

/// Next run time of `expr` from now.
pub fn next_run_time(expr: &str) -> Option<DateTime<Utc>> {
    next_run_time_after(expr, Utc::now())
}
