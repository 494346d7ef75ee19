//! Wall-clock cadences for scheduled jobs.
//!
//! Six-field cron (`sec min hour day-of-month month day-of-week`, UTC) with
//! `*`, `n`, `a-b`, `*/n`, `a-b/n` and comma lists, plus the aliases
//! `@hourly`, `@daily` and `@every <n>{s|m|h}`.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};

/// How far ahead `next_after` searches before giving up on an expression
/// that can never fire (e.g. 31st of February).
const MAX_SEARCH_DAYS: u32 = 366 * 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cadence {
    Cron(CronSchedule),
    Every(Duration),
}

impl Cadence {
    pub fn every(interval: Duration) -> Self {
        Self::Every(interval)
    }

    /// First fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Cron(schedule) => schedule.next_after(after),
            Self::Every(interval) => {
                let step = chrono::Duration::from_std(*interval).ok()?;
                after.checked_add_signed(step)
            }
        }
    }
}

impl FromStr for Cadence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s {
            "@hourly" => return parse_cron("0 0 * * * *"),
            "@daily" | "@midnight" => return parse_cron("0 0 0 * * *"),
            _ => {}
        }
        if let Some(rest) = s.strip_prefix("@every") {
            return parse_every(rest.trim()).map(Self::Every);
        }
        if s.starts_with('@') {
            return Err(format!("unknown alias '{}'", s));
        }
        parse_cron(s)
    }
}

fn parse_cron(expr: &str) -> Result<Cadence, String> {
    CronSchedule::parse(expr).map(Cadence::Cron)
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cron(schedule) => f.write_str(&schedule.source),
            Self::Every(interval) if interval.subsec_nanos() == 0 => {
                write!(f, "@every {}s", interval.as_secs())
            }
            Self::Every(interval) => write!(f, "@every {}ms", interval.as_millis()),
        }
    }
}

fn parse_every(expr: &str) -> Result<Duration, String> {
    if expr.len() < 2 {
        return Err(format!("invalid @every interval '{}'", expr));
    }
    let (number, unit) = expr.split_at(expr.len() - 1);
    let n: u64 = number
        .parse()
        .map_err(|_| format!("invalid @every interval '{}'", expr))?;
    if n == 0 {
        return Err("@every interval must be positive".to_string());
    }
    let secs = match unit {
        "s" => n,
        "m" => n * 60,
        "h" => n * 3600,
        _ => return Err(format!("unknown @every unit '{}' (expected s, m or h)", unit)),
    };
    Ok(Duration::from_secs(secs))
}

/// Parsed cron expression. Each field is a bitmask of allowed values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    source: String,
    seconds: u64,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self, String> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 6 {
            return Err(format!(
                "expected 6 fields (sec min hour dom month dow), got {}",
                fields.len()
            ));
        }
        let mut days_of_week = parse_field(fields[5], 0, 7).map_err(|e| format!("day-of-week: {}", e))?;
        // 7 is an alias for Sunday
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }
        Ok(Self {
            source: fields.join(" "),
            seconds: parse_field(fields[0], 0, 59).map_err(|e| format!("seconds: {}", e))?,
            minutes: parse_field(fields[1], 0, 59).map_err(|e| format!("minutes: {}", e))?,
            hours: parse_field(fields[2], 0, 23).map_err(|e| format!("hours: {}", e))?,
            days_of_month: parse_field(fields[3], 1, 31).map_err(|e| format!("day-of-month: {}", e))?,
            months: parse_field(fields[4], 1, 12).map_err(|e| format!("month: {}", e))?,
            days_of_week,
        })
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        has(self.months, date.month())
            && has(self.days_of_month, date.day())
            && has(self.days_of_week, date.weekday().num_days_from_sunday())
    }

    /// Earliest matching time of day at or after `floor` (midnight if none).
    fn first_time_of_day(&self, floor: Option<NaiveTime>) -> Option<NaiveTime> {
        let (fh, fm, fs) = floor
            .map(|t| (t.hour(), t.minute(), t.second()))
            .unwrap_or((0, 0, 0));
        for h in (fh..24).filter(|h| has(self.hours, *h)) {
            let m_start = if h == fh { fm } else { 0 };
            for m in (m_start..60).filter(|m| has(self.minutes, *m)) {
                let s_start = if h == fh && m == fm { fs } else { 0 };
                if let Some(s) = (s_start..60).find(|s| has(self.seconds, *s)) {
                    return NaiveTime::from_hms_opt(h, m, s);
                }
            }
        }
        None
    }

    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = after.with_nanosecond(0)? + chrono::Duration::seconds(1);
        let first_day = start.date_naive();
        let mut date = first_day;
        for _ in 0..MAX_SEARCH_DAYS {
            if self.day_matches(date) {
                let floor = (date == first_day).then(|| start.time());
                if let Some(time) = self.first_time_of_day(floor) {
                    return Some(Utc.from_utc_datetime(&date.and_time(time)));
                }
            }
            date = date.succ_opt()?;
        }
        None
    }
}

fn has(mask: u64, value: u32) -> bool {
    mask & (1u64 << value) != 0
}

fn parse_field(field: &str, min: u32, max: u32) -> Result<u64, String> {
    let mut mask = 0u64;
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid step in '{}'", part))?;
                if step == 0 {
                    return Err(format!("step must be positive in '{}'", part));
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_value(a, min, max)?, parse_value(b, min, max)?)
        } else {
            let value = parse_value(range, min, max)?;
            // `n/step` runs from n to the end of the field
            if part.contains('/') { (value, max) } else { (value, value) }
        };
        if lo > hi {
            return Err(format!("range start after end in '{}'", part));
        }
        for value in (lo..=hi).step_by(step as usize) {
            mask |= 1u64 << value;
        }
    }
    Ok(mask)
}

fn parse_value(s: &str, min: u32, max: u32) -> Result<u32, String> {
    let value: u32 = s.parse().map_err(|_| format!("invalid value '{}'", s))?;
    if value < min || value > max {
        return Err(format!("value {} out of range {}-{}", value, min, max));
    }
    Ok(value)
}
