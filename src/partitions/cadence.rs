//! Cron cadences and the half-open time windows between consecutive ticks.

use chrono::{DateTime, Duration, TimeZone};
use chrono_tz::Tz;
use cron::Schedule;
use std::fmt;
use std::str::FromStr;

use super::PartitionError;

const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Half-open interval `[start, end)` between two consecutive cadence ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeWindow {
    pub start: DateTime<Tz>,
    pub end: DateTime<Tz>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Tz>, end: DateTime<Tz>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, instant: &DateTime<Tz>) -> bool {
        self.start <= *instant && *instant < self.end
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

/// Shorthand cadences with their conventional partition key formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScheduleType {
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

impl ScheduleType {
    pub fn default_fmt(&self) -> &'static str {
        match self {
            Self::Hourly => "%Y-%m-%d-%H:%M",
            Self::Daily | Self::Weekly | Self::Monthly => "%Y-%m-%d",
        }
    }

    /// Cron expression for this schedule type. `day_offset` is the weekday
    /// (0 = Sunday) for weekly cadences and the day of month for monthly ones.
    pub fn cron_expression(&self, minute_offset: u32, hour_offset: u32, day_offset: u32) -> String {
        match self {
            Self::Hourly => format!("{minute_offset} * * * *"),
            Self::Daily => format!("{minute_offset} {hour_offset} * * *"),
            Self::Weekly => format!("{minute_offset} {hour_offset} * * {day_offset}"),
            Self::Monthly => format!("{minute_offset} {hour_offset} {} * *", day_offset.max(1)),
        }
    }

    /// Upper bound on the distance between two ticks.
    fn max_period(&self) -> Duration {
        match self {
            Self::Hourly => Duration::hours(2),
            Self::Daily => Duration::days(2),
            Self::Weekly => Duration::days(8),
            Self::Monthly => Duration::days(32),
        }
    }
}

/// A parsed five-field cron expression.
#[derive(Debug, Clone)]
pub struct Cadence {
    expression: String,
    schedule: Schedule,
}

impl PartialEq for Cadence {
    fn eq(&self, other: &Self) -> bool {
        self.expression == other.expression
    }
}

impl Eq for Cadence {}

impl Cadence {
    /// Parse a standard five-field expression (minute hour day-of-month month day-of-week).
    pub fn parse(expression: &str) -> Result<Self, PartitionError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(PartitionError::InvalidCron {
                expression: expression.to_string(),
                reason: format!("expected 5 fields, found {}", fields.len()),
            });
        }

        let day_of_week = normalize_day_of_week(fields[4]);
        let normalized = format!(
            "0 {} {} {} {} {}",
            fields[0], fields[1], fields[2], fields[3], day_of_week
        );
        let schedule = Schedule::from_str(&normalized).map_err(|e| PartitionError::InvalidCron {
            expression: expression.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            expression: fields.join(" "),
            schedule,
        })
    }

    pub fn for_schedule_type(
        schedule_type: ScheduleType,
        minute_offset: u32,
        hour_offset: u32,
        day_offset: u32,
    ) -> Result<Self, PartitionError> {
        Self::parse(&schedule_type.cron_expression(minute_offset, hour_offset, day_offset))
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Infer the shorthand schedule type, if the expression matches one.
    pub fn schedule_type(&self) -> Option<ScheduleType> {
        let fields: Vec<&str> = self.expression.split(' ').collect();
        let fixed = |f: &str| !f.is_empty() && f != "*" && !f.contains([',', '-', '/']);
        match (fields[0], fields[1], fields[2], fields[3], fields[4]) {
            (m, "*", "*", "*", "*") if fixed(m) => Some(ScheduleType::Hourly),
            (m, h, "*", "*", "*") if fixed(m) && fixed(h) => Some(ScheduleType::Daily),
            (m, h, "*", "*", d) if fixed(m) && fixed(h) && fixed(d) => Some(ScheduleType::Weekly),
            (m, h, d, "*", "*") if fixed(m) && fixed(h) && fixed(d) => Some(ScheduleType::Monthly),
            _ => None,
        }
    }

    /// First tick at or after `instant`.
    pub fn first_tick_at_or_after(&self, instant: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        self.schedule
            .after(&(*instant - Duration::seconds(1)))
            .next()
    }

    /// First tick strictly after `instant`.
    pub fn next_tick_after(&self, instant: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        self.schedule.after(instant).next()
    }

    /// Ticks at or after `from`, in order.
    pub fn ticks_from(&self, from: DateTime<Tz>) -> CadenceTicks {
        CadenceTicks {
            cadence: self.clone(),
            next: self.first_tick_at_or_after(&from),
        }
    }

    /// Last tick at or before `instant`, searching no earlier than `floor`.
    pub fn last_tick_at_or_before(
        &self,
        instant: &DateTime<Tz>,
        floor: &DateTime<Tz>,
    ) -> Option<DateTime<Tz>> {
        let anchor = match self.schedule_type() {
            Some(schedule_type) => std::cmp::max(*instant - schedule_type.max_period(), *floor),
            None => *floor,
        };
        self.ticks_from(anchor)
            .take_while(|tick| tick <= instant)
            .last()
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.expression)
    }
}

/// Lazy iterator over cadence ticks.
#[derive(Debug, Clone)]
pub struct CadenceTicks {
    cadence: Cadence,
    next: Option<DateTime<Tz>>,
}

impl Iterator for CadenceTicks {
    type Item = DateTime<Tz>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next.take()?;
        self.next = self.cadence.next_tick_after(&current);
        Some(current)
    }
}

/// Lazy iterator over consecutive windows of a cadence.
#[derive(Debug, Clone)]
pub struct CadenceWindows {
    ticks: CadenceTicks,
    previous: Option<DateTime<Tz>>,
}

impl CadenceWindows {
    pub fn new(cadence: &Cadence, from: DateTime<Tz>) -> Self {
        let mut ticks = cadence.ticks_from(from);
        let previous = ticks.next();
        Self { ticks, previous }
    }
}

impl Iterator for CadenceWindows {
    type Item = TimeWindow;

    fn next(&mut self) -> Option<Self::Item> {
        let start = self.previous?;
        let end = self.ticks.next()?;
        self.previous = Some(end);
        Some(TimeWindow::new(start, end))
    }
}

/// The `cron` crate numbers weekdays 1-7 from Sunday; standard cron uses 0-6.
/// Numeric weekdays are rewritten to names so either convention parses the same.
fn normalize_day_of_week(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars().peekable();
    let mut after_step = false;
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            let mut number = String::from(c);
            while let Some(d) = chars.peek().copied().filter(char::is_ascii_digit) {
                number.push(d);
                chars.next();
            }
            match number.parse::<usize>() {
                Ok(n) if !after_step && n <= 7 => out.push_str(DAY_NAMES[n % 7]),
                _ => out.push_str(&number),
            }
            after_step = false;
        } else {
            after_step = c == '/';
            out.push(c);
        }
    }
    out
}

/// Localize a naive wall-clock time, rejecting times skipped by a DST change.
pub(crate) fn localize(
    timezone: &Tz,
    naive: chrono::NaiveDateTime,
) -> Result<DateTime<Tz>, PartitionError> {
    timezone
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| PartitionError::InvalidKey {
            key: naive.to_string(),
            reason: format!("does not exist in timezone {timezone}"),
        })
}
