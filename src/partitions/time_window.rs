//! Time-windowed partitions.
//!
//! A definition enumerates the windows between consecutive ticks of a cadence,
//! beginning at the first tick at or after `start`. A window is a current
//! partition once it has ended, and `end_offset` shifts that cutoff by whole
//! windows in either direction.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use chrono_tz::Tz;
use sha2::{Digest, Sha256};
use std::collections::VecDeque;

use super::cadence::{localize, Cadence, CadenceWindows, ScheduleType, TimeWindow};
use super::PartitionError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeWindowPartitionsDefinition {
    cadence: Cadence,
    start: DateTime<Tz>,
    timezone: Tz,
    fmt: String,
    end_offset: i64,
}

impl TimeWindowPartitionsDefinition {
    /// `start` is formatted with `fmt` and interpreted in `timezone`.
    pub fn new(
        cron_schedule: &str,
        start: &str,
        fmt: &str,
        timezone: &str,
        end_offset: i64,
    ) -> Result<Self, PartitionError> {
        let cadence = Cadence::parse(cron_schedule)?;
        let timezone: Tz = timezone
            .parse()
            .map_err(|e| PartitionError::InvalidTimezone(format!("{timezone}: {e}")))?;
        let start = parse_key(start, fmt, &timezone).map_err(|e| PartitionError::InvalidStart {
            start: start.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            cadence,
            start,
            timezone,
            fmt: fmt.to_string(),
            end_offset,
        })
    }

    pub fn for_schedule_type(
        schedule_type: ScheduleType,
        start: &str,
        timezone: &str,
        offsets: CadenceOffsets,
        end_offset: i64,
    ) -> Result<Self, PartitionError> {
        let cron = schedule_type.cron_expression(offsets.minute, offsets.hour, offsets.day);
        Self::new(&cron, start, schedule_type.default_fmt(), timezone, end_offset)
    }

    pub fn hourly(start: &str) -> Result<Self, PartitionError> {
        Self::for_schedule_type(ScheduleType::Hourly, start, "UTC", CadenceOffsets::default(), 0)
    }

    pub fn daily(start: &str) -> Result<Self, PartitionError> {
        Self::for_schedule_type(ScheduleType::Daily, start, "UTC", CadenceOffsets::default(), 0)
    }

    /// Weeks starting on Sunday
    pub fn weekly(start: &str) -> Result<Self, PartitionError> {
        Self::for_schedule_type(ScheduleType::Weekly, start, "UTC", CadenceOffsets::default(), 0)
    }

    pub fn monthly(start: &str) -> Result<Self, PartitionError> {
        let offsets = CadenceOffsets {
            day: 1,
            ..CadenceOffsets::default()
        };
        Self::for_schedule_type(ScheduleType::Monthly, start, "UTC", offsets, 0)
    }

    pub fn with_end_offset(mut self, end_offset: i64) -> Self {
        self.end_offset = end_offset;
        self
    }

    pub fn cadence(&self) -> &Cadence {
        &self.cadence
    }

    pub fn start(&self) -> DateTime<Tz> {
        self.start
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn fmt(&self) -> &str {
        &self.fmt
    }

    pub fn end_offset(&self) -> i64 {
        self.end_offset
    }

    pub fn schedule_type(&self) -> Option<ScheduleType> {
        self.cadence.schedule_type()
    }

    /// All windows from the first tick at or after `from`, unbounded.
    pub fn iterate_time_windows(&self, from: DateTime<Tz>) -> CadenceWindows {
        CadenceWindows::new(&self.cadence, from)
    }

    /// Current partition windows as of `now`, oldest first.
    pub fn time_windows(&self, now: DateTime<Utc>) -> PartitionWindows {
        get_partitions_in_window(&self.cadence, self.start, now, self.end_offset)
    }

    pub fn partition_key_for_window(&self, window: &TimeWindow) -> String {
        window.start.format(&self.fmt).to_string()
    }

    pub fn get_partition_keys(&self, now: DateTime<Utc>) -> Vec<String> {
        self.time_windows(now)
            .map(|w| self.partition_key_for_window(&w))
            .collect()
    }

    /// Window whose start is the first tick at or after the parsed key.
    pub fn time_window_for_partition_key(&self, key: &str) -> Result<TimeWindow, PartitionError> {
        let instant = parse_key(key, &self.fmt, &self.timezone)?;
        self.iterate_time_windows(instant)
            .next()
            .ok_or_else(|| PartitionError::InvalidKey {
                key: key.to_string(),
                reason: "no cadence tick follows this key".to_string(),
            })
    }

    /// Whether the key names a window of this definition, ignoring `now`.
    pub fn is_valid_partition_key(&self, key: &str) -> bool {
        self.time_window_for_partition_key(key)
            .map(|window| window.start >= self.start && self.partition_key_for_window(&window) == key)
            .unwrap_or(false)
    }

    pub fn has_partition_key(&self, key: &str, now: DateTime<Utc>) -> bool {
        if !self.is_valid_partition_key(key) {
            return false;
        }
        match (self.time_window_for_partition_key(key), self.partitions_cutoff(now)) {
            (Ok(window), Some(cutoff)) => window.end <= cutoff,
            _ => false,
        }
    }

    /// End of the last current window as of `now`, found without walking
    /// every window from the start.
    pub fn partitions_cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Tz>> {
        let first_tick = self.cadence.first_tick_at_or_after(&self.start)?;
        let now = now.with_timezone(&self.timezone);
        let mut cutoff = self
            .cadence
            .last_tick_at_or_before(&now, &self.start)
            .unwrap_or(first_tick);

        if self.end_offset >= 0 {
            for _ in 0..self.end_offset {
                cutoff = self.cadence.next_tick_after(&cutoff)?;
            }
        } else {
            for _ in 0..self.end_offset.unsigned_abs() {
                if cutoff <= first_tick {
                    return None;
                }
                cutoff = self.previous_tick(&cutoff)?;
            }
        }

        (cutoff > first_tick).then_some(cutoff)
    }

    /// Last tick strictly before `tick`.
    pub(crate) fn previous_tick(&self, tick: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        let just_before = *tick - chrono::Duration::seconds(1);
        self.cadence.last_tick_at_or_before(&just_before, &self.start)
    }

    pub fn get_first_partition_window(&self, now: DateTime<Utc>) -> Option<TimeWindow> {
        self.time_windows(now).next()
    }

    pub fn get_last_partition_window(&self, now: DateTime<Utc>) -> Option<TimeWindow> {
        let cutoff = self.partitions_cutoff(now)?;
        let start = self.previous_tick(&cutoff)?;
        Some(TimeWindow::new(start, cutoff))
    }

    pub fn get_next_partition_key(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, PartitionError> {
        let window = self.time_window_for_partition_key(key)?;
        let cutoff = match self.partitions_cutoff(now) {
            Some(cutoff) => cutoff,
            None => return Ok(None),
        };
        Ok(self
            .iterate_time_windows(window.end)
            .next()
            .filter(|next| next.end <= cutoff)
            .map(|next| self.partition_key_for_window(&next)))
    }

    pub fn less_than(&self, a: &str, b: &str) -> Result<bool, PartitionError> {
        Ok(self.time_window_for_partition_key(a)?.start < self.time_window_for_partition_key(b)?.start)
    }

    /// Window containing `timestamp`, if it is not before the first window.
    pub fn time_window_for_timestamp(&self, timestamp: DateTime<Utc>) -> Option<TimeWindow> {
        let instant = timestamp.with_timezone(&self.timezone);
        let start = self.cadence.last_tick_at_or_before(&instant, &self.start)?;
        let end = self.cadence.next_tick_after(&start)?;
        Some(TimeWindow::new(start, end))
    }

    /// Key of the window containing `timestamp`. With `end_closed`, a timestamp
    /// exactly on a boundary belongs to the window that ends there.
    pub fn partition_key_for_timestamp(
        &self,
        timestamp: DateTime<Utc>,
        end_closed: bool,
    ) -> Option<String> {
        let mut window = self.time_window_for_timestamp(timestamp)?;
        if end_closed && window.start == timestamp {
            let previous_start = self.previous_tick(&window.start)?;
            window = TimeWindow::new(previous_start, window.start);
        }
        Some(self.partition_key_for_window(&window))
    }

    /// Keys from `start_key` through `end_key` inclusive, limited to current partitions.
    pub fn get_partition_keys_in_range(
        &self,
        start_key: &str,
        end_key: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, PartitionError> {
        let first = self.time_window_for_partition_key(start_key)?;
        let last = self.time_window_for_partition_key(end_key)?;
        let cutoff = match self.partitions_cutoff(now) {
            Some(cutoff) => cutoff,
            None => return Ok(Vec::new()),
        };
        let from = std::cmp::max(first.start, self.start);

        Ok(self
            .iterate_time_windows(from)
            .take_while(|w| w.start <= last.start && w.end <= cutoff)
            .map(|w| self.partition_key_for_window(&w))
            .collect())
    }

    /// Stable identifier for detecting definition changes in cached state.
    pub fn serializable_unique_identifier(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.cadence.expression().as_bytes());
        hasher.update(self.start.timestamp().to_string().as_bytes());
        hasher.update(self.timezone.name().as_bytes());
        hasher.update(self.fmt.as_bytes());
        hasher.update(self.end_offset.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Minute / hour / day offsets for the shorthand constructors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CadenceOffsets {
    pub minute: u32,
    pub hour: u32,
    /// Weekday (0 = Sunday) for weekly cadences, day of month for monthly
    pub day: u32,
}

/// Enumerate partition windows from the first tick at or after `start`.
///
/// Windows that have ended by `now` are included; a positive `end_offset`
/// admits that many windows past `now`, a negative one drops that many of the
/// most recent windows.
pub fn get_partitions_in_window(
    cadence: &Cadence,
    start: DateTime<Tz>,
    now: DateTime<Utc>,
    end_offset: i64,
) -> PartitionWindows {
    PartitionWindows {
        windows: CadenceWindows::new(cadence, start),
        now: now.with_timezone(&start.timezone()),
        end_offset,
        past_now: 0,
        held: VecDeque::new(),
        exhausted: false,
    }
}

/// Lazy, finite sequence of current partition windows.
#[derive(Debug, Clone)]
pub struct PartitionWindows {
    windows: CadenceWindows,
    now: DateTime<Tz>,
    end_offset: i64,
    past_now: i64,
    /// Look-ahead buffer used to drop the trailing windows for negative offsets
    held: VecDeque<TimeWindow>,
    exhausted: bool,
}

impl PartitionWindows {
    fn next_admitted(&mut self) -> Option<TimeWindow> {
        if self.exhausted {
            return None;
        }
        let window = self.windows.next()?;
        if window.end <= self.now {
            return Some(window);
        }
        if self.past_now < self.end_offset {
            self.past_now += 1;
            return Some(window);
        }
        self.exhausted = true;
        None
    }
}

impl Iterator for PartitionWindows {
    type Item = TimeWindow;

    fn next(&mut self) -> Option<Self::Item> {
        if self.end_offset >= 0 {
            return self.next_admitted();
        }

        let lag = self.end_offset.unsigned_abs() as usize;
        while self.held.len() <= lag {
            let window = self.next_admitted()?;
            self.held.push_back(window);
        }
        self.held.pop_front()
    }
}

fn parse_key(key: &str, fmt: &str, timezone: &Tz) -> Result<DateTime<Tz>, PartitionError> {
    let naive = NaiveDateTime::parse_from_str(key, fmt)
        .or_else(|_| {
            NaiveDate::parse_from_str(key, fmt).map(|date| date.and_time(chrono::NaiveTime::MIN))
        })
        .map_err(|e| PartitionError::InvalidKey {
            key: key.to_string(),
            reason: format!("does not match format '{fmt}': {e}"),
        })?;
    localize(timezone, naive)
}
