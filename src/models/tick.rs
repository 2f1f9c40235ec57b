use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state_machine::{tick_target_state, StateMachineResult, TickEvent, TickStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstigatorType {
    Schedule,
    Sensor,
}

/// One evaluation attempt of a schedule or sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub tick_id: i64,
    pub origin_id: String,
    pub instigator_name: String,
    pub instigator_type: InstigatorType,
    pub status: TickStatus,
    /// Scheduled execution time for schedules, evaluation time for sensors
    pub timestamp: DateTime<Utc>,
    pub run_ids: Vec<Uuid>,
    pub run_keys: Vec<String>,
    pub error: Option<String>,
    pub skip_reason: Option<String>,
    pub cursor: Option<String>,
    /// Consecutive failed evaluations of this same tick
    pub failure_count: u32,
}

impl Tick {
    pub fn new(
        origin_id: impl Into<String>,
        instigator_name: impl Into<String>,
        instigator_type: InstigatorType,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            tick_id: 0,
            origin_id: origin_id.into(),
            instigator_name: instigator_name.into(),
            instigator_type,
            status: TickStatus::Started,
            timestamp,
            run_ids: Vec::new(),
            run_keys: Vec::new(),
            error: None,
            skip_reason: None,
            cursor: None,
            failure_count: 0,
        }
    }

    pub fn add_run(&mut self, run_id: Uuid, run_key: Option<&str>) {
        if !self.run_ids.contains(&run_id) {
            self.run_ids.push(run_id);
        }
        if let Some(run_key) = run_key {
            if !self.run_keys.iter().any(|k| k == run_key) {
                self.run_keys.push(run_key.to_string());
            }
        }
    }

    pub fn finish(&mut self, event: TickEvent) -> StateMachineResult<TickStatus> {
        let target = tick_target_state(self.status, &event)?;
        match event {
            TickEvent::Skip(reason) => self.skip_reason = reason,
            TickEvent::Fail(error) => {
                self.error = Some(error);
                self.failure_count += 1;
            }
            TickEvent::Succeed => {}
        }
        self.status = target;
        Ok(target)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstigatorStatus {
    Running,
    Stopped,
}

/// Durable state of a schedule or sensor between ticks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstigatorState {
    pub origin_id: String,
    pub instigator_type: InstigatorType,
    pub status: InstigatorStatus,
    /// When the instigator was turned on; catch-up never reaches before this
    pub start_timestamp: DateTime<Utc>,
    pub cursor: Option<String>,
    pub last_tick_timestamp: Option<DateTime<Utc>>,
}

impl InstigatorState {
    pub fn running(
        origin_id: impl Into<String>,
        instigator_type: InstigatorType,
        start_timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            origin_id: origin_id.into(),
            instigator_type,
            status: InstigatorStatus::Running,
            start_timestamp,
            cursor: None,
            last_tick_timestamp: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_run_is_idempotent() {
        let mut tick = Tick::new("schedule:daily", "daily", InstigatorType::Schedule, Utc::now());
        let run_id = Uuid::new_v4();
        tick.add_run(run_id, Some("2021-05-05"));
        tick.add_run(run_id, Some("2021-05-05"));
        assert_eq!(tick.run_ids, vec![run_id]);
        assert_eq!(tick.run_keys, vec!["2021-05-05".to_string()]);
    }

    #[test]
    fn test_failure_records_error() {
        let mut tick = Tick::new("sensor:s", "s", InstigatorType::Sensor, Utc::now());
        assert_eq!(
            tick.finish(TickEvent::Fail("bad cursor".into())).unwrap(),
            TickStatus::Failure
        );
        assert_eq!(tick.error.as_deref(), Some("bad cursor"));
        assert_eq!(tick.failure_count, 1);
        assert!(tick.finish(TickEvent::Succeed).is_err());
    }
}
