//! # Sensors
//!
//! Interval-evaluated instigators. A sensor sees its durable cursor, returns
//! run requests plus an optional new cursor, and relies on run keys to avoid
//! launching the same work twice. The cursor is only committed once the tick
//! has launched its runs, so an interrupted tick is re-evaluated from the
//! same cursor.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, instrument};

use super::coordinator::RunCoordinator;
use super::ticks::{CrashPoint, DebugCrashFlags, RunRequest, TickLaunchOutcome, TickRunLauncher};
use crate::constants::tags;
use crate::error::{DagflowError, Result};
use crate::logging::{log_error, log_tick_operation};
use crate::models::{InstigatorState, InstigatorStatus, InstigatorType, Tick};
use crate::state_machine::{TickEvent, TickStatus};
use crate::storage::{RunStorage, ScheduleStorage};

#[derive(Debug, Clone)]
pub struct SensorEvaluationContext {
    pub sensor_name: String,
    pub cursor: Option<String>,
    pub last_tick_time: Option<DateTime<Utc>>,
    pub evaluation_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SensorResult {
    pub run_requests: Vec<RunRequest>,
    pub cursor: Option<String>,
    pub skip_reason: Option<String>,
}

impl SensorResult {
    pub fn requests(run_requests: Vec<RunRequest>) -> Self {
        Self {
            run_requests,
            ..Self::default()
        }
    }

    pub fn skip(reason: impl Into<String>) -> Self {
        Self {
            skip_reason: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn with_cursor(mut self, cursor: impl Into<String>) -> Self {
        self.cursor = Some(cursor.into());
        self
    }
}

pub type SensorEvaluationFn =
    Arc<dyn Fn(&SensorEvaluationContext) -> std::result::Result<SensorResult, String> + Send + Sync>;

#[derive(Clone)]
pub struct SensorDefinition {
    name: String,
    job_name: String,
    min_interval: Duration,
    evaluation_fn: SensorEvaluationFn,
}

impl std::fmt::Debug for SensorDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SensorDefinition")
            .field("name", &self.name)
            .field("job_name", &self.job_name)
            .field("min_interval", &self.min_interval)
            .finish()
    }
}

impl SensorDefinition {
    pub fn new<F>(name: impl Into<String>, job_name: impl Into<String>, evaluation_fn: F) -> Self
    where
        F: Fn(&SensorEvaluationContext) -> std::result::Result<SensorResult, String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            job_name: job_name.into(),
            min_interval: Duration::from_secs(30),
            evaluation_fn: Arc::new(evaluation_fn),
        }
    }

    pub fn with_min_interval(mut self, min_interval: Duration) -> Self {
        self.min_interval = min_interval;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn origin_id(&self) -> String {
        format!("sensor:{}", self.name)
    }

    fn is_due(&self, last_tick: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match (last_tick, chrono::Duration::from_std(self.min_interval)) {
            (Some(last), Ok(interval)) => now - last >= interval,
            _ => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SensorTickResult {
    pub sensor_name: String,
    pub tick_id: i64,
    pub status: TickStatus,
    pub launched: TickLaunchOutcome,
}

pub struct SensorDaemon {
    sensors: Vec<SensorDefinition>,
    launcher: TickRunLauncher,
    poll_interval: Duration,
}

impl SensorDaemon {
    pub fn new(
        sensors: Vec<SensorDefinition>,
        run_storage: Arc<dyn RunStorage>,
        schedule_storage: Arc<dyn ScheduleStorage>,
        coordinator: Arc<dyn RunCoordinator>,
    ) -> Self {
        Self {
            sensors,
            launcher: TickRunLauncher::new(run_storage, schedule_storage, coordinator, DebugCrashFlags::none()),
            poll_interval: Duration::from_secs(5),
        }
    }

    /// How often the daemon loop checks whether any sensor is due
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn with_crash_flags(mut self, crash_flags: DebugCrashFlags) -> Self {
        self.launcher = self.launcher.with_crash_flags(crash_flags);
        self
    }

    fn storage(&self) -> &Arc<dyn ScheduleStorage> {
        self.launcher.schedule_storage()
    }

    pub async fn start_sensor(&self, name: &str, now: DateTime<Utc>) -> Result<InstigatorState> {
        let sensor = self
            .sensors
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| DagflowError::InvariantViolation(format!("Unknown sensor '{name}'")))?;
        let state = InstigatorState::running(sensor.origin_id(), InstigatorType::Sensor, now);
        self.storage().upsert_instigator_state(state.clone()).await?;
        Ok(state)
    }

    pub async fn stop_sensor(&self, name: &str) -> Result<()> {
        let Some(sensor) = self.sensors.iter().find(|s| s.name == name) else {
            return Ok(());
        };
        if let Some(mut state) = self.storage().get_instigator_state(&sensor.origin_id()).await? {
            state.status = InstigatorStatus::Stopped;
            self.storage().upsert_instigator_state(state).await?;
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn run_iteration(&self, now: DateTime<Utc>) -> Result<Vec<SensorTickResult>> {
        let mut results = Vec::new();
        for sensor in &self.sensors {
            match self.evaluate_sensor(sensor, now).await {
                Ok(Some(result)) => results.push(result),
                Ok(None) => {}
                Err(err @ DagflowError::SimulatedCrash(_)) => return Err(err),
                Err(err) => log_error("sensor_daemon", "evaluate_sensor", &err.to_string(), Some(sensor.name())),
            }
        }
        Ok(results)
    }

    async fn evaluate_sensor(&self, sensor: &SensorDefinition, now: DateTime<Utc>) -> Result<Option<SensorTickResult>> {
        let origin_id = sensor.origin_id();
        let Some(mut state) = self.storage().get_instigator_state(&origin_id).await? else {
            return Ok(None);
        };
        if state.status != InstigatorStatus::Running {
            return Ok(None);
        }

        let interrupted = self
            .storage()
            .get_latest_tick(&origin_id)
            .await?
            .filter(|tick| tick.status == TickStatus::Started);
        let mut tick = match interrupted {
            Some(tick) => {
                info!(sensor = %sensor.name, tick_id = tick.tick_id, "⏯️ SENSOR: Resuming interrupted tick");
                tick
            }
            None => {
                if !sensor.is_due(state.last_tick_timestamp, now) {
                    return Ok(None);
                }
                let tick = self
                    .storage()
                    .create_tick(Tick::new(&origin_id, &sensor.name, InstigatorType::Sensor, now))
                    .await?;
                self.launcher.check(CrashPoint::TickCreated)?;
                tick
            }
        };

        let context = SensorEvaluationContext {
            sensor_name: sensor.name.clone(),
            cursor: state.cursor.clone(),
            last_tick_time: state.last_tick_timestamp,
            evaluation_time: tick.timestamp,
        };

        let mut launched = TickLaunchOutcome::default();
        let mut new_cursor = None;
        let event = match (sensor.evaluation_fn)(&context) {
            Err(error) => TickEvent::Fail(error),
            Ok(result) => {
                new_cursor = result.cursor;
                if result.run_requests.is_empty() {
                    TickEvent::Skip(result.skip_reason)
                } else {
                    self.launcher.check(CrashPoint::TickHeld)?;
                    let identity = BTreeMap::from([(tags::SENSOR_NAME.to_string(), sensor.name.clone())]);
                    launched = self
                        .launcher
                        .launch_requests(&mut tick, &sensor.job_name, &identity, result.run_requests)
                        .await?;
                    if launched.launched.is_empty() {
                        TickEvent::Skip(Some("Run keys were already launched".to_string()))
                    } else {
                        TickEvent::Succeed
                    }
                }
            }
        };

        if new_cursor.is_some() {
            tick.cursor = new_cursor.clone();
        }
        let status = tick.finish(event)?;
        self.launcher.check(CrashPoint::TickSuccess)?;
        self.storage().update_tick(&tick).await?;

        if new_cursor.is_some() {
            state.cursor = new_cursor;
        }
        state.last_tick_timestamp = Some(tick.timestamp);
        self.storage().upsert_instigator_state(state).await?;

        log_tick_operation(
            "sensor_tick",
            &origin_id,
            Some(tick.tick_id),
            &status.to_string(),
            tick.error.as_deref().or(tick.skip_reason.as_deref()),
        );
        Ok(Some(SensorTickResult {
            sensor_name: sensor.name.clone(),
            tick_id: tick.tick_id,
            status,
            launched,
        }))
    }
}
