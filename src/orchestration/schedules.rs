//! # Scheduler
//!
//! Cron-driven instigators. Each pass of [`SchedulerDaemon`] walks every
//! running schedule through:
//!
//! 1. **Resume**: a tick left `STARTED` by an interrupted pass is finished first
//! 2. **Catch-up**: every cadence tick after the last evaluated one, up to
//!    `now`, keeping only the latest `max_catchup_runs`
//! 3. **Evaluate**: one tick per scheduled time; requests are launched through
//!    [`TickRunLauncher`] so a tick that is evaluated twice never creates a
//!    second run
//!
//! Evaluation functions must be deterministic for a given scheduled time; a
//! resumed tick evaluates again and relies on run identity tags to match the
//! runs it already created.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use super::coordinator::RunCoordinator;
use super::ticks::{CrashPoint, DebugCrashFlags, RunRequest, TickLaunchOutcome, TickRunLauncher};
use crate::config::SchedulerConfig;
use crate::constants::tags;
use crate::error::{DagflowError, Result};
use crate::logging::{log_error, log_tick_operation};
use crate::models::{InstigatorState, InstigatorStatus, InstigatorType, Tick};
use crate::partitions::{Cadence, PartitionError, TimeWindowPartitionsDefinition};
use crate::state_machine::{TickEvent, TickStatus};
use crate::storage::{RunStorage, ScheduleStorage};

/// Input to a schedule's evaluation function
#[derive(Debug, Clone)]
pub struct ScheduleEvaluationContext {
    pub schedule_name: String,
    pub scheduled_execution_time: DateTime<Tz>,
}

pub type ScheduleEvaluationFn =
    Arc<dyn Fn(&ScheduleEvaluationContext) -> std::result::Result<Vec<RunRequest>, String> + Send + Sync>;

#[derive(Clone)]
pub struct ScheduleDefinition {
    name: String,
    job_name: String,
    cadence: Cadence,
    timezone: Tz,
    evaluation_fn: ScheduleEvaluationFn,
}

impl std::fmt::Debug for ScheduleDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduleDefinition")
            .field("name", &self.name)
            .field("job_name", &self.job_name)
            .field("cadence", &self.cadence.expression())
            .field("timezone", &self.timezone)
            .finish()
    }
}

impl ScheduleDefinition {
    /// A schedule requesting one unconfigured run of `job_name` per cron tick, in UTC
    pub fn new(
        name: impl Into<String>,
        job_name: impl Into<String>,
        cron_schedule: &str,
    ) -> std::result::Result<Self, PartitionError> {
        Ok(Self {
            name: name.into(),
            job_name: job_name.into(),
            cadence: Cadence::parse(cron_schedule)?,
            timezone: Tz::UTC,
            evaluation_fn: Arc::new(single_run_request),
        })
    }

    /// One run per time partition, launched once the partition's window has
    /// closed. The partition key doubles as run key.
    pub fn for_partitions(
        name: impl Into<String>,
        job_name: impl Into<String>,
        partitions_def: TimeWindowPartitionsDefinition,
    ) -> Self {
        let cadence = partitions_def.cadence().clone();
        let timezone = partitions_def.timezone();
        let evaluation_fn: ScheduleEvaluationFn = Arc::new(
            move |ctx: &ScheduleEvaluationContext| -> std::result::Result<Vec<RunRequest>, String> {
                let scheduled = ctx.scheduled_execution_time.with_timezone(&Utc);
                Ok(partitions_def
                    .partition_key_for_timestamp(scheduled, true)
                    .map(|key| {
                        RunRequest::new(json!({}))
                            .with_run_key(key.clone())
                            .for_partition(key)
                    })
                    .into_iter()
                    .collect())
            },
        );
        Self {
            name: name.into(),
            job_name: job_name.into(),
            cadence,
            timezone,
            evaluation_fn,
        }
    }

    pub fn with_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }

    pub fn with_evaluation_fn<F>(mut self, evaluation_fn: F) -> Self
    where
        F: Fn(&ScheduleEvaluationContext) -> std::result::Result<Vec<RunRequest>, String> + Send + Sync + 'static,
    {
        self.evaluation_fn = Arc::new(evaluation_fn);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn cadence(&self) -> &Cadence {
        &self.cadence
    }

    pub fn origin_id(&self) -> String {
        format!("schedule:{}", self.name)
    }

    /// Cadence ticks strictly after `after` (or at/after `floor` when there is
    /// no previous tick) and at or before `now`
    fn ticks_between(&self, floor: DateTime<Utc>, after: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Vec<DateTime<Tz>> {
        let floor = floor.with_timezone(&self.timezone);
        let first = match after {
            Some(after) => self
                .cadence
                .next_tick_after(&std::cmp::max(after.with_timezone(&self.timezone), floor)),
            None => self.cadence.first_tick_at_or_after(&floor),
        };
        let Some(first) = first else {
            return Vec::new();
        };
        self.cadence
            .ticks_from(first)
            .take_while(|tick| tick.with_timezone(&Utc) <= now)
            .collect()
    }
}

fn single_run_request(_: &ScheduleEvaluationContext) -> std::result::Result<Vec<RunRequest>, String> {
    Ok(vec![RunRequest::new(json!({}))])
}

/// What happened to one schedule in a pass
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleTickResult {
    pub schedule_name: String,
    pub tick_id: i64,
    pub status: TickStatus,
    pub timestamp: DateTime<Utc>,
    pub launched: TickLaunchOutcome,
}

pub struct SchedulerDaemon {
    schedules: Vec<ScheduleDefinition>,
    launcher: TickRunLauncher,
    config: SchedulerConfig,
}

impl SchedulerDaemon {
    pub fn new(
        schedules: Vec<ScheduleDefinition>,
        run_storage: Arc<dyn RunStorage>,
        schedule_storage: Arc<dyn ScheduleStorage>,
        coordinator: Arc<dyn RunCoordinator>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            schedules,
            launcher: TickRunLauncher::new(run_storage, schedule_storage, coordinator, DebugCrashFlags::none()),
            config,
        }
    }

    pub fn with_crash_flags(mut self, crash_flags: DebugCrashFlags) -> Self {
        self.launcher = self.launcher.with_crash_flags(crash_flags);
        self
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.config.poll_interval_seconds)
    }

    fn storage(&self) -> &Arc<dyn ScheduleStorage> {
        self.launcher.schedule_storage()
    }

    fn schedule(&self, name: &str) -> Option<&ScheduleDefinition> {
        self.schedules.iter().find(|s| s.name == name)
    }

    /// Turn a schedule on. Catch-up never reaches before `now`.
    pub async fn start_schedule(&self, name: &str, now: DateTime<Utc>) -> Result<InstigatorState> {
        let schedule = self
            .schedule(name)
            .ok_or_else(|| DagflowError::InvariantViolation(format!("Unknown schedule '{name}'")))?;
        let state = InstigatorState::running(schedule.origin_id(), InstigatorType::Schedule, now);
        self.storage().upsert_instigator_state(state.clone()).await?;
        Ok(state)
    }

    pub async fn stop_schedule(&self, name: &str) -> Result<()> {
        if let Some(schedule) = self.schedule(name) {
            if let Some(mut state) = self.storage().get_instigator_state(&schedule.origin_id()).await? {
                state.status = InstigatorStatus::Stopped;
                self.storage().upsert_instigator_state(state).await?;
            }
        }
        Ok(())
    }

    /// One scheduler pass as of `now`. A failure in one schedule is logged
    /// and does not stop the others; simulated crashes propagate.
    #[instrument(skip(self))]
    pub async fn run_iteration(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleTickResult>> {
        let mut results = Vec::new();
        for schedule in &self.schedules {
            match self.evaluate_schedule(schedule, now, &mut results).await {
                Ok(()) => {}
                Err(err @ DagflowError::SimulatedCrash(_)) => return Err(err),
                Err(err) => log_error("scheduler", "evaluate_schedule", &err.to_string(), Some(schedule.name())),
            }
        }
        Ok(results)
    }

    async fn evaluate_schedule(
        &self,
        schedule: &ScheduleDefinition,
        now: DateTime<Utc>,
        results: &mut Vec<ScheduleTickResult>,
    ) -> Result<()> {
        let origin_id = schedule.origin_id();
        let Some(mut state) = self.storage().get_instigator_state(&origin_id).await? else {
            return Ok(());
        };
        if state.status != InstigatorStatus::Running {
            return Ok(());
        }

        let latest = self.storage().get_latest_tick(&origin_id).await?;
        if let Some(tick) = latest.clone().filter(|tick| tick.status == TickStatus::Started) {
            info!(schedule = %schedule.name, tick_id = tick.tick_id, "⏯️ SCHEDULER: Resuming interrupted tick");
            let result = self.process_tick(schedule, tick).await?;
            state.last_tick_timestamp = Some(result.timestamp);
            self.storage().upsert_instigator_state(state.clone()).await?;
            results.push(result);
        }

        let mut due = schedule.ticks_between(state.start_timestamp, state.last_tick_timestamp, now);
        if due.len() > self.config.max_catchup_runs {
            warn!(
                schedule = %schedule.name,
                due = due.len(),
                max_catchup_runs = self.config.max_catchup_runs,
                "Skipping missed ticks beyond the catch-up limit"
            );
            due.drain(..due.len() - self.config.max_catchup_runs);
        }

        for scheduled in due {
            let timestamp = scheduled.with_timezone(&Utc);
            let mut tick = Tick::new(&origin_id, &schedule.name, InstigatorType::Schedule, timestamp);
            let previous = self.storage().get_latest_tick(&origin_id).await?;
            if let Some(previous) = previous.filter(|t| t.timestamp == timestamp && t.status == TickStatus::Failure) {
                tick.failure_count = previous.failure_count;
            }
            let tick = self.storage().create_tick(tick).await?;
            self.launcher.check(CrashPoint::TickCreated)?;

            let result = self.process_tick(schedule, tick).await?;
            let retry = result.status == TickStatus::Failure && self.failure_count(&origin_id).await? <= self.config.max_tick_retries;
            results.push(result);
            if retry {
                debug!(schedule = %schedule.name, "Tick failed; retrying on the next pass");
                break;
            }
            state.last_tick_timestamp = Some(timestamp);
            self.storage().upsert_instigator_state(state.clone()).await?;
        }
        Ok(())
    }

    async fn failure_count(&self, origin_id: &str) -> Result<u32> {
        Ok(self
            .storage()
            .get_latest_tick(origin_id)
            .await?
            .map_or(0, |tick| tick.failure_count))
    }

    async fn process_tick(&self, schedule: &ScheduleDefinition, mut tick: Tick) -> Result<ScheduleTickResult> {
        let scheduled_execution_time = tick.timestamp.with_timezone(&schedule.timezone);
        let context = ScheduleEvaluationContext {
            schedule_name: schedule.name.clone(),
            scheduled_execution_time,
        };

        let mut launched = TickLaunchOutcome::default();
        let event = match (schedule.evaluation_fn)(&context) {
            Err(error) => TickEvent::Fail(error),
            Ok(requests) if requests.is_empty() => TickEvent::Skip(Some("Schedule returned no run requests".to_string())),
            Ok(requests) => {
                self.launcher.check(CrashPoint::TickHeld)?;
                let identity = BTreeMap::from([
                    (tags::SCHEDULE_NAME.to_string(), schedule.name.clone()),
                    (tags::SCHEDULED_EXECUTION_TIME.to_string(), scheduled_execution_time.to_rfc3339()),
                ]);
                launched = self
                    .launcher
                    .launch_requests(&mut tick, &schedule.job_name, &identity, requests)
                    .await?;
                if launched.launched.is_empty() {
                    TickEvent::Skip(Some("Run keys were already launched".to_string()))
                } else {
                    TickEvent::Succeed
                }
            }
        };

        let status = tick.finish(event)?;
        self.launcher.check(CrashPoint::TickSuccess)?;
        self.storage().update_tick(&tick).await?;
        log_tick_operation(
            "schedule_tick",
            &tick.origin_id,
            Some(tick.tick_id),
            &status.to_string(),
            tick.error.as_deref().or(tick.skip_reason.as_deref()),
        );
        Ok(ScheduleTickResult {
            schedule_name: schedule.name.clone(),
            tick_id: tick.tick_id,
            status,
            timestamp: tick.timestamp,
            launched,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RunFilter;
    use crate::orchestration::testing::{queued_stack, QueuedStack};
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, hour, minute, 0).unwrap()
    }

    fn daemon(stack: &QueuedStack, schedules: Vec<ScheduleDefinition>, config: SchedulerConfig) -> SchedulerDaemon {
        SchedulerDaemon::new(
            schedules,
            stack.run_storage.clone(),
            stack.schedule_storage.clone(),
            stack.coordinator.clone(),
            config,
        )
    }

    async fn run_count(stack: &QueuedStack) -> usize {
        stack.run_storage.get_runs_count(&RunFilter::default()).await.unwrap()
    }

    #[tokio::test]
    async fn test_catch_up_is_bounded() {
        let stack = queued_stack();
        let hourly = ScheduleDefinition::new("hourly", "etl", "0 * * * *").unwrap();
        let scheduler = daemon(&stack, vec![hourly], SchedulerConfig::default());
        scheduler.start_schedule("hourly", at(0, 30)).await.unwrap();

        let results = scheduler.run_iteration(at(10, 5)).await.unwrap();
        assert_eq!(results.len(), 5);
        assert_eq!(results[0].timestamp, at(6, 0));
        assert!(results.iter().all(|r| r.status == TickStatus::Success));
        assert_eq!(run_count(&stack).await, 5);

        assert!(scheduler.run_iteration(at(10, 30)).await.unwrap().is_empty());
        assert_eq!(scheduler.run_iteration(at(11, 0)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_crash_after_run_created_launches_exactly_one_run() {
        let stack = queued_stack();
        let daily = || ScheduleDefinition::new("daily", "etl", "0 6 * * *").unwrap();

        let crashing = daemon(&stack, vec![daily()], SchedulerConfig::default())
            .with_crash_flags(DebugCrashFlags::none().crash_at(CrashPoint::RunCreated));
        crashing.start_schedule("daily", at(0, 0)).await.unwrap();
        assert!(crashing.run_iteration(at(7, 0)).await.is_err());
        assert_eq!(run_count(&stack).await, 1);

        let restarted = daemon(&stack, vec![daily()], SchedulerConfig::default());
        let results = restarted.run_iteration(at(7, 1)).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, TickStatus::Success);
        assert_eq!(run_count(&stack).await, 1);

        let runs = stack.run_storage.get_runs(&RunFilter::default(), None, None).await.unwrap();
        assert_eq!(runs[0].status, crate::state_machine::RunStatus::Queued);
        assert_eq!(runs[0].tag(tags::SCHEDULE_NAME), Some("daily"));
        assert_eq!(results[0].launched.launched, vec![runs[0].run_id]);
    }

    #[tokio::test]
    async fn test_crash_before_tick_closes_is_resumed() {
        let stack = queued_stack();
        let daily = || ScheduleDefinition::new("daily", "etl", "0 6 * * *").unwrap();
        let crashing = daemon(&stack, vec![daily()], SchedulerConfig::default())
            .with_crash_flags(DebugCrashFlags::none().crash_at(CrashPoint::TickSuccess));
        crashing.start_schedule("daily", at(0, 0)).await.unwrap();
        assert!(crashing.run_iteration(at(7, 0)).await.is_err());

        let restarted = daemon(&stack, vec![daily()], SchedulerConfig::default());
        let results = restarted.run_iteration(at(7, 1)).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(run_count(&stack).await, 1);
        let ticks = stack.schedule_storage.get_ticks("schedule:daily", None).await.unwrap();
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].status, TickStatus::Success);
    }

    #[tokio::test]
    async fn test_partitioned_schedule_targets_closed_window() {
        let stack = queued_stack();
        let partitions = TimeWindowPartitionsDefinition::daily("2024-01-01").unwrap();
        let schedule = ScheduleDefinition::for_partitions("daily_partitions", "etl", partitions);
        let scheduler = daemon(&stack, vec![schedule], SchedulerConfig::default());
        scheduler
            .start_schedule("daily_partitions", Utc.with_ymd_and_hms(2024, 1, 2, 12, 0, 0).unwrap())
            .await
            .unwrap();

        let results = scheduler
            .run_iteration(Utc.with_ymd_and_hms(2024, 1, 3, 1, 0, 0).unwrap())
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        let runs = stack.run_storage.get_runs(&RunFilter::default(), None, None).await.unwrap();
        assert_eq!(runs[0].partition_key(), Some("2024-01-02"));
        assert_eq!(runs[0].tag(tags::RUN_KEY), Some("2024-01-02"));
    }

    #[tokio::test]
    async fn test_failed_tick_is_retried_within_limit() {
        let stack = queued_stack();
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let flaky = ScheduleDefinition::new("flaky", "etl", "0 6 * * *")
            .unwrap()
            .with_evaluation_fn(move |_| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err("upstream API unavailable".to_string())
                } else {
                    Ok(vec![RunRequest::new(json!({}))])
                }
            });
        let scheduler = daemon(
            &stack,
            vec![flaky],
            SchedulerConfig {
                max_tick_retries: 1,
                ..SchedulerConfig::default()
            },
        );
        scheduler.start_schedule("flaky", at(0, 0)).await.unwrap();

        let first = scheduler.run_iteration(at(7, 0)).await.unwrap();
        assert_eq!(first[0].status, TickStatus::Failure);
        let second = scheduler.run_iteration(at(7, 1)).await.unwrap();
        assert_eq!(second[0].status, TickStatus::Success);
        assert_eq!(second[0].timestamp, at(6, 0));
        assert_eq!(run_count(&stack).await, 1);
    }

    #[tokio::test]
    async fn test_stopped_schedule_is_not_evaluated() {
        let stack = queued_stack();
        let hourly = ScheduleDefinition::new("hourly", "etl", "0 * * * *").unwrap();
        let scheduler = daemon(&stack, vec![hourly], SchedulerConfig::default());
        scheduler.start_schedule("hourly", at(0, 0)).await.unwrap();
        scheduler.stop_schedule("hourly").await.unwrap();
        assert!(scheduler.run_iteration(at(3, 0)).await.unwrap().is_empty());
    }
}
