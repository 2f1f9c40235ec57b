//! Schedules and sensors creating runs exactly once per tick

use std::time::Duration;

use dagflow_core::models::RunFilter;
use dagflow_core::orchestration::{CrashPoint, DebugCrashFlags, RunRequest, SensorResult};
use dagflow_core::{tags, RunStatus, ScheduleDefinition, SensorDefinition, TickStatus};
use serde_json::{json, Value};

use crate::common::{fast_config, linear_job, queued_instance, utc};

fn daily_schedule() -> ScheduleDefinition {
    ScheduleDefinition::new("daily_etl", "etl", "0 6 * * *").unwrap()
}

#[tokio::test]
async fn test_scheduler_crash_after_run_created_launches_that_run() -> anyhow::Result<()> {
    let instance = queued_instance(vec![linear_job("etl")], fast_config());

    let crashing = instance
        .scheduler(vec![daily_schedule()])
        .with_crash_flags(DebugCrashFlags::none().crash_at(CrashPoint::RunCreated));
    crashing.start_schedule("daily_etl", utc(2024, 3, 1, 0)).await?;
    assert!(crashing.run_iteration(utc(2024, 3, 1, 7)).await.is_err());

    let runs = instance.run_storage().get_runs(&RunFilter::default(), None, None).await?;
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::NotStarted);
    let orphan = runs[0].run_id;

    let results = instance.scheduler(vec![daily_schedule()]).run_iteration(utc(2024, 3, 1, 8)).await?;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, TickStatus::Success);
    assert_eq!(results[0].launched.launched, vec![orphan]);

    let runs = instance.run_storage().get_runs(&RunFilter::default(), None, None).await?;
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Queued);
    assert_eq!(runs[0].tag(tags::SCHEDULE_NAME), Some("daily_etl"));
    Ok(())
}

#[tokio::test]
async fn test_scheduler_evaluates_each_tick_once() -> anyhow::Result<()> {
    let instance = queued_instance(vec![linear_job("etl")], fast_config());
    let scheduler = instance.scheduler(vec![daily_schedule()]);
    scheduler.start_schedule("daily_etl", utc(2024, 3, 1, 0)).await?;

    // Three ticks are due: Mar 1, 2 and 3 at 06:00
    let results = scheduler.run_iteration(utc(2024, 3, 3, 12)).await?;
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|result| result.status == TickStatus::Success));

    // Nothing new is due on the next pass
    assert!(scheduler.run_iteration(utc(2024, 3, 3, 13)).await?.is_empty());
    let runs = instance.run_storage().get_runs(&RunFilter::default(), None, None).await?;
    assert_eq!(runs.len(), 3);
    Ok(())
}

#[tokio::test]
async fn test_sensor_run_keys_are_launched_once() -> anyhow::Result<()> {
    let instance = queued_instance(vec![linear_job("etl")], fast_config());
    let sensor = SensorDefinition::new("new_files", "etl", |context| {
        let requests = ["a.csv", "b.csv"]
            .into_iter()
            .map(|file| RunRequest::new(json!({ "file": file })).with_run_key(file))
            .collect();
        let seen = context.cursor.clone().unwrap_or_default();
        Ok(SensorResult::requests(requests).with_cursor(format!("{seen}+")))
    })
    .with_min_interval(Duration::from_secs(60));
    let daemon = instance.sensor_daemon(vec![sensor]);
    daemon.start_sensor("new_files", utc(2024, 3, 1, 0)).await?;

    let first = daemon.run_iteration(utc(2024, 3, 1, 0)).await?;
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].launched.launched.len(), 2);

    // Not due yet
    assert!(daemon.run_iteration(utc(2024, 3, 1, 0)).await?.is_empty());

    let second = daemon.run_iteration(utc(2024, 3, 1, 1)).await?;
    assert_eq!(second.len(), 1);
    assert!(second[0].launched.launched.is_empty());
    assert_eq!(second[0].launched.skipped_run_keys, vec!["a.csv", "b.csv"]);
    assert_eq!(second[0].status, TickStatus::Skipped);

    let runs = instance.run_storage().get_runs(&RunFilter::default(), None, None).await?;
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().all(|run| run.run_config != Value::Null));
    Ok(())
}
