//! Monitoring daemon recovery of stuck and orphaned runs

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dagflow_core::constants::tags;
use dagflow_core::definitions::{InputDefinition, JobDefinition, StepDefinition};
use dagflow_core::models::{DagflowEvent, Run};
use dagflow_core::orchestration::MonitorAction;
use dagflow_core::RunStatus;
use serde_json::{json, Value};

use crate::common::{instance, linear_job, RUN_TIMEOUT};

/// `first` is quick and counted, `second` runs long enough to be killed mid-way
fn resumable_job(first_calls: Arc<AtomicUsize>) -> JobDefinition {
    JobDefinition::builder("resumable")
        .step(StepDefinition::new("first", move |ctx, _| {
            first_calls.fetch_add(1, Ordering::SeqCst);
            ctx.output("result", json!(1));
            Ok(())
        }))
        .step(
            StepDefinition::new("second", |ctx, _| {
                for _ in 0..40 {
                    ctx.check_for_interrupt()?;
                    std::thread::sleep(Duration::from_millis(5));
                }
                ctx.output("result", json!(2));
                Ok(())
            })
            .with_input(InputDefinition::from_output("x", "first", "result")),
        )
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_run_stuck_starting_is_failed_after_timeout() -> anyhow::Result<()> {
    let instance = instance(vec![linear_job("etl")]);
    let run = instance.create_run(Run::new("etl", Value::Null)).await?;
    instance.run_storage().update_run_status(run.run_id, RunStatus::Starting).await?;

    let monitor = instance.run_monitor();
    assert!(monitor.run_iteration(Utc::now()).await?.is_empty());

    let later = Utc::now() + chrono::Duration::seconds(instance.config().run_monitoring.start_timeout_seconds as i64 + 1);
    let actions = monitor.run_iteration(later).await?;
    assert_eq!(actions, vec![MonitorAction::StartTimedOut(run.run_id)]);

    let run = instance.run_storage().get_run(run.run_id).await?.unwrap();
    assert_eq!(run.status, RunStatus::Failure);
    Ok(())
}

#[tokio::test]
async fn test_lost_worker_is_resumed_to_completion() -> anyhow::Result<()> {
    let first_calls = Arc::new(AtomicUsize::new(0));
    let instance = instance(vec![resumable_job(first_calls.clone())]);
    let run = instance.launch_run(Run::new("resumable", Value::Null)).await?;

    // Let the run start, then make its worker vanish
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(instance.launcher().kill_worker(run.run_id));
    tokio::time::sleep(Duration::from_millis(20)).await;

    let actions = instance.run_monitor().run_iteration(Utc::now()).await?;
    assert_eq!(
        actions,
        vec![MonitorAction::Resumed {
            run_id: run.run_id,
            attempt: 1
        }]
    );

    let run = instance.wait_for_run(run.run_id, RUN_TIMEOUT).await?;
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.tag(tags::RESUME_ATTEMPTS), Some("1"));
    assert_eq!(first_calls.load(Ordering::SeqCst), 1);

    let records = instance.event_log().get_events(run.run_id, None, None).await?;
    assert!(records.iter().any(|record| record.event == DagflowEvent::RunResumed));
    Ok(())
}
