//! Runs executed end to end through an ephemeral instance

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dagflow_core::constants::tags;
use dagflow_core::definitions::{InputDefinition, JobDefinition, StepDefinition};
use dagflow_core::execution::STEP_DELEGATING_EXECUTOR;
use dagflow_core::models::Run;
use dagflow_core::RunStatus;
use serde_json::{json, Value};

use crate::common::{
    flaky_job, instance, linear_job, optional_output_job, split_failure_job, step_event_types, versioned_job,
    RUN_TIMEOUT,
};

fn slow_job() -> JobDefinition {
    JobDefinition::builder("slow")
        .step(StepDefinition::new("wait", |ctx, _| {
            for _ in 0..400 {
                ctx.check_for_interrupt()?;
                std::thread::sleep(Duration::from_millis(5));
            }
            ctx.output("result", json!(true));
            Ok(())
        }))
        .step(
            StepDefinition::new("next", |ctx, _| {
                ctx.output("result", json!(true));
                Ok(())
            })
            .with_input(InputDefinition::from_output("x", "wait", "result")),
        )
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_linear_run_succeeds() -> anyhow::Result<()> {
    let instance = instance(vec![linear_job("numbers")]);
    let run = instance.launch_run(Run::new("numbers", Value::Null)).await?;
    let run = instance.wait_for_run(run.run_id, RUN_TIMEOUT).await?;

    assert_eq!(run.status, RunStatus::Success);
    let events = step_event_types(instance.event_log().as_ref(), run.run_id, "add_one").await;
    assert!(events.contains(&"loaded_input"));
    assert!(events.contains(&"step_success"));
    Ok(())
}

#[tokio::test]
async fn test_failure_leaves_siblings_alone_and_downstream_unrun() -> anyhow::Result<()> {
    let instance = instance(vec![split_failure_job()]);
    let run = instance.launch_run(Run::new("split", Value::Null)).await?;
    let run = instance.wait_for_run(run.run_id, RUN_TIMEOUT).await?;
    let event_log = instance.event_log().as_ref();

    assert_eq!(run.status, RunStatus::Failure);
    assert!(step_event_types(event_log, run.run_id, "ok").await.contains(&"step_success"));
    assert!(step_event_types(event_log, run.run_id, "broken").await.contains(&"step_failure"));
    let downstream = step_event_types(event_log, run.run_id, "after_broken").await;
    assert!(!downstream.contains(&"step_start"));
    assert!(!downstream.contains(&"step_failure"));
    Ok(())
}

#[tokio::test]
async fn test_retry_policy_recovers_transient_failures() -> anyhow::Result<()> {
    let calls = Arc::new(AtomicUsize::new(0));
    let instance = instance(vec![flaky_job(2, calls.clone())]);
    let run = instance.launch_run(Run::new("flaky", Value::Null)).await?;
    let run = instance.wait_for_run(run.run_id, RUN_TIMEOUT).await?;

    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let events = step_event_types(instance.event_log().as_ref(), run.run_id, "flaky").await;
    assert_eq!(events.iter().filter(|e| **e == "step_up_for_retry").count(), 2);
    Ok(())
}

#[tokio::test]
async fn test_missing_optional_output_skips_consumers() -> anyhow::Result<()> {
    let instance = instance(vec![optional_output_job()]);
    let run = instance.launch_run(Run::new("optional", Value::Null)).await?;
    let run = instance.wait_for_run(run.run_id, RUN_TIMEOUT).await?;
    let event_log = instance.event_log().as_ref();

    assert_eq!(run.status, RunStatus::Success);
    for step in ["consumer", "grand_consumer"] {
        let events = step_event_types(event_log, run.run_id, step).await;
        assert!(events.contains(&"step_skipped"), "{step}");
        assert!(!events.contains(&"step_start"), "{step}");
    }
    Ok(())
}

#[tokio::test]
async fn test_memoized_runs_reuse_stored_outputs() -> anyhow::Result<()> {
    let calls = Arc::new(AtomicUsize::new(0));
    let instance = instance(vec![versioned_job(calls.clone())]);

    for _ in 0..2 {
        let run = Run::new("versioned", Value::Null).with_tag(tags::MEMOIZED_RUN, "true");
        let run = instance.launch_run(run).await?;
        let run = instance.wait_for_run(run.run_id, RUN_TIMEOUT).await?;
        assert_eq!(run.status, RunStatus::Success);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn test_step_delegating_executor_runs_every_step() -> anyhow::Result<()> {
    let instance = instance(vec![linear_job("delegated")]);
    let run = Run::new("delegated", Value::Null).with_tag(tags::EXECUTOR, STEP_DELEGATING_EXECUTOR);
    let run = instance.launch_run(run).await?;
    let run = instance.wait_for_run(run.run_id, RUN_TIMEOUT).await?;

    assert_eq!(run.status, RunStatus::Success);
    for step in ["emit", "add_one"] {
        let events = step_event_types(instance.event_log().as_ref(), run.run_id, step).await;
        assert_eq!(events.first(), Some(&"step_worker_starting"), "{step}");
        assert!(events.contains(&"step_success"), "{step}");
    }
    Ok(())
}

#[tokio::test]
async fn test_terminate_twice_matches_terminate_once() -> anyhow::Result<()> {
    let instance = instance(vec![slow_job()]);
    let run = instance.launch_run(Run::new("slow", Value::Null)).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(instance.terminate(run.run_id).await?);
    assert!(!instance.terminate(run.run_id).await?);

    let run = instance.wait_for_run(run.run_id, RUN_TIMEOUT).await?;
    assert_eq!(run.status, RunStatus::Canceled);
    assert!(!instance.terminate(run.run_id).await?);

    let next = step_event_types(instance.event_log().as_ref(), run.run_id, "next").await;
    assert!(!next.contains(&"step_start"));
    Ok(())
}

#[tokio::test]
async fn test_reexecution_keeps_lineage() -> anyhow::Result<()> {
    let instance = instance(vec![linear_job("numbers")]);
    let parent = instance.launch_run(Run::new("numbers", Value::Null).with_tag("team", "data")).await?;
    let parent = instance.wait_for_run(parent.run_id, RUN_TIMEOUT).await?;

    let child = instance.reexecute(parent.run_id, Some(vec!["add_one".to_string()])).await?;
    let child = instance.wait_for_run(child.run_id, RUN_TIMEOUT).await?;
    let grandchild = instance.reexecute(child.run_id, None).await?;
    let grandchild = instance.wait_for_run(grandchild.run_id, RUN_TIMEOUT).await?;

    assert_eq!(child.status, RunStatus::Success);
    assert_eq!(grandchild.status, RunStatus::Success);
    assert_eq!(grandchild.parent_run_id, Some(child.run_id));
    assert_eq!(grandchild.root_run_id, Some(parent.run_id));
    assert_eq!(grandchild.tag("team"), Some("data"));
    assert!(step_event_types(instance.event_log().as_ref(), child.run_id, "emit").await.is_empty());
    Ok(())
}
