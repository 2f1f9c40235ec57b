//! Queued run admission through the dequeue pass

use dagflow_core::config::TagConcurrencyLimit;
use dagflow_core::models::Run;
use dagflow_core::{tags, RunStatus};
use serde_json::Value;

use crate::common::{limited_config, linear_job, queued_instance, tagged_run, RUN_TIMEOUT};

#[tokio::test]
async fn test_tag_value_limit_admits_one_run_per_value() -> anyhow::Result<()> {
    let config = limited_config(10, vec![TagConcurrencyLimit::for_value("database", "tiny", 1)]);
    let instance = queued_instance(vec![linear_job("etl")], config);

    let tiny_first = instance.launch_run(tagged_run("etl", "database", "tiny")).await?;
    let tiny_second = instance.launch_run(tagged_run("etl", "database", "tiny")).await?;
    let large = instance.launch_run(tagged_run("etl", "database", "large")).await?;
    assert!([&tiny_first, &tiny_second, &large].iter().all(|run| run.status == RunStatus::Queued));

    let pass = instance.queued_run_coordinator_daemon().run_iteration().await?;
    assert_eq!(pass.launched, vec![tiny_first.run_id, large.run_id]);
    assert!(pass.errors.is_empty());

    let waiting = instance.run_storage().get_run(tiny_second.run_id).await?.unwrap();
    assert_eq!(waiting.status, RunStatus::Queued);

    // Once the first tiny run is done the second one is admitted
    instance.wait_for_run(tiny_first.run_id, RUN_TIMEOUT).await?;
    let pass = instance.queued_run_coordinator_daemon().run_iteration().await?;
    assert_eq!(pass.launched, vec![tiny_second.run_id]);
    Ok(())
}

#[tokio::test]
async fn test_priority_orders_admission() -> anyhow::Result<()> {
    let instance = queued_instance(vec![linear_job("etl")], limited_config(1, Vec::new()));

    let low = instance.launch_run(Run::new("etl", Value::Null)).await?;
    let high = instance.launch_run(tagged_run("etl", tags::PRIORITY, "5")).await?;

    let pass = instance.queued_run_coordinator_daemon().run_iteration().await?;
    assert_eq!(pass.launched, vec![high.run_id]);

    instance.wait_for_run(high.run_id, RUN_TIMEOUT).await?;
    let pass = instance.queued_run_coordinator_daemon().run_iteration().await?;
    assert_eq!(pass.launched, vec![low.run_id]);
    let low = instance.wait_for_run(low.run_id, RUN_TIMEOUT).await?;
    assert_eq!(low.status, RunStatus::Success);
    Ok(())
}

#[tokio::test]
async fn test_zero_concurrency_admits_nothing() -> anyhow::Result<()> {
    let instance = queued_instance(vec![linear_job("etl")], limited_config(0, Vec::new()));
    let run = instance.launch_run(Run::new("etl", Value::Null)).await?;

    let pass = instance.queued_run_coordinator_daemon().run_iteration().await?;
    assert!(pass.launched.is_empty());
    let run = instance.run_storage().get_run(run.run_id).await?.unwrap();
    assert_eq!(run.status, RunStatus::Queued);
    Ok(())
}

#[tokio::test]
async fn test_canceled_queued_run_is_never_launched() -> anyhow::Result<()> {
    let instance = queued_instance(vec![linear_job("etl")], limited_config(10, Vec::new()));
    let run = instance.launch_run(Run::new("etl", Value::Null)).await?;

    assert!(instance.terminate(run.run_id).await?);
    assert!(!instance.terminate(run.run_id).await?);

    let pass = instance.queued_run_coordinator_daemon().run_iteration().await?;
    assert!(pass.launched.is_empty());
    let run = instance.run_storage().get_run(run.run_id).await?.unwrap();
    assert_eq!(run.status, RunStatus::Canceled);
    Ok(())
}
