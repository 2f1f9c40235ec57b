//! Daemon loops started from an instance

use std::time::Duration;

use chrono::Utc;
use dagflow_core::models::Run;
use dagflow_core::orchestration::get_daemon_heartbeat;
use dagflow_core::RunStatus;
use serde_json::Value;

use crate::common::{fast_config, linear_job, queued_instance, RUN_TIMEOUT};

#[tokio::test]
async fn test_queued_run_completes_under_daemon_loops() -> anyhow::Result<()> {
    let mut config = fast_config();
    config.run_coordinator.dequeue_interval_seconds = 1;
    let instance = queued_instance(vec![linear_job("etl")], config);
    let run = instance.launch_run(Run::new("etl", Value::Null)).await?;
    assert_eq!(run.status, RunStatus::Queued);

    let controller = instance.start_daemons(Vec::new(), Vec::new());
    assert_eq!(controller.daemon_types(), vec!["QUEUED_RUN_COORDINATOR", "MONITORING"]);

    let run = instance.wait_for_run(run.run_id, RUN_TIMEOUT).await?;
    assert_eq!(run.status, RunStatus::Success);

    let heartbeat = get_daemon_heartbeat(instance.run_storage().as_ref(), "QUEUED_RUN_COORDINATOR")
        .await?
        .expect("coordinator heartbeat");
    assert_eq!(heartbeat.daemon_id, controller.id());
    assert!(heartbeat.error.is_none());
    assert!(heartbeat.is_fresh(Utc::now(), Duration::from_secs(30)));

    controller.stop(Duration::from_secs(2)).await;
    assert!(controller.daemon_types().is_empty());
    Ok(())
}
