//! # Run Monitoring
//!
//! Periodic reconciliation of in-flight runs against worker health. The
//! daemon holds no state between passes; everything is re-read from storage.
//!
//! | Status      | Condition                         | Action                               |
//! |-------------|-----------------------------------|--------------------------------------|
//! | `STARTING`  | older than `start_timeout`        | fail the run                         |
//! | `STARTED`   | worker not found                  | resume, or fail once attempts run out |
//! | `CANCELING` | worker gone or `cancel_timeout`   | mark `CANCELED`                      |

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::launcher::RunLauncher;
use crate::config::RunMonitoringConfig;
use crate::constants::{engine_events, tags};
use crate::error::{DagflowError, Result};
use crate::execution::WorkerHealth;
use crate::logging::log_run_operation;
use crate::models::{DagflowEvent, Run, RunFilter};
use crate::state_machine::{RunEvent, RunStateMachine, RunStatus};
use crate::storage::{EventLogStorage, RunStorage};

/// What the monitor did to one run during a pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorAction {
    StartTimedOut(Uuid),
    Resumed { run_id: Uuid, attempt: u32 },
    Failed(Uuid),
    Canceled(Uuid),
}

pub struct RunMonitor {
    run_storage: Arc<dyn RunStorage>,
    event_log: Arc<dyn EventLogStorage>,
    launcher: Arc<dyn RunLauncher>,
    state_machine: RunStateMachine,
    config: RunMonitoringConfig,
}

impl RunMonitor {
    pub fn new(
        run_storage: Arc<dyn RunStorage>,
        event_log: Arc<dyn EventLogStorage>,
        launcher: Arc<dyn RunLauncher>,
        config: RunMonitoringConfig,
    ) -> Self {
        let state_machine = RunStateMachine::new(run_storage.clone(), event_log.clone());
        Self {
            run_storage,
            event_log,
            launcher,
            state_machine,
            config,
        }
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        self.config.poll_interval()
    }

    /// One reconciliation pass as of `now`
    #[instrument(skip(self))]
    pub async fn run_iteration(&self, now: DateTime<Utc>) -> Result<Vec<MonitorAction>> {
        let runs = self
            .run_storage
            .get_runs(
                &RunFilter::with_statuses([RunStatus::Starting, RunStatus::Started, RunStatus::Canceling]),
                None,
                None,
            )
            .await?;

        let mut actions = Vec::new();
        for run in runs {
            let action = match run.status {
                RunStatus::Starting => self.check_starting(&run, now).await?,
                RunStatus::Started => self.check_started(&run).await?,
                RunStatus::Canceling => self.check_canceling(&run, now).await?,
                _ => None,
            };
            if let Some(action) = action {
                actions.push(action);
            }
        }

        if !actions.is_empty() {
            info!(count = actions.len(), "🩺 MONITOR: Reconciled in-flight runs");
        }
        Ok(actions)
    }

    async fn check_starting(&self, run: &Run, now: DateTime<Utc>) -> Result<Option<MonitorAction>> {
        if !elapsed_beyond(run.updated_at, now, self.config.start_timeout()) {
            return Ok(None);
        }
        let message = format!(
            "Run timed out due to taking longer than {} seconds to start.",
            self.config.start_timeout_seconds
        );
        self.append(run.run_id, DagflowEvent::engine_error(engine_events::START_TIMEOUT, message.clone()))
            .await?;
        let failed = self
            .state_machine
            .try_transition(run.run_id, RunEvent::fail_with_error(message))
            .await?;
        Ok(failed.map(|_| MonitorAction::StartTimedOut(run.run_id)))
    }

    async fn check_started(&self, listed: &Run) -> Result<Option<MonitorAction>> {
        if self.launcher.check_run_worker_health(listed).await? != WorkerHealth::NotFound {
            return Ok(None);
        }
        // The worker may have finished the run since it was listed
        let run = self.load(listed.run_id).await?;
        if run.status != RunStatus::Started {
            debug!(run_id = %run.run_id, status = %run.status, "Run left STARTED before its health check");
            return Ok(None);
        }

        if !self.launcher.supports_resume() {
            return self
                .fail(run.run_id, engine_events::WORKER_NOT_FOUND, "Run worker not found".to_string())
                .await;
        }

        let attempts = run.resume_attempts();
        if attempts >= self.config.max_resume_run_attempts {
            let reason = format!("Run worker was lost and {attempts} resume attempts were exhausted");
            return self.fail(run.run_id, engine_events::RESUME_EXHAUSTED, reason).await;
        }

        let attempt = attempts + 1;
        self.run_storage
            .add_run_tags(
                run.run_id,
                BTreeMap::from([(tags::RESUME_ATTEMPTS.to_string(), attempt.to_string())]),
            )
            .await?;
        self.append(
            run.run_id,
            DagflowEvent::engine(format!(
                "{} {attempt} of {}",
                engine_events::RESUME_ATTEMPT,
                self.config.max_resume_run_attempts
            )),
        )
        .await?;

        let resumed = self.load(run.run_id).await?;
        if let Err(err) = self.launcher.resume_run(&resumed).await {
            warn!(run_id = %run.run_id, error = %err, "Resume attempt failed to launch");
            return self
                .fail(run.run_id, engine_events::LAUNCH_FAILED, err.to_string())
                .await;
        }
        log_run_operation("resume", Some(run.run_id), "STARTED", Some(&format!("attempt {attempt}")));
        Ok(Some(MonitorAction::Resumed {
            run_id: run.run_id,
            attempt,
        }))
    }

    async fn check_canceling(&self, run: &Run, now: DateTime<Utc>) -> Result<Option<MonitorAction>> {
        let worker_gone = self.launcher.check_run_worker_health(run).await? == WorkerHealth::NotFound;
        if !worker_gone && !elapsed_beyond(run.updated_at, now, self.config.cancel_timeout()) {
            return Ok(None);
        }
        let reason = if worker_gone {
            "Run worker exited without acknowledging cancellation".to_string()
        } else {
            format!(
                "Run did not finish canceling within {} seconds",
                self.config.cancel_timeout_seconds
            )
        };
        self.append(run.run_id, DagflowEvent::engine_error(engine_events::CANCEL_TIMEOUT, reason))
            .await?;
        let canceled = self.state_machine.try_transition(run.run_id, RunEvent::Canceled).await?;
        Ok(canceled.map(|_| MonitorAction::Canceled(run.run_id)))
    }

    async fn fail(&self, run_id: Uuid, event_name: &str, reason: String) -> Result<Option<MonitorAction>> {
        self.append(run_id, DagflowEvent::engine_error(event_name, reason.clone()))
            .await?;
        let failed = self
            .state_machine
            .try_transition(run_id, RunEvent::fail_with_error(reason))
            .await?;
        Ok(failed.map(|_| MonitorAction::Failed(run_id)))
    }

    async fn load(&self, run_id: Uuid) -> Result<Run> {
        self.run_storage
            .get_run(run_id)
            .await?
            .ok_or(DagflowError::RunNotFound(run_id))
    }

    async fn append(&self, run_id: Uuid, event: DagflowEvent) -> Result<()> {
        self.event_log.append_event(run_id, None, event).await?;
        Ok(())
    }
}

fn elapsed_beyond(since: DateTime<Utc>, now: DateTime<Utc>, timeout: std::time::Duration) -> bool {
    chrono::Duration::from_std(timeout).map_or(false, |timeout| now - since > timeout)
}
