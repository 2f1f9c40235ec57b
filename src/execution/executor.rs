//! # Executors
//!
//! Drive an [`ActiveExecution`] to completion.
//!
//! - [`InProcessExecutor`] runs attempts as tokio tasks inside the run worker,
//!   bounded by the run's step concurrency.
//! - [`StepDelegatingExecutor`] hands each attempt to a [`StepHandler`] (a
//!   separate worker) and learns about progress only by polling the run's
//!   event log. Workers that vanish without reporting are detected through
//!   health checks and their steps failed.
//!
//! Both loops follow the same rhythm: collect ready attempts, write
//! bookkeeping events, wait for progress, repeat until every step is terminal.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::active_execution::{ActiveExecution, StepAttempt};
use super::plan::KnownExecutionState;
use super::step_executor::{wait_for_interrupt, ExecutionServices, RunContext, StepExecutor};
use crate::constants::engine_events;
use crate::error::{DagflowError, Result};
use crate::logging::log_step_operation;
use crate::models::{DagflowEvent, StepFailureKind};

#[async_trait]
pub trait Executor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run every step of `active` until all of them are terminal
    async fn execute(&self, run: &RunContext, active: &mut ActiveExecution) -> Result<()>;
}

/// Write bookkeeping events (skips, abandonments) to the event log.
/// Returns how many were written.
async fn flush_step_events(
    services: &ExecutionServices,
    run_id: Uuid,
    active: &mut ActiveExecution,
) -> Result<usize> {
    let events = active.drain_step_events();
    let count = events.len();
    for (step_key, event) in events {
        services
            .event_log
            .append_event(run_id, Some(&step_key), event)
            .await?;
    }
    Ok(count)
}

fn stalled(active: &ActiveExecution) -> DagflowError {
    let waiting: Vec<String> = active
        .step_statuses()
        .into_iter()
        .filter(|(_, status)| !status.is_terminal())
        .map(|(key, status)| format!("{key} ({status})"))
        .collect();
    DagflowError::InvariantViolation(format!(
        "execution cannot make progress; steps still waiting: {}",
        waiting.join(", ")
    ))
}

/// Runs step attempts as tasks of the current process
#[derive(Debug, Clone)]
pub struct InProcessExecutor {
    services: ExecutionServices,
}

impl InProcessExecutor {
    pub fn new(services: ExecutionServices) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Executor for InProcessExecutor {
    fn name(&self) -> &'static str {
        "in_process"
    }

    #[instrument(skip(self, run, active), fields(run_id = %run.run.run_id, executor = "in_process"))]
    async fn execute(&self, run: &RunContext, active: &mut ActiveExecution) -> Result<()> {
        let run_id = run.run.run_id;
        let step_executor = StepExecutor::new(self.services.clone());
        let mut interrupt = run.interrupt.clone();
        let mut tasks: JoinSet<(String, Result<Vec<DagflowEvent>>)> = JoinSet::new();

        loop {
            if *interrupt.borrow() {
                active.mark_interrupted();
            }

            let attempts = active.get_steps_to_execute(Instant::now())?;
            let written = flush_step_events(&self.services, run_id, active).await?;

            if !attempts.is_empty() {
                let plan = Arc::new(active.plan().clone());
                for attempt in attempts {
                    let step_executor = step_executor.clone();
                    let run = run.clone();
                    let plan = Arc::clone(&plan);
                    tasks.spawn(async move {
                        let result = step_executor.execute_step(&run, &plan, &attempt).await;
                        (attempt.step_key, result)
                    });
                }
                continue;
            }

            if tasks.is_empty() {
                if active.is_complete() {
                    break;
                }
                if written > 0 {
                    // Skips may unblock or skip further steps
                    continue;
                }
                match active.next_retry_at() {
                    Some(at) => {
                        tokio::select! {
                            _ = tokio::time::sleep_until(at) => {}
                            _ = wait_for_interrupt(&mut interrupt), if !active.is_interrupted() => {}
                        }
                        continue;
                    }
                    None => return Err(stalled(active)),
                }
            }

            let wake_at = active
                .next_retry_at()
                .unwrap_or_else(|| Instant::now() + self.services.config.step_poll_interval());
            tokio::select! {
                joined = tasks.join_next() => {
                    let Some(joined) = joined else { continue };
                    let (step_key, result) = joined.map_err(|err| {
                        DagflowError::InvariantViolation(format!("step task failed to join: {err}"))
                    })?;
                    let events = match result {
                        Ok(events) => events,
                        Err(err) => {
                            // The attempt could not even record its outcome
                            let failure = DagflowEvent::StepFailure {
                                error: err.to_string(),
                                kind: StepFailureKind::Framework,
                            };
                            self.services
                                .event_log
                                .append_event(run_id, Some(&step_key), failure.clone())
                                .await?;
                            vec![failure]
                        }
                    };
                    for event in &events {
                        active.handle_event(&step_key, event)?;
                    }
                }
                _ = tokio::time::sleep_until(wake_at) => {}
                _ = wait_for_interrupt(&mut interrupt), if !active.is_interrupted() => {
                    info!(run_id = %run_id, "Run interrupted; waiting for running steps");
                }
            }
        }
        Ok(())
    }
}

/// Liveness of a delegated step worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerHealth {
    Running,
    /// The worker is gone; it finished or crashed
    NotFound,
    /// The handler cannot tell
    Unknown,
}

/// Everything a step worker needs to execute steps of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteStepArgs {
    pub run_id: Uuid,
    pub job_name: String,
    pub step_keys: Vec<String>,
    pub retry_number: u32,
    pub known_state: KnownExecutionState,
}

impl ExecuteStepArgs {
    pub fn step_key(&self) -> &str {
        self.step_keys.first().map(String::as_str).unwrap_or_default()
    }
}

/// Launches and supervises step workers for [`StepDelegatingExecutor`]
#[async_trait]
pub trait StepHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn launch_step(&self, args: ExecuteStepArgs) -> Result<()>;

    async fn check_step_health(&self, args: &ExecuteStepArgs) -> Result<WorkerHealth>;

    async fn terminate_step(&self, args: &ExecuteStepArgs) -> Result<()>;
}

/// Delegates every attempt to a [`StepHandler`] and follows progress through
/// the event log
pub struct StepDelegatingExecutor {
    services: ExecutionServices,
    handler: Arc<dyn StepHandler>,
}

impl std::fmt::Debug for StepDelegatingExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepDelegatingExecutor")
            .field("handler", &self.handler.name())
            .finish()
    }
}

impl StepDelegatingExecutor {
    pub fn new(services: ExecutionServices, handler: Arc<dyn StepHandler>) -> Self {
        Self { services, handler }
    }

    /// Feed new events of in-flight steps into the execution
    async fn poll_events(
        &self,
        run_id: Uuid,
        cursor: &mut Option<i64>,
        in_flight: &mut HashMap<String, ExecuteStepArgs>,
        active: &mut ActiveExecution,
    ) -> Result<()> {
        let records = self.services.event_log.get_events(run_id, *cursor, None).await?;
        for record in records {
            *cursor = Some(record.storage_id);
            let Some(step_key) = record.step_key.as_deref() else {
                continue;
            };
            if !in_flight.contains_key(step_key) {
                continue;
            }
            active.handle_event(step_key, &record.event)?;
            if record.event.is_step_attempt_end() {
                in_flight.remove(step_key);
            }
        }
        Ok(())
    }

    async fn check_health(
        &self,
        run_id: Uuid,
        cursor: &mut Option<i64>,
        in_flight: &mut HashMap<String, ExecuteStepArgs>,
        active: &mut ActiveExecution,
    ) -> Result<()> {
        let mut lost = Vec::new();
        for (step_key, args) in in_flight.iter() {
            match self.handler.check_step_health(args).await {
                Ok(WorkerHealth::NotFound) => lost.push(step_key.clone()),
                Ok(_) => {}
                Err(err) => warn!(step_key = %step_key, error = %err, "Step health check failed"),
            }
        }
        if lost.is_empty() {
            return Ok(());
        }

        // A worker that finished normally may have reported after the last poll
        self.poll_events(run_id, cursor, in_flight, active).await?;

        for step_key in lost {
            if !in_flight.contains_key(&step_key) {
                continue;
            }
            let error = format!("Worker for step {step_key} exited without reporting an outcome");
            log_step_operation("worker_lost", Some(run_id), Some(&step_key), "FAILURE", Some(&error));
            self.services
                .event_log
                .append_event(
                    run_id,
                    Some(&step_key),
                    DagflowEvent::engine_error(engine_events::STEP_WORKER_LOST, error.clone()),
                )
                .await?;
            self.services
                .event_log
                .append_event(
                    run_id,
                    Some(&step_key),
                    DagflowEvent::StepFailure {
                        error,
                        kind: StepFailureKind::WorkerLost,
                    },
                )
                .await?;
        }
        self.poll_events(run_id, cursor, in_flight, active).await
    }
}

#[async_trait]
impl Executor for StepDelegatingExecutor {
    fn name(&self) -> &'static str {
        "step_delegating"
    }

    #[instrument(skip(self, run, active), fields(run_id = %run.run.run_id, handler = %self.handler.name()))]
    async fn execute(&self, run: &RunContext, active: &mut ActiveExecution) -> Result<()> {
        let run_id = run.run.run_id;
        let mut interrupt = run.interrupt.clone();
        let mut in_flight: HashMap<String, ExecuteStepArgs> = HashMap::new();

        // Only events written from now on belong to this execution
        let mut cursor = self
            .services
            .event_log
            .get_events(run_id, None, None)
            .await?
            .last()
            .map(|record| record.storage_id);

        loop {
            if *interrupt.borrow() && !active.is_interrupted() {
                active.mark_interrupted();
                for (step_key, args) in &in_flight {
                    if let Err(err) = self.handler.terminate_step(args).await {
                        warn!(step_key = %step_key, error = %err, "Failed to terminate step worker");
                    }
                }
            }

            let attempts = active.get_steps_to_execute(Instant::now())?;
            let written = flush_step_events(&self.services, run_id, active).await?;

            let launched = attempts.len();
            for StepAttempt { step_key, retry_number } in attempts {
                let args = ExecuteStepArgs {
                    run_id,
                    job_name: run.run.job_name.clone(),
                    step_keys: vec![step_key.clone()],
                    retry_number,
                    known_state: active.known_state(),
                };
                self.services
                    .event_log
                    .append_event(
                        run_id,
                        Some(&step_key),
                        DagflowEvent::StepWorkerStarting { attempt: retry_number },
                    )
                    .await?;
                if let Err(err) = self.handler.launch_step(args.clone()).await {
                    // Reported through the log so the poll below applies it
                    self.services
                        .event_log
                        .append_event(
                            run_id,
                            Some(&step_key),
                            DagflowEvent::StepFailure {
                                error: format!("Failed to launch worker for step {step_key}: {err}"),
                                kind: StepFailureKind::Framework,
                            },
                        )
                        .await?;
                }
                in_flight.insert(step_key, args);
            }

            self.poll_events(run_id, &mut cursor, &mut in_flight, active).await?;

            if in_flight.is_empty() {
                if active.is_complete() {
                    break;
                }
                if written > 0 || launched > 0 {
                    continue;
                }
                if active.next_retry_at().is_none() {
                    return Err(stalled(active));
                }
            } else {
                self.check_health(run_id, &mut cursor, &mut in_flight, active).await?;
            }

            let wake_at = active
                .next_retry_at()
                .map(|at| at.min(Instant::now() + self.services.config.step_poll_interval()))
                .unwrap_or_else(|| Instant::now() + self.services.config.step_poll_interval());
            tokio::select! {
                _ = tokio::time::sleep_until(wake_at) => {}
                _ = wait_for_interrupt(&mut interrupt), if !active.is_interrupted() => {}
            }
        }
        debug!(run_id = %run_id, "Delegated execution finished");
        Ok(())
    }
}

/// Runs each delegated step as a detached tokio task of this process.
///
/// Arguments are passed through their serialized form, the same payload an
/// out-of-process handler would put on a command line or queue.
pub struct LocalStepHandler {
    services: ExecutionServices,
    workers: DashMap<String, tokio::task::JoinHandle<()>>,
    interrupts: DashMap<String, watch::Sender<bool>>,
}

impl std::fmt::Debug for LocalStepHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStepHandler")
            .field("workers", &self.workers.len())
            .finish()
    }
}

impl LocalStepHandler {
    pub fn new(services: ExecutionServices) -> Self {
        Self {
            services,
            workers: DashMap::new(),
            interrupts: DashMap::new(),
        }
    }

    fn worker_id(args: &ExecuteStepArgs) -> String {
        format!("{}/{}/{}", args.run_id, args.step_key(), args.retry_number)
    }
}

#[async_trait]
impl StepHandler for LocalStepHandler {
    fn name(&self) -> &str {
        "local"
    }

    async fn launch_step(&self, args: ExecuteStepArgs) -> Result<()> {
        let payload = serde_json::to_string(&args)?;
        let worker_id = Self::worker_id(&args);
        let services = self.services.clone();
        let (sender, receiver) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let args: ExecuteStepArgs = match serde_json::from_str(&payload) {
                Ok(args) => args,
                Err(err) => {
                    warn!(error = %err, "Step worker received unreadable arguments");
                    return;
                }
            };
            if let Err(err) = super::run_worker::execute_step_worker(&services, &args, receiver).await {
                warn!(run_id = %args.run_id, step_key = %args.step_key(), error = %err, "Step worker failed");
            }
        });
        self.workers.insert(worker_id.clone(), handle);
        self.interrupts.insert(worker_id, sender);
        Ok(())
    }

    async fn check_step_health(&self, args: &ExecuteStepArgs) -> Result<WorkerHealth> {
        let worker_id = Self::worker_id(args);
        Ok(match self.workers.get(&worker_id) {
            Some(handle) if !handle.is_finished() => WorkerHealth::Running,
            Some(_) | None => WorkerHealth::NotFound,
        })
    }

    async fn terminate_step(&self, args: &ExecuteStepArgs) -> Result<()> {
        if let Some(sender) = self.interrupts.get(&Self::worker_id(args)) {
            let _ = sender.send(true);
        }
        Ok(())
    }
}
