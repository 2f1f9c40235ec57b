//! # Run Launcher
//!
//! Owns the worker lifecycle of launched runs: start, health, resume and
//! termination.
//!
//! ## Launch checkpoints
//!
//! A launch can be interrupted at three points and is safe to repeat at each:
//!
//! 1. **No run record**: the caller simply creates the run again
//! 2. **Run record, not dispatched**: the run is still `NOT_STARTED`/`QUEUED`
//!    and is dispatched normally
//! 3. **Dispatched, worker not acknowledged**: the run is `STARTING`; a launch
//!    marker written atomically before the worker is spawned keeps a second
//!    launch of the same run (and resume attempt) from spawning another
//!    worker. The monitoring daemon fails runs stuck here.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{oneshot, watch};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::constants::kvs;
use crate::error::{DagflowError, Result};
use crate::execution::{RunWorker, WorkerHealth};
use crate::logging::{log_error, log_run_operation};
use crate::models::Run;
use crate::state_machine::{RunEvent, RunStateMachine, RunStatus};

#[async_trait]
pub trait RunLauncher: Send + Sync {
    fn name(&self) -> &str;

    /// Start a worker for a run already in `STARTING`
    async fn launch_run(&self, run: &Run) -> Result<()>;

    fn supports_resume(&self) -> bool {
        false
    }

    /// Start a replacement worker for a `STARTED` run whose worker was lost
    async fn resume_run(&self, run: &Run) -> Result<()> {
        Err(DagflowError::Launch {
            run_id: run.run_id,
            reason: format!("launcher '{}' cannot resume runs", self.name()),
        })
    }

    async fn check_run_worker_health(&self, run: &Run) -> Result<WorkerHealth>;

    /// Request termination. Returns `false` when there was nothing left to
    /// terminate: the run already finished or termination was already requested.
    async fn terminate(&self, run_id: Uuid) -> Result<bool>;
}

struct WorkerHandle {
    generation: Uuid,
    abort: AbortHandle,
    interrupt: watch::Sender<bool>,
    /// Closed once the worker task has exited
    exited: watch::Receiver<()>,
}

/// Owned by the worker task; removes the task's own entry when it ends,
/// including when it is aborted
struct WorkerRegistration {
    workers: Arc<DashMap<Uuid, WorkerHandle>>,
    run_id: Uuid,
    generation: Uuid,
    _exited: watch::Sender<()>,
}

impl Drop for WorkerRegistration {
    fn drop(&mut self) {
        let generation = self.generation;
        self.workers
            .remove_if(&self.run_id, |_, worker| worker.generation == generation);
    }
}

/// Runs each launched run in a tokio task of this process
pub struct DefaultRunLauncher {
    worker: RunWorker,
    state_machine: RunStateMachine,
    workers: Arc<DashMap<Uuid, WorkerHandle>>,
}

impl std::fmt::Debug for DefaultRunLauncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefaultRunLauncher")
            .field("workers", &self.workers.len())
            .finish()
    }
}

impl DefaultRunLauncher {
    pub fn new(worker: RunWorker) -> Self {
        let services = worker.services();
        let state_machine = RunStateMachine::new(services.run_storage.clone(), services.event_log.clone());
        Self {
            worker,
            state_machine,
            workers: Arc::new(DashMap::new()),
        }
    }

    fn launch_marker(run: &Run) -> String {
        format!("{}{}/{}", kvs::LAUNCH_MARKER_PREFIX, run.run_id, run.resume_attempts())
    }

    async fn spawn_worker(&self, run: &Run) -> Result<()> {
        let storage = &self.worker.services().run_storage;
        let marker = Self::launch_marker(run);
        if !storage.kvs_set_if_absent(&marker, &chrono::Utc::now().to_rfc3339()).await? {
            debug!(run_id = %run.run_id, marker = %marker, "Worker already launched for run");
            return Ok(());
        }

        let (sender, receiver) = watch::channel(false);
        let (exited_sender, exited) = watch::channel(());
        let (registered, is_registered) = oneshot::channel::<()>();
        let worker = self.worker.clone();
        let run_id = run.run_id;
        let generation = Uuid::new_v4();
        let registration = WorkerRegistration {
            workers: self.workers.clone(),
            run_id,
            generation,
            _exited: exited_sender,
        };

        let handle = tokio::spawn(async move {
            let _registration = registration;
            if is_registered.await.is_err() {
                return;
            }
            if let Err(err) = worker.execute_run(run_id, receiver).await {
                log_error("run_launcher", "execute_run", &err.to_string(), Some(&run_id.to_string()));
            }
        });
        self.workers.insert(
            run_id,
            WorkerHandle {
                generation,
                abort: handle.abort_handle(),
                interrupt: sender,
                exited,
            },
        );
        let _ = registered.send(());
        Ok(())
    }

    /// Wait for the local worker of `run_id` to exit. Returns `false` when
    /// this launcher has no live worker for the run.
    pub async fn wait_for_worker(&self, run_id: Uuid) -> bool {
        let Some(mut exited) = self.workers.get(&run_id).map(|worker| worker.exited.clone()) else {
            return false;
        };
        while exited.changed().await.is_ok() {}
        true
    }

    /// Number of workers still running
    pub fn active_workers(&self) -> usize {
        self.workers.len()
    }

    /// Simulate the worker process dying without a trace
    pub fn kill_worker(&self, run_id: Uuid) -> bool {
        let Some(abort) = self.workers.get(&run_id).map(|worker| worker.abort.clone()) else {
            return false;
        };
        abort.abort();
        true
    }
}

#[async_trait]
impl RunLauncher for DefaultRunLauncher {
    fn name(&self) -> &str {
        "default"
    }

    async fn launch_run(&self, run: &Run) -> Result<()> {
        info!(run_id = %run.run_id, job = %run.job_name, "🚀 LAUNCHER: Launching run worker");
        self.spawn_worker(run).await
    }

    fn supports_resume(&self) -> bool {
        true
    }

    async fn resume_run(&self, run: &Run) -> Result<()> {
        if let Some((_, stale)) = self.workers.remove(&run.run_id) {
            stale.abort.abort();
        }
        info!(
            run_id = %run.run_id,
            attempt = run.resume_attempts(),
            "🔁 LAUNCHER: Resuming run worker"
        );
        self.spawn_worker(run).await
    }

    async fn check_run_worker_health(&self, run: &Run) -> Result<WorkerHealth> {
        Ok(match self.workers.get(&run.run_id) {
            Some(worker) if !worker.abort.is_finished() => WorkerHealth::Running,
            _ => WorkerHealth::NotFound,
        })
    }

    async fn terminate(&self, run_id: Uuid) -> Result<bool> {
        let transition = self.state_machine.try_transition(run_id, RunEvent::Cancel).await?;
        let Some(transition) = transition else {
            return Ok(false);
        };

        if transition.to == RunStatus::Canceling {
            match self.workers.get(&run_id) {
                Some(worker) => {
                    let _ = worker.interrupt.send(true);
                }
                // Reconciled by the monitor once the cancel timeout passes
                None => warn!(run_id = %run_id, "No local worker to interrupt"),
            }
        }
        log_run_operation("terminate", Some(run_id), &transition.to.to_string(), None);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutionConfig;
    use crate::definitions::{JobDefinition, JobRepository, StepDefinition};
    use crate::execution::{ComputeError, ExecutionServices, InMemoryIoManager};
    use crate::storage::{InMemoryEventLogStorage, InMemoryRunStorage, NoOpComputeLogManager};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;

    fn launcher() -> (DefaultRunLauncher, ExecutionServices) {
        let repository = Arc::new(JobRepository::new());
        repository.register(
            JobDefinition::builder("sleepy")
                .step(StepDefinition::new("nap", |ctx, _| {
                    for _ in 0..400 {
                        if ctx.is_interrupted() {
                            return Err(ComputeError::Interrupted);
                        }
                        std::thread::sleep(Duration::from_millis(5));
                    }
                    ctx.output("result", json!(true));
                    Ok(())
                }))
                .build()
                .unwrap(),
        );
        repository.register(
            JobDefinition::builder("quick")
                .step(StepDefinition::new("emit", |ctx, _| {
                    ctx.output("result", json!(1));
                    Ok(())
                }))
                .build()
                .unwrap(),
        );
        let services = ExecutionServices {
            repository,
            run_storage: Arc::new(InMemoryRunStorage::new()),
            event_log: Arc::new(InMemoryEventLogStorage::new()),
            io_manager: Arc::new(InMemoryIoManager::new()),
            compute_logs: Arc::new(NoOpComputeLogManager),
            config: ExecutionConfig::default(),
        };
        (DefaultRunLauncher::new(RunWorker::new(services.clone())), services)
    }

    async fn starting_run(services: &ExecutionServices) -> Run {
        starting_run_of(services, "sleepy").await
    }

    async fn starting_run_of(services: &ExecutionServices, job_name: &str) -> Run {
        let run = services
            .run_storage
            .create_run(Run::new(job_name, Value::Null))
            .await
            .unwrap();
        RunStateMachine::new(services.run_storage.clone(), services.event_log.clone())
            .transition(run.run_id, RunEvent::Dispatch)
            .await
            .unwrap();
        run
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let (launcher, services) = launcher();
        let run = starting_run(&services).await;
        launcher.launch_run(&run).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(launcher.terminate(run.run_id).await.unwrap());
        assert!(!launcher.terminate(run.run_id).await.unwrap());
        launcher.wait_for_worker(run.run_id).await;

        let run = services.run_storage.get_run(run.run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Canceled);
        assert!(!launcher.terminate(run.run_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_launch_spawns_one_worker() {
        let (launcher, services) = launcher();
        let run = starting_run(&services).await;
        launcher.launch_run(&run).await.unwrap();
        launcher.launch_run(&run).await.unwrap();
        assert!(launcher.wait_for_worker(run.run_id).await);
        assert!(!launcher.wait_for_worker(run.run_id).await);

        let starts = services
            .event_log
            .get_events(run.run_id, None, None)
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.event.event_type() == "run_start")
            .count();
        assert_eq!(starts, 1);
    }

    #[tokio::test]
    async fn test_killed_worker_is_not_found() {
        let (launcher, services) = launcher();
        let run = starting_run(&services).await;
        launcher.launch_run(&run).await.unwrap();
        assert!(launcher.kill_worker(run.run_id));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            launcher.check_run_worker_health(&run).await.unwrap(),
            WorkerHealth::NotFound
        );
    }

    #[tokio::test]
    async fn test_finished_workers_are_released() {
        let (launcher, services) = launcher();
        let mut run_ids = Vec::new();
        for _ in 0..20 {
            let run = starting_run_of(&services, "quick").await;
            launcher.launch_run(&run).await.unwrap();
            run_ids.push(run.run_id);
        }

        for _ in 0..200 {
            if launcher.active_workers() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(launcher.active_workers(), 0);

        for run_id in run_ids {
            let run = services.run_storage.get_run(run_id).await.unwrap().unwrap();
            assert_eq!(run.status, RunStatus::Success);
            assert!(!launcher.wait_for_worker(run_id).await);
        }
    }

    #[tokio::test]
    async fn test_killed_worker_releases_its_slot() {
        let (launcher, services) = launcher();
        let run = starting_run(&services).await;
        launcher.launch_run(&run).await.unwrap();
        assert_eq!(launcher.active_workers(), 1);

        assert!(launcher.kill_worker(run.run_id));
        launcher.wait_for_worker(run.run_id).await;
        assert_eq!(launcher.active_workers(), 0);
        assert!(!launcher.kill_worker(run.run_id));
    }
}
