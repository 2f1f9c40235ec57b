//! # Instance
//!
//! One object that wires the storages, IO manager, compute-log manager, run
//! launcher and run coordinator together from a [`DagflowConfig`], and
//! builds the daemons that operate on them.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use uuid::Uuid;

use super::coordinator::{DefaultRunCoordinator, QueuedRunCoordinator, QueuedRunCoordinatorDaemon, RunCoordinator};
use super::daemon::DaemonController;
use super::launcher::{DefaultRunLauncher, RunLauncher};
use super::monitor::RunMonitor;
use super::schedules::{ScheduleDefinition, SchedulerDaemon};
use super::sensors::{SensorDefinition, SensorDaemon};
use crate::config::{ConfigManager, DagflowConfig};
use crate::definitions::JobRepository;
use crate::error::{DagflowError, Result};
use crate::execution::{ExecutionServices, InMemoryIoManager, IoManager, RunWorker, StepHandler};
use crate::logging::log_run_operation;
use crate::models::Run;
use crate::storage::{
    ComputeLogManager, EventLogStorage, InMemoryEventLogStorage, InMemoryRunStorage, InMemoryScheduleStorage,
    LocalComputeLogManager, NoOpComputeLogManager, RunStorage, ScheduleStorage,
};

/// Assembles a [`DagflowInstance`]. Unset storages default to in-memory ones.
pub struct InstanceBuilder {
    repository: Arc<JobRepository>,
    config: DagflowConfig,
    run_storage: Option<Arc<dyn RunStorage>>,
    event_log: Option<Arc<dyn EventLogStorage>>,
    schedule_storage: Option<Arc<dyn ScheduleStorage>>,
    io_manager: Option<Arc<dyn IoManager>>,
    step_handler: Option<Arc<dyn StepHandler>>,
    queued: bool,
}

impl InstanceBuilder {
    pub fn config(mut self, config: DagflowConfig) -> Self {
        self.config = config;
        self
    }

    pub fn run_storage(mut self, run_storage: Arc<dyn RunStorage>) -> Self {
        self.run_storage = Some(run_storage);
        self
    }

    pub fn event_log(mut self, event_log: Arc<dyn EventLogStorage>) -> Self {
        self.event_log = Some(event_log);
        self
    }

    pub fn schedule_storage(mut self, schedule_storage: Arc<dyn ScheduleStorage>) -> Self {
        self.schedule_storage = Some(schedule_storage);
        self
    }

    pub fn io_manager(mut self, io_manager: Arc<dyn IoManager>) -> Self {
        self.io_manager = Some(io_manager);
        self
    }

    pub fn step_handler(mut self, step_handler: Arc<dyn StepHandler>) -> Self {
        self.step_handler = Some(step_handler);
        self
    }

    /// Submit runs to the queue instead of launching them immediately
    pub fn queued(mut self, queued: bool) -> Self {
        self.queued = queued;
        self
    }

    pub fn build(self) -> Result<DagflowInstance> {
        self.config.validate()?;

        let run_storage = self
            .run_storage
            .unwrap_or_else(|| Arc::new(InMemoryRunStorage::new()));
        let event_log = self
            .event_log
            .unwrap_or_else(|| Arc::new(InMemoryEventLogStorage::new()));
        let schedule_storage = self
            .schedule_storage
            .unwrap_or_else(|| Arc::new(InMemoryScheduleStorage::new()));
        let io_manager = self.io_manager.unwrap_or_else(|| Arc::new(InMemoryIoManager::new()));
        let compute_logs: Arc<dyn ComputeLogManager> = match &self.config.compute_logs.base_dir {
            Some(base_dir) => Arc::new(LocalComputeLogManager::new(base_dir.clone())),
            None => Arc::new(NoOpComputeLogManager),
        };

        let services = ExecutionServices {
            repository: self.repository,
            run_storage: run_storage.clone(),
            event_log: event_log.clone(),
            io_manager,
            compute_logs,
            config: self.config.execution.clone(),
        };
        let mut worker = RunWorker::new(services.clone());
        if let Some(step_handler) = self.step_handler {
            worker = worker.with_step_handler(step_handler);
        }
        let launcher = Arc::new(DefaultRunLauncher::new(worker));
        let coordinator: Arc<dyn RunCoordinator> = if self.queued {
            Arc::new(QueuedRunCoordinator::new(run_storage.clone(), event_log.clone(), launcher.clone()))
        } else {
            Arc::new(DefaultRunCoordinator::new(run_storage.clone(), event_log.clone(), launcher.clone()))
        };

        info!(
            queued = self.queued,
            jobs = services.repository.job_names().len(),
            "🎉 INSTANCE: Dagflow instance ready"
        );
        Ok(DagflowInstance {
            config: self.config,
            services,
            schedule_storage,
            launcher,
            coordinator,
            queued: self.queued,
        })
    }
}

pub struct DagflowInstance {
    config: DagflowConfig,
    services: ExecutionServices,
    schedule_storage: Arc<dyn ScheduleStorage>,
    launcher: Arc<DefaultRunLauncher>,
    coordinator: Arc<dyn RunCoordinator>,
    queued: bool,
}

impl std::fmt::Debug for DagflowInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DagflowInstance")
            .field("services", &self.services)
            .field("launcher", &self.launcher)
            .finish()
    }
}

impl DagflowInstance {
    pub fn builder(repository: Arc<JobRepository>) -> InstanceBuilder {
        InstanceBuilder {
            repository,
            config: DagflowConfig::default(),
            run_storage: None,
            event_log: None,
            schedule_storage: None,
            io_manager: None,
            step_handler: None,
            queued: false,
        }
    }

    /// In-memory instance with default configuration
    pub fn ephemeral(repository: Arc<JobRepository>) -> Result<Self> {
        Self::builder(repository).build()
    }

    /// Instance configured from the layered configuration files in `config_dir`
    pub fn from_config_dir(repository: Arc<JobRepository>, config_dir: Option<PathBuf>) -> Result<Self> {
        let manager = ConfigManager::load_from_directory(config_dir)?;
        Self::builder(repository).config(manager.config().clone()).build()
    }

    pub fn config(&self) -> &DagflowConfig {
        &self.config
    }

    pub fn services(&self) -> &ExecutionServices {
        &self.services
    }

    pub fn run_storage(&self) -> &Arc<dyn RunStorage> {
        &self.services.run_storage
    }

    pub fn event_log(&self) -> &Arc<dyn EventLogStorage> {
        &self.services.event_log
    }

    pub fn schedule_storage(&self) -> &Arc<dyn ScheduleStorage> {
        &self.schedule_storage
    }

    pub fn launcher(&self) -> &Arc<DefaultRunLauncher> {
        &self.launcher
    }

    pub fn coordinator(&self) -> &Arc<dyn RunCoordinator> {
        &self.coordinator
    }

    /// Persist a new `NOT_STARTED` run of a registered job
    pub async fn create_run(&self, run: Run) -> Result<Run> {
        self.services.repository.get(&run.job_name)?;
        let run = self.services.run_storage.create_run(run).await?;
        log_run_operation("create_run", Some(run.run_id), "NOT_STARTED", Some(&run.job_name));
        Ok(run)
    }

    pub async fn submit_run(&self, run_id: Uuid) -> Result<Run> {
        self.coordinator.submit_run(run_id).await
    }

    /// Create and submit in one call
    pub async fn launch_run(&self, run: Run) -> Result<Run> {
        let run = self.create_run(run).await?;
        self.submit_run(run.run_id).await
    }

    /// Cancel a queued run or terminate a launched one. Returns `false` when
    /// the run had already finished or termination was already requested.
    pub async fn terminate(&self, run_id: Uuid) -> Result<bool> {
        self.coordinator.cancel_run(run_id).await
    }

    /// Launch a re-execution of `parent_run_id`, optionally limited to `step_selection`
    pub async fn reexecute(&self, parent_run_id: Uuid, step_selection: Option<Vec<String>>) -> Result<Run> {
        let parent = self
            .services
            .run_storage
            .get_run(parent_run_id)
            .await?
            .ok_or(DagflowError::RunNotFound(parent_run_id))?;
        self.launch_run(Run::reexecution_of(&parent, step_selection)).await
    }

    /// Poll until the run reaches a terminal status or `timeout` passes
    pub async fn wait_for_run(&self, run_id: Uuid, timeout: Duration) -> Result<Run> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let run = self
                .services
                .run_storage
                .get_run(run_id)
                .await?
                .ok_or(DagflowError::RunNotFound(run_id))?;
            if run.status.is_terminal() || tokio::time::Instant::now() >= deadline {
                return Ok(run);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub fn queued_run_coordinator_daemon(&self) -> QueuedRunCoordinatorDaemon {
        QueuedRunCoordinatorDaemon::new(
            self.services.run_storage.clone(),
            self.services.event_log.clone(),
            self.launcher.clone() as Arc<dyn RunLauncher>,
            self.config.run_coordinator.clone(),
        )
    }

    pub fn run_monitor(&self) -> RunMonitor {
        RunMonitor::new(
            self.services.run_storage.clone(),
            self.services.event_log.clone(),
            self.launcher.clone() as Arc<dyn RunLauncher>,
            self.config.run_monitoring.clone(),
        )
    }

    pub fn scheduler(&self, schedules: Vec<ScheduleDefinition>) -> SchedulerDaemon {
        SchedulerDaemon::new(
            schedules,
            self.services.run_storage.clone(),
            self.schedule_storage.clone(),
            self.coordinator.clone(),
            self.config.scheduler.clone(),
        )
    }

    pub fn sensor_daemon(&self, sensors: Vec<SensorDefinition>) -> SensorDaemon {
        SensorDaemon::new(
            sensors,
            self.services.run_storage.clone(),
            self.schedule_storage.clone(),
            self.coordinator.clone(),
        )
    }

    /// Start the daemons this instance needs: the dequeue loop when runs are
    /// queued, run monitoring when enabled, and scheduler/sensor loops when
    /// any are defined.
    pub fn start_daemons(
        &self,
        schedules: Vec<ScheduleDefinition>,
        sensors: Vec<SensorDefinition>,
    ) -> DaemonController {
        let controller = DaemonController::new(self.services.run_storage.clone());
        if self.queued {
            controller.spawn(Arc::new(self.queued_run_coordinator_daemon()));
        }
        if self.config.run_monitoring.enabled {
            controller.spawn(Arc::new(self.run_monitor()));
        }
        if !schedules.is_empty() {
            controller.spawn(Arc::new(self.scheduler(schedules)));
        }
        if !sensors.is_empty() {
            controller.spawn(Arc::new(self.sensor_daemon(sensors)));
        }
        controller
    }
}
