//! Shared fixtures for orchestration unit tests

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use super::coordinator::{QueuedRunCoordinator, RunCoordinator};
use super::launcher::RunLauncher;
use crate::error::Result;
use crate::execution::WorkerHealth;
use crate::models::Run;
use crate::storage::{InMemoryEventLogStorage, InMemoryRunStorage, InMemoryScheduleStorage};

/// Launcher that accepts every run and never starts a worker
pub(crate) struct NullLauncher;

#[async_trait]
impl RunLauncher for NullLauncher {
    fn name(&self) -> &str {
        "null"
    }

    async fn launch_run(&self, _run: &Run) -> Result<()> {
        Ok(())
    }

    async fn check_run_worker_health(&self, _run: &Run) -> Result<WorkerHealth> {
        Ok(WorkerHealth::Unknown)
    }

    async fn terminate(&self, _run_id: Uuid) -> Result<bool> {
        Ok(false)
    }
}

pub(crate) struct QueuedStack {
    pub run_storage: Arc<InMemoryRunStorage>,
    pub schedule_storage: Arc<InMemoryScheduleStorage>,
    pub coordinator: Arc<dyn RunCoordinator>,
}

/// In-memory storages behind a queued coordinator, so submitted runs stop at `QUEUED`
pub(crate) fn queued_stack() -> QueuedStack {
    let run_storage = Arc::new(InMemoryRunStorage::new());
    let event_log = Arc::new(InMemoryEventLogStorage::new());
    let coordinator = Arc::new(QueuedRunCoordinator::new(
        run_storage.clone(),
        event_log,
        Arc::new(NullLauncher),
    ));
    QueuedStack {
        run_storage,
        schedule_storage: Arc::new(InMemoryScheduleStorage::new()),
        coordinator,
    }
}
