//! # Run Coordinators
//!
//! Admission control between run submission and the launcher.
//!
//! - [`DefaultRunCoordinator`] launches every submitted run immediately.
//! - [`QueuedRunCoordinator`] only enqueues; [`QueuedRunCoordinatorDaemon`]
//!   dequeues on each pass as many runs as the global and per-tag limits allow.
//!
//! ## Dequeue pass
//!
//! 1. Count in-progress runs globally and per tag
//! 2. Order queued runs by priority (descending), then submission order
//! 3. Walk the queue, skipping runs blocked by a tag limit, until the global
//!    budget is spent
//! 4. Dispatch each admitted run; launch failures fail that run only and are
//!    returned in [`DequeueResult::errors`]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::launcher::RunLauncher;
use crate::config::{RunCoordinatorConfig, TagConcurrencyLimit, TagLimitValue};
use crate::constants::engine_events;
use crate::error::{DagflowError, Result};
use crate::logging::log_run_operation;
use crate::models::{DagflowEvent, Run, RunFilter};
use crate::state_machine::{RunEvent, RunStateMachine, RunStatus};
use crate::storage::{EventLogStorage, RunStorage};

/// Statuses that hold a slot against concurrency limits
const IN_PROGRESS: [RunStatus; 3] = [RunStatus::Starting, RunStatus::Started, RunStatus::Canceling];

#[async_trait]
pub trait RunCoordinator: Send + Sync {
    /// Accept a `NOT_STARTED` run and return it with its new status
    async fn submit_run(&self, run_id: Uuid) -> Result<Run>;

    /// Cancel a run wherever it is in its lifecycle
    async fn cancel_run(&self, run_id: Uuid) -> Result<bool>;
}

/// Dispatch and launch shared by both coordinators
#[derive(Clone)]
struct Dispatcher {
    run_storage: Arc<dyn RunStorage>,
    event_log: Arc<dyn EventLogStorage>,
    state_machine: RunStateMachine,
    launcher: Arc<dyn RunLauncher>,
}

impl Dispatcher {
    fn new(run_storage: Arc<dyn RunStorage>, event_log: Arc<dyn EventLogStorage>, launcher: Arc<dyn RunLauncher>) -> Self {
        let state_machine = RunStateMachine::new(run_storage.clone(), event_log.clone());
        Self {
            run_storage,
            event_log,
            state_machine,
            launcher,
        }
    }

    async fn load(&self, run_id: Uuid) -> Result<Run> {
        self.run_storage
            .get_run(run_id)
            .await?
            .ok_or(DagflowError::RunNotFound(run_id))
    }

    /// Move the run to `STARTING` and launch it. A launch failure fails the run
    /// and is returned; storage errors propagate.
    async fn dispatch(&self, run_id: Uuid) -> Result<std::result::Result<(), String>> {
        if self.state_machine.try_transition(run_id, RunEvent::Dispatch).await?.is_none() {
            debug!(run_id = %run_id, "Run is no longer dispatchable");
            return Ok(Ok(()));
        }
        let run = self.load(run_id).await?;
        match self.launcher.launch_run(&run).await {
            Ok(()) => Ok(Ok(())),
            Err(err) => {
                let reason = err.to_string();
                warn!(run_id = %run_id, error = %reason, "Run launch failed");
                self.event_log
                    .append_event(run_id, None, DagflowEvent::engine_error(engine_events::LAUNCH_FAILED, reason.clone()))
                    .await?;
                self.state_machine
                    .try_transition(run_id, RunEvent::fail_with_error(reason.clone()))
                    .await?;
                Ok(Err(reason))
            }
        }
    }

    async fn cancel(&self, run_id: Uuid) -> Result<bool> {
        let run = self.load(run_id).await?;
        if run.status.is_terminal() {
            return Ok(false);
        }
        if run.status.is_unlaunched() {
            let canceled = self.state_machine.try_transition(run_id, RunEvent::Cancel).await?;
            return Ok(canceled.is_some());
        }
        self.launcher.terminate(run_id).await
    }
}

/// Launches runs as soon as they are submitted
pub struct DefaultRunCoordinator {
    dispatcher: Dispatcher,
}

impl DefaultRunCoordinator {
    pub fn new(
        run_storage: Arc<dyn RunStorage>,
        event_log: Arc<dyn EventLogStorage>,
        launcher: Arc<dyn RunLauncher>,
    ) -> Self {
        Self {
            dispatcher: Dispatcher::new(run_storage, event_log, launcher),
        }
    }
}

#[async_trait]
impl RunCoordinator for DefaultRunCoordinator {
    async fn submit_run(&self, run_id: Uuid) -> Result<Run> {
        if let Err(reason) = self.dispatcher.dispatch(run_id).await? {
            log_run_operation("submit", Some(run_id), "FAILURE", Some(&reason));
        }
        self.dispatcher.load(run_id).await
    }

    async fn cancel_run(&self, run_id: Uuid) -> Result<bool> {
        self.dispatcher.cancel(run_id).await
    }
}

/// Places submitted runs in the queue for [`QueuedRunCoordinatorDaemon`]
pub struct QueuedRunCoordinator {
    dispatcher: Dispatcher,
}

impl QueuedRunCoordinator {
    pub fn new(
        run_storage: Arc<dyn RunStorage>,
        event_log: Arc<dyn EventLogStorage>,
        launcher: Arc<dyn RunLauncher>,
    ) -> Self {
        Self {
            dispatcher: Dispatcher::new(run_storage, event_log, launcher),
        }
    }
}

#[async_trait]
impl RunCoordinator for QueuedRunCoordinator {
    async fn submit_run(&self, run_id: Uuid) -> Result<Run> {
        self.dispatcher
            .state_machine
            .transition(run_id, RunEvent::Enqueue)
            .await?;
        self.dispatcher.load(run_id).await
    }

    async fn cancel_run(&self, run_id: Uuid) -> Result<bool> {
        self.dispatcher.cancel(run_id).await
    }
}

/// Tracks how many in-progress runs carry each tag and decides whether one
/// more run fits under every applicable limit.
///
/// Duplicate limits for the same key (or key and value) collapse to the
/// smallest; a run is admitted only if every limit it falls under has room.
#[derive(Debug, Default, Clone)]
pub struct TagConcurrencyLimitsCounter {
    key_limits: HashMap<String, u32>,
    value_limits: HashMap<(String, String), u32>,
    unique_value_limits: HashMap<String, u32>,
    key_counts: HashMap<String, u32>,
    value_counts: HashMap<(String, String), u32>,
}

impl TagConcurrencyLimitsCounter {
    pub fn new(limits: &[TagConcurrencyLimit], in_progress: &[Run]) -> Self {
        let mut counter = Self::default();
        for limit in limits {
            match &limit.value {
                Some(TagLimitValue::Exact(value)) => {
                    keep_min(&mut counter.value_limits, (limit.key.clone(), value.clone()), limit.limit)
                }
                Some(TagLimitValue::PerUniqueValue {
                    apply_limit_per_unique_value: true,
                }) => keep_min(&mut counter.unique_value_limits, limit.key.clone(), limit.limit),
                _ => keep_min(&mut counter.key_limits, limit.key.clone(), limit.limit),
            }
        }
        for run in in_progress {
            counter.update_with_run(run);
        }
        counter
    }

    pub fn is_blocked(&self, run: &Run) -> bool {
        run.tags.iter().any(|(key, value)| {
            let key_count = self.key_counts.get(key).copied().unwrap_or(0);
            let value_count = self
                .value_counts
                .get(&(key.clone(), value.clone()))
                .copied()
                .unwrap_or(0);

            self.key_limits.get(key).is_some_and(|limit| key_count >= *limit)
                || self
                    .value_limits
                    .get(&(key.clone(), value.clone()))
                    .is_some_and(|limit| value_count >= *limit)
                || self
                    .unique_value_limits
                    .get(key)
                    .is_some_and(|limit| value_count >= *limit)
        })
    }

    pub fn update_with_run(&mut self, run: &Run) {
        for (key, value) in &run.tags {
            *self.key_counts.entry(key.clone()).or_insert(0) += 1;
            *self.value_counts.entry((key.clone(), value.clone())).or_insert(0) += 1;
        }
    }
}

fn keep_min<K: std::hash::Hash + Eq>(limits: &mut HashMap<K, u32>, key: K, limit: u32) {
    limits
        .entry(key)
        .and_modify(|existing| *existing = (*existing).min(limit))
        .or_insert(limit);
}

/// Outcome of one dequeue pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DequeueResult {
    pub launched: Vec<Uuid>,
    /// Runs whose launch failed, with the reason; they are now `FAILURE`
    pub errors: Vec<(Uuid, String)>,
}

/// Periodic pass that admits queued runs
pub struct QueuedRunCoordinatorDaemon {
    dispatcher: Dispatcher,
    config: RunCoordinatorConfig,
}

impl QueuedRunCoordinatorDaemon {
    pub fn new(
        run_storage: Arc<dyn RunStorage>,
        event_log: Arc<dyn EventLogStorage>,
        launcher: Arc<dyn RunLauncher>,
        config: RunCoordinatorConfig,
    ) -> Self {
        Self {
            dispatcher: Dispatcher::new(run_storage, event_log, launcher),
            config,
        }
    }

    pub fn dequeue_interval(&self) -> std::time::Duration {
        self.config.dequeue_interval()
    }

    #[instrument(skip(self))]
    pub async fn run_iteration(&self) -> Result<DequeueResult> {
        let storage = &self.dispatcher.run_storage;
        let in_progress = storage
            .get_runs(&RunFilter::with_statuses(IN_PROGRESS), None, None)
            .await?;

        let mut budget = if self.config.max_concurrent_runs < 0 {
            usize::MAX
        } else {
            usize::try_from(self.config.max_concurrent_runs)
                .unwrap_or(0)
                .saturating_sub(in_progress.len())
        };
        let mut result = DequeueResult::default();
        if budget == 0 {
            debug!(in_progress = in_progress.len(), "No capacity for queued runs");
            return Ok(result);
        }

        let mut queued = storage
            .get_runs(&RunFilter::with_statuses([RunStatus::Queued]), None, None)
            .await?;
        // Storage returns newest first; equal enqueue times fall back to creation order
        queued.reverse();
        queued.sort_by_key(|run| (std::cmp::Reverse(run.priority()), run.queued_at));

        let mut counter = TagConcurrencyLimitsCounter::new(&self.config.tag_concurrency_limits, &in_progress);
        for run in queued {
            if budget == 0 {
                break;
            }
            if counter.is_blocked(&run) {
                debug!(run_id = %run.run_id, "Run blocked by tag concurrency limit");
                continue;
            }
            counter.update_with_run(&run);
            budget = budget.saturating_sub(1);

            match self.dispatcher.dispatch(run.run_id).await? {
                Ok(()) => result.launched.push(run.run_id),
                Err(reason) => result.errors.push((run.run_id, reason)),
            }
        }

        if !result.launched.is_empty() || !result.errors.is_empty() {
            info!(
                launched = result.launched.len(),
                failed = result.errors.len(),
                "📤 COORDINATOR: Dequeue pass complete"
            );
        }
        Ok(result)
    }
}
