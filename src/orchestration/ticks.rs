//! # Tick Run Launching
//!
//! Schedules and sensors both turn one evaluation into a tick plus zero or
//! more run requests. This module owns the part they share: creating and
//! submitting the requested runs so that a tick interrupted at any point can
//! be finished later without launching a run twice.
//!
//! ## Checkpoints
//!
//! ```text
//! tick created ─► requests evaluated ─► run created ─► run added to tick ─► run submitted ─► tick closed
//! TickCreated      TickHeld              RunCreated      RunAdded             RunLaunched      TickSuccess
//! ```
//!
//! Every run created for a tick carries identity tags (instigator name, tick
//! id, and the run key or request position). Before creating a run the
//! launcher looks for an existing run with the same identity, so re-running
//! an interrupted tick picks up where the previous attempt stopped.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use super::coordinator::RunCoordinator;
use crate::constants::tags;
use crate::error::{DagflowError, Result};
use crate::logging::log_tick_operation;
use crate::models::{Run, RunFilter, Tick};
use crate::state_machine::RunStatus;
use crate::storage::{RunStorage, ScheduleStorage};

/// A run an instigator asks to launch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    /// Unique per instigator; a key that already launched a run is skipped
    pub run_key: Option<String>,
    pub run_config: Value,
    pub tags: BTreeMap<String, String>,
    pub partition_key: Option<String>,
    /// Overrides the instigator's job
    pub job_name: Option<String>,
}

impl RunRequest {
    pub fn new(run_config: Value) -> Self {
        Self {
            run_key: None,
            run_config,
            tags: BTreeMap::new(),
            partition_key: None,
            job_name: None,
        }
    }

    pub fn with_run_key(mut self, run_key: impl Into<String>) -> Self {
        self.run_key = Some(run_key.into());
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn for_partition(mut self, partition_key: impl Into<String>) -> Self {
        self.partition_key = Some(partition_key.into());
        self
    }

    pub fn for_job(mut self, job_name: impl Into<String>) -> Self {
        self.job_name = Some(job_name.into());
        self
    }
}

/// Points in tick processing where a simulated crash can be injected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CrashPoint {
    TickCreated,
    TickHeld,
    RunCreated,
    RunAdded,
    RunLaunched,
    TickSuccess,
}

impl fmt::Display for CrashPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::TickCreated => "TICK_CREATED",
            Self::TickHeld => "TICK_HELD",
            Self::RunCreated => "RUN_CREATED",
            Self::RunAdded => "RUN_ADDED",
            Self::RunLaunched => "RUN_LAUNCHED",
            Self::TickSuccess => "TICK_SUCCESS",
        };
        f.write_str(name)
    }
}

/// Crash points armed for a daemon, used by recovery tests
#[derive(Debug, Clone, Default)]
pub struct DebugCrashFlags {
    points: HashSet<CrashPoint>,
}

impl DebugCrashFlags {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn crash_at(mut self, point: CrashPoint) -> Self {
        self.points.insert(point);
        self
    }

    pub fn check(&self, point: CrashPoint) -> Result<()> {
        if self.points.contains(&point) {
            warn!(point = %point, "💥 Simulated crash");
            return Err(DagflowError::SimulatedCrash(point.to_string()));
        }
        Ok(())
    }
}

/// Result of launching the requests of one tick
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickLaunchOutcome {
    pub launched: Vec<Uuid>,
    /// Run keys that already launched a run in an earlier tick
    pub skipped_run_keys: Vec<String>,
}

/// Creates, checkpoints and submits the runs of a tick
#[derive(Clone)]
pub(crate) struct TickRunLauncher {
    run_storage: Arc<dyn RunStorage>,
    schedule_storage: Arc<dyn ScheduleStorage>,
    coordinator: Arc<dyn RunCoordinator>,
    crash_flags: DebugCrashFlags,
}

impl TickRunLauncher {
    pub(crate) fn new(
        run_storage: Arc<dyn RunStorage>,
        schedule_storage: Arc<dyn ScheduleStorage>,
        coordinator: Arc<dyn RunCoordinator>,
        crash_flags: DebugCrashFlags,
    ) -> Self {
        Self {
            run_storage,
            schedule_storage,
            coordinator,
            crash_flags,
        }
    }

    pub(crate) fn with_crash_flags(mut self, crash_flags: DebugCrashFlags) -> Self {
        self.crash_flags = crash_flags;
        self
    }

    pub(crate) fn schedule_storage(&self) -> &Arc<dyn ScheduleStorage> {
        &self.schedule_storage
    }

    pub(crate) fn check(&self, point: CrashPoint) -> Result<()> {
        self.crash_flags.check(point)
    }

    /// Launch `requests` for `tick`. `identity` holds the tags that name the
    /// instigator (and, for schedules, the scheduled time).
    pub(crate) async fn launch_requests(
        &self,
        tick: &mut Tick,
        default_job: &str,
        identity: &BTreeMap<String, String>,
        requests: Vec<RunRequest>,
    ) -> Result<TickLaunchOutcome> {
        let mut outcome = TickLaunchOutcome::default();
        let tick_id = tick.tick_id.to_string();

        for (index, request) in requests.into_iter().enumerate() {
            let mut run_identity = identity.clone();
            match &request.run_key {
                Some(run_key) => {
                    run_identity.insert(tags::RUN_KEY.to_string(), run_key.clone());
                }
                None => {
                    run_identity.insert(tags::TICK_ID.to_string(), tick_id.clone());
                    run_identity.insert(tags::TICK_REQUEST_INDEX.to_string(), index.to_string());
                }
            }

            let existing = self
                .run_storage
                .get_runs(&RunFilter::with_tags(run_identity.clone()), None, Some(1))
                .await?
                .into_iter()
                .next();

            let run = match existing {
                Some(run) if run.tag(tags::TICK_ID) != Some(tick_id.as_str()) && run.status != RunStatus::NotStarted => {
                    if let Some(run_key) = &request.run_key {
                        debug!(run_key = %run_key, run_id = %run.run_id, "Run key already launched a run");
                        outcome.skipped_run_keys.push(run_key.clone());
                    }
                    continue;
                }
                Some(run) => run,
                None => {
                    let run = self
                        .run_storage
                        .create_run(build_run(&request, default_job, &run_identity, &tick_id))
                        .await?;
                    self.check(CrashPoint::RunCreated)?;
                    run
                }
            };

            if !tick.run_ids.contains(&run.run_id) {
                tick.add_run(run.run_id, request.run_key.as_deref());
                self.schedule_storage.update_tick(tick).await?;
                self.check(CrashPoint::RunAdded)?;
            }

            if run.status == RunStatus::NotStarted {
                self.coordinator.submit_run(run.run_id).await?;
                log_tick_operation(
                    "submit_run",
                    &tick.origin_id,
                    Some(tick.tick_id),
                    "SUBMITTED",
                    Some(&run.run_id.to_string()),
                );
                self.check(CrashPoint::RunLaunched)?;
            }
            outcome.launched.push(run.run_id);
        }
        Ok(outcome)
    }
}

fn build_run(request: &RunRequest, default_job: &str, identity: &BTreeMap<String, String>, tick_id: &str) -> Run {
    let job_name = request.job_name.as_deref().unwrap_or(default_job);
    let mut run = Run::new(job_name, request.run_config.clone())
        .with_tags(request.tags.clone())
        .with_tags(identity.clone())
        .with_tag(tags::TICK_ID, tick_id);
    if let Some(partition_key) = &request.partition_key {
        run = run.with_tag(tags::PARTITION, partition_key.clone());
    }
    run
}
