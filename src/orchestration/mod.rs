//! # Orchestration
//!
//! Everything around a run worker: admission, launch, health reconciliation
//! and the instigators that create runs on a cadence.
//!
//! ## Components
//!
//! - [`launcher`]: worker lifecycle of launched runs (launch, health, resume, terminate)
//! - [`coordinator`]: immediate or queued admission with global and per-tag limits
//! - [`monitor`]: fails, resumes or cancels runs whose workers stopped reporting
//! - [`ticks`], [`schedules`], [`sensors`]: crash-safe tick evaluation
//! - [`daemon`]: polling loops with heartbeats and cooperative shutdown
//! - [`instance`]: wiring of storages, launcher and coordinator from configuration
//!
//! Daemons keep no state between iterations. Run and tick records in storage
//! are the only state shared between them.

pub mod coordinator;
pub mod daemon;
pub mod instance;
pub mod launcher;
pub mod monitor;
pub mod schedules;
pub mod sensors;
pub mod ticks;

#[cfg(test)]
pub(crate) mod testing;

pub use coordinator::{
    DefaultRunCoordinator, DequeueResult, QueuedRunCoordinator, QueuedRunCoordinatorDaemon, RunCoordinator,
    TagConcurrencyLimitsCounter,
};
pub use daemon::{get_daemon_heartbeat, Daemon, DaemonController, DaemonHeartbeat};
pub use instance::{DagflowInstance, InstanceBuilder};
pub use launcher::{DefaultRunLauncher, RunLauncher};
pub use monitor::{MonitorAction, RunMonitor};
pub use schedules::{ScheduleDefinition, ScheduleEvaluationContext, ScheduleTickResult, SchedulerDaemon};
pub use sensors::{SensorDaemon, SensorDefinition, SensorEvaluationContext, SensorResult, SensorTickResult};
pub use ticks::{CrashPoint, DebugCrashFlags, RunRequest, TickLaunchOutcome};
