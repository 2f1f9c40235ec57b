//! # Data Models
//!
//! Persisted records shared between the execution engine, storage and the
//! orchestration daemons: runs, ticks, event-log records and the addressing
//! types for step outputs and assets.

pub mod asset;
pub mod event;
pub mod handles;
pub mod run;
pub mod tick;

pub use asset::AssetKey;
pub use event::{DagflowEvent, EventRecord, StepFailureKind};
pub use handles::{mapped_step_key, split_step_key, StepOutputHandle};
pub use run::{ExecutionPlanSnapshot, Run, RunFilter};
pub use tick::{InstigatorState, InstigatorStatus, InstigatorType, Tick};
