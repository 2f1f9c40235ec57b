#![allow(clippy::doc_markdown)] // Allow technical terms like DAG, IO in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Dagflow Core
//!
//! Execution-plan scheduling and run coordination for data pipelines.
//!
//! ## Overview
//!
//! A job is a graph of steps connected through named outputs. Dagflow turns
//! a job plus a run config into an [`execution::ExecutionPlan`], executes the
//! plan step by step through an [`execution::Executor`], and records every
//! state change as an event in the event log. Around the execution engine
//! sit the pieces that decide *when* runs happen: a run coordinator with
//! priority and tag concurrency limits, a monitoring daemon that detects
//! lost workers, and schedule and sensor daemons that create runs
//! exactly once per tick.
//!
//! ## Architecture
//!
//! Runs move through a compare-and-set state machine stored in the run
//! storage. Every component that changes a run's status goes through
//! [`state_machine::RunStateMachine`], so concurrent daemons never disagree
//! about who owns a transition. Step outputs are persisted through an
//! [`execution::IoManager`] and keyed by content-hashed versions, which lets
//! memoized runs skip steps whose outputs are already stored.
//!
//! ## Module Organization
//!
//! - [`definitions`] - Jobs, steps, resources, config schemas and data types
//! - [`execution`] - Plan building, active execution tracking and executors
//! - [`versioning`] - Step, output and asset logical versions
//! - [`partitions`] - Time-window and static partitions, cadences and subsets
//! - [`state_machine`] - Run, step and tick lifecycles
//! - [`storage`] - Run, event log, schedule and compute log storage
//! - [`orchestration`] - Coordinators, launcher, monitor, scheduler, sensors and daemons
//! - [`models`] - Runs, events, ticks, asset keys and output handles
//! - [`config`] - Layered configuration
//! - [`error`] - Structured error handling
//! - [`logging`] - Structured logging helpers
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use dagflow_core::definitions::{InputDefinition, JobDefinition, JobRepository, StepDefinition};
//! use dagflow_core::models::Run;
//! use dagflow_core::DagflowInstance;
//! use serde_json::{json, Value};
//!
//! # async fn example() -> dagflow_core::Result<()> {
//! let repository = Arc::new(JobRepository::new());
//! repository.register(
//!     JobDefinition::builder("numbers")
//!         .step(StepDefinition::new("emit", |ctx, _| {
//!             ctx.output("result", json!(1));
//!             Ok(())
//!         }))
//!         .step(
//!             StepDefinition::new("add_one", |ctx, inputs| {
//!                 let value = inputs.require("value")?.as_i64().unwrap_or_default();
//!                 ctx.output("result", json!(value + 1));
//!                 Ok(())
//!             })
//!             .with_input(InputDefinition::from_output("value", "emit", "result")),
//!         )
//!         .build()?,
//! );
//!
//! let instance = DagflowInstance::ephemeral(repository)?;
//! let run = instance.launch_run(Run::new("numbers", Value::Null)).await?;
//! let run = instance.wait_for_run(run.run_id, Duration::from_secs(30)).await?;
//! println!("run {} finished as {}", run.run_id, run.status);
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! Everything runs against the in-memory storages, so the full suite needs
//! no external services:
//!
//! ```bash
//! cargo test --lib    # Unit tests
//! cargo test          # Unit and integration tests
//! ```

pub mod config;
pub mod constants;
pub mod definitions;
pub mod error;
pub mod execution;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod partitions;
pub mod state_machine;
pub mod storage;
pub mod versioning;

pub use config::{
    ConfigManager, DagflowConfig, ExecutionConfig, RunCoordinatorConfig, RunMonitoringConfig, SchedulerConfig,
    TagConcurrencyLimit,
};
pub use constants::{engine_events, system, tags};
pub use definitions::{JobDefinition, JobRepository, StepDefinition};
pub use error::{DagflowError, Result};
pub use execution::{ExecutionPlan, ExecutionPlanBuilder, RunWorker};
pub use models::{AssetKey, DagflowEvent, EventRecord, Run, RunFilter, Tick};
pub use orchestration::{
    DagflowInstance, DaemonController, RunCoordinator, RunLauncher, ScheduleDefinition, SensorDefinition,
};
pub use state_machine::{RunStatus, StepStatus, TickStatus};
