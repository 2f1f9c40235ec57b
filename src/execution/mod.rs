//! # Execution
//!
//! Everything between a job definition and the events of a finished run.
//!
//! ## Flow
//!
//! ```text
//! JobDefinition + run config
//!     -> ExecutionPlanBuilder (config, ordering, versions, selection)
//!     -> build_memoized_plan (optional)
//!     -> ActiveExecution (step state, dynamic resolution, skips)
//!     -> Executor (in-process tasks or delegated step workers)
//!     -> StepExecutor (one attempt of one step)
//! ```
//!
//! [`RunWorker`] ties the stages together for a whole run.

pub mod active_execution;
pub mod context;
pub mod executor;
pub mod io_manager;
pub mod plan;
pub mod plan_builder;
pub mod run_worker;
pub mod step_executor;

pub use active_execution::{ActiveExecution, StepAttempt};
pub use context::{ComputeError, ProducedOutput, StepContext, StepInputs};
pub use executor::{
    ExecuteStepArgs, Executor, InProcessExecutor, LocalStepHandler, StepDelegatingExecutor, StepHandler,
    WorkerHealth,
};
pub use io_manager::{FilesystemIoManager, InMemoryIoManager, InputContext, IoManager, IoManagerError, OutputContext};
pub use plan::{
    unresolved_step_key, DynamicOutputRef, ExecutionPlan, ExecutionStep, KnownExecutionState, ResolvedRunConfig,
    StepInput, StepInputSource, StepKind, StepOutputSpec, StepVersions,
};
pub use plan_builder::{build_memoized_plan, ExecutionPlanBuilder, PlanBuildPhase};
pub use run_worker::{execute_step_worker, RunWorker, STEP_DELEGATING_EXECUTOR};
pub use step_executor::{ExecutionServices, RunContext, StepExecutor};
