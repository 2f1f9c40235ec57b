//! # State Machines
//!
//! Status lifecycles for runs, steps and ticks.
//!
//! - [`RunStateMachine`] persists through [`RunStorage`](crate::storage::RunStorage)
//!   with compare-and-set, because runs are mutated from several processes.
//! - [`StepStateMachine`] is in-memory; step status belongs to the process
//!   orchestrating the plan.
//! - Tick status only ever moves from `STARTED` to a terminal status; see
//!   [`tick_target_state`].

pub mod errors;
pub mod events;
pub mod run_state_machine;
pub mod states;
pub mod step_state_machine;

pub use errors::{StateMachineError, StateMachineResult};
pub use events::{RunEvent, StepEvent, TickEvent};
pub use run_state_machine::{RunStateMachine, RunTransition};
pub use states::{RunStatus, StepStatus, TickStatus};
pub use step_state_machine::StepStateMachine;

/// Determine the status a tick moves to when it is closed out
pub fn tick_target_state(current: TickStatus, event: &TickEvent) -> StateMachineResult<TickStatus> {
    match (current, event) {
        (TickStatus::Started, TickEvent::Succeed) => Ok(TickStatus::Success),
        (TickStatus::Started, TickEvent::Skip(_)) => Ok(TickStatus::Skipped),
        (TickStatus::Started, TickEvent::Fail(_)) => Ok(TickStatus::Failure),
        (from, _) => Err(StateMachineError::InvalidTransition {
            from: from.to_string(),
            event: event.event_type().to_string(),
        }),
    }
}
