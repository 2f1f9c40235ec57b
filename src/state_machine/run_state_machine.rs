use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    errors::{StateMachineError, StateMachineResult},
    events::RunEvent,
    states::RunStatus,
};
use crate::logging::log_run_operation;
use crate::models::DagflowEvent;
use crate::storage::{EventLogStorage, RunStorage};

/// Number of times a lost compare-and-set race is re-evaluated against the fresh status.
const MAX_TRANSITION_ATTEMPTS: usize = 3;

/// A status change that was persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunTransition {
    pub from: RunStatus,
    pub to: RunStatus,
}

/// Run status state machine backed by run storage.
///
/// The persisted status is the only source of truth: every transition reads it,
/// computes the target and writes it back with compare-and-set, so workers,
/// coordinators and daemons in different tasks or processes can race safely.
#[derive(Clone)]
pub struct RunStateMachine {
    run_storage: Arc<dyn RunStorage>,
    event_log: Arc<dyn EventLogStorage>,
}

impl RunStateMachine {
    pub fn new(run_storage: Arc<dyn RunStorage>, event_log: Arc<dyn EventLogStorage>) -> Self {
        Self {
            run_storage,
            event_log,
        }
    }

    /// Determine the target state based on current state and event
    pub fn determine_target_state(
        current_state: RunStatus,
        event: &RunEvent,
    ) -> StateMachineResult<RunStatus> {
        use RunStatus::*;

        let target = match (current_state, event) {
            (NotStarted, RunEvent::Enqueue) => Queued,
            (NotStarted | Queued, RunEvent::Dispatch) => Starting,
            (NotStarted, RunEvent::Manage) => Managed,

            // A resumed worker acknowledges again while the run is already STARTED
            (Starting | Started, RunEvent::Start) => Started,
            (Started | Managed, RunEvent::Complete) => Success,

            (NotStarted | Queued | Starting | Started | Managed, RunEvent::Fail(_)) => Failure,

            // Nothing is running yet, so cancellation is immediate
            (NotStarted | Queued | Managed, RunEvent::Cancel) => Canceled,
            (Starting | Started, RunEvent::Cancel) => Canceling,

            // Whatever the worker reports after a termination request, the run ends canceled
            (Canceling, RunEvent::Canceled | RunEvent::Complete | RunEvent::Fail(_)) => Canceled,
            (Starting | Started, RunEvent::Canceled) => Canceled,

            (from_state, _) => {
                return Err(StateMachineError::InvalidTransition {
                    from: from_state.to_string(),
                    event: event.event_type().to_string(),
                })
            }
        };

        Ok(target)
    }

    pub async fn current_state(&self, run_id: Uuid) -> StateMachineResult<RunStatus> {
        self.run_storage
            .get_run(run_id)
            .await?
            .map(|run| run.status)
            .ok_or(StateMachineError::RunNotFound(run_id))
    }

    /// Apply `event` to the run, failing if the event is not valid from the current status.
    pub async fn transition(
        &self,
        run_id: Uuid,
        event: RunEvent,
    ) -> StateMachineResult<RunTransition> {
        let mut expected = self.current_state(run_id).await?;

        for _ in 0..MAX_TRANSITION_ATTEMPTS {
            let target = Self::determine_target_state(expected, &event)?;

            if self
                .run_storage
                .compare_and_set_status(run_id, expected, target)
                .await?
            {
                let transition = RunTransition {
                    from: expected,
                    to: target,
                };
                self.record_transition(run_id, transition, &event).await?;
                return Ok(transition);
            }

            let actual = self.current_state(run_id).await?;
            debug!(
                run_id = %run_id,
                expected = %expected,
                actual = %actual,
                event = event.event_type(),
                "Run status changed underneath transition; re-evaluating"
            );
            expected = actual;
        }

        Err(StateMachineError::ConcurrentModification {
            run_id,
            expected: expected.to_string(),
            actual: self.current_state(run_id).await?.to_string(),
        })
    }

    /// Like [`transition`](Self::transition) but returns `None` when the event no
    /// longer applies, e.g. a cancel arriving after the run already succeeded.
    pub async fn try_transition(
        &self,
        run_id: Uuid,
        event: RunEvent,
    ) -> StateMachineResult<Option<RunTransition>> {
        match self.transition(run_id, event).await {
            Ok(transition) => Ok(Some(transition)),
            Err(StateMachineError::InvalidTransition { from, event }) => {
                debug!(run_id = %run_id, from = %from, event = %event, "Run transition not applicable");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    async fn record_transition(
        &self,
        run_id: Uuid,
        transition: RunTransition,
        event: &RunEvent,
    ) -> StateMachineResult<()> {
        let record = match transition.to {
            RunStatus::Queued => Some(DagflowEvent::RunEnqueued),
            RunStatus::Starting => Some(DagflowEvent::RunStarting),
            RunStatus::Started if transition.from == RunStatus::Starting => {
                Some(DagflowEvent::RunStart)
            }
            RunStatus::Started => Some(DagflowEvent::RunResumed),
            RunStatus::Success => Some(DagflowEvent::RunSuccess),
            RunStatus::Failure => Some(DagflowEvent::RunFailure {
                error: event.error_message().map(str::to_string),
            }),
            RunStatus::Canceling => Some(DagflowEvent::RunCanceling),
            RunStatus::Canceled => Some(DagflowEvent::RunCanceled),
            RunStatus::NotStarted | RunStatus::Managed => None,
        };

        if let Some(record) = record {
            if let Err(err) = self.event_log.append_event(run_id, None, record).await {
                warn!(run_id = %run_id, error = %err, "Failed to record run status event");
                return Err(err.into());
            }
        }

        log_run_operation(
            event.event_type(),
            Some(run_id),
            &transition.to.to_string(),
            event.error_message(),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let queued = RunStateMachine::determine_target_state(RunStatus::NotStarted, &RunEvent::Enqueue)
            .unwrap();
        assert_eq!(queued, RunStatus::Queued);
        let starting =
            RunStateMachine::determine_target_state(queued, &RunEvent::Dispatch).unwrap();
        assert_eq!(starting, RunStatus::Starting);
        let started = RunStateMachine::determine_target_state(starting, &RunEvent::Start).unwrap();
        assert_eq!(started, RunStatus::Started);
        assert_eq!(
            RunStateMachine::determine_target_state(started, &RunEvent::Complete).unwrap(),
            RunStatus::Success
        );
    }

    #[test]
    fn test_cancel_depends_on_progress() {
        assert_eq!(
            RunStateMachine::determine_target_state(RunStatus::Queued, &RunEvent::Cancel).unwrap(),
            RunStatus::Canceled
        );
        assert_eq!(
            RunStateMachine::determine_target_state(RunStatus::Started, &RunEvent::Cancel).unwrap(),
            RunStatus::Canceling
        );
        assert_eq!(
            RunStateMachine::determine_target_state(RunStatus::Canceling, &RunEvent::Complete)
                .unwrap(),
            RunStatus::Canceled
        );
    }

    #[test]
    fn test_terminal_states_reject_events() {
        for terminal in [RunStatus::Success, RunStatus::Failure, RunStatus::Canceled] {
            for event in [
                RunEvent::Enqueue,
                RunEvent::Dispatch,
                RunEvent::Start,
                RunEvent::Cancel,
                RunEvent::fail_with_error("late"),
            ] {
                assert!(matches!(
                    RunStateMachine::determine_target_state(terminal, &event),
                    Err(StateMachineError::InvalidTransition { .. })
                ));
            }
        }
        // A second cancel must not re-trigger cleanup
        assert!(
            RunStateMachine::determine_target_state(RunStatus::Canceling, &RunEvent::Cancel)
                .is_err()
        );
    }
}
