use std::time::Duration;

use super::{
    errors::{StateMachineError, StateMachineResult},
    events::StepEvent,
    states::StepStatus,
};

/// Status tracker for one step inside an active execution.
///
/// Step status is owned exclusively by the process orchestrating the plan, so
/// unlike [`RunStateMachine`](super::RunStateMachine) this machine lives in memory.
#[derive(Debug, Clone)]
pub struct StepStateMachine {
    step_key: String,
    status: StepStatus,
    /// Completed attempts that ended in a retry request
    retry_count: u32,
    pending_retry_delay: Option<Duration>,
}

impl StepStateMachine {
    pub fn new(step_key: impl Into<String>) -> Self {
        Self {
            step_key: step_key.into(),
            status: StepStatus::default(),
            retry_count: 0,
            pending_retry_delay: None,
        }
    }

    /// Start tracking a step that already retried in a previous process
    pub fn with_previous_retries(step_key: impl Into<String>, retry_count: u32) -> Self {
        Self {
            retry_count,
            ..Self::new(step_key)
        }
    }

    pub fn step_key(&self) -> &str {
        &self.step_key
    }

    pub fn current_state(&self) -> StepStatus {
        self.status
    }

    /// Zero-based attempt number of the current or next execution
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn pending_retry_delay(&self) -> Option<Duration> {
        self.pending_retry_delay
    }

    pub fn transition(&mut self, event: StepEvent) -> StateMachineResult<StepStatus> {
        let target = Self::determine_target_state(self.status, &event).map_err(|err| match err {
            StateMachineError::InvalidTransition { from, event } => {
                StateMachineError::InvalidTransition {
                    from: format!("{} ({from})", self.step_key),
                    event,
                }
            }
            other => other,
        })?;

        match &event {
            StepEvent::RequestRetry { delay } => self.pending_retry_delay = Some(*delay),
            StepEvent::Restart => {
                self.retry_count += 1;
                self.pending_retry_delay = None;
            }
            _ => {}
        }

        self.status = target;
        Ok(target)
    }

    /// Determine the target state based on current state and event
    pub fn determine_target_state(
        current_state: StepStatus,
        event: &StepEvent,
    ) -> StateMachineResult<StepStatus> {
        let target = match (current_state, event) {
            (StepStatus::Pending | StepStatus::Restarted, StepEvent::Start) => StepStatus::Running,

            (StepStatus::Running, StepEvent::Succeed) => StepStatus::Success,
            (StepStatus::Running | StepStatus::Pending, StepEvent::Fail(_)) => StepStatus::Failure,

            (StepStatus::Running, StepEvent::RequestRetry { .. }) => StepStatus::UpForRetry,
            (StepStatus::UpForRetry, StepEvent::Restart) => StepStatus::Restarted,

            (StepStatus::Pending, StepEvent::Skip) => StepStatus::Skipped,
            (
                StepStatus::Pending | StepStatus::UpForRetry | StepStatus::Restarted,
                StepEvent::Abandon,
            ) => StepStatus::Abandoned,

            (from_state, _) => {
                return Err(StateMachineError::InvalidTransition {
                    from: from_state.to_string(),
                    event: event.event_type().to_string(),
                })
            }
        };

        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_cycle_increments_attempts() {
        let mut machine = StepStateMachine::new("flaky");
        machine.transition(StepEvent::Start).unwrap();
        machine
            .transition(StepEvent::RequestRetry {
                delay: Duration::from_millis(10),
            })
            .unwrap();
        assert_eq!(machine.current_state(), StepStatus::UpForRetry);
        assert_eq!(machine.pending_retry_delay(), Some(Duration::from_millis(10)));

        machine.transition(StepEvent::Restart).unwrap();
        assert_eq!(machine.retry_count(), 1);
        assert_eq!(machine.transition(StepEvent::Start).unwrap(), StepStatus::Running);
        assert_eq!(machine.transition(StepEvent::Succeed).unwrap(), StepStatus::Success);
    }

    #[test]
    fn test_running_step_cannot_be_skipped() {
        let mut machine = StepStateMachine::new("a");
        machine.transition(StepEvent::Start).unwrap();
        let err = machine.transition(StepEvent::Skip).unwrap_err();
        assert!(err.to_string().contains("a (RUNNING)"));
        assert_eq!(machine.current_state(), StepStatus::Running);
    }

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [
            StepStatus::Success,
            StepStatus::Failure,
            StepStatus::Skipped,
            StepStatus::Abandoned,
        ] {
            assert!(StepStateMachine::determine_target_state(terminal, &StepEvent::Start).is_err());
        }
    }
}
