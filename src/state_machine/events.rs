use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Events that can trigger run status transitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum RunEvent {
    /// Place the run in the coordinator queue
    Enqueue,
    /// Hand the run to a worker
    Dispatch,
    /// Worker acknowledged that it is executing the run
    Start,
    /// All steps finished without failure
    Complete,
    /// The run failed, with the reason
    Fail(String),
    /// Termination was requested
    Cancel,
    /// The worker stopped after a termination request
    Canceled,
    /// The run is supervised outside this system
    Manage,
}

impl RunEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Enqueue => "enqueue",
            Self::Dispatch => "dispatch",
            Self::Start => "start",
            Self::Complete => "complete",
            Self::Fail(_) => "fail",
            Self::Cancel => "cancel",
            Self::Canceled => "canceled",
            Self::Manage => "manage",
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Fail(msg) => Some(msg),
            _ => None,
        }
    }

    pub fn fail_with_error(error: impl Into<String>) -> Self {
        Self::Fail(error.into())
    }
}

/// Events that can trigger step status transitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum StepEvent {
    Start,
    Succeed,
    Fail(String),
    /// Retry requested; the step becomes eligible again after the delay
    RequestRetry { delay: Duration },
    /// Retry delay elapsed
    Restart,
    Skip,
    Abandon,
}

impl StepEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Succeed => "succeed",
            Self::Fail(_) => "fail",
            Self::RequestRetry { .. } => "request_retry",
            Self::Restart => "restart",
            Self::Skip => "skip",
            Self::Abandon => "abandon",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeed | Self::Fail(_) | Self::Skip | Self::Abandon
        )
    }
}

/// Events that close out a tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum TickEvent {
    Succeed,
    Skip(Option<String>),
    Fail(String),
}

impl TickEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Succeed => "succeed",
            Self::Skip(_) => "skip",
            Self::Fail(_) => "fail",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_event_serialization() {
        let event = RunEvent::fail_with_error("worker vanished");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "Fail");
        assert_eq!(json["data"], "worker vanished");
        assert_eq!(event.error_message(), Some("worker vanished"));
        assert_eq!(RunEvent::Dispatch.event_type(), "dispatch");
    }

    #[test]
    fn test_step_event_terminality() {
        assert!(StepEvent::Succeed.is_terminal());
        assert!(StepEvent::Abandon.is_terminal());
        assert!(!StepEvent::RequestRetry {
            delay: Duration::from_secs(1)
        }
        .is_terminal());
    }
}
