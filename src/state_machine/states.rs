use serde::{Deserialize, Serialize};
use std::fmt;

/// Run status definitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Run record exists but has not been submitted
    NotStarted,
    /// Submitted and waiting for admission by the queued coordinator
    Queued,
    /// Dispatched to a worker that has not yet acknowledged start
    Starting,
    /// Worker acknowledged start and is executing the plan
    Started,
    /// Termination requested, waiting for the worker to stop
    Canceling,
    /// Run was terminated
    Canceled,
    /// Run completed successfully
    Success,
    /// Run failed
    Failure,
    /// Lifecycle is supervised outside this system
    Managed,
}

impl RunStatus {
    /// Check if this is a terminal state (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Canceled | Self::Success | Self::Failure)
    }

    /// Runs that occupy a concurrency slot
    pub fn is_in_progress(&self) -> bool {
        matches!(self, Self::Starting | Self::Started)
    }

    /// Runs that have not yet been handed to a worker
    pub fn is_unlaunched(&self) -> bool {
        matches!(self, Self::NotStarted | Self::Queued)
    }

    pub fn all() -> [RunStatus; 9] {
        [
            Self::NotStarted,
            Self::Queued,
            Self::Starting,
            Self::Started,
            Self::Canceling,
            Self::Canceled,
            Self::Success,
            Self::Failure,
            Self::Managed,
        ]
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "NOT_STARTED"),
            Self::Queued => write!(f, "QUEUED"),
            Self::Starting => write!(f, "STARTING"),
            Self::Started => write!(f, "STARTED"),
            Self::Canceling => write!(f, "CANCELING"),
            Self::Canceled => write!(f, "CANCELED"),
            Self::Success => write!(f, "SUCCESS"),
            Self::Failure => write!(f, "FAILURE"),
            Self::Managed => write!(f, "MANAGED"),
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NOT_STARTED" => Ok(Self::NotStarted),
            "QUEUED" => Ok(Self::Queued),
            "STARTING" => Ok(Self::Starting),
            "STARTED" => Ok(Self::Started),
            "CANCELING" => Ok(Self::Canceling),
            "CANCELED" => Ok(Self::Canceled),
            "SUCCESS" => Ok(Self::Success),
            "FAILURE" => Ok(Self::Failure),
            "MANAGED" => Ok(Self::Managed),
            _ => Err(format!("Invalid run status: {s}")),
        }
    }
}

impl Default for RunStatus {
    fn default() -> Self {
        Self::NotStarted
    }
}

/// Per-step execution status within one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    /// Re-entering execution after a retry request
    Restarted,
    Running,
    Success,
    Failure,
    UpForRetry,
    /// Not executed because a required input was never produced
    Skipped,
    /// Not executed because an upstream step failed or the run was interrupted
    Abandoned,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failure | Self::Skipped | Self::Abandoned
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Restarted)
    }

    /// Downstream steps may read this step's outputs
    pub fn satisfies_dependencies(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Restarted => write!(f, "RESTARTED"),
            Self::Running => write!(f, "RUNNING"),
            Self::Success => write!(f, "SUCCESS"),
            Self::Failure => write!(f, "FAILURE"),
            Self::UpForRetry => write!(f, "UP_FOR_RETRY"),
            Self::Skipped => write!(f, "SKIPPED"),
            Self::Abandoned => write!(f, "ABANDONED"),
        }
    }
}

impl Default for StepStatus {
    fn default() -> Self {
        Self::Pending
    }
}

/// Schedule / sensor tick status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TickStatus {
    Started,
    Success,
    Failure,
    Skipped,
}

impl TickStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Started)
    }
}

impl fmt::Display for TickStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Started => write!(f, "STARTED"),
            Self::Success => write!(f, "SUCCESS"),
            Self::Failure => write!(f, "FAILURE"),
            Self::Skipped => write!(f, "SKIPPED"),
        }
    }
}
