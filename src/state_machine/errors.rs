use thiserror::Error;
use uuid::Uuid;

use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum StateMachineError {
    #[error("Invalid transition from {from} on event '{event}'")]
    InvalidTransition { from: String, event: String },

    /// The persisted status changed between read and write.
    #[error("Run {run_id} moved from {expected} to {actual} during transition")]
    ConcurrentModification {
        run_id: Uuid,
        expected: String,
        actual: String,
    },

    #[error("Run {0} not found")]
    RunNotFound(Uuid),

    #[error("Step '{0}' is not tracked by this execution")]
    UnknownStep(String),

    #[error("Persistence error: {0}")]
    Persistence(#[from] StorageError),
}

pub type StateMachineResult<T> = Result<T, StateMachineError>;
