//! # Crate Errors
//!
//! One error enum for the whole crate. Sub-domains (state machine, storage,
//! configuration, partitions) keep their own error types and convert into
//! [`DagflowError`] through `#[from]`.

use thiserror::Error;
use uuid::Uuid;

use crate::config::ConfigurationError;
use crate::partitions::PartitionError;
use crate::state_machine::StateMachineError;
use crate::storage::StorageError;

/// A single field-level problem found while resolving run config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFieldError {
    /// Dotted path of the offending field, e.g. `ops.load.config.limit`.
    pub path: String,
    pub reason: String,
}

impl std::fmt::Display for ConfigFieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.reason)
    }
}

#[derive(Debug, Error)]
pub enum DagflowError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Invalid definition for step '{step_key}': {reason}")]
    Definition { step_key: String, reason: String },

    #[error("Run config failed validation: {}", format_field_errors(.errors))]
    ConfigValidation { errors: Vec<ConfigFieldError> },

    #[error("Cycle detected in step graph involving step '{step_key}'")]
    Cycle { step_key: String },

    #[error("Step '{step_key}' depends on undefined upstream step '{upstream}'")]
    UndefinedUpstream { step_key: String, upstream: String },

    #[error("Input '{input}' of step '{step_key}' cannot be satisfied: {reason}")]
    UnsatisfiableDependency {
        step_key: String,
        input: String,
        reason: String,
    },

    #[error(
        "While using memoization, version for {node} was None. Provide a code version for it \
         or disable memoization for the run."
    )]
    MissingCodeVersion { node: String },

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Step '{step_key}' did not return an output for non-optional output '{output}'")]
    StepOutputNotFound { step_key: String, output: String },

    #[error("Type check failed for {target} of step '{step_key}': {description}")]
    TypeCheck {
        step_key: String,
        target: String,
        description: String,
    },

    #[error(transparent)]
    StateTransition(#[from] StateMachineError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Partition(#[from] PartitionError),

    #[error("Failed to launch run {run_id}: {reason}")]
    Launch { run_id: Uuid, reason: String },

    #[error("Run {0} not found")]
    RunNotFound(Uuid),

    #[error("Job '{0}' is not registered")]
    JobNotFound(String),

    /// Raised at a configured crash point to exercise recovery paths
    #[error("Simulated crash at {0}")]
    SimulatedCrash(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn format_field_errors(errors: &[ConfigFieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl DagflowError {
    /// Definition and config errors are never retried.
    pub fn is_definition_error(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_)
                | Self::Definition { .. }
                | Self::ConfigValidation { .. }
                | Self::Cycle { .. }
                | Self::UndefinedUpstream { .. }
                | Self::UnsatisfiableDependency { .. }
                | Self::MissingCodeVersion { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, DagflowError>;
