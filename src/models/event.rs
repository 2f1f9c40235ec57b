use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::{AssetKey, StepOutputHandle};

/// Why a step failed; type-check failures are reported apart from user errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepFailureKind {
    /// The compute function returned an error
    UserCode,
    TypeCheck,
    /// The step broke an engine rule, e.g. yielded an undeclared output
    Framework,
    Interrupted,
    /// The worker running the step disappeared
    WorkerLost,
}

/// Structured event written to the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum DagflowEvent {
    RunEnqueued,
    RunStarting,
    RunStart,
    RunResumed,
    RunSuccess,
    RunFailure {
        error: Option<String>,
    },
    RunCanceling,
    RunCanceled,
    EngineEvent {
        message: String,
        error: Option<String>,
    },
    StepWorkerStarting {
        attempt: u32,
    },
    StepStart {
        attempt: u32,
    },
    StepInput {
        input_name: String,
        type_check_passed: bool,
    },
    LoadedInput {
        input_name: String,
        upstream: Vec<StepOutputHandle>,
    },
    StepOutput {
        handle: StepOutputHandle,
        version: Option<String>,
    },
    HandledOutput {
        handle: StepOutputHandle,
    },
    TypeCheckFailure {
        target: String,
        description: String,
    },
    AssetMaterialization {
        asset_key: AssetKey,
        partition: Option<String>,
        logical_version: String,
        code_version: String,
        /// Upstream asset key (user string) to the logical version that was consumed
        input_logical_versions: BTreeMap<String, String>,
    },
    StepUpForRetry {
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    StepRestarted {
        attempt: u32,
    },
    StepSkipped {
        reason: String,
    },
    StepSuccess {
        duration_ms: u64,
    },
    StepFailure {
        error: String,
        kind: StepFailureKind,
    },
    ComputeLogsCaptured {
        log_key: Vec<String>,
        step_keys: Vec<String>,
    },
}

impl DagflowEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::RunEnqueued => "run_enqueued",
            Self::RunStarting => "run_starting",
            Self::RunStart => "run_start",
            Self::RunResumed => "run_resumed",
            Self::RunSuccess => "run_success",
            Self::RunFailure { .. } => "run_failure",
            Self::RunCanceling => "run_canceling",
            Self::RunCanceled => "run_canceled",
            Self::EngineEvent { .. } => "engine_event",
            Self::StepWorkerStarting { .. } => "step_worker_starting",
            Self::StepStart { .. } => "step_start",
            Self::StepInput { .. } => "step_input",
            Self::LoadedInput { .. } => "loaded_input",
            Self::StepOutput { .. } => "step_output",
            Self::HandledOutput { .. } => "handled_output",
            Self::TypeCheckFailure { .. } => "type_check_failure",
            Self::AssetMaterialization { .. } => "asset_materialization",
            Self::StepUpForRetry { .. } => "step_up_for_retry",
            Self::StepRestarted { .. } => "step_restarted",
            Self::StepSkipped { .. } => "step_skipped",
            Self::StepSuccess { .. } => "step_success",
            Self::StepFailure { .. } => "step_failure",
            Self::ComputeLogsCaptured { .. } => "compute_logs_captured",
        }
    }

    /// Events that end one attempt of a step
    pub fn is_step_attempt_end(&self) -> bool {
        matches!(
            self,
            Self::StepSuccess { .. }
                | Self::StepFailure { .. }
                | Self::StepUpForRetry { .. }
                | Self::StepSkipped { .. }
        )
    }

    pub fn engine(message: impl Into<String>) -> Self {
        Self::EngineEvent {
            message: message.into(),
            error: None,
        }
    }

    pub fn engine_error(message: impl Into<String>, error: impl Into<String>) -> Self {
        Self::EngineEvent {
            message: message.into(),
            error: Some(error.into()),
        }
    }
}

/// A persisted event with its monotonically increasing storage id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub storage_id: i64,
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub step_key: Option<String>,
    pub event: DagflowEvent,
}

impl EventRecord {
    pub fn asset_key(&self) -> Option<&AssetKey> {
        match &self.event {
            DagflowEvent::AssetMaterialization { asset_key, .. } => Some(asset_key),
            _ => None,
        }
    }

    pub fn partition(&self) -> Option<&str> {
        match &self.event {
            DagflowEvent::AssetMaterialization { partition, .. } => partition.as_deref(),
            _ => None,
        }
    }
}
