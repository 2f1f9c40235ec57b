//! # Dagflow Configuration System
//!
//! Typed configuration for the run coordinator, the monitoring daemon, the
//! execution engine and the scheduler.
//!
//! ## Architecture
//!
//! - **Layered**: `config/dagflow.yaml`, then `config/dagflow.<env>.yaml`,
//!   then `DAGFLOW__SECTION__KEY` environment variables
//! - **Defaults everywhere**: every section deserializes from an empty document
//! - **Explicit validation**: [`DagflowConfig::validate`] rejects nonsensical values
//!
//! ## Usage
//!
//! ```rust,no_run
//! use dagflow_core::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let max_runs = manager.config().run_coordinator.max_concurrent_runs;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::system;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DagflowConfig {
    pub run_coordinator: RunCoordinatorConfig,
    pub run_monitoring: RunMonitoringConfig,
    pub execution: ExecutionConfig,
    pub scheduler: SchedulerConfig,
    pub compute_logs: ComputeLogsConfig,
    pub telemetry: TelemetryConfig,
}

/// Admission control for the queued run coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunCoordinatorConfig {
    /// Maximum runs in progress at once; negative means unbounded
    pub max_concurrent_runs: i64,
    pub tag_concurrency_limits: Vec<TagConcurrencyLimit>,
    pub dequeue_interval_seconds: u64,
}

impl Default for RunCoordinatorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: system::DEFAULT_MAX_CONCURRENT_RUNS,
            tag_concurrency_limits: Vec::new(),
            dequeue_interval_seconds: 5,
        }
    }
}

impl RunCoordinatorConfig {
    pub fn dequeue_interval(&self) -> Duration {
        Duration::from_secs(self.dequeue_interval_seconds)
    }
}

/// Limit on how many in-progress runs may carry a tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagConcurrencyLimit {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<TagLimitValue>,
    pub limit: u32,
}

impl TagConcurrencyLimit {
    /// Limit every run carrying `key`, whatever the value
    pub fn for_key(key: impl Into<String>, limit: u32) -> Self {
        Self {
            key: key.into(),
            value: None,
            limit,
        }
    }

    pub fn for_value(key: impl Into<String>, value: impl Into<String>, limit: u32) -> Self {
        Self {
            key: key.into(),
            value: Some(TagLimitValue::Exact(value.into())),
            limit,
        }
    }

    /// Apply `limit` separately to every distinct value of `key`
    pub fn per_unique_value(key: impl Into<String>, limit: u32) -> Self {
        Self {
            key: key.into(),
            value: Some(TagLimitValue::PerUniqueValue {
                apply_limit_per_unique_value: true,
            }),
            limit,
        }
    }
}

/// Value selector of a [`TagConcurrencyLimit`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagLimitValue {
    Exact(String),
    PerUniqueValue { apply_limit_per_unique_value: bool },
}

/// Health reconciliation of in-flight runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunMonitoringConfig {
    pub enabled: bool,
    pub start_timeout_seconds: u64,
    pub cancel_timeout_seconds: u64,
    pub max_resume_run_attempts: u32,
    pub poll_interval_seconds: u64,
}

impl Default for RunMonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            start_timeout_seconds: system::DEFAULT_START_TIMEOUT_SECONDS,
            cancel_timeout_seconds: system::DEFAULT_CANCEL_TIMEOUT_SECONDS,
            max_resume_run_attempts: system::DEFAULT_MAX_RESUME_RUN_ATTEMPTS,
            poll_interval_seconds: 120,
        }
    }
}

impl RunMonitoringConfig {
    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_seconds)
    }

    pub fn cancel_timeout(&self) -> Duration {
        Duration::from_secs(self.cancel_timeout_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }
}

/// Step execution settings shared by the executors
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub max_concurrent_steps: usize,
    pub step_poll_interval_ms: u64,
    /// How long an interrupted step may take to stop before it is reaped
    pub interrupt_grace_period_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_steps: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            step_poll_interval_ms: 50,
            interrupt_grace_period_ms: 5_000,
        }
    }
}

impl ExecutionConfig {
    pub fn step_poll_interval(&self) -> Duration {
        Duration::from_millis(self.step_poll_interval_ms)
    }

    pub fn interrupt_grace_period(&self) -> Duration {
        Duration::from_millis(self.interrupt_grace_period_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Cadence ticks evaluated per pass when a schedule fell behind
    pub max_catchup_runs: usize,
    /// Failed ticks re-evaluated before the scheduler moves on
    pub max_tick_retries: u32,
    pub poll_interval_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_catchup_runs: system::DEFAULT_MAX_CATCHUP_RUNS,
            max_tick_retries: 0,
            poll_interval_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputeLogsConfig {
    /// Directory for captured step logs; capture is disabled when unset
    pub base_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json: false,
        }
    }
}

impl DagflowConfig {
    /// Validate configuration for consistency
    pub fn validate(&self) -> ConfigResult<()> {
        for limit in &self.run_coordinator.tag_concurrency_limits {
            if limit.key.trim().is_empty() {
                return Err(ConfigurationError::missing_required_field(
                    "run_coordinator.tag_concurrency_limits.key",
                    "tag concurrency limit",
                ));
            }
            if let Some(TagLimitValue::PerUniqueValue {
                apply_limit_per_unique_value: false,
            }) = limit.value
            {
                return Err(ConfigurationError::invalid_value(
                    "run_coordinator.tag_concurrency_limits.value",
                    "apply_limit_per_unique_value: false",
                    "omit the value to limit every run carrying the key",
                ));
            }
        }

        if self.run_coordinator.dequeue_interval_seconds == 0 {
            return Err(ConfigurationError::invalid_value(
                "run_coordinator.dequeue_interval_seconds",
                "0",
                "interval must be greater than 0",
            ));
        }

        if self.run_monitoring.enabled && self.run_monitoring.poll_interval_seconds == 0 {
            return Err(ConfigurationError::invalid_value(
                "run_monitoring.poll_interval_seconds",
                "0",
                "interval must be greater than 0",
            ));
        }

        if self.execution.max_concurrent_steps == 0 {
            return Err(ConfigurationError::invalid_value(
                "execution.max_concurrent_steps",
                "0",
                "at least one step must be allowed to run",
            ));
        }

        if self.scheduler.max_catchup_runs == 0 {
            return Err(ConfigurationError::invalid_value(
                "scheduler.max_catchup_runs",
                "0",
                "at least the latest tick must be evaluated",
            ));
        }

        Ok(())
    }
}
