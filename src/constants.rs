//! # System Constants
//!
//! Tag keys, key-value store prefixes and operational limits shared by the
//! execution engine, the run coordinator and the daemons.

/// Prefix reserved for system tags on runs and steps
pub const SYSTEM_TAG_PREFIX: &str = "dagflow/";

/// Well-known run and step tags
pub mod tags {
    /// Numeric priority; higher values are dequeued (or executed) first
    pub const PRIORITY: &str = "dagflow/priority";
    /// Presence with value `"true"` requests a memoized plan for the run
    pub const MEMOIZED_RUN: &str = "dagflow/is_memoized_run";
    pub const PARTITION: &str = "dagflow/partition";
    pub const PARTITION_SET: &str = "dagflow/partition_set";
    pub const SCHEDULE_NAME: &str = "dagflow/schedule_name";
    pub const SENSOR_NAME: &str = "dagflow/sensor_name";
    pub const SCHEDULED_EXECUTION_TIME: &str = "dagflow/scheduled_execution_time";
    pub const RUN_KEY: &str = "dagflow/run_key";
    pub const TICK_ID: &str = "dagflow/tick_id";
    /// Position of a keyless run request within its tick
    pub const TICK_REQUEST_INDEX: &str = "dagflow/tick_request_index";
    /// Number of times the monitoring daemon resumed the run
    pub const RESUME_ATTEMPTS: &str = "dagflow/resume_attempts";
    pub const ROOT_RUN_ID: &str = "dagflow/root_run_id";
    pub const PARENT_RUN_ID: &str = "dagflow/parent_run_id";
    pub const STEP_SELECTION: &str = "dagflow/step_selection";
    /// `in_process` or `step_delegating`
    pub const EXECUTOR: &str = "dagflow/executor";
}

/// Key prefixes in the run storage key-value store
pub mod kvs {
    /// `dagflow/launch/<run_id>` is written before a worker is dispatched
    pub const LAUNCH_MARKER_PREFIX: &str = "dagflow/launch/";
    pub const DAEMON_HEARTBEAT_PREFIX: &str = "dagflow/daemon_heartbeat/";
}

/// Engine event messages written into the event log
pub mod engine_events {
    pub const LAUNCH_FAILED: &str = "Run failed to launch";
    pub const START_TIMEOUT: &str = "Run timed out while starting";
    pub const WORKER_NOT_FOUND: &str = "Run worker is no longer running";
    pub const RESUME_ATTEMPT: &str = "Resuming run after worker loss";
    pub const RESUME_EXHAUSTED: &str = "Exceeded maximum resume attempts for run";
    pub const CANCEL_TIMEOUT: &str = "Run timed out while canceling";
    pub const STEP_WORKER_LOST: &str = "Step worker exited without reporting a result";
}

/// System-wide defaults and limits
pub mod system {
    pub const DEFAULT_MAX_CONCURRENT_RUNS: i64 = 10;
    pub const DEFAULT_MAX_RESUME_RUN_ATTEMPTS: u32 = 3;
    pub const DEFAULT_START_TIMEOUT_SECONDS: u64 = 180;
    pub const DEFAULT_CANCEL_TIMEOUT_SECONDS: u64 = 180;
    pub const DEFAULT_MAX_CATCHUP_RUNS: usize = 5;
    /// Logical version of an asset that has never been materialized
    pub const DEFAULT_LOGICAL_VERSION: &str = "INITIAL";
    /// Suffix of a dynamically mapped step key whose mapping key is not known yet
    pub const UNRESOLVED_MAPPING_KEY: &str = "?";
}

/// Parse a priority tag value; malformed values count as the default priority
pub fn parse_priority(value: Option<&str>) -> i64 {
    value.and_then(|v| v.trim().parse::<i64>().ok()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_priority_defaults_malformed_to_zero() {
        assert_eq!(parse_priority(Some("5")), 5);
        assert_eq!(parse_priority(Some(" -3 ")), -3);
        assert_eq!(parse_priority(Some("high")), 0);
        assert_eq!(parse_priority(None), 0);
    }

    #[test]
    fn test_system_tags_share_prefix() {
        for tag in [tags::PRIORITY, tags::MEMOIZED_RUN, tags::RUN_KEY, tags::RESUME_ATTEMPTS] {
            assert!(tag.starts_with(SYSTEM_TAG_PREFIX));
        }
    }
}
