//! # Partition Calendar
//!
//! Deterministic enumeration of partitions and bookkeeping of which partitions
//! have been materialized.
//!
//! ## Definitions
//!
//! - [`TimeWindowPartitionsDefinition`]: windows between consecutive ticks of a
//!   cron cadence, keyed by the formatted window start.
//! - [`StaticPartitionsDefinition`]: an explicit list of keys.
//!
//! ## Subsets
//!
//! [`PartitionsSubset`] stores contiguous key ranges and stays canonical
//! (fewest possible ranges) after every mutation. The
//! [`status_cache`] module keeps one subset per asset up to date from the
//! event log.

pub mod cadence;
pub mod static_partitions;
pub mod status_cache;
pub mod subset;
pub mod time_window;

use chrono::{DateTime, Utc};
use thiserror::Error;

pub use cadence::{Cadence, ScheduleType, TimeWindow};
pub use static_partitions::StaticPartitionsDefinition;
pub use status_cache::{get_and_update_asset_status_cache_value, AssetStatusCacheValue};
pub use subset::{StaticPartitionsSubset, TimeWindowPartitionsSubset};
pub use time_window::{get_partitions_in_window, CadenceOffsets, TimeWindowPartitionsDefinition};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PartitionError {
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("Invalid partition key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("Partition key '{0}' is not part of the partitions definition")]
    KeyNotFound(String),

    #[error("Duplicate partition key '{0}'")]
    DuplicateKey(String),

    #[error("Invalid timezone {0}")]
    InvalidTimezone(String),

    #[error("Invalid partitions start '{start}': {reason}")]
    InvalidStart { start: String, reason: String },

    #[error("Invalid serialized partitions subset: {0}")]
    Serialization(String),
}

/// Closed set of partitioning schemes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionsDefinition {
    TimeWindow(TimeWindowPartitionsDefinition),
    Static(StaticPartitionsDefinition),
}

impl PartitionsDefinition {
    pub fn get_partition_keys(&self, now: DateTime<Utc>) -> Vec<String> {
        match self {
            Self::TimeWindow(def) => def.get_partition_keys(now),
            Self::Static(def) => def.get_partition_keys().to_vec(),
        }
    }

    pub fn has_partition_key(&self, key: &str, now: DateTime<Utc>) -> bool {
        match self {
            Self::TimeWindow(def) => def.has_partition_key(key, now),
            Self::Static(def) => def.has_partition_key(key),
        }
    }

    /// Whether `key` names a partition at all, regardless of the current time.
    pub fn is_valid_partition_key(&self, key: &str) -> bool {
        match self {
            Self::TimeWindow(def) => def.is_valid_partition_key(key),
            Self::Static(def) => def.has_partition_key(key),
        }
    }

    pub fn get_partition_keys_in_range(
        &self,
        start_key: &str,
        end_key: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, PartitionError> {
        match self {
            Self::TimeWindow(def) => def.get_partition_keys_in_range(start_key, end_key, now),
            Self::Static(def) => def.get_partition_keys_in_range(start_key, end_key),
        }
    }

    pub fn serializable_unique_identifier(&self) -> String {
        match self {
            Self::TimeWindow(def) => def.serializable_unique_identifier(),
            Self::Static(def) => def.serializable_unique_identifier(),
        }
    }

    pub fn empty_subset(&self) -> PartitionsSubset {
        match self {
            Self::TimeWindow(def) => {
                PartitionsSubset::TimeWindow(TimeWindowPartitionsSubset::empty(def.clone()))
            }
            Self::Static(def) => PartitionsSubset::Static(StaticPartitionsSubset::empty(def.clone())),
        }
    }

    pub fn deserialize_subset(&self, serialized: &str) -> Result<PartitionsSubset, PartitionError> {
        match self {
            Self::TimeWindow(def) => TimeWindowPartitionsSubset::from_serialized(def.clone(), serialized)
                .map(PartitionsSubset::TimeWindow),
            Self::Static(def) => StaticPartitionsSubset::from_serialized(def.clone(), serialized)
                .map(PartitionsSubset::Static),
        }
    }
}

impl From<TimeWindowPartitionsDefinition> for PartitionsDefinition {
    fn from(def: TimeWindowPartitionsDefinition) -> Self {
        Self::TimeWindow(def)
    }
}

impl From<StaticPartitionsDefinition> for PartitionsDefinition {
    fn from(def: StaticPartitionsDefinition) -> Self {
        Self::Static(def)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionsSubset {
    TimeWindow(TimeWindowPartitionsSubset),
    Static(StaticPartitionsSubset),
}

impl PartitionsSubset {
    pub fn with_partition_keys<I, S>(&self, keys: I) -> Result<Self, PartitionError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        match self {
            Self::TimeWindow(subset) => subset.with_partition_keys(keys).map(Self::TimeWindow),
            Self::Static(subset) => subset.with_partition_keys(keys).map(Self::Static),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        match self {
            Self::TimeWindow(subset) => subset.contains(key),
            Self::Static(subset) => subset.contains(key),
        }
    }

    pub fn get_partition_keys(&self) -> Vec<String> {
        match self {
            Self::TimeWindow(subset) => subset.get_partition_keys(),
            Self::Static(subset) => subset.get_partition_keys(),
        }
    }

    pub fn get_partition_keys_not_in_subset(&self, now: DateTime<Utc>) -> Vec<String> {
        match self {
            Self::TimeWindow(subset) => subset.get_partition_keys_not_in_subset(now),
            Self::Static(subset) => subset.get_partition_keys_not_in_subset(),
        }
    }

    pub fn num_ranges(&self) -> usize {
        match self {
            Self::TimeWindow(subset) => subset.num_ranges(),
            Self::Static(subset) => subset.num_ranges(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::TimeWindow(subset) => subset.len(),
            Self::Static(subset) => subset.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::TimeWindow(subset) => subset.is_empty(),
            Self::Static(subset) => subset.is_empty(),
        }
    }

    pub fn serialize(&self) -> String {
        match self {
            Self::TimeWindow(subset) => subset.serialize(),
            Self::Static(subset) => subset.serialize(),
        }
    }
}
