//! # Storage Contracts
//!
//! The narrow read/write contract the scheduler needs from durable storage.
//! Persisted run, event and tick state is the only state shared between
//! processes; everything else is owned by the process that created it.
//!
//! In-memory implementations live in [`memory`] and back the test suite and
//! single-process deployments. Compute log capture lives in [`compute_logs`].

pub mod compute_logs;
pub mod memory;

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    AssetKey, DagflowEvent, EventRecord, InstigatorState, Run, RunFilter, Tick,
};
use crate::partitions::AssetStatusCacheValue;
use crate::state_machine::RunStatus;

pub use compute_logs::{
    CapturedLogData, ComputeLogManager, LocalComputeLogManager, LogCaptureGuard, LogWriter,
    NoOpComputeLogManager,
};
pub use memory::{InMemoryEventLogStorage, InMemoryRunStorage, InMemoryScheduleStorage};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Run {0} already exists")]
    DuplicateRun(Uuid),

    #[error("Run {0} not found")]
    RunNotFound(Uuid),

    #[error("Tick {0} not found")]
    TickNotFound(i64),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

#[async_trait]
pub trait RunStorage: Send + Sync {
    /// Persist a new run; fails with [`StorageError::DuplicateRun`] if the id exists.
    async fn create_run(&self, run: Run) -> StorageResult<Run>;

    async fn get_run(&self, run_id: Uuid) -> StorageResult<Option<Run>>;

    /// Unconditionally set the status. Prefer
    /// [`RunStateMachine`](crate::state_machine::RunStateMachine) for lifecycle changes.
    async fn update_run_status(&self, run_id: Uuid, status: RunStatus) -> StorageResult<()>;

    /// Atomically set `new` if the current status is `expected`.
    async fn compare_and_set_status(
        &self,
        run_id: Uuid,
        expected: RunStatus,
        new: RunStatus,
    ) -> StorageResult<bool>;

    /// Runs matching `filter`, newest first, starting after the `cursor` run.
    async fn get_runs(
        &self,
        filter: &RunFilter,
        cursor: Option<Uuid>,
        limit: Option<usize>,
    ) -> StorageResult<Vec<Run>>;

    async fn get_runs_count(&self, filter: &RunFilter) -> StorageResult<usize> {
        Ok(self.get_runs(filter, None, None).await?.len())
    }

    /// Merge tags into the run, overwriting existing values.
    async fn add_run_tags(
        &self,
        run_id: Uuid,
        tags: BTreeMap<String, String>,
    ) -> StorageResult<()>;

    async fn kvs_get(&self, keys: &[String]) -> StorageResult<HashMap<String, String>>;

    async fn kvs_set(&self, pairs: HashMap<String, String>) -> StorageResult<()>;

    /// Set `key` only if it is absent; returns whether this call wrote it.
    async fn kvs_set_if_absent(&self, key: &str, value: &str) -> StorageResult<bool>;
}

/// Filter for [`EventLogStorage::get_records_for_asset`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssetRecordsFilter {
    pub after_storage_id: Option<i64>,
    pub partitions: Option<Vec<String>>,
    pub limit: Option<usize>,
    /// Newest records first when set
    pub descending: bool,
}

#[async_trait]
pub trait EventLogStorage: Send + Sync {
    /// Append an event and return its storage id; ids increase monotonically.
    async fn append_event(
        &self,
        run_id: Uuid,
        step_key: Option<&str>,
        event: DagflowEvent,
    ) -> StorageResult<i64>;

    /// Events of one run with storage id greater than `cursor`, oldest first.
    async fn get_events(
        &self,
        run_id: Uuid,
        cursor: Option<i64>,
        limit: Option<usize>,
    ) -> StorageResult<Vec<EventRecord>>;

    /// Materialization records for `asset_key`.
    async fn get_records_for_asset(
        &self,
        asset_key: &AssetKey,
        filter: &AssetRecordsFilter,
    ) -> StorageResult<Vec<EventRecord>>;

    async fn get_latest_materialization(
        &self,
        asset_key: &AssetKey,
    ) -> StorageResult<Option<EventRecord>> {
        let filter = AssetRecordsFilter {
            limit: Some(1),
            descending: true,
            ..AssetRecordsFilter::default()
        };
        Ok(self
            .get_records_for_asset(asset_key, &filter)
            .await?
            .into_iter()
            .next())
    }

    async fn get_asset_status_cache_value(
        &self,
        asset_key: &AssetKey,
    ) -> StorageResult<Option<AssetStatusCacheValue>>;

    async fn update_asset_status_cache_value(
        &self,
        asset_key: &AssetKey,
        value: AssetStatusCacheValue,
    ) -> StorageResult<()>;
}

#[async_trait]
pub trait ScheduleStorage: Send + Sync {
    /// Persist a new tick, assigning its id.
    async fn create_tick(&self, tick: Tick) -> StorageResult<Tick>;

    async fn update_tick(&self, tick: &Tick) -> StorageResult<()>;

    /// Ticks of one instigator, most recent timestamp first.
    async fn get_ticks(&self, origin_id: &str, limit: Option<usize>) -> StorageResult<Vec<Tick>>;

    async fn get_latest_tick(&self, origin_id: &str) -> StorageResult<Option<Tick>> {
        Ok(self.get_ticks(origin_id, Some(1)).await?.into_iter().next())
    }

    async fn get_instigator_state(&self, origin_id: &str)
        -> StorageResult<Option<InstigatorState>>;

    async fn upsert_instigator_state(&self, state: InstigatorState) -> StorageResult<()>;
}
