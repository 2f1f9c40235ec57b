//! In-memory storage backends.
//!
//! ```rust
//! use dagflow_core::storage::{InMemoryRunStorage, RunStorage};
//! use dagflow_core::{Run, RunFilter, RunStatus};
//! use serde_json::Value;
//!
//! # tokio_test::block_on(async {
//! let storage = InMemoryRunStorage::new();
//! let run = storage.create_run(Run::new("etl", Value::Null)).await.unwrap();
//! assert_eq!(run.status, RunStatus::NotStarted);
//!
//! let queued = RunFilter::with_statuses([RunStatus::Queued]);
//! assert!(storage.get_runs(&queued, None, None).await.unwrap().is_empty());
//! # });
//! ```

use async_trait::async_trait;
use chrono::Utc;
use dashmap::{mapref::entry::Entry, DashMap};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;
use uuid::Uuid;

use super::{
    AssetRecordsFilter, EventLogStorage, RunStorage, ScheduleStorage, StorageError, StorageResult,
};
use crate::models::{AssetKey, DagflowEvent, EventRecord, InstigatorState, Run, RunFilter, Tick};
use crate::partitions::AssetStatusCacheValue;
use crate::state_machine::RunStatus;

#[derive(Default)]
struct RunTable {
    /// Creation order
    runs: Vec<Run>,
    index: HashMap<Uuid, usize>,
}

impl RunTable {
    fn get_mut(&mut self, run_id: Uuid) -> StorageResult<&mut Run> {
        let idx = *self
            .index
            .get(&run_id)
            .ok_or(StorageError::RunNotFound(run_id))?;
        Ok(&mut self.runs[idx])
    }
}

fn apply_status(run: &mut Run, status: RunStatus) {
    let now = Utc::now();
    run.status = status;
    run.updated_at = now;
    if status == RunStatus::Queued {
        run.queued_at = Some(now);
    }
    if status == RunStatus::Started && run.start_time.is_none() {
        run.start_time = Some(now);
    }
    if status.is_terminal() {
        run.end_time = Some(now);
    }
}

#[derive(Default)]
pub struct InMemoryRunStorage {
    table: RwLock<RunTable>,
    kvs: DashMap<String, String>,
}

impl InMemoryRunStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStorage for InMemoryRunStorage {
    async fn create_run(&self, run: Run) -> StorageResult<Run> {
        let mut table = self.table.write();
        if table.index.contains_key(&run.run_id) {
            return Err(StorageError::DuplicateRun(run.run_id));
        }
        let idx = table.runs.len();
        table.index.insert(run.run_id, idx);
        table.runs.push(run.clone());
        debug!(run_id = %run.run_id, job = %run.job_name, "Run created");
        Ok(run)
    }

    async fn get_run(&self, run_id: Uuid) -> StorageResult<Option<Run>> {
        let table = self.table.read();
        Ok(table.index.get(&run_id).map(|&idx| table.runs[idx].clone()))
    }

    async fn update_run_status(&self, run_id: Uuid, status: RunStatus) -> StorageResult<()> {
        let mut table = self.table.write();
        apply_status(table.get_mut(run_id)?, status);
        Ok(())
    }

    async fn compare_and_set_status(
        &self,
        run_id: Uuid,
        expected: RunStatus,
        new: RunStatus,
    ) -> StorageResult<bool> {
        let mut table = self.table.write();
        let run = table.get_mut(run_id)?;
        if run.status != expected {
            return Ok(false);
        }
        apply_status(run, new);
        Ok(true)
    }

    async fn get_runs(
        &self,
        filter: &RunFilter,
        cursor: Option<Uuid>,
        limit: Option<usize>,
    ) -> StorageResult<Vec<Run>> {
        let table = self.table.read();
        let newest_first = table.runs.iter().rev();
        let after_cursor: Box<dyn Iterator<Item = &Run>> = match cursor {
            Some(cursor) => Box::new(newest_first.skip_while(move |r| r.run_id != cursor).skip(1)),
            None => Box::new(newest_first),
        };
        Ok(after_cursor
            .filter(|run| filter.matches(run))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn add_run_tags(
        &self,
        run_id: Uuid,
        tags: BTreeMap<String, String>,
    ) -> StorageResult<()> {
        let mut table = self.table.write();
        let run = table.get_mut(run_id)?;
        run.tags.extend(tags);
        run.updated_at = Utc::now();
        Ok(())
    }

    async fn kvs_get(&self, keys: &[String]) -> StorageResult<HashMap<String, String>> {
        Ok(keys
            .iter()
            .filter_map(|key| self.kvs.get(key).map(|v| (key.clone(), v.value().clone())))
            .collect())
    }

    async fn kvs_set(&self, pairs: HashMap<String, String>) -> StorageResult<()> {
        for (key, value) in pairs {
            self.kvs.insert(key, value);
        }
        Ok(())
    }

    async fn kvs_set_if_absent(&self, key: &str, value: &str) -> StorageResult<bool> {
        match self.kvs.entry(key.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(vacant) => {
                vacant.insert(value.to_string());
                Ok(true)
            }
        }
    }
}

#[derive(Default)]
struct EventTable {
    records: Vec<EventRecord>,
    next_storage_id: i64,
}

#[derive(Default)]
pub struct InMemoryEventLogStorage {
    table: RwLock<EventTable>,
    asset_cache: DashMap<AssetKey, AssetStatusCacheValue>,
}

impl InMemoryEventLogStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record across runs, oldest first
    pub fn all_records(&self) -> Vec<EventRecord> {
        self.table.read().records.clone()
    }
}

#[async_trait]
impl EventLogStorage for InMemoryEventLogStorage {
    async fn append_event(
        &self,
        run_id: Uuid,
        step_key: Option<&str>,
        event: DagflowEvent,
    ) -> StorageResult<i64> {
        let mut table = self.table.write();
        table.next_storage_id += 1;
        let storage_id = table.next_storage_id;
        table.records.push(EventRecord {
            storage_id,
            run_id,
            timestamp: Utc::now(),
            step_key: step_key.map(str::to_string),
            event,
        });
        Ok(storage_id)
    }

    async fn get_events(
        &self,
        run_id: Uuid,
        cursor: Option<i64>,
        limit: Option<usize>,
    ) -> StorageResult<Vec<EventRecord>> {
        let after = cursor.unwrap_or(0);
        let table = self.table.read();
        Ok(table
            .records
            .iter()
            .filter(|r| r.run_id == run_id && r.storage_id > after)
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn get_records_for_asset(
        &self,
        asset_key: &AssetKey,
        filter: &AssetRecordsFilter,
    ) -> StorageResult<Vec<EventRecord>> {
        let after = filter.after_storage_id.unwrap_or(0);
        let table = self.table.read();
        let matches = |record: &&EventRecord| {
            record.storage_id > after
                && record.asset_key() == Some(asset_key)
                && filter.partitions.as_ref().map_or(true, |partitions| {
                    record
                        .partition()
                        .map_or(false, |p| partitions.iter().any(|k| k == p))
                })
        };
        let limit = filter.limit.unwrap_or(usize::MAX);
        let records = if filter.descending {
            table.records.iter().rev().filter(matches).take(limit).cloned().collect()
        } else {
            table.records.iter().filter(matches).take(limit).cloned().collect()
        };
        Ok(records)
    }

    async fn get_asset_status_cache_value(
        &self,
        asset_key: &AssetKey,
    ) -> StorageResult<Option<AssetStatusCacheValue>> {
        Ok(self.asset_cache.get(asset_key).map(|v| v.value().clone()))
    }

    async fn update_asset_status_cache_value(
        &self,
        asset_key: &AssetKey,
        value: AssetStatusCacheValue,
    ) -> StorageResult<()> {
        self.asset_cache.insert(asset_key.clone(), value);
        Ok(())
    }
}

#[derive(Default)]
struct TickTable {
    ticks: Vec<Tick>,
    next_tick_id: i64,
}

#[derive(Default)]
pub struct InMemoryScheduleStorage {
    table: RwLock<TickTable>,
    states: DashMap<String, InstigatorState>,
}

impl InMemoryScheduleStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScheduleStorage for InMemoryScheduleStorage {
    async fn create_tick(&self, mut tick: Tick) -> StorageResult<Tick> {
        let mut table = self.table.write();
        table.next_tick_id += 1;
        tick.tick_id = table.next_tick_id;
        table.ticks.push(tick.clone());
        Ok(tick)
    }

    async fn update_tick(&self, tick: &Tick) -> StorageResult<()> {
        let mut table = self.table.write();
        let stored = table
            .ticks
            .iter_mut()
            .find(|t| t.tick_id == tick.tick_id)
            .ok_or(StorageError::TickNotFound(tick.tick_id))?;
        *stored = tick.clone();
        Ok(())
    }

    async fn get_ticks(&self, origin_id: &str, limit: Option<usize>) -> StorageResult<Vec<Tick>> {
        let table = self.table.read();
        let mut ticks: Vec<Tick> = table
            .ticks
            .iter()
            .filter(|t| t.origin_id == origin_id)
            .cloned()
            .collect();
        ticks.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| b.tick_id.cmp(&a.tick_id))
        });
        ticks.truncate(limit.unwrap_or(usize::MAX));
        Ok(ticks)
    }

    async fn get_instigator_state(
        &self,
        origin_id: &str,
    ) -> StorageResult<Option<InstigatorState>> {
        Ok(self.states.get(origin_id).map(|s| s.value().clone()))
    }

    async fn upsert_instigator_state(&self, state: InstigatorState) -> StorageResult<()> {
        self.states.insert(state.origin_id.clone(), state);
        Ok(())
    }
}
