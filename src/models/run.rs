use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::constants::{parse_priority, tags};
use crate::state_machine::RunStatus;

/// Step keys of the plan a run was created with.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExecutionPlanSnapshot {
    pub step_keys: Vec<String>,
    pub step_keys_to_execute: Vec<String>,
}

/// One end-to-end execution attempt of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: Uuid,
    pub job_name: String,
    pub status: RunStatus,
    pub run_config: Value,
    pub tags: BTreeMap<String, String>,
    pub root_run_id: Option<Uuid>,
    pub parent_run_id: Option<Uuid>,
    /// Step names (or step keys) selected for execution; `None` runs the whole job
    pub step_selection: Option<Vec<String>>,
    pub execution_plan_snapshot: Option<ExecutionPlanSnapshot>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When the run entered `QUEUED`; orders submissions within a priority
    #[serde(default)]
    pub queued_at: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl Run {
    pub fn new(job_name: impl Into<String>, run_config: Value) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            job_name: job_name.into(),
            status: RunStatus::NotStarted,
            run_config,
            tags: BTreeMap::new(),
            root_run_id: None,
            parent_run_id: None,
            step_selection: None,
            execution_plan_snapshot: None,
            created_at: now,
            updated_at: now,
            queued_at: None,
            start_time: None,
            end_time: None,
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_tags<I, K, V>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.tags
            .extend(tags.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn with_step_selection(mut self, selection: Vec<String>) -> Self {
        self.step_selection = Some(selection);
        self
    }

    /// New run re-executing `parent`, inheriting its config and user tags.
    pub fn reexecution_of(parent: &Run, step_selection: Option<Vec<String>>) -> Self {
        let root_run_id = parent.root_run_id.unwrap_or(parent.run_id);
        let inherited = parent
            .tags
            .iter()
            .filter(|(key, _)| !is_lineage_scoped(key))
            .map(|(k, v)| (k.clone(), v.clone()));

        let mut run = Self::new(parent.job_name.clone(), parent.run_config.clone())
            .with_tags(inherited)
            .with_tag(tags::ROOT_RUN_ID, root_run_id.to_string())
            .with_tag(tags::PARENT_RUN_ID, parent.run_id.to_string());
        run.root_run_id = Some(root_run_id);
        run.parent_run_id = Some(parent.run_id);
        run.step_selection = step_selection;
        run
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    pub fn priority(&self) -> i64 {
        parse_priority(self.tag(tags::PRIORITY))
    }

    pub fn is_memoized(&self) -> bool {
        self.tag(tags::MEMOIZED_RUN) == Some("true")
    }

    pub fn partition_key(&self) -> Option<&str> {
        self.tag(tags::PARTITION)
    }

    pub fn resume_attempts(&self) -> u32 {
        self.tag(tags::RESUME_ATTEMPTS)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }
}

/// Tags that describe one specific run and are not carried into re-executions
fn is_lineage_scoped(key: &str) -> bool {
    matches!(
        key,
        tags::ROOT_RUN_ID
            | tags::PARENT_RUN_ID
            | tags::RESUME_ATTEMPTS
            | tags::SCHEDULE_NAME
            | tags::SENSOR_NAME
            | tags::SCHEDULED_EXECUTION_TIME
            | tags::RUN_KEY
            | tags::TICK_ID
            | tags::TICK_REQUEST_INDEX
    )
}

/// Selection criteria for [`RunStorage::get_runs`](crate::storage::RunStorage::get_runs).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunFilter {
    pub run_ids: Vec<Uuid>,
    pub job_name: Option<String>,
    pub statuses: Vec<RunStatus>,
    /// Every tag must match exactly
    pub tags: BTreeMap<String, String>,
}

impl RunFilter {
    pub fn with_statuses(statuses: impl IntoIterator<Item = RunStatus>) -> Self {
        Self {
            statuses: statuses.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn with_tags<I, K, V>(tags: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            tags: tags
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            ..Self::default()
        }
    }

    pub fn matches(&self, run: &Run) -> bool {
        (self.run_ids.is_empty() || self.run_ids.contains(&run.run_id))
            && self.job_name.as_ref().map_or(true, |name| name == &run.job_name)
            && (self.statuses.is_empty() || self.statuses.contains(&run.status))
            && self
                .tags
                .iter()
                .all(|(key, value)| run.tags.get(key) == Some(value))
    }
}
