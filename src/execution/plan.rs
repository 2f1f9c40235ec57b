//! # Execution Plan
//!
//! The steps of one run, addressed by key, in a topologically valid order.
//!
//! Steps live in an arena keyed by step key. Consumers of a dynamic output
//! start as a single unresolved slot (`name[?]`); once the producer has
//! reported its mapping keys, [`ExecutionPlan::resolve`] replaces the slot
//! with one step per key in place, so the order stays a valid linearization
//! while the graph grows.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::{parse_priority, system, tags};
use crate::error::{DagflowError, Result};
use crate::models::{mapped_step_key, split_step_key, DagflowEvent, EventRecord, ExecutionPlanSnapshot, StepOutputHandle};

/// A dynamic output of a producer step
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DynamicOutputRef {
    pub step_key: String,
    pub output_name: String,
}

impl DynamicOutputRef {
    pub fn new(step_key: impl Into<String>, output_name: impl Into<String>) -> Self {
        Self {
            step_key: step_key.into(),
            output_name: output_name.into(),
        }
    }
}

/// Where a step input is loaded from, once the plan is built
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepInputSource {
    FromStepOutput { handle: StepOutputHandle },
    FromMultipleSources { handles: Vec<StepOutputHandle> },
    /// Mapped input; `step_key` is the dynamic producer or an unresolved mapped step
    FromPendingDynamicOutput { step_key: String, output_name: String },
    /// Collect input whose branches are not known yet
    FromPendingCollect { step_key: String, output_name: String },
    FromConfig { value: Value },
    FromDefault { value: Value },
}

impl StepInputSource {
    pub fn upstream_step_keys(&self) -> Vec<&str> {
        match self {
            Self::FromStepOutput { handle } => vec![handle.step_key.as_str()],
            Self::FromMultipleSources { handles } => handles.iter().map(|h| h.step_key.as_str()).collect(),
            Self::FromPendingDynamicOutput { step_key, .. } | Self::FromPendingCollect { step_key, .. } => {
                vec![step_key.as_str()]
            }
            Self::FromConfig { .. } | Self::FromDefault { .. } => Vec::new(),
        }
    }

    /// Output handles this input reads, once resolved
    pub fn upstream_handles(&self) -> Vec<&StepOutputHandle> {
        match self {
            Self::FromStepOutput { handle } => vec![handle],
            Self::FromMultipleSources { handles } => handles.iter().collect(),
            _ => Vec::new(),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            Self::FromPendingDynamicOutput { .. } | Self::FromPendingCollect { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepInput {
    pub name: String,
    /// Ordering-only input; never loaded
    pub is_nothing: bool,
    pub source: StepInputSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutputSpec {
    pub name: String,
    pub is_dynamic: bool,
    pub is_required: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Compute,
    /// Consumer of a dynamic output whose mapping keys are not known yet
    UnresolvedMapped,
    /// Fan-in over dynamic branches that are not known yet
    UnresolvedCollect,
}

/// One node of the plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub key: String,
    /// Name of the step definition
    pub name: String,
    pub kind: StepKind,
    pub mapping_key: Option<String>,
    pub inputs: Vec<StepInput>,
    pub outputs: Vec<StepOutputSpec>,
    pub tags: BTreeMap<String, String>,
    /// Dynamic outputs that still have to resolve before this step can run
    pub dynamic_roots: Vec<DynamicOutputRef>,
}

impl ExecutionStep {
    pub fn is_executable(&self) -> bool {
        self.kind == StepKind::Compute
    }

    pub fn upstream_step_keys(&self) -> BTreeSet<&str> {
        self.inputs
            .iter()
            .flat_map(|input| input.source.upstream_step_keys())
            .collect()
    }

    pub fn priority(&self) -> i64 {
        parse_priority(self.tags.get(tags::PRIORITY).map(String::as_str))
    }

    pub fn output(&self, name: &str) -> Option<&StepOutputSpec> {
        self.outputs.iter().find(|output| output.name == name)
    }

    pub fn handle_for(&self, output_name: &str) -> StepOutputHandle {
        StepOutputHandle::new(self.key.clone(), output_name)
    }
}

/// Run config after schema resolution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolvedRunConfig {
    pub ops: BTreeMap<String, ResolvedOpConfig>,
    pub resources: BTreeMap<String, Value>,
    pub execution: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolvedOpConfig {
    pub config: Value,
    pub inputs: BTreeMap<String, Value>,
}

impl ResolvedRunConfig {
    pub fn op_config(&self, step_name: &str) -> &Value {
        self.ops
            .get(step_name)
            .map(|op| &op.config)
            .unwrap_or(&Value::Null)
    }

    pub fn resource_config(&self, name: &str) -> &Value {
        self.resources.get(name).unwrap_or(&Value::Null)
    }
}

/// Step and output versions computed once per plan build
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepVersions {
    pub steps: HashMap<String, Option<String>>,
    pub outputs: HashMap<StepOutputHandle, Option<String>>,
    /// First node whose missing version left steps unversioned, e.g. `op 'load'`
    pub first_missing: Option<String>,
}

/// Progress of a run recovered from its event log or handed to a step worker
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownExecutionState {
    /// Retries already performed per step key
    pub previous_retry_attempts: BTreeMap<String, u32>,
    /// Producer step key -> dynamic output -> mapping keys in emission order
    pub dynamic_mappings: BTreeMap<String, BTreeMap<String, Vec<String>>>,
    /// Steps that already succeeded in an earlier process of the same run
    pub completed_steps: BTreeSet<String>,
}

impl KnownExecutionState {
    /// Rebuild what a run already achieved from its event log
    pub fn from_events(records: &[EventRecord]) -> Self {
        let mut state = Self::default();
        let mut mapped_outputs: Vec<StepOutputHandle> = Vec::new();

        for record in records {
            let Some(step_key) = record.step_key.as_deref() else {
                continue;
            };
            match &record.event {
                DagflowEvent::StepUpForRetry { .. } => {
                    *state
                        .previous_retry_attempts
                        .entry(step_key.to_string())
                        .or_insert(0) += 1;
                }
                DagflowEvent::StepOutput { handle, .. } if handle.mapping_key.is_some() => {
                    mapped_outputs.push(handle.clone());
                }
                DagflowEvent::StepSuccess { .. } => {
                    state.completed_steps.insert(step_key.to_string());
                }
                _ => {}
            }
        }

        // Only branches of producers that finished are final
        for handle in mapped_outputs {
            if !state.completed_steps.contains(&handle.step_key) {
                continue;
            }
            if let Some(mapping_key) = handle.mapping_key {
                let keys = state
                    .dynamic_mappings
                    .entry(handle.step_key)
                    .or_default()
                    .entry(handle.output_name)
                    .or_default();
                if !keys.contains(&mapping_key) {
                    keys.push(mapping_key);
                }
            }
        }
        state
    }

    pub fn mapping_keys(&self, root: &DynamicOutputRef) -> Option<&Vec<String>> {
        self.dynamic_mappings
            .get(&root.step_key)
            .and_then(|outputs| outputs.get(&root.output_name))
    }

    pub fn retry_count(&self, step_key: &str) -> u32 {
        self.previous_retry_attempts.get(step_key).copied().unwrap_or(0)
    }
}

/// Ordered steps plus the subset selected for execution
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    job_name: String,
    steps: HashMap<String, ExecutionStep>,
    order: Vec<String>,
    step_keys_to_execute: HashSet<String>,
    known_state: KnownExecutionState,
    resolved_config: ResolvedRunConfig,
    versions: StepVersions,
}

impl ExecutionPlan {
    pub(crate) fn new(
        job_name: String,
        steps: Vec<ExecutionStep>,
        resolved_config: ResolvedRunConfig,
        versions: StepVersions,
    ) -> Self {
        let order: Vec<String> = steps.iter().map(|s| s.key.clone()).collect();
        let step_keys_to_execute = order.iter().cloned().collect();
        Self {
            job_name,
            steps: steps.into_iter().map(|s| (s.key.clone(), s)).collect(),
            order,
            step_keys_to_execute,
            known_state: KnownExecutionState::default(),
            resolved_config,
            versions,
        }
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    /// Steps in topological order
    pub fn steps(&self) -> impl Iterator<Item = &ExecutionStep> {
        self.order.iter().filter_map(|key| self.steps.get(key))
    }

    pub fn step(&self, key: &str) -> Option<&ExecutionStep> {
        self.steps.get(key)
    }

    pub fn has_step(&self, key: &str) -> bool {
        self.steps.contains_key(key)
    }

    pub fn step_keys(&self) -> Vec<String> {
        self.order.clone()
    }

    /// Position of a step in the topological order
    pub fn position(&self, key: &str) -> Option<usize> {
        self.order.iter().position(|k| k == key)
    }

    /// Keys selected for execution, in topological order
    pub fn step_keys_to_execute(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|key| self.step_keys_to_execute.contains(*key))
            .cloned()
            .collect()
    }

    pub fn is_executing(&self, key: &str) -> bool {
        self.step_keys_to_execute.contains(key)
    }

    pub fn known_state(&self) -> &KnownExecutionState {
        &self.known_state
    }

    pub fn resolved_config(&self) -> &ResolvedRunConfig {
        &self.resolved_config
    }

    pub fn versions(&self) -> &StepVersions {
        &self.versions
    }

    pub fn step_version(&self, key: &str) -> Option<&str> {
        self.versions.steps.get(key).and_then(|v| v.as_deref())
    }

    pub fn output_version(&self, handle: &StepOutputHandle) -> Option<&str> {
        self.versions.outputs.get(handle).and_then(|v| v.as_deref())
    }

    pub fn snapshot(&self) -> ExecutionPlanSnapshot {
        ExecutionPlanSnapshot {
            step_keys: self.step_keys(),
            step_keys_to_execute: self.step_keys_to_execute(),
        }
    }

    pub(crate) fn with_versions(mut self, versions: StepVersions) -> Self {
        self.versions = versions;
        self
    }

    pub(crate) fn set_known_state(&mut self, known_state: KnownExecutionState) {
        self.known_state = known_state;
    }

    pub(crate) fn set_step_keys_to_execute(&mut self, keys: HashSet<String>) {
        self.step_keys_to_execute = keys;
    }

    pub(crate) fn remove_from_execution(&mut self, key: &str) -> bool {
        self.step_keys_to_execute.remove(key)
    }

    /// Unresolved dynamic outputs, in plan order, whose mapping keys are known
    /// but not yet applied
    pub(crate) fn resolvable_roots(&self) -> Vec<(DynamicOutputRef, Vec<String>)> {
        let mut roots: Vec<DynamicOutputRef> = Vec::new();
        for step in self.steps() {
            for root in &step.dynamic_roots {
                if !roots.contains(root) {
                    roots.push(root.clone());
                }
            }
        }
        roots
            .into_iter()
            .filter_map(|root| {
                let keys = self.known_state.mapping_keys(&root)?.clone();
                Some((root, keys))
            })
            .collect()
    }

    /// Replace the steps waiting on `producer.output` with one step per mapping key.
    ///
    /// Returns the keys of the new steps. Resolving the same output again with
    /// the same keys is a no-op; with different keys it is an invariant violation.
    pub fn resolve(&mut self, producer: &str, output_name: &str, mapping_keys: &[String]) -> Result<Vec<String>> {
        let root = DynamicOutputRef::new(producer, output_name);

        let unique: HashSet<&String> = mapping_keys.iter().collect();
        if unique.len() != mapping_keys.len() {
            return Err(DagflowError::InvariantViolation(format!(
                "dynamic output '{output_name}' of step '{producer}' reported a mapping key more than once"
            )));
        }

        let waiting = self
            .steps()
            .any(|step| step.dynamic_roots.contains(&root));
        if !waiting {
            return match self.known_state.mapping_keys(&root) {
                Some(known) if known.as_slice() != mapping_keys => Err(DagflowError::InvariantViolation(format!(
                    "dynamic output '{output_name}' of step '{producer}' was already resolved with different mapping keys"
                ))),
                _ => Ok(Vec::new()),
            };
        }

        self.known_state
            .dynamic_mappings
            .entry(producer.to_string())
            .or_default()
            .insert(output_name.to_string(), mapping_keys.to_vec());

        let mut replacements: HashMap<String, Vec<String>> = HashMap::new();
        let mut new_keys = Vec::new();

        let mapped: Vec<String> = self
            .steps()
            .filter(|step| step.kind == StepKind::UnresolvedMapped && step.dynamic_roots.contains(&root))
            .map(|step| step.key.clone())
            .collect();

        for unresolved_key in mapped {
            let Some(template) = self.steps.remove(&unresolved_key) else {
                continue;
            };
            let executing = self.step_keys_to_execute.remove(&unresolved_key);
            let mut keys = Vec::with_capacity(mapping_keys.len());

            for mapping_key in mapping_keys {
                let mut step = template.clone();
                step.key = mapped_step_key(&template.name, mapping_key);
                step.kind = StepKind::Compute;
                step.mapping_key = Some(mapping_key.clone());
                step.dynamic_roots.clear();
                for input in &mut step.inputs {
                    if let StepInputSource::FromPendingDynamicOutput { step_key, output_name } = &input.source {
                        let handle = if *step_key == root.step_key {
                            StepOutputHandle::mapped(step_key.clone(), output_name.clone(), mapping_key.clone())
                        } else {
                            let (base, _) = split_step_key(step_key);
                            StepOutputHandle::new(mapped_step_key(base, mapping_key), output_name.clone())
                        };
                        input.source = StepInputSource::FromStepOutput { handle };
                    }
                }

                if executing {
                    self.step_keys_to_execute.insert(step.key.clone());
                }
                keys.push(step.key.clone());
                self.steps.insert(step.key.clone(), step);
            }

            new_keys.extend(keys.iter().cloned());
            replacements.insert(unresolved_key, keys);
        }

        if !replacements.is_empty() {
            let mut order = Vec::with_capacity(self.order.len() + new_keys.len());
            for key in self.order.drain(..) {
                match replacements.get(&key) {
                    Some(keys) => order.extend(keys.iter().cloned()),
                    None => order.push(key),
                }
            }
            self.order = order;
        }

        let collecting: Vec<String> = self
            .steps()
            .filter(|step| step.kind == StepKind::UnresolvedCollect && step.dynamic_roots.contains(&root))
            .map(|step| step.key.clone())
            .collect();

        for key in collecting {
            let Some(step) = self.steps.get_mut(&key) else {
                continue;
            };
            for input in &mut step.inputs {
                let StepInputSource::FromPendingCollect { step_key, output_name } = &input.source else {
                    continue;
                };
                let handles = if *step_key == root.step_key && *output_name == root.output_name {
                    mapping_keys
                        .iter()
                        .map(|k| StepOutputHandle::mapped(step_key.clone(), output_name.clone(), k.clone()))
                        .collect()
                } else if let Some(resolved) = replacements.get(step_key) {
                    resolved
                        .iter()
                        .map(|k| StepOutputHandle::new(k.clone(), output_name.clone()))
                        .collect()
                } else {
                    continue;
                };
                input.source = StepInputSource::FromMultipleSources { handles };
            }
            step.dynamic_roots.retain(|r| *r != root);
            if step.dynamic_roots.is_empty() {
                step.kind = StepKind::Compute;
            }
        }

        Ok(new_keys)
    }

    /// Apply every mapping in the known state whose producer is in the plan
    pub(crate) fn apply_known_mappings(&mut self) -> Result<()> {
        loop {
            let Some((root, keys)) = self.resolvable_roots().into_iter().next() else {
                return Ok(());
            };
            self.resolve(&root.step_key, &root.output_name, &keys)?;
        }
    }

    /// Check that every selected step only depends on steps that are either
    /// selected as well or expected to have durable outputs
    pub fn dangling_dependencies(&self) -> Vec<(String, String)> {
        let mut dangling = Vec::new();
        for step in self.steps() {
            if !self.is_executing(&step.key) {
                continue;
            }
            for upstream in step.upstream_step_keys() {
                if !self.steps.contains_key(upstream) {
                    dangling.push((step.key.clone(), upstream.to_string()));
                }
            }
        }
        dangling
    }
}

/// Key of the unresolved slot for a mapped step
pub fn unresolved_step_key(name: &str) -> String {
    mapped_step_key(name, system::UNRESOLVED_MAPPING_KEY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn compute(key: &str, inputs: Vec<StepInput>) -> ExecutionStep {
        ExecutionStep {
            key: key.to_string(),
            name: key.to_string(),
            kind: StepKind::Compute,
            mapping_key: None,
            inputs,
            outputs: vec![StepOutputSpec {
                name: "result".to_string(),
                is_dynamic: false,
                is_required: true,
            }],
            tags: BTreeMap::new(),
            dynamic_roots: Vec::new(),
        }
    }

    fn fan_out_plan() -> ExecutionPlan {
        let root = DynamicOutputRef::new("emit", "result");
        let mut emit = compute("emit", vec![]);
        emit.outputs[0].is_dynamic = true;

        let mut process = compute(
            &unresolved_step_key("process"),
            vec![StepInput {
                name: "item".to_string(),
                is_nothing: false,
                source: StepInputSource::FromPendingDynamicOutput {
                    step_key: "emit".to_string(),
                    output_name: "result".to_string(),
                },
            }],
        );
        process.name = "process".to_string();
        process.kind = StepKind::UnresolvedMapped;
        process.dynamic_roots = vec![root.clone()];

        let mut total = compute(
            "total",
            vec![StepInput {
                name: "items".to_string(),
                is_nothing: false,
                source: StepInputSource::FromPendingCollect {
                    step_key: unresolved_step_key("process"),
                    output_name: "result".to_string(),
                },
            }],
        );
        total.kind = StepKind::UnresolvedCollect;
        total.dynamic_roots = vec![root];

        ExecutionPlan::new(
            "fan_out".to_string(),
            vec![emit, process, total],
            ResolvedRunConfig::default(),
            StepVersions::default(),
        )
    }

    #[test]
    fn test_resolve_clones_mapped_steps_in_place() {
        let mut plan = fan_out_plan();
        let keys = vec!["a".to_string(), "b".to_string()];
        let new_keys = plan.resolve("emit", "result", &keys).unwrap();

        assert_eq!(new_keys, vec!["process[a]", "process[b]"]);
        assert_eq!(plan.step_keys(), vec!["emit", "process[a]", "process[b]", "total"]);
        assert!(plan.is_executing("process[b]"));
        assert!(!plan.has_step("process[?]"));

        let mapped = plan.step("process[a]").unwrap();
        assert_eq!(
            mapped.inputs[0].source,
            StepInputSource::FromStepOutput {
                handle: StepOutputHandle::mapped("emit", "result", "a")
            }
        );

        let total = plan.step("total").unwrap();
        assert!(total.is_executable());
        assert_eq!(
            total.inputs[0].source.upstream_handles(),
            vec![
                &StepOutputHandle::new("process[a]", "result"),
                &StepOutputHandle::new("process[b]", "result")
            ]
        );
    }

    #[test]
    fn test_resolve_is_idempotent_for_identical_keys() {
        let mut plan = fan_out_plan();
        let keys = vec!["a".to_string()];
        plan.resolve("emit", "result", &keys).unwrap();
        assert!(plan.resolve("emit", "result", &keys).unwrap().is_empty());
        assert!(matches!(
            plan.resolve("emit", "result", &["z".to_string()]),
            Err(DagflowError::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_duplicate_mapping_keys_are_rejected() {
        let mut plan = fan_out_plan();
        let err = plan
            .resolve("emit", "result", &["a".to_string(), "a".to_string()])
            .unwrap_err();
        assert!(matches!(err, DagflowError::InvariantViolation(_)));
    }

    #[test]
    fn test_empty_fan_out_leaves_collect_with_no_sources() {
        let mut plan = fan_out_plan();
        plan.resolve("emit", "result", &[]).unwrap();
        assert_eq!(plan.step_keys(), vec!["emit", "total"]);
        assert!(plan.step("total").unwrap().upstream_step_keys().is_empty());
    }

    #[test]
    fn test_known_state_from_events() {
        let run_id = Uuid::new_v4();
        let record = |id: i64, step: &str, event: DagflowEvent| EventRecord {
            storage_id: id,
            run_id,
            timestamp: Utc::now(),
            step_key: Some(step.to_string()),
            event,
        };
        let records = vec![
            record(1, "emit", DagflowEvent::StepOutput {
                handle: StepOutputHandle::mapped("emit", "result", "x"),
                version: None,
            }),
            record(2, "emit", DagflowEvent::StepOutput {
                handle: StepOutputHandle::mapped("emit", "result", "y"),
                version: None,
            }),
            record(3, "emit", DagflowEvent::StepSuccess { duration_ms: 3 }),
            record(4, "flaky", DagflowEvent::StepUpForRetry {
                attempt: 0,
                delay_ms: 0,
                error: "try again".to_string(),
            }),
        ];

        let state = KnownExecutionState::from_events(&records);
        assert_eq!(
            state.mapping_keys(&DynamicOutputRef::new("emit", "result")),
            Some(&vec!["x".to_string(), "y".to_string()])
        );
        assert_eq!(state.retry_count("flaky"), 1);
        assert!(state.completed_steps.contains("emit"));

        let mut plan = fan_out_plan();
        plan.set_known_state(state);
        plan.apply_known_mappings().unwrap();
        assert!(plan.has_step("process[y]"));
    }
}
