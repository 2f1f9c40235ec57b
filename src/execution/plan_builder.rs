//! # Execution Plan Builder
//!
//! Turns a [`JobDefinition`] plus run config into an [`ExecutionPlan`].
//!
//! ## Phases
//!
//! `RawGraph → ResolvedConfig → StepGraph → (MemoizedFilter) → FinalPlan`
//!
//! - **RawGraph**: every input reference names an existing step and output;
//!   steps are sorted topologically, ties broken by declaration order.
//! - **ResolvedConfig**: run config is resolved against op and resource
//!   schemas. All field errors are collected and reported together.
//! - **StepGraph**: execution steps are created. Consumers of dynamic outputs
//!   become unresolved slots; mappings already known for the run are applied;
//!   the step selection is applied; versions are computed once.
//! - **MemoizedFilter**: [`build_memoized_plan`] drops steps whose outputs are
//!   already stored at their current version.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

use serde_json::{Map, Value};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::io_manager::{IoManager, OutputContext};
use super::plan::{
    unresolved_step_key, DynamicOutputRef, ExecutionPlan, ExecutionStep, KnownExecutionState,
    ResolvedOpConfig, ResolvedRunConfig, StepInput, StepInputSource, StepKind, StepOutputSpec,
    StepVersions,
};
use crate::definitions::{InputSource, JobDefinition, OutputRef, StepDefinition};
use crate::error::{ConfigFieldError, DagflowError, Result};
use crate::models::StepOutputHandle;
use crate::versioning::{
    resolve_config_version, resolve_fan_in_version, resolve_output_version, resolve_resource_version,
    resolve_step_version, StepVersionInputs,
};

const RUN_CONFIG_SECTIONS: [&str; 3] = ["ops", "resources", "execution"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PlanBuildPhase {
    RawGraph,
    ResolvedConfig,
    StepGraph,
    MemoizedFilter,
    FinalPlan,
}

impl fmt::Display for PlanBuildPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RawGraph => "raw_graph",
            Self::ResolvedConfig => "resolved_config",
            Self::StepGraph => "step_graph",
            Self::MemoizedFilter => "memoized_filter",
            Self::FinalPlan => "final_plan",
        };
        f.write_str(name)
    }
}

/// Shape of a step once its dynamic ancestry is known
#[derive(Debug, Clone)]
struct StepShape {
    key: String,
    mapped_root: Option<DynamicOutputRef>,
}

pub struct ExecutionPlanBuilder<'a> {
    job: &'a JobDefinition,
    run_config: &'a Value,
    step_selection: Option<Vec<String>>,
    known_state: Option<KnownExecutionState>,
    phase: PlanBuildPhase,
}

impl<'a> ExecutionPlanBuilder<'a> {
    pub fn new(job: &'a JobDefinition, run_config: &'a Value) -> Self {
        Self {
            job,
            run_config,
            step_selection: None,
            known_state: None,
            phase: PlanBuildPhase::RawGraph,
        }
    }

    pub fn with_step_selection(mut self, selection: Option<Vec<String>>) -> Self {
        self.step_selection = selection;
        self
    }

    pub fn with_known_state(mut self, known_state: KnownExecutionState) -> Self {
        self.known_state = Some(known_state);
        self
    }

    pub fn phase(&self) -> PlanBuildPhase {
        self.phase
    }

    fn advance(&mut self, phase: PlanBuildPhase) {
        debug!(job = %self.job.name(), from = %self.phase, to = %phase, "Plan build phase");
        self.phase = phase;
    }

    #[instrument(skip(self), fields(job = %self.job.name()))]
    pub fn build(mut self) -> Result<ExecutionPlan> {
        let order = self.sort_steps()?;

        self.advance(PlanBuildPhase::ResolvedConfig);
        let resolved_config = self.resolve_config()?;

        self.advance(PlanBuildPhase::StepGraph);
        let steps = self.build_steps(&order, &resolved_config)?;
        let mut plan = ExecutionPlan::new(
            self.job.name().to_string(),
            steps,
            resolved_config,
            StepVersions::default(),
        );

        if let Some(known_state) = self.known_state.take() {
            plan.set_known_state(known_state);
            plan.apply_known_mappings()?;
        }

        if let Some(selection) = &self.step_selection {
            let selected = select_steps(&plan, selection)?;
            plan.set_step_keys_to_execute(selected);
        }

        let versions = compute_versions(self.job, &plan);
        plan = plan.with_versions(versions);

        self.advance(PlanBuildPhase::FinalPlan);
        info!(
            job = %self.job.name(),
            steps = plan.step_keys().len(),
            to_execute = plan.step_keys_to_execute().len(),
            "Built execution plan"
        );
        Ok(plan)
    }

    /// Topological order of step definitions, validating every reference
    fn sort_steps(&self) -> Result<Vec<&'a StepDefinition>> {
        let steps = self.job.steps();
        let mut in_degree = vec![0usize; steps.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];

        for (index, step) in steps.iter().enumerate() {
            let mut upstream_positions = BTreeSet::new();
            for input in &step.inputs {
                for reference in input_references(&input.source) {
                    let upstream = self.job.step(&reference.step).ok_or_else(|| {
                        DagflowError::UndefinedUpstream {
                            step_key: step.name.clone(),
                            upstream: reference.step.clone(),
                        }
                    })?;
                    if upstream.output(&reference.output).is_none() {
                        return Err(DagflowError::UnsatisfiableDependency {
                            step_key: step.name.clone(),
                            input: input.name.clone(),
                            reason: format!(
                                "step '{}' has no output named '{}'",
                                reference.step, reference.output
                            ),
                        });
                    }
                    if let Some(position) = self.job.step_position(&reference.step) {
                        upstream_positions.insert(position);
                    }
                }
            }
            for position in upstream_positions {
                in_degree[index] += 1;
                dependents[position].push(index);
            }
        }

        let mut ready: BTreeSet<usize> = (0..steps.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(steps.len());
        while let Some(index) = ready.pop_first() {
            order.push(&steps[index]);
            for &dependent in &dependents[index] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }

        if order.len() != steps.len() {
            let stuck = (0..steps.len())
                .find(|&i| in_degree[i] > 0)
                .map(|i| steps[i].name.clone())
                .unwrap_or_default();
            return Err(DagflowError::Cycle { step_key: stuck });
        }
        Ok(order)
    }

    fn resolve_config(&self) -> Result<ResolvedRunConfig> {
        let mut errors = Vec::new();
        let empty = Map::new();

        let root = match self.run_config {
            Value::Null => &empty,
            Value::Object(map) => map,
            other => {
                return Err(DagflowError::ConfigValidation {
                    errors: vec![field_error("", format!("run config must be an object, got {other}"))],
                })
            }
        };

        for key in root.keys() {
            if !RUN_CONFIG_SECTIONS.contains(&key.as_str()) {
                errors.push(field_error(key, format!("unexpected field '{key}'")));
            }
        }

        let ops = section(root, "ops", &mut errors);
        let resources = section(root, "resources", &mut errors);

        for name in ops.keys() {
            if self.job.step(name).is_none() {
                errors.push(field_error(
                    &format!("ops.{name}"),
                    format!("job '{}' has no step named '{name}'", self.job.name()),
                ));
            }
        }
        for name in resources.keys() {
            if self.job.resource(name).is_none() {
                errors.push(field_error(
                    &format!("resources.{name}"),
                    format!("job '{}' has no resource named '{name}'", self.job.name()),
                ));
            }
        }

        let mut resolved = ResolvedRunConfig {
            execution: root.get("execution").cloned().unwrap_or(Value::Null),
            ..ResolvedRunConfig::default()
        };

        for step in self.job.steps() {
            let path = format!("ops.{}", step.name);
            let entry = entry_object(ops.get(&step.name), &path, &["config", "inputs"], &mut errors);
            resolved
                .ops
                .insert(step.name.clone(), resolve_op(step, &entry, &path, &mut errors));
        }

        for (name, definition) in self.job.resources() {
            let path = format!("resources.{name}");
            let entry = entry_object(resources.get(name), &path, &["config"], &mut errors);
            let provided = entry.get("config");
            let config = match &definition.config_schema {
                Some(schema) => schema.resolve(provided, &format!("{path}.config"), &mut errors),
                None => provided.cloned().unwrap_or(Value::Null),
            };
            resolved.resources.insert(name.clone(), config);
        }

        if errors.is_empty() {
            Ok(resolved)
        } else {
            Err(DagflowError::ConfigValidation { errors })
        }
    }

    fn build_steps(
        &self,
        order: &[&StepDefinition],
        config: &ResolvedRunConfig,
    ) -> Result<Vec<ExecutionStep>> {
        let mut shapes: HashMap<&str, StepShape> = HashMap::with_capacity(order.len());
        let mut steps = Vec::with_capacity(order.len());

        for definition in order {
            let mut mapped_roots: BTreeSet<DynamicOutputRef> = BTreeSet::new();
            let mut collect_roots: Vec<DynamicOutputRef> = Vec::new();
            let mut inputs = Vec::with_capacity(definition.inputs.len());

            for input in &definition.inputs {
                let unsatisfiable = |reason: &str| DagflowError::UnsatisfiableDependency {
                    step_key: definition.name.clone(),
                    input: input.name.clone(),
                    reason: reason.to_string(),
                };

                let source = match &input.source {
                    InputSource::StepOutput(reference) => {
                        let (shape, is_dynamic) = upstream_shape(self.job, &shapes, reference);
                        match (&shape.mapped_root, is_dynamic) {
                            (Some(_), true) => {
                                return Err(unsatisfiable("dynamic outputs of mapped steps cannot be mapped again"))
                            }
                            (None, true) => {
                                mapped_roots.insert(DynamicOutputRef::new(shape.key.clone(), reference.output.clone()));
                                StepInputSource::FromPendingDynamicOutput {
                                    step_key: shape.key.clone(),
                                    output_name: reference.output.clone(),
                                }
                            }
                            (Some(root), false) => {
                                mapped_roots.insert(root.clone());
                                StepInputSource::FromPendingDynamicOutput {
                                    step_key: shape.key.clone(),
                                    output_name: reference.output.clone(),
                                }
                            }
                            (None, false) => StepInputSource::FromStepOutput {
                                handle: StepOutputHandle::new(shape.key.clone(), reference.output.clone()),
                            },
                        }
                    }
                    InputSource::MultipleOutputs(references) => {
                        let mut handles = Vec::with_capacity(references.len());
                        for reference in references {
                            let (shape, is_dynamic) = upstream_shape(self.job, &shapes, reference);
                            if is_dynamic || shape.mapped_root.is_some() {
                                return Err(unsatisfiable(
                                    "fan-in over a dynamic output must use a collect input",
                                ));
                            }
                            handles.push(StepOutputHandle::new(shape.key.clone(), reference.output.clone()));
                        }
                        StepInputSource::FromMultipleSources { handles }
                    }
                    InputSource::DynamicCollect(reference) => {
                        let (shape, is_dynamic) = upstream_shape(self.job, &shapes, reference);
                        let root = match (&shape.mapped_root, is_dynamic) {
                            (None, true) => DynamicOutputRef::new(shape.key.clone(), reference.output.clone()),
                            (Some(root), false) => root.clone(),
                            _ => return Err(unsatisfiable("collect requires a dynamic or mapped upstream")),
                        };
                        if !collect_roots.contains(&root) {
                            collect_roots.push(root);
                        }
                        StepInputSource::FromPendingCollect {
                            step_key: shape.key.clone(),
                            output_name: reference.output.clone(),
                        }
                    }
                    InputSource::Config => StepInputSource::FromConfig {
                        value: config
                            .ops
                            .get(&definition.name)
                            .and_then(|op| op.inputs.get(&input.name))
                            .cloned()
                            .unwrap_or(Value::Null),
                    },
                    InputSource::Default(value) => StepInputSource::FromDefault { value: value.clone() },
                };

                inputs.push(StepInput {
                    name: input.name.clone(),
                    is_nothing: input.data_type.is_nothing(),
                    source,
                });
            }

            let definition_error = |reason: &str| DagflowError::UnsatisfiableDependency {
                step_key: definition.name.clone(),
                input: definition.inputs.first().map(|i| i.name.clone()).unwrap_or_default(),
                reason: reason.to_string(),
            };
            if mapped_roots.len() > 1 {
                return Err(definition_error("a step can map over at most one dynamic output"));
            }
            if !mapped_roots.is_empty() && !collect_roots.is_empty() {
                return Err(definition_error("a mapped step cannot also collect a dynamic output"));
            }
            if !mapped_roots.is_empty() && definition.has_dynamic_output() {
                return Err(definition_error("a mapped step cannot declare dynamic outputs"));
            }

            let (key, kind, dynamic_roots, mapped_root) = match mapped_roots.into_iter().next() {
                Some(root) => (
                    unresolved_step_key(&definition.name),
                    StepKind::UnresolvedMapped,
                    vec![root.clone()],
                    Some(root),
                ),
                None if !collect_roots.is_empty() => (
                    definition.name.clone(),
                    StepKind::UnresolvedCollect,
                    collect_roots,
                    None,
                ),
                None => (definition.name.clone(), StepKind::Compute, Vec::new(), None),
            };

            shapes.insert(
                definition.name.as_str(),
                StepShape {
                    key: key.clone(),
                    mapped_root,
                },
            );
            steps.push(ExecutionStep {
                key,
                name: definition.name.clone(),
                kind,
                mapping_key: None,
                inputs,
                outputs: definition
                    .outputs
                    .iter()
                    .map(|output| StepOutputSpec {
                        name: output.name.clone(),
                        is_dynamic: output.is_dynamic,
                        is_required: output.is_required,
                    })
                    .collect(),
                tags: definition.tags.clone(),
                dynamic_roots,
            });
        }

        Ok(steps)
    }
}

fn input_references(source: &InputSource) -> Vec<&OutputRef> {
    match source {
        InputSource::StepOutput(reference) | InputSource::DynamicCollect(reference) => vec![reference],
        InputSource::MultipleOutputs(references) => references.iter().collect(),
        InputSource::Config | InputSource::Default(_) => Vec::new(),
    }
}

/// Shape of an upstream already visited in topological order, and whether
/// the referenced output is dynamic
fn upstream_shape(
    job: &JobDefinition,
    shapes: &HashMap<&str, StepShape>,
    reference: &OutputRef,
) -> (StepShape, bool) {
    let shape = shapes.get(reference.step.as_str()).cloned().unwrap_or_else(|| StepShape {
        key: reference.step.clone(),
        mapped_root: None,
    });
    let is_dynamic = job
        .step(&reference.step)
        .and_then(|step| step.output(&reference.output))
        .is_some_and(|output| output.is_dynamic);
    (shape, is_dynamic)
}

fn field_error(path: &str, reason: String) -> ConfigFieldError {
    ConfigFieldError {
        path: path.to_string(),
        reason,
    }
}

fn section(root: &Map<String, Value>, name: &str, errors: &mut Vec<ConfigFieldError>) -> Map<String, Value> {
    match root.get(name) {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(other) => {
            errors.push(field_error(name, format!("expected object, got {other}")));
            Map::new()
        }
    }
}

/// An `ops.<name>` or `resources.<name>` entry, checked for unknown keys
fn entry_object(
    value: Option<&Value>,
    path: &str,
    allowed: &[&str],
    errors: &mut Vec<ConfigFieldError>,
) -> Map<String, Value> {
    match value {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => {
            for key in map.keys() {
                if !allowed.contains(&key.as_str()) {
                    errors.push(field_error(&format!("{path}.{key}"), format!("unexpected field '{key}'")));
                }
            }
            map.clone()
        }
        Some(other) => {
            errors.push(field_error(path, format!("expected object, got {other}")));
            Map::new()
        }
    }
}

fn resolve_op(
    step: &StepDefinition,
    entry: &Map<String, Value>,
    path: &str,
    errors: &mut Vec<ConfigFieldError>,
) -> ResolvedOpConfig {
    let provided = entry.get("config");
    let config = match &step.config_schema {
        Some(schema) => schema.resolve(provided, &format!("{path}.config"), errors),
        None => provided.cloned().unwrap_or(Value::Null),
    };

    let provided_inputs = match entry.get("inputs") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(other) => {
            errors.push(field_error(&format!("{path}.inputs"), format!("expected object, got {other}")));
            Map::new()
        }
    };

    let mut inputs = BTreeMap::new();
    for input in &step.inputs {
        let input_path = format!("{path}.inputs.{}", input.name);
        let provided = provided_inputs.get(&input.name);
        match (&input.source, provided) {
            (InputSource::Config, None) => {
                errors.push(field_error(&input_path, format!("missing required input '{}'", input.name)));
            }
            (InputSource::Config, Some(value)) => match input.data_type.type_check(value) {
                Ok(()) => {
                    inputs.insert(input.name.clone(), value.clone());
                }
                Err(reason) => errors.push(field_error(&input_path, reason)),
            },
            (_, Some(_)) => errors.push(field_error(
                &input_path,
                format!("input '{}' is not loaded from config", input.name),
            )),
            (_, None) => {}
        }
    }
    for name in provided_inputs.keys() {
        if step.input(name).is_none() {
            errors.push(field_error(
                &format!("{path}.inputs.{name}"),
                format!("step '{}' has no input named '{name}'", step.name),
            ));
        }
    }

    ResolvedOpConfig { config, inputs }
}

fn select_steps(plan: &ExecutionPlan, selection: &[String]) -> Result<HashSet<String>> {
    let mut selected = HashSet::new();
    for entry in selection {
        let matches: Vec<String> = plan
            .steps()
            .filter(|step| step.key == *entry || step.name == *entry)
            .map(|step| step.key.clone())
            .collect();
        if matches.is_empty() {
            return Err(DagflowError::Definition {
                step_key: entry.clone(),
                reason: "step selection references a step that is not in the plan".to_string(),
            });
        }
        selected.extend(matches);
    }
    Ok(selected)
}

/// Versions for every step and output, visited in plan order.
///
/// Steps touched by dynamic outputs are never versioned.
fn compute_versions(job: &JobDefinition, plan: &ExecutionPlan) -> StepVersions {
    let mut versions = StepVersions::default();
    let mut dynamic: HashSet<String> = HashSet::new();

    for step in plan.steps() {
        let touches_dynamic = !step.is_executable()
            || step.mapping_key.is_some()
            || step.outputs.iter().any(|o| o.is_dynamic)
            || step.upstream_step_keys().iter().any(|key| dynamic.contains(*key));
        if touches_dynamic {
            dynamic.insert(step.key.clone());
            versions.steps.insert(step.key.clone(), None);
            for output in &step.outputs {
                versions.outputs.insert(step.handle_for(&output.name), None);
            }
            continue;
        }

        let Some(definition) = job.step(&step.name) else {
            continue;
        };

        if definition.code_version.is_none() && versions.first_missing.is_none() {
            versions.first_missing = Some(format!("op '{}'", step.name));
        }

        let resource_versions: Vec<(String, Option<String>)> = definition
            .required_resources
            .iter()
            .map(|name| {
                let version = job.resource(name).map(|resource| {
                    resolve_resource_version(
                        plan.resolved_config().resource_config(name),
                        resource.version.as_deref(),
                    )
                });
                (name.clone(), version)
            })
            .collect();

        let input_versions = step
            .inputs
            .iter()
            .filter(|input| !input.is_nothing)
            .map(|input| {
                let version = match &input.source {
                    StepInputSource::FromStepOutput { handle } => {
                        versions.outputs.get(handle).cloned().flatten()
                    }
                    StepInputSource::FromMultipleSources { handles } => resolve_fan_in_version(
                        handles
                            .iter()
                            .map(|handle| versions.outputs.get(handle).and_then(|v| v.as_deref())),
                    ),
                    StepInputSource::FromConfig { value } | StepInputSource::FromDefault { value } => {
                        Some(resolve_config_version(value))
                    }
                    StepInputSource::FromPendingDynamicOutput { .. }
                    | StepInputSource::FromPendingCollect { .. } => None,
                };
                (input.name.clone(), version)
            })
            .collect();

        let step_version = resolve_step_version(&StepVersionInputs {
            code_version: definition.code_version.clone(),
            config_version: resolve_config_version(plan.resolved_config().op_config(&step.name)),
            resource_versions,
            input_versions,
        });

        for output in &step.outputs {
            versions.outputs.insert(
                step.handle_for(&output.name),
                resolve_output_version(&output.name, step_version.as_deref()),
            );
        }
        versions.steps.insert(step.key.clone(), step_version);
    }

    versions
}

/// Drop every step whose outputs are already stored at their current version.
///
/// Fails with [`DagflowError::MissingCodeVersion`] when any step lacks a code
/// version. Resources without a declared version are versioned by their config.
#[instrument(skip(plan, io_manager), fields(job = %plan.job_name()))]
pub fn build_memoized_plan(mut plan: ExecutionPlan, run_id: Uuid, io_manager: &dyn IoManager) -> Result<ExecutionPlan> {
    debug!(job = %plan.job_name(), phase = %PlanBuildPhase::MemoizedFilter, "Plan build phase");
    if let Some(node) = plan.versions().first_missing.clone() {
        return Err(DagflowError::MissingCodeVersion { node });
    }

    let mut memoized = Vec::new();
    for key in plan.step_keys_to_execute() {
        let Some(step) = plan.step(&key) else {
            continue;
        };
        if step.outputs.is_empty() || plan.step_version(&key).is_none() {
            continue;
        }
        let stored = step.outputs.iter().filter(|output| !output.is_dynamic).all(|output| {
            let handle = step.handle_for(&output.name);
            let version = plan.output_version(&handle).map(str::to_string);
            version.is_some() && io_manager.has_output(&OutputContext::new(run_id, handle).with_version(version))
        });
        if stored {
            memoized.push(key);
        }
    }

    for key in &memoized {
        plan.remove_from_execution(key);
    }
    info!(
        job = %plan.job_name(),
        memoized = memoized.len(),
        to_execute = plan.step_keys_to_execute().len(),
        "Filtered memoized steps"
    );
    Ok(plan)
}
