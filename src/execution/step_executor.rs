//! # Step Executor
//!
//! Runs exactly one attempt of one step and records everything it does in the
//! event log as it happens.
//!
//! ## Phases
//!
//! 1. **Start**: `StepStart` (or `StepRestarted` on a retry)
//! 2. **Inputs**: every non-`Nothing` input is loaded from its source and type-checked
//! 3. **Compute**: the compute function runs on the blocking pool with compute
//!    logs captured; an interrupt gives it a grace period before the attempt
//!    is reported as interrupted
//! 4. **Outputs**: produced outputs are validated, type-checked, versioned and
//!    stored through the IO manager; missing `Nothing` outputs are synthesized
//! 5. **Assets**: materializations are recorded in dependency order with
//!    their logical versions
//! 6. **Outcome**: `StepSuccess`, `StepUpForRetry` or `StepFailure`

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, instrument, warn};

use super::active_execution::StepAttempt;
use super::context::{ComputeError, ProducedOutput, StepContext, StepInputs};
use super::io_manager::{InputContext, IoManager, OutputContext};
use super::plan::{ExecutionPlan, ExecutionStep, StepInputSource};
use crate::config::ExecutionConfig;
use crate::constants::system;
use crate::definitions::{JobDefinition, JobRepository, ResourceHandle, StepDefinition};
use crate::error::{DagflowError, Result};
use crate::logging::log_step_operation;
use crate::models::{AssetKey, DagflowEvent, Run, StepFailureKind, StepOutputHandle};
use crate::storage::{ComputeLogManager, EventLogStorage, RunStorage};
use crate::versioning::{compute_logical_version, topological_asset_order};

/// Shared collaborators of every execution component
#[derive(Clone)]
pub struct ExecutionServices {
    pub repository: Arc<JobRepository>,
    pub run_storage: Arc<dyn RunStorage>,
    pub event_log: Arc<dyn EventLogStorage>,
    pub io_manager: Arc<dyn IoManager>,
    pub compute_logs: Arc<dyn ComputeLogManager>,
    pub config: ExecutionConfig,
}

impl std::fmt::Debug for ExecutionServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionServices")
            .field("jobs", &self.repository.job_names())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Per-run state shared by every step attempt of the run
#[derive(Clone)]
pub struct RunContext {
    pub run: Run,
    pub job: Arc<JobDefinition>,
    pub resources: Arc<HashMap<String, ResourceHandle>>,
    pub interrupt: watch::Receiver<bool>,
}

impl RunContext {
    /// Run that holds outputs of steps this run does not execute
    fn upstream_run_id(&self, plan: &ExecutionPlan, step_key: &str) -> uuid::Uuid {
        if plan.is_executing(step_key) || plan.known_state().completed_steps.contains(step_key) {
            self.run.run_id
        } else {
            self.run.parent_run_id.unwrap_or(self.run.run_id)
        }
    }
}

/// Events of one attempt, appended to the event log as they are produced
struct AttemptEvents<'a> {
    event_log: &'a dyn EventLogStorage,
    run_id: uuid::Uuid,
    step_key: &'a str,
    events: Vec<DagflowEvent>,
}

impl<'a> AttemptEvents<'a> {
    async fn emit(&mut self, event: DagflowEvent) -> Result<()> {
        self.event_log
            .append_event(self.run_id, Some(self.step_key), event.clone())
            .await?;
        self.events.push(event);
        Ok(())
    }

    async fn fail(mut self, error: String, kind: StepFailureKind) -> Result<Vec<DagflowEvent>> {
        log_step_operation("fail", Some(self.run_id), Some(self.step_key), "FAILURE", Some(&error));
        self.emit(DagflowEvent::StepFailure { error, kind }).await?;
        Ok(self.events)
    }
}

#[derive(Debug, Clone)]
pub struct StepExecutor {
    services: ExecutionServices,
}

impl StepExecutor {
    pub fn new(services: ExecutionServices) -> Self {
        Self { services }
    }

    /// Execute one attempt and return the events it recorded
    #[instrument(skip(self, run, plan), fields(run_id = %run.run.run_id, step_key = %attempt.step_key))]
    pub async fn execute_step(
        &self,
        run: &RunContext,
        plan: &ExecutionPlan,
        attempt: &StepAttempt,
    ) -> Result<Vec<DagflowEvent>> {
        let run_id = run.run.run_id;
        let step = plan.step(&attempt.step_key).ok_or_else(|| {
            DagflowError::InvariantViolation(format!("step {} is not in the plan", attempt.step_key))
        })?;
        let definition = run.job.step(&step.name).ok_or_else(|| DagflowError::Definition {
            step_key: step.key.clone(),
            reason: format!("job '{}' has no step named '{}'", run.job.name(), step.name),
        })?;

        let mut events = AttemptEvents {
            event_log: self.services.event_log.as_ref(),
            run_id,
            step_key: &step.key,
            events: Vec::new(),
        };

        // Phase 1: start
        let started = Instant::now();
        if attempt.retry_number > 0 {
            events
                .emit(DagflowEvent::StepRestarted {
                    attempt: attempt.retry_number,
                })
                .await?;
        } else {
            events.emit(DagflowEvent::StepStart { attempt: 0 }).await?;
        }
        log_step_operation("start", Some(run_id), Some(&step.key), "RUNNING", None);

        // Phase 2: inputs
        let inputs = match self.load_inputs(run, plan, step, definition, &mut events).await? {
            Ok(inputs) => inputs,
            Err((error, kind)) => return events.fail(error, kind).await,
        };

        // Phase 3: compute
        let (outputs, result) = match self.run_compute(run, plan, step, definition, attempt, inputs, &mut events).await? {
            Some(outcome) => outcome,
            None => {
                return events
                    .fail(
                        format!("Step {} did not finish within the interrupt grace period", step.key),
                        StepFailureKind::Interrupted,
                    )
                    .await
            }
        };

        if let Err(error) = result {
            return self.handle_compute_error(definition, attempt, error, events).await;
        }

        // Phase 4: outputs
        let outputs = match validate_outputs(step, definition, outputs) {
            Ok(outputs) => outputs,
            Err(error) => return events.fail(error, StepFailureKind::Framework).await,
        };
        for output in &outputs {
            let Some(output_definition) = definition.output(&output.name) else {
                continue;
            };
            if let Err(description) = output_definition.data_type.type_check(&output.value) {
                let target = format!("output '{}'", output.name);
                events
                    .emit(DagflowEvent::TypeCheckFailure {
                        target: target.clone(),
                        description: description.clone(),
                    })
                    .await?;
                let error = DagflowError::TypeCheck {
                    step_key: step.key.clone(),
                    target,
                    description,
                };
                return events.fail(error.to_string(), StepFailureKind::TypeCheck).await;
            }
        }

        for output in &outputs {
            let handle = match &output.mapping_key {
                Some(mapping_key) => StepOutputHandle::mapped(step.key.clone(), output.name.clone(), mapping_key.clone()),
                None => step.handle_for(&output.name),
            };
            let version = plan.output_version(&handle).map(str::to_string);
            let output_definition = definition.output(&output.name);
            let is_nothing = output_definition.is_some_and(|o| o.data_type.is_nothing());

            events
                .emit(DagflowEvent::StepOutput {
                    handle: handle.clone(),
                    version: version.clone(),
                })
                .await?;
            if is_nothing {
                continue;
            }

            let context = OutputContext::new(run_id, handle.clone())
                .with_version(version)
                .with_asset(
                    output_definition.and_then(|o| o.asset_key.clone()),
                    run.run.partition_key().map(str::to_string),
                );
            if let Err(err) = self.services.io_manager.handle_output(&context, &output.value) {
                return events
                    .fail(format!("Failed to store output {handle}: {err}"), StepFailureKind::Framework)
                    .await;
            }
            events.emit(DagflowEvent::HandledOutput { handle }).await?;
        }

        // Phase 5: assets
        if let Err(err) = self.record_materializations(run, step, definition, &outputs, &mut events).await {
            return events.fail(err.to_string(), StepFailureKind::Framework).await;
        }

        // Phase 6: success
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        events.emit(DagflowEvent::StepSuccess { duration_ms }).await?;
        log_step_operation("succeed", Some(run_id), Some(&step.key), "SUCCESS", None);
        Ok(events.events)
    }

    /// Loaded inputs, or the failure that ends the attempt
    async fn load_inputs(
        &self,
        run: &RunContext,
        plan: &ExecutionPlan,
        step: &ExecutionStep,
        definition: &StepDefinition,
        events: &mut AttemptEvents<'_>,
    ) -> Result<std::result::Result<StepInputs, (String, StepFailureKind)>> {
        let mut inputs = StepInputs::new();

        for input in &step.inputs {
            if input.is_nothing {
                continue;
            }
            let value = match &input.source {
                StepInputSource::FromStepOutput { handle } => {
                    match self.load_handle(run, plan, &input.name, handle) {
                        Ok(value) => value,
                        Err(error) => return Ok(Err((error, StepFailureKind::Framework))),
                    }
                }
                StepInputSource::FromMultipleSources { handles } => {
                    let mut values = Vec::with_capacity(handles.len());
                    for handle in handles {
                        match self.load_handle(run, plan, &input.name, handle) {
                            Ok(value) => values.push(value),
                            Err(error) => return Ok(Err((error, StepFailureKind::Framework))),
                        }
                    }
                    Value::Array(values)
                }
                StepInputSource::FromConfig { value } | StepInputSource::FromDefault { value } => value.clone(),
                StepInputSource::FromPendingDynamicOutput { .. } | StepInputSource::FromPendingCollect { .. } => {
                    return Err(DagflowError::InvariantViolation(format!(
                        "input '{}' of step {} was executed before its dynamic upstream resolved",
                        input.name, step.key
                    )))
                }
            };

            let upstream: Vec<StepOutputHandle> = input.source.upstream_handles().into_iter().cloned().collect();
            if !upstream.is_empty() {
                events
                    .emit(DagflowEvent::LoadedInput {
                        input_name: input.name.clone(),
                        upstream,
                    })
                    .await?;
            }

            let check = definition
                .input(&input.name)
                .map(|i| i.data_type.type_check(&value))
                .unwrap_or(Ok(()));
            events
                .emit(DagflowEvent::StepInput {
                    input_name: input.name.clone(),
                    type_check_passed: check.is_ok(),
                })
                .await?;
            if let Err(description) = check {
                let target = format!("input '{}'", input.name);
                events
                    .emit(DagflowEvent::TypeCheckFailure {
                        target: target.clone(),
                        description: description.clone(),
                    })
                    .await?;
                let error = DagflowError::TypeCheck {
                    step_key: step.key.clone(),
                    target,
                    description,
                };
                return Ok(Err((error.to_string(), StepFailureKind::TypeCheck)));
            }

            inputs.insert(input.name.clone(), value);
        }
        Ok(Ok(inputs))
    }

    fn load_handle(
        &self,
        run: &RunContext,
        plan: &ExecutionPlan,
        input_name: &str,
        handle: &StepOutputHandle,
    ) -> std::result::Result<Value, String> {
        let upstream = OutputContext::new(run.upstream_run_id(plan, &handle.step_key), handle.clone())
            .with_version(plan.output_version(handle).map(str::to_string));
        self.services
            .io_manager
            .load_input(&InputContext {
                input_name: input_name.to_string(),
                upstream,
            })
            .map_err(|err| format!("Failed to load input '{input_name}' from {handle}: {err}"))
    }

    /// Run the compute function; `None` when it outlived the interrupt grace period
    #[allow(clippy::too_many_arguments)]
    async fn run_compute(
        &self,
        run: &RunContext,
        plan: &ExecutionPlan,
        step: &ExecutionStep,
        definition: &StepDefinition,
        attempt: &StepAttempt,
        inputs: StepInputs,
        events: &mut AttemptEvents<'_>,
    ) -> Result<Option<(Vec<ProducedOutput>, std::result::Result<(), ComputeError>)>> {
        let log_key = vec![
            run.run.run_id.to_string(),
            "compute_logs".to_string(),
            step.key.clone(),
        ];
        let guard = match self.services.compute_logs.capture_logs(&log_key) {
            Ok(guard) => {
                events
                    .emit(DagflowEvent::ComputeLogsCaptured {
                        log_key: log_key.clone(),
                        step_keys: vec![step.key.clone()],
                    })
                    .await?;
                Some(guard)
            }
            Err(err) => {
                warn!(step_key = %step.key, error = %err, "Compute log capture unavailable");
                None
            }
        };

        let mut context = StepContext::new(run.run.run_id, step.key.clone())
            .with_retry_number(attempt.retry_number)
            .with_op_config(plan.resolved_config().op_config(&step.name).clone())
            .with_resources(Arc::clone(&run.resources))
            .with_partition_key(run.run.partition_key().map(str::to_string))
            .with_run_tags(Arc::new(run.run.tags.clone()))
            .with_interrupt(run.interrupt.clone())
            .with_log_writer(guard.as_ref().map(|g| g.writer()));

        let compute = Arc::clone(&definition.compute);
        let mut handle = tokio::task::spawn_blocking(move || {
            let result = compute(&mut context, inputs);
            (context.take_outputs(), result)
        });

        let mut interrupt = run.interrupt.clone();
        let joined = tokio::select! {
            joined = &mut handle => joined,
            _ = wait_for_interrupt(&mut interrupt) => {
                debug!(step_key = %step.key, "Interrupt received; waiting for compute to yield");
                match tokio::time::timeout(self.services.config.interrupt_grace_period(), &mut handle).await {
                    Ok(joined) => joined,
                    Err(_) => return Ok(None),
                }
            }
        };
        drop(guard);

        Ok(Some(match joined {
            Ok(outcome) => outcome,
            Err(join_error) => (
                Vec::new(),
                Err(ComputeError::failure(format!("Compute for step {} panicked: {join_error}", step.key))),
            ),
        }))
    }

    async fn handle_compute_error(
        &self,
        definition: &StepDefinition,
        attempt: &StepAttempt,
        error: ComputeError,
        mut events: AttemptEvents<'_>,
    ) -> Result<Vec<DagflowEvent>> {
        let retry_number = attempt.retry_number;
        let retry = match &error {
            ComputeError::Failure { message } => definition
                .retry_policy
                .as_ref()
                .filter(|policy| retry_number < policy.max_retries)
                .map(|policy| (policy.calculate_delay(retry_number), message.clone())),
            ComputeError::RetryRequested {
                message,
                max_retries,
                delay,
            } => {
                if retry_number < *max_retries {
                    Some((delay.unwrap_or_default(), message.clone()))
                } else {
                    return events
                        .fail(
                            format!("Exceeded max_retries of {max_retries}: {message}"),
                            StepFailureKind::UserCode,
                        )
                        .await;
                }
            }
            ComputeError::Interrupted => {
                return events.fail(error.to_string(), StepFailureKind::Interrupted).await;
            }
        };

        match retry {
            Some((delay, message)) => {
                let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                log_step_operation(
                    "request_retry",
                    Some(events.run_id),
                    Some(events.step_key),
                    "UP_FOR_RETRY",
                    Some(&message),
                );
                events
                    .emit(DagflowEvent::StepUpForRetry {
                        attempt: retry_number,
                        delay_ms,
                        error: message,
                    })
                    .await?;
                Ok(events.events)
            }
            None => events.fail(error.to_string(), StepFailureKind::UserCode).await,
        }
    }

    async fn record_materializations(
        &self,
        run: &RunContext,
        step: &ExecutionStep,
        definition: &StepDefinition,
        outputs: &[ProducedOutput],
        events: &mut AttemptEvents<'_>,
    ) -> Result<()> {
        let produced: HashSet<&str> = outputs.iter().map(|o| o.name.as_str()).collect();
        let input_assets: Vec<AssetKey> = definition
            .inputs
            .iter()
            .filter_map(|input| input.asset_key.clone())
            .collect();

        let assets: Vec<(&crate::definitions::OutputDefinition, AssetKey, Vec<AssetKey>)> = definition
            .outputs
            .iter()
            .filter(|o| produced.contains(o.name.as_str()))
            .filter_map(|o| {
                let key = o.asset_key.clone()?;
                let deps = if o.asset_deps.is_empty() {
                    input_assets.clone()
                } else {
                    o.asset_deps.clone()
                };
                Some((o, key, deps))
            })
            .collect();
        if assets.is_empty() {
            return Ok(());
        }

        let graph: Vec<(AssetKey, Vec<AssetKey>)> =
            assets.iter().map(|(_, key, deps)| (key.clone(), deps.clone())).collect();
        let order = topological_asset_order(&step.key, &graph)?;

        let mut recorded: HashMap<AssetKey, String> = HashMap::new();
        for index in order {
            let (output, asset_key, deps) = &assets[index];
            let mut input_versions: BTreeMap<AssetKey, String> = BTreeMap::new();
            for dep in deps {
                let version = match recorded.get(dep) {
                    Some(version) => version.clone(),
                    None => self.latest_logical_version(dep).await?,
                };
                input_versions.insert(dep.clone(), version);
            }

            let code_version = output
                .code_version
                .clone()
                .or_else(|| definition.code_version.clone())
                .unwrap_or_else(|| run.run.run_id.to_string());
            let logical_version = compute_logical_version(&code_version, &input_versions);
            recorded.insert(asset_key.clone(), logical_version.clone());

            events
                .emit(DagflowEvent::AssetMaterialization {
                    asset_key: asset_key.clone(),
                    partition: run.run.partition_key().map(str::to_string),
                    logical_version,
                    code_version,
                    input_logical_versions: input_versions
                        .into_iter()
                        .map(|(key, version)| (key.to_user_string(), version))
                        .collect(),
                })
                .await?;
        }
        Ok(())
    }

    async fn latest_logical_version(&self, asset_key: &AssetKey) -> Result<String> {
        let latest = self.services.event_log.get_latest_materialization(asset_key).await?;
        Ok(match latest.map(|record| record.event) {
            Some(DagflowEvent::AssetMaterialization { logical_version, .. }) => logical_version,
            _ => system::DEFAULT_LOGICAL_VERSION.to_string(),
        })
    }
}

/// Check produced outputs against the step's declarations and fill in
/// required `Nothing` outputs that compute did not report
fn validate_outputs(
    step: &ExecutionStep,
    definition: &StepDefinition,
    mut outputs: Vec<ProducedOutput>,
) -> std::result::Result<Vec<ProducedOutput>, String> {
    let mut seen: HashSet<(String, Option<String>)> = HashSet::new();
    for output in &outputs {
        let Some(declared) = step.output(&output.name) else {
            return Err(format!(
                "Step {} produced undeclared output '{}'",
                step.key, output.name
            ));
        };
        match (&output.mapping_key, declared.is_dynamic) {
            (None, true) => {
                return Err(format!(
                    "Step {} produced dynamic output '{}' without a mapping key",
                    step.key, output.name
                ))
            }
            (Some(_), false) => {
                return Err(format!(
                    "Step {} produced output '{}' with a mapping key, but it is not dynamic",
                    step.key, output.name
                ))
            }
            _ => {}
        }
        if !seen.insert((output.name.clone(), output.mapping_key.clone())) {
            let error = match &output.mapping_key {
                Some(mapping_key) => DagflowError::InvariantViolation(format!(
                    "step {} produced mapping key '{mapping_key}' more than once for output '{}'",
                    step.key, output.name
                )),
                None => DagflowError::InvariantViolation(format!(
                    "step {} produced output '{}' more than once",
                    step.key, output.name
                )),
            };
            return Err(error.to_string());
        }
    }

    for declared in &step.outputs {
        if !declared.is_required || declared.is_dynamic {
            continue;
        }
        if seen.iter().any(|(name, _)| *name == declared.name) {
            continue;
        }
        let is_nothing = definition
            .output(&declared.name)
            .is_some_and(|o| o.data_type.is_nothing());
        if is_nothing {
            outputs.push(ProducedOutput {
                name: declared.name.clone(),
                mapping_key: None,
                value: Value::Null,
            });
        } else {
            return Err(DagflowError::StepOutputNotFound {
                step_key: step.key.clone(),
                output: declared.name.clone(),
            }
            .to_string());
        }
    }
    Ok(outputs)
}

pub(crate) async fn wait_for_interrupt(interrupt: &mut watch::Receiver<bool>) {
    loop {
        if *interrupt.borrow_and_update() {
            return;
        }
        if interrupt.changed().await.is_err() {
            // Sender dropped without interrupting
            std::future::pending::<()>().await;
        }
    }
}
