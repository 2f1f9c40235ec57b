//! # Run Worker
//!
//! Entry points of the processes that do the work:
//!
//! - [`RunWorker::execute_run`] drives a whole run from `STARTING` to a
//!   terminal status. It rebuilds the plan from the run's event log, so a
//!   worker resumed after a crash continues where the previous one stopped
//!   instead of re-running finished steps.
//! - [`execute_step_worker`] executes a single delegated step from its
//!   serialized [`ExecuteStepArgs`].
//!
//! Every failure that ends a run is written to the event log before the
//! worker returns.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::active_execution::{ActiveExecution, StepAttempt};
use super::executor::{ExecuteStepArgs, Executor, InProcessExecutor, LocalStepHandler, StepDelegatingExecutor, StepHandler};
use super::plan::{ExecutionPlan, KnownExecutionState};
use super::plan_builder::{build_memoized_plan, ExecutionPlanBuilder};
use super::step_executor::{ExecutionServices, RunContext, StepExecutor};
use crate::constants::tags;
use crate::definitions::{JobDefinition, ResourceHandle};
use crate::error::{DagflowError, Result};
use crate::logging::log_error;
use crate::models::{DagflowEvent, Run, StepFailureKind};
use crate::state_machine::{RunEvent, RunStateMachine, RunStatus};

/// Value of the `dagflow/executor` run tag selecting the step-delegating executor
pub const STEP_DELEGATING_EXECUTOR: &str = "step_delegating";

/// Executes runs handed to this process by a launcher
#[derive(Clone)]
pub struct RunWorker {
    services: ExecutionServices,
    state_machine: RunStateMachine,
    step_handler: Option<Arc<dyn StepHandler>>,
}

impl std::fmt::Debug for RunWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunWorker")
            .field("services", &self.services)
            .field("step_handler", &self.step_handler.as_ref().map(|h| h.name().to_string()))
            .finish()
    }
}

impl RunWorker {
    pub fn new(services: ExecutionServices) -> Self {
        let state_machine = RunStateMachine::new(services.run_storage.clone(), services.event_log.clone());
        Self {
            services,
            state_machine,
            step_handler: None,
        }
    }

    /// Handler used by runs tagged for step delegation; defaults to [`LocalStepHandler`]
    pub fn with_step_handler(mut self, handler: Arc<dyn StepHandler>) -> Self {
        self.step_handler = Some(handler);
        self
    }

    pub fn services(&self) -> &ExecutionServices {
        &self.services
    }

    /// Execute `run_id` and return the status it ended in
    #[instrument(skip(self, interrupt), fields(run_id = %run_id))]
    pub async fn execute_run(&self, run_id: Uuid, interrupt: watch::Receiver<bool>) -> Result<RunStatus> {
        let run = self
            .services
            .run_storage
            .get_run(run_id)
            .await?
            .ok_or(DagflowError::RunNotFound(run_id))?;

        if self.state_machine.try_transition(run_id, RunEvent::Start).await?.is_none() {
            let status = self.state_machine.current_state(run_id).await?;
            info!(run_id = %run_id, status = %status, "Run is not startable; worker exiting");
            if status == RunStatus::Canceling {
                // Termination was requested before the worker acknowledged
                return self.finish(run_id, RunEvent::Canceled).await;
            }
            return Ok(status);
        }

        match self.prepare_and_execute(&run, interrupt.clone()).await {
            Ok(active) => {
                let event = if *interrupt.borrow() || active.is_interrupted() {
                    RunEvent::Canceled
                } else {
                    let failed = active.failed_steps();
                    if failed.is_empty() {
                        RunEvent::Complete
                    } else {
                        RunEvent::fail_with_error(format!("Steps failed: {}", failed.join(", ")))
                    }
                };
                self.finish(run_id, event).await
            }
            Err(err) => {
                log_error("run_worker", "execute_run", &err.to_string(), Some(&run_id.to_string()));
                self.services
                    .event_log
                    .append_event(
                        run_id,
                        None,
                        DagflowEvent::engine_error("Execution of run failed", err.to_string()),
                    )
                    .await?;
                self.finish(run_id, RunEvent::fail_with_error(err.to_string())).await
            }
        }
    }

    async fn finish(&self, run_id: Uuid, event: RunEvent) -> Result<RunStatus> {
        match self.state_machine.try_transition(run_id, event).await? {
            Some(transition) => Ok(transition.to),
            None => Ok(self.state_machine.current_state(run_id).await?),
        }
    }

    async fn prepare_and_execute(&self, run: &Run, interrupt: watch::Receiver<bool>) -> Result<ActiveExecution> {
        let job = self.services.repository.get(&run.job_name)?;
        let records = self.services.event_log.get_events(run.run_id, None, None).await?;
        let known_state = KnownExecutionState::from_events(&records);

        let plan = build_run_plan(&self.services, &job, run, known_state, run.step_selection.clone())?;
        let resources = initialize_resources(&job, &plan, &plan.step_keys_to_execute())?;

        let context = RunContext {
            run: run.clone(),
            job,
            resources: Arc::new(resources),
            interrupt,
        };

        let executor: Box<dyn Executor> = match run.tag(tags::EXECUTOR) {
            Some(STEP_DELEGATING_EXECUTOR) => {
                let handler = self
                    .step_handler
                    .clone()
                    .unwrap_or_else(|| Arc::new(LocalStepHandler::new(self.services.clone())));
                Box::new(StepDelegatingExecutor::new(self.services.clone(), handler))
            }
            _ => Box::new(InProcessExecutor::new(self.services.clone())),
        };
        info!(
            run_id = %run.run_id,
            executor = executor.name(),
            steps = plan.step_keys_to_execute().len(),
            "Executing run"
        );

        let mut active = ActiveExecution::new(plan, self.services.config.max_concurrent_steps);
        executor.execute(&context, &mut active).await?;
        Ok(active)
    }
}

fn build_run_plan(
    services: &ExecutionServices,
    job: &JobDefinition,
    run: &Run,
    known_state: KnownExecutionState,
    selection: Option<Vec<String>>,
) -> Result<ExecutionPlan> {
    let plan = ExecutionPlanBuilder::new(job, &run.run_config)
        .with_step_selection(selection)
        .with_known_state(known_state)
        .build()?;
    if run.is_memoized() {
        build_memoized_plan(plan, run.run_id, services.io_manager.as_ref())
    } else {
        Ok(plan)
    }
}

/// Initialize every resource required by the given steps with its resolved config
fn initialize_resources(
    job: &JobDefinition,
    plan: &ExecutionPlan,
    step_keys: &[String],
) -> Result<HashMap<String, ResourceHandle>> {
    let required: BTreeSet<&str> = step_keys
        .iter()
        .filter_map(|key| plan.step(key))
        .filter_map(|step| job.step(&step.name))
        .flat_map(|definition| definition.required_resources.iter().map(String::as_str))
        .collect();

    let mut resources = HashMap::with_capacity(required.len());
    for name in required {
        let definition = job.resource(name).ok_or_else(|| DagflowError::Definition {
            step_key: name.to_string(),
            reason: format!("resource '{name}' is required but not defined on job '{}'", job.name()),
        })?;
        let handle = definition
            .initialize(plan.resolved_config().resource_config(name))
            .map_err(|reason| DagflowError::Definition {
                step_key: name.to_string(),
                reason: format!("resource '{name}' failed to initialize: {reason}"),
            })?;
        resources.insert(name.to_string(), handle);
    }
    Ok(resources)
}

/// Execute one delegated step. Failures before the step could start are
/// reported as its `StepFailure` so the coordinating executor sees them.
#[instrument(skip(services, args, interrupt), fields(run_id = %args.run_id, step_key = %args.step_key()))]
pub async fn execute_step_worker(
    services: &ExecutionServices,
    args: &ExecuteStepArgs,
    interrupt: watch::Receiver<bool>,
) -> Result<()> {
    let step_key = args.step_key().to_string();
    let prepared = async {
        let run = services
            .run_storage
            .get_run(args.run_id)
            .await?
            .ok_or(DagflowError::RunNotFound(args.run_id))?;
        let job = services.repository.get(&args.job_name)?;
        let plan = build_run_plan(
            services,
            &job,
            &run,
            args.known_state.clone(),
            Some(args.step_keys.clone()),
        )?;
        let resources = initialize_resources(&job, &plan, &args.step_keys)?;
        Ok::<_, DagflowError>((run, job, plan, resources))
    }
    .await;

    let (run, job, plan, resources) = match prepared {
        Ok(prepared) => prepared,
        Err(err) => {
            warn!(run_id = %args.run_id, step_key = %step_key, error = %err, "Step worker could not start");
            services
                .event_log
                .append_event(
                    args.run_id,
                    Some(&step_key),
                    DagflowEvent::StepFailure {
                        error: err.to_string(),
                        kind: StepFailureKind::Framework,
                    },
                )
                .await?;
            return Ok(());
        }
    };

    let context = RunContext {
        run,
        job,
        resources: Arc::new(resources),
        interrupt,
    };
    let attempt = StepAttempt {
        step_key,
        retry_number: args.retry_number,
    };
    StepExecutor::new(services.clone())
        .execute_step(&context, &plan, &attempt)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutionConfig;
    use crate::definitions::{InputDefinition, JobRepository, OutputDefinition, StepDefinition};
    use crate::execution::context::ComputeError;
    use crate::execution::io_manager::InMemoryIoManager;
    use crate::storage::{InMemoryEventLogStorage, InMemoryRunStorage, NoOpComputeLogManager};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn services(jobs: Vec<JobDefinition>) -> ExecutionServices {
        let repository = Arc::new(JobRepository::new());
        for job in jobs {
            repository.register(job);
        }
        ExecutionServices {
            repository,
            run_storage: Arc::new(InMemoryRunStorage::new()),
            event_log: Arc::new(InMemoryEventLogStorage::new()),
            io_manager: Arc::new(InMemoryIoManager::new()),
            compute_logs: Arc::new(NoOpComputeLogManager),
            config: ExecutionConfig {
                max_concurrent_steps: 4,
                step_poll_interval_ms: 5,
                interrupt_grace_period_ms: 200,
            },
        }
    }

    async fn submit(services: &ExecutionServices, run: Run) -> Uuid {
        let run = services.run_storage.create_run(run).await.unwrap();
        RunStateMachine::new(services.run_storage.clone(), services.event_log.clone())
            .transition(run.run_id, RunEvent::Dispatch)
            .await
            .unwrap();
        run.run_id
    }

    async fn step_events(services: &ExecutionServices, run_id: Uuid, step_key: &str) -> Vec<&'static str> {
        services
            .event_log
            .get_events(run_id, None, None)
            .await
            .unwrap()
            .into_iter()
            .filter(|record| record.step_key.as_deref() == Some(step_key))
            .map(|record| record.event.event_type())
            .collect()
    }

    fn idle() -> watch::Receiver<bool> {
        let (sender, receiver) = watch::channel(false);
        std::mem::forget(sender);
        receiver
    }

    fn diamond() -> JobDefinition {
        JobDefinition::builder("diamond")
            .step(StepDefinition::new("source", |ctx, _| {
                ctx.output("result", json!(2));
                Ok(())
            }))
            .step(
                StepDefinition::new("double", |ctx, inputs| {
                    let n = inputs.require("n")?.as_i64().unwrap_or(0);
                    ctx.output("result", json!(n * 2));
                    Ok(())
                })
                .with_input(InputDefinition::from_output("n", "source", "result")),
            )
            .step(StepDefinition::new("boom", |_, _| Err(ComputeError::failure("boom"))))
            .step(
                StepDefinition::new("after_boom", |ctx, _| {
                    ctx.output("result", json!(null));
                    Ok(())
                })
                .with_input(InputDefinition::from_output("x", "boom", "result")),
            )
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_run_succeeds_end_to_end() {
        let job = JobDefinition::builder("linear")
            .step(StepDefinition::new("a", |ctx, _| {
                ctx.output("result", json!(1));
                Ok(())
            }))
            .step(
                StepDefinition::new("b", |ctx, inputs| {
                    ctx.output("result", json!(inputs.require("x")?.as_i64().unwrap_or(0) + 1));
                    Ok(())
                })
                .with_input(InputDefinition::from_output("x", "a", "result")),
            )
            .build()
            .unwrap();
        let services = services(vec![job]);
        let run_id = submit(&services, Run::new("linear", Value::Null)).await;

        let status = RunWorker::new(services.clone()).execute_run(run_id, idle()).await.unwrap();
        assert_eq!(status, RunStatus::Success);
        assert!(step_events(&services, run_id, "b").await.contains(&"step_success"));
    }

    #[tokio::test]
    async fn test_failure_is_scoped_to_its_branch() {
        let services = services(vec![diamond()]);
        let run_id = submit(&services, Run::new("diamond", Value::Null)).await;

        let status = RunWorker::new(services.clone()).execute_run(run_id, idle()).await.unwrap();
        assert_eq!(status, RunStatus::Failure);
        assert!(step_events(&services, run_id, "double").await.contains(&"step_success"));
        assert!(step_events(&services, run_id, "boom").await.contains(&"step_failure"));
        // Downstream of the failure is never started
        let after = step_events(&services, run_id, "after_boom").await;
        assert!(!after.contains(&"step_start"));
        assert!(!after.contains(&"step_failure"));

        let run = services.run_storage.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failure);
    }

    #[tokio::test]
    async fn test_dynamic_fan_out_and_collect() {
        let job = JobDefinition::builder("fan")
            .step(
                StepDefinition::new("emit", |ctx, _| {
                    for key in ["a", "b", "c"] {
                        ctx.dynamic_output("result", key, json!(key.len()));
                    }
                    Ok(())
                })
                .with_output(OutputDefinition::dynamic("result")),
            )
            .step(
                StepDefinition::new("square", |ctx, inputs| {
                    let n = inputs.require("n")?.as_i64().unwrap_or(0);
                    ctx.output("result", json!(n * n));
                    Ok(())
                })
                .with_input(InputDefinition::from_output("n", "emit", "result")),
            )
            .step(
                StepDefinition::new("total", |ctx, inputs| {
                    let sum: i64 = inputs
                        .require("values")?
                        .as_array()
                        .map(|values| values.iter().filter_map(Value::as_i64).sum())
                        .unwrap_or(0);
                    ctx.output("result", json!(sum));
                    Ok(())
                })
                .with_input(InputDefinition::collect("values", "square", "result")),
            )
            .build()
            .unwrap();
        let services = services(vec![job]);
        let run_id = submit(&services, Run::new("fan", Value::Null)).await;

        let status = RunWorker::new(services.clone()).execute_run(run_id, idle()).await.unwrap();
        assert_eq!(status, RunStatus::Success);
        for key in ["square[a]", "square[b]", "square[c]", "total"] {
            assert!(step_events(&services, run_id, key).await.contains(&"step_success"), "{key}");
        }
    }

    #[tokio::test]
    async fn test_memoized_rerun_executes_nothing() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let job = JobDefinition::builder("versioned")
            .step(
                StepDefinition::new("answer", move |ctx, _| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    ctx.output("result", json!(42));
                    Ok(())
                })
                .with_code_version("42"),
            )
            .build()
            .unwrap();
        let services = services(vec![job]);
        let worker = RunWorker::new(services.clone());

        for _ in 0..2 {
            let run = Run::new("versioned", Value::Null).with_tag(tags::MEMOIZED_RUN, "true");
            let run_id = submit(&services, run).await;
            assert_eq!(worker.execute_run(run_id, idle()).await.unwrap(), RunStatus::Success);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_interrupt_cancels_run() {
        let job = JobDefinition::builder("slow")
            .step(StepDefinition::new("wait", |ctx, _| {
                for _ in 0..200 {
                    ctx.check_for_interrupt()?;
                    std::thread::sleep(Duration::from_millis(5));
                }
                ctx.output("result", json!(true));
                Ok(())
            }))
            .step(
                StepDefinition::new("next", |ctx, _| {
                    ctx.output("result", json!(true));
                    Ok(())
                })
                .with_input(InputDefinition::from_output("x", "wait", "result")),
            )
            .build()
            .unwrap();
        let services = services(vec![job]);
        let run_id = submit(&services, Run::new("slow", Value::Null)).await;
        let (sender, receiver) = watch::channel(false);

        let worker = RunWorker::new(services.clone());
        let handle = tokio::spawn(async move { worker.execute_run(run_id, receiver).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        sender.send(true).unwrap();

        let status = handle.await.unwrap().unwrap();
        assert_eq!(status, RunStatus::Canceled);
        assert!(!step_events(&services, run_id, "next").await.contains(&"step_start"));
    }

    #[tokio::test]
    async fn test_step_delegating_run_succeeds() {
        let services = services(vec![diamond()]);
        let run = Run::new("diamond", Value::Null)
            .with_tag(tags::EXECUTOR, STEP_DELEGATING_EXECUTOR)
            .with_step_selection(vec!["source".to_string(), "double".to_string()]);
        let run_id = submit(&services, run).await;

        let status = RunWorker::new(services.clone()).execute_run(run_id, idle()).await.unwrap();
        assert_eq!(status, RunStatus::Success);
        let events = step_events(&services, run_id, "double").await;
        assert_eq!(events.first(), Some(&"step_worker_starting"));
        assert!(events.contains(&"step_success"));
    }

    #[tokio::test]
    async fn test_run_already_canceled_is_not_started() {
        let services = services(vec![diamond()]);
        let run_id = submit(&services, Run::new("diamond", Value::Null)).await;
        let machine = RunStateMachine::new(services.run_storage.clone(), services.event_log.clone());
        machine.transition(run_id, RunEvent::Canceled).await.unwrap();

        let status = RunWorker::new(services.clone()).execute_run(run_id, idle()).await.unwrap();
        assert_eq!(status, RunStatus::Canceled);
        assert!(step_events(&services, run_id, "source").await.is_empty());
    }
}
