//! # Active Execution
//!
//! In-memory bookkeeping for one run of a plan: which steps are ready, which
//! are running, which were skipped or abandoned, and when retries become due.
//!
//! Executors drive it in a loop: ask for [`ActiveExecution::get_steps_to_execute`],
//! run the returned attempts, feed every produced event back through
//! [`ActiveExecution::handle_event`], and write the bookkeeping events from
//! [`ActiveExecution::drain_step_events`] to the event log.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use super::plan::{ExecutionPlan, KnownExecutionState, StepKind};
use crate::error::{DagflowError, Result};
use crate::logging::log_step_operation;
use crate::models::{DagflowEvent, StepOutputHandle};
use crate::state_machine::{StepEvent, StepStateMachine, StepStatus};

/// One step attempt handed to an executor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepAttempt {
    pub step_key: String,
    /// Zero on the first attempt
    pub retry_number: u32,
}

/// What the upstreams of a pending step allow
#[derive(Debug, PartialEq, Eq)]
enum Readiness {
    Ready,
    Wait,
    Skip(String),
    Abandon(String),
}

#[derive(Debug)]
pub struct ActiveExecution {
    plan: ExecutionPlan,
    machines: HashMap<String, StepStateMachine>,
    running: HashSet<String>,
    successful_outputs: HashSet<StepOutputHandle>,
    /// (producer step key, output name) -> mapping keys in emission order
    observed_mappings: HashMap<(String, String), Vec<String>>,
    retry_ready_at: HashMap<String, Instant>,
    pending_events: Vec<(String, DagflowEvent)>,
    interrupted: bool,
    max_concurrent: usize,
}

impl ActiveExecution {
    pub fn new(plan: ExecutionPlan, max_concurrent: usize) -> Self {
        let known = plan.known_state().clone();
        let mut execution = Self {
            machines: HashMap::new(),
            running: HashSet::new(),
            successful_outputs: HashSet::new(),
            observed_mappings: HashMap::new(),
            retry_ready_at: HashMap::new(),
            pending_events: Vec::new(),
            interrupted: false,
            max_concurrent: max_concurrent.max(1),
            plan,
        };

        for key in execution.plan.step_keys_to_execute() {
            execution.track(&key, &known);
        }
        execution
    }

    fn track(&mut self, step_key: &str, known: &KnownExecutionState) {
        let mut machine = StepStateMachine::with_previous_retries(step_key, known.retry_count(step_key));
        if known.completed_steps.contains(step_key) {
            // Finished in an earlier process of this run
            let _ = machine.transition(StepEvent::Start);
            let _ = machine.transition(StepEvent::Succeed);
            if let Some(step) = self.plan.step(step_key) {
                for output in step.outputs.iter().filter(|o| !o.is_dynamic) {
                    self.successful_outputs.insert(step.handle_for(&output.name));
                }
            }
        }
        self.machines.insert(step_key.to_string(), machine);
    }

    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn status(&self, step_key: &str) -> Option<StepStatus> {
        self.machines.get(step_key).map(StepStateMachine::current_state)
    }

    pub fn step_statuses(&self) -> BTreeMap<String, StepStatus> {
        self.machines
            .iter()
            .map(|(key, machine)| (key.clone(), machine.current_state()))
            .collect()
    }

    pub fn running_steps(&self) -> Vec<String> {
        let mut running: Vec<String> = self.running.iter().cloned().collect();
        running.sort();
        running
    }

    pub fn keys_with_status(&self, status: StepStatus) -> Vec<String> {
        self.plan
            .step_keys()
            .into_iter()
            .filter(|key| self.status(key) == Some(status))
            .collect()
    }

    pub fn failed_steps(&self) -> Vec<String> {
        self.keys_with_status(StepStatus::Failure)
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted
    }

    /// Every tracked step reached a terminal status
    pub fn is_complete(&self) -> bool {
        self.machines.values().all(|m| m.current_state().is_terminal())
    }

    /// Progress snapshot handed to step workers
    pub fn known_state(&self) -> KnownExecutionState {
        let mut known = self.plan.known_state().clone();
        for (key, machine) in &self.machines {
            if machine.retry_count() > 0 {
                known.previous_retry_attempts.insert(key.clone(), machine.retry_count());
            }
            if machine.current_state() == StepStatus::Success {
                known.completed_steps.insert(key.clone());
            }
        }
        for ((producer, output), keys) in &self.observed_mappings {
            if self.status(producer) == Some(StepStatus::Success) {
                known
                    .dynamic_mappings
                    .entry(producer.clone())
                    .or_default()
                    .insert(output.clone(), keys.clone());
            }
        }
        known
    }

    /// Earliest instant at which a step waiting to retry becomes ready
    pub fn next_retry_at(&self) -> Option<Instant> {
        self.retry_ready_at
            .iter()
            .filter(|(key, _)| self.status(key) == Some(StepStatus::UpForRetry))
            .map(|(_, at)| *at)
            .min()
    }

    /// Stop handing out work; pending steps are abandoned, running steps finish
    pub fn mark_interrupted(&mut self) {
        if self.interrupted {
            return;
        }
        self.interrupted = true;
        for key in self.plan.step_keys() {
            let Some(machine) = self.machines.get_mut(&key) else {
                continue;
            };
            if matches!(
                machine.current_state(),
                StepStatus::Pending | StepStatus::UpForRetry | StepStatus::Restarted
            ) && machine.transition(StepEvent::Abandon).is_ok()
            {
                self.pending_events.push((
                    key.clone(),
                    DagflowEvent::engine(format!("Execution was interrupted before step {key} started")),
                ));
            }
        }
    }

    /// Steps that may start now, highest priority first, within the concurrency budget
    pub fn get_steps_to_execute(&mut self, now: Instant) -> Result<Vec<StepAttempt>> {
        if self.interrupted {
            return Ok(Vec::new());
        }

        let due: Vec<String> = self
            .retry_ready_at
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in due {
            self.retry_ready_at.remove(&key);
            if let Some(machine) = self.machines.get_mut(&key) {
                machine.transition(StepEvent::Restart)?;
            }
        }

        let mut ready = Vec::new();
        for key in self.plan.step_keys_to_execute() {
            let status = match self.status(&key) {
                Some(status) => status,
                None => continue,
            };
            if self.running.contains(&key) {
                continue;
            }
            match status {
                StepStatus::Restarted => ready.push(key),
                StepStatus::Pending => match self.readiness(&key) {
                    Readiness::Ready => ready.push(key),
                    Readiness::Wait => {}
                    Readiness::Skip(reason) => self.settle(&key, StepEvent::Skip, reason)?,
                    Readiness::Abandon(reason) => self.settle(&key, StepEvent::Abandon, reason)?,
                },
                _ => {}
            }
        }

        ready.sort_by_key(|key| std::cmp::Reverse(self.plan.step(key).map(|s| s.priority()).unwrap_or(0)));
        let capacity = self.max_concurrent.saturating_sub(self.running.len());
        let mut attempts = Vec::new();
        for key in ready.into_iter().take(capacity) {
            let Some(machine) = self.machines.get_mut(&key) else {
                continue;
            };
            machine.transition(StepEvent::Start)?;
            attempts.push(StepAttempt {
                step_key: key.clone(),
                retry_number: machine.retry_count(),
            });
            self.running.insert(key);
        }
        Ok(attempts)
    }

    fn settle(&mut self, key: &str, event: StepEvent, reason: String) -> Result<()> {
        if let Some(machine) = self.machines.get_mut(key) {
            let status = machine.transition(event)?;
            log_step_operation("settle", None, Some(key), &status.to_string(), Some(&reason));
        }
        let event = match self.status(key) {
            Some(StepStatus::Skipped) => DagflowEvent::StepSkipped { reason },
            _ => DagflowEvent::engine(reason),
        };
        self.pending_events.push((key.to_string(), event));
        Ok(())
    }

    fn readiness(&self, key: &str) -> Readiness {
        let Some(step) = self.plan.step(key) else {
            return Readiness::Wait;
        };

        if step.kind != StepKind::Compute {
            // Waiting on a dynamic producer that will never report
            for root in &step.dynamic_roots {
                match self.status(&root.step_key) {
                    None if !self.plan.is_executing(&root.step_key) => {
                        return Readiness::Abandon(format!(
                            "Dynamic output '{}' of step {} was not produced in this run",
                            root.output_name, root.step_key
                        ))
                    }
                    Some(StepStatus::Failure | StepStatus::Abandoned) => {
                        return Readiness::Abandon(format!(
                            "Dependencies for step {key} failed: {}. Not executing.",
                            root.step_key
                        ))
                    }
                    Some(StepStatus::Skipped) => {
                        return Readiness::Skip(format!(
                            "Skipping step {key} because upstream step {} was skipped",
                            root.step_key
                        ))
                    }
                    _ => {}
                }
            }
            return Readiness::Wait;
        }

        let mut failed = Vec::new();
        let mut missing = Vec::new();
        let mut waiting = false;

        for input in &step.inputs {
            if input.source.is_pending() {
                waiting = true;
                continue;
            }
            let handles = input.source.upstream_handles();
            for handle in handles {
                match self.status(&handle.step_key) {
                    // Not executing in this run: read from storage
                    None => {}
                    Some(StepStatus::Success) => {
                        if !input.is_nothing && !self.successful_outputs.contains(handle) {
                            missing.push(handle.to_string());
                        }
                    }
                    Some(StepStatus::Failure | StepStatus::Abandoned) => failed.push(handle.step_key.clone()),
                    Some(StepStatus::Skipped) => missing.push(handle.to_string()),
                    Some(_) => waiting = true,
                }
            }
        }

        if !failed.is_empty() {
            failed.dedup();
            return Readiness::Abandon(format!(
                "Dependencies for step {key} failed: {}. Not executing.",
                failed.join(", ")
            ));
        }
        if waiting {
            return Readiness::Wait;
        }
        if !missing.is_empty() {
            return Readiness::Skip(format!(
                "Skipping step {key} because upstream outputs were not produced: {}",
                missing.join(", ")
            ));
        }
        Readiness::Ready
    }

    /// Apply an event produced by a step attempt
    pub fn handle_event(&mut self, step_key: &str, event: &DagflowEvent) -> Result<()> {
        match event {
            DagflowEvent::StepOutput { handle, .. } => {
                if let Some(mapping_key) = &handle.mapping_key {
                    let keys = self
                        .observed_mappings
                        .entry((handle.step_key.clone(), handle.output_name.clone()))
                        .or_default();
                    if keys.contains(mapping_key) {
                        return Err(DagflowError::InvariantViolation(format!(
                            "step {step_key} produced mapping key '{mapping_key}' twice for output '{}'",
                            handle.output_name
                        )));
                    }
                    keys.push(mapping_key.clone());
                }
                self.successful_outputs.insert(handle.clone());
            }
            DagflowEvent::StepSuccess { .. } => {
                self.finish_attempt(step_key, StepEvent::Succeed)?;
                self.resolve_dynamic_outputs(step_key)?;
            }
            DagflowEvent::StepFailure { error, .. } => {
                self.finish_attempt(step_key, StepEvent::Fail(error.clone()))?;
            }
            DagflowEvent::StepUpForRetry { delay_ms, .. } => {
                let delay = Duration::from_millis(*delay_ms);
                self.finish_attempt(step_key, StepEvent::RequestRetry { delay })?;
                self.retry_ready_at.insert(step_key.to_string(), Instant::now() + delay);
            }
            DagflowEvent::StepSkipped { .. } => {
                self.running.remove(step_key);
                if let Some(machine) = self.machines.get_mut(step_key) {
                    if machine.current_state() == StepStatus::Pending {
                        machine.transition(StepEvent::Skip)?;
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn finish_attempt(&mut self, step_key: &str, event: StepEvent) -> Result<()> {
        self.running.remove(step_key);
        match self.machines.get_mut(step_key) {
            Some(machine) => {
                machine.transition(event)?;
            }
            None => warn!(step_key = %step_key, "Event for a step that is not tracked by this execution"),
        }
        Ok(())
    }

    fn resolve_dynamic_outputs(&mut self, step_key: &str) -> Result<()> {
        let dynamic_outputs: Vec<String> = self
            .plan
            .step(step_key)
            .map(|step| {
                step.outputs
                    .iter()
                    .filter(|o| o.is_dynamic)
                    .map(|o| o.name.clone())
                    .collect()
            })
            .unwrap_or_default();

        for output_name in dynamic_outputs {
            let keys = self
                .observed_mappings
                .get(&(step_key.to_string(), output_name.clone()))
                .cloned()
                .unwrap_or_default();
            let before: HashSet<String> = self.plan.step_keys().into_iter().collect();
            let new_keys = self.plan.resolve(step_key, &output_name, &keys)?;
            let after: HashSet<String> = self.plan.step_keys().into_iter().collect();

            for removed in before.difference(&after) {
                self.machines.remove(removed);
            }
            let known = self.plan.known_state().clone();
            for key in &new_keys {
                if self.plan.is_executing(key) {
                    self.track(key, &known);
                }
            }
            debug!(
                step_key = %step_key,
                output = %output_name,
                branches = new_keys.len(),
                "Resolved dynamic output"
            );
        }
        Ok(())
    }

    /// Bookkeeping events (skips, abandonments) not yet written to the event log
    pub fn drain_step_events(&mut self) -> Vec<(String, DagflowEvent)> {
        std::mem::take(&mut self.pending_events)
    }
}
