//! Explicit context passed to a step's compute function.
//!
//! Everything the step can see about its run travels through [`StepContext`]:
//! config, resources, retry number, partition, interrupt signal and the
//! compute log writer. Outputs are reported back through it as well.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

use crate::definitions::ResourceHandle;
use crate::storage::LogWriter;

/// How a compute function ended without success
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ComputeError {
    /// Business-logic failure; retried only under the step's retry policy
    #[error("{message}")]
    Failure { message: String },

    /// The step asked to run again
    #[error("Retry requested: {message}")]
    RetryRequested {
        message: String,
        max_retries: u32,
        delay: Option<Duration>,
    },

    #[error("Step execution was interrupted")]
    Interrupted,
}

impl ComputeError {
    pub fn failure(message: impl Into<String>) -> Self {
        Self::Failure {
            message: message.into(),
        }
    }

    /// Request one retry with no delay
    pub fn retry(message: impl Into<String>) -> Self {
        Self::RetryRequested {
            message: message.into(),
            max_retries: 1,
            delay: None,
        }
    }

    pub fn retry_with(message: impl Into<String>, max_retries: u32, delay: Option<Duration>) -> Self {
        Self::RetryRequested {
            message: message.into(),
            max_retries,
            delay,
        }
    }
}

/// Loaded input values, keyed by input name. `Nothing` inputs are absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepInputs {
    values: BTreeMap<String, Value>,
}

impl StepInputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn take(&mut self, name: &str) -> Option<Value> {
        self.values.remove(name)
    }

    /// Like [`get`](Self::get) but a missing input is a step failure
    pub fn require(&self, name: &str) -> Result<&Value, ComputeError> {
        self.values
            .get(name)
            .ok_or_else(|| ComputeError::failure(format!("input '{name}' was not provided")))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for StepInputs {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

/// An output value reported by a compute function
#[derive(Debug, Clone, PartialEq)]
pub struct ProducedOutput {
    pub name: String,
    pub mapping_key: Option<String>,
    pub value: Value,
}

/// Execution context of one step attempt
pub struct StepContext {
    run_id: Uuid,
    step_key: String,
    step_name: String,
    mapping_key: Option<String>,
    retry_number: u32,
    op_config: Value,
    resources: Arc<HashMap<String, ResourceHandle>>,
    partition_key: Option<String>,
    run_tags: Arc<BTreeMap<String, String>>,
    interrupt: watch::Receiver<bool>,
    log_writer: Option<LogWriter>,
    outputs: Vec<ProducedOutput>,
}

impl StepContext {
    pub fn new(run_id: Uuid, step_key: impl Into<String>) -> Self {
        let step_key = step_key.into();
        let step_name = crate::models::split_step_key(&step_key).0.to_string();
        let mapping_key = crate::models::split_step_key(&step_key).1.map(str::to_string);
        // Nobody can interrupt a context built without an interrupt channel
        let (_, interrupt) = watch::channel(false);
        Self {
            run_id,
            step_key,
            step_name,
            mapping_key,
            retry_number: 0,
            op_config: Value::Null,
            resources: Arc::new(HashMap::new()),
            partition_key: None,
            run_tags: Arc::new(BTreeMap::new()),
            interrupt,
            log_writer: None,
            outputs: Vec::new(),
        }
    }

    pub fn with_retry_number(mut self, retry_number: u32) -> Self {
        self.retry_number = retry_number;
        self
    }

    pub fn with_op_config(mut self, config: Value) -> Self {
        self.op_config = config;
        self
    }

    pub fn with_resources(mut self, resources: Arc<HashMap<String, ResourceHandle>>) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_partition_key(mut self, partition_key: Option<String>) -> Self {
        self.partition_key = partition_key;
        self
    }

    pub fn with_run_tags(mut self, tags: Arc<BTreeMap<String, String>>) -> Self {
        self.run_tags = tags;
        self
    }

    pub fn with_interrupt(mut self, interrupt: watch::Receiver<bool>) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn with_log_writer(mut self, writer: Option<LogWriter>) -> Self {
        self.log_writer = writer;
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn step_key(&self) -> &str {
        &self.step_key
    }

    /// Name of the step definition; equal to the key unless the step is mapped
    pub fn step_name(&self) -> &str {
        &self.step_name
    }

    pub fn mapping_key(&self) -> Option<&str> {
        self.mapping_key.as_deref()
    }

    /// Zero on the first attempt, incremented on every retry
    pub fn retry_number(&self) -> u32 {
        self.retry_number
    }

    pub fn op_config(&self) -> &Value {
        &self.op_config
    }

    pub fn partition_key(&self) -> Option<&str> {
        self.partition_key.as_deref()
    }

    pub fn run_tag(&self, key: &str) -> Option<&str> {
        self.run_tags.get(key).map(String::as_str)
    }

    /// Typed access to an initialized resource
    pub fn resource<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.resources
            .get(name)
            .and_then(|handle| Arc::clone(handle).downcast::<T>().ok())
    }

    pub fn output(&mut self, name: impl Into<String>, value: Value) {
        self.outputs.push(ProducedOutput {
            name: name.into(),
            mapping_key: None,
            value,
        });
    }

    /// Report one branch of a dynamic output
    pub fn dynamic_output(&mut self, name: impl Into<String>, mapping_key: impl Into<String>, value: Value) {
        self.outputs.push(ProducedOutput {
            name: name.into(),
            mapping_key: Some(mapping_key.into()),
            value,
        });
    }

    pub fn is_interrupted(&self) -> bool {
        *self.interrupt.borrow()
    }

    /// Cooperative cancellation point for long-running compute functions
    pub fn check_for_interrupt(&self) -> Result<(), ComputeError> {
        if self.is_interrupted() {
            Err(ComputeError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Write a line to the step's captured compute log and to tracing
    pub fn log(&self, message: &str) {
        tracing::info!(run_id = %self.run_id, step_key = %self.step_key, "{message}");
        if let Some(writer) = &self.log_writer {
            writer.write_line(message);
        }
    }

    pub(crate) fn take_outputs(&mut self) -> Vec<ProducedOutput> {
        std::mem::take(&mut self.outputs)
    }
}

impl std::fmt::Debug for StepContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepContext")
            .field("run_id", &self.run_id)
            .field("step_key", &self.step_key)
            .field("retry_number", &self.retry_number)
            .field("outputs", &self.outputs.len())
            .finish_non_exhaustive()
    }
}
