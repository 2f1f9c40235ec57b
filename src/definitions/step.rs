use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::config_schema::ConfigType;
use super::types::DataType;
use crate::execution::context::{ComputeError, StepContext, StepInputs};
use crate::models::AssetKey;

/// The body of a step. Outputs are reported through the context.
pub type ComputeFn = Arc<dyn Fn(&mut StepContext, StepInputs) -> Result<(), ComputeError> + Send + Sync>;

/// Name of the output a step gets when it declares none
pub const DEFAULT_OUTPUT: &str = "result";

/// `(step, output)` reference inside a job definition
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputRef {
    pub step: String,
    pub output: String,
}

impl OutputRef {
    pub fn new(step: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            output: output.into(),
        }
    }
}

/// Where an input's value comes from
#[derive(Debug, Clone, PartialEq)]
pub enum InputSource {
    /// One upstream output; when that output is dynamic the consumer is mapped
    StepOutput(OutputRef),
    /// Fan-in of several upstream outputs into a list, in declaration order
    MultipleOutputs(Vec<OutputRef>),
    /// Fan-in of every branch of a dynamic output (or of a mapped step's output)
    DynamicCollect(OutputRef),
    /// `ops.<step>.inputs.<name>` in the run config
    Config,
    Default(Value),
}

#[derive(Debug, Clone)]
pub struct InputDefinition {
    pub name: String,
    pub data_type: DataType,
    pub source: InputSource,
    /// Upstream asset this input reads, used for logical versions
    pub asset_key: Option<AssetKey>,
}

impl InputDefinition {
    pub fn new(name: impl Into<String>, source: InputSource) -> Self {
        Self {
            name: name.into(),
            data_type: DataType::Any,
            source,
            asset_key: None,
        }
    }

    pub fn from_output(name: impl Into<String>, step: impl Into<String>, output: impl Into<String>) -> Self {
        Self::new(name, InputSource::StepOutput(OutputRef::new(step, output)))
    }

    /// Ordering-only dependency on `step`'s output
    pub fn after(name: impl Into<String>, step: impl Into<String>, output: impl Into<String>) -> Self {
        Self::from_output(name, step, output).with_type(DataType::Nothing)
    }

    pub fn fan_in(name: impl Into<String>, sources: Vec<OutputRef>) -> Self {
        Self::new(name, InputSource::MultipleOutputs(sources))
    }

    pub fn collect(name: impl Into<String>, step: impl Into<String>, output: impl Into<String>) -> Self {
        Self::new(name, InputSource::DynamicCollect(OutputRef::new(step, output)))
    }

    pub fn from_config(name: impl Into<String>) -> Self {
        Self::new(name, InputSource::Config)
    }

    pub fn with_default(name: impl Into<String>, value: Value) -> Self {
        Self::new(name, InputSource::Default(value))
    }

    pub fn with_type(mut self, data_type: DataType) -> Self {
        self.data_type = data_type;
        self
    }

    pub fn with_asset(mut self, asset_key: AssetKey) -> Self {
        self.asset_key = Some(asset_key);
        self
    }
}

#[derive(Debug, Clone)]
pub struct OutputDefinition {
    pub name: String,
    pub data_type: DataType,
    pub is_dynamic: bool,
    pub is_required: bool,
    /// Asset materialized by this output
    pub asset_key: Option<AssetKey>,
    /// Other assets of the same step this asset depends on
    pub asset_deps: Vec<AssetKey>,
    /// Overrides the step code version for this asset's logical version
    pub code_version: Option<String>,
}

impl OutputDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: DataType::Any,
            is_dynamic: false,
            is_required: true,
            asset_key: None,
            asset_deps: Vec::new(),
            code_version: None,
        }
    }

    pub fn dynamic(name: impl Into<String>) -> Self {
        Self {
            is_dynamic: true,
            ..Self::new(name)
        }
    }

    pub fn optional(mut self) -> Self {
        self.is_required = false;
        self
    }

    pub fn with_type(mut self, data_type: DataType) -> Self {
        self.data_type = data_type;
        self
    }

    pub fn with_asset(mut self, asset_key: AssetKey) -> Self {
        self.asset_key = Some(asset_key);
        self
    }

    pub fn with_asset_deps(mut self, deps: Vec<AssetKey>) -> Self {
        self.asset_deps = deps;
        self
    }

    pub fn with_code_version(mut self, version: impl Into<String>) -> Self {
        self.code_version = Some(version.into());
        self
    }
}

/// How the delay between retries grows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    Linear,
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Option<Duration>,
    pub backoff: Option<Backoff>,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            delay: None,
            backoff: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Delay before retry number `attempt + 1` (attempts are zero-based)
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base = self.delay.unwrap_or_default();
        match self.backoff {
            None => base,
            Some(Backoff::Linear) => base.saturating_mul(attempt.saturating_add(1)),
            Some(Backoff::Exponential) => base.saturating_mul(2u32.saturating_pow(attempt)),
        }
    }
}

/// One op of a job: its declared interface plus its compute function
#[derive(Clone)]
pub struct StepDefinition {
    pub name: String,
    pub inputs: Vec<InputDefinition>,
    pub outputs: Vec<OutputDefinition>,
    pub config_schema: Option<ConfigType>,
    pub required_resources: BTreeSet<String>,
    pub retry_policy: Option<RetryPolicy>,
    pub code_version: Option<String>,
    /// Step tags; `dagflow/priority` orders simultaneously ready steps
    pub tags: BTreeMap<String, String>,
    pub compute: ComputeFn,
}

impl StepDefinition {
    /// A step with a single `result` output
    pub fn new<F>(name: impl Into<String>, compute: F) -> Self
    where
        F: Fn(&mut StepContext, StepInputs) -> Result<(), ComputeError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            outputs: vec![OutputDefinition::new(DEFAULT_OUTPUT)],
            config_schema: None,
            required_resources: BTreeSet::new(),
            retry_policy: None,
            code_version: None,
            tags: BTreeMap::new(),
            compute: Arc::new(compute),
        }
    }

    pub fn with_input(mut self, input: InputDefinition) -> Self {
        self.inputs.push(input);
        self
    }

    /// Replace the declared outputs
    pub fn with_outputs(mut self, outputs: Vec<OutputDefinition>) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn with_output(mut self, output: OutputDefinition) -> Self {
        self.outputs.retain(|existing| existing.name != output.name);
        self.outputs.push(output);
        self
    }

    pub fn with_config_schema(mut self, schema: ConfigType) -> Self {
        self.config_schema = Some(schema);
        self
    }

    pub fn requires_resource(mut self, name: impl Into<String>) -> Self {
        self.required_resources.insert(name.into());
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_code_version(mut self, version: impl Into<String>) -> Self {
        self.code_version = Some(version.into());
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn input(&self, name: &str) -> Option<&InputDefinition> {
        self.inputs.iter().find(|input| input.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&OutputDefinition> {
        self.outputs.iter().find(|output| output.name == name)
    }

    pub fn has_dynamic_output(&self) -> bool {
        self.outputs.iter().any(|output| output.is_dynamic)
    }
}

impl fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDefinition")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("required_resources", &self.required_resources)
            .field("retry_policy", &self.retry_policy)
            .field("code_version", &self.code_version)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_backoff() {
        let policy = RetryPolicy::new(3).with_delay(Duration::from_millis(100));
        assert_eq!(policy.calculate_delay(2), Duration::from_millis(100));

        let linear = policy.clone().with_backoff(Backoff::Linear);
        assert_eq!(linear.calculate_delay(0), Duration::from_millis(100));
        assert_eq!(linear.calculate_delay(2), Duration::from_millis(300));

        let exponential = policy.with_backoff(Backoff::Exponential);
        assert_eq!(exponential.calculate_delay(3), Duration::from_millis(800));
        assert_eq!(RetryPolicy::new(1).calculate_delay(5), Duration::ZERO);
    }

    #[test]
    fn test_output_replacement_keeps_names_unique() {
        let step = StepDefinition::new("emit", |_, _| Ok(()))
            .with_output(OutputDefinition::dynamic(DEFAULT_OUTPUT));
        assert_eq!(step.outputs.len(), 1);
        assert!(step.has_dynamic_output());
    }
}
