use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use dashmap::DashMap;

use super::resource::ResourceDefinition;
use super::step::StepDefinition;
use crate::error::{DagflowError, Result};
use crate::partitions::PartitionsDefinition;

/// A validated step graph plus the resources its steps require.
///
/// References between steps are checked later by the plan builder, which
/// reports undefined upstreams and cycles with the offending step named.
#[derive(Debug, Clone)]
pub struct JobDefinition {
    name: String,
    steps: Vec<StepDefinition>,
    index: HashMap<String, usize>,
    resources: BTreeMap<String, ResourceDefinition>,
    tags: BTreeMap<String, String>,
    partitions_def: Option<PartitionsDefinition>,
}

impl JobDefinition {
    pub fn builder(name: impl Into<String>) -> JobBuilder {
        JobBuilder {
            name: name.into(),
            steps: Vec::new(),
            resources: BTreeMap::new(),
            tags: BTreeMap::new(),
            partitions_def: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Steps in declaration order
    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    pub fn step(&self, name: &str) -> Option<&StepDefinition> {
        self.index.get(name).map(|&i| &self.steps[i])
    }

    /// Position of the step in declaration order, used as a tie-break
    pub fn step_position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn resources(&self) -> &BTreeMap<String, ResourceDefinition> {
        &self.resources
    }

    pub fn resource(&self, name: &str) -> Option<&ResourceDefinition> {
        self.resources.get(name)
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    pub fn partitions_def(&self) -> Option<&PartitionsDefinition> {
        self.partitions_def.as_ref()
    }
}

pub struct JobBuilder {
    name: String,
    steps: Vec<StepDefinition>,
    resources: BTreeMap<String, ResourceDefinition>,
    tags: BTreeMap<String, String>,
    partitions_def: Option<PartitionsDefinition>,
}

impl JobBuilder {
    pub fn step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    pub fn resource(mut self, name: impl Into<String>, resource: ResourceDefinition) -> Self {
        self.resources.insert(name.into(), resource);
        self
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn partitions(mut self, partitions_def: impl Into<PartitionsDefinition>) -> Self {
        self.partitions_def = Some(partitions_def.into());
        self
    }

    pub fn build(self) -> Result<JobDefinition> {
        let mut index = HashMap::with_capacity(self.steps.len());

        for (position, step) in self.steps.iter().enumerate() {
            if step.name.is_empty() || step.name.contains(['[', ']', '.']) {
                return Err(DagflowError::Definition {
                    step_key: step.name.clone(),
                    reason: "step names must be non-empty and must not contain '[', ']' or '.'"
                        .to_string(),
                });
            }
            if index.insert(step.name.clone(), position).is_some() {
                return Err(DagflowError::Definition {
                    step_key: step.name.clone(),
                    reason: "duplicate step name".to_string(),
                });
            }

            let mut seen_outputs = std::collections::HashSet::new();
            for output in &step.outputs {
                if !seen_outputs.insert(output.name.as_str()) {
                    return Err(DagflowError::Definition {
                        step_key: step.name.clone(),
                        reason: format!("duplicate output '{}'", output.name),
                    });
                }
            }

            if let Some(missing) = step
                .required_resources
                .iter()
                .find(|resource| !self.resources.contains_key(*resource))
            {
                return Err(DagflowError::Definition {
                    step_key: step.name.clone(),
                    reason: format!("required resource '{missing}' is not provided by job '{}'", self.name),
                });
            }
        }

        Ok(JobDefinition {
            name: self.name,
            steps: self.steps,
            index,
            resources: self.resources,
            tags: self.tags,
            partitions_def: self.partitions_def,
        })
    }
}

/// Jobs a worker can load by name
#[derive(Debug, Default)]
pub struct JobRepository {
    jobs: DashMap<String, Arc<JobDefinition>>,
}

impl JobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, job: JobDefinition) -> Arc<JobDefinition> {
        let job = Arc::new(job);
        self.jobs.insert(job.name().to_string(), Arc::clone(&job));
        job
    }

    pub fn get(&self, name: &str) -> Result<Arc<JobDefinition>> {
        self.jobs
            .get(name)
            .map(|job| Arc::clone(job.value()))
            .ok_or_else(|| DagflowError::JobNotFound(name.to_string()))
    }

    pub fn job_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.jobs.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(name: &str) -> StepDefinition {
        StepDefinition::new(name, |_, _| Ok(()))
    }

    #[test]
    fn test_duplicate_steps_are_rejected() {
        let err = JobDefinition::builder("dup")
            .step(noop("a"))
            .step(noop("a"))
            .build()
            .unwrap_err();
        assert!(matches!(err, DagflowError::Definition { step_key, .. } if step_key == "a"));
    }

    #[test]
    fn test_missing_resource_names_the_step() {
        let err = JobDefinition::builder("needs_db")
            .step(noop("load").requires_resource("db"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("'db'"));
        assert!(err.is_definition_error());
    }

    #[test]
    fn test_repository_lookup() {
        let repository = JobRepository::new();
        repository.register(JobDefinition::builder("etl").step(noop("a")).build().unwrap());
        assert_eq!(repository.get("etl").unwrap().steps().len(), 1);
        assert!(matches!(repository.get("missing"), Err(DagflowError::JobNotFound(_))));
    }
}
