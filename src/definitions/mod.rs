//! # Definitions
//!
//! The already-validated objects the engine consumes: jobs, steps with their
//! input and output declarations, resources, config schemas, runtime data
//! types and retry policies. Authoring ergonomics live elsewhere; these types
//! only carry what plan building and execution need.

pub mod config_schema;
pub mod job;
pub mod resource;
pub mod step;
pub mod types;

pub use config_schema::{ConfigField, ConfigType};
pub use job::{JobBuilder, JobDefinition, JobRepository};
pub use resource::{ResourceDefinition, ResourceHandle, ResourceInitFn};
pub use step::{
    Backoff, ComputeFn, InputDefinition, InputSource, OutputDefinition, OutputRef, RetryPolicy,
    StepDefinition, DEFAULT_OUTPUT,
};
pub use types::{DataType, TypeCheckFn};
