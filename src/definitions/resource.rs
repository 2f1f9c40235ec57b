use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use super::config_schema::ConfigType;

/// Initialized resource shared by every step of a run
pub type ResourceHandle = Arc<dyn Any + Send + Sync>;

/// Builds a resource from its resolved config
pub type ResourceInitFn = Arc<dyn Fn(&Value) -> Result<ResourceHandle, String> + Send + Sync>;

/// A resource steps can require by name.
///
/// Without an init function the resolved config value itself is the resource.
#[derive(Clone, Default)]
pub struct ResourceDefinition {
    pub config_schema: Option<ConfigType>,
    /// Participates in the version of every step that requires the resource
    pub version: Option<String>,
    pub description: Option<String>,
    init: Option<ResourceInitFn>,
}

impl ResourceDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config_schema(mut self, schema: ConfigType) -> Self {
        self.config_schema = Some(schema);
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_init<F>(mut self, init: F) -> Self
    where
        F: Fn(&Value) -> Result<ResourceHandle, String> + Send + Sync + 'static,
    {
        self.init = Some(Arc::new(init));
        self
    }

    pub fn initialize(&self, config: &Value) -> Result<ResourceHandle, String> {
        match &self.init {
            Some(init) => init(config),
            None => Ok(Arc::new(config.clone())),
        }
    }
}

impl fmt::Debug for ResourceDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceDefinition")
            .field("config_schema", &self.config_schema)
            .field("version", &self.version)
            .field("has_init", &self.init.is_some())
            .finish()
    }
}
