//! Configuration Loader
//!
//! Environment-aware configuration loading: discovers the base and
//! environment YAML files, layers `DAGFLOW__*` environment variables on top
//! and validates the merged result.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use config::{Config, Environment, File, FileFormat};
use tracing::debug;

use super::error::{ConfigResult, ConfigurationError};
use super::DagflowConfig;
use crate::logging::get_environment;

const BASE_FILE_STEM: &str = "dagflow";
const ENV_PREFIX: &str = "DAGFLOW";

/// Loaded configuration plus the context it was loaded from
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config: DagflowConfig,
    environment: String,
    config_directory: PathBuf,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        Self::load_from_directory(None)
    }

    /// Load configuration from a specific directory
    pub fn load_from_directory(config_dir: Option<PathBuf>) -> ConfigResult<Arc<ConfigManager>> {
        let environment = get_environment();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load configuration from a specific directory with explicit environment.
    /// An explicitly passed directory must exist; the default one may be absent.
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let explicit = config_dir.is_some();
        let config_directory = config_dir.unwrap_or_else(Self::default_config_directory);

        if explicit && !config_directory.is_dir() {
            return Err(ConfigurationError::DirectoryNotFound {
                path: config_directory,
            });
        }

        debug!(
            environment = %environment,
            directory = %config_directory.display(),
            "Loading configuration"
        );

        let config = Self::load_and_merge_config(&config_directory, environment)?;
        config.validate()?;

        debug!(
            environment = %environment,
            max_concurrent_runs = config.run_coordinator.max_concurrent_runs,
            tag_limits = config.run_coordinator.tag_concurrency_limits.len(),
            monitoring = config.run_monitoring.enabled,
            "✅ Configuration loaded successfully"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory,
        }))
    }

    /// Wrap an already-built configuration, e.g. in tests
    pub fn from_config(config: DagflowConfig) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;
        Ok(Arc::new(ConfigManager {
            config,
            environment: get_environment(),
            config_directory: Self::default_config_directory(),
        }))
    }

    pub fn config(&self) -> &DagflowConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }

    fn default_config_directory() -> PathBuf {
        std::env::var("DAGFLOW_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config"))
    }

    fn load_and_merge_config(directory: &Path, environment: &str) -> ConfigResult<DagflowConfig> {
        let base = directory.join(format!("{BASE_FILE_STEM}.yaml"));
        let overlay = directory.join(format!("{BASE_FILE_STEM}.{environment}.yaml"));

        let merged = Config::builder()
            .add_source(File::from(base.clone()).format(FileFormat::Yaml).required(false))
            .add_source(
                File::from(overlay.clone())
                    .format(FileFormat::Yaml)
                    .required(false),
            )
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|err| {
                ConfigurationError::load_error(
                    format!("{} / {}", base.display(), overlay.display()),
                    err,
                )
            })?;

        Ok(merged.try_deserialize::<DagflowConfig>()?)
    }
}
