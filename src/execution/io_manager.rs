//! # IO Managers
//!
//! Pluggable storage for step outputs. The step executor hands every produced
//! output to [`IoManager::handle_output`] and loads every non-`Nothing` input
//! through [`IoManager::load_input`]. Versioned outputs are additionally
//! addressable by version alone, which is what memoized plans query through
//! [`IoManager::has_output`].

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{AssetKey, StepOutputHandle};

#[derive(Debug, Error)]
pub enum IoManagerError {
    #[error("No stored value for output {handle} of run {run_id}")]
    NotFound { run_id: Uuid, handle: String },

    #[error("IO error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to serialize output {handle}: {source}")]
    Serialization {
        handle: String,
        #[source]
        source: serde_json::Error,
    },
}

pub type IoManagerResult<T> = std::result::Result<T, IoManagerError>;

/// Identity of an output being stored or read back
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputContext {
    pub run_id: Uuid,
    pub handle: StepOutputHandle,
    /// Output version when the plan could compute one
    pub version: Option<String>,
    pub asset_key: Option<AssetKey>,
    pub partition_key: Option<String>,
}

impl OutputContext {
    pub fn new(run_id: Uuid, handle: StepOutputHandle) -> Self {
        Self {
            run_id,
            handle,
            version: None,
            asset_key: None,
            partition_key: None,
        }
    }

    pub fn with_version(mut self, version: Option<String>) -> Self {
        self.version = version;
        self
    }

    pub fn with_asset(mut self, asset_key: Option<AssetKey>, partition_key: Option<String>) -> Self {
        self.asset_key = asset_key;
        self.partition_key = partition_key;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputContext {
    pub input_name: String,
    /// The output this input reads
    pub upstream: OutputContext,
}

pub trait IoManager: Send + Sync {
    fn handle_output(&self, context: &OutputContext, value: &Value) -> IoManagerResult<()>;

    fn load_input(&self, context: &InputContext) -> IoManagerResult<Value>;

    /// Whether an output with this version was stored by any earlier run
    fn has_output(&self, context: &OutputContext) -> bool;
}

/// Keeps outputs in process memory; the default for tests and ephemeral instances
#[derive(Debug, Default)]
pub struct InMemoryIoManager {
    values: DashMap<String, Value>,
}

impl InMemoryIoManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn run_key(run_id: Uuid, handle: &StepOutputHandle) -> String {
        format!("{run_id}/{}", handle.storage_path())
    }

    fn version_key(version: &str) -> String {
        format!("v/{version}")
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl IoManager for InMemoryIoManager {
    fn handle_output(&self, context: &OutputContext, value: &Value) -> IoManagerResult<()> {
        self.values
            .insert(Self::run_key(context.run_id, &context.handle), value.clone());
        if let Some(version) = &context.version {
            self.values.insert(Self::version_key(version), value.clone());
        }
        Ok(())
    }

    fn load_input(&self, context: &InputContext) -> IoManagerResult<Value> {
        let upstream = &context.upstream;
        if let Some(value) = self.values.get(&Self::run_key(upstream.run_id, &upstream.handle)) {
            return Ok(value.clone());
        }
        // A memoized upstream was skipped in this run; read it by version
        upstream
            .version
            .as_ref()
            .and_then(|version| self.values.get(&Self::version_key(version)))
            .map(|value| value.clone())
            .ok_or_else(|| IoManagerError::NotFound {
                run_id: upstream.run_id,
                handle: upstream.handle.to_string(),
            })
    }

    fn has_output(&self, context: &OutputContext) -> bool {
        context
            .version
            .as_ref()
            .is_some_and(|version| self.values.contains_key(&Self::version_key(version)))
    }
}

/// Stores outputs as JSON files under a base directory.
///
/// Layout: `<base>/<run_id>/<step_key>/<output>[/<mapping_key>].json`, plus
/// `<base>/versioned/<version>.json` for versioned outputs.
#[derive(Debug, Clone)]
pub struct FilesystemIoManager {
    base_dir: PathBuf,
}

impl FilesystemIoManager {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn run_path(&self, run_id: Uuid, handle: &StepOutputHandle) -> PathBuf {
        self.base_dir
            .join(run_id.to_string())
            .join(format!("{}.json", handle.storage_path()))
    }

    fn version_path(&self, version: &str) -> PathBuf {
        self.base_dir.join("versioned").join(format!("{version}.json"))
    }

    fn write(&self, path: &Path, handle: &StepOutputHandle, value: &Value) -> IoManagerResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| IoManagerError::Io {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let bytes = serde_json::to_vec(value).map_err(|source| IoManagerError::Serialization {
            handle: handle.to_string(),
            source,
        })?;
        fs::write(path, bytes).map_err(|source| IoManagerError::Io {
            path: path.display().to_string(),
            source,
        })
    }

    fn read(&self, path: &Path, handle: &StepOutputHandle) -> IoManagerResult<Value> {
        let bytes = fs::read(path).map_err(|source| IoManagerError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|source| IoManagerError::Serialization {
            handle: handle.to_string(),
            source,
        })
    }
}

impl IoManager for FilesystemIoManager {
    fn handle_output(&self, context: &OutputContext, value: &Value) -> IoManagerResult<()> {
        self.write(&self.run_path(context.run_id, &context.handle), &context.handle, value)?;
        if let Some(version) = &context.version {
            self.write(&self.version_path(version), &context.handle, value)?;
        }
        Ok(())
    }

    fn load_input(&self, context: &InputContext) -> IoManagerResult<Value> {
        let upstream = &context.upstream;
        let run_path = self.run_path(upstream.run_id, &upstream.handle);
        if run_path.exists() {
            return self.read(&run_path, &upstream.handle);
        }
        match &upstream.version {
            Some(version) if self.version_path(version).exists() => {
                self.read(&self.version_path(version), &upstream.handle)
            }
            _ => Err(IoManagerError::NotFound {
                run_id: upstream.run_id,
                handle: upstream.handle.to_string(),
            }),
        }
    }

    fn has_output(&self, context: &OutputContext) -> bool {
        context
            .version
            .as_ref()
            .is_some_and(|version| self.version_path(version).exists())
    }
}
