use serde::{Deserialize, Serialize};
use std::fmt;

/// Address of one materialized step output.
///
/// `mapping_key` distinguishes the branches of a dynamic output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepOutputHandle {
    pub step_key: String,
    pub output_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping_key: Option<String>,
}

impl StepOutputHandle {
    pub fn new(step_key: impl Into<String>, output_name: impl Into<String>) -> Self {
        Self {
            step_key: step_key.into(),
            output_name: output_name.into(),
            mapping_key: None,
        }
    }

    pub fn mapped(
        step_key: impl Into<String>,
        output_name: impl Into<String>,
        mapping_key: impl Into<String>,
    ) -> Self {
        Self {
            step_key: step_key.into(),
            output_name: output_name.into(),
            mapping_key: Some(mapping_key.into()),
        }
    }

    /// Slash-joined path, used as a storage key for unversioned outputs
    pub fn storage_path(&self) -> String {
        match &self.mapping_key {
            Some(mapping_key) => format!("{}/{}/{}", self.step_key, self.output_name, mapping_key),
            None => format!("{}/{}", self.step_key, self.output_name),
        }
    }
}

impl fmt::Display for StepOutputHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.mapping_key {
            Some(mapping_key) => write!(f, "{}.{}[{}]", self.step_key, self.output_name, mapping_key),
            None => write!(f, "{}.{}", self.step_key, self.output_name),
        }
    }
}

/// Step key of a mapped step: `name[mapping_key]`
pub fn mapped_step_key(base: &str, mapping_key: &str) -> String {
    format!("{base}[{mapping_key}]")
}

/// Split `name[key]` into `("name", Some("key"))`
pub fn split_step_key(step_key: &str) -> (&str, Option<&str>) {
    match step_key.strip_suffix(']').and_then(|s| s.split_once('[')) {
        Some((base, key)) => (base, Some(key)),
        None => (step_key, None),
    }
}
