use serde::{Deserialize, Serialize};
use std::fmt;

/// Hierarchical name of a data asset, e.g. `["warehouse", "orders"]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssetKey(pub Vec<String>);

impl AssetKey {
    pub fn new<I, S>(path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(path.into_iter().map(Into::into).collect())
    }

    /// Parse a `/`-separated user string
    pub fn from_user_string(value: &str) -> Self {
        Self::new(value.split('/'))
    }

    pub fn to_user_string(&self) -> String {
        self.0.join("/")
    }

    pub fn path(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for AssetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_user_string())
    }
}

impl From<&str> for AssetKey {
    fn from(value: &str) -> Self {
        Self::from_user_string(value)
    }
}
