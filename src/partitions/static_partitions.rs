use sha2::{Digest, Sha256};
use std::collections::HashMap;

use super::PartitionError;

/// Enumerated partitions, ordered by declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticPartitionsDefinition {
    keys: Vec<String>,
    index: HashMap<String, usize>,
}

impl StaticPartitionsDefinition {
    pub fn new<I, S>(keys: I) -> Result<Self, PartitionError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        let mut index = HashMap::with_capacity(keys.len());
        for (position, key) in keys.iter().enumerate() {
            if index.insert(key.clone(), position).is_some() {
                return Err(PartitionError::DuplicateKey(key.clone()));
            }
        }
        Ok(Self { keys, index })
    }

    pub fn get_partition_keys(&self) -> &[String] {
        &self.keys
    }

    pub fn has_partition_key(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn index_of(&self, key: &str) -> Result<usize, PartitionError> {
        self.index
            .get(key)
            .copied()
            .ok_or_else(|| PartitionError::KeyNotFound(key.to_string()))
    }

    pub fn key_at(&self, position: usize) -> Option<&str> {
        self.keys.get(position).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn get_next_partition_key(&self, key: &str) -> Result<Option<String>, PartitionError> {
        let position = self.index_of(key)?;
        Ok(self.key_at(position + 1).map(str::to_string))
    }

    /// Keys from `start_key` through `end_key` inclusive, in declaration order.
    pub fn get_partition_keys_in_range(
        &self,
        start_key: &str,
        end_key: &str,
    ) -> Result<Vec<String>, PartitionError> {
        let start = self.index_of(start_key)?;
        let end = self.index_of(end_key)?;
        if end < start {
            return Ok(Vec::new());
        }
        Ok(self.keys[start..=end].to_vec())
    }

    pub fn serializable_unique_identifier(&self) -> String {
        let mut hasher = Sha256::new();
        for key in &self.keys {
            hasher.update(key.as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }
}
