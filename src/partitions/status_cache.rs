//! Per-asset cache of materialized partitions.
//!
//! The cache value remembers the last event-log storage id it has folded in.
//! Refreshing reads only newer materializations, unless the partitions
//! definition changed, in which case the subset is rebuilt from scratch.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{PartitionsDefinition, PartitionsSubset};
use crate::error::Result;
use crate::models::AssetKey;
use crate::storage::{AssetRecordsFilter, EventLogStorage};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetStatusCacheValue {
    pub latest_storage_id: i64,
    /// Identifier of the partitions definition the subset was built against
    pub partitions_def_id: Option<String>,
    pub serialized_materialized_partition_subset: Option<String>,
}

impl AssetStatusCacheValue {
    pub fn materialized_subset(
        &self,
        partitions_def: &PartitionsDefinition,
    ) -> Result<Option<PartitionsSubset>> {
        match &self.serialized_materialized_partition_subset {
            Some(serialized) => Ok(Some(partitions_def.deserialize_subset(serialized)?)),
            None => Ok(None),
        }
    }
}

/// Fold new materializations into the cached value for `asset_key` and store it.
pub async fn get_and_update_asset_status_cache_value(
    event_log: &dyn EventLogStorage,
    asset_key: &AssetKey,
    partitions_def: Option<&PartitionsDefinition>,
) -> Result<AssetStatusCacheValue> {
    let partitions_def_id = partitions_def.map(PartitionsDefinition::serializable_unique_identifier);
    let stored = event_log
        .get_asset_status_cache_value(asset_key)
        .await?
        .filter(|value| value.partitions_def_id == partitions_def_id);

    let (cursor, subset) = match (&stored, partitions_def) {
        (Some(value), Some(def)) => (
            Some(value.latest_storage_id),
            Some(value.materialized_subset(def)?.unwrap_or_else(|| def.empty_subset())),
        ),
        (Some(value), None) => (Some(value.latest_storage_id), None),
        (None, Some(def)) => {
            info!(asset_key = %asset_key, "Rebuilding partition status cache");
            (None, Some(def.empty_subset()))
        }
        (None, None) => (None, None),
    };

    let records = event_log
        .get_records_for_asset(
            asset_key,
            &AssetRecordsFilter {
                after_storage_id: cursor,
                ..AssetRecordsFilter::default()
            },
        )
        .await?;

    let latest_storage_id = records
        .iter()
        .map(|r| r.storage_id)
        .max()
        .or(cursor)
        .unwrap_or(0);

    let subset = match (subset, partitions_def) {
        (Some(subset), Some(def)) => {
            let new_keys: Vec<&str> = records
                .iter()
                .filter_map(|r| r.partition())
                .filter(|key| def.is_valid_partition_key(key))
                .collect();
            debug!(
                asset_key = %asset_key,
                new_records = records.len(),
                new_partitions = new_keys.len(),
                "Updating partition status cache"
            );
            Some(subset.with_partition_keys(new_keys)?)
        }
        _ => None,
    };

    let value = AssetStatusCacheValue {
        latest_storage_id,
        partitions_def_id,
        serialized_materialized_partition_subset: subset.map(|s| s.serialize()),
    };
    event_log
        .update_asset_status_cache_value(asset_key, value.clone())
        .await?;
    Ok(value)
}
