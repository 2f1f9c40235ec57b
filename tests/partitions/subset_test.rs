//! Partition subsets and the asset status cache

use chrono::NaiveDate;
use dagflow_core::constants::tags;
use dagflow_core::definitions::{JobDefinition, OutputDefinition, StepDefinition};
use dagflow_core::models::{AssetKey, Run};
use dagflow_core::partitions::{
    get_and_update_asset_status_cache_value, PartitionsDefinition, StaticPartitionsDefinition,
    TimeWindowPartitionsDefinition,
};
use dagflow_core::RunStatus;
use proptest::prelude::*;
use serde_json::{json, Value};

use crate::common::{daily_keys_strategy, instance, utc, RUN_TIMEOUT};

fn daily() -> PartitionsDefinition {
    TimeWindowPartitionsDefinition::daily("2021-05-01").unwrap().into()
}

#[test]
fn test_adjacent_keys_collapse_into_one_range() {
    let subset = daily()
        .empty_subset()
        .with_partition_keys(["2021-05-03", "2021-05-01", "2021-05-02", "2021-05-07"])
        .unwrap();

    assert_eq!(subset.num_ranges(), 2);
    assert_eq!(subset.len(), 4);
    assert_eq!(subset.serialize(), r#"[["2021-05-01","2021-05-03"],["2021-05-07","2021-05-07"]]"#);
    assert_eq!(
        subset.get_partition_keys_not_in_subset(utc(2021, 5, 9, 0)),
        vec!["2021-05-04", "2021-05-05", "2021-05-06", "2021-05-08"]
    );
}

#[test]
fn test_unknown_keys_are_rejected() {
    let subset = daily().empty_subset();
    assert!(subset.with_partition_keys(["yesterday"]).is_err());

    let regions = PartitionsDefinition::from(StaticPartitionsDefinition::new(["us", "eu"]).unwrap());
    assert!(regions.empty_subset().with_partition_keys(["apac"]).is_err());
}

#[test]
fn test_static_subset_round_trip() {
    let regions = PartitionsDefinition::from(StaticPartitionsDefinition::new(["us", "eu", "apac", "latam"]).unwrap());
    let subset = regions.empty_subset().with_partition_keys(["eu", "us", "latam"]).unwrap();

    assert_eq!(subset.num_ranges(), 2);
    assert_eq!(subset.get_partition_keys(), vec!["us", "eu", "latam"]);
    assert_eq!(subset.get_partition_keys_not_in_subset(utc(2021, 5, 1, 0)), vec!["apac"]);
    assert_eq!(regions.deserialize_subset(&subset.serialize()).unwrap(), subset);
}

#[tokio::test]
async fn test_status_cache_tracks_materialized_partitions() {
    let partitions = TimeWindowPartitionsDefinition::daily("2021-05-01").unwrap();
    let job = JobDefinition::builder("daily_sales")
        .step(
            StepDefinition::new("sales", |ctx, _| {
                let partition = ctx.partition_key().unwrap_or_default().to_string();
                ctx.output("result", json!({ "day": partition }));
                Ok(())
            })
            .with_output(OutputDefinition::new("result").with_asset(AssetKey::from("sales")))
            .with_code_version("1"),
        )
        .partitions(partitions.clone())
        .build()
        .unwrap();
    let instance = instance(vec![job]);

    for day in ["2021-05-02", "2021-05-03"] {
        let run = instance
            .launch_run(Run::new("daily_sales", Value::Null).with_tag(tags::PARTITION, day))
            .await
            .unwrap();
        let run = instance.wait_for_run(run.run_id, RUN_TIMEOUT).await.unwrap();
        assert_eq!(run.status, RunStatus::Success);
    }

    let definition = PartitionsDefinition::from(partitions);
    let value = get_and_update_asset_status_cache_value(
        instance.event_log().as_ref(),
        &AssetKey::from("sales"),
        Some(&definition),
    )
    .await
    .unwrap();
    let subset = value.materialized_subset(&definition).unwrap().unwrap();
    assert_eq!(subset.get_partition_keys(), vec!["2021-05-02", "2021-05-03"]);
    assert!(value.latest_storage_id > 0);

    // Refreshing without new events keeps the same value
    let refreshed = get_and_update_asset_status_cache_value(
        instance.event_log().as_ref(),
        &AssetKey::from("sales"),
        Some(&definition),
    )
    .await
    .unwrap();
    assert_eq!(refreshed, value);
}

proptest! {
    /// Missing keys after adding exclude exactly the valid added keys
    #[test]
    fn keys_not_in_subset_exclude_added_keys(
        keys in daily_keys_strategy(NaiveDate::from_ymd_opt(2021, 5, 1).unwrap(), 60)
    ) {
        let definition = daily();
        let now = utc(2021, 7, 1, 0);
        let valid: Vec<String> = keys
            .iter()
            .filter(|key| definition.has_partition_key(key, now))
            .cloned()
            .collect();

        let subset = definition.empty_subset().with_partition_keys(&valid).unwrap();
        let missing = subset.get_partition_keys_not_in_subset(now);
        let all = definition.get_partition_keys(now);

        for key in &all {
            prop_assert_eq!(missing.contains(key), !valid.contains(key), "key {}", key);
        }
        prop_assert_eq!(missing.len() + subset.len(), all.len());
    }

    /// Serialized subsets deserialize to the same subset
    #[test]
    fn subsets_survive_serialization(
        keys in daily_keys_strategy(NaiveDate::from_ymd_opt(2021, 5, 1).unwrap(), 60)
    ) {
        let definition = daily();
        let valid: Vec<&String> = keys.iter().filter(|key| definition.is_valid_partition_key(key)).collect();
        let subset = definition.empty_subset().with_partition_keys(valid).unwrap();
        let restored = definition.deserialize_subset(&subset.serialize()).unwrap();
        prop_assert_eq!(restored, subset);
    }
}
