//! Time-window and static partition definitions

use dagflow_core::partitions::{PartitionsDefinition, StaticPartitionsDefinition, TimeWindowPartitionsDefinition};

use crate::common::utc;

#[test]
fn test_daily_partitions_before_the_current_day() {
    let partitions = TimeWindowPartitionsDefinition::daily("2021-05-05").unwrap();
    let now = utc(2021, 5, 7, 0);

    let windows: Vec<_> = partitions.time_windows(now).collect();
    assert_eq!(windows.len(), 2);
    assert_eq!(windows[0].start.naive_utc(), utc(2021, 5, 5, 0).naive_utc());
    assert_eq!(windows[0].end.naive_utc(), utc(2021, 5, 6, 0).naive_utc());
    assert_eq!(windows[1].start.naive_utc(), utc(2021, 5, 6, 0).naive_utc());
    assert_eq!(windows[1].end.naive_utc(), utc(2021, 5, 7, 0).naive_utc());

    assert_eq!(partitions.get_partition_keys(now), vec!["2021-05-05", "2021-05-06"]);
}

#[test]
fn test_partition_lookup_by_timestamp() {
    let partitions = TimeWindowPartitionsDefinition::daily("2021-05-05").unwrap();

    assert_eq!(
        partitions.partition_key_for_timestamp(utc(2021, 5, 6, 13), false).as_deref(),
        Some("2021-05-06")
    );
    // A tick on the boundary belongs to the window that just closed
    assert_eq!(
        partitions.partition_key_for_timestamp(utc(2021, 5, 7, 0), true).as_deref(),
        Some("2021-05-06")
    );
    assert_eq!(
        partitions.partition_key_for_timestamp(utc(2021, 5, 7, 0), false).as_deref(),
        Some("2021-05-07")
    );
    assert_eq!(partitions.partition_key_for_timestamp(utc(2021, 5, 1, 0), false), None);
}

#[test]
fn test_next_key_stops_at_the_last_complete_window() {
    let partitions = TimeWindowPartitionsDefinition::daily("2021-05-05").unwrap();
    let now = utc(2021, 5, 7, 12);

    assert_eq!(
        partitions.get_next_partition_key("2021-05-05", now).unwrap().as_deref(),
        Some("2021-05-06")
    );
    assert_eq!(partitions.get_next_partition_key("2021-05-06", now).unwrap(), None);
    assert!(partitions.less_than("2021-05-05", "2021-05-06").unwrap());
    assert!(partitions.get_next_partition_key("not-a-day", now).is_err());

    let last = partitions.get_last_partition_window(now).unwrap();
    assert_eq!(partitions.partition_key_for_window(&last), "2021-05-06");
}

#[test]
fn test_keys_in_range_are_inclusive() {
    let partitions = PartitionsDefinition::from(TimeWindowPartitionsDefinition::daily("2021-05-01").unwrap());
    let keys = partitions
        .get_partition_keys_in_range("2021-05-03", "2021-05-05", utc(2021, 6, 1, 0))
        .unwrap();
    assert_eq!(keys, vec!["2021-05-03", "2021-05-04", "2021-05-05"]);
    assert!(partitions.is_valid_partition_key("2021-05-20"));
    assert!(!partitions.has_partition_key("2021-05-20", utc(2021, 5, 10, 0)));
}

#[test]
fn test_static_partitions_keep_declaration_order() {
    let partitions = StaticPartitionsDefinition::new(["us", "eu", "apac"]).unwrap();
    assert_eq!(partitions.get_partition_keys(), ["us", "eu", "apac"]);
    assert_eq!(partitions.get_next_partition_key("us").unwrap().as_deref(), Some("eu"));
    assert_eq!(partitions.get_next_partition_key("apac").unwrap(), None);
    assert!(StaticPartitionsDefinition::new(["us", "us"]).is_err());
}

#[test]
fn test_identifier_changes_with_definition() {
    let first = TimeWindowPartitionsDefinition::daily("2021-05-05").unwrap();
    let same = TimeWindowPartitionsDefinition::daily("2021-05-05").unwrap();
    let later = TimeWindowPartitionsDefinition::daily("2021-05-06").unwrap();
    let hourly = TimeWindowPartitionsDefinition::hourly("2021-05-05-00:00").unwrap();

    assert_eq!(first.serializable_unique_identifier(), same.serializable_unique_identifier());
    assert_ne!(first.serializable_unique_identifier(), later.serializable_unique_identifier());
    assert_ne!(first.serializable_unique_identifier(), hourly.serializable_unique_identifier());
}
