//! Proptest strategies for versions, partition keys and step graphs

#![allow(dead_code)]

use chrono::{Duration, NaiveDate};
use proptest::prelude::*;

/// Opaque version strings as produced by users and by hashing
pub fn version_strategy() -> impl Strategy<Value = String> {
    prop_oneof!["[a-z0-9]{1,12}", "[0-9a-f]{64}"]
}

/// Named upstream versions with distinct names
pub fn named_versions_strategy() -> impl Strategy<Value = Vec<(String, String)>> {
    prop::collection::btree_map("[a-z_]{1,8}", version_strategy(), 1..6)
        .prop_map(|versions| versions.into_iter().collect())
}

/// Day offsets from the start of a daily partitions definition
pub fn day_offsets_strategy(max_day: i64) -> impl Strategy<Value = Vec<i64>> {
    prop::collection::vec(0..max_day, 0..40)
}

/// Daily partition keys, mixing valid days with malformed keys
pub fn daily_keys_strategy(start: NaiveDate, max_day: i64) -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec(
        prop_oneof![
            4 => (0..max_day).prop_map(move |offset| (start + Duration::days(offset)).format("%Y-%m-%d").to_string()),
            1 => "[a-z]{3,6}",
            1 => Just("2020-13-40".to_string()),
        ],
        0..30,
    )
}

/// Edges `(upstream, downstream)` with `upstream < downstream`, so every graph is acyclic
pub fn dag_edges_strategy(nodes: usize) -> impl Strategy<Value = Vec<(usize, usize)>> {
    prop::collection::vec((0..nodes, 0..nodes), 0..(nodes * 2)).prop_map(|pairs| {
        let mut edges: Vec<(usize, usize)> = pairs
            .into_iter()
            .filter(|(a, b)| a != b)
            .map(|(a, b)| (a.min(b), a.max(b)))
            .collect();
        edges.sort_unstable();
        edges.dedup();
        edges
    })
}
