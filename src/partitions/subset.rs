//! Range-based partition subsets.
//!
//! Both subset kinds keep a sorted list of disjoint, non-adjacent half-open
//! ranges, so membership and merging cost scales with the number of ranges
//! rather than the number of keys. Serialized form is a JSON array of
//! inclusive `[first_key, last_key]` pairs.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::ops::Range;

use super::cadence::TimeWindow;
use super::static_partitions::StaticPartitionsDefinition;
use super::time_window::TimeWindowPartitionsDefinition;
use super::PartitionError;

/// Sort and coalesce overlapping or touching ranges.
pub(crate) fn merge_ranges<T: Ord + Clone>(mut ranges: Vec<Range<T>>) -> Vec<Range<T>> {
    ranges.retain(|r| r.start < r.end);
    ranges.sort_by(|a, b| a.start.cmp(&b.start));

    let mut merged: Vec<Range<T>> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(last) if range.start <= last.end => {
                if range.end > last.end {
                    last.end = range.end;
                }
            }
            _ => merged.push(range),
        }
    }
    merged
}

fn range_containing<'a, T: Ord>(ranges: &'a [Range<T>], point: &T) -> Option<&'a Range<T>> {
    let idx = ranges.partition_point(|r| r.end <= *point);
    ranges.get(idx).filter(|r| r.start <= *point)
}

fn serialize_pairs(pairs: Vec<[String; 2]>) -> String {
    serde_json::Value::from(
        pairs
            .into_iter()
            .map(|[a, b]| serde_json::Value::from(vec![a, b]))
            .collect::<Vec<_>>(),
    )
    .to_string()
}

fn deserialize_pairs(serialized: &str) -> Result<Vec<[String; 2]>, PartitionError> {
    serde_json::from_str(serialized).map_err(|e| PartitionError::Serialization(e.to_string()))
}

/// Materialized (or otherwise tracked) windows of a time-window definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeWindowPartitionsSubset {
    partitions_def: TimeWindowPartitionsDefinition,
    included: Vec<Range<DateTime<Tz>>>,
}

impl TimeWindowPartitionsSubset {
    pub fn empty(partitions_def: TimeWindowPartitionsDefinition) -> Self {
        Self {
            partitions_def,
            included: Vec::new(),
        }
    }

    pub fn partitions_def(&self) -> &TimeWindowPartitionsDefinition {
        &self.partitions_def
    }

    pub fn included_time_windows(&self) -> Vec<TimeWindow> {
        self.included
            .iter()
            .map(|r| TimeWindow::new(r.start, r.end))
            .collect()
    }

    pub fn num_ranges(&self) -> usize {
        self.included.len()
    }

    /// New subset with `keys` added; fails on keys that do not parse.
    pub fn with_partition_keys<I, S>(&self, keys: I) -> Result<Self, PartitionError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut ranges = self.included.clone();
        for key in keys {
            let key = key.as_ref();
            if !self.partitions_def.is_valid_partition_key(key) {
                return Err(PartitionError::KeyNotFound(key.to_string()));
            }
            let window = self.partitions_def.time_window_for_partition_key(key)?;
            ranges.push(window.start..window.end);
        }
        Ok(Self {
            partitions_def: self.partitions_def.clone(),
            included: merge_ranges(ranges),
        })
    }

    pub fn contains(&self, key: &str) -> bool {
        match self.partitions_def.time_window_for_partition_key(key) {
            Ok(window) => range_containing(&self.included, &window.start).is_some(),
            Err(_) => false,
        }
    }

    fn windows_in(&self, range: &Range<DateTime<Tz>>) -> impl Iterator<Item = TimeWindow> + '_ {
        let end = range.end;
        self.partitions_def
            .iterate_time_windows(range.start)
            .take_while(move |w| w.end <= end)
    }

    pub fn get_partition_keys(&self) -> Vec<String> {
        self.included
            .iter()
            .flat_map(|range| self.windows_in(range).collect::<Vec<_>>())
            .map(|w| self.partitions_def.partition_key_for_window(&w))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.included.iter().map(|r| self.windows_in(r).count()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.included.is_empty()
    }

    /// Current partitions (as of `now`) that are not in the subset, oldest first.
    ///
    /// Only the gaps between ranges are walked.
    pub fn get_partition_keys_not_in_subset(&self, now: DateTime<Utc>) -> Vec<String> {
        let Some(cutoff) = self.partitions_def.partitions_cutoff(now) else {
            return Vec::new();
        };
        let first = self.partitions_def.start();

        let mut gaps: Vec<Range<DateTime<Tz>>> = Vec::with_capacity(self.included.len() + 1);
        let mut cursor = first;
        for range in &self.included {
            if range.start > cursor {
                gaps.push(cursor..range.start);
            }
            cursor = std::cmp::max(cursor, range.end);
        }
        gaps.push(cursor..cutoff);

        gaps.into_iter()
            .filter(|gap| gap.start < gap.end)
            .flat_map(|gap| {
                let end = std::cmp::min(gap.end, cutoff);
                self.partitions_def
                    .iterate_time_windows(gap.start)
                    .take_while(move |w| w.end <= end)
                    .collect::<Vec<_>>()
            })
            .map(|w| self.partitions_def.partition_key_for_window(&w))
            .collect()
    }

    pub fn serialize(&self) -> String {
        let pairs = self
            .included
            .iter()
            .filter_map(|range| {
                let last_start = self.partitions_def.previous_tick(&range.end)?;
                Some([
                    self.partitions_def
                        .partition_key_for_window(&TimeWindow::new(range.start, range.end)),
                    self.partitions_def
                        .partition_key_for_window(&TimeWindow::new(last_start, range.end)),
                ])
            })
            .collect();
        serialize_pairs(pairs)
    }

    pub fn from_serialized(
        partitions_def: TimeWindowPartitionsDefinition,
        serialized: &str,
    ) -> Result<Self, PartitionError> {
        let mut ranges = Vec::new();
        for [first_key, last_key] in deserialize_pairs(serialized)? {
            let first = partitions_def.time_window_for_partition_key(&first_key)?;
            let last = partitions_def.time_window_for_partition_key(&last_key)?;
            ranges.push(first.start..last.end);
        }
        Ok(Self {
            partitions_def,
            included: merge_ranges(ranges),
        })
    }
}

/// Tracked keys of a static definition, as ranges of declaration positions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticPartitionsSubset {
    partitions_def: StaticPartitionsDefinition,
    included: Vec<Range<usize>>,
}

impl StaticPartitionsSubset {
    pub fn empty(partitions_def: StaticPartitionsDefinition) -> Self {
        Self {
            partitions_def,
            included: Vec::new(),
        }
    }

    pub fn partitions_def(&self) -> &StaticPartitionsDefinition {
        &self.partitions_def
    }

    pub fn num_ranges(&self) -> usize {
        self.included.len()
    }

    pub fn with_partition_keys<I, S>(&self, keys: I) -> Result<Self, PartitionError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut ranges = self.included.clone();
        for key in keys {
            let position = self.partitions_def.index_of(key.as_ref())?;
            ranges.push(position..position + 1);
        }
        Ok(Self {
            partitions_def: self.partitions_def.clone(),
            included: merge_ranges(ranges),
        })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.partitions_def
            .index_of(key)
            .map(|position| range_containing(&self.included, &position).is_some())
            .unwrap_or(false)
    }

    pub fn get_partition_keys(&self) -> Vec<String> {
        let keys = self.partitions_def.get_partition_keys();
        self.included
            .iter()
            .flat_map(|r| keys[r.clone()].iter().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.included.iter().map(|r| r.end - r.start).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.included.is_empty()
    }

    pub fn get_partition_keys_not_in_subset(&self) -> Vec<String> {
        let keys = self.partitions_def.get_partition_keys();
        let mut missing = Vec::new();
        let mut cursor = 0;
        for range in &self.included {
            missing.extend(keys[cursor..range.start].iter().cloned());
            cursor = range.end;
        }
        missing.extend(keys[cursor..].iter().cloned());
        missing
    }

    pub fn serialize(&self) -> String {
        let pairs = self
            .included
            .iter()
            .filter_map(|r| {
                Some([
                    self.partitions_def.key_at(r.start)?.to_string(),
                    self.partitions_def.key_at(r.end - 1)?.to_string(),
                ])
            })
            .collect();
        serialize_pairs(pairs)
    }

    pub fn from_serialized(
        partitions_def: StaticPartitionsDefinition,
        serialized: &str,
    ) -> Result<Self, PartitionError> {
        let mut ranges = Vec::new();
        for [first_key, last_key] in deserialize_pairs(serialized)? {
            let first = partitions_def.index_of(&first_key)?;
            let last = partitions_def.index_of(&last_key)?;
            ranges.push(first..last + 1);
        }
        Ok(Self {
            partitions_def,
            included: merge_ranges(ranges),
        })
    }
}
