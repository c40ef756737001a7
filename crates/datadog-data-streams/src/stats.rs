// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Time-bucketed aggregation of stats points and backlogs.
//!
//! A bucket covers `[start, start + duration)` and holds one [`StatsGroup`] per pathway hash seen
//! in that window. Buckets are owned by the consumer task only, so nothing here is synchronized.

use hashbrown::hash_map::Entry;
use hashbrown::HashMap;

use crate::constants::NANOS_PER_SECOND;
use crate::errors::AggregationError;
use crate::histogram::LogHistogram;
use crate::pathway::StatsPoint;

/// A point-in-time queue depth sample (e.g. a committed Kafka offset).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Backlog {
    pub tags: Vec<String>,
    pub value: i64,
    pub timestamp_nanos: i64,
}

/// Start of the bucket containing `timestamp_nanos`.
///
/// # Errors
///
/// Negative timestamps and non-positive durations cannot be bucketed.
pub fn bucket_key(timestamp_nanos: i64, duration_nanos: i64) -> Result<i64, AggregationError> {
    if duration_nanos <= 0 {
        return Err(AggregationError::InvalidBucketDuration);
    }
    if timestamp_nanos < 0 {
        return Err(AggregationError::NegativeTimestamp(timestamp_nanos));
    }
    Ok(timestamp_nanos - (timestamp_nanos % duration_nanos))
}

fn check_latencies(pathway_latency_nanos: i64, edge_latency_nanos: i64) -> Result<(), AggregationError> {
    for (kind, value) in [("pathway", pathway_latency_nanos), ("edge", edge_latency_nanos)] {
        if value < 0 {
            return Err(AggregationError::NegativeLatency { kind, value });
        }
    }
    Ok(())
}

#[allow(clippy::cast_precision_loss)]
fn nanos_to_seconds(nanos: i64) -> f64 {
    nanos as f64 / NANOS_PER_SECOND as f64
}

/// Latency and payload distributions for one pathway hash.
#[derive(Debug)]
pub struct StatsGroup {
    edge_tags: Vec<String>,
    hash: u64,
    parent_hash: u64,
    pathway_latency: LogHistogram,
    edge_latency: LogHistogram,
    payload_size: LogHistogram,
}

impl StatsGroup {
    #[must_use]
    pub fn new(edge_tags: Vec<String>, hash: u64, parent_hash: u64) -> Self {
        Self {
            edge_tags,
            hash,
            parent_hash,
            pathway_latency: LogHistogram::new(),
            edge_latency: LogHistogram::new(),
            payload_size: LogHistogram::new(),
        }
    }

    /// Records one observation. A payload size of 0 means unknown and is not recorded.
    ///
    /// # Errors
    ///
    /// Rejects negative latencies without recording anything.
    pub fn add(
        &mut self,
        pathway_latency_nanos: i64,
        edge_latency_nanos: i64,
        payload_size_bytes: i64,
    ) -> Result<(), AggregationError> {
        check_latencies(pathway_latency_nanos, edge_latency_nanos)?;
        self.pathway_latency
            .accept(nanos_to_seconds(pathway_latency_nanos));
        self.edge_latency.accept(nanos_to_seconds(edge_latency_nanos));
        if payload_size_bytes != 0 {
            #[allow(clippy::cast_precision_loss)]
            self.payload_size.accept(payload_size_bytes as f64);
        }
        Ok(())
    }

    #[must_use]
    pub fn edge_tags(&self) -> &[String] {
        &self.edge_tags
    }

    #[must_use]
    pub fn hash(&self) -> u64 {
        self.hash
    }

    #[must_use]
    pub fn parent_hash(&self) -> u64 {
        self.parent_hash
    }

    #[must_use]
    pub fn pathway_latency(&self) -> &LogHistogram {
        &self.pathway_latency
    }

    #[must_use]
    pub fn edge_latency(&self) -> &LogHistogram {
        &self.edge_latency
    }

    #[must_use]
    pub fn payload_size(&self) -> &LogHistogram {
        &self.payload_size
    }
}

#[derive(Debug)]
pub struct StatsBucket {
    start_time_nanos: i64,
    duration_nanos: i64,
    groups: HashMap<u64, StatsGroup>,
    backlogs: Vec<(Vec<String>, i64)>,
}

impl StatsBucket {
    #[must_use]
    pub fn new(start_time_nanos: i64, duration_nanos: i64) -> Self {
        Self {
            start_time_nanos,
            duration_nanos,
            groups: HashMap::new(),
            backlogs: Vec::new(),
        }
    }

    /// Adds the point to the group for its hash, creating the group on first sight.
    ///
    /// # Errors
    ///
    /// Rejects points with negative latencies, leaving the bucket untouched.
    pub fn add_point(&mut self, point: StatsPoint) -> Result<(), AggregationError> {
        check_latencies(point.pathway_latency_nanos, point.edge_latency_nanos)?;
        let StatsPoint {
            edge_tags,
            hash,
            parent_hash,
            pathway_latency_nanos,
            edge_latency_nanos,
            payload_size_bytes,
            ..
        } = point;
        self.groups
            .entry(hash)
            .or_insert_with(|| StatsGroup::new(edge_tags, hash, parent_hash))
            .add(pathway_latency_nanos, edge_latency_nanos, payload_size_bytes)
    }

    pub fn add_backlog(&mut self, backlog: Backlog) {
        self.backlogs.push((backlog.tags, backlog.value));
    }

    #[must_use]
    pub fn start_time_nanos(&self) -> i64 {
        self.start_time_nanos
    }

    #[must_use]
    pub fn duration_nanos(&self) -> i64 {
        self.duration_nanos
    }

    pub fn groups(&self) -> impl Iterator<Item = &StatsGroup> {
        self.groups.values()
    }

    #[must_use]
    pub fn group(&self, hash: u64) -> Option<&StatsGroup> {
        self.groups.get(&hash)
    }

    #[must_use]
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    #[must_use]
    pub fn backlogs(&self) -> &[(Vec<String>, i64)] {
        &self.backlogs
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty() && self.backlogs.is_empty()
    }
}

/// Buckets keyed by start time, as kept by the consumer between flushes.
#[derive(Debug)]
pub struct BucketMap {
    duration_nanos: i64,
    buckets: HashMap<i64, StatsBucket>,
}

impl BucketMap {
    /// # Errors
    ///
    /// `AggregationError::InvalidBucketDuration` unless the duration is positive.
    pub fn new(duration_nanos: i64) -> Result<Self, AggregationError> {
        if duration_nanos <= 0 {
            return Err(AggregationError::InvalidBucketDuration);
        }
        Ok(Self {
            duration_nanos,
            buckets: HashMap::new(),
        })
    }

    #[must_use]
    pub fn duration_nanos(&self) -> i64 {
        self.duration_nanos
    }

    /// # Errors
    ///
    /// The point cannot be bucketed; no bucket is created for it.
    pub fn add_point(&mut self, point: StatsPoint) -> Result<(), AggregationError> {
        let key = bucket_key(point.timestamp_nanos, self.duration_nanos)?;
        match self.buckets.entry(key) {
            Entry::Occupied(entry) => entry.into_mut().add_point(point),
            Entry::Vacant(entry) => {
                let mut bucket = StatsBucket::new(key, self.duration_nanos);
                bucket.add_point(point)?;
                entry.insert(bucket);
                Ok(())
            }
        }
    }

    /// # Errors
    ///
    /// The backlog timestamp cannot be bucketed.
    pub fn add_backlog(&mut self, backlog: Backlog) -> Result<(), AggregationError> {
        let key = bucket_key(backlog.timestamp_nanos, self.duration_nanos)?;
        let duration_nanos = self.duration_nanos;
        self.buckets
            .entry(key)
            .or_insert_with(|| StatsBucket::new(key, duration_nanos))
            .add_backlog(backlog);
        Ok(())
    }

    /// Removes and returns, oldest first, the buckets that started strictly before `current_bucket`.
    pub fn take_before(&mut self, current_bucket: i64) -> Vec<StatsBucket> {
        let mut keys: Vec<i64> = self
            .buckets
            .keys()
            .copied()
            .filter(|key| *key < current_bucket)
            .collect();
        keys.sort_unstable();
        keys.into_iter()
            .filter_map(|key| self.buckets.remove(&key))
            .collect()
    }

    /// Removes and returns every bucket, oldest first.
    pub fn take_all(&mut self) -> Vec<StatsBucket> {
        self.take_before(i64::MAX)
            .into_iter()
            .chain(self.buckets.remove(&i64::MAX))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn point(hash: u64, parent_hash: u64, payload_size_bytes: i64) -> StatsPoint {
        StatsPoint {
            edge_tags: vec!["type:kafka".to_string(), "direction:out".to_string()],
            hash,
            parent_hash,
            timestamp_nanos: 0,
            pathway_latency_nanos: 2_000_000_000,
            edge_latency_nanos: 500_000_000,
            payload_size_bytes,
        }
    }

    #[test]
    fn test_bucket_key() {
        let keys: Vec<i64> = [0, 5, 9, 10, 15]
            .iter()
            .map(|t| bucket_key(*t, 10).unwrap())
            .collect();
        assert_eq!(keys, vec![0, 0, 0, 10, 10]);
    }

    #[test]
    fn test_bucket_key_rejects_invalid_input() {
        assert_eq!(
            bucket_key(-1, 10),
            Err(AggregationError::NegativeTimestamp(-1))
        );
        assert_eq!(
            bucket_key(5, 0),
            Err(AggregationError::InvalidBucketDuration)
        );
    }

    #[test]
    fn test_group_converts_latencies_to_seconds() {
        let mut group = StatsGroup::new(vec![], 1, 0);
        group.add(2_000_000_000, 500_000_000, 0).unwrap();

        let pathway = group.pathway_latency().quantile(1.0).unwrap();
        let edge = group.edge_latency().quantile(1.0).unwrap();
        assert!((pathway - 2.0).abs() < 0.05, "pathway {pathway}");
        assert!((edge - 0.5).abs() < 0.02, "edge {edge}");
    }

    #[test]
    fn test_zero_payload_size_is_not_recorded() {
        let mut group = StatsGroup::new(vec![], 1, 0);
        group.add(10, 10, 0).unwrap();
        assert!(group.payload_size().is_empty());
        assert_eq!(group.pathway_latency().count(), 1);

        group.add(10, 10, 100).unwrap();
        assert_eq!(group.payload_size().count(), 1);
    }

    #[test]
    fn test_group_rejects_negative_latency() {
        let mut group = StatsGroup::new(vec![], 1, 0);
        assert_eq!(
            group.add(-1, 0, 0),
            Err(AggregationError::NegativeLatency {
                kind: "pathway",
                value: -1
            })
        );
        assert!(group.add(0, -3, 0).is_err());
        assert!(group.pathway_latency().is_empty());
    }

    #[test]
    fn test_bucket_groups_points_by_hash() {
        let mut bucket = StatsBucket::new(0, 10);
        bucket.add_point(point(1, 0, 100)).unwrap();
        bucket.add_point(point(1, 0, 200)).unwrap();
        bucket.add_point(point(2, 1, 0)).unwrap();

        assert_eq!(bucket.group_count(), 2);
        let first = bucket.group(1).unwrap();
        assert_eq!(first.payload_size().count(), 2);
        assert_eq!(first.edge_tags(), ["type:kafka", "direction:out"]);
        assert_eq!(bucket.group(2).unwrap().parent_hash(), 1);
    }

    #[test]
    fn test_bucket_rejects_point_without_creating_group() {
        let mut bucket = StatsBucket::new(0, 10);
        let mut bad = point(1, 0, 100);
        bad.edge_latency_nanos = -1;
        assert!(bucket.add_point(bad).is_err());
        assert!(bucket.is_empty());
    }

    #[test]
    fn test_bucket_collects_backlogs_without_dedup() {
        let mut bucket = StatsBucket::new(0, 10);
        assert!(bucket.is_empty());
        for value in [5, 7] {
            bucket.add_backlog(Backlog {
                tags: vec!["partition:0".to_string(), "type:kafka_commit".to_string()],
                value,
                timestamp_nanos: 3,
            });
        }
        assert_eq!(bucket.backlogs().len(), 2);
        assert_eq!(bucket.backlogs()[1].1, 7);
        assert!(!bucket.is_empty());
    }
    fn point_at(timestamp_nanos: i64, hash: u64) -> StatsPoint {
        StatsPoint {
            timestamp_nanos,
            ..point(hash, 0, 10)
        }
    }

    fn starts(buckets: &[StatsBucket]) -> Vec<i64> {
        buckets.iter().map(StatsBucket::start_time_nanos).collect()
    }

    #[test]
    fn test_bucket_map_assigns_points_by_window() {
        let mut map = BucketMap::new(10).unwrap();
        for (t, hash) in [(0, 1), (5, 2), (9, 3), (10, 4), (15, 5)] {
            map.add_point(point_at(t, hash)).unwrap();
        }
        assert_eq!(map.len(), 2);
        let buckets = map.take_all();
        assert_eq!(starts(&buckets), vec![0, 10]);
        assert_eq!(buckets[0].group_count(), 3);
        assert_eq!(buckets[1].group_count(), 2);
    }

    #[test]
    fn test_take_before_only_returns_past_buckets() {
        let mut map = BucketMap::new(10).unwrap();
        for t in [0, 5, 9, 10, 15, 20, 25] {
            map.add_point(point_at(t, 1)).unwrap();
        }

        assert!(map.take_before(0).is_empty());
        assert_eq!(map.len(), 3);

        assert_eq!(starts(&map.take_before(20)), vec![0, 10]);
        assert_eq!(map.len(), 1);

        assert_eq!(starts(&map.take_all()), vec![20]);
        assert!(map.is_empty());
    }

    #[test]
    fn test_bucket_map_rejects_invalid_points() {
        assert_eq!(
            BucketMap::new(0).unwrap_err(),
            AggregationError::InvalidBucketDuration
        );
        let mut map = BucketMap::new(10).unwrap();
        assert!(map.add_point(point_at(-5, 1)).is_err());
        let mut negative = point_at(5, 1);
        negative.pathway_latency_nanos = -1;
        assert!(map.add_point(negative).is_err());
        assert!(map.is_empty());

        map.add_point(point_at(5, 1)).unwrap();
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_bucket_map_backlogs() {
        let mut map = BucketMap::new(10).unwrap();
        map.add_backlog(Backlog {
            tags: vec!["type:kafka_commit".to_string()],
            value: 12,
            timestamp_nanos: 13,
        })
        .unwrap();
        let buckets = map.take_all();
        assert_eq!(starts(&buckets), vec![10]);
        assert_eq!(buckets[0].backlogs()[0].1, 12);
    }
}
