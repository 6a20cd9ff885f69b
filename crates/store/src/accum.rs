//! Durable view-model state for one sub-query: rows plus counters, and the histogram.

use std::collections::BTreeMap;

use serde::{Serialize, Serializer};
use sluice_core::{OrderBy, Record, TimeOffset};

/// Field name with the number of rows it appeared in.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FieldSummary {
    pub name: String,
    pub count: u64,
}

/// Error recorded against one sub-query; siblings keep running.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct QueryError {
    pub code: Option<u16>,
    pub message: String,
    /// Display form: truncated, with trace id appended.
    pub display: String,
    /// Nothing had arrived before the failure; the caller should block on it.
    pub fatal: bool,
}

#[derive(Debug, Clone, Serialize, Default, PartialEq)]
pub struct ResultAccumulator {
    pub hits: Vec<Record>,
    pub total: u64,
    /// Execution time in milliseconds, summed over partitions.
    pub took: u64,
    /// Bytes scanned, summed over partitions.
    pub scan_size: u64,
    pub streaming_aggs: bool,
    pub order_by: OrderBy,
    /// Seconds.
    pub histogram_interval: Option<i64>,
    pub page_count_total: Option<u64>,
    pub is_histogram_eligible: bool,
    pub function_error: Option<String>,
    pub time_offset: Option<TimeOffset>,
    pub is_partial: bool,
    pub cancelled: bool,
    pub pattern_result: Option<serde_json::Value>,
    pub fields: Vec<FieldSummary>,
    pub error: Option<QueryError>,
}

impl ResultAccumulator {
    pub fn replace_hits(&mut self, hits: Vec<Record>) { self.hits = hits; }

    pub fn append_hits(&mut self, hits: Vec<Record>) { self.hits.extend(hits); }

    pub fn prepend_hits(&mut self, mut hits: Vec<Record>) {
        hits.append(&mut self.hits);
        self.hits = hits;
    }

    /// Drop rows beyond `len`; returns how many were removed.
    pub fn truncate_hits(&mut self, len: usize) -> usize {
        let before = self.hits.len();
        self.hits.truncate(len);
        before - self.hits.len()
    }
}

/// One time bucket. `bucket_start` is microseconds since the epoch.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct Bucket {
    pub bucket_start: i64,
    pub count: u64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
pub enum HistogramState {
    /// Waiting for the first non-empty payload.
    #[default]
    Pending,
    Ready,
    /// Backfill was impossible (no interval); left loading.
    Stalled,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HistogramError {
    pub code: Option<u16>,
    pub message: String,
}

fn series_as_buckets<S: Serializer>(series: &BTreeMap<i64, u64>, s: S) -> Result<S::Ok, S::Error> {
    s.collect_seq(series.iter().map(|(k, v)| Bucket { bucket_start: *k, count: *v }))
}

#[derive(Debug, Clone, Serialize, Default, PartialEq)]
pub struct HistogramAccumulator {
    /// Gap-free series keyed by bucket start; one entry per key.
    #[serde(rename = "buckets", serialize_with = "series_as_buckets")]
    series: BTreeMap<i64, u64>,
    /// Real buckets as delivered, in partition order (asc prepends, desc appends).
    pub partition_buckets: Vec<Bucket>,
    /// Seconds.
    pub interval: Option<i64>,
    pub chart_title: String,
    pub error: Option<HistogramError>,
    pub state: HistogramState,
    pub took: u64,
    pub scan_size: u64,
}

impl HistogramAccumulator {
    pub fn is_seeded(&self) -> bool { !self.series.is_empty() }

    pub fn len(&self) -> usize { self.series.len() }

    pub fn is_empty(&self) -> bool { self.series.is_empty() }

    /// Insert zero buckets for keys not yet present.
    pub fn seed<I: IntoIterator<Item = i64>>(&mut self, keys: I) {
        for k in keys {
            self.series.entry(k).or_insert(0);
        }
    }

    /// Last write wins per key.
    pub fn merge(&mut self, bucket: Bucket) { self.series.insert(bucket.bucket_start, bucket.count); }

    pub fn count_at(&self, bucket_start: i64) -> Option<u64> { self.series.get(&bucket_start).copied() }

    pub fn buckets(&self) -> Vec<Bucket> {
        self.series.iter().map(|(k, v)| Bucket { bucket_start: *k, count: *v }).collect()
    }

    pub fn total(&self) -> u64 { self.series.values().sum() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn prepend_and_append_keep_relative_order() {
        let mut acc = ResultAccumulator::default();
        acc.replace_hits(vec![json!("A"), json!("B")]);
        acc.append_hits(vec![json!("C")]);
        acc.prepend_hits(vec![json!("Z")]);
        assert_eq!(acc.hits, vec![json!("Z"), json!("A"), json!("B"), json!("C")]);
        assert_eq!(acc.truncate_hits(2), 2);
        assert_eq!(acc.hits, vec![json!("Z"), json!("A")]);
    }

    #[test]
    fn histogram_seed_does_not_overwrite_real_counts() {
        let mut h = HistogramAccumulator::default();
        h.merge(Bucket { bucket_start: 60, count: 5 });
        h.seed([0, 60, 120]);
        assert_eq!(h.count_at(60), Some(5));
        assert_eq!(h.count_at(0), Some(0));
        assert_eq!(h.len(), 3);
        h.merge(Bucket { bucket_start: 60, count: 7 });
        assert_eq!(h.total(), 7);
    }

    #[test]
    fn histogram_serializes_buckets_in_time_order() {
        let mut h = HistogramAccumulator::default();
        h.seed([120, 0, 60]);
        let v = serde_json::to_value(&h).unwrap();
        let starts: Vec<i64> = v["buckets"].as_array().unwrap().iter().map(|b| b["bucket_start"].as_i64().unwrap()).collect();
        assert_eq!(starts, vec![0, 60, 120]);
    }
}
