//! Histogram backfill: a gap-free series of time buckets over the active range.
//!
//! On the first non-empty payload the whole range is seeded with zero buckets on the
//! interval grid anchored at the first real bucket. Real counts overwrite zeros; a key
//! is never duplicated.

use chrono::{DateTime, NaiveDateTime};
use serde_json::Value;
use sluice_core::{Record, TimeRange};
use sluice_store::{Bucket, HistogramAccumulator, HistogramState};
use tracing::{debug, warn};

use crate::hits::HitsPlacement;

pub const KEY_COLUMN: &str = "zo_sql_key";
pub const COUNT_COLUMN: &str = "zo_sql_num";

const MICROS_PER_SEC: i64 = 1_000_000;
const MICROS_PER_MIN: i64 = 60 * MICROS_PER_SEC;

/// Bucket start in microseconds. Accepts integer micros, numeric strings and naive UTC
/// timestamps (`2024-01-01T00:00:00`, optional fraction, `T` or space separated).
pub fn parse_timestamp(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(n) = s.parse::<i64>() {
                return Some(n);
            }
            for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
                if let Ok(t) = NaiveDateTime::parse_from_str(s, fmt) {
                    return Some(t.and_utc().timestamp_micros());
                }
            }
            DateTime::parse_from_rfc3339(s).ok().map(|t| t.timestamp_micros())
        }
        _ => None,
    }
}

pub fn parse_count(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn parse_bucket(rec: &Record) -> Option<Bucket> {
    let bucket_start = rec.get(KEY_COLUMN).and_then(parse_timestamp)?;
    let count = rec.get(COUNT_COLUMN).and_then(parse_count).unwrap_or(0);
    Some(Bucket { bucket_start, count })
}

pub fn parse_buckets(records: &[Record]) -> Vec<Bucket> {
    let out: Vec<Bucket> = records.iter().filter_map(parse_bucket).collect();
    if out.len() != records.len() {
        debug!(skipped = records.len() - out.len(), "histogram rows without a usable key");
    }
    out
}

/// Sub-10s intervals anchor on the next whole minute.
pub fn round_anchor(anchor: i64, interval_secs: i64) -> i64 {
    if interval_secs >= 10 || anchor.rem_euclid(MICROS_PER_MIN) == 0 {
        return anchor;
    }
    anchor
        .div_euclid(MICROS_PER_MIN)
        .checked_add(1)
        .and_then(|m| m.checked_mul(MICROS_PER_MIN))
        .unwrap_or(anchor)
}

/// Keys on the interval grid through `anchor`, walking forward while `<= end` and
/// backward while `>= start`, at most `cap` of them.
pub fn skeleton(anchor: i64, interval_secs: i64, range: TimeRange, cap: usize) -> Vec<i64> {
    let step = interval_secs.saturating_mul(MICROS_PER_SEC);
    if step <= 0 {
        return Vec::new();
    }
    let mut keys = Vec::new();
    let mut next = Some(anchor);
    while let Some(t) = next.filter(|t| *t <= range.end_time && keys.len() < cap) {
        keys.push(t);
        next = t.checked_add(step);
    }
    let mut next = anchor.checked_sub(step);
    while let Some(t) = next.filter(|t| *t >= range.start_time && keys.len() < cap) {
        keys.push(t);
        next = t.checked_sub(step);
    }
    if keys.len() >= cap {
        warn!(cap, interval_secs, "histogram backfill hit the bucket cap");
    }
    keys
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistogramDelta {
    Meta { took: u64, scan_size: u64, interval: Option<i64> },
    Buckets { placement: HitsPlacement, seed: Vec<i64>, buckets: Vec<Bucket> },
    /// No interval to backfill with; leave the chart loading.
    Stall,
    /// Empty or ignored payload.
    Skip,
}

pub fn plan(
    hist: &HistogramAccumulator,
    interval: Option<i64>,
    range: TimeRange,
    placement: HitsPlacement,
    buckets: Vec<Bucket>,
    cap: usize,
) -> HistogramDelta {
    if hist.state == HistogramState::Stalled {
        return HistogramDelta::Skip;
    }
    if buckets.is_empty() && !hist.is_seeded() {
        return HistogramDelta::Skip;
    }
    let seed = if hist.is_seeded() {
        Vec::new()
    } else {
        let Some(interval) = interval.filter(|i| *i > 0) else {
            warn!("histogram interval unknown; backfill aborted");
            return HistogramDelta::Stall;
        };
        let anchor = round_anchor(buckets[0].bucket_start, interval);
        skeleton(anchor, interval, range, cap)
    };
    HistogramDelta::Buckets { placement, seed, buckets }
}

pub fn apply(hist: &mut HistogramAccumulator, d: HistogramDelta) {
    match d {
        HistogramDelta::Meta { took, scan_size, interval } => {
            hist.took = hist.took.saturating_add(took);
            hist.scan_size = hist.scan_size.saturating_add(scan_size);
            if hist.interval.is_none() {
                hist.interval = interval;
            }
        }
        HistogramDelta::Buckets { placement, seed, buckets } => {
            hist.seed(seed);
            for b in &buckets {
                hist.merge(*b);
            }
            match placement {
                HitsPlacement::Replace => hist.partition_buckets = buckets,
                HitsPlacement::Append => hist.partition_buckets.extend(buckets),
                HitsPlacement::Prepend => {
                    let mut next = buckets;
                    next.append(&mut hist.partition_buckets);
                    hist.partition_buckets = next;
                }
            }
            hist.state = HistogramState::Ready;
        }
        HistogramDelta::Stall => hist.state = HistogramState::Stalled,
        HistogramDelta::Skip => {}
    }
}

pub fn chart_title(from: u64, shown: usize, total: u64, took: u64) -> String {
    let first = if shown == 0 { 0 } else { from.saturating_add(1) };
    let last = from.saturating_add(shown as u64);
    format!("Showing {} to {} out of {} events in {} ms", first, last, total, took)
}
