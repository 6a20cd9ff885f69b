//! Metadata aggregator: folds partition statistics into the accumulator.
//!
//! `took` and `scan_size` always add up. `total` is only meaningful when the query asked
//! for it; streaming aggregates restate the running total so it replaces, otherwise each
//! partition contributes its own count.

use sluice_core::{MetadataResults, OrderBy, QueryPayload, TimeOffset, TimeRange};
use sluice_store::ResultAccumulator;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TotalUpdate {
    Keep,
    Replace(u64),
    Add(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataDelta {
    /// Pagination fetches re-scan rows already counted; their counters are not folded.
    pub fold_counters: bool,
    pub took: u64,
    pub scan_size: u64,
    pub total: TotalUpdate,
    pub order_by: Option<OrderBy>,
    pub histogram_interval: Option<i64>,
    pub streaming_aggs: bool,
    pub histogram_eligible: bool,
    pub function_error: Option<String>,
    pub time_correction: Option<TimeRange>,
    pub is_partial: bool,
    pub time_offset: Option<TimeOffset>,
}

pub fn total_update(meta: &MetadataResults, track_total_hits: bool) -> TotalUpdate {
    match (track_total_hits, meta.total) {
        (false, _) | (_, None) => TotalUpdate::Keep,
        (true, Some(t)) if meta.streaming_aggs => TotalUpdate::Replace(t),
        (true, Some(t)) => TotalUpdate::Add(t),
    }
}

/// Corrected range carried by a function error, when it differs from `current`.
pub fn time_correction(meta: &MetadataResults, current: TimeRange) -> Option<TimeRange> {
    meta.function_error.as_ref()?;
    if meta.new_start_time.is_none() && meta.new_end_time.is_none() {
        return None;
    }
    let next = TimeRange {
        start_time: meta.new_start_time.unwrap_or(current.start_time),
        end_time: meta.new_end_time.unwrap_or(current.end_time),
    };
    (next != current).then_some(next)
}

pub fn plan(meta: &MetadataResults, query: &QueryPayload, active: TimeRange, pagination: bool) -> MetadataDelta {
    MetadataDelta {
        fold_counters: !pagination,
        took: meta.took,
        scan_size: meta.scan_size,
        total: total_update(meta, query.track_total_hits),
        order_by: meta.order_by,
        histogram_interval: meta.histogram_interval,
        streaming_aggs: meta.streaming_aggs,
        histogram_eligible: meta.is_histogram_eligible.unwrap_or(false),
        function_error: meta.function_error.clone(),
        time_correction: time_correction(meta, active),
        is_partial: meta.is_partial,
        time_offset: meta.time_offset,
    }
}

/// Apply; returns the corrected time range when the server supplied one.
pub fn apply(acc: &mut ResultAccumulator, d: MetadataDelta) -> Option<TimeRange> {
    if d.fold_counters {
        acc.took = acc.took.saturating_add(d.took);
        acc.scan_size = acc.scan_size.saturating_add(d.scan_size);
        match d.total {
            TotalUpdate::Keep => {}
            TotalUpdate::Replace(t) => acc.total = t,
            TotalUpdate::Add(t) => acc.total = acc.total.saturating_add(t),
        }
    }
    if let Some(o) = d.order_by {
        acc.order_by = o;
    }
    if acc.histogram_interval.is_none() {
        acc.histogram_interval = d.histogram_interval;
    }
    acc.streaming_aggs = d.streaming_aggs;
    acc.is_histogram_eligible |= d.histogram_eligible;
    acc.is_partial |= d.is_partial;
    if d.time_offset.is_some() {
        acc.time_offset = d.time_offset;
    }
    if let Some(err) = d.function_error {
        acc.function_error = Some(err);
    }
    if let Some(r) = d.time_correction {
        info!(start = r.start_time, end = r.end_time, "server corrected the time range");
    }
    d.time_correction
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(track: bool) -> QueryPayload { QueryPayload { track_total_hits: track, ..Default::default() } }

    fn meta(total: u64, streaming: bool) -> MetadataResults {
        MetadataResults { total: Some(total), took: 5, scan_size: 100, streaming_aggs: streaming, ..Default::default() }
    }

    fn fold(parts: &[MetadataResults], track: bool) -> ResultAccumulator {
        let mut acc = ResultAccumulator::default();
        for m in parts {
            apply(&mut acc, plan(m, &q(track), TimeRange::default(), false));
        }
        acc
    }

    #[test]
    fn streaming_total_replaces() {
        let acc = fold(&[meta(10, true), meta(25, true)], true);
        assert_eq!(acc.total, 25);
        assert_eq!(acc.took, 10);
        assert_eq!(acc.scan_size, 200);
    }

    #[test]
    fn non_streaming_total_sums() {
        let acc = fold(&[meta(10, false), meta(25, false)], true);
        assert_eq!(acc.total, 35);
    }

    #[test]
    fn total_ignored_without_track_total_hits() {
        let acc = fold(&[meta(10, false), meta(25, false)], false);
        assert_eq!(acc.total, 0);
        assert_eq!(acc.took, 10);
    }

    #[test]
    fn pagination_does_not_fold_counters() {
        let mut acc = fold(&[meta(10, false)], true);
        apply(&mut acc, plan(&meta(10, false), &q(true), TimeRange::default(), true));
        assert_eq!(acc.total, 10);
        assert_eq!(acc.took, 5);
    }

    #[test]
    fn correction_needs_function_error_and_a_change() {
        let current = TimeRange { start_time: 0, end_time: 100 };
        let mut m = MetadataResults { new_start_time: Some(50), ..Default::default() };
        assert_eq!(time_correction(&m, current), None);
        m.function_error = Some("range too wide".into());
        assert_eq!(time_correction(&m, current), Some(TimeRange { start_time: 50, end_time: 100 }));
        m.new_start_time = Some(0);
        assert_eq!(time_correction(&m, current), None);
    }

    #[test]
    fn eligibility_and_partial_are_sticky() {
        let mut acc = ResultAccumulator::default();
        let first = MetadataResults { is_histogram_eligible: Some(true), is_partial: true, ..Default::default() };
        apply(&mut acc, plan(&first, &q(false), TimeRange::default(), false));
        apply(&mut acc, plan(&MetadataResults::default(), &q(false), TimeRange::default(), false));
        assert!(acc.is_histogram_eligible);
        assert!(acc.is_partial);
    }
}
