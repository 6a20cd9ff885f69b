//! Page-count estimation.
//!
//! Row fetches ask for one row beyond the page. Getting that extra row back proves a
//! further page exists without counting; the probe row is trimmed before display. An
//! exact count, when it arrives from a `pageCount` request, always wins over the estimate.

use serde::Serialize;
use sluice_core::{PageCountSkip, QueryFacts, Record, TimeOffset};
use sluice_store::{Placement, ResultAccumulator};

use crate::histogram::{parse_count, COUNT_COLUMN};

/// Estimation applies to plain row queries while the histogram is hidden.
pub fn should_estimate(show_histogram: bool, facts: &QueryFacts) -> bool {
    if show_histogram || facts.has_aggregation {
        return false;
    }
    !(facts.sql_mode && facts.has_limit)
}

pub fn probe_size(size: u64) -> u64 { size.saturating_add(1) }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Estimate {
    pub page_count_total: u64,
    /// Probe rows to drop from the end of the held hits.
    pub trim_to: Option<usize>,
}

pub fn estimate(rows_per_page: u64, current_page: u64, page_size: u64, returned: usize) -> Estimate {
    if returned as u64 > page_size {
        return Estimate {
            page_count_total: rows_per_page.saturating_mul(current_page).saturating_add(1),
            trim_to: Some(page_size as usize),
        };
    }
    Estimate {
        page_count_total: rows_per_page.saturating_mul(current_page.saturating_sub(1)).saturating_add(returned as u64),
        trim_to: None,
    }
}

/// A separate count request is worth issuing only for a full first page of a plain query
/// whose cached total does not already cover the window.
pub fn needs_count_request(
    returned: usize,
    size: u64,
    from: u64,
    facts: &QueryFacts,
    cached_total: Option<u64>,
    rule: PageCountSkip,
) -> bool {
    if facts.has_aggregation || from != 0 || returned as u64 != size {
        return false;
    }
    !matches!(cached_total, Some(t) if rule.skips(t, from, size))
}

/// Count carried by a page-count fragment, summed over its rows.
pub fn count_from_hits(hits: &[Record]) -> u64 {
    hits.iter().filter_map(|h| h.get(COUNT_COLUMN).and_then(parse_count)).sum()
}

/// Running state of one `pageCount` request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CountState {
    pub running: u64,
    pub streaming_aggs: bool,
    /// Set once any exact count landed; estimates stop overwriting from then on.
    pub exact: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageCountDelta {
    Estimate(Estimate),
    Progress { streaming_aggs: bool, is_partial: bool, time_offset: Option<TimeOffset> },
    Count { count: u64, placement: Placement },
}

pub fn apply(acc: &mut ResultAccumulator, state: &mut CountState, d: PageCountDelta) {
    match d {
        PageCountDelta::Estimate(e) => {
            if let Some(len) = e.trim_to {
                acc.truncate_hits(len);
            }
            if !state.exact {
                acc.page_count_total = Some(e.page_count_total);
            }
        }
        PageCountDelta::Progress { streaming_aggs, is_partial, time_offset } => {
            state.streaming_aggs = streaming_aggs;
            acc.is_partial |= is_partial;
            if time_offset.is_some() {
                acc.time_offset = time_offset;
            }
        }
        PageCountDelta::Count { count, placement } => {
            state.running = match placement {
                Placement::Replace => count,
                Placement::Append => state.running.saturating_add(count),
            };
            state.exact = true;
            acc.page_count_total = Some(state.running);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn full_probe_reports_one_more_page() {
        let e = estimate(50, 2, 50, 51);
        assert_eq!(e.page_count_total, 101);
        assert_eq!(e.trim_to, Some(50));
    }

    #[test]
    fn short_page_is_exact() {
        let e = estimate(50, 2, 50, 30);
        assert_eq!(e.page_count_total, 80);
        assert_eq!(e.trim_to, None);
        assert_eq!(estimate(50, 1, 50, 0).page_count_total, 0);
    }

    #[test]
    fn estimation_gates() {
        let plain = QueryFacts::default();
        assert!(should_estimate(false, &plain));
        assert!(!should_estimate(true, &plain));
        assert!(!should_estimate(false, &QueryFacts { has_aggregation: true, ..plain }));
        assert!(!should_estimate(false, &QueryFacts { sql_mode: true, has_limit: true, ..plain }));
        assert!(should_estimate(false, &QueryFacts { has_limit: true, ..plain }));
    }

    #[test]
    fn count_request_gates() {
        let f = QueryFacts::default();
        assert!(needs_count_request(50, 50, 0, &f, None, PageCountSkip::Greater));
        assert!(!needs_count_request(49, 50, 0, &f, None, PageCountSkip::Greater));
        assert!(!needs_count_request(50, 50, 50, &f, None, PageCountSkip::Greater));
        assert!(!needs_count_request(50, 50, 0, &QueryFacts { has_aggregation: true, ..f }, None, PageCountSkip::Greater));
        assert!(!needs_count_request(50, 50, 0, &f, Some(51), PageCountSkip::Greater));
        assert!(needs_count_request(50, 50, 0, &f, Some(50), PageCountSkip::Greater));
        assert!(!needs_count_request(50, 50, 0, &f, Some(50), PageCountSkip::GreaterOrEqual));
    }

    #[test]
    fn exact_count_wins_over_later_estimates() {
        let mut acc = ResultAccumulator::default();
        let mut st = CountState::default();
        apply(&mut acc, &mut st, PageCountDelta::Estimate(estimate(50, 1, 50, 51)));
        assert_eq!(acc.page_count_total, Some(51));
        apply(&mut acc, &mut st, PageCountDelta::Count { count: 700, placement: Placement::Replace });
        apply(&mut acc, &mut st, PageCountDelta::Count { count: 12, placement: Placement::Append });
        assert_eq!(acc.page_count_total, Some(712));
        apply(&mut acc, &mut st, PageCountDelta::Estimate(estimate(50, 2, 50, 51)));
        assert_eq!(acc.page_count_total, Some(712));
    }

    #[test]
    fn counts_are_read_from_the_count_column() {
        assert_eq!(count_from_hits(&[json!({"zo_sql_num": 40}), json!({"zo_sql_num": "2"}), json!({"x": 1})]), 42);
    }
}
