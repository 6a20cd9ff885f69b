//! The single reducer. Handlers compute a [`Delta`] from immutable inputs; only
//! [`apply`] mutates a slot.

use sluice_core::{RequestDescriptor, TimeRange};
use sluice_store::{HistogramState, QueryView};

use crate::histogram::{self, HistogramDelta};
use crate::hits::{self, HitsDelta};
use crate::metadata::{self, MetadataDelta};
use crate::page_count::{self, CountState, PageCountDelta};
use crate::Effect;

#[derive(Debug, Clone, PartialEq)]
pub enum Delta {
    Hits(HitsDelta),
    Metadata(MetadataDelta),
    Histogram(HistogramDelta),
    PageCount(PageCountDelta),
    Pattern(serde_json::Value),
}

/// Everything the engine holds for one sub-query slot.
#[derive(Debug, Clone)]
pub struct QuerySlot {
    pub view: QueryView,
    /// Latest row request (fresh search or pagination), before the probe row was added.
    pub request: RequestDescriptor,
    /// Active time range; server corrections rewrite it.
    pub range: TimeRange,
    /// Page size requested by the UI when the probe row is in play.
    pub probe: Option<u64>,
    /// The extra row came back for the current row request: a further page exists.
    pub extra_row_seen: bool,
    pub count: CountState,
}

impl QuerySlot {
    pub fn new(request: RequestDescriptor) -> Self {
        let range = request.query.time_range();
        Self { view: QueryView::default(), request, range, probe: None, extra_row_seen: false, count: CountState::default() }
    }

    fn refresh_title(&mut self) {
        let hist = &mut self.view.histogram;
        if hist.state != HistogramState::Ready {
            return;
        }
        let took = if self.view.results.took > 0 { self.view.results.took } else { hist.took };
        hist.chart_title =
            histogram::chart_title(self.request.query.from, self.view.results.hits.len(), hist.total(), took);
    }
}

pub fn apply(slot: &mut QuerySlot, query_index: usize, delta: Delta) -> Vec<Effect> {
    let mut effects = Vec::new();
    match delta {
        Delta::Hits(d) => {
            hits::apply(&mut slot.view.results, d);
            slot.refresh_title();
            effects.push(Effect::RefreshFields { query_index });
        }
        Delta::Metadata(d) => {
            if let Some(range) = metadata::apply(&mut slot.view.results, d) {
                slot.range = range;
                effects.push(Effect::TimeRangeAdjusted { query_index, range });
            }
        }
        Delta::Histogram(d) => {
            histogram::apply(&mut slot.view.histogram, d);
            slot.refresh_title();
        }
        Delta::PageCount(d) => {
            page_count::apply(&mut slot.view.results, &mut slot.count, d);
            slot.refresh_title();
        }
        Delta::Pattern(v) => slot.view.results.pattern_result = Some(v),
    }
    effects
}
