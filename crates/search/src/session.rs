//! One search session: registry, partition tracker and per-slot state behind a single
//! entry point per transport event.
//!
//! Every inbound message goes through [`Session::dispatch`]. Messages for trace ids that
//! are not live (never registered, superseded, completed or cancelled) are dropped and
//! counted, never applied.

use std::collections::BTreeMap;
use std::time::Instant;

use sluice_core::{
    format_user_error, CancelAck, EngineConfig, ErrorPayload, MetadataResults, Record, RequestDescriptor,
    RequestKind, SluiceError, SluiceResult, StreamMessage, TraceId,
};
use sluice_store::{
    FieldSummary, FragmentEvent, HistogramAccumulator, HistogramError, HistogramState, PartitionTracker, Placement,
    QueryError, QueryView, ResultAccumulator, TraceEntry, TraceRegistry,
};
use tracing::{debug, info, warn};

use crate::dispatch::{route, Route};
use crate::histogram::{self, HistogramDelta};
use crate::hits;
use crate::metadata;
use crate::page_count::{self, CountState, PageCountDelta};
use crate::reduce::{self, Delta, QuerySlot};
use crate::Effect;

/// What [`Session::begin`] hands back to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct Begin {
    /// The request to put on the wire (row fetches carry the probe row).
    pub request: RequestDescriptor,
    /// Live traces of the same slot that this search replaced.
    pub superseded: Vec<TraceId>,
    /// Trace evicted from a full registry, if any.
    pub evicted: Option<TraceId>,
}

const CANCELLED_NOTICE: &str = "Search cancelled; showing partial results";

fn dropped(reason: &'static str) {
    metrics::counter!("sluice_dropped_messages_total", 1u64, "reason" => reason);
}

pub struct Session {
    config: EngineConfig,
    registry: TraceRegistry,
    tracker: PartitionTracker,
    slots: BTreeMap<usize, QuerySlot>,
    cancelled: bool,
    /// A local cancel is waiting for its first server acknowledgement.
    ack_pending: bool,
}

impl Session {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            registry: TraceRegistry::with_capacity(config.max_traces),
            tracker: PartitionTracker::with_capacity(config.max_traces),
            slots: BTreeMap::new(),
            cancelled: false,
            ack_pending: false,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig { &self.config }

    pub fn is_cancelled(&self) -> bool { self.cancelled }

    pub fn is_live(&self, trace: &TraceId) -> bool { self.registry.contains(trace) }

    pub fn live_traces(&self) -> Vec<TraceId> { self.registry.ids().cloned().collect() }

    pub fn view(&self, query_index: usize) -> Option<&QueryView> { self.slots.get(&query_index).map(|s| &s.view) }

    pub fn views(&self) -> BTreeMap<usize, QueryView> {
        self.slots.iter().map(|(k, s)| (*k, s.view.clone())).collect()
    }

    /// Hits currently held for a slot; used by field extraction.
    pub fn hits(&self, query_index: usize) -> &[Record] {
        self.slots.get(&query_index).map(|s| s.view.results.hits.as_slice()).unwrap_or(&[])
    }

    pub fn set_fields(&mut self, query_index: usize, fields: Vec<FieldSummary>) {
        if let Some(slot) = self.slots.get_mut(&query_index) {
            slot.view.results.fields = fields;
        }
    }

    /// Register a request. A fresh search of a slot replaces that slot's state atomically
    /// and retires every live trace still attached to it; it also lifts a previous cancel.
    pub fn begin(&mut self, desc: RequestDescriptor) -> SluiceResult<Begin> {
        let idx = desc.meta.query_index;
        let fresh = desc.kind == RequestKind::Search && !desc.is_pagination;
        if self.cancelled {
            if !fresh {
                return Err(SluiceError::Cancelled);
            }
            self.cancelled = false;
            self.ack_pending = false;
        }

        let mut superseded = Vec::new();
        if fresh {
            let stale: Vec<TraceId> = self
                .registry
                .ids()
                .filter(|id| self.registry.get(id).map(|e| e.query_index == idx).unwrap_or(false))
                .cloned()
                .collect();
            for id in stale {
                self.registry.remove(&id);
                self.tracker.remove(&id);
                superseded.push(id);
            }
            self.slots.insert(idx, QuerySlot::new(desc.clone()));
        }

        let slot = self.slots.entry(idx).or_insert_with(|| QuerySlot::new(desc.clone()));
        let mut request = desc.clone();
        match desc.kind {
            RequestKind::Search => {
                slot.view.loading = true;
                slot.view.results.error = None;
                if fresh {
                    slot.view.histogram_loading = desc.meta.show_histogram;
                } else {
                    slot.view.results.cancelled = false;
                }
                slot.request = desc.clone();
                slot.extra_row_seen = false;
                slot.probe = if page_count::should_estimate(desc.meta.show_histogram, &desc.facts) {
                    request.query.size = page_count::probe_size(desc.query.size);
                    Some(desc.query.size)
                } else {
                    None
                };
            }
            RequestKind::Histogram => {
                slot.view.histogram = HistogramAccumulator::default();
                slot.view.histogram_loading = true;
            }
            RequestKind::PageCount => {
                let exact = slot.count.exact;
                slot.count = CountState { exact, ..CountState::default() };
            }
        }

        let entry = TraceEntry { kind: desc.kind, query_index: idx, is_pagination: desc.is_pagination };
        let evicted = self.registry.register(desc.trace_id.clone(), entry);
        if let Some(old) = &evicted {
            self.tracker.remove(old);
        }
        self.tracker.reset(&desc.trace_id);
        info!(
            trace = %desc.trace_id,
            kind = desc.kind.as_str(),
            query_index = idx,
            pagination = desc.is_pagination,
            superseded = superseded.len(),
            "session: request started"
        );
        Ok(Begin { request, superseded, evicted })
    }

    pub fn dispatch(&mut self, trace: &TraceId, msg: StreamMessage) -> Vec<Effect> {
        let started = Instant::now();
        let label = msg.kind_label();
        if let StreamMessage::CancelAck(ack) = &msg {
            return self.on_cancel_ack(trace, ack);
        }
        if self.cancelled {
            debug!(trace = %trace, kind = label, "session cancelled; dropping");
            dropped("cancelled");
            return Vec::new();
        }
        let Some(entry) = self.registry.get(trace).copied() else {
            debug!(trace = %trace, kind = label, "inactive trace; dropping");
            dropped("inactive_trace");
            return Vec::new();
        };
        metrics::counter!("sluice_fragments_total", 1u64, "kind" => label);

        let effects = match (route(entry.kind, &msg), msg) {
            (Route::SearchMetadata, StreamMessage::Metadata(m)) => self.search_metadata(trace, entry, &m),
            (Route::SearchHits, StreamMessage::Hits(h)) => self.search_hits(trace, entry, h.hits),
            (Route::SearchSingle, StreamMessage::Full(f)) => {
                let mut out = self.search_metadata(trace, entry, &f.meta);
                out.extend(self.search_hits(trace, entry, f.hits));
                out
            }
            (Route::HistogramMetadata, StreamMessage::Metadata(m)) => self.histogram_metadata(trace, entry, &m),
            (Route::HistogramHits, StreamMessage::Hits(h)) => self.histogram_hits(trace, entry, h.hits),
            (Route::HistogramSingle, StreamMessage::Full(f)) => {
                let mut out = self.histogram_metadata(trace, entry, &f.meta);
                out.extend(self.histogram_hits(trace, entry, f.hits));
                out
            }
            (Route::PageCountMetadata, StreamMessage::Metadata(m)) => self.page_count_metadata(trace, entry, &m),
            (Route::PageCountHits, StreamMessage::Hits(h)) => self.page_count_hits(trace, entry, h.hits),
            (Route::PageCountSingle, StreamMessage::Full(f)) => {
                let mut out = self.page_count_metadata(trace, entry, &f.meta);
                out.extend(self.page_count_hits(trace, entry, f.hits));
                out
            }
            (Route::Pattern, StreamMessage::Pattern(v)) => self.reduce(entry.query_index, Delta::Pattern(v)),
            (Route::Error, StreamMessage::Error(e)) => self.fail(trace, &e),
            (r, other) => {
                debug!(trace = %trace, route = ?r, kind = other.kind_label(), "no handler; dropping");
                dropped("unroutable");
                Vec::new()
            }
        };
        metrics::histogram!("sluice_reduce_ms", started.elapsed().as_secs_f64() * 1000.0);
        effects
    }

    fn reduce(&mut self, query_index: usize, delta: Delta) -> Vec<Effect> {
        match self.slots.get_mut(&query_index) {
            Some(slot) => reduce::apply(slot, query_index, delta),
            None => Vec::new(),
        }
    }

    fn search_metadata(&mut self, trace: &TraceId, entry: TraceEntry, meta: &MetadataResults) -> Vec<Effect> {
        let partition = self.tracker.on_metadata(trace);
        let Some(slot) = self.slots.get(&entry.query_index) else { return Vec::new() };
        debug!(trace = %trace, partition, took = meta.took, total = ?meta.total, "search: partition opened");
        let delta = metadata::plan(meta, &slot.request.query, slot.range, entry.is_pagination);
        self.reduce(entry.query_index, Delta::Metadata(delta))
    }

    fn search_hits(&mut self, trace: &TraceId, entry: TraceEntry, rows: Vec<Record>) -> Vec<Effect> {
        let idx = entry.query_index;
        let Some(slot) = self.slots.get(&idx) else { return Vec::new() };
        let results = &slot.view.results;
        let ev = FragmentEvent::Hits { streaming_aggs: results.streaming_aggs, non_empty: !rows.is_empty() };
        let order_by = results.order_by;
        let placement = self.tracker.observe(trace, ev).unwrap_or(Placement::Replace);
        debug!(trace = %trace, rows = rows.len(), ?placement, "search: hits");
        let mut effects = self.reduce(idx, Delta::Hits(hits::plan(placement, order_by, rows)));

        if let Some(slot) = self.slots.get_mut(&idx) {
            if let Some(size) = slot.probe {
                let meta = &slot.request.meta;
                let rows_per_page = if meta.rows_per_page > 0 { meta.rows_per_page } else { size };
                // once the extra row was seen the held rows are trimmed to `size`; keep counting it
                let held = slot.view.results.hits.len();
                let returned = if slot.extra_row_seen { held.max(page_count::probe_size(size) as usize) } else { held };
                let est = page_count::estimate(rows_per_page, meta.current_page, size, returned);
                slot.extra_row_seen |= est.trim_to.is_some();
                effects.extend(self.reduce(idx, Delta::PageCount(PageCountDelta::Estimate(est))));
            }
        }
        effects
    }

    fn histogram_metadata(&mut self, trace: &TraceId, entry: TraceEntry, meta: &MetadataResults) -> Vec<Effect> {
        let partition = self.tracker.on_metadata(trace);
        debug!(trace = %trace, partition, interval = ?meta.histogram_interval, "histogram: partition opened");
        let delta = HistogramDelta::Meta { took: meta.took, scan_size: meta.scan_size, interval: meta.histogram_interval };
        self.reduce(entry.query_index, Delta::Histogram(delta))
    }

    fn histogram_hits(&mut self, trace: &TraceId, entry: TraceEntry, rows: Vec<Record>) -> Vec<Effect> {
        let idx = entry.query_index;
        let ev = FragmentEvent::Hits { streaming_aggs: false, non_empty: !rows.is_empty() };
        let placement = self.tracker.observe(trace, ev).unwrap_or(Placement::Replace);
        let Some(slot) = self.slots.get(&idx) else { return Vec::new() };
        let interval = slot
            .view
            .histogram
            .interval
            .or(slot.view.results.histogram_interval)
            .or(slot.request.query.histogram_interval);
        let buckets = histogram::parse_buckets(&rows);
        let delta = histogram::plan(
            &slot.view.histogram,
            interval,
            slot.range,
            hits::placement_for(placement, slot.view.results.order_by),
            buckets,
            self.config.max_histogram_buckets,
        );
        self.reduce(idx, Delta::Histogram(delta))
    }

    fn page_count_metadata(&mut self, trace: &TraceId, entry: TraceEntry, meta: &MetadataResults) -> Vec<Effect> {
        self.tracker.on_metadata(trace);
        let delta = PageCountDelta::Progress {
            streaming_aggs: meta.streaming_aggs,
            is_partial: meta.is_partial,
            time_offset: meta.time_offset,
        };
        self.reduce(entry.query_index, Delta::PageCount(delta))
    }

    fn page_count_hits(&mut self, trace: &TraceId, entry: TraceEntry, rows: Vec<Record>) -> Vec<Effect> {
        let Some(slot) = self.slots.get(&entry.query_index) else { return Vec::new() };
        let ev = FragmentEvent::Hits { streaming_aggs: slot.count.streaming_aggs, non_empty: !rows.is_empty() };
        let placement = self.tracker.observe(trace, ev).unwrap_or(Placement::Replace);
        let count = page_count::count_from_hits(&rows);
        debug!(trace = %trace, count, ?placement, "pageCount: hits");
        self.reduce(entry.query_index, Delta::PageCount(PageCountDelta::Count { count, placement }))
    }

    /// Stream finished normally. A full first page of a probed search may ask for an
    /// exact count.
    pub fn complete(&mut self, trace: &TraceId) -> Vec<Effect> {
        if self.cancelled {
            return Vec::new();
        }
        let Some(entry) = self.registry.remove(trace) else {
            debug!(trace = %trace, "complete for inactive trace");
            return Vec::new();
        };
        let partitions = self.tracker.remove(trace).map(|s| s.partition_count()).unwrap_or(0);
        info!(trace = %trace, kind = entry.kind.as_str(), partitions, "session: request complete");
        let Some(slot) = self.slots.get_mut(&entry.query_index) else { return Vec::new() };
        let mut effects = Vec::new();
        match entry.kind {
            RequestKind::Search => {
                slot.view.loading = false;
                if let Some(size) = slot.probe {
                    let query = &slot.request.query;
                    let cached = query.track_total_hits.then_some(slot.view.results.total);
                    let wanted = !slot.count.exact
                        && page_count::needs_count_request(
                            slot.view.results.hits.len(),
                            size,
                            query.from,
                            &slot.request.facts,
                            cached,
                            self.config.page_count_skip,
                        );
                    if wanted {
                        effects.push(Effect::RequestPageCount(slot.request.derive(RequestKind::PageCount)));
                    }
                }
            }
            RequestKind::Histogram => {
                if slot.view.histogram.state != HistogramState::Stalled {
                    slot.view.histogram_loading = false;
                }
            }
            RequestKind::PageCount => {}
        }
        effects
    }

    /// Transport or server error for one trace. Only that trace's slot is affected.
    pub fn fail(&mut self, trace: &TraceId, err: &ErrorPayload) -> Vec<Effect> {
        if self.cancelled {
            return Vec::new();
        }
        let Some(entry) = self.registry.remove(trace) else {
            dropped("inactive_trace");
            return Vec::new();
        };
        let fatal = self.tracker.remove(trace).map(|s| s.partition_count() == 0).unwrap_or(true);
        let message = match &err.error_detail {
            Some(d) if !d.is_empty() => format!("{}: {}", err.message, d),
            _ => err.message.clone(),
        };
        let display = format_user_error(&message, Some(err.trace_id.as_ref().unwrap_or(trace)), self.config.error_max_chars);
        warn!(trace = %trace, kind = entry.kind.as_str(), code = ?err.code, fatal, "session: request failed: {}", err.message);
        let Some(slot) = self.slots.get_mut(&entry.query_index) else { return Vec::new() };
        match entry.kind {
            RequestKind::Search => {
                slot.view.loading = false;
                slot.view.results.error = Some(QueryError { code: err.code, message, display: display.clone(), fatal });
            }
            RequestKind::Histogram => {
                slot.view.histogram_loading = false;
                slot.view.histogram.error = Some(HistogramError { code: err.code, message: display.clone() });
            }
            // the estimate stays in place
            RequestKind::PageCount => return Vec::new(),
        }
        vec![Effect::Notify(display)]
    }

    /// Transport reconnected and will replay the request from the start.
    pub fn reset(&mut self, trace: &TraceId) {
        let Some(entry) = self.registry.get(trace).copied() else { return };
        self.tracker.reset(trace);
        let Some(slot) = self.slots.get_mut(&entry.query_index) else { return };
        match entry.kind {
            RequestKind::Search if !entry.is_pagination => {
                slot.view.results = ResultAccumulator::default();
                slot.count = CountState::default();
                slot.extra_row_seen = false;
            }
            RequestKind::Search => slot.extra_row_seen = false,
            RequestKind::Histogram => slot.view.histogram = HistogramAccumulator::default(),
            RequestKind::PageCount => slot.count = CountState { exact: false, ..slot.count },
        }
        info!(trace = %trace, kind = entry.kind.as_str(), "session: stream reset");
    }

    /// Cancel everything in flight. Returns the trace ids to send cancel requests for;
    /// a second call returns nothing. The first acknowledgement that follows raises the
    /// user notification.
    pub fn cancel(&mut self) -> Vec<TraceId> {
        if self.cancelled {
            return Vec::new();
        }
        self.cancelled = true;
        let drained = self.registry.drain();
        self.ack_pending = !drained.is_empty();
        self.tracker.clear();
        for slot in self.slots.values_mut() {
            if slot.view.loading || slot.view.histogram_loading {
                slot.view.results.cancelled = true;
                slot.view.results.is_partial = true;
            }
            slot.view.loading = false;
            slot.view.histogram_loading = false;
        }
        info!(drained = drained.len(), "session: cancelled");
        drained
    }

    /// The server confirmed a local cancel. Only the first confirmation notifies.
    pub fn cancel_acknowledged(&mut self) -> Vec<Effect> {
        if !self.cancelled || !std::mem::take(&mut self.ack_pending) {
            return Vec::new();
        }
        vec![Effect::Notify(CANCELLED_NOTICE.to_string())]
    }

    fn on_cancel_ack(&mut self, trace: &TraceId, ack: &CancelAck) -> Vec<Effect> {
        if self.cancelled {
            debug!(trace = %trace, success = ack.is_success, "cancel acknowledged");
            return self.cancel_acknowledged();
        }
        let target = ack.trace_id.clone().unwrap_or_else(|| trace.clone());
        let Some(entry) = self.registry.remove(&target) else {
            dropped("inactive_trace");
            return Vec::new();
        };
        self.tracker.remove(&target);
        let Some(slot) = self.slots.get_mut(&entry.query_index) else { return Vec::new() };
        slot.view.results.cancelled = true;
        slot.view.results.is_partial = true;
        match entry.kind {
            RequestKind::Search => slot.view.loading = false,
            RequestKind::Histogram => slot.view.histogram_loading = false,
            RequestKind::PageCount => {}
        }
        info!(trace = %target, "session: server cancelled request");
        vec![Effect::Notify(CANCELLED_NOTICE.to_string())]
    }
}
