//! Async half of the lifecycle: starts requests, pumps their events through the session
//! on one task and publishes a snapshot after every step.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use sluice_core::{EngineConfig, ErrorPayload, RequestDescriptor, RequestKind, SluiceResult, TraceId};
use sluice_search::{Effect, Session};
use sluice_store::{SnapshotHandle, SnapshotPublisher, ViewSnapshot};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::fields::extract_fields;
use crate::transport::{CancelHandle, StreamHandle, Transport, TransportEvent};

struct LiveStream {
    cancel: CancelHandle,
    forward: tokio::task::JoinHandle<()>,
}

pub struct SearchDriver {
    transport: Arc<dyn Transport>,
    session: Session,
    publisher: SnapshotPublisher,
    handle: SnapshotHandle,
    inbox_tx: mpsc::Sender<(TraceId, TransportEvent)>,
    inbox_rx: mpsc::Receiver<(TraceId, TransportEvent)>,
    streams: HashMap<TraceId, LiveStream>,
    token: CancellationToken,
    notices: Vec<String>,
    /// Follow-up requests raised while reducing; started after the current event.
    pending: Vec<RequestDescriptor>,
    flatten_batch: usize,
}

impl SearchDriver {
    pub fn new(transport: Arc<dyn Transport>, config: EngineConfig) -> (Self, SnapshotHandle) {
        let (publisher, handle) = SnapshotPublisher::new();
        let (inbox_tx, inbox_rx) = mpsc::channel(config.queue_cap.max(1));
        let flatten_batch = config.flatten_batch;
        let driver = Self {
            transport,
            session: Session::new(config),
            publisher,
            handle: handle.clone(),
            inbox_tx,
            inbox_rx,
            streams: HashMap::new(),
            token: CancellationToken::new(),
            notices: Vec::new(),
            pending: Vec::new(),
            flatten_batch,
        };
        (driver, handle)
    }

    /// Token that cancels the current search when triggered. A fresh search started
    /// after a cancel gets a new token.
    pub fn cancel_token(&self) -> CancellationToken { self.token.clone() }

    pub fn session(&self) -> &Session { &self.session }

    /// User-visible notifications raised so far.
    pub fn notices(&self) -> &[String] { &self.notices }

    fn publish(&mut self) -> u64 { self.publisher.publish(self.session.views(), self.session.is_cancelled()) }

    /// Register and initiate a request. Superseded streams of the same slot are stopped.
    pub async fn start(&mut self, desc: RequestDescriptor) -> SluiceResult<TraceId> {
        if self.token.is_cancelled() && desc.kind == RequestKind::Search && !desc.is_pagination {
            self.token = CancellationToken::new();
        }
        let begun = self.session.begin(desc)?;
        for old in begun.superseded.iter().chain(begun.evicted.iter()) {
            self.stop_stream(old).await;
        }
        let trace = begun.request.trace_id.clone();
        let kind = begun.request.kind;
        let t0 = Instant::now();
        let StreamHandle { mut rx, cancel } = match self.transport.initiate(begun.request).await {
            Ok(h) => h,
            Err(e) => {
                let payload = ErrorPayload { message: e.to_string(), trace_id: Some(trace.clone()), ..Default::default() };
                let effects = self.session.fail(&trace, &payload);
                self.apply_effects(effects).await;
                self.publish();
                return Err(e);
            }
        };
        metrics::histogram!("sluice_initiate_ms", t0.elapsed().as_secs_f64() * 1000.0, "kind" => kind.as_str());
        info!(trace = %trace, kind = kind.as_str(), took_ms = %t0.elapsed().as_millis(), "driver: stream initiated");

        let tx = self.inbox_tx.clone();
        let tr = trace.clone();
        let forward = tokio::spawn(async move {
            while let Some(ev) = rx.recv().await {
                if tx.send((tr.clone(), ev)).await.is_err() {
                    return;
                }
            }
            // a closed stream counts as completion; a second completion is ignored
            let _ = tx.send((tr, TransportEvent::Complete)).await;
        });
        self.streams.insert(trace.clone(), LiveStream { cancel, forward });
        self.publish();
        Ok(trace)
    }

    /// Pump events until no request is live or the token fires.
    pub async fn run(&mut self) -> SluiceResult<Arc<ViewSnapshot>> {
        let t0 = Instant::now();
        let mut events = 0usize;
        while !self.session.live_traces().is_empty() {
            let token = self.token.clone();
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                ev = self.inbox_rx.recv() => ev,
            };
            match next {
                Some((trace, ev)) => {
                    events += 1;
                    self.handle_event(trace, ev).await;
                }
                None => {
                    self.cancel().await;
                    break;
                }
            }
        }
        info!(events, took_ms = %t0.elapsed().as_millis(), cancelled = self.session.is_cancelled(), "driver: run finished");
        Ok(self.handle.current())
    }

    async fn handle_event(&mut self, trace: TraceId, ev: TransportEvent) {
        let effects = match ev {
            TransportEvent::Data(msg) => self.session.dispatch(&trace, msg),
            TransportEvent::Error(e) => {
                self.streams.remove(&trace);
                self.session.fail(&trace, &e)
            }
            TransportEvent::Complete => {
                self.streams.remove(&trace);
                self.session.complete(&trace)
            }
            TransportEvent::Reset => {
                self.session.reset(&trace);
                Vec::new()
            }
        };
        self.apply_effects(effects).await;
        for desc in std::mem::take(&mut self.pending) {
            if let Err(e) = self.start(desc).await {
                warn!(error = %e, "driver: follow-up request failed");
            }
        }
        self.publish();
    }

    async fn apply_effects(&mut self, effects: Vec<Effect>) {
        for eff in effects {
            match eff {
                Effect::RefreshFields { query_index } => {
                    let fields = extract_fields(self.session.hits(query_index), self.flatten_batch).await;
                    self.session.set_fields(query_index, fields);
                }
                Effect::RequestPageCount(desc) => {
                    debug!(trace = %desc.trace_id, "driver: requesting exact page count");
                    self.pending.push(desc);
                }
                Effect::TimeRangeAdjusted { query_index, range } => {
                    info!(query_index, start = range.start_time, end = range.end_time, "driver: time range adjusted");
                }
                Effect::Notify(text) => {
                    info!(notice = %text, "driver: notify");
                    self.notices.push(text);
                }
            }
        }
    }

    async fn stop_stream(&mut self, trace: &TraceId) {
        if let Some(s) = self.streams.remove(trace) {
            s.cancel.cancel();
            s.forward.abort();
        }
        if let Err(e) = self.transport.cancel(trace).await {
            warn!(trace = %trace, error = %e, "driver: cancel request failed");
        }
    }

    /// Cancel everything in flight and tell the server. Safe to call repeatedly.
    pub async fn cancel(&mut self) -> Vec<TraceId> {
        self.token.cancel();
        let drained = self.session.cancel();
        if drained.is_empty() {
            return drained;
        }
        for t in &drained {
            if let Some(s) = self.streams.remove(t) {
                s.cancel.cancel();
                s.forward.abort();
            }
        }
        let transport = Arc::clone(&self.transport);
        let results = futures::future::join_all(drained.iter().map(|t| transport.cancel(t))).await;
        let failed = results.iter().filter(|r| r.is_err()).count();
        metrics::counter!("sluice_cancel_requests_total", drained.len() as u64);
        info!(cancelled = drained.len(), failed, "driver: cancelled");
        if failed < drained.len() {
            let effects = self.session.cancel_acknowledged();
            self.apply_effects(effects).await;
        }
        self.publish();
        drained
    }
}
