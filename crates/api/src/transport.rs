//! Transport seam: how requests go out and how their events come back.

use std::collections::HashMap;
use std::sync::Mutex;

use sluice_core::{ErrorPayload, RequestDescriptor, RequestKind, SluiceResult, StreamMessage, TraceId};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// One event of a request's stream.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Data(StreamMessage),
    Error(ErrorPayload),
    Complete,
    /// Connection re-established; the server replays the request from the start.
    Reset,
}

impl TransportEvent {
    pub fn is_terminal(&self) -> bool { matches!(self, TransportEvent::Complete | TransportEvent::Error(_)) }
}

/// Cancellation handle that aborts the underlying task.
pub struct CancelHandle {
    task: Option<tokio::task::JoinHandle<()>>,
}

impl CancelHandle {
    pub fn new(task: tokio::task::JoinHandle<()>) -> Self { Self { task: Some(task) } }

    pub fn noop() -> Self { Self { task: None } }

    pub fn cancel(mut self) {
        if let Some(h) = self.task.take() {
            h.abort();
        }
    }
}

/// Generic stream handle returned by [`Transport::initiate`].
pub struct StreamHandle<T> {
    pub rx: mpsc::Receiver<T>,
    pub cancel: CancelHandle,
}

#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Start a request; its events arrive on the returned handle.
    async fn initiate(&self, request: RequestDescriptor) -> SluiceResult<StreamHandle<TransportEvent>>;

    /// Ask the server to stop a request.
    async fn cancel(&self, trace_id: &TraceId) -> SluiceResult<()>;
}

// ----------------- Replay implementation -----------------

/// Plays back scripted events per request kind. Used by tests and `sluicectl replay`.
pub struct ReplayTransport {
    scripts: HashMap<RequestKind, Vec<TransportEvent>>,
    hold_open: bool,
    queue_cap: usize,
    initiated: Mutex<Vec<RequestDescriptor>>,
    cancelled: Mutex<Vec<TraceId>>,
}

impl Default for ReplayTransport {
    fn default() -> Self {
        Self {
            scripts: HashMap::new(),
            hold_open: false,
            queue_cap: 2048,
            initiated: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
        }
    }
}

impl ReplayTransport {
    pub fn new() -> Self { Self::default() }

    pub fn with_script(mut self, kind: RequestKind, events: Vec<TransportEvent>) -> Self {
        self.scripts.insert(kind, events);
        self
    }

    pub fn with_queue_cap(mut self, cap: usize) -> Self {
        self.queue_cap = cap.max(1);
        self
    }

    /// Keep streams open after the script runs out, like a server still scanning.
    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    pub fn initiated(&self) -> Vec<RequestDescriptor> {
        self.initiated.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn cancelled(&self) -> Vec<TraceId> { self.cancelled.lock().map(|v| v.clone()).unwrap_or_default() }
}

#[async_trait::async_trait]
impl Transport for ReplayTransport {
    async fn initiate(&self, request: RequestDescriptor) -> SluiceResult<StreamHandle<TransportEvent>> {
        let events = self.scripts.get(&request.kind).cloned().unwrap_or_default();
        debug!(trace = %request.trace_id, kind = request.kind.as_str(), events = events.len(), "replay: initiate");
        if let Ok(mut v) = self.initiated.lock() {
            v.push(request);
        }
        let (tx, rx) = mpsc::channel(self.queue_cap);
        let hold = self.hold_open;
        let task = tokio::spawn(async move {
            let terminal = events.last().map(|e| e.is_terminal()).unwrap_or(false);
            for ev in events {
                if tx.send(ev).await.is_err() {
                    return;
                }
            }
            if hold {
                std::future::pending::<()>().await;
            } else if !terminal {
                let _ = tx.send(TransportEvent::Complete).await;
            }
        });
        Ok(StreamHandle { rx, cancel: CancelHandle::new(task) })
    }

    async fn cancel(&self, trace_id: &TraceId) -> SluiceResult<()> {
        info!(trace = %trace_id, "replay: cancel");
        if let Ok(mut v) = self.cancelled.lock() {
            v.push(trace_id.clone());
        }
        Ok(())
    }
}
