//! Sluice store: trace registry, partition tracker, accumulators and the snapshot swap
//! readers use to observe them.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Serialize;
use tokio::sync::watch;
use tracing::trace;

pub mod accum;
pub mod partition;
pub mod registry;

pub use accum::{
    Bucket, FieldSummary, HistogramAccumulator, HistogramError, HistogramState, QueryError, ResultAccumulator,
};
pub use partition::{FragmentEvent, PartitionState, PartitionTracker, Placement};
pub use registry::{TraceEntry, TraceRegistry};

/// Everything a renderer needs for one sub-query.
#[derive(Debug, Clone, Serialize, Default, PartialEq)]
pub struct QueryView {
    pub results: ResultAccumulator,
    pub histogram: HistogramAccumulator,
    pub loading: bool,
    pub histogram_loading: bool,
}

/// Immutable view published after every reconciliation step.
#[derive(Debug, Clone, Serialize, Default, PartialEq)]
pub struct ViewSnapshot {
    pub epoch: u64,
    pub queries: BTreeMap<usize, QueryView>,
    pub cancelled: bool,
}

impl ViewSnapshot {
    pub fn query(&self, index: usize) -> Option<&QueryView> { self.queries.get(&index) }

    pub fn is_loading(&self) -> bool { self.queries.values().any(|q| q.loading || q.histogram_loading) }
}

/// Writer side: swaps in fresh snapshots and bumps the epoch.
pub struct SnapshotPublisher {
    snap: Arc<ArcSwap<ViewSnapshot>>,
    epoch_tx: watch::Sender<u64>,
    epoch: u64,
}

/// Reader side: current snapshot plus epoch change notifications.
#[derive(Clone)]
pub struct SnapshotHandle {
    snap: Arc<ArcSwap<ViewSnapshot>>,
    epoch_rx: watch::Receiver<u64>,
}

impl SnapshotHandle {
    pub fn current(&self) -> Arc<ViewSnapshot> { self.snap.load_full() }
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_rx.clone() }
}

impl SnapshotPublisher {
    pub fn new() -> (Self, SnapshotHandle) {
        let snap = Arc::new(ArcSwap::from_pointee(ViewSnapshot::default()));
        let (epoch_tx, epoch_rx) = watch::channel(0u64);
        let handle = SnapshotHandle { snap: Arc::clone(&snap), epoch_rx };
        (Self { snap, epoch_tx, epoch: 0 }, handle)
    }

    pub fn epoch(&self) -> u64 { self.epoch }

    pub fn publish(&mut self, queries: BTreeMap<usize, QueryView>, cancelled: bool) -> u64 {
        self.epoch = self.epoch.saturating_add(1);
        let next = ViewSnapshot { epoch: self.epoch, queries, cancelled };
        self.snap.store(Arc::new(next));
        let _ = self.epoch_tx.send(self.epoch);
        trace!(epoch = self.epoch, "snapshot published");
        self.epoch
    }
}
