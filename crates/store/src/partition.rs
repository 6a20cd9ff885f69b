//! Partition/chunk bookkeeping per trace id.
//!
//! Metadata events open partitions; hit events count chunks within the partition that is
//! currently open. The append/replace decision for every fragment is derived from those
//! counters alone, so it is testable without any accumulator.

use std::collections::VecDeque;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use sluice_core::TraceId;
use tracing::{debug, warn};

/// Where a fragment's rows go relative to what is already held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Replace,
    Append,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentEvent {
    /// Partition boundary (`search_response_metadata`).
    Metadata,
    /// A chunk of rows within the open partition.
    Hits { streaming_aggs: bool, non_empty: bool },
}

/// Counters for one trace id. `chunk_counts[i]` and `filled[i]` belong to partition `i + 1`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionState {
    partition_count: u32,
    chunk_counts: SmallVec<[u32; 8]>,
    /// Partition already delivered at least one non-empty chunk.
    filled: SmallVec<[bool; 8]>,
}

impl PartitionState {
    pub fn partition_count(&self) -> u32 { self.partition_count }

    /// 1-based index of the open partition, 0 before any partition opened.
    pub fn current_partition(&self) -> usize { self.partition_count as usize }

    pub fn chunk_count(&self, partition: usize) -> u32 {
        if partition == 0 { return 0; }
        self.chunk_counts.get(partition - 1).copied().unwrap_or(0)
    }

    pub fn current_chunk_count(&self) -> u32 { self.chunk_count(self.current_partition()) }

    fn current_filled(&self) -> bool { self.filled.last().copied().unwrap_or(false) }

    /// True when the accumulator already holds content for this search.
    pub fn appends(&self) -> bool { self.partition_count > 1 || self.current_chunk_count() > 1 }

    /// Placement for a chunk of the open partition. The first non-empty chunk of a partition
    /// restating a streaming aggregate replaces whatever earlier partitions left behind.
    pub fn placement(&self, streaming_aggs: bool, non_empty: bool) -> Placement {
        if streaming_aggs && non_empty && !self.current_filled() {
            return Placement::Replace;
        }
        if self.appends() { Placement::Append } else { Placement::Replace }
    }

    /// Pure transition: the next state plus, for hit events, where the rows go.
    pub fn observe(&self, ev: FragmentEvent) -> (PartitionState, Option<Placement>) {
        let mut next = self.clone();
        match ev {
            FragmentEvent::Metadata => {
                next.partition_count += 1;
                next.chunk_counts.push(0);
                next.filled.push(false);
                (next, None)
            }
            FragmentEvent::Hits { streaming_aggs, non_empty } => {
                if next.partition_count == 0 {
                    // rows before any boundary belong to an implicit first partition
                    next.partition_count = 1;
                    next.chunk_counts.push(0);
                    next.filled.push(false);
                }
                if let Some(last) = next.chunk_counts.last_mut() {
                    *last += 1;
                }
                let placement = next.placement(streaming_aggs, non_empty);
                if let Some(f) = next.filled.last_mut() {
                    *f |= non_empty;
                }
                (next, Some(placement))
            }
        }
    }
}

/// Arena of partition states keyed by trace id, capped like the registry.
pub struct PartitionTracker {
    states: FxHashMap<TraceId, PartitionState>,
    order: VecDeque<TraceId>,
    cap: usize,
    evicted: u64,
}

impl PartitionTracker {
    pub fn with_capacity(cap: usize) -> Self {
        Self { states: FxHashMap::default(), order: VecDeque::new(), cap: cap.max(1), evicted: 0 }
    }

    pub fn len(&self) -> usize { self.states.len() }
    pub fn is_empty(&self) -> bool { self.states.is_empty() }
    pub fn evicted(&self) -> u64 { self.evicted }

    /// Start a trace id from zero. Must run before any fragment of a new search.
    pub fn reset(&mut self, id: &TraceId) {
        if !self.states.contains_key(id) {
            if self.order.len() >= self.cap {
                if let Some(old) = self.order.pop_front() {
                    self.states.remove(&old);
                    self.evicted += 1;
                    warn!(trace = %old, "partition tracker full; evicting oldest");
                }
            }
            self.order.push_back(id.clone());
        }
        self.states.insert(id.clone(), PartitionState::default());
    }

    pub fn state(&self, id: &TraceId) -> Option<&PartitionState> { self.states.get(id) }

    pub fn remove(&mut self, id: &TraceId) -> Option<PartitionState> {
        let out = self.states.remove(id);
        if out.is_some() { self.order.retain(|x| x != id); }
        out
    }

    pub fn clear(&mut self) {
        self.states.clear();
        self.order.clear();
    }

    /// Apply an event and return the placement decision (hit events only).
    pub fn observe(&mut self, id: &TraceId, ev: FragmentEvent) -> Option<Placement> {
        if !self.states.contains_key(id) {
            debug!(trace = %id, "fragment for untracked trace; starting fresh state");
            self.reset(id);
        }
        let current = self.states.get(id).cloned().unwrap_or_default();
        let (next, placement) = current.observe(ev);
        self.states.insert(id.clone(), next);
        placement
    }

    /// Open the next partition; returns its 1-based index.
    pub fn on_metadata(&mut self, id: &TraceId) -> usize {
        self.observe(id, FragmentEvent::Metadata);
        self.states.get(id).map(|s| s.current_partition()).unwrap_or(0)
    }

    /// Count one chunk in the open partition; returns the updated chunk count.
    pub fn on_hits(&mut self, id: &TraceId) -> u32 {
        self.observe(id, FragmentEvent::Hits { streaming_aggs: false, non_empty: false });
        self.states.get(id).map(|s| s.current_chunk_count()).unwrap_or(0)
    }

    pub fn should_append(&self, id: &TraceId, streaming_aggs: bool, non_empty: bool) -> bool {
        self.states
            .get(id)
            .map(|s| s.placement(streaming_aggs, non_empty) == Placement::Append)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hits(streaming_aggs: bool, non_empty: bool) -> FragmentEvent { FragmentEvent::Hits { streaming_aggs, non_empty } }

    #[test]
    fn first_fragment_never_appends() {
        let s = PartitionState::default();
        let (s, _) = s.observe(FragmentEvent::Metadata);
        let (_, p) = s.observe(hits(false, true));
        assert_eq!(p, Some(Placement::Replace));
    }

    #[test]
    fn second_chunk_and_second_partition_append() {
        let (s, _) = PartitionState::default().observe(FragmentEvent::Metadata);
        let (s, _) = s.observe(hits(false, true));
        let (s, p) = s.observe(hits(false, true));
        assert_eq!(p, Some(Placement::Append));
        assert_eq!(s.current_chunk_count(), 2);
        let (s, _) = s.observe(FragmentEvent::Metadata);
        assert_eq!(s.current_chunk_count(), 0);
        let (s, p) = s.observe(hits(false, true));
        assert_eq!(p, Some(Placement::Append));
        assert_eq!(s.partition_count(), 2);
        assert_eq!(s.chunk_count(1), 2);
        assert_eq!(s.chunk_count(2), 1);
    }

    #[test]
    fn streaming_aggs_first_chunk_replaces_but_later_chunks_append() {
        let (s, _) = PartitionState::default().observe(FragmentEvent::Metadata);
        let (s, _) = s.observe(hits(true, true));
        let (s, _) = s.observe(FragmentEvent::Metadata);
        let (s, p) = s.observe(hits(true, true));
        assert_eq!(p, Some(Placement::Replace));
        let (_, p) = s.observe(hits(true, true));
        assert_eq!(p, Some(Placement::Append));
    }

    #[test]
    fn streaming_aggs_empty_fragment_does_not_replace() {
        let (s, _) = PartitionState::default().observe(FragmentEvent::Metadata);
        let (s, _) = s.observe(hits(true, true));
        let (s, _) = s.observe(FragmentEvent::Metadata);
        let (_, p) = s.observe(hits(true, false));
        assert_eq!(p, Some(Placement::Append));
    }

    #[test]
    fn streaming_aggs_replace_waits_for_first_non_empty_chunk() {
        let (s, _) = PartitionState::default().observe(FragmentEvent::Metadata);
        let (s, _) = s.observe(hits(true, true));
        let (s, _) = s.observe(FragmentEvent::Metadata);
        let (s, p) = s.observe(hits(true, false));
        assert_eq!(p, Some(Placement::Append));
        let (s, p) = s.observe(hits(true, true));
        assert_eq!(p, Some(Placement::Replace));
        let (_, p) = s.observe(hits(true, true));
        assert_eq!(p, Some(Placement::Append));
    }

    #[test]
    fn hits_without_metadata_open_implicit_partition() {
        let (s, p) = PartitionState::default().observe(hits(false, true));
        assert_eq!(p, Some(Placement::Replace));
        assert_eq!(s.partition_count(), 1);
        assert_eq!(s.current_chunk_count(), 1);
    }

    #[test]
    fn tracker_counters_and_removal() {
        let mut t = PartitionTracker::with_capacity(4);
        let id = TraceId::from("t");
        t.reset(&id);
        assert_eq!(t.on_metadata(&id), 1);
        assert_eq!(t.on_hits(&id), 1);
        assert!(!t.should_append(&id, false, true));
        assert_eq!(t.on_hits(&id), 2);
        assert!(t.should_append(&id, false, true));
        assert_eq!(t.on_metadata(&id), 2);
        assert_eq!(t.state(&id).map(|s| s.current_chunk_count()), Some(0));
        assert!(t.remove(&id).is_some());
        assert!(t.is_empty());
    }

    #[test]
    fn tracker_evicts_oldest_when_full() {
        let mut t = PartitionTracker::with_capacity(2);
        for id in ["a", "b", "c"] { t.reset(&TraceId::from(id)); }
        assert_eq!(t.len(), 2);
        assert_eq!(t.evicted(), 1);
        assert!(t.state(&TraceId::from("a")).is_none());
    }
}
