//! Registry of in-flight trace ids.

use std::collections::VecDeque;

use rustc_hash::FxHashMap;
use sluice_core::{RequestKind, TraceId};
use tracing::{debug, warn};

/// What the registry remembers about a live request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceEntry {
    pub kind: RequestKind,
    pub query_index: usize,
    pub is_pagination: bool,
}

/// Live trace ids in registration order with a fixed capacity. When full, the oldest
/// entry is evicted so a session that never completes cannot grow the map unbounded.
pub struct TraceRegistry {
    map: FxHashMap<TraceId, TraceEntry>,
    order: VecDeque<TraceId>,
    cap: usize,
    evicted: u64,
}

impl TraceRegistry {
    pub fn with_capacity(cap: usize) -> Self {
        Self { map: FxHashMap::default(), order: VecDeque::new(), cap: cap.max(1), evicted: 0 }
    }

    pub fn len(&self) -> usize { self.map.len() }
    pub fn is_empty(&self) -> bool { self.map.is_empty() }
    pub fn evicted(&self) -> u64 { self.evicted }

    /// Register a trace id. Returns the id evicted to make room, if any.
    pub fn register(&mut self, id: TraceId, entry: TraceEntry) -> Option<TraceId> {
        let mut out = None;
        if !self.map.contains_key(&id) {
            if self.order.len() >= self.cap {
                if let Some(old) = self.order.pop_front() {
                    self.map.remove(&old);
                    self.evicted += 1;
                    warn!(trace = %old, cap = self.cap, "trace registry full; evicting oldest");
                    out = Some(old);
                }
            }
            self.order.push_back(id.clone());
        }
        debug!(trace = %id, kind = entry.kind.as_str(), "trace registered");
        self.map.insert(id, entry);
        metrics::gauge!("sluice_live_traces", self.map.len() as f64);
        out
    }

    pub fn contains(&self, id: &TraceId) -> bool { self.map.contains_key(id) }

    pub fn get(&self, id: &TraceId) -> Option<&TraceEntry> { self.map.get(id) }

    pub fn remove(&mut self, id: &TraceId) -> Option<TraceEntry> {
        let removed = self.map.remove(id);
        if removed.is_some() {
            self.order.retain(|x| x != id);
            metrics::gauge!("sluice_live_traces", self.map.len() as f64);
        }
        removed
    }

    /// Remove every entry, returning the ids in registration order.
    pub fn drain(&mut self) -> Vec<TraceId> {
        self.map.clear();
        metrics::gauge!("sluice_live_traces", 0.0);
        self.order.drain(..).collect()
    }

    pub fn ids(&self) -> impl Iterator<Item = &TraceId> { self.order.iter() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> TraceEntry { TraceEntry { kind: RequestKind::Search, query_index: 0, is_pagination: false } }

    #[test]
    fn register_remove_roundtrip() {
        let mut r = TraceRegistry::with_capacity(4);
        r.register("a".into(), entry());
        r.register("b".into(), entry());
        assert!(r.contains(&"a".into()));
        assert_eq!(r.remove(&"a".into()).map(|e| e.kind), Some(RequestKind::Search));
        assert!(!r.contains(&"a".into()));
        assert!(r.remove(&"a".into()).is_none());
        assert_eq!(r.len(), 1);
    }

    #[test]
    fn capacity_evicts_oldest_first() {
        let mut r = TraceRegistry::with_capacity(2);
        assert!(r.register("a".into(), entry()).is_none());
        assert!(r.register("b".into(), entry()).is_none());
        // re-registering an existing id does not evict
        assert!(r.register("b".into(), entry()).is_none());
        assert_eq!(r.register("c".into(), entry()), Some(TraceId::from("a")));
        assert_eq!(r.evicted(), 1);
        assert_eq!(r.ids().map(|t| t.as_str().to_string()).collect::<Vec<_>>(), vec!["b", "c"]);
    }

    #[test]
    fn drain_returns_registration_order_and_empties() {
        let mut r = TraceRegistry::with_capacity(8);
        for id in ["x", "y", "z"] { r.register(id.into(), entry()); }
        let drained: Vec<String> = r.drain().into_iter().map(|t| t.to_string()).collect();
        assert_eq!(drained, vec!["x", "y", "z"]);
        assert!(r.is_empty());
        assert!(r.drain().is_empty());
    }
}
