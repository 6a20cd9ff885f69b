//! Field catalog: which columns appear in the held rows, and how often.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use sluice_core::Record;
use sluice_store::FieldSummary;

/// Nested objects become `parent_child` keys; everything else is kept as is.
pub fn flatten_record(rec: &Record) -> Map<String, Value> {
    let mut out = Map::new();
    if let Value::Object(obj) = rec {
        flatten_into(&mut out, None, obj);
    }
    out
}

fn flatten_into(out: &mut Map<String, Value>, prefix: Option<&str>, obj: &Map<String, Value>) {
    for (k, v) in obj {
        let key = match prefix {
            Some(p) => format!("{}_{}", p, k),
            None => k.clone(),
        };
        match v {
            Value::Object(inner) if !inner.is_empty() => flatten_into(out, Some(&key), inner),
            other => {
                out.insert(key, other.clone());
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FieldCatalog {
    counts: BTreeMap<String, u64>,
}

impl FieldCatalog {
    pub fn observe(&mut self, rec: &Record) {
        for key in flatten_record(rec).keys() {
            *self.counts.entry(key.clone()).or_insert(0) += 1;
        }
    }

    pub fn extend<'a, I: IntoIterator<Item = &'a Record>>(&mut self, recs: I) {
        for r in recs {
            self.observe(r);
        }
    }

    pub fn len(&self) -> usize { self.counts.len() }

    pub fn is_empty(&self) -> bool { self.counts.is_empty() }

    pub fn summary(&self) -> Vec<FieldSummary> {
        self.counts.iter().map(|(name, count)| FieldSummary { name: name.clone(), count: *count }).collect()
    }
}

/// Synchronous catalog over a full row set.
pub fn catalog(recs: &[Record]) -> Vec<FieldSummary> {
    let mut c = FieldCatalog::default();
    c.extend(recs);
    c.summary()
}
