//! Sluice core types: request descriptors, parsed-query facts, wire messages and errors.

#![forbid(unsafe_code)]

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub mod config;
pub mod error;
pub mod wire;

pub use config::{EngineConfig, PageCountSkip};
pub use error::{format_user_error, SluiceError, SluiceResult};
pub use wire::{
    CancelAck, ErrorPayload, FullResults, HitsResults, MetadataResults, StreamMessage, TimeOffset,
};

/// A single result row as delivered by the server.
pub type Record = serde_json::Value;

/// Identifier correlating every message of one request attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TraceId(String);

impl TraceId {
    /// Fresh random id (uuid v4, hyphenless).
    pub fn generate() -> Self { Self(uuid::Uuid::new_v4().simple().to_string()) }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl std::fmt::Display for TraceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for TraceId {
    fn from(v: &str) -> Self { Self(v.to_string()) }
}

impl From<String> for TraceId {
    fn from(v: String) -> Self { Self(v) }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum RequestKind {
    #[serde(rename = "search")]
    Search,
    #[serde(rename = "histogram")]
    Histogram,
    #[serde(rename = "pageCount")]
    PageCount,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Search => "search",
            RequestKind::Histogram => "histogram",
            RequestKind::PageCount => "pageCount",
        }
    }
}

/// Sort order of hits; `desc` when the server leaves it unspecified.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum OrderBy {
    #[serde(rename = "asc", alias = "ASC")]
    Asc,
    #[serde(rename = "desc", alias = "DESC")]
    #[default]
    Desc,
}

/// Closed time window in microseconds since the epoch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TimeRange {
    pub start_time: i64,
    pub end_time: i64,
}

/// Fully-formed request payload handed over by the query builder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct QueryPayload {
    pub sql: String,
    pub start_time: i64,
    pub end_time: i64,
    #[serde(default)]
    pub from: u64,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub track_total_hits: bool,
    /// Histogram bucket width in seconds, when the builder already knows it.
    #[serde(default)]
    pub histogram_interval: Option<i64>,
}

impl QueryPayload {
    pub fn time_range(&self) -> TimeRange {
        TimeRange { start_time: self.start_time, end_time: self.end_time }
    }
}

/// Read-only facts about the parsed query. The engine never parses query text itself;
/// `sniff` exists for callers (CLI replays) that have no parser at hand.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct QueryFacts {
    #[serde(default)]
    pub sql_mode: bool,
    #[serde(default)]
    pub has_aggregation: bool,
    #[serde(default)]
    pub has_limit: bool,
    #[serde(default)]
    pub has_distinct: bool,
    #[serde(default)]
    pub has_with: bool,
}

impl QueryFacts {
    pub fn sniff(sql: &str) -> Self {
        static LIMIT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\blimit\s+\d+").unwrap());
        static AGG_RE: Lazy<Regex> = Lazy::new(|| {
            Regex::new(r"(?i)\b(count|sum|avg|min|max|approx_distinct|histogram)\s*\(|\bgroup\s+by\b").unwrap()
        });
        static DISTINCT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bselect\s+distinct\b").unwrap());
        static WITH_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^\s*with\b").unwrap());
        static SQL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^\s*(select|with)\b").unwrap());
        Self {
            sql_mode: SQL_RE.is_match(sql),
            has_aggregation: AGG_RE.is_match(sql),
            has_limit: LIMIT_RE.is_match(sql),
            has_distinct: DISTINCT_RE.is_match(sql),
            has_with: WITH_RE.is_match(sql),
        }
    }
}

/// Caller-supplied metadata carried alongside a request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestMeta {
    /// Sub-query slot in a multi-query panel.
    #[serde(default)]
    pub query_index: usize,
    #[serde(default)]
    pub panel_id: Option<String>,
    #[serde(default)]
    pub stream_name: Option<String>,
    /// 1-based page currently shown.
    #[serde(default = "default_page")]
    pub current_page: u64,
    #[serde(default)]
    pub rows_per_page: u64,
    #[serde(default)]
    pub show_histogram: bool,
}

fn default_page() -> u64 { 1 }

impl Default for RequestMeta {
    fn default() -> Self {
        Self {
            query_index: 0,
            panel_id: None,
            stream_name: None,
            current_page: 1,
            rows_per_page: 0,
            show_histogram: false,
        }
    }
}

/// One logical query execution. Immutable once issued; many inbound messages map to it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestDescriptor {
    pub trace_id: TraceId,
    pub kind: RequestKind,
    #[serde(default)]
    pub is_pagination: bool,
    pub query: QueryPayload,
    #[serde(default)]
    pub facts: QueryFacts,
    #[serde(default)]
    pub meta: RequestMeta,
}

impl RequestDescriptor {
    pub fn new(kind: RequestKind, query: QueryPayload) -> Self {
        Self {
            trace_id: TraceId::generate(),
            kind,
            is_pagination: false,
            query,
            facts: QueryFacts::default(),
            meta: RequestMeta::default(),
        }
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<TraceId>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    pub fn with_facts(mut self, facts: QueryFacts) -> Self {
        self.facts = facts;
        self
    }

    pub fn with_meta(mut self, meta: RequestMeta) -> Self {
        self.meta = meta;
        self
    }

    pub fn paginated(mut self) -> Self {
        self.is_pagination = true;
        self
    }

    /// Derive a follow-up request of another kind for the same query (fresh trace id).
    pub fn derive(&self, kind: RequestKind) -> Self {
        Self {
            trace_id: TraceId::generate(),
            kind,
            is_pagination: false,
            query: self.query.clone(),
            facts: self.facts,
            meta: self.meta.clone(),
        }
    }
}

pub mod prelude {
    pub use super::{
        OrderBy, QueryFacts, QueryPayload, Record, RequestDescriptor, RequestKind, RequestMeta, TimeRange, TraceId,
    };
    pub use super::wire::StreamMessage;
    pub use super::error::{SluiceError, SluiceResult};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniff_detects_limit_and_aggregation() {
        let f = QueryFacts::sniff("SELECT * FROM logs WHERE level = 'error' LIMIT 10");
        assert!(f.sql_mode);
        assert!(f.has_limit);
        assert!(!f.has_aggregation);

        let g = QueryFacts::sniff("select host, count(*) from logs group by host");
        assert!(g.has_aggregation);
        assert!(!g.has_limit);
    }

    #[test]
    fn sniff_detects_distinct_and_with() {
        let f = QueryFacts::sniff("WITH t AS (SELECT 1) SELECT DISTINCT a FROM t");
        assert!(f.has_with);
        assert!(f.has_distinct);
        assert!(f.sql_mode);
        assert!(!QueryFacts::sniff("level:error").sql_mode);
    }

    #[test]
    fn request_kind_uses_camel_case_on_the_wire() {
        assert_eq!(serde_json::to_string(&RequestKind::PageCount).unwrap(), "\"pageCount\"");
        let k: RequestKind = serde_json::from_str("\"histogram\"").unwrap();
        assert_eq!(k, RequestKind::Histogram);
    }

    #[test]
    fn order_by_defaults_to_desc_and_accepts_upper_case() {
        assert_eq!(OrderBy::default(), OrderBy::Desc);
        let o: OrderBy = serde_json::from_str("\"ASC\"").unwrap();
        assert_eq!(o, OrderBy::Asc);
    }

    #[test]
    fn derive_keeps_query_and_issues_new_trace() {
        let base = RequestDescriptor::new(RequestKind::Search, QueryPayload { sql: "select 1".into(), size: 50, ..Default::default() })
            .with_trace_id("t-1");
        let pc = base.derive(RequestKind::PageCount);
        assert_eq!(pc.kind, RequestKind::PageCount);
        assert_eq!(pc.query, base.query);
        assert_ne!(pc.trace_id, base.trace_id);
    }
}
