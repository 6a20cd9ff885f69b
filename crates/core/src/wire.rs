//! Wire taxonomy of the messages the transport delivers.
//!
//! Frames arrive as `{"type": <kind>, "content": {...}}`. Kinds this crate does not know
//! decode to `None` so newer servers can add message types without breaking older clients.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::debug;

use crate::{OrderBy, Record, SluiceError, SluiceResult, TraceId};

/// Partition-boundary statistics (`search_response_metadata`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct MetadataResults {
    #[serde(default)]
    pub query_index: Option<usize>,
    /// Absent when the query did not ask for `track_total_hits`.
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub took: u64,
    #[serde(default)]
    pub scan_size: u64,
    #[serde(default)]
    pub order_by: Option<OrderBy>,
    /// Bucket width in seconds.
    #[serde(default)]
    pub histogram_interval: Option<i64>,
    #[serde(default)]
    pub streaming_aggs: bool,
    #[serde(default)]
    pub is_histogram_eligible: Option<bool>,
    #[serde(default)]
    pub function_error: Option<String>,
    #[serde(default)]
    pub new_start_time: Option<i64>,
    #[serde(default)]
    pub new_end_time: Option<i64>,
    #[serde(default)]
    pub is_partial: bool,
    #[serde(default)]
    pub time_offset: Option<TimeOffset>,
}

/// Range already covered by a partially answered request, used to resume it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TimeOffset {
    pub start_time: i64,
    pub end_time: i64,
}

/// One chunk of rows (`search_response_hits`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct HitsResults {
    #[serde(default)]
    pub hits: Vec<Record>,
    #[serde(default)]
    pub query_index: Option<usize>,
}

/// Legacy single-shot `search_response`: metadata and rows in one message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct FullResults {
    #[serde(flatten)]
    pub meta: MetadataResults,
    #[serde(default)]
    pub hits: Vec<Record>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CancelAck {
    #[serde(default)]
    pub trace_id: Option<TraceId>,
    #[serde(default)]
    pub is_success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(default)]
    pub code: Option<u16>,
    #[serde(default)]
    pub trace_id: Option<TraceId>,
    #[serde(default)]
    pub error_detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    Metadata(MetadataResults),
    Hits(HitsResults),
    Full(FullResults),
    /// Opaque pattern-extraction payload, stored verbatim.
    Pattern(serde_json::Value),
    CancelAck(CancelAck),
    Error(ErrorPayload),
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    content: serde_json::Value,
}

#[derive(Deserialize)]
struct ResultsContent<T> {
    results: T,
}

fn results<T: DeserializeOwned>(content: serde_json::Value) -> SluiceResult<T> {
    serde_json::from_value::<ResultsContent<T>>(content)
        .map(|c| c.results)
        .map_err(|e| SluiceError::Decode(e.to_string()))
}

fn plain<T: DeserializeOwned>(content: serde_json::Value) -> SluiceResult<T> {
    serde_json::from_value(content).map_err(|e| SluiceError::Decode(e.to_string()))
}

impl StreamMessage {
    /// Decode one text frame. `Ok(None)` means a well-formed frame of an unknown kind.
    pub fn decode(raw: &str) -> SluiceResult<Option<Self>> {
        let env: Envelope = serde_json::from_str(raw).map_err(|e| SluiceError::Decode(e.to_string()))?;
        Self::from_envelope(env)
    }

    pub fn from_value(v: serde_json::Value) -> SluiceResult<Option<Self>> {
        let env: Envelope = serde_json::from_value(v).map_err(|e| SluiceError::Decode(e.to_string()))?;
        Self::from_envelope(env)
    }

    fn from_envelope(env: Envelope) -> SluiceResult<Option<Self>> {
        let msg = match env.kind.as_str() {
            "search_response_metadata" => StreamMessage::Metadata(results(env.content)?),
            "search_response_hits" => StreamMessage::Hits(results(env.content)?),
            "search_response" => StreamMessage::Full(results(env.content)?),
            "pattern_extraction_result" => StreamMessage::Pattern(env.content),
            "cancel_response" => StreamMessage::CancelAck(plain(env.content)?),
            "error" => StreamMessage::Error(plain(env.content)?),
            other => {
                debug!(kind = %other, "unknown message kind; dropping");
                return Ok(None);
            }
        };
        Ok(Some(msg))
    }

    pub fn kind_label(&self) -> &'static str {
        match self {
            StreamMessage::Metadata(_) => "metadata",
            StreamMessage::Hits(_) => "hits",
            StreamMessage::Full(_) => "full",
            StreamMessage::Pattern(_) => "pattern",
            StreamMessage::CancelAck(_) => "cancel_ack",
            StreamMessage::Error(_) => "error",
        }
    }

    /// Sub-query slot the server attributed this message to, if any.
    pub fn query_index(&self) -> Option<usize> {
        match self {
            StreamMessage::Metadata(m) => m.query_index,
            StreamMessage::Hits(h) => h.query_index,
            StreamMessage::Full(f) => f.meta.query_index,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_metadata_frame() {
        let raw = json!({
            "type": "search_response_metadata",
            "content": { "results": { "total": 10, "took": 4, "scan_size": 1024, "order_by": "asc",
                "histogram_interval": 60, "streaming_aggs": true, "is_histogram_eligible": true } }
        });
        let msg = StreamMessage::from_value(raw).unwrap().unwrap();
        let StreamMessage::Metadata(m) = msg else { panic!("expected metadata") };
        assert_eq!(m.total, Some(10));
        assert_eq!(m.order_by, Some(OrderBy::Asc));
        assert_eq!(m.histogram_interval, Some(60));
        assert!(m.streaming_aggs);
        assert!(m.function_error.is_none());
    }

    #[test]
    fn decodes_legacy_single_shot_with_hits() {
        let raw = r#"{"type":"search_response","content":{"results":{"took":3,"scan_size":7,"hits":[{"a":1},{"a":2}]}}}"#;
        let StreamMessage::Full(f) = StreamMessage::decode(raw).unwrap().unwrap() else { panic!("expected full") };
        assert_eq!(f.hits.len(), 2);
        assert_eq!(f.meta.took, 3);
        assert_eq!(f.meta.total, None);
    }

    #[test]
    fn decodes_error_and_cancel() {
        let e = StreamMessage::decode(r#"{"type":"error","content":{"message":"boom","code":500,"trace_id":"t1"}}"#)
            .unwrap()
            .unwrap();
        assert_eq!(e, StreamMessage::Error(ErrorPayload { message: "boom".into(), code: Some(500), trace_id: Some("t1".into()), error_detail: None }));
        let c = StreamMessage::decode(r#"{"type":"cancel_response","content":{"trace_id":"t1","is_success":true}}"#)
            .unwrap()
            .unwrap();
        assert_eq!(c.kind_label(), "cancel_ack");
    }

    #[test]
    fn unknown_kind_is_dropped_not_failed() {
        let out = StreamMessage::decode(r#"{"type":"search_response_progress","content":{"percent":40}}"#).unwrap();
        assert!(out.is_none());
    }

    #[test]
    fn malformed_frame_is_a_decode_error() {
        let err = StreamMessage::decode("{not json").unwrap_err();
        assert!(matches!(err, SluiceError::Decode(_)));
        let err2 = StreamMessage::decode(r#"{"type":"search_response_hits","content":{}}"#).unwrap_err();
        assert!(matches!(err2, SluiceError::Decode(_)));
    }
}
