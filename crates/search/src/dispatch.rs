//! Routing of decoded messages by (request kind, message kind).

use sluice_core::{RequestKind, StreamMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    SearchMetadata,
    SearchHits,
    /// Legacy single-shot response: metadata then hits.
    SearchSingle,
    HistogramMetadata,
    HistogramHits,
    HistogramSingle,
    PageCountMetadata,
    PageCountHits,
    PageCountSingle,
    Pattern,
    CancelAck,
    Error,
    /// No handler for this pair.
    Drop,
}

pub fn route(kind: RequestKind, msg: &StreamMessage) -> Route {
    use RequestKind::*;
    match (kind, msg) {
        (_, StreamMessage::Error(_)) => Route::Error,
        (_, StreamMessage::CancelAck(_)) => Route::CancelAck,
        (Search, StreamMessage::Metadata(_)) => Route::SearchMetadata,
        (Search, StreamMessage::Hits(_)) => Route::SearchHits,
        (Search, StreamMessage::Full(_)) => Route::SearchSingle,
        (Search, StreamMessage::Pattern(_)) => Route::Pattern,
        (Histogram, StreamMessage::Metadata(_)) => Route::HistogramMetadata,
        (Histogram, StreamMessage::Hits(_)) => Route::HistogramHits,
        (Histogram, StreamMessage::Full(_)) => Route::HistogramSingle,
        (PageCount, StreamMessage::Metadata(_)) => Route::PageCountMetadata,
        (PageCount, StreamMessage::Hits(_)) => Route::PageCountHits,
        (PageCount, StreamMessage::Full(_)) => Route::PageCountSingle,
        (Histogram | PageCount, StreamMessage::Pattern(_)) => Route::Drop,
    }
}
