//! Sluice search: reconciliation of streamed search fragments into per-query views.
//!
//! Fragments of one logical query (row chunks, partition metadata, histogram buckets,
//! page counts) arrive interleaved and split by time partition. [`Session`] routes each
//! one by trace id and request kind, computes a delta and folds it into the slot's view.
//! Side effects the engine cannot perform itself come back as [`Effect`]s.

#![forbid(unsafe_code)]

use serde::Serialize;
use sluice_core::{RequestDescriptor, TimeRange};

pub mod dispatch;
pub mod fields;
pub mod histogram;
pub mod hits;
pub mod metadata;
pub mod page_count;
pub mod reduce;
pub mod session;

pub use dispatch::{route, Route};
pub use fields::{catalog, flatten_record, FieldCatalog};
pub use hits::HitsPlacement;
pub use page_count::Estimate;
pub use reduce::{Delta, QuerySlot};
pub use session::{Begin, Session};

/// Work requested by the reducer and carried out by the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Effect {
    /// Rows of the slot changed; field catalog is stale.
    RefreshFields { query_index: usize },
    /// Issue an exact count for this query.
    RequestPageCount(RequestDescriptor),
    /// The server narrowed the range; the caller's time picker should follow.
    TimeRangeAdjusted { query_index: usize, range: TimeRange },
    /// User-visible notification.
    Notify(String),
}
