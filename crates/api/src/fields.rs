//! Field extraction off the reconciliation path.

use sluice_core::Record;
use sluice_search::FieldCatalog;
use sluice_store::FieldSummary;
use tracing::debug;

/// Build the field catalog in batches of `batch` records, yielding between batches so
/// large result sets do not starve other tasks.
pub async fn extract_fields(records: &[Record], batch: usize) -> Vec<FieldSummary> {
    let mut catalog = FieldCatalog::default();
    let mut batches = 0usize;
    for chunk in records.chunks(batch.max(1)) {
        catalog.extend(chunk);
        batches += 1;
        tokio::task::yield_now().await;
    }
    debug!(records = records.len(), batches, fields = catalog.len(), "fields extracted");
    catalog.summary()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn batched_extraction_matches_sync_catalog() {
        let rows: Vec<Record> = (0..25).map(|i| if i % 5 == 0 { json!({"a": i, "b": {"c": 1}}) } else { json!({"a": i}) }).collect();
        let batched = extract_fields(&rows, 4).await;
        assert_eq!(batched, sluice_search::catalog(&rows));
        assert_eq!(batched.iter().find(|f| f.name == "b_c").map(|f| f.count), Some(5));
    }

    #[tokio::test]
    async fn empty_input_is_empty_catalog() {
        assert!(extract_fields(&[], 0).await.is_empty());
    }
}
