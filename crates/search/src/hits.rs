//! Hits merger: where a chunk of rows lands relative to what is already held.

use sluice_core::{OrderBy, Record};
use sluice_store::{Placement, ResultAccumulator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitsPlacement {
    Replace,
    Append,
    Prepend,
}

/// Descending results grow at the end; ascending ones grow at the front so that
/// the newest partition (scanned last) ends up first.
pub fn placement_for(placement: Placement, order_by: OrderBy) -> HitsPlacement {
    match (placement, order_by) {
        (Placement::Replace, _) => HitsPlacement::Replace,
        (Placement::Append, OrderBy::Desc) => HitsPlacement::Append,
        (Placement::Append, OrderBy::Asc) => HitsPlacement::Prepend,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HitsDelta {
    pub placement: HitsPlacement,
    pub hits: Vec<Record>,
}

pub fn plan(placement: Placement, order_by: OrderBy, hits: Vec<Record>) -> HitsDelta {
    HitsDelta { placement: placement_for(placement, order_by), hits }
}

pub fn apply(acc: &mut ResultAccumulator, delta: HitsDelta) {
    match delta.placement {
        HitsPlacement::Replace => acc.replace_hits(delta.hits),
        HitsPlacement::Append => acc.append_hits(delta.hits),
        HitsPlacement::Prepend => acc.prepend_hits(delta.hits),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn feed(order: OrderBy) -> Vec<Record> {
        let mut acc = ResultAccumulator::default();
        apply(&mut acc, plan(Placement::Replace, order, vec![json!("A"), json!("B")]));
        apply(&mut acc, plan(Placement::Append, order, vec![json!("C"), json!("D")]));
        acc.hits
    }

    #[test]
    fn desc_appends_partitions_in_arrival_order() {
        assert_eq!(feed(OrderBy::Desc), vec![json!("A"), json!("B"), json!("C"), json!("D")]);
    }

    #[test]
    fn asc_prepends_later_partitions() {
        assert_eq!(feed(OrderBy::Asc), vec![json!("C"), json!("D"), json!("A"), json!("B")]);
    }

    #[test]
    fn replace_discards_previous_rows() {
        let mut acc = ResultAccumulator::default();
        acc.replace_hits(vec![json!(1), json!(2)]);
        apply(&mut acc, plan(Placement::Replace, OrderBy::Desc, vec![json!(3)]));
        assert_eq!(acc.hits, vec![json!(3)]);
    }
}
