//! Pure derivations from a work item snapshot: target branch, customer, test markers.

pub mod branch;
pub mod customer;
pub mod markers;

use serde::Serialize;

use crate::model::work_item::WorkItem;

use branch::{resolve_branch, BranchResolution};
use customer::{resolve_customer, CustomerCatalog, CustomerResolution};
use markers::determine_test_markers;

/// Everything the dispatcher derives from one work item.
#[derive(Debug, Clone, Serialize)]
pub struct Extraction {
    pub work_item_id: u64,
    pub customer: CustomerResolution,
    pub branch: Option<BranchResolution>,
    pub markers: String,
}

pub fn extract(item: &WorkItem, catalog: &CustomerCatalog) -> Extraction {
    let customer = resolve_customer(item, catalog);
    let markers = determine_test_markers(item, &customer, catalog);
    Extraction {
        work_item_id: item.id,
        branch: resolve_branch(item),
        customer,
        markers,
    }
}
