use crate::model::work_item::WorkItem;

use super::customer::{CustomerCatalog, CustomerResolution};

pub const SMOKE_MARKER: &str = "smoke";

fn normalize_tag(tag: &str) -> String {
    tag.trim().to_lowercase().replace(['_', ' '], "-")
}

fn has_override(item: &WorkItem, name: &str) -> bool {
    item.tags.iter().any(|t| normalize_tag(t) == name)
}

/// Marker expression handed to the test runner.
///
/// Smoke always runs, OR-ed with the customer's regression marker when one is
/// declared. A `smoke-only` tag drops the regression marker; a
/// `regression-only` tag drops smoke when the regression marker exists.
pub fn determine_test_markers(
    item: &WorkItem,
    customer: &CustomerResolution,
    catalog: &CustomerCatalog,
) -> String {
    if has_override(item, "smoke-only") {
        return SMOKE_MARKER.to_string();
    }

    let regression = customer
        .customer
        .as_deref()
        .and_then(|c| catalog.marker_for(c));

    match regression {
        Some(marker) if has_override(item, "regression-only") => marker.to_string(),
        Some(marker) => format!("{SMOKE_MARKER} or {marker}"),
        None => SMOKE_MARKER.to_string(),
    }
}
