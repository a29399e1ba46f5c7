use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Snapshot of a work item as returned by the tracking service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: u64,
    pub title: String,
    pub work_item_type: String,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub board_column: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Free text, already reduced from HTML to plain text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acceptance_criteria: Option<String>,
    #[serde(default)]
    pub relations: Vec<Relation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changed_date: Option<DateTime<Utc>>,
    /// Scalar `Custom.*` / `Microsoft.VSTS.*` fields, stringified.
    #[serde(default)]
    pub custom_fields: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub rel: String,
    pub url: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl Relation {
    /// Development links (branches, commits, pull requests) share this kind.
    pub fn is_artifact_link(&self) -> bool {
        self.rel == "ArtifactLink"
    }
}

impl WorkItem {
    pub fn new(id: u64, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            work_item_type: String::new(),
            state: String::new(),
            board_column: None,
            tags: Vec::new(),
            description: None,
            acceptance_criteria: None,
            relations: Vec::new(),
            assigned_to: None,
            changed_date: None,
            custom_fields: BTreeMap::new(),
            url: None,
        }
    }

    /// Description and acceptance criteria joined for pattern scanning.
    pub fn free_text(&self) -> String {
        [self.description.as_deref(), self.acceptance_criteria.as_deref()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ")
    }
}
