use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use super::{check_status, http_client, ColumnQuery, GatewayResult, WorkTracker};
use crate::config::AzureSettings;
use crate::error::GatewayError;
use crate::model::work_item::{Relation, WorkItem};
use crate::util::html::html_to_text;

const API_VERSION: &str = "7.1";

/// The work items endpoint accepts at most this many ids per call.
const BATCH_SIZE: usize = 200;

pub struct AzureDevOpsClient {
    base_url: String,
    project: String,
    auth_header: String,
    client: reqwest::Client,
}

impl AzureDevOpsClient {
    pub fn new(settings: &AzureSettings) -> GatewayResult<Self> {
        let creds = format!(":{}", settings.pat);
        let encoded = base64::engine::general_purpose::STANDARD.encode(creds);
        Ok(Self {
            base_url: format!("https://dev.azure.com/{}", settings.organization),
            project: settings.project.clone(),
            auth_header: format!("Basic {encoded}"),
            client: http_client()?,
        })
    }

    fn project_url(&self) -> String {
        format!("{}/{}", self.base_url, urlencoding::encode(&self.project))
    }

    async fn fetch_batch(&self, ids: &[u64]) -> GatewayResult<Vec<RawWorkItem>> {
        let ids = ids
            .iter()
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let url = format!(
            "{}/_apis/wit/workitems?ids={ids}&$expand=relations&api-version={API_VERSION}",
            self.project_url()
        );
        let resp = self
            .client
            .get(&url)
            .header("Authorization", &self.auth_header)
            .header("Accept", "application/json")
            .send()
            .await?;
        let batch: BatchResponse = check_status(resp)
            .await?
            .json()
            .await
            .map_err(|e| GatewayError::Decode(format!("work item batch: {e}")))?;
        Ok(batch.value)
    }
}

#[derive(Deserialize)]
struct WiqlResponse {
    #[serde(rename = "workItems", default)]
    work_items: Vec<WiqlReference>,
}

#[derive(Deserialize)]
struct WiqlReference {
    id: u64,
}

#[derive(Deserialize)]
struct BatchResponse {
    value: Vec<RawWorkItem>,
}

#[derive(Deserialize)]
struct RawWorkItem {
    id: u64,
    #[serde(default)]
    fields: serde_json::Map<String, Value>,
    #[serde(default)]
    relations: Option<Vec<RawRelation>>,
    url: Option<String>,
}

#[derive(Deserialize)]
struct RawRelation {
    rel: String,
    url: String,
    #[serde(default)]
    attributes: BTreeMap<String, Value>,
}

fn escape_wiql(value: &str) -> String {
    value.replace('\'', "''")
}

/// WIQL selecting the ids of items in a board column, newest change first.
pub fn build_wiql(project: &str, query: &ColumnQuery) -> String {
    let mut clauses = vec![
        format!("[System.TeamProject] = '{}'", escape_wiql(project)),
        format!("[System.BoardColumn] = '{}'", escape_wiql(&query.column)),
    ];
    if let Some(kind) = &query.work_item_type {
        clauses.push(format!("[System.WorkItemType] = '{}'", escape_wiql(kind)));
    }
    if let Some(marker) = &query.title_contains {
        clauses.push(format!("[System.Title] CONTAINS '{}'", escape_wiql(marker)));
    }
    if !query.excluded_states.is_empty() {
        let states = query
            .excluded_states
            .iter()
            .map(|s| format!("'{}'", escape_wiql(s)))
            .collect::<Vec<_>>()
            .join(", ");
        clauses.push(format!("[System.State] NOT IN ({states})"));
    }
    format!(
        "SELECT [System.Id] FROM WorkItems WHERE {} ORDER BY [System.ChangedDate] DESC",
        clauses.join(" AND ")
    )
}

fn string_field(fields: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    fields
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// `System.AssignedTo` is an identity object in REST responses, `Name <mail>` in older ones.
fn display_name(value: &Value) -> Option<String> {
    match value {
        Value::Object(obj) => obj
            .get("displayName")
            .and_then(Value::as_str)
            .map(str::to_string),
        Value::String(s) => {
            let name = s.split('<').next().unwrap_or(s).trim();
            if name.is_empty() {
                None
            } else {
                Some(name.to_string())
            }
        }
        _ => None,
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn convert(raw: RawWorkItem) -> WorkItem {
    let fields = &raw.fields;

    let tags = string_field(fields, "System.Tags")
        .map(|t| {
            t.split(';')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let custom_fields = fields
        .iter()
        .filter(|(key, _)| key.starts_with("Custom.") || key.starts_with("Microsoft.VSTS."))
        .filter_map(|(key, value)| scalar_to_string(value).map(|v| (key.clone(), v)))
        .collect();

    let relations = raw
        .relations
        .unwrap_or_default()
        .into_iter()
        .map(|r| Relation {
            rel: r.rel,
            url: r.url,
            attributes: r.attributes,
        })
        .collect();

    WorkItem {
        id: raw.id,
        title: string_field(fields, "System.Title").unwrap_or_default(),
        work_item_type: string_field(fields, "System.WorkItemType").unwrap_or_default(),
        state: string_field(fields, "System.State").unwrap_or_default(),
        board_column: string_field(fields, "System.BoardColumn"),
        tags,
        description: string_field(fields, "System.Description")
            .and_then(|d| html_to_text(&d)),
        acceptance_criteria: string_field(fields, "Microsoft.VSTS.Common.AcceptanceCriteria")
            .and_then(|d| html_to_text(&d)),
        relations,
        assigned_to: fields.get("System.AssignedTo").and_then(display_name),
        changed_date: string_field(fields, "System.ChangedDate")
            .and_then(|d| d.parse::<DateTime<Utc>>().ok()),
        custom_fields,
        url: raw.url,
    }
}

#[async_trait]
impl WorkTracker for AzureDevOpsClient {
    fn name(&self) -> &str {
        "Azure DevOps"
    }

    async fn query_column(&self, query: &ColumnQuery) -> GatewayResult<Vec<WorkItem>> {
        let wiql = build_wiql(&self.project, query);
        tracing::debug!(%wiql, "querying work items");

        let url = format!("{}/_apis/wit/wiql?api-version={API_VERSION}", self.project_url());
        let resp = self
            .client
            .post(&url)
            .header("Authorization", &self.auth_header)
            .json(&serde_json::json!({ "query": wiql }))
            .send()
            .await?;
        let result: WiqlResponse = check_status(resp)
            .await?
            .json()
            .await
            .map_err(|e| GatewayError::Decode(format!("wiql result: {e}")))?;

        let ids: Vec<u64> = result.work_items.into_iter().map(|r| r.id).collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut by_id: HashMap<u64, WorkItem> = HashMap::with_capacity(ids.len());
        for chunk in ids.chunks(BATCH_SIZE) {
            for raw in self.fetch_batch(chunk).await? {
                let item = convert(raw);
                by_id.insert(item.id, item);
            }
        }

        // Keep the WIQL ordering.
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    async fn fetch_item(&self, id: u64) -> GatewayResult<WorkItem> {
        let url = format!(
            "{}/_apis/wit/workitems/{id}?$expand=relations&api-version={API_VERSION}",
            self.project_url()
        );
        let resp = self
            .client
            .get(&url)
            .header("Authorization", &self.auth_header)
            .header("Accept", "application/json")
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(GatewayError::NotFound(format!("work item {id}")));
        }
        let raw: RawWorkItem = check_status(resp)
            .await?
            .json()
            .await
            .map_err(|e| GatewayError::Decode(format!("work item {id}: {e}")))?;
        Ok(convert(raw))
    }
}
