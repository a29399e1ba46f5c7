pub mod azure_devops;
pub mod github;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::GatewayError;
use crate::model::work_item::WorkItem;
use crate::model::workflow_run::WorkflowRun;

/// Per-request ceiling for both services.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Filter for a board-column query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnQuery {
    pub column: String,
    pub work_item_type: Option<String>,
    pub title_contains: Option<String>,
    pub excluded_states: Vec<String>,
}

/// Read access to the work-tracking service.
#[async_trait]
pub trait WorkTracker: Send + Sync {
    fn name(&self) -> &str;
    /// Items currently in the column, ordered by last change, newest first.
    async fn query_column(&self, query: &ColumnQuery) -> GatewayResult<Vec<WorkItem>>;
    async fn fetch_item(&self, id: u64) -> GatewayResult<WorkItem>;
}

/// Dispatch and observe runs of the CI workflow.
#[async_trait]
pub trait CiService: Send + Sync {
    /// `Ok` means the service accepted the dispatch; a rejection is an `Err`.
    async fn dispatch_workflow(
        &self,
        git_ref: &str,
        inputs: &BTreeMap<String, String>,
    ) -> GatewayResult<()>;
    /// Most recent runs of the workflow, newest first.
    async fn list_runs(&self, page_size: u8) -> GatewayResult<Vec<WorkflowRun>>;
    async fn get_run(&self, run_id: u64) -> GatewayResult<WorkflowRun>;
    async fn default_branch(&self) -> GatewayResult<String>;
    async fn branch_exists(&self, branch: &str) -> GatewayResult<bool>;
    async fn workflow_exists(&self) -> GatewayResult<bool>;
}

pub(crate) fn http_client() -> GatewayResult<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .user_agent(concat!("ado-trigger/", env!("CARGO_PKG_VERSION")))
        .build()?)
}

/// Turn a non-success response into `GatewayError::Api` with its body.
pub(crate) async fn check_status(resp: reqwest::Response) -> GatewayResult<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = resp
        .text()
        .await
        .unwrap_or_else(|_| "<failed to read response body>".to_string());
    Err(GatewayError::Api {
        status: status.as_u16(),
        message,
    })
}
