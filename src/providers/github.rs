use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;

use super::{check_status, http_client, CiService, GatewayResult};
use crate::config::GitHubSettings;
use crate::error::GatewayError;
use crate::model::workflow_run::WorkflowRun;

const API_BASE: &str = "https://api.github.com";
const API_VERSION: &str = "2022-11-28";

pub struct GitHubActionsClient {
    repository: String,
    workflow_file: String,
    token: String,
    client: reqwest::Client,
}

impl GitHubActionsClient {
    pub fn new(settings: &GitHubSettings) -> GatewayResult<Self> {
        Ok(Self {
            repository: settings.repository.clone(),
            workflow_file: settings.workflow_file.clone(),
            token: settings.token.clone(),
            client: http_client()?,
        })
    }

    fn repo_url(&self) -> String {
        format!("{API_BASE}/repos/{}", self.repository)
    }

    fn workflow_url(&self) -> String {
        format!(
            "{}/actions/workflows/{}",
            self.repo_url(),
            urlencoding::encode(&self.workflow_file)
        )
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        self.authorized(self.client.get(url))
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
    }
}

#[derive(Deserialize)]
struct RunsPage {
    #[serde(default)]
    workflow_runs: Vec<GhRun>,
}

#[derive(Deserialize)]
struct GhRun {
    id: u64,
    name: Option<String>,
    display_title: Option<String>,
    status: Option<String>,
    conclusion: Option<String>,
    created_at: DateTime<Utc>,
    #[serde(default)]
    html_url: String,
}

impl From<GhRun> for WorkflowRun {
    fn from(run: GhRun) -> Self {
        WorkflowRun {
            id: run.id,
            name: run
                .display_title
                .filter(|t| !t.is_empty())
                .or(run.name)
                .unwrap_or_default(),
            status: run.status.unwrap_or_else(|| "unknown".into()),
            conclusion: run.conclusion,
            created_at: run.created_at,
            html_url: run.html_url,
        }
    }
}

#[derive(Deserialize)]
struct GhRepository {
    default_branch: String,
}

#[async_trait]
impl CiService for GitHubActionsClient {
    async fn dispatch_workflow(
        &self,
        git_ref: &str,
        inputs: &BTreeMap<String, String>,
    ) -> GatewayResult<()> {
        let url = format!("{}/dispatches", self.workflow_url());
        let resp = self
            .authorized(self.client.post(&url))
            .json(&serde_json::json!({ "ref": git_ref, "inputs": inputs }))
            .send()
            .await?;
        check_status(resp).await?;
        Ok(())
    }

    async fn list_runs(&self, page_size: u8) -> GatewayResult<Vec<WorkflowRun>> {
        let url = format!("{}/runs", self.workflow_url());
        let resp = self
            .get(&url)
            .query(&[("per_page", page_size.to_string())])
            .send()
            .await?;
        let page: RunsPage = check_status(resp)
            .await?
            .json()
            .await
            .map_err(|e| GatewayError::Decode(format!("workflow runs: {e}")))?;
        Ok(page.workflow_runs.into_iter().map(Into::into).collect())
    }

    async fn get_run(&self, run_id: u64) -> GatewayResult<WorkflowRun> {
        let url = format!("{}/actions/runs/{run_id}", self.repo_url());
        let resp = self.get(&url).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(GatewayError::NotFound(format!("workflow run {run_id}")));
        }
        let run: GhRun = check_status(resp)
            .await?
            .json()
            .await
            .map_err(|e| GatewayError::Decode(format!("workflow run {run_id}: {e}")))?;
        Ok(run.into())
    }

    async fn default_branch(&self) -> GatewayResult<String> {
        let resp = self.get(&self.repo_url()).send().await?;
        let repo: GhRepository = check_status(resp)
            .await?
            .json()
            .await
            .map_err(|e| GatewayError::Decode(format!("repository: {e}")))?;
        Ok(repo.default_branch)
    }

    async fn branch_exists(&self, branch: &str) -> GatewayResult<bool> {
        let url = format!(
            "{}/branches/{}",
            self.repo_url(),
            urlencoding::encode(branch)
        );
        let resp = self.get(&url).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check_status(resp).await?;
        Ok(true)
    }

    async fn workflow_exists(&self) -> GatewayResult<bool> {
        let resp = self.get(&self.workflow_url()).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check_status(resp).await?;
        Ok(true)
    }
}
