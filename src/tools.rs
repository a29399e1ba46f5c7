//! Line-delimited JSON tool calls over stdio.
//!
//! Request: `{"tool": "<name>", "arguments": {...}}`
//! Response: `{"ok": true, "result": ...}` or `{"ok": false, "error": "..."}`

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::pipeline::dispatch::Dispatcher;
use crate::pipeline::store::ProcessedStore;

const DEFAULT_LIMIT: usize = 10;

pub const TOOLS: &[(&str, &str)] = &[
    ("list_tools", "List the available tools"),
    ("list_column_items", "Work items currently in the target board column"),
    ("get_work_item", "Fetch one work item by id"),
    ("extract_customer", "Customer, branch and test markers resolved for a work item"),
    (
        "dispatch_workflow",
        "Dispatch the workflow for a work item, optionally waiting for the run",
    ),
    ("run_cycle", "Run one full monitor cycle"),
    ("list_runs", "Most recent workflow runs"),
    ("recent_events", "Most recent dispatch records from the activity log"),
];

fn default_limit() -> usize {
    DEFAULT_LIMIT
}

#[derive(Debug, Deserialize)]
struct ToolRequest {
    tool: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "tool", content = "arguments", rename_all = "snake_case")]
pub enum ToolCall {
    ListTools {},
    ListColumnItems {},
    GetWorkItem {
        work_item_id: u64,
    },
    ExtractCustomer {
        work_item_id: u64,
    },
    DispatchWorkflow {
        work_item_id: u64,
        #[serde(default)]
        wait: bool,
    },
    RunCycle {},
    ListRuns {
        #[serde(default = "default_limit")]
        limit: usize,
    },
    RecentEvents {
        #[serde(default = "default_limit")]
        limit: usize,
    },
}

impl ToolCall {
    pub fn parse(line: &str) -> Result<Self> {
        let request: ToolRequest = serde_json::from_str(line).context("Malformed request")?;
        let arguments = match request.arguments {
            Value::Null => json!({}),
            other => other,
        };
        let tool = request.tool.clone();
        serde_json::from_value(json!({ "tool": request.tool, "arguments": arguments }))
            .with_context(|| format!("Invalid call to {tool:?}"))
    }
}

#[derive(Debug, Serialize)]
pub struct ToolResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResponse {
    fn from_result(result: Result<Value>) -> Self {
        match result {
            Ok(value) => Self {
                ok: true,
                result: Some(value),
                error: None,
            },
            Err(e) => Self {
                ok: false,
                result: None,
                error: Some(format!("{e:#}")),
            },
        }
    }
}

pub struct ToolServer {
    dispatcher: Dispatcher,
    store: ProcessedStore,
}

impl ToolServer {
    pub fn new(dispatcher: Dispatcher, store: ProcessedStore) -> Self {
        Self { dispatcher, store }
    }

    pub async fn respond(&mut self, line: &str) -> ToolResponse {
        let result = match ToolCall::parse(line) {
            Ok(call) => self.handle(call).await,
            Err(e) => Err(e),
        };
        ToolResponse::from_result(result)
    }

    pub async fn handle(&mut self, call: ToolCall) -> Result<Value> {
        tracing::debug!(?call, "tool call");
        match call {
            ToolCall::ListTools {} => Ok(Value::Array(
                TOOLS
                    .iter()
                    .map(|(name, description)| json!({ "name": name, "description": description }))
                    .collect(),
            )),
            ToolCall::ListColumnItems {} => {
                let items = self.dispatcher.column_items().await?;
                Ok(serde_json::to_value(items)?)
            }
            ToolCall::GetWorkItem { work_item_id } => {
                let item = self.dispatcher.fetch_item(work_item_id).await?;
                Ok(serde_json::to_value(item)?)
            }
            ToolCall::ExtractCustomer { work_item_id } => {
                let item = self.dispatcher.fetch_item(work_item_id).await?;
                Ok(serde_json::to_value(self.dispatcher.inspect(&item))?)
            }
            ToolCall::DispatchWorkflow { work_item_id, wait } => {
                let item = self.dispatcher.fetch_item(work_item_id).await?;
                let record = self.dispatcher.attempt(&item, wait).await;
                if record.allows_marking() && self.store.mark(item.id) {
                    self.store.persist();
                }
                Ok(serde_json::to_value(record)?)
            }
            ToolCall::RunCycle {} => {
                let report = self.dispatcher.run_cycle(&mut self.store).await;
                self.store.persist();
                Ok(serde_json::to_value(report?)?)
            }
            ToolCall::ListRuns { limit } => {
                let limit = u8::try_from(limit.clamp(1, 100)).unwrap_or(100);
                let runs = self.dispatcher.recent_runs(limit).await?;
                Ok(serde_json::to_value(runs)?)
            }
            ToolCall::RecentEvents { limit } => Ok(serde_json::to_value(
                self.dispatcher.activity().recent(limit),
            )?),
        }
    }
}

/// Answer one request per line until EOF or cancellation.
pub async fn serve<R, W>(
    server: &mut ToolServer,
    reader: R,
    mut writer: W,
    cancel: CancellationToken,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line.context("Failed to read request")?,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let response = server.respond(&line).await;
        let mut out = serde_json::to_string(&response)?;
        out.push('\n');
        writer.write_all(out.as_bytes()).await?;
        writer.flush().await?;
    }
    tracing::info!("tool server stopped");
    Ok(())
}
