use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One execution of the remote CI workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: u64,
    /// Run display title (the workflow's `run-name`), falling back to the workflow name.
    pub name: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conclusion: Option<String>,
    pub created_at: DateTime<Utc>,
    pub html_url: String,
}

impl WorkflowRun {
    pub fn is_completed(&self) -> bool {
        self.status == "completed"
    }
}

/// Terminal result of waiting on a dispatched run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded { run_id: u64 },
    Failed { run_id: u64, conclusion: String },
    TimedOut { run_id: Option<u64> },
    /// Completed with a conclusion outside the known set.
    Unknown { run_id: u64, conclusion: Option<String> },
    /// Monitoring gave up after repeated API errors; the run continues remotely.
    UnknownAssumedOk,
    /// Dispatch was accepted and the caller chose not to wait.
    NotAwaited,
}

impl RunOutcome {
    /// Whether the work item may be marked processed.
    pub fn allows_marking(&self) -> bool {
        matches!(
            self,
            RunOutcome::Succeeded { .. } | RunOutcome::UnknownAssumedOk | RunOutcome::NotAwaited
        )
    }

    pub fn run_id(&self) -> Option<u64> {
        match self {
            RunOutcome::Succeeded { run_id }
            | RunOutcome::Failed { run_id, .. }
            | RunOutcome::Unknown { run_id, .. } => Some(*run_id),
            RunOutcome::TimedOut { run_id } => *run_id,
            RunOutcome::UnknownAssumedOk | RunOutcome::NotAwaited => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Succeeded { .. } => "succeeded",
            RunOutcome::Failed { .. } => "failed",
            RunOutcome::TimedOut { .. } => "timed_out",
            RunOutcome::Unknown { .. } => "unknown",
            RunOutcome::UnknownAssumedOk => "unknown_assumed_ok",
            RunOutcome::NotAwaited => "not_awaited",
        }
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
