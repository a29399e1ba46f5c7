//! Following a dispatched workflow run until it finishes.
//!
//! The CI service does not return a run id from a dispatch, so the tracker
//! first has to find the run: it lists recent runs and picks the first one
//! whose title names the dispatched customer and whose creation time lies
//! within the dispatch window. Runs that already existed before the dispatch
//! are excluded, so a back-to-back dispatch for the same customer cannot claim
//! its predecessor's run. Once found, the run is polled directly.
//!
//! ```text
//! AwaitingDiscovery --match--> Running --completed--> Succeeded | Failed | Unknown
//!        |                        |
//!        +--------- deadline -----+--> TimedOut
//!        +--- too many errors ----+--> UnknownAssumedOk
//! ```

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::config::CompletionSettings;
use crate::model::workflow_run::{RunOutcome, WorkflowRun};
use crate::providers::CiService;

/// Poll interval as a function of time since dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSchedule {
    /// Interval while a run is most likely to start.
    pub early: Duration,
    pub early_until: Duration,
    pub steady: Duration,
    pub steady_until: Duration,
    /// Interval for long runs.
    pub late: Duration,
}

impl PollSchedule {
    pub const DEFAULT: Self = Self {
        early: Duration::from_secs(15),
        early_until: Duration::from_secs(2 * 60),
        steady: Duration::from_secs(30),
        steady_until: Duration::from_secs(20 * 60),
        late: Duration::from_secs(60),
    };

    pub fn interval_at(&self, elapsed: Duration) -> Duration {
        if elapsed < self.early_until {
            self.early
        } else if elapsed < self.steady_until {
            self.steady
        } else {
            self.late
        }
    }
}

impl Default for PollSchedule {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// What is known about a dispatch when waiting on it.
#[derive(Debug, Clone)]
pub struct DispatchHint {
    pub customer: String,
    pub dispatched_at: DateTime<Utc>,
    /// Runs that cannot belong to this dispatch.
    pub known_runs: HashSet<u64>,
}

impl DispatchHint {
    /// Whether `run` is plausibly the one started by this dispatch after `elapsed`.
    pub fn matches(&self, run: &WorkflowRun, elapsed: Duration, buffer: Duration) -> bool {
        let buffer = chrono::Duration::from_std(buffer).unwrap_or_else(|_| chrono::Duration::zero());
        let elapsed =
            chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero());
        let earliest = self.dispatched_at - buffer;
        let latest = self.dispatched_at + elapsed + buffer;

        !self.known_runs.contains(&run.id)
            && run.created_at >= earliest
            && run.created_at <= latest
            && run
                .name
                .to_lowercase()
                .contains(&self.customer.to_lowercase())
    }
}

/// Outcome of a run that reported `completed`.
pub fn classify(run: &WorkflowRun) -> RunOutcome {
    match run.conclusion.as_deref() {
        Some("success") => RunOutcome::Succeeded { run_id: run.id },
        Some(c @ ("failure" | "cancelled" | "timed_out")) => RunOutcome::Failed {
            run_id: run.id,
            conclusion: c.to_string(),
        },
        other => RunOutcome::Unknown {
            run_id: run.id,
            conclusion: other.map(str::to_string),
        },
    }
}

pub struct CompletionTracker<'a> {
    ci: &'a dyn CiService,
    settings: &'a CompletionSettings,
    schedule: PollSchedule,
}

impl<'a> CompletionTracker<'a> {
    pub fn new(ci: &'a dyn CiService, settings: &'a CompletionSettings) -> Self {
        Self {
            ci,
            settings,
            schedule: PollSchedule::DEFAULT,
        }
    }

    pub fn with_schedule(mut self, schedule: PollSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    /// Block until the run started by `hint` finishes, errors pile up, or `max_wait` passes.
    #[tracing::instrument(name = "await_completion", skip_all, fields(customer = %hint.customer))]
    pub async fn await_completion(&self, hint: &DispatchHint, max_wait: Duration) -> RunOutcome {
        let started = Instant::now();
        let mut run_id: Option<u64> = None;
        let mut consecutive_errors = 0u32;

        loop {
            let poll = match run_id {
                None => self.discover(hint, started.elapsed()).await,
                Some(id) => self.ci.get_run(id).await.map(Some),
            };

            match poll {
                Ok(found) => {
                    consecutive_errors = 0;
                    if let Some(run) = found {
                        if run_id.is_none() {
                            tracing::info!(run_id = run.id, url = %run.html_url, "found workflow run");
                            run_id = Some(run.id);
                        }
                        if run.is_completed() {
                            let outcome = classify(&run);
                            tracing::info!(
                                run_id = run.id,
                                %outcome,
                                elapsed_secs = started.elapsed().as_secs(),
                                "workflow run finished"
                            );
                            return outcome;
                        }
                        tracing::debug!(run_id = run.id, status = %run.status, "run in progress");
                    } else {
                        tracing::debug!("run not visible yet");
                    }
                }
                Err(e) => {
                    consecutive_errors += 1;
                    tracing::warn!(
                        error = %e,
                        consecutive_errors,
                        transient = e.is_transient(),
                        "failed to poll workflow runs"
                    );
                    if consecutive_errors > self.settings.max_consecutive_errors {
                        tracing::warn!(
                            ?run_id,
                            "giving up on monitoring, assuming the run proceeds"
                        );
                        return RunOutcome::UnknownAssumedOk;
                    }
                }
            }

            let elapsed = started.elapsed();
            if elapsed >= max_wait {
                tracing::warn!(?run_id, waited_secs = elapsed.as_secs(), "timed out waiting for run");
                return RunOutcome::TimedOut { run_id };
            }
            let pause = self.schedule.interval_at(elapsed).min(max_wait - elapsed);
            tokio::time::sleep(pause).await;
        }
    }

    async fn discover(
        &self,
        hint: &DispatchHint,
        elapsed: Duration,
    ) -> crate::providers::GatewayResult<Option<WorkflowRun>> {
        let runs = self.ci.list_runs(self.settings.runs_page_size).await?;
        Ok(runs
            .into_iter()
            .find(|run| hint.matches(run, elapsed, self.settings.match_buffer)))
    }
}
