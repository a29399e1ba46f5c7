use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::Serialize;

use super::log::{ActivityLog, AttemptStatus, DispatchRecord};
use super::store::ProcessedStore;
use super::tracker::{CompletionTracker, DispatchHint, PollSchedule};
use crate::config::{CompletionSettings, DispatchSettings, Eligibility, Settings};
use crate::extract::customer::CustomerCatalog;
use crate::extract::{extract, Extraction};
use crate::model::work_item::WorkItem;
use crate::model::workflow_run::{RunOutcome, WorkflowRun};
use crate::providers::{CiService, ColumnQuery, WorkTracker};

const TRIGGER_SOURCE: &str = "ado-trigger";

/// Tally of one pass over the board column.
#[derive(Debug, Default, Clone, Serialize)]
pub struct CycleReport {
    pub seen: usize,
    pub ineligible: usize,
    pub already_processed: usize,
    pub marked: usize,
    pub pruned: usize,
    pub attempts: Vec<DispatchRecord>,
}

impl CycleReport {
    fn count(&self, status: AttemptStatus) -> usize {
        self.attempts.iter().filter(|a| a.status == status).count()
    }

    pub fn skipped(&self) -> usize {
        self.count(AttemptStatus::Skipped)
    }

    pub fn rejected(&self) -> usize {
        self.count(AttemptStatus::Rejected)
    }
}

/// Takes eligible items from the column one at a time, dispatches the workflow
/// for each and waits for its run before touching the next.
pub struct Dispatcher {
    work: Arc<dyn WorkTracker>,
    ci: Arc<dyn CiService>,
    catalog: CustomerCatalog,
    eligibility: Eligibility,
    completion: CompletionSettings,
    dispatch: DispatchSettings,
    configured_default_branch: String,
    prune_departed: bool,
    activity: ActivityLog,
    schedule: PollSchedule,
    /// Runs already matched to a dispatch by this process.
    claimed_runs: Mutex<HashSet<u64>>,
    /// Last skip reason logged per item, to keep repeat skips out of the activity log.
    last_skips: Mutex<HashMap<u64, String>>,
}

impl Dispatcher {
    pub fn new(
        work: Arc<dyn WorkTracker>,
        ci: Arc<dyn CiService>,
        catalog: CustomerCatalog,
        settings: &Settings,
    ) -> Self {
        Self {
            work,
            ci,
            catalog,
            eligibility: settings.eligibility.clone(),
            completion: settings.completion.clone(),
            dispatch: settings.dispatch.clone(),
            configured_default_branch: settings.github.default_branch.clone(),
            prune_departed: settings.monitor.prune_departed,
            activity: ActivityLog::new(settings.monitor.activity_log.clone()),
            schedule: PollSchedule::DEFAULT,
            claimed_runs: Mutex::default(),
            last_skips: Mutex::default(),
        }
    }

    pub fn activity(&self) -> &ActivityLog {
        &self.activity
    }

    pub fn column_query(&self) -> ColumnQuery {
        ColumnQuery {
            column: self.eligibility.target_column.clone(),
            work_item_type: Some(self.eligibility.work_item_type.clone()),
            title_contains: Some(self.eligibility.title_marker.clone()),
            excluded_states: self.eligibility.excluded_states.clone(),
        }
    }

    pub async fn column_items(&self) -> Result<Vec<WorkItem>> {
        self.work
            .query_column(&self.column_query())
            .await
            .with_context(|| {
                format!(
                    "Failed to query {} column {:?}",
                    self.work.name(),
                    self.eligibility.target_column
                )
            })
    }

    pub async fn fetch_item(&self, id: u64) -> Result<WorkItem> {
        self.work
            .fetch_item(id)
            .await
            .with_context(|| format!("Failed to fetch work item {id}"))
    }

    pub async fn recent_runs(&self, limit: u8) -> Result<Vec<WorkflowRun>> {
        self.ci
            .list_runs(limit)
            .await
            .context("Failed to list workflow runs")
    }

    pub fn inspect(&self, item: &WorkItem) -> Extraction {
        extract(item, &self.catalog)
    }

    /// Both services answer and the workflow exists.
    pub async fn startup_check(&self) -> Result<()> {
        let items = self.column_items().await?;
        tracing::info!(items = items.len(), "work tracking service reachable");
        let exists = self
            .ci
            .workflow_exists()
            .await
            .context("Failed to look up the workflow")?;
        if !exists {
            bail!("workflow file not found in the repository");
        }
        Ok(())
    }

    /// Why `item` may not be dispatched, if anything.
    pub fn ineligible_reason(&self, item: &WorkItem) -> Option<String> {
        let e = &self.eligibility;
        if item.work_item_type != e.work_item_type {
            return Some(format!("type {:?} is not {:?}", item.work_item_type, e.work_item_type));
        }
        if !item
            .title
            .to_lowercase()
            .contains(&e.title_marker.to_lowercase())
        {
            return Some(format!("title lacks {:?}", e.title_marker));
        }
        if e
            .excluded_states
            .iter()
            .any(|s| s.eq_ignore_ascii_case(&item.state))
        {
            return Some(format!("state {:?} is excluded", item.state));
        }
        if let Some(column) = &item.board_column {
            if !column.eq_ignore_ascii_case(&e.target_column) {
                return Some(format!("column {column:?} is not {:?}", e.target_column));
            }
        }
        None
    }

    /// Mark every eligible item currently in the column as processed without dispatching.
    pub async fn seed(&self, store: &mut ProcessedStore) -> Result<usize> {
        let items = self.column_items().await?;
        let seeded = items
            .iter()
            .filter(|item| self.ineligible_reason(item).is_none())
            .filter(|item| store.mark(item.id))
            .count();
        tracing::info!(seeded, "seeded processed items from the current column");
        Ok(seeded)
    }

    /// One pass over the column. Only the column query itself can fail the cycle;
    /// per-item failures are recorded and the item is retried next cycle.
    pub async fn run_cycle(&self, store: &mut ProcessedStore) -> Result<CycleReport> {
        let items = self.column_items().await?;
        let mut report = CycleReport {
            seen: items.len(),
            ..Default::default()
        };

        for item in &items {
            if let Some(reason) = self.ineligible_reason(item) {
                tracing::debug!(id = item.id, %reason, "not eligible");
                report.ineligible += 1;
                continue;
            }
            if store.contains(item.id) {
                report.already_processed += 1;
                continue;
            }

            let record = self.attempt(item, self.completion.wait_for_completion).await;
            if record.allows_marking() && store.mark(item.id) {
                report.marked += 1;
                store.persist();
            }
            report.attempts.push(record);
        }

        if self.prune_departed {
            let present: HashSet<u64> = items.iter().map(|i| i.id).collect();
            let removed = store.retain(|id| present.contains(&id));
            if !removed.is_empty() {
                tracing::info!(?removed, "forgot items that left the column");
            }
            report.pruned = removed.len();
        }

        tracing::info!(
            seen = report.seen,
            dispatched = report.attempts.len() - report.skipped(),
            marked = report.marked,
            skipped = report.skipped(),
            rejected = report.rejected(),
            "cycle finished"
        );
        Ok(report)
    }

    /// Resolve, dispatch and (when `wait`) follow one item. The record is also
    /// appended to the activity log.
    #[tracing::instrument(skip_all, fields(work_item = item.id))]
    pub async fn attempt(&self, item: &WorkItem, wait: bool) -> DispatchRecord {
        let record = self.attempt_inner(item, wait).await;
        tracing::debug!(status = ?record.status, run_id = ?record.run_id(), "attempt recorded");
        if self.is_repeat_skip(&record) {
            tracing::debug!("same skip as last time, not logged");
        } else if let Err(e) = self.activity.append(&record) {
            tracing::warn!(error = %format!("{e:#}"), "failed to write activity log");
        }
        record
    }

    /// Remembers the latest skip per item; any other status clears it.
    fn is_repeat_skip(&self, record: &DispatchRecord) -> bool {
        let mut skips = self.last_skips.lock().unwrap_or_else(PoisonError::into_inner);
        if record.status != AttemptStatus::Skipped {
            skips.remove(&record.work_item_id);
            return false;
        }
        let reason = record.message.clone().unwrap_or_default();
        skips.insert(record.work_item_id, reason.clone()).as_deref() == Some(reason.as_str())
    }

    async fn attempt_inner(&self, item: &WorkItem, wait: bool) -> DispatchRecord {
        let extraction = self.inspect(item);
        let customer = extraction.customer;

        if customer.needs_manual_credentials {
            tracing::warn!(
                title = %item.title,
                source = customer.source.as_str(),
                reason = %customer.reason,
                "skipping item that needs manual credentials"
            );
            let mut record = DispatchRecord::new(item.id, &item.title, AttemptStatus::Skipped);
            record.customer = customer.customer;
            record.message = Some(customer.reason);
            return record;
        }
        let customer_name = customer.customer.unwrap_or_default();

        let resolved = extraction.branch.map(|b| {
            tracing::debug!(branch = %b.branch, source = ?b.source, "resolved branch");
            b.branch
        });
        let fallback = self.default_branch().await;
        let git_ref = self.choose_ref(resolved.as_deref(), &fallback).await;

        let inputs = self.inputs(
            item,
            &customer_name,
            &extraction.markers,
            resolved.as_deref().unwrap_or(&git_ref),
        );

        let mut record = DispatchRecord::new(item.id, &item.title, AttemptStatus::Rejected);
        record.customer = Some(customer_name.clone());
        record.markers = Some(extraction.markers.clone());

        let known_runs = if wait { self.known_runs().await } else { HashSet::new() };
        let dispatched_at = Utc::now();
        let mut used_ref = git_ref.clone();
        let mut result = self.ci.dispatch_workflow(&git_ref, &inputs).await;
        if let Err(e) = &result {
            if git_ref != fallback {
                tracing::warn!(error = %e, branch = %git_ref, fallback = %fallback, "dispatch rejected, retrying on default branch");
                used_ref = fallback.clone();
                result = self.ci.dispatch_workflow(&fallback, &inputs).await;
            }
        }
        record.branch = Some(used_ref.clone());

        if let Err(e) = result {
            tracing::error!(error = %e, branch = %used_ref, "workflow dispatch rejected");
            record.message = Some(e.to_string());
            return record;
        }
        tracing::info!(
            customer = %customer_name,
            branch = %used_ref,
            markers = %extraction.markers,
            "workflow dispatched"
        );
        record.status = AttemptStatus::Finished;
        record.dispatched_at = Some(dispatched_at);

        let outcome = if wait {
            let hint = DispatchHint {
                customer: customer_name,
                dispatched_at,
                known_runs,
            };
            let outcome = CompletionTracker::new(self.ci.as_ref(), &self.completion)
                .with_schedule(self.schedule)
                .await_completion(&hint, self.completion.timeout)
                .await;
            if let Some(run_id) = outcome.run_id() {
                self.claimed_runs
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(run_id);
            }
            outcome
        } else {
            RunOutcome::NotAwaited
        };
        if !outcome.allows_marking() {
            tracing::warn!(%outcome, "run did not succeed, item stays eligible");
        }
        record.outcome = Some(outcome);
        record
    }

    /// Runs listed before a dispatch plus those already claimed; none of them
    /// can be the run the dispatch is about to start.
    async fn known_runs(&self) -> HashSet<u64> {
        let mut known = self
            .claimed_runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match self.ci.list_runs(self.completion.runs_page_size).await {
            Ok(runs) => known.extend(runs.iter().map(|r| r.id)),
            Err(e) => tracing::warn!(error = %e, "could not list runs before dispatch"),
        }
        known
    }

    /// The repository default branch, or the configured one when it cannot be read.
    async fn default_branch(&self) -> String {
        match self.ci.default_branch().await {
            Ok(branch) => branch,
            Err(e) => {
                tracing::warn!(error = %e, fallback = %self.configured_default_branch, "could not read default branch");
                self.configured_default_branch.clone()
            }
        }
    }

    async fn choose_ref(&self, resolved: Option<&str>, fallback: &str) -> String {
        let Some(branch) = resolved else {
            return fallback.to_string();
        };
        if !self.dispatch.verify_branch || branch == fallback {
            return branch.to_string();
        }
        match self.ci.branch_exists(branch).await {
            Ok(true) => branch.to_string(),
            Ok(false) => {
                tracing::warn!(%branch, %fallback, "branch not found in repository, using default");
                fallback.to_string()
            }
            Err(e) => {
                tracing::warn!(error = %e, %branch, "could not verify branch, using it anyway");
                branch.to_string()
            }
        }
    }

    fn inputs(
        &self,
        item: &WorkItem,
        customer: &str,
        markers: &str,
        target_branch: &str,
    ) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("customer".into(), customer.to_string()),
            ("browser".into(), self.dispatch.browser.clone()),
            ("markers".into(), markers.to_string()),
            (
                "pass_phrase".into(),
                self.dispatch.pass_phrase.clone().unwrap_or_default(),
            ),
            ("work_item_id".into(), item.id.to_string()),
            ("work_item_title".into(), item.title.clone()),
            ("work_item_type".into(), item.work_item_type.clone()),
            ("board_column".into(), self.eligibility.target_column.clone()),
            ("target_branch".into(), target_branch.to_string()),
            ("trigger_source".into(), TRIGGER_SOURCE.into()),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_settings;
    use crate::model::work_item::Relation;
    use crate::providers::tests::{call_log, CallLog, FakeCi, FakeTracker, RunScript};

    struct Harness {
        log: CallLog,
        tracker: Arc<FakeTracker>,
        ci: Arc<FakeCi>,
        dispatcher: Dispatcher,
        store: ProcessedStore,
        _dir: tempfile::TempDir,
    }

    fn harness_with(ci: FakeCi, log: CallLog, tweak: impl FnOnce(&mut Settings)) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = test_settings(dir.path());
        tweak(&mut settings);
        let tracker = Arc::new(FakeTracker::new(log.clone()));
        let ci = Arc::new(ci);
        let catalog = CustomerCatalog::new(
            vec!["regression_fifa".to_string(), "regression_nba".to_string()],
            vec![],
        );
        let dispatcher = Dispatcher::new(tracker.clone(), ci.clone(), catalog, &settings);
        let store = ProcessedStore::empty(settings.monitor.state_file.clone());
        Harness {
            log,
            tracker,
            ci,
            dispatcher,
            store,
            _dir: dir,
        }
    }

    fn harness() -> Harness {
        let log = call_log();
        harness_with(FakeCi::new(log.clone()), log, |_| {})
    }

    fn eligible(id: u64, customer: &str) -> WorkItem {
        let mut item = WorkItem::new(id, format!("{{{customer}}} Automated Test"));
        item.work_item_type = "Product Backlog Item".into();
        item.state = "Committed".into();
        item.board_column = Some("Testing".into());
        item
    }

    fn position(log: &CallLog, call: &str) -> usize {
        log.lock()
            .unwrap()
            .iter()
            .position(|c| c == call)
            .unwrap_or_else(|| panic!("{call} not in call log"))
    }

    #[tokio::test(start_paused = true)]
    async fn successful_runs_are_marked_and_persisted() {
        let mut h = harness();
        h.tracker.set_items(vec![eligible(1, "FIFA")]);

        let report = h.dispatcher.run_cycle(&mut h.store).await.unwrap();
        assert_eq!(report.marked, 1);
        assert!(h.store.contains(1));

        let reloaded = ProcessedStore::load(h.store.path().to_path_buf()).unwrap();
        assert!(reloaded.contains(1));
        assert_eq!(h.dispatcher.activity().recent(10).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn processed_items_are_not_dispatched_again() {
        let mut h = harness();
        h.tracker.set_items(vec![eligible(1, "FIFA"), eligible(2, "NBA")]);
        h.store.mark(1);

        let report = h.dispatcher.run_cycle(&mut h.store).await.unwrap();
        assert_eq!(report.already_processed, 1);
        let dispatched: Vec<String> = h
            .ci
            .dispatches()
            .iter()
            .map(|(_, inputs)| inputs["work_item_id"].clone())
            .collect();
        assert_eq!(dispatched, vec!["2"]);

        h.dispatcher.run_cycle(&mut h.store).await.unwrap();
        assert_eq!(h.ci.dispatches().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn each_run_finishes_before_the_next_dispatch() {
        let mut h = harness();
        h.ci.script(RunScript::succeeds_after(3));
        h.ci.script(RunScript::succeeds_after(2));
        h.tracker
            .set_items(vec![eligible(10, "FIFA"), eligible(11, "NBA")]);

        h.dispatcher.run_cycle(&mut h.store).await.unwrap();

        assert!(position(&h.log, "dispatch:10@main") < position(&h.log, "completed:1001"));
        assert!(position(&h.log, "completed:1001") < position(&h.log, "dispatch:11@main"));
        assert!(position(&h.log, "dispatch:11@main") < position(&h.log, "completed:1002"));
    }

    #[tokio::test(start_paused = true)]
    async fn same_customer_items_do_not_share_a_run() {
        let mut h = harness();
        h.ci.script(RunScript::succeeds_after(1));
        h.ci.script(RunScript::never_appears());
        h.tracker.set_items(vec![eligible(1, "FIFA"), eligible(2, "FIFA")]);

        let report = h.dispatcher.run_cycle(&mut h.store).await.unwrap();
        assert_eq!(
            report.attempts[0].outcome,
            Some(RunOutcome::Succeeded { run_id: 1001 })
        );
        assert_eq!(
            report.attempts[1].outcome,
            Some(RunOutcome::TimedOut { run_id: None })
        );
        assert!(h.store.contains(1));
        assert!(!h.store.contains(2));
    }

    #[tokio::test(start_paused = true)]
    async fn second_same_customer_run_is_followed_to_its_own_end() {
        let mut h = harness();
        h.ci.script(RunScript::succeeds_after(1));
        h.ci.script(RunScript::concludes("failure"));
        h.tracker.set_items(vec![eligible(1, "FIFA"), eligible(2, "FIFA")]);

        let report = h.dispatcher.run_cycle(&mut h.store).await.unwrap();
        assert_eq!(report.attempts[1].run_id(), Some(1002));
        assert!(!h.store.contains(2));
        assert!(position(&h.log, "completed:1001") < position(&h.log, "dispatch:2@main"));
        assert!(position(&h.log, "dispatch:2@main") < position(&h.log, "completed:1002"));
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_skips_are_logged_once() {
        let mut h = harness();
        h.tracker.set_items(vec![eligible(5, "ACME")]);

        for _ in 0..20 {
            let report = h.dispatcher.run_cycle(&mut h.store).await.unwrap();
            assert_eq!(report.skipped(), 1);
        }
        assert_eq!(h.dispatcher.activity().recent(100).len(), 1);

        h.tracker.set_items(vec![eligible(5, "FIFA")]);
        h.dispatcher.run_cycle(&mut h.store).await.unwrap();
        assert_eq!(h.dispatcher.activity().recent(100).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_customer_is_skipped_and_not_marked() {
        let mut h = harness();
        h.tracker.set_items(vec![eligible(5, "ACME")]);

        let report = h.dispatcher.run_cycle(&mut h.store).await.unwrap();
        assert_eq!(report.skipped(), 1);
        assert!(h.ci.dispatches().is_empty());
        assert!(!h.store.contains(5));
        assert_eq!(report.attempts[0].customer.as_deref(), Some("acme"));
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_item_is_retried_next_cycle() {
        let mut h = harness();
        h.ci.script(RunScript::never_appears());
        h.tracker.set_items(vec![eligible(3, "FIFA")]);

        let first = h.dispatcher.run_cycle(&mut h.store).await.unwrap();
        assert_eq!(
            first.attempts[0].outcome,
            Some(RunOutcome::TimedOut { run_id: None })
        );
        assert!(!h.store.contains(3));

        h.dispatcher.run_cycle(&mut h.store).await.unwrap();
        assert_eq!(h.ci.dispatches().len(), 2);
        assert!(h.store.contains(3));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_run_keeps_item_eligible_and_cycle_continues() {
        let mut h = harness();
        h.ci.script(RunScript::concludes("failure"));
        h.tracker
            .set_items(vec![eligible(1, "FIFA"), eligible(2, "NBA")]);

        let report = h.dispatcher.run_cycle(&mut h.store).await.unwrap();
        assert!(!h.store.contains(1));
        assert!(h.store.contains(2));
        assert_eq!(report.marked, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_dispatch_is_recorded_and_not_marked() {
        let mut h = harness();
        h.ci.script(RunScript::rejected());
        h.tracker.set_items(vec![eligible(1, "FIFA")]);

        let report = h.dispatcher.run_cycle(&mut h.store).await.unwrap();
        assert_eq!(report.rejected(), 1);
        assert!(report.attempts[0].message.is_some());
        assert!(!h.store.contains(1));
    }

    #[tokio::test(start_paused = true)]
    async fn rejection_on_item_branch_retries_default_branch() {
        let log = call_log();
        let ci = FakeCi::new(log.clone()).with_branches(&["main", "release/1.2"]);
        let mut h = harness_with(ci, log, |_| {});
        h.ci.script(RunScript::rejected());

        let mut item = eligible(1, "FIFA");
        item.title = "{FIFA} Automated Test [BRANCH: release/1.2]".into();
        h.tracker.set_items(vec![item]);

        h.dispatcher.run_cycle(&mut h.store).await.unwrap();
        let dispatches = h.ci.dispatches();
        assert_eq!(dispatches.len(), 1);
        assert_eq!(dispatches[0].0, "main");
        assert_eq!(dispatches[0].1["target_branch"], "release/1.2");
        assert!(h.store.contains(1));
    }

    #[tokio::test(start_paused = true)]
    async fn relation_branch_is_dispatched_when_it_exists() {
        let log = call_log();
        let ci = FakeCi::new(log.clone()).with_branches(&["main", "release/1.2"]);
        let mut h = harness_with(ci, log, |_| {});

        let mut item = eligible(1, "FIFA");
        item.title = "{FIFA} Automated Test [BRANCH: feature/x]".into();
        item.relations.push(Relation {
            rel: "ArtifactLink".into(),
            url: "vstfs:///GitHub/Branch/0f1e2d3c%2Frelease%2F1.2".into(),
            attributes: Default::default(),
        });
        h.tracker.set_items(vec![item]);

        h.dispatcher.run_cycle(&mut h.store).await.unwrap();
        let dispatches = h.ci.dispatches();
        assert_eq!(dispatches[0].0, "release/1.2");
        position(&h.log, "branch_exists:release/1.2");
    }

    #[tokio::test(start_paused = true)]
    async fn missing_branch_falls_back_to_default() {
        let mut h = harness();
        let mut item = eligible(1, "FIFA");
        item.description = Some("branch: feature/gone".into());
        h.tracker.set_items(vec![item]);

        h.dispatcher.run_cycle(&mut h.store).await.unwrap();
        let dispatches = h.ci.dispatches();
        assert_eq!(dispatches[0].0, "main");
        assert_eq!(dispatches[0].1["target_branch"], "feature/gone");
    }

    #[tokio::test(start_paused = true)]
    async fn workflow_inputs() {
        let log = call_log();
        let mut h = harness_with(FakeCi::new(log.clone()), log, |s| {
            s.dispatch.pass_phrase = Some("open sesame".into());
            s.dispatch.browser = "firefox".into();
        });
        h.tracker.set_items(vec![eligible(42, "FIFA")]);

        h.dispatcher.run_cycle(&mut h.store).await.unwrap();
        let (git_ref, inputs) = &h.ci.dispatches()[0];
        assert_eq!(git_ref, "main");
        assert_eq!(inputs["customer"], "fifa");
        assert_eq!(inputs["browser"], "firefox");
        assert_eq!(inputs["markers"], "smoke or regression_fifa");
        assert_eq!(inputs["pass_phrase"], "open sesame");
        assert_eq!(inputs["work_item_id"], "42");
        assert_eq!(inputs["work_item_title"], "{FIFA} Automated Test");
        assert_eq!(inputs["target_branch"], "main");
        assert_eq!(inputs.len(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn ineligible_items_are_left_alone() {
        let mut h = harness();
        let mut wrong_type = eligible(1, "FIFA");
        wrong_type.work_item_type = "Bug".into();
        let mut closed = eligible(2, "FIFA");
        closed.state = "Closed".into();
        let mut no_marker = eligible(3, "FIFA");
        no_marker.title = "{FIFA} manual check".into();
        let mut other_column = eligible(4, "FIFA");
        other_column.board_column = Some("Done".into());
        h.tracker
            .set_items(vec![wrong_type, closed, no_marker, other_column]);

        let report = h.dispatcher.run_cycle(&mut h.store).await.unwrap();
        assert_eq!(report.ineligible, 4);
        assert!(h.ci.dispatches().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn departed_items_are_pruned() {
        let mut h = harness();
        h.store.mark(99);
        h.store.mark(1);
        h.tracker.set_items(vec![eligible(1, "FIFA")]);

        let report = h.dispatcher.run_cycle(&mut h.store).await.unwrap();
        assert_eq!(report.pruned, 1);
        assert!(!h.store.contains(99));
        assert!(h.store.contains(1));
    }

    #[tokio::test(start_paused = true)]
    async fn pruning_can_be_disabled() {
        let log = call_log();
        let mut h = harness_with(FakeCi::new(log.clone()), log, |s| {
            s.monitor.prune_departed = false;
        });
        h.store.mark(99);

        h.dispatcher.run_cycle(&mut h.store).await.unwrap();
        assert!(h.store.contains(99));
    }

    #[tokio::test(start_paused = true)]
    async fn not_waiting_marks_on_acceptance() {
        let log = call_log();
        let mut h = harness_with(FakeCi::new(log.clone()), log, |s| {
            s.completion.wait_for_completion = false;
        });
        h.ci.script(RunScript::never_completes());
        h.tracker.set_items(vec![eligible(1, "FIFA")]);

        let report = h.dispatcher.run_cycle(&mut h.store).await.unwrap();
        assert_eq!(report.attempts[0].outcome, Some(RunOutcome::NotAwaited));
        assert!(h.store.contains(1));
        assert!(!h.log.lock().unwrap().iter().any(|c| c == "list_runs"));
    }

    #[tokio::test(start_paused = true)]
    async fn query_failure_fails_the_cycle() {
        let mut h = harness();
        h.tracker.fail_next_queries(1);
        assert!(h.dispatcher.run_cycle(&mut h.store).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn seeding_marks_without_dispatching() {
        let mut h = harness();
        let mut bug = eligible(2, "FIFA");
        bug.work_item_type = "Bug".into();
        h.tracker.set_items(vec![eligible(1, "FIFA"), bug]);

        assert_eq!(h.dispatcher.seed(&mut h.store).await.unwrap(), 1);
        assert!(h.store.contains(1));
        assert!(h.ci.dispatches().is_empty());
    }

    #[tokio::test]
    async fn startup_check_requires_workflow() {
        let log = call_log();
        let h = harness_with(FakeCi::new(log.clone()).without_workflow(), log, |_| {});
        assert!(h.dispatcher.startup_check().await.is_err());

        let h = harness();
        h.dispatcher.startup_check().await.unwrap();
    }
}
