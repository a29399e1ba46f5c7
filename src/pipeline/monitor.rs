use std::time::Duration;

use anyhow::Result;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::dispatch::Dispatcher;
use super::store::ProcessedStore;
use crate::config::MonitorSettings;

/// Headroom a bounded run keeps before its deadline.
pub const SAFETY_BUFFER: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    /// Not enough runtime left for another interval.
    RuntimeExhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorSummary {
    pub cycles: u32,
    pub stop: StopReason,
}

/// Runs the dispatcher every polling interval until cancelled or out of runtime.
pub struct Monitor<'a> {
    dispatcher: &'a Dispatcher,
    interval: Duration,
    max_runtime: Option<Duration>,
    seed_existing: bool,
}

impl<'a> Monitor<'a> {
    pub fn new(dispatcher: &'a Dispatcher, settings: &MonitorSettings) -> Self {
        Self {
            dispatcher,
            interval: settings.polling_interval,
            max_runtime: settings.max_runtime,
            seed_existing: settings.seed_existing,
        }
    }

    /// The token is checked between cycles only; a cycle waiting on a run
    /// finishes (or times out) before the loop notices cancellation.
    ///
    /// In bounded mode a failed cycle ends the run with that error; otherwise
    /// it is logged and the next cycle proceeds. The store is persisted after
    /// every cycle and once more on the way out.
    pub async fn run(
        &self,
        store: &mut ProcessedStore,
        cancel: CancellationToken,
    ) -> Result<MonitorSummary> {
        let deadline = self.max_runtime.map(|d| Instant::now() + d);
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            max_runtime_secs = self.max_runtime.map(|d| d.as_secs()),
            processed = store.len(),
            state_file = %store.path().display(),
            "monitor started"
        );

        if self.seed_existing && store.is_empty() && store.last_updated().is_none() {
            match self.dispatcher.seed(store).await {
                Ok(_) => store.persist(),
                Err(e) => tracing::warn!(error = %format!("{e:#}"), "seeding failed"),
            }
        }

        let mut cycles = 0u32;
        let result = loop {
            if cancel.is_cancelled() {
                break Ok(StopReason::Cancelled);
            }

            let cycle = self.dispatcher.run_cycle(store).await;
            cycles += 1;
            store.persist();
            if let Err(e) = cycle {
                if deadline.is_some() {
                    tracing::error!(error = %format!("{e:#}"), "cycle failed, stopping bounded run");
                    break Err(e);
                }
                tracing::error!(error = %format!("{e:#}"), "cycle failed");
            }

            if let Some(deadline) = deadline {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining < self.interval + SAFETY_BUFFER {
                    tracing::info!(remaining_secs = remaining.as_secs(), "runtime nearly spent");
                    break Ok(StopReason::RuntimeExhausted);
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break Ok(StopReason::Cancelled),
                _ = tokio::time::sleep(self.interval) => {}
            }
        };

        store.persist();
        let stop = result?;
        tracing::info!(cycles, ?stop, processed = store.len(), "monitor stopped");
        Ok(MonitorSummary { cycles, stop })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::{test_settings, Settings};
    use crate::extract::customer::CustomerCatalog;
    use crate::model::work_item::WorkItem;
    use crate::providers::tests::{call_log, CallLog, FakeCi, FakeTracker};

    type Setup = (Settings, Arc<FakeTracker>, Dispatcher, CallLog, tempfile::TempDir);

    fn setup(tweak: impl FnOnce(&mut Settings)) -> Setup {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = test_settings(dir.path());
        tweak(&mut settings);
        let log = call_log();
        let tracker = Arc::new(FakeTracker::new(log.clone()));
        let ci = Arc::new(FakeCi::new(log.clone()));
        let catalog = CustomerCatalog::new(vec!["regression_fifa".to_string()], vec![]);
        let dispatcher = Dispatcher::new(tracker.clone(), ci, catalog, &settings);
        (settings, tracker, dispatcher, log, dir)
    }

    fn queries(log: &CallLog) -> usize {
        log.lock().unwrap().iter().filter(|c| *c == "query").count()
    }

    fn item(id: u64) -> WorkItem {
        let mut item = WorkItem::new(id, "{FIFA} Automated Test");
        item.work_item_type = "Product Backlog Item".into();
        item.state = "Active".into();
        item
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_run_stops_before_deadline() {
        let (settings, _tracker, dispatcher, log, _dir) = setup(|s| {
            s.monitor.max_runtime = Some(Duration::from_secs(100));
        });
        let mut store = ProcessedStore::empty(settings.monitor.state_file.clone());

        let summary = Monitor::new(&dispatcher, &settings.monitor)
            .run(&mut store, CancellationToken::new())
            .await
            .unwrap();

        // Cycles at 0s, 30s and 60s; at 60s only 40s remain.
        assert_eq!(summary.cycles, 3);
        assert_eq!(summary.stop, StopReason::RuntimeExhausted);
        assert_eq!(queries(&log), 3);
        assert!(settings.monitor.state_file.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_before_start_runs_nothing() {
        let (settings, _tracker, dispatcher, log, _dir) = setup(|_| {});
        let mut store = ProcessedStore::empty(settings.monitor.state_file.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = Monitor::new(&dispatcher, &settings.monitor)
            .run(&mut store, cancel)
            .await
            .unwrap();
        assert_eq!(summary.cycles, 0);
        assert_eq!(summary.stop, StopReason::Cancelled);
        assert_eq!(queries(&log), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_run_survives_failed_cycles_until_cancelled() {
        let (settings, tracker, dispatcher, log, _dir) = setup(|_| {});
        tracker.fail_next_queries(2);
        tracker.set_items(vec![item(1)]);
        let mut store = ProcessedStore::empty(settings.monitor.state_file.clone());

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(95)).await;
            canceller.cancel();
        });

        let summary = Monitor::new(&dispatcher, &settings.monitor)
            .run(&mut store, cancel)
            .await
            .unwrap();
        assert_eq!(summary.stop, StopReason::Cancelled);
        assert!(summary.cycles >= 3);
        assert!(queries(&log) >= 3);
        assert!(store.contains(1));

        let reloaded = ProcessedStore::load(settings.monitor.state_file.clone()).unwrap();
        assert!(reloaded.contains(1));
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_run_stops_on_cycle_failure() {
        let (settings, tracker, dispatcher, _log, _dir) = setup(|s| {
            s.monitor.max_runtime = Some(Duration::from_secs(3600));
        });
        tracker.fail_next_queries(1);
        let mut store = ProcessedStore::empty(settings.monitor.state_file.clone());

        let result = Monitor::new(&dispatcher, &settings.monitor)
            .run(&mut store, CancellationToken::new())
            .await;
        assert!(result.is_err());
        assert!(settings.monitor.state_file.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn first_start_seeds_existing_items() {
        let (settings, tracker, dispatcher, log, _dir) = setup(|s| {
            s.monitor.seed_existing = true;
            s.monitor.max_runtime = Some(Duration::from_secs(10));
        });
        tracker.set_items(vec![item(1), item(2)]);
        let mut store = ProcessedStore::empty(settings.monitor.state_file.clone());

        Monitor::new(&dispatcher, &settings.monitor)
            .run(&mut store, CancellationToken::new())
            .await
            .unwrap();
        assert!(store.contains(1) && store.contains(2));
        assert!(!log.lock().unwrap().iter().any(|c| c.starts_with("dispatch")));
    }
}
