use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::workflow_run::RunOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    /// Not dispatched; the customer needs manual credentials.
    Skipped,
    /// The CI service refused the dispatch.
    Rejected,
    /// Dispatched and followed to an outcome.
    Finished,
}

/// One attempt at a work item, as written to the activity log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub timestamp: DateTime<Utc>,
    pub work_item_id: u64,
    pub work_item_title: String,
    pub status: AttemptStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub markers: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispatched_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RunOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl DispatchRecord {
    pub fn new(work_item_id: u64, work_item_title: &str, status: AttemptStatus) -> Self {
        Self {
            timestamp: Utc::now(),
            work_item_id,
            work_item_title: work_item_title.to_string(),
            status,
            customer: None,
            branch: None,
            markers: None,
            dispatched_at: None,
            outcome: None,
            message: None,
        }
    }

    pub fn run_id(&self) -> Option<u64> {
        self.outcome.as_ref().and_then(RunOutcome::run_id)
    }

    /// Whether this attempt lets the item be marked processed.
    pub fn allows_marking(&self) -> bool {
        self.status == AttemptStatus::Finished
            && self.outcome.as_ref().is_some_and(RunOutcome::allows_marking)
    }
}

/// Size at which the log is rotated to `<name>.1`.
pub const DEFAULT_MAX_BYTES: u64 = 1024 * 1024;

/// JSONL file of dispatch records. Once it grows past `max_bytes` it is moved
/// aside to `<name>.1`, replacing any older rotation, so at most two bounded
/// files exist.
#[derive(Debug, Clone)]
pub struct ActivityLog {
    path: PathBuf,
    max_bytes: u64,
}

impl ActivityLog {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }

    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    fn rotated_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".1");
        self.path.with_file_name(name)
    }

    fn rotate_if_full(&self) -> Result<()> {
        let size = match std::fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if size >= self.max_bytes {
            std::fs::rename(&self.path, self.rotated_path())
                .with_context(|| format!("Failed to rotate {}", self.path.display()))?;
            tracing::debug!(path = %self.path.display(), size, "rotated activity log");
        }
        Ok(())
    }

    pub fn append(&self, record: &DispatchRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.rotate_if_full()?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        let line = serde_json::to_string(record)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    /// The last `limit` records, oldest first. Unreadable lines are skipped.
    pub fn recent(&self, limit: usize) -> Vec<DispatchRecord> {
        let mut records = read_records(&self.rotated_path());
        records.extend(read_records(&self.path));

        let len = records.len();
        if len > limit {
            records = records.split_off(len - limit);
        }
        records
    }
}

fn read_records(path: &Path) -> Vec<DispatchRecord> {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_read_back_most_recent() {
        let dir = tempfile::tempdir().unwrap();
        let log = ActivityLog::new(dir.path().join("logs").join("activity.jsonl"));

        for id in 1..=5 {
            let mut record = DispatchRecord::new(id, "Automated Test", AttemptStatus::Finished);
            record.outcome = Some(RunOutcome::Succeeded { run_id: id * 10 });
            log.append(&record).unwrap();
        }

        let recent = log.recent(2);
        assert_eq!(
            recent.iter().map(|r| r.work_item_id).collect::<Vec<_>>(),
            vec![4, 5]
        );
        assert_eq!(recent[1].run_id(), Some(50));
    }

    #[test]
    fn missing_log_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ActivityLog::new(dir.path().join("none.jsonl")).recent(10).is_empty());
    }

    #[test]
    fn garbage_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("activity.jsonl");
        let log = ActivityLog::new(path.clone());
        log.append(&DispatchRecord::new(1, "a", AttemptStatus::Skipped))
            .unwrap();
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{{not json").unwrap();
        log.append(&DispatchRecord::new(2, "b", AttemptStatus::Rejected))
            .unwrap();

        let ids: Vec<u64> = log.recent(10).iter().map(|r| r.work_item_id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn full_log_rotates_and_stays_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("activity.jsonl");
        let log = ActivityLog::new(path.clone()).with_max_bytes(400);

        for id in 1..=50 {
            log.append(&DispatchRecord::new(id, "Automated Test", AttemptStatus::Rejected))
                .unwrap();
        }

        let rotated = dir.path().join("activity.jsonl.1");
        assert!(rotated.exists());
        assert!(std::fs::metadata(&path).unwrap().len() < 800);
        assert!(std::fs::metadata(&rotated).unwrap().len() < 800);

        let recent = log.recent(3);
        assert_eq!(
            recent.iter().map(|r| r.work_item_id).collect::<Vec<_>>(),
            vec![48, 49, 50]
        );
        assert!(log.recent(100).len() < 50);
    }

    #[test]
    fn only_finished_good_outcomes_mark() {
        let mut record = DispatchRecord::new(1, "t", AttemptStatus::Finished);
        record.outcome = Some(RunOutcome::TimedOut { run_id: None });
        assert!(!record.allows_marking());
        record.outcome = Some(RunOutcome::UnknownAssumedOk);
        assert!(record.allows_marking());

        let skipped = DispatchRecord::new(1, "t", AttemptStatus::Skipped);
        assert!(!skipped.allows_marking());
    }

    #[test]
    fn serialized_shape_omits_empty_fields() {
        let record = DispatchRecord::new(9, "t", AttemptStatus::Rejected);
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"status\":\"rejected\""));
        assert!(!json.contains("outcome"));
    }
}
