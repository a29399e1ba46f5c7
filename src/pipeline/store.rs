use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// On-disk shape of the processed set.
#[derive(Debug, Serialize, Deserialize)]
struct StoreDocument<T> {
    processed_items: Vec<T>,
    #[serde(default)]
    last_updated: Option<DateTime<Utc>>,
}

/// Work item ids whose workflow run has reached a terminal state.
pub struct ProcessedStore {
    path: PathBuf,
    ids: BTreeSet<u64>,
    last_updated: Option<DateTime<Utc>>,
}

impl ProcessedStore {
    pub fn empty(path: PathBuf) -> Self {
        Self {
            path,
            ids: BTreeSet::new(),
            last_updated: None,
        }
    }

    /// Load the set at `path`. A missing file is an empty set; a malformed file or
    /// entry is dropped with a warning.
    pub fn load(path: PathBuf) -> Result<Self> {
        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::empty(path)),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        };

        let doc: StoreDocument<Value> = match serde_json::from_str(&contents) {
            Ok(doc) => doc,
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "processed items file is malformed, starting empty"
                );
                return Ok(Self::empty(path));
            }
        };

        let mut ids = BTreeSet::new();
        for entry in doc.processed_items {
            match entry.as_u64().filter(|id| *id > 0) {
                Some(id) => {
                    ids.insert(id);
                }
                None => tracing::warn!(%entry, "discarding invalid processed item id"),
            }
        }
        tracing::debug!(path = %path.display(), count = ids.len(), "loaded processed items");
        Ok(Self {
            path,
            ids,
            last_updated: doc.last_updated,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, id: u64) -> bool {
        self.ids.contains(&id)
    }

    /// Returns `false` when the id was already present.
    pub fn mark(&mut self, id: u64) -> bool {
        self.ids.insert(id)
    }

    /// Keep only ids for which `keep` holds; returns the removed ids.
    pub fn retain(&mut self, mut keep: impl FnMut(u64) -> bool) -> Vec<u64> {
        let removed: Vec<u64> = self.ids.iter().copied().filter(|id| !keep(*id)).collect();
        for id in &removed {
            self.ids.remove(id);
        }
        removed
    }

    pub fn ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.ids.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.last_updated
    }

    /// Write the set atomically: temp file, fsync, rename over the target, fsync the directory.
    pub fn save(&mut self) -> Result<()> {
        let now = Utc::now();
        let doc = StoreDocument {
            processed_items: self.ids.iter().copied().collect(),
            last_updated: Some(now),
        };
        let json = serde_json::to_string_pretty(&doc)?;

        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        let tmp_path = temp_path(&self.path);
        if let Err(e) = write_synced(&tmp_path, json.as_bytes())
            .and_then(|()| std::fs::rename(&tmp_path, &self.path))
        {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(e).with_context(|| format!("Failed to write {}", self.path.display()));
        }
        fsync_dir(&dir)?;

        self.last_updated = Some(now);
        Ok(())
    }

    /// Save, logging instead of failing; the in-memory set stays authoritative.
    pub fn persist(&mut self) {
        match self.save() {
            Ok(()) => tracing::debug!(count = self.ids.len(), "persisted processed items"),
            Err(e) => tracing::error!(error = %format!("{e:#}"), "failed to persist processed items"),
        }
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "processed_items.json".into());
    name.push(".tmp");
    path.with_file_name(name)
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

#[cfg(unix)]
fn fsync_dir(dir: &Path) -> Result<()> {
    File::open(dir)
        .and_then(|d| d.sync_all())
        .with_context(|| format!("Failed to sync {}", dir.display()))
}

#[cfg(not(unix))]
fn fsync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}
