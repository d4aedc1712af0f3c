//! Event memory: append-only, line-delimited JSON history of final
//! decisions, with a configured line cap and rolling-window queries.
//!
//! Reads tolerate a torn final line, which is common after a crash mid
//! append; damaged lines are skipped, never propagated.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::config::StorageSettings;
use crate::{AlertAction, Decision, EventKind, RiskLevel};

/// One line of the history file.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HistoryRecord {
    /// Seconds since the Unix epoch.
    pub timestamp: u64,
    pub camera: String,
    pub risk_level: RiskLevel,
    pub event_type: EventKind,
    pub risk_confidence: f64,
    pub action: AlertAction,
}

impl HistoryRecord {
    pub fn from_decision(camera: &str, decision: &Decision) -> Self {
        Self {
            timestamp: now_s(),
            camera: camera.to_string(),
            risk_level: decision.risk_level,
            event_type: decision.event_type,
            risk_confidence: decision.risk_confidence,
            action: decision.action,
        }
    }
}

/// File-backed event memory. All file access is serialized through one
/// mutex; the daemon is the only writer of this file.
pub struct EventMemory {
    path: PathBuf,
    max_lines: usize,
    lock: Mutex<()>,
}

impl EventMemory {
    pub fn open(storage: &StorageSettings) -> Self {
        Self::new(storage.history_file.clone(), storage.history_max_lines)
    }

    pub fn new(path: PathBuf, max_lines: usize) -> Self {
        Self {
            path,
            max_lines: max_lines.max(1),
            lock: Mutex::new(()),
        }
    }

    /// Append one record, then rewrite the file oldest-first if the line cap
    /// was exceeded.
    pub fn append(&self, record: &HistoryRecord) -> Result<()> {
        let _guard = self.guard();

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }

        let line = serde_json::to_string(record)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open {}", self.path.display()))?;
        writeln!(file, "{}", line).with_context(|| format!("append {}", self.path.display()))?;

        let records = self.read_records_unlocked()?;
        if records.len() > self.max_lines {
            let keep = &records[records.len() - self.max_lines..];
            self.rewrite_unlocked(keep)?;
        }
        Ok(())
    }

    /// Count records for one camera newer than the window.
    pub fn count_since(&self, camera: &str, window: Duration) -> Result<usize> {
        let _guard = self.guard();
        let cutoff = now_s().saturating_sub(window.as_secs());
        let records = self.read_records_unlocked()?;
        Ok(records
            .iter()
            .filter(|r| r.camera == camera && r.timestamp >= cutoff)
            .count())
    }

    pub fn records(&self) -> Result<Vec<HistoryRecord>> {
        let _guard = self.guard();
        self.read_records_unlocked()
    }

    fn read_records_unlocked(&self) -> Result<Vec<HistoryRecord>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("read {}", self.path.display())),
        };

        let mut records = Vec::new();
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<HistoryRecord>(line) {
                Ok(record) => records.push(record),
                // A torn or garbled line is dropped, not surfaced.
                Err(e) => log::debug!("skipping unreadable history line: {}", e),
            }
        }
        Ok(records)
    }

    fn rewrite_unlocked(&self, records: &[HistoryRecord]) -> Result<()> {
        let tmp_path = self.path.with_extension("jsonl.tmp");
        let mut contents = String::new();
        for record in records {
            contents.push_str(&serde_json::to_string(record)?);
            contents.push('\n');
        }
        std::fs::write(&tmp_path, contents)
            .with_context(|| format!("write {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("rename over {}", self.path.display()))?;
        Ok(())
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, ()> {
        match self.lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn now_s() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
