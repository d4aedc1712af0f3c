//! Snapshot fetcher: pulls the still image for an event from the NVR and
//! stages a copy for delivery.
//!
//! The staging copy is addressed by a relative path because the downstream
//! agent rejects absolute paths in media references.

use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::config::StorageSettings;
use crate::{ConfigStore, RuntimeConfig};

/// Responses at or below this size are treated as a missing snapshot and
/// trigger the thumbnail fallback.
pub const MIN_SNAPSHOT_BYTES: usize = 1024;

const MAX_SNAPSHOT_BYTES: u64 = 20 * 1024 * 1024;
const FETCH_TIMEOUT: Duration = Duration::from_secs(15);

/// Where the still image for one event ended up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StagedSnapshot {
    pub detection_path: PathBuf,
    pub staging_path: PathBuf,
    /// Relative path under the staging workspace, used in media references.
    pub relative_path: String,
}

pub struct SnapshotFetcher {
    agent: ureq::Agent,
}

impl Default for SnapshotFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotFetcher {
    pub fn new() -> Self {
        Self {
            agent: ureq::AgentBuilder::new()
                .timeout(FETCH_TIMEOUT)
                .build(),
        }
    }

    /// Wait out the NVR finalization delay, then fetch the snapshot with the
    /// thumbnail fallback and store both copies. Fails the event when both
    /// fetches fail; the caller does not retry further.
    pub fn fetch_and_stage(&self, cfg: &RuntimeConfig, event_id: &str) -> Result<StagedSnapshot> {
        std::thread::sleep(cfg.nvr.snapshot_delay);
        self.fetch_fresh(cfg, event_id)
    }

    /// Fetch without the finalization delay. Used by the confirmation pass,
    /// which re-reads an event the NVR has already materialized.
    pub fn fetch_fresh(&self, cfg: &RuntimeConfig, event_id: &str) -> Result<StagedSnapshot> {
        let bytes = self.fetch_event_image(cfg, event_id)?;
        store_snapshot(&cfg.storage, event_id, &bytes)
    }

    fn fetch_event_image(&self, cfg: &RuntimeConfig, event_id: &str) -> Result<Vec<u8>> {
        let snapshot_url = format!("{}/api/events/{}/snapshot.jpg", cfg.nvr.url, event_id);
        match self.fetch_image(&snapshot_url) {
            Ok(bytes) if is_valid_snapshot(&bytes) => return Ok(bytes),
            Ok(bytes) => log::warn!(
                "snapshot for {} too small ({} bytes); trying thumbnail",
                event_id,
                bytes.len()
            ),
            Err(e) => log::warn!("snapshot fetch for {} failed: {e:#}; trying thumbnail", event_id),
        }

        let thumbnail_url = format!("{}/api/events/{}/thumbnail.jpg", cfg.nvr.url, event_id);
        let bytes = self
            .fetch_image(&thumbnail_url)
            .with_context(|| format!("thumbnail fetch for {} failed", event_id))?;
        if bytes.is_empty() {
            return Err(anyhow!("thumbnail for {} is empty", event_id));
        }
        Ok(bytes)
    }

    fn fetch_image(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .agent
            .get(url)
            .call()
            .with_context(|| format!("GET {}", url))?;
        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_SNAPSHOT_BYTES)
            .read_to_end(&mut bytes)
            .context("read image body")?;
        Ok(bytes)
    }
}

pub fn is_valid_snapshot(bytes: &[u8]) -> bool {
    bytes.len() > MIN_SNAPSHOT_BYTES
}

/// Write the detection-store copy and the staging duplicate. Paths embed the
/// event id, so concurrent events cannot collide.
pub fn store_snapshot(
    storage: &StorageSettings,
    event_id: &str,
    bytes: &[u8],
) -> Result<StagedSnapshot> {
    let filename = format!("{}.jpg", event_id);
    let detection_dir = storage.snapshot_dir();
    let staging_dir = storage.staging_dir();

    std::fs::create_dir_all(&detection_dir)
        .with_context(|| format!("create {}", detection_dir.display()))?;
    std::fs::create_dir_all(&staging_dir)
        .with_context(|| format!("create {}", staging_dir.display()))?;

    let detection_path = detection_dir.join(&filename);
    std::fs::write(&detection_path, bytes)
        .with_context(|| format!("write {}", detection_path.display()))?;

    let staging_path = staging_dir.join(&filename);
    std::fs::write(&staging_path, bytes)
        .with_context(|| format!("write {}", staging_path.display()))?;

    Ok(StagedSnapshot {
        detection_path,
        staging_path,
        relative_path: format!("ai-snapshots/{}", filename),
    })
}

// -------------------- Staging Sweeper --------------------

/// Remove staging snapshots older than the configured TTL. The detection
/// store is left alone; its retention belongs to the NVR.
pub fn sweep_staging(storage: &StorageSettings) -> Result<usize> {
    let staging_dir = storage.staging_dir();
    let entries = match std::fs::read_dir(&staging_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e).with_context(|| format!("read {}", staging_dir.display())),
    };

    let now = SystemTime::now();
    let mut removed = 0;
    for entry in entries {
        let entry = entry?;
        let modified = match entry.metadata().and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(_) => continue,
        };
        let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
        if age > storage.staging_ttl {
            if let Err(e) = std::fs::remove_file(entry.path()) {
                log::warn!("failed to sweep {}: {}", entry.path().display(), e);
            } else {
                removed += 1;
            }
        }
    }
    Ok(removed)
}

/// Background sweeper thread; runs until shutdown is requested.
pub fn spawn_staging_sweeper(
    store: Arc<ConfigStore>,
    shutdown: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        while !shutdown.load(Ordering::Relaxed) {
            std::thread::sleep(Duration::from_secs(60));
            let cfg = store.snapshot();
            match sweep_staging(&cfg.storage) {
                Ok(0) => {}
                Ok(removed) => log::debug!("swept {} staged snapshot(s)", removed),
                Err(e) => log::warn!("staging sweep failed: {e:#}"),
            }
        }
    })
}
