//! Policy engine: gathers the per-event context the scorer runs against.
//!
//! Home mode and the known-faces flag come from the smart-home hub's state
//! API and are cached for a short window so detection bursts do not hammer
//! the hub. Hub failures degrade to a neutral context instead of failing the
//! event.

use anyhow::{Context, Result};
use chrono::Timelike;
use serde::Deserialize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::{HubSettings, QuietHours, TimeBands};
use crate::{EventMemory, HomeMode, RuntimeConfig, TimeOfDay};

const HUB_TIMEOUT: Duration = Duration::from_secs(10);

// -------------------- Event Context --------------------

/// Everything the scorer and formatter know about the world at event time.
#[derive(Clone, Debug, PartialEq)]
pub struct EventContext {
    pub time_of_day: TimeOfDay,
    pub home_mode: HomeMode,
    pub known_faces_present: bool,
    pub camera_zone: String,
    pub camera_notes: String,
    pub recent_events: usize,
}

impl EventContext {
    /// Human-readable local time for prompts and alert bodies.
    pub fn local_time_label(&self) -> String {
        chrono::Local::now().format("%Y-%m-%d %H:%M").to_string()
    }
}

/// Classify a local hour against the configured bands.
pub fn time_of_day_for_hour(hour: u32, bands: &TimeBands) -> TimeOfDay {
    if (bands.morning_start_hour..bands.evening_start_hour).contains(&hour) {
        TimeOfDay::Day
    } else if (bands.evening_start_hour..bands.night_start_hour).contains(&hour) {
        TimeOfDay::Evening
    } else {
        TimeOfDay::Night
    }
}

pub fn current_time_of_day(bands: &TimeBands) -> TimeOfDay {
    time_of_day_for_hour(chrono::Local::now().hour(), bands)
}

/// True when the local clock is inside the configured quiet-hours window.
pub fn in_quiet_hours(quiet: &QuietHours) -> bool {
    let now = chrono::Local::now();
    quiet.contains(now.hour() * 60 + now.minute())
}

// -------------------- Hub State --------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HubState {
    pub home_mode: HomeMode,
    pub known_faces_present: bool,
}

impl Default for HubState {
    fn default() -> Self {
        Self {
            home_mode: HomeMode::Home,
            known_faces_present: false,
        }
    }
}

struct CachedHubState {
    fetched_at: Instant,
    state: HubState,
}

#[derive(Deserialize)]
struct EntityState {
    state: String,
}

/// Client for the smart-home hub's read-only state API, with a small cache.
pub struct HubClient {
    agent: ureq::Agent,
    cache: Mutex<Option<CachedHubState>>,
}

impl Default for HubClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HubClient {
    pub fn new() -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(HUB_TIMEOUT).build(),
            cache: Mutex::new(None),
        }
    }

    /// Current home mode + known-faces flag, served from cache when fresh.
    /// A hub outage degrades to the neutral default with a warning.
    pub fn current_state(&self, hub: &HubSettings) -> HubState {
        {
            let cache = match self.cache.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(cached) = cache.as_ref() {
                if cached.fetched_at.elapsed() <= hub.state_cache {
                    return cached.state;
                }
            }
        }

        let state = match self.fetch_state(hub) {
            Ok(state) => state,
            Err(e) => {
                log::warn!("hub state fetch failed, assuming neutral context: {e:#}");
                return HubState::default();
            }
        };

        let mut cache = match self.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *cache = Some(CachedHubState {
            fetched_at: Instant::now(),
            state,
        });
        state
    }

    fn fetch_state(&self, hub: &HubSettings) -> Result<HubState> {
        let mode_raw = self.entity_state(hub, &hub.home_mode_entity)?;
        let home_mode = HomeMode::parse(&mode_raw).unwrap_or_else(|e| {
            log::warn!("unrecognized home mode '{}': {e}", mode_raw);
            HomeMode::Home
        });
        let faces_raw = self.entity_state(hub, &hub.known_faces_entity)?;
        let known_faces_present = matches!(faces_raw.trim(), "on" | "true" | "detected");
        Ok(HubState {
            home_mode,
            known_faces_present,
        })
    }

    fn entity_state(&self, hub: &HubSettings, entity: &str) -> Result<String> {
        let url = format!("{}/api/states/{}", hub.url, entity);
        let state: EntityState = self
            .agent
            .get(&url)
            .set("Authorization", &format!("Bearer {}", hub.token))
            .call()
            .with_context(|| format!("GET {}", url))?
            .into_json()
            .with_context(|| format!("parse state of {}", entity))?;
        Ok(state.state)
    }
}

// -------------------- Gathering --------------------

/// Assemble the full context for one event. Each piece degrades
/// independently; context gathering itself never fails the pipeline.
pub fn gather_context(
    cfg: &RuntimeConfig,
    hub: &HubClient,
    memory: &EventMemory,
    camera: &str,
) -> EventContext {
    let profile = cfg.camera_profile(camera);
    let hub_state = hub.current_state(&cfg.hub);
    let recent_events = memory
        .count_since(camera, cfg.storage.recent_events_window)
        .unwrap_or_else(|e| {
            log::warn!("recent-event query failed for {}: {e:#}", camera);
            0
        });

    EventContext {
        time_of_day: current_time_of_day(&cfg.time_bands),
        home_mode: hub_state.home_mode,
        known_faces_present: hub_state.known_faces_present,
        camera_zone: profile.zone,
        camera_notes: profile.notes,
        recent_events,
    }
}
