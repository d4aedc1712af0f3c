use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};

const DEFAULT_MQTT_BROKER_ADDR: &str = "127.0.0.1:1883";
const DEFAULT_MQTT_CLIENT_ID: &str = "frigate-sentry";
const DEFAULT_EVENTS_TOPIC: &str = "frigate/events";
const DEFAULT_TOPIC_PREFIX: &str = "sentry";
const DEFAULT_NVR_URL: &str = "http://127.0.0.1:5000";
const DEFAULT_SNAPSHOT_DELAY_SECS: u64 = 3;
const DEFAULT_VISION_ENDPOINT: &str = "http://127.0.0.1:11434";
const DEFAULT_VISION_MODEL: &str = "llava:13b";
const DEFAULT_VISION_TIMEOUT_SECS: u64 = 60;
const DEFAULT_HUB_URL: &str = "http://127.0.0.1:8123";
const DEFAULT_HOME_MODE_ENTITY: &str = "input_select.home_mode";
const DEFAULT_KNOWN_FACES_ENTITY: &str = "binary_sensor.known_faces";
const DEFAULT_ALARM_ENTITY: &str = "switch.siren";
const DEFAULT_SPEAKER_ENTITY: &str = "media_player.indoor_speaker";
const DEFAULT_HUB_CACHE_SECS: u64 = 30;
const DEFAULT_AGENT_CHANNEL: &str = "telegram";
const DEFAULT_AGENT_NAME: &str = "frigate-sentry";
const DEFAULT_AGENT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_COOLDOWN_SECS: u64 = 30;
const DEFAULT_QUEUE_MAX_DEPTH: usize = 64;
const DEFAULT_CONFIRM_DELAY_SECS: u64 = 4;
const DEFAULT_CONFIRM_TIMEOUT_SECS: u64 = 30;
const DEFAULT_QUIET_START: &str = "22:00";
const DEFAULT_QUIET_END: &str = "07:00";
const DEFAULT_MORNING_START_HOUR: u32 = 7;
const DEFAULT_EVENING_START_HOUR: u32 = 18;
const DEFAULT_NIGHT_START_HOUR: u32 = 22;
const DEFAULT_BASE_DIR: &str = "/var/lib/frigate-sentry";
const DEFAULT_WORKSPACE_DIR: &str = "workspace";
const DEFAULT_HISTORY_FILE: &str = "event_history.jsonl";
const DEFAULT_HISTORY_MAX_LINES: usize = 2000;
const DEFAULT_RECENT_WINDOW_SECS: u64 = 3600;
const DEFAULT_STAGING_TTL_SECS: u64 = 6 * 3600;

fn config_string(value: Option<String>, default: &str) -> String {
    value.unwrap_or_else(|| default.to_string())
}

fn config_u64(value: Option<u64>, default: u64) -> u64 {
    value.unwrap_or(default)
}

// -------------------- File Shape --------------------

#[derive(Debug, Deserialize, Default)]
struct SentryConfigFile {
    mqtt: Option<MqttConfigFile>,
    nvr: Option<NvrConfigFile>,
    vision: Option<VisionConfigFile>,
    hub: Option<HubConfigFile>,
    agent: Option<AgentConfigFile>,
    cameras: Option<HashMap<String, CameraConfigFile>>,
    pipeline: Option<PipelineConfigFile>,
    quiet_hours: Option<QuietHoursConfigFile>,
    time_bands: Option<TimeBandsConfigFile>,
    storage: Option<StorageConfigFile>,
    phases: Option<PhasesConfigFile>,
    audit_signing_key: Option<String>,
    users: Option<Vec<UserConfigFile>>,
}

#[derive(Debug, Deserialize, Default)]
struct MqttConfigFile {
    broker_addr: Option<String>,
    username: Option<String>,
    password: Option<String>,
    client_id: Option<String>,
    events_topic: Option<String>,
    topic_prefix: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct NvrConfigFile {
    url: Option<String>,
    snapshot_delay_seconds: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct VisionConfigFile {
    endpoint: Option<String>,
    fallback_endpoint: Option<String>,
    model: Option<String>,
    timeout_seconds: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct HubConfigFile {
    url: Option<String>,
    token: Option<String>,
    home_mode_entity: Option<String>,
    known_faces_entity: Option<String>,
    alarm_entity: Option<String>,
    speaker_entity: Option<String>,
    zone_lights: Option<HashMap<String, Vec<String>>>,
    state_cache_seconds: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct AgentConfigFile {
    gateway_url: Option<String>,
    token: Option<String>,
    channel: Option<String>,
    recipients: Option<Vec<String>>,
    name: Option<String>,
    timeout_seconds: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    zone: Option<String>,
    notes: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    cooldown_seconds: Option<u64>,
    queue_max_depth: Option<usize>,
    confirm_delay_seconds: Option<u64>,
    confirm_timeout_seconds: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct QuietHoursConfigFile {
    start: Option<String>,
    end: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct TimeBandsConfigFile {
    morning_start_hour: Option<u32>,
    evening_start_hour: Option<u32>,
    night_start_hour: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct StorageConfigFile {
    base_dir: Option<String>,
    workspace_dir: Option<String>,
    history_file: Option<String>,
    history_max_lines: Option<usize>,
    recent_events_window_seconds: Option<u64>,
    staging_ttl_seconds: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct PhasesConfigFile {
    confirmation: Option<bool>,
    actions: Option<bool>,
    delivery: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct UserConfigFile {
    name: String,
    role: Option<String>,
}

// -------------------- Runtime Settings --------------------

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub broker_addr: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub events_topic: String,
    pub topic_prefix: String,
}

impl MqttSettings {
    pub fn analysis_topic(&self) -> String {
        format!("{}/analysis", self.topic_prefix)
    }

    pub fn availability_topic(&self) -> String {
        format!("{}/status", self.topic_prefix)
    }
}

#[derive(Debug, Clone)]
pub struct NvrSettings {
    pub url: String,
    pub snapshot_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct VisionSettings {
    pub endpoint: String,
    pub fallback_endpoint: Option<String>,
    pub model: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct HubSettings {
    pub url: String,
    pub token: String,
    pub home_mode_entity: String,
    pub known_faces_entity: String,
    pub alarm_entity: String,
    pub speaker_entity: String,
    pub zone_lights: HashMap<String, Vec<String>>,
    pub state_cache: Duration,
}

#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub gateway_url: String,
    pub token: String,
    pub channel: String,
    pub recipients: Vec<String>,
    pub name: String,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Default)]
pub struct CameraProfile {
    pub zone: String,
    pub notes: String,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub cooldown: Duration,
    pub queue_max_depth: usize,
    pub confirm_delay: Duration,
    pub confirm_timeout: Duration,
}

/// A local-time window in which audible actions are suppressed unless the
/// risk is critical. The window may wrap midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuietHours {
    pub start_minute: u32,
    pub end_minute: u32,
}

impl QuietHours {
    pub fn parse(start: &str, end: &str) -> Result<Self> {
        Ok(Self {
            start_minute: parse_clock(start)?,
            end_minute: parse_clock(end)?,
        })
    }

    pub fn contains(&self, minute_of_day: u32) -> bool {
        if self.start_minute == self.end_minute {
            return false;
        }
        if self.start_minute < self.end_minute {
            (self.start_minute..self.end_minute).contains(&minute_of_day)
        } else {
            minute_of_day >= self.start_minute || minute_of_day < self.end_minute
        }
    }
}

fn parse_clock(raw: &str) -> Result<u32> {
    let (hour, minute) = raw
        .trim()
        .split_once(':')
        .ok_or_else(|| anyhow!("invalid clock time '{}'; expected HH:MM", raw))?;
    let hour: u32 = hour.parse().context("invalid hour")?;
    let minute: u32 = minute.parse().context("invalid minute")?;
    if hour > 23 || minute > 59 {
        return Err(anyhow!("clock time '{}' out of range", raw));
    }
    Ok(hour * 60 + minute)
}

#[derive(Debug, Clone, Copy)]
pub struct TimeBands {
    pub morning_start_hour: u32,
    pub evening_start_hour: u32,
    pub night_start_hour: u32,
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub base_dir: PathBuf,
    pub workspace_dir: PathBuf,
    pub history_file: PathBuf,
    pub history_max_lines: usize,
    pub recent_events_window: Duration,
    pub staging_ttl: Duration,
}

impl StorageSettings {
    pub fn snapshot_dir(&self) -> PathBuf {
        self.base_dir.join("ai-snapshots")
    }

    pub fn clip_dir(&self) -> PathBuf {
        self.base_dir.join("ai-clips")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.workspace_dir.join("ai-snapshots")
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PhaseToggles {
    pub confirmation: bool,
    pub actions: bool,
    pub delivery: bool,
}

#[derive(Debug, Clone)]
pub struct UserEntry {
    pub name: String,
    pub role: String,
}

/// The single authoritative runtime configuration. Components never hold this
/// directly; they receive an immutable `Arc` snapshot for one event.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub mqtt: MqttSettings,
    pub nvr: NvrSettings,
    pub vision: VisionSettings,
    pub hub: HubSettings,
    pub agent: AgentSettings,
    pub cameras: HashMap<String, CameraProfile>,
    pub pipeline: PipelineSettings,
    pub quiet_hours: QuietHours,
    pub time_bands: TimeBands,
    pub storage: StorageSettings,
    pub phases: PhaseToggles,
    pub audit_signing_key: Option<String>,
    pub users: Vec<UserEntry>,
}

impl RuntimeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let file_cfg: SentryConfigFile = read_config_file(path)?;
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn camera_profile(&self, camera: &str) -> CameraProfile {
        self.cameras.get(camera).cloned().unwrap_or_default()
    }

    fn from_file(file: SentryConfigFile) -> Result<Self> {
        let mqtt_file = file.mqtt.unwrap_or_default();
        let mqtt = MqttSettings {
            broker_addr: config_string(mqtt_file.broker_addr, DEFAULT_MQTT_BROKER_ADDR),
            username: mqtt_file.username,
            password: mqtt_file.password,
            client_id: config_string(mqtt_file.client_id, DEFAULT_MQTT_CLIENT_ID),
            events_topic: config_string(mqtt_file.events_topic, DEFAULT_EVENTS_TOPIC),
            topic_prefix: config_string(mqtt_file.topic_prefix, DEFAULT_TOPIC_PREFIX),
        };

        let nvr_file = file.nvr.unwrap_or_default();
        let nvr = NvrSettings {
            url: config_string(nvr_file.url, DEFAULT_NVR_URL),
            snapshot_delay: Duration::from_secs(config_u64(
                nvr_file.snapshot_delay_seconds,
                DEFAULT_SNAPSHOT_DELAY_SECS,
            )),
        };

        let vision_file = file.vision.unwrap_or_default();
        let vision = VisionSettings {
            endpoint: config_string(vision_file.endpoint, DEFAULT_VISION_ENDPOINT),
            fallback_endpoint: vision_file.fallback_endpoint,
            model: config_string(vision_file.model, DEFAULT_VISION_MODEL),
            timeout: Duration::from_secs(config_u64(
                vision_file.timeout_seconds,
                DEFAULT_VISION_TIMEOUT_SECS,
            )),
        };

        let hub_file = file.hub.unwrap_or_default();
        let hub = HubSettings {
            url: config_string(hub_file.url, DEFAULT_HUB_URL),
            token: hub_file.token.unwrap_or_default(),
            home_mode_entity: config_string(hub_file.home_mode_entity, DEFAULT_HOME_MODE_ENTITY),
            known_faces_entity: config_string(
                hub_file.known_faces_entity,
                DEFAULT_KNOWN_FACES_ENTITY,
            ),
            alarm_entity: config_string(hub_file.alarm_entity, DEFAULT_ALARM_ENTITY),
            speaker_entity: config_string(hub_file.speaker_entity, DEFAULT_SPEAKER_ENTITY),
            zone_lights: hub_file.zone_lights.unwrap_or_default(),
            state_cache: Duration::from_secs(config_u64(
                hub_file.state_cache_seconds,
                DEFAULT_HUB_CACHE_SECS,
            )),
        };

        let agent_file = file.agent.unwrap_or_default();
        let agent = AgentSettings {
            gateway_url: agent_file.gateway_url.unwrap_or_default(),
            token: agent_file.token.unwrap_or_default(),
            channel: config_string(agent_file.channel, DEFAULT_AGENT_CHANNEL),
            recipients: agent_file.recipients.unwrap_or_default(),
            name: config_string(agent_file.name, DEFAULT_AGENT_NAME),
            timeout_seconds: config_u64(agent_file.timeout_seconds, DEFAULT_AGENT_TIMEOUT_SECS),
        };

        let cameras = file
            .cameras
            .unwrap_or_default()
            .into_iter()
            .map(|(name, profile)| {
                (
                    name,
                    CameraProfile {
                        zone: profile.zone.unwrap_or_default().to_lowercase(),
                        notes: profile.notes.unwrap_or_default(),
                    },
                )
            })
            .collect();

        let pipeline_file = file.pipeline.unwrap_or_default();
        let pipeline = PipelineSettings {
            cooldown: Duration::from_secs(config_u64(
                pipeline_file.cooldown_seconds,
                DEFAULT_COOLDOWN_SECS,
            )),
            queue_max_depth: pipeline_file
                .queue_max_depth
                .unwrap_or(DEFAULT_QUEUE_MAX_DEPTH),
            confirm_delay: Duration::from_secs(config_u64(
                pipeline_file.confirm_delay_seconds,
                DEFAULT_CONFIRM_DELAY_SECS,
            )),
            confirm_timeout: Duration::from_secs(config_u64(
                pipeline_file.confirm_timeout_seconds,
                DEFAULT_CONFIRM_TIMEOUT_SECS,
            )),
        };

        let quiet_file = file.quiet_hours.unwrap_or_default();
        let quiet_hours = QuietHours::parse(
            quiet_file.start.as_deref().unwrap_or(DEFAULT_QUIET_START),
            quiet_file.end.as_deref().unwrap_or(DEFAULT_QUIET_END),
        )?;

        let bands_file = file.time_bands.unwrap_or_default();
        let time_bands = TimeBands {
            morning_start_hour: bands_file
                .morning_start_hour
                .unwrap_or(DEFAULT_MORNING_START_HOUR),
            evening_start_hour: bands_file
                .evening_start_hour
                .unwrap_or(DEFAULT_EVENING_START_HOUR),
            night_start_hour: bands_file
                .night_start_hour
                .unwrap_or(DEFAULT_NIGHT_START_HOUR),
        };

        let storage_file = file.storage.unwrap_or_default();
        let base_dir = PathBuf::from(config_string(storage_file.base_dir, DEFAULT_BASE_DIR));
        let workspace_dir = storage_file
            .workspace_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| base_dir.join(DEFAULT_WORKSPACE_DIR));
        let history_file = storage_file
            .history_file
            .map(PathBuf::from)
            .unwrap_or_else(|| base_dir.join(DEFAULT_HISTORY_FILE));
        let storage = StorageSettings {
            base_dir,
            workspace_dir,
            history_file,
            history_max_lines: storage_file
                .history_max_lines
                .unwrap_or(DEFAULT_HISTORY_MAX_LINES),
            recent_events_window: Duration::from_secs(config_u64(
                storage_file.recent_events_window_seconds,
                DEFAULT_RECENT_WINDOW_SECS,
            )),
            staging_ttl: Duration::from_secs(config_u64(
                storage_file.staging_ttl_seconds,
                DEFAULT_STAGING_TTL_SECS,
            )),
        };

        let phases_file = file.phases.unwrap_or_default();
        let phases = PhaseToggles {
            confirmation: phases_file.confirmation.unwrap_or(true),
            actions: phases_file.actions.unwrap_or(true),
            delivery: phases_file.delivery.unwrap_or(true),
        };

        let users = file
            .users
            .unwrap_or_default()
            .into_iter()
            .map(|user| UserEntry {
                name: user.name,
                role: user.role.unwrap_or_else(|| "viewer".to_string()),
            })
            .collect();

        Ok(Self {
            mqtt,
            nvr,
            vision,
            hub,
            agent,
            cameras,
            pipeline,
            quiet_hours,
            time_bands,
            storage,
            phases,
            audit_signing_key: file.audit_signing_key,
            users,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("SENTRY_MQTT_BROKER_ADDR") {
            if !addr.trim().is_empty() {
                self.mqtt.broker_addr = addr;
            }
        }
        if let Ok(user) = std::env::var("SENTRY_MQTT_USERNAME") {
            if !user.trim().is_empty() {
                self.mqtt.username = Some(user);
            }
        }
        if let Ok(pass) = std::env::var("SENTRY_MQTT_PASSWORD") {
            if !pass.trim().is_empty() {
                self.mqtt.password = Some(pass);
            }
        }
        if let Ok(url) = std::env::var("SENTRY_NVR_URL") {
            if !url.trim().is_empty() {
                self.nvr.url = url;
            }
        }
        if let Ok(endpoint) = std::env::var("SENTRY_VISION_ENDPOINT") {
            if !endpoint.trim().is_empty() {
                self.vision.endpoint = endpoint;
            }
        }
        if let Ok(token) = std::env::var("SENTRY_HUB_TOKEN") {
            if !token.trim().is_empty() {
                self.hub.token = token;
            }
        }
        if let Ok(token) = std::env::var("SENTRY_AGENT_TOKEN") {
            if !token.trim().is_empty() {
                self.agent.token = token;
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        for (label, raw) in [
            ("nvr.url", &self.nvr.url),
            ("vision.endpoint", &self.vision.endpoint),
            ("hub.url", &self.hub.url),
        ] {
            url::Url::parse(raw).with_context(|| format!("{} is not a valid URL", label))?;
        }
        if let Some(fallback) = &self.vision.fallback_endpoint {
            url::Url::parse(fallback).context("vision.fallback_endpoint is not a valid URL")?;
        }
        if self.mqtt.broker_addr.trim().is_empty() {
            return Err(anyhow!("mqtt.broker_addr must not be empty"));
        }
        if self.mqtt.events_topic.trim().is_empty() {
            return Err(anyhow!("mqtt.events_topic must not be empty"));
        }
        if self.vision.timeout.as_secs() == 0 {
            return Err(anyhow!("vision.timeout_seconds must be greater than zero"));
        }
        if self.pipeline.queue_max_depth == 0 {
            return Err(anyhow!("pipeline.queue_max_depth must be at least 1"));
        }
        if self.pipeline.confirm_timeout < self.pipeline.confirm_delay {
            return Err(anyhow!(
                "pipeline.confirm_timeout_seconds must be >= confirm_delay_seconds"
            ));
        }
        if self.storage.history_max_lines == 0 {
            return Err(anyhow!("storage.history_max_lines must be at least 1"));
        }
        let bands = &self.time_bands;
        for (label, hour) in [
            ("time_bands.morning_start_hour", bands.morning_start_hour),
            ("time_bands.evening_start_hour", bands.evening_start_hour),
            ("time_bands.night_start_hour", bands.night_start_hour),
        ] {
            if hour > 23 {
                return Err(anyhow!("{} must be within 0..=23", label));
            }
        }
        if bands.morning_start_hour >= bands.evening_start_hour
            || bands.evening_start_hour >= bands.night_start_hour
        {
            return Err(anyhow!(
                "time bands must be ordered morning < evening < night"
            ));
        }
        if self.phases.delivery {
            if self.agent.gateway_url.trim().is_empty() {
                return Err(anyhow!("agent.gateway_url is required while delivery is enabled"));
            }
            url::Url::parse(&self.agent.gateway_url)
                .context("agent.gateway_url is not a valid URL")?;
            if self.agent.token.trim().is_empty() {
                return Err(anyhow!("agent.token is required while delivery is enabled"));
            }
            if self.agent.recipients.is_empty() {
                return Err(anyhow!(
                    "agent.recipients must list at least one recipient while delivery is enabled"
                ));
            }
        }
        if self.phases.actions && self.hub.token.trim().is_empty() {
            return Err(anyhow!("hub.token is required while actions are enabled"));
        }
        for user in &self.users {
            if user.name.trim().is_empty() {
                return Err(anyhow!("users[].name must not be empty"));
            }
            match user.role.as_str() {
                "admin" | "viewer" => {}
                other => {
                    return Err(anyhow!(
                        "unsupported user role '{}'; expected 'admin' or 'viewer'",
                        other
                    ))
                }
            }
        }
        if let Some(key) = &self.audit_signing_key {
            if key.trim().len() < 16 {
                return Err(anyhow!("audit_signing_key must be at least 16 characters"));
            }
        }
        Ok(())
    }
}

// -------------------- Config Store --------------------

/// Owner of the authoritative config. Readers take `snapshot()` once per
/// event and never observe a partial reload; an invalid reload keeps the
/// previous snapshot and logs the failure.
pub struct ConfigStore {
    path: PathBuf,
    current: RwLock<Arc<RuntimeConfig>>,
    last_modified: Mutex<Option<SystemTime>>,
}

impl ConfigStore {
    pub fn load(path: &Path) -> Result<Arc<Self>> {
        let cfg = RuntimeConfig::load(path)?;
        let last_modified = std::fs::metadata(path).and_then(|m| m.modified()).ok();
        Ok(Arc::new(Self {
            path: path.to_path_buf(),
            current: RwLock::new(Arc::new(cfg)),
            last_modified: Mutex::new(last_modified),
        }))
    }

    pub fn snapshot(&self) -> Arc<RuntimeConfig> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Reload the file if its mtime advanced. Returns true when a new
    /// snapshot was installed.
    pub fn reload_if_changed(&self) -> Result<bool> {
        let modified = std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .with_context(|| format!("stat config file {}", self.path.display()))?;

        {
            let mut last = self
                .last_modified
                .lock()
                .map_err(|_| anyhow!("config watcher mutex poisoned"))?;
            if *last == Some(modified) {
                return Ok(false);
            }
            *last = Some(modified);
        }

        let cfg = RuntimeConfig::load(&self.path)?;
        let mut guard = self
            .current
            .write()
            .map_err(|_| anyhow!("config store lock poisoned"))?;
        *guard = Arc::new(cfg);
        Ok(true)
    }

    /// Poll the config file for changes until shutdown is requested.
    pub fn spawn_watcher(
        store: Arc<Self>,
        poll_interval: Duration,
        shutdown: Arc<AtomicBool>,
    ) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || {
            while !shutdown.load(Ordering::Relaxed) {
                std::thread::sleep(poll_interval);
                match store.reload_if_changed() {
                    Ok(true) => log::info!("config reloaded from {}", store.path.display()),
                    Ok(false) => {}
                    Err(e) => log::warn!("config reload failed, keeping previous snapshot: {e:#}"),
                }
            }
        })
    }
}

fn read_config_file<T>(path: &Path) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;

    let cfg = if path.extension().map(|e| e == "toml").unwrap_or(false) {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid TOML config file {}: {}", path.display(), e))?
    } else if path.extension().map(|e| e == "json").unwrap_or(false) {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid JSON config file {}: {}", path.display(), e))?
    } else {
        match serde_json::from_str(&raw) {
            Ok(cfg) => cfg,
            Err(json_err) => match toml::from_str(&raw) {
                Ok(cfg) => cfg,
                Err(toml_err) => {
                    return Err(anyhow!(
                        "invalid config file {} (tried JSON and TOML): json error: {}; toml error: {}",
                        path.display(),
                        json_err,
                        toml_err
                    ));
                }
            },
        }
    };
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn minimal_json() -> &'static str {
        r#"{
            "agent": {
                "gateway_url": "http://127.0.0.1:18789",
                "token": "secret-token",
                "recipients": ["+15550100"]
            },
            "hub": { "token": "hub-token" },
            "cameras": {
                "front_door": { "zone": "entry", "notes": "packages arrive here" }
            }
        }"#
    }

    fn write_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("sentry.json");
        std::fs::write(&path, contents).expect("write config");
        (dir, path)
    }

    #[test]
    fn loads_defaults_over_minimal_file() {
        let (_dir, path) = write_config(minimal_json());
        let cfg = RuntimeConfig::load(&path).expect("load config");
        assert_eq!(cfg.mqtt.events_topic, "frigate/events");
        assert_eq!(cfg.mqtt.analysis_topic(), "sentry/analysis");
        assert_eq!(cfg.nvr.snapshot_delay, Duration::from_secs(3));
        assert_eq!(cfg.pipeline.cooldown, Duration::from_secs(30));
        assert!(cfg.phases.confirmation);
        assert_eq!(cfg.camera_profile("front_door").zone, "entry");
        assert_eq!(cfg.camera_profile("missing").zone, "");
    }

    #[test]
    fn rejects_invalid_urls() {
        let (_dir, path) = write_config(
            r#"{
                "nvr": { "url": "not a url" },
                "phases": { "actions": false, "delivery": false }
            }"#,
        );
        let err = RuntimeConfig::load(&path).expect_err("should reject");
        assert!(err.to_string().contains("nvr.url"));
    }

    #[test]
    fn delivery_phase_requires_agent_settings() {
        let (_dir, path) = write_config(r#"{ "phases": { "actions": false } }"#);
        let err = RuntimeConfig::load(&path).expect_err("should reject");
        assert!(err.to_string().contains("agent.gateway_url"));
    }

    #[test]
    fn rejects_unordered_time_bands() {
        let (_dir, path) = write_config(
            r#"{
                "phases": { "actions": false, "delivery": false },
                "time_bands": { "morning_start_hour": 9, "evening_start_hour": 8, "night_start_hour": 22 }
            }"#,
        );
        assert!(RuntimeConfig::load(&path).is_err());
    }

    #[test]
    fn quiet_hours_wrap_midnight() {
        let quiet = QuietHours::parse("22:00", "07:00").expect("parse");
        assert!(quiet.contains(23 * 60));
        assert!(quiet.contains(2 * 60));
        assert!(!quiet.contains(12 * 60));
        let day = QuietHours::parse("08:00", "10:00").expect("parse");
        assert!(day.contains(9 * 60));
        assert!(!day.contains(10 * 60));
    }

    #[test]
    fn reload_keeps_previous_snapshot_on_invalid_file() {
        let (_dir, path) = write_config(minimal_json());
        let store = ConfigStore::load(&path).expect("load store");
        let before = store.snapshot();

        // mtime must visibly advance for the watcher to pick up the change
        std::thread::sleep(Duration::from_millis(20));
        std::fs::write(&path, "{not json").expect("write bad config");
        let _ = filetime_touch(&path);

        assert!(store.reload_if_changed().is_err());
        let after = store.snapshot();
        assert_eq!(before.mqtt.events_topic, after.mqtt.events_topic);
    }

    #[test]
    fn reload_installs_new_snapshot() {
        let (_dir, path) = write_config(minimal_json());
        let store = ConfigStore::load(&path).expect("load store");

        std::thread::sleep(Duration::from_millis(20));
        let updated = minimal_json().replace("frigate-sentry", "frigate-sentry-2");
        std::fs::write(&path, updated).expect("write config");
        let _ = filetime_touch(&path);

        store.reload_if_changed().expect("reload");
    }

    fn filetime_touch(path: &Path) -> std::io::Result<()> {
        // Re-writing is enough on platforms with fine-grained mtimes; fall
        // back to an explicit utime bump is not needed for these tests.
        let contents = std::fs::read(path)?;
        std::fs::write(path, contents)
    }

    #[test]
    fn env_overlay_wins_over_file() {
        let (_dir, path) = write_config(minimal_json());
        std::env::set_var("SENTRY_MQTT_BROKER_ADDR", "10.0.0.9:1883");
        let cfg = RuntimeConfig::load(&path).expect("load config");
        std::env::remove_var("SENTRY_MQTT_BROKER_ADDR");
        assert_eq!(cfg.mqtt.broker_addr, "10.0.0.9:1883");
    }

    #[test]
    fn rejects_short_audit_signing_key() {
        let (_dir, path) = write_config(
            r#"{
                "phases": { "actions": false, "delivery": false },
                "audit_signing_key": "short"
            }"#,
        );
        assert!(RuntimeConfig::load(&path).is_err());
    }
}
