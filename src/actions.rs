//! Action executor: translates a decision into smart-home REST calls.
//!
//! The action enum is the allowlist; nothing outside it can be expressed,
//! and every call the executor issues comes from the fixed planning table
//! below. Hub and NVR failures are logged and never block messaging.

use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::time::Duration;

use crate::media::MediaPlan;
use crate::{AlertAction, RiskLevel, RuntimeConfig};

const HUB_CALL_TIMEOUT: Duration = Duration::from_secs(10);
const CLIP_FETCH_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_CLIP_BYTES: u64 = 512 * 1024 * 1024;

// -------------------- Call Planning --------------------

/// One REST call against the smart-home hub, planned from the allowlist
/// table before anything touches the network.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HubCall {
    LightOn { entities: Vec<String> },
    SpeakerAnnounce { entity: String, message: String },
    AlarmOn { entity: String },
}

/// The fixed action table. Quiet hours suppress the audible calls unless the
/// risk is critical.
pub fn plan_hub_calls(
    cfg: &RuntimeConfig,
    zone: &str,
    action: AlertAction,
    level: RiskLevel,
    quiet_now: bool,
    speech: &str,
) -> Vec<HubCall> {
    let audible_allowed = !quiet_now || level == RiskLevel::Critical;
    let mut calls = Vec::new();

    match action {
        AlertAction::NotifyOnly | AlertAction::NotifyAndSaveClip => {}
        AlertAction::NotifyAndLight => {
            if let Some(entities) = zone_lights(cfg, zone) {
                calls.push(HubCall::LightOn { entities });
            }
        }
        AlertAction::NotifyAndSpeaker => {
            if audible_allowed {
                calls.push(HubCall::SpeakerAnnounce {
                    entity: cfg.hub.speaker_entity.clone(),
                    message: speech.to_string(),
                });
            } else {
                log::info!("quiet hours: skipping speaker call");
            }
        }
        AlertAction::NotifyAndAlarm => {
            if audible_allowed {
                calls.push(HubCall::AlarmOn {
                    entity: cfg.hub.alarm_entity.clone(),
                });
                calls.push(HubCall::SpeakerAnnounce {
                    entity: cfg.hub.speaker_entity.clone(),
                    message: speech.to_string(),
                });
            } else {
                log::info!("quiet hours: skipping alarm and speaker calls");
            }
        }
    }

    calls
}

fn zone_lights(cfg: &RuntimeConfig, zone: &str) -> Option<Vec<String>> {
    let entities = cfg.hub.zone_lights.get(zone).cloned().unwrap_or_default();
    if entities.is_empty() {
        log::warn!("no light entities mapped for zone '{}'", zone);
        return None;
    }
    Some(entities)
}

// -------------------- Execution --------------------

/// What the executor produced for the rest of the pipeline.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ActionOutcome {
    /// NVR clip URL when a clip was requested, independent of whether the
    /// local fetch succeeded.
    pub clip_url: Option<String>,
}

pub struct ActionExecutor {
    agent: ureq::Agent,
}

impl Default for ActionExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionExecutor {
    pub fn new() -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(HUB_CALL_TIMEOUT).build(),
        }
    }

    /// Run the side effects for one event. Individual failures are logged
    /// and swallowed; the pipeline always continues to publication.
    pub fn execute(
        &self,
        cfg: &RuntimeConfig,
        event_id: &str,
        zone: &str,
        action: AlertAction,
        level: RiskLevel,
        media: &MediaPlan,
        quiet_now: bool,
        speech: &str,
    ) -> ActionOutcome {
        let mut outcome = ActionOutcome::default();

        let clip_requested =
            media.clip_seconds.is_some() || action >= AlertAction::NotifyAndSaveClip;
        if clip_requested {
            outcome.clip_url = Some(format!("{}/api/events/{}/clip.mp4", cfg.nvr.url, event_id));
            if let Err(e) = self.retain_clip(cfg, event_id) {
                log::warn!("clip retention for {} failed: {e:#}", event_id);
            } else if let Err(e) = self.fetch_clip(cfg, event_id) {
                log::warn!("clip fetch for {} failed: {e:#}", event_id);
            }
        }

        for call in plan_hub_calls(cfg, zone, action, level, quiet_now, speech) {
            if let Err(e) = self.issue_hub_call(cfg, &call) {
                log::warn!("hub call {:?} failed: {e:#}", call);
            }
        }

        outcome
    }

    fn retain_clip(&self, cfg: &RuntimeConfig, event_id: &str) -> Result<()> {
        let url = format!("{}/api/events/{}/retain", cfg.nvr.url, event_id);
        self.post_with_retry(&url, None, serde_json::json!({}))
    }

    fn fetch_clip(&self, cfg: &RuntimeConfig, event_id: &str) -> Result<()> {
        let url = format!("{}/api/events/{}/clip.mp4", cfg.nvr.url, event_id);
        let agent = ureq::AgentBuilder::new().timeout(CLIP_FETCH_TIMEOUT).build();
        let response = agent.get(&url).call().with_context(|| format!("GET {}", url))?;

        let clip_dir = cfg.storage.clip_dir();
        std::fs::create_dir_all(&clip_dir)
            .with_context(|| format!("create {}", clip_dir.display()))?;
        let path = clip_dir.join(format!("{}.mp4", event_id));
        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_CLIP_BYTES)
            .read_to_end(&mut bytes)
            .context("read clip body")?;
        std::fs::write(&path, &bytes).with_context(|| format!("write {}", path.display()))?;
        log::info!("stored clip for {} ({} bytes)", event_id, bytes.len());
        Ok(())
    }

    fn issue_hub_call(&self, cfg: &RuntimeConfig, call: &HubCall) -> Result<()> {
        let (domain, service, body) = match call {
            HubCall::LightOn { entities } => (
                "light",
                "turn_on",
                serde_json::json!({ "entity_id": entities }),
            ),
            HubCall::SpeakerAnnounce { entity, message } => (
                "media_player",
                "play_media",
                serde_json::json!({
                    "entity_id": entity,
                    "media_content_type": "tts",
                    "media_content_id": message,
                }),
            ),
            HubCall::AlarmOn { entity } => (
                "switch",
                "turn_on",
                serde_json::json!({ "entity_id": entity }),
            ),
        };

        let url = format!("{}/api/services/{}/{}", cfg.hub.url, domain, service);
        self.post_with_retry(&url, Some(&cfg.hub.token), body)
    }

    /// POST with one retry on transient failure (transport error or 5xx).
    fn post_with_retry(
        &self,
        url: &str,
        bearer: Option<&str>,
        body: serde_json::Value,
    ) -> Result<()> {
        match self.post_once(url, bearer, &body) {
            Ok(()) => Ok(()),
            Err(e) if e.transient => {
                log::debug!("retrying transient failure on {}: {:#}", url, e.error);
                self.post_once(url, bearer, &body).map_err(|e| e.error)
            }
            Err(e) => Err(e.error),
        }
    }

    fn post_once(
        &self,
        url: &str,
        bearer: Option<&str>,
        body: &serde_json::Value,
    ) -> std::result::Result<(), TransientError> {
        let mut request = self.agent.post(url);
        if let Some(token) = bearer {
            request = request.set("Authorization", &format!("Bearer {}", token));
        }
        match request.send_json(body.clone()) {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(code, _)) => Err(TransientError {
                transient: code >= 500,
                error: anyhow!("POST {} returned status {}", url, code),
            }),
            Err(e) => Err(TransientError {
                transient: true,
                error: anyhow!("POST {}: {}", url, e),
            }),
        }
    }
}

struct TransientError {
    transient: bool,
    error: anyhow::Error,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn test_config() -> RuntimeConfig {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("sentry.json");
        std::fs::write(
            &path,
            r#"{
                "phases": { "actions": false, "delivery": false },
                "hub": {
                    "zone_lights": {
                        "entry": ["light.porch", "light.hallway"],
                        "driveway": []
                    }
                }
            }"#,
        )
        .expect("write config");
        let cfg = RuntimeConfig::load(Path::new(&path)).expect("load config");
        cfg
    }

    #[test]
    fn notify_only_plans_no_calls() {
        let cfg = test_config();
        assert!(plan_hub_calls(&cfg, "entry", AlertAction::NotifyOnly, RiskLevel::Low, false, "").is_empty());
        assert!(plan_hub_calls(
            &cfg,
            "entry",
            AlertAction::NotifyAndSaveClip,
            RiskLevel::Medium,
            false,
            ""
        )
        .is_empty());
    }

    #[test]
    fn light_action_uses_zone_entities() {
        let cfg = test_config();
        let calls = plan_hub_calls(&cfg, "entry", AlertAction::NotifyAndLight, RiskLevel::High, false, "");
        assert_eq!(
            calls,
            vec![HubCall::LightOn {
                entities: vec!["light.porch".to_string(), "light.hallway".to_string()]
            }]
        );
    }

    #[test]
    fn unmapped_zone_plans_no_light_call() {
        let cfg = test_config();
        assert!(plan_hub_calls(&cfg, "driveway", AlertAction::NotifyAndLight, RiskLevel::High, false, "").is_empty());
        assert!(plan_hub_calls(&cfg, "attic", AlertAction::NotifyAndLight, RiskLevel::High, false, "").is_empty());
    }

    #[test]
    fn quiet_hours_suppress_audible_calls_below_critical() {
        let cfg = test_config();
        for action in [AlertAction::NotifyAndSpeaker, AlertAction::NotifyAndAlarm] {
            let calls = plan_hub_calls(&cfg, "entry", action, RiskLevel::High, true, "speech");
            assert!(calls.is_empty(), "expected no calls for {:?}", action);
        }
    }

    #[test]
    fn critical_overrides_quiet_hours() {
        let cfg = test_config();
        let calls = plan_hub_calls(
            &cfg,
            "entry",
            AlertAction::NotifyAndAlarm,
            RiskLevel::Critical,
            true,
            "intruder detected",
        );
        assert_eq!(calls.len(), 2);
        assert!(matches!(calls[0], HubCall::AlarmOn { .. }));
        assert!(matches!(calls[1], HubCall::SpeakerAnnounce { .. }));
    }

    #[test]
    fn alarm_outside_quiet_hours_also_announces() {
        let cfg = test_config();
        let calls = plan_hub_calls(
            &cfg,
            "entry",
            AlertAction::NotifyAndAlarm,
            RiskLevel::High,
            false,
            "alert",
        );
        assert_eq!(calls.len(), 2);
    }
}
