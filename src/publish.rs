//! Bus publication: the shared MQTT client handle and the two-phase
//! pending/final analysis payloads.
//!
//! Both payloads for an event carry the same `event_id` and are published
//! QoS 1 with the retained flag, so a late-joining consumer always sees the
//! most recent state per event and can update pending rows in place.

use anyhow::{anyhow, Result};
use chrono::Utc;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::Client;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;

use crate::media::MediaPlan;
use crate::policy::EventContext;
use crate::{AlertAction, Decision, DetectionEvent, EventKind, RiskLevel, SubjectIdentity};

// -------------------- Bus Handle --------------------

/// Thread-shared handle over the current MQTT client. The intake thread owns
/// the connection and swaps the client on reconnect; workers publish through
/// whatever client is installed. Publishing while disconnected is an error
/// the pipeline logs and survives.
#[derive(Default)]
pub struct BusHandle {
    client: RwLock<Option<Client>>,
}

impl BusHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_client(&self, client: Client) {
        let mut guard = match self.client.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(client);
    }

    pub fn clear_client(&self) {
        let mut guard = match self.client.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = None;
    }

    pub fn publish_raw(&self, topic: &str, payload: &[u8], retain: bool) -> Result<()> {
        let guard = match self.client.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let client = guard
            .as_ref()
            .ok_or_else(|| anyhow!("bus not connected"))?;
        client
            .publish(topic, QoS::AtLeastOnce, retain, payload.to_vec())
            .map_err(|e| anyhow!("bus publish to {} failed: {}", topic, e))?;
        Ok(())
    }

    pub fn publish_json<T: Serialize>(&self, topic: &str, value: &T, retain: bool) -> Result<()> {
        let payload = serde_json::to_vec(value)?;
        self.publish_raw(topic, &payload, retain)
    }

    /// Best-effort shutdown: retained offline marker, then a clean MQTT
    /// disconnect so the broker does not fire the Last Will.
    pub fn shutdown(&self, availability_topic: &str, offline_payload: &str) {
        if let Err(e) = self.publish_raw(availability_topic, offline_payload.as_bytes(), true) {
            log::debug!("offline publish skipped: {e:#}");
        }
        let guard = match self.client.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(client) = guard.as_ref() {
            if let Err(e) = client.disconnect() {
                log::debug!("bus disconnect failed: {e}");
            }
        }
    }
}

// -------------------- Analysis Payloads --------------------

/// The structured status payload consumed downstream. Emitted twice per
/// accepted event: once pending (before vision) and once final.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AnalysisPayload {
    pub camera: String,
    pub label: String,
    pub risk: RiskLevel,
    pub risk_score: u32,
    pub risk_confidence: f64,
    pub event_type: EventKind,
    pub action: AlertAction,
    pub analysis: String,
    pub tts: String,
    pub behavior: String,
    pub subject_identity: SubjectIdentity,
    pub subject_description: String,
    pub camera_zone: String,
    pub home_mode: String,
    pub time_of_day: String,
    pub media_snapshot: bool,
    pub media_clip: bool,
    pub clip_url: Option<String>,
    pub snapshot_path: String,
    pub timestamp: String,
    pub event_id: String,
}

impl AnalysisPayload {
    /// The preliminary payload, emitted right after intake accepts the event.
    pub fn pending(event: &DetectionEvent, camera_zone: &str) -> Self {
        Self {
            camera: event.camera.clone(),
            label: event.label.clone(),
            risk: RiskLevel::Low,
            risk_score: 0,
            risk_confidence: 0.0,
            event_type: EventKind::Other,
            action: AlertAction::NotifyOnly,
            analysis: format!(
                "Person detected on {} \u{2014} vision analysis pending.",
                event.camera
            ),
            tts: String::new(),
            behavior: String::new(),
            subject_identity: SubjectIdentity::Unknown,
            subject_description: String::new(),
            camera_zone: camera_zone.to_string(),
            home_mode: String::new(),
            time_of_day: String::new(),
            media_snapshot: false,
            media_clip: false,
            clip_url: None,
            snapshot_path: String::new(),
            timestamp: Utc::now().to_rfc3339(),
            event_id: event.event_id.clone(),
        }
    }

    /// The complete payload, emitted after scoring and confirmation.
    #[allow(clippy::too_many_arguments)]
    pub fn finalized(
        event: &DetectionEvent,
        decision: &Decision,
        context: &EventContext,
        media: &MediaPlan,
        analysis: String,
        tts: String,
        snapshot_path: String,
        clip_url: Option<String>,
    ) -> Self {
        Self {
            camera: event.camera.clone(),
            label: event.label.clone(),
            risk: decision.risk_level,
            risk_score: decision.risk_score,
            risk_confidence: decision.risk_confidence,
            event_type: decision.event_type,
            action: decision.action,
            analysis,
            tts,
            behavior: decision.behavior.clone(),
            subject_identity: decision.subject_identity,
            subject_description: decision.subject_description.clone(),
            camera_zone: context.camera_zone.clone(),
            home_mode: context.home_mode.as_str().to_string(),
            time_of_day: context.time_of_day.as_str().to_string(),
            media_snapshot: media.snapshot,
            media_clip: media.clip_seconds.is_some(),
            clip_url,
            snapshot_path,
            timestamp: Utc::now().to_rfc3339(),
            event_id: event.event_id.clone(),
        }
    }
}

/// QoS-1 retained publish of one payload on the analysis topic.
pub fn publish_analysis(bus: &BusHandle, topic: &str, payload: &AnalysisPayload) -> Result<()> {
    bus.publish_json(topic, payload, true)
}
