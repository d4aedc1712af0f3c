//! Delivery client: ships the formatted alert to the agent gateway.
//!
//! Chat delivery only happens for medium risk and above; low-risk events
//! still get their bus publication and any policy-required actions.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::time::Duration;

use crate::alert::AlertMessage;
use crate::{DetectionEvent, RiskLevel, RuntimeConfig};

const DELIVERY_MODE_PREFIX: &str =
    "DELIVERY MODE: forward the following alert to the recipient verbatim.";

/// Chat delivery filter: low-risk events skip the agent entirely.
pub fn should_deliver(level: RiskLevel) -> bool {
    level >= RiskLevel::Medium
}

pub fn session_key(event: &DetectionEvent) -> String {
    format!("frigate:{}:{}", event.camera, event.event_id)
}

#[derive(Debug, Serialize)]
struct AgentEnvelope<'a> {
    message: &'a str,
    deliver: bool,
    channel: &'a str,
    to: &'a str,
    name: &'a str,
    #[serde(rename = "sessionKey")]
    session_key: &'a str,
    #[serde(rename = "timeoutSeconds")]
    timeout_seconds: u64,
}

/// The message the agent forwards: instruction prefix, alert body, media
/// references by relative staging path.
pub fn delivery_message(alert: &AlertMessage) -> String {
    let mut message = format!("{}\n\n{}", DELIVERY_MODE_PREFIX, alert.body);
    message.push_str(&format!("\nMEDIA_SNAPSHOT: {}", alert.snapshot_path));
    if let Some(clip) = &alert.clip_path {
        message.push_str(&format!("\nMEDIA_CLIP: {}", clip));
    }
    message
}

pub struct DeliveryClient {
    agent: ureq::Agent,
}

impl Default for DeliveryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl DeliveryClient {
    pub fn new() -> Self {
        Self {
            agent: ureq::AgentBuilder::new()
                .timeout(Duration::from_secs(45))
                .build(),
        }
    }

    /// POST the alert to every configured recipient. Per-recipient failures
    /// are logged; the call fails only when nobody could be reached.
    pub fn deliver(
        &self,
        cfg: &RuntimeConfig,
        event: &DetectionEvent,
        alert: &AlertMessage,
    ) -> Result<usize> {
        let url = format!("{}/hooks/agent", cfg.agent.gateway_url.trim_end_matches('/'));
        let message = delivery_message(alert);
        let key = session_key(event);

        let mut delivered = 0;
        for recipient in &cfg.agent.recipients {
            let envelope = AgentEnvelope {
                message: &message,
                deliver: true,
                channel: &cfg.agent.channel,
                to: recipient,
                name: &cfg.agent.name,
                session_key: &key,
                timeout_seconds: cfg.agent.timeout_seconds,
            };
            match self.post_envelope(&url, &cfg.agent.token, &envelope) {
                Ok(()) => {
                    delivered += 1;
                    log::info!("alert delivered to {} for {}", recipient, event.event_id);
                }
                Err(e) => log::warn!("alert delivery to {} failed: {e:#}", recipient),
            }
        }

        if delivered == 0 {
            return Err(anyhow!(
                "alert delivery failed for all {} recipient(s)",
                cfg.agent.recipients.len()
            ));
        }
        Ok(delivered)
    }

    fn post_envelope(&self, url: &str, token: &str, envelope: &AgentEnvelope<'_>) -> Result<()> {
        let response = self
            .agent
            .post(url)
            .set("Authorization", &format!("Bearer {}", token))
            .send_json(serde_json::to_value(envelope)?);
        match response {
            Ok(response) if matches!(response.status(), 200 | 201 | 202) => Ok(()),
            Ok(response) => Err(anyhow!("gateway returned status {}", response.status())),
            Err(ureq::Error::Status(code, _)) => Err(anyhow!("gateway returned status {}", code)),
            Err(e) => Err(anyhow!("POST {}: {}", url, e)),
        }
    }
}
