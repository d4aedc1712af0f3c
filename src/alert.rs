//! Alert formatter: the structured chat body and the short speech string.
//!
//! The eight sections are fixed and always present so downstream parsers and
//! humans always find the same shape; empty fields render a placeholder.

use crate::media::MediaPlan;
use crate::policy::EventContext;
use crate::{Decision, DetectionEvent, RiskLevel};

const PLACEHOLDER: &str = "n/a";

/// A fully formatted alert ready for delivery.
#[derive(Clone, Debug, PartialEq)]
pub struct AlertMessage {
    pub title: String,
    pub body: String,
    pub speech: String,
    pub snapshot_path: String,
    pub clip_path: Option<String>,
}

pub fn format_alert(
    event: &DetectionEvent,
    decision: &Decision,
    context: &EventContext,
    media: &MediaPlan,
    snapshot_path: &str,
    clip_url: Option<&str>,
) -> AlertMessage {
    let title = format!(
        "{} SECURITY ALERT [{}] {}",
        decision.risk_level.glyph(),
        decision.risk_level.as_str().to_uppercase(),
        event.camera
    );

    let media_line = match (media.clip_seconds, media.monitoring) {
        (Some(seconds), true) => format!("snapshot, {seconds}s clip, monitoring active"),
        (Some(seconds), false) => format!("snapshot, {seconds}s clip"),
        (None, _) => "snapshot only".to_string(),
    };

    let body = format!(
        "{title}\n\
         EVENT: person detected on {camera} (zone: {zone}) at {local_time}\n\
         SUBJECT: {identity} person; {description}\n\
         BEHAVIOR: {behavior}\n\
         RISK: {level} (score {score}, confidence {confidence:.2}); {reason}\n\
         CONTEXT: home mode {home_mode}; known faces {faces}; {recent} recent event(s) on this camera\n\
         ACTION: {action}\n\
         MEDIA: {media_line}\n\
         ESCALATION: {escalation}\n",
        title = title,
        camera = event.camera,
        zone = placeholder(&context.camera_zone),
        local_time = context.local_time_label(),
        identity = decision.subject_identity.as_str(),
        description = placeholder(&decision.subject_description),
        behavior = placeholder(&decision.behavior),
        level = decision.risk_level,
        score = decision.risk_score,
        confidence = decision.risk_confidence,
        reason = placeholder(&decision.risk_reason),
        home_mode = context.home_mode.as_str(),
        faces = if context.known_faces_present {
            "present"
        } else {
            "absent"
        },
        recent = context.recent_events,
        action = decision.action,
        media_line = media_line,
        escalation = escalation_line(decision.risk_level),
    );

    AlertMessage {
        title,
        speech: speech_line(event, decision),
        body,
        snapshot_path: snapshot_path.to_string(),
        clip_path: clip_url.map(str::to_string),
    }
}

fn escalation_line(level: RiskLevel) -> &'static str {
    match level {
        RiskLevel::Low => "upgrades to MEDIUM if the subject approaches the house",
        RiskLevel::Medium => "upgrades to HIGH if the subject remains >60s",
        RiskLevel::High => "upgrades to CRITICAL if entry is attempted",
        RiskLevel::Critical => "maximum severity; camera monitoring active",
    }
}

/// At most two sentences: severity + camera, then subject, behavior, reason.
fn speech_line(event: &DetectionEvent, decision: &Decision) -> String {
    let subject = if decision.subject_description.is_empty() {
        format!("{} person", decision.subject_identity.as_str())
    } else {
        decision.subject_description.clone()
    };

    let mut details = subject;
    if !decision.behavior.is_empty() {
        details.push_str(&format!(", {}", decision.behavior));
    }
    if !decision.risk_reason.is_empty() {
        details.push_str(&format!("; {}", decision.risk_reason));
    }

    format!(
        "{} risk alert on {}. {}.",
        capitalize(decision.risk_level.as_str()),
        event.camera,
        details.trim_end_matches('.')
    )
}

fn placeholder(value: &str) -> &str {
    if value.trim().is_empty() {
        PLACEHOLDER
    } else {
        value
    }
}

fn capitalize(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}
