//! Scenario tests for the Frigate event -> decision -> alert path.
//!
//! These tests run the network-free core of the pipeline end to end:
//! 1. Frigate event JSON decodes into a detection
//! 2. The vision response (or its absence) yields a sanitized decision
//! 3. The scorer applies the deterministic context rules
//! 4. Confirmation, media, formatting, and the bus payload all agree

use std::time::Duration;

use frigate_sentry::alert::format_alert;
use frigate_sentry::confirm::merge_confirmation;
use frigate_sentry::deliver::should_deliver;
use frigate_sentry::intake::{decode_detection, CameraRegistry};
use frigate_sentry::media::MediaPlan;
use frigate_sentry::publish::AnalysisPayload;
use frigate_sentry::score::score_decision;
use frigate_sentry::vision;
use frigate_sentry::{
    AlertAction, Decision, DetectionEvent, EventContext, EventKind, HomeMode, RiskLevel,
    SubjectIdentity, TimeOfDay,
};

const FRIGATE_EVENT_NEW: &str = r#"{
    "before": null,
    "after": {
        "id": "1700000000.5-abc123",
        "camera": "front_door",
        "label": "person",
        "score": 0.75,
        "top_score": 0.92,
        "false_positive": false,
        "start_time": 1700000000.5
    },
    "type": "new"
}"#;

fn detection() -> DetectionEvent {
    decode_detection(FRIGATE_EVENT_NEW.as_bytes()).expect("decode detection")
}

fn context(
    time_of_day: TimeOfDay,
    home_mode: HomeMode,
    zone: &str,
    known_faces: bool,
) -> EventContext {
    EventContext {
        time_of_day,
        home_mode,
        known_faces_present: known_faces,
        camera_zone: zone.to_string(),
        camera_notes: String::new(),
        recent_events: 0,
    }
}

fn ai_decision(level: RiskLevel, event_type: EventKind, behavior: &str) -> Decision {
    Decision {
        risk_level: level,
        risk_score: level.baseline_score(),
        risk_confidence: 0.8,
        risk_reason: "model assessment".to_string(),
        event_type,
        action: AlertAction::for_band(level),
        subject_identity: SubjectIdentity::Unknown,
        subject_description: String::new(),
        behavior: behavior.to_string(),
    }
}

// A known delivery at midday, home, entry zone, model says low/delivery.
#[test]
fn daytime_delivery_stays_quiet() {
    let response = r#"MEDIA: ai-snapshots/e.jpg
A courier in a branded uniform is leaving a package at the door.
JSON: {"risk":"low","confidence":0.8,"reason":"routine delivery","event_type":"delivery","action":"notify_only","subject_identity":"unknown","subject_description":"courier with a box","behavior":"leaving a package"}"#;

    let ai = vision::decide(response);
    assert_eq!(ai.risk_level, RiskLevel::Low);
    assert_eq!(ai.event_type, EventKind::Delivery);

    let ctx = context(TimeOfDay::Day, HomeMode::Home, "entry", false);
    let scored = score_decision(&ai, &ctx);

    assert!(scored.risk_score <= 2);
    assert_eq!(scored.risk_level, RiskLevel::Low);
    assert_eq!(scored.action, AlertAction::NotifyOnly);
    assert!(!should_deliver(scored.risk_level));

    let media = MediaPlan::for_level(scored.risk_level);
    assert_eq!(media.clip_seconds, None);
}

// An unknown person in the small hours, away mode, terrace, model medium with
// suspicious behavior keywords.
#[test]
fn night_prowler_while_away_goes_critical() {
    let ai = ai_decision(
        RiskLevel::Medium,
        EventKind::UnknownPerson,
        "approaching door, hood up, looking around",
    );
    let ctx = context(TimeOfDay::Night, HomeMode::Away, "terrace", false);
    let scored = score_decision(&ai, &ctx);

    assert_eq!(scored.risk_score, 13);
    assert_eq!(scored.risk_level, RiskLevel::Critical);
    assert_eq!(scored.action, AlertAction::NotifyAndAlarm);
    assert!(should_deliver(scored.risk_level));

    let media = MediaPlan::for_level(scored.risk_level);
    assert_eq!(media.clip_seconds, Some(60));
    assert!(media.monitoring);
}

// Two detections a few seconds apart on the same camera, 30 s cooldown.
#[test]
fn cooldown_drops_the_second_detection() {
    let registry = CameraRegistry::new();
    let cooldown = Duration::from_secs(30);
    let event = detection();

    assert!(registry.try_accept(&event.camera, cooldown));
    assert!(!registry.try_accept(&event.camera, cooldown));
}

// The vision endpoint returns prose with no JSON at all.
#[test]
fn prose_only_response_completes_via_fallback() {
    let ai = vision::decide("A person stands near the gate. Nothing else is visible.");
    assert!(ai.risk_reason.contains("heuristic fallback"));

    let ctx = context(TimeOfDay::Day, HomeMode::Home, "yard", false);
    let scored = score_decision(&ai, &ctx);
    let media = MediaPlan::for_level(scored.risk_level);
    let event = detection();
    let alert = format_alert(&event, &scored, &ctx, &media, "ai-snapshots/e.jpg", None);
    let payload = AnalysisPayload::finalized(
        &event,
        &scored,
        &ctx,
        &media,
        alert.body.clone(),
        alert.speech.clone(),
        "ai-snapshots/e.jpg".to_string(),
        None,
    );
    assert!(payload.analysis.contains("RISK:"));
    assert!(payload.analysis.contains("heuristic fallback"));
}

// A high-risk event whose confirmation pass recognizes a known person.
#[test]
fn confirmation_known_person_downgrades_to_medium() {
    let original = {
        let ai = ai_decision(RiskLevel::High, EventKind::UnknownPerson, "at the door");
        let ctx = context(TimeOfDay::Evening, HomeMode::Home, "entry", false);
        score_decision(&ai, &ctx)
    };
    assert!(original.risk_level >= RiskLevel::High);

    let mut second = ai_decision(RiskLevel::Low, EventKind::KnownPerson, "waving at camera");
    second.risk_confidence = 0.9;

    let merged = merge_confirmation(&original, &second);
    assert_eq!(merged.risk_level, RiskLevel::Medium);
    assert!(merged.risk_reason.contains("confirmation downgrade"));
    assert_eq!(MediaPlan::for_level(merged.risk_level).clip_seconds, Some(15));
}

// Pending and final payloads share the event id so consumers can update in place.
#[test]
fn pending_and_final_payloads_share_event_id() {
    let event = detection();
    let pending = AnalysisPayload::pending(&event, "entry");
    assert_eq!(pending.risk, RiskLevel::Low);
    assert!(pending.analysis.contains("vision analysis pending"));

    let scored = {
        let ai = ai_decision(RiskLevel::Medium, EventKind::UnknownPerson, "standing");
        let ctx = context(TimeOfDay::Day, HomeMode::Home, "entry", false);
        score_decision(&ai, &ctx)
    };
    let ctx = context(TimeOfDay::Day, HomeMode::Home, "entry", false);
    let media = MediaPlan::for_level(scored.risk_level);
    let alert = format_alert(&event, &scored, &ctx, &media, "ai-snapshots/x.jpg", None);
    let final_payload = AnalysisPayload::finalized(
        &event,
        &scored,
        &ctx,
        &media,
        alert.body,
        alert.speech,
        "ai-snapshots/x.jpg".to_string(),
        None,
    );

    assert_eq!(pending.event_id, final_payload.event_id);
    assert_eq!(
        RiskLevel::band(final_payload.risk_score),
        final_payload.risk
    );
}

// Known-faces invariant: same event, flag flipped, exactly -4 on the score.
#[test]
fn known_faces_flag_shifts_the_score_by_four() {
    let ai = ai_decision(RiskLevel::High, EventKind::UnknownPerson, "near the garage");
    let without = score_decision(&ai, &context(TimeOfDay::Night, HomeMode::Sleep, "garage", false));
    let with = score_decision(&ai, &context(TimeOfDay::Night, HomeMode::Sleep, "garage", true));
    assert_eq!(without.risk_score - with.risk_score, 4);
}
