//! Severity scorer: deterministic re-score of the model's risk judgment
//! against local context.
//!
//! The model's level sets the baseline (low=1, medium=3, high=5, critical=7)
//! so its judgment is preserved; the weighted rules below move the score up
//! or down from there. Scoring is pure: the same decision and context always
//! produce the same result.

use crate::policy::EventContext;
use crate::{AlertAction, Decision, EventKind, HomeMode, RiskLevel, TimeOfDay};

/// Zone tags that put a camera on the approach to the house.
const SENSITIVE_ZONE_TOKENS: &[&str] = &["entry", "garage", "terrace", "door"];

/// Suspicious behavior keyword groups with their weights. The whole bucket
/// is capped at +3 regardless of how many groups match.
const SUSPICIOUS_BEHAVIOR: &[(&[&str], i32)] = &[
    (&["loiter", "linger"], 2),
    (&["conceal", "mask", "hood", "covered face"], 2),
    (&["tool", "crowbar", "pry", "screwdriver"], 3),
    (&["forc", "break in", "smash", "kick"], 3),
    (&["climb", "scal", "vault", "over the fence"], 3),
];
const SUSPICIOUS_BUCKET_CAP: i32 = 3;

/// Behaviors that on their own argue the scene is routine.
const CALM_BEHAVIOR: &[&str] = &["walking", "standing", "passing"];

/// Re-score the model's decision against context. Returns a new decision
/// with the final score, band, and action.
pub fn score_decision(ai: &Decision, context: &EventContext) -> Decision {
    let baseline = ai.risk_level.baseline_score() as i32;
    let mut adjustments: Vec<(&'static str, i32)> = Vec::new();

    if ai.event_type == EventKind::UnknownPerson {
        adjustments.push(("unknown_person", 2));
    }
    match context.time_of_day {
        TimeOfDay::Day => {}
        TimeOfDay::Evening => adjustments.push(("evening", 1)),
        TimeOfDay::Night => adjustments.push(("night", 2)),
    }
    if is_sensitive_zone(&context.camera_zone) {
        adjustments.push(("sensitive_zone", 1));
    }
    match context.home_mode {
        HomeMode::Away => adjustments.push(("away", 3)),
        HomeMode::Sleep => adjustments.push(("sleep", 2)),
        HomeMode::Home | HomeMode::Guest => {}
    }

    let behavior = ai.behavior.to_lowercase();
    let suspicious = suspicious_behavior_bonus(&behavior);
    if suspicious > 0 {
        adjustments.push(("suspicious_behavior", suspicious));
    }
    if context.known_faces_present {
        adjustments.push(("known_faces", -4));
    }
    if ai.event_type == EventKind::Delivery {
        adjustments.push(("delivery", -2));
    }
    if suspicious == 0 && CALM_BEHAVIOR.iter().any(|kw| behavior.contains(kw)) {
        adjustments.push(("calm_behavior", -1));
    }

    let total: i32 = adjustments.iter().map(|(_, delta)| delta).sum();
    let score = (baseline + total).max(0) as u32;
    let level = RiskLevel::band(score);

    log::debug!(
        "scored baseline={} adjustments={:?} final={} band={}",
        baseline,
        adjustments,
        score,
        level
    );

    let mut action = AlertAction::for_band(level);
    if level >= RiskLevel::Medium && ai.action > action {
        action = ai.action;
    }

    let mut scored = ai.clone();
    scored.risk_score = score;
    scored.risk_level = level;
    scored.action = action;
    if scored.enforce_band() {
        log::warn!("risk band coerced to match score {}", scored.risk_score);
    }
    scored
}

fn is_sensitive_zone(zone: &str) -> bool {
    let zone = zone.to_lowercase();
    SENSITIVE_ZONE_TOKENS.iter().any(|token| zone.contains(token))
}

fn suspicious_behavior_bonus(behavior: &str) -> i32 {
    let mut bonus = 0;
    for (keywords, weight) in SUSPICIOUS_BEHAVIOR {
        if keywords.iter().any(|kw| behavior.contains(kw)) {
            bonus += weight;
        }
    }
    bonus.min(SUSPICIOUS_BUCKET_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SubjectIdentity;

    fn ai_decision(level: RiskLevel, event_type: EventKind, behavior: &str) -> Decision {
        Decision {
            risk_level: level,
            risk_score: level.baseline_score(),
            risk_confidence: 0.8,
            risk_reason: "model call".to_string(),
            event_type,
            action: AlertAction::for_band(level),
            subject_identity: SubjectIdentity::Unknown,
            subject_description: String::new(),
            behavior: behavior.to_string(),
        }
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

    #[test]
    fn known_delivery_at_midday_stays_low() {
        // baseline 1 + zone 1 - delivery 2 = 0
        let ai = ai_decision(RiskLevel::Low, EventKind::Delivery, "leaving a package");
        let ctx = context(TimeOfDay::Day, HomeMode::Home, "entry", false);
        let scored = score_decision(&ai, &ctx);
        assert_eq!(scored.risk_score, 0);
        assert_eq!(scored.risk_level, RiskLevel::Low);
        assert_eq!(scored.action, AlertAction::NotifyOnly);
    }

    #[test]
    fn night_prowler_while_away_escalates_to_critical() {
        // baseline 3 + unknown 2 + night 2 + zone 1 + away 3 + concealment 2 = 13
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
    }

    #[test]
    fn known_faces_reduce_score_by_four() {
        let ai = ai_decision(RiskLevel::High, EventKind::UnknownPerson, "at the door");
        let without = score_decision(&ai, &context(TimeOfDay::Day, HomeMode::Home, "yard", false));
        let with = score_decision(&ai, &context(TimeOfDay::Day, HomeMode::Home, "yard", true));
        assert_eq!(without.risk_score - with.risk_score, 4);
    }

    #[test]
    fn suspicious_bucket_is_capped() {
        // loiter(2) + hood(2) + crowbar(3) would be 7 uncapped
        let ai = ai_decision(
            RiskLevel::Low,
            EventKind::Other,
            "loitering with hood up holding a crowbar",
        );
        let ctx = context(TimeOfDay::Day, HomeMode::Home, "yard", false);
        let scored = score_decision(&ai, &ctx);
        // baseline 1 + capped bucket 3 = 4
        assert_eq!(scored.risk_score, 4);
    }

    #[test]
    fn calm_behavior_alone_subtracts_one() {
        let ai = ai_decision(RiskLevel::Low, EventKind::Other, "walking along the sidewalk");
        let ctx = context(TimeOfDay::Day, HomeMode::Home, "street", false);
        assert_eq!(score_decision(&ai, &ctx).risk_score, 0);

        // The discount does not apply next to a suspicious keyword.
        let ai = ai_decision(RiskLevel::Low, EventKind::Other, "walking then loitering");
        assert_eq!(score_decision(&ai, &ctx).risk_score, 3);
    }

    #[test]
    fn score_never_goes_negative() {
        let ai = ai_decision(RiskLevel::Low, EventKind::Delivery, "walking up");
        let ctx = context(TimeOfDay::Day, HomeMode::Home, "street", true);
        let scored = score_decision(&ai, &ctx);
        assert_eq!(scored.risk_score, 0);
        assert_eq!(scored.risk_level, RiskLevel::Low);
    }

    #[test]
    fn scoring_is_deterministic() {
        let ai = ai_decision(RiskLevel::Medium, EventKind::UnknownPerson, "lingering");
        let ctx = context(TimeOfDay::Evening, HomeMode::Sleep, "garage", false);
        assert_eq!(score_decision(&ai, &ctx), score_decision(&ai, &ctx));
    }

    #[test]
    fn stronger_model_action_is_kept_above_low() {
        let mut ai = ai_decision(RiskLevel::Medium, EventKind::UnknownPerson, "at the gate");
        ai.action = AlertAction::NotifyAndSpeaker;
        let ctx = context(TimeOfDay::Day, HomeMode::Home, "street", false);
        let scored = score_decision(&ai, &ctx);
        // baseline 3 + unknown 2 = 5 -> high; band default would be light
        assert_eq!(scored.risk_level, RiskLevel::High);
        assert_eq!(scored.action, AlertAction::NotifyAndSpeaker);
    }

    #[test]
    fn low_band_always_notifies_only() {
        let mut ai = ai_decision(RiskLevel::Low, EventKind::KnownPerson, "waving");
        ai.action = AlertAction::NotifyAndAlarm;
        let ctx = context(TimeOfDay::Day, HomeMode::Home, "street", true);
        let scored = score_decision(&ai, &ctx);
        assert_eq!(scored.risk_level, RiskLevel::Low);
        assert_eq!(scored.action, AlertAction::NotifyOnly);
    }
}
