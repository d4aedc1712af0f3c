//! Confirmation controller: second-look analysis for high and critical
//! risks.
//!
//! The re-pass runs on a helper thread so the whole thing can be bounded by
//! `confirm_timeout`; on timeout or any re-pass failure the original
//! decision stands.

use anyhow::{Context, Result};
use std::sync::mpsc;
use std::sync::Arc;

use crate::policy::EventContext;
use crate::score::score_decision;
use crate::snapshot::SnapshotFetcher;
use crate::vision::{self, VisionClient};
use crate::{AlertAction, Decision, DetectionEvent, EventKind, RiskLevel, RuntimeConfig};

const CONFIRMATION_DOWNGRADE_REASON: &str = "confirmation downgrade";

/// Merge the original decision with the second pass:
///
/// - second risk >= original: keep the original
/// - one band lower: downgrade to the second band
/// - two or more bands lower, or the second pass says known_person:
///   downgrade to medium and mark the reason
pub fn merge_confirmation(original: &Decision, second: &Decision) -> Decision {
    if second.event_type == EventKind::KnownPerson {
        return downgraded_to(original, RiskLevel::Medium, true);
    }

    let drop = (original.risk_level as i32) - (second.risk_level as i32);
    if drop <= 0 {
        return original.clone();
    }
    if drop == 1 {
        return downgraded_to(original, second.risk_level, false);
    }
    downgraded_to(original, RiskLevel::Medium, true)
}

fn downgraded_to(original: &Decision, level: RiskLevel, mark_reason: bool) -> Decision {
    let mut decision = original.clone();
    decision.risk_level = level;
    decision.risk_score = level.baseline_score();
    decision.action = AlertAction::for_band(level);
    if mark_reason {
        decision.risk_reason = CONFIRMATION_DOWNGRADE_REASON.to_string();
    }
    decision.enforce_band();
    decision
}

/// Run the full second pass: delay, fresh snapshot, vision, re-score. The
/// result feeds [`merge_confirmation`]; any failure or timeout keeps the
/// original.
pub fn run_confirmation(
    cfg: Arc<RuntimeConfig>,
    event: &DetectionEvent,
    context: &EventContext,
    original: &Decision,
) -> Decision {
    let (sender, receiver) = mpsc::channel::<Result<Decision>>();
    let timeout = cfg.pipeline.confirm_timeout;

    {
        let cfg = Arc::clone(&cfg);
        let event = event.clone();
        let context = context.clone();
        std::thread::spawn(move || {
            let result = second_pass(&cfg, &event, &context);
            let _ = sender.send(result);
        });
    }

    match receiver.recv_timeout(timeout) {
        Ok(Ok(second)) => {
            let merged = merge_confirmation(original, &second);
            if merged.risk_level < original.risk_level {
                log::info!(
                    "confirmation downgraded event_id={} {} -> {}",
                    event.event_id,
                    original.risk_level,
                    merged.risk_level
                );
            }
            merged
        }
        Ok(Err(e)) => {
            log::warn!(
                "confirmation pass failed for event_id={}: {e:#}; keeping original",
                event.event_id
            );
            original.clone()
        }
        Err(_) => {
            log::warn!(
                "confirmation timed out after {:?} for event_id={}; keeping original",
                timeout,
                event.event_id
            );
            original.clone()
        }
    }
}

fn second_pass(
    cfg: &RuntimeConfig,
    event: &DetectionEvent,
    context: &EventContext,
) -> Result<Decision> {
    std::thread::sleep(cfg.pipeline.confirm_delay);

    let fetcher = SnapshotFetcher::new();
    let staged = fetcher
        .fetch_fresh(cfg, &event.event_id)
        .context("confirmation snapshot fetch")?;
    let image = std::fs::read(&staged.detection_path)
        .with_context(|| format!("read {}", staged.detection_path.display()))?;

    let prompt = vision::build_prompt(event, context, &staged.relative_path);
    let client = VisionClient::new();
    let response = client
        .analyze(&cfg.vision, &prompt, &image)
        .context("confirmation vision call")?;
    Ok(score_decision(&vision::decide(&response), context))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SubjectIdentity;

    fn decision(level: RiskLevel, event_type: EventKind) -> Decision {
        Decision {
            risk_level: level,
            risk_score: level.baseline_score(),
            risk_confidence: 0.8,
            risk_reason: "original reason".to_string(),
            event_type,
            action: AlertAction::for_band(level),
            subject_identity: SubjectIdentity::Unknown,
            subject_description: String::new(),
            behavior: String::new(),
        }
    }

    #[test]
    fn equal_or_higher_second_risk_keeps_original() {
        let original = decision(RiskLevel::High, EventKind::UnknownPerson);
        let same = decision(RiskLevel::High, EventKind::UnknownPerson);
        assert_eq!(merge_confirmation(&original, &same), original);
        let higher = decision(RiskLevel::Critical, EventKind::UnknownPerson);
        assert_eq!(merge_confirmation(&original, &higher), original);
    }

    #[test]
    fn one_band_drop_downgrades_one_band() {
        let original = decision(RiskLevel::Critical, EventKind::UnknownPerson);
        let second = decision(RiskLevel::High, EventKind::UnknownPerson);
        let merged = merge_confirmation(&original, &second);
        assert_eq!(merged.risk_level, RiskLevel::High);
        assert_eq!(merged.action, AlertAction::NotifyAndLight);
        assert_eq!(merged.risk_reason, "original reason");
    }

    #[test]
    fn two_band_drop_downgrades_to_medium_with_marker() {
        let original = decision(RiskLevel::Critical, EventKind::UnknownPerson);
        let second = decision(RiskLevel::Low, EventKind::UnknownPerson);
        let merged = merge_confirmation(&original, &second);
        assert_eq!(merged.risk_level, RiskLevel::Medium);
        assert_eq!(merged.risk_reason, "confirmation downgrade");
    }

    #[test]
    fn known_person_downgrades_high_to_medium_not_low() {
        let original = decision(RiskLevel::High, EventKind::UnknownPerson);
        let second = decision(RiskLevel::Low, EventKind::KnownPerson);
        let merged = merge_confirmation(&original, &second);
        assert_eq!(merged.risk_level, RiskLevel::Medium);
        assert_eq!(merged.risk_reason, "confirmation downgrade");
        assert_eq!(merged.action, AlertAction::NotifyAndSaveClip);
        // band invariant holds after the downgrade
        assert_eq!(RiskLevel::band(merged.risk_score), merged.risk_level);
    }

    #[test]
    fn known_person_even_at_equal_risk_downgrades() {
        let original = decision(RiskLevel::High, EventKind::UnknownPerson);
        let second = decision(RiskLevel::High, EventKind::KnownPerson);
        let merged = merge_confirmation(&original, &second);
        assert_eq!(merged.risk_level, RiskLevel::Medium);
    }
}
