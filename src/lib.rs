//! Frigate Sentry
//!
//! This crate implements the alert bridge between a Frigate NVR, a local
//! vision model, a smart-home hub, and a chat-agent gateway.
//!
//! # Pipeline
//!
//! For every accepted person detection the bridge:
//!
//! 1. Publishes a pending status payload on the bus
//! 2. Fetches a still image from the NVR (thumbnail fallback)
//! 3. Asks the vision model for a structured risk analysis
//! 4. Re-scores the risk deterministically against local context
//! 5. Optionally re-confirms high/critical risks with a second pass
//! 6. Executes allowlisted smart-home side effects
//! 7. Publishes the final status payload and dispatches a chat alert
//! 8. Appends the outcome to the event history
//!
//! # Module Structure
//!
//! - `intake`: bus subscription, per-camera cooldown, bounded event queue
//! - `snapshot` / `vision` / `policy` / `score` / `confirm`: the decision engine
//! - `media` / `actions` / `alert` / `deliver` / `publish`: the output side
//! - `history` / `config`: event memory and the reloadable runtime config

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

pub mod actions;
pub mod alert;
pub mod config;
pub mod confirm;
pub mod deliver;
pub mod history;
pub mod intake;
pub mod media;
pub mod pipeline;
pub mod policy;
pub mod publish;
pub mod score;
pub mod snapshot;
pub mod vision;

pub use config::{ConfigStore, RuntimeConfig};
pub use history::EventMemory;
pub use intake::{CameraRegistry, DetectionEvent, EventQueue};
pub use policy::EventContext;

// -------------------- Risk Levels --------------------

/// Low/medium/high/critical risk bands. The band is always derivable from the
/// numeric score; `band()` is the single source of truth for the thresholds.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Map a numeric score onto its band: 0-2 low, 3-4 medium, 5-6 high, 7+ critical.
    pub fn band(score: u32) -> Self {
        match score {
            0..=2 => RiskLevel::Low,
            3..=4 => RiskLevel::Medium,
            5..=6 => RiskLevel::High,
            _ => RiskLevel::Critical,
        }
    }

    /// Baseline score used when re-scoring starts from the model's judgment.
    pub fn baseline_score(self) -> u32 {
        match self {
            RiskLevel::Low => 1,
            RiskLevel::Medium => 3,
            RiskLevel::High => 5,
            RiskLevel::Critical => 7,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }

    /// Severity glyph used as the alert title prefix.
    pub fn glyph(self) -> &'static str {
        match self {
            RiskLevel::Low => "\u{1F7E2}",      // green circle
            RiskLevel::Medium => "\u{1F7E1}",   // yellow circle
            RiskLevel::High => "\u{1F7E0}",     // orange circle
            RiskLevel::Critical => "\u{1F534}", // red circle
        }
    }

    /// Lenient parse for model output; unknown values fall back to `None`.
    pub fn parse_lenient(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "low" => Some(RiskLevel::Low),
            "medium" | "moderate" => Some(RiskLevel::Medium),
            "high" => Some(RiskLevel::High),
            "critical" => Some(RiskLevel::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// -------------------- Event Kinds --------------------

/// Classification of what the camera saw.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    UnknownPerson,
    KnownPerson,
    Delivery,
    Vehicle,
    Animal,
    Loitering,
    Other,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::UnknownPerson => "unknown_person",
            EventKind::KnownPerson => "known_person",
            EventKind::Delivery => "delivery",
            EventKind::Vehicle => "vehicle",
            EventKind::Animal => "animal",
            EventKind::Loitering => "loitering",
            EventKind::Other => "other",
        }
    }

    /// Lenient parse for model output; unknown values map to `Other`.
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "unknown_person" | "unknown person" | "stranger" => EventKind::UnknownPerson,
            "known_person" | "known person" | "resident" => EventKind::KnownPerson,
            "delivery" | "courier" | "package" => EventKind::Delivery,
            "vehicle" | "car" => EventKind::Vehicle,
            "animal" => EventKind::Animal,
            "loitering" => EventKind::Loitering,
            _ => EventKind::Other,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// -------------------- Actions --------------------

/// Closed enumeration of side effects the bridge is permitted to perform.
/// Anything outside this table is downgraded to `NotifyOnly` at sanitize time.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AlertAction {
    NotifyOnly,
    NotifyAndSaveClip,
    NotifyAndLight,
    NotifyAndSpeaker,
    NotifyAndAlarm,
}

impl AlertAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertAction::NotifyOnly => "notify_only",
            AlertAction::NotifyAndSaveClip => "notify_and_save_clip",
            AlertAction::NotifyAndLight => "notify_and_light",
            AlertAction::NotifyAndSpeaker => "notify_and_speaker",
            AlertAction::NotifyAndAlarm => "notify_and_alarm",
        }
    }

    /// Default action for a risk band. The model may request a stronger one.
    pub fn for_band(level: RiskLevel) -> Self {
        match level {
            RiskLevel::Low => AlertAction::NotifyOnly,
            RiskLevel::Medium => AlertAction::NotifyAndSaveClip,
            RiskLevel::High => AlertAction::NotifyAndLight,
            RiskLevel::Critical => AlertAction::NotifyAndAlarm,
        }
    }

    /// Lenient parse for model output; unknown values map to `NotifyOnly`.
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "notify_only" | "notify" => AlertAction::NotifyOnly,
            "notify_and_save_clip" | "save_clip" => AlertAction::NotifyAndSaveClip,
            "notify_and_light" | "light" => AlertAction::NotifyAndLight,
            "notify_and_speaker" | "speaker" => AlertAction::NotifyAndSpeaker,
            "notify_and_alarm" | "alarm" => AlertAction::NotifyAndAlarm,
            _ => AlertAction::NotifyOnly,
        }
    }
}

impl std::fmt::Display for AlertAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// -------------------- Subject Identity --------------------

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SubjectIdentity {
    Known,
    Unknown,
}

impl SubjectIdentity {
    pub fn as_str(self) -> &'static str {
        match self {
            SubjectIdentity::Known => "known",
            SubjectIdentity::Unknown => "unknown",
        }
    }
}

// -------------------- Decision --------------------

/// Structured risk + action record produced by the decision engine.
///
/// Invariant: `risk_level` is always the band of `risk_score`. Every code
/// path that mutates the score must call [`Decision::enforce_band`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Decision {
    pub risk_level: RiskLevel,
    pub risk_score: u32,
    pub risk_confidence: f64,
    pub risk_reason: String,
    pub event_type: EventKind,
    pub action: AlertAction,
    pub subject_identity: SubjectIdentity,
    pub subject_description: String,
    pub behavior: String,
}

impl Decision {
    /// Coerce `risk_level` back to the band of `risk_score`. Returns true if
    /// a violation was corrected, so callers can log it.
    pub fn enforce_band(&mut self) -> bool {
        let band = RiskLevel::band(self.risk_score);
        if self.risk_level != band {
            self.risk_level = band;
            return true;
        }
        false
    }

    /// Clamp confidence into [0, 1]. NaN collapses to 0.
    pub fn clamp_confidence(&mut self) {
        if !self.risk_confidence.is_finite() {
            self.risk_confidence = 0.0;
        }
        self.risk_confidence = self.risk_confidence.clamp(0.0, 1.0);
    }
}

// -------------------- Time & Mode --------------------

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TimeOfDay {
    Day,
    Evening,
    Night,
}

impl TimeOfDay {
    pub fn as_str(self) -> &'static str {
        match self {
            TimeOfDay::Day => "day",
            TimeOfDay::Evening => "evening",
            TimeOfDay::Night => "night",
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HomeMode {
    Home,
    Away,
    Sleep,
    Guest,
}

impl HomeMode {
    pub fn as_str(self) -> &'static str {
        match self {
            HomeMode::Home => "home",
            HomeMode::Away => "away",
            HomeMode::Sleep => "sleep",
            HomeMode::Guest => "guest",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_lowercase().as_str() {
            "home" => Ok(HomeMode::Home),
            "away" => Ok(HomeMode::Away),
            "sleep" | "night" => Ok(HomeMode::Sleep),
            "guest" => Ok(HomeMode::Guest),
            other => Err(anyhow!(
                "unsupported home mode '{}'; expected 'home', 'away', 'sleep', or 'guest'",
                other
            )),
        }
    }
}

// -------------------- Conformance Tests --------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn band_thresholds_are_strict() {
        assert_eq!(RiskLevel::band(0), RiskLevel::Low);
        assert_eq!(RiskLevel::band(2), RiskLevel::Low);
        assert_eq!(RiskLevel::band(3), RiskLevel::Medium);
        assert_eq!(RiskLevel::band(4), RiskLevel::Medium);
        assert_eq!(RiskLevel::band(5), RiskLevel::High);
        assert_eq!(RiskLevel::band(6), RiskLevel::High);
        assert_eq!(RiskLevel::band(7), RiskLevel::Critical);
        assert_eq!(RiskLevel::band(13), RiskLevel::Critical);
    }

    #[test]
    fn baseline_round_trips_through_band() {
        for level in [
            RiskLevel::Low,
            RiskLevel::Medium,
            RiskLevel::High,
            RiskLevel::Critical,
        ] {
            assert_eq!(RiskLevel::band(level.baseline_score()), level);
        }
    }

    #[test]
    fn enforce_band_coerces_mismatch() {
        let mut decision = Decision {
            risk_level: RiskLevel::Low,
            risk_score: 9,
            risk_confidence: 0.5,
            risk_reason: "test".to_string(),
            event_type: EventKind::UnknownPerson,
            action: AlertAction::NotifyOnly,
            subject_identity: SubjectIdentity::Unknown,
            subject_description: String::new(),
            behavior: String::new(),
        };
        assert!(decision.enforce_band());
        assert_eq!(decision.risk_level, RiskLevel::Critical);
        assert!(!decision.enforce_band());
    }

    #[test]
    fn confidence_clamps_to_unit_interval() {
        let mut decision = Decision {
            risk_level: RiskLevel::Low,
            risk_score: 1,
            risk_confidence: 1.7,
            risk_reason: String::new(),
            event_type: EventKind::Other,
            action: AlertAction::NotifyOnly,
            subject_identity: SubjectIdentity::Unknown,
            subject_description: String::new(),
            behavior: String::new(),
        };
        decision.clamp_confidence();
        assert_eq!(decision.risk_confidence, 1.0);
        decision.risk_confidence = f64::NAN;
        decision.clamp_confidence();
        assert_eq!(decision.risk_confidence, 0.0);
    }

    #[test]
    fn enums_serialize_lowercase() {
        assert_eq!(
            serde_json::to_string(&RiskLevel::Critical).expect("serialize"),
            "\"critical\""
        );
        assert_eq!(
            serde_json::to_string(&EventKind::UnknownPerson).expect("serialize"),
            "\"unknown_person\""
        );
        assert_eq!(
            serde_json::to_string(&AlertAction::NotifyAndSaveClip).expect("serialize"),
            "\"notify_and_save_clip\""
        );
    }

    #[test]
    fn lenient_parses_tolerate_model_noise() {
        assert_eq!(RiskLevel::parse_lenient(" HIGH "), Some(RiskLevel::High));
        assert_eq!(RiskLevel::parse_lenient("bogus"), None);
        assert_eq!(EventKind::parse_lenient("Stranger"), EventKind::UnknownPerson);
        assert_eq!(EventKind::parse_lenient("???"), EventKind::Other);
        assert_eq!(
            AlertAction::parse_lenient("call the police"),
            AlertAction::NotifyOnly
        );
    }

    #[test]
    fn action_ordering_reflects_strength() {
        assert!(AlertAction::NotifyOnly < AlertAction::NotifyAndSaveClip);
        assert!(AlertAction::NotifyAndSaveClip < AlertAction::NotifyAndLight);
        assert!(AlertAction::NotifyAndLight < AlertAction::NotifyAndSpeaker);
        assert!(AlertAction::NotifyAndSpeaker < AlertAction::NotifyAndAlarm);
    }
}
