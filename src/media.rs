//! Media decision table: what stills, clips, and monitoring each risk band
//! gets.

use serde::{Deserialize, Serialize};

use crate::RiskLevel;

/// Media requirements for one event.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaPlan {
    pub snapshot: bool,
    /// Requested clip retention length; `None` means no clip.
    pub clip_seconds: Option<u32>,
    /// Flag downstream consumers use to keep watching the camera.
    pub monitoring: bool,
}

impl MediaPlan {
    pub fn for_level(level: RiskLevel) -> Self {
        match level {
            RiskLevel::Low => Self {
                snapshot: true,
                clip_seconds: None,
                monitoring: false,
            },
            RiskLevel::Medium => Self {
                snapshot: true,
                clip_seconds: Some(15),
                monitoring: false,
            },
            RiskLevel::High => Self {
                snapshot: true,
                clip_seconds: Some(30),
                monitoring: true,
            },
            RiskLevel::Critical => Self {
                snapshot: true,
                clip_seconds: Some(60),
                monitoring: true,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_lengths_follow_the_band() {
        assert_eq!(MediaPlan::for_level(RiskLevel::Low).clip_seconds, None);
        assert_eq!(MediaPlan::for_level(RiskLevel::Medium).clip_seconds, Some(15));
        assert_eq!(MediaPlan::for_level(RiskLevel::High).clip_seconds, Some(30));
        assert_eq!(MediaPlan::for_level(RiskLevel::Critical).clip_seconds, Some(60));
    }

    #[test]
    fn monitoring_starts_at_high() {
        assert!(!MediaPlan::for_level(RiskLevel::Low).monitoring);
        assert!(!MediaPlan::for_level(RiskLevel::Medium).monitoring);
        assert!(MediaPlan::for_level(RiskLevel::High).monitoring);
        assert!(MediaPlan::for_level(RiskLevel::Critical).monitoring);
    }

    #[test]
    fn every_band_keeps_the_snapshot() {
        for level in [
            RiskLevel::Low,
            RiskLevel::Medium,
            RiskLevel::High,
            RiskLevel::Critical,
        ] {
            assert!(MediaPlan::for_level(level).snapshot);
        }
    }
}
