//! What to keep.
//!
//! `decide` is a pure function of the violations, the caller's frame counter
//! and the policy. The counter is owned by the camera loop.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::fusion::UnifiedResult;
use crate::rules::Violation;

pub const DEFAULT_INTERVAL: u64 = 1;
pub const DEFAULT_BACKGROUND_INTERVAL: u64 = 300;
pub const DEFAULT_SEVERITY_THRESHOLD: f32 = 0.5;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyMode {
    /// Every `interval`-th frame.
    All,
    /// Frames with a violation at or above the severity threshold.
    ViolationsOnly,
    /// Every `interval`-th frame. Same selection as `All`.
    Interval,
    /// Qualifying violations, plus every `background_interval`-th frame.
    #[default]
    Smart,
}

impl FromStr for PolicyMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "all" => Ok(Self::All),
            "violations_only" => Ok(Self::ViolationsOnly),
            "interval" => Ok(Self::Interval),
            "smart" => Ok(Self::Smart),
            other => Err(anyhow!(
                "unknown policy mode '{}': expected all, violations_only, interval or smart",
                other
            )),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistencePolicy {
    pub mode: PolicyMode,
    pub interval: u64,
    pub background_interval: u64,
    pub severity_threshold: f32,
}

impl Default for PersistencePolicy {
    fn default() -> Self {
        Self {
            mode: PolicyMode::Smart,
            interval: DEFAULT_INTERVAL,
            background_interval: DEFAULT_BACKGROUND_INTERVAL,
            severity_threshold: DEFAULT_SEVERITY_THRESHOLD,
        }
    }
}

impl PersistencePolicy {
    pub fn validate(&self) -> Result<()> {
        if self.interval == 0 {
            return Err(anyhow!("policy interval must be greater than zero"));
        }
        if self.background_interval == 0 {
            return Err(anyhow!("policy background_interval must be greater than zero"));
        }
        if self.mode == PolicyMode::Smart && self.background_interval <= self.interval {
            return Err(anyhow!(
                "smart policy needs background_interval ({}) greater than interval ({})",
                self.background_interval,
                self.interval
            ));
        }
        if !(0.0..=1.0).contains(&self.severity_threshold) {
            return Err(anyhow!("policy severity_threshold must be within [0, 1]"));
        }
        Ok(())
    }

    fn qualifying_violation(&self, violations: &[Violation]) -> bool {
        violations
            .iter()
            .any(|v| v.severity >= self.severity_threshold)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    Violation,
    SampledInterval,
    Forced,
}

impl ReasonCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Violation => "violation",
            Self::SampledInterval => "sampled_interval",
            Self::Forced => "forced",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistenceDecision {
    pub should_persist: bool,
    /// `None` when nothing is persisted.
    pub reason: Option<ReasonCode>,
    pub snapshot_requested: bool,
}

impl PersistenceDecision {
    pub fn skip() -> Self {
        Self {
            should_persist: false,
            reason: None,
            snapshot_requested: false,
        }
    }

    fn keep(reason: ReasonCode, violations: &[Violation]) -> Self {
        Self {
            should_persist: true,
            reason: Some(reason),
            snapshot_requested: !violations.is_empty(),
        }
    }

    /// Operator-requested capture of the next processed frame. Always snapshots.
    pub fn forced() -> Self {
        Self {
            should_persist: true,
            reason: Some(ReasonCode::Forced),
            snapshot_requested: true,
        }
    }
}

fn every(counter: u64, n: u64) -> bool {
    n != 0 && counter % n == 0
}

pub fn decide(
    _result: &UnifiedResult,
    violations: &[Violation],
    frame_counter: u64,
    policy: &PersistencePolicy,
) -> PersistenceDecision {
    match policy.mode {
        PolicyMode::All | PolicyMode::Interval => {
            if every(frame_counter, policy.interval) {
                PersistenceDecision::keep(ReasonCode::SampledInterval, violations)
            } else {
                PersistenceDecision::skip()
            }
        }
        PolicyMode::ViolationsOnly => {
            if policy.qualifying_violation(violations) {
                PersistenceDecision::keep(ReasonCode::Violation, violations)
            } else {
                PersistenceDecision::skip()
            }
        }
        PolicyMode::Smart => {
            if policy.qualifying_violation(violations) {
                PersistenceDecision::keep(ReasonCode::Violation, violations)
            } else if every(frame_counter, policy.background_interval) {
                PersistenceDecision::keep(ReasonCode::SampledInterval, violations)
            } else {
                PersistenceDecision::skip()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::GearKind;
    use crate::rules::ViolationType;

    fn violation(severity: f32) -> Violation {
        Violation {
            violation_type: ViolationType::MissingGear(GearKind::Mask),
            subject: 0,
            severity,
            confidence: 0.8,
            timestamp_ms: 0,
        }
    }

    fn policy(mode: PolicyMode) -> PersistencePolicy {
        PersistencePolicy {
            mode,
            interval: 3,
            background_interval: 5,
            severity_threshold: 0.5,
        }
    }

    #[test]
    fn smart_keeps_violations_and_background_samples() {
        let r = UnifiedResult::default();
        let p = policy(PolicyMode::Smart);
        let hit = decide(&r, &[violation(0.7)], 3, &p);
        assert_eq!(hit.reason, Some(ReasonCode::Violation));
        assert!(hit.snapshot_requested);

        let sampled = decide(&r, &[], 10, &p);
        assert_eq!(sampled.reason, Some(ReasonCode::SampledInterval));
        assert!(!sampled.snapshot_requested);

        assert_eq!(decide(&r, &[], 4, &p), PersistenceDecision::skip());
    }

    #[test]
    fn smart_low_severity_falls_back_to_sampling() {
        let r = UnifiedResult::default();
        let p = policy(PolicyMode::Smart);
        assert!(!decide(&r, &[violation(0.2)], 4, &p).should_persist);
        let sampled = decide(&r, &[violation(0.2)], 5, &p);
        assert_eq!(sampled.reason, Some(ReasonCode::SampledInterval));
        // A violation fired, so the sample carries a snapshot.
        assert!(sampled.snapshot_requested);
    }

    #[test]
    fn interval_modes_ignore_violations() {
        let r = UnifiedResult::default();
        for mode in [PolicyMode::All, PolicyMode::Interval] {
            let p = policy(mode);
            assert!(!decide(&r, &[violation(1.0)], 4, &p).should_persist);
            assert!(decide(&r, &[], 6, &p).should_persist);
        }
    }

    #[test]
    fn violations_only_uses_threshold() {
        let r = UnifiedResult::default();
        let p = policy(PolicyMode::ViolationsOnly);
        assert!(decide(&r, &[violation(0.5)], 1, &p).should_persist);
        assert!(!decide(&r, &[violation(0.49)], 1, &p).should_persist);
        assert!(!decide(&r, &[], 15, &p).should_persist);
    }

    #[test]
    fn validation() {
        assert!(PersistencePolicy::default().validate().is_ok());
        let bad = PersistencePolicy {
            background_interval: 1,
            ..PersistencePolicy::default()
        };
        assert!(bad.validate().is_err());
        let bad = PersistencePolicy {
            severity_threshold: 1.5,
            ..PersistencePolicy::default()
        };
        assert!(bad.validate().is_err());
        assert_eq!("VIOLATIONS-ONLY".parse::<PolicyMode>().unwrap(), PolicyMode::ViolationsOnly);
    }
}
