//! Compliance rules over fused results.
//!
//! A rule set is plain data. `RuleEngine::evaluate` walks every subject and
//! every rule; it holds no state between calls.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::detect::{BehaviorKind, Capability, GearKind};
use crate::fusion::{AttributeState, Subject, UnifiedResult};

pub const DEFAULT_MIN_VIOLATION_CONFIDENCE: f32 = 0.5;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum ViolationType {
    MissingGear(GearKind),
    MissedBehavior(BehaviorKind),
}

impl ViolationType {
    /// The capability whose confirmed negative raises this violation.
    pub fn capability(self) -> Capability {
        match self {
            Self::MissingGear(kind) => Capability::Gear(kind),
            Self::MissedBehavior(kind) => Capability::Behavior(kind),
        }
    }
}

impl fmt::Display for ViolationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingGear(kind) => write!(f, "missing_gear:{}", kind.as_str()),
            Self::MissedBehavior(kind) => write!(f, "missed_behavior:{}", kind.as_str()),
        }
    }
}

impl FromStr for ViolationType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_lowercase();
        match s.split_once(':') {
            Some(("missing_gear", kind)) => Ok(Self::MissingGear(kind.parse()?)),
            Some(("missed_behavior", kind)) => Ok(Self::MissedBehavior(kind.parse()?)),
            _ => Err(anyhow!("unknown violation type '{}'", s)),
        }
    }
}

impl From<ViolationType> for String {
    fn from(value: ViolationType) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for ViolationType {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub violation_type: ViolationType,
    /// Index into `UnifiedResult::subjects`.
    pub subject: usize,
    pub severity: f32,
    pub confidence: f32,
    pub timestamp_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ViolationRule {
    pub violation: ViolationType,
    pub severity: f32,
    /// Overrides the engine-wide confidence threshold for this rule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_confidence: Option<f32>,
}

impl ViolationRule {
    pub fn new(violation: ViolationType, severity: f32) -> Self {
        Self {
            violation,
            severity,
            min_confidence: None,
        }
    }

    /// Fires only on a present, confirmed negative at or above the threshold.
    /// `Unknown` never fires.
    pub fn fires(&self, subject: &Subject, default_min_confidence: f32) -> Option<f32> {
        let threshold = self.min_confidence.unwrap_or(default_min_confidence);
        match subject.attribute(self.violation.capability()) {
            AttributeState::Present {
                value: false,
                confidence,
            } if confidence >= threshold => Some(confidence),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    pub rules: Vec<ViolationRule>,
}

impl RuleSet {
    pub fn new(rules: Vec<ViolationRule>) -> Self {
        Self { rules }
    }

    /// Food-safety defaults.
    pub fn standard() -> Self {
        Self::new(vec![
            ViolationRule::new(ViolationType::MissingGear(GearKind::Mask), 0.7),
            ViolationRule::new(ViolationType::MissingGear(GearKind::Gloves), 0.8),
            ViolationRule::new(ViolationType::MissingGear(GearKind::Hairnet), 0.6),
            ViolationRule::new(ViolationType::MissedBehavior(BehaviorKind::HandWashing), 0.9),
        ])
    }

    pub fn push(&mut self, rule: ViolationRule) {
        self.rules.push(rule);
    }

    pub fn validate(&self) -> Result<()> {
        for rule in &self.rules {
            if !(0.0..=1.0).contains(&rule.severity) {
                return Err(anyhow!(
                    "rule {} severity must be within [0, 1]",
                    rule.violation
                ));
            }
            if let Some(min) = rule.min_confidence {
                if !(0.0..=1.0).contains(&min) {
                    return Err(anyhow!(
                        "rule {} min_confidence must be within [0, 1]",
                        rule.violation
                    ));
                }
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct RuleEngine {
    rules: RuleSet,
    min_confidence: f32,
}

impl RuleEngine {
    pub fn new(rules: RuleSet, min_confidence: f32) -> Self {
        Self {
            rules,
            min_confidence,
        }
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn min_confidence(&self) -> f32 {
        self.min_confidence
    }

    /// Violations ordered by subject, then rule registration order.
    pub fn evaluate(&self, result: &UnifiedResult) -> Vec<Violation> {
        let mut out = Vec::new();
        for (idx, subject) in result.subjects.iter().enumerate() {
            for rule in &self.rules.rules {
                if let Some(confidence) = rule.fires(subject, self.min_confidence) {
                    out.push(Violation {
                        violation_type: rule.violation,
                        subject: idx,
                        severity: rule.severity,
                        confidence,
                        timestamp_ms: result.captured_at_ms,
                    });
                }
            }
        }
        out
    }
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new(RuleSet::standard(), DEFAULT_MIN_VIOLATION_CONFIDENCE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{BBox, Detection};
    use std::collections::BTreeMap;

    const MASK: Capability = Capability::Gear(GearKind::Mask);
    const GLOVES: Capability = Capability::Gear(GearKind::Gloves);

    fn subject(attrs: &[(Capability, AttributeState)]) -> Subject {
        Subject {
            detection: Detection::new(
                Capability::Presence,
                BBox::new(0.0, 0.0, 10.0, 10.0),
                0.9,
            ),
            attributes: attrs.iter().copied().collect::<BTreeMap<_, _>>(),
        }
    }

    fn negative(confidence: f32) -> AttributeState {
        AttributeState::Present {
            value: false,
            confidence,
        }
    }

    fn result(subjects: Vec<Subject>) -> UnifiedResult {
        UnifiedResult {
            sequence: 1,
            captured_at_ms: 1234,
            subjects,
            ..UnifiedResult::default()
        }
    }

    #[test]
    fn unknown_never_fires() {
        let engine = RuleEngine::default();
        let r = result(vec![subject(&[
            (MASK, AttributeState::Unknown),
            (GLOVES, AttributeState::Unknown),
        ])]);
        assert!(engine.evaluate(&r).is_empty());
    }

    #[test]
    fn confirmed_negative_fires_at_threshold() {
        let engine = RuleEngine::default();
        let r = result(vec![subject(&[(MASK, negative(0.5))])]);
        let v = engine.evaluate(&r);
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].violation_type, ViolationType::MissingGear(GearKind::Mask));
        assert_eq!(v[0].timestamp_ms, 1234);
        assert_eq!(v[0].severity, 0.7);

        let weak = result(vec![subject(&[(MASK, negative(0.49))])]);
        assert!(engine.evaluate(&weak).is_empty());
    }

    #[test]
    fn positive_state_does_not_fire() {
        let engine = RuleEngine::default();
        let r = result(vec![subject(&[(
            MASK,
            AttributeState::Present {
                value: true,
                confidence: 0.99,
            },
        )])]);
        assert!(engine.evaluate(&r).is_empty());
    }

    #[test]
    fn several_rules_fire_for_one_subject() {
        let engine = RuleEngine::default();
        let r = result(vec![
            subject(&[]),
            subject(&[(MASK, negative(0.9)), (GLOVES, negative(0.9))]),
        ]);
        let v = engine.evaluate(&r);
        assert_eq!(v.len(), 2);
        assert!(v.iter().all(|v| v.subject == 1));
    }

    #[test]
    fn per_rule_threshold_overrides_default() {
        let mut rules = RuleSet::default();
        rules.push(ViolationRule {
            min_confidence: Some(0.95),
            ..ViolationRule::new(ViolationType::MissingGear(GearKind::Mask), 0.5)
        });
        let engine = RuleEngine::new(rules, 0.5);
        let r = result(vec![subject(&[(MASK, negative(0.9))])]);
        assert!(engine.evaluate(&r).is_empty());
    }

    #[test]
    fn violation_type_string_forms() {
        let t = ViolationType::MissedBehavior(BehaviorKind::HandWashing);
        assert_eq!(t.to_string(), "missed_behavior:hand_washing");
        assert_eq!(
            "missing_gear:gloves".parse::<ViolationType>().unwrap(),
            ViolationType::MissingGear(GearKind::Gloves)
        );
        assert!("missing_gear:cape".parse::<ViolationType>().is_err());
    }
}
