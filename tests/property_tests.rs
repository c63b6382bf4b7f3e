use proptest::prelude::*;
use std::collections::BTreeMap;

use watchpost::detect::{BBox, BehaviorKind, Capability, Detection, GearKind};
use watchpost::fanout::{FanOut, StreamFrame};
use watchpost::fusion::{correlate, AttributeState, Subject, UnifiedResult};
use watchpost::policy::{decide, PersistencePolicy, PolicyMode, ReasonCode};
use watchpost::rules::{RuleEngine, RuleSet, Violation, ViolationType};

fn bbox() -> impl Strategy<Value = BBox> {
    (0u16..200, 0u16..200, 1u16..80, 1u16..80).prop_map(|(x, y, w, h)| {
        BBox::new(x as f32, y as f32, (x + w) as f32, (y + h) as f32)
    })
}

fn detection() -> impl Strategy<Value = Detection> {
    (bbox(), 0u8..=10, prop::option::of(any::<bool>())).prop_map(|(b, c, compliant)| {
        let det = Detection::new(Capability::Gear(GearKind::Gloves), b, c as f32 / 10.0);
        match compliant {
            Some(flag) => det.with_compliance(flag),
            None => det,
        }
    })
}

fn capability() -> impl Strategy<Value = Capability> {
    prop_oneof![
        Just(Capability::Gear(GearKind::Mask)),
        Just(Capability::Gear(GearKind::Gloves)),
        Just(Capability::Gear(GearKind::Hairnet)),
        Just(Capability::Behavior(BehaviorKind::HandWashing)),
    ]
}

fn violation(severity: f32) -> Violation {
    Violation {
        violation_type: ViolationType::MissingGear(GearKind::Mask),
        subject: 0,
        severity,
        confidence: 0.9,
        timestamp_ms: 0,
    }
}

proptest! {
    #[test]
    fn correlation_ignores_detection_order(
        subjects in prop::collection::vec(bbox(), 0..6),
        detections in prop::collection::vec(detection(), 0..12),
        rotate in 0usize..12,
        min_iou in 0u8..=10,
    ) {
        let min_iou = min_iou as f32 / 10.0;
        let forward = correlate(&subjects, &detections, min_iou);

        let mut reversed = detections.clone();
        reversed.reverse();
        prop_assert_eq!(&forward, &correlate(&subjects, &reversed, min_iou));

        let mut rotated = detections.clone();
        if !rotated.is_empty() {
            let k = rotate % rotated.len();
            rotated.rotate_left(k);
        }
        prop_assert_eq!(&forward, &correlate(&subjects, &rotated, min_iou));

        let matched = forward.per_subject.iter().filter(|c| c.is_some()).count();
        prop_assert!(matched + forward.uncorrelated <= detections.len());
    }

    #[test]
    fn unknown_attributes_never_raise_violations(
        present in prop::collection::vec(capability(), 0..4),
        subjects in 1usize..5,
        min_confidence in 0u8..=10,
    ) {
        // Every subject answers Unknown for each listed capability and
        // is silent on the rest.
        let attributes: BTreeMap<Capability, AttributeState> = present
            .iter()
            .map(|cap| (*cap, AttributeState::Unknown))
            .collect();
        let result = UnifiedResult {
            sequence: 1,
            subjects: (0..subjects)
                .map(|i| Subject {
                    detection: Detection::new(
                        Capability::Presence,
                        BBox::new(i as f32 * 10.0, 0.0, i as f32 * 10.0 + 8.0, 20.0),
                        0.9,
                    ),
                    attributes: attributes.clone(),
                })
                .collect(),
            ..UnifiedResult::default()
        };
        let engine = RuleEngine::new(RuleSet::standard(), min_confidence as f32 / 10.0);
        prop_assert!(engine.evaluate(&result).is_empty());
    }

    #[test]
    fn smart_policy_keeps_exactly_qualifying_or_background_frames(
        severities in prop::collection::vec(0u8..=10, 0..4),
        counter in 1u64..2_000,
        threshold in 0u8..=10,
        background in 2u64..400,
    ) {
        let policy = PersistencePolicy {
            mode: PolicyMode::Smart,
            interval: 1,
            background_interval: background,
            severity_threshold: threshold as f32 / 10.0,
        };
        let violations: Vec<Violation> = severities
            .iter()
            .map(|s| violation(*s as f32 / 10.0))
            .collect();
        let qualifying = violations.iter().any(|v| v.severity >= policy.severity_threshold);
        let background_tick = counter % background == 0;

        let decision = decide(&UnifiedResult::default(), &violations, counter, &policy);
        prop_assert_eq!(decision.should_persist, qualifying || background_tick);
        if qualifying {
            prop_assert_eq!(decision.reason, Some(ReasonCode::Violation));
        } else if background_tick {
            prop_assert_eq!(decision.reason, Some(ReasonCode::SampledInterval));
        } else {
            prop_assert_eq!(decision.reason, None);
        }
        prop_assert_eq!(
            decision.snapshot_requested,
            decision.should_persist && !violations.is_empty()
        );
    }

    #[test]
    fn viewers_see_strictly_increasing_sequences(
        sequences in prop::collection::vec(1u64..50, 1..60),
        capacity in 1usize..6,
    ) {
        let fanout = FanOut::new(capacity);
        let mut viewer = fanout.subscribe("cam");
        let mut seen = Vec::new();
        for (i, seq) in sequences.iter().enumerate() {
            fanout.publish_frame(StreamFrame::new("cam", *seq, vec![0], false));
            if i % 3 == 0 {
                while let Some(frame) = viewer.try_recv() {
                    seen.push(frame.sequence);
                }
            }
        }
        while let Some(frame) = viewer.try_recv() {
            seen.push(frame.sequence);
        }
        prop_assert!(seen.windows(2).all(|w| w[0] < w[1]));
        let max = *sequences.iter().max().unwrap();
        prop_assert_eq!(seen.last().copied(), Some(max));
        prop_assert_eq!(fanout.latest("cam").map(|f| f.sequence), Some(max));
    }
}
