//! Replay backend: serves pre-recorded detections keyed by frame sequence.
//!
//! Recordings are JSON documents:
//!
//! ```json
//! {
//!   "name": "person-replay",
//!   "capability": "presence",
//!   "input_mode": "full_frame",
//!   "frames": { "3": [ { "bbox": [10, 10, 90, 200], "confidence": 0.92, "track_id": 1 } ] },
//!   "default": []
//! }
//! ```
//!
//! `default` answers for every sequence without its own entry. With a region
//! hint, only detections overlapping the region are returned.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::detect::capability::{Capability, InputMode};
use crate::detect::provider::{CapabilityProvider, ProviderError};
use crate::detect::result::{AttributeValue, BBox, Detection};
use crate::frame::Frame;

#[derive(Debug, Deserialize)]
struct ReplayFile {
    name: Option<String>,
    capability: Capability,
    #[serde(default)]
    input_mode: InputMode,
    #[serde(default)]
    frames: BTreeMap<u64, Vec<RecordedDetection>>,
    #[serde(default)]
    default: Vec<RecordedDetection>,
}

#[derive(Debug, Deserialize)]
struct RecordedDetection {
    bbox: BBox,
    confidence: f32,
    #[serde(default)]
    track_id: Option<u64>,
    #[serde(default)]
    attributes: BTreeMap<String, AttributeValue>,
}

impl RecordedDetection {
    fn into_detection(self, capability: Capability) -> Detection {
        Detection {
            capability,
            bbox: self.bbox,
            confidence: self.confidence,
            track_id: self.track_id,
            attributes: self.attributes,
        }
    }
}

pub struct ReplayProvider {
    name: String,
    capability: Capability,
    input_mode: InputMode,
    frames: BTreeMap<u64, Vec<Detection>>,
    default: Vec<Detection>,
}

impl ReplayProvider {
    pub fn new(name: &str, capability: Capability, input_mode: InputMode) -> Self {
        Self {
            name: name.to_string(),
            capability,
            input_mode,
            frames: BTreeMap::new(),
            default: Vec::new(),
        }
    }

    /// Record the detections returned for `sequence`.
    pub fn with_frame(mut self, sequence: u64, detections: Vec<Detection>) -> Self {
        self.frames.insert(sequence, detections);
        self
    }

    /// Detections returned for every sequence without its own entry.
    pub fn with_default(mut self, detections: Vec<Detection>) -> Self {
        self.default = detections;
        self
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let file: ReplayFile =
            serde_json::from_str(raw).map_err(|e| anyhow!("invalid replay recording: {}", e))?;
        let capability = file.capability;
        let frames = file
            .frames
            .into_iter()
            .map(|(seq, dets)| {
                let dets = dets
                    .into_iter()
                    .map(|d| d.into_detection(capability))
                    .collect();
                (seq, dets)
            })
            .collect();
        let default = file
            .default
            .into_iter()
            .map(|d| d.into_detection(capability))
            .collect();
        Ok(Self {
            name: file.name.unwrap_or_else(|| format!("replay-{}", capability)),
            capability,
            input_mode: file.input_mode,
            frames,
            default,
        })
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read replay recording {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("in {}", path.display()))
    }
}

impl CapabilityProvider for ReplayProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capability(&self) -> Capability {
        self.capability
    }

    fn input_mode(&self) -> InputMode {
        self.input_mode
    }

    /// Per-sequence entries answer by frame number, not content. A recording
    /// with only a default answers the same for every frame.
    fn cacheable(&self) -> bool {
        self.frames.is_empty()
    }

    fn detect(
        &mut self,
        frame: &Frame,
        region_hint: Option<BBox>,
    ) -> Result<Vec<Detection>, ProviderError> {
        let recorded = self.frames.get(&frame.sequence).unwrap_or(&self.default);
        Ok(recorded
            .iter()
            .filter(|det| match region_hint {
                Some(region) => det.bbox.intersection(&region) > 0.0,
                None => true,
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{Compliance, GearKind};
    use crate::frame::frame_byte_len;

    fn frame(sequence: u64) -> Frame {
        Frame::new(vec![0u8; frame_byte_len(8, 8)], 8, 8, sequence).unwrap()
    }

    #[test]
    fn loads_recording_and_answers_by_sequence() {
        let raw = r#"{
            "capability": "gear:mask",
            "input_mode": "per_subject_roi",
            "frames": {
                "3": [{"bbox": [0, 0, 4, 4], "confidence": 0.8, "attributes": {"compliant": false}}]
            },
            "default": [{"bbox": [0, 0, 4, 4], "confidence": 0.9}]
        }"#;
        let mut provider = ReplayProvider::from_json(raw).unwrap();
        assert_eq!(provider.name(), "replay-gear:mask");
        assert_eq!(provider.input_mode(), InputMode::PerSubjectRoi);

        let hit = provider.detect(&frame(3), None).unwrap();
        assert_eq!(hit.len(), 1);
        assert_eq!(hit[0].capability, Capability::Gear(GearKind::Mask));
        assert_eq!(hit[0].compliance(), Compliance::NonCompliant);

        let fallback = provider.detect(&frame(4), None).unwrap();
        assert_eq!(fallback[0].compliance(), Compliance::Compliant);
    }

    #[test]
    fn region_hint_filters_detections() {
        let mut provider = ReplayProvider::new("r", Capability::Presence, InputMode::FullFrame)
            .with_default(vec![
                Detection::new(Capability::Presence, BBox::new(0.0, 0.0, 2.0, 2.0), 0.9),
                Detection::new(Capability::Presence, BBox::new(5.0, 5.0, 7.0, 7.0), 0.9),
            ]);
        let inside = provider
            .detect(&frame(1), Some(BBox::new(4.0, 4.0, 8.0, 8.0)))
            .unwrap();
        assert_eq!(inside.len(), 1);
        assert_eq!(inside[0].bbox.x1, 5.0);
    }

    #[test]
    fn rejects_unknown_capability() {
        assert!(ReplayProvider::from_json(r#"{"capability":"gear:cape"}"#).is_err());
    }

    #[test]
    fn per_sequence_recordings_are_not_cacheable() {
        let constant = ReplayProvider::new("r", Capability::Presence, InputMode::FullFrame)
            .with_default(vec![Detection::new(Capability::Presence, BBox::new(0.0, 0.0, 2.0, 2.0), 0.9)]);
        assert!(constant.cacheable());

        let keyed = constant.with_frame(3, vec![]);
        assert!(!keyed.cacheable());
    }
}
