use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::capability::Capability;

/// Attribute key a provider uses for its tri-state compliance signal.
pub const COMPLIANT_KEY: &str = "compliant";

/// Axis-aligned box in full-frame pixel coordinates, `(x1, y1)` top-left.
///
/// Serialised as `[x1, y1, x2, y2]`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn intersection(&self, other: &BBox) -> f32 {
        let w = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let h = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        w * h
    }

    /// Intersection over union. Degenerate boxes have zero overlap with everything.
    pub fn iou(&self, other: &BBox) -> f32 {
        let inter = self.intersection(other);
        if inter <= 0.0 {
            return 0.0;
        }
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }

    pub fn is_valid(&self) -> bool {
        [self.x1, self.y1, self.x2, self.y2]
            .iter()
            .all(|v| v.is_finite())
            && self.x2 > self.x1
            && self.y2 > self.y1
    }

    /// Clamp to a `width` x `height` frame.
    pub fn clamp_to(&self, width: u32, height: u32) -> BBox {
        let w = width as f32;
        let h = height as f32;
        BBox {
            x1: self.x1.clamp(0.0, w),
            y1: self.y1.clamp(0.0, h),
            x2: self.x2.clamp(0.0, w),
            y2: self.y2.clamp(0.0, h),
        }
    }

    /// Total order used to break ties deterministically.
    pub(crate) fn total_cmp(&self, other: &BBox) -> std::cmp::Ordering {
        self.x1
            .total_cmp(&other.x1)
            .then(self.y1.total_cmp(&other.y1))
            .then(self.x2.total_cmp(&other.x2))
            .then(self.y2.total_cmp(&other.y2))
    }
}

impl From<[f32; 4]> for BBox {
    fn from(v: [f32; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }
}

impl From<BBox> for [f32; 4] {
    fn from(b: BBox) -> Self {
        [b.x1, b.y1, b.x2, b.y2]
    }
}

/// Capability-specific attribute value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

/// Tri-state compliance signal carried by a single detection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Compliance {
    Compliant,
    NonCompliant,
    /// The provider saw the region but had no confident signal either way.
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub capability: Capability,
    pub bbox: BBox,
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_id: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, AttributeValue>,
}

impl Detection {
    pub fn new(capability: Capability, bbox: BBox, confidence: f32) -> Self {
        Self {
            capability,
            bbox,
            confidence,
            track_id: None,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_track_id(mut self, track_id: u64) -> Self {
        self.track_id = Some(track_id);
        self
    }

    pub fn with_attribute(mut self, key: &str, value: AttributeValue) -> Self {
        self.attributes.insert(key.to_string(), value);
        self
    }

    /// Shorthand for an explicit compliance signal.
    pub fn with_compliance(self, compliant: bool) -> Self {
        self.with_attribute(COMPLIANT_KEY, AttributeValue::Bool(compliant))
    }

    /// Read the compliance signal.
    ///
    /// A detection without a `compliant` attribute asserts the capability's
    /// positive state (gear seen, behavior observed). Any non-boolean value,
    /// including the text `"unknown"`, reads as `Unknown`.
    pub fn compliance(&self) -> Compliance {
        match self.attributes.get(COMPLIANT_KEY) {
            None => Compliance::Compliant,
            Some(AttributeValue::Bool(true)) => Compliance::Compliant,
            Some(AttributeValue::Bool(false)) => Compliance::NonCompliant,
            Some(_) => Compliance::Unknown,
        }
    }

    /// A detection with a broken box or confidence outside [0, 1] is discarded by fusion.
    pub fn is_well_formed(&self) -> bool {
        self.bbox.is_valid() && (0.0..=1.0).contains(&self.confidence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::GearKind;

    #[test]
    fn iou_of_identical_and_disjoint_boxes() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BBox::new(20.0, 20.0, 30.0, 30.0);
        assert_eq!(a.iou(&a), 1.0);
        assert_eq!(a.iou(&b), 0.0);

        let half = BBox::new(5.0, 0.0, 15.0, 10.0);
        let iou = a.iou(&half);
        assert!((iou - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn degenerate_box_has_no_overlap() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0);
        let flat = BBox::new(2.0, 2.0, 2.0, 8.0);
        assert!(!flat.is_valid());
        assert_eq!(a.iou(&flat), 0.0);
    }

    #[test]
    fn compliance_attribute_is_tri_state() {
        let base = Detection::new(
            Capability::Gear(GearKind::Mask),
            BBox::new(0.0, 0.0, 1.0, 1.0),
            0.9,
        );
        assert_eq!(base.compliance(), Compliance::Compliant);
        assert_eq!(
            base.clone().with_compliance(false).compliance(),
            Compliance::NonCompliant
        );
        assert_eq!(
            base.with_attribute(COMPLIANT_KEY, AttributeValue::Text("unknown".into()))
                .compliance(),
            Compliance::Unknown
        );
    }

    #[test]
    fn detection_json_shape() {
        let json = r#"{"capability":"gear:gloves","bbox":[1,2,3,4],"confidence":0.7,"attributes":{"compliant":false}}"#;
        let det: Detection = serde_json::from_str(json).unwrap();
        assert_eq!(det.capability, Capability::Gear(GearKind::Gloves));
        assert_eq!(det.bbox, BBox::new(1.0, 2.0, 3.0, 4.0));
        assert_eq!(det.compliance(), Compliance::NonCompliant);
        assert_eq!(det.track_id, None);
    }
}
