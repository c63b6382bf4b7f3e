//! Multi-capability fusion.
//!
//! One primary-subject call on the full frame, then every secondary capability
//! in parallel (one worker thread each), joined on a shared deadline. Secondary
//! detections are attached to the subject they overlap most; the merge is a
//! maximum under a total order, so the result does not depend on which worker
//! answered first.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::detect::{
    BBox, Capability, Compliance, Detection, InputMode, PendingCall, ProviderError, ProviderSet,
};
use crate::frame::Frame;

pub const DEFAULT_MIN_IOU: f32 = 0.2;
pub const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_millis(500);

/// A subject's attribute for one secondary capability.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AttributeState {
    /// The capability answered for this subject with a definite value.
    Present { value: bool, confidence: f32 },
    /// No signal: no correlated detection, a failed provider, or an explicit "unknown".
    Unknown,
}

impl AttributeState {
    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Subject {
    pub detection: Detection,
    /// One entry per secondary capability in the provider set.
    pub attributes: BTreeMap<Capability, AttributeState>,
}

impl Subject {
    pub fn attribute(&self, capability: Capability) -> AttributeState {
        self.attributes
            .get(&capability)
            .copied()
            .unwrap_or(AttributeState::Unknown)
    }
}

/// A capability that produced no answer for the frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderFailure {
    pub capability: Capability,
    pub provider: String,
    pub timed_out: bool,
    pub message: String,
}

impl ProviderFailure {
    fn new(capability: Capability, err: &ProviderError) -> Self {
        let provider = match err {
            ProviderError::Timeout { provider, .. } => provider.clone(),
            ProviderError::Unavailable { provider, .. } => provider.clone(),
        };
        Self {
            capability,
            provider,
            timed_out: err.is_timeout(),
            message: err.to_string(),
        }
    }
}

/// Everything the pipeline knows about one processed frame.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UnifiedResult {
    pub sequence: u64,
    pub captured_at_ms: u64,
    pub subjects: Vec<Subject>,
    /// Raw detection count per capability, before correlation.
    pub detection_counts: BTreeMap<Capability, usize>,
    /// Secondary detections that overlapped no subject well enough.
    pub uncorrelated: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<ProviderFailure>,
}

impl UnifiedResult {
    pub fn empty_for(frame: &Frame) -> Self {
        Self {
            sequence: frame.sequence,
            captured_at_ms: frame.captured_at_ms(),
            ..Self::default()
        }
    }

    /// Same content, stamped with another frame's identity. Used for cache hits.
    pub fn rebind(&self, frame: &Frame) -> Self {
        Self {
            sequence: frame.sequence,
            captured_at_ms: frame.captured_at_ms(),
            ..self.clone()
        }
    }

    /// Results with failed providers are incomplete and must not be memoized.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn timeouts(&self) -> usize {
        self.failures.iter().filter(|f| f.timed_out).count()
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FusionParams {
    pub min_iou: f32,
    pub provider_timeout: Duration,
}

impl Default for FusionParams {
    fn default() -> Self {
        Self {
            min_iou: DEFAULT_MIN_IOU,
            provider_timeout: DEFAULT_PROVIDER_TIMEOUT,
        }
    }
}

/// Outcome of correlating one capability's detections onto the subjects.
#[derive(Clone, Debug, PartialEq)]
pub struct Correlation {
    /// Indexed like the subject list. `None` means nothing correlated.
    pub per_subject: Vec<Option<Candidate>>,
    pub uncorrelated: usize,
}

/// The winning detection for a subject.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Candidate {
    pub confidence: f32,
    pub iou: f32,
    pub bbox: BBox,
    pub compliance: Compliance,
}

impl Candidate {
    /// A definite answer beats `Unknown`. Then higher confidence wins, then
    /// higher overlap; box then compliance break the rest.
    fn outranks(&self, other: &Candidate) -> bool {
        let definite = |c: &Candidate| c.compliance != Compliance::Unknown;
        let ord = definite(self)
            .cmp(&definite(other))
            .then(self.confidence.total_cmp(&other.confidence))
            .then(self.iou.total_cmp(&other.iou))
            .then_with(|| other.bbox.total_cmp(&self.bbox))
            .then_with(|| other.compliance.cmp(&self.compliance));
        ord == Ordering::Greater
    }

    pub fn state(&self) -> AttributeState {
        match self.compliance {
            Compliance::Compliant => AttributeState::Present {
                value: true,
                confidence: self.confidence,
            },
            Compliance::NonCompliant => AttributeState::Present {
                value: false,
                confidence: self.confidence,
            },
            Compliance::Unknown => AttributeState::Unknown,
        }
    }
}

/// Attach each detection to the subject with the highest IoU at or above
/// `min_iou`. Ties go to the lower subject index. Zero overlap never correlates.
pub fn correlate(subjects: &[BBox], detections: &[Detection], min_iou: f32) -> Correlation {
    let mut per_subject: Vec<Option<Candidate>> = vec![None; subjects.len()];
    let mut uncorrelated = 0;

    for det in detections {
        let mut best: Option<(usize, f32)> = None;
        for (idx, subject) in subjects.iter().enumerate() {
            let iou = subject.iou(&det.bbox);
            if iou <= 0.0 || iou < min_iou {
                continue;
            }
            match best {
                Some((_, best_iou)) if iou <= best_iou => {}
                _ => best = Some((idx, iou)),
            }
        }
        let Some((idx, iou)) = best else {
            uncorrelated += 1;
            continue;
        };
        let candidate = Candidate {
            confidence: det.confidence,
            iou,
            bbox: det.bbox,
            compliance: det.compliance(),
        };
        let replace = match &per_subject[idx] {
            Some(current) => candidate.outranks(current),
            None => true,
        };
        if replace {
            per_subject[idx] = Some(candidate);
        }
    }

    Correlation {
        per_subject,
        uncorrelated,
    }
}

pub struct FusionOrchestrator {
    providers: ProviderSet,
    params: FusionParams,
}

impl FusionOrchestrator {
    pub fn new(providers: ProviderSet, params: FusionParams) -> Self {
        Self { providers, params }
    }

    pub fn params(&self) -> FusionParams {
        self.params
    }

    pub fn set_params(&mut self, params: FusionParams) {
        self.params = params;
    }

    pub fn providers(&self) -> &ProviderSet {
        &self.providers
    }

    pub fn process(&self, frame: &Frame) -> UnifiedResult {
        let mut result = UnifiedResult::empty_for(frame);
        let timeout = self.params.provider_timeout;
        let primary = self.providers.primary();

        let subjects: Vec<Detection> = match primary.call(frame, vec![None], timeout) {
            Ok(detections) => detections
                .into_iter()
                .filter(|d| d.capability == Capability::Presence && d.is_well_formed())
                .collect(),
            Err(err) => {
                log::debug!("frame {}: primary provider failed: {}", frame.sequence, err);
                result
                    .failures
                    .push(ProviderFailure::new(primary.capability(), &err));
                Vec::new()
            }
        };
        result
            .detection_counts
            .insert(primary.capability(), subjects.len());

        if subjects.is_empty() {
            return result;
        }
        let boxes: Vec<BBox> = subjects.iter().map(|s| s.bbox).collect();
        let rois: Vec<Option<BBox>> = boxes
            .iter()
            .map(|b| Some(b.clamp_to(frame.width, frame.height)))
            .collect();

        // All secondaries run concurrently and share one deadline.
        let deadline = Instant::now() + timeout;
        let pending: Vec<(Capability, f32, PendingCall)> = self
            .providers
            .secondaries()
            .iter()
            .map(|s| {
                let regions = match s.provider.input_mode() {
                    InputMode::FullFrame => vec![None],
                    InputMode::PerSubjectRoi => rois.clone(),
                };
                let min_iou = s.min_iou.unwrap_or(self.params.min_iou);
                (s.provider.capability(), min_iou, s.provider.submit(frame, regions))
            })
            .collect();

        let mut attributes: Vec<BTreeMap<Capability, AttributeState>> =
            vec![BTreeMap::new(); subjects.len()];
        for (capability, min_iou, call) in pending {
            let states = match call.wait_until(deadline, timeout) {
                Ok(detections) => {
                    let detections: Vec<Detection> = detections
                        .into_iter()
                        .filter(|d| d.capability == capability && d.is_well_formed())
                        .collect();
                    result.detection_counts.insert(capability, detections.len());
                    let correlation = correlate(&boxes, &detections, min_iou);
                    result.uncorrelated += correlation.uncorrelated;
                    correlation
                        .per_subject
                        .into_iter()
                        .map(|c| c.map(|c| c.state()).unwrap_or(AttributeState::Unknown))
                        .collect()
                }
                Err(err) => {
                    if err.is_timeout() {
                        log::warn!("frame {}: {}", frame.sequence, err);
                    } else {
                        log::debug!("frame {}: {}", frame.sequence, err);
                    }
                    result.failures.push(ProviderFailure::new(capability, &err));
                    vec![AttributeState::Unknown; subjects.len()]
                }
            };
            for (map, state) in attributes.iter_mut().zip(states) {
                map.insert(capability, state);
            }
        }

        result.subjects = subjects
            .into_iter()
            .zip(attributes)
            .map(|(detection, attributes)| Subject {
                detection,
                attributes,
            })
            .collect();
        result
    }
}
