//! Rolling per-camera counters and the snapshots derived from them.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crate::detect::Capability;
use crate::fusion::UnifiedResult;
use crate::policy::PersistenceDecision;
use crate::rules::{Violation, ViolationType};
use crate::storage::PersistenceTotals;

pub const DEFAULT_STATS_WINDOW_FRAMES: u64 = 100;
pub const LATENCY_WINDOW: usize = 32;

/// Point-in-time view of one camera. Derived state, recomputed on every emit.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub camera_id: String,
    pub emitted_at_ms: u64,
    pub last_sequence: u64,
    pub frames_read: u64,
    pub read_errors: u64,
    pub frames_detected: u64,
    pub frames_streamed: u64,
    pub stream_drops: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub provider_timeouts: u64,
    pub provider_unavailable: u64,
    pub uncorrelated_detections: u64,
    pub persist_requested: u64,
    pub persistence: PersistenceTotals,
    pub detections_by_capability: BTreeMap<Capability, u64>,
    pub violations_by_type: BTreeMap<ViolationType, u64>,
    /// Mean over the last `LATENCY_WINDOW` detection cycles.
    pub avg_latency_ms: f64,
    pub max_latency_ms: f64,
}

#[derive(Debug)]
pub struct RollingStats {
    camera_id: String,
    last_sequence: u64,
    frames_read: u64,
    read_errors: u64,
    frames_detected: u64,
    frames_streamed: u64,
    stream_drops: u64,
    cache_hits: u64,
    cache_misses: u64,
    provider_timeouts: u64,
    provider_unavailable: u64,
    uncorrelated: u64,
    persist_requested: u64,
    detections: BTreeMap<Capability, u64>,
    violations: BTreeMap<ViolationType, u64>,
    latencies: VecDeque<Duration>,
}

impl RollingStats {
    pub fn new(camera_id: &str) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            last_sequence: 0,
            frames_read: 0,
            read_errors: 0,
            frames_detected: 0,
            frames_streamed: 0,
            stream_drops: 0,
            cache_hits: 0,
            cache_misses: 0,
            provider_timeouts: 0,
            provider_unavailable: 0,
            uncorrelated: 0,
            persist_requested: 0,
            detections: BTreeMap::new(),
            violations: BTreeMap::new(),
            latencies: VecDeque::with_capacity(LATENCY_WINDOW),
        }
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    pub fn record_read(&mut self, sequence: u64) {
        self.frames_read += 1;
        self.last_sequence = sequence;
    }

    pub fn record_read_error(&mut self) {
        self.read_errors += 1;
    }

    pub fn record_cache(&mut self, hit: bool) {
        if hit {
            self.cache_hits += 1;
        } else {
            self.cache_misses += 1;
        }
    }

    /// One completed detection cycle.
    pub fn record_detection(
        &mut self,
        result: &UnifiedResult,
        violations: &[Violation],
        decision: &PersistenceDecision,
        latency: Duration,
    ) {
        self.frames_detected += 1;
        for (capability, count) in &result.detection_counts {
            *self.detections.entry(*capability).or_default() += *count as u64;
        }
        for violation in violations {
            *self.violations.entry(violation.violation_type).or_default() += 1;
        }
        let timeouts = result.timeouts() as u64;
        self.provider_timeouts += timeouts;
        self.provider_unavailable += result.failures.len() as u64 - timeouts;
        self.uncorrelated += result.uncorrelated as u64;
        if decision.should_persist {
            self.persist_requested += 1;
        }
        if self.latencies.len() == LATENCY_WINDOW {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency);
    }

    pub fn record_stream(&mut self, delivered: bool) {
        if delivered {
            self.frames_streamed += 1;
        } else {
            self.stream_drops += 1;
        }
    }

    pub fn snapshot(&self, persistence: PersistenceTotals) -> StatsSnapshot {
        let (avg, max) = if self.latencies.is_empty() {
            (0.0, 0.0)
        } else {
            let total: f64 = self.latencies.iter().map(|d| d.as_secs_f64()).sum();
            let max = self
                .latencies
                .iter()
                .map(|d| d.as_secs_f64())
                .fold(0.0, f64::max);
            (
                total * 1000.0 / self.latencies.len() as f64,
                max * 1000.0,
            )
        };
        StatsSnapshot {
            camera_id: self.camera_id.clone(),
            emitted_at_ms: crate::now_ms(),
            last_sequence: self.last_sequence,
            frames_read: self.frames_read,
            read_errors: self.read_errors,
            frames_detected: self.frames_detected,
            frames_streamed: self.frames_streamed,
            stream_drops: self.stream_drops,
            cache_hits: self.cache_hits,
            cache_misses: self.cache_misses,
            provider_timeouts: self.provider_timeouts,
            provider_unavailable: self.provider_unavailable,
            uncorrelated_detections: self.uncorrelated,
            persist_requested: self.persist_requested,
            persistence,
            detections_by_capability: self.detections.clone(),
            violations_by_type: self.violations.clone(),
            avg_latency_ms: avg,
            max_latency_ms: max,
        }
    }
}

/// Receives periodic snapshots. Shared by every camera in a process.
pub trait StatsSink: Send + Sync {
    fn emit(&self, snapshot: &StatsSnapshot);
}

/// Writes one summary line per snapshot.
#[derive(Debug, Default)]
pub struct LogStatsSink;

impl StatsSink for LogStatsSink {
    fn emit(&self, s: &StatsSnapshot) {
        log::info!(
            "camera {} stats: read={} detected={} streamed={} persisted={} violations={} cache={}/{} timeouts={} avg_latency={:.1}ms",
            s.camera_id,
            s.frames_read,
            s.frames_detected,
            s.frames_streamed,
            s.persistence.persisted,
            s.violations_by_type.values().sum::<u64>(),
            s.cache_hits,
            s.cache_hits + s.cache_misses,
            s.provider_timeouts,
            s.avg_latency_ms
        );
    }
}

/// Keeps every snapshot it is given.
#[derive(Clone, Debug, Default)]
pub struct CollectingStatsSink {
    snapshots: Arc<Mutex<Vec<StatsSnapshot>>>,
}

impl CollectingStatsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshots(&self) -> Vec<StatsSnapshot> {
        self.snapshots
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn latest(&self) -> Option<StatsSnapshot> {
        self.snapshots().pop()
    }
}

impl StatsSink for CollectingStatsSink {
    fn emit(&self, snapshot: &StatsSnapshot) {
        let mut guard = self
            .snapshots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.push(snapshot.clone());
    }
}

/// Fans a snapshot out to several sinks in order.
pub struct FanoutStatsSink {
    sinks: Vec<Arc<dyn StatsSink>>,
}

impl FanoutStatsSink {
    pub fn new(sinks: Vec<Arc<dyn StatsSink>>) -> Self {
        Self { sinks }
    }
}

impl StatsSink for FanoutStatsSink {
    fn emit(&self, snapshot: &StatsSnapshot) {
        for sink in &self.sinks {
            sink.emit(snapshot);
        }
    }
}

/// Latest snapshot per camera; what `/cameras/<id>/stats` serves.
#[derive(Debug, Default)]
pub struct StatsBoard {
    latest: RwLock<BTreeMap<String, StatsSnapshot>>,
}

impl StatsBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, snapshot: StatsSnapshot) {
        let mut latest = self
            .latest
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        latest.insert(snapshot.camera_id.clone(), snapshot);
    }

    pub fn get(&self, camera_id: &str) -> Option<StatsSnapshot> {
        self.latest
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(camera_id)
            .cloned()
    }

    pub fn cameras(&self) -> Vec<String> {
        self.latest
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect()
    }
}

impl StatsSink for StatsBoard {
    fn emit(&self, snapshot: &StatsSnapshot) {
        self.update(snapshot.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::GearKind;
    use crate::fusion::ProviderFailure;

    #[test]
    fn latency_window_is_bounded() {
        let mut stats = RollingStats::new("cam");
        let result = UnifiedResult::default();
        for ms in 0..(LATENCY_WINDOW as u64 + 8) {
            stats.record_detection(
                &result,
                &[],
                &PersistenceDecision::skip(),
                Duration::from_millis(ms),
            );
        }
        let snap = stats.snapshot(PersistenceTotals::default());
        // Window holds 8..40, mean 23.5.
        assert!((snap.avg_latency_ms - 23.5).abs() < 1e-6);
        assert!((snap.max_latency_ms - 39.0).abs() < 1e-6);
        assert_eq!(snap.frames_detected, LATENCY_WINDOW as u64 + 8);
    }

    #[test]
    fn counts_failures_violations_and_detections() {
        let mut stats = RollingStats::new("cam");
        let mut result = UnifiedResult::default();
        result.detection_counts.insert(Capability::Presence, 2);
        result.uncorrelated = 1;
        result.failures = vec![
            ProviderFailure {
                capability: Capability::Gear(GearKind::Gloves),
                provider: "g".into(),
                timed_out: true,
                message: "late".into(),
            },
            ProviderFailure {
                capability: Capability::Gear(GearKind::Mask),
                provider: "m".into(),
                timed_out: false,
                message: "down".into(),
            },
        ];
        let violations = vec![Violation {
            violation_type: ViolationType::MissingGear(GearKind::Mask),
            subject: 0,
            severity: 0.7,
            confidence: 0.9,
            timestamp_ms: 0,
        }];
        stats.record_read(7);
        stats.record_cache(false);
        stats.record_detection(
            &result,
            &violations,
            &PersistenceDecision::forced(),
            Duration::from_millis(3),
        );
        stats.record_stream(true);
        stats.record_stream(false);

        let snap = stats.snapshot(PersistenceTotals::default());
        assert_eq!(snap.last_sequence, 7);
        assert_eq!(snap.provider_timeouts, 1);
        assert_eq!(snap.provider_unavailable, 1);
        assert_eq!(snap.uncorrelated_detections, 1);
        assert_eq!(snap.persist_requested, 1);
        assert_eq!(snap.detections_by_capability[&Capability::Presence], 2);
        assert_eq!(
            snap.violations_by_type[&ViolationType::MissingGear(GearKind::Mask)],
            1
        );
        assert_eq!((snap.frames_streamed, snap.stream_drops), (1, 1));

        let json = serde_json::to_string(&snap).unwrap();
        let back: StatsSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back.violations_by_type, snap.violations_by_type);
    }
}
