//! Watchpost
//!
//! Real-time compliance detection pipeline: frames are read per camera, fused
//! across capability providers, evaluated against violation rules, selectively
//! persisted, and fanned out to live viewers.
//!
//! # Module Structure
//!
//! - `frame`: immutable RGB frames shared read-only across one iteration
//! - `detect`: capability types, the provider trait, time-boxed workers, replay backend
//! - `cache`: perceptual-hash result cache
//! - `fusion`: provider orchestration and IoU correlation into a `UnifiedResult`
//! - `rules`: data-driven violation rules
//! - `policy`: the persistence decision function
//! - `storage`: record sinks and the asynchronous persistence worker
//! - `fanout`: per-viewer drop-oldest distribution
//! - `transport`: stream frame codec and MQTT publisher/relay
//! - `annotate`: overlay rendering and JPEG payloads
//! - `stats`: rolling counters and snapshots
//! - `config`: pipeline configuration, reload and settings handles
//! - `ingest`: frame sources
//! - `coordinator`: the per-camera loop state machine
//! - `api`: viewer HTTP server

use anyhow::{anyhow, Result};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod annotate;
pub mod api;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod detect;
pub mod fanout;
pub mod frame;
pub mod fusion;
pub mod ingest;
pub mod policy;
pub mod rules;
pub mod stats;
pub mod storage;
pub mod transport;

pub use cache::FrameResultCache;
pub use config::{CameraConfig, CameraSettings, ConfigWatcher, PipelineConfig, SettingsHandle};
pub use coordinator::{
    spawn_camera_loop, CameraContext, CameraLoopHandle, ControlHandle, LoopCoordinator,
    LoopReport, LoopState,
};
pub use detect::{
    BBox, Capability, CapabilityProvider, Detection, InputMode, ProviderError, ProviderSet,
    ReplayProvider,
};
pub use fanout::{FanOut, StreamFrame, StreamPublisher, Subscription};
pub use frame::Frame;
pub use fusion::{AttributeState, FusionOrchestrator, FusionParams, Subject, UnifiedResult};
pub use ingest::{FrameSource, RawFileSource, SyntheticSource};
pub use policy::{decide, PersistenceDecision, PersistencePolicy, PolicyMode, ReasonCode};
pub use rules::{RuleEngine, RuleSet, Violation, ViolationRule, ViolationType};
pub use stats::{RollingStats, StatsSink, StatsSnapshot};
pub use storage::{
    InMemoryRecordStore, PersistError, PersistenceWorker, RecordId, RecordSink, SqliteRecordStore,
};

pub const MAX_CAMERA_ID_LEN: usize = 64;

/// Milliseconds since the Unix epoch; 0 if the clock is before it.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Camera ids become MQTT topic levels and URL path segments, so they are
/// restricted to a positive allowlist.
///
/// Allowed: "dock-2", "line_a", "Cam01"
/// Disallowed: empty, whitespace, '/', '+', '#', or anything outside [A-Za-z0-9_-].
pub fn validate_camera_id(camera_id: &str) -> Result<()> {
    static CAMERA_ID_RE: OnceLock<std::result::Result<regex::Regex, regex::Error>> =
        OnceLock::new();
    let re = CAMERA_ID_RE
        .get_or_init(|| regex::Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,63}$"))
        .as_ref()
        .map_err(|e| anyhow!("camera id pattern: {}", e))?;
    if !re.is_match(camera_id) {
        return Err(anyhow!(
            "camera id {:?} must match ^[A-Za-z0-9][A-Za-z0-9_-]{{0,{}}}$",
            camera_id,
            MAX_CAMERA_ID_LEN - 1
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camera_id_allowlist() {
        for ok in ["dock-2", "line_a", "Cam01", "a"] {
            assert!(validate_camera_id(ok).is_ok(), "{}", ok);
        }
        let long = "a".repeat(MAX_CAMERA_ID_LEN + 1);
        for bad in ["", "-lead", "a/b", "a+", "cam#1", "x y", long.as_str()] {
            assert!(validate_camera_id(bad).is_err(), "{}", bad);
        }
    }

    #[test]
    fn clock_is_after_epoch() {
        assert!(now_ms() > 1_600_000_000_000);
    }
}
