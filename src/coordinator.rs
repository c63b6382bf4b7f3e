//! Per-camera loop.
//!
//! `Starting -> Running -> (Paused <-> Running)* -> Stopping -> Stopped`
//!
//! One `LoopCoordinator` owns everything a camera needs. Nothing in it is
//! shared with another camera, so a stalled or failing camera only affects
//! itself. Control requests are observed between iterations.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::annotate::render_payload;
use crate::cache::FrameResultCache;
use crate::config::{CameraConfig, CameraSettings, SettingsHandle};
use crate::fanout::{StreamFrame, StreamPublisher};
use crate::frame::Frame;
use crate::fusion::{FusionOrchestrator, UnifiedResult};
use crate::ingest::{open_source, FrameSource, Pacer};
use crate::policy::{decide, PersistenceDecision};
use crate::rules::{RuleEngine, RuleSet, Violation};
use crate::stats::{RollingStats, StatsSink, StatsSnapshot};
use crate::storage::{PersistJob, PersistenceTotals, PersistenceWorker, RecordSink, WorkerConfig};

/// Consecutive failed reads after which a camera gives up.
pub const MAX_CONSECUTIVE_READ_ERRORS: u32 = 50;
const READ_RETRY_DELAY: Duration = Duration::from_millis(50);
const PAUSE_POLL: Duration = Duration::from_millis(20);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Starting,
    Running,
    Paused,
    Stopping,
    Stopped,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
struct ControlState {
    stop: AtomicBool,
    paused: AtomicBool,
    force_persist: AtomicBool,
    state: Mutex<LoopState>,
}

/// Cloneable remote control for one camera loop.
#[derive(Clone, Debug)]
pub struct ControlHandle {
    inner: Arc<ControlState>,
}

impl Default for ControlHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ControlState {
                stop: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                force_persist: AtomicBool::new(false),
                state: Mutex::new(LoopState::Starting),
            }),
        }
    }

    pub fn stop(&self) {
        self.inner.stop.store(true, Ordering::SeqCst);
    }

    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
    }

    /// Persist the next detected frame regardless of policy.
    pub fn force_persist(&self) {
        self.inner.force_persist.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.inner.stop.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> LoopState {
        *self
            .inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    fn take_force_persist(&self) -> bool {
        self.inner.force_persist.swap(false, Ordering::SeqCst)
    }

    fn set_state(&self, camera_id: &str, next: LoopState) {
        let mut state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *state != next {
            log::info!("camera {}: {} -> {}", camera_id, *state, next);
            *state = next;
        }
    }
}

/// Everything one camera loop owns.
pub struct CameraContext {
    pub camera_id: String,
    pub source: Box<dyn FrameSource>,
    pub orchestrator: FusionOrchestrator,
    pub rules: RuleSet,
    pub settings: SettingsHandle,
    pub persistence: PersistenceWorker,
    pub publisher: Arc<dyn StreamPublisher>,
    pub stats_sink: Arc<dyn StatsSink>,
    pub pacer: Pacer,
}

impl CameraContext {
    /// Open the source, start the providers and the persistence worker.
    pub fn from_config(
        camera: &CameraConfig,
        settings: SettingsHandle,
        sink: Box<dyn RecordSink>,
        worker: WorkerConfig,
        publisher: Arc<dyn StreamPublisher>,
        stats_sink: Arc<dyn StatsSink>,
    ) -> Result<Self> {
        let source = open_source(&camera.source, camera.width, camera.height)?;
        let providers = camera.providers.build(&camera.id)?;
        let (_, current) = settings.snapshot();
        let orchestrator = FusionOrchestrator::new(providers, current.fusion_params());
        let persistence = PersistenceWorker::spawn(&camera.id, sink, worker)?;
        Ok(Self {
            camera_id: camera.id.clone(),
            source,
            orchestrator,
            rules: camera.rules.clone(),
            settings,
            persistence,
            publisher,
            stats_sink,
            pacer: Pacer::new(camera.target_fps),
        })
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct LoopReport {
    pub camera_id: String,
    pub frames_read: u64,
    pub persistence: PersistenceTotals,
    pub final_stats: StatsSnapshot,
    /// Set when the loop ended because the source kept failing.
    pub source_failed: bool,
}

pub struct LoopCoordinator {
    ctx: CameraContext,
    control: ControlHandle,
}

/// Derived from one settings snapshot; rebuilt when the snapshot changes.
struct Applied {
    version: u64,
    settings: Arc<CameraSettings>,
    engine: RuleEngine,
}

impl LoopCoordinator {
    pub fn new(ctx: CameraContext) -> Self {
        Self {
            ctx,
            control: ControlHandle::new(),
        }
    }

    pub fn with_control(ctx: CameraContext, control: ControlHandle) -> Self {
        Self { ctx, control }
    }

    pub fn control(&self) -> ControlHandle {
        self.control.clone()
    }

    pub fn camera_id(&self) -> &str {
        &self.ctx.camera_id
    }

    pub fn run(self) -> Result<LoopReport> {
        let LoopCoordinator { ctx, control } = self;
        let CameraContext {
            camera_id,
            mut source,
            mut orchestrator,
            rules,
            settings,
            persistence,
            publisher,
            stats_sink,
            mut pacer,
        } = ctx;

        control.set_state(&camera_id, LoopState::Starting);
        let (version, current) = settings.snapshot();
        current.validate()?;
        let warm_up_budget = current.fusion_params().provider_timeout * 4;
        for (provider, err) in orchestrator.providers().warm_up(warm_up_budget) {
            log::warn!("camera {}: provider {} warm-up failed: {}", camera_id, provider, err);
        }
        if !orchestrator.providers().cacheable() {
            log::info!(
                "camera {}: a provider answers by frame sequence; result cache bypassed",
                camera_id
            );
        }
        if let Err(e) = source.connect() {
            control.set_state(&camera_id, LoopState::Stopped);
            persistence.flush_and_stop();
            return Err(anyhow!("camera {}: source connect failed: {:#}", camera_id, e));
        }

        orchestrator.set_params(current.fusion_params());
        let mut cache = FrameResultCache::new(current.cache_capacity);
        let mut applied = Applied {
            version,
            engine: RuleEngine::new(rules.clone(), current.min_violation_confidence),
            settings: current,
        };
        let mut stats = RollingStats::new(&camera_id);
        let mut frame_counter: u64 = 0;
        let mut read_errors: u32 = 0;
        let mut source_failed = false;

        control.set_state(&camera_id, LoopState::Running);
        loop {
            if control.is_stop_requested() {
                break;
            }
            if control.is_paused() {
                control.set_state(&camera_id, LoopState::Paused);
                std::thread::sleep(PAUSE_POLL);
                continue;
            }
            control.set_state(&camera_id, LoopState::Running);

            // One snapshot per iteration; a reload lands on the next frame.
            let (version, snapshot) = settings.snapshot();
            if version != applied.version {
                orchestrator.set_params(snapshot.fusion_params());
                cache.resize(snapshot.cache_capacity);
                cache.clear();
                applied = Applied {
                    version,
                    engine: RuleEngine::new(rules.clone(), snapshot.min_violation_confidence),
                    settings: snapshot,
                };
                log::info!("camera {}: applied settings version {}", camera_id, version);
            }
            let current = applied.settings.clone();

            pacer.wait();
            let frame = match source.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    log::info!("camera {}: source exhausted", camera_id);
                    break;
                }
                Err(e) => {
                    stats.record_read_error();
                    read_errors += 1;
                    if read_errors >= MAX_CONSECUTIVE_READ_ERRORS {
                        log::error!(
                            "camera {}: {} consecutive read errors, giving up: {:#}",
                            camera_id,
                            read_errors,
                            e
                        );
                        source_failed = true;
                        break;
                    }
                    log::warn!("camera {}: frame read failed: {:#}", camera_id, e);
                    std::thread::sleep(READ_RETRY_DELAY);
                    continue;
                }
            };
            read_errors = 0;
            stats.record_read(frame.sequence);
            frame_counter += 1;

            let detection_cycle = frame_counter % current.detection_interval == 0;
            let detected = if detection_cycle {
                Some(detect_cycle(
                    &camera_id,
                    &frame,
                    frame_counter,
                    &current,
                    &orchestrator,
                    &mut cache,
                    &applied.engine,
                    &persistence,
                    &control,
                    &mut stats,
                ))
            } else {
                None
            };

            if detection_cycle || frame_counter % current.stream_interval == 0 {
                let (result, violations) = match &detected {
                    Some((result, violations)) => (Some(result), violations.as_slice()),
                    None => (None, &[][..]),
                };
                let delivered = match render_payload(&frame, result, violations) {
                    Ok(rendered) => publisher.publish(StreamFrame::new(
                        &camera_id,
                        frame.sequence,
                        rendered.payload,
                        rendered.has_overlay,
                    )),
                    Err(e) => {
                        log::warn!("camera {}: frame {} not rendered: {:#}", camera_id, frame.sequence, e);
                        false
                    }
                };
                stats.record_stream(delivered);
            }

            if stats.frames_read() % current.stats_window_frames == 0 {
                stats_sink.emit(&stats.snapshot(persistence.totals()));
            }
        }

        control.set_state(&camera_id, LoopState::Stopping);
        let totals = persistence.flush_and_stop();
        let final_stats = stats.snapshot(totals);
        stats_sink.emit(&final_stats);
        control.set_state(&camera_id, LoopState::Stopped);

        Ok(LoopReport {
            camera_id,
            frames_read: final_stats.frames_read,
            persistence: totals,
            final_stats,
            source_failed,
        })
    }
}

/// Cache, fusion, rules, decision and hand-off for one frame.
#[allow(clippy::too_many_arguments)]
fn detect_cycle(
    camera_id: &str,
    frame: &Frame,
    frame_counter: u64,
    settings: &CameraSettings,
    orchestrator: &FusionOrchestrator,
    cache: &mut FrameResultCache,
    engine: &RuleEngine,
    persistence: &PersistenceWorker,
    control: &ControlHandle,
    stats: &mut RollingStats,
) -> (UnifiedResult, Vec<Violation>) {
    let started = Instant::now();
    // Providers that answer from anything but pixels would be masked by a hit.
    let cacheable = orchestrator.providers().cacheable();
    let cached = if cacheable { cache.lookup(frame) } else { None };
    let result = match cached {
        Some(result) => {
            stats.record_cache(true);
            result
        }
        None => {
            let result = orchestrator.process(frame);
            if cacheable {
                stats.record_cache(false);
                // Results missing a provider's answer are not worth repeating.
                if result.is_complete() {
                    cache.store(frame, &result);
                }
            }
            result
        }
    };
    for failure in &result.failures {
        log::warn!(
            "camera {}: frame {}: {} ({}) {}: {}",
            camera_id,
            frame.sequence,
            failure.provider,
            failure.capability,
            if failure.timed_out { "timed out" } else { "unavailable" },
            failure.message
        );
    }

    let violations = engine.evaluate(&result);
    let decision = if control.take_force_persist() {
        PersistenceDecision::forced()
    } else {
        decide(&result, &violations, frame_counter, &settings.policy)
    };
    if decision.should_persist {
        let job = PersistJob {
            result: result.clone(),
            violations: violations.clone(),
            decision,
            frame: decision.snapshot_requested.then(|| frame.clone()),
        };
        persistence.submit(job);
    }
    stats.record_detection(&result, &violations, &decision, started.elapsed());
    (result, violations)
}

/// A camera loop running on its own thread.
pub struct CameraLoopHandle {
    camera_id: String,
    control: ControlHandle,
    join: JoinHandle<Result<LoopReport>>,
}

impl CameraLoopHandle {
    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn control(&self) -> ControlHandle {
        self.control.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub fn join(self) -> Result<LoopReport> {
        self.join
            .join()
            .map_err(|_| anyhow!("camera {} loop panicked", self.camera_id))?
    }
}

pub fn spawn_camera_loop(coordinator: LoopCoordinator) -> Result<CameraLoopHandle> {
    let camera_id = coordinator.camera_id().to_string();
    let control = coordinator.control();
    let join = std::thread::Builder::new()
        .name(format!("camera-{}", camera_id))
        .spawn(move || coordinator.run())?;
    Ok(CameraLoopHandle {
        camera_id,
        control,
        join,
    })
}
