use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use crate::cache::DEFAULT_CACHE_CAPACITY;
use crate::detect::{Capability, InputMode, ProviderSet, ReplayProvider};
use crate::fusion::{FusionParams, DEFAULT_MIN_IOU, DEFAULT_PROVIDER_TIMEOUT};
use crate::policy::{PersistencePolicy, PolicyMode};
use crate::rules::{RuleSet, ViolationRule, DEFAULT_MIN_VIOLATION_CONFIDENCE};
use crate::stats::DEFAULT_STATS_WINDOW_FRAMES;
use crate::storage::{RetentionSchedule, RetryPolicy, WorkerConfig, DEFAULT_QUEUE_CAPACITY};
use crate::transport::mqtt::DEFAULT_MAX_PACKET_BYTES;
use crate::transport::{MqttSettings, DEFAULT_MQTT_ADDR, DEFAULT_TOPIC_PREFIX};

const DEFAULT_DB_PATH: &str = "watchpost.db";
const DEFAULT_CAMERA_ID: &str = "cam-1";
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_TARGET_FPS: u32 = 10;
const DEFAULT_CLIENT_ID: &str = "watchpostd";
const DEFAULT_RETENTION_SECS: u64 = 60 * 60 * 24 * 7;
const DEFAULT_RETENTION_SWEEP_SECS: u64 = 60 * 60;
pub const DEFAULT_RELOAD_POLL: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    db_path: Option<String>,
    mqtt: Option<MqttConfigFile>,
    persistence: Option<PersistenceConfigFile>,
    retention: Option<RetentionConfigFile>,
    cameras: Option<Vec<CameraConfigFile>>,
}

#[derive(Debug, Deserialize, Default)]
struct MqttConfigFile {
    enabled: Option<bool>,
    addr: Option<String>,
    topic_prefix: Option<String>,
    client_id: Option<String>,
    username: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct PersistenceConfigFile {
    queue_capacity: Option<usize>,
    retry: Option<RetryPolicy>,
}

#[derive(Debug, Deserialize, Default)]
struct RetentionConfigFile {
    seconds: Option<u64>,
    sweep_seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct CameraConfigFile {
    id: String,
    source: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    target_fps: Option<u32>,
    providers: Option<ProvidersConfig>,
    rules: Option<Vec<ViolationRule>>,
    #[serde(default)]
    settings: CameraSettings,
}

/// Everything about a camera that may change while its loop runs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraSettings {
    /// Run detection on every n-th frame.
    pub detection_interval: u64,
    /// Publish every n-th frame to viewers.
    pub stream_interval: u64,
    pub min_iou: f32,
    pub min_violation_confidence: f32,
    pub cache_capacity: usize,
    pub provider_timeout_ms: u64,
    pub stats_window_frames: u64,
    pub policy: PersistencePolicy,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            detection_interval: 1,
            stream_interval: 1,
            min_iou: DEFAULT_MIN_IOU,
            min_violation_confidence: DEFAULT_MIN_VIOLATION_CONFIDENCE,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            provider_timeout_ms: DEFAULT_PROVIDER_TIMEOUT.as_millis() as u64,
            stats_window_frames: DEFAULT_STATS_WINDOW_FRAMES,
            policy: PersistencePolicy::default(),
        }
    }
}

impl CameraSettings {
    pub fn fusion_params(&self) -> FusionParams {
        FusionParams {
            min_iou: self.min_iou,
            provider_timeout: Duration::from_millis(self.provider_timeout_ms),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.detection_interval == 0 {
            return Err(anyhow!("detection_interval must be greater than zero"));
        }
        if self.stream_interval == 0 {
            return Err(anyhow!("stream_interval must be greater than zero"));
        }
        if self.stats_window_frames == 0 {
            return Err(anyhow!("stats_window_frames must be greater than zero"));
        }
        if self.provider_timeout_ms == 0 {
            return Err(anyhow!("provider_timeout_ms must be greater than zero"));
        }
        if !(0.0..=1.0).contains(&self.min_iou) {
            return Err(anyhow!("min_iou must be within [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.min_violation_confidence) {
            return Err(anyhow!("min_violation_confidence must be within [0, 1]"));
        }
        self.policy.validate()
    }
}

/// Replay recordings backing a camera's providers. Without a primary
/// recording the camera gets an empty presence replay and never detects.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct ProvidersConfig {
    pub primary: Option<PathBuf>,
    #[serde(default)]
    pub secondaries: Vec<SecondaryProviderConfig>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct SecondaryProviderConfig {
    pub path: PathBuf,
    /// Overrides the camera's `min_iou` for this capability.
    pub min_iou: Option<f32>,
}

impl ProvidersConfig {
    pub fn build(&self, camera_id: &str) -> Result<ProviderSet> {
        let primary = match &self.primary {
            Some(path) => ReplayProvider::from_path(path)?,
            None => ReplayProvider::new(
                &format!("{}-presence", camera_id),
                Capability::Presence,
                InputMode::FullFrame,
            ),
        };
        let mut builder = ProviderSet::builder().primary(primary);
        for secondary in &self.secondaries {
            let provider = ReplayProvider::from_path(&secondary.path)?;
            builder = builder.secondary_boxed(Box::new(provider), secondary.min_iou);
        }
        builder.build()
    }
}

#[derive(Clone, Debug)]
pub struct CameraConfig {
    pub id: String,
    pub source: String,
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
    pub providers: ProvidersConfig,
    pub rules: RuleSet,
    pub settings: CameraSettings,
}

impl CameraConfig {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            source: format!("stub://{}", id),
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            target_fps: DEFAULT_TARGET_FPS,
            providers: ProvidersConfig::default(),
            rules: RuleSet::standard(),
            settings: CameraSettings::default(),
        }
    }

    fn from_file(file: CameraConfigFile) -> Self {
        let mut cfg = Self::new(&file.id);
        if let Some(source) = file.source {
            cfg.source = source;
        }
        cfg.width = file.width.unwrap_or(DEFAULT_WIDTH);
        cfg.height = file.height.unwrap_or(DEFAULT_HEIGHT);
        cfg.target_fps = file.target_fps.unwrap_or(DEFAULT_TARGET_FPS);
        cfg.providers = file.providers.unwrap_or_default();
        if let Some(rules) = file.rules {
            cfg.rules = RuleSet::new(rules);
        }
        cfg.settings = file.settings;
        cfg
    }
}

#[derive(Clone, Debug)]
pub struct MqttConfig {
    pub enabled: bool,
    pub addr: String,
    pub topic_prefix: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl MqttConfig {
    pub fn settings(&self) -> MqttSettings {
        MqttSettings {
            addr: self.addr.clone(),
            client_id: self.client_id.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            topic_prefix: self.topic_prefix.clone(),
            max_packet_bytes: DEFAULT_MAX_PACKET_BYTES,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub db_path: String,
    pub mqtt: MqttConfig,
    pub persistence: WorkerConfig,
    pub cameras: Vec<CameraConfig>,
    /// File the configuration was read from, if any. Watched for reloads.
    pub source_path: Option<PathBuf>,
}

impl PipelineConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("WATCHPOST_CONFIG")
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);
        match config_path {
            Some(path) => Self::load_from_path(&path),
            None => {
                let mut cfg = Self::from_file(PipelineConfigFile::default())?;
                cfg.apply_env()?;
                cfg.validate()?;
                Ok(cfg)
            }
        }
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let file = read_config_file(path)?;
        let mut cfg = Self::from_file(file)?;
        cfg.source_path = Some(path.to_path_buf());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PipelineConfigFile) -> Result<Self> {
        let db_path = file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
        let mqtt_file = file.mqtt.unwrap_or_default();
        let mqtt = MqttConfig {
            enabled: mqtt_file.enabled.unwrap_or(true),
            addr: mqtt_file
                .addr
                .unwrap_or_else(|| DEFAULT_MQTT_ADDR.to_string()),
            topic_prefix: mqtt_file
                .topic_prefix
                .unwrap_or_else(|| DEFAULT_TOPIC_PREFIX.to_string()),
            client_id: mqtt_file
                .client_id
                .unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string()),
            username: mqtt_file.username,
            password: None,
        };

        let persistence_file = file.persistence.unwrap_or_default();
        let retention_file = file.retention.unwrap_or_default();
        let retention_secs = retention_file.seconds.unwrap_or(DEFAULT_RETENTION_SECS);
        let retention = if retention_secs == 0 {
            None
        } else {
            Some(RetentionSchedule {
                max_age: Duration::from_secs(retention_secs),
                every: Duration::from_secs(
                    retention_file
                        .sweep_seconds
                        .unwrap_or(DEFAULT_RETENTION_SWEEP_SECS),
                ),
            })
        };
        let persistence = WorkerConfig {
            queue_capacity: persistence_file
                .queue_capacity
                .unwrap_or(DEFAULT_QUEUE_CAPACITY),
            retry: persistence_file.retry.unwrap_or_default(),
            retention,
        };

        let cameras = match file.cameras {
            Some(cameras) => cameras.into_iter().map(CameraConfig::from_file).collect(),
            None => vec![CameraConfig::new(DEFAULT_CAMERA_ID)],
        };

        Ok(Self {
            db_path,
            mqtt,
            persistence,
            cameras,
            source_path: None,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("WATCHPOST_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(addr) = std::env::var("WATCHPOST_MQTT_ADDR") {
            if !addr.trim().is_empty() {
                self.mqtt.addr = addr;
            }
        }
        if let Ok(prefix) = std::env::var("WATCHPOST_TOPIC_PREFIX") {
            if !prefix.trim().is_empty() {
                self.mqtt.topic_prefix = prefix.trim().trim_end_matches('/').to_string();
            }
        }
        if let Ok(password) = std::env::var("WATCHPOST_MQTT_PASSWORD") {
            if !password.is_empty() {
                self.mqtt.password = Some(password);
            }
        }
        if let Ok(interval) = std::env::var("WATCHPOST_DETECTION_INTERVAL") {
            let interval: u64 = interval.trim().parse().map_err(|_| {
                anyhow!("WATCHPOST_DETECTION_INTERVAL must be a positive integer")
            })?;
            for camera in &mut self.cameras {
                camera.settings.detection_interval = interval;
            }
        }
        if let Ok(mode) = std::env::var("WATCHPOST_POLICY_MODE") {
            let mode: PolicyMode = mode
                .parse()
                .context("WATCHPOST_POLICY_MODE is not a policy mode")?;
            for camera in &mut self.cameras {
                camera.settings.policy.mode = mode;
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.db_path.trim().is_empty() {
            return Err(anyhow!("db_path must not be empty"));
        }
        if self.mqtt.topic_prefix.is_empty()
            || self
                .mqtt
                .topic_prefix
                .contains(|c: char| c == '+' || c == '#' || c.is_whitespace())
        {
            return Err(anyhow!(
                "topic_prefix {:?} is not a valid MQTT topic prefix",
                self.mqtt.topic_prefix
            ));
        }
        if self.persistence.queue_capacity == 0 {
            return Err(anyhow!("persistence queue_capacity must be greater than zero"));
        }
        self.persistence.retry.validate()?;
        if self.cameras.is_empty() {
            return Err(anyhow!("at least one camera must be configured"));
        }

        let mut seen = HashSet::new();
        for camera in &self.cameras {
            crate::validate_camera_id(&camera.id)?;
            if !seen.insert(camera.id.as_str()) {
                return Err(anyhow!("duplicate camera id {}", camera.id));
            }
            if camera.width == 0 || camera.height == 0 {
                return Err(anyhow!("camera {}: width and height must be non-zero", camera.id));
            }
            if camera.target_fps == 0 {
                return Err(anyhow!("camera {}: target_fps must be greater than zero", camera.id));
            }
            if camera.source.trim().is_empty() {
                return Err(anyhow!("camera {}: source must not be empty", camera.id));
            }
            camera
                .settings
                .validate()
                .with_context(|| format!("camera {}", camera.id))?;
            camera
                .rules
                .validate()
                .with_context(|| format!("camera {}", camera.id))?;
        }
        Ok(())
    }

    pub fn camera(&self, id: &str) -> Option<&CameraConfig> {
        self.cameras.iter().find(|c| c.id == id)
    }
}

fn read_config_file(path: &Path) -> Result<PipelineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

struct Versioned {
    version: u64,
    settings: Arc<CameraSettings>,
}

/// Shared, swappable view of one camera's settings.
///
/// Readers take a snapshot; a replacement never alters a snapshot already
/// handed out.
#[derive(Clone)]
pub struct SettingsHandle {
    inner: Arc<RwLock<Versioned>>,
}

impl SettingsHandle {
    pub fn new(settings: CameraSettings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Versioned {
                version: 0,
                settings: Arc::new(settings),
            })),
        }
    }

    pub fn snapshot(&self) -> (u64, Arc<CameraSettings>) {
        let guard = self
            .inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        (guard.version, guard.settings.clone())
    }

    pub fn version(&self) -> u64 {
        self.snapshot().0
    }

    /// Validate and install new settings. Returns the new version, or the
    /// current one when nothing changed.
    pub fn replace(&self, settings: CameraSettings) -> Result<u64> {
        settings.validate()?;
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *guard.settings == settings {
            return Ok(guard.version);
        }
        guard.version += 1;
        guard.settings = Arc::new(settings);
        Ok(guard.version)
    }
}

/// Polls the configuration file and pushes changed camera settings into
/// their handles. Only `CameraSettings` are hot-reloaded; sources, providers
/// and the camera list need a restart.
pub struct ConfigWatcher {
    path: PathBuf,
    handles: BTreeMap<String, SettingsHandle>,
    last_stamp: Option<(SystemTime, u64)>,
}

fn file_stamp(path: &Path) -> Option<(SystemTime, u64)> {
    let meta = std::fs::metadata(path).ok()?;
    Some((meta.modified().ok()?, meta.len()))
}

impl ConfigWatcher {
    pub fn new(path: &Path, handles: BTreeMap<String, SettingsHandle>) -> Self {
        Self {
            path: path.to_path_buf(),
            handles,
            last_stamp: file_stamp(path),
        }
    }

    /// Reload if the file changed. Returns how many cameras got new settings.
    /// An invalid file leaves every handle untouched.
    pub fn poll_once(&mut self) -> Result<usize> {
        let stamp = file_stamp(&self.path);
        if stamp.is_none() || stamp == self.last_stamp {
            return Ok(0);
        }
        self.last_stamp = stamp;

        let cfg = PipelineConfig::load_from_path(&self.path)
            .with_context(|| format!("reload of {} rejected", self.path.display()))?;
        let mut updated = 0;
        for (id, handle) in &self.handles {
            match cfg.camera(id) {
                Some(camera) => {
                    let before = handle.version();
                    if handle.replace(camera.settings.clone())? != before {
                        log::info!("camera {}: settings reloaded", id);
                        updated += 1;
                    }
                }
                None => log::warn!(
                    "camera {} missing from reloaded config; keeping its settings",
                    id
                ),
            }
        }
        for camera in &cfg.cameras {
            if !self.handles.contains_key(&camera.id) {
                log::warn!("camera {} added to config; restart to start it", camera.id);
            }
        }
        Ok(updated)
    }

    pub fn spawn(mut self, interval: Duration) -> Result<WatcherHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let join = std::thread::Builder::new()
            .name("config-watcher".to_string())
            .spawn(move || {
                while !thread_stop.load(Ordering::SeqCst) {
                    if let Err(e) = self.poll_once() {
                        log::warn!("{:#}", e);
                    }
                    let mut slept = Duration::ZERO;
                    let step = Duration::from_millis(100);
                    while slept < interval && !thread_stop.load(Ordering::SeqCst) {
                        std::thread::sleep(step);
                        slept += step;
                    }
                }
            })?;
        Ok(WatcherHandle {
            stop,
            join: Some(join),
        })
    }
}

pub struct WatcherHandle {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl WatcherHandle {
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}
