//! watchpostd - per-camera detection daemon
//!
//! This daemon:
//! 1. Loads the pipeline configuration (file + environment)
//! 2. Starts one loop thread per camera: read, detect, decide, persist
//! 3. Publishes stream frames and stats snapshots to the MQTT broker
//! 4. Hot-reloads camera settings when the config file changes
//! 5. Stops every camera cooperatively on Ctrl-C

use anyhow::{anyhow, Result};
use clap::Parser;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use watchpost::config::DEFAULT_RELOAD_POLL;
use watchpost::stats::{FanoutStatsSink, LogStatsSink};
use watchpost::transport::MqttStreamPublisher;
use watchpost::{
    spawn_camera_loop, CameraContext, ConfigWatcher, FanOut, LoopCoordinator, PipelineConfig,
    SettingsHandle, SqliteRecordStore, StatsSink, StreamPublisher,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Watchpost detection daemon")]
struct Args {
    /// Pipeline configuration file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "WATCHPOST_CONFIG")]
    config: Option<PathBuf>,

    /// Do not connect to the broker; frames stay in-process.
    #[arg(long)]
    no_mqtt: bool,

    /// Seconds between config file checks. 0 disables reloading.
    #[arg(long, default_value_t = DEFAULT_RELOAD_POLL.as_secs())]
    reload_poll_secs: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let cfg = match &args.config {
        Some(path) => PipelineConfig::load_from_path(path)?,
        None => PipelineConfig::load()?,
    };
    log::info!(
        "watchpostd {} starting: {} camera(s), db {}",
        env!("CARGO_PKG_VERSION"),
        cfg.cameras.len(),
        cfg.db_path
    );

    let mqtt = if cfg.mqtt.enabled && !args.no_mqtt {
        Some(Arc::new(MqttStreamPublisher::connect(&cfg.mqtt.settings())?))
    } else {
        log::warn!("mqtt disabled; stream frames will not leave this process");
        None
    };
    let publisher: Arc<dyn StreamPublisher> = match &mqtt {
        Some(mqtt) => mqtt.clone(),
        None => Arc::new(FanOut::default()),
    };
    let mut sinks: Vec<Arc<dyn StatsSink>> = vec![Arc::new(LogStatsSink)];
    if let Some(mqtt) = &mqtt {
        sinks.push(mqtt.clone());
    }
    let stats_sink: Arc<dyn StatsSink> = Arc::new(FanoutStatsSink::new(sinks));

    let mut handles = BTreeMap::new();
    let mut loops = Vec::new();
    for camera in &cfg.cameras {
        let settings = SettingsHandle::new(camera.settings.clone());
        let started = SqliteRecordStore::open(&cfg.db_path, &camera.id).and_then(|store| {
            CameraContext::from_config(
                camera,
                settings.clone(),
                Box::new(store),
                cfg.persistence,
                publisher.clone(),
                stats_sink.clone(),
            )
        });
        // One camera failing to start must not keep the others down.
        let ctx = match started {
            Ok(ctx) => ctx,
            Err(e) => {
                log::error!("camera {} not started: {:#}", camera.id, e);
                continue;
            }
        };
        loops.push(spawn_camera_loop(LoopCoordinator::new(ctx))?);
        handles.insert(camera.id.clone(), settings);
    }
    if loops.is_empty() {
        return Err(anyhow!("no camera could be started"));
    }

    let watcher = match (&cfg.source_path, args.reload_poll_secs) {
        (Some(path), secs) if secs > 0 => {
            log::info!("watching {} for settings changes", path.display());
            Some(ConfigWatcher::new(path, handles).spawn(Duration::from_secs(secs))?)
        }
        _ => None,
    };

    let controls: Vec<_> = loops.iter().map(|l| l.control()).collect();
    ctrlc::set_handler(move || {
        log::info!("shutdown requested");
        for control in &controls {
            control.stop();
        }
    })?;

    for handle in loops {
        let camera_id = handle.camera_id().to_string();
        match handle.join() {
            Ok(report) => log::info!(
                "camera {} stopped: {} frames, {} persisted, {} dropped, {} failed{}",
                report.camera_id,
                report.frames_read,
                report.persistence.persisted,
                report.persistence.dropped,
                report.persistence.failed,
                if report.source_failed {
                    " (source failed)"
                } else {
                    ""
                }
            ),
            Err(e) => log::error!("camera {} ended with error: {:#}", camera_id, e),
        }
    }

    if let Some(watcher) = watcher {
        watcher.stop();
    }
    drop(publisher);
    drop(stats_sink);
    if let Some(mqtt) = mqtt {
        match Arc::try_unwrap(mqtt) {
            Ok(mqtt) => {
                log::info!("mqtt publisher dropped {} frames", mqtt.dropped());
                mqtt.shutdown();
            }
            Err(_) => log::warn!("mqtt publisher still referenced at shutdown"),
        }
    }
    Ok(())
}
