//! stream_relay - serve live viewers from the broker
//!
//! Subscribes to every camera's frames and stats topics, republishes frames
//! into a local fan-out and serves viewers over HTTP. Runs independently of
//! the detection daemon; either side may restart.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::sync::Arc;

use watchpost::api::{ViewerConfig, ViewerServer, DEFAULT_MAX_VIEWERS, DEFAULT_VIEWER_ADDR};
use watchpost::fanout::DEFAULT_VIEWER_QUEUE;
use watchpost::stats::StatsBoard;
use watchpost::transport::{MqttSettings, MqttStreamRelay, DEFAULT_MQTT_ADDR, DEFAULT_TOPIC_PREFIX};
use watchpost::FanOut;

#[derive(Parser, Debug)]
#[command(author, version, about = "Relay Watchpost streams from MQTT to HTTP viewers")]
struct Args {
    /// MQTT broker address (host:port, or mqtts://host:port for TLS).
    #[arg(long, env = "WATCHPOST_MQTT_ADDR", default_value = DEFAULT_MQTT_ADDR)]
    mqtt_addr: String,

    #[arg(long, env = "WATCHPOST_TOPIC_PREFIX", default_value = DEFAULT_TOPIC_PREFIX)]
    topic_prefix: String,

    #[arg(long, env = "WATCHPOST_RELAY_CLIENT_ID", default_value = "watchpost-relay")]
    client_id: String,

    #[arg(long, env = "WATCHPOST_MQTT_USERNAME")]
    mqtt_username: Option<String>,

    #[arg(long, env = "WATCHPOST_MQTT_PASSWORD")]
    mqtt_password: Option<String>,

    /// Address the viewer HTTP server listens on.
    #[arg(long, env = "WATCHPOST_VIEWER_ADDR", default_value = DEFAULT_VIEWER_ADDR)]
    viewer_addr: String,

    /// Frames buffered per viewer before the oldest is dropped.
    #[arg(long, default_value_t = DEFAULT_VIEWER_QUEUE)]
    viewer_queue: usize,

    #[arg(long, default_value_t = DEFAULT_MAX_VIEWERS)]
    max_viewers: usize,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    if args.viewer_queue == 0 {
        return Err(anyhow!("--viewer-queue must be at least 1"));
    }

    let fanout = Arc::new(FanOut::new(args.viewer_queue));
    let board = Arc::new(StatsBoard::new());

    let viewer = ViewerServer::new(
        ViewerConfig {
            addr: args.viewer_addr.clone(),
            max_viewers: args.max_viewers,
        },
        fanout.clone(),
        board.clone(),
    )
    .spawn()?;
    log::info!("viewer server listening on {}", viewer.addr);

    let mut settings = MqttSettings::new(&args.mqtt_addr, &args.client_id, &args.topic_prefix);
    settings.username = args.mqtt_username;
    settings.password = args.mqtt_password;
    let relay = Arc::new(MqttStreamRelay::new(settings, fanout.clone(), board));

    let stopper = relay.clone();
    ctrlc::set_handler(move || {
        log::info!("shutdown requested");
        stopper.stop();
    })?;

    let result = relay.run();
    fanout.close_all();
    viewer.stop()?;
    result
}
