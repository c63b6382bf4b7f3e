//! Broker leg of the distribution path.
//!
//! The detection daemon publishes encoded stream frames and stats snapshots;
//! the relay subscribes and republishes them into its local `FanOut`.

use anyhow::{anyhow, Context, Result};
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, Incoming, MqttOptions};
use rumqttc::Transport;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use super::codec::{decode_frame, encode_frame, frames_topic, parse_topic, stats_topic, TopicKind};
use crate::fanout::{FanOut, StreamFrame, StreamPublisher};
use crate::stats::{StatsBoard, StatsSink, StatsSnapshot};

pub const DEFAULT_MQTT_ADDR: &str = "127.0.0.1:1883";
pub const DEFAULT_TOPIC_PREFIX: &str = "watchpost";
pub const DEFAULT_MAX_PACKET_BYTES: u32 = 4 * 1024 * 1024;
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

const REQUEST_QUEUE: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

/// Accepts `host:port`, `[v6]:port`, and the `mqtt://`, `tcp://`,
/// `mqtts://` and `ssl://` schemes.
pub fn parse_mqtt_endpoint(addr: &str) -> Result<MqttEndpoint> {
    let mut use_tls = false;
    let mut remainder = addr.trim();

    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            "mqtts" | "ssl" => use_tls = true,
            other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
        }
        remainder = rest;
    }

    let (host, port) = split_host_port(remainder)?;
    if host.is_empty() {
        return Err(anyhow!("missing MQTT host in {}", addr));
    }
    Ok(MqttEndpoint {
        host,
        port,
        use_tls,
    })
}

fn split_host_port(addr: &str) -> Result<(String, u16)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid MQTT address: {}", addr))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
        let port: u16 = port
            .parse()
            .with_context(|| format!("invalid MQTT port in {}", addr))?;
        return Ok((host.to_string(), port));
    }

    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid MQTT port in {}", addr))?;
    Ok((host.to_string(), port))
}

#[derive(Clone, Debug)]
pub struct MqttSettings {
    pub addr: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic_prefix: String,
    pub max_packet_bytes: u32,
}

impl MqttSettings {
    pub fn new(addr: &str, client_id: &str, topic_prefix: &str) -> Self {
        Self {
            addr: addr.to_string(),
            client_id: client_id.to_string(),
            username: None,
            password: None,
            topic_prefix: topic_prefix.to_string(),
            max_packet_bytes: DEFAULT_MAX_PACKET_BYTES,
        }
    }
}

fn connect_mqtt(settings: &MqttSettings) -> Result<(Client, Connection)> {
    let endpoint = parse_mqtt_endpoint(&settings.addr)?;
    let mut options = MqttOptions::new(&settings.client_id, &endpoint.host, endpoint.port);
    options.set_keep_alive(Duration::from_secs(30));
    options.set_clean_start(true);
    options.set_max_packet_size(Some(settings.max_packet_bytes));
    if let Some(user) = settings.username.as_deref() {
        options.set_credentials(user, settings.password.clone().unwrap_or_default());
    }
    if endpoint.use_tls {
        options.set_transport(Transport::tls_with_default_config());
    }

    let (client, connection) = Client::new(options, REQUEST_QUEUE);
    log::info!(
        "mqtt client {} -> {}:{} (TLS: {}, auth: {})",
        settings.client_id,
        endpoint.host,
        endpoint.port,
        endpoint.use_tls,
        settings.username.is_some()
    );
    Ok((client, connection))
}

/// Publishes stream frames (QoS 0) and stats (QoS 1, retained).
///
/// Publishing only enqueues into the client's request queue; when that queue
/// is full the frame is dropped and counted.
pub struct MqttStreamPublisher {
    client: Client,
    prefix: String,
    dropped: AtomicU64,
    stop: Arc<AtomicBool>,
    event_loop: Option<JoinHandle<()>>,
}

impl MqttStreamPublisher {
    pub fn connect(settings: &MqttSettings) -> Result<Self> {
        let (client, mut connection) = connect_mqtt(settings)?;
        let stop = Arc::new(AtomicBool::new(false));
        let loop_stop = stop.clone();
        let event_loop = std::thread::Builder::new()
            .name("mqtt-publisher".to_string())
            .spawn(move || {
                // The iterator reconnects on the next poll after an error.
                for event in connection.iter() {
                    if loop_stop.load(Ordering::SeqCst) {
                        break;
                    }
                    match event {
                        Ok(Event::Incoming(_)) | Ok(Event::Outgoing(_)) => {}
                        Err(e) => {
                            log::warn!("mqtt publisher connection error: {}", e);
                            std::thread::sleep(RECONNECT_DELAY);
                        }
                    }
                }
            })?;
        Ok(Self {
            client,
            prefix: settings.topic_prefix.clone(),
            dropped: AtomicU64::new(0),
            stop,
            event_loop: Some(event_loop),
        })
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Err(e) = self.client.disconnect() {
            log::debug!("mqtt disconnect: {}", e);
        }
        if let Some(handle) = self.event_loop.take() {
            let _ = handle.join();
        }
    }
}

impl StreamPublisher for MqttStreamPublisher {
    fn publish(&self, frame: StreamFrame) -> bool {
        let bytes = match encode_frame(&frame) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("camera {}: {}", frame.camera_id, e);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        };
        let topic = frames_topic(&self.prefix, &frame.camera_id);
        match self.client.try_publish(topic, QoS::AtMostOnce, false, bytes) {
            Ok(()) => true,
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "camera {}: stream frame {} dropped: {}",
                    frame.camera_id,
                    frame.sequence,
                    e
                );
                false
            }
        }
    }
}

impl StatsSink for MqttStreamPublisher {
    fn emit(&self, snapshot: &StatsSnapshot) {
        let payload = match serde_json::to_vec(snapshot) {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("camera {}: stats encoding failed: {}", snapshot.camera_id, e);
                return;
            }
        };
        let topic = stats_topic(&self.prefix, &snapshot.camera_id);
        if let Err(e) = self
            .client
            .try_publish(topic, QoS::AtLeastOnce, true, payload)
        {
            log::warn!("camera {}: stats publish failed: {}", snapshot.camera_id, e);
        }
    }
}

/// Feeds broker messages into a local fan-out and stats board.
pub struct MqttStreamRelay {
    settings: MqttSettings,
    fanout: Arc<FanOut>,
    board: Arc<StatsBoard>,
    stop: Arc<AtomicBool>,
    client: Mutex<Option<Client>>,
    reconnect_delay: Duration,
}

impl MqttStreamRelay {
    pub fn new(settings: MqttSettings, fanout: Arc<FanOut>, board: Arc<StatsBoard>) -> Self {
        Self {
            settings,
            fanout,
            board,
            stop: Arc::new(AtomicBool::new(false)),
            client: Mutex::new(None),
            reconnect_delay: RECONNECT_DELAY,
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let client = self
            .client
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(client) = client {
            let _ = client.disconnect();
        }
    }

    /// Subscribe and relay until `stop` is called. Reconnects after errors,
    /// including a failed subscribe. Only an unusable broker address is fatal.
    pub fn run(&self) -> Result<()> {
        while !self.stop.load(Ordering::SeqCst) {
            let (client, mut connection) = connect_mqtt(&self.settings)?;
            if let Err(e) = self.subscribe_streams(&client) {
                log::error!("relay subscribe failed: {:#}. Reconnecting...", e);
                self.wait_before_reconnect();
                continue;
            }
            *self
                .client
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(client);

            for event in connection.iter() {
                if self.stop.load(Ordering::SeqCst) {
                    break;
                }
                match event {
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        let topic = match std::str::from_utf8(&publish.topic) {
                            Ok(topic) => topic,
                            Err(e) => {
                                log::warn!("skipping publish with invalid topic: {}", e);
                                continue;
                            }
                        };
                        if let Err(e) = self.handle_message(topic, &publish.payload) {
                            log::warn!("relay: {}: {}", topic, e);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::error!("relay connection error: {}. Reconnecting...", e);
                        break;
                    }
                }
            }
            self.wait_before_reconnect();
        }
        Ok(())
    }

    fn subscribe_streams(&self, client: &Client) -> Result<()> {
        let frames_filter = format!("{}/+/frames", self.settings.topic_prefix);
        let stats_filter = format!("{}/+/stats", self.settings.topic_prefix);
        client
            .subscribe(&frames_filter, QoS::AtMostOnce)
            .with_context(|| format!("subscribe {}", frames_filter))?;
        client
            .subscribe(&stats_filter, QoS::AtLeastOnce)
            .with_context(|| format!("subscribe {}", stats_filter))?;
        log::info!("relay subscribed to {} and {}", frames_filter, stats_filter);
        Ok(())
    }

    fn wait_before_reconnect(&self) {
        let step = Duration::from_millis(100);
        let mut waited = Duration::ZERO;
        while waited < self.reconnect_delay && !self.stop.load(Ordering::SeqCst) {
            std::thread::sleep(step);
            waited += step;
        }
    }

    /// Route one broker message. Exposed so the routing can run without a broker.
    pub fn handle_message(&self, topic: &str, payload: &[u8]) -> Result<()> {
        let (camera_id, kind) = parse_topic(&self.settings.topic_prefix, topic)
            .ok_or_else(|| anyhow!("unexpected topic"))?;
        match kind {
            TopicKind::Frames => {
                let frame = decode_frame(payload)?;
                if frame.camera_id != camera_id {
                    return Err(anyhow!(
                        "frame for camera {} published on topic of {}",
                        frame.camera_id,
                        camera_id
                    ));
                }
                // A restarted producer counts from 1 again. Existing viewers are
                // ended so every subscription stays strictly increasing.
                if let Some(latest) = self.fanout.latest(camera_id) {
                    if frame.sequence <= latest.sequence {
                        log::info!(
                            "camera {}: stream restarted at {} (was {}), resetting viewers",
                            camera_id,
                            frame.sequence,
                            latest.sequence
                        );
                        self.fanout.close_camera(camera_id);
                    }
                }
                self.fanout.publish(frame);
            }
            TopicKind::Stats => {
                let snapshot: StatsSnapshot = serde_json::from_slice(payload)
                    .map_err(|e| anyhow!("invalid stats snapshot: {}", e))?;
                if snapshot.camera_id != camera_id {
                    return Err(anyhow!("stats camera id does not match topic"));
                }
                self.board.update(snapshot);
            }
        }
        Ok(())
    }
}
