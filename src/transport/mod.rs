//! Broker transport for stream frames and stats snapshots.
//!
//! `codec` owns the wire format and topic layout; `mqtt` owns the client
//! plumbing on both ends.

pub mod codec;
pub mod mqtt;

pub use codec::{decode_frame, encode_frame, frames_topic, parse_topic, stats_topic, TopicKind};
pub use mqtt::{
    parse_mqtt_endpoint, MqttEndpoint, MqttSettings, MqttStreamPublisher, MqttStreamRelay,
    DEFAULT_MQTT_ADDR, DEFAULT_TOPIC_PREFIX,
};
