//! Binary framing for stream frames on the broker.
//!
//! ```text
//! offset  size  field
//! 0       4     magic "WPSF"
//! 4       1     version (1)
//! 5       1     flags (bit 0: overlay present)
//! 6       8     sequence, big-endian
//! 14      2     camera id length, big-endian
//! 16      n     camera id, UTF-8
//! 16+n    ...   payload (JPEG)
//! ```

use anyhow::{anyhow, Result};

use crate::fanout::StreamFrame;

pub const MAGIC: &[u8; 4] = b"WPSF";
pub const VERSION: u8 = 1;
pub const HEADER_LEN: usize = 16;

const FLAG_OVERLAY: u8 = 0b0000_0001;

pub fn encode_frame(frame: &StreamFrame) -> Result<Vec<u8>> {
    let id = frame.camera_id.as_bytes();
    let id_len = u16::try_from(id.len())
        .map_err(|_| anyhow!("camera id too long for stream header"))?;
    let mut out = Vec::with_capacity(HEADER_LEN + id.len() + frame.payload.len());
    out.extend_from_slice(MAGIC);
    out.push(VERSION);
    out.push(if frame.has_overlay { FLAG_OVERLAY } else { 0 });
    out.extend_from_slice(&frame.sequence.to_be_bytes());
    out.extend_from_slice(&id_len.to_be_bytes());
    out.extend_from_slice(id);
    out.extend_from_slice(&frame.payload);
    Ok(out)
}

pub fn decode_frame(bytes: &[u8]) -> Result<StreamFrame> {
    if bytes.len() < HEADER_LEN {
        return Err(anyhow!(
            "stream message truncated: {} bytes, header needs {}",
            bytes.len(),
            HEADER_LEN
        ));
    }
    if &bytes[0..4] != MAGIC {
        return Err(anyhow!("not a stream frame (bad magic)"));
    }
    if bytes[4] != VERSION {
        return Err(anyhow!("unsupported stream frame version {}", bytes[4]));
    }
    let flags = bytes[5];
    if flags & !FLAG_OVERLAY != 0 {
        return Err(anyhow!("unknown stream frame flags {:#04x}", flags));
    }
    let mut seq = [0u8; 8];
    seq.copy_from_slice(&bytes[6..14]);
    let id_len = u16::from_be_bytes([bytes[14], bytes[15]]) as usize;
    let id_end = HEADER_LEN + id_len;
    if bytes.len() < id_end {
        return Err(anyhow!("stream message truncated inside camera id"));
    }
    let camera_id = std::str::from_utf8(&bytes[HEADER_LEN..id_end])
        .map_err(|_| anyhow!("camera id is not UTF-8"))?;
    if camera_id.is_empty() {
        return Err(anyhow!("stream frame has an empty camera id"));
    }
    Ok(StreamFrame {
        camera_id: camera_id.to_string(),
        sequence: u64::from_be_bytes(seq),
        payload: bytes[id_end..].into(),
        has_overlay: flags & FLAG_OVERLAY != 0,
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TopicKind {
    Frames,
    Stats,
}

pub fn frames_topic(prefix: &str, camera_id: &str) -> String {
    format!("{}/{}/frames", prefix, camera_id)
}

pub fn stats_topic(prefix: &str, camera_id: &str) -> String {
    format!("{}/{}/stats", prefix, camera_id)
}

/// Split `<prefix>/<camera>/<kind>` into camera id and kind.
pub fn parse_topic<'a>(prefix: &str, topic: &'a str) -> Option<(&'a str, TopicKind)> {
    let rest = topic.strip_prefix(prefix)?.strip_prefix('/')?;
    let (camera, kind) = rest.split_once('/')?;
    if camera.is_empty() {
        return None;
    }
    match kind {
        "frames" => Some((camera, TopicKind::Frames)),
        "stats" => Some((camera, TopicKind::Stats)),
        _ => None,
    }
}
