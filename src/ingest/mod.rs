//! Frame sources.
//!
//! - `stub://<name>`: synthetic scene, for demos and tests
//! - `file://<path>` or a bare path: raw packed RGB24 frames, back to back
//!
//! Sources number frames from 1 and never reorder them.

use anyhow::{anyhow, Result};
use std::time::{Duration, Instant};

use crate::frame::Frame;

pub mod raw_file;
pub mod synthetic;

pub use raw_file::RawFileSource;
pub use synthetic::SyntheticSource;

pub trait FrameSource: Send {
    fn connect(&mut self) -> Result<()>;

    /// `Ok(None)` means the source is exhausted.
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    fn is_healthy(&self) -> bool;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn connect(&mut self) -> Result<()> {
        (**self).connect()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        (**self).next_frame()
    }

    fn is_healthy(&self) -> bool {
        (**self).is_healthy()
    }
}

pub fn open_source(url: &str, width: u32, height: u32) -> Result<Box<dyn FrameSource>> {
    if let Some(name) = url.strip_prefix("stub://") {
        return Ok(Box::new(SyntheticSource::new(name, width, height)));
    }
    let path = url.strip_prefix("file://").unwrap_or(url);
    if path.contains("://") {
        return Err(anyhow!(
            "unsupported source {}: expected stub://<name> or a raw RGB24 file path",
            url
        ));
    }
    Ok(Box::new(RawFileSource::new(path, width, height)?))
}

/// Holds a loop to a target frame rate. A rate of zero disables pacing.
#[derive(Debug)]
pub struct Pacer {
    interval: Option<Duration>,
    next: Option<Instant>,
}

impl Pacer {
    pub fn new(target_fps: u32) -> Self {
        let interval = (target_fps > 0).then(|| Duration::from_secs(1) / target_fps);
        Self {
            interval,
            next: None,
        }
    }

    pub fn unpaced() -> Self {
        Self::new(0)
    }

    /// Sleep until the next frame slot. A loop running behind does not try to
    /// catch up with a burst.
    pub fn wait(&mut self) {
        let Some(interval) = self.interval else {
            return;
        };
        let now = Instant::now();
        if let Some(next) = self.next {
            if next > now {
                std::thread::sleep(next - now);
            }
        }
        let base = self.next.map_or(now, |next| next.max(now));
        self.next = Some(base + interval);
    }
}
