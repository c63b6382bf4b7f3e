//! Captured frames.
//!
//! A `Frame` is produced once by a frame source and never mutated after that.
//! Pixel bytes live behind an `Arc` so provider worker threads, the persistence
//! worker and the overlay renderer can all read the same buffer without copying.
//!
//! Layout is packed RGB24, row-major, no padding.

use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Bytes per pixel for packed RGB24.
pub const RGB_CHANNELS: usize = 3;

#[derive(Clone, Debug)]
pub struct Frame {
    pixels: Arc<[u8]>,
    pub width: u32,
    pub height: u32,
    /// Monotonically increasing per source. Viewers use it to detect gaps.
    pub sequence: u64,
    pub captured_at: SystemTime,
}

impl Frame {
    /// Create a frame captured now.
    pub fn new(pixels: Vec<u8>, width: u32, height: u32, sequence: u64) -> Result<Self> {
        Self::with_capture_time(pixels, width, height, sequence, SystemTime::now())
    }

    pub fn with_capture_time(
        pixels: Vec<u8>,
        width: u32,
        height: u32,
        sequence: u64,
        captured_at: SystemTime,
    ) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(anyhow!("frame dimensions must be non-zero"));
        }
        let expected = frame_byte_len(width, height);
        if pixels.len() != expected {
            return Err(anyhow!(
                "frame {} has {} bytes, expected {} for {}x{} RGB24",
                sequence,
                pixels.len(),
                expected,
                width,
                height
            ));
        }
        Ok(Self {
            pixels: pixels.into(),
            width,
            height,
            sequence,
            captured_at,
        })
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn byte_len(&self) -> usize {
        self.pixels.len()
    }

    /// RGB triple at (x, y). Coordinates are clamped to the frame.
    pub fn rgb_at(&self, x: u32, y: u32) -> [u8; 3] {
        let x = x.min(self.width - 1) as usize;
        let y = y.min(self.height - 1) as usize;
        let offset = (y * self.width as usize + x) * RGB_CHANNELS;
        [
            self.pixels[offset],
            self.pixels[offset + 1],
            self.pixels[offset + 2],
        ]
    }

    /// Integer BT.601 luma at (x, y).
    pub fn luma_at(&self, x: u32, y: u32) -> u8 {
        let [r, g, b] = self.rgb_at(x, y);
        ((77 * r as u32 + 150 * g as u32 + 29 * b as u32) >> 8) as u8
    }

    /// Capture time in milliseconds since the Unix epoch (0 if the clock is before it).
    pub fn captured_at_ms(&self) -> u64 {
        self.captured_at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

pub fn frame_byte_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * RGB_CHANNELS
}
