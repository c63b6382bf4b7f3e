//! Synthetic source (`stub://`).
//!
//! Draws a static per-scene gradient with a marker block that steps every
//! `MARKER_STEP` frames. The scene itself changes every `SCENE_PERIOD` frames,
//! so runs of identical frames exercise the result cache.

use anyhow::Result;

use super::FrameSource;
use crate::frame::{frame_byte_len, Frame, RGB_CHANNELS};

const SCENE_PERIOD: u64 = 50;
const MARKER_STEP: u64 = 10;
const MARKER_SIZE: u32 = 24;

pub struct SyntheticSource {
    name: String,
    width: u32,
    height: u32,
    frame_count: u64,
    scene_state: u8,
    limit: Option<u64>,
}

impl SyntheticSource {
    pub fn new(name: &str, width: u32, height: u32) -> Self {
        Self {
            name: name.to_string(),
            width,
            height,
            frame_count: 0,
            scene_state: 0,
            limit: None,
        }
    }

    /// Stop after `frames` frames.
    pub fn with_limit(mut self, frames: u64) -> Self {
        self.limit = Some(frames);
        self
    }

    pub fn frames_generated(&self) -> u64 {
        self.frame_count
    }

    fn render(&self) -> Vec<u8> {
        let mut pixels = vec![0u8; frame_byte_len(self.width, self.height)];
        let shift = self.scene_state as u32 * 37;
        for y in 0..self.height {
            for x in 0..self.width {
                let i = (y as usize * self.width as usize + x as usize) * RGB_CHANNELS;
                pixels[i] = ((x + shift) % 256) as u8;
                pixels[i + 1] = ((y + shift) % 256) as u8;
                pixels[i + 2] = ((x + y) / 2 % 256) as u8;
            }
        }

        let travel = self.width.saturating_sub(MARKER_SIZE).max(1);
        let step = self.frame_count / MARKER_STEP;
        let x0 = (step.wrapping_mul(MARKER_SIZE as u64) % travel as u64) as u32;
        let y0 = self.height.saturating_sub(MARKER_SIZE) / 2;
        for y in y0..(y0 + MARKER_SIZE).min(self.height) {
            for x in x0..(x0 + MARKER_SIZE).min(self.width) {
                let i = (y as usize * self.width as usize + x as usize) * RGB_CHANNELS;
                pixels[i..i + RGB_CHANNELS].copy_from_slice(&[255, 255, 255]);
            }
        }
        pixels
    }
}

impl FrameSource for SyntheticSource {
    fn connect(&mut self) -> Result<()> {
        log::info!(
            "SyntheticSource: connected to stub://{} ({}x{})",
            self.name,
            self.width,
            self.height
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.limit.is_some_and(|limit| self.frame_count >= limit) {
            return Ok(None);
        }
        self.frame_count += 1;
        if self.frame_count % SCENE_PERIOD == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        let pixels = self.render();
        Ok(Some(Frame::new(
            pixels,
            self.width,
            self.height,
            self.frame_count,
        )?))
    }

    fn is_healthy(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::perceptual_key;

    #[test]
    fn sequences_start_at_one_and_stop_at_limit() {
        let mut source = SyntheticSource::new("t", 64, 48).with_limit(3);
        let seqs: Vec<u64> = std::iter::from_fn(|| source.next_frame().unwrap())
            .map(|f| f.sequence)
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn frames_repeat_between_marker_steps() {
        let mut source = SyntheticSource::new("t", 128, 64);
        let frames: Vec<Frame> = (0..12)
            .map(|_| source.next_frame().unwrap().unwrap())
            .collect();
        // Frames 1..=9 share a marker position; frame 10 moves it.
        assert_eq!(perceptual_key(&frames[1]), perceptual_key(&frames[5]));
        assert_eq!(frames[1].pixels(), frames[5].pixels());
        assert_ne!(frames[1].pixels(), frames[10].pixels());
    }

    #[test]
    fn marker_position_survives_very_long_runs() {
        let mut source = SyntheticSource::new("t", 64, 48);
        source.frame_count = 20_000_000_000;
        let frame = source.next_frame().unwrap().unwrap();
        assert_eq!(frame.sequence, 20_000_000_001);

        source.frame_count = u64::MAX - 1;
        assert_eq!(source.next_frame().unwrap().unwrap().sequence, u64::MAX);
    }
}
