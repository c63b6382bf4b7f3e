//! Overlay drawing and JPEG encoding for stream payloads and snapshots.

use anyhow::{anyhow, Result};
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use std::collections::BTreeSet;

use crate::detect::BBox;
use crate::frame::{Frame, RGB_CHANNELS};
use crate::fusion::UnifiedResult;
use crate::rules::Violation;

pub const JPEG_QUALITY: u8 = 80;

const VIOLATING: [u8; 3] = [230, 40, 40];
const COMPLIANT: [u8; 3] = [40, 200, 80];
const LINE_WIDTH: u32 = 2;

#[derive(Clone, Debug)]
pub struct RenderedFrame {
    pub payload: Vec<u8>,
    pub has_overlay: bool,
}

pub fn encode_jpeg(pixels: &[u8], width: u32, height: u32, quality: u8) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality)
        .encode(pixels, width, height, ExtendedColorType::Rgb8)
        .map_err(|e| anyhow!("jpeg encode failed: {}", e))?;
    Ok(out)
}

/// Encode a frame for viewers. With a result, subject boxes are drawn onto a
/// copy of the pixels; the frame itself is never touched.
pub fn render_payload(
    frame: &Frame,
    result: Option<&UnifiedResult>,
    violations: &[Violation],
) -> Result<RenderedFrame> {
    let Some(result) = result else {
        return Ok(RenderedFrame {
            payload: encode_jpeg(frame.pixels(), frame.width, frame.height, JPEG_QUALITY)?,
            has_overlay: false,
        });
    };

    let mut pixels = frame.pixels().to_vec();
    let flagged: BTreeSet<usize> = violations.iter().map(|v| v.subject).collect();
    for (idx, subject) in result.subjects.iter().enumerate() {
        let color = if flagged.contains(&idx) {
            VIOLATING
        } else {
            COMPLIANT
        };
        draw_box(
            &mut pixels,
            frame.width,
            frame.height,
            &subject.detection.bbox,
            color,
        );
    }
    Ok(RenderedFrame {
        payload: encode_jpeg(&pixels, frame.width, frame.height, JPEG_QUALITY)?,
        has_overlay: true,
    })
}

/// Outline `bbox` on a packed RGB24 buffer. Out-of-frame parts are clipped.
pub fn draw_box(pixels: &mut [u8], width: u32, height: u32, bbox: &BBox, color: [u8; 3]) {
    let b = bbox.clamp_to(width, height);
    if b.width() < 1.0 || b.height() < 1.0 {
        return;
    }
    let x1 = b.x1 as u32;
    let y1 = b.y1 as u32;
    let x2 = (b.x2 as u32).min(width).saturating_sub(1);
    let y2 = (b.y2 as u32).min(height).saturating_sub(1);

    let mut put = |x: u32, y: u32| {
        let offset = (y as usize * width as usize + x as usize) * RGB_CHANNELS;
        pixels[offset..offset + RGB_CHANNELS].copy_from_slice(&color);
    };
    for t in 0..LINE_WIDTH {
        for x in x1..=x2 {
            put(x, (y1 + t).min(y2));
            put(x, y2.saturating_sub(t).max(y1));
        }
        for y in y1..=y2 {
            put((x1 + t).min(x2), y);
            put(x2.saturating_sub(t).max(x1), y);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{Capability, Detection, GearKind};
    use crate::frame::frame_byte_len;
    use crate::fusion::Subject;
    use crate::rules::ViolationType;
    use std::collections::BTreeMap;

    fn frame() -> Frame {
        Frame::new(vec![0u8; frame_byte_len(32, 24)], 32, 24, 1).unwrap()
    }

    fn rgb(pixels: &[u8], width: u32, x: u32, y: u32) -> [u8; 3] {
        let o = (y as usize * width as usize + x as usize) * 3;
        [pixels[o], pixels[o + 1], pixels[o + 2]]
    }

    #[test]
    fn box_outline_is_clipped_to_frame() {
        let mut pixels = vec![0u8; frame_byte_len(10, 10)];
        draw_box(&mut pixels, 10, 10, &BBox::new(2.0, 2.0, 40.0, 9.0), VIOLATING);
        assert_eq!(rgb(&pixels, 10, 2, 2), VIOLATING);
        assert_eq!(rgb(&pixels, 10, 9, 8), VIOLATING);
        assert_eq!(rgb(&pixels, 10, 5, 5), [0, 0, 0]);
        assert_eq!(rgb(&pixels, 10, 0, 0), [0, 0, 0]);
    }

    #[test]
    fn raw_frame_has_no_overlay() {
        let rendered = render_payload(&frame(), None, &[]).unwrap();
        assert!(!rendered.has_overlay);
        let decoded = image::load_from_memory(&rendered.payload).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 24));
    }

    #[test]
    fn overlay_leaves_source_frame_untouched() {
        let frame = frame();
        let result = UnifiedResult {
            subjects: vec![Subject {
                detection: Detection::new(
                    Capability::Presence,
                    BBox::new(4.0, 4.0, 20.0, 20.0),
                    0.9,
                ),
                attributes: BTreeMap::new(),
            }],
            ..UnifiedResult::default()
        };
        let violations = vec![Violation {
            violation_type: ViolationType::MissingGear(GearKind::Mask),
            subject: 0,
            severity: 0.7,
            confidence: 0.8,
            timestamp_ms: 0,
        }];
        let rendered = render_payload(&frame, Some(&result), &violations).unwrap();
        assert!(rendered.has_overlay);
        assert!(frame.pixels().iter().all(|p| *p == 0));
    }
}
