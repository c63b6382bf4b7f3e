//! Raw RGB24 file source.
//!
//! The file is a plain concatenation of `width * height * 3` byte frames with
//! no header. A trailing partial frame is ignored.

use anyhow::{anyhow, Context, Result};
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};

use super::FrameSource;
use crate::frame::{frame_byte_len, Frame};

pub struct RawFileSource {
    path: PathBuf,
    width: u32,
    height: u32,
    reader: Option<BufReader<File>>,
    frame_count: u64,
    healthy: bool,
    exhausted: bool,
}

impl RawFileSource {
    pub fn new(path: &str, width: u32, height: u32) -> Result<Self> {
        if path.trim().is_empty() {
            return Err(anyhow!("raw file source needs a path"));
        }
        if width == 0 || height == 0 {
            return Err(anyhow!("raw file source needs non-zero dimensions"));
        }
        Ok(Self {
            path: PathBuf::from(path),
            width,
            height,
            reader: None,
            frame_count: 0,
            healthy: false,
            exhausted: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Fill `buf` completely. Returns the bytes read before EOF.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

impl FrameSource for RawFileSource {
    fn connect(&mut self) -> Result<()> {
        let file = File::open(&self.path)
            .with_context(|| format!("open raw frame file {}", self.path.display()))?;
        let len = file.metadata().map(|m| m.len()).unwrap_or(0);
        let frame_len = frame_byte_len(self.width, self.height) as u64;
        log::info!(
            "RawFileSource: opened {} ({} frames of {}x{})",
            self.path.display(),
            len / frame_len.max(1),
            self.width,
            self.height
        );
        self.reader = Some(BufReader::new(file));
        self.healthy = true;
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.exhausted {
            return Ok(None);
        }
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| anyhow!("raw file source {} is not connected", self.path.display()))?;
        let mut pixels = vec![0u8; frame_byte_len(self.width, self.height)];
        let read = match read_full(reader, &mut pixels) {
            Ok(read) => read,
            Err(e) => {
                self.healthy = false;
                return Err(anyhow!("read {}: {}", self.path.display(), e));
            }
        };
        if read < pixels.len() {
            if read > 0 {
                log::warn!(
                    "RawFileSource: ignoring {} trailing bytes in {}",
                    read,
                    self.path.display()
                );
            }
            self.reader = None;
            self.exhausted = true;
            return Ok(None);
        }
        self.frame_count += 1;
        Ok(Some(Frame::new(
            pixels,
            self.width,
            self.height,
            self.frame_count,
        )?))
    }

    fn is_healthy(&self) -> bool {
        self.healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn reads_whole_frames_until_eof() {
        let mut file = NamedTempFile::new().unwrap();
        let frame_len = frame_byte_len(4, 2);
        file.write_all(&vec![1u8; frame_len]).unwrap();
        file.write_all(&vec![2u8; frame_len]).unwrap();
        file.write_all(&[9u8; 5]).unwrap();
        file.flush().unwrap();

        let mut source = RawFileSource::new(file.path().to_str().unwrap(), 4, 2).unwrap();
        assert!(source.next_frame().is_err());
        source.connect().unwrap();
        let first = source.next_frame().unwrap().unwrap();
        let second = source.next_frame().unwrap().unwrap();
        assert_eq!((first.sequence, first.pixels()[0]), (1, 1));
        assert_eq!((second.sequence, second.pixels()[0]), (2, 2));
        assert!(source.next_frame().unwrap().is_none());
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn missing_file_fails_to_connect() {
        let mut source = RawFileSource::new("/nonexistent/frames.rgb", 4, 2).unwrap();
        assert!(source.connect().is_err());
        assert!(!source.is_healthy());
    }
}
