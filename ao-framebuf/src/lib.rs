//! Raw frame buffering.
//!
//! The loop can be asked to capture the next N raw frames
//! (`saveimg N` on the control channel). Frames are pushed into a
//! [FrameRing] while the loop runs and dumped to numbered PGM files
//! when the countdown expires, so buffering never blocks the hot path
//! on disk I/O.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use ao_frame::Frame;

pub mod pgm;

pub type Result<M> = std::result::Result<M, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("frame is {got_w}x{got_h}, buffer holds {want_w}x{want_h}")]
    SizeMismatch {
        got_w: u32,
        got_h: u32,
        want_w: u32,
        want_h: u32,
    },
    #[error("io error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

/// Fixed-capacity raw frame buffer that grows in configured increments
/// while memory allows.
///
/// Byte usage and frame count are tracked independently: the byte
/// budget drives growth, the frame count numbers the dumped files.
/// When growth fails the buffer disables itself and drops frames
/// instead of stalling the loop.
pub struct FrameRing {
    frames: VecDeque<Frame>,
    /// Frame geometry, fixed by the first push.
    size: Option<(u32, u32)>,
    /// Bytes currently buffered.
    used: usize,
    /// Frames currently buffered.
    imgused: usize,
    /// Bytes the ring may hold before attempting to grow.
    capacity: usize,
    /// Growth increment in bytes.
    grow: usize,
    /// Hard ceiling; growth beyond this is refused.
    max_capacity: Option<usize>,
    enabled: bool,
    /// Monotonic counter numbering dumped frames across dumps.
    captured: u64,
}

impl FrameRing {
    pub fn new(initial_capacity: usize, grow: usize, max_capacity: Option<usize>) -> Self {
        Self {
            frames: VecDeque::new(),
            size: None,
            used: 0,
            imgused: 0,
            capacity: initial_capacity,
            grow,
            max_capacity,
            enabled: true,
            captured: 0,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Frames currently buffered.
    pub fn imgused(&self) -> usize {
        self.imgused
    }

    /// Bytes currently buffered.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Total frames written to disk over the buffer's lifetime.
    pub fn captured(&self) -> u64 {
        self.captured
    }

    /// Buffer one frame. Disabled buffers drop silently; a frame of
    /// the wrong geometry is rejected.
    pub fn push(&mut self, frame: Frame) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let fsize = (frame.width(), frame.height());
        match self.size {
            None => self.size = Some(fsize),
            Some(want) if want != fsize => {
                return Err(Error::SizeMismatch {
                    got_w: fsize.0,
                    got_h: fsize.1,
                    want_w: want.0,
                    want_h: want.1,
                });
            }
            Some(_) => {}
        }

        let bytes = frame.byte_len();
        if self.capacity - self.used < bytes {
            let want = self.capacity + self.grow;
            let over_max = self.max_capacity.map(|m| want > m).unwrap_or(false);
            if over_max || self.frames.try_reserve(1).is_err() {
                warn!("frame buffer growth failed, buffering disabled");
                self.enabled = false;
                return Ok(());
            }
            info!("frame buffer grown to {} bytes", want);
            self.capacity = want;
        }

        self.used += bytes;
        self.imgused += 1;
        self.frames.push_back(frame);
        Ok(())
    }

    /// Write every buffered frame to `<prefix>-bufdump-NNNNN.pgm` and
    /// reset the usage counters. Files that fail to write are counted
    /// and reported; the rest still land on disk.
    pub fn dump(&mut self, prefix: &Path) -> Result<Vec<PathBuf>> {
        info!("writing {} buffered frames to disk", self.imgused);
        let mut written = Vec::with_capacity(self.frames.len());
        let mut failed = 0usize;
        while let Some(frame) = self.frames.pop_front() {
            let path = dump_path(prefix, self.captured);
            match pgm::write_binary(&path, &frame) {
                Ok(()) => {
                    self.captured += 1;
                    written.push(path);
                }
                Err(e) => {
                    warn!("could not write {}: {}", path.display(), e);
                    failed += 1;
                }
            }
        }
        if failed > 0 {
            warn!("wrote {} of {} frames", written.len(), written.len() + failed);
        } else {
            info!("buffer written to disk");
        }
        self.used = 0;
        self.imgused = 0;
        Ok(written)
    }
}

fn dump_path(prefix: &Path, seq: u64) -> PathBuf {
    let stem = prefix
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let name = format!("{}-bufdump-{:05}.pgm", stem, seq);
    match prefix.parent() {
        Some(dir) => dir.join(name),
        None => PathBuf::from(name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(v: u8) -> Frame {
        Frame::filled(16, 16, v)
    }

    #[test]
    fn push_accounts_bytes_and_frames() {
        let mut ring = FrameRing::new(1024, 512, None);
        ring.push(frame(1)).unwrap();
        ring.push(frame(2)).unwrap();
        assert_eq!(ring.imgused(), 2);
        assert_eq!(ring.used(), 512);
    }

    #[test]
    fn mismatched_resolution_rejected() {
        let mut ring = FrameRing::new(4096, 512, None);
        ring.push(frame(1)).unwrap();
        let other = Frame::filled(8, 8, 0);
        assert!(matches!(
            ring.push(other),
            Err(Error::SizeMismatch { .. })
        ));
    }

    #[test]
    fn growth_failure_disables_without_error() {
        // capacity for 2 frames and no headroom to grow
        let mut ring = FrameRing::new(512, 256, Some(512));
        ring.push(frame(1)).unwrap();
        ring.push(frame(2)).unwrap();
        assert!(ring.enabled());
        ring.push(frame(3)).unwrap();
        assert!(!ring.enabled());
        assert_eq!(ring.imgused(), 2);
        // further pushes are silent no-ops
        ring.push(frame(4)).unwrap();
        assert_eq!(ring.imgused(), 2);
    }

    #[test]
    fn growth_extends_capacity() {
        let mut ring = FrameRing::new(256, 256, Some(2048));
        for i in 0..4 {
            ring.push(frame(i)).unwrap();
        }
        assert!(ring.enabled());
        assert_eq!(ring.imgused(), 4);
    }

    #[test]
    fn dump_numbers_monotonically() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("ao");
        let mut ring = FrameRing::new(4096, 1024, None);

        ring.push(frame(9)).unwrap();
        ring.push(frame(10)).unwrap();
        let first = ring.dump(&prefix).unwrap();
        assert_eq!(first.len(), 2);
        assert!(first[0].ends_with("ao-bufdump-00000.pgm"));
        assert!(first[1].ends_with("ao-bufdump-00001.pgm"));
        assert_eq!(ring.imgused(), 0);
        assert_eq!(ring.used(), 0);

        // numbering continues across dumps
        ring.push(frame(11)).unwrap();
        let second = ring.dump(&prefix).unwrap();
        assert!(second[0].ends_with("ao-bufdump-00002.pgm"));
        assert_eq!(ring.captured(), 3);

        for p in first.iter().chain(second.iter()) {
            assert!(p.exists());
        }
    }
}
