//! Frame counting and rate estimation.

use std::time::Instant;

/// Smoothing factor of the FPS estimate.
const FPS_ALPHA: f32 = 0.1;

/// Counts loop iterations and keeps an exponentially weighted moving
/// average of the frame rate.
pub struct FrameClock {
    frames: u64,
    fps: f32,
    last: Option<Instant>,
}

impl FrameClock {
    pub fn new() -> Self {
        Self {
            frames: 0,
            fps: 0.0,
            last: None,
        }
    }

    /// Count one frame; returns the new frame total.
    pub fn tick(&mut self) -> u64 {
        let now = Instant::now();
        if let Some(last) = self.last {
            let dt = now.duration_since(last).as_secs_f32();
            if dt > 0.0 {
                let inst = 1.0 / dt;
                self.fps += FPS_ALPHA * (inst - self.fps);
            }
        }
        self.last = Some(now);
        self.frames += 1;
        self.frames
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn fps(&self) -> f32 {
        self.fps
    }

    /// Gate for periodic log lines: true every `log_fraction` frames.
    pub fn should_log(&self, log_fraction: u32) -> bool {
        log_fraction > 0 && self.frames % log_fraction as u64 == 0
    }
}

impl Default for FrameClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_frames() {
        let mut c = FrameClock::new();
        assert_eq!(c.tick(), 1);
        assert_eq!(c.tick(), 2);
        assert_eq!(c.frames(), 2);
    }

    #[test]
    fn log_gate_follows_fraction() {
        let mut c = FrameClock::new();
        let mut hits = 0;
        for _ in 0..20 {
            c.tick();
            if c.should_log(5) {
                hits += 1;
            }
        }
        assert_eq!(hits, 4);
        // zero fraction disables periodic lines entirely
        assert!(!c.should_log(0));
    }

    #[test]
    fn fps_converges_toward_rate() {
        let mut c = FrameClock::new();
        for _ in 0..50 {
            c.tick();
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        // ~500 Hz nominal; generous bounds, timers are coarse
        assert!(c.fps() > 50.0, "fps = {}", c.fps());
        assert!(c.fps() < 1000.0, "fps = {}", c.fps());
    }
}
