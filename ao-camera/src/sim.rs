//! Simulated Shack-Hartmann camera.
//!
//! Renders one Gaussian spot per lenslet cell, displaced by the sum of
//! a mirror contribution (fed back from the simulated correctors) and a
//! static "atmosphere" offset, so calibration and closed-loop behaviour
//! can be exercised without hardware.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use ao_frame::Frame;

use crate::{Error, FrameSource, Result};

/// Shared optical state of the simulated rig.
///
/// The simulated tip-tilt stage writes the mirror shift; the simulated
/// camera reads it on every frame. Tests inject a wavefront error
/// through the atmosphere offset.
#[derive(Clone, Default)]
pub struct SimRig {
    inner: Arc<Mutex<RigState>>,
}

#[derive(Debug, Default)]
struct RigState {
    /// Spot shift contributed by the correctors, pixels.
    mirror: (f32, f32),
    /// Spot shift contributed by the incoming wavefront, pixels.
    atmosphere: (f32, f32),
}

impl SimRig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_mirror(&self, dx: f32, dy: f32) {
        self.inner.lock().unwrap().mirror = (dx, dy);
    }

    pub fn set_atmosphere(&self, dx: f32, dy: f32) {
        self.inner.lock().unwrap().atmosphere = (dx, dy);
    }

    pub fn mirror(&self) -> (f32, f32) {
        self.inner.lock().unwrap().mirror
    }

    /// Net spot displacement seen by the sensor.
    pub fn total_shift(&self) -> (f32, f32) {
        let st = self.inner.lock().unwrap();
        (st.mirror.0 + st.atmosphere.0, st.mirror.1 + st.atmosphere.1)
    }
}

#[derive(Debug, Clone)]
pub struct SimCameraConfig {
    pub width: u32,
    pub height: u32,
    /// Lenslet grid; one spot is rendered per cell.
    pub cells: (u32, u32),
    /// Gaussian spot sigma in pixels.
    pub sigma: f32,
    /// Peak spot intensity above background.
    pub peak: f32,
    pub background: u8,
    /// Uniform sensor noise amplitude (0 disables).
    pub noise: u8,
    pub seed: u64,
}

impl Default for SimCameraConfig {
    fn default() -> Self {
        Self {
            width: 256,
            height: 256,
            cells: (8, 8),
            sigma: 3.0,
            peak: 200.0,
            background: 5,
            noise: 0,
            seed: 0xa0,
        }
    }
}

pub struct SimCamera {
    cfg: SimCameraConfig,
    rig: SimRig,
    rng: StdRng,
    started: bool,
}

impl SimCamera {
    pub fn new(cfg: SimCameraConfig, rig: SimRig) -> Self {
        let rng = StdRng::seed_from_u64(cfg.seed);
        Self {
            cfg,
            rig,
            rng,
            started: false,
        }
    }

    fn render(&mut self) -> Frame {
        let cfg = &self.cfg;
        let mut im = Frame::filled(cfg.width, cfg.height, cfg.background);
        let (dx, dy) = self.rig.total_shift();

        let shx = cfg.width / cfg.cells.0;
        let shy = cfg.height / cfg.cells.1;
        let reach = (4.0 * cfg.sigma).ceil() as i32;

        for isy in 0..cfg.cells.1 {
            for isx in 0..cfg.cells.0 {
                let cx = (isx * shx + shx / 2) as f32 + dx;
                let cy = (isy * shy + shy / 2) as f32 + dy;
                let x0 = (cx as i32 - reach).max(0);
                let x1 = (cx as i32 + reach).min(cfg.width as i32 - 1);
                let y0 = (cy as i32 - reach).max(0);
                let y1 = (cy as i32 + reach).min(cfg.height as i32 - 1);
                for y in y0..=y1 {
                    for x in x0..=x1 {
                        let ddx = x as f32 - cx;
                        let ddy = y as f32 - cy;
                        let v = cfg.peak
                            * (-(ddx * ddx + ddy * ddy) / (2.0 * cfg.sigma * cfg.sigma)).exp();
                        let p = im.pixel_mut(x as u32, y as u32);
                        *p = (*p as f32 + v).min(255.0) as u8;
                    }
                }
            }
        }

        if cfg.noise > 0 {
            let noise = cfg.noise;
            for y in 0..cfg.height {
                for x in 0..cfg.width {
                    let n: u8 = self.rng.random_range(0..=noise);
                    let p = im.pixel_mut(x, y);
                    *p = p.saturating_add(n);
                }
            }
        }
        im
    }
}

impl FrameSource for SimCamera {
    fn name(&self) -> &str {
        "sim-shcam"
    }

    fn width(&self) -> u32 {
        self.cfg.width
    }

    fn height(&self) -> u32 {
        self.cfg.height
    }

    fn start(&mut self) -> Result<()> {
        if !self.started {
            debug!("sim camera started");
            self.started = true;
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if self.started {
            debug!("sim camera stopped");
            self.started = false;
        }
        Ok(())
    }

    fn acquire(&mut self, _timeout: Option<Duration>) -> Result<Option<Frame>> {
        if !self.started {
            return Err(Error::NotStarted);
        }
        Ok(Some(self.render()))
    }
}
