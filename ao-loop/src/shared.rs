//! State shared between the worker thread and the network side.
//!
//! One mutex/condvar pair guards the mode and calibration mode; the
//! server signals the condvar after every mode write and the worker
//! honours the change no later than the top of its next iteration.
//! Everything else the protocol can touch lives in [Tunables] or an
//! atomic.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};

use ao_types::{CalMode, GainField, GainSettings, LoopMode};

/// A request the worker executes on behalf of the network side, since
/// devices and logs are worker-owned.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PendingRequest {
    /// Park all DM electrodes at a voltage (`None` = neutral).
    ResetDm(Option<f64>),
    /// Park the tip-tilt DAC at a voltage (`None` = neutral).
    ResetDaq(Option<f64>),
    /// Enable or disable the measurement logs.
    LogEnable(bool),
    /// Truncate and restart the measurement logs.
    LogReset,
}

#[derive(Debug)]
struct ModeCell {
    mode: LoopMode,
    calmode: CalMode,
}

/// Parameters the protocol can change while the loop runs.
#[derive(Debug, Clone)]
pub struct Tunables {
    pub log_fraction: u32,
    pub field_frames: u32,
    pub samini: f32,
    pub samxr: i32,
    /// Per-corrector gain records, indexed like the config.
    pub gains: Vec<GainSettings>,
    /// Constant offset added to the reference displacements, used to
    /// step the image across the sensor.
    pub step: (f32, f32),
}

pub struct SharedState {
    cell: Mutex<ModeCell>,
    pub mode_cond: Condvar,
    pub tunables: Mutex<Tunables>,
    pending: Mutex<Vec<PendingRequest>>,
    /// Raw-frame capture countdown (`saveimg`).
    pub save_frames: AtomicI64,
    /// True when reconstruction artefacts are loaded and CLOSED may be
    /// entered.
    pub calibrated: AtomicBool,
    /// Loop iterations since startup.
    pub frames: AtomicU64,
    /// Smoothed frame rate, f32 bits.
    fps_bits: AtomicU32,
}

impl SharedState {
    pub fn new(tunables: Tunables) -> Self {
        Self {
            cell: Mutex::new(ModeCell {
                mode: LoopMode::Listen,
                calmode: CalMode::Influence,
            }),
            mode_cond: Condvar::new(),
            tunables: Mutex::new(tunables),
            pending: Mutex::new(Vec::new()),
            save_frames: AtomicI64::new(0),
            calibrated: AtomicBool::new(false),
            frames: AtomicU64::new(0),
            fps_bits: AtomicU32::new(0),
        }
    }

    pub fn mode(&self) -> LoopMode {
        self.cell.lock().unwrap().mode
    }

    pub fn calmode(&self) -> CalMode {
        self.cell.lock().unwrap().calmode
    }

    pub fn mode_and_calmode(&self) -> (LoopMode, CalMode) {
        let c = self.cell.lock().unwrap();
        (c.mode, c.calmode)
    }

    /// Set the mode and wake the worker. Shutdown is sticky: once
    /// requested no other mode can override it.
    pub fn set_mode(&self, mode: LoopMode) {
        let mut c = self.cell.lock().unwrap();
        if c.mode != LoopMode::Shutdown {
            c.mode = mode;
        }
        drop(c);
        self.mode_cond.notify_all();
    }

    pub fn set_calibrate(&self, calmode: CalMode) {
        let mut c = self.cell.lock().unwrap();
        if c.mode != LoopMode::Shutdown {
            c.mode = LoopMode::Calibrate;
            c.calmode = calmode;
        }
        drop(c);
        self.mode_cond.notify_all();
    }

    /// Worker-side: block until the mode leaves `current`.
    pub fn wait_while_mode(&self, current: LoopMode) -> LoopMode {
        let mut c = self.cell.lock().unwrap();
        while c.mode == current && self.pending.lock().unwrap().is_empty() {
            c = self.mode_cond.wait(c).unwrap();
        }
        c.mode
    }

    pub fn push_request(&self, req: PendingRequest) {
        self.pending.lock().unwrap().push(req);
        self.mode_cond.notify_all();
    }

    pub fn take_requests(&self) -> Vec<PendingRequest> {
        std::mem::take(&mut *self.pending.lock().unwrap())
    }

    pub fn set_fps(&self, fps: f32) {
        self.fps_bits.store(fps.to_bits(), Ordering::Relaxed);
    }

    pub fn fps(&self) -> f32 {
        f32::from_bits(self.fps_bits.load(Ordering::Relaxed))
    }

    /// Adjust one gain field, checking the corrector index.
    pub fn set_gain(&self, wfc: usize, field: GainField, value: f32) -> bool {
        let mut t = self.tunables.lock().unwrap();
        match t.gains.get_mut(wfc) {
            Some(g) => {
                *g.field_mut(field) = value;
                true
            }
            None => false,
        }
    }
}
