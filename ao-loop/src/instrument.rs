//! The assembled instrument: camera, pipeline state, correctors,
//! calibration store and measurement logs, owned by the worker thread.
//!
//! Also the [ao_calib::MeasurementRig] implementation the calibration
//! engine drives, so the engine stays free of device knowledge.

use std::sync::Arc;
use std::time::Duration;

use nalgebra::DVector;
use tracing::warn;

use ao_calib::{CalibSettings, CalibrationStore, MeasurementRig};
use ao_camera::FrameSource;
use ao_datalog::DataLog;
use ao_frame::Frame;
use ao_framebuf::FrameRing;
use ao_shwfs::{cog_track_full, correct_full_frame, ShConfig, ShGeometry, SubapTables};
use ao_types::{
    ScanAxes, StateSnapshot, WfcConfig, WfcSnapshot, WfsSnapshot,
};
use ao_wfc::Corrector;

use crate::config::{LoopConfig, TrackMethod};
use crate::shared::SharedState;
use crate::stats::FrameClock;

/// Acquire timeout inside loop bodies, so mode changes are honoured
/// even when the camera stalls.
pub const ACQUIRE_TIMEOUT: Duration = Duration::from_millis(100);

pub struct Instrument {
    pub camera: Box<dyn FrameSource>,
    pub correctors: Vec<Box<dyn Corrector>>,
    /// Per-corrector control vectors, normalised [-1, 1].
    pub ctrl: Vec<Vec<f32>>,
    pub wfc_cfg: Vec<WfcConfig>,
    pub sh_cfg: ShConfig,
    pub scan: ScanAxes,
    pub tracking: TrackMethod,
    pub store: CalibrationStore,
    /// Built by `calibrate gain`, needed for the closed-loop fast path.
    pub tables: Option<SubapTables>,
    pub corr_refs: Option<ao_shwfs::CorrelationRef>,
    pub sh_log: DataLog,
    pub wfc_log: DataLog,
    pub ring: FrameRing,
    pub clock: FrameClock,
    pub shared: Arc<SharedState>,
    pub calib_settings: CalibSettings,
    pub field_frames: u32,
    pub nmodes: usize,
    sensor_name: String,
    sensor_bpp: u32,
}

impl Instrument {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: &LoopConfig,
        camera: Box<dyn FrameSource>,
        correctors: Vec<Box<dyn Corrector>>,
        store: CalibrationStore,
        sh_log: DataLog,
        wfc_log: DataLog,
        shared: Arc<SharedState>,
    ) -> Self {
        let ctrl = cfg.wfc.iter().map(|w| vec![0.0f32; w.nact]).collect();
        let frame_bytes = cfg.frame_bytes();
        Self {
            camera,
            correctors,
            ctrl,
            wfc_cfg: cfg.wfc.clone(),
            sh_cfg: cfg.sensor.sh_config(),
            scan: cfg.sensor.scan,
            tracking: cfg.tracking,
            store,
            tables: None,
            corr_refs: None,
            sh_log,
            wfc_log,
            ring: FrameRing::new(
                cfg.buffer.initial_frames * frame_bytes,
                cfg.buffer.grow_frames * frame_bytes,
                cfg.buffer.max_frames.map(|n| n * frame_bytes),
            ),
            clock: FrameClock::new(),
            shared,
            calib_settings: CalibSettings {
                skipframes: cfg.calib.skipframes,
                measurecount: cfg.calib.measurecount,
                lintest_steps: cfg.calib.lintest_steps,
            },
            field_frames: cfg.sensor.field_frames,
            nmodes: cfg.calib.nmodes,
            sensor_name: cfg.sensor.name.clone(),
            sensor_bpp: cfg.sensor.bpp,
        }
    }

    pub fn geometry(&self) -> Option<&ShGeometry> {
        self.store.geometry.as_ref()
    }

    /// Pull the settable pipeline parameters from the shared state.
    pub fn sync_tunables(&mut self) {
        let t = self.shared.tunables.lock().unwrap();
        self.sh_cfg.samini = t.samini;
        self.sh_cfg.samxr = t.samxr;
        self.field_frames = t.field_frames;
    }

    /// Push one corrector's control vector to its device.
    pub fn apply_wfc(&mut self, wfc: usize) -> ao_wfc::Result<()> {
        self.correctors[wfc].apply(&self.ctrl[wfc])
    }

    /// Zero and apply every control vector.
    pub fn zero_all_controls(&mut self) -> ao_wfc::Result<()> {
        for wfc in 0..self.correctors.len() {
            self.ctrl[wfc].fill(0.0);
            self.apply_wfc(wfc)?;
        }
        Ok(())
    }

    /// Snapshot the loop state for the measurement logs.
    pub fn snapshot(&self) -> StateSnapshot {
        let (mode, calmode) = self.shared.mode_and_calmode();
        let gains = self.shared.tunables.lock().unwrap().gains.clone();
        StateSnapshot {
            mode,
            calmode,
            frames: self.clock.frames(),
            fps: self.clock.fps(),
            wfs: vec![WfsSnapshot {
                id: 0,
                name: self.sensor_name.clone(),
                width: self.camera.width(),
                height: self.camera.height(),
                bpp: self.sensor_bpp,
                field_frames: self.field_frames,
            }],
            wfc: self
                .wfc_cfg
                .iter()
                .enumerate()
                .map(|(id, w)| WfcSnapshot {
                    id,
                    name: w.name.clone(),
                    nact: w.nact,
                    gain: gains.get(id).copied().unwrap_or(w.gain),
                    ctrl: self.ctrl[id].clone(),
                })
                .collect(),
        }
    }

    /// Buffer a raw frame while a `saveimg` countdown is armed; dump
    /// the ring when it expires. Returns a broadcast message when the
    /// capture completed.
    pub fn handle_saveimg(&mut self, frame: &Frame) -> Option<String> {
        use std::sync::atomic::Ordering;
        let remaining = self.shared.save_frames.load(Ordering::Relaxed);
        if remaining <= 0 {
            return None;
        }
        if let Err(e) = self.ring.push(frame.clone()) {
            warn!("frame buffer rejected frame: {}", e);
        }
        if self.shared.save_frames.fetch_sub(1, Ordering::Relaxed) == 1 {
            match self.ring.dump(self.store.paths().prefix()) {
                Ok(files) => {
                    return Some(format!("200 FRAME CAPTURE COMPLETE ({} FILES)", files.len()))
                }
                Err(e) => {
                    warn!("buffer dump failed: {}", e);
                    return Some("300 FRAME CAPTURE FAILED".to_string());
                }
            }
        }
        None
    }

    /// Split the instrument into a calibration rig and the store, so
    /// the engine can borrow both at once. The rig gets its own copy
    /// of the pipeline inputs (geometry and fields); calibration is
    /// not the hot path.
    pub fn calibration_parts(&mut self) -> (LoopRig<'_>, &mut CalibrationStore) {
        let rig = LoopRig {
            camera: &mut self.camera,
            correctors: &mut self.correctors,
            ctrl: &mut self.ctrl,
            wfc_cfg: &self.wfc_cfg,
            sh_log: &mut self.sh_log,
            geometry: self.store.geometry.clone(),
            dark: self.store.dark.clone(),
            flat: self.store.flat.clone(),
        };
        (rig, &mut self.store)
    }
}

/// The [MeasurementRig] the calibration engine drives: a view of the
/// instrument's devices plus owned copies of the pipeline inputs.
pub struct LoopRig<'a> {
    camera: &'a mut Box<dyn FrameSource>,
    correctors: &'a mut Vec<Box<dyn Corrector>>,
    ctrl: &'a mut Vec<Vec<f32>>,
    wfc_cfg: &'a [WfcConfig],
    sh_log: &'a mut DataLog,
    geometry: Option<ShGeometry>,
    dark: Option<nalgebra::DMatrix<f32>>,
    flat: Option<nalgebra::DMatrix<f32>>,
}

fn rig_err(e: impl std::fmt::Display) -> ao_calib::Error {
    ao_calib::Error::Rig(e.to_string())
}

impl MeasurementRig for LoopRig<'_> {
    fn start_source(&mut self) -> ao_calib::Result<()> {
        self.camera.start().map_err(rig_err)
    }

    fn stop_source(&mut self) -> ao_calib::Result<()> {
        self.camera.stop().map_err(rig_err)
    }

    fn acquire_raw(&mut self) -> ao_calib::Result<Frame> {
        // block until the camera produces; calibration has no mode
        // deadline inside a single pass
        loop {
            match self.camera.acquire(Some(ACQUIRE_TIMEOUT)).map_err(rig_err)? {
                Some(frame) => return Ok(frame),
                None => continue,
            }
        }
    }

    fn acquire_tracked(&mut self) -> ao_calib::Result<DVector<f32>> {
        let frame = self.acquire_raw()?;
        let geom = self
            .geometry
            .as_ref()
            .ok_or(ao_calib::Error::MissingArtefact(
                "subaperture selection",
                "subap",
            ))?;
        let fields = match (self.dark.as_ref(), self.flat.as_ref()) {
            (Some(d), Some(f)) => Some((d, f)),
            _ => None,
        };
        let corr = correct_full_frame(&frame, fields);
        let (disp, _stats) = cog_track_full(&corr, geom);
        Ok(disp)
    }

    fn wfc_count(&self) -> usize {
        self.correctors.len()
    }

    fn nact(&self, wfc: usize) -> usize {
        self.wfc_cfg[wfc].nact
    }

    fn calrange(&self, wfc: usize) -> (f32, f32) {
        self.wfc_cfg[wfc].calrange
    }

    fn set_actuator(&mut self, wfc: usize, act: usize, value: f32) -> ao_calib::Result<()> {
        self.ctrl[wfc][act] = value;
        self.correctors[wfc].apply(&self.ctrl[wfc]).map_err(rig_err)
    }

    fn zero_controls(&mut self) -> ao_calib::Result<()> {
        for wfc in 0..self.correctors.len() {
            self.ctrl[wfc].fill(0.0);
            self.correctors[wfc]
                .apply(&self.ctrl[wfc])
                .map_err(rig_err)?;
        }
        Ok(())
    }

    fn log_sweep(&mut self, tag: &str, disp: &DVector<f32>) {
        self.sh_log.vec_line(tag, disp.as_slice());
    }
}
