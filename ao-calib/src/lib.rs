//! Calibration: persisted artefacts and the passes that create them.
//!
//! [store::CalibrationStore] owns the on-disk artefacts (dark, flat,
//! sky, pinhole reference, influence matrix and its SVD) keyed by a
//! per-sensor path prefix. [engine] drives the calibration passes
//! against a [MeasurementRig], the small capability surface the loop
//! exposes so the engine needs no knowledge of cameras or correctors.

use nalgebra::DVector;

use ao_frame::Frame;

pub mod engine;
pub mod store;

pub use engine::{CalibSettings, FieldStats};
pub use store::{ArtefactPaths, CalibrationStore, StoreGeometry};

pub type Result<M> = std::result::Result<M, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {reason}")]
    Parse { path: String, reason: String },
    #[error("calibration artefact missing: {0} (run `calibrate {1}` first)")]
    MissingArtefact(&'static str, &'static str),
    #[error("stored geometry ({stored_nact} actuators, {stored_nsubap} subapertures) does not match live ({nact}, {nsubap})")]
    GeometryMismatch {
        stored_nact: usize,
        stored_nsubap: usize,
        nact: usize,
        nsubap: usize,
    },
    #[error(transparent)]
    Pipeline(#[from] ao_shwfs::Error),
    #[error(transparent)]
    Recon(#[from] ao_recon::Error),
    #[error("measurement rig fault: {0}")]
    Rig(String),
}

impl Error {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Error::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// What the calibration engine needs from the running instrument.
///
/// Implemented by the loop orchestrator over its camera, pipeline and
/// correctors; implemented by scripted fakes in tests.
pub trait MeasurementRig {
    /// Begin frame production. Idempotent.
    fn start_source(&mut self) -> Result<()>;

    /// Stop frame production. Idempotent.
    fn stop_source(&mut self) -> Result<()>;

    /// Acquire one raw frame.
    fn acquire_raw(&mut self) -> Result<Frame>;

    /// Acquire one frame and return the tracked displacement vector
    /// (window-relative, reference not subtracted).
    fn acquire_tracked(&mut self) -> Result<DVector<f32>>;

    fn wfc_count(&self) -> usize;

    fn nact(&self, wfc: usize) -> usize;

    fn calrange(&self, wfc: usize) -> (f32, f32);

    /// Set one actuator's control value and push it to the device.
    fn set_actuator(&mut self, wfc: usize, act: usize, value: f32) -> Result<()>;

    /// Zero every control vector and push them to the devices.
    fn zero_controls(&mut self) -> Result<()>;

    /// Record one linearity-sweep displacement vector.
    fn log_sweep(&mut self, tag: &str, disp: &DVector<f32>);
}
