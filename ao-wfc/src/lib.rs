//! Wavefront corrector drivers.
//!
//! [Corrector] is the capability the loop needs: push a normalised
//! control vector to the device. Device specifics (DAC counts, mirror
//! voltages) live behind the [DacOutput] and [MirrorBus] seams so
//! per-site drivers can be swapped in without touching the loop.

use tracing::debug;

use ao_types::WfcKind;

pub mod dm;
pub mod sim;
pub mod tip_tilt;

pub use dm::{ctrl_to_voltage, DeformableMirror, MirrorBus};
pub use sim::{SimDac, SimMirrorBus, SimTipTilt};
pub use tip_tilt::{ctrl_to_counts, volts_to_counts, DacOutput, TipTiltStage};

pub type Result<M> = std::result::Result<M, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("control vector has {got} entries, device has {want} actuators")]
    ControlLength { got: usize, want: usize },
    #[error("voltage {0} outside device range [{1}, {2}]")]
    VoltageOutOfRange(f64, f64, f64),
    #[error("device fault: {0}")]
    DeviceFault(String),
}

/// A wavefront corrector.
///
/// Control values are normalised to [-1, 1]; `apply` clamps them to
/// the device's calibration range before mapping to hardware units.
pub trait Corrector: Send {
    fn name(&self) -> &str;

    fn kind(&self) -> WfcKind;

    /// Actuator count.
    fn nact(&self) -> usize;

    /// Drive the device with a normalised control vector.
    fn apply(&mut self, ctrl: &[f32]) -> Result<()>;

    /// Park every actuator at a raw device voltage (`None` = the
    /// device's neutral default).
    fn reset_to(&mut self, volts: Option<f64>) -> Result<()>;

    /// Reinitialise the device after a fault.
    fn restart(&mut self) -> Result<()>;
}

/// Clamp a control vector into a calibration range, logging once if
/// anything was out of range.
pub(crate) fn clamp_ctrl(ctrl: &[f32], lo: f32, hi: f32, out: &mut Vec<f32>) {
    out.clear();
    let mut clipped = false;
    for &c in ctrl {
        let cc = c.clamp(lo, hi);
        if cc != c {
            clipped = true;
        }
        out.push(cc);
    }
    if clipped {
        debug!("control vector clipped to [{}, {}]", lo, hi);
    }
}
