//! Simulated corrector backends.
//!
//! [SimDac] and [SimMirrorBus] capture the values a driver would send
//! to hardware. [SimTipTilt] additionally feeds the applied control
//! back into the simulated camera rig so a closed loop actually closes
//! in tests.

use ao_camera::SimRig;
use ao_types::WfcKind;

use crate::tip_tilt::{ctrl_to_counts, volts_to_counts, NEUTRAL_VOLT};
use crate::{clamp_ctrl, Corrector, DacOutput, MirrorBus, Result};

/// Captures per-channel DAC counts.
pub struct SimDac {
    channels: Vec<u16>,
}

impl SimDac {
    pub fn new(nchan: usize) -> Self {
        Self {
            channels: vec![0; nchan],
        }
    }

    pub fn channel(&self, ch: usize) -> u16 {
        self.channels[ch]
    }
}

impl DacOutput for SimDac {
    fn set_channel(&mut self, channel: usize, counts: u16) -> Result<()> {
        if let Some(c) = self.channels.get_mut(channel) {
            *c = counts;
        }
        Ok(())
    }

    fn set_all(&mut self, counts: u16) -> Result<()> {
        self.channels.fill(counts);
        Ok(())
    }
}

/// Captures the last electrode voltage vector.
#[derive(Default)]
pub struct SimMirrorBus {
    last: Vec<u16>,
}

impl SimMirrorBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last(&self) -> &[u16] {
        &self.last
    }
}

impl MirrorBus for SimMirrorBus {
    fn write_voltages(&mut self, volts: &[u16]) -> Result<()> {
        self.last.clear();
        self.last.extend_from_slice(volts);
        Ok(())
    }
}

/// Simulated tip-tilt stage coupled to the camera rig.
///
/// Applying a control moves the simulated spots by `px_per_ctrl`
/// pixels per unit of control on each axis.
pub struct SimTipTilt {
    name: String,
    rig: SimRig,
    dac: SimDac,
    px_per_ctrl: f32,
    calrange: (f32, f32),
    scratch: Vec<f32>,
}

impl SimTipTilt {
    pub fn new(name: impl Into<String>, rig: SimRig, px_per_ctrl: f32, calrange: (f32, f32)) -> Self {
        Self {
            name: name.into(),
            rig,
            dac: SimDac::new(2),
            px_per_ctrl,
            calrange,
            scratch: Vec::with_capacity(2),
        }
    }

    pub fn dac(&self) -> &SimDac {
        &self.dac
    }
}

impl Corrector for SimTipTilt {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> WfcKind {
        WfcKind::TipTilt
    }

    fn nact(&self) -> usize {
        2
    }

    fn apply(&mut self, ctrl: &[f32]) -> Result<()> {
        if ctrl.len() != 2 {
            return Err(crate::Error::ControlLength {
                got: ctrl.len(),
                want: 2,
            });
        }
        let mut scratch = std::mem::take(&mut self.scratch);
        clamp_ctrl(ctrl, self.calrange.0, self.calrange.1, &mut scratch);
        for (ch, &c) in scratch.iter().enumerate() {
            self.dac.set_channel(ch, ctrl_to_counts(c))?;
        }
        self.rig
            .set_mirror(self.px_per_ctrl * scratch[0], self.px_per_ctrl * scratch[1]);
        self.scratch = scratch;
        Ok(())
    }

    fn reset_to(&mut self, volts: Option<f64>) -> Result<()> {
        let v = volts.unwrap_or(NEUTRAL_VOLT);
        self.dac.set_all(volts_to_counts(v)?)?;
        self.rig.set_mirror(0.0, 0.0);
        Ok(())
    }

    fn restart(&mut self) -> Result<()> {
        self.reset_to(None)
    }
}
