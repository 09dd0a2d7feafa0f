//! Membrane deformable mirror.
//!
//! The mirror deflection goes with the square of the electrode
//! voltage, so a linear control value is mapped through a square root
//! to keep the loop linear in actual deflection.

use ao_types::WfcKind;

use crate::{clamp_ctrl, Corrector, Error, Result};

/// Full-scale electrode voltage of the standard 37-channel device.
pub const DEFAULT_MAX_VOLT: u16 = 255;

/// An electrode bus accepting one voltage per actuator.
pub trait MirrorBus: Send {
    fn write_voltages(&mut self, volts: &[u16]) -> Result<()>;

    fn restart(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Map a control value in [-1, 1] to an electrode voltage with
/// quadratic response compensation: `V = round(sqrt(Vmax^2*(c+1)/2))`.
/// -1 parks the electrode at 0, 0 sits at the mirror's linearisation
/// midpoint, +1 reaches full scale.
#[inline]
pub fn ctrl_to_voltage(c: f32, vmax: u16) -> u16 {
    let vmax = vmax as f64;
    (vmax * vmax * (c as f64 + 1.0) * 0.5).sqrt().round() as u16
}

pub struct DeformableMirror<B: MirrorBus> {
    name: String,
    bus: B,
    nact: usize,
    vmax: u16,
    calrange: (f32, f32),
    scratch: Vec<f32>,
    volts: Vec<u16>,
}

impl<B: MirrorBus> DeformableMirror<B> {
    pub fn new(name: impl Into<String>, bus: B, nact: usize, calrange: (f32, f32)) -> Self {
        Self {
            name: name.into(),
            bus,
            nact,
            vmax: DEFAULT_MAX_VOLT,
            calrange,
            scratch: Vec::with_capacity(nact),
            volts: vec![0; nact],
        }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }
}

impl<B: MirrorBus> Corrector for DeformableMirror<B> {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> WfcKind {
        WfcKind::DeformableMirror
    }

    fn nact(&self) -> usize {
        self.nact
    }

    fn apply(&mut self, ctrl: &[f32]) -> Result<()> {
        if ctrl.len() != self.nact {
            return Err(Error::ControlLength {
                got: ctrl.len(),
                want: self.nact,
            });
        }
        let mut scratch = std::mem::take(&mut self.scratch);
        clamp_ctrl(ctrl, self.calrange.0, self.calrange.1, &mut scratch);
        for (v, &c) in self.volts.iter_mut().zip(scratch.iter()) {
            *v = ctrl_to_voltage(c, self.vmax);
        }
        self.scratch = scratch;
        self.bus.write_voltages(&self.volts)
    }

    fn reset_to(&mut self, volts: Option<f64>) -> Result<()> {
        let v = volts.unwrap_or(0.0);
        if !(0.0..=self.vmax as f64).contains(&v) {
            return Err(Error::VoltageOutOfRange(v, 0.0, self.vmax as f64));
        }
        for out in self.volts.iter_mut() {
            *out = v as u16;
        }
        self.bus.write_voltages(&self.volts)
    }

    fn restart(&mut self) -> Result<()> {
        self.bus.restart()?;
        self.reset_to(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimMirrorBus;

    #[test]
    fn voltage_mapping_endpoints() {
        assert_eq!(ctrl_to_voltage(-1.0, 255), 0);
        // midpoint of the quadratic response: 255/sqrt(2)
        assert_eq!(ctrl_to_voltage(0.0, 255), 180);
        assert_eq!(ctrl_to_voltage(1.0, 255), 255);
    }

    #[test]
    fn voltage_mapping_is_monotone() {
        let mut last = 0u16;
        let mut c = -1.0f32;
        while c <= 1.0 {
            let v = ctrl_to_voltage(c, 255);
            assert!(v >= last);
            last = v;
            c += 0.01;
        }
    }

    #[test]
    fn apply_writes_all_electrodes() {
        let mut dm = DeformableMirror::new("DM", SimMirrorBus::new(), 37, (-1.0, 1.0));
        dm.apply(&vec![0.0f32; 37]).unwrap();
        let volts = dm.bus().last();
        assert_eq!(volts.len(), 37);
        assert!(volts.iter().all(|&v| v == 180));
    }

    #[test]
    fn reset_voltage_validated() {
        let mut dm = DeformableMirror::new("DM", SimMirrorBus::new(), 4, (-1.0, 1.0));
        assert!(dm.reset_to(Some(300.0)).is_err());
        dm.reset_to(Some(100.0)).unwrap();
        assert!(dm.bus().last().iter().all(|&v| v == 100));
        dm.reset_to(None).unwrap();
        assert!(dm.bus().last().iter().all(|&v| v == 0));
    }
}
