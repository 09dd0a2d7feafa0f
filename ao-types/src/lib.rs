//! Shared plain types for the AO control core.
//!
//! This crate holds the vocabulary used across the workspace: loop and
//! calibration modes, gain records, wavefront sensor and corrector
//! descriptors, and the state snapshot consumed by the measurement log.
//! It deliberately has no engine dependencies so leaf crates (logging,
//! hardware, pipeline) can share it without cycles.

use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown {what}: {got}")]
pub struct ParseNameError {
    pub what: &'static str,
    pub got: String,
}

/// Top-level mode of the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopMode {
    /// Idle, waiting for operator commands.
    Listen,
    /// Acquire and measure, do not drive correctors.
    Open,
    /// Full measure-reconstruct-correct cycle.
    Closed,
    /// Run one calibration pass, then fall back to [LoopMode::Listen].
    Calibrate,
    /// Cooperative teardown.
    Shutdown,
}

impl LoopMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopMode::Listen => "listen",
            LoopMode::Open => "open",
            LoopMode::Closed => "closed",
            LoopMode::Calibrate => "calibrate",
            LoopMode::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for LoopMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LoopMode {
    type Err = ParseNameError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "listen" => Ok(LoopMode::Listen),
            "open" => Ok(LoopMode::Open),
            "closed" => Ok(LoopMode::Closed),
            _ => Err(ParseNameError {
                what: "mode",
                got: s.to_string(),
            }),
        }
    }
}

/// Which calibration pass to run while in [LoopMode::Calibrate].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalMode {
    Dark,
    Flat,
    /// Build the per-subaperture integer dark/gain tables.
    Gain,
    /// Record the flat-wavefront reference displacements.
    Pinhole,
    /// Measure the influence matrix and decompose it.
    Influence,
    /// Select usable subapertures from a single frame.
    SubapSel,
    /// Sweep each actuator over its range and log the response.
    LinTest,
}

impl CalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CalMode::Dark => "dark",
            CalMode::Flat => "flat",
            CalMode::Gain => "gain",
            CalMode::Pinhole => "pinhole",
            CalMode::Influence => "influence",
            CalMode::SubapSel => "subap",
            CalMode::LinTest => "lintest",
        }
    }
}

impl std::fmt::Display for CalMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CalMode {
    type Err = ParseNameError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dark" => Ok(CalMode::Dark),
            "flat" => Ok(CalMode::Flat),
            "gain" => Ok(CalMode::Gain),
            "pinhole" => Ok(CalMode::Pinhole),
            "influence" => Ok(CalMode::Influence),
            "subap" => Ok(CalMode::SubapSel),
            "lintest" => Ok(CalMode::LinTest),
            _ => Err(ParseNameError {
                what: "calibration",
                got: s.to_string(),
            }),
        }
    }
}

/// Tracking axes for a wavefront sensor.
///
/// `X`/`Y` restrict correlation tracking to a single axis (the other
/// component of the measured displacement is reported as zero), `Xy`
/// tracks both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanAxes {
    X,
    Y,
    Xy,
}

impl Default for ScanAxes {
    fn default() -> Self {
        ScanAxes::Xy
    }
}

/// PID-style gain record for a corrector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GainSettings {
    pub p: f32,
    pub i: f32,
    pub d: f32,
}

impl Default for GainSettings {
    fn default() -> Self {
        Self {
            p: 1.0,
            i: 1.0,
            d: 1.0,
        }
    }
}

/// Selects which field of [GainSettings] scales the per-frame
/// reconstructor update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GainField {
    #[serde(rename = "p")]
    Proportional,
    #[serde(rename = "i")]
    Integral,
    #[serde(rename = "d")]
    Derivative,
}

impl Default for GainField {
    fn default() -> Self {
        GainField::Derivative
    }
}

impl GainSettings {
    pub fn field(&self, which: GainField) -> f32 {
        match which {
            GainField::Proportional => self.p,
            GainField::Integral => self.i,
            GainField::Derivative => self.d,
        }
    }

    pub fn field_mut(&mut self, which: GainField) -> &mut f32 {
        match which {
            GainField::Proportional => &mut self.p,
            GainField::Integral => &mut self.i,
            GainField::Derivative => &mut self.d,
        }
    }
}

/// Kind of wavefront corrector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WfcKind {
    TipTilt,
    DeformableMirror,
}

impl std::fmt::Display for WfcKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WfcKind::TipTilt => f.write_str("tip-tilt"),
            WfcKind::DeformableMirror => f.write_str("deformable-mirror"),
        }
    }
}

/// Static description of one wavefront corrector.
///
/// Scalar fields come before the gain record so the struct serialises
/// cleanly to TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WfcConfig {
    pub name: String,
    pub kind: WfcKind,
    /// Actuator count.
    pub nact: usize,
    /// Control range used while measuring the influence matrix,
    /// normalised units.
    #[serde(default = "default_calrange")]
    pub calrange: (f32, f32),
    /// Gain field applied to reconstructor updates.
    #[serde(default)]
    pub step_field: GainField,
    #[serde(default)]
    pub gain: GainSettings,
}

fn default_calrange() -> (f32, f32) {
    (-1.0, 1.0)
}

/// Static description of one wavefront sensor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WfsConfig {
    pub name: String,
    pub width: u32,
    pub height: u32,
    /// Bits per pixel of the raw sensor data.
    #[serde(default = "default_bpp")]
    pub bpp: u32,
    /// Frames averaged into a dark or flat field.
    #[serde(default = "default_field_frames")]
    pub field_frames: u32,
    #[serde(default)]
    pub scan: ScanAxes,
}

fn default_bpp() -> u32 {
    8
}

fn default_field_frames() -> u32 {
    1000
}

// ---------------------------
// state snapshot

/// Per-sensor line of a [StateSnapshot].
#[derive(Debug, Clone, PartialEq)]
pub struct WfsSnapshot {
    pub id: usize,
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub bpp: u32,
    pub field_frames: u32,
}

/// Per-corrector line of a [StateSnapshot].
#[derive(Debug, Clone, PartialEq)]
pub struct WfcSnapshot {
    pub id: usize,
    pub name: String,
    pub nact: usize,
    pub gain: GainSettings,
    pub ctrl: Vec<f32>,
}

/// A small copy of the loop state, taken for logging.
///
/// The measurement log depends only on this struct, not on the
/// orchestrator, so the log crate stays a leaf.
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    pub mode: LoopMode,
    pub calmode: CalMode,
    pub frames: u64,
    pub fps: f32,
    pub wfs: Vec<WfsSnapshot>,
    pub wfc: Vec<WfcSnapshot>,
}
