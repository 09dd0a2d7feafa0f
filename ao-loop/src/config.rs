//! Daemon configuration.
//!
//! One TOML file describes the sensor, the correctors and the ambient
//! services. Relative paths are taken relative to the config file's
//! directory and may contain shell variables such as `~` or `$DATA`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use ao_shwfs::{Dims, ShConfig};
use ao_types::{ScanAxes, WfcConfig};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("io error reading {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("TOML error in {path}: {source}")]
    Toml {
        path: String,
        source: toml::de::Error,
    },
    #[error("variable lookup error: {source}")]
    ShellExpand {
        #[from]
        source: shellexpand::LookupError<std::env::VarError>,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SensorConfig {
    #[serde(default = "default_sensor_name")]
    pub name: String,
    pub width: u32,
    pub height: u32,
    #[serde(default = "default_bpp")]
    pub bpp: u32,
    /// Frames averaged into a dark or flat field.
    #[serde(default = "default_field_frames")]
    pub field_frames: u32,
    #[serde(default)]
    pub scan: ScanAxes,
    /// Lenslet grid (x, y).
    pub cells: (u32, u32),
    /// Tracker window (x, y).
    pub track: (u32, u32),
    #[serde(default = "default_samini")]
    pub samini: f32,
    #[serde(default)]
    pub samxr: i32,
}

fn default_sensor_name() -> String {
    "SH WFS".to_string()
}
fn default_bpp() -> u32 {
    8
}
fn default_field_frames() -> u32 {
    1000
}
fn default_samini() -> f32 {
    20.0
}

impl SensorConfig {
    pub fn sh_config(&self) -> ShConfig {
        ShConfig {
            cells: Dims::new(self.cells.0, self.cells.1),
            track: Dims::new(self.track.0, self.track.1),
            samini: self.samini,
            samxr: self.samxr,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
}

fn default_listen() -> String {
    "127.0.0.1:10000".to_string()
}
fn default_max_clients() -> usize {
    16
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_clients: default_max_clients(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CalibPathsConfig {
    /// Per-sensor artefact path prefix.
    #[serde(default = "default_data_prefix")]
    pub data_prefix: PathBuf,
    #[serde(default = "default_skipframes")]
    pub skipframes: u32,
    #[serde(default = "default_measurecount")]
    pub measurecount: u32,
    #[serde(default = "default_lintest_steps")]
    pub lintest_steps: u32,
    /// Modes kept in the reconstruction; 0 keeps all.
    #[serde(default)]
    pub nmodes: usize,
}

fn default_data_prefix() -> PathBuf {
    PathBuf::from("data/sh")
}
fn default_skipframes() -> u32 {
    10
}
fn default_measurecount() -> u32 {
    3
}
fn default_lintest_steps() -> u32 {
    10
}

impl Default for CalibPathsConfig {
    fn default() -> Self {
        Self {
            data_prefix: default_data_prefix(),
            skipframes: default_skipframes(),
            measurecount: default_measurecount(),
            lintest_steps: default_lintest_steps(),
            nmodes: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackMethod {
    Cog,
    Correlation,
}

impl Default for TrackMethod {
    fn default() -> Self {
        TrackMethod::Cog
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogsConfig {
    #[serde(default = "default_sh_log")]
    pub displacements: PathBuf,
    #[serde(default = "default_wfc_log")]
    pub controls: PathBuf,
    /// fopen-style mode string; "r" is not a log mode.
    #[serde(default = "default_log_mode")]
    pub mode: String,
}

fn default_sh_log() -> PathBuf {
    PathBuf::from("sh-offsets.dat")
}
fn default_wfc_log() -> PathBuf {
    PathBuf::from("wfc-signals.dat")
}
fn default_log_mode() -> String {
    "w".to_string()
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            displacements: default_sh_log(),
            controls: default_wfc_log(),
            mode: default_log_mode(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BufferConfig {
    /// Initial ring capacity in frames.
    #[serde(default = "default_initial_frames")]
    pub initial_frames: usize,
    /// Growth increment in frames.
    #[serde(default = "default_grow_frames")]
    pub grow_frames: usize,
    /// Hard ceiling in frames, unlimited when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_frames: Option<usize>,
}

fn default_initial_frames() -> usize {
    750
}
fn default_grow_frames() -> usize {
    250
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            initial_frames: default_initial_frames(),
            grow_frames: default_grow_frames(),
            max_frames: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimConfig {
    #[serde(default = "default_sigma")]
    pub sigma: f32,
    #[serde(default = "default_peak")]
    pub peak: f32,
    #[serde(default = "default_background")]
    pub background: u8,
    #[serde(default)]
    pub noise: u8,
    /// Spot motion per unit of tip-tilt control, pixels.
    #[serde(default = "default_px_per_ctrl")]
    pub px_per_ctrl: f32,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_sigma() -> f32 {
    3.0
}
fn default_peak() -> f32 {
    200.0
}
fn default_background() -> u8 {
    5
}
fn default_px_per_ctrl() -> f32 {
    2.0
}
fn default_seed() -> u64 {
    0xa0
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            sigma: default_sigma(),
            peak: default_peak(),
            background: default_background(),
            noise: 0,
            px_per_ctrl: default_px_per_ctrl(),
            seed: default_seed(),
        }
    }
}

// scalar fields first: TOML wants values emitted before tables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoopConfig {
    /// Log-fraction: periodic log lines print every N frames.
    #[serde(default = "default_log_fraction")]
    pub log_fraction: u32,
    #[serde(default)]
    pub tracking: TrackMethod,
    pub sensor: SensorConfig,
    pub wfc: Vec<WfcConfig>,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub calib: CalibPathsConfig,
    #[serde(default)]
    pub logs: LogsConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub sim: SimConfig,
}

fn default_log_fraction() -> u32 {
    100
}

/// Expand `~`/`$VAR` and anchor relative paths at `dir`.
fn fixup_path(path: &mut PathBuf, dir: &Path) -> Result<()> {
    let raw = path.to_string_lossy().to_string();
    let expanded = shellexpand::full(&raw)?;
    *path = PathBuf::from(expanded.to_string());
    if path.is_relative() {
        *path = dir.join(&path);
    }
    Ok(())
}

impl LoopConfig {
    pub fn parse_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let mut cfg: LoopConfig = toml::from_str(&text).map_err(|e| Error::Toml {
            path: path.display().to_string(),
            source: e,
        })?;
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        fixup_path(&mut cfg.calib.data_prefix, dir)?;
        fixup_path(&mut cfg.logs.displacements, dir)?;
        fixup_path(&mut cfg.logs.controls, dir)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let s = &self.sensor;
        s.sh_config()
            .shsize(s.width, s.height)
            .map_err(|e| Error::Invalid(e.to_string()))?;
        if s.bpp != 8 {
            return Err(Error::Invalid(format!(
                "only 8 bpp sensors are supported, got {}",
                s.bpp
            )));
        }
        if self.wfc.is_empty() {
            return Err(Error::Invalid("no wavefront correctors configured".into()));
        }
        for w in &self.wfc {
            if w.nact == 0 {
                return Err(Error::Invalid(format!("corrector '{}' has 0 actuators", w.name)));
            }
            if w.calrange.0 >= w.calrange.1 {
                return Err(Error::Invalid(format!(
                    "corrector '{}' calrange is empty",
                    w.name
                )));
            }
        }
        ao_datalog::OpenMode::parse(&self.logs.mode)
            .ok_or_else(|| Error::Invalid(format!("bad log mode '{}'", self.logs.mode)))?;
        Ok(())
    }

    /// Bytes per raw frame, for ring-buffer sizing.
    pub fn frame_bytes(&self) -> usize {
        self.sensor.width as usize * self.sensor.height as usize
    }
}
