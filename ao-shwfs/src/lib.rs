//! Shack-Hartmann wavefront sensing.
//!
//! A lenslet array images the pupil onto the sensor as a grid of spots,
//! one per subaperture. Local wavefront tilt moves a spot inside its
//! tracker window; this crate finds usable subapertures, corrects raw
//! frames with dark/flat calibration data, and measures per-subaperture
//! spot displacements by centre-of-gravity or correlation tracking.
//!
//! Displacement vectors are laid out `[x0, y0, x1, y1, ..]` with the
//! reference subaperture at index 0.

pub mod calibrate;
pub mod select;
pub mod track;

pub use calibrate::{build_subap_tables, correct_full_frame, correct_subaps, SubapTables};
pub use select::select_subapertures;
pub use track::{
    apply_reference, cog_track_full, cog_track_packed, correlation_track_packed, CogStats,
    CorrelationRef,
};

pub type Result<M> = std::result::Result<M, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("sensor {width}x{height} not divisible into {cells_x}x{cells_y} cells")]
    CellGeometry {
        width: u32,
        height: u32,
        cells_x: u32,
        cells_y: u32,
    },
    #[error("tracker window {0}x{1} larger than lenslet cell {2}x{3}")]
    TrackerTooLarge(u32, u32, u32, u32),
    #[error("no subaperture has intensity above threshold")]
    NoSubapertures,
    #[error("calibration field is {got_rows}x{got_cols}, sensor is {want_rows}x{want_cols}")]
    FieldSizeMismatch {
        got_rows: usize,
        got_cols: usize,
        want_rows: usize,
        want_cols: usize,
    },
    #[error("geometry holds {geom} subapertures but tables hold {tables}")]
    TableMismatch { geom: usize, tables: usize },
}

/// An x/y pair of pixel counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dims {
    pub x: u32,
    pub y: u32,
}

impl Dims {
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }

    pub fn area(&self) -> usize {
        self.x as usize * self.y as usize
    }
}

/// An x/y pixel coordinate (lower-left corner of a window).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Coord {
    pub x: i32,
    pub y: i32,
}

impl Coord {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Static Shack-Hartmann tracking parameters.
#[derive(Debug, Clone)]
pub struct ShConfig {
    /// Lenslet grid dimensions.
    pub cells: Dims,
    /// Tracker window, at most one lenslet cell.
    pub track: Dims,
    /// Intensity threshold for subaperture selection.
    pub samini: f32,
    /// Positive: maximum radius from the subaperture centroid.
    /// Negative: number of edge-erosion passes. Zero: keep everything.
    pub samxr: i32,
}

impl ShConfig {
    /// Pixels per lenslet cell for a given sensor resolution.
    pub fn shsize(&self, width: u32, height: u32) -> Result<Dims> {
        if width == 0
            || height == 0
            || self.cells.x == 0
            || self.cells.y == 0
            || width % self.cells.x != 0
            || height % self.cells.y != 0
        {
            return Err(Error::CellGeometry {
                width,
                height,
                cells_x: self.cells.x,
                cells_y: self.cells.y,
            });
        }
        let shsize = Dims::new(width / self.cells.x, height / self.cells.y);
        if self.track.x > shsize.x || self.track.y > shsize.y {
            return Err(Error::TrackerTooLarge(
                self.track.x,
                self.track.y,
                shsize.x,
                shsize.y,
            ));
        }
        Ok(shsize)
    }
}

/// The usable subapertures found on a sensor, in tracking order.
///
/// `subc[0]` is the reference subaperture: the one closest to the
/// centroid of all selected cells, with its tracker window recentred
/// on its measured spot.
#[derive(Debug, Clone, PartialEq)]
pub struct ShGeometry {
    pub sensor: Dims,
    pub shsize: Dims,
    pub track: Dims,
    /// Lower-left pixel of each tracker window in the raw frame.
    pub subc: Vec<Coord>,
    /// Lower-left pixel of each lenslet cell in the raw frame.
    pub gridc: Vec<Coord>,
}

impl ShGeometry {
    pub fn nsubap(&self) -> usize {
        self.subc.len()
    }

    /// An empty geometry; tracking and reconstruction treat it as a
    /// no-op rather than an error.
    pub fn empty(sensor: Dims, shsize: Dims, track: Dims) -> Self {
        Self {
            sensor,
            shsize,
            track,
            subc: Vec::new(),
            gridc: Vec::new(),
        }
    }
}
