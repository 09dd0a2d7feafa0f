//! Subaperture selection.
//!
//! One-shot pass over a raw frame deciding which lenslet cells carry
//! enough light to track, where their tracker windows sit, and which
//! cell serves as the reference.

use machine_vision_formats::{pixel_format::Mono8, ImageStride};
use tracing::{debug, info};

use crate::{Coord, Dims, Error, Result, ShConfig, ShGeometry};

// Thresholded centre of gravity over one window of the raw frame.
// Pixels at or below `samini` do not contribute, otherwise the position
// estimate gets pulled to the window centre by the background.
fn window_cog<IM>(im: &IM, origin: Coord, win: Dims, samini: f32) -> (f32, f32, f32)
where
    IM: ImageStride<Mono8>,
{
    let data = im.image_data();
    let stride = im.stride();
    let mut csum = 0.0f32;
    let mut csx = 0.0f32;
    let mut csy = 0.0f32;
    for iy in 0..win.y as usize {
        let row_start = (origin.y as usize + iy) * stride + origin.x as usize;
        let row = &data[row_start..row_start + win.x as usize];
        for (ix, &p) in row.iter().enumerate() {
            let fi = (p as f32 - samini).max(0.0);
            csum += fi;
            csx += fi * ix as f32;
            csy += fi * iy as f32;
        }
    }
    (csum, csx, csy)
}

// The C heritage rounds by adding 0.5 and truncating.
fn round_half_up(v: f32) -> i32 {
    (v + 0.5).floor() as i32
}

fn clamp_window(c: Coord, sensor: Dims, track: Dims) -> Coord {
    Coord::new(
        c.x.clamp(0, (sensor.x - track.x) as i32),
        c.y.clamp(0, (sensor.y - track.y) as i32),
    )
}

/// Select usable subapertures on a raw frame.
///
/// For every lenslet cell with thresholded intensity above zero the
/// tracker-window origin is placed so the window is centred on the
/// cell's centre of gravity. The cell closest to the centroid of all
/// selected cells is promoted to index 0 and recentred with a second
/// CoG pass. `samxr > 0` then drops outliers beyond that radius;
/// `samxr < 0` erodes the selection map edge `|samxr|` times, which
/// keeps the selected set 4-connected for non-circular pupils.
pub fn select_subapertures<IM>(im: &IM, cfg: &ShConfig) -> Result<ShGeometry>
where
    IM: ImageStride<Mono8>,
{
    let sensor = Dims::new(im.width(), im.height());
    let shsize = cfg.shsize(sensor.x, sensor.y)?;
    let track = cfg.track;

    let cx_cells = cfg.cells.x as usize;
    let cy_cells = cfg.cells.y as usize;

    let mut apmap = vec![false; cx_cells * cy_cells];
    let mut subc: Vec<Coord> = Vec::new();
    // grid coordinates in cell units until the very end
    let mut gridc: Vec<Coord> = Vec::new();
    let mut cx = 0.0f32;
    let mut cy = 0.0f32;

    info!("selecting subapertures on {}x{} frame", sensor.x, sensor.y);

    for isy in 0..cy_cells {
        for isx in 0..cx_cells {
            let origin = Coord::new(isx as i32 * shsize.x as i32, isy as i32 * shsize.y as i32);
            let (csum, csx, csy) = window_cog(im, origin, shsize, cfg.samini);
            if csum > 0.0 {
                subc.push(Coord::new(
                    origin.x - track.x as i32 / 2 + round_half_up(csx / csum),
                    origin.y - track.y as i32 / 2 + round_half_up(csy / csum),
                ));
                gridc.push(Coord::new(isx as i32, isy as i32));
                apmap[isy * cx_cells + isx] = true;
                cx += origin.x as f32;
                cy += origin.y as f32;
            }
        }
    }

    if subc.is_empty() {
        return Err(Error::NoSubapertures);
    }
    let found = subc.len();
    debug!("CoG pass kept {} cells with intensity above threshold", found);

    cx /= found as f32;
    cy /= found as f32;

    // promote the subaperture closest to the selection centroid
    let mut csa = 0;
    let mut rmin = f32::INFINITY;
    for (i, c) in subc.iter().enumerate() {
        let dist = ((c.x as f32 - cx).powi(2) + (c.y as f32 - cy).powi(2)).sqrt();
        if dist < rmin {
            rmin = dist;
            csa = i;
        }
    }
    subc.swap(0, csa);
    gridc.swap(0, csa);

    // Recentre the reference window: the first pass centred it on the
    // cell CoG measured in cell-local coordinates, which can be off if
    // the spot sits far from the cell centre. Measure again over a
    // cell-sized region around the current window.
    let region = Coord::new(
        (subc[0].x - track.x as i32 / 2).clamp(0, (sensor.x - shsize.x) as i32),
        (subc[0].y - track.y as i32 / 2).clamp(0, (sensor.y - shsize.y) as i32),
    );
    let (csum, csx, csy) = window_cog(im, region, shsize, cfg.samini);
    if csum > 0.0 {
        let old = subc[0];
        subc[0].x += round_half_up(csx / csum) - track.x as i32;
        subc[0].y += round_half_up(csy / csum) - track.y as i32;
        debug!(
            "reference window moved ({},{}) -> ({},{})",
            old.x, old.y, subc[0].x, subc[0].y
        );
    }

    for c in subc.iter_mut() {
        *c = clamp_window(*c, sensor, track);
    }

    if cfg.samxr > 0 {
        let samxr = cfg.samxr as f32;
        let mut sn = 1;
        while sn < subc.len() {
            let d = ((subc[sn].x as f32 - cx).powi(2) + (subc[sn].y as f32 - cy).powi(2)).sqrt();
            if d > samxr {
                subc.remove(sn);
                gridc.remove(sn);
            } else {
                sn += 1;
            }
        }
    }

    let mut passes = -cfg.samxr;
    while passes > 0 {
        passes -= 1;
        let mut apmap2 = vec![false; cx_cells * cy_cells];
        // the reference always survives erosion
        apmap2[gridc[0].y as usize * cx_cells + gridc[0].x as usize] = true;

        let mut sn = 1;
        while sn < subc.len() {
            let isx = gridc[sn].x as usize;
            let isy = gridc[sn].y as usize;
            let on_border =
                isx == 0 || isx >= cx_cells - 1 || isy == 0 || isy >= cy_cells - 1;
            let missing_neighbour = on_border
                || !apmap[isy * cx_cells + isx - 1]
                || !apmap[isy * cx_cells + isx + 1]
                || !apmap[(isy - 1) * cx_cells + isx]
                || !apmap[(isy + 1) * cx_cells + isx];
            if missing_neighbour {
                subc.remove(sn);
                gridc.remove(sn);
            } else {
                apmap2[isy * cx_cells + isx] = true;
                sn += 1;
            }
        }
        apmap = apmap2;
    }

    info!("selected {} usable subapertures", subc.len());

    // scale grid coordinates from cell units to pixels
    for g in gridc.iter_mut() {
        g.x *= shsize.x as i32;
        g.y *= shsize.y as i32;
    }

    Ok(ShGeometry {
        sensor,
        shsize,
        track,
        subc,
        gridc,
    })
}
