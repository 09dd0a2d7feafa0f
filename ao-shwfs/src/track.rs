//! Spot tracking: centre of gravity and correlation.
//!
//! Both trackers report per-subaperture displacements relative to the
//! tracker-window centre, packed `[x0, y0, x1, y1, ..]`. Subtracting
//! the pinhole reference (see [apply_reference]) turns them into the
//! wavefront deviation fed to the reconstructor.

use nalgebra::{DMatrix, DVector};
use tracing::warn;

use ao_types::ScanAxes;

use crate::ShGeometry;

/// Half-width of the correlation search grid.
const CORR_HALF: i32 = 2;
/// Full correlation grid edge (5 x 5).
const CORR_N: usize = (2 * CORR_HALF + 1) as usize;

/// Aggregate intensity statistics of one tracking pass.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CogStats {
    /// Mean pixel intensity over all tracker windows.
    pub aver: f32,
    /// Maximum pixel seen in any tracker window.
    pub max: f32,
}

fn cog_window<F>(track_x: usize, track_y: usize, mut pixel: F) -> (f32, f32, f32, f32)
where
    F: FnMut(usize, usize) -> f32,
{
    let mut csum = 0.0f32;
    let mut csx = 0.0f32;
    let mut csy = 0.0f32;
    let mut max = 0.0f32;
    for iy in 0..track_y {
        for ix in 0..track_x {
            let fi = pixel(ix, iy);
            if fi > max {
                max = fi;
            }
            csum += fi;
            csx += fi * ix as f32;
            csy += fi * iy as f32;
        }
    }
    (csum, csx, csy, max)
}

/// Centre-of-gravity tracking over a full-frame corrected image.
///
/// Used in open loop, where the whole frame has been corrected into a
/// float matrix.
pub fn cog_track_full(corr: &DMatrix<f32>, geom: &ShGeometry) -> (DVector<f32>, CogStats) {
    let tx = geom.track.x as usize;
    let ty = geom.track.y as usize;
    let mut disp = DVector::<f32>::zeros(2 * geom.nsubap());
    let mut stats = CogStats::default();
    let mut sum = 0.0f32;

    for (sn, sc) in geom.subc.iter().enumerate() {
        let (csum, csx, csy, max) = cog_window(tx, ty, |ix, iy| {
            corr[(sc.y as usize + iy, sc.x as usize + ix)]
        });
        sum += csum;
        if max > stats.max {
            stats.max = max;
        }
        if csum > 0.0 {
            disp[2 * sn] = csx / csum - (geom.track.x / 2) as f32;
            disp[2 * sn + 1] = csy / csum - (geom.track.y / 2) as f32;
        }
    }
    if geom.nsubap() > 0 {
        stats.aver = sum / (geom.track.area() * geom.nsubap()) as f32;
    }
    (disp, stats)
}

/// Centre-of-gravity tracking over packed per-subaperture bytes (the
/// closed-loop output of [crate::correct_subaps]).
pub fn cog_track_packed(corr: &[u8], geom: &ShGeometry) -> (DVector<f32>, CogStats) {
    let tx = geom.track.x as usize;
    let ty = geom.track.y as usize;
    let cell = geom.track.area();
    let mut disp = DVector::<f32>::zeros(2 * geom.nsubap());
    let mut stats = CogStats::default();
    let mut sum = 0.0f32;

    if corr.len() < cell * geom.nsubap() {
        warn!(
            "packed frame holds {} bytes, need {}; tracking skipped",
            corr.len(),
            cell * geom.nsubap()
        );
        return (disp, stats);
    }

    for sn in 0..geom.nsubap() {
        let win = &corr[sn * cell..(sn + 1) * cell];
        let (csum, csx, csy, max) = cog_window(tx, ty, |ix, iy| win[iy * tx + ix] as f32);
        sum += csum;
        if max > stats.max {
            stats.max = max;
        }
        if csum > 0.0 {
            disp[2 * sn] = csx / csum - (geom.track.x / 2) as f32;
            disp[2 * sn + 1] = csy / csum - (geom.track.y / 2) as f32;
        }
    }
    if geom.nsubap() > 0 {
        stats.aver = sum / (cell * geom.nsubap()) as f32;
    }
    (disp, stats)
}

/// Per-subaperture reference windows for correlation tracking.
///
/// Each window is one lenslet-cell-sized (`2*track`) region around the
/// tracker window, captured from a corrected full frame, so SAD can be
/// evaluated at shifts up to [CORR_HALF] pixels.
#[derive(Debug, Clone)]
pub struct CorrelationRef {
    nsubap: usize,
    win_x: usize,
    win_y: usize,
    data: Vec<f32>,
}

impl CorrelationRef {
    /// Capture reference windows from a corrected full frame.
    pub fn capture(corr: &DMatrix<f32>, geom: &ShGeometry) -> Self {
        let tx = geom.track.x as usize;
        let ty = geom.track.y as usize;
        let win_x = 2 * tx;
        let win_y = 2 * ty;
        let mut data = vec![0.0f32; geom.nsubap() * win_x * win_y];
        for (sn, sc) in geom.subc.iter().enumerate() {
            // window origin, clamped so the 2*track region is in-frame
            let ox = (sc.x - tx as i32 / 2)
                .clamp(0, geom.sensor.x as i32 - win_x as i32) as usize;
            let oy = (sc.y - ty as i32 / 2)
                .clamp(0, geom.sensor.y as i32 - win_y as i32) as usize;
            let base = sn * win_x * win_y;
            for iy in 0..win_y {
                for ix in 0..win_x {
                    data[base + iy * win_x + ix] = corr[(oy + iy, ox + ix)];
                }
            }
        }
        Self {
            nsubap: geom.nsubap(),
            win_x,
            win_y,
            data,
        }
    }

    fn window(&self, sn: usize) -> &[f32] {
        let n = self.win_x * self.win_y;
        &self.data[sn * n..(sn + 1) * n]
    }
}

// Sum of absolute differences between a tracker window and a shifted
// region of the reference window.
fn sad(win: &[f32], tx: usize, ty: usize, refwin: &[f32], ref_stride: usize, sx: i32, sy: i32) -> f32 {
    let ox = (sx + tx as i32 / 2) as usize;
    let oy = (sy + ty as i32 / 2) as usize;
    let mut sum = 0.0f32;
    for iy in 0..ty {
        let r = &refwin[(oy + iy) * ref_stride + ox..(oy + iy) * ref_stride + ox + tx];
        let w = &win[iy * tx..iy * tx + tx];
        for (a, b) in w.iter().zip(r.iter()) {
            sum += (a - b).abs();
        }
    }
    sum
}

// Fit a parabola through the 5 per-axis sums and return the sub-pixel
// minimum position. The x-moments of the fixed sample grid are
// precomputed from CORR_N.
fn parabola_min(sig: &[f32; CORR_N]) -> f32 {
    let rnp = 1.0 / CORR_N as f32;
    let mut sxx = 0.0f32;
    let mut sxxxx = 0.0f32;
    for i in 0..CORR_N {
        let x = (i as i32 - CORR_HALF) as f32;
        sxx += x * x;
        sxxxx += x * x * x * x;
    }
    let da = 1.0 / (sxxxx - rnp * sxx * sxx);
    let db = 1.0 / sxx;

    let mut sy = 0.0f32;
    let mut sxy = 0.0f32;
    let mut sxxy = 0.0f32;
    for i in 0..CORR_N {
        let x = (i as i32 - CORR_HALF) as f32;
        let y = sig[i];
        sy += y;
        sxy += x * y;
        sxxy += x * x * y;
    }
    if sy <= 0.0 {
        return 0.0;
    }
    let a = (sxxy - rnp * sxx * sy) * da;
    let b = sxy * db;
    if a != 0.0 {
        -0.5 * b / a
    } else {
        0.0
    }
}

/// Correlation tracking against stored reference windows.
///
/// A 5x5 grid of squared SADs is evaluated per subaperture and the
/// minimum located by independent parabola fits in x and y. The scan
/// direction selects which axes are fitted; the other component is
/// reported as zero.
pub fn correlation_track_packed(
    corr: &[u8],
    refs: &CorrelationRef,
    geom: &ShGeometry,
    scan: ScanAxes,
) -> DVector<f32> {
    let tx = geom.track.x as usize;
    let ty = geom.track.y as usize;
    let cell = geom.track.area();
    let mut disp = DVector::<f32>::zeros(2 * geom.nsubap());

    if refs.nsubap != geom.nsubap() || corr.len() < cell * geom.nsubap() {
        warn!("correlation reference does not match geometry, tracking skipped");
        return disp;
    }

    let mut win = vec![0.0f32; cell];
    let mut diff = [[0.0f32; CORR_N]; CORR_N];

    for sn in 0..geom.nsubap() {
        for (dst, src) in win.iter_mut().zip(&corr[sn * cell..(sn + 1) * cell]) {
            *dst = *src as f32;
        }
        let refwin = refs.window(sn);

        match scan {
            ScanAxes::Xy => {
                for sx in -CORR_HALF..=CORR_HALF {
                    for sy in -CORR_HALF..=CORR_HALF {
                        let d = sad(&win, tx, ty, refwin, refs.win_x, sx, sy);
                        diff[(sx + CORR_HALF) as usize][(sy + CORR_HALF) as usize] = d * d;
                    }
                }
            }
            ScanAxes::X => {
                for sx in -CORR_HALF..=CORR_HALF {
                    let d = sad(&win, tx, ty, refwin, refs.win_x, sx, 0);
                    diff[(sx + CORR_HALF) as usize][CORR_HALF as usize] = d;
                }
            }
            ScanAxes::Y => {
                for sy in -CORR_HALF..=CORR_HALF {
                    let d = sad(&win, tx, ty, refwin, refs.win_x, 0, sy);
                    diff[CORR_HALF as usize][(sy + CORR_HALF) as usize] = d;
                }
            }
        }

        // the SAD minimum sits at the shift that moves the reference
        // onto the live spot, which is the negated spot motion
        if matches!(scan, ScanAxes::X | ScanAxes::Xy) {
            let mut sig = [0.0f32; CORR_N];
            for (ix, s) in sig.iter_mut().enumerate() {
                *s = if scan == ScanAxes::Xy {
                    diff[ix].iter().sum()
                } else {
                    diff[ix][CORR_HALF as usize]
                };
            }
            disp[2 * sn] = -parabola_min(&sig);
        }
        if matches!(scan, ScanAxes::Y | ScanAxes::Xy) {
            let mut sig = [0.0f32; CORR_N];
            for (iy, s) in sig.iter_mut().enumerate() {
                *s = if scan == ScanAxes::Xy {
                    (0..CORR_N).map(|ix| diff[ix][iy]).sum()
                } else {
                    diff[CORR_HALF as usize][iy]
                };
            }
            disp[2 * sn + 1] = -parabola_min(&sig);
        }
    }
    disp
}

/// Subtract the pinhole reference from measured displacements.
///
/// The observed displacement is relative to the tracker-window centre;
/// subtracting the reference recorded with a known-flat wavefront gives
/// the deviation the reconstructor acts on.
pub fn apply_reference(disp: &mut DVector<f32>, refc: &DVector<f32>) {
    let n = disp.len().min(refc.len());
    for i in 0..n {
        disp[i] -= refc[i];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Coord, Dims};
    use approx::assert_abs_diff_eq;

    fn geom(track: Dims, subc: Vec<Coord>, sensor: Dims) -> ShGeometry {
        let gridc = subc.clone();
        ShGeometry {
            sensor,
            shsize: Dims::new(track.x * 2, track.y * 2),
            track,
            subc,
            gridc,
        }
    }

    #[test]
    fn flat_window_reports_zero() {
        // no contrast: csum of a zero window is 0, displacement (0,0)
        let g = geom(Dims::new(16, 16), vec![Coord::new(4, 4)], Dims::new(64, 64));
        let corr = DMatrix::<f32>::zeros(64, 64);
        let (disp, stats) = cog_track_full(&corr, &g);
        assert_eq!(disp[0], 0.0);
        assert_eq!(disp[1], 0.0);
        assert_eq!(stats.max, 0.0);
    }

    #[test]
    fn uniform_window_centroid_offset() {
        // all pixels equal: cog at (track-1)/2, disp = -0.5 per axis
        let g = geom(Dims::new(16, 16), vec![Coord::new(0, 0)], Dims::new(32, 32));
        let corr = DMatrix::<f32>::from_element(32, 32, 10.0);
        let (disp, stats) = cog_track_full(&corr, &g);
        assert_abs_diff_eq!(disp[0], -0.5, epsilon = 1e-5);
        assert_abs_diff_eq!(disp[1], -0.5, epsilon = 1e-5);
        assert_abs_diff_eq!(stats.aver, 10.0, epsilon = 1e-5);
    }

    #[test]
    fn single_pixel_cog() {
        let g = geom(Dims::new(16, 16), vec![Coord::new(8, 8)], Dims::new(64, 64));
        let mut corr = DMatrix::<f32>::zeros(64, 64);
        // window pixel (ix=11, iy=5) -> frame (19, 13)
        corr[(13, 19)] = 50.0;
        let (disp, _) = cog_track_full(&corr, &g);
        assert_abs_diff_eq!(disp[0], 3.0, epsilon = 1e-5);
        assert_abs_diff_eq!(disp[1], -3.0, epsilon = 1e-5);
    }

    #[test]
    fn cog_mirrored_spots_negate() {
        // spots mirrored around the window centre produce negated
        // displacements
        let g = geom(Dims::new(16, 16), vec![Coord::new(0, 0)], Dims::new(32, 32));
        let mut a = DMatrix::<f32>::zeros(32, 32);
        let mut b = DMatrix::<f32>::zeros(32, 32);
        a[(8 + 3, 8 + 5)] = 100.0; // (ix, iy) = (13, 11)
        b[(8 - 3, 8 - 5)] = 100.0; // (ix, iy) = (3, 5)
        let (da, _) = cog_track_full(&a, &g);
        let (db, _) = cog_track_full(&b, &g);
        assert_abs_diff_eq!(da[0], -db[0], epsilon = 1e-5);
        assert_abs_diff_eq!(da[1], -db[1], epsilon = 1e-5);
    }

    #[test]
    fn packed_matches_full() {
        let track = Dims::new(8, 8);
        let g = geom(Dims::new(8, 8), vec![Coord::new(4, 4)], Dims::new(32, 32));
        let mut full = DMatrix::<f32>::zeros(32, 32);
        full[(7, 9)] = 40.0;
        full[(8, 10)] = 80.0;
        // pack the same window
        let mut packed = vec![0u8; track.area()];
        for iy in 0..8usize {
            for ix in 0..8usize {
                packed[iy * 8 + ix] = full[(4 + iy, 4 + ix)] as u8;
            }
        }
        let (df, _) = cog_track_full(&full, &g);
        let (dp, _) = cog_track_packed(&packed, &g);
        assert_abs_diff_eq!(df[0], dp[0], epsilon = 1e-5);
        assert_abs_diff_eq!(df[1], dp[1], epsilon = 1e-5);
    }

    #[test]
    fn empty_geometry_is_noop() {
        let g = ShGeometry::empty(Dims::new(64, 64), Dims::new(32, 32), Dims::new(16, 16));
        let corr = DMatrix::<f32>::zeros(64, 64);
        let (disp, _) = cog_track_full(&corr, &g);
        assert_eq!(disp.len(), 0);
        let (disp, _) = cog_track_packed(&[], &g);
        assert_eq!(disp.len(), 0);
    }

    fn gaussian_window(tx: usize, ty: usize, cx: f32, cy: f32) -> Vec<f32> {
        let mut out = vec![0.0f32; tx * ty];
        for iy in 0..ty {
            for ix in 0..tx {
                let dx = ix as f32 - cx;
                let dy = iy as f32 - cy;
                out[iy * tx + ix] = 200.0 * (-(dx * dx + dy * dy) / 8.0).exp();
            }
        }
        out
    }

    #[test]
    fn correlation_recovers_shift() {
        let track = Dims::new(16, 16);
        let g = geom(track, vec![Coord::new(8, 8)], Dims::new(32, 32));

        // reference: spot centred in the tracker window
        let mut full = DMatrix::<f32>::zeros(32, 32);
        for iy in 0..32usize {
            for ix in 0..32usize {
                let dx = ix as f32 - 16.0;
                let dy = iy as f32 - 16.0;
                full[(iy, ix)] = 200.0 * (-(dx * dx + dy * dy) / 8.0).exp();
            }
        }
        let refs = CorrelationRef::capture(&full, &g);

        // live window: the same spot moved by (+1, -1)
        let live = gaussian_window(16, 16, 8.0 + 1.0, 8.0 - 1.0);
        let packed: Vec<u8> = live.iter().map(|&v| v as u8).collect();
        let disp = correlation_track_packed(&packed, &refs, &g, ScanAxes::Xy);
        assert_abs_diff_eq!(disp[0], 1.0, epsilon = 0.25);
        assert_abs_diff_eq!(disp[1], -1.0, epsilon = 0.25);
    }

    #[test]
    fn correlation_scan_axis_policy() {
        let track = Dims::new(16, 16);
        let g = geom(track, vec![Coord::new(8, 8)], Dims::new(32, 32));
        let mut full = DMatrix::<f32>::zeros(32, 32);
        for iy in 0..32usize {
            for ix in 0..32usize {
                let dx = ix as f32 - 16.0;
                let dy = iy as f32 - 16.0;
                full[(iy, ix)] = 200.0 * (-(dx * dx + dy * dy) / 8.0).exp();
            }
        }
        let refs = CorrelationRef::capture(&full, &g);
        let live = gaussian_window(16, 16, 9.0, 9.0);
        let packed: Vec<u8> = live.iter().map(|&v| v as u8).collect();

        let dx_only = correlation_track_packed(&packed, &refs, &g, ScanAxes::X);
        assert!(dx_only[0].abs() > 0.2);
        assert_eq!(dx_only[1], 0.0);

        let dy_only = correlation_track_packed(&packed, &refs, &g, ScanAxes::Y);
        assert_eq!(dy_only[0], 0.0);
        assert!(dy_only[1].abs() > 0.2);
    }

    #[test]
    fn reference_subtraction() {
        let mut disp = DVector::from_vec(vec![1.0f32, 2.0, 3.0, 4.0]);
        let refc = DVector::from_vec(vec![0.5f32, 0.5, 0.5, 0.5]);
        apply_reference(&mut disp, &refc);
        assert_eq!(disp.as_slice(), &[0.5, 1.5, 2.5, 3.5]);
    }
}
