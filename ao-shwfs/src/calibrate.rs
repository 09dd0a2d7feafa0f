//! Dark/flat correction.
//!
//! Two paths: a float full-frame correction used in open loop and for
//! display data, and a saturating-integer per-subaperture path for the
//! closed loop, which only touches tracker-window pixels and works from
//! precomputed 16-bit dark and gain tables.

use machine_vision_formats::{pixel_format::Mono8, ImageStride};
use nalgebra::DMatrix;
use tracing::debug;

use crate::{Error, Result, ShGeometry};

/// Nominal output scale of the full-frame correction: `(raw-dark)/
/// (flat-dark)` is near 1 for a well-exposed frame, so a fixed
/// mid-scale factor puts the result in display range.
const FULL_FRAME_SCALE: f32 = 128.0;

/// Per-subaperture integer calibration tables.
///
/// Both tables are packed per subaperture: entry
/// `sn*track.area() + i*track.x + j` covers pixel `(j, i)` of
/// subaperture `sn`'s tracker window. `dark16` is the dark field times
/// 256; `gain` is `256*avg(flat-dark)/(flat-dark)` saturated to u16,
/// zero where the flat carries no signal.
#[derive(Debug, Clone, PartialEq)]
pub struct SubapTables {
    pub nsubap: usize,
    pub dark16: Vec<u16>,
    pub gain: Vec<u16>,
}

fn check_field(field: &DMatrix<f32>, geom: &ShGeometry) -> Result<()> {
    if field.nrows() != geom.sensor.y as usize || field.ncols() != geom.sensor.x as usize {
        return Err(Error::FieldSizeMismatch {
            got_rows: field.nrows(),
            got_cols: field.ncols(),
            want_rows: geom.sensor.y as usize,
            want_cols: geom.sensor.x as usize,
        });
    }
    Ok(())
}

/// Build the integer dark/gain tables from float dark and flat fields.
pub fn build_subap_tables(
    dark: &DMatrix<f32>,
    flat: &DMatrix<f32>,
    geom: &ShGeometry,
) -> Result<SubapTables> {
    check_field(dark, geom)?;
    check_field(flat, geom)?;

    let track = geom.track;
    let cell = track.area();

    // average flat-dark signal over all selected tracker windows
    let mut avg = 0.0f32;
    for sc in &geom.subc {
        for i in 0..track.y as usize {
            for j in 0..track.x as usize {
                let r = sc.y as usize + i;
                let c = sc.x as usize + j;
                avg += (flat[(r, c)] - dark[(r, c)]).max(0.0);
            }
        }
    }
    let denom = (geom.nsubap() * cell) as f32;
    if denom > 0.0 {
        avg /= denom;
    }
    debug!("subaperture flat-dark average: {}", avg);

    let mut dark16 = vec![0u16; geom.nsubap() * cell];
    let mut gain = vec![0u16; geom.nsubap() * cell];
    for (sn, sc) in geom.subc.iter().enumerate() {
        for i in 0..track.y as usize {
            for j in 0..track.x as usize {
                let r = sc.y as usize + i;
                let c = sc.x as usize + j;
                let idx = sn * cell + i * track.x as usize + j;
                dark16[idx] = (256.0 * dark[(r, c)]).clamp(0.0, 65535.0) as u16;
                let pix = flat[(r, c)] - dark[(r, c)];
                // a pixel the flat cannot see is useless, gain 0
                gain[idx] = if pix <= 0.0 {
                    0
                } else {
                    (256.0 * avg / pix).min(65535.0) as u16
                };
            }
        }
    }

    Ok(SubapTables {
        nsubap: geom.nsubap(),
        dark16,
        gain,
    })
}

/// Full-frame dark/flat correction into a float matrix.
///
/// With fields present the output is
/// `clamp(scale*(raw-dark)/(flat-dark), 0, 255)` with
/// `scale = 128` and 0 wherever `flat-dark <= 0`; without fields the
/// raw frame is copied through unchanged.
pub fn correct_full_frame<IM>(
    raw: &IM,
    fields: Option<(&DMatrix<f32>, &DMatrix<f32>)>,
) -> DMatrix<f32>
where
    IM: ImageStride<Mono8>,
{
    let w = raw.width() as usize;
    let h = raw.height() as usize;
    let stride = raw.stride();
    let data = raw.image_data();

    let mut out = DMatrix::<f32>::zeros(h, w);
    match fields {
        None => {
            for r in 0..h {
                let row = &data[r * stride..r * stride + w];
                for (c, &p) in row.iter().enumerate() {
                    out[(r, c)] = p as f32;
                }
            }
        }
        Some((dark, flat)) => {
            for r in 0..h {
                let row = &data[r * stride..r * stride + w];
                for (c, &p) in row.iter().enumerate() {
                    let lo = flat[(r, c)] - dark[(r, c)];
                    out[(r, c)] = if lo <= 0.0 {
                        0.0
                    } else {
                        let hi = (p as f32 - dark[(r, c)]).max(0.0);
                        (FULL_FRAME_SCALE * hi / lo).min(255.0)
                    };
                }
            }
        }
    }
    out
}

/// Per-subaperture saturating-integer correction (the closed-loop hot
/// path).
///
/// For each tracker-window pixel: `t = (raw << 8) - dark16` clamped at
/// zero, then `(t * gain) >> 16` clamped at 255. `out` is resized to
/// the packed layout of [SubapTables]. No allocation happens when
/// `out` already has the right capacity.
pub fn correct_subaps<IM>(
    raw: &IM,
    tables: &SubapTables,
    geom: &ShGeometry,
    out: &mut Vec<u8>,
) -> Result<()>
where
    IM: ImageStride<Mono8>,
{
    if tables.nsubap != geom.nsubap() {
        return Err(Error::TableMismatch {
            geom: geom.nsubap(),
            tables: tables.nsubap,
        });
    }
    let track = geom.track;
    let cell = track.area();
    out.clear();
    out.resize(geom.nsubap() * cell, 0);

    let stride = raw.stride();
    let data = raw.image_data();

    for (sn, sc) in geom.subc.iter().enumerate() {
        let base = sn * cell;
        for i in 0..track.y as usize {
            let src = (sc.y as usize + i) * stride + sc.x as usize;
            let row = &data[src..src + track.x as usize];
            let drow = &tables.dark16[base + i * track.x as usize..];
            let grow = &tables.gain[base + i * track.x as usize..];
            let orow = &mut out[base + i * track.x as usize..base + (i + 1) * track.x as usize];
            for (j, &p) in row.iter().enumerate() {
                // (raw<<8) <= 65280 and gain <= 65535, the product
                // stays inside u32
                let t = ((p as u32) << 8).saturating_sub(drow[j] as u32);
                let v = (t * grow[j] as u32) >> 16;
                orow[j] = v.min(255) as u8;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Coord, Dims};
    use ao_frame::Frame;
    use rand::{Rng, SeedableRng};

    fn geom_one(track: Dims, origin: Coord, sensor: Dims) -> ShGeometry {
        ShGeometry {
            sensor,
            shsize: Dims::new(track.x * 2, track.y * 2),
            track,
            subc: vec![origin],
            gridc: vec![Coord::new(0, 0)],
        }
    }

    #[test]
    fn full_frame_constant_fields_clamp() {
        // dark 4, flat 36, raw 100: 128*(100-4)/(36-4) = 384 -> 255
        let raw = Frame::filled(8, 8, 100);
        let dark = DMatrix::from_element(8, 8, 4.0);
        let flat = DMatrix::from_element(8, 8, 36.0);
        let out = correct_full_frame(&raw, Some((&dark, &flat)));
        assert!(out.iter().all(|&v| v == 255.0));
    }

    #[test]
    fn full_frame_dead_flat_is_zero() {
        let raw = Frame::filled(4, 4, 100);
        let dark = DMatrix::from_element(4, 4, 10.0);
        let flat = DMatrix::from_element(4, 4, 10.0);
        let out = correct_full_frame(&raw, Some((&dark, &flat)));
        assert!(out.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn full_frame_without_fields_copies_raw() {
        let mut raw = Frame::zeros(4, 4);
        *raw.pixel_mut(2, 1) = 42;
        let out = correct_full_frame(&raw, None);
        assert_eq!(out[(1, 2)], 42.0);
        assert_eq!(out[(0, 0)], 0.0);
    }

    #[test]
    fn subap_tables_uniform_fields() {
        let geom = geom_one(Dims::new(4, 4), Coord::new(2, 2), Dims::new(16, 16));
        let dark = DMatrix::from_element(16, 16, 4.0);
        let flat = DMatrix::from_element(16, 16, 36.0);
        let t = build_subap_tables(&dark, &flat, &geom).unwrap();
        // avg == flat-dark everywhere, so the gain is exactly 256
        assert!(t.gain.iter().all(|&g| g == 256));
        assert!(t.dark16.iter().all(|&d| d == 1024));
    }

    #[test]
    fn subap_tables_zero_gain_on_dead_pixels() {
        let geom = geom_one(Dims::new(2, 2), Coord::new(0, 0), Dims::new(4, 4));
        let dark = DMatrix::from_element(4, 4, 10.0);
        let mut flat = DMatrix::from_element(4, 4, 20.0);
        flat[(0, 0)] = 5.0; // below dark
        let t = build_subap_tables(&dark, &flat, &geom).unwrap();
        assert_eq!(t.gain[0], 0);
        assert!(t.gain[1] > 0);
    }

    #[test]
    fn fast_path_matches_uniform_expectation() {
        let geom = geom_one(Dims::new(4, 4), Coord::new(2, 2), Dims::new(16, 16));
        let dark = DMatrix::from_element(16, 16, 4.0);
        let flat = DMatrix::from_element(16, 16, 36.0);
        let t = build_subap_tables(&dark, &flat, &geom).unwrap();

        let raw = Frame::filled(16, 16, 100);
        let mut out = Vec::new();
        correct_subaps(&raw, &t, &geom, &mut out).unwrap();
        // ((100<<8) - 1024) * 256 >> 16 = (25600-1024)/256 = 96
        assert!(out.iter().all(|&v| v == 96));
    }

    #[test]
    fn fast_path_clamps_without_wraparound() {
        let geom = geom_one(Dims::new(2, 2), Coord::new(0, 0), Dims::new(4, 4));
        // dark brighter than any raw pixel: output clamps at 0
        let dark = DMatrix::from_element(4, 4, 250.0);
        let flat = DMatrix::from_element(4, 4, 255.0);
        let t = build_subap_tables(&dark, &flat, &geom).unwrap();
        let raw = Frame::filled(4, 4, 10);
        let mut out = Vec::new();
        correct_subaps(&raw, &t, &geom, &mut out).unwrap();
        assert!(out.iter().all(|&v| v == 0));

        // near-zero flat signal: huge gain, output clamps at 255
        let dark = DMatrix::from_element(4, 4, 0.0);
        let mut flat = DMatrix::from_element(4, 4, 200.0);
        flat[(1, 1)] = 0.01;
        let t = build_subap_tables(&dark, &flat, &geom).unwrap();
        let raw = Frame::filled(4, 4, 255);
        correct_subaps(&raw, &t, &geom, &mut out).unwrap();
        assert_eq!(out[1 * 2 + 1], 255);
    }

    #[test]
    fn fast_path_is_monotone_in_raw() {
        // raw1 <= raw2 pixelwise implies corr1 <= corr2 pixelwise
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(42);
        let geom = geom_one(Dims::new(8, 8), Coord::new(4, 4), Dims::new(16, 16));
        let dark = DMatrix::from_fn(16, 16, |_, _| rng.random_range(0.0..30.0));
        let flat = DMatrix::from_fn(16, 16, |_, _| rng.random_range(20.0..200.0));
        let t = build_subap_tables(&dark, &flat, &geom).unwrap();

        for _ in 0..20 {
            let mut lo = Frame::zeros(16, 16);
            let mut hi = Frame::zeros(16, 16);
            for y in 0..16 {
                for x in 0..16 {
                    let a: u8 = rng.random_range(0..=255);
                    let b: u8 = rng.random_range(0..=255);
                    *lo.pixel_mut(x, y) = a.min(b);
                    *hi.pixel_mut(x, y) = a.max(b);
                }
            }
            let mut clo = Vec::new();
            let mut chi = Vec::new();
            correct_subaps(&lo, &t, &geom, &mut clo).unwrap();
            correct_subaps(&hi, &t, &geom, &mut chi).unwrap();
            for (a, b) in clo.iter().zip(chi.iter()) {
                assert!(a <= b);
            }
        }
    }

    #[test]
    fn field_size_mismatch_rejected() {
        let geom = geom_one(Dims::new(4, 4), Coord::new(0, 0), Dims::new(16, 16));
        let dark = DMatrix::from_element(8, 8, 0.0);
        let flat = DMatrix::from_element(16, 16, 1.0);
        assert!(matches!(
            build_subap_tables(&dark, &flat, &geom),
            Err(Error::FieldSizeMismatch { .. })
        ));
    }
}
