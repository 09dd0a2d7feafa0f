//! Calibration passes.
//!
//! Each pass drives the [MeasurementRig] through acquire/poke cycles
//! and persists its result through the [CalibrationStore]. A pass that
//! fails leaves the store's previous artefacts untouched.

use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use ao_shwfs::{build_subap_tables, select_subapertures, ShConfig, ShGeometry, SubapTables};

use crate::{CalibrationStore, Error, MeasurementRig, Result};

/// Tunables of the measurement-driven passes.
#[derive(Debug, Clone, Copy)]
pub struct CalibSettings {
    /// Frames discarded after a poke before measuring, letting the
    /// device settle.
    pub skipframes: u32,
    /// Averaging rounds per actuator in the influence measurement.
    pub measurecount: u32,
    /// Steps of the linearity sweep.
    pub lintest_steps: u32,
}

impl Default for CalibSettings {
    fn default() -> Self {
        Self {
            skipframes: 10,
            measurecount: 3,
            lintest_steps: 10,
        }
    }
}

/// Min/max/average of a field matrix, reported after dark/flat
/// calibration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldStats {
    pub min: f32,
    pub max: f32,
    pub sum: f32,
    pub avg: f32,
}

pub fn field_stats(m: &DMatrix<f32>) -> FieldStats {
    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;
    let mut sum = 0.0f32;
    for &v in m.iter() {
        min = min.min(v);
        max = max.max(v);
        sum += v;
    }
    FieldStats {
        min,
        max,
        sum,
        avg: sum / m.len() as f32,
    }
}

/// Average `rounds` raw frames into a float matrix.
fn average_frames(rig: &mut dyn MeasurementRig, rounds: u32) -> Result<DMatrix<f32>> {
    debug!("averaging {} frames", rounds);
    let first = rig.acquire_raw()?;
    let (w, h) = (first.width() as usize, first.height() as usize);
    let mut acc = DMatrix::<f32>::zeros(h, w);
    let mut add = |frame: &ao_frame::Frame| {
        for y in 0..h {
            let row = frame.row(y as u32);
            for x in 0..w {
                acc[(y, x)] += row[x] as f32;
            }
        }
    };
    add(&first);
    for k in 1..rounds {
        if rounds >= 10 && k % (rounds / 10) == 0 {
            debug!("frame {}/{}", k, rounds);
        }
        let frame = rig.acquire_raw()?;
        add(&frame);
    }
    acc /= rounds as f32;
    Ok(acc)
}

fn with_source<T>(
    rig: &mut dyn MeasurementRig,
    body: impl FnOnce(&mut dyn MeasurementRig) -> Result<T>,
) -> Result<T> {
    rig.start_source()?;
    let out = body(rig);
    let stopped = rig.stop_source();
    let out = out?;
    stopped?;
    Ok(out)
}

/// Dark-field calibration: average `field_frames` frames with the
/// light path blocked.
pub fn run_dark(
    rig: &mut dyn MeasurementRig,
    store: &mut CalibrationStore,
    field_frames: u32,
) -> Result<FieldStats> {
    info!("dark-field calibration over {} frames", field_frames);
    let dark = with_source(rig, |rig| average_frames(rig, field_frames.max(1)))?;
    let stats = field_stats(&dark);
    store.save_dark(dark)?;
    info!(
        "dark field: min {:.2} max {:.2} avg {:.2}",
        stats.min, stats.max, stats.avg
    );
    Ok(stats)
}

/// Flat-field calibration: average `field_frames` frames of an evenly
/// illuminated pupil.
pub fn run_flat(
    rig: &mut dyn MeasurementRig,
    store: &mut CalibrationStore,
    field_frames: u32,
) -> Result<FieldStats> {
    info!("flat-field calibration over {} frames", field_frames);
    let flat = with_source(rig, |rig| average_frames(rig, field_frames.max(1)))?;
    let stats = field_stats(&flat);
    store.save_flat(flat)?;
    info!(
        "flat field: min {:.2} max {:.2} avg {:.2}",
        stats.min, stats.max, stats.avg
    );
    Ok(stats)
}

/// Build the per-subaperture integer correction tables from the stored
/// dark and flat fields. Requires both plus a subaperture selection.
pub fn run_gain(store: &CalibrationStore) -> Result<SubapTables> {
    let dark = store
        .dark
        .as_ref()
        .ok_or(Error::MissingArtefact("dark field", "dark"))?;
    let flat = store
        .flat
        .as_ref()
        .ok_or(Error::MissingArtefact("flat field", "flat"))?;
    let geom = store
        .geometry
        .as_ref()
        .ok_or(Error::MissingArtefact("subaperture selection", "subap"))?;
    let tables = build_subap_tables(dark, flat, geom)?;
    info!(
        "dark/gain tables built for {} subapertures",
        tables.nsubap
    );
    Ok(tables)
}

/// Subaperture selection: acquire one frame and find usable lenslet
/// cells. The resulting geometry is persisted.
pub fn run_subapsel(
    rig: &mut dyn MeasurementRig,
    store: &mut CalibrationStore,
    cfg: &ShConfig,
) -> Result<ShGeometry> {
    let frame = with_source(rig, |rig| rig.acquire_raw())?;
    // quick image sanity report, helps diagnose a dark pupil
    let mut min = u8::MAX;
    let mut max = 0u8;
    let mut sum = 0u64;
    for y in 0..frame.height() {
        for &p in frame.row(y) {
            min = min.min(p);
            max = max.max(p);
            sum += p as u64;
        }
    }
    info!(
        "selection frame: sum {} avg {:.2} range ({}, {})",
        sum,
        sum as f64 / (frame.width() as f64 * frame.height() as f64),
        min,
        max
    );
    let geom = select_subapertures(&frame, cfg)?;
    info!("selected {} subapertures", geom.nsubap());
    store.save_geometry(geom.clone())?;
    Ok(geom)
}

/// Pinhole calibration: with the pinhole in the light path and all
/// correctors zeroed, one tracked frame defines the flat-wavefront
/// reference displacements.
pub fn run_pinhole(
    rig: &mut dyn MeasurementRig,
    store: &mut CalibrationStore,
) -> Result<DVector<f32>> {
    rig.zero_controls()?;
    let disp = with_source(rig, |rig| rig.acquire_tracked())?;
    info!(
        "pinhole reference recorded over {} subapertures",
        disp.len() / 2
    );
    store.save_pinhole(disp.clone())?;
    Ok(disp)
}

/// Influence-matrix calibration.
///
/// Every actuator of every corrector is poked to the top and bottom of
/// its calibration range `measurecount` times; the averaged
/// displacement difference, normalised by the poke amplitude, forms
/// one column of the influence matrix. The matrix is decomposed and
/// self-checked with a random test vector before anything is
/// persisted.
pub fn run_influence(
    rig: &mut dyn MeasurementRig,
    store: &mut CalibrationStore,
    settings: &CalibSettings,
) -> Result<()> {
    if store.refc.is_none() {
        return Err(Error::MissingArtefact("pinhole reference", "pinhole"));
    }

    let nact_total: usize = (0..rig.wfc_count()).map(|w| rig.nact(w)).sum();
    rig.zero_controls()?;

    let infl = with_source(rig, |rig| {
        // probe one frame to learn the live subaperture count
        let probe = rig.acquire_tracked()?;
        let nmeas = probe.len();
        let nsubap = nmeas / 2;
        info!(
            "measuring influence of {} actuators on {} subapertures",
            nact_total, nsubap
        );
        let mut infl = DMatrix::<f64>::zeros(nmeas, nact_total);

        let mut col = 0usize;
        for wfc in 0..rig.wfc_count() {
            let (lo, hi) = rig.calrange(wfc);
            let span = (hi - lo) as f64;
            for act in 0..rig.nact(wfc) {
                info!("actuator {}/{} (wfc {})", act + 1, rig.nact(wfc), wfc);
                let mut acc = DVector::<f64>::zeros(nmeas);
                for _ in 0..settings.measurecount.max(1) {
                    rig.set_actuator(wfc, act, hi)?;
                    for _ in 0..settings.skipframes {
                        rig.acquire_tracked()?;
                    }
                    let plus = rig.acquire_tracked()?;
                    rig.set_actuator(wfc, act, lo)?;
                    for _ in 0..settings.skipframes {
                        rig.acquire_tracked()?;
                    }
                    let minus = rig.acquire_tracked()?;
                    for i in 0..nmeas {
                        acc[i] += (plus[i] - minus[i]) as f64;
                    }
                }
                let norm = span * settings.measurecount.max(1) as f64;
                for i in 0..nmeas {
                    infl[(i, col)] = acc[i] / norm;
                }
                rig.set_actuator(wfc, act, 0.0)?;
                col += 1;
            }
        }
        Ok(infl)
    })?;
    rig.zero_controls()?;

    let svd = ao_recon::SvdTriple::decompose(&infl)?;
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let test = DVector::from_fn(nact_total, |_, _| rng.random_range(-1.0..1.0));
    svd.self_check(&infl, &test)?;
    info!(
        "influence SVD verified: condition {:.3e}, rank deficit {}",
        svd.condition_number(),
        svd.rank_deficit()
    );

    let nsubap = infl.nrows() / 2;
    store.save_influence(infl, svd, nsubap)?;
    Ok(())
}

/// Linearity test: sweep every actuator over its calibration range and
/// log the tracked response, tagged `L`.
pub fn run_lintest(rig: &mut dyn MeasurementRig, settings: &CalibSettings) -> Result<()> {
    let steps = settings.lintest_steps.max(1);
    rig.zero_controls()?;
    with_source(rig, |rig| {
        for wfc in 0..rig.wfc_count() {
            let (lo, hi) = rig.calrange(wfc);
            for act in 0..rig.nact(wfc) {
                info!("linearity sweep: wfc {} actuator {}", wfc, act);
                for k in 0..steps {
                    let value = lo + (k + 1) as f32 / steps as f32 * (hi - lo);
                    rig.set_actuator(wfc, act, value)?;
                    for _ in 0..settings.skipframes {
                        rig.acquire_tracked()?;
                    }
                    let disp = rig.acquire_tracked()?;
                    rig.log_sweep("L", &disp);
                }
                rig.set_actuator(wfc, act, 0.0)?;
            }
        }
        Ok(())
    })?;
    rig.zero_controls()
}
