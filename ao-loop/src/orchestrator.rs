//! The worker thread: the LISTEN / OPEN / CLOSED / CAL / SHUTDOWN
//! state machine.
//!
//! Each loop mode has an init (start the camera, stamp the logs), a
//! tight body that runs while the mode is unchanged, and a finish
//! (stop the camera). Mode changes are honoured at iteration
//! boundaries only; errors inside a body never cross the thread
//! boundary — they collapse to "continue" or a fall-back to LISTEN.

use nalgebra::DVector;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use ao_calib::engine;
use ao_recon::{CtrlBank, Reconstructor};
use ao_shwfs::{
    cog_track_full, cog_track_packed, correct_full_frame, correct_subaps, correlation_track_packed,
    apply_reference, CorrelationRef, ShGeometry,
};
use ao_types::{CalMode, LoopMode, WfcKind};

use crate::config::TrackMethod;
use crate::instrument::{Instrument, ACQUIRE_TIMEOUT};
use crate::shared::PendingRequest;

/// Run the worker until SHUTDOWN. Consumes the instrument; hardware is
/// released on the way out.
pub fn run_worker(mut inst: Instrument, bcast: broadcast::Sender<String>) {
    let shared = inst.shared.clone();
    info!("worker running, listening for commands");
    loop {
        handle_requests(&mut inst);
        match shared.mode() {
            LoopMode::Listen => {
                shared.wait_while_mode(LoopMode::Listen);
            }
            LoopMode::Open => run_open(&mut inst, &bcast),
            LoopMode::Closed => run_closed(&mut inst, &bcast),
            LoopMode::Calibrate => {
                run_calibration(&mut inst, &bcast);
                // calibration always returns to LISTEN
                shared.set_mode(LoopMode::Listen);
            }
            LoopMode::Shutdown => break,
        }
    }
    teardown(&mut inst);
}

// Serve requests the network side queued for the worker (it owns the
// devices and the measurement logs).
fn handle_requests(inst: &mut Instrument) {
    for req in inst.shared.take_requests() {
        match req {
            PendingRequest::ResetDm(v) => reset_kind(inst, WfcKind::DeformableMirror, v),
            PendingRequest::ResetDaq(v) => reset_kind(inst, WfcKind::TipTilt, v),
            PendingRequest::LogEnable(on) => {
                inst.sh_log.set_enabled(on);
                inst.wfc_log.set_enabled(on);
            }
            PendingRequest::LogReset => {
                if let Err(e) = inst.sh_log.reset() {
                    warn!("displacement log reset failed: {}", e);
                }
                if let Err(e) = inst.wfc_log.reset() {
                    warn!("control log reset failed: {}", e);
                }
            }
        }
    }
}

fn reset_kind(inst: &mut Instrument, kind: WfcKind, volts: Option<f64>) {
    let mut hit = false;
    for c in inst.correctors.iter_mut() {
        if c.kind() == kind {
            hit = true;
            if let Err(e) = c.reset_to(volts) {
                warn!("reset of {} failed: {}", c.name(), e);
            }
        }
    }
    if !hit {
        warn!("no {} corrector to reset", kind);
    }
}

fn stamp_logs(inst: &mut Instrument, what: &str) {
    let comment = inst.sh_log.comment.clone();
    let snap = inst.snapshot();
    inst.sh_log.msg(Some(&comment), what);
    inst.wfc_log.msg(Some(&comment), what);
    inst.sh_log.snapshot(&snap);
    inst.wfc_log.snapshot(&snap);
}

// Per-frame bookkeeping shared by both loop bodies. Returns true when
// this frame should emit periodic log lines.
fn tick(inst: &mut Instrument) -> bool {
    let frames = inst.clock.tick();
    inst.shared
        .frames
        .store(frames, std::sync::atomic::Ordering::Relaxed);
    inst.shared.set_fps(inst.clock.fps());
    let lf = inst.shared.tunables.lock().unwrap().log_fraction;
    inst.clock.should_log(lf)
}

fn rms_xy(disp: &DVector<f32>) -> (f32, f32) {
    let n = disp.len() / 2;
    if n == 0 {
        return (0.0, 0.0);
    }
    let mut sx = 0.0f32;
    let mut sy = 0.0f32;
    for i in 0..n {
        sx += disp[2 * i] * disp[2 * i];
        sy += disp[2 * i + 1] * disp[2 * i + 1];
    }
    ((sx / n as f32).sqrt(), (sy / n as f32).sqrt())
}

// ---------------------------
// open loop

fn run_open(inst: &mut Instrument, bcast: &broadcast::Sender<String>) {
    info!("entering open loop");
    stamp_logs(inst, "init open loop");
    if let Err(e) = inst.camera.start() {
        warn!("open-loop init failed: {}", e);
        inst.shared.set_mode(LoopMode::Listen);
        return;
    }
    let geom = inst.geometry().cloned();

    while inst.shared.mode() == LoopMode::Open {
        inst.sync_tunables();
        let frame = match inst.camera.acquire(Some(ACQUIRE_TIMEOUT)) {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(e) => {
                warn!("acquire failed in open loop: {}", e);
                inst.shared.set_mode(LoopMode::Listen);
                break;
            }
        };

        let fields = match (inst.store.dark.as_ref(), inst.store.flat.as_ref()) {
            (Some(d), Some(f)) => Some((d, f)),
            _ => None,
        };
        let corr = correct_full_frame(&frame, fields);
        let disp = match geom.as_ref() {
            Some(geom) => {
                let (disp, _stats) = cog_track_full(&corr, geom);
                inst.sh_log.vec_line("O", disp.as_slice());
                Some(disp)
            }
            None => None,
        };

        if let Some(msg) = inst.handle_saveimg(&frame) {
            let _ = bcast.send(msg);
        }
        if tick(inst) {
            if let Some(disp) = &disp {
                let (rx, ry) = rms_xy(disp);
                info!(
                    "open loop: frame {} fps {:.1} rms ({:.3}, {:.3})",
                    inst.clock.frames(),
                    inst.clock.fps(),
                    rx,
                    ry
                );
            } else {
                info!(
                    "open loop: frame {} fps {:.1} (no subaperture selection)",
                    inst.clock.frames(),
                    inst.clock.fps()
                );
            }
        }
        handle_requests(inst);
    }

    if let Err(e) = inst.camera.stop() {
        warn!("camera stop failed: {}", e);
    }
    info!("open loop done");
}

// ---------------------------
// closed loop

struct ClosedSetup {
    geom: ShGeometry,
    refc: DVector<f32>,
    recon: Reconstructor,
    corr_refs: Option<CorrelationRef>,
}

fn closed_init(inst: &mut Instrument) -> Option<ClosedSetup> {
    let Some(svd) = inst.store.svd.clone() else {
        warn!("closed loop refused: no influence decomposition");
        return None;
    };
    let Some(refc) = inst.store.refc.clone() else {
        warn!("closed loop refused: no pinhole reference");
        return None;
    };
    let Some(geom) = inst.geometry().cloned() else {
        warn!("closed loop refused: no subaperture selection");
        return None;
    };
    if svd.nmeas() != 2 * geom.nsubap() || refc.len() != 2 * geom.nsubap() {
        warn!(
            "closed loop refused: artefacts sized for {} measurements, selection has {} subapertures",
            svd.nmeas(),
            geom.nsubap()
        );
        return None;
    }

    if inst.tables.is_none() {
        match engine::run_gain(&inst.store) {
            Ok(tables) => inst.tables = Some(tables),
            Err(e) => {
                warn!("closed loop refused: {}", e);
                return None;
            }
        }
    }

    let corr_refs = match inst.tracking {
        TrackMethod::Cog => None,
        TrackMethod::Correlation => match inst.corr_refs.clone() {
            Some(r) => Some(r),
            None => {
                // capture references from one corrected frame
                if inst.camera.start().is_err() {
                    return None;
                }
                let frame = loop {
                    match inst.camera.acquire(Some(ACQUIRE_TIMEOUT)) {
                        Ok(Some(f)) => break f,
                        Ok(None) => continue,
                        Err(e) => {
                            warn!("reference capture failed: {}", e);
                            return None;
                        }
                    }
                };
                let fields = match (inst.store.dark.as_ref(), inst.store.flat.as_ref()) {
                    (Some(d), Some(f)) => Some((d, f)),
                    _ => None,
                };
                let corr = correct_full_frame(&frame, fields);
                let refs = CorrelationRef::capture(&corr, &geom);
                inst.corr_refs = Some(refs.clone());
                Some(refs)
            }
        },
    };

    Some(ClosedSetup {
        geom,
        refc,
        recon: Reconstructor::new(svd, inst.nmodes),
        corr_refs,
    })
}

fn run_closed(inst: &mut Instrument, bcast: &broadcast::Sender<String>) {
    info!("entering closed loop");
    let Some(setup) = closed_init(inst) else {
        inst.shared.set_mode(LoopMode::Listen);
        return;
    };
    stamp_logs(inst, "init closed loop");
    if let Err(e) = inst.camera.start() {
        warn!("closed-loop init failed: {}", e);
        inst.shared.set_mode(LoopMode::Listen);
        return;
    }

    let mut packed: Vec<u8> = Vec::new();
    let mut disp64 = DVector::<f64>::zeros(2 * setup.geom.nsubap());
    let log_tags: Vec<String> = inst
        .wfc_cfg
        .iter()
        .map(|c| format!("C-{}", c.name))
        .collect();
    let mut step_gains = vec![0.0f32; inst.wfc_cfg.len()];

    while inst.shared.mode() == LoopMode::Closed {
        inst.sync_tunables();
        let frame = match inst.camera.acquire(Some(ACQUIRE_TIMEOUT)) {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(e) => {
                warn!("acquire failed in closed loop: {}", e);
                inst.shared.set_mode(LoopMode::Listen);
                break;
            }
        };

        let tables = inst.tables.as_ref().expect("tables checked in init");
        if let Err(e) = correct_subaps(&frame, tables, &setup.geom, &mut packed) {
            error!("fast-path correction failed: {}", e);
            inst.shared.set_mode(LoopMode::Listen);
            break;
        }

        let mut disp = match (&setup.corr_refs, inst.tracking) {
            (Some(refs), TrackMethod::Correlation) => {
                correlation_track_packed(&packed, refs, &setup.geom, inst.scan)
            }
            _ => cog_track_packed(&packed, &setup.geom).0,
        };
        apply_reference(&mut disp, &setup.refc);
        let step = inst.shared.tunables.lock().unwrap().step;
        if step != (0.0, 0.0) {
            for i in 0..disp.len() / 2 {
                disp[2 * i] -= step.0;
                disp[2 * i + 1] -= step.1;
            }
        }

        for i in 0..disp.len() {
            disp64[i] = disp[i] as f64;
        }
        let total = setup.recon.reconstruct(&disp64);
        {
            let gains = inst.shared.tunables.lock().unwrap();
            for (i, cfg) in inst.wfc_cfg.iter().enumerate() {
                step_gains[i] = gains
                    .gains
                    .get(i)
                    .copied()
                    .unwrap_or(cfg.gain)
                    .field(cfg.step_field);
            }
        }
        let mut banks: Vec<CtrlBank<'_>> = inst
            .ctrl
            .iter_mut()
            .zip(step_gains.iter())
            .map(|(ctrl, &gain)| CtrlBank {
                ctrl: ctrl.as_mut_slice(),
                gain,
            })
            .collect();
        Reconstructor::distribute(&total, &mut banks);
        drop(banks);

        for wfc in 0..inst.correctors.len() {
            if let Err(e) = inst.apply_wfc(wfc) {
                warn!("corrector '{}' failed: {}, restarting", inst.wfc_cfg[wfc].name, e);
                if let Err(e) = inst.correctors[wfc].restart() {
                    error!("restart of '{}' failed: {}", inst.wfc_cfg[wfc].name, e);
                    inst.shared.set_mode(LoopMode::Listen);
                }
            }
        }
        if inst.shared.mode() != LoopMode::Closed {
            break;
        }

        inst.sh_log.vec_line("C", disp.as_slice());
        for (i, tag) in log_tags.iter().enumerate() {
            inst.wfc_log.vec_line(tag, &inst.ctrl[i]);
        }

        if let Some(msg) = inst.handle_saveimg(&frame) {
            let _ = bcast.send(msg);
        }
        if tick(inst) {
            let (rx, ry) = rms_xy(&disp);
            info!(
                "closed loop: frame {} fps {:.1} residual rms ({:.3}, {:.3}) ctrl[0] {:?}",
                inst.clock.frames(),
                inst.clock.fps(),
                rx,
                ry,
                &inst.ctrl[0]
            );
        }
        handle_requests(inst);
    }

    if let Err(e) = inst.camera.stop() {
        warn!("camera stop failed: {}", e);
    }
    info!("closed loop done");
}

// ---------------------------
// calibration

fn run_calibration(inst: &mut Instrument, bcast: &broadcast::Sender<String>) {
    let calmode = inst.shared.calmode();
    info!("calibration pass: {}", calmode);
    let field_frames = inst.field_frames;
    let settings = inst.calib_settings;

    let outcome: Result<(), ao_calib::Error> = match calmode {
        CalMode::Dark => {
            let (mut rig, store) = inst.calibration_parts();
            engine::run_dark(&mut rig, store, field_frames).map(|_| ())
        }
        CalMode::Flat => {
            let (mut rig, store) = inst.calibration_parts();
            engine::run_flat(&mut rig, store, field_frames).map(|_| ())
        }
        CalMode::Gain => match engine::run_gain(&inst.store) {
            Ok(tables) => {
                inst.tables = Some(tables);
                Ok(())
            }
            Err(e) => Err(e),
        },
        CalMode::SubapSel => {
            inst.sync_tunables();
            let cfg = inst.sh_cfg.clone();
            let res = {
                let (mut rig, store) = inst.calibration_parts();
                engine::run_subapsel(&mut rig, store, &cfg).map(|_| ())
            };
            // a fresh selection invalidates the per-window tables and
            // correlation references
            if res.is_ok() {
                inst.tables = None;
                inst.corr_refs = None;
            }
            res
        }
        CalMode::Pinhole => {
            let (mut rig, store) = inst.calibration_parts();
            engine::run_pinhole(&mut rig, store).map(|_| ())
        }
        CalMode::Influence => {
            let (mut rig, store) = inst.calibration_parts();
            engine::run_influence(&mut rig, store, &settings)
        }
        CalMode::LinTest => {
            let (mut rig, _store) = inst.calibration_parts();
            engine::run_lintest(&mut rig, &settings)
        }
    };

    match outcome {
        Ok(()) => {
            let _ = bcast.send(format!(
                "201 CALIBRATION {} COMPLETE",
                calmode.as_str().to_uppercase()
            ));
        }
        Err(e) => {
            warn!("calibration {} failed: {}", calmode, e);
            let _ = bcast.send(format!(
                "300 CALIBRATION {} FAILED: {}",
                calmode.as_str().to_uppercase(),
                e
            ));
        }
    }

    inst.shared.calibrated.store(
        inst.store.reconstruction_ready() && inst.geometry().is_some(),
        std::sync::atomic::Ordering::Relaxed,
    );
}

// ---------------------------
// teardown

fn teardown(inst: &mut Instrument) {
    info!("worker shutting down, releasing hardware");
    if let Err(e) = inst.camera.stop() {
        warn!("camera stop failed: {}", e);
    }
    for c in inst.correctors.iter_mut().rev() {
        if let Err(e) = c.reset_to(None) {
            warn!("parking {} failed: {}", c.name(), e);
        }
    }
    inst.sh_log.finish();
    inst.wfc_log.finish();
    info!(
        "worker done: {} frames processed, {:.1} fps at exit",
        inst.clock.frames(),
        inst.clock.fps()
    );
}
