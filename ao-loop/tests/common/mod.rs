//! Shared test bench: a full instrument over the simulated optical
//! bench, with artefacts in a temp directory.

use std::sync::Arc;

use ao_calib::{ArtefactPaths, CalibrationStore};
use ao_camera::{SimCamera, SimCameraConfig, SimRig};
use ao_datalog::{DataLog, OpenMode};
use ao_loop::config::LoopConfig;
use ao_loop::instrument::Instrument;
use ao_loop::shared::{SharedState, Tunables};
use ao_types::WfcKind;
use ao_wfc::{Corrector, DeformableMirror, SimMirrorBus, SimTipTilt};
use nalgebra::DMatrix;

/// Spot motion per unit of tip-tilt control in the simulator.
const PX_PER_CTRL: f32 = 2.0;

pub fn test_config(dir: &std::path::Path) -> LoopConfig {
    let text = format!(
        r#"
log_fraction = 0

[sensor]
width = 256
height = 256
cells = [8, 8]
track = [16, 16]
samini = 20.0
field_frames = 3

[calib]
data_prefix = "{data}"
skipframes = 1
measurecount = 2
lintest_steps = 3

[logs]
displacements = "{shlog}"
controls = "{wfclog}"

[[wfc]]
name = "TT"
kind = "tip-tilt"
nact = 2
"#,
        data = dir.join("sh").display(),
        shlog = dir.join("sh-offsets.dat").display(),
        wfclog = dir.join("wfc-signals.dat").display(),
    );
    let cfg: LoopConfig = toml::from_str(&text).unwrap();
    cfg.validate().unwrap();
    cfg
}

pub struct Bench {
    pub inst: Instrument,
    pub rig: SimRig,
    pub shared: Arc<SharedState>,
    pub cfg: LoopConfig,
}

/// Build an instrument over the simulator. `seed_fields` pre-seeds a
/// constant dark (4.0) and flat (36.0) so the gain tables come out
/// uniform.
pub fn build_bench(dir: &std::path::Path, seed_fields: bool) -> Bench {
    let cfg = test_config(dir);
    let rig = SimRig::new();

    let camera = SimCamera::new(
        SimCameraConfig {
            width: cfg.sensor.width,
            height: cfg.sensor.height,
            cells: cfg.sensor.cells,
            sigma: 3.0,
            peak: 200.0,
            background: 5,
            noise: 0,
            seed: 1,
        },
        rig.clone(),
    );

    let correctors: Vec<Box<dyn Corrector>> = cfg
        .wfc
        .iter()
        .map(|w| match w.kind {
            WfcKind::TipTilt => Box::new(SimTipTilt::new(
                w.name.clone(),
                rig.clone(),
                PX_PER_CTRL,
                w.calrange,
            )) as Box<dyn Corrector>,
            WfcKind::DeformableMirror => Box::new(DeformableMirror::new(
                w.name.clone(),
                SimMirrorBus::new(),
                w.nact,
                w.calrange,
            )) as Box<dyn Corrector>,
        })
        .collect();

    let mut store = CalibrationStore::new(ArtefactPaths::new(&cfg.calib.data_prefix));
    if seed_fields {
        store
            .save_dark(DMatrix::from_element(256, 256, 4.0))
            .unwrap();
        store
            .save_flat(DMatrix::from_element(256, 256, 36.0))
            .unwrap();
    }

    let sh_log = DataLog::init(&cfg.logs.displacements, OpenMode::Write).unwrap();
    let wfc_log = DataLog::init(&cfg.logs.controls, OpenMode::Write).unwrap();

    let shared = Arc::new(SharedState::new(Tunables {
        log_fraction: cfg.log_fraction,
        field_frames: cfg.sensor.field_frames,
        samini: cfg.sensor.samini,
        samxr: cfg.sensor.samxr,
        gains: cfg.wfc.iter().map(|w| w.gain).collect(),
        step: (0.0, 0.0),
    }));

    let inst = Instrument::new(
        &cfg,
        Box::new(camera),
        correctors,
        store,
        sh_log,
        wfc_log,
        shared.clone(),
    );

    Bench {
        inst,
        rig,
        shared,
        cfg,
    }
}
