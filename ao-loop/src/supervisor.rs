//! Startup and teardown.
//!
//! The supervisor wires the components, spawns the worker thread, runs
//! the control server on a tokio runtime and tears everything down in
//! reverse order on SIGINT or a `shutdown` command.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use eyre::{Result, WrapErr};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ao_calib::{ArtefactPaths, CalibrationStore, StoreGeometry};
use ao_camera::{SimCamera, SimCameraConfig, SimRig};
use ao_datalog::{DataLog, OpenMode};
use ao_shwfs::Dims;
use ao_types::{LoopMode, WfcKind};
use ao_wfc::{Corrector, DeformableMirror, SimMirrorBus, SimTipTilt};

use crate::config::LoopConfig;
use crate::instrument::Instrument;
use crate::orchestrator;
use crate::protocol::ProtocolCtx;
use crate::server;
use crate::shared::{SharedState, Tunables};

#[derive(Debug, Parser)]
#[command(author, version, about = "adaptive-optics control loop daemon")]
pub struct CliArgs {
    /// Configuration file (TOML).
    pub config_file: PathBuf,
    /// Override the listen address from the config.
    #[arg(long)]
    pub listen: Option<String>,
}

fn init_tracing() {
    let evt_fmt = fmt::format()
        .with_timer(fmt::time::Uptime::default())
        .compact();
    let fmt_layer = fmt::layer().event_format(evt_fmt);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(filter)
        .init();
}

/// Build the simulated optical bench from the config.
///
/// Per-site hardware drivers plug in here; the tree ships with the
/// simulator so every code path can run anywhere.
fn build_bench(
    cfg: &LoopConfig,
) -> (Box<dyn ao_camera::FrameSource>, Vec<Box<dyn Corrector>>) {
    let rig = SimRig::new();
    let camera = SimCamera::new(
        SimCameraConfig {
            width: cfg.sensor.width,
            height: cfg.sensor.height,
            cells: cfg.sensor.cells,
            sigma: cfg.sim.sigma,
            peak: cfg.sim.peak,
            background: cfg.sim.background,
            noise: cfg.sim.noise,
            seed: cfg.sim.seed,
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
                cfg.sim.px_per_ctrl,
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
    (Box::new(camera), correctors)
}

pub fn run(args: CliArgs) -> Result<()> {
    color_eyre::install()?;
    dotenv::dotenv().ok();
    init_tracing();

    let start = Instant::now();
    info!(
        "starting {} {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );
    info!("at {}", chrono::Local::now().to_rfc2822());

    let mut cfg = LoopConfig::parse_file(&args.config_file)
        .wrap_err_with(|| format!("loading {}", args.config_file.display()))?;
    if let Some(listen) = args.listen {
        cfg.server.listen = listen;
    }

    if let Some(dir) = cfg.calib.data_prefix.parent() {
        std::fs::create_dir_all(dir)
            .wrap_err_with(|| format!("creating data dir {}", dir.display()))?;
    }

    // calibration artefacts: load whatever a previous run left behind
    let mut store = CalibrationStore::new(ArtefactPaths::new(&cfg.calib.data_prefix));
    let sh = cfg.sensor.sh_config();
    let shsize = sh
        .shsize(cfg.sensor.width, cfg.sensor.height)
        .expect("validated config");
    store
        .load(
            StoreGeometry {
                width: cfg.sensor.width,
                height: cfg.sensor.height,
                nact: cfg.wfc.iter().map(|w| w.nact).sum(),
                nsubap: 0,
            },
            shsize,
            Dims::new(cfg.sensor.track.0, cfg.sensor.track.1),
        )
        .wrap_err("loading calibration store")?;

    let log_mode = OpenMode::parse(&cfg.logs.mode).expect("validated config");
    let sh_log = DataLog::init(&cfg.logs.displacements, log_mode)
        .wrap_err("opening displacement log")?;
    let wfc_log =
        DataLog::init(&cfg.logs.controls, log_mode).wrap_err("opening control log")?;

    let shared = Arc::new(SharedState::new(Tunables {
        log_fraction: cfg.log_fraction,
        field_frames: cfg.sensor.field_frames,
        samini: cfg.sensor.samini,
        samxr: cfg.sensor.samxr,
        gains: cfg.wfc.iter().map(|w| w.gain).collect(),
        step: (0.0, 0.0),
    }));

    let (camera, correctors) = build_bench(&cfg);
    let inst = Instrument::new(&cfg, camera, correctors, store, sh_log, wfc_log, shared.clone());
    shared.calibrated.store(
        inst.store.reconstruction_ready() && inst.geometry().is_some(),
        std::sync::atomic::Ordering::Relaxed,
    );

    let (bcast, _keepalive) = broadcast::channel::<String>(64);
    let worker = {
        let bcast = bcast.clone();
        std::thread::Builder::new()
            .name("ao-worker".to_string())
            .spawn(move || orchestrator::run_worker(inst, bcast))
            .wrap_err("spawning worker thread")?
    };

    let ctx = Arc::new(ProtocolCtx {
        shared: shared.clone(),
        sensor: cfg.sensor.clone(),
        server: cfg.server.clone(),
        wfc_count: cfg.wfc.len(),
    });

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(2)
        .thread_name("ao-net")
        .build()
        .wrap_err("building tokio runtime")?;

    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(4);
    runtime.block_on(async {
        let listener = tokio::net::TcpListener::bind(&cfg.server.listen)
            .await
            .wrap_err_with(|| format!("binding {}", cfg.server.listen))?;
        info!("control server listening on {}", listener.local_addr()?);

        tokio::select! {
            res = server::serve(listener, ctx, bcast.clone(), shutdown_tx.clone()) => {
                res.wrap_err("control server failed")
            }
            _ = shutdown_rx.recv() => {
                info!("shutdown requested over the control channel");
                Ok(())
            }
            _ = tokio::signal::ctrl_c() => {
                info!("SIGINT, shutting down");
                let _ = bcast.send("200 OK SHUTTING DOWN NOW".to_string());
                Ok(())
            }
        }
    })?;

    // teardown: stop the worker (it releases the hardware), then the
    // runtime with its client connections
    shared.set_mode(LoopMode::Shutdown);
    if worker.join().is_err() {
        warn!("worker thread panicked during shutdown");
    }
    runtime.shutdown_timeout(std::time::Duration::from_secs(1));

    let elapsed = start.elapsed().as_secs_f64();
    let frames = shared.frames.load(std::sync::atomic::Ordering::Relaxed);
    info!(
        "ran for {:.0} seconds, processed {} frames ({:.1} fps overall)",
        elapsed,
        frames,
        frames as f64 / elapsed.max(1e-9)
    );
    Ok(())
}
