//! Control-protocol integration over a real TCP socket.

mod common;

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ao_loop::protocol::ProtocolCtx;
use ao_loop::server;

struct Client {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Client {
    fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        let reader = BufReader::new(stream.try_clone().unwrap());
        Self {
            reader,
            writer: stream,
        }
    }

    fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).unwrap();
        self.writer.write_all(b"\n").unwrap();
    }

    /// Read lines until one contains `needle`. Lines that do not match
    /// (telemetry broadcasts, connect notices) are skipped.
    fn expect(&mut self, needle: &str, timeout: Duration) -> String {
        let start = Instant::now();
        loop {
            let mut line = String::new();
            match self.reader.read_line(&mut line) {
                Ok(0) => panic!("connection closed while waiting for '{}'", needle),
                Ok(_) => {
                    if line.contains(needle) {
                        return line.trim_end().to_string();
                    }
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => panic!("read error: {}", e),
            }
            assert!(
                start.elapsed() < timeout,
                "timed out waiting for '{}'",
                needle
            );
        }
    }
}

struct Daemon {
    addr: std::net::SocketAddr,
    worker: Option<std::thread::JoinHandle<()>>,
    runtime: Option<tokio::runtime::Runtime>,
    shared: Arc<ao_loop::shared::SharedState>,
    rig: ao_camera::SimRig,
}

impl Daemon {
    fn start(dir: &std::path::Path, seed_fields: bool) -> Self {
        let bench = common::build_bench(dir, seed_fields);
        let shared = bench.shared.clone();
        let rig = bench.rig.clone();

        let (bcast, _keepalive) = tokio::sync::broadcast::channel::<String>(64);
        let worker = {
            let bcast = bcast.clone();
            std::thread::spawn(move || ao_loop::orchestrator::run_worker(bench.inst, bcast))
        };

        let ctx = Arc::new(ProtocolCtx {
            shared: shared.clone(),
            sensor: bench.cfg.sensor.clone(),
            server: bench.cfg.server.clone(),
            wfc_count: bench.cfg.wfc.len(),
        });

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .worker_threads(2)
            .build()
            .unwrap();
        let (shutdown_tx, _shutdown_rx) = tokio::sync::mpsc::channel::<()>(4);
        let listener = runtime.block_on(async {
            tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap()
        });
        let addr = listener.local_addr().unwrap();
        runtime.spawn(server::serve(listener, ctx, bcast, shutdown_tx));

        // leak the keepalive receiver so broadcasts always have a home
        std::mem::forget(_keepalive);

        Self {
            addr,
            worker: Some(worker),
            runtime: Some(runtime),
            shared,
            rig,
        }
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.shared.set_mode(ao_types::LoopMode::Shutdown);
        if let Some(w) = self.worker.take() {
            let _ = w.join();
        }
        if let Some(rt) = self.runtime.take() {
            rt.shutdown_timeout(Duration::from_secs(1));
        }
    }
}

const T: Duration = Duration::from_secs(30);

#[test]
fn help_and_unknown_verbs() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = Daemon::start(dir.path(), false);
    let mut c = Client::connect(daemon.addr);

    c.send("help");
    c.expect("200 OK HELP", T);
    c.send("help calibrate");
    c.expect("pinhole", T);
    c.send("frobnicate");
    c.expect("400 UNKNOWN", T);
}

#[test]
fn mode_closed_guard_and_full_calibration_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = Daemon::start(dir.path(), true);
    let mut c = Client::connect(daemon.addr);

    // closing the loop before calibration is forbidden
    c.send("mode closed");
    c.expect("403 CALIBRATION REQUIRED", T);

    c.send("calibrate subap");
    c.expect("200 OK CALIBRATE SUBAP", T);
    c.expect("201 CALIBRATION SUBAP COMPLETE", T);

    c.send("calibrate pinhole");
    c.expect("201 CALIBRATION PINHOLE COMPLETE", T);

    c.send("calibrate influence");
    c.expect("201 CALIBRATION INFLUENCE COMPLETE", T);

    c.send("calibrate gain");
    c.expect("201 CALIBRATION GAIN COMPLETE", T);

    // now the loop may close
    c.send("mode closed");
    c.expect("201 OK MODE CLOSED", T);

    // and it actually corrects: inject a tilt and watch it cancel
    daemon.rig.set_atmosphere(0.8, -0.6);
    let start = Instant::now();
    loop {
        let (dx, dy) = daemon.rig.total_shift();
        if dx.abs() < 0.3 && dy.abs() < 0.3 {
            break;
        }
        assert!(start.elapsed() < T, "no convergence: ({}, {})", dx, dy);
        std::thread::sleep(Duration::from_millis(20));
    }

    c.send("mode listen");
    c.expect("201 OK MODE LISTEN", T);
}

#[test]
fn set_and_gain_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = Daemon::start(dir.path(), false);
    let mut c = Client::connect(daemon.addr);

    c.send("set lf 42");
    c.expect("200 OK SET LOGFRAC TO 42", T);
    c.send("set");
    c.expect("logfrac (lf):           42", T);

    c.send("gain diff 0 0.50");
    c.expect("200 OK SET DIFF GAIN FOR WFC 0 TO 0.50", T);
    c.send("gain diff 7 0.50");
    c.expect("403 INCORRECT WFC OR GAIN VALUE", T);

    assert_eq!(daemon.shared.tunables.lock().unwrap().gains[0].d, 0.5);
}

#[test]
fn broadcast_reaches_other_clients() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = Daemon::start(dir.path(), false);
    let mut a = Client::connect(daemon.addr);
    let mut b = Client::connect(daemon.addr);

    // drain the connect notice on both
    a.expect("CLIENT CONNECTED", T);

    b.send("broadcast hello there");
    a.expect("200 OK hello there", T);
}

#[test]
fn quit_closes_only_this_client() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = Daemon::start(dir.path(), false);
    let mut a = Client::connect(daemon.addr);
    let mut b = Client::connect(daemon.addr);

    a.send("quit");
    a.expect("200 OK EXIT", T);

    // the other client still works
    b.send("help");
    b.expect("200 OK HELP", T);
}

#[test]
fn overlong_line_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = Daemon::start(dir.path(), false);
    let mut c = Client::connect(daemon.addr);

    let long = "x".repeat(2000);
    c.send(&long);
    c.expect("400 COMMAND IGNORED: TOO LONG", T);
}

#[test]
fn resetdaq_parks_the_stage() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = Daemon::start(dir.path(), false);
    let mut c = Client::connect(daemon.addr);

    daemon.rig.set_mirror(1.0, 1.0);
    c.send("resetdaq");
    c.expect("200 OK RESETDAQ NEUTRAL", T);

    // the worker serves the request from LISTEN
    let start = Instant::now();
    while daemon.rig.mirror() != (0.0, 0.0) {
        assert!(start.elapsed() < T, "stage not parked");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn saveimg_dumps_pgm_files() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = Daemon::start(dir.path(), false);
    let mut c = Client::connect(daemon.addr);

    c.send("saveimg 3");
    c.expect("200 OK SAVING NEXT 3 IMAGES", T);
    c.send("mode open");
    c.expect("201 OK MODE OPEN", T);
    c.expect("FRAME CAPTURE COMPLETE", T);
    c.send("mode listen");
    c.expect("201 OK MODE LISTEN", T);

    let dumps: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_name()
                .to_string_lossy()
                .contains("bufdump")
        })
        .collect();
    assert_eq!(dumps.len(), 3);
    // binary PGM header
    let bytes = std::fs::read(dumps[0].path()).unwrap();
    assert!(bytes.starts_with(b"P5\n256 256\n"));
}
