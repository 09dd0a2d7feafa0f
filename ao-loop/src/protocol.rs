//! The control protocol: whitespace-tokenised verbs with HTTP-flavoured
//! reply codes.
//!
//! `2xx` success, `3xx` server-side failure, `4xx` client error.
//! Replies go to the issuing client; acknowledgements of state changes
//! are broadcast to everyone. Command handling itself is synchronous
//! and free of I/O so it can be tested without a socket.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use ao_types::{CalMode, GainField, LoopMode};

use crate::config::{SensorConfig, ServerConfig};
use crate::shared::{PendingRequest, SharedState};

/// What the connection task should do with the outcome of one line.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Send to the issuing client only.
    Reply(String),
    /// Send to every connected client.
    Broadcast(String),
    /// Close the issuing connection.
    Close,
    /// Begin daemon shutdown.
    Shutdown,
}

/// Immutable command-handling context shared by all connections.
pub struct ProtocolCtx {
    pub shared: Arc<SharedState>,
    pub sensor: SensorConfig,
    pub server: ServerConfig,
    /// Corrector count, for `gain` index validation.
    pub wfc_count: usize,
}

const HELP_GENERAL: &str = "\
200 OK HELP
help [topic]:           help, optionally on a topic.
mode <mode>:            open or close the loop (open|closed|listen).
calibrate <mode>:       calibrate the system (dark|flat|gain|subap|pinhole|influence|lintest).
set [prop] [val]:       set or query properties (lf, ff, samini, samxr).
gain <prop|int|diff> <wfc> <val>: set a gain field for a corrector.
step [x|y] [val]:       offset the reference displacements.
log <on|off|reset>:     control the measurement logs.
saveimg <n>:            buffer and dump the next n raw frames.
resetdm [volt]:         park all DM electrodes.
resetdaq [volt]:        park the tip-tilt DAC.
broadcast <msg>:        echo a message to all clients.
shutdown:               stop the daemon.
quit or exit:           close this connection.";

fn help_topic(topic: &str) -> Option<&'static str> {
    match topic {
        "mode" => Some(
            "200 OK HELP MODE
mode <mode>: switch the loop state.
   open:    acquire and measure, do not drive correctors.
   closed:  measure, reconstruct and correct each frame.
   listen:  hold the loop idle, awaiting commands.",
        ),
        "calibrate" => Some(
            "200 OK HELP CALIBRATE
calibrate <mode>: run one calibration pass.
   dark:      average frames into a dark field.
   flat:      average frames into a flat field.
   gain:      build the per-subaperture dark/gain tables.
   subap:     select usable subapertures from one frame.
   pinhole:   record the flat-wavefront reference.
   influence: measure the influence matrix and decompose it.
   lintest:   sweep every actuator and log the response.",
        ),
        "set" => Some(
            "200 OK HELP SET
set [prop] [val]: set or query property values.
   lf [i]:     log fraction, periodic lines every i frames.
   ff [i]:     frames averaged into a dark/flat field.
   samini [f]: minimum intensity for subaperture selection.
   samxr [i]:  selection radius (>0) or erosion passes (<0).
   without arguments the current values are reported.",
        ),
        "gain" => Some(
            "200 OK HELP GAIN
gain prop <wfc> <f>: set proportional gain for a corrector.
gain int <wfc> <f>:  set integral gain.
gain diff <wfc> <f>: set differential gain.",
        ),
        "log" => Some(
            "200 OK HELP LOG
log on:    enable the measurement logs.
log off:   disable them without closing the files.
log reset: truncate and restart the log files.",
        ),
        _ => None,
    }
}

fn set_query(ctx: &ProtocolCtx) -> String {
    let t = ctx.shared.tunables.lock().unwrap();
    let s = &ctx.sensor;
    let shx = s.width / s.cells.0;
    let shy = s.height / s.cells.1;
    format!(
        "200 OK VALUES AS FOLLOWS:
logfrac (lf):           {}
fieldframes (ff):       {}
SH array:               {}x{} cells
cell size:              {}x{} pixels
track size:             {}x{} pixels
ccd size:               {}x{} pixels
samxr:                  {}
samini:                 {:.2}
frames:                 {}
fps:                    {:.2}",
        t.log_fraction,
        t.field_frames,
        s.cells.0,
        s.cells.1,
        shx,
        shy,
        s.track.0,
        s.track.1,
        s.width,
        s.height,
        t.samxr,
        t.samini,
        ctx.shared.frames.load(Ordering::Relaxed),
        ctx.shared.fps(),
    )
}

fn handle_mode(ctx: &ProtocolCtx, args: &[&str]) -> Vec<Action> {
    let Some(&which) = args.first() else {
        return vec![Action::Reply("402 MODE REQUIRES ARG".into())];
    };
    let Ok(mode) = which.parse::<LoopMode>() else {
        return vec![Action::Reply("401 UNKNOWN MODE".into())];
    };
    if mode == LoopMode::Closed && !ctx.shared.calibrated.load(Ordering::Relaxed) {
        return vec![Action::Reply(
            "403 CALIBRATION REQUIRED, REMAINING IN LISTEN".into(),
        )];
    }
    ctx.shared.set_mode(mode);
    vec![Action::Broadcast(format!(
        "201 OK MODE {}",
        mode.as_str().to_uppercase()
    ))]
}

fn handle_calibrate(ctx: &ProtocolCtx, args: &[&str]) -> Vec<Action> {
    let Some(&which) = args.first() else {
        return vec![Action::Reply("402 CALIBRATE REQUIRES ARG".into())];
    };
    let Ok(calmode) = which.parse::<CalMode>() else {
        return vec![Action::Reply("401 UNKNOWN CALIBRATION".into())];
    };
    ctx.shared.set_calibrate(calmode);
    vec![Action::Broadcast(format!(
        "200 OK CALIBRATE {}",
        calmode.as_str().to_uppercase()
    ))]
}

fn handle_set(ctx: &ProtocolCtx, args: &[&str]) -> Vec<Action> {
    if args.is_empty() {
        return vec![Action::Reply(set_query(ctx))];
    }
    if args.len() < 2 {
        return vec![Action::Reply("402 SET REQUIRES PROP AND VALUE".into())];
    }
    let prop = args[0];
    let val = args[1];
    let mut t = ctx.shared.tunables.lock().unwrap();
    match prop {
        "lf" => match val.parse::<u32>() {
            Ok(v) => {
                t.log_fraction = v;
                vec![Action::Broadcast(format!("200 OK SET LOGFRAC TO {}", v))]
            }
            Err(_) => vec![Action::Reply("401 BAD VALUE".into())],
        },
        "ff" => match val.parse::<u32>() {
            Ok(v) => {
                t.field_frames = v;
                vec![Action::Broadcast(format!("200 OK SET FIELDFRAMES TO {}", v))]
            }
            Err(_) => vec![Action::Reply("401 BAD VALUE".into())],
        },
        "samini" => match val.parse::<f32>() {
            Ok(v) => {
                t.samini = v;
                vec![Action::Broadcast(format!("200 OK SET SAMINI TO {:.2}", v))]
            }
            Err(_) => vec![Action::Reply("401 BAD VALUE".into())],
        },
        "samxr" => match val.parse::<i32>() {
            Ok(v) => {
                t.samxr = v;
                vec![Action::Broadcast(format!("200 OK SET SAMXR TO {}", v))]
            }
            Err(_) => vec![Action::Reply("401 BAD VALUE".into())],
        },
        _ => vec![Action::Reply("401 UNKNOWN PROPERTY, CANNOT SET".into())],
    }
}

fn handle_gain(ctx: &ProtocolCtx, args: &[&str]) -> Vec<Action> {
    if args.len() < 3 {
        return vec![Action::Reply("402 GAIN REQUIRES ARGS".into())];
    }
    let field = match args[0] {
        "prop" => GainField::Proportional,
        "int" => GainField::Integral,
        "diff" => GainField::Derivative,
        _ => return vec![Action::Reply("401 UNKNOWN GAINTYPE".into())],
    };
    let (Ok(wfc), Ok(value)) = (args[1].parse::<usize>(), args[2].parse::<f32>()) else {
        return vec![Action::Reply("403 INCORRECT WFC OR GAIN VALUE".into())];
    };
    if wfc >= ctx.wfc_count || !(-1.0..=1.0).contains(&value) {
        return vec![Action::Reply("403 INCORRECT WFC OR GAIN VALUE".into())];
    }
    ctx.shared.set_gain(wfc, field, value);
    let name = match field {
        GainField::Proportional => "PROP",
        GainField::Integral => "INT",
        GainField::Derivative => "DIFF",
    };
    vec![Action::Broadcast(format!(
        "200 OK SET {} GAIN FOR WFC {} TO {:.2}",
        name, wfc, value
    ))]
}

fn handle_step(ctx: &ProtocolCtx, args: &[&str]) -> Vec<Action> {
    if args.is_empty() {
        let step = ctx.shared.tunables.lock().unwrap().step;
        return vec![Action::Reply(format!(
            "200 OK STEP INFO\nstep (x,y):             ({:+}, {:+})",
            step.0, step.1
        ))];
    }
    if args.len() < 2 {
        return vec![Action::Reply("402 STEP REQUIRES AXIS AND VALUE".into())];
    }
    let Ok(v) = args[1].parse::<f32>() else {
        return vec![Action::Reply("401 BAD VALUE".into())];
    };
    let mut t = ctx.shared.tunables.lock().unwrap();
    match args[0] {
        "x" => {
            t.step.0 += v;
            vec![Action::Broadcast(format!("200 OK STEP X {:+}", v))]
        }
        "y" => {
            t.step.1 += v;
            vec![Action::Broadcast(format!("200 OK STEP Y {:+}", v))]
        }
        _ => vec![Action::Reply("401 UNKNOWN STEP AXIS".into())],
    }
}

fn handle_reset(ctx: &ProtocolCtx, args: &[&str], dm: bool) -> Vec<Action> {
    if ctx.shared.mode() != LoopMode::Listen {
        return vec![Action::Reply("403 LOOP RUNNING, HARDWARE BUSY".into())];
    }
    let volts = match args.first() {
        Some(v) => match v.parse::<f64>() {
            Ok(v) => Some(v),
            Err(_) => return vec![Action::Reply("401 BAD VALUE".into())],
        },
        None => None,
    };
    let (req, name) = if dm {
        (PendingRequest::ResetDm(volts), "RESETDM")
    } else {
        (PendingRequest::ResetDaq(volts), "RESETDAQ")
    };
    ctx.shared.push_request(req);
    match volts {
        Some(v) => vec![Action::Broadcast(format!("200 OK {} {:.2}V", name, v))],
        None => vec![Action::Broadcast(format!("200 OK {} NEUTRAL", name))],
    }
}

fn handle_log(ctx: &ProtocolCtx, args: &[&str]) -> Vec<Action> {
    let Some(&which) = args.first() else {
        return vec![Action::Reply("402 LOG REQUIRES ARG (on, off, reset)".into())];
    };
    match which {
        "on" => {
            ctx.shared.push_request(PendingRequest::LogEnable(true));
            vec![Action::Broadcast("200 OK ENABLED DATA LOGGING".into())]
        }
        "off" => {
            ctx.shared.push_request(PendingRequest::LogEnable(false));
            vec![Action::Broadcast("200 OK DISABLED DATA LOGGING".into())]
        }
        "reset" => {
            ctx.shared.push_request(PendingRequest::LogReset);
            vec![Action::Broadcast("200 OK RESET DATA LOGGING".into())]
        }
        _ => vec![Action::Reply("401 UNKNOWN LOG COMMAND (on, off, reset)".into())],
    }
}

fn handle_saveimg(ctx: &ProtocolCtx, args: &[&str]) -> Vec<Action> {
    let Some(&n) = args.first() else {
        return vec![Action::Reply("402 SAVEIMG REQUIRES ARG (# FRAMES)".into())];
    };
    match n.parse::<i64>() {
        Ok(n) if n > 0 => {
            ctx.shared.save_frames.store(n, Ordering::Relaxed);
            vec![Action::Broadcast(format!("200 OK SAVING NEXT {} IMAGES", n))]
        }
        _ => vec![Action::Reply("401 BAD VALUE".into())],
    }
}

/// Handle one protocol line.
pub fn handle_line(ctx: &ProtocolCtx, line: &str) -> Vec<Action> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let Some(&verb) = tokens.first() else {
        return Vec::new();
    };
    let args = &tokens[1..];

    match verb {
        "help" => match args.first() {
            None => vec![Action::Reply(HELP_GENERAL.into())],
            Some(&topic) => match help_topic(topic) {
                Some(text) => vec![Action::Reply(text.into())],
                None => vec![Action::Reply("401 UNKNOWN HELP".into())],
            },
        },
        "mode" => handle_mode(ctx, args),
        "calibrate" => handle_calibrate(ctx, args),
        "set" => handle_set(ctx, args),
        "gain" => handle_gain(ctx, args),
        "step" => handle_step(ctx, args),
        "resetdm" => handle_reset(ctx, args, true),
        "resetdaq" => handle_reset(ctx, args, false),
        "log" => handle_log(ctx, args),
        "saveimg" => handle_saveimg(ctx, args),
        "broadcast" => {
            if args.is_empty() {
                vec![Action::Reply("402 BROADCAST REQUIRES ARG".into())]
            } else {
                vec![Action::Broadcast(format!("200 OK {}", args.join(" ")))]
            }
        }
        "shutdown" => vec![Action::Shutdown],
        "quit" | "exit" => vec![Action::Reply("200 OK EXIT".into()), Action::Close],
        _ => vec![Action::Reply("400 UNKNOWN".into())],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::Tunables;
    use ao_types::GainSettings;

    fn ctx() -> ProtocolCtx {
        let shared = Arc::new(SharedState::new(Tunables {
            log_fraction: 100,
            field_frames: 1000,
            samini: 20.0,
            samxr: 0,
            gains: vec![GainSettings::default()],
            step: (0.0, 0.0),
        }));
        ProtocolCtx {
            shared,
            sensor: SensorConfig {
                name: "SH".into(),
                width: 256,
                height: 256,
                bpp: 8,
                field_frames: 1000,
                scan: ao_types::ScanAxes::Xy,
                cells: (8, 8),
                track: (16, 16),
                samini: 20.0,
                samxr: 0,
            },
            server: ServerConfig::default(),
            wfc_count: 1,
        }
    }

    fn first_reply(actions: &[Action]) -> &str {
        match &actions[0] {
            Action::Reply(s) | Action::Broadcast(s) => s,
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn unknown_verb_is_400() {
        let c = ctx();
        assert_eq!(first_reply(&handle_line(&c, "frobnicate")), "400 UNKNOWN");
    }

    #[test]
    fn empty_line_ignored() {
        let c = ctx();
        assert!(handle_line(&c, "   ").is_empty());
    }

    #[test]
    fn mode_closed_without_calibration_is_403() {
        let c = ctx();
        let a = handle_line(&c, "mode closed");
        assert_eq!(
            a,
            vec![Action::Reply(
                "403 CALIBRATION REQUIRED, REMAINING IN LISTEN".into()
            )]
        );
        assert_eq!(c.shared.mode(), LoopMode::Listen);

        c.shared.calibrated.store(true, Ordering::Relaxed);
        let a = handle_line(&c, "mode closed");
        assert_eq!(a, vec![Action::Broadcast("201 OK MODE CLOSED".into())]);
        assert_eq!(c.shared.mode(), LoopMode::Closed);
    }

    #[test]
    fn mode_arg_errors() {
        let c = ctx();
        assert_eq!(first_reply(&handle_line(&c, "mode")), "402 MODE REQUIRES ARG");
        assert_eq!(first_reply(&handle_line(&c, "mode sideways")), "401 UNKNOWN MODE");
    }

    #[test]
    fn calibrate_sets_mode_and_calmode() {
        let c = ctx();
        let a = handle_line(&c, "calibrate dark");
        assert_eq!(a, vec![Action::Broadcast("200 OK CALIBRATE DARK".into())]);
        assert_eq!(
            c.shared.mode_and_calmode(),
            (LoopMode::Calibrate, CalMode::Dark)
        );
        assert_eq!(
            first_reply(&handle_line(&c, "calibrate voodoo")),
            "401 UNKNOWN CALIBRATION"
        );
    }

    #[test]
    fn set_updates_tunables() {
        let c = ctx();
        handle_line(&c, "set lf 50");
        handle_line(&c, "set samini 31.5");
        handle_line(&c, "set samxr -2");
        let t = c.shared.tunables.lock().unwrap();
        assert_eq!(t.log_fraction, 50);
        assert_eq!(t.samini, 31.5);
        assert_eq!(t.samxr, -2);
    }

    #[test]
    fn set_query_reports_geometry() {
        let c = ctx();
        let a = handle_line(&c, "set");
        let text = first_reply(&a);
        assert!(text.starts_with("200 OK VALUES"));
        assert!(text.contains("8x8 cells"));
        assert!(text.contains("32x32 pixels"));
        assert!(text.contains("256x256 pixels"));
    }

    #[test]
    fn gain_validation() {
        let c = ctx();
        assert_eq!(first_reply(&handle_line(&c, "gain prop")), "402 GAIN REQUIRES ARGS");
        assert_eq!(
            first_reply(&handle_line(&c, "gain prop 5 0.5")),
            "403 INCORRECT WFC OR GAIN VALUE"
        );
        assert_eq!(
            first_reply(&handle_line(&c, "gain prop 0 1.5")),
            "403 INCORRECT WFC OR GAIN VALUE"
        );
        assert_eq!(
            first_reply(&handle_line(&c, "gain warp 0 0.5")),
            "401 UNKNOWN GAINTYPE"
        );
        handle_line(&c, "gain diff 0 0.25");
        assert_eq!(c.shared.tunables.lock().unwrap().gains[0].d, 0.25);
    }

    #[test]
    fn step_accumulates() {
        let c = ctx();
        handle_line(&c, "step x 0.5");
        handle_line(&c, "step x 0.25");
        handle_line(&c, "step y -1");
        let t = c.shared.tunables.lock().unwrap();
        assert_eq!(t.step, (0.75, -1.0));
    }

    #[test]
    fn reset_rejected_while_looping() {
        let c = ctx();
        c.shared.set_mode(LoopMode::Open);
        assert_eq!(
            first_reply(&handle_line(&c, "resetdm")),
            "403 LOOP RUNNING, HARDWARE BUSY"
        );
        c.shared.set_mode(LoopMode::Listen);
        let a = handle_line(&c, "resetdm 180");
        assert_eq!(a, vec![Action::Broadcast("200 OK RESETDM 180.00V".into())]);
        assert_eq!(
            c.shared.take_requests(),
            vec![PendingRequest::ResetDm(Some(180.0))]
        );
    }

    #[test]
    fn saveimg_arms_counter() {
        let c = ctx();
        handle_line(&c, "saveimg 5");
        assert_eq!(c.shared.save_frames.load(Ordering::Relaxed), 5);
        assert_eq!(
            first_reply(&handle_line(&c, "saveimg")),
            "402 SAVEIMG REQUIRES ARG (# FRAMES)"
        );
        assert_eq!(first_reply(&handle_line(&c, "saveimg -3")), "401 BAD VALUE");
    }

    #[test]
    fn log_commands_queue_requests() {
        let c = ctx();
        handle_line(&c, "log on");
        handle_line(&c, "log reset");
        assert_eq!(
            c.shared.take_requests(),
            vec![PendingRequest::LogEnable(true), PendingRequest::LogReset]
        );
    }

    #[test]
    fn quit_closes_connection() {
        let c = ctx();
        let a = handle_line(&c, "quit");
        assert_eq!(
            a,
            vec![Action::Reply("200 OK EXIT".into()), Action::Close]
        );
    }

    #[test]
    fn shutdown_action() {
        let c = ctx();
        assert_eq!(handle_line(&c, "shutdown"), vec![Action::Shutdown]);
    }

    #[test]
    fn help_topics() {
        let c = ctx();
        assert!(first_reply(&handle_line(&c, "help")).starts_with("200 OK HELP"));
        assert!(first_reply(&handle_line(&c, "help mode")).contains("closed"));
        assert_eq!(first_reply(&handle_line(&c, "help dance")), "401 UNKNOWN HELP");
    }
}
