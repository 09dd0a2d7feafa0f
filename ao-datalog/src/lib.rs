//! Measurement logging.
//!
//! Operational messages go through `tracing`; this crate is for the
//! *data*: displacement vectors, control vectors and state snapshots,
//! written as plain text lines so they load straight into analysis
//! tools. Each entry is formatted into a single buffer and written
//! with one `write` call. There is no atomicity across entries —
//! callers sharing one log must serialise, which the loop does by
//! owning its logs on the worker thread.

use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use ao_types::StateSnapshot;

pub type Result<M> = std::result::Result<M, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("io error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

/// Float format used for every logged value.
fn fmt_float(v: f32) -> String {
    format!("{:.8}", v)
}

/// File-open modes for a log; read-only is deliberately absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Truncate ("w").
    Write,
    /// Truncate, read allowed ("w+").
    WritePlus,
    /// Append ("a").
    Append,
    /// Append, read allowed ("a+").
    AppendPlus,
    /// Update in place without truncating ("r+").
    ReadPlus,
}

impl OpenMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "w" => Some(OpenMode::Write),
            "w+" => Some(OpenMode::WritePlus),
            "a" => Some(OpenMode::Append),
            "a+" => Some(OpenMode::AppendPlus),
            "r+" => Some(OpenMode::ReadPlus),
            _ => None,
        }
    }

    fn open(&self, path: &Path) -> std::io::Result<std::fs::File> {
        use std::fs::OpenOptions;
        let mut o = OpenOptions::new();
        match self {
            OpenMode::Write => o.write(true).create(true).truncate(true),
            OpenMode::WritePlus => o.read(true).write(true).create(true).truncate(true),
            OpenMode::Append => o.append(true).create(true),
            OpenMode::AppendPlus => o.read(true).append(true).create(true),
            OpenMode::ReadPlus => o.read(true).write(true),
        };
        o.open(path)
    }
}

/// One log session.
pub struct DataLog {
    path: PathBuf,
    mode: OpenMode,
    file: Option<std::fs::File>,
    /// Value separator inside vector lines.
    pub sep: String,
    /// Comment leader for non-data lines.
    pub comment: String,
    enabled: bool,
}

impl DataLog {
    /// Open a log session and stamp it with a start line.
    pub fn init(path: impl Into<PathBuf>, mode: OpenMode) -> Result<Self> {
        let path = path.into();
        let file = mode.open(&path)?;
        let mut log = Self {
            path,
            mode,
            file: Some(file),
            sep: " ".to_string(),
            comment: "#".to_string(),
            enabled: false,
        };
        let stamp = format!(
            "{} logging started at {}\n",
            log.comment,
            chrono::Local::now().to_rfc3339()
        );
        log.write_entry(&stamp);
        info!("measurement log '{}' opened", log.path.display());
        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Toggle logging without closing the file.
    pub fn set_enabled(&mut self, on: bool) {
        self.enabled = on;
        let verb = if on { "started" } else { "stopped" };
        let stamp = format!(
            "{} logging {} at {}\n",
            self.comment,
            verb,
            chrono::Local::now().to_rfc3339()
        );
        self.write_entry(&stamp);
    }

    /// Truncate and restart the log file.
    pub fn reset(&mut self) -> Result<()> {
        self.file = None;
        let file = OpenMode::Write.open(&self.path)?;
        self.file = Some(file);
        let stamp = format!(
            "{} log reset at {}\n",
            self.comment,
            chrono::Local::now().to_rfc3339()
        );
        self.write_entry(&stamp);
        Ok(())
    }

    // One write call per entry. A failed write disables the log
    // rather than propagating into the loop.
    fn write_entry(&mut self, entry: &str) {
        let Some(f) = self.file.as_mut() else {
            return;
        };
        if let Err(e) = f.write_all(entry.as_bytes()) {
            warn!(
                "measurement log '{}' write failed ({}), disabling",
                self.path.display(),
                e
            );
            self.enabled = false;
            self.file = None;
        }
    }

    /// Log a literal message with an optional prefix.
    pub fn msg(&mut self, prefix: Option<&str>, text: &str) {
        if !self.enabled {
            return;
        }
        let entry = match prefix {
            Some(p) => format!("{} {}\n", p, text),
            None => format!("{}\n", text),
        };
        self.write_entry(&entry);
    }

    /// Log the loop state: one header line, then one line per WFS and
    /// per WFC, all behind the comment leader.
    pub fn snapshot(&mut self, snap: &StateSnapshot) {
        if !self.enabled {
            return;
        }
        let mut entry = String::new();
        entry.push_str(&format!(
            "{} state mode: {} cal: {} frames: {} fps: {:.2} wfs: {} wfc: {}\n",
            self.comment,
            snap.mode,
            snap.calmode,
            snap.frames,
            snap.fps,
            snap.wfs.len(),
            snap.wfc.len()
        ));
        for w in &snap.wfs {
            entry.push_str(&format!(
                "{} wfs {} name: {} res: {} {} bpp: {} fieldframes: {}\n",
                self.comment, w.id, w.name, w.width, w.height, w.bpp, w.field_frames
            ));
        }
        for w in &snap.wfc {
            entry.push_str(&format!(
                "{} wfc {} name: {} nact: {} gain: {} {} {} ctrl:",
                self.comment, w.id, w.name, w.nact, w.gain.p, w.gain.i, w.gain.d
            ));
            for v in &w.ctrl {
                entry.push(' ');
                entry.push_str(&fmt_float(*v));
            }
            entry.push('\n');
        }
        self.write_entry(&entry);
    }

    /// Log a vector as one tagged line, values joined by the
    /// separator.
    pub fn vec_line(&mut self, tag: &str, values: &[f32]) {
        if !self.enabled || values.is_empty() {
            return;
        }
        let mut entry = String::with_capacity(values.len() * 12 + tag.len() + 2);
        entry.push_str(tag);
        entry.push(' ');
        for (i, v) in values.iter().enumerate() {
            if i > 0 {
                entry.push_str(&self.sep);
            }
            entry.push_str(&fmt_float(*v));
        }
        entry.push('\n');
        self.write_entry(&entry);
    }

    /// Log a vector one value per line, the layout matrix dumps use.
    pub fn vec_column(&mut self, values: &[f32]) {
        if !self.enabled || values.is_empty() {
            return;
        }
        let mut entry = String::with_capacity(values.len() * 12);
        for v in values {
            entry.push_str(&fmt_float(*v));
            entry.push('\n');
        }
        self.write_entry(&entry);
    }

    /// Close the session with a final stamp.
    pub fn finish(&mut self) {
        let stamp = format!(
            "{} logging finished at {}\n",
            self.comment,
            chrono::Local::now().to_rfc3339()
        );
        self.write_entry(&stamp);
        self.file = None;
        info!("measurement log '{}' closed", self.path.display());
    }
}
