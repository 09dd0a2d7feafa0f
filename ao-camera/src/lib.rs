//! Frame acquisition.
//!
//! [FrameSource] is the seam between the control loop and whatever
//! produces sensor frames: a framegrabber driver on the instrument, or
//! the simulated camera in [sim] during development and testing.

use std::time::Duration;

use ao_frame::Frame;

pub mod sim;
pub use sim::{SimCamera, SimCameraConfig, SimRig};

pub type Result<M> = std::result::Result<M, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("acquire called before start")]
    NotStarted,
    #[error("camera fault: {0}")]
    CameraFault(String),
    #[error("io error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

fn _test_error_is_send() {
    fn implements<T: Send>() {}
    implements::<Error>();
}

/// A source of raw sensor frames.
///
/// `start` and `stop` are idempotent; any number of acquires may happen
/// between them. Acquires are never issued concurrently: the worker
/// thread owns the source while a loop mode runs.
pub trait FrameSource: Send {
    fn name(&self) -> &str;

    /// Sensor width in pixels.
    fn width(&self) -> u32;

    /// Sensor height in pixels.
    fn height(&self) -> u32;

    /// Begin frame production. Idempotent.
    fn start(&mut self) -> Result<()>;

    /// Stop frame production. Idempotent.
    fn stop(&mut self) -> Result<()>;

    /// Fetch the next frame.
    ///
    /// `Ok(None)` reports a timeout: no frame arrived within `timeout`,
    /// which is not an error — the caller re-checks its mode and tries
    /// again. `None` as timeout blocks until a frame arrives or the
    /// source fails.
    fn acquire(&mut self, timeout: Option<Duration>) -> Result<Option<Frame>>;
}
