//! The adaptive-optics control loop daemon.
//!
//! Two long-lived execution contexts share one [shared::SharedState]:
//! a worker thread running the [orchestrator] state machine (LISTEN /
//! OPEN / CLOSED / CAL / SHUTDOWN) and a tokio runtime serving the
//! line-oriented [server] protocol. Operator commands retarget the
//! worker through a mutex/condvar pair; the worker owns every piece of
//! hardware while a loop mode runs.

pub mod config;
pub mod instrument;
pub mod orchestrator;
pub mod protocol;
pub mod server;
pub mod shared;
pub mod stats;
pub mod supervisor;
