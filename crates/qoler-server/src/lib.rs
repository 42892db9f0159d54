//! qoler worker: the child process that owns storage, the HTTP API and the
//! realtime fan-out.
//!
//! The host drives it over the control channel (see [`control::run`]); it
//! never decides on its own to start or stop, except for shutting down when
//! the host disappears or the listener faults.

pub mod api;
pub mod control;
pub mod worker;

pub use api::{ApiError, ApiState};
pub use control::{ControlOptions, EXIT_FAULT, EXIT_OK};
pub use worker::{WorkerOptions, WorkerProcess};
