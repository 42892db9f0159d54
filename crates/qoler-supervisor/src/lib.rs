//! qoler supervisor: runs the worker in its own process and keeps the host's
//! view of it honest.
//!
//! The host and worker share no memory. Everything goes over the control
//! channel (JSON lines on the worker's stdin/stdout), and process exit is
//! observed out of band and folded into the same event stream.

pub mod channel;
pub mod launcher;
pub mod supervisor;

pub use channel::{ChannelEvent, ControlChannel, ControlSender, ExitNotifier, WorkerExit};
pub use launcher::{KillSwitch, LaunchedWorker, ProcessLauncher, WorkerLauncher};
pub use supervisor::{
    ServiceSupervisor, StartReport, StatusSnapshot, StopReport, SupervisorConfig, SupervisorEvent,
};
