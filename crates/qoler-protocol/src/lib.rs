//! qoler protocol types.
//!
//! This crate is the single source of truth for everything that crosses a
//! process or socket boundary:
//! - control messages exchanged between the host supervisor and the worker
//! - the supervisor-owned service state and configuration
//! - broadcast envelopes pushed to realtime clients
//! - the lifecycle error taxonomy surfaced to the host

pub mod control;
pub mod envelope;
pub mod error;
pub mod state;

pub use control::{ControlMessage, FaultKind, LogLevel, WorkerFault, WorkerState};
pub use envelope::{BroadcastEnvelope, MembersChanged};
pub use error::{ProtocolError, ServiceError};
pub use state::{OperationResult, ServiceConfig, ServiceState, MAX_PORT, MIN_PORT};
