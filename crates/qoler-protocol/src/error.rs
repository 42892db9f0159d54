//! Lifecycle and protocol error types.

use thiserror::Error;

use crate::control::{FaultKind, WorkerFault};

/// Configuration and lifecycle errors surfaced to the host.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("port {0} is outside the allowed range 1024-65535")]
    InvalidPort(u32),

    #[error("worker process could not be created: {0}")]
    SpawnFailure(String),

    #[error("listener could not bind: {0}")]
    BindFailure(String),

    #[error("storage could not be opened: {0}")]
    StorageOpenFailure(String),

    #[error("worker reported an internal fault: {0}")]
    WorkerFault(String),

    #[error("worker did not stop within {budget_ms} ms and was killed")]
    EscalatedShutdown { budget_ms: u64 },

    #[error("worker exited unexpectedly: {0}")]
    UnexpectedExit(String),

    #[error("worker did not report running within {budget_ms} ms")]
    StartTimeout { budget_ms: u64 },

    #[error("another lifecycle operation is in progress")]
    Busy,

    #[error("control channel closed: {0}")]
    ChannelClosed(String),
}

impl ServiceError {
    /// Stable taxonomy name, used as the `error` field of host results.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidPort(_) => "InvalidPort",
            Self::SpawnFailure(_) => "SpawnFailure",
            Self::BindFailure(_) => "BindFailure",
            Self::StorageOpenFailure(_) => "StorageOpenFailure",
            Self::WorkerFault(_) => "WorkerFault",
            Self::EscalatedShutdown { .. } => "EscalatedShutdown",
            Self::UnexpectedExit(_) => "UnexpectedExit",
            Self::StartTimeout { .. } => "StartTimeout",
            Self::Busy => "Busy",
            Self::ChannelClosed(_) => "ChannelClosed",
        }
    }
}

impl From<WorkerFault> for ServiceError {
    fn from(fault: WorkerFault) -> Self {
        match fault.kind {
            FaultKind::Bind => Self::BindFailure(fault.message),
            FaultKind::Storage => Self::StorageOpenFailure(fault.message),
            FaultKind::Internal => Self::WorkerFault(fault.message),
        }
    }
}

/// Control-channel encode/decode failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("empty control line")]
    Empty,

    #[error("malformed control message `{line}`: {reason}")]
    Malformed { line: String, reason: String },

    #[error("failed to encode control message: {0}")]
    Encode(String),
}
