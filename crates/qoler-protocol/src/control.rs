//! Control-channel message schema.
//!
//! Messages travel as one JSON object per line:
//!   host → worker:  `start`, `stop`
//!   worker → host:  `status`, `log`
//!
//! Ordering within one direction is preserved by the transport. Decoding is
//! strict: an unknown `type`, an unknown field or a missing field is a
//! [`ProtocolError`], never a partially populated message.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// A message exchanged over the control channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum ControlMessage {
    /// Ask the worker to open storage and bind its listener.
    Start {
        port: u16,
        #[serde(rename = "storagePath")]
        storage_path: PathBuf,
        /// Shared secret used to sign and verify client tokens.
        secret: String,
    },
    /// Ask the worker to run its ordered shutdown.
    Stop,
    /// Worker lifecycle report.
    Status {
        state: WorkerState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<WorkerFault>,
    },
    /// Worker log line relayed to the host.
    Log { level: LogLevel, message: String },
}

impl ControlMessage {
    pub fn status(state: WorkerState) -> Self {
        Self::Status { state, port: None, error: None }
    }

    pub fn running(port: u16) -> Self {
        Self::Status { state: WorkerState::Running, port: Some(port), error: None }
    }

    pub fn failed(fault: WorkerFault) -> Self {
        Self::Status { state: WorkerState::Failed, port: None, error: Some(fault) }
    }

    pub fn log(level: LogLevel, message: impl Into<String>) -> Self {
        Self::Log { level, message: message.into() }
    }

    /// The wire tag of this message (for logging).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Stop => "stop",
            Self::Status { .. } => "status",
            Self::Log { .. } => "log",
        }
    }

    /// Serialize to a single JSON line (without the trailing newline).
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Parse one line received from the channel.
    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Err(ProtocolError::Empty);
        }
        let malformed = |reason: String| ProtocolError::Malformed {
            line: truncate(trimmed, 200),
            reason,
        };
        let message: Self = serde_json::from_str(trimmed).map_err(|e| malformed(e.to_string()))?;
        if matches!(message, Self::Stop) {
            // Unit variants skip deny_unknown_fields under internal tagging.
            let fields: serde_json::Map<String, serde_json::Value> =
                serde_json::from_str(trimmed).map_err(|e| malformed(e.to_string()))?;
            if let Some(extra) = fields.keys().find(|key| key.as_str() != "type") {
                return Err(malformed(format!("unknown field `{extra}` in `stop`")));
            }
        }
        Ok(message)
    }
}

/// The worker's internal lifecycle state, as reported in `status` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Failed => "failed",
        }
    }

    /// Whether a `start` command is accepted in this state.
    pub fn accepts_start(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed | Self::Running)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which start step failed inside the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// The listener could not bind (port in use, permission denied).
    Bind,
    /// The storage handle could not be opened or migrated.
    Storage,
    /// Anything else the worker could not recover from.
    Internal,
}

/// Structured failure attached to a `status: failed` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerFault {
    pub kind: FaultKind,
    pub message: String,
}

impl WorkerFault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn bind(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Bind, message)
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Storage, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Internal, message)
    }
}

impl std::fmt::Display for WorkerFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Severity of a relayed worker log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}
