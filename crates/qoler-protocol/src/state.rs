//! Supervisor-side service state and configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ServiceError;

/// Lowest port a service may bind (no privileged ports).
pub const MIN_PORT: u32 = 1024;
/// Highest valid TCP port.
pub const MAX_PORT: u32 = 65535;

/// The lifecycle state of the single service slot owned by a supervisor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum ServiceState {
    #[default]
    Stopped,
    Starting,
    Running { port: u16 },
    Stopping,
    Failed { reason: String },
}

impl ServiceState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running { .. } => "running",
            Self::Stopping => "stopping",
            Self::Failed { .. } => "failed",
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }

    pub fn running_port(&self) -> Option<u16> {
        match self {
            Self::Running { port } => Some(*port),
            _ => None,
        }
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running { port } => write!(f, "running on port {port}"),
            Self::Failed { reason } => write!(f, "failed ({reason})"),
            other => f.write_str(other.name()),
        }
    }
}

/// Validated configuration for one running episode.
///
/// Only constructible through [`ServiceConfig::new`], so a value of this type
/// always carries a port in `MIN_PORT..=MAX_PORT`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    port: u16,
    #[serde(rename = "storagePath")]
    storage_path: PathBuf,
}

impl ServiceConfig {
    pub fn new(port: u32, storage_path: impl Into<PathBuf>) -> Result<Self, ServiceError> {
        if !(MIN_PORT..=MAX_PORT).contains(&port) {
            return Err(ServiceError::InvalidPort(port));
        }
        Ok(Self {
            port: port as u16,
            storage_path: storage_path.into(),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }
}

/// Host-facing result of a lifecycle operation.
///
/// Shapes the JSON the host renders:
/// `{"success":true,"port":3001,"state":"running"}` or
/// `{"success":false,"error":"EscalatedShutdown","state":"stopped"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl OperationResult {
    pub fn success(state: &ServiceState) -> Self {
        Self {
            success: true,
            port: state.running_port(),
            state: state.name().to_string(),
            error: None,
            message: None,
        }
    }

    pub fn failure(error: &ServiceError, state: &ServiceState) -> Self {
        Self {
            success: false,
            port: state.running_port(),
            state: state.name().to_string(),
            error: Some(error.code().to_string()),
            message: Some(error.to_string()),
        }
    }
}
