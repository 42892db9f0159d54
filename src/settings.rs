//! Persisted host settings: the port and storage path the service starts with.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const DEFAULT_PORT: u32 = 3001;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub port: u32,
    pub storage_path: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            storage_path: default_storage_path(),
        }
    }
}

/// `<config dir>/qoler/settings.json`
pub fn settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("qoler")
        .join("settings.json")
}

fn default_storage_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("qoler")
        .join("chat-database.sqlite")
}

impl Settings {
    /// Missing file gives defaults; a broken one is logged and replaced by
    /// defaults.
    pub fn load(path: &Path) -> Self {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No settings at {}, using defaults", path.display());
                return Self::default();
            }
            Err(e) => {
                warn!("Failed to read settings {}: {e}", path.display());
                return Self::default();
            }
        };
        match serde_json::from_str(&text) {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Ignoring invalid settings {}: {e}", path.display());
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }

    /// Apply overrides; true if anything changed.
    pub fn update(&mut self, port: Option<u32>, storage_path: Option<PathBuf>) -> bool {
        let mut changed = false;
        if let Some(port) = port.filter(|p| *p != self.port) {
            self.port = port;
            changed = true;
        }
        if let Some(path) = storage_path.filter(|p| *p != self.storage_path) {
            self.storage_path = path;
            changed = true;
        }
        changed
    }
}
