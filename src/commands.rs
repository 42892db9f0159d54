//! Line commands accepted on the host's stdin while `serve` is running.
//!
//! ```text
//! start [port]     start, or move the running service to another port
//! stop             stop the service, keep the host alive
//! restart          stop, then start with the saved settings
//! status           print the current state
//! storage <path>   change the database path (applies on next start)
//! quit             stop and exit
//! ```

use std::path::PathBuf;

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCommand {
    Start(Option<u32>),
    Stop,
    Restart,
    Status,
    Storage(PathBuf),
    Quit,
}

impl HostCommand {
    /// `Ok(None)` for a blank line.
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };
        let command = match word {
            "" => return Ok(None),
            "start" if rest.is_empty() => Self::Start(None),
            "start" => {
                let port = rest.parse().map_err(|_| format!("invalid port `{rest}`"))?;
                Self::Start(Some(port))
            }
            "storage" if rest.is_empty() => return Err("usage: storage <path>".into()),
            "storage" => Self::Storage(PathBuf::from(rest)),
            "stop" | "restart" | "status" | "quit" if !rest.is_empty() => {
                return Err(format!("`{word}` takes no arguments"));
            }
            "stop" => Self::Stop,
            "restart" => Self::Restart,
            "status" => Self::Status,
            "quit" => Self::Quit,
            other => return Err(format!("unknown command `{other}`")),
        };
        Ok(Some(command))
    }
}

/// Reply to `status`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusLine {
    pub is_running: bool,
    pub state: String,
    /// Running port, otherwise the configured one
    pub port: u32,
    pub storage_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Reply to `storage <path>`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageChanged {
    pub success: bool,
    pub storage_path: PathBuf,
    /// The running service still uses the old database.
    pub restart_required: bool,
}

/// Reply to a line that is not a command.
#[derive(Debug, Clone, Serialize)]
pub struct CommandRejected {
    pub success: bool,
    pub error: &'static str,
    pub message: String,
}

impl CommandRejected {
    pub fn new(message: String) -> Self {
        Self { success: false, error: "UnknownCommand", message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands() {
        assert_eq!(HostCommand::parse("start"), Ok(Some(HostCommand::Start(None))));
        assert_eq!(HostCommand::parse("  start 3002 "), Ok(Some(HostCommand::Start(Some(3002)))));
        assert_eq!(HostCommand::parse("stop"), Ok(Some(HostCommand::Stop)));
        assert_eq!(HostCommand::parse("restart"), Ok(Some(HostCommand::Restart)));
        assert_eq!(HostCommand::parse("status\r"), Ok(Some(HostCommand::Status)));
        assert_eq!(
            HostCommand::parse("storage /tmp/my chat.sqlite"),
            Ok(Some(HostCommand::Storage(PathBuf::from("/tmp/my chat.sqlite"))))
        );
        assert_eq!(HostCommand::parse("quit"), Ok(Some(HostCommand::Quit)));
        assert_eq!(HostCommand::parse("   "), Ok(None));
    }

    #[test]
    fn rejects_bad_input() {
        assert!(HostCommand::parse("start abc").is_err());
        assert!(HostCommand::parse("start -1").is_err());
        assert!(HostCommand::parse("storage").is_err());
        assert!(HostCommand::parse("stop now").is_err());
        assert!(HostCommand::parse("launch").is_err());
    }

    #[test]
    fn rejection_shape() {
        let json = serde_json::to_value(CommandRejected::new("unknown command `x`".into())).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "UnknownCommand");
    }
}
