//! Creating worker processes.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;

use qoler_protocol::ServiceError;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::channel::{ControlChannel, ExitNotifier, WorkerExit};

/// One-shot request to terminate a worker non-gracefully.
#[derive(Debug)]
pub struct KillSwitch(Option<oneshot::Sender<()>>);

impl KillSwitch {
    /// The receiver belongs to the task watching the process.
    pub fn new() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self(Some(tx)), rx)
    }

    /// Returns false if already pulled or the worker is already gone.
    pub fn kill(&mut self) -> bool {
        self.0.take().is_some_and(|tx| tx.send(()).is_ok())
    }
}

/// A freshly created worker, linked but not yet told to start.
#[derive(Debug)]
pub struct LaunchedWorker {
    pub channel: ControlChannel,
    pub kill: KillSwitch,
    pub pid: Option<u32>,
}

/// Creates workers for the supervisor.
///
/// Implementations must deliver [`crate::ChannelEvent::Exited`] exactly once
/// when the worker ends, including after a kill.
pub trait WorkerLauncher: Send + Sync + 'static {
    fn launch(&self) -> Result<LaunchedWorker, ServiceError>;
}

/// Runs the worker as a child process speaking the control protocol on its
/// stdin/stdout. Its stderr is relayed into the host log.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// Re-run the current executable with the `worker` subcommand.
    pub fn current_exe() -> Result<Self, ServiceError> {
        let exe = std::env::current_exe()
            .map_err(|e| ServiceError::SpawnFailure(format!("cannot locate current executable: {e}")))?;
        Ok(Self::new(exe).arg("worker"))
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self) -> Result<LaunchedWorker, ServiceError> {
        info!("Launching worker: {}", self.program.display());

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ServiceError::SpawnFailure(format!("{}: {e}", self.program.display())))?;

        let pid = child.id();
        let missing = |pipe: &str| ServiceError::SpawnFailure(format!("worker {pipe} was not captured"));
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        let (channel, notifier) = ControlChannel::link(stdout, stdin);
        let (kill, kill_rx) = KillSwitch::new();

        tokio::spawn(relay_stderr(stderr));
        tokio::spawn(watch_exit(child, kill_rx, notifier));

        info!("Worker started (pid {})", pid.map_or_else(|| "?".to_string(), |p| p.to_string()));
        Ok(LaunchedWorker { channel, kill, pid })
    }
}

async fn relay_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("[worker] {line}");
    }
}

async fn watch_exit(mut child: Child, mut kill_rx: oneshot::Receiver<()>, notifier: ExitNotifier) {
    let (status, killed) = tokio::select! {
        status = child.wait() => (status, false),
        Ok(()) = &mut kill_rx => {
            debug!("Killing worker");
            if let Err(e) = child.start_kill() {
                warn!("Failed to kill worker: {e}");
            }
            (child.wait().await, true)
        }
    };

    let exit = match status {
        Ok(status) => WorkerExit::from_status(status, killed),
        Err(e) => {
            warn!("Failed to collect worker exit status: {e}");
            if killed { WorkerExit::killed() } else { WorkerExit::unknown() }
        }
    };
    debug!("Worker process ended: {exit}");
    notifier.notify(exit).await;
}
