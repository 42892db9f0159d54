//! qoler: chat service host and worker in one binary.
//!
//! `qoler serve` is the host: it keeps the settings, supervises a worker
//! child process and reports lifecycle results as JSON on stdout.
//! `qoler worker` is that child: it speaks the control protocol on
//! stdin/stdout and logs to stderr.
//!
//! Usage:
//!   qoler serve                               # Saved settings (default port 3001)
//!   qoler serve --port 3002                   # Change and persist the port
//!   qoler serve --storage ./chat.sqlite       # Change and persist the database path
//!   qoler serve --secret mysecret             # Token signing secret (or QOLER_SECRET)
//!
//! While serving, the host reads commands from stdin (`start [port]`, `stop`,
//! `restart`, `status`, `storage <path>`, `quit`) and answers each with one
//! JSON line. EOF on stdin stops the service and exits.

mod commands;
mod settings;

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use qoler_protocol::{OperationResult, ServiceConfig, ServiceError, ServiceState};
use qoler_server::{ControlOptions, EXIT_FAULT, WorkerOptions, control};
use qoler_supervisor::{ProcessLauncher, ServiceSupervisor, SupervisorConfig, SupervisorEvent};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::commands::{CommandRejected, HostCommand, StatusLine, StorageChanged};
use crate::settings::{Settings, settings_path};

#[derive(Parser, Debug)]
#[command(name = "qoler", about = "qoler: realtime chat service")]
struct Cli {
    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,

    /// Write logs to a file (defaults to <data dir>/qoler/logs/qoler.log if no path given)
    #[arg(long, global = true, default_missing_value = "DEFAULT", num_args = 0..=1)]
    log_file: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the host: supervise a worker, take commands on stdin until Ctrl+C or EOF
    Serve {
        /// Port for the chat service (saved for next time)
        #[arg(long)]
        port: Option<u32>,

        /// Database file (saved for next time)
        #[arg(long)]
        storage: Option<PathBuf>,

        /// Token signing secret (falls back to QOLER_SECRET, then a random one)
        #[arg(long)]
        secret: Option<String>,

        /// Interface the worker binds to
        #[arg(long, default_value = "0.0.0.0")]
        hostname: String,

        /// Graceful stop budget before the worker is killed
        #[arg(long, default_value = "5000")]
        stop_timeout_ms: u64,
    },
    /// Run as a worker process (started by `serve`)
    Worker {
        /// Interface to bind
        #[arg(long, default_value = "0.0.0.0")]
        hostname: String,
    },
}

fn init_logging(verbose: bool, log_file: Option<&str>) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    let Some(log_file_arg) = log_file else {
        // stdout is reserved: JSON results for the host, the control channel
        // for the worker.
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        return;
    };

    let log_path = if log_file_arg == "DEFAULT" {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("qoler/logs/qoler.log")
    } else {
        PathBuf::from(log_file_arg)
    };
    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    match std::fs::OpenOptions::new().create(true).append(true).open(&log_path) {
        Ok(file) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .init();
            eprintln!("Logging to {}", log_path.display());
        }
        Err(e) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            warn!("Failed to open log file {}: {e}", log_path.display());
        }
    }
}

/// `--secret`, then `QOLER_SECRET`, then 32 random bytes for this run.
fn resolve_secret(explicit: Option<String>) -> String {
    explicit
        .or_else(|| std::env::var("QOLER_SECRET").ok().filter(|s| !s.is_empty()))
        .unwrap_or_else(|| {
            use rand::Rng;
            let bytes: [u8; 32] = rand::rng().random();
            hex::encode(bytes)
        })
}

fn print_json<T: Serialize>(reply: &T) {
    match serde_json::to_string(reply) {
        Ok(json) => println!("{json}"),
        Err(e) => error!("Failed to encode reply: {e}"),
    }
}

fn print_outcome<T>(outcome: &Result<T, ServiceError>, supervisor: &ServiceSupervisor) {
    let state = supervisor.status().state;
    match outcome {
        Ok(_) => print_json(&OperationResult::success(&state)),
        Err(e) => print_json(&OperationResult::failure(e, &state)),
    }
}

/// Lines from stdin; the channel closes at EOF (the parent process went away).
fn stdin_lines() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        use std::io::BufRead;
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

async fn log_events(mut events: broadcast::Receiver<SupervisorEvent>) {
    loop {
        match events.recv().await {
            Ok(SupervisorEvent::StateChanged(state)) => info!("Service {state}"),
            Ok(SupervisorEvent::Fault(err)) => {
                error!("{err}");
                print_json(&OperationResult::failure(
                    &err,
                    &ServiceState::Failed { reason: err.to_string() },
                ));
            }
            // Already re-emitted through tracing by the supervisor.
            Ok(SupervisorEvent::WorkerLog { .. }) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => warn!("Dropped {n} supervisor events"),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Apply and persist new settings. Values the service cannot use (a
/// privileged port) are neither applied nor saved.
fn remember(settings: &mut Settings, path: &Path, port: Option<u32>, storage: Option<PathBuf>) {
    let mut candidate = settings.clone();
    if !candidate.update(port, storage) {
        return;
    }
    if let Err(e) = ServiceConfig::new(candidate.port, &candidate.storage_path) {
        warn!("Not saving settings: {e}");
        return;
    }
    *settings = candidate;
    match settings.save(path) {
        Ok(()) => info!("Settings saved to {}", path.display()),
        Err(e) => warn!("Failed to save settings {}: {e}", path.display()),
    }
}

/// Start on `port` (or the saved one) with the saved storage path.
async fn start_service(supervisor: &ServiceSupervisor, settings: &mut Settings, path: &Path, port: Option<u32>) -> bool {
    let port = port.unwrap_or(settings.port);
    remember(settings, path, Some(port), None);
    let outcome = supervisor.start(port, settings.storage_path.clone()).await;
    if let Ok(report) = &outcome {
        info!("Chat service on port {} (storage {})", report.port, settings.storage_path.display());
    }
    print_outcome(&outcome, supervisor);
    outcome.is_ok()
}

async fn run_command(command: HostCommand, supervisor: &ServiceSupervisor, settings: &mut Settings, path: &Path) {
    match command {
        HostCommand::Start(port) => {
            start_service(supervisor, settings, path, port).await;
        }
        HostCommand::Stop => print_outcome(&supervisor.stop().await, supervisor),
        HostCommand::Restart => {
            let stopped = supervisor.stop().await;
            if stopped.is_err() {
                print_outcome(&stopped, supervisor);
            }
            start_service(supervisor, settings, path, None).await;
        }
        HostCommand::Status => {
            let snapshot = supervisor.status();
            let error = match &snapshot.state {
                ServiceState::Failed { reason } => Some(reason.clone()),
                _ => None,
            };
            print_json(&StatusLine {
                is_running: snapshot.state.is_running(),
                state: snapshot.state.name().to_string(),
                port: snapshot.state.running_port().map(u32::from).unwrap_or(settings.port),
                storage_path: settings.storage_path.clone(),
                pid: snapshot.pid,
                error,
            });
        }
        HostCommand::Storage(storage) => {
            remember(settings, path, None, Some(storage));
            let current = supervisor.status();
            let restart_required = current.state.is_running()
                && current.storage_path.as_deref() != Some(settings.storage_path.as_path());
            if restart_required {
                warn!("Storage path changed. Restart the service for it to take effect.");
            }
            print_json(&StorageChanged {
                success: true,
                storage_path: settings.storage_path.clone(),
                restart_required,
            });
        }
        // Handled by the serve loop.
        HostCommand::Quit => {}
    }
}

async fn serve(
    port: Option<u32>,
    storage: Option<PathBuf>,
    secret: Option<String>,
    hostname: String,
    stop_timeout_ms: u64,
    verbose: bool,
) -> i32 {
    let path = settings_path();
    let mut settings = Settings::load(&path);
    remember(&mut settings, &path, None, storage);

    let mut launcher = match ProcessLauncher::current_exe() {
        Ok(launcher) => launcher.arg("--hostname").arg(&hostname),
        Err(e) => {
            print_json(&OperationResult::failure(&e, &ServiceState::Stopped));
            return 1;
        }
    };
    if verbose {
        launcher = launcher.arg("--verbose");
    }

    let config = SupervisorConfig {
        stop_timeout: Duration::from_millis(stop_timeout_ms),
        ..SupervisorConfig::new(resolve_secret(secret))
    };
    let supervisor = ServiceSupervisor::new(launcher, config);
    tokio::spawn(log_events(supervisor.subscribe()));

    if !start_service(&supervisor, &mut settings, &path, port).await {
        return 1;
    }

    let mut lines = stdin_lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            line = lines.recv() => {
                let Some(line) = line else {
                    info!("stdin closed (parent process gone), shutting down");
                    break;
                };
                match HostCommand::parse(&line) {
                    Ok(None) => {}
                    Ok(Some(HostCommand::Quit)) => break,
                    Ok(Some(command)) => run_command(command, &supervisor, &mut settings, &path).await,
                    Err(message) => print_json(&CommandRejected::new(message)),
                }
            }
        }
    }

    let outcome = supervisor.stop().await;
    print_outcome(&outcome, &supervisor);
    match outcome {
        Ok(_) => 0,
        Err(ServiceError::EscalatedShutdown { .. }) => 2,
        Err(_) => 1,
    }
}

async fn worker(hostname: String) -> i32 {
    let options = ControlOptions {
        worker: WorkerOptions {
            hostname,
            ..Default::default()
        },
        ..Default::default()
    };
    let control_loop = tokio::spawn(control::run(tokio::io::stdin(), tokio::io::stdout(), options));
    match control_loop.await {
        Ok(code) => code,
        Err(e) => {
            error!("Control loop panicked: {e}");
            EXIT_FAULT
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_file.as_deref());

    let code = match cli.command {
        Command::Serve {
            port,
            storage,
            secret,
            hostname,
            stop_timeout_ms,
        } => serve(port, storage, secret, hostname, stop_timeout_ms, cli.verbose).await,
        Command::Worker { hostname } => worker(hostname).await,
    };
    std::process::exit(code);
}
