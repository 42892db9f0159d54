//! The host-side service supervisor.
//!
//! Owns the single service slot: desired config, local [`ServiceState`] and
//! at most one live worker. `start` and `stop` are serialized by one async
//! lock. Each worker gets a pump task that turns its channel events into an
//! [`Observed`] snapshot; operations wait on that snapshot, and the pump
//! itself handles exits nobody asked for.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use qoler_protocol::{
    ControlMessage, LogLevel, ServiceConfig, ServiceError, ServiceState, WorkerFault, WorkerState,
};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelEvent, ControlSender, WorkerExit};
use crate::launcher::{KillSwitch, LaunchedWorker, WorkerLauncher};

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Shared secret passed to the worker for token signing
    pub secret: String,
    /// Budget for a graceful stop before the worker is killed
    pub stop_timeout: Duration,
    /// Pause between stopping the old worker and launching the new one on a
    /// port change
    pub settle_delay: Duration,
    /// Budget for the worker to report running
    pub start_timeout: Duration,
    /// How long an acknowledged stop may take to turn into a process exit
    pub exit_grace: Duration,
}

impl SupervisorConfig {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            stop_timeout: Duration::from_secs(5),
            settle_delay: Duration::from_millis(500),
            start_timeout: Duration::from_secs(30),
            exit_grace: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartReport {
    pub port: u16,
    pub state: ServiceState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopReport {
    pub state: ServiceState,
}

/// Supervisor-local view; reading it never touches the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub state: ServiceState,
    /// Running port, otherwise the last requested one
    pub port: Option<u16>,
    pub storage_path: Option<PathBuf>,
    pub pid: Option<u32>,
}

/// Pushed to subscribers as things happen.
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    StateChanged(ServiceState),
    WorkerLog { level: LogLevel, message: String },
    /// The worker died on its own while running.
    Fault(ServiceError),
}

#[derive(Debug, Clone)]
struct ReportedStatus {
    state: WorkerState,
    port: Option<u16>,
    error: Option<WorkerFault>,
}

/// Latest worker status plus whether the process has ended.
#[derive(Debug, Clone, Default)]
struct Observed {
    status: Option<ReportedStatus>,
    exited: Option<WorkerExit>,
}

enum StartOutcome {
    Running(Option<u16>),
    Failed(WorkerFault),
    Exited(WorkerExit),
}

impl Observed {
    fn start_outcome(&self) -> Option<StartOutcome> {
        match &self.status {
            Some(ReportedStatus { state: WorkerState::Running, port, .. }) => {
                return Some(StartOutcome::Running(*port));
            }
            Some(ReportedStatus { state: WorkerState::Failed, error, .. }) => {
                let fault = error
                    .clone()
                    .unwrap_or_else(|| WorkerFault::internal("worker failed without a reason"));
                return Some(StartOutcome::Failed(fault));
            }
            _ => {}
        }
        self.exited.clone().map(StartOutcome::Exited)
    }

    fn is_stopped(&self) -> bool {
        self.exited.is_some()
            || matches!(self.status, Some(ReportedStatus { state: WorkerState::Stopped, .. }))
    }
}

struct WorkerHandle {
    generation: u64,
    pid: Option<u32>,
    sender: ControlSender,
    kill: KillSwitch,
    observed: watch::Receiver<Observed>,
    /// Set once the supervisor itself is ending this worker.
    stop_requested: Arc<AtomicBool>,
}

impl WorkerHandle {
    fn expect_exit(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    fn has_exited(&self) -> bool {
        self.observed.borrow().exited.is_some()
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.expect_exit();
        self.sender.close();
        if !self.has_exited() && self.kill.kill() {
            debug!("Worker {} killed on release", self.generation);
        }
    }
}

struct Slot {
    state: ServiceState,
    desired: Option<ServiceConfig>,
    worker: Option<WorkerHandle>,
}

struct Shared {
    launcher: Box<dyn WorkerLauncher>,
    config: SupervisorConfig,
    op_lock: tokio::sync::Mutex<()>,
    starting: AtomicBool,
    generation: AtomicU64,
    slot: Mutex<Slot>,
    events: broadcast::Sender<SupervisorEvent>,
}

impl Shared {
    fn transition(&self, slot: &mut Slot, state: ServiceState) {
        if slot.state == state {
            return;
        }
        debug!("Service state: {} -> {}", slot.state, state);
        slot.state = state.clone();
        let _ = self.events.send(SupervisorEvent::StateChanged(state));
    }

    fn set_state(&self, state: ServiceState) {
        let mut slot = self.slot.lock();
        self.transition(&mut slot, state);
    }

    /// Record a failed start and release whatever worker was launched for it.
    fn abandon(&self, err: ServiceError) -> ServiceError {
        warn!("Start failed: {err}");
        let worker = {
            let mut slot = self.slot.lock();
            let worker = slot.worker.take();
            self.transition(&mut slot, ServiceState::Failed { reason: err.to_string() });
            worker
        };
        drop(worker);
        err
    }

    fn on_worker_exit(&self, generation: u64, exit: WorkerExit, observed: &watch::Sender<Observed>, stop_requested: &AtomicBool) {
        let mut slot = self.slot.lock();
        observed.send_modify(|o| o.exited = Some(exit.clone()));

        let current = slot.worker.as_ref().is_some_and(|w| w.generation == generation);
        if !current || stop_requested.load(Ordering::SeqCst) || !slot.state.is_running() {
            return;
        }

        let worker = slot.worker.take();
        if exit.success() {
            info!("Worker exited cleanly while running");
            self.transition(&mut slot, ServiceState::Stopped);
        } else {
            let err = ServiceError::UnexpectedExit(exit.to_string());
            error!("{err}");
            self.transition(&mut slot, ServiceState::Failed { reason: err.to_string() });
            let _ = self.events.send(SupervisorEvent::Fault(err));
        }
        drop(slot);
        drop(worker);
    }
}

/// Clears the in-flight start marker however the start ends.
struct StartInFlight<'a>(&'a AtomicBool);

impl<'a> StartInFlight<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for StartInFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Supervises one worker slot. Cheap to clone; clones share the slot.
#[derive(Clone)]
pub struct ServiceSupervisor {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ServiceSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceSupervisor")
            .field("state", &self.shared.slot.lock().state)
            .finish_non_exhaustive()
    }
}

impl ServiceSupervisor {
    pub fn new(launcher: impl WorkerLauncher, config: SupervisorConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(Shared {
                launcher: Box::new(launcher),
                config,
                op_lock: tokio::sync::Mutex::new(()),
                starting: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                slot: Mutex::new(Slot {
                    state: ServiceState::Stopped,
                    desired: None,
                    worker: None,
                }),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.shared.events.subscribe()
    }

    pub fn status(&self) -> StatusSnapshot {
        let slot = self.shared.slot.lock();
        let desired = slot.desired.as_ref();
        StatusSnapshot {
            state: slot.state.clone(),
            port: slot.state.running_port().or(desired.map(|c| c.port())),
            storage_path: desired.map(|c| c.storage_path().to_path_buf()),
            pid: slot.worker.as_ref().and_then(|w| w.pid),
        }
    }

    /// Bring the service up on `port`. Queues behind any other start.
    pub async fn start(&self, port: u32, storage_path: impl Into<PathBuf>) -> Result<StartReport, ServiceError> {
        let config = ServiceConfig::new(port, storage_path)?;

        let _op = self.shared.op_lock.lock().await;
        let _in_flight = StartInFlight::raise(&self.shared.starting);

        let running_port = {
            let mut slot = self.shared.slot.lock();
            slot.desired = Some(config.clone());
            slot.state.running_port()
        };

        match running_port {
            Some(current) if current == config.port() => {
                debug!("Already running on port {current}");
                return Ok(StartReport {
                    port: current,
                    state: ServiceState::Running { port: current },
                });
            }
            Some(current) => {
                info!("Port change {current} -> {}, restarting worker", config.port());
                if let Err(e) = self.stop_locked().await {
                    warn!("Restart: {e}");
                }
                tokio::time::sleep(self.shared.config.settle_delay).await;
            }
            None => {}
        }

        self.launch(&config).await
    }

    /// Bring the service down. Rejected with `Busy` while a start is in
    /// flight; queues behind another stop.
    pub async fn stop(&self) -> Result<StopReport, ServiceError> {
        if self.shared.starting.load(Ordering::SeqCst) {
            return Err(ServiceError::Busy);
        }
        let _op = self.shared.op_lock.lock().await;
        self.stop_locked().await
    }

    async fn launch(&self, config: &ServiceConfig) -> Result<StartReport, ServiceError> {
        let shared = &self.shared;
        info!("Starting service on port {}", config.port());
        shared.set_state(ServiceState::Starting);

        let LaunchedWorker { channel, kill, pid } = match shared.launcher.launch() {
            Ok(worker) => worker,
            Err(e) => return Err(shared.abandon(e)),
        };

        let generation = shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (sender, events) = channel.split();
        let (observed_tx, mut observed) = watch::channel(Observed::default());
        let stop_requested = Arc::new(AtomicBool::new(false));
        tokio::spawn(pump(
            Arc::downgrade(shared),
            generation,
            events,
            observed_tx,
            stop_requested.clone(),
        ));

        let sent = sender.send(ControlMessage::Start {
            port: config.port(),
            storage_path: config.storage_path().to_path_buf(),
            secret: shared.config.secret.clone(),
        });
        shared.slot.lock().worker = Some(WorkerHandle {
            generation,
            pid,
            sender,
            kill,
            observed: observed.clone(),
            stop_requested,
        });
        if let Err(e) = sent {
            return Err(shared.abandon(e));
        }

        let budget = shared.config.start_timeout;
        let outcome = tokio::time::timeout(budget, wait_start(&mut observed)).await;
        match outcome {
            Ok(StartOutcome::Running(reported)) => {
                let port = reported.unwrap_or(config.port());
                let mut slot = shared.slot.lock();
                let exited = observed.borrow().exited.clone();
                if let Some(exit) = exited {
                    drop(slot);
                    return Err(shared.abandon(ServiceError::UnexpectedExit(exit.to_string())));
                }
                shared.transition(&mut slot, ServiceState::Running { port });
                info!("Service running on port {port}");
                Ok(StartReport { port, state: ServiceState::Running { port } })
            }
            Ok(StartOutcome::Failed(fault)) => Err(shared.abandon(fault.into())),
            Ok(StartOutcome::Exited(exit)) => Err(shared.abandon(ServiceError::UnexpectedExit(exit.to_string()))),
            Err(_) => Err(shared.abandon(ServiceError::StartTimeout {
                budget_ms: budget.as_millis() as u64,
            })),
        }
    }

    async fn stop_locked(&self) -> Result<StopReport, ServiceError> {
        let shared = &self.shared;
        let mut worker = {
            let mut slot = shared.slot.lock();
            match slot.worker.take() {
                Some(worker) => {
                    worker.expect_exit();
                    shared.transition(&mut slot, ServiceState::Stopping);
                    worker
                }
                None => {
                    shared.transition(&mut slot, ServiceState::Stopped);
                    return Ok(StopReport { state: ServiceState::Stopped });
                }
            }
        };

        info!("Stopping service");
        if let Err(e) = worker.sender.send(ControlMessage::Stop) {
            debug!("Stop not delivered: {e}");
        }

        let mut observed = worker.observed.clone();
        let budget = shared.config.stop_timeout;
        let acked = tokio::time::timeout(budget, observed.wait_for(Observed::is_stopped))
            .await
            .is_ok();

        if !acked {
            warn!("Worker did not stop within {} ms, killing it", budget.as_millis());
            drop(worker);
            shared.set_state(ServiceState::Stopped);
            return Err(ServiceError::EscalatedShutdown {
                budget_ms: budget.as_millis() as u64,
            });
        }

        worker.sender.close();
        let exited = tokio::time::timeout(shared.config.exit_grace, observed.wait_for(|o| o.exited.is_some()))
            .await
            .is_ok();
        if !exited {
            debug!("Worker still alive after acknowledging stop");
        }
        drop(worker);
        shared.set_state(ServiceState::Stopped);
        info!("Service stopped");
        Ok(StopReport { state: ServiceState::Stopped })
    }
}

async fn wait_start(observed: &mut watch::Receiver<Observed>) -> StartOutcome {
    observed
        .wait_for(|o| o.start_outcome().is_some())
        .await
        .ok()
        .and_then(|o| o.start_outcome())
        .unwrap_or_else(|| StartOutcome::Exited(WorkerExit::unknown()))
}

/// Drains one worker's channel until it exits.
async fn pump(
    shared: Weak<Shared>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    observed: watch::Sender<Observed>,
    stop_requested: Arc<AtomicBool>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::Message(ControlMessage::Status { state, port, error }) => {
                debug!("Worker {generation} reported {state}");
                observed.send_modify(|o| o.status = Some(ReportedStatus { state, port, error }));
            }
            ChannelEvent::Message(ControlMessage::Log { level, message }) => {
                relay_log(level, &message);
                if let Some(shared) = shared.upgrade() {
                    let _ = shared.events.send(SupervisorEvent::WorkerLog { level, message });
                }
            }
            ChannelEvent::Message(other) => {
                warn!("Unexpected `{}` message from worker", other.kind());
            }
            ChannelEvent::Malformed(e) => warn!("Worker sent {e}"),
            ChannelEvent::Exited(exit) => {
                info!("Worker {generation} exited: {exit}");
                match shared.upgrade() {
                    Some(shared) => shared.on_worker_exit(generation, exit, &observed, &stop_requested),
                    None => observed.send_modify(|o| o.exited = Some(exit)),
                }
                break;
            }
        }
    }
}

fn relay_log(level: LogLevel, message: &str) {
    match level {
        LogLevel::Error => error!("[worker] {message}"),
        LogLevel::Warn => warn!("[worker] {message}"),
        LogLevel::Info => info!("[worker] {message}"),
        LogLevel::Debug => debug!("[worker] {message}"),
    }
}
