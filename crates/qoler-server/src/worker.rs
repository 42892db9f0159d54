//! The worker's service lifecycle.
//!
//! `Stopped → Starting → Running → Stopping → Stopped`, with `Failed`
//! reachable from `Starting`. Start opens storage before binding; stop tears
//! down in the reverse order: WebSocket layer, HTTP listener, storage.
//! Every transition is reported to the host as a `status` message.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use qoler_protocol::{ControlMessage, LogLevel, WorkerFault, WorkerState};
use qoler_store::Store;
use qoler_transport::{AuthGate, ConnectionRegistry, DEFAULT_OUTBOUND_QUEUE, TransportConfig, TransportServer};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::api::{self, ApiState};

/// Tunables for one worker process.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Interface the listener binds to
    pub hostname: String,
    pub enable_cors: bool,
    pub outbound_queue: usize,
    /// Bound on the graceful HTTP drain during stop
    pub http_close_timeout: Duration,
    /// Bound on closing storage during stop
    pub storage_close_timeout: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            hostname: "0.0.0.0".into(),
            enable_cors: true,
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
            http_close_timeout: Duration::from_secs(3),
            storage_close_timeout: Duration::from_secs(2),
        }
    }
}

/// Resources held while Running.
struct RunningService {
    port: u16,
    store: Store,
    server: TransportServer,
}

/// Owns the listener, registry and storage for the current episode.
pub struct WorkerProcess {
    state: WorkerState,
    options: WorkerOptions,
    running: Option<RunningService>,
    /// Outbound control messages for the host
    reports: mpsc::UnboundedSender<ControlMessage>,
}

impl WorkerProcess {
    pub fn new(options: WorkerOptions, reports: mpsc::UnboundedSender<ControlMessage>) -> Self {
        Self {
            state: WorkerState::Stopped,
            options,
            running: None,
            reports,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Bound port while Running.
    pub fn port(&self) -> Option<u16> {
        self.running.as_ref().map(|r| r.port)
    }

    /// Registry of the current episode, if any.
    pub fn registry(&self) -> Option<&Arc<ConnectionRegistry>> {
        self.running.as_ref().map(|r| r.server.registry())
    }

    /// Resolves if the listener dies on its own. Taken once per episode.
    pub fn take_faults(&mut self) -> Option<oneshot::Receiver<String>> {
        self.running.as_mut().and_then(|r| r.server.take_faults())
    }

    /// Open storage, bind the listener, then report Running.
    ///
    /// Already running on `port` re-reports Running without touching
    /// anything; running on another port stops first.
    pub async fn start(&mut self, port: u16, storage_path: &Path, secret: &str) -> Result<u16, WorkerFault> {
        if !self.state.accepts_start() {
            let fault = WorkerFault::internal(format!("cannot start while {}", self.state));
            self.log(LogLevel::Warn, fault.message.clone());
            return Err(fault);
        }

        if let Some(current) = self.port() {
            if current == port {
                debug!("start on current port {port}, already running");
                self.report(ControlMessage::running(port));
                return Ok(port);
            }
            info!("port change {current} → {port}, restarting");
            self.stop().await;
        }

        self.transition(WorkerState::Starting);

        let store = match Store::open(storage_path).await {
            Ok(store) => store,
            Err(e) => return Err(self.fail(WorkerFault::storage(e.to_string()))),
        };

        let gate = Arc::new(AuthGate::new(secret));
        let registry = Arc::new(ConnectionRegistry::new());
        let api = api::router(ApiState {
            store: store.clone(),
            registry: registry.clone(),
            gate: gate.clone(),
        });
        let config = TransportConfig {
            port,
            hostname: self.options.hostname.clone(),
            enable_cors: self.options.enable_cors,
            outbound_queue: self.options.outbound_queue,
            http_close_timeout: self.options.http_close_timeout,
        };

        let server = match TransportServer::bind(config, gate, registry, api).await {
            Ok(server) => server,
            Err(e) => {
                // Storage must not outlive a failed start.
                store.close(self.options.storage_close_timeout).await;
                return Err(self.fail(WorkerFault::bind(e.to_string())));
            }
        };

        let bound = server.port();
        self.running = Some(RunningService { port: bound, store, server });
        self.state = WorkerState::Running;
        self.log(LogLevel::Info, format!("Server is now listening on port {bound}"));
        self.report(ControlMessage::running(bound));
        Ok(bound)
    }

    /// Ordered shutdown. Always ends in Stopped and reports it, even when
    /// nothing was running.
    pub async fn stop(&mut self) {
        let Some(mut running) = self.running.take() else {
            self.state = WorkerState::Stopped;
            self.report(ControlMessage::status(WorkerState::Stopped));
            return;
        };

        self.transition(WorkerState::Stopping);

        let closed = running.server.close_websockets();
        debug!("closed {closed} websocket(s)");

        running.server.close_http().await;

        if !running.store.close(self.options.storage_close_timeout).await {
            warn!("storage close did not complete cleanly");
        }

        self.state = WorkerState::Stopped;
        self.log(LogLevel::Info, "All services stopped.");
        self.report(ControlMessage::status(WorkerState::Stopped));
    }

    fn transition(&mut self, state: WorkerState) {
        self.state = state;
        self.report(ControlMessage::status(state));
    }

    fn fail(&mut self, fault: WorkerFault) -> WorkerFault {
        error!("start failed: {fault}");
        self.state = WorkerState::Failed;
        self.report(ControlMessage::failed(fault.clone()));
        fault
    }

    /// Log locally and relay to the host.
    fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Error => error!("{message}"),
            LogLevel::Warn => warn!("{message}"),
            LogLevel::Info => info!("{message}"),
            LogLevel::Debug => debug!("{message}"),
        }
        self.report(ControlMessage::log(level, message));
    }

    fn report(&self, message: ControlMessage) {
        if self.reports.send(message).is_err() {
            debug!("control writer gone, report dropped");
        }
    }
}
