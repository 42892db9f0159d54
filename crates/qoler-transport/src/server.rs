//! HTTP + WebSocket listener using Axum.
//!
//! The caller supplies the HTTP API as a [`Router`]; this module adds the
//! WebSocket upgrade endpoint and health check on the same listener, owns the
//! serve task, and exposes the two shutdown steps separately so the worker can
//! enforce its ordering: [`TransportServer::close_websockets`] first, then
//! [`TransportServer::close_http`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::oneshot;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};

use crate::auth::{AuthError, AuthGate, Claims};
use crate::registry::{
    CLOSE_POLICY_VIOLATION, CloseReason, ConnectionHandle, ConnectionRegistry, DEFAULT_OUTBOUND_QUEUE,
};

/// Listener configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Port to listen on (0 for OS-assigned)
    pub port: u16,
    /// Hostname to bind to
    pub hostname: String,
    /// Enable permissive CORS for browser clients
    pub enable_cors: bool,
    /// Per-connection outbound queue depth
    pub outbound_queue: usize,
    /// Upper bound on the graceful HTTP drain
    pub http_close_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: 3001,
            hostname: "0.0.0.0".into(),
            enable_cors: true,
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
            http_close_timeout: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid listen address {0}")]
    InvalidAddress(String),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Shared state for the WebSocket and health routes.
struct WsState {
    gate: Arc<AuthGate>,
    registry: Arc<ConnectionRegistry>,
    accepting: AtomicBool,
    outbound_queue: usize,
}

/// A bound listener with its serve task.
pub struct TransportServer {
    ws_state: Arc<WsState>,
    /// Graceful shutdown signal for the serve task
    shutdown_tx: Option<oneshot::Sender<()>>,
    /// Set before the shutdown signal so the task ending is not a fault
    shutdown_requested: Arc<AtomicBool>,
    handle: Option<tokio::task::JoinHandle<()>>,
    faults: Option<oneshot::Receiver<String>>,
    port: u16,
    http_close_timeout: Duration,
}

impl TransportServer {
    /// Bind the listener and start serving `api` plus the WebSocket endpoint.
    pub async fn bind(
        config: TransportConfig,
        gate: Arc<AuthGate>,
        registry: Arc<ConnectionRegistry>,
        api: Router,
    ) -> Result<Self, TransportError> {
        let addr_str = format!("{}:{}", config.hostname, config.port);
        let addr: SocketAddr = addr_str
            .parse()
            .map_err(|_| TransportError::InvalidAddress(addr_str.clone()))?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind { addr: addr_str.clone(), source })?;
        let port = listener
            .local_addr()
            .map_err(|source| TransportError::Bind { addr: addr_str, source })?
            .port();

        let ws_state = Arc::new(WsState {
            gate,
            registry,
            accepting: AtomicBool::new(true),
            outbound_queue: config.outbound_queue,
        });

        let ws_routes = Router::new()
            .route("/", get(ws_upgrade_handler))
            .route("/ws", get(ws_upgrade_handler))
            .route("/health", get(health_handler))
            .with_state(ws_state.clone());

        let mut app = api.merge(ws_routes);
        if config.enable_cors {
            app = app.layer(CorsLayer::permissive());
        }

        info!("Listening on http://{}:{port} (ws at /ws)", config.hostname);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (fault_tx, fault_rx) = oneshot::channel::<String>();
        let shutdown_requested = Arc::new(AtomicBool::new(false));
        let requested = shutdown_requested.clone();

        let handle = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await;
            if !requested.load(Ordering::SeqCst) {
                let reason = match result {
                    Ok(()) => "listener stopped unexpectedly".to_string(),
                    Err(e) => format!("listener failed: {e}"),
                };
                error!("{reason}");
                let _ = fault_tx.send(reason);
            }
        });

        Ok(Self {
            ws_state,
            shutdown_tx: Some(shutdown_tx),
            shutdown_requested,
            handle: Some(handle),
            faults: Some(fault_rx),
            port,
            http_close_timeout: config.http_close_timeout,
        })
    }

    /// Actual bound port.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.ws_state.registry
    }

    /// Receiver that resolves if the serve task dies on its own.
    /// Can be taken once.
    pub fn take_faults(&mut self) -> Option<oneshot::Receiver<String>> {
        self.faults.take()
    }

    /// Shutdown step 1: refuse new upgrades, then close every live socket
    /// with 1001. Returns how many sockets were told to close.
    pub fn close_websockets(&self) -> usize {
        self.ws_state.accepting.store(false, Ordering::SeqCst);
        self.ws_state.registry.close_all(CloseReason::going_away())
    }

    /// Shutdown step 2: stop accepting requests and drain in-flight ones,
    /// bounded by the configured timeout.
    pub async fn close_http(&mut self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(mut handle) = self.handle.take() {
            if tokio::time::timeout(self.http_close_timeout, &mut handle).await.is_err() {
                warn!(
                    "HTTP drain exceeded {} ms, aborting listener",
                    self.http_close_timeout.as_millis()
                );
                handle.abort();
            }
        }
        info!("HTTP listener on port {} closed", self.port);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP Handlers
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WsParams {
    token: Option<String>,
}

async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<Arc<WsState>>,
) -> Response {
    if !state.accepting.load(Ordering::SeqCst) {
        debug!("Upgrade refused: shutting down");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let verdict = state.gate.authorize_query(params.token.as_deref());
    ws.on_upgrade(move |socket| async move {
        match verdict {
            Ok(claims) => handle_ws_connection(socket, claims, state).await,
            Err(e) => reject_connection(socket, e).await,
        }
    })
}

async fn health_handler(State(state): State<Arc<WsState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "clients": state.registry.len(),
    }))
}

// ─────────────────────────────────────────────────────────────────────────────
// WebSocket Connection Handler
// ─────────────────────────────────────────────────────────────────────────────

async fn reject_connection(mut socket: WebSocket, err: AuthError) {
    let reason = match err {
        AuthError::Unauthenticated => "Token not provided",
        AuthError::Forbidden => "Invalid token",
    };
    warn!("WebSocket rejected: {reason}");
    let frame = CloseFrame {
        code: CLOSE_POLICY_VIOLATION,
        reason: reason.to_string().into(),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}

async fn handle_ws_connection(socket: WebSocket, claims: Claims, state: Arc<WsState>) {
    let identity = claims.identity().to_string();
    let (handle, mut outlet) = ConnectionHandle::new(state.outbound_queue);
    let conn_id = handle.id();

    state.registry.register(&identity, handle);
    debug!("Client connected: {identity} ({conn_id})");

    let (mut ws_tx, mut ws_rx) = socket.split();

    let close = loop {
        tokio::select! {
            frame = outlet.frames.recv() => {
                let Some(frame) = frame else { break None };
                if let Err(e) = ws_tx.send(Message::Text(frame.to_string().into())).await {
                    warn!("Failed to send to {identity} ({conn_id}): {e}");
                    break None;
                }
            }

            changed = outlet.close.changed() => {
                let reason = outlet.close.borrow_and_update().clone();
                if changed.is_err() || reason.is_some() {
                    break reason;
                }
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws_tx.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("Client disconnected: {identity} ({conn_id})");
                        break None;
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error for {identity} ({conn_id}): {e}");
                        break None;
                    }
                    // Receive-only channel: client frames are ignored.
                    Some(Ok(_)) => {}
                }
            }
        }
    };

    if let Some(reason) = close {
        let frame = CloseFrame {
            code: reason.code,
            reason: reason.reason.into(),
        };
        let _ = ws_tx.send(Message::Close(Some(frame))).await;
    }

    state.registry.unregister(&identity, conn_id);
}
