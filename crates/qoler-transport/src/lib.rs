//! qoler Transport Layer
//!
//! Serves the worker's HTTP API and WebSocket endpoint on one listener.
//! The transport layer handles:
//! - Listener bind and ordered unbind (WebSockets first, then HTTP)
//! - Token verification for requests and WebSocket handshakes
//! - The identity-keyed connection registry, presence, and envelope fan-out
//!
//! The HTTP API itself is supplied by the caller as an axum `Router`.

pub mod auth;
pub mod registry;
pub mod server;

pub use auth::{AuthError, AuthGate, AuthUser, Claims, require_bearer};
pub use registry::{
    CLOSE_GOING_AWAY, CLOSE_POLICY_VIOLATION, CLOSE_SUPERSEDED, CloseReason, ConnectionEntry,
    ConnectionHandle, ConnectionOutlet, ConnectionRegistry, Delivery,
};
pub use server::{TransportConfig, TransportError, TransportServer};
