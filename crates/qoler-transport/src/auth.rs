//! Token authentication for HTTP requests and WebSocket handshakes.
//!
//! Both entry points share one verification primitive: an HS256 JWT checked
//! for signature and expiry against the worker's shared secret.
//!
//! - HTTP: `Authorization: Bearer <token>`. Missing → 401, invalid → 403.
//! - WebSocket: `?token=<token>` on the connection URL. Missing or invalid →
//!   the socket is closed with 1008 before any envelope is sent.

use std::sync::Arc;

use axum::{
    Json,
    extract::{FromRequestParts, Request, State},
    http::{HeaderValue, StatusCode, header::AUTHORIZATION, request::Parts},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::debug;

/// Default token lifetime.
pub const DEFAULT_TOKEN_TTL_SECS: i64 = 60 * 60;

/// Verified token claims. `username` is the realtime identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub id: i64,
    pub username: String,
    pub iat: i64,
    pub exp: i64,
}

impl Claims {
    /// The registry key for this principal.
    pub fn identity(&self) -> &str {
        &self.username
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("authentication required")]
    Unauthenticated,
    #[error("invalid or expired token")]
    Forbidden,
}

impl AuthError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Signs and verifies client tokens.
pub struct AuthGate {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    token_ttl: Duration,
}

impl AuthGate {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 5;
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            token_ttl: Duration::seconds(DEFAULT_TOKEN_TTL_SECS),
        }
    }

    /// Override the lifetime of issued tokens. A negative lifetime issues
    /// tokens that are already expired.
    pub fn with_token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    /// Sign a token for a user.
    pub fn issue(&self, id: i64, username: &str) -> Result<String, jsonwebtoken::errors::Error> {
        let now = Utc::now();
        let claims = Claims {
            id,
            username: username.to_string(),
            iat: now.timestamp(),
            exp: (now + self.token_ttl).timestamp(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
    }

    /// Check signature and expiry.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        decode::<Claims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| {
                debug!("token rejected: {e}");
                AuthError::Forbidden
            })
    }

    /// Authorize an HTTP request from its `Authorization` header.
    pub fn authorize_bearer(&self, header: Option<&HeaderValue>) -> Result<Claims, AuthError> {
        let token = header
            .and_then(|h| h.to_str().ok())
            .and_then(|h| h.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::Unauthenticated)?;
        self.verify(token)
    }

    /// Authorize a WebSocket handshake from its `token` query parameter.
    pub fn authorize_query(&self, token: Option<&str>) -> Result<Claims, AuthError> {
        match token.filter(|t| !t.is_empty()) {
            Some(t) => self.verify(t),
            None => Err(AuthError::Unauthenticated),
        }
    }
}

/// Axum middleware that rejects requests without a valid bearer token and
/// attaches the verified [`Claims`] to the request.
pub async fn require_bearer(
    State(gate): State<Arc<AuthGate>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let claims = gate.authorize_bearer(req.headers().get(AUTHORIZATION))?;
    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}

/// Extractor for the claims attached by [`require_bearer`].
#[derive(Debug, Clone)]
pub struct AuthUser(pub Claims);

impl<S: Send + Sync> FromRequestParts<S> for AuthUser {
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Claims>()
            .cloned()
            .map(AuthUser)
            .ok_or(AuthError::Unauthenticated)
    }
}
