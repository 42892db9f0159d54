//! Chat HTTP API served by the worker while Running.
//!
//! Every mutation is written to the store first and only then broadcast, so
//! clients never see an envelope for a write that failed.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
};
use qoler_protocol::BroadcastEnvelope;
use qoler_store::{Store, StoreError};
use qoler_transport::{AuthGate, AuthUser, ConnectionRegistry, require_bearer};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, warn};

/// Shared handler state for one Running episode.
#[derive(Clone)]
pub struct ApiState {
    pub store: Store,
    pub registry: Arc<ConnectionRegistry>,
    pub gate: Arc<AuthGate>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(msg) => Self::Conflict(msg),
            other => {
                warn!("store error: {other}");
                Self::Internal(other.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Build the API router. Everything except registration and login sits
/// behind the bearer gate.
pub fn router(state: ApiState) -> Router {
    let protected = Router::new()
        .route("/users", get(list_users))
        .route("/users/online", get(online_users))
        .route("/channels", get(list_channels).post(create_channel))
        .route("/channels/group", post(create_group))
        .route("/channels/{id}", delete(delete_channel))
        .route("/channels/{id}/name", put(rename_channel))
        .route(
            "/channels/{id}/members",
            get(channel_members).post(add_members).delete(remove_members),
        )
        .route("/channels/{id}/last-read", get(last_read))
        .route("/messages", post(post_message))
        .route("/messages/unread-counts", get(unread_counts))
        .route("/messages/{id}", get(channel_messages).delete(delete_message))
        .route("/messages/{id}/read", post(mark_read))
        .route("/import-users-csv", post(import_users_csv))
        .route_layer(middleware::from_fn_with_state(state.gate.clone(), require_bearer));

    Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/login/auto", post(login_auto))
        .merge(protected)
        .with_state(state)
}

fn to_data<T: Serialize>(value: &T) -> ApiResult<Value> {
    serde_json::to_value(value).map_err(|e| ApiError::Internal(e.to_string()))
}

fn require_name(name: &str) -> ApiResult<&str> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(ApiError::BadRequest("name is required".into()));
    }
    Ok(trimmed)
}

// ─────────────────────────────────────────────────────────────────────────────
// Accounts
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RegisterBody {
    id: Option<i64>,
    username: Option<String>,
    password: Option<String>,
}

async fn register(State(state): State<ApiState>, Json(body): Json<RegisterBody>) -> ApiResult<impl IntoResponse> {
    let (Some(id), Some(username), Some(password)) = (
        body.id,
        body.username.filter(|u| !u.trim().is_empty()),
        body.password.filter(|p| !p.is_empty()),
    ) else {
        return Err(ApiError::BadRequest("id, username and password are required".into()));
    };

    if !state.store.register_user(id, username.trim(), &password).await? {
        return Err(ApiError::Conflict(format!("user id {id} is already registered")));
    }
    debug!(id, "user registered");
    Ok((StatusCode::CREATED, Json(json!({ "message": "registered" }))))
}

#[derive(Debug, Deserialize)]
struct LoginBody {
    id: i64,
    password: String,
}

async fn login(State(state): State<ApiState>, Json(body): Json<LoginBody>) -> ApiResult<Json<Value>> {
    let user = state
        .store
        .authenticate(body.id, &body.password)
        .await?
        .ok_or_else(|| ApiError::Unauthorized("invalid id or password".into()))?;
    let token = state
        .gate
        .issue(user.id, &user.username)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(json!({ "user": user, "token": token })))
}

#[derive(Debug, Deserialize)]
struct AutoLoginBody {
    token: String,
}

/// Trade a still-valid token for a fresh one.
async fn login_auto(State(state): State<ApiState>, Json(body): Json<AutoLoginBody>) -> ApiResult<Json<Value>> {
    let rejected = || ApiError::Unauthorized("session expired".into());
    let claims = state.gate.verify(&body.token).map_err(|_| rejected())?;
    let user = state
        .store
        .get_user(claims.id)
        .await?
        .filter(|u| u.username == claims.username)
        .ok_or_else(rejected)?;
    let token = state
        .gate
        .issue(user.id, &user.username)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(json!({ "user": user, "token": token })))
}

async fn list_users(State(state): State<ApiState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.store.list_users().await?))
}

async fn online_users(State(state): State<ApiState>) -> Json<Vec<String>> {
    Json(state.registry.presence())
}

async fn import_users_csv(State(state): State<ApiState>, body: String) -> ApiResult<impl IntoResponse> {
    let summary = state.store.import_users_csv(&body).await?;
    Ok(Json(summary))
}

// ─────────────────────────────────────────────────────────────────────────────
// Channels
// ─────────────────────────────────────────────────────────────────────────────

async fn list_channels(State(state): State<ApiState>, AuthUser(claims): AuthUser) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.store.channels_for(claims.id).await?))
}

#[derive(Debug, Deserialize)]
struct NameBody {
    name: String,
}

async fn create_channel(State(state): State<ApiState>, Json(body): Json<NameBody>) -> ApiResult<impl IntoResponse> {
    let channel = state.store.create_channel(require_name(&body.name)?).await?;
    state.registry.broadcast(&BroadcastEnvelope::ChannelCreated { data: to_data(&channel)? });
    Ok((StatusCode::CREATED, Json(channel)))
}

#[derive(Debug, Deserialize)]
struct GroupBody {
    name: String,
    #[serde(rename = "memberIds", default)]
    member_ids: Vec<i64>,
}

/// Group channels are announced to their members only.
async fn create_group(
    State(state): State<ApiState>,
    AuthUser(claims): AuthUser,
    Json(body): Json<GroupBody>,
) -> ApiResult<impl IntoResponse> {
    let name = require_name(&body.name)?;
    let channel = state.store.create_group(name, claims.id, body.member_ids).await?;
    let members: Vec<String> = state
        .store
        .channel_members(channel.id)
        .await?
        .into_iter()
        .map(|u| u.username)
        .collect();
    state
        .registry
        .notify(&members, &BroadcastEnvelope::ChannelCreated { data: to_data(&channel)? });
    Ok((StatusCode::CREATED, Json(channel)))
}

async fn rename_channel(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    Json(body): Json<NameBody>,
) -> ApiResult<impl IntoResponse> {
    let name = require_name(&body.name)?;
    if !state.store.rename_channel(id, name).await? {
        return Err(ApiError::NotFound(format!("channel {id} not found")));
    }
    let updated = json!({ "id": id, "name": name });
    state.registry.broadcast(&BroadcastEnvelope::ChannelUpdated { data: updated.clone() });
    Ok(Json(updated))
}

async fn delete_channel(State(state): State<ApiState>, Path(id): Path<i64>) -> ApiResult<impl IntoResponse> {
    if !state.store.delete_channel(id).await? {
        return Err(ApiError::NotFound(format!("channel {id} not found or not deletable")));
    }
    state.registry.broadcast(&BroadcastEnvelope::ChannelDeleted { id });
    Ok(Json(json!({ "message": "channel deleted" })))
}

async fn channel_members(State(state): State<ApiState>, Path(id): Path<i64>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.store.channel_members(id).await?))
}

#[derive(Debug, Deserialize)]
struct MembersBody {
    #[serde(rename = "userIds")]
    user_ids: Vec<i64>,
}

async fn add_members(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    Json(body): Json<MembersBody>,
) -> ApiResult<impl IntoResponse> {
    state.store.add_members(id, body.user_ids.clone()).await?;
    announce_membership_change(&state, id, body.user_ids).await?;
    Ok(Json(json!({ "message": "members added" })))
}

async fn remove_members(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    Json(body): Json<MembersBody>,
) -> ApiResult<impl IntoResponse> {
    state.store.remove_members(id, body.user_ids.clone()).await?;
    announce_membership_change(&state, id, body.user_ids).await?;
    Ok(Json(json!({ "message": "members removed" })))
}

/// Everyone learns the member list changed; the affected users are told
/// to refetch their channel list.
async fn announce_membership_change(state: &ApiState, channel_id: i64, user_ids: Vec<i64>) -> ApiResult<()> {
    state.registry.broadcast(&BroadcastEnvelope::members_updated(channel_id));
    let affected = state.store.usernames_for(user_ids).await?;
    state.registry.notify(&affected, &BroadcastEnvelope::RefetchChannels);
    Ok(())
}

async fn last_read(
    State(state): State<ApiState>,
    AuthUser(claims): AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let last = state.store.last_read(claims.id, id).await?;
    Ok(Json(json!({ "last_read_message_id": last })))
}

// ─────────────────────────────────────────────────────────────────────────────
// Messages
// ─────────────────────────────────────────────────────────────────────────────

async fn ensure_member(state: &ApiState, channel_id: i64, user_id: i64) -> ApiResult<()> {
    if state.store.is_channel_member(channel_id, user_id).await? {
        Ok(())
    } else {
        Err(ApiError::Forbidden(format!("not a member of channel {channel_id}")))
    }
}

async fn channel_messages(
    State(state): State<ApiState>,
    AuthUser(claims): AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    ensure_member(&state, id, claims.id).await?;
    Ok(Json(state.store.messages_in(id).await?))
}

#[derive(Debug, Deserialize)]
struct PostMessageBody {
    #[serde(rename = "channelId")]
    channel_id: i64,
    text: String,
    #[serde(rename = "replyToId", default)]
    reply_to_id: Option<i64>,
}

async fn post_message(
    State(state): State<ApiState>,
    AuthUser(claims): AuthUser,
    Json(body): Json<PostMessageBody>,
) -> ApiResult<impl IntoResponse> {
    if body.text.trim().is_empty() {
        return Err(ApiError::BadRequest("text is required".into()));
    }
    ensure_member(&state, body.channel_id, claims.id).await?;
    let message = state
        .store
        .post_message(body.channel_id, &claims.username, &body.text, body.reply_to_id)
        .await?;
    state.registry.broadcast(&BroadcastEnvelope::NewMessage { data: to_data(&message)? });
    Ok((StatusCode::CREATED, Json(message)))
}

async fn delete_message(
    State(state): State<ApiState>,
    AuthUser(claims): AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    match state.store.message_author(id).await? {
        None => return Err(ApiError::NotFound(format!("message {id} not found"))),
        Some(author) if author != claims.username => {
            return Err(ApiError::Forbidden("only the author may delete a message".into()));
        }
        Some(_) => {}
    }
    state.store.delete_message(id).await?;
    state.registry.broadcast(&BroadcastEnvelope::MessageDeleted { id });
    Ok(Json(json!({ "message": "message deleted" })))
}

#[derive(Debug, Deserialize)]
struct ReadBody {
    #[serde(rename = "lastMessageId")]
    last_message_id: Option<i64>,
}

async fn mark_read(
    State(state): State<ApiState>,
    AuthUser(claims): AuthUser,
    Path(id): Path<i64>,
    Json(body): Json<ReadBody>,
) -> ApiResult<impl IntoResponse> {
    let last = body
        .last_message_id
        .ok_or_else(|| ApiError::BadRequest("lastMessageId is required".into()))?;
    state.store.mark_read(claims.id, id, last).await?;
    Ok(Json(json!({ "message": "read status updated" })))
}

async fn unread_counts(State(state): State<ApiState>, AuthUser(claims): AuthUser) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.store.unread_counts(claims.id).await?))
}
