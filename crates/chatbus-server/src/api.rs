//! HTTP endpoints.
//!
//! Read-only summaries over the broker's accessors, plus channel creation
//! and publishing for clients without a socket.

use crate::handlers::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chatbus_core::{now_millis, BrokerError};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

const DEFAULT_MESSAGE_LIMIT: usize = 50;

/// HTTP routes, to be merged into the server router.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(stats_handler))
        .route("/api/channels", get(list_channels).post(create_channel))
        .route("/api/channels/:name", get(channel_info))
        .route("/api/channels/:name/messages", get(channel_messages))
        .route("/api/publish", post(publish))
}

/// A broker error rendered as `{error}` with a matching status.
struct ApiError(BrokerError);

impl From<BrokerError> for ApiError {
    fn from(e: BrokerError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind() {
            "validation" | "protocol" => StatusCode::BAD_REQUEST,
            "already_exists" => StatusCode::CONFLICT,
            "not_found" => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        crate::metrics::record_error(self.0.kind());
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "timestamp": now_millis(),
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Broker counters.
async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.broker.stats();
    Json(json!({
        "connectedSockets": stats.connected_sockets,
        "activeChannels": stats.active_channels,
        "totalMessages": stats.total_messages,
        "timestamp": now_millis(),
    }))
}

async fn list_channels(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "channels": state.broker.channels() }))
}

#[derive(Debug, Deserialize)]
struct CreateChannel {
    #[serde(default)]
    name: String,
    #[serde(default, rename = "createdBy")]
    created_by: String,
}

async fn create_channel(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateChannel>,
) -> Result<impl IntoResponse, ApiError> {
    let channel = state.broker.create_channel(&body.name, &body.created_by)?;
    crate::metrics::set_active_channels(state.broker.stats().active_channels);
    debug!(channel = %channel.name, "Channel created over HTTP");

    let message = format!("Channel '{}' created successfully", channel.name);
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "channel": channel,
            "message": message,
        })),
    ))
}

async fn channel_info(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let info = state.broker.channel_info(&name)?;
    Ok(Json(json!({ "channel": info })))
}

#[derive(Debug, Deserialize)]
struct MessagesQuery {
    limit: Option<usize>,
}

async fn channel_messages(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query.limit.filter(|&n| n > 0).unwrap_or(DEFAULT_MESSAGE_LIMIT);
    let messages = state.broker.messages(&name, Some(limit))?;
    Ok(Json(json!({ "messages": messages })))
}

#[derive(Debug, Deserialize)]
struct PublishRequest {
    #[serde(default)]
    channel: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    username: String,
}

async fn publish(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PublishRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let published = state
        .broker
        .post(&body.channel, &body.text, &body.username)?;
    crate::metrics::record_fanout(published.recipients);

    Ok(Json(json!({
        "success": true,
        "message": published.message,
    })))
}
