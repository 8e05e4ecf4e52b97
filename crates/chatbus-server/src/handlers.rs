//! Connection handlers for the chatbus server.
//!
//! This module owns the server lifecycle and the per-socket loop that
//! bridges a WebSocket to the broker.

use crate::api;
use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use chatbus_core::{Broker, ConnectionId, Handled, LivenessMonitor, Outbound};
use chatbus_protocol::{codec, ServerFrame};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The broker.
    pub broker: Arc<Broker>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            broker: Arc::new(Broker::with_config(config.broker())),
            config,
        }
    }
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .merge(api::routes())
        .with_state(state)
}

/// Run the HTTP/WebSocket server until ctrl-c.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone()));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let shutdown = CancellationToken::new();
    let liveness = LivenessMonitor::new(Arc::clone(&state.broker), config.liveness())
        .spawn(shutdown.clone());

    let app = router(Arc::clone(&state));

    // Bind and serve
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("chatbus server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received");
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    if let Err(e) = liveness.await {
        warn!("Liveness monitor ended abnormally: {}", e);
    }

    info!("chatbus server stopped");
    Ok(())
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();

    let handle = ConnectionId::generate();
    let (sink, mut outbound) = state.broker.sink();
    state.broker.connect(&handle, sink);

    debug!(connection = %handle, "WebSocket connected");

    // Split the WebSocket
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            biased;

            // Frames queued by the broker for this connection
            item = outbound.recv() => match item {
                Some(Outbound::Frame(frame)) => {
                    if let Err(e) = send_frame(&mut sender, &frame).await {
                        debug!(connection = %handle, error = %e, "Send failed");
                        break;
                    }
                }
                Some(Outbound::Probe) => {
                    if sender.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
                None => {
                    // The broker dropped this connection's record.
                    debug!(connection = %handle, "Disconnected by server");
                    metrics::record_server_disconnect();
                    let _ = sender.close().await;
                    break;
                }
            },

            // Receive from WebSocket
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_inbound(&state, &handle, text.as_bytes());
                    }
                    Some(Ok(Message::Binary(data))) => {
                        handle_inbound(&state, &handle, &data);
                    }
                    // axum answers pings itself
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        state.broker.mark_alive(&handle);
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %handle, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %handle, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %handle, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    state.broker.teardown(&handle);
    metrics::set_active_channels(state.broker.stats().active_channels);

    debug!(connection = %handle, "WebSocket disconnected");
}

/// Pass one inbound frame to the broker.
fn handle_inbound(state: &AppState, handle: &ConnectionId, data: &[u8]) {
    match state.broker.handle_frame(handle, data) {
        Ok(handled) => {
            metrics::record_frame(data.len(), "inbound", handled.kind());
            if let Handled::Published(published) = &handled {
                metrics::record_fanout(published.recipients);
            }
        }
        Err(e) => {
            metrics::record_frame(data.len(), "inbound", "rejected");
            metrics::record_error(e.kind());
        }
    }
}

/// Send a frame to the WebSocket.
async fn send_frame(sender: &mut SplitSink<WebSocket, Message>, frame: &ServerFrame) -> Result<()> {
    let text = codec::encode(frame)?;
    metrics::record_frame(text.len(), "outbound", frame.kind());
    sender.send(Message::Text(text)).await?;
    Ok(())
}
