//! WebSocket client transport.
//!
//! This module provides a WebSocket-based connector using tokio-tungstenite.

use async_trait::async_trait;
use chatbus_protocol::{codec, ClientFrame, ServerFrame};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, warn};

use crate::traits::{Connection, Connector, TransportError};

type Stream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket connector configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Server endpoint, e.g. `ws://127.0.0.1:3001/ws`.
    pub url: String,
    /// Upper bound on the TCP connect plus handshake.
    pub connect_timeout: Duration,
    /// Maximum inbound message size in bytes.
    pub max_message_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:3001/ws".to_string(),
            connect_timeout: Duration::from_secs(10),
            max_message_size: codec::MAX_FRAME_SIZE,
        }
    }
}

/// Opens WebSocket connections to a chatbus server.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    config: WebSocketConfig,
}

impl WebSocketConnector {
    /// Create a connector for `url` with default settings.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_config(WebSocketConfig {
            url: url.into(),
            ..Default::default()
        })
    }

    /// Create a connector with custom configuration.
    #[must_use]
    pub fn with_config(config: WebSocketConfig) -> Self {
        Self { config }
    }

    /// The configured endpoint.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.config.url
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<Box<dyn Connection>, TransportError> {
        let url = self.config.url.as_str();
        let (stream, _response) =
            tokio::time::timeout(self.config.connect_timeout, connect_async(url))
                .await
                .map_err(|_| TransportError::Timeout)?
                .map_err(|e| {
                    TransportError::WebSocket(format!("WebSocket handshake failed: {}", e))
                })?;

        debug!("WebSocket handshake completed with {}", url);

        Ok(Box::new(WebSocketConnection::new(
            stream,
            url.to_string(),
            self.config.max_message_size,
        )))
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

/// A client WebSocket connection.
pub struct WebSocketConnection {
    stream: Arc<Mutex<Stream>>,
    remote_addr: String,
    is_open: AtomicBool,
    max_message_size: usize,
}

impl WebSocketConnection {
    fn new(stream: Stream, remote_addr: String, max_message_size: usize) -> Self {
        Self {
            stream: Arc::new(Mutex::new(stream)),
            remote_addr,
            is_open: AtomicBool::new(true),
            max_message_size,
        }
    }

    fn decode(&self, data: &[u8]) -> Option<ServerFrame> {
        if data.len() > self.max_message_size {
            warn!(
                "Message too large: {} bytes (max: {})",
                data.len(),
                self.max_message_size
            );
            return None;
        }
        match codec::decode_server(data) {
            Ok(frame) => Some(frame),
            Err(e) => {
                warn!("Discarding undecodable server frame: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl Connection for WebSocketConnection {
    async fn recv(&mut self) -> Result<Option<ServerFrame>, TransportError> {
        let mut stream = self.stream.lock().await;

        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    if let Some(frame) = self.decode(text.as_bytes()) {
                        return Ok(Some(frame));
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    if let Some(frame) = self.decode(&data) {
                        return Ok(Some(frame));
                    }
                }
                // Pongs to server pings are queued by tungstenite itself.
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(_))) => {
                    debug!("Received close frame");
                    self.is_open.store(false, Ordering::SeqCst);
                    return Ok(None);
                }
                Some(Err(WsError::ConnectionClosed)) => {
                    debug!("Connection closed");
                    self.is_open.store(false, Ordering::SeqCst);
                    return Ok(None);
                }
                Some(Err(e)) => {
                    error!("WebSocket error: {}", e);
                    self.is_open.store(false, Ordering::SeqCst);
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
                None => {
                    debug!("WebSocket stream ended");
                    self.is_open.store(false, Ordering::SeqCst);
                    return Ok(None);
                }
            }
        }
    }

    async fn send(&mut self, frame: &ClientFrame) -> Result<(), TransportError> {
        if !self.is_open.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }

        let text = codec::encode(frame)?;
        let mut stream = self.stream.lock().await;
        stream
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.is_open.swap(false, Ordering::SeqCst) {
            return Ok(()); // Already closed
        }

        let mut stream = self.stream.lock().await;
        stream
            .close(None)
            .await
            .map_err(|e| TransportError::Other(format!("Failed to close: {}", e)))
    }

    fn remote_addr(&self) -> Option<String> {
        Some(self.remote_addr.clone())
    }

    fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_config_default() {
        let config = WebSocketConfig::default();
        assert_eq!(config.url, "ws://127.0.0.1:3001/ws");
        assert_eq!(config.max_message_size, 64 * 1024);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let connector = WebSocketConnector::new(format!("ws://{}/ws", addr));
        assert_eq!(connector.name(), "websocket");
        assert!(matches!(
            connector.connect().await,
            Err(TransportError::WebSocket(_))
        ));
    }
}
