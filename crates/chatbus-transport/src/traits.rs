//! Transport abstraction traits for chatbus clients.
//!
//! A [`Connector`] opens [`Connection`]s; the session layer only ever talks
//! to these traits, so it can be driven by an in-memory transport in tests.

use async_trait::async_trait;
use chatbus_protocol::{ClientFrame, ProtocolError, ServerFrame};
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Connection timed out.
    #[error("Connection timed out")]
    Timeout,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// WebSocket handshake or stream error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// The session task has stopped.
    #[error("Session closed")]
    SessionClosed,

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Something that can open a connection to a chatbus server.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new connection.
    async fn connect(&self) -> Result<Box<dyn Connection>, TransportError>;

    /// Get the transport name (e.g., "websocket").
    fn name(&self) -> &'static str;
}

/// An open client connection.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Receive the next frame from the server.
    ///
    /// Returns `None` if the connection is closed cleanly.
    async fn recv(&mut self) -> Result<Option<ServerFrame>, TransportError>;

    /// Send a frame to the server.
    async fn send(&mut self, frame: &ClientFrame) -> Result<(), TransportError>;

    /// Close the connection gracefully.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Get the remote address of the connection, if available.
    fn remote_addr(&self) -> Option<String> {
        None
    }

    /// Check if the connection is still open.
    fn is_open(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_conversion() {
        let err: TransportError = ProtocolError::UnknownType("dance".into()).into();
        assert!(matches!(err, TransportError::Protocol(_)));
        assert_eq!(err.to_string(), "Protocol error: Unknown message type");
    }
}
