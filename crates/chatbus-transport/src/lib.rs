//! # chatbus-transport
//!
//! Client side of the chatbus messaging bus.
//!
//! - **Connector / Connection** - transport abstraction the session is written against
//! - **WebSocket** - tokio-tungstenite implementation of the above
//! - **ClientSession** - a connection that survives drops, reconnecting with
//!   exponential backoff and restoring its subscriptions
//!
//! ```rust,ignore
//! use chatbus_transport::{ClientSession, SessionConfig, WebSocketConnector};
//!
//! let connector = WebSocketConnector::new("ws://127.0.0.1:3001/ws");
//! let mut session = ClientSession::spawn(connector, "alice", SessionConfig::default());
//! session.subscribe("general").await?;
//! while let Some(frame) = session.next_event().await {
//!     println!("{frame:?}");
//! }
//! ```

pub mod backoff;
pub mod session;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use backoff::Backoff;
pub use session::{ClientSession, SessionConfig, SessionState};
pub use traits::{Connection, Connector, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConfig, WebSocketConnector};
