//! # chatbus-protocol
//!
//! Wire protocol definitions for the chatbus group-messaging bus.
//!
//! Every frame is a single JSON object tagged by its `type` field. Clients
//! send [`ClientFrame`]s and the server answers with [`ServerFrame`]s.
//!
//! ## Frame Types
//!
//! - `subscribe` / `unsubscribe` (aliases `join` / `leave`) - Channel membership
//! - `publish` - Send a text message to a channel
//! - `ping` / `pong` - Keepalive
//! - `subscribed`, `messages`, `unsubscribed`, `new_message`, `message_sent`,
//!   `error` - Server acknowledgments, history replay and fan-out
//!
//! ## Example
//!
//! ```rust
//! use chatbus_protocol::{codec, ClientFrame};
//!
//! let data = br#"{"type":"join","channel":"general","username":"alice"}"#;
//! let frame = codec::decode(data).unwrap();
//! assert_eq!(frame, ClientFrame::subscribe("general", "alice"));
//! ```

pub mod codec;
pub mod frames;
pub mod message;

pub use codec::{decode, decode_server, encode, ProtocolError};
pub use frames::{ClientFrame, ServerFrame};
pub use message::{Message, MessageId, MessageKind};
