//! The chat message record as it travels on the wire.

use serde::{Deserialize, Serialize};

/// A unique message identifier.
pub type MessageId = u64;

/// Kind of a stored message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Text published by a user.
    #[default]
    Message,
    /// Server-generated notice (joins, announcements).
    System,
}

/// A message appended to a channel's history.
///
/// Messages are immutable once stamped; history replay and live fan-out
/// carry identical copies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier.
    pub id: MessageId,
    /// Channel the message was published to.
    pub channel: String,
    /// Author of the message.
    pub username: String,
    /// Message body.
    pub text: String,
    /// Milliseconds since the Unix epoch when the message was stored.
    pub timestamp: u64,
    /// Message kind.
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
}
