//! Frame types for the chatbus protocol.
//!
//! Frames are JSON objects discriminated by a `type` field. Inbound string
//! fields default to empty when absent or `null` so that handlers can report
//! a validation error instead of a parse failure.

use crate::message::{Message, MessageId};
use serde::{Deserialize, Deserializer, Serialize};

/// A frame sent by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Subscribe to a channel under the given username.
    #[serde(alias = "join")]
    Subscribe {
        /// Channel name to subscribe to.
        #[serde(default, deserialize_with = "null_as_empty")]
        channel: String,
        /// Identity asserted by the caller.
        #[serde(default, deserialize_with = "null_as_empty")]
        username: String,
    },

    /// Unsubscribe from a channel.
    #[serde(alias = "leave")]
    Unsubscribe {
        /// Channel name to unsubscribe from.
        #[serde(default, deserialize_with = "null_as_empty")]
        channel: String,
    },

    /// Publish a text message to a channel.
    Publish {
        /// Target channel.
        #[serde(default, deserialize_with = "null_as_empty")]
        channel: String,
        /// Message body.
        #[serde(default, deserialize_with = "null_as_empty")]
        text: String,
        /// Author of the message.
        #[serde(default, deserialize_with = "null_as_empty")]
        username: String,
    },

    /// Keepalive ping.
    Ping,
}

impl ClientFrame {
    /// Every `type` value a client may send, aliases included.
    pub const KINDS: &'static [&'static str] =
        &["subscribe", "join", "unsubscribe", "leave", "publish", "ping"];

    /// Get the frame kind label.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ClientFrame::Subscribe { .. } => "subscribe",
            ClientFrame::Unsubscribe { .. } => "unsubscribe",
            ClientFrame::Publish { .. } => "publish",
            ClientFrame::Ping => "ping",
        }
    }

    /// Create a new Subscribe frame.
    #[must_use]
    pub fn subscribe(channel: impl Into<String>, username: impl Into<String>) -> Self {
        ClientFrame::Subscribe {
            channel: channel.into(),
            username: username.into(),
        }
    }

    /// Create a new Unsubscribe frame.
    #[must_use]
    pub fn unsubscribe(channel: impl Into<String>) -> Self {
        ClientFrame::Unsubscribe {
            channel: channel.into(),
        }
    }

    /// Create a new Publish frame.
    #[must_use]
    pub fn publish(
        channel: impl Into<String>,
        text: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        ClientFrame::Publish {
            channel: channel.into(),
            text: text.into(),
            username: username.into(),
        }
    }
}

/// A frame sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Subscription acknowledgment.
    Subscribed {
        channel: String,
        username: String,
        message: String,
    },

    /// History replay sent right after `subscribed`.
    Messages {
        channel: String,
        messages: Vec<Message>,
    },

    /// Unsubscription acknowledgment.
    Unsubscribed { channel: String, message: String },

    /// A message fanned out to channel subscribers.
    NewMessage { message: Message },

    /// Publish acknowledgment, sent to the publisher only.
    MessageSent {
        #[serde(rename = "messageId")]
        message_id: MessageId,
        channel: String,
        message: String,
    },

    /// Keepalive pong carrying the server time in milliseconds.
    Pong { timestamp: u64 },

    /// Error response for the request that caused it.
    Error { message: String },
}

impl ServerFrame {
    /// Get the frame kind label.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ServerFrame::Subscribed { .. } => "subscribed",
            ServerFrame::Messages { .. } => "messages",
            ServerFrame::Unsubscribed { .. } => "unsubscribed",
            ServerFrame::NewMessage { .. } => "new_message",
            ServerFrame::MessageSent { .. } => "message_sent",
            ServerFrame::Pong { .. } => "pong",
            ServerFrame::Error { .. } => "error",
        }
    }

    /// Create a new Subscribed frame.
    #[must_use]
    pub fn subscribed(channel: impl Into<String>, username: impl Into<String>) -> Self {
        let channel = channel.into();
        ServerFrame::Subscribed {
            message: format!("Successfully subscribed to channel '{channel}'"),
            channel,
            username: username.into(),
        }
    }

    /// Create a new history frame.
    #[must_use]
    pub fn history(channel: impl Into<String>, messages: Vec<Message>) -> Self {
        ServerFrame::Messages {
            channel: channel.into(),
            messages,
        }
    }

    /// Create a new Unsubscribed frame.
    #[must_use]
    pub fn unsubscribed(channel: impl Into<String>) -> Self {
        let channel = channel.into();
        ServerFrame::Unsubscribed {
            message: format!("Unsubscribed from channel '{channel}'"),
            channel,
        }
    }

    /// Create a new fan-out frame.
    #[must_use]
    pub fn new_message(message: Message) -> Self {
        ServerFrame::NewMessage { message }
    }

    /// Create a new MessageSent frame.
    #[must_use]
    pub fn message_sent(message_id: MessageId, channel: impl Into<String>) -> Self {
        ServerFrame::MessageSent {
            message_id,
            channel: channel.into(),
            message: "Message sent successfully".to_string(),
        }
    }

    /// Create a new Pong frame.
    #[must_use]
    pub fn pong(timestamp: u64) -> Self {
        ServerFrame::Pong { timestamp }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        ServerFrame::Error {
            message: message.into(),
        }
    }
}

/// Read an optional string field, treating `null` like an absent field.
fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;
    use serde_json::json;

    #[test]
    fn test_aliases_map_to_membership_frames() {
        let join: ClientFrame =
            serde_json::from_value(json!({"type": "join", "channel": "a", "username": "u"}))
                .unwrap();
        assert_eq!(join, ClientFrame::subscribe("a", "u"));

        let leave: ClientFrame =
            serde_json::from_value(json!({"type": "leave", "channel": "a"})).unwrap();
        assert_eq!(leave, ClientFrame::unsubscribe("a"));
    }

    #[test]
    fn test_missing_fields_default_to_empty() {
        let frame: ClientFrame = serde_json::from_value(json!({"type": "publish"})).unwrap();
        assert_eq!(frame, ClientFrame::publish("", "", ""));
    }

    #[test]
    fn test_null_fields_default_to_empty() {
        let frame: ClientFrame = serde_json::from_value(
            json!({"type": "publish", "channel": null, "text": "hi", "username": null}),
        )
        .unwrap();
        assert_eq!(frame, ClientFrame::publish("", "hi", ""));

        let frame: ClientFrame =
            serde_json::from_value(json!({"type": "join", "channel": "a", "username": null}))
                .unwrap();
        assert_eq!(frame, ClientFrame::subscribe("a", ""));
    }

    #[test]
    fn test_ping_ignores_extra_fields() {
        let frame: ClientFrame =
            serde_json::from_value(json!({"type": "ping", "timestamp": 12})).unwrap();
        assert_eq!(frame, ClientFrame::Ping);
    }

    #[test]
    fn test_server_frame_shapes() {
        let sent = serde_json::to_value(ServerFrame::message_sent(42, "general")).unwrap();
        assert_eq!(
            sent,
            json!({
                "type": "message_sent",
                "messageId": 42,
                "channel": "general",
                "message": "Message sent successfully"
            })
        );

        let message = Message {
            id: 1,
            channel: "general".into(),
            username: "alice".into(),
            text: "hi".into(),
            timestamp: 5,
            kind: MessageKind::Message,
        };
        let fanout = serde_json::to_value(ServerFrame::new_message(message)).unwrap();
        assert_eq!(fanout["type"], "new_message");
        assert_eq!(fanout["message"]["type"], "message");
        assert_eq!(fanout["message"]["text"], "hi");
    }

    #[test]
    fn test_frame_kind() {
        assert_eq!(ServerFrame::pong(1).kind(), "pong");
        assert_eq!(ClientFrame::unsubscribe("x").kind(), "unsubscribe");
        for kind in ClientFrame::KINDS {
            assert!(!kind.is_empty());
        }
    }
}
