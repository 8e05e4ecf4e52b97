//! Message stamping for chatbus.
//!
//! Assigns ids and timestamps to drafts before they enter a channel's history.

use chatbus_protocol::{Message, MessageId, MessageKind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Bits reserved below the millisecond timestamp for same-millisecond ids.
const SEQUENCE_BITS: u32 = 12;

/// Last id handed out.
static LAST_ID: AtomicU64 = AtomicU64::new(0);

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Generate a unique message ID.
///
/// IDs are strictly increasing within the process. The upper bits carry the
/// millisecond timestamp, so ids from different milliseconds sort by time.
#[must_use]
pub fn generate_message_id() -> MessageId {
    let floor = now_millis() << SEQUENCE_BITS;
    let previous = LAST_ID
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |last| {
            Some((last + 1).max(floor))
        })
        .unwrap_or_else(|last| last);
    (previous + 1).max(floor)
}

/// A message that has not been stamped yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDraft {
    /// Author of the message.
    pub username: String,
    /// Message body.
    pub text: String,
    /// Message kind.
    pub kind: MessageKind,
}

impl MessageDraft {
    /// Create a plain user message.
    #[must_use]
    pub fn new(username: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            text: text.into(),
            kind: MessageKind::Message,
        }
    }

    /// Set the message kind.
    #[must_use]
    pub fn with_kind(mut self, kind: MessageKind) -> Self {
        self.kind = kind;
        self
    }

    /// Assign an id and timestamp, producing the stored message.
    #[must_use]
    pub fn stamp(self, channel: impl Into<String>) -> Message {
        Message {
            id: generate_message_id(),
            channel: channel.into(),
            username: self.username,
            text: self.text,
            timestamp: now_millis(),
            kind: self.kind,
        }
    }
}
