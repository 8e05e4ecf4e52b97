//! Channel abstraction for chatbus.
//!
//! Channels are named rooms holding a bounded history of recent messages and
//! the set of usernames currently subscribed. The [`ChannelStore`] owns every
//! channel; it performs no I/O.

use crate::message::{now_millis, MessageDraft};
use chatbus_protocol::Message;
use dashmap::mapref::entry::Entry;
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use thiserror::Error;
use tracing::{debug, info, trace};

/// Default number of messages retained per channel.
pub const DEFAULT_MAX_MESSAGES: usize = 50;

/// A channel identifier.
pub type ChannelId = String;

/// Validate a channel name for creation.
///
/// # Errors
///
/// Returns an error message if the channel name is invalid.
pub fn validate_channel_name(name: &str) -> Result<(), &'static str> {
    if name.trim().is_empty() {
        return Err("Channel name is required");
    }
    if name.chars().any(char::is_control) {
        return Err("Channel name contains invalid characters");
    }
    Ok(())
}

/// Channel store errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// A channel with this name already exists.
    #[error("Channel already exists")]
    AlreadyExists(ChannelId),

    /// No channel with this name exists.
    #[error("Channel does not exist")]
    NotFound(ChannelId),
}

/// Channel listing entry (no message payload).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSummary {
    pub name: ChannelId,
    pub user_count: usize,
    pub message_count: usize,
    pub created_at: u64,
    pub created_by: String,
}

/// Detailed channel information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelInfo {
    #[serde(flatten)]
    pub summary: ChannelSummary,
    /// Visible subscriber usernames, sorted.
    pub subscribers: Vec<String>,
}

/// A channel with bounded history.
#[derive(Debug)]
pub struct Channel {
    /// Channel name.
    name: ChannelId,
    /// Most recent messages, oldest first.
    messages: VecDeque<Message>,
    /// Subscribed usernames with the number of live memberships backing each.
    subscribers: HashMap<String, usize>,
    /// History bound.
    max_messages: usize,
    created_at: u64,
    created_by: String,
}

impl Channel {
    /// Create a new channel.
    #[must_use]
    pub fn new(name: impl Into<ChannelId>, created_by: impl Into<String>) -> Self {
        Self::with_max_messages(name, created_by, DEFAULT_MAX_MESSAGES)
    }

    /// Create a new channel retaining at most `max_messages` messages.
    #[must_use]
    pub fn with_max_messages(
        name: impl Into<ChannelId>,
        created_by: impl Into<String>,
        max_messages: usize,
    ) -> Self {
        Self {
            name: name.into(),
            messages: VecDeque::with_capacity(max_messages.min(1024)),
            subscribers: HashMap::new(),
            max_messages,
            created_at: now_millis(),
            created_by: created_by.into(),
        }
    }

    /// Get the channel name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// When the channel was created, in milliseconds since the epoch.
    #[must_use]
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Who created the channel.
    #[must_use]
    pub fn created_by(&self) -> &str {
        &self.created_by
    }

    /// Stamp and append a message, evicting the oldest beyond the bound.
    pub fn append(&mut self, draft: MessageDraft) -> Message {
        let message = draft.stamp(self.name.clone());
        self.messages.push_back(message.clone());
        while self.messages.len() > self.max_messages {
            self.messages.pop_front();
        }
        trace!(channel = %self.name, id = message.id, "Message appended");
        message
    }

    /// The most recent `limit` messages (all retained if `None`), oldest first.
    #[must_use]
    pub fn recent(&self, limit: Option<usize>) -> Vec<Message> {
        let take = limit.unwrap_or(self.messages.len()).min(self.messages.len());
        self.messages
            .iter()
            .skip(self.messages.len() - take)
            .cloned()
            .collect()
    }

    /// Number of retained messages.
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Add one membership for `username`.
    ///
    /// Returns `true` if the username was not visible before.
    pub fn add_subscriber(&mut self, username: &str) -> bool {
        let count = self.subscribers.entry(username.to_string()).or_insert(0);
        *count += 1;
        let added = *count == 1;
        if added {
            debug!(channel = %self.name, username = %username, "User joined channel");
        }
        added
    }

    /// Drop one membership for `username`.
    ///
    /// Returns `true` if that was the username's last membership. Unknown
    /// usernames are ignored.
    pub fn remove_subscriber(&mut self, username: &str) -> bool {
        let Some(count) = self.subscribers.get_mut(username) else {
            return false;
        };
        *count -= 1;
        if *count > 0 {
            return false;
        }
        self.subscribers.remove(username);
        debug!(channel = %self.name, username = %username, "User left channel");
        true
    }

    /// Check if a username is subscribed.
    #[must_use]
    pub fn is_subscribed(&self, username: &str) -> bool {
        self.subscribers.contains_key(username)
    }

    /// Number of distinct subscribed usernames.
    #[must_use]
    pub fn user_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Subscribed usernames, sorted.
    #[must_use]
    pub fn subscribers(&self) -> Vec<String> {
        let mut users: Vec<String> = self.subscribers.keys().cloned().collect();
        users.sort_unstable();
        users
    }

    /// Listing entry for this channel.
    #[must_use]
    pub fn summary(&self) -> ChannelSummary {
        ChannelSummary {
            name: self.name.clone(),
            user_count: self.user_count(),
            message_count: self.message_count(),
            created_at: self.created_at,
            created_by: self.created_by.clone(),
        }
    }

    /// Detailed information for this channel.
    #[must_use]
    pub fn info(&self) -> ChannelInfo {
        ChannelInfo {
            summary: self.summary(),
            subscribers: self.subscribers(),
        }
    }
}

/// Owner of every channel.
///
/// Each channel sits behind its own map entry lock, so mutations of one
/// channel never contend with another.
#[derive(Debug)]
pub struct ChannelStore {
    channels: DashMap<ChannelId, Channel>,
    max_messages: usize,
}

impl ChannelStore {
    /// Create a store whose channels retain at most `max_messages` messages.
    #[must_use]
    pub fn new(max_messages: usize) -> Self {
        Self {
            channels: DashMap::new(),
            max_messages,
        }
    }

    /// Per-channel history bound.
    #[must_use]
    pub fn max_messages(&self) -> usize {
        self.max_messages
    }

    /// Create a channel.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::AlreadyExists`] if the name is taken; the
    /// existing channel is left untouched.
    pub fn create(&self, name: &str, created_by: &str) -> Result<ChannelSummary, ChannelError> {
        match self.channels.entry(name.to_string()) {
            Entry::Occupied(_) => Err(ChannelError::AlreadyExists(name.to_string())),
            Entry::Vacant(slot) => {
                let channel = Channel::with_max_messages(name, created_by, self.max_messages);
                let summary = channel.summary();
                slot.insert(channel);
                info!(channel = %name, created_by = %created_by, "Channel created");
                Ok(summary)
            }
        }
    }

    /// Lock a channel for a compound update.
    ///
    /// The returned guard must not be held while locking another channel.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::NotFound`] if the channel does not exist.
    pub fn lock(&self, name: &str) -> Result<RefMut<'_, ChannelId, Channel>, ChannelError> {
        self.channels
            .get_mut(name)
            .ok_or_else(|| ChannelError::NotFound(name.to_string()))
    }

    /// Append a message to a channel.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::NotFound`] if the channel does not exist.
    pub fn add_message(&self, name: &str, draft: MessageDraft) -> Result<Message, ChannelError> {
        Ok(self.lock(name)?.append(draft))
    }

    /// The most recent `limit` messages of a channel, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::NotFound`] if the channel does not exist.
    pub fn messages(&self, name: &str, limit: Option<usize>) -> Result<Vec<Message>, ChannelError> {
        self.channels
            .get(name)
            .map(|c| c.recent(limit))
            .ok_or_else(|| ChannelError::NotFound(name.to_string()))
    }

    /// Add one membership for `username`.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::NotFound`] if the channel does not exist.
    pub fn add_subscriber(&self, name: &str, username: &str) -> Result<bool, ChannelError> {
        Ok(self.lock(name)?.add_subscriber(username))
    }

    /// Drop one membership for `username`. A no-op if either is absent.
    pub fn remove_subscriber(&self, name: &str, username: &str) -> bool {
        self.channels
            .get_mut(name)
            .map(|mut c| c.remove_subscriber(username))
            .unwrap_or(false)
    }

    /// Detailed information for a channel.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::NotFound`] if the channel does not exist.
    pub fn info(&self, name: &str) -> Result<ChannelInfo, ChannelError> {
        self.channels
            .get(name)
            .map(|c| c.info())
            .ok_or_else(|| ChannelError::NotFound(name.to_string()))
    }

    /// Summaries of all channels, oldest first.
    #[must_use]
    pub fn list(&self) -> Vec<ChannelSummary> {
        let mut channels: Vec<ChannelSummary> =
            self.channels.iter().map(|c| c.summary()).collect();
        channels.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.name.cmp(&b.name)));
        channels
    }

    /// Check if a channel exists.
    #[must_use]
    pub fn exists(&self, name: &str) -> bool {
        self.channels.contains_key(name)
    }

    /// Number of channels.
    #[must_use]
    pub fn count(&self) -> usize {
        self.channels.len()
    }

    /// Retained messages summed over all channels.
    #[must_use]
    pub fn total_messages(&self) -> usize {
        self.channels.iter().map(|c| c.message_count()).sum()
    }
}

impl Default for ChannelStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(messages: &[Message]) -> Vec<&str> {
        messages.iter().map(|m| m.text.as_str()).collect()
    }

    #[test]
    fn test_create_duplicate_fails() {
        let store = ChannelStore::default();
        store.create("general", "alice").unwrap();
        store.add_message("general", MessageDraft::new("alice", "first")).unwrap();

        assert_eq!(
            store.create("general", "bob"),
            Err(ChannelError::AlreadyExists("general".into()))
        );

        // Existing channel untouched
        let info = store.info("general").unwrap();
        assert_eq!(info.summary.created_by, "alice");
        assert_eq!(info.summary.message_count, 1);
    }

    #[test]
    fn test_history_keeps_most_recent_suffix() {
        let store = ChannelStore::new(2);
        store.create("general", "alice").unwrap();

        for text in ["a", "b", "c"] {
            store.add_message("general", MessageDraft::new("alice", text)).unwrap();
        }

        let messages = store.messages("general", None).unwrap();
        assert_eq!(texts(&messages), ["b", "c"]);
    }

    #[test]
    fn test_history_bound_holds_after_every_append() {
        let store = ChannelStore::new(5);
        store.create("general", "alice").unwrap();

        let mut appended = Vec::new();
        for i in 0..23 {
            let msg = store
                .add_message("general", MessageDraft::new("alice", i.to_string()))
                .unwrap();
            appended.push(msg);

            let retained = store.messages("general", None).unwrap();
            assert!(retained.len() <= 5);
            let expected = &appended[appended.len().saturating_sub(5)..];
            assert_eq!(retained, expected);
        }
    }

    #[test]
    fn test_messages_limit() {
        let store = ChannelStore::default();
        store.create("general", "alice").unwrap();
        for text in ["a", "b", "c", "d"] {
            store.add_message("general", MessageDraft::new("alice", text)).unwrap();
        }

        assert_eq!(texts(&store.messages("general", Some(2)).unwrap()), ["c", "d"]);
        assert_eq!(store.messages("general", Some(10)).unwrap().len(), 4);
        assert!(store.messages("general", Some(0)).unwrap().is_empty());
    }

    #[test]
    fn test_missing_channel() {
        let store = ChannelStore::default();

        assert!(matches!(
            store.add_message("random", MessageDraft::new("alice", "hi")),
            Err(ChannelError::NotFound(_))
        ));
        assert!(store.messages("random", None).is_err());
        assert!(store.info("random").is_err());
        assert!(store.add_subscriber("random", "alice").is_err());

        // Removal never raises
        assert!(!store.remove_subscriber("random", "alice"));
    }

    #[test]
    fn test_subscriber_membership_counts() {
        let mut channel = Channel::new("general", "alice");

        assert!(channel.add_subscriber("alice"));
        assert!(!channel.add_subscriber("alice"));
        assert_eq!(channel.user_count(), 1);

        assert!(!channel.remove_subscriber("alice"));
        assert!(channel.is_subscribed("alice"));
        assert!(channel.remove_subscriber("alice"));
        assert!(!channel.is_subscribed("alice"));

        // Unknown subscriber is a no-op
        assert!(!channel.remove_subscriber("bob"));
        assert_eq!(channel.user_count(), 0);
    }

    #[test]
    fn test_list_and_totals() {
        let store = ChannelStore::new(3);
        store.create("general", "alice").unwrap();
        store.create("random", "bob").unwrap();
        for _ in 0..5 {
            store.add_message("general", MessageDraft::new("alice", "x")).unwrap();
        }
        store.add_message("random", MessageDraft::new("bob", "y")).unwrap();
        store.add_subscriber("random", "bob").unwrap();

        assert!(store.exists("general"));
        assert!(!store.exists("missing"));
        assert_eq!(store.count(), 2);
        assert_eq!(store.total_messages(), 4);

        let list = store.list();
        assert_eq!(list.len(), 2);
        let random = list.iter().find(|c| c.name == "random").unwrap();
        assert_eq!(random.user_count, 1);
        assert_eq!(random.message_count, 1);
    }

    #[test]
    fn test_info_serializes_camel_case() {
        let store = ChannelStore::default();
        store.create("general", "alice").unwrap();
        store.add_subscriber("general", "bob").unwrap();

        let value = serde_json::to_value(store.info("general").unwrap()).unwrap();
        assert_eq!(value["name"], "general");
        assert_eq!(value["userCount"], 1);
        assert_eq!(value["createdBy"], "alice");
        assert_eq!(value["subscribers"][0], "bob");
    }

    #[test]
    fn test_channel_name_validation() {
        assert!(validate_channel_name("general").is_ok());
        assert!(validate_channel_name("").is_err());
        assert!(validate_channel_name("   ").is_err());
        assert!(validate_channel_name("bad\nname").is_err());
    }
}
