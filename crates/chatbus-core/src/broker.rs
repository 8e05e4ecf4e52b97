//! Request dispatch and fan-out for chatbus.
//!
//! The broker exclusively owns the [`ChannelStore`] and the
//! [`ConnectionRegistry`]. Every mutation of a channel and the fan-out that
//! follows it happen under that channel's lock, so a publish always reaches
//! exactly the handles subscribed at the moment the message was appended.

use crate::channel::{
    validate_channel_name, ChannelError, ChannelId, ChannelInfo, ChannelStore, ChannelSummary,
    DEFAULT_MAX_MESSAGES,
};
use crate::message::{now_millis, MessageDraft};
use crate::registry::{ConnectionId, ConnectionRegistry, ConnectionSink, Membership, Outbound};
use chatbus_protocol::{codec, ClientFrame, Message, ProtocolError, ServerFrame};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Number of messages replayed to a new subscriber.
pub const HISTORY_REPLAY: usize = 20;

/// Broker errors.
///
/// All of these are reported to the requesting connection as an `error`
/// frame carrying the `Display` text.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// A required field is missing or too long.
    #[error("{0}")]
    Validation(String),

    /// Channel store rejected the operation.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// The inbound frame could not be decoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The connection was never registered or is already gone.
    #[error("Connection {0} is not registered")]
    UnknownConnection(ConnectionId),
}

impl BrokerError {
    fn validation(message: impl Into<String>) -> Self {
        BrokerError::Validation(message.into())
    }

    /// Static label for metrics and logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            BrokerError::Validation(_) => "validation",
            BrokerError::Channel(ChannelError::AlreadyExists(_)) => "already_exists",
            BrokerError::Channel(ChannelError::NotFound(_)) => "not_found",
            BrokerError::Protocol(_) => "protocol",
            BrokerError::UnknownConnection(_) => "transport",
        }
    }
}

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Messages retained per channel.
    pub max_messages: usize,
    /// Messages replayed on subscribe.
    pub history_replay: usize,
    /// Maximum channel name length in characters.
    pub max_channel_name_length: usize,
    /// Maximum username length in characters.
    pub max_username_length: usize,
    /// Maximum message text length in characters.
    pub max_text_length: usize,
    /// Outbound queue capacity per connection.
    pub outbound_queue: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_messages: DEFAULT_MAX_MESSAGES,
            history_replay: HISTORY_REPLAY,
            max_channel_name_length: 100,
            max_username_length: 50,
            max_text_length: 1000,
            outbound_queue: 256,
        }
    }
}

/// Broker statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerStats {
    /// Number of registered connections.
    pub connected_sockets: usize,
    /// Number of channels.
    pub active_channels: usize,
    /// Retained messages across all channels.
    pub total_messages: usize,
}

/// Outcome of a publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    /// The stored message.
    pub message: Message,
    /// Connections the message was queued for.
    pub recipients: usize,
}

/// What an inbound frame did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handled {
    Subscribed,
    Unsubscribed,
    Published(Published),
    Pinged,
}

impl Handled {
    /// The inbound frame kind that was handled.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Handled::Subscribed => "subscribe",
            Handled::Unsubscribed => "unsubscribe",
            Handled::Published(_) => "publish",
            Handled::Pinged => "ping",
        }
    }
}

/// The connection broker.
pub struct Broker {
    channels: ChannelStore,
    registry: ConnectionRegistry,
    config: BrokerConfig,
}

impl Broker {
    /// Create a new broker with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(BrokerConfig::default())
    }

    /// Create a new broker with custom configuration.
    #[must_use]
    pub fn with_config(config: BrokerConfig) -> Self {
        info!("Creating broker with config: {:?}", config);
        Self {
            channels: ChannelStore::new(config.max_messages),
            registry: ConnectionRegistry::new(),
            config,
        }
    }

    /// Get the broker configuration.
    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Create an outbound sink sized for this broker.
    #[must_use]
    pub fn sink(&self) -> (ConnectionSink, mpsc::Receiver<Outbound>) {
        ConnectionSink::channel(self.config.outbound_queue)
    }

    // ------------------------------------------------------------------
    // Transport callbacks
    // ------------------------------------------------------------------

    /// Register a newly opened connection.
    pub fn connect(&self, handle: &ConnectionId, sink: ConnectionSink) {
        self.registry.register(handle, sink);
    }

    /// Record activity (a pong or any inbound frame) from a connection.
    pub fn mark_alive(&self, handle: &ConnectionId) {
        self.registry.touch(handle);
    }

    /// Decode and dispatch one inbound frame.
    ///
    /// Failures have already been reported to `handle` when this returns.
    ///
    /// # Errors
    ///
    /// Returns the error reported to the connection.
    pub fn handle_frame(&self, handle: &ConnectionId, data: &[u8]) -> Result<Handled, BrokerError> {
        self.registry.touch(handle);
        match codec::decode(data) {
            Ok(frame) => self.dispatch(handle, frame),
            Err(e) => {
                debug!(connection = %handle, error = ?e, "Rejected inbound frame");
                let err = BrokerError::from(e);
                self.reject(handle, &err);
                Err(err)
            }
        }
    }

    /// Dispatch a decoded frame by kind.
    ///
    /// # Errors
    ///
    /// Returns the error reported to the connection.
    pub fn dispatch(
        &self,
        handle: &ConnectionId,
        frame: ClientFrame,
    ) -> Result<Handled, BrokerError> {
        let result = match frame {
            ClientFrame::Subscribe { channel, username } => self
                .subscribe(handle, &channel, &username)
                .map(|()| Handled::Subscribed),
            ClientFrame::Unsubscribe { channel } => self
                .unsubscribe(handle, &channel)
                .map(|()| Handled::Unsubscribed),
            ClientFrame::Publish {
                channel,
                text,
                username,
            } => self
                .publish(handle, &channel, &text, &username)
                .map(Handled::Published),
            ClientFrame::Ping => self.ping(handle).map(|()| Handled::Pinged),
        };

        if let Err(e) = &result {
            self.reject(handle, e);
        }
        result
    }

    // ------------------------------------------------------------------
    // Handlers
    // ------------------------------------------------------------------

    /// Subscribe a connection to an existing channel.
    ///
    /// Replies with `subscribed` followed by the replay window.
    ///
    /// # Errors
    ///
    /// Returns an error if a field is missing or too long, the channel does
    /// not exist, or the connection is not registered.
    pub fn subscribe(
        &self,
        handle: &ConnectionId,
        channel_name: &str,
        username: &str,
    ) -> Result<(), BrokerError> {
        if channel_name.is_empty() || username.is_empty() {
            return Err(BrokerError::validation("Channel and username are required"));
        }
        self.check_length("Channel name", channel_name, self.config.max_channel_name_length)?;
        self.check_length("Username", username, self.config.max_username_length)?;
        if !self.channels.exists(channel_name) {
            return Err(ChannelError::NotFound(channel_name.to_string()).into());
        }
        if !self.registry.contains(handle) {
            return Err(BrokerError::UnknownConnection(handle.clone()));
        }

        let previous = self.registry.set_identity(handle, username);
        if previous.as_deref().is_some_and(|p| p != username) {
            self.rebind(handle, username);
        }

        let mut failed = Vec::new();
        {
            let mut channel = self.channels.lock(channel_name)?;
            match self.registry.subscribe(handle, channel_name, username) {
                Some(Membership::Added) => {
                    channel.add_subscriber(username);
                }
                Some(Membership::Renamed(old)) => {
                    channel.remove_subscriber(&old);
                    channel.add_subscriber(username);
                }
                Some(Membership::Unchanged) => {}
                None => return Err(BrokerError::UnknownConnection(handle.clone())),
            }

            let history = channel.recent(Some(self.config.history_replay));
            self.deliver(handle, ServerFrame::subscribed(channel_name, username), &mut failed);
            self.deliver(handle, ServerFrame::history(channel_name, history), &mut failed);

            debug!(
                channel = %channel_name,
                connection = %handle,
                username = %username,
                users = channel.user_count(),
                "Subscribed"
            );
        }

        self.reap(failed);
        Ok(())
    }

    /// Move a connection's existing memberships to a newly asserted username.
    fn rebind(&self, handle: &ConnectionId, username: &str) {
        for (channel_name, counted) in self.registry.memberships(handle) {
            if counted == username {
                continue;
            }
            let Ok(mut channel) = self.channels.lock(&channel_name) else {
                continue;
            };
            match self.registry.subscribe(handle, &channel_name, username) {
                Some(Membership::Renamed(old)) => {
                    channel.remove_subscriber(&old);
                    channel.add_subscriber(username);
                }
                // Unsubscribed concurrently by a teardown; keep the count in step
                // so the deregistration pass releases it.
                Some(Membership::Added) => {
                    channel.add_subscriber(username);
                }
                Some(Membership::Unchanged) | None => {}
            }
        }
        debug!(connection = %handle, username = %username, "Identity changed");
    }

    /// Unsubscribe a connection from a channel.
    ///
    /// Unsubscribing from a channel the connection never joined is a no-op
    /// that is still acknowledged.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel name is missing.
    pub fn unsubscribe(
        &self,
        handle: &ConnectionId,
        channel_name: &str,
    ) -> Result<(), BrokerError> {
        if channel_name.is_empty() {
            return Err(BrokerError::validation("Channel is required"));
        }

        match self.channels.lock(channel_name) {
            Ok(mut channel) => {
                if let Some(counted) = self.registry.unsubscribe(handle, channel_name) {
                    channel.remove_subscriber(&counted);
                    debug!(
                        channel = %channel_name,
                        connection = %handle,
                        users = channel.user_count(),
                        "Unsubscribed"
                    );
                }
            }
            Err(_) => {
                self.registry.unsubscribe(handle, channel_name);
            }
        }

        let mut failed = Vec::new();
        self.deliver(handle, ServerFrame::unsubscribed(channel_name), &mut failed);
        self.reap(failed);
        Ok(())
    }

    /// Publish a message from a connection.
    ///
    /// Fans `new_message` out to every subscribed connection (the publisher
    /// included when subscribed) and acknowledges the publisher with
    /// `message_sent`.
    ///
    /// # Errors
    ///
    /// Returns an error if a field is missing or too long, the channel does
    /// not exist, or the connection is not registered.
    pub fn publish(
        &self,
        handle: &ConnectionId,
        channel_name: &str,
        text: &str,
        username: &str,
    ) -> Result<Published, BrokerError> {
        if !self.registry.contains(handle) {
            return Err(BrokerError::UnknownConnection(handle.clone()));
        }
        self.publish_from(Some(handle), channel_name, text, username)
    }

    /// Publish a message on behalf of a non-connection caller (the HTTP API).
    ///
    /// # Errors
    ///
    /// Returns an error if a field is missing or too long, or the channel
    /// does not exist.
    pub fn post(
        &self,
        channel_name: &str,
        text: &str,
        username: &str,
    ) -> Result<Published, BrokerError> {
        self.publish_from(None, channel_name, text, username)
    }

    fn publish_from(
        &self,
        publisher: Option<&ConnectionId>,
        channel_name: &str,
        text: &str,
        username: &str,
    ) -> Result<Published, BrokerError> {
        if channel_name.is_empty() || text.is_empty() || username.is_empty() {
            return Err(BrokerError::validation(
                "Channel, text, and username are required",
            ));
        }
        self.check_length("Message", text, self.config.max_text_length)?;
        self.check_length("Username", username, self.config.max_username_length)?;

        let mut failed = Vec::new();
        let published = {
            let mut channel = self.channels.lock(channel_name)?;
            let message = channel.append(MessageDraft::new(username, text));

            let frame = Arc::new(ServerFrame::new_message(message.clone()));
            let recipients = self.registry.subscribers_of(channel_name);
            for recipient in &recipients {
                self.deliver_shared(recipient, Arc::clone(&frame), &mut failed);
            }

            debug!(
                channel = %channel_name,
                id = message.id,
                recipients = recipients.len(),
                "Published"
            );
            Published {
                message,
                recipients: recipients.len(),
            }
        };

        if let Some(handle) = publisher {
            let ack = ServerFrame::message_sent(published.message.id, channel_name);
            self.deliver(handle, ack, &mut failed);
        }
        self.reap(failed);
        Ok(published)
    }

    /// Answer a ping with the server time.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is not registered.
    pub fn ping(&self, handle: &ConnectionId) -> Result<(), BrokerError> {
        let Some(sink) = self.registry.sink(handle) else {
            return Err(BrokerError::UnknownConnection(handle.clone()));
        };
        if sink.deliver(Arc::new(ServerFrame::pong(now_millis()))).is_err() {
            self.teardown(handle);
        }
        Ok(())
    }

    /// Remove a connection and every membership it held.
    ///
    /// Safe to call repeatedly; returns `false` if the handle was already
    /// gone.
    pub fn teardown(&self, handle: &ConnectionId) -> bool {
        for (channel_name, _) in self.registry.memberships(handle) {
            if let Ok(mut channel) = self.channels.lock(&channel_name) {
                if let Some(counted) = self.registry.unsubscribe(handle, &channel_name) {
                    channel.remove_subscriber(&counted);
                }
            }
        }

        let Some(record) = self.registry.deregister(handle) else {
            return false;
        };
        // Memberships recorded after the sweep above.
        for (channel_name, counted) in &record.memberships {
            self.channels.remove_subscriber(channel_name, counted);
        }

        info!(
            connection = %handle,
            username = record.username.as_deref().unwrap_or("-"),
            "Connection removed"
        );
        true
    }

    // ------------------------------------------------------------------
    // Channel management and read-only accessors
    // ------------------------------------------------------------------

    /// Create a channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the name or creator is invalid, or the name is
    /// already taken.
    pub fn create_channel(
        &self,
        name: &str,
        created_by: &str,
    ) -> Result<ChannelSummary, BrokerError> {
        validate_channel_name(name).map_err(BrokerError::validation)?;
        self.check_length("Channel name", name, self.config.max_channel_name_length)?;
        if created_by.is_empty() {
            return Err(BrokerError::validation("Created by username is required"));
        }
        self.check_length("Username", created_by, self.config.max_username_length)?;
        Ok(self.channels.create(name, created_by)?)
    }

    /// Summaries of all channels.
    #[must_use]
    pub fn channels(&self) -> Vec<ChannelSummary> {
        self.channels.list()
    }

    /// Detailed information for a channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel does not exist.
    pub fn channel_info(&self, name: &str) -> Result<ChannelInfo, BrokerError> {
        Ok(self.channels.info(name)?)
    }

    /// Recent messages of a channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel does not exist.
    pub fn messages(&self, name: &str, limit: Option<usize>) -> Result<Vec<Message>, BrokerError> {
        Ok(self.channels.messages(name, limit)?)
    }

    /// Channels a connection is subscribed to.
    #[must_use]
    pub fn connection_channels(&self, handle: &ConnectionId) -> Vec<ChannelId> {
        let mut channels: Vec<ChannelId> = self
            .registry
            .memberships(handle)
            .into_iter()
            .map(|(channel, _)| channel)
            .collect();
        channels.sort_unstable();
        channels
    }

    /// Every registered connection with its sink.
    #[must_use]
    pub fn connections(&self) -> Vec<(ConnectionId, ConnectionSink)> {
        self.registry.snapshot()
    }

    /// Get broker statistics.
    #[must_use]
    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            connected_sockets: self.registry.size(),
            active_channels: self.channels.count(),
            total_messages: self.channels.total_messages(),
        }
    }

    // ------------------------------------------------------------------
    // Delivery
    // ------------------------------------------------------------------

    fn check_length(&self, what: &str, value: &str, max: usize) -> Result<(), BrokerError> {
        if value.chars().count() > max {
            return Err(BrokerError::validation(format!(
                "{what} too long (max {max} characters)"
            )));
        }
        Ok(())
    }

    fn deliver(&self, handle: &ConnectionId, frame: ServerFrame, failed: &mut Vec<ConnectionId>) {
        self.deliver_shared(handle, Arc::new(frame), failed);
    }

    fn deliver_shared(
        &self,
        handle: &ConnectionId,
        frame: Arc<ServerFrame>,
        failed: &mut Vec<ConnectionId>,
    ) {
        let Some(sink) = self.registry.sink(handle) else {
            return;
        };
        let kind = frame.kind();
        match sink.deliver(frame) {
            Ok(()) => trace!(connection = %handle, frame = kind, "Queued frame"),
            Err(e) => {
                warn!(connection = %handle, frame = kind, error = %e, "Failed to queue frame");
                failed.push(handle.clone());
            }
        }
    }

    /// Report a failed request to the requester only.
    fn reject(&self, handle: &ConnectionId, error: &BrokerError) {
        if matches!(error, BrokerError::UnknownConnection(_)) {
            warn!(connection = %handle, "Request from unregistered connection");
            return;
        }
        let mut failed = Vec::new();
        self.deliver(handle, ServerFrame::error(error.to_string()), &mut failed);
        self.reap(failed);
    }

    /// Tear down connections whose outbound queue overflowed or closed.
    ///
    /// Must be called with no channel lock held.
    fn reap(&self, mut failed: Vec<ConnectionId>) {
        failed.sort_unstable();
        failed.dedup();
        for handle in failed {
            if self.teardown(&handle) {
                warn!(connection = %handle, "Disconnected unreachable connection");
            }
        }
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}
