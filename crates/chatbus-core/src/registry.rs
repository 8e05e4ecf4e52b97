//! Connection registry for chatbus.
//!
//! Tracks every live connection handle, the identity it asserted, the
//! channels it is subscribed to, and a reference to its outbound sink.
//! A per-channel index of subscribed handles keeps fan-out proportional to
//! the subscriber count.

use chatbus_protocol::ServerFrame;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::channel::ChannelId;

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

/// Opaque identifier for one live transport connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Create a connection ID from an existing value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a connection ID that is never reused within the process.
    #[must_use]
    pub fn generate() -> Self {
        let n = NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{n:x}"))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// An item queued for a connection's writer.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// A protocol frame.
    Frame(Arc<ServerFrame>),
    /// A transport-level liveness probe (a WebSocket ping).
    Probe,
}

/// Why a frame could not be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SinkError {
    /// The outbound queue is at capacity.
    #[error("outbound queue full")]
    Full,
    /// The writer side has gone away.
    #[error("connection closed")]
    Closed,
}

/// Why a liveness probe failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProbeFailure {
    /// The writer side has gone away.
    #[error("connection closed")]
    Closed,
    /// The probe could not be queued within the timeout.
    #[error("probe timed out")]
    TimedOut,
    /// No activity since the previous probe.
    #[error("no response since last probe")]
    Unresponsive,
}

/// Handle to a connection's bounded outbound queue.
///
/// The queue itself belongs to the transport; cloning the sink only clones
/// the sending half.
#[derive(Debug, Clone)]
pub struct ConnectionSink {
    tx: mpsc::Sender<Outbound>,
    alive: Arc<AtomicBool>,
}

impl ConnectionSink {
    /// Wrap the sending half of a transport's outbound queue.
    #[must_use]
    pub fn new(tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            tx,
            alive: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Create a sink together with the receiver the transport drains.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    /// Queue a frame without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Full`] if the queue is at capacity and
    /// [`SinkError::Closed`] if the transport has gone away.
    pub fn deliver(&self, frame: Arc<ServerFrame>) -> Result<(), SinkError> {
        self.tx.try_send(Outbound::Frame(frame)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SinkError::Full,
            mpsc::error::TrySendError::Closed(_) => SinkError::Closed,
        })
    }

    /// Probe the connection.
    ///
    /// Fails if the peer showed no activity since the previous probe, or if
    /// the probe cannot be queued within `timeout`.
    ///
    /// # Errors
    ///
    /// Returns the reason the connection is considered dead.
    pub async fn probe(&self, timeout: Duration) -> Result<(), ProbeFailure> {
        if self.tx.is_closed() {
            return Err(ProbeFailure::Closed);
        }
        if !self.check_alive() {
            return Err(ProbeFailure::Unresponsive);
        }
        match tokio::time::timeout(timeout, self.tx.send(Outbound::Probe)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ProbeFailure::Closed),
            Err(_) => Err(ProbeFailure::TimedOut),
        }
    }

    /// Record activity from the peer.
    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::Relaxed);
    }

    /// Check and reset the activity flag.
    ///
    /// Returns `true` if there was activity since the last check.
    pub fn check_alive(&self) -> bool {
        self.alive.swap(false, Ordering::Relaxed)
    }

    /// Check if the transport has gone away.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Everything the registry knows about one connection.
#[derive(Debug)]
pub struct ConnectionRecord {
    /// Identity most recently asserted on this connection.
    pub username: Option<String>,
    /// Subscribed channels, each with the username the membership counts under.
    pub memberships: HashMap<ChannelId, String>,
    sink: ConnectionSink,
}

impl ConnectionRecord {
    fn new(sink: ConnectionSink) -> Self {
        Self {
            username: None,
            memberships: HashMap::new(),
            sink,
        }
    }

    /// The connection's outbound sink.
    #[must_use]
    pub fn sink(&self) -> &ConnectionSink {
        &self.sink
    }
}

/// Result of recording a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Membership {
    /// The handle was not subscribed before.
    Added,
    /// Already subscribed under the same username.
    Unchanged,
    /// Already subscribed under a different username, which is returned.
    Renamed(String),
}

/// Registry of live connections.
///
/// Lock order is record before index; no method holds a guard on return.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, ConnectionRecord>,
    by_channel: DashMap<ChannelId, HashSet<ConnectionId>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. Idempotent: an existing record is kept.
    ///
    /// Returns `true` if the handle was new.
    pub fn register(&self, handle: &ConnectionId, sink: ConnectionSink) -> bool {
        let mut added = false;
        self.connections.entry(handle.clone()).or_insert_with(|| {
            added = true;
            ConnectionRecord::new(sink)
        });
        if added {
            debug!(connection = %handle, "Connection registered");
        }
        added
    }

    /// Check if a handle is registered.
    #[must_use]
    pub fn contains(&self, handle: &ConnectionId) -> bool {
        self.connections.contains_key(handle)
    }

    /// Associate a username with a handle.
    ///
    /// Returns the previous username, if any.
    pub fn set_identity(&self, handle: &ConnectionId, username: &str) -> Option<String> {
        let mut record = self.connections.get_mut(handle)?;
        record.username.replace(username.to_string())
    }

    /// The username a handle last asserted.
    #[must_use]
    pub fn identity(&self, handle: &ConnectionId) -> Option<String> {
        self.connections
            .get(handle)
            .and_then(|r| r.username.clone())
    }

    /// Record that `handle` receives broadcasts for `channel` as `username`.
    ///
    /// Returns `None` if the handle is not registered.
    pub fn subscribe(
        &self,
        handle: &ConnectionId,
        channel: &str,
        username: &str,
    ) -> Option<Membership> {
        let mut record = self.connections.get_mut(handle)?;
        let previous = record
            .memberships
            .insert(channel.to_string(), username.to_string());
        let membership = match previous {
            None => {
                self.by_channel
                    .entry(channel.to_string())
                    .or_default()
                    .insert(handle.clone());
                Membership::Added
            }
            Some(old) if old == username => Membership::Unchanged,
            Some(old) => Membership::Renamed(old),
        };
        Some(membership)
    }

    /// Stop `handle` receiving broadcasts for `channel`.
    ///
    /// Returns the username the membership counted under, or `None` if the
    /// handle was not subscribed.
    pub fn unsubscribe(&self, handle: &ConnectionId, channel: &str) -> Option<String> {
        let mut record = self.connections.get_mut(handle)?;
        let username = record.memberships.remove(channel)?;
        self.unindex(handle, channel);
        Some(username)
    }

    /// Remove a connection and return its record for teardown.
    pub fn deregister(&self, handle: &ConnectionId) -> Option<ConnectionRecord> {
        let (_, record) = self.connections.remove(handle)?;
        for channel in record.memberships.keys() {
            self.unindex(handle, channel);
        }
        debug!(connection = %handle, "Connection deregistered");
        Some(record)
    }

    fn unindex(&self, handle: &ConnectionId, channel: &str) {
        let now_empty = match self.by_channel.get_mut(channel) {
            Some(mut handles) => {
                handles.remove(handle);
                handles.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.by_channel.remove_if(channel, |_, handles| handles.is_empty());
        }
    }

    /// Handles currently subscribed to `channel`.
    #[must_use]
    pub fn subscribers_of(&self, channel: &str) -> Vec<ConnectionId> {
        self.by_channel
            .get(channel)
            .map(|handles| handles.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Channels a handle is subscribed to, with the username each counts under.
    #[must_use]
    pub fn memberships(&self, handle: &ConnectionId) -> Vec<(ChannelId, String)> {
        self.connections
            .get(handle)
            .map(|r| {
                r.memberships
                    .iter()
                    .map(|(c, u)| (c.clone(), u.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The outbound sink of a handle.
    #[must_use]
    pub fn sink(&self, handle: &ConnectionId) -> Option<ConnectionSink> {
        self.connections.get(handle).map(|r| r.sink.clone())
    }

    /// Record activity from a handle.
    pub fn touch(&self, handle: &ConnectionId) {
        if let Some(record) = self.connections.get(handle) {
            record.sink.mark_alive();
        }
    }

    /// Every registered handle with its sink.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(ConnectionId, ConnectionSink)> {
        self.connections
            .iter()
            .map(|r| (r.key().clone(), r.sink.clone()))
            .collect()
    }

    /// Number of registered connections.
    #[must_use]
    pub fn size(&self) -> usize {
        self.connections.len()
    }

    /// Total subscriptions across all connections.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.connections.iter().map(|r| r.memberships.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registered(
        registry: &ConnectionRegistry,
        id: &str,
    ) -> (ConnectionId, mpsc::Receiver<Outbound>) {
        let handle = ConnectionId::from(id);
        let (sink, rx) = ConnectionSink::channel(8);
        registry.register(&handle, sink);
        (handle, rx)
    }

    #[test]
    fn test_connection_id_generation() {
        let id1 = ConnectionId::generate();
        let id2 = ConnectionId::generate();
        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("conn_"));
    }

    #[test]
    fn test_register_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (h1, _rx) = registered(&registry, "conn-1");
        registry.set_identity(&h1, "alice");

        let (sink, _rx2) = ConnectionSink::channel(8);
        assert!(!registry.register(&h1, sink));
        assert_eq!(registry.identity(&h1).as_deref(), Some("alice"));
        assert_eq!(registry.size(), 1);
    }

    #[test]
    fn test_subscribe_unsubscribe() {
        let registry = ConnectionRegistry::new();
        let (h1, _rx1) = registered(&registry, "conn-1");
        let (h2, _rx2) = registered(&registry, "conn-2");

        assert_eq!(registry.subscribe(&h1, "general", "alice"), Some(Membership::Added));
        assert_eq!(registry.subscribe(&h2, "general", "bob"), Some(Membership::Added));
        assert_eq!(registry.subscribe(&h1, "general", "alice"), Some(Membership::Unchanged));
        assert_eq!(
            registry.subscribe(&h1, "general", "carol"),
            Some(Membership::Renamed("alice".into()))
        );

        let mut subs = registry.subscribers_of("general");
        subs.sort();
        assert_eq!(subs, vec![h1.clone(), h2.clone()]);
        assert_eq!(registry.subscription_count(), 2);

        assert_eq!(registry.unsubscribe(&h1, "general").as_deref(), Some("carol"));
        assert_eq!(registry.subscribers_of("general"), vec![h2.clone()]);

        // Not subscribed
        assert_eq!(registry.unsubscribe(&h1, "general"), None);
        assert_eq!(registry.unsubscribe(&h1, "random"), None);
    }

    #[test]
    fn test_unknown_handle() {
        let registry = ConnectionRegistry::new();
        let ghost = ConnectionId::from("ghost");

        assert_eq!(registry.subscribe(&ghost, "general", "alice"), None);
        assert_eq!(registry.set_identity(&ghost, "alice"), None);
        assert!(registry.deregister(&ghost).is_none());
        assert!(registry.subscribers_of("general").is_empty());
    }

    #[test]
    fn test_deregister_clears_index() {
        let registry = ConnectionRegistry::new();
        let (h1, _rx1) = registered(&registry, "conn-1");
        registry.subscribe(&h1, "general", "alice");
        registry.subscribe(&h1, "random", "alice");

        let record = registry.deregister(&h1).unwrap();
        assert_eq!(record.memberships.len(), 2);
        assert!(registry.subscribers_of("general").is_empty());
        assert!(registry.subscribers_of("random").is_empty());
        assert_eq!(registry.size(), 0);

        assert!(registry.deregister(&h1).is_none());
    }

    #[tokio::test]
    async fn test_sink_delivery() {
        let (sink, mut rx) = ConnectionSink::channel(1);

        assert!(sink.deliver(Arc::new(ServerFrame::pong(1))).is_ok());
        assert_eq!(sink.deliver(Arc::new(ServerFrame::pong(2))), Err(SinkError::Full));

        match rx.recv().await {
            Some(Outbound::Frame(frame)) => assert_eq!(*frame, ServerFrame::pong(1)),
            other => panic!("Expected frame, got {:?}", other),
        }

        drop(rx);
        assert_eq!(sink.deliver(Arc::new(ServerFrame::pong(3))), Err(SinkError::Closed));
        assert!(sink.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe() {
        let (sink, mut rx) = ConnectionSink::channel(1);
        let timeout = Duration::from_secs(1);

        assert_eq!(sink.probe(timeout).await, Ok(()));
        assert!(matches!(rx.recv().await, Some(Outbound::Probe)));

        // No activity since the last probe
        assert_eq!(sink.probe(timeout).await, Err(ProbeFailure::Unresponsive));

        // Queue full: probe cannot be queued in time
        sink.mark_alive();
        sink.deliver(Arc::new(ServerFrame::pong(1))).unwrap();
        assert_eq!(sink.probe(timeout).await, Err(ProbeFailure::TimedOut));

        drop(rx);
        assert_eq!(sink.probe(timeout).await, Err(ProbeFailure::Closed));
    }
}
