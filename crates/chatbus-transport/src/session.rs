//! Reconnecting client session.
//!
//! A [`ClientSession`] owns one background task that holds the current
//! connection. When the connection drops, the task reconnects following a
//! [`Backoff`] schedule and re-subscribes to every channel that was active,
//! before any queued command is sent. Once the attempts are exhausted the
//! session reports [`SessionState::Failed`] and stops.
//!
//! The reconnect timer lives inside the task, so [`ClientSession::shutdown`]
//! (or dropping the session) cancels it together with the connection.

use crate::backoff::Backoff;
use crate::traits::{Connection, Connector, TransportError};
use chatbus_protocol::{ClientFrame, ServerFrame};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Floor for [`SessionConfig::ping_interval`]; a zero period is not a timer.
const MIN_PING_INTERVAL: Duration = Duration::from_millis(1);

/// Client session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Reconnect schedule.
    pub backoff: Backoff,
    /// Interval between keepalive pings.
    pub ping_interval: Duration,
    /// Capacity of the command and event queues.
    pub queue_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backoff: Backoff::default(),
            ping_interval: Duration::from_secs(30),
            queue_capacity: 64,
        }
    }
}

/// Connection state reported by a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Opening the first connection.
    Connecting,
    /// A connection is up.
    Connected,
    /// Waiting `delay` before reconnect attempt `attempt`.
    Reconnecting { attempt: u32, delay: Duration },
    /// Shut down by the owner.
    Disconnected,
    /// Reconnect attempts exhausted; no further attempts are made.
    Failed,
}

#[derive(Debug)]
enum Command {
    Subscribe(String),
    Unsubscribe(String),
    Publish { channel: String, text: String },
    Ping,
}

/// How a connected period ended.
enum Exit {
    Shutdown,
    Dropped,
}

/// Handle to a reconnecting session.
pub struct ClientSession {
    commands: mpsc::Sender<Command>,
    events: mpsc::Receiver<ServerFrame>,
    state: watch::Receiver<SessionState>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ClientSession {
    /// Start a session that connects through `connector` as `username`.
    pub fn spawn<C>(connector: C, username: impl Into<String>, config: SessionConfig) -> Self
    where
        C: Connector + 'static,
    {
        let capacity = config.queue_capacity.max(1);
        let (command_tx, command_rx) = mpsc::channel(capacity);
        let (event_tx, event_rx) = mpsc::channel(capacity);
        let (state_tx, state_rx) = watch::channel(SessionState::Connecting);
        let shutdown = CancellationToken::new();

        let worker = Worker {
            connector,
            username: username.into(),
            config,
            channels: BTreeSet::new(),
            commands: command_rx,
            events: event_tx,
            state: state_tx,
            shutdown: shutdown.clone(),
        };
        let task = tokio::spawn(worker.run());

        Self {
            commands: command_tx,
            events: event_rx,
            state: state_rx,
            shutdown,
            task: Some(task),
        }
    }

    /// Subscribe to a channel; restored automatically after reconnects.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::SessionClosed`] if the session has stopped.
    pub async fn subscribe(&self, channel: impl Into<String>) -> Result<(), TransportError> {
        self.command(Command::Subscribe(channel.into())).await
    }

    /// Unsubscribe from a channel.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::SessionClosed`] if the session has stopped.
    pub async fn unsubscribe(&self, channel: impl Into<String>) -> Result<(), TransportError> {
        self.command(Command::Unsubscribe(channel.into())).await
    }

    /// Publish a message. Dropped with a warning while disconnected.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::SessionClosed`] if the session has stopped.
    pub async fn publish(
        &self,
        channel: impl Into<String>,
        text: impl Into<String>,
    ) -> Result<(), TransportError> {
        self.command(Command::Publish {
            channel: channel.into(),
            text: text.into(),
        })
        .await
    }

    /// Send a ping.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::SessionClosed`] if the session has stopped.
    pub async fn ping(&self) -> Result<(), TransportError> {
        self.command(Command::Ping).await
    }

    async fn command(&self, command: Command) -> Result<(), TransportError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| TransportError::SessionClosed)
    }

    /// Next frame received from the server, across reconnects.
    ///
    /// Returns `None` once the session has stopped and all frames are drained.
    pub async fn next_event(&mut self) -> Option<ServerFrame> {
        self.events.recv().await
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Subscribe to state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Stop the session, cancelling any pending reconnect, and wait for the
    /// task to finish.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        self.events.close();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Session task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct Worker<C> {
    connector: C,
    username: String,
    config: SessionConfig,
    /// Channels to restore after a reconnect.
    channels: BTreeSet<String>,
    commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<ServerFrame>,
    state: watch::Sender<SessionState>,
    shutdown: CancellationToken,
}

impl<C: Connector> Worker<C> {
    async fn run(mut self) {
        let mut attempt = 0u32;

        loop {
            let connected = tokio::select! {
                () = self.shutdown.cancelled() => break,
                result = self.connector.connect() => result,
            };

            match connected {
                Ok(conn) => {
                    attempt = 0;
                    info!(
                        transport = self.connector.name(),
                        username = %self.username,
                        "Session connected"
                    );
                    self.state.send_replace(SessionState::Connected);
                    if let Exit::Shutdown = self.drive(conn).await {
                        break;
                    }
                    warn!(username = %self.username, "Session connection lost");
                }
                Err(e) => {
                    warn!(transport = self.connector.name(), error = %e, "Connect failed");
                }
            }

            attempt += 1;
            let Some(delay) = self.config.backoff.delay(attempt) else {
                warn!(
                    attempts = self.config.backoff.max_attempts,
                    "Reconnect attempts exhausted"
                );
                self.state.send_replace(SessionState::Failed);
                return;
            };

            info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting");
            self.state
                .send_replace(SessionState::Reconnecting { attempt, delay });
            if let Exit::Shutdown = self.wait(delay).await {
                break;
            }
        }

        self.state.send_replace(SessionState::Disconnected);
        debug!(username = %self.username, "Session stopped");
    }

    /// Sleep out a backoff delay, still accepting commands.
    async fn wait(&mut self, delay: Duration) -> Exit {
        let timer = sleep(delay);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => return Exit::Shutdown,
                () = &mut timer => return Exit::Dropped,
                command = self.commands.recv() => match command {
                    Some(command) => {
                        self.track(&command);
                        if let Command::Publish { channel, .. } = &command {
                            warn!(channel = %channel, "Not connected, dropping publish");
                        }
                    }
                    None => return Exit::Shutdown,
                },
            }
        }
    }

    /// Serve one connection until it drops or the session stops.
    async fn drive(&mut self, mut conn: Box<dyn Connection>) -> Exit {
        for channel in &self.channels {
            let frame = ClientFrame::subscribe(channel.as_str(), self.username.as_str());
            if let Err(e) = conn.send(&frame).await {
                warn!(channel = %channel, error = %e, "Resubscribe failed");
                return Exit::Dropped;
            }
        }
        if !self.channels.is_empty() {
            debug!(channels = self.channels.len(), "Subscriptions restored");
        }

        let period = self.config.ping_interval.max(MIN_PING_INTERVAL);
        let mut ping = interval_at(Instant::now() + period, period);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let exit = loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break Exit::Shutdown,
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        break Exit::Shutdown;
                    };
                    self.track(&command);
                    let frame = self.frame_for(command);
                    if let Err(e) = conn.send(&frame).await {
                        warn!(frame = frame.kind(), error = %e, "Send failed");
                        return Exit::Dropped;
                    }
                }
                received = conn.recv() => match received {
                    Ok(Some(frame)) => {
                        // Waits while the owner is behind on events, but never
                        // past a shutdown.
                        tokio::select! {
                            () = self.shutdown.cancelled() => break Exit::Shutdown,
                            sent = self.events.send(frame) => {
                                if sent.is_err() {
                                    debug!("Event receiver dropped");
                                }
                            }
                        }
                    }
                    Ok(None) => return Exit::Dropped,
                    Err(e) => {
                        warn!(error = %e, "Receive failed");
                        return Exit::Dropped;
                    }
                },
                _ = ping.tick() => {
                    if let Err(e) = conn.send(&ClientFrame::Ping).await {
                        warn!(error = %e, "Ping failed");
                        return Exit::Dropped;
                    }
                }
            }
        };

        if let Err(e) = conn.close().await {
            debug!(error = %e, "Close failed");
        }
        exit
    }

    fn track(&mut self, command: &Command) {
        match command {
            Command::Subscribe(channel) => {
                self.channels.insert(channel.clone());
            }
            Command::Unsubscribe(channel) => {
                self.channels.remove(channel);
            }
            Command::Publish { .. } | Command::Ping => {}
        }
    }

    fn frame_for(&self, command: Command) -> ClientFrame {
        match command {
            Command::Subscribe(channel) => ClientFrame::subscribe(channel, self.username.as_str()),
            Command::Unsubscribe(channel) => ClientFrame::unsubscribe(channel),
            Command::Publish { channel, text } => {
                ClientFrame::publish(channel, text, self.username.as_str())
            }
            Command::Ping => ClientFrame::Ping,
        }
    }
}
