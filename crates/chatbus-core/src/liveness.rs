//! Liveness monitoring for chatbus connections.
//!
//! On every tick the monitor probes all registered connections concurrently.
//! A connection that shows no activity between two passes, or whose probe
//! cannot be queued in time, is torn down through the broker.

use crate::broker::Broker;
use crate::registry::ConnectionId;
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Shortest sweep interval. A connection needs time to answer a probe
/// before the next pass counts it as silent.
pub const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Liveness configuration.
#[derive(Debug, Clone)]
pub struct LivenessConfig {
    /// Time between probe passes, at least [`MIN_INTERVAL`].
    pub interval: Duration,
    /// Upper bound on queueing a single probe.
    pub probe_timeout: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

/// Periodic prober that reaps dead connections.
pub struct LivenessMonitor {
    broker: Arc<Broker>,
    config: LivenessConfig,
}

impl LivenessMonitor {
    /// Create a monitor for `broker`.
    #[must_use]
    pub fn new(broker: Arc<Broker>, config: LivenessConfig) -> Self {
        Self { broker, config }
    }

    /// Run one probe pass.
    ///
    /// Returns the handles that were torn down.
    pub async fn sweep(&self) -> Vec<ConnectionId> {
        let connections = self.broker.connections();
        let total = connections.len();
        let timeout = self.config.probe_timeout;

        let results = join_all(connections.into_iter().map(|(handle, sink)| async move {
            let outcome = sink.probe(timeout).await;
            (handle, outcome)
        }))
        .await;

        let mut reaped = Vec::new();
        for (handle, outcome) in results {
            if let Err(reason) = outcome {
                if self.broker.teardown(&handle) {
                    info!(connection = %handle, reason = %reason, "Reaped dead connection");
                    reaped.push(handle);
                }
            }
        }

        debug!(probed = total, reaped = reaped.len(), "Liveness pass complete");
        reaped
    }

    /// Probe on every interval until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let period = self.config.interval.max(MIN_INTERVAL);
        if period != self.config.interval {
            warn!(configured = ?self.config.interval, used = ?period, "Liveness interval raised");
        }
        let mut ticker = tokio::time::interval(period);
        // The first tick completes immediately.
        ticker.tick().await;

        info!(interval = ?period, "Liveness monitor started");
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep().await;
                }
            }
        }
        info!("Liveness monitor stopped");
    }

    /// Spawn [`run`](Self::run) on the current runtime.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Outbound;
    use tokio::sync::mpsc;

    fn monitor(broker: &Arc<Broker>) -> LivenessMonitor {
        LivenessMonitor::new(
            Arc::clone(broker),
            LivenessConfig {
                interval: Duration::from_secs(30),
                probe_timeout: Duration::from_secs(5),
            },
        )
    }

    fn connect(broker: &Broker, id: &str) -> (ConnectionId, mpsc::Receiver<Outbound>) {
        let handle = ConnectionId::from(id);
        let (sink, rx) = broker.sink();
        broker.connect(&handle, sink);
        (handle, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_responsive_connection_survives() {
        let broker = Arc::new(Broker::new());
        let (h1, mut rx) = connect(&broker, "conn-1");
        let monitor = monitor(&broker);

        for _ in 0..3 {
            assert!(monitor.sweep().await.is_empty());
            assert!(matches!(rx.recv().await, Some(Outbound::Probe)));
            broker.mark_alive(&h1);
        }
        assert_eq!(broker.stats().connected_sockets, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_connection_is_reaped() {
        let broker = Arc::new(Broker::new());
        broker.create_channel("general", "alice").unwrap();
        let (h1, _rx1) = connect(&broker, "conn-1");
        let (h2, _rx2) = connect(&broker, "conn-2");
        broker.subscribe(&h1, "general", "alice").unwrap();
        broker.subscribe(&h2, "general", "bob").unwrap();
        let monitor = monitor(&broker);

        // First pass probes both
        assert!(monitor.sweep().await.is_empty());

        // Only h2 answers
        broker.mark_alive(&h2);
        assert_eq!(monitor.sweep().await, vec![h1.clone()]);

        let info = broker.channel_info("general").unwrap();
        assert_eq!(info.subscribers, vec!["bob"]);
        assert_eq!(broker.stats().connected_sockets, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_connection_is_reaped() {
        let broker = Arc::new(Broker::new());
        let (h1, rx) = connect(&broker, "conn-1");
        drop(rx);

        assert_eq!(monitor(&broker).sweep().await, vec![h1]);
        assert!(broker.connections().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_queue_times_out() {
        let broker = Arc::new(Broker::with_config(crate::BrokerConfig {
            outbound_queue: 1,
            ..crate::BrokerConfig::default()
        }));
        let (h1, _rx) = connect(&broker, "conn-1");
        broker.ping(&h1).unwrap();

        assert_eq!(monitor(&broker).sweep().await, vec![h1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_cancelled() {
        let broker = Arc::new(Broker::new());
        let (_h1, rx) = connect(&broker, "conn-1");
        drop(rx);

        let shutdown = CancellationToken::new();
        let task = monitor(&broker).spawn(shutdown.clone());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(broker.stats().connected_sockets, 0);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_is_raised() {
        let broker = Arc::new(Broker::new());
        let (_h1, rx) = connect(&broker, "conn-1");
        drop(rx);

        let monitor = LivenessMonitor::new(
            Arc::clone(&broker),
            LivenessConfig {
                interval: Duration::ZERO,
                probe_timeout: Duration::from_secs(5),
            },
        );
        let shutdown = CancellationToken::new();
        let task = monitor.spawn(shutdown.clone());

        tokio::time::sleep(MIN_INTERVAL + Duration::from_millis(10)).await;
        assert_eq!(broker.stats().connected_sockets, 0);

        shutdown.cancel();
        task.await.unwrap();
    }
}
