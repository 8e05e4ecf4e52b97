//! Metrics collection and export for chatbus.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "chatbus_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "chatbus_connections_active";
    pub const FRAMES_TOTAL: &str = "chatbus_frames_total";
    pub const FRAMES_BYTES: &str = "chatbus_frames_bytes";
    pub const CHANNELS_ACTIVE: &str = "chatbus_channels_active";
    pub const FANOUT_RECIPIENTS: &str = "chatbus_fanout_recipients";
    pub const SERVER_DISCONNECTS_TOTAL: &str = "chatbus_server_disconnects_total";
    pub const ERRORS_TOTAL: &str = "chatbus_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(names::FRAMES_TOTAL, "Total number of frames by direction and kind");
    metrics::describe_counter!(names::FRAMES_BYTES, "Total bytes of frames by direction");
    metrics::describe_gauge!(names::CHANNELS_ACTIVE, "Current number of channels");
    metrics::describe_histogram!(
        names::FANOUT_RECIPIENTS,
        "Connections a published message was queued for"
    );
    metrics::describe_counter!(
        names::SERVER_DISCONNECTS_TOTAL,
        "Connections closed by the broker (failed probe or full outbound queue)"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors by kind");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a frame crossing the socket.
pub fn record_frame(bytes: usize, direction: &'static str, kind: &'static str) {
    counter!(names::FRAMES_TOTAL, "direction" => direction, "kind" => kind).increment(1);
    counter!(names::FRAMES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record how many connections a publish reached.
pub fn record_fanout(recipients: usize) {
    histogram!(names::FANOUT_RECIPIENTS).record(recipients as f64);
}

/// Update active channel count.
pub fn set_active_channels(count: usize) {
    gauge!(names::CHANNELS_ACTIVE).set(count as f64);
}

/// Record a connection closed from the server side.
pub fn record_server_disconnect() {
    counter!(names::SERVER_DISCONNECTS_TOTAL).increment(1);
}

/// Record an error.
pub fn record_error(kind: &'static str) {
    counter!(names::ERRORS_TOTAL, "kind" => kind).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_exporter() {
        // No recorder installed: every call is a no-op
        let guard = ConnectionMetricsGuard::new();
        record_frame(42, "inbound", "text");
        record_fanout(3);
        record_error("validation");
        drop(guard);
    }
}
