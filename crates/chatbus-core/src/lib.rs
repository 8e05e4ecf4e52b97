//! # chatbus-core
//!
//! Channel state and connection brokering for the chatbus messaging bus.
//!
//! This crate provides the building blocks that every transport shares:
//!
//! - **ChannelStore** - Named channels with bounded history and subscriber sets
//! - **ConnectionRegistry** - Live connections, their identity and subscriptions
//! - **Broker** - Request dispatch and fan-out to subscribed connections
//! - **LivenessMonitor** - Periodic probing and reaping of dead connections
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌──────────────┐
//! │  Transport  │────▶│   Broker    │────▶│ ChannelStore │
//! └─────────────┘     └─────────────┘     └──────────────┘
//!        ▲                   │    ▲
//!        │ sink              ▼    │ teardown
//!        │          ┌─────────────────┐   ┌─────────────────┐
//!        └──────────│ConnectionRegistry│◀──│ LivenessMonitor │
//!                   └─────────────────┘   └─────────────────┘
//! ```

pub mod broker;
pub mod channel;
pub mod liveness;
pub mod message;
pub mod registry;

pub use broker::{
    Broker, BrokerConfig, BrokerError, BrokerStats, Handled, Published, HISTORY_REPLAY,
};
pub use channel::{Channel, ChannelError, ChannelId, ChannelInfo, ChannelStore, ChannelSummary};
pub use liveness::{LivenessConfig, LivenessMonitor};
pub use message::{generate_message_id, now_millis, MessageDraft};
pub use registry::{
    ConnectionId, ConnectionRecord, ConnectionRegistry, ConnectionSink, Membership, Outbound,
    ProbeFailure, SinkError,
};
