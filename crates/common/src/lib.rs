//! Shared types for the threshold-signing coordination layer.
//!
//! Every process in the cluster (hub, node agents, gateway) speaks the same
//! JSON envelope over a WebSocket control channel. This crate owns that
//! envelope, the hub client used by nodes and the gateway, and the small
//! encoding helpers (hex digests, Ethereum identities) the components share.

pub mod client;
pub mod error;
pub mod eth;
pub mod hexutil;
pub mod observability;
pub mod wire;

pub use error::{TransportError, WireError};
pub use wire::{CommandKind, MessageType, Role, WireMessage};

/// Default session (room) name shared by the gateway and nodes.
pub const DEFAULT_SESSION: &str = "cluster";

/// Default party id of the gateway inside the session.
pub const DEFAULT_GATEWAY_PARTY: &str = "G";

/// Default hub WebSocket URL.
pub const DEFAULT_HUB_URL: &str = "ws://tss-coordinator:9000/ws";

/// Current wall-clock time in unix milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
