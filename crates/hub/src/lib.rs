//! Session-scoped WebSocket relay for the threshold-signing cluster.

pub mod error;
pub mod hub;
pub mod server;

pub use error::HubError;
pub use hub::{ConnectionId, Hub, MemberSnapshot, SessionSnapshot, OUTBOX_CAPACITY};
pub use server::{router, HubConfig};
