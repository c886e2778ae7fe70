//! Node agent for one party of the threshold-signing cluster.
//!
//! The agent keeps a single hub connection, runs at most one keygen or
//! signing instance at a time and persists its key share locally.

pub mod agent;
pub mod config;
pub mod engine;
pub mod error;
pub mod runtime;
pub mod store;

pub use agent::NodeAgent;
pub use config::NodeConfig;
pub use engine::{EngineKind, MpcEngine};
pub use error::NodeError;
pub use runtime::RuntimeStatus;
pub use store::{KeyShareStore, StoredKeyShare};
