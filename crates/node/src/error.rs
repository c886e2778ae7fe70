//! Node agent errors.

use std::time::Duration;

use thiserror::Error;

use common::{TransportError, WireError};

use crate::engine::EngineError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum NodeError {
    /// Another command is still running.
    #[error("busy: {active} in progress")]
    Busy { active: String },

    #[error("invalid parties: {0}")]
    InvalidParties(String),

    #[error("invalid threshold {threshold} for {parties} parties")]
    InvalidThreshold { threshold: i64, parties: usize },

    #[error("invalid hash_hex: {0}")]
    InvalidDigest(#[from] WireError),

    #[error("no key share; run keygen first")]
    MissingKeyShare,

    /// The stored share was produced for a different cluster shape.
    #[error("key share mismatch: {0}")]
    ShareMismatch(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("timeout after {0:?}")]
    Timeout(Duration),

    #[error("cancelled")]
    Cancelled,

    #[error("hub connection lost")]
    HubDisconnected,

    #[error(transparent)]
    Transport(#[from] TransportError),
}
