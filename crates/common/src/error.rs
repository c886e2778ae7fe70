//! Error types shared by all components.

use thiserror::Error;

/// Errors decoding or validating data carried inside a [`crate::WireMessage`].
#[derive(Debug, Error)]
pub enum WireError {
    /// Frame was not valid JSON for the envelope schema.
    #[error("malformed wire message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A hex field could not be decoded.
    #[error("invalid hex in {field}: {reason}")]
    InvalidHex { field: &'static str, reason: String },

    /// A fixed-size field had the wrong length.
    #[error("{field} must be {expected} bytes, got {actual}")]
    InvalidLength {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    /// A required field was empty.
    #[error("missing {0}")]
    Missing(&'static str),

    /// Elliptic-curve data (public key, signature) was invalid.
    #[error("invalid {field}: {reason}")]
    InvalidCrypto { field: &'static str, reason: String },
}

/// Errors on the WebSocket connection to the hub.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Failed to open the WebSocket.
    #[error("failed to connect to hub at {url}: {reason}")]
    ConnectionFailed { url: String, reason: String },

    /// The hello frame could not be delivered.
    #[error("hello handshake failed: {0}")]
    HandshakeFailed(String),

    /// The connection is closed; nothing more can be sent.
    #[error("hub connection closed")]
    Closed,

    /// Outgoing message could not be encoded.
    #[error(transparent)]
    Encode(#[from] WireError),
}
