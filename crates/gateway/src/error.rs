//! Gateway errors with their HTTP mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use common::{TransportError, WireError};

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("missing hash_hex")]
    MissingHash,

    #[error("invalid hash_hex: {0}")]
    InvalidHash(#[source] WireError),

    /// A party reported `ok:false`.
    #[error("party {party} failed: {detail}")]
    PartyFailed { party: String, detail: String },

    /// Parties disagree on the generated address.
    #[error("address mismatch: party {party} reported {b}, expected {a}")]
    AddressMismatch { a: String, b: String, party: String },

    #[error("signing failed at {party}: {err}")]
    SignFailed { party: String, err: String },

    #[error("keygen timed out with {received}/{expected} results")]
    KeygenTimeout { received: usize, expected: usize },

    #[error("signing timed out")]
    SignTimeout,

    #[error("hub unavailable: {0}")]
    Hub(#[from] TransportError),

    #[error("hub connection lost")]
    HubDisconnected,
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::MissingHash | GatewayError::InvalidHash(_) => StatusCode::BAD_REQUEST,
            GatewayError::PartyFailed { .. }
            | GatewayError::AddressMismatch { .. }
            | GatewayError::SignFailed { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::KeygenTimeout { .. } | GatewayError::SignTimeout => {
                StatusCode::GATEWAY_TIMEOUT
            }
            GatewayError::Hub(_) | GatewayError::HubDisconnected => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        }
    }

    fn body(&self) -> serde_json::Value {
        match self {
            GatewayError::MissingHash => json!({"ok": false, "err": "missing hash_hex"}),
            GatewayError::InvalidHash(e) => {
                json!({"ok": false, "err": "invalid hash_hex", "detail": e.to_string()})
            }
            GatewayError::PartyFailed { party, detail } => {
                json!({"ok": false, "err": "party failed", "party": party, "detail": detail})
            }
            GatewayError::AddressMismatch { a, b, party } => {
                json!({"ok": false, "err": "address mismatch", "a": a, "b": b, "party": party})
            }
            GatewayError::SignFailed { party, err } => {
                json!({"ok": false, "err": err, "party": party})
            }
            GatewayError::KeygenTimeout { received, expected } => {
                json!({"ok": false, "err": "timeout", "received": received, "expected": expected})
            }
            GatewayError::SignTimeout => json!({"ok": false, "err": "timeout"}),
            GatewayError::Hub(e) => {
                json!({"ok": false, "err": "hub unavailable", "detail": e.to_string()})
            }
            GatewayError::HubDisconnected => json!({"ok": false, "err": "hub unavailable"}),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self.body())).into_response()
    }
}
