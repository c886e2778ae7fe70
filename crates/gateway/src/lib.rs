//! HTTP bridge between synchronous callers and the signing cluster.
//!
//! Each request issues one control command through the hub, collects the
//! nodes' results under a deadline and reduces them into a single response.
//! Requests are handled one at a time.

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

pub mod config;
pub mod error;
pub mod handlers;
pub mod pending;
pub mod state;

pub use config::{parse_parties, ConfigError, GatewayConfig};
pub use error::{GatewayError, GatewayResult};
pub use handlers::{KeygenResponse, SignResponse};
pub use state::{GatewayState, Identity};

pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/address", get(handlers::address))
        .route("/keygen", post(handlers::keygen))
        .route("/signHash", post(handlers::sign_hash))
        .with_state(state)
}
