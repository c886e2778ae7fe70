//! HTTP handlers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Bytes,
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use common::{eth, hexutil, CommandKind, WireMessage};

use crate::error::{GatewayError, GatewayResult};
use crate::pending::{KeygenCollector, PendingRequest};
use crate::state::{GatewayState, Identity};

#[derive(Debug, Serialize, Deserialize)]
pub struct KeygenResponse {
    pub ok: bool,
    pub address: String,
    pub pubkey: String,
    pub threshold: u16,
    pub parties: Vec<String>,
    pub t_keygen_ms: u64,
}

#[derive(Debug, Default, Deserialize)]
pub struct SignRequest {
    #[serde(default)]
    pub hash_hex: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SignResponse {
    pub ok: bool,
    pub r: String,
    pub s: String,
    pub party: String,
    pub t_sign_ms: u64,
}

/// GET /health
pub async fn health() -> &'static str {
    "ok"
}

/// GET /address - last agreed group identity, empty before the first keygen.
pub async fn address(State(state): State<Arc<GatewayState>>) -> Json<Identity> {
    Json(state.identity().await)
}

/// Drop results left over from earlier, already answered requests.
fn drain_stale(results: &mut mpsc::Receiver<WireMessage>) {
    let mut dropped = 0usize;
    while results.try_recv().is_ok() {
        dropped += 1;
    }
    if dropped > 0 {
        debug!("Dropped {} stale results", dropped);
    }
}

fn command(state: &GatewayState, cmd: CommandKind, msg_id: &str) -> WireMessage {
    let config = &state.config;
    let mut msg = WireMessage::command(config.session.clone(), config.party.clone(), cmd)
        .with_parties(config.parties.clone())
        .with_msg_id(msg_id);
    msg.threshold = i64::from(config.threshold);
    msg
}

/// POST /keygen
pub async fn keygen(State(state): State<Arc<GatewayState>>) -> GatewayResult<Json<KeygenResponse>> {
    let mut results = state.results.lock().await;
    drain_stale(&mut results);

    let config = &state.config;
    let msg_id = Uuid::new_v4().to_string();
    let pending = PendingRequest::new(
        msg_id.clone(),
        CommandKind::KeygenResult,
        config.parties.clone(),
    );
    let mut collector = KeygenCollector::new(config.parties.clone());

    let start = Instant::now();
    info!(
        "Starting keygen {} with parties {:?}, threshold {}",
        msg_id, config.parties, config.threshold
    );
    state.hub.send(command(&state, CommandKind::Keygen, &msg_id))?;

    let deadline = tokio::time::sleep(config.keygen_timeout);
    tokio::pin!(deadline);
    let agreement = loop {
        let msg = tokio::select! {
            _ = &mut deadline => {
                warn!(
                    "Keygen {} timed out with {}/{} results",
                    msg_id,
                    collector.received(),
                    collector.expected()
                );
                return Err(GatewayError::KeygenTimeout {
                    received: collector.received(),
                    expected: collector.expected(),
                });
            }
            msg = results.recv() => msg.ok_or(GatewayError::HubDisconnected)?,
        };
        if !pending.matches(&msg) {
            continue;
        }
        debug!("Keygen result from {} (ok={})", msg.party, msg.ok);
        match collector.accept(msg) {
            Ok(Some(agreement)) => break agreement,
            Ok(None) => {}
            Err(e) => {
                warn!("Keygen {} failed: {}", msg_id, e);
                return Err(e);
            }
        }
    };

    let elapsed = start.elapsed();
    info!(
        "Keygen {} agreed on {} in {:?}",
        msg_id, agreement.address, elapsed
    );
    state
        .set_identity(Identity {
            address: agreement.address.clone(),
            pubkey: agreement.pubkey.clone(),
        })
        .await;

    Ok(Json(KeygenResponse {
        ok: true,
        address: agreement.address,
        pubkey: agreement.pubkey,
        threshold: config.threshold,
        parties: config.parties.clone(),
        t_keygen_ms: elapsed.as_millis() as u64,
    }))
}

/// POST /signHash - digest from a JSON body, falling back to `?hash_hex=`.
pub async fn sign_hash(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> GatewayResult<Json<SignResponse>> {
    let from_body = serde_json::from_slice::<SignRequest>(&body)
        .map(|req| req.hash_hex)
        .unwrap_or_default();
    let hash_hex = if from_body.trim().is_empty() {
        query.get("hash_hex").cloned().unwrap_or_default()
    } else {
        from_body
    };
    if hash_hex.trim().is_empty() {
        return Err(GatewayError::MissingHash);
    }
    let digest = hexutil::decode_hash32(&hash_hex).map_err(GatewayError::InvalidHash)?;

    let mut results = state.results.lock().await;
    drain_stale(&mut results);

    let config = &state.config;
    let msg_id = Uuid::new_v4().to_string();
    let pending = PendingRequest::new(
        msg_id.clone(),
        CommandKind::SignResult,
        config.parties.clone(),
    );

    let start = Instant::now();
    info!("Starting signing {} for digest {}", msg_id, hexutil::encode_0x(digest));
    let mut cmd = command(&state, CommandKind::Sign, &msg_id);
    cmd.hash_hex = hexutil::encode_0x(digest);
    state.hub.send(cmd)?;

    let deadline = tokio::time::sleep(config.sign_timeout);
    tokio::pin!(deadline);
    let result = loop {
        let msg = tokio::select! {
            _ = &mut deadline => {
                warn!("Signing {} timed out", msg_id);
                return Err(GatewayError::SignTimeout);
            }
            msg = results.recv() => msg.ok_or(GatewayError::HubDisconnected)?,
        };
        if pending.matches(&msg) {
            break msg;
        }
    };

    if !result.ok {
        warn!("Signing {} failed at {}: {}", msg_id, result.party, result.err);
        return Err(GatewayError::SignFailed {
            party: result.party,
            err: result.err,
        });
    }

    let elapsed = start.elapsed();
    info!("Signing {} answered by {} in {:?}", msg_id, result.party, elapsed);
    check_signature(&state, &digest, &result).await;

    Ok(Json(SignResponse {
        ok: true,
        r: result.r_hex,
        s: result.s_hex,
        party: result.party,
        t_sign_ms: elapsed.as_millis() as u64,
    }))
}

/// Log when a signature does not recover to the agreed address.
async fn check_signature(state: &GatewayState, digest: &[u8; 32], result: &WireMessage) {
    let identity = state.identity().await;
    if identity.address.is_empty() {
        return;
    }
    let parsed = hexutil::decode_left_padded32("r_hex", &result.r_hex).and_then(|r| {
        hexutil::decode_left_padded32("s_hex", &result.s_hex).map(|s| (r, s))
    });
    let verified =
        parsed.and_then(|(r, s)| eth::verify_prehash_address(&identity.address, digest, &r, &s));
    match verified {
        Ok(true) => {}
        Ok(false) => warn!(
            "Signature from {} does not recover to {}",
            result.party, identity.address
        ),
        Err(e) => warn!("Unreadable signature from {}: {}", result.party, e),
    }
}
