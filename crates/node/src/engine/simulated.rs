//! Insecure engine for local clusters and tests.
//!
//! Keygen: every party draws a secret scalar and broadcasts the matching
//! public point; the group key is the sum of all points. Signing: every party
//! broadcasts its secret scalar, reconstructs the full key and signs the
//! digest deterministically (RFC 6979), so all parties produce the same
//! `(r, s)`. Anyone watching the relay during signing learns the key.
//!
//! All named parties must take part; the threshold is only validated.

use std::collections::BTreeMap;

use k256::ecdsa::signature::hazmat::PrehashSigner;
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{NonZeroScalar, PublicKey, Scalar, SecretKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{
    Destination, EngineError, EngineInstance, EngineIo, EngineSetup, InboundWire, KeygenOutput,
    MpcEngine, OutboundWire, SignOutput,
};

const SCHEME: &str = "simulated-additive";

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum SimMessage {
    PublicShare { point_hex: String },
    SecretShare { scalar_hex: String },
}

#[derive(Debug, Serialize, Deserialize)]
struct SimulatedShare {
    scheme: String,
    index: u16,
    parties: u16,
    secret_hex: String,
    public_key_hex: String,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SimulatedEngine;

impl SimulatedEngine {
    pub fn new() -> Self {
        Self
    }
}

impl MpcEngine for SimulatedEngine {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn start_keygen(
        &self,
        setup: EngineSetup,
    ) -> Result<EngineInstance<KeygenOutput>, EngineError> {
        setup.validate()?;
        Ok(EngineInstance::spawn(move |io| run_keygen(setup, io)))
    }

    fn start_sign(
        &self,
        setup: EngineSetup,
        share: &serde_json::Value,
        digest: [u8; 32],
    ) -> Result<EngineInstance<SignOutput>, EngineError> {
        setup.validate()?;
        let share: SimulatedShare = serde_json::from_value(share.clone())
            .map_err(|e| EngineError::InvalidShare(e.to_string()))?;
        if share.scheme != SCHEME {
            return Err(EngineError::InvalidShare(format!(
                "unexpected scheme {}",
                share.scheme
            )));
        }
        if share.parties != setup.parties || share.index != setup.self_index {
            return Err(EngineError::InvalidShare(format!(
                "share is for party {}/{}, run is {}/{}",
                share.index, share.parties, setup.self_index, setup.parties
            )));
        }
        let secret = parse_scalar(&share.secret_hex)?;
        let public_key = parse_point(&share.public_key_hex)?;
        Ok(EngineInstance::spawn(move |io| {
            run_signing(setup, secret, public_key, digest, io)
        }))
    }
}

fn parse_scalar(hex_str: &str) -> Result<NonZeroScalar, EngineError> {
    let bytes = hex::decode(hex_str).map_err(|e| EngineError::InvalidShare(e.to_string()))?;
    SecretKey::from_slice(&bytes)
        .map(|sk| sk.to_nonzero_scalar())
        .map_err(|e| EngineError::InvalidShare(e.to_string()))
}

fn parse_point(hex_str: &str) -> Result<PublicKey, EngineError> {
    let bytes = hex::decode(hex_str).map_err(|e| EngineError::InvalidShare(e.to_string()))?;
    PublicKey::from_sec1_bytes(&bytes).map_err(|e| EngineError::InvalidShare(e.to_string()))
}

fn broadcast(
    outbound: &mpsc::UnboundedSender<OutboundWire>,
    msg: &SimMessage,
) -> Result<(), EngineError> {
    let payload = serde_json::to_vec(msg).map_err(|e| EngineError::Protocol(e.to_string()))?;
    outbound
        .send(OutboundWire {
            destination: Destination::Broadcast,
            payload,
        })
        .map_err(|_| EngineError::Aborted)
}

/// Collect one message of the expected kind from every other party.
async fn collect<T>(
    setup: &EngineSetup,
    inbound: &mut mpsc::UnboundedReceiver<InboundWire>,
    extract: impl Fn(SimMessage) -> Option<Result<T, EngineError>>,
) -> Result<BTreeMap<u16, T>, EngineError> {
    let expected = usize::from(setup.parties) - 1;
    let mut received = BTreeMap::new();
    while received.len() < expected {
        let wire = inbound.recv().await.ok_or(EngineError::Aborted)?;
        if wire.from == setup.self_index || wire.from == 0 || wire.from > setup.parties {
            warn!("Ignoring message from unexpected index {}", wire.from);
            continue;
        }
        if received.contains_key(&wire.from) {
            debug!("Duplicate message from party {}", wire.from);
            continue;
        }
        let msg: SimMessage = match serde_json::from_slice(&wire.payload) {
            Ok(m) => m,
            Err(e) => {
                warn!("Undecodable message from party {}: {}", wire.from, e);
                continue;
            }
        };
        match extract(msg) {
            Some(value) => {
                received.insert(wire.from, value?);
            }
            None => debug!("Unexpected message kind from party {}", wire.from),
        }
    }
    Ok(received)
}

async fn run_keygen(setup: EngineSetup, io: EngineIo) -> Result<KeygenOutput, EngineError> {
    let EngineIo {
        mut inbound,
        outbound,
    } = io;
    info!(
        "Starting simulated keygen: party {}/{}",
        setup.self_index, setup.parties
    );

    let secret = NonZeroScalar::random(&mut OsRng);
    let own_point = PublicKey::from_secret_scalar(&secret);
    broadcast(
        &outbound,
        &SimMessage::PublicShare {
            point_hex: hex::encode(own_point.to_encoded_point(true).as_bytes()),
        },
    )?;

    let points = collect(&setup, &mut inbound, |msg| match msg {
        SimMessage::PublicShare { point_hex } => Some(parse_point(&point_hex)),
        _ => None,
    })
    .await?;

    let sum = points
        .values()
        .fold(own_point.to_projective(), |acc, p| acc + p.to_projective());
    let group_key = PublicKey::from_affine(sum.to_affine())
        .map_err(|_| EngineError::Protocol("group key is the identity".into()))?;
    let uncompressed = group_key.to_encoded_point(false).as_bytes().to_vec();

    let share = SimulatedShare {
        scheme: SCHEME.to_string(),
        index: setup.self_index,
        parties: setup.parties,
        secret_hex: hex::encode(secret.to_bytes()),
        public_key_hex: hex::encode(&uncompressed),
    };
    let share = serde_json::to_value(share).map_err(|e| EngineError::InvalidShare(e.to_string()))?;
    Ok(KeygenOutput {
        public_key: uncompressed,
        share,
    })
}

async fn run_signing(
    setup: EngineSetup,
    secret: NonZeroScalar,
    public_key: PublicKey,
    digest: [u8; 32],
    io: EngineIo,
) -> Result<SignOutput, EngineError> {
    let EngineIo {
        mut inbound,
        outbound,
    } = io;
    info!(
        "Starting simulated signing: party {}/{}, digest {}",
        setup.self_index,
        setup.parties,
        hex::encode(digest)
    );

    broadcast(
        &outbound,
        &SimMessage::SecretShare {
            scalar_hex: hex::encode(secret.to_bytes()),
        },
    )?;
    let shares = collect(&setup, &mut inbound, |msg| match msg {
        SimMessage::SecretShare { scalar_hex } => Some(parse_scalar(&scalar_hex)),
        _ => None,
    })
    .await?;

    let full: Scalar = shares.values().fold(*secret, |acc, s| acc + **s);
    let key = SigningKey::from_bytes(&full.to_bytes())
        .map_err(|_| EngineError::Protocol("reconstructed key is zero".into()))?;
    if VerifyingKey::from(&public_key) != *key.verifying_key() {
        return Err(EngineError::Protocol(
            "reconstructed key does not match the group key".into(),
        ));
    }

    let signature: Signature = key
        .sign_prehash(&digest)
        .map_err(|e| EngineError::Protocol(e.to_string()))?;
    let (r, s) = signature.split_bytes();
    Ok(SignOutput {
        r: r.into(),
        s: s.into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::relay;
    use common::eth;

    fn setup(self_index: u16, execution_id: [u8; 32]) -> EngineSetup {
        EngineSetup {
            self_index,
            parties: 3,
            threshold: 1,
            execution_id,
        }
    }

    #[tokio::test]
    async fn test_keygen_then_sign_produces_verifiable_signature() {
        let engine = SimulatedEngine::new();
        let keygens = (1..=3)
            .map(|i| engine.start_keygen(setup(i, [1; 32])).unwrap())
            .collect();
        let outputs = relay(keygens).await;
        assert!(outputs.iter().all(|o| o.public_key == outputs[0].public_key));
        assert_eq!(outputs[0].public_key.len(), 65);

        let digest = eth::keccak256(b"simulated");
        let signers = outputs
            .iter()
            .enumerate()
            .map(|(i, o)| {
                engine
                    .start_sign(setup(i as u16 + 1, [2; 32]), &o.share, digest)
                    .unwrap()
            })
            .collect();
        let sigs = relay(signers).await;
        assert!(sigs.iter().all(|s| *s == sigs[0]));

        let key = VerifyingKey::from_sec1_bytes(&outputs[0].public_key).unwrap();
        assert!(eth::verify_prehash(&key, &digest, &sigs[0].r, &sigs[0].s).unwrap());
    }

    #[tokio::test]
    async fn test_share_for_other_party_is_rejected() {
        let engine = SimulatedEngine::new();
        let keygens = (1..=3)
            .map(|i| engine.start_keygen(setup(i, [3; 32])).unwrap())
            .collect();
        let outputs = relay(keygens).await;

        // Party 2's share presented by party 1.
        let result = engine.start_sign(setup(1, [4; 32]), &outputs[1].share, [0u8; 32]);
        assert!(matches!(result, Err(EngineError::InvalidShare(_))));

        let result = engine.start_sign(setup(1, [4; 32]), &serde_json::json!({}), [0u8; 32]);
        assert!(matches!(result, Err(EngineError::InvalidShare(_))));
    }
}
