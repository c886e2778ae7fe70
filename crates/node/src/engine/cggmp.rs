//! CGGMP24 threshold ECDSA over secp256k1.
//!
//! Keygen runs two sub-protocols back to back on the same wire channel:
//! threshold key generation (t + 1 signers) and auxiliary-info generation
//! with freshly generated primes. The persisted share holds both halves and
//! is recombined into a full key share for signing.
//!
//! A share signs with exactly `t + 1` parties: the first `t + 1` of the
//! keygen party list. The others do not take part.

use cggmp24::key_share::{AnyKeyShare, DirtyAuxInfo, DirtyIncompleteKeyShare, Validate};
use cggmp24::security_level::SecurityLevel128;
use cggmp24::supported_curves::Secp256k1;
use cggmp24::{ExecutionId, KeyShare, PregeneratedPrimes};
use generic_ec::{NonZero, Scalar};
use rand::rngs::OsRng;
use round_based::MpcParty;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use super::delivery::{channel_delivery, roster_delivery, split_phases};
use super::{
    EngineError, EngineInstance, EngineIo, EngineSetup, KeygenOutput, MpcEngine, SignOutput,
};

const PHASE_KEYGEN: u8 = 0;
const PHASE_AUX_INFO: u8 = 1;

/// Persisted form of a CGGMP24 key share.
#[derive(Serialize, Deserialize)]
struct StoredShare {
    core: DirtyIncompleteKeyShare<Secp256k1>,
    aux: DirtyAuxInfo<SecurityLevel128>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Cggmp24Engine;

impl Cggmp24Engine {
    pub fn new() -> Self {
        Self
    }
}

impl MpcEngine for Cggmp24Engine {
    fn name(&self) -> &'static str {
        "cggmp24"
    }

    fn start_keygen(
        &self,
        setup: EngineSetup,
    ) -> Result<EngineInstance<KeygenOutput>, EngineError> {
        setup.validate()?;
        Ok(EngineInstance::spawn(move |io| run_keygen(setup, io)))
    }

    fn signers(&self, _parties: u16, threshold: u16) -> Vec<u16> {
        (1..=threshold + 1).collect()
    }

    fn start_sign(
        &self,
        setup: EngineSetup,
        share: &serde_json::Value,
        digest: [u8; 32],
    ) -> Result<EngineInstance<SignOutput>, EngineError> {
        setup.validate()?;
        let signers = self.signers(setup.parties, setup.threshold);
        let Some(position) = signers.iter().position(|&i| i == setup.self_index) else {
            return Err(EngineError::InvalidSetup(format!(
                "party {} is not among signers {:?}",
                setup.self_index, signers
            )));
        };
        let key_share = load_key_share(share)?;
        if key_share.min_signers() != setup.threshold + 1 {
            return Err(EngineError::InvalidShare(format!(
                "share needs {} signers, threshold {} implies {}",
                key_share.min_signers(),
                setup.threshold,
                setup.threshold + 1
            )));
        }
        Ok(EngineInstance::spawn(move |io| {
            run_signing(setup, signers, position as u16, key_share, digest, io)
        }))
    }
}

/// Sub-protocol execution id derived from the run's id.
fn phase_execution_id(execution_id: &[u8; 32], label: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(execution_id);
    hasher.update(label);
    hasher.finalize().into()
}

async fn run_keygen(setup: EngineSetup, io: EngineIo) -> Result<KeygenOutput, EngineError> {
    let EngineIo { inbound, outbound } = io;
    let mut phases = split_phases(inbound, 2).into_iter();
    let (Some(keygen_rx), Some(aux_rx)) = (phases.next(), phases.next()) else {
        return Err(EngineError::Aborted);
    };

    let i = setup.index0();
    let n = setup.parties;
    let mut rng = OsRng;

    info!(
        "Starting CGGMP24 keygen: party {}/{}, threshold {}",
        setup.self_index, n, setup.threshold
    );
    let keygen_eid_bytes = phase_execution_id(&setup.execution_id, b"keygen");
    let keygen_eid = ExecutionId::new(&keygen_eid_bytes);
    let party = MpcParty::connected(channel_delivery(
        keygen_rx,
        outbound.clone(),
        Some(PHASE_KEYGEN),
    ));
    let incomplete = cggmp24::keygen::<Secp256k1>(keygen_eid, i, n)
        .set_threshold(setup.threshold + 1)
        .start(&mut rng, party)
        .await
        .map_err(|e| EngineError::Protocol(format!("keygen failed: {:?}", e)))?;
    info!("Keygen completed; generating primes for aux info");

    let primes = tokio::task::spawn_blocking(|| {
        let mut rng = OsRng;
        PregeneratedPrimes::<SecurityLevel128>::generate(&mut rng)
    })
    .await
    .map_err(|e| EngineError::Protocol(format!("prime generation failed: {}", e)))?;

    let aux_eid_bytes = phase_execution_id(&setup.execution_id, b"aux-info");
    let aux_eid = ExecutionId::new(&aux_eid_bytes);
    let party = MpcParty::connected(channel_delivery(aux_rx, outbound, Some(PHASE_AUX_INFO)));
    let aux = cggmp24::aux_info_gen(aux_eid, i, n, primes)
        .start(&mut rng, party)
        .await
        .map_err(|e| EngineError::Protocol(format!("aux info generation failed: {:?}", e)))?;
    info!("Aux info generation completed");

    let public_key = incomplete.shared_public_key.to_bytes(false).to_vec();
    let share = serde_json::to_value(StoredShare {
        core: incomplete.into_inner(),
        aux: aux.into_inner(),
    })
    .map_err(|e| EngineError::InvalidShare(e.to_string()))?;

    Ok(KeygenOutput { public_key, share })
}

fn load_key_share(
    share: &serde_json::Value,
) -> Result<KeyShare<Secp256k1, SecurityLevel128>, EngineError> {
    let stored: StoredShare = serde_json::from_value(share.clone())
        .map_err(|e| EngineError::InvalidShare(e.to_string()))?;
    let core = stored
        .core
        .validate()
        .map_err(|e| EngineError::InvalidShare(format!("key share: {:?}", e)))?;
    let aux = stored
        .aux
        .validate()
        .map_err(|e| EngineError::InvalidShare(format!("aux info: {:?}", e)))?;
    KeyShare::from_parts((core, aux))
        .map_err(|e| EngineError::InvalidShare(format!("{:?}", e)))
}

async fn run_signing(
    setup: EngineSetup,
    signers: Vec<u16>,
    position: u16,
    key_share: KeyShare<Secp256k1, SecurityLevel128>,
    digest: [u8; 32],
    io: EngineIo,
) -> Result<SignOutput, EngineError> {
    // Keygen indices (0-based) of the signers, in protocol order.
    let parties: Vec<u16> = signers.iter().map(|i| i - 1).collect();
    let eid_bytes = phase_execution_id(&setup.execution_id, b"signing");
    let eid = ExecutionId::new(&eid_bytes);

    let scalar = Scalar::<Secp256k1>::from_be_bytes_mod_order(digest);
    let message = cggmp24::PrehashedDataToSign::from_scalar(scalar);

    info!(
        "Starting CGGMP24 signing: party {} with signers {:?}, digest {}",
        setup.self_index,
        signers,
        hex::encode(digest)
    );
    let party = MpcParty::connected(roster_delivery(io.inbound, io.outbound, signers));
    let mut rng = OsRng;
    let signature = cggmp24::signing(eid, position, &parties, &key_share)
        .sign(&mut rng, party, &message)
        .await
        .map_err(|e| EngineError::Protocol(format!("signing failed: {:?}", e)))?;

    signature
        .verify(&key_share.shared_public_key, &message)
        .map_err(|e| EngineError::Protocol(format!("signature does not verify: {:?}", e)))?;

    let r = scalar_bytes(&signature.r)?;
    let s = scalar_bytes(&signature.s)?;
    Ok(SignOutput { r, s })
}

fn scalar_bytes(
    scalar: &NonZero<Scalar<Secp256k1>>,
) -> Result<[u8; 32], EngineError> {
    let bytes = (**scalar).to_be_bytes().to_vec();
    let len = bytes.len();
    <[u8; 32]>::try_from(bytes)
        .map_err(|_| EngineError::Protocol(format!("scalar is {} bytes", len)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::relay;
    use common::{eth, hexutil};

    #[test]
    fn test_phase_ids_differ_per_phase_and_run() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        assert_ne!(
            phase_execution_id(&a, b"keygen"),
            phase_execution_id(&a, b"aux-info")
        );
        assert_ne!(
            phase_execution_id(&a, b"keygen"),
            phase_execution_id(&b, b"keygen")
        );
        assert_eq!(
            phase_execution_id(&a, b"signing"),
            phase_execution_id(&a, b"signing")
        );
    }

    #[test]
    fn test_garbage_share_is_rejected_before_spawning() {
        let setup = EngineSetup {
            self_index: 1,
            parties: 3,
            threshold: 1,
            execution_id: [0u8; 32],
        };
        let result = Cggmp24Engine::new().start_sign(
            setup,
            &serde_json::json!({"core": 1, "aux": 2}),
            [0u8; 32],
        );
        assert!(matches!(result, Err(EngineError::InvalidShare(_))));
    }

    #[test]
    fn test_party_outside_signer_set_is_rejected() {
        let setup = EngineSetup {
            self_index: 3,
            parties: 3,
            threshold: 1,
            execution_id: [0u8; 32],
        };
        let result = Cggmp24Engine::new().start_sign(setup, &serde_json::json!({}), [0u8; 32]);
        assert!(matches!(result, Err(EngineError::InvalidSetup(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    #[ignore] // Generates Paillier primes for three parties; takes minutes.
    async fn test_three_party_keygen_then_two_party_sign() {
        let engine = Cggmp24Engine::new();
        let setup = |self_index: u16, execution_id: [u8; 32]| EngineSetup {
            self_index,
            parties: 3,
            threshold: 1,
            execution_id,
        };

        let keygens = (1..=3)
            .map(|i| engine.start_keygen(setup(i, [7; 32])).unwrap())
            .collect();
        let outputs = relay(keygens).await;
        assert!(outputs.iter().all(|o| o.public_key == outputs[0].public_key));
        let address =
            eth::address_from_public_key_hex(&hexutil::encode_0x(&outputs[0].public_key)).unwrap();

        let signers = engine.signers(3, 1);
        assert_eq!(signers, vec![1, 2]);
        let digest = eth::keccak256(b"cggmp24 threshold signing");
        let instances = signers
            .iter()
            .map(|&i| {
                engine
                    .start_sign(setup(i, [8; 32]), &outputs[usize::from(i - 1)].share, digest)
                    .unwrap()
            })
            .collect();
        let sigs = relay(instances).await;
        assert_eq!(sigs[0], sigs[1]);
        assert!(eth::verify_prehash_address(&address, &digest, &sigs[0].r, &sigs[0].s).unwrap());

        // Party 3 holds a valid share but sits this run out.
        assert!(matches!(
            engine.start_sign(setup(3, [8; 32]), &outputs[2].share, digest),
            Err(EngineError::InvalidSetup(_))
        ));
    }

    #[test]
    fn test_bad_setup_is_rejected() {
        let setup = EngineSetup {
            self_index: 1,
            parties: 3,
            threshold: 3,
            execution_id: [0u8; 32],
        };
        assert!(matches!(
            Cggmp24Engine::new().start_keygen(setup),
            Err(EngineError::InvalidSetup(_))
        ));
    }
}
