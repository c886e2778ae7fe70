//! Boundary between the node agent and the MPC engine.
//!
//! An engine instance is a spawned task fed with inbound wire payloads
//! tagged by sender index and producing outbound payloads tagged with a
//! destination, until it resolves to a single terminal result. The agent
//! never looks at the payload bytes.

pub mod cggmp;
pub mod delivery;
pub mod simulated;

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

pub use cggmp::Cggmp24Engine;
pub use simulated::SimulatedEngine;

/// Parameters shared by every party of one protocol run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSetup {
    /// This party's 1-based position in the party list.
    pub self_index: u16,
    /// Number of parties.
    pub parties: u16,
    /// Threshold t; any t + 1 parties can sign.
    pub threshold: u16,
    /// Identical on every party of the run.
    pub execution_id: [u8; 32],
}

impl EngineSetup {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.parties < 2 {
            return Err(EngineError::InvalidSetup(format!(
                "need at least 2 parties, got {}",
                self.parties
            )));
        }
        if self.self_index == 0 || self.self_index > self.parties {
            return Err(EngineError::InvalidSetup(format!(
                "index {} out of range 1..={}",
                self.self_index, self.parties
            )));
        }
        if self.threshold == 0 || self.threshold >= self.parties {
            return Err(EngineError::InvalidSetup(format!(
                "threshold {} out of range for {} parties",
                self.threshold, self.parties
            )));
        }
        Ok(())
    }

    /// 0-based index as used by round-based protocols.
    pub fn index0(&self) -> u16 {
        self.self_index - 1
    }
}

/// One inbound protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundWire {
    /// 1-based sender index.
    pub from: u16,
    pub broadcast: bool,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Broadcast,
    /// 1-based recipient index.
    Party(u16),
}

/// One outbound protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundWire {
    pub destination: Destination,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct KeygenOutput {
    /// Uncompressed SEC1 encoding of the shared public key.
    pub public_key: Vec<u8>,
    /// Engine-specific share material, persisted as-is.
    pub share: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignOutput {
    pub r: [u8; 32],
    pub s: [u8; 32],
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid engine setup: {0}")]
    InvalidSetup(String),

    #[error("invalid key share: {0}")]
    InvalidShare(String),

    #[error("protocol failed: {0}")]
    Protocol(String),

    #[error("engine stopped without a result")]
    Aborted,
}

/// Channel ends handed to the engine task.
pub struct EngineIo {
    pub inbound: mpsc::UnboundedReceiver<InboundWire>,
    pub outbound: mpsc::UnboundedSender<OutboundWire>,
}

/// A running engine. Dropping it aborts the task.
pub struct EngineInstance<T> {
    pub inbound: mpsc::UnboundedSender<InboundWire>,
    pub outbound: mpsc::UnboundedReceiver<OutboundWire>,
    pub result: oneshot::Receiver<Result<T, EngineError>>,
    task: JoinHandle<()>,
}

impl<T: Send + 'static> EngineInstance<T> {
    /// Spawn `run` with fresh channels.
    pub fn spawn<F, Fut>(run: F) -> Self
    where
        F: FnOnce(EngineIo) -> Fut,
        Fut: Future<Output = Result<T, EngineError>> + Send + 'static,
    {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (res_tx, res_rx) = oneshot::channel();

        let fut = run(EngineIo {
            inbound: in_rx,
            outbound: out_tx,
        });
        let task = tokio::spawn(async move {
            let _ = res_tx.send(fut.await);
        });

        Self {
            inbound: in_tx,
            outbound: out_rx,
            result: res_rx,
            task,
        }
    }
}

impl<T> Drop for EngineInstance<T> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// The engine seam used by the node agent.
pub trait MpcEngine: Send + Sync + 'static {
    /// Recorded next to persisted shares; signing refuses shares from
    /// another engine.
    fn name(&self) -> &'static str;

    fn start_keygen(&self, setup: EngineSetup)
        -> Result<EngineInstance<KeygenOutput>, EngineError>;

    /// 1-based indices of the parties that take part in signing, ascending.
    /// Parties outside this set sit the signing run out.
    fn signers(&self, parties: u16, _threshold: u16) -> Vec<u16> {
        (1..=parties).collect()
    }

    fn start_sign(
        &self,
        setup: EngineSetup,
        share: &serde_json::Value,
        digest: [u8; 32],
    ) -> Result<EngineInstance<SignOutput>, EngineError>;
}

/// Engine selection for the node binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum EngineKind {
    /// CGGMP24 threshold ECDSA.
    Cggmp24,
    /// Insecure additive-share engine for local development and tests.
    Simulated,
}

impl EngineKind {
    pub fn build(self) -> Arc<dyn MpcEngine> {
        match self {
            EngineKind::Cggmp24 => Arc::new(Cggmp24Engine::new()),
            EngineKind::Simulated => Arc::new(SimulatedEngine::new()),
        }
    }
}

/// In-process wiring of engine instances.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Relay traffic between `instances` until every one resolves.
    ///
    /// `instances[k]` runs as wire index `k + 1`, so a signer subset must be
    /// a prefix of the party list.
    pub(crate) async fn relay<T: Send + 'static>(mut instances: Vec<EngineInstance<T>>) -> Vec<T> {
        let n = instances.len() as u16;
        let mut done: Vec<Option<T>> = (0..instances.len()).map(|_| None).collect();
        loop {
            let mut progressed = false;
            for idx in 0..instances.len() {
                while let Ok(out) = instances[idx].outbound.try_recv() {
                    progressed = true;
                    let from = idx as u16 + 1;
                    for to in 1..=n {
                        let deliver = match out.destination {
                            Destination::Broadcast => to != from,
                            Destination::Party(p) => p == to,
                        };
                        if deliver {
                            let _ = instances[usize::from(to - 1)].inbound.send(InboundWire {
                                from,
                                broadcast: out.destination == Destination::Broadcast,
                                payload: out.payload.clone(),
                            });
                        }
                    }
                }
                if done[idx].is_none() {
                    if let Ok(result) = instances[idx].result.try_recv() {
                        done[idx] = Some(result.unwrap());
                        progressed = true;
                    }
                }
            }
            if done.iter().all(Option::is_some) {
                return done.into_iter().flatten().collect();
            }
            if !progressed {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        }
    }
}
