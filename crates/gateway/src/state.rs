//! Shared gateway state.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use common::client::{HubSender, INBOUND_CAPACITY};
use common::{MessageType, WireMessage};

use crate::config::GatewayConfig;

/// Group identity served by `GET /address`.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct Identity {
    pub address: String,
    pub pubkey: String,
}

pub struct GatewayState {
    pub config: GatewayConfig,
    pub(crate) hub: HubSender,
    /// Result queue. Handlers hold this lock for their whole duration, which
    /// also serializes requests.
    pub(crate) results: Mutex<mpsc::Receiver<WireMessage>>,
    identity: RwLock<Identity>,
}

impl GatewayState {
    /// Build the state and spawn the task that feeds the result queue from
    /// the hub connection. The task ends when the hub connection does.
    pub fn new(
        config: GatewayConfig,
        hub: HubSender,
        inbound: mpsc::Receiver<WireMessage>,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        let pump = tokio::spawn(pump_results(inbound, tx));
        let state = Arc::new(Self {
            config,
            hub,
            results: Mutex::new(rx),
            identity: RwLock::new(Identity::default()),
        });
        (state, pump)
    }

    pub async fn identity(&self) -> Identity {
        self.identity.read().await.clone()
    }

    pub(crate) async fn set_identity(&self, identity: Identity) {
        *self.identity.write().await = identity;
    }
}

/// Forward `*_result` frames into the bounded queue, dropping when full.
async fn pump_results(
    mut inbound: mpsc::Receiver<WireMessage>,
    results: mpsc::Sender<WireMessage>,
) {
    while let Some(msg) = inbound.recv().await {
        let is_result = msg.kind == MessageType::Cmd && msg.cmd.is_some_and(|c| c.is_result());
        if !is_result {
            debug!("Ignoring {:?} frame from {}", msg.kind, msg.party);
            continue;
        }
        if let Err(e) = results.try_send(msg) {
            warn!("Result queue full; dropping frame: {}", e);
        }
    }
    warn!("Hub connection closed; result pump stopped");
}
