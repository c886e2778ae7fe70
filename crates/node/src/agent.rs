//! The node agent.
//!
//! Reads frames from the hub, starts an engine instance for each accepted
//! `keygen`/`sign` command, relays engine traffic through the hub and reports
//! exactly one result per accepted command to the gateway party.

use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use common::client::HubSender;
use common::{eth, hexutil, CommandKind, MessageType, WireMessage};

use crate::config::NodeConfig;
use crate::engine::{
    Destination, EngineError, EngineInstance, EngineSetup, InboundWire, KeygenOutput, MpcEngine,
    OutboundWire, SignOutput,
};
use crate::error::NodeError;
use crate::runtime::{ActiveSession, NodeRuntime, PartyTable, RuntimeState, RuntimeStatus};
use crate::store::{KeyShareStore, StoreError, StoredKeyShare, STORE_VERSION};

/// Commands a node executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Keygen,
    Sign,
}

impl Operation {
    fn from_command(cmd: CommandKind) -> Option<Self> {
        match cmd {
            CommandKind::Keygen => Some(Operation::Keygen),
            CommandKind::Sign => Some(Operation::Sign),
            _ => None,
        }
    }

    fn command(self) -> CommandKind {
        match self {
            Operation::Keygen => CommandKind::Keygen,
            Operation::Sign => CommandKind::Sign,
        }
    }

    fn result_kind(self) -> CommandKind {
        match self {
            Operation::Keygen => CommandKind::KeygenResult,
            Operation::Sign => CommandKind::SignResult,
        }
    }
}

/// Engine instance owned by a command task.
enum Job {
    Keygen(EngineInstance<KeygenOutput>),
    Sign(EngineInstance<SignOutput>),
}

/// A validated command, ready to start once the node is idle.
struct Prepared {
    op: Operation,
    table: PartyTable,
    threshold: u16,
    setup: EngineSetup,
    /// 1-based indices taking part in this run, self included.
    participants: Vec<u16>,
    /// Digest and stored share, for signing.
    sign: Option<([u8; 32], serde_json::Value)>,
}

/// Immutable context of one command task.
struct JobContext {
    op: Operation,
    msg_id: String,
    table: PartyTable,
    participants: Vec<u16>,
    threshold: u16,
    cancel: CancellationToken,
    generation: u64,
    timeout: Duration,
}

enum Outcome {
    Keygen { pubkey_hex: String, addr_hex: String },
    Sign { r_hex: String, s_hex: String },
}

struct AgentInner {
    config: NodeConfig,
    engine: Arc<dyn MpcEngine>,
    store: KeyShareStore,
    hub: HubSender,
    runtime: Mutex<NodeRuntime>,
}

/// Cheaply cloneable handle to a node agent.
#[derive(Clone)]
pub struct NodeAgent {
    inner: Arc<AgentInner>,
}

impl NodeAgent {
    pub fn new(config: NodeConfig, engine: Arc<dyn MpcEngine>, hub: HubSender) -> Self {
        let store = KeyShareStore::new(config.data_dir.clone());
        Self {
            inner: Arc::new(AgentInner {
                config,
                engine,
                store,
                hub,
                runtime: Mutex::new(NodeRuntime::default()),
            }),
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &KeyShareStore {
        &self.inner.store
    }

    pub async fn status(&self) -> RuntimeStatus {
        self.inner.runtime.lock().await.status()
    }

    /// Dispatch hub frames until shutdown or until the hub goes away.
    ///
    /// Losing the hub is fatal: the running command is cancelled and
    /// [`NodeError::HubDisconnected`] is returned.
    pub async fn run(
        &self,
        mut inbound: mpsc::Receiver<WireMessage>,
        shutdown: CancellationToken,
    ) -> Result<(), NodeError> {
        info!(
            "Node agent {} running in session {} with engine {}",
            self.inner.config.party,
            self.inner.config.session,
            self.inner.engine.name()
        );
        loop {
            let msg = tokio::select! {
                _ = shutdown.cancelled() => {
                    self.cancel_active().await;
                    return Ok(());
                }
                msg = inbound.recv() => msg,
            };
            match msg {
                Some(msg) => self.handle(msg).await,
                None => {
                    self.cancel_active().await;
                    return Err(NodeError::HubDisconnected);
                }
            }
        }
    }

    /// Handle one frame from the hub.
    pub async fn handle(&self, msg: WireMessage) {
        match msg.kind {
            MessageType::Cmd => self.handle_command(msg).await,
            MessageType::Send => self.handle_wire(msg).await,
            MessageType::Ping | MessageType::Pong => {}
            other => debug!("Ignoring {:?} frame from {}", other, msg.party),
        }
    }

    /// Cancel the running command, if any. Its task still reports a result.
    pub async fn cancel_active(&self) -> bool {
        let runtime = self.inner.runtime.lock().await;
        match runtime.active() {
            Some(active) => {
                warn!("Cancelling active {}", active.command);
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    async fn handle_command(&self, msg: WireMessage) {
        let Some(op) = msg.cmd.and_then(Operation::from_command) else {
            debug!("Ignoring command {:?} from {}", msg.cmd, msg.party);
            return;
        };
        let me = &self.inner.config.party;
        if !msg.parties.is_empty() && !msg.parties.iter().any(|p| p.trim() == me.as_str()) {
            debug!("Command {} does not name {}; ignoring", op.command(), me);
            return;
        }

        if self.reject_if_busy(op, &msg).await {
            return;
        }
        // The share is read with the runtime unlocked so wire traffic keeps flowing.
        let prepared = match self.prepare(op, &msg).await {
            Ok(Some(prepared)) => prepared,
            Ok(None) => return,
            Err(e) => {
                warn!("Refusing {} (msg_id={}): {}", op.command(), msg.msg_id, e);
                self.emit_result(op, &msg.msg_id, Err(e));
                return;
            }
        };

        let mut runtime = self.inner.runtime.lock().await;
        if let Some(running) = runtime.active().map(|a| a.command) {
            drop(runtime);
            self.emit_busy(op, &msg, running);
            return;
        }
        if let Err(e) = self.start(prepared, &msg, &mut runtime) {
            warn!("Refusing {} (msg_id={}): {}", op.command(), msg.msg_id, e);
            drop(runtime);
            self.emit_result(op, &msg.msg_id, Err(e));
        }
    }

    async fn reject_if_busy(&self, op: Operation, msg: &WireMessage) -> bool {
        let running = self.inner.runtime.lock().await.active().map(|a| a.command);
        match running {
            Some(running) => {
                self.emit_busy(op, msg, running);
                true
            }
            None => false,
        }
    }

    fn emit_busy(&self, op: Operation, msg: &WireMessage, running: CommandKind) {
        let err = NodeError::Busy {
            active: running.to_string(),
        };
        warn!("Rejecting {} (msg_id={}): {}", op.command(), msg.msg_id, err);
        self.emit_result(op, &msg.msg_id, Err(err));
    }

    /// Validate the command and load what the engine needs.
    ///
    /// `None` means this node is not among the signers and sits the run out.
    async fn prepare(
        &self,
        op: Operation,
        msg: &WireMessage,
    ) -> Result<Option<Prepared>, NodeError> {
        let table = PartyTable::build(&msg.parties, &self.inner.config.party)?;
        let threshold = validate_threshold(msg.threshold, table.len())?;
        let n = table.len() as u16;
        let setup = EngineSetup {
            self_index: table.self_index(),
            parties: n,
            threshold,
            execution_id: execution_id(op.command(), &msg.msg_id, table.ids(), threshold),
        };

        let (participants, sign) = match op {
            Operation::Keygen => ((1..=n).collect(), None),
            Operation::Sign => {
                let digest = hexutil::decode_hash32(&msg.hash_hex)?;
                let signers = self.inner.engine.signers(n, threshold);
                if !signers.contains(&table.self_index()) {
                    info!(
                        "Not a signer for msg_id={} (signers {:?}); sitting out",
                        msg.msg_id, signers
                    );
                    return Ok(None);
                }
                let stored = self.load_share_for(&table, threshold).await?;
                (signers, Some((digest, stored.share)))
            }
        };

        Ok(Some(Prepared {
            op,
            table,
            threshold,
            setup,
            participants,
            sign,
        }))
    }

    /// Start the engine and switch to `Busy`.
    fn start(
        &self,
        prepared: Prepared,
        msg: &WireMessage,
        runtime: &mut NodeRuntime,
    ) -> Result<(), NodeError> {
        let Prepared {
            op,
            table,
            threshold,
            setup,
            participants,
            sign,
        } = prepared;

        let (job, inbound, timeout) = match sign {
            None => {
                let instance = self.inner.engine.start_keygen(setup)?;
                let inbound = instance.inbound.clone();
                (Job::Keygen(instance), inbound, self.inner.config.keygen_timeout)
            }
            Some((digest, share)) => {
                let instance = self.inner.engine.start_sign(setup, &share, digest)?;
                let inbound = instance.inbound.clone();
                (Job::Sign(instance), inbound, self.inner.config.sign_timeout)
            }
        };

        let generation = runtime.next_generation();
        let cancel = CancellationToken::new();
        let active = ActiveSession {
            command: op.command(),
            msg_id: msg.msg_id.clone(),
            table: table.clone(),
            participants: participants.clone(),
            threshold,
            inbound,
            cancel: cancel.clone(),
            generation,
            started_at: Instant::now(),
        };

        if !msg.msg_id.is_empty() {
            let early = runtime.early.take(&msg.msg_id);
            if !early.is_empty() {
                debug!("Replaying {} early frames for {}", early.len(), msg.msg_id);
            }
            for frame in &early {
                deliver_wire(&active, frame);
            }
        }
        runtime.state = RuntimeState::Busy(active);

        info!(
            "Accepted {} (msg_id={}) as party {}/{}, threshold {}",
            op.command(),
            msg.msg_id,
            table.self_index(),
            table.len(),
            threshold
        );

        let ctx = JobContext {
            op,
            msg_id: msg.msg_id.clone(),
            table,
            participants,
            threshold,
            cancel,
            generation,
            timeout,
        };
        let agent = self.clone();
        tokio::spawn(async move { agent.run_job(job, ctx).await });
        Ok(())
    }

    /// Load the persisted share and check it was made for this cluster.
    async fn load_share_for(
        &self,
        table: &PartyTable,
        threshold: u16,
    ) -> Result<StoredKeyShare, NodeError> {
        let stored = match self.inner.store.load().await {
            Ok(stored) => stored,
            Err(StoreError::NotFound(_)) => return Err(NodeError::MissingKeyShare),
            Err(e) => return Err(e.into()),
        };
        if stored.parties != table.ids() {
            return Err(NodeError::ShareMismatch(format!(
                "share parties {:?}, command parties {:?}",
                stored.parties,
                table.ids()
            )));
        }
        if stored.threshold != threshold {
            return Err(NodeError::ShareMismatch(format!(
                "share threshold {}, command threshold {}",
                stored.threshold, threshold
            )));
        }
        if stored.engine != self.inner.engine.name() {
            return Err(NodeError::ShareMismatch(format!(
                "share made by engine {}, running {}",
                stored.engine,
                self.inner.engine.name()
            )));
        }
        Ok(stored)
    }

    async fn run_job(self, job: Job, ctx: JobContext) {
        let started = Instant::now();
        let outcome = match job {
            Job::Keygen(instance) => match self.pump(instance, &ctx).await {
                Ok(output) => self.complete_keygen(&ctx, output).await,
                Err(e) => Err(e),
            },
            Job::Sign(instance) => match self.pump(instance, &ctx).await {
                Ok(output) => complete_sign(output),
                Err(e) => Err(e),
            },
        };

        // Back to Idle before the gateway can react to the result.
        self.inner.runtime.lock().await.finish(ctx.generation);

        match &outcome {
            Ok(_) => info!(
                "{} (msg_id={}) completed in {:?}",
                ctx.op.command(),
                ctx.msg_id,
                started.elapsed()
            ),
            Err(e) => error!(
                "{} (msg_id={}) failed after {:?}: {}",
                ctx.op.command(),
                ctx.msg_id,
                started.elapsed(),
                e
            ),
        }
        self.emit_result(ctx.op, &ctx.msg_id, outcome);
    }

    /// Relay engine output until the engine resolves, the deadline passes
    /// or the command is cancelled.
    async fn pump<T>(
        &self,
        mut instance: EngineInstance<T>,
        ctx: &JobContext,
    ) -> Result<T, NodeError> {
        let deadline = tokio::time::sleep(ctx.timeout);
        tokio::pin!(deadline);
        let mut outbound_open = true;

        loop {
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Err(NodeError::Cancelled),
                _ = &mut deadline => return Err(NodeError::Timeout(ctx.timeout)),
                out = instance.outbound.recv(), if outbound_open => match out {
                    Some(out) => self.forward_outbound(ctx, out)?,
                    None => outbound_open = false,
                },
                result = &mut instance.result => {
                    while let Ok(out) = instance.outbound.try_recv() {
                        self.forward_outbound(ctx, out)?;
                    }
                    return match result {
                        Ok(result) => result.map_err(NodeError::from),
                        Err(_) => Err(NodeError::Engine(EngineError::Aborted)),
                    };
                }
            }
        }
    }

    fn forward_outbound(&self, ctx: &JobContext, out: OutboundWire) -> Result<(), NodeError> {
        let (to, bcast) = match out.destination {
            Destination::Broadcast => {
                let me = ctx.table.self_index();
                let to = ctx
                    .participants
                    .iter()
                    .filter(|&&i| i != me)
                    .filter_map(|&i| ctx.table.party_at(i))
                    .map(str::to_string)
                    .collect();
                (to, true)
            }
            Destination::Party(index) => match ctx.table.party_at(index) {
                Some(id) => (vec![id.to_string()], false),
                None => {
                    warn!("Engine addressed unknown party index {}", index);
                    return Ok(());
                }
            },
        };
        let config = &self.inner.config;
        let frame = WireMessage::wire(
            config.session.clone(),
            config.party.clone(),
            to,
            bcast,
            BASE64.encode(&out.payload),
        )
        .with_msg_id(ctx.msg_id.clone());
        self.inner.hub.send(frame)?;
        Ok(())
    }

    async fn complete_keygen(
        &self,
        ctx: &JobContext,
        output: KeygenOutput,
    ) -> Result<Outcome, NodeError> {
        let pubkey_hex = hexutil::encode_0x(&output.public_key);
        let addr_hex = eth::address_from_public_key_hex(&pubkey_hex).map_err(|e| {
            EngineError::Protocol(format!("engine returned an invalid public key: {}", e))
        })?;

        let record = StoredKeyShare {
            version: STORE_VERSION,
            party: self.inner.config.party.clone(),
            parties: ctx.table.ids().to_vec(),
            threshold: ctx.threshold,
            engine: self.inner.engine.name().to_string(),
            public_key_hex: pubkey_hex.clone(),
            address: addr_hex.clone(),
            created_at: chrono::Utc::now(),
            share: output.share,
        };
        self.inner.store.save(&record).await?;
        info!("New group address {}", addr_hex);

        Ok(Outcome::Keygen {
            pubkey_hex,
            addr_hex,
        })
    }

    fn emit_result(&self, op: Operation, msg_id: &str, outcome: Result<Outcome, NodeError>) {
        let config = &self.inner.config;
        let mut reply = WireMessage::command(
            config.session.clone(),
            config.party.clone(),
            op.result_kind(),
        )
        .with_parties(vec![config.gateway_party.clone()])
        .with_msg_id(msg_id);

        match outcome {
            Ok(Outcome::Keygen {
                pubkey_hex,
                addr_hex,
            }) => {
                reply.ok = true;
                reply.pubkey_hex = pubkey_hex;
                reply.addr_hex = addr_hex;
            }
            Ok(Outcome::Sign { r_hex, s_hex }) => {
                reply.ok = true;
                reply.r_hex = r_hex;
                reply.s_hex = s_hex;
            }
            Err(e) => {
                reply.ok = false;
                reply.err = e.to_string();
            }
        }

        if let Err(e) = self.inner.hub.send(reply) {
            error!("Failed to send {}: {}", op.result_kind(), e);
        }
    }

    async fn handle_wire(&self, msg: WireMessage) {
        let mut guard = self.inner.runtime.lock().await;
        let runtime = &mut *guard;
        match &runtime.state {
            RuntimeState::Busy(active) => {
                if !msg.msg_id.is_empty() && !active.msg_id.is_empty() && msg.msg_id != active.msg_id
                {
                    debug!(
                        "Dropping frame from {} for msg_id {} (running {})",
                        msg.sender(),
                        msg.msg_id,
                        active.msg_id
                    );
                    return;
                }
                deliver_wire(active, &msg);
            }
            RuntimeState::Idle => {
                if msg.msg_id.is_empty() {
                    debug!("Dropping untagged frame from {} while idle", msg.sender());
                } else {
                    runtime.early.push(msg);
                }
            }
        }
    }
}

/// Hand one relayed frame to the running engine.
fn deliver_wire(active: &ActiveSession, msg: &WireMessage) {
    let sender = msg.sender();
    let Some(from) = active.table.index_of(sender) else {
        debug!("Dropping frame from non-party {}", sender);
        return;
    };
    if from == active.table.self_index() {
        return;
    }
    if !active.participants.contains(&from) {
        debug!("Dropping frame from {}, not part of this run", sender);
        return;
    }
    let payload = match BASE64.decode(msg.payload_b64.as_bytes()) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("Dropping undecodable payload from {}: {}", sender, e);
            return;
        }
    };
    let wire = InboundWire {
        from,
        broadcast: msg.bcast,
        payload,
    };
    if active.inbound.send(wire).is_err() {
        debug!("Engine finished; dropping frame from {}", sender);
    }
}

fn complete_sign(output: SignOutput) -> Result<Outcome, NodeError> {
    let (r, s) = eth::normalize_signature(&output.r, &output.s)
        .map_err(|e| EngineError::Protocol(format!("engine returned an invalid signature: {}", e)))?;
    Ok(Outcome::Sign {
        r_hex: hexutil::encode_0x(r),
        s_hex: hexutil::encode_0x(s),
    })
}

fn validate_threshold(threshold: i64, parties: usize) -> Result<u16, NodeError> {
    if threshold <= 0 || threshold >= parties as i64 {
        return Err(NodeError::InvalidThreshold { threshold, parties });
    }
    u16::try_from(threshold).map_err(|_| NodeError::InvalidThreshold { threshold, parties })
}

/// Identical on every node receiving the same command.
fn execution_id(cmd: CommandKind, msg_id: &str, parties: &[String], threshold: u16) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"tss-execution-id");
    hasher.update(cmd.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(msg_id.as_bytes());
    hasher.update([0u8]);
    for party in parties {
        hasher.update(party.as_bytes());
        hasher.update([0u8]);
    }
    hasher.update(threshold.to_be_bytes());
    hasher.finalize().into()
}
