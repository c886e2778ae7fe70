//! Node runtime state.
//!
//! A node runs at most one protocol instance. [`NodeRuntime`] is either
//! `Idle` or `Busy` with the live party table and the engine's inbound
//! handle; the agent keeps it behind a single lock and swaps it atomically.

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use common::{CommandKind, WireMessage};

use crate::engine::InboundWire;
use crate::error::NodeError;

/// Frames buffered for instances that have not started yet.
pub const EARLY_BUFFER_CAPACITY: usize = 1024;

/// How long an early frame stays eligible for replay.
pub const EARLY_BUFFER_TTL: Duration = Duration::from_secs(60);

/// Party id to protocol identity mapping for one run.
///
/// Identity is the 1-based position in the command's `parties` list, so
/// every node must see the same ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartyTable {
    ids: Vec<String>,
    self_index: u16,
}

impl PartyTable {
    pub fn build(parties: &[String], self_id: &str) -> Result<Self, NodeError> {
        let ids: Vec<String> = parties.iter().map(|p| p.trim().to_string()).collect();
        if ids.is_empty() {
            return Err(NodeError::InvalidParties("empty party list".into()));
        }
        if ids.iter().any(String::is_empty) {
            return Err(NodeError::InvalidParties("empty party id".into()));
        }
        if ids.len() > usize::from(u16::MAX) {
            return Err(NodeError::InvalidParties(format!(
                "{} parties is too many",
                ids.len()
            )));
        }
        let mut seen = HashSet::new();
        for id in &ids {
            if !seen.insert(id.as_str()) {
                return Err(NodeError::InvalidParties(format!("duplicate party {}", id)));
            }
        }
        let position = ids
            .iter()
            .position(|id| id == self_id)
            .ok_or_else(|| NodeError::InvalidParties(format!("{} is not a party", self_id)))?;

        Ok(Self {
            self_index: position as u16 + 1,
            ids,
        })
    }

    /// 1-based index of `id`.
    pub fn index_of(&self, id: &str) -> Option<u16> {
        self.ids.iter().position(|p| p == id).map(|i| i as u16 + 1)
    }

    /// Party id at a 1-based index.
    pub fn party_at(&self, index: u16) -> Option<&str> {
        let i = usize::from(index).checked_sub(1)?;
        self.ids.get(i).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn self_index(&self) -> u16 {
        self.self_index
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }
}

/// Context of the running command.
#[derive(Debug)]
pub struct ActiveSession {
    pub command: CommandKind,
    pub msg_id: String,
    pub table: PartyTable,
    /// 1-based indices taking part in this run; frames from others are dropped.
    pub participants: Vec<u16>,
    pub threshold: u16,
    /// Feeds the engine instance owned by the command task.
    pub inbound: mpsc::UnboundedSender<InboundWire>,
    pub cancel: CancellationToken,
    /// Distinguishes runs so a finished task never clears its successor.
    pub generation: u64,
    pub started_at: Instant,
}

#[derive(Debug, Default)]
pub enum RuntimeState {
    #[default]
    Idle,
    Busy(ActiveSession),
}

/// Everything the agent guards with its runtime lock.
#[derive(Debug, Default)]
pub struct NodeRuntime {
    pub state: RuntimeState,
    pub early: EarlyWireBuffer,
    next_generation: u64,
}

impl NodeRuntime {
    pub fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    pub fn active(&self) -> Option<&ActiveSession> {
        match &self.state {
            RuntimeState::Idle => None,
            RuntimeState::Busy(active) => Some(active),
        }
    }

    /// Return to `Idle` if `generation` is still the running command.
    pub fn finish(&mut self, generation: u64) -> bool {
        match &self.state {
            RuntimeState::Busy(active) if active.generation == generation => {
                self.state = RuntimeState::Idle;
                true
            }
            _ => false,
        }
    }

    pub fn status(&self) -> RuntimeStatus {
        match &self.state {
            RuntimeState::Idle => RuntimeStatus {
                busy: false,
                command: None,
                msg_id: None,
                parties: Vec::new(),
                elapsed_ms: 0,
                buffered: self.early.len(),
            },
            RuntimeState::Busy(active) => RuntimeStatus {
                busy: true,
                command: Some(active.command.as_str().to_string()),
                msg_id: Some(active.msg_id.clone()).filter(|m| !m.is_empty()),
                parties: active.table.ids().to_vec(),
                elapsed_ms: active.started_at.elapsed().as_millis() as u64,
                buffered: self.early.len(),
            },
        }
    }
}

/// Point-in-time view of the runtime.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RuntimeStatus {
    pub busy: bool,
    pub command: Option<String>,
    pub msg_id: Option<String>,
    pub parties: Vec<String>,
    pub elapsed_ms: u64,
    pub buffered: usize,
}

/// Bounded FIFO of `send` frames that arrived before their command.
#[derive(Debug)]
pub struct EarlyWireBuffer {
    frames: VecDeque<(Instant, WireMessage)>,
    capacity: usize,
    ttl: Duration,
}

impl Default for EarlyWireBuffer {
    fn default() -> Self {
        Self::new(EARLY_BUFFER_CAPACITY, EARLY_BUFFER_TTL)
    }
}

impl EarlyWireBuffer {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            frames: VecDeque::new(),
            capacity,
            ttl,
        }
    }

    fn expire(&mut self, now: Instant) {
        while let Some((at, _)) = self.frames.front() {
            if now.duration_since(*at) <= self.ttl {
                break;
            }
            self.frames.pop_front();
        }
    }

    /// Buffer a frame, evicting the oldest when full.
    pub fn push(&mut self, msg: WireMessage) {
        let now = Instant::now();
        self.expire(now);
        if self.capacity == 0 {
            return;
        }
        if self.frames.len() >= self.capacity {
            self.frames.pop_front();
        }
        self.frames.push_back((now, msg));
    }

    /// Remove and return every live frame tagged with `msg_id`, oldest first.
    pub fn take(&mut self, msg_id: &str) -> Vec<WireMessage> {
        self.expire(Instant::now());
        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(self.frames.len());
        for (at, msg) in self.frames.drain(..) {
            if msg.msg_id == msg_id {
                taken.push(msg);
            } else {
                kept.push_back((at, msg));
            }
        }
        self.frames = kept;
        taken
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}
