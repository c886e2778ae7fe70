//! Session-scoped message relay.
//!
//! The hub is a dumb bus: it groups live connections by session, forwards
//! `send` frames to their addressees, fans `cmd` frames out to the named
//! parties and remembers the last command per session so a party that joins
//! late still sees it. It never looks inside `payload_b64` and never checks
//! protocol semantics.
//!
//! Replay of the last command is best-effort. A party that joins after the
//! command already finished elsewhere will still receive it and may start an
//! instance nobody waits for; nodes reject or time out such instances on
//! their own.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use common::{MessageType, Role, WireMessage};

/// Identifies one accepted socket. A party that reconnects gets a new id,
/// which keeps a stale socket's teardown from evicting its replacement.
pub type ConnectionId = u64;

/// Frames queued per connection before it counts as too slow and is dropped.
pub const OUTBOX_CAPACITY: usize = 1024;

/// Per-connection outbound queue, drained by that connection's writer task.
pub type Outbox = mpsc::Sender<WireMessage>;

/// Members whose outbox was full during one routing call.
type SlowMembers = Vec<(String, ConnectionId)>;

#[derive(Debug)]
struct Member {
    conn: ConnectionId,
    role: Option<Role>,
    outbox: Outbox,
}

#[derive(Debug, Default)]
struct Session {
    members: HashMap<String, Member>,
    last_cmd: Option<WireMessage>,
}

impl Member {
    fn push(&self, party: &str, msg: &WireMessage, slow: &mut SlowMembers) -> bool {
        match self.outbox.try_send(msg.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                slow.push((party.to_string(), self.conn));
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

impl Session {
    fn deliver(&self, party: &str, msg: &WireMessage, slow: &mut SlowMembers) -> bool {
        match self.members.get(party) {
            Some(member) => member.push(party, msg, slow),
            None => false,
        }
    }

    fn deliver_all_except(&self, except: &str, msg: &WireMessage, slow: &mut SlowMembers) -> usize {
        self.members
            .iter()
            .filter(|(party, _)| party.as_str() != except)
            .filter(|(party, member)| member.push(party, msg, slow))
            .count()
    }

    fn deliver_all(&self, msg: &WireMessage, slow: &mut SlowMembers) -> usize {
        self.members
            .iter()
            .filter(|(party, member)| member.push(party, msg, slow))
            .count()
    }
}

/// Point-in-time view of one session, served by `GET /sessions`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub session: String,
    pub members: Vec<MemberSnapshot>,
    /// Kind of the remembered last command, if any.
    pub last_command: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MemberSnapshot {
    pub party: String,
    pub role: Option<Role>,
}

/// The relay. All session state lives behind one lock; `join`, `leave` and
/// `route` are the only ways to change it.
#[derive(Debug, Default)]
pub struct Hub {
    sessions: RwLock<HashMap<String, Session>>,
    next_conn: AtomicU64,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_conn.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Register `(session, party)` on connection `conn`.
    ///
    /// A party already present under the same name is replaced; its old
    /// outbox is dropped, which ends the old connection's writer. If the
    /// session has a remembered command it is queued to the joiner first.
    pub async fn join(
        &self,
        session: &str,
        party: &str,
        role: Option<Role>,
        conn: ConnectionId,
        outbox: Outbox,
    ) {
        let mut sessions = self.sessions.write().await;
        let entry = sessions.entry(session.to_string()).or_default();

        if let Some(cmd) = &entry.last_cmd {
            debug!(session, party, cmd = ?cmd.cmd, "Replaying last command to joiner");
            let _ = outbox.try_send(cmd.clone());
        }

        let previous = entry
            .members
            .insert(party.to_string(), Member { conn, role, outbox });
        if let Some(prev) = previous {
            warn!(
                session,
                party,
                old_conn = prev.conn,
                new_conn = conn,
                "Party rejoined; replacing previous connection"
            );
        }

        info!(
            session,
            party,
            role = ?role,
            members = entry.members.len(),
            "Party joined"
        );
    }

    /// Remove `(session, party)` if it is still bound to `conn`.
    ///
    /// Returns whether anything was removed. The session, including its
    /// remembered command, is purged once its last member leaves.
    pub async fn leave(&self, session: &str, party: &str, conn: ConnectionId) -> bool {
        let mut sessions = self.sessions.write().await;
        let Some(entry) = sessions.get_mut(session) else {
            return false;
        };

        let bound_here = entry
            .members
            .get(party)
            .is_some_and(|member| member.conn == conn);
        if !bound_here {
            debug!(session, party, conn, "Stale connection closed; nothing to remove");
            return false;
        }
        entry.members.remove(party);
        info!(session, party, remaining = entry.members.len(), "Party left");

        if entry.members.is_empty() {
            sessions.remove(session);
            info!(session, "Session empty; purged");
        }
        true
    }

    /// Route one frame received from `(session, party)`.
    ///
    /// Returns the number of connections the frame was queued to (pongs
    /// included). Unknown targets are skipped silently. A member whose
    /// outbox is full is removed from its session, which closes its socket.
    pub async fn route(&self, session: &str, party: &str, mut msg: WireMessage) -> usize {
        if msg.session.is_empty() {
            msg.session = session.to_string();
        }
        // Pongs go back through the sender's own session.
        let target_session = match msg.kind {
            MessageType::Ping => session.to_string(),
            _ => msg.session.clone(),
        };

        let mut slow = SlowMembers::new();
        let delivered = self.dispatch(session, party, msg, &mut slow).await;
        for (member, conn) in slow {
            warn!(
                session = %target_session,
                party = %member,
                conn,
                capacity = OUTBOX_CAPACITY,
                "Outbox full; dropping slow connection"
            );
            self.leave(&target_session, &member, conn).await;
        }
        delivered
    }

    async fn dispatch(
        &self,
        session: &str,
        party: &str,
        mut msg: WireMessage,
        slow: &mut SlowMembers,
    ) -> usize {
        match msg.kind {
            MessageType::Send => {
                if msg.from.is_empty() {
                    msg.from = party.to_string();
                }
                let sessions = self.sessions.read().await;
                let Some(target) = sessions.get(&msg.session) else {
                    debug!(session = %msg.session, "send to unknown session dropped");
                    return 0;
                };
                if WireMessage::is_wildcard(&msg.to) {
                    target.deliver_all_except(party, &msg, slow)
                } else {
                    msg.to
                        .iter()
                        .filter(|to| target.deliver(to, &msg, slow))
                        .count()
                }
            }
            MessageType::Cmd => {
                let mut sessions = self.sessions.write().await;
                let Some(target) = sessions.get_mut(&msg.session) else {
                    debug!(session = %msg.session, "cmd to unknown session dropped");
                    return 0;
                };
                target.last_cmd = Some(msg.clone());
                let delivered = if WireMessage::is_wildcard(&msg.parties) {
                    target.deliver_all(&msg, slow)
                } else {
                    msg.parties
                        .iter()
                        .filter(|p| target.deliver(p, &msg, slow))
                        .count()
                };
                debug!(
                    session = %msg.session,
                    from = party,
                    cmd = ?msg.cmd,
                    delivered,
                    "Command routed"
                );
                delivered
            }
            MessageType::Ping => {
                let sessions = self.sessions.read().await;
                let delivered = sessions
                    .get(session)
                    .is_some_and(|s| s.deliver(party, &WireMessage::pong(session, party), slow));
                usize::from(delivered)
            }
            MessageType::Hello | MessageType::Pong | MessageType::Unknown => 0,
        }
    }

    /// Current sessions, sorted by name with members sorted by party.
    pub async fn snapshot(&self) -> Vec<SessionSnapshot> {
        let sessions = self.sessions.read().await;
        let mut out: Vec<SessionSnapshot> = sessions
            .iter()
            .map(|(name, session)| {
                let mut members: Vec<MemberSnapshot> = session
                    .members
                    .iter()
                    .map(|(party, m)| MemberSnapshot {
                        party: party.clone(),
                        role: m.role,
                    })
                    .collect();
                members.sort_by(|a, b| a.party.cmp(&b.party));
                SessionSnapshot {
                    session: name.clone(),
                    members,
                    last_command: session
                        .last_cmd
                        .as_ref()
                        .and_then(|m| m.cmd)
                        .map(|c| c.to_string()),
                }
            })
            .collect();
        out.sort_by(|a, b| a.session.cmp(&b.session));
        out
    }
}
