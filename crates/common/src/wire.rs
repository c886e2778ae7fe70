//! The wire envelope exchanged between hub, gateway and node agents.
//!
//! One JSON object per WebSocket text frame. Which fields are meaningful
//! depends on `type`:
//!
//! - `hello`: `session`, `party`, `role` (first frame of every connection)
//! - `cmd`: `cmd`, `parties`, `threshold`, `hash_hex`, and for results
//!   `ok`, `err`, `pubkey_hex`, `addr_hex`, `r_hex`, `s_hex`
//! - `send`: `from`, `to`, `bcast`, `payload_b64` (opaque engine bytes)
//! - `ping` / `pong`: liveness
//!
//! Empty fields are omitted on the wire, matching the other implementations
//! of this protocol.

use serde::{Deserialize, Serialize};

use crate::error::WireError;

/// Envelope kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Hello,
    Cmd,
    Send,
    Ping,
    Pong,
    /// Anything this build does not understand. Ignored by every component.
    #[default]
    #[serde(other)]
    Unknown,
}

/// Control command carried by `type=cmd`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Keygen,
    Sign,
    KeygenResult,
    SignResult,
    #[serde(other)]
    Unknown,
}

impl CommandKind {
    /// The result command a node answers this command with.
    pub fn result_kind(self) -> Option<CommandKind> {
        match self {
            CommandKind::Keygen => Some(CommandKind::KeygenResult),
            CommandKind::Sign => Some(CommandKind::SignResult),
            _ => None,
        }
    }

    pub fn is_result(self) -> bool {
        matches!(self, CommandKind::KeygenResult | CommandKind::SignResult)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::Keygen => "keygen",
            CommandKind::Sign => "sign",
            CommandKind::KeygenResult => "keygen_result",
            CommandKind::SignResult => "sign_result",
            CommandKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Advisory role declared in `hello`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Gateway,
    Node,
    Coordinator,
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Gateway => write!(f, "gateway"),
            Role::Node => write!(f, "node"),
            Role::Coordinator => write!(f, "coordinator"),
            Role::Unknown => write!(f, "unknown"),
        }
    }
}

/// Broadcast wildcard accepted in `to` and `parties`.
pub const WILDCARD: &str = "*";

/// The shared envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(rename = "type", default)]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub session: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub party: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,

    // Control command (gateway -> nodes) and results (nodes -> gateway).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<CommandKind>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parties: Vec<String>,
    /// Kept signed so out-of-range values reach validation instead of
    /// failing to parse.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub threshold: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hash_hex: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub ok: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub err: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pubkey_hex: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub addr_hex: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub r_hex: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub s_hex: String,

    // Engine traffic relayed between nodes.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub from: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub to: Vec<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub bcast: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub payload_b64: String,

    // Trace fields.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub msg_id: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub ts_ms: i64,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

fn is_false(v: &bool) -> bool {
    !*v
}

impl WireMessage {
    /// First frame of every connection.
    pub fn hello(session: impl Into<String>, party: impl Into<String>, role: Role) -> Self {
        Self {
            kind: MessageType::Hello,
            session: session.into(),
            party: party.into(),
            role: Some(role),
            ..Default::default()
        }
    }

    /// A control command or result.
    pub fn command(session: impl Into<String>, party: impl Into<String>, cmd: CommandKind) -> Self {
        Self {
            kind: MessageType::Cmd,
            session: session.into(),
            party: party.into(),
            cmd: Some(cmd),
            ts_ms: crate::now_ms(),
            ..Default::default()
        }
    }

    /// Relayed engine traffic.
    pub fn wire(
        session: impl Into<String>,
        party: impl Into<String>,
        to: Vec<String>,
        bcast: bool,
        payload_b64: String,
    ) -> Self {
        let party = party.into();
        Self {
            kind: MessageType::Send,
            session: session.into(),
            from: party.clone(),
            party,
            to,
            bcast,
            payload_b64,
            ..Default::default()
        }
    }

    pub fn ping(session: impl Into<String>, party: impl Into<String>) -> Self {
        Self {
            kind: MessageType::Ping,
            session: session.into(),
            party: party.into(),
            ..Default::default()
        }
    }

    pub fn pong(session: impl Into<String>, party: impl Into<String>) -> Self {
        Self {
            kind: MessageType::Pong,
            session: session.into(),
            party: party.into(),
            ..Default::default()
        }
    }

    pub fn with_parties(mut self, parties: Vec<String>) -> Self {
        self.parties = parties;
        self
    }

    pub fn with_msg_id(mut self, msg_id: impl Into<String>) -> Self {
        self.msg_id = msg_id.into();
        self
    }

    /// `(session, party)` if this is a well-formed hello.
    pub fn hello_identity(&self) -> Option<(&str, &str)> {
        if self.kind != MessageType::Hello || self.session.is_empty() || self.party.is_empty() {
            return None;
        }
        Some((&self.session, &self.party))
    }

    /// True if this is a `cmd` frame carrying the given command.
    pub fn is_command(&self, kind: CommandKind) -> bool {
        self.kind == MessageType::Cmd && self.cmd == Some(kind)
    }

    /// Sender identity of relayed traffic: `from`, falling back to `party`.
    pub fn sender(&self) -> &str {
        if self.from.is_empty() {
            &self.party
        } else {
            &self.from
        }
    }

    /// True when a recipient list means "everyone in the session".
    pub fn is_wildcard(list: &[String]) -> bool {
        list.is_empty() || (list.len() == 1 && list[0] == WILDCARD)
    }

    pub fn to_json(&self) -> Result<String, WireError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, WireError> {
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_encoding_omits_empty_fields() {
        let hello = WireMessage::hello("cluster", "P1", Role::Node);
        let json = hello.to_json().unwrap();
        assert_eq!(
            json,
            r#"{"type":"hello","session":"cluster","party":"P1","role":"node"}"#
        );
    }

    #[test]
    fn test_decode_command_from_foreign_encoder() {
        let text = r#"{"type":"cmd","session":"cluster","party":"G","cmd":"sign",
            "parties":["P1","P2","P3"],"threshold":1,"hash_hex":"0xabcd"}"#;
        let msg = WireMessage::from_json(text).unwrap();
        assert_eq!(msg.kind, MessageType::Cmd);
        assert_eq!(msg.cmd, Some(CommandKind::Sign));
        assert_eq!(msg.parties, vec!["P1", "P2", "P3"]);
        assert_eq!(msg.threshold, 1);
        assert!(!msg.ok);
        assert!(msg.is_command(CommandKind::Sign));
    }

    #[test]
    fn test_unknown_type_and_command_are_tolerated() {
        let msg = WireMessage::from_json(r#"{"type":"subscribe","cmd":"reshare"}"#).unwrap();
        assert_eq!(msg.kind, MessageType::Unknown);
        assert_eq!(msg.cmd, Some(CommandKind::Unknown));

        let missing = WireMessage::from_json(r#"{"session":"x"}"#).unwrap();
        assert_eq!(missing.kind, MessageType::Unknown);
    }

    #[test]
    fn test_negative_threshold_survives_parsing() {
        let msg = WireMessage::from_json(r#"{"type":"cmd","cmd":"keygen","threshold":-1}"#).unwrap();
        assert_eq!(msg.threshold, -1);
    }

    #[test]
    fn test_malformed_json_is_rejected() {
        assert!(matches!(
            WireMessage::from_json("{not json"),
            Err(WireError::Malformed(_))
        ));
    }

    #[test]
    fn test_hello_identity() {
        assert_eq!(
            WireMessage::hello("s", "P1", Role::Node).hello_identity(),
            Some(("s", "P1"))
        );
        assert!(WireMessage::hello("", "P1", Role::Node)
            .hello_identity()
            .is_none());
        assert!(WireMessage::hello("s", "", Role::Node)
            .hello_identity()
            .is_none());
        assert!(WireMessage::ping("s", "P1").hello_identity().is_none());
    }

    #[test]
    fn test_wildcard_detection() {
        assert!(WireMessage::is_wildcard(&[]));
        assert!(WireMessage::is_wildcard(&["*".to_string()]));
        assert!(!WireMessage::is_wildcard(&["P1".to_string()]));
        assert!(!WireMessage::is_wildcard(&["*".to_string(), "P1".to_string()]));
    }

    #[test]
    fn test_result_kind_mapping() {
        assert_eq!(
            CommandKind::Keygen.result_kind(),
            Some(CommandKind::KeygenResult)
        );
        assert_eq!(CommandKind::Sign.result_kind(), Some(CommandKind::SignResult));
        assert_eq!(CommandKind::SignResult.result_kind(), None);
        assert!(CommandKind::KeygenResult.is_result());
        assert!(!CommandKind::Keygen.is_result());
    }
}
