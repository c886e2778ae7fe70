//! Correlation of one in-flight command with the results it produces.

use std::collections::HashMap;

use common::{eth, CommandKind, MessageType, WireMessage};
use tracing::debug;

use crate::error::GatewayError;

/// The command currently awaiting results.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub msg_id: String,
    pub result_kind: CommandKind,
    pub expected: Vec<String>,
}

impl PendingRequest {
    pub fn new(msg_id: impl Into<String>, result_kind: CommandKind, expected: Vec<String>) -> Self {
        Self {
            msg_id: msg_id.into(),
            result_kind,
            expected,
        }
    }

    /// True if `msg` is a result for this request from an expected party.
    ///
    /// Results without a `msg_id` are accepted; results tagged for another
    /// request are not.
    pub fn matches(&self, msg: &WireMessage) -> bool {
        if msg.kind != MessageType::Cmd || msg.cmd != Some(self.result_kind) {
            return false;
        }
        if !msg.msg_id.is_empty() && msg.msg_id != self.msg_id {
            debug!(
                "Dropping stale {} from {} (msg_id={}, want {})",
                self.result_kind, msg.party, msg.msg_id, self.msg_id
            );
            return false;
        }
        if !self.expected.contains(&msg.party) {
            debug!("Dropping {} from unexpected party {}", self.result_kind, msg.party);
            return false;
        }
        true
    }
}

/// Group identity agreed by every keygen participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeygenAgreement {
    pub address: String,
    pub pubkey: String,
}

/// Collects `keygen_result`s until every expected party reported.
#[derive(Debug)]
pub struct KeygenCollector {
    expected: Vec<String>,
    reports: HashMap<String, WireMessage>,
}

impl KeygenCollector {
    pub fn new(expected: Vec<String>) -> Self {
        Self {
            expected,
            reports: HashMap::new(),
        }
    }

    pub fn received(&self) -> usize {
        self.reports.len()
    }

    pub fn expected(&self) -> usize {
        self.expected.len()
    }

    /// Record one result. Fails fast on `ok:false`; once all parties have
    /// reported, reduces them into a single agreement.
    pub fn accept(&mut self, msg: WireMessage) -> Result<Option<KeygenAgreement>, GatewayError> {
        if !self.expected.contains(&msg.party) {
            return Ok(None);
        }
        if !msg.ok {
            return Err(GatewayError::PartyFailed {
                party: msg.party,
                detail: msg.err,
            });
        }
        self.reports.entry(msg.party.clone()).or_insert(msg);
        if self.reports.len() < self.expected.len() {
            return Ok(None);
        }
        self.reduce().map(Some)
    }

    /// The address reported by most parties (earliest party wins ties) is
    /// the reference; the first party in order that differs is named.
    fn reduce(&self) -> Result<KeygenAgreement, GatewayError> {
        let ordered: Vec<&WireMessage> = self
            .expected
            .iter()
            .filter_map(|p| self.reports.get(p))
            .collect();

        if let Some(missing) = ordered.iter().find(|m| m.addr_hex.is_empty()) {
            return Err(GatewayError::PartyFailed {
                party: missing.party.clone(),
                detail: "missing addr_hex".into(),
            });
        }

        let mut reference: Option<(&WireMessage, usize)> = None;
        for &candidate in &ordered {
            let votes = ordered
                .iter()
                .filter(|m| eth::same_address(&m.addr_hex, &candidate.addr_hex))
                .count();
            if reference.map_or(true, |(_, best)| votes > best) {
                reference = Some((candidate, votes));
            }
        }
        let Some((reference, _)) = reference else {
            return Err(GatewayError::KeygenTimeout {
                received: 0,
                expected: self.expected.len(),
            });
        };

        if let Some(odd) = ordered
            .iter()
            .find(|m| !eth::same_address(&m.addr_hex, &reference.addr_hex))
        {
            return Err(GatewayError::AddressMismatch {
                a: reference.addr_hex.clone(),
                b: odd.addr_hex.clone(),
                party: odd.party.clone(),
            });
        }

        Ok(KeygenAgreement {
            address: reference.addr_hex.clone(),
            pubkey: reference.pubkey_hex.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parties() -> Vec<String> {
        vec!["P1".into(), "P2".into(), "P3".into()]
    }

    fn keygen_result(party: &str, addr: &str) -> WireMessage {
        let mut msg = WireMessage::command("s", party, CommandKind::KeygenResult)
            .with_parties(vec!["G".into()])
            .with_msg_id("m1");
        msg.ok = true;
        msg.addr_hex = addr.into();
        msg.pubkey_hex = format!("0x04{}", party);
        msg
    }

    #[test]
    fn test_request_matching() {
        let pending = PendingRequest::new("m1", CommandKind::KeygenResult, parties());
        assert!(pending.matches(&keygen_result("P1", "0xaa")));

        let untagged = keygen_result("P1", "0xaa").with_msg_id("");
        assert!(pending.matches(&untagged));

        assert!(!pending.matches(&keygen_result("P1", "0xaa").with_msg_id("m0")));
        assert!(!pending.matches(&keygen_result("P7", "0xaa")));

        let mut wrong_kind = keygen_result("P1", "0xaa");
        wrong_kind.cmd = Some(CommandKind::SignResult);
        assert!(!pending.matches(&wrong_kind));
    }

    #[test]
    fn test_agreement_after_all_parties() {
        let mut collector = KeygenCollector::new(parties());
        assert_eq!(collector.accept(keygen_result("P2", "0xAbC")).unwrap(), None);
        assert_eq!(collector.accept(keygen_result("P1", "0xabc")).unwrap(), None);
        // Duplicate reports do not count twice.
        assert_eq!(collector.accept(keygen_result("P1", "0xabc")).unwrap(), None);
        assert_eq!(collector.received(), 2);

        let agreement = collector
            .accept(keygen_result("P3", "0xABC"))
            .unwrap()
            .unwrap();
        assert_eq!(agreement.address, "0xabc");
        assert_eq!(agreement.pubkey, "0x04P1");
    }

    #[test]
    fn test_mismatch_names_the_odd_party() {
        let mut collector = KeygenCollector::new(parties());
        collector.accept(keygen_result("P1", "0xdead")).unwrap();
        collector.accept(keygen_result("P2", "0xabc")).unwrap();
        let err = collector.accept(keygen_result("P3", "0xabc")).unwrap_err();
        match err {
            GatewayError::AddressMismatch { a, b, party } => {
                assert_eq!(party, "P1");
                assert_eq!(a, "0xabc");
                assert_eq!(b, "0xdead");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_failed_party_aborts_immediately() {
        let mut collector = KeygenCollector::new(parties());
        let mut failed = keygen_result("P2", "");
        failed.ok = false;
        failed.err = "busy: keygen in progress".into();
        match collector.accept(failed).unwrap_err() {
            GatewayError::PartyFailed { party, detail } => {
                assert_eq!(party, "P2");
                assert!(detail.contains("busy"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}
