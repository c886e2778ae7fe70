//! Gateway configuration.

use std::time::Duration;

use thiserror::Error;

/// Default deadline for `POST /keygen`.
pub const DEFAULT_KEYGEN_TIMEOUT: Duration = Duration::from_secs(45 * 60);

/// Default deadline for `POST /signHash`.
pub const DEFAULT_SIGN_TIMEOUT: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("party list is empty")]
    NoParties,

    #[error("duplicate party {0}")]
    DuplicateParty(String),

    #[error("gateway party {0} must not be one of the signing parties")]
    GatewayIsParty(String),

    #[error("threshold {threshold} out of range for {parties} parties")]
    InvalidThreshold { threshold: u16, parties: usize },
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub session: String,
    /// The gateway's own party id; results are addressed to it.
    pub party: String,
    /// Ordered signing parties; the order fixes protocol identities.
    pub parties: Vec<String>,
    pub threshold: u16,
    pub keygen_timeout: Duration,
    pub sign_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            session: common::DEFAULT_SESSION.to_string(),
            party: common::DEFAULT_GATEWAY_PARTY.to_string(),
            parties: parse_parties("P1,P2,P3"),
            threshold: 1,
            keygen_timeout: DEFAULT_KEYGEN_TIMEOUT,
            sign_timeout: DEFAULT_SIGN_TIMEOUT,
        }
    }
}

impl GatewayConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.parties.is_empty() {
            return Err(ConfigError::NoParties);
        }
        for (i, party) in self.parties.iter().enumerate() {
            if self.parties[..i].contains(party) {
                return Err(ConfigError::DuplicateParty(party.clone()));
            }
        }
        if self.parties.contains(&self.party) {
            return Err(ConfigError::GatewayIsParty(self.party.clone()));
        }
        if self.threshold == 0 || usize::from(self.threshold) >= self.parties.len() {
            return Err(ConfigError::InvalidThreshold {
                threshold: self.threshold,
                parties: self.parties.len(),
            });
        }
        Ok(())
    }
}

/// Split a comma-separated party list, dropping blanks.
pub fn parse_parties(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(String::from)
        .collect()
}
