//! Node agent configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Default ceiling for one keygen run.
pub const DEFAULT_KEYGEN_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Default ceiling for one signing run.
pub const DEFAULT_SIGN_TIMEOUT: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// This node's party id inside the session.
    pub party: String,
    pub session: String,
    /// Party id results are addressed to.
    pub gateway_party: String,
    /// Directory holding `keygen.json`.
    pub data_dir: PathBuf,
    pub keygen_timeout: Duration,
    pub sign_timeout: Duration,
}

impl NodeConfig {
    pub fn new(party: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            party: party.into(),
            session: common::DEFAULT_SESSION.to_string(),
            gateway_party: common::DEFAULT_GATEWAY_PARTY.to_string(),
            data_dir: data_dir.into(),
            keygen_timeout: DEFAULT_KEYGEN_TIMEOUT,
            sign_timeout: DEFAULT_SIGN_TIMEOUT,
        }
    }
}
