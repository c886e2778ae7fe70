//! Typed HTTP client for the gateway.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use common::{hexutil, WireError};

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-2xx answer; `err` is the gateway's `err` field when present.
    #[error("gateway returned {status}: {err}")]
    Gateway { status: u16, err: String, body: Value },

    #[error("bad signature in response: {0}")]
    Signature(#[from] WireError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Identity {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub pubkey: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeygenReply {
    pub address: String,
    pub pubkey: String,
    #[serde(default)]
    pub threshold: u16,
    #[serde(default)]
    pub parties: Vec<String>,
    #[serde(default)]
    pub t_keygen_ms: u64,
}

#[derive(Debug, Deserialize)]
struct SignReply {
    r: String,
    s: String,
    #[serde(default)]
    party: String,
    #[serde(default)]
    t_sign_ms: u64,
}

/// A signature with both scalars left-padded to 32 bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub r: [u8; 32],
    pub s: [u8; 32],
    pub party: String,
    pub t_sign_ms: u64,
}

pub struct GatewayClient {
    http: reqwest::Client,
    base_url: String,
}

impl GatewayClient {
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        Self::with_timeout(base_url, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn health(&self) -> Result<String, ClientError> {
        let response = self
            .http
            .get(format!("{}/health", self.base_url))
            .send()
            .await?;
        let response = check(response).await?;
        Ok(response.text().await?.trim().to_string())
    }

    pub async fn address(&self) -> Result<Identity, ClientError> {
        let response = self
            .http
            .get(format!("{}/address", self.base_url))
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    pub async fn keygen(&self) -> Result<KeygenReply, ClientError> {
        debug!("POST {}/keygen", self.base_url);
        let response = self
            .http
            .post(format!("{}/keygen", self.base_url))
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    pub async fn sign_hash(&self, digest: &[u8; 32]) -> Result<Signature, ClientError> {
        let hash_hex = hexutil::encode_0x(digest);
        debug!("POST {}/signHash {}", self.base_url, hash_hex);
        let response = self
            .http
            .post(format!("{}/signHash", self.base_url))
            .json(&json!({ "hash_hex": hash_hex }))
            .send()
            .await?;
        let reply: SignReply = check(response).await?.json().await?;
        Ok(Signature {
            r: hexutil::decode_left_padded32("r", &reply.r)?,
            s: hexutil::decode_left_padded32("s", &reply.s)?,
            party: reply.party,
            t_sign_ms: reply.t_sign_ms,
        })
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    let body: Value = serde_json::from_str(&text).unwrap_or(Value::String(text.clone()));
    let err = body
        .get("err")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or(text);
    Err(ClientError::Gateway {
        status: status.as_u16(),
        err,
        body,
    })
}
