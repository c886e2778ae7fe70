//! Hex helpers for digests and signature components.

use crate::error::WireError;

/// Strip an optional `0x` / `0X` prefix.
pub fn strip_0x(s: &str) -> &str {
    s.strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s)
}

/// Decode a 32-byte digest. Exactly 64 hex characters after an optional
/// `0x` prefix; anything else is rejected.
pub fn decode_hash32(s: &str) -> Result<[u8; 32], WireError> {
    let trimmed = strip_0x(s.trim());
    if trimmed.is_empty() {
        return Err(WireError::Missing("hash_hex"));
    }
    let bytes = hex::decode(trimmed).map_err(|e| WireError::InvalidHex {
        field: "hash_hex",
        reason: e.to_string(),
    })?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| WireError::InvalidLength {
            field: "hash_hex",
            expected: 32,
            actual: bytes.len(),
        })
}

/// Decode a big-endian integer of at most 32 bytes and left-pad it to 32.
/// Shorter encodings (leading zero bytes dropped) are accepted.
pub fn decode_left_padded32(field: &'static str, s: &str) -> Result<[u8; 32], WireError> {
    let mut trimmed = strip_0x(s.trim()).to_string();
    if trimmed.is_empty() {
        return Err(WireError::Missing(field));
    }
    if trimmed.len() % 2 == 1 {
        trimmed.insert(0, '0');
    }
    let bytes = hex::decode(&trimmed).map_err(|e| WireError::InvalidHex {
        field,
        reason: e.to_string(),
    })?;
    if bytes.len() > 32 {
        return Err(WireError::InvalidLength {
            field,
            expected: 32,
            actual: bytes.len(),
        });
    }
    let mut out = [0u8; 32];
    out[32 - bytes.len()..].copy_from_slice(&bytes);
    Ok(out)
}

/// Lowercase hex with a `0x` prefix.
pub fn encode_0x(bytes: impl AsRef<[u8]>) -> String {
    format!("0x{}", hex::encode(bytes))
}
