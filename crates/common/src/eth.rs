//! Ethereum identity and ECDSA signature helpers over secp256k1.
//!
//! The cluster's group key is exposed as an uncompressed SEC1 public key and
//! an EIP-55 checksummed address. Signatures are returned as `(r, s)` with
//! low-s normalization, so they verify on chain as-is.

use k256::ecdsa::signature::hazmat::PrehashVerifier;
use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use sha3::{Digest, Keccak256};

use crate::error::WireError;
use crate::hexutil;

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    Keccak256::digest(data).into()
}

/// Parse a SEC1 public key (compressed or uncompressed) from hex.
pub fn parse_public_key(hex_str: &str) -> Result<VerifyingKey, WireError> {
    let bytes =
        hex::decode(hexutil::strip_0x(hex_str.trim())).map_err(|e| WireError::InvalidHex {
            field: "pubkey_hex",
            reason: e.to_string(),
        })?;
    VerifyingKey::from_sec1_bytes(&bytes).map_err(|e| WireError::InvalidCrypto {
        field: "pubkey_hex",
        reason: e.to_string(),
    })
}

/// Uncompressed SEC1 encoding (65 bytes, `0x04` prefix) as `0x` hex.
pub fn uncompressed_hex(key: &VerifyingKey) -> String {
    hexutil::encode_0x(key.to_encoded_point(false).as_bytes())
}

/// EIP-55 checksummed address of a public key.
pub fn address_from_public_key(key: &VerifyingKey) -> String {
    let point = key.to_encoded_point(false);
    // Skip the 0x04 tag; hash X || Y.
    let hash = keccak256(&point.as_bytes()[1..]);
    let mut addr = [0u8; 20];
    addr.copy_from_slice(&hash[12..]);
    to_checksum_address(&addr)
}

pub fn address_from_public_key_hex(hex_str: &str) -> Result<String, WireError> {
    Ok(address_from_public_key(&parse_public_key(hex_str)?))
}

/// Mixed-case checksum encoding of a 20-byte address.
pub fn to_checksum_address(addr: &[u8; 20]) -> String {
    let lower = hex::encode(addr);
    let hash = keccak256(lower.as_bytes());
    let mut out = String::with_capacity(42);
    out.push_str("0x");
    for (i, c) in lower.chars().enumerate() {
        let nibble = if i % 2 == 0 {
            hash[i / 2] >> 4
        } else {
            hash[i / 2] & 0x0f
        };
        if c.is_ascii_alphabetic() && nibble >= 8 {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Case-insensitive address comparison, `0x` optional.
pub fn same_address(a: &str, b: &str) -> bool {
    hexutil::strip_0x(a.trim()).eq_ignore_ascii_case(hexutil::strip_0x(b.trim()))
}

fn signature_from_parts(r: &[u8; 32], s: &[u8; 32]) -> Result<Signature, WireError> {
    let mut bytes = [0u8; 64];
    bytes[..32].copy_from_slice(r);
    bytes[32..].copy_from_slice(s);
    Signature::from_slice(&bytes).map_err(|e| WireError::InvalidCrypto {
        field: "signature",
        reason: e.to_string(),
    })
}

/// Rewrite `s` into the lower half of the curve order if needed.
pub fn normalize_signature(r: &[u8; 32], s: &[u8; 32]) -> Result<([u8; 32], [u8; 32]), WireError> {
    let sig = signature_from_parts(r, s)?;
    let sig = sig.normalize_s().unwrap_or(sig);
    let (r, s) = sig.split_bytes();
    Ok((r.into(), s.into()))
}

/// Verify `(r, s)` over a 32-byte digest with a known public key.
pub fn verify_prehash(
    key: &VerifyingKey,
    digest: &[u8; 32],
    r: &[u8; 32],
    s: &[u8; 32],
) -> Result<bool, WireError> {
    let sig = signature_from_parts(r, s)?;
    let sig = sig.normalize_s().unwrap_or(sig);
    Ok(key.verify_prehash(digest, &sig).is_ok())
}

/// Verify `(r, s)` over a digest against an address by public-key recovery.
pub fn verify_prehash_address(
    address: &str,
    digest: &[u8; 32],
    r: &[u8; 32],
    s: &[u8; 32],
) -> Result<bool, WireError> {
    let sig = signature_from_parts(r, s)?;
    let sig = sig.normalize_s().unwrap_or(sig);
    for v in 0u8..2 {
        let Some(recid) = RecoveryId::from_byte(v) else {
            continue;
        };
        if let Ok(key) = VerifyingKey::recover_from_prehash(digest, &sig, recid) {
            if same_address(&address_from_public_key(&key), address) {
                return Ok(true);
            }
        }
    }
    Ok(false)
}
