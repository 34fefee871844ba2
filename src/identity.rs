//! Client identity forms and the did:key codec
//!
//! Three identity forms reach the bridge:
//! - Cryptographic DIDs (`did:<method>:<suffix>`), optionally carrying an
//!   Ed25519 public key when the method is `key`
//! - Anonymous free-tier identifiers (opaque, 1–128 chars)
//! - The `anonymous` sentinel used by the sandbox path
//!
//! Both regexes below also gate keys loaded from persisted state files, so a
//! tampered file cannot inject identities that bypass validation elsewhere.

use eyre::{eyre, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Multicodec prefix for an Ed25519 public key (0xED 0x01, varint-encoded)
const ED25519_MULTICODEC_PREFIX: [u8; 2] = [0xED, 0x01];

/// Sentinel identity for unauthenticated sandbox callers
pub const ANONYMOUS: &str = "anonymous";

lazy_static! {
    static ref DID_RE: Regex =
        Regex::new(r"^did:[a-z]+:[A-Za-z0-9._:-]+$").expect("static regex is valid");
    static ref FREE_TIER_RE: Regex =
        Regex::new(r"^[A-Za-z0-9._-]{1,128}$").expect("static regex is valid");
}

/// Billing class attached to an authenticated identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityTier {
    Free,
    Paid,
}

impl IdentityTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityTier::Free => "free",
            IdentityTier::Paid => "paid",
        }
    }
}

/// An authenticated caller: identifier string plus billing tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientIdentity {
    pub id: String,
    pub tier: IdentityTier,
}

impl ClientIdentity {
    pub fn paid(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tier: IdentityTier::Paid,
        }
    }

    pub fn free(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tier: IdentityTier::Free,
        }
    }

    pub fn anonymous() -> Self {
        Self::free(ANONYMOUS)
    }

    pub fn is_anonymous(&self) -> bool {
        self.id == ANONYMOUS
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Validate a DID string (`did:<method>:<suffix>`)
pub fn is_valid_did(s: &str) -> bool {
    DID_RE.is_match(s)
}

/// Validate an anonymous free-tier identifier
pub fn is_valid_free_tier_id(s: &str) -> bool {
    FREE_TIER_RE.is_match(s)
}

/// A persisted-state map key is usable iff it passes one of the two
/// identity regexes. Applied at load time.
pub fn is_valid_identity_key(s: &str) -> bool {
    is_valid_did(s) || is_valid_free_tier_id(s)
}

/// Extract the 32-byte Ed25519 public key from a `did:key` identifier.
///
/// The suffix is multibase: a `z` prefix followed by base58btc of the
/// 34-byte multicodec payload (0xED 0x01 + 32 key bytes).
pub fn did_key_public_key(did: &str) -> Result<[u8; 32]> {
    if !is_valid_did(did) {
        return Err(eyre!("malformed DID"));
    }
    let suffix = did
        .strip_prefix("did:key:")
        .ok_or_else(|| eyre!("not a did:key identifier"))?;
    let encoded = suffix
        .strip_prefix('z')
        .ok_or_else(|| eyre!("unsupported multibase prefix"))?;

    let bytes = bs58::decode(encoded)
        .into_vec()
        .map_err(|e| eyre!("invalid base58 in did:key: {}", e))?;

    if bytes.len() != 34 || bytes[0..2] != ED25519_MULTICODEC_PREFIX {
        return Err(eyre!("did:key does not encode an Ed25519 public key"));
    }

    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes[2..]);
    Ok(key)
}

/// Build a `did:key` identifier from a raw Ed25519 public key
pub fn did_key_from_public_key(key: &[u8; 32]) -> String {
    let mut payload = Vec::with_capacity(34);
    payload.extend_from_slice(&ED25519_MULTICODEC_PREFIX);
    payload.extend_from_slice(key);
    format!("did:key:z{}", bs58::encode(payload).into_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_did_regex_accepts_methods() {
        assert!(is_valid_did("did:key:z6MkhaXgBZDvotDkL5257faiztiGiC2QtKLGpbnnEGta2doK"));
        assert!(is_valid_did("did:web:example.com"));
        assert!(is_valid_did("did:agent:node-1:worker.2"));
    }

    #[test]
    fn test_did_regex_rejects_malformed() {
        assert!(!is_valid_did("did:KEY:abc")); // method must be lowercase
        assert!(!is_valid_did("did:key"));
        assert!(!is_valid_did("key:z6Mk"));
        assert!(!is_valid_did("did:key:with space"));
        assert!(!is_valid_did(""));
    }

    #[test]
    fn test_free_tier_id_bounds() {
        assert!(is_valid_free_tier_id("a"));
        assert!(is_valid_free_tier_id("user_1.beta-test"));
        assert!(is_valid_free_tier_id(&"x".repeat(128)));
        assert!(!is_valid_free_tier_id(&"x".repeat(129)));
        assert!(!is_valid_free_tier_id(""));
        assert!(!is_valid_free_tier_id("has space"));
        assert!(!is_valid_free_tier_id("semi;colon"));
    }

    #[test]
    fn test_did_key_roundtrip() {
        let key = [7u8; 32];
        let did = did_key_from_public_key(&key);
        assert!(is_valid_did(&did));
        assert_eq!(did_key_public_key(&did).unwrap(), key);
    }

    #[test]
    fn test_did_key_rejects_other_methods() {
        assert!(did_key_public_key("did:web:example.com").is_err());
    }

    #[test]
    fn test_did_key_rejects_wrong_multicodec() {
        // secp256k1 multicodec prefix (0xE7 0x01) must be rejected
        let mut payload = vec![0xE7, 0x01];
        payload.extend_from_slice(&[9u8; 33]);
        let did = format!("did:key:z{}", bs58::encode(payload).into_string());
        assert!(did_key_public_key(&did).is_err());
    }

    #[test]
    fn test_identity_tier_strings() {
        assert_eq!(IdentityTier::Free.as_str(), "free");
        assert_eq!(IdentityTier::Paid.as_str(), "paid");
    }

    #[test]
    fn test_anonymous_identity() {
        let id = ClientIdentity::anonymous();
        assert!(id.is_anonymous());
        assert_eq!(id.tier, IdentityTier::Free);
    }
}
