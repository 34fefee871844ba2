//! Hash computation for on-chain content commitments
//!
//! The escrow contract stores 32-byte keccak256 commitments for both party
//! identities and delivered outputs:
//! - identity commitment: `keccak256(utf8(did))`
//! - output commitment: `keccak256(utf8(output))`
//!
//! Comparisons against chain-sourced hex values are case-insensitive.

use tiny_keccak::{Hasher, Keccak};

/// Compute keccak256 hash of data
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    hasher.update(data);
    let mut output = [0u8; 32];
    hasher.finalize(&mut output);
    output
}

/// Commitment for a DID string as stored by the escrow contract
pub fn hash_did(did: &str) -> [u8; 32] {
    keccak256(did.as_bytes())
}

/// Commitment for a task output blob as submitted to `confirmDelivery`
pub fn hash_output(output: &str) -> [u8; 32] {
    keccak256(output.as_bytes())
}

/// Convert a 32-byte hash to a 0x-prefixed lowercase hex string
pub fn bytes32_to_hex(bytes: &[u8; 32]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Parse a 0x-prefixed (or bare) hex string into 32 bytes
pub fn bytes32_from_hex(s: &str) -> Option<[u8; 32]> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    let decoded = hex::decode(s).ok()?;
    if decoded.len() != 32 {
        return None;
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&decoded);
    Some(out)
}

/// Case-insensitive comparison of two hex-encoded 32-byte values.
///
/// Either side may carry a 0x prefix.
pub fn hex_hash_eq(a: &str, b: &str) -> bool {
    let a = a.strip_prefix("0x").unwrap_or(a);
    let b = b.strip_prefix("0x").unwrap_or(b);
    a.len() == 64 && a.eq_ignore_ascii_case(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keccak256_known_vector() {
        // keccak256("") is the canonical empty hash
        let hash = keccak256(b"");
        assert_eq!(
            bytes32_to_hex(&hash),
            "0xc5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn test_hash_did_deterministic() {
        let a = hash_did("did:key:z6MkhaXgBZDvotDkL5257faiztiGiC2QtKLGpbnnEGta2doK");
        let b = hash_did("did:key:z6MkhaXgBZDvotDkL5257faiztiGiC2QtKLGpbnnEGta2doK");
        assert_eq!(a, b);

        let c = hash_did("did:key:z6Mkf5rGMoatrSj1f4CyvuHBeXJELe9RPdzo2PKGNCKVtZxP");
        assert_ne!(a, c);
    }

    #[test]
    fn test_output_hash_matches_did_hash_scheme() {
        // Both commitments use plain keccak256 over the UTF-8 bytes
        assert_eq!(hash_output("hello"), keccak256(b"hello"));
    }

    #[test]
    fn test_bytes32_hex_roundtrip() {
        let hash = keccak256(b"roundtrip");
        let hex = bytes32_to_hex(&hash);
        assert_eq!(bytes32_from_hex(&hex), Some(hash));
    }

    #[test]
    fn test_bytes32_from_hex_without_prefix() {
        let hash = keccak256(b"bare");
        let parsed = bytes32_from_hex(&hex::encode(hash));
        assert_eq!(parsed, Some(hash));
    }

    #[test]
    fn test_bytes32_from_hex_wrong_length() {
        assert!(bytes32_from_hex("0xdead").is_none());
    }

    #[test]
    fn test_hex_hash_eq_case_insensitive() {
        let hash = keccak256(b"case");
        let lower = bytes32_to_hex(&hash);
        let upper = format!("0x{}", hex::encode_upper(hash));
        assert!(hex_hash_eq(&lower, &upper));
        assert!(!hex_hash_eq(&lower, &bytes32_to_hex(&keccak256(b"other"))));
    }
}
