//! Keccak-256 digests and the position-indexed XOR cipher used by the
//! Fairswap verifiable encoding.

use rand::RngCore;
use sha3::{Digest as _, Keccak256};

/// Fixed-width Keccak-256 digest.
pub type Digest = [u8; 32];

/// 32 zero bytes; used as the "unset" digest, the zero key and the encoding
/// sentinel leaf.
pub const B032: Digest = [0u8; 32];

/// Computes the Keccak-256 digest of `data`.
pub fn keccak(data: &[u8]) -> Digest {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Computes the Keccak-256 digest of the concatenation of two digests.
pub fn keccak_pair(left: &Digest, right: &Digest) -> Digest {
    let mut hasher = Keccak256::new();
    hasher.update(left);
    hasher.update(right);
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Derives the keystream block for position `index` under `key`:
/// `Keccak(uint256_be(index) ‖ key)`.
pub fn mask(index: usize, key: &Digest) -> Digest {
    let mut input = [0u8; 64];
    input[24..32].copy_from_slice(&(index as u64).to_be_bytes());
    input[32..].copy_from_slice(key);
    keccak(&input)
}

/// XORs `value` with the keystream block for `index`, tiled to the length of
/// `value`. Involutive: applying it twice restores the input.
pub fn crypt(value: &[u8], index: usize, key: &Digest) -> Vec<u8> {
    let pad = mask(index, key);
    value
        .iter()
        .enumerate()
        .map(|(i, byte)| byte ^ pad[i % 32])
        .collect()
}

/// Draws a fresh uniformly random 32-byte key from the OS generator.
pub fn random_key() -> Digest {
    let mut key = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

/// Converts a digest into a lowercase hex string.
pub fn digest_to_hex(digest: &Digest) -> String {
    hex::encode(digest)
}

/// Parses a hex string into a digest.
pub fn digest_from_hex(input: &str) -> Result<Digest, String> {
    let bytes = hex::decode(input.trim_start_matches("0x"))
        .map_err(|err| format!("invalid hex digest: {err}"))?;
    if bytes.len() != 32 {
        return Err(format!(
            "digest must be 32 bytes (64 hex chars), got {}",
            bytes.len()
        ));
    }
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&bytes);
    Ok(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keccak_known_vector() {
        // keccak256 of the empty input.
        assert_eq!(
            digest_to_hex(&keccak(b"")),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn keccak_pair_matches_concatenation() {
        let a = keccak(b"left");
        let b = keccak(b"right");
        let mut concat = Vec::with_capacity(64);
        concat.extend_from_slice(&a);
        concat.extend_from_slice(&b);
        assert_eq!(keccak_pair(&a, &b), keccak(&concat));
    }

    #[test]
    fn crypt_is_involutive() {
        let key = keccak(b"key material");
        let value: Vec<u8> = (0u8..96).collect();
        let encrypted = crypt(&value, 7, &key);
        assert_ne!(encrypted, value);
        assert_eq!(crypt(&encrypted, 7, &key), value);
    }

    #[test]
    fn crypt_depends_on_index() {
        let key = keccak(b"key material");
        let value = [0xaau8; 32];
        assert_ne!(crypt(&value, 0, &key), crypt(&value, 1, &key));
    }

    #[test]
    fn digest_hex_roundtrip() {
        let digest = keccak(b"roundtrip");
        assert_eq!(digest_from_hex(&digest_to_hex(&digest)).unwrap(), digest);
        assert!(digest_from_hex("abcd").is_err());
    }
}
