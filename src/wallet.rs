//! Ethereum wallet: secp256k1 key material, EIP-191 message signing and
//! signer recovery.

use std::{error::Error, fmt};

use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};

use crate::abi::Address;
use crate::crypto::{keccak, Digest};

/// Fixed-length Ethereum signature: `r ‖ s ‖ v` with `v` in `{27, 28}`.
pub type RecoverableSignature = [u8; 65];

/// Errors reported while loading keys or producing/validating signatures.
#[derive(Debug, Clone)]
pub enum WalletError {
    /// Private key bytes could not be decoded or rejected by the curve.
    InvalidKey(String),
    /// Signature bytes malformed or recovery failed.
    InvalidSignature(String),
    /// A configured address does not match the configured private key.
    AddressMismatch {
        /// Address supplied in the configuration.
        configured: Address,
        /// Address derived from the private key.
        derived: Address,
    },
    /// A signing operation was requested but no private key is present.
    NoPrivateKey,
}

impl fmt::Display for WalletError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidKey(err) => write!(f, "invalid private key: {err}"),
            Self::InvalidSignature(err) => write!(f, "invalid signature: {err}"),
            Self::AddressMismatch { configured, derived } => write!(
                f,
                "configured wallet address {configured} does not match private key address {derived}"
            ),
            Self::NoPrivateKey => write!(f, "wallet has no private key to sign with"),
        }
    }
}

impl Error for WalletError {}

/// Account the harness acts as: always an address, optionally with the
/// private key needed to sign locally.
#[derive(Debug, Clone)]
pub struct Wallet {
    signing: Option<SigningKey>,
    address: Address,
}

impl Wallet {
    /// Builds a wallet from an optional address and optional hex private
    /// key. At least one must be present; if both are, they must agree.
    pub fn new(address: Option<Address>, private_key: Option<&str>) -> Result<Self, WalletError> {
        match (address, private_key) {
            (_, Some(key_hex)) => {
                let key_bytes = hex::decode(key_hex.trim_start_matches("0x"))
                    .map_err(|err| WalletError::InvalidKey(err.to_string()))?;
                let signing = SigningKey::from_slice(&key_bytes)
                    .map_err(|err| WalletError::InvalidKey(err.to_string()))?;
                let derived = address_of(signing.verifying_key());
                if let Some(configured) = address {
                    if configured != derived {
                        return Err(WalletError::AddressMismatch { configured, derived });
                    }
                }
                Ok(Self {
                    signing: Some(signing),
                    address: derived,
                })
            }
            (Some(address), None) => Ok(Self {
                signing: None,
                address,
            }),
            (None, None) => Err(WalletError::InvalidKey(
                "wallet needs an address or a private key".to_string(),
            )),
        }
    }

    /// The wallet's account address.
    pub fn address(&self) -> Address {
        self.address
    }

    /// True when the wallet can sign locally.
    pub fn can_sign(&self) -> bool {
        self.signing.is_some()
    }

    /// Signs a 32-byte prehash, returning `r ‖ s ‖ v`.
    pub fn sign_prehash(&self, prehash: &Digest) -> Result<RecoverableSignature, WalletError> {
        let signing = self.signing.as_ref().ok_or(WalletError::NoPrivateKey)?;
        let (signature, recovery) = signing
            .sign_prehash_recoverable(prehash)
            .map_err(|err| WalletError::InvalidSignature(err.to_string()))?;
        let mut out = [0u8; 65];
        out[..64].copy_from_slice(signature.to_bytes().as_slice());
        out[64] = 27 + recovery.to_byte();
        Ok(out)
    }

    /// Signs `message32` Ethereum-style: the EIP-191 personal-message
    /// prefix is applied before hashing and signing.
    pub fn sign_message(&self, message32: &Digest) -> Result<RecoverableSignature, WalletError> {
        self.sign_prehash(&eth_message_digest(message32))
    }
}

/// Keccak digest of the EIP-191 `personal_sign` envelope of a 32-byte
/// message: `"\x19Ethereum Signed Message:\n32" ‖ message`.
pub fn eth_message_digest(message32: &Digest) -> Digest {
    let mut input = Vec::with_capacity(28 + 32);
    input.extend_from_slice(b"\x19Ethereum Signed Message:\n32");
    input.extend_from_slice(message32);
    keccak(&input)
}

/// Derives the Ethereum address of a verifying key: the low 20 bytes of the
/// Keccak digest of the uncompressed public key.
pub fn address_of(verifying: &VerifyingKey) -> Address {
    let point = verifying.to_encoded_point(false);
    let digest = keccak(&point.as_bytes()[1..]);
    let mut address = [0u8; 20];
    address.copy_from_slice(&digest[12..]);
    Address(address)
}

/// Recovers the signer address of a signature over a 32-byte prehash.
pub fn recover_prehash(
    prehash: &Digest,
    signature: &RecoverableSignature,
) -> Result<Address, WalletError> {
    let parsed = Signature::from_slice(&signature[..64])
        .map_err(|err| WalletError::InvalidSignature(err.to_string()))?;
    let v = match signature[64] {
        0 | 1 => signature[64],
        27 | 28 => signature[64] - 27,
        other => {
            return Err(WalletError::InvalidSignature(format!(
                "invalid recovery byte {other}"
            )))
        }
    };
    let recovery = RecoveryId::from_byte(v)
        .ok_or_else(|| WalletError::InvalidSignature("invalid recovery id".to_string()))?;
    let verifying = VerifyingKey::recover_from_prehash(prehash, &parsed, recovery)
        .map_err(|err| WalletError::InvalidSignature(err.to_string()))?;
    Ok(address_of(&verifying))
}

/// Recovers the signer address of an EIP-191 signature over `message32`.
pub fn recover_message(
    message32: &Digest,
    signature: &RecoverableSignature,
) -> Result<Address, WalletError> {
    recover_prehash(&eth_message_digest(message32), signature)
}

/// Parses a hex signature string into the fixed 65-byte representation.
pub fn signature_from_hex(input: &str) -> Result<RecoverableSignature, WalletError> {
    let bytes = hex::decode(input.trim_start_matches("0x"))
        .map_err(|err| WalletError::InvalidSignature(err.to_string()))?;
    if bytes.len() != 65 {
        return Err(WalletError::InvalidSignature(format!(
            "signature must be 65 bytes, got {}",
            bytes.len()
        )));
    }
    let mut out = [0u8; 65];
    out.copy_from_slice(&bytes);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_ONE: &str = "0000000000000000000000000000000000000000000000000000000000000001";

    #[test]
    fn derives_known_address() {
        // Address of the secp256k1 generator's secret key 1.
        let wallet = Wallet::new(None, Some(KEY_ONE)).unwrap();
        assert_eq!(
            wallet.address().to_hex(),
            "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf"
        );
        assert!(wallet.can_sign());
    }

    #[test]
    fn rejects_mismatched_address() {
        let wrong = Address([0x11; 20]);
        assert!(matches!(
            Wallet::new(Some(wrong), Some(KEY_ONE)),
            Err(WalletError::AddressMismatch { .. })
        ));
    }

    #[test]
    fn watch_only_wallet_cannot_sign() {
        let wallet = Wallet::new(Some(Address([0x22; 20])), None).unwrap();
        assert!(!wallet.can_sign());
        assert!(matches!(
            wallet.sign_message(&[0u8; 32]),
            Err(WalletError::NoPrivateKey)
        ));
    }

    #[test]
    fn sign_and_recover_roundtrip() {
        let wallet = Wallet::new(None, Some(KEY_ONE)).unwrap();
        let message = keccak(b"state hash");
        let signature = wallet.sign_message(&message).unwrap();
        assert!(signature[64] == 27 || signature[64] == 28);
        assert_eq!(recover_message(&message, &signature).unwrap(), wallet.address());
        // A different message must not recover the same signer.
        let other = keccak(b"another state hash");
        assert_ne!(recover_message(&other, &signature).unwrap(), wallet.address());
    }

    #[test]
    fn signature_hex_roundtrip() {
        let wallet = Wallet::new(None, Some(KEY_ONE)).unwrap();
        let signature = wallet.sign_message(&keccak(b"payload")).unwrap();
        let parsed = signature_from_hex(&hex::encode(signature)).unwrap();
        assert_eq!(parsed, signature);
        assert!(signature_from_hex("0011").is_err());
    }
}
