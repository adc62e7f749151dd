//! The file-sale app state embedded in channel states.
//!
//! The phase automaton cycles IDLE → ACCEPTED → KEY_REVEALED → IDLE per
//! sale; a successful on-chain complaint forces KEY_REVEALED →
//! COMPLAINT_SUCCESSFUL instead, reverting the price shift.

use crate::abi::{self, AbiType, Token};
use crate::crypto::{Digest, B032};
use crate::errors::BenchError;

/// Phase of one file sale inside the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileSalePhase {
    /// No sale in progress; the next `init` starts from here.
    #[default]
    Idle = 0,
    /// The buyer countersigned the seller's initialization.
    Accepted = 1,
    /// The seller revealed the key; the price has shifted to the seller.
    KeyRevealed = 2,
    /// An on-chain complaint succeeded; the price shift was reverted.
    ComplaintSuccessful = 3,
}

impl FileSalePhase {
    /// Parses the numeric on-chain representation.
    pub fn from_uint(value: u128) -> Result<Self, BenchError> {
        match value {
            0 => Ok(Self::Idle),
            1 => Ok(Self::Accepted),
            2 => Ok(Self::KeyRevealed),
            3 => Ok(Self::ComplaintSuccessful),
            other => Err(BenchError::ProtocolRuntime(format!(
                "unknown file sale phase {other}"
            ))),
        }
    }
}

/// App state carried in `Channel.State.app_data`, ABI-encoded as a static
/// 6-tuple.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileSaleAppState {
    /// Root digest of the plain file tree.
    pub file_root: Digest,
    /// Root digest of the encoded tree.
    pub ciphertext_root: Digest,
    /// Keccak commitment to the decryption key.
    pub key_commit: Digest,
    /// The key itself; zero until revealed.
    pub key: Digest,
    /// Sale price in wei.
    pub price: u128,
    /// Current phase.
    pub phase: FileSalePhase,
}

impl FileSaleAppState {
    /// ABI value of the app-state tuple.
    pub fn to_token(&self) -> Token {
        Token::Tuple(vec![
            Token::FixedBytes(self.file_root),
            Token::FixedBytes(self.ciphertext_root),
            Token::FixedBytes(self.key_commit),
            Token::FixedBytes(self.key),
            Token::Uint(self.price),
            Token::Uint(self.phase as u128),
        ])
    }

    /// ABI type of the app-state tuple.
    pub fn abi_type() -> AbiType {
        AbiType::Tuple(vec![
            AbiType::FixedBytes(32),
            AbiType::FixedBytes(32),
            AbiType::FixedBytes(32),
            AbiType::FixedBytes(32),
            AbiType::Uint(256),
            AbiType::Uint(256),
        ])
    }

    /// Encodes the state for embedding into `app_data`.
    pub fn encode_abi(&self) -> Vec<u8> {
        abi::encode_tokens(std::slice::from_ref(&self.to_token()))
    }

    /// Decodes a state out of `app_data`.
    pub fn decode_abi(data: &[u8]) -> Result<Self, BenchError> {
        let tokens = abi::decode_tokens(std::slice::from_ref(&Self::abi_type()), data)?;
        let members = tokens[0].as_tuple()?;
        Ok(Self {
            file_root: members[0].as_fixed_bytes()?,
            ciphertext_root: members[1].as_fixed_bytes()?,
            key_commit: members[2].as_fixed_bytes()?,
            key: members[3].as_fixed_bytes()?,
            price: members[4].as_uint()?,
            phase: FileSalePhase::from_uint(members[5].as_uint()?)?,
        })
    }

    /// The ACCEPTED state a seller proposes for one sale. The key stays
    /// zero until revelation.
    pub fn accepted(
        file_root: Digest,
        ciphertext_root: Digest,
        key_commit: Digest,
        price: u128,
    ) -> Self {
        Self {
            file_root,
            ciphertext_root,
            key_commit,
            key: B032,
            price,
            phase: FileSalePhase::Accepted,
        }
    }

    /// The KEY_REVEALED successor of an ACCEPTED state.
    pub fn with_revealed_key(&self, key: Digest) -> Self {
        Self {
            key,
            phase: FileSalePhase::KeyRevealed,
            ..self.clone()
        }
    }

    /// The COMPLAINT_SUCCESSFUL successor of a KEY_REVEALED state.
    pub fn with_successful_complaint(&self) -> Self {
        Self {
            phase: FileSalePhase::ComplaintSuccessful,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keccak;

    #[test]
    fn encoding_is_static_six_words() {
        let state = FileSaleAppState::default();
        let encoded = state.encode_abi();
        assert_eq!(encoded.len(), 192);
        assert!(encoded.iter().all(|byte| *byte == 0));
    }

    #[test]
    fn abi_roundtrip() {
        let state = FileSaleAppState {
            file_root: keccak(b"file"),
            ciphertext_root: keccak(b"ciphertext"),
            key_commit: keccak(b"commit"),
            key: keccak(b"key"),
            price: 1_000_000_000,
            phase: FileSalePhase::KeyRevealed,
        };
        let decoded = FileSaleAppState::decode_abi(&state.encode_abi()).unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn equality_is_field_wise() {
        let a = FileSaleAppState::accepted(keccak(b"f"), keccak(b"c"), keccak(b"k"), 5);
        let mut b = a.clone();
        assert_eq!(a, b);
        b.price = 6;
        assert_ne!(a, b);
    }

    #[test]
    fn phase_successors() {
        let accepted = FileSaleAppState::accepted(keccak(b"f"), keccak(b"c"), keccak(b"k"), 5);
        assert_eq!(accepted.phase, FileSalePhase::Accepted);
        assert_eq!(accepted.key, B032);

        let revealed = accepted.with_revealed_key(keccak(b"key"));
        assert_eq!(revealed.phase, FileSalePhase::KeyRevealed);
        assert_eq!(revealed.file_root, accepted.file_root);

        let complained = revealed.with_successful_complaint();
        assert_eq!(complained.phase, FileSalePhase::ComplaintSuccessful);
        assert_eq!(complained.key, revealed.key);
    }

    #[test]
    fn rejects_unknown_phase() {
        assert!(FileSalePhase::from_uint(4).is_err());
    }
}
