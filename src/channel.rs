//! Perun-style state-channel types: parameters, allocation, state, signed
//! state and the adjudicator's dispute record.
//!
//! Params and state ABI-encode as single top-level tuples, byte-for-byte
//! compatible with the reference contracts; the channel identifier and the
//! state hash are Keccak digests over those encodings, computed locally.

use serde::{Deserialize, Serialize};

use crate::abi::{self, AbiType, Address, Token};
use crate::crypto::{keccak, Digest};
use crate::errors::BenchError;
use crate::wallet::{self, RecoverableSignature, Wallet};

/// Index of the seller in the participant list.
pub const SELLER: usize = 0;
/// Index of the buyer in the participant list.
pub const BUYER: usize = 1;

/// Immutable parameters fixed at channel opening.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelParams {
    /// Dispute challenge duration in seconds.
    pub challenge_duration: u64,
    /// Random channel nonce (carried in a uint256 field on chain).
    pub nonce: u128,
    /// Participant addresses, seller first.
    pub participants: Vec<Address>,
    /// Address of the app contract governing transitions.
    pub app: Address,
    /// Ledger channel flag.
    pub ledger_channel: bool,
    /// Virtual channel flag.
    pub virtual_channel: bool,
}

impl ChannelParams {
    /// ABI value of the parameter tuple.
    pub fn to_token(&self) -> Token {
        Token::Tuple(vec![
            Token::Uint(u128::from(self.challenge_duration)),
            Token::Uint(self.nonce),
            Token::Array(self.participants.iter().map(|p| Token::Address(*p)).collect()),
            Token::Address(self.app),
            Token::Bool(self.ledger_channel),
            Token::Bool(self.virtual_channel),
        ])
    }

    /// ABI type of the parameter tuple, as it appears in contract ABIs.
    pub fn abi_type() -> AbiType {
        AbiType::Tuple(vec![
            AbiType::Uint(256),
            AbiType::Uint(256),
            AbiType::Array(Box::new(AbiType::Address)),
            AbiType::Address,
            AbiType::Bool,
            AbiType::Bool,
        ])
    }

    /// Rebuilds parameters from a decoded tuple.
    pub fn from_token(token: &Token) -> Result<Self, BenchError> {
        let members = token.as_tuple()?;
        if members.len() != 6 {
            return Err(BenchError::ProtocolRuntime(format!(
                "channel params tuple has {} members",
                members.len()
            )));
        }
        let participants = members[2]
            .as_array()?
            .iter()
            .map(Token::as_address)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            challenge_duration: members[0].as_uint()? as u64,
            nonce: members[1].as_uint()?,
            participants,
            app: members[3].as_address()?,
            ledger_channel: members[4].as_bool()?,
            virtual_channel: members[5].as_bool()?,
        })
    }

    /// Canonical encoding of the parameters.
    pub fn encode(&self) -> Vec<u8> {
        abi::encode_tokens(std::slice::from_ref(&self.to_token()))
    }

    /// Channel identifier: Keccak over the encoded parameters.
    pub fn channel_id(&self) -> Digest {
        keccak(&self.encode())
    }
}

/// Funds locked for a sub-channel. Unused by the file-sale app but part of
/// the wire format.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SubAlloc {
    /// Sub-channel identifier.
    pub id: Digest,
    /// Locked balance per asset.
    pub balances: Vec<u128>,
    /// Participant index map.
    pub index_map: Vec<u16>,
}

impl SubAlloc {
    fn to_token(&self) -> Token {
        Token::Tuple(vec![
            Token::FixedBytes(self.id),
            Token::Array(self.balances.iter().map(|b| Token::Uint(*b)).collect()),
            Token::Array(
                self.index_map
                    .iter()
                    .map(|i| Token::Uint(u128::from(*i)))
                    .collect(),
            ),
        ])
    }

    fn abi_type() -> AbiType {
        AbiType::Tuple(vec![
            AbiType::FixedBytes(32),
            AbiType::Array(Box::new(AbiType::Uint(256))),
            AbiType::Array(Box::new(AbiType::Uint(16))),
        ])
    }

    fn from_token(token: &Token) -> Result<Self, BenchError> {
        let members = token.as_tuple()?;
        Ok(Self {
            id: members[0].as_fixed_bytes()?,
            balances: members[1]
                .as_array()?
                .iter()
                .map(Token::as_uint)
                .collect::<Result<Vec<_>, _>>()?,
            index_map: members[2]
                .as_array()?
                .iter()
                .map(|t| Ok(t.as_uint()? as u16))
                .collect::<Result<Vec<_>, BenchError>>()?,
        })
    }
}

/// Distribution of funds inside the channel: one balance row per asset,
/// one column per participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    /// Asset (token) addresses; the single entry is the ETH asset holder.
    pub assets: Vec<Address>,
    /// `balances[asset][participant]` in wei.
    pub balances: Vec<Vec<u128>>,
    /// Locked sub-allocations.
    pub locked: Vec<SubAlloc>,
}

impl Allocation {
    fn to_token(&self) -> Token {
        Token::Tuple(vec![
            Token::Array(self.assets.iter().map(|a| Token::Address(*a)).collect()),
            Token::Array(
                self.balances
                    .iter()
                    .map(|row| Token::Array(row.iter().map(|b| Token::Uint(*b)).collect()))
                    .collect(),
            ),
            Token::Array(self.locked.iter().map(SubAlloc::to_token).collect()),
        ])
    }

    fn abi_type() -> AbiType {
        AbiType::Tuple(vec![
            AbiType::Array(Box::new(AbiType::Address)),
            AbiType::Array(Box::new(AbiType::Array(Box::new(AbiType::Uint(256))))),
            AbiType::Array(Box::new(SubAlloc::abi_type())),
        ])
    }

    fn from_token(token: &Token) -> Result<Self, BenchError> {
        let members = token.as_tuple()?;
        Ok(Self {
            assets: members[0]
                .as_array()?
                .iter()
                .map(Token::as_address)
                .collect::<Result<Vec<_>, _>>()?,
            balances: members[1]
                .as_array()?
                .iter()
                .map(|row| {
                    row.as_array()?
                        .iter()
                        .map(Token::as_uint)
                        .collect::<Result<Vec<_>, _>>()
                })
                .collect::<Result<Vec<_>, _>>()?,
            locked: members[2]
                .as_array()?
                .iter()
                .map(SubAlloc::from_token)
                .collect::<Result<Vec<_>, _>>()?,
        })
    }

    /// Sum of all balances of one asset row.
    pub fn total(&self, asset: usize) -> u128 {
        self.balances[asset].iter().sum()
    }
}

/// One channel state in the monotonically versioned chain of states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelState {
    /// Identifier binding the state to its channel.
    pub channel_id: Digest,
    /// Strictly increasing version number.
    pub version: u64,
    /// Funds distribution after this state.
    pub outcome: Allocation,
    /// ABI-encoded app state.
    pub app_data: Vec<u8>,
    /// Set on the closing state.
    pub is_final: bool,
}

impl ChannelState {
    /// ABI value of the state tuple.
    pub fn to_token(&self) -> Token {
        Token::Tuple(vec![
            Token::FixedBytes(self.channel_id),
            Token::Uint(u128::from(self.version)),
            self.outcome.to_token(),
            Token::Bytes(self.app_data.clone()),
            Token::Bool(self.is_final),
        ])
    }

    /// ABI type of the state tuple, as it appears in contract ABIs.
    pub fn abi_type() -> AbiType {
        AbiType::Tuple(vec![
            AbiType::FixedBytes(32),
            AbiType::Uint(64),
            Allocation::abi_type(),
            AbiType::Bytes,
            AbiType::Bool,
        ])
    }

    /// Rebuilds a state from a decoded tuple.
    pub fn from_token(token: &Token) -> Result<Self, BenchError> {
        let members = token.as_tuple()?;
        if members.len() != 5 {
            return Err(BenchError::ProtocolRuntime(format!(
                "channel state tuple has {} members",
                members.len()
            )));
        }
        Ok(Self {
            channel_id: members[0].as_fixed_bytes()?,
            version: members[1].as_uint()? as u64,
            outcome: Allocation::from_token(&members[2])?,
            app_data: members[3].as_bytes()?.to_vec(),
            is_final: members[4].as_bool()?,
        })
    }

    /// Canonical encoding of the state.
    pub fn encode(&self) -> Vec<u8> {
        abi::encode_tokens(std::slice::from_ref(&self.to_token()))
    }

    /// State hash: Keccak over the encoded state.
    pub fn hash(&self) -> Digest {
        keccak(&self.encode())
    }

    /// Signs the state hash Ethereum-style.
    pub fn sign(&self, wallet: &Wallet) -> Result<RecoverableSignature, BenchError> {
        Ok(wallet.sign_message(&self.hash())?)
    }

    /// Checks that `signature` over this state recovers to `signer`.
    pub fn verify_signature(
        &self,
        signature: &RecoverableSignature,
        signer: Address,
    ) -> Result<bool, BenchError> {
        Ok(wallet::recover_message(&self.hash(), signature)? == signer)
    }

    /// Checks the channel-level transition rules towards `next`: version
    /// increments by exactly one, the channel id and the assets stay fixed
    /// and per-asset totals are preserved.
    pub fn check_successor(&self, next: &ChannelState) -> Result<(), BenchError> {
        if next.version != self.version + 1 {
            return Err(BenchError::ProtocolRuntime(format!(
                "version must step from {} to {}, got {}",
                self.version,
                self.version + 1,
                next.version
            )));
        }
        if next.channel_id != self.channel_id {
            return Err(BenchError::ProtocolRuntime(
                "channel id changed across transition".to_string(),
            ));
        }
        if next.outcome.assets != self.outcome.assets {
            return Err(BenchError::ProtocolRuntime(
                "asset list changed across transition".to_string(),
            ));
        }
        for asset in 0..self.outcome.assets.len() {
            if next.outcome.total(asset) != self.outcome.total(asset) {
                return Err(BenchError::ProtocolRuntime(format!(
                    "asset {asset} total changed across transition"
                )));
            }
        }
        Ok(())
    }
}

/// A state together with both participants' signatures; the recovery
/// anchor for disputes.
#[derive(Debug, Clone)]
pub struct SignedState {
    /// Channel parameters the state belongs to.
    pub params: ChannelParams,
    /// The commonly signed state.
    pub state: ChannelState,
    /// Signatures in participant order (seller, buyer).
    pub sigs: [RecoverableSignature; 2],
}

impl SignedState {
    /// ABI value of the `(params, state, sigs)` tuple used by `register`.
    pub fn to_token(&self) -> Token {
        Token::Tuple(vec![
            self.params.to_token(),
            self.state.to_token(),
            Token::Array(
                self.sigs
                    .iter()
                    .map(|sig| Token::Bytes(sig.to_vec()))
                    .collect(),
            ),
        ])
    }

    /// Checks both signatures against the participant addresses.
    pub fn verify(&self) -> Result<bool, BenchError> {
        for (index, participant) in self.params.participants.iter().enumerate() {
            if !self.state.verify_signature(&self.sigs[index], *participant)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Withdrawal authorization for the asset holder, signed like a state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithdrawalAuth {
    /// Channel the funds belong to.
    pub channel_id: Digest,
    /// Participant whose holdings are withdrawn.
    pub participant: Address,
    /// Account receiving the funds.
    pub receiver: Address,
    /// Amount in wei.
    pub amount: u128,
}

impl WithdrawalAuth {
    /// ABI value of the authorization tuple.
    pub fn to_token(&self) -> Token {
        Token::Tuple(vec![
            Token::FixedBytes(self.channel_id),
            Token::Address(self.participant),
            Token::Address(self.receiver),
            Token::Uint(self.amount),
        ])
    }

    /// Canonical encoding of the authorization.
    pub fn encode(&self) -> Vec<u8> {
        abi::encode_tokens(std::slice::from_ref(&self.to_token()))
    }

    /// Authorization hash, signed identically to state hashes.
    pub fn hash(&self) -> Digest {
        keccak(&self.encode())
    }

    /// Signs the authorization Ethereum-style.
    pub fn sign(&self, wallet: &Wallet) -> Result<RecoverableSignature, BenchError> {
        Ok(wallet.sign_message(&self.hash())?)
    }
}

/// Funding identifier: Keccak over the ABI-encoded channel id and
/// participant address; key into the asset holder's holdings mapping.
pub fn funding_id(channel_id: &Digest, participant: Address) -> Digest {
    keccak(&abi::encode_tokens(&[
        Token::FixedBytes(*channel_id),
        Token::Address(participant),
    ]))
}

/// Phase of an adjudicator dispute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisputePhase {
    /// Registration window; newer states may still be registered.
    Dispute,
    /// Force-execution window; app transitions may be progressed.
    ForceExec,
    /// The dispute is settled and funds are pushed to the asset holder.
    Concluded,
}

impl DisputePhase {
    fn from_uint(value: u128) -> Result<Self, BenchError> {
        match value {
            0 => Ok(Self::Dispute),
            1 => Ok(Self::ForceExec),
            2 => Ok(Self::Concluded),
            other => Err(BenchError::ProtocolRuntime(format!(
                "unknown dispute phase {other}"
            ))),
        }
    }
}

/// Mirror of the adjudicator's per-channel dispute record.
#[derive(Debug, Clone)]
pub struct Dispute {
    /// Unix timestamp at which the current phase times out.
    pub timeout: u64,
    /// Challenge duration registered for the channel.
    pub challenge_duration: u64,
    /// Version of the currently registered state.
    pub version: u64,
    /// Whether the channel has an app.
    pub has_app: bool,
    /// Current phase.
    pub phase: DisputePhase,
    /// Hash of the registered state; zero when nothing is registered.
    pub state_hash: Digest,
}

impl Dispute {
    /// Parses the tuple returned by the adjudicator's `disputes` getter.
    pub fn from_tokens(tokens: &[Token]) -> Result<Self, BenchError> {
        if tokens.len() != 6 {
            return Err(BenchError::ProtocolRuntime(format!(
                "dispute record has {} fields",
                tokens.len()
            )));
        }
        Ok(Self {
            timeout: tokens[0].as_uint()? as u64,
            challenge_duration: tokens[1].as_uint()? as u64,
            version: tokens[2].as_uint()? as u64,
            has_app: tokens[3].as_bool()?,
            phase: DisputePhase::from_uint(tokens[4].as_uint()?)?,
            state_hash: tokens[5].as_fixed_bytes()?,
        })
    }

    /// True when a state has been registered for the channel.
    pub fn registered(&self) -> bool {
        self.state_hash != crate::crypto::B032
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::decode_tokens;

    fn sample_params() -> ChannelParams {
        ChannelParams {
            challenge_duration: 10,
            nonce: 0x1234_5678_9abc_def0,
            participants: vec![Address([1u8; 20]), Address([2u8; 20])],
            app: Address([3u8; 20]),
            ledger_channel: true,
            virtual_channel: false,
        }
    }

    fn sample_state(params: &ChannelParams) -> ChannelState {
        ChannelState {
            channel_id: params.channel_id(),
            version: 1,
            outcome: Allocation {
                assets: vec![Address([9u8; 20])],
                balances: vec![vec![0, 3_000_000_000]],
                locked: Vec::new(),
            },
            app_data: vec![0u8; 192],
            is_final: false,
        }
    }

    #[test]
    fn params_encoding_roundtrip() {
        let params = sample_params();
        let encoded = params.encode();
        // Dynamic tuple at top level: the encoding starts with an offset.
        assert_eq!(encoded[31], 0x20);
        let decoded = decode_tokens(&[ChannelParams::abi_type()], &encoded).unwrap();
        assert_eq!(ChannelParams::from_token(&decoded[0]).unwrap(), params);
    }

    #[test]
    fn channel_id_is_stable_and_nonce_sensitive() {
        let params = sample_params();
        assert_eq!(params.channel_id(), params.channel_id());
        let mut other = params.clone();
        other.nonce += 1;
        assert_ne!(params.channel_id(), other.channel_id());
    }

    #[test]
    fn state_encoding_roundtrip() {
        let params = sample_params();
        let state = sample_state(&params);
        let decoded = decode_tokens(&[ChannelState::abi_type()], &state.encode()).unwrap();
        assert_eq!(ChannelState::from_token(&decoded[0]).unwrap(), state);
    }

    #[test]
    fn sign_and_verify_state() {
        let wallet = Wallet::new(
            None,
            Some("0000000000000000000000000000000000000000000000000000000000000002"),
        )
        .unwrap();
        let params = sample_params();
        let state = sample_state(&params);
        let signature = state.sign(&wallet).unwrap();
        assert!(state.verify_signature(&signature, wallet.address()).unwrap());
        assert!(!state.verify_signature(&signature, Address([5u8; 20])).unwrap());

        let mut tampered = state.clone();
        tampered.version += 1;
        assert!(!tampered.verify_signature(&signature, wallet.address()).unwrap());
    }

    #[test]
    fn successor_checks() {
        let params = sample_params();
        let state = sample_state(&params);

        let mut next = state.clone();
        next.version = 2;
        next.outcome.balances[0] = vec![1_000_000_000, 2_000_000_000];
        assert!(state.check_successor(&next).is_ok());

        let mut skipped = next.clone();
        skipped.version = 3;
        assert!(state.check_successor(&skipped).is_err());

        let mut leaky = next.clone();
        leaky.outcome.balances[0] = vec![1_000_000_000, 2_000_000_001];
        assert!(state.check_successor(&leaky).is_err());

        let mut moved = next.clone();
        moved.channel_id = [0xffu8; 32];
        assert!(state.check_successor(&moved).is_err());
    }

    #[test]
    fn funding_id_depends_on_both_inputs() {
        let channel = [7u8; 32];
        let a = funding_id(&channel, Address([1u8; 20]));
        let b = funding_id(&channel, Address([2u8; 20]));
        assert_ne!(a, b);
        assert_ne!(a, funding_id(&[8u8; 32], Address([1u8; 20])));
    }

    #[test]
    fn withdrawal_auth_is_static_tuple() {
        let auth = WithdrawalAuth {
            channel_id: [1u8; 32],
            participant: Address([2u8; 20]),
            receiver: Address([2u8; 20]),
            amount: 42,
        };
        // Four static words, inlined without an offset.
        assert_eq!(auth.encode().len(), 128);
    }

    #[test]
    fn signed_state_verification() {
        let seller = Wallet::new(
            None,
            Some("0000000000000000000000000000000000000000000000000000000000000003"),
        )
        .unwrap();
        let buyer = Wallet::new(
            None,
            Some("0000000000000000000000000000000000000000000000000000000000000004"),
        )
        .unwrap();
        let mut params = sample_params();
        params.participants = vec![seller.address(), buyer.address()];
        let state = sample_state(&params);
        let signed = SignedState {
            sigs: [state.sign(&seller).unwrap(), state.sign(&buyer).unwrap()],
            params,
            state,
        };
        assert!(signed.verify().unwrap());

        let mut swapped = signed.clone();
        swapped.sigs.swap(0, 1);
        assert!(!swapped.verify().unwrap());
    }

    #[test]
    fn dispute_parsing() {
        let tokens = vec![
            Token::Uint(100),
            Token::Uint(10),
            Token::Uint(3),
            Token::Bool(true),
            Token::Uint(1),
            Token::FixedBytes([5u8; 32]),
        ];
        let dispute = Dispute::from_tokens(&tokens).unwrap();
        assert_eq!(dispute.phase, DisputePhase::ForceExec);
        assert!(dispute.registered());
        assert!(Dispute::from_tokens(&tokens[..5]).is_err());
    }
}
