//! Reusable Fairswap: one long-lived `FileSaleReusable` contract serving
//! many independent sessions.
//!
//! A session is keyed by `Keccak(seller ‖ buyer ‖ file_root)`; all
//! contract interactions carry the session identifier and the operator
//! deploys the contract once per simulation.

use std::path::PathBuf;
use std::time::Duration;

use log::debug;
use serde_json::{json, Value};

use crate::abi::{Address, Token};
use crate::chain::{Environment, WaitResult};
use crate::contracts::{Contract, SoliditySourceSet};
use crate::crypto::{crypt, keccak, random_key, Digest, B032};
use crate::encoding::{decode, encode, MismatchKind};
use crate::errors::BenchError;
use crate::merkle::{mt2obj_hex, obj2mt_hex, MerkleTree};
use crate::p2p::JsonObjectStream;
use crate::protocols::fairswap::{slice_geometry, DEFAULT_SLICE_COUNT, DEFAULT_TIMEOUT};
use crate::protocols::{Protocol, ProtocolParams, ProtocolSpec, Role, Strategy};

const CONTRACT_NAME: &str = "FileSaleReusable";
const CONTRACT_SOURCE: &str = "FileSaleReusable.sol";

/// Session stage once the buyer has paid.
const STAGE_ACCEPTED: u128 = 2;
/// Stage of a cleared (paid out or refunded) session slot.
const STAGE_CLEARED: u128 = 0;

/// Fixed gas limit for `revealKey`, matching the one-shot protocol.
const REVEAL_KEY_GAS: u64 = 200_000;

/// Registry entry for the reusable protocol.
pub fn spec() -> ProtocolSpec {
    ProtocolSpec {
        name: "FairswapReusable",
        build: |params| Ok(Box::new(FairswapReusable::new(params)?)),
        seller_strategies: &["Faithful"],
        buyer_strategies: &["Faithful"],
    }
}

/// Session identifier: Keccak over both parties and the plain file root.
pub fn session_id(seller: Address, buyer: Address, file_root: &Digest) -> Digest {
    let mut input = Vec::with_capacity(20 + 20 + 32);
    input.extend_from_slice(&seller.0);
    input.extend_from_slice(&buyer.0);
    input.extend_from_slice(file_root);
    keccak(&input)
}

/// Mirror of the contract's per-session record.
#[derive(Debug, Clone)]
struct FileSaleSession {
    file_root: Digest,
    ciphertext_root: Digest,
    key: Digest,
    timeout: u64,
    phase: u128,
}

impl FileSaleSession {
    fn from_tokens(fields: &[Token]) -> Result<Self, BenchError> {
        if fields.len() != 13 {
            return Err(BenchError::ProtocolRuntime(format!(
                "session record has {} fields",
                fields.len()
            )));
        }
        Ok(Self {
            file_root: fields[2].as_fixed_bytes()?,
            ciphertext_root: fields[1].as_fixed_bytes()?,
            key: fields[3].as_fixed_bytes()?,
            timeout: fields[9].as_uint()? as u64,
            phase: fields[12].as_uint()?,
        })
    }

    fn fetch(
        environment: &Environment,
        contract: &Contract,
        id: &Digest,
    ) -> Result<Self, BenchError> {
        let fields =
            environment.call_contract(contract, "sessions", &[Token::FixedBytes(*id)])?;
        Self::from_tokens(&fields)
    }
}

/// The reusable Fairswap protocol.
pub struct FairswapReusable {
    params: ProtocolParams,
    slice_count: usize,
    slice_length: usize,
    timeout: u64,
    contracts_dir: PathBuf,
    solc: String,
    contract: Option<Contract>,
}

impl FairswapReusable {
    /// Validates parameters and prepares the protocol.
    pub fn new(params: ProtocolParams) -> Result<Self, BenchError> {
        params.ensure_known_keys(&["slice_count", "timeout", "contracts_dir", "solc"])?;
        let slice_count = params.extra_u64("slice_count", DEFAULT_SLICE_COUNT as u64)?;
        let timeout = params.extra_u64("timeout", DEFAULT_TIMEOUT)?;
        let (slice_count, slice_length) = slice_geometry(params.file_size()?, slice_count)?;
        let contracts_dir = PathBuf::from(params.extra_str("contracts_dir", "contracts"));
        let solc = params.extra_str("solc", "solc");
        Ok(Self {
            params,
            slice_count,
            slice_length,
            timeout,
            contracts_dir,
            solc,
            contract: None,
        })
    }

    fn contract(&self) -> Result<&Contract, BenchError> {
        self.contract.as_ref().ok_or_else(|| {
            BenchError::ProtocolRuntime("FileSaleReusable contract not deployed".to_string())
        })
    }
}

impl Protocol for FairswapReusable {
    fn set_up_simulation(
        &mut self,
        operator: &Environment,
        _seller: Address,
        _buyer: Address,
    ) -> Result<(), BenchError> {
        let mut sources = SoliditySourceSet::new();
        sources.add_source(self.contracts_dir.join(CONTRACT_SOURCE));
        sources.allow_path(&self.contracts_dir);
        let mut contracts = sources.compile(&self.solc)?;
        let mut contract = contracts.remove(CONTRACT_NAME).ok_or_else(|| {
            BenchError::Configuration(format!("{CONTRACT_SOURCE} does not define {CONTRACT_NAME}"))
        })?;
        operator.deploy_contract(&mut contract, &[], 0)?;
        self.contract = Some(contract);
        Ok(())
    }

    fn snapshot(&self) -> Result<Value, BenchError> {
        Ok(json!({ "contract": self.contract()?.export() }))
    }

    fn restore(&mut self, snapshot: &Value) -> Result<(), BenchError> {
        self.contract = Some(Contract::import(&snapshot["contract"])?);
        Ok(())
    }

    fn make_strategy(&self, role: Role, name: &str) -> Result<Box<dyn Strategy>, BenchError> {
        if name != "Faithful" {
            return Err(BenchError::Configuration(format!(
                "unknown {role} strategy '{name}' for FairswapReusable"
            )));
        }
        match role {
            Role::Seller => Ok(Box::new(ReusableSeller {
                filename: self.params.filename.clone(),
                price: self.params.price,
                slice_count: self.slice_count,
                slice_length: self.slice_length,
                timeout: self.timeout,
                contract: self.contract()?.clone(),
            })),
            Role::Buyer => {
                let data = self.params.read_file()?;
                let tree = MerkleTree::from_bytes(&data, self.slice_count)
                    .map_err(BenchError::ProtocolInitialization)?;
                Ok(Box::new(ReusableBuyer {
                    price: self.params.price,
                    timeout: self.timeout,
                    expected_plain_digest: tree.digest(),
                    contract: self.contract()?.clone(),
                }))
            }
        }
    }
}

struct ReusableSeller {
    filename: PathBuf,
    price: u128,
    slice_count: usize,
    slice_length: usize,
    timeout: u64,
    contract: Contract,
}

impl Strategy for ReusableSeller {
    fn run(
        &mut self,
        environment: &Environment,
        p2p: &mut JsonObjectStream,
        opposite: Address,
    ) -> Result<(), BenchError> {
        // Phase 1: encode, transmit off-chain, initialize the session.
        let data = std::fs::read(&self.filename)
            .map_err(|err| BenchError::ProtocolRuntime(format!("reading file: {err}")))?;
        let tree = MerkleTree::from_bytes(&data, self.slice_count)
            .map_err(BenchError::ProtocolInitialization)?;
        let key = random_key();
        let encoded = encode(&tree, &key).map_err(BenchError::ProtocolRuntime)?;

        p2p.send_object(&json!({ "tree": mt2obj_hex(&encoded) }))
            .map_err(BenchError::from)?;

        let id = session_id(environment.wallet_address(), opposite, &tree.digest());
        let depth = (self.slice_count * 2).trailing_zeros() as u128;
        debug!("initializing session 0x{}", hex::encode(id));
        environment.send_contract_transaction(
            &self.contract,
            "init",
            &[
                Token::Address(opposite),
                Token::Uint(depth),
                Token::Uint(self.slice_length as u128),
                Token::Uint(self.slice_count as u128),
                Token::Uint(u128::from(self.timeout)),
                Token::Uint(self.price),
                Token::FixedBytes(keccak(&key)),
                Token::FixedBytes(encoded.digest()),
                Token::FixedBytes(tree.digest()),
            ],
            0,
            None,
        )?;

        // Phase 2: wait for the buyer to accept.
        debug!("waiting for accept");
        let deadline = FileSaleSession::fetch(environment, &self.contract, &id)?.timeout + 1;
        let accepted = || {
            Ok(FileSaleSession::fetch(environment, &self.contract, &id)?.phase == STAGE_ACCEPTED)
        };
        if environment.wait(Some(deadline), Some(&accepted))? == WaitResult::Timeout {
            debug!("timeout reached, requesting refund");
            environment.send_contract_transaction(
                &self.contract,
                "refund",
                &[Token::FixedBytes(id)],
                0,
                None,
            )?;
            return Ok(());
        }

        // Phase 3: reveal the key.
        environment.send_contract_transaction(
            &self.contract,
            "revealKey",
            &[Token::FixedBytes(id), Token::FixedBytes(key)],
            0,
            Some(REVEAL_KEY_GAS),
        )?;

        // Phase 5: wait for the session to clear or claim the payout.
        debug!("waiting for confirmation or timeout");
        let deadline = FileSaleSession::fetch(environment, &self.contract, &id)?.timeout + 1;
        let cleared = || {
            Ok(FileSaleSession::fetch(environment, &self.contract, &id)?.phase == STAGE_CLEARED)
        };
        if environment.wait(Some(deadline), Some(&cleared))? == WaitResult::Timeout {
            debug!("timeout reached, requesting payout");
            environment.send_contract_transaction(
                &self.contract,
                "refund",
                &[Token::FixedBytes(id)],
                0,
                None,
            )?;
        }
        Ok(())
    }
}

struct ReusableBuyer {
    price: u128,
    timeout: u64,
    expected_plain_digest: Digest,
    contract: Contract,
}

impl Strategy for ReusableBuyer {
    fn run(
        &mut self,
        environment: &Environment,
        p2p: &mut JsonObjectStream,
        opposite: Address,
    ) -> Result<(), BenchError> {
        // Phase 1: receive the ciphertext and wait for the session.
        let received = p2p
            .receive_object(Some(Duration::from_secs(self.timeout * 2)))
            .map_err(BenchError::from)?;
        let Some((init, _)) = received else {
            return Err(BenchError::ProtocolRuntime(
                "seller closed the stream before initialization".to_string(),
            ));
        };
        let encoded = obj2mt_hex(&init["tree"]).map_err(BenchError::ProtocolRuntime)?;

        let id = session_id(opposite, environment.wallet_address(), &self.expected_plain_digest);
        let deadline = crate::chain::unix_now() + self.timeout;
        let initialized = || {
            Ok(FileSaleSession::fetch(environment, &self.contract, &id)?.phase != STAGE_CLEARED)
        };
        if environment.wait(Some(deadline), Some(&initialized))? == WaitResult::Timeout {
            debug!("seller never initialized the session, aborting");
            return Ok(());
        }

        // Phase 2: verify commitments, then accept.
        let session = FileSaleSession::fetch(environment, &self.contract, &id)?;
        if session.file_root != self.expected_plain_digest {
            debug!("wrong plain file hash, aborting");
            return Ok(());
        }
        if session.ciphertext_root != encoded.digest() {
            debug!("wrong ciphertext hash, aborting");
            return Ok(());
        }

        environment.send_contract_transaction(
            &self.contract,
            "accept",
            &[Token::FixedBytes(id)],
            self.price,
            None,
        )?;

        // Phase 3: wait for the key revelation.
        debug!("waiting for key revelation");
        let deadline = FileSaleSession::fetch(environment, &self.contract, &id)?.timeout + 1;
        let revealed =
            || Ok(FileSaleSession::fetch(environment, &self.contract, &id)?.key != B032);
        if environment.wait(Some(deadline), Some(&revealed))? == WaitResult::Timeout {
            debug!("timeout waiting for key, requesting refund");
            environment.send_contract_transaction(
                &self.contract,
                "refund",
                &[Token::FixedBytes(id)],
                0,
                None,
            )?;
            return Ok(());
        }
        let key = FileSaleSession::fetch(environment, &self.contract, &id)?.key;

        // Phase 4: decode and complain if necessary.
        let root_leaf = encoded.leaf_count() - 2;
        if crypt(encoded.leaf_data(root_leaf), root_leaf, &key) != self.expected_plain_digest {
            debug!("decrypted root mismatch, complaining about root");
            environment.send_contract_transaction(
                &self.contract,
                "complainAboutRoot",
                &[
                    Token::FixedBytes(id),
                    Token::FixedBytes(encoded.leaf_digest(root_leaf)),
                    proof_tokens(&encoded, root_leaf)?,
                ],
                0,
                None,
            )?;
            return Ok(());
        }

        let (_, errors) = decode(&encoded, &key)
            .map_err(|err| BenchError::ProtocolRuntime(err.to_string()))?;
        let Some(error) = errors.last() else {
            debug!("file successfully decrypted, quitting");
            return Ok(());
        };

        match error.kind {
            MismatchKind::Leaf => {
                environment.send_contract_transaction(
                    &self.contract,
                    "complainAboutLeaf",
                    &[
                        Token::FixedBytes(id),
                        Token::Uint(error.index_out as u128),
                        Token::Uint(error.index_in as u128),
                        Token::FixedBytes(digest32(encoded.leaf_data(error.index_out))?),
                        blocks_tokens(&encoded, error.index_in),
                        blocks_tokens(&encoded, error.index_in + 1),
                        proof_tokens(&encoded, error.index_out)?,
                        proof_tokens(&encoded, error.index_in)?,
                    ],
                    0,
                    None,
                )?;
            }
            MismatchKind::Node => {
                environment.send_contract_transaction(
                    &self.contract,
                    "complainAboutNode",
                    &[
                        Token::FixedBytes(id),
                        Token::Uint(error.index_out as u128),
                        Token::Uint(error.index_in as u128),
                        Token::FixedBytes(digest32(encoded.leaf_data(error.index_out))?),
                        Token::FixedBytes(digest32(encoded.leaf_data(error.index_in))?),
                        Token::FixedBytes(digest32(encoded.leaf_data(error.index_in + 1))?),
                        proof_tokens(&encoded, error.index_out)?,
                        proof_tokens(&encoded, error.index_in)?,
                    ],
                    0,
                    None,
                )?;
            }
        }
        Ok(())
    }
}

fn digest32(data: &[u8]) -> Result<Digest, BenchError> {
    if data.len() != 32 {
        return Err(BenchError::ProtocolRuntime(format!(
            "expected a 32-byte leaf, got {} bytes",
            data.len()
        )));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(data);
    Ok(out)
}

fn proof_tokens(tree: &MerkleTree, index: usize) -> Result<Token, BenchError> {
    let proof = tree.proof(index).map_err(BenchError::ProtocolRuntime)?;
    Ok(Token::Array(
        proof.into_iter().map(Token::FixedBytes).collect(),
    ))
}

fn blocks_tokens(tree: &MerkleTree, index: usize) -> Token {
    Token::Array(
        tree.leaf_data_blocks(index)
            .into_iter()
            .map(Token::FixedBytes)
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_binds_parties_and_file() {
        let seller = Address([1u8; 20]);
        let buyer = Address([2u8; 20]);
        let root = keccak(b"file root");
        let id = session_id(seller, buyer, &root);
        assert_ne!(id, session_id(buyer, seller, &root));
        assert_ne!(id, session_id(seller, buyer, &keccak(b"other root")));
        assert_eq!(id, session_id(seller, buyer, &root));
    }

    #[test]
    fn session_record_parsing() {
        let fields = vec![
            Token::FixedBytes([1u8; 32]), // key commitment
            Token::FixedBytes([2u8; 32]), // ciphertext root
            Token::FixedBytes([3u8; 32]), // file root
            Token::FixedBytes([0u8; 32]), // key
            Token::Address(Address([4u8; 20])),
            Token::Address(Address([5u8; 20])),
            Token::Uint(3),    // depth
            Token::Uint(2048), // slice length
            Token::Uint(4),    // slice count
            Token::Uint(1000), // timeout
            Token::Uint(60),   // timeout interval
            Token::Uint(1_000_000_000),
            Token::Uint(2), // phase
        ];
        let session = FileSaleSession::from_tokens(&fields).unwrap();
        assert_eq!(session.file_root, [3u8; 32]);
        assert_eq!(session.ciphertext_root, [2u8; 32]);
        assert_eq!(session.timeout, 1000);
        assert_eq!(session.phase, STAGE_ACCEPTED);
        assert!(FileSaleSession::from_tokens(&fields[..12]).is_err());
    }
}
