//! One-shot Fairswap: a fresh `FileSale` contract per exchange.
//!
//! The seller deploys the contract with the file and ciphertext commitments
//! baked in as constructor arguments and ships the encoded tree off-chain;
//! the buyer pays into the contract, waits for the key and, if decoding
//! exposes an inconsistency, submits the matching complaint proof.

use std::path::PathBuf;
use std::time::Duration;

use log::{debug, warn};
use serde_json::{json, Value};

use crate::abi::{Address, Token};
use crate::chain::{Environment, WaitResult};
use crate::contracts::{Contract, ContractAbi, SoliditySourceSet};
use crate::crypto::{crypt, keccak, random_key, Digest, B032};
use crate::encoding::{
    decode, encode, encode_forge_first_leaf, encode_forge_first_leaf_first_hash, MismatchKind,
};
use crate::errors::BenchError;
use crate::merkle::{mt2obj_hex, obj2mt_hex, MerkleTree};
use crate::p2p::JsonObjectStream;
use crate::protocols::{Protocol, ProtocolParams, ProtocolSpec, Role, Strategy};

/// Default number of file slices.
pub const DEFAULT_SLICE_COUNT: usize = 4;
/// Default phase timeout in seconds.
pub const DEFAULT_TIMEOUT: u64 = 60;

/// Contract stage once the buyer has paid.
const STAGE_ACCEPTED: u128 = 2;

/// Fixed gas limit for `revealKey`; estimation is skipped because the
/// seller must not stall on a mis-estimating node at this step.
const REVEAL_KEY_GAS: u64 = 200_000;

const CONTRACT_NAME: &str = "FileSale";
const CONTRACT_SOURCE: &str = "FileSale.sol";

/// Registry entry for the one-shot protocol.
pub fn spec() -> ProtocolSpec {
    ProtocolSpec {
        name: "Fairswap",
        build: |params| Ok(Box::new(Fairswap::new(params)?)),
        seller_strategies: &["Faithful", "RootForging", "LeafForging", "NodeForging"],
        buyer_strategies: &["Faithful"],
    }
}

/// Validated slice geometry shared by the Fairswap protocols.
pub(crate) fn slice_geometry(
    file_size: u64,
    slice_count: u64,
) -> Result<(usize, usize), BenchError> {
    let slice_count = slice_count as usize;
    if slice_count < 2 || !slice_count.is_power_of_two() {
        return Err(BenchError::ProtocolInitialization(format!(
            "slice_count must be a power of 2 >= 2, got {slice_count}"
        )));
    }
    if file_size % slice_count as u64 != 0 {
        return Err(BenchError::ProtocolInitialization(format!(
            "file size {file_size} is not divisible into {slice_count} slices"
        )));
    }
    let slice_length = (file_size / slice_count as u64) as usize;
    if slice_length % 32 != 0 {
        return Err(BenchError::ProtocolInitialization(format!(
            "slice length must be a multiple of 32 bytes, got {slice_length}"
        )));
    }
    Ok((slice_count, slice_length))
}

/// The one-shot Fairswap protocol.
pub struct Fairswap {
    params: ProtocolParams,
    slice_count: usize,
    slice_length: usize,
    timeout: u64,
    contracts_dir: PathBuf,
    solc: String,
    contract: Option<Contract>,
}

impl Fairswap {
    /// Validates parameters and prepares the protocol.
    pub fn new(params: ProtocolParams) -> Result<Self, BenchError> {
        params.ensure_known_keys(&["slice_count", "timeout", "contracts_dir", "solc"])?;
        let slice_count = params.extra_u64("slice_count", DEFAULT_SLICE_COUNT as u64)?;
        let timeout = params.extra_u64("timeout", DEFAULT_TIMEOUT)?;
        let (slice_count, slice_length) = slice_geometry(params.file_size()?, slice_count)?;
        let contracts_dir = PathBuf::from(params.extra_str("contracts_dir", "contracts"));
        let solc = params.extra_str("solc", "solc");
        debug!(
            "initialized Fairswap with slice_count={slice_count} slice_length={slice_length} \
             timeout={timeout}"
        );
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
            BenchError::ProtocolRuntime("FileSale contract not compiled".to_string())
        })
    }
}

impl Protocol for Fairswap {
    fn set_up_simulation(
        &mut self,
        _operator: &Environment,
        _seller: Address,
        _buyer: Address,
    ) -> Result<(), BenchError> {
        let mut sources = SoliditySourceSet::new();
        sources.add_source(self.contracts_dir.join(CONTRACT_SOURCE));
        sources.allow_path(&self.contracts_dir);
        let mut contracts = sources.compile(&self.solc)?;
        self.contract = Some(contracts.remove(CONTRACT_NAME).ok_or_else(|| {
            BenchError::Configuration(format!("{CONTRACT_SOURCE} does not define {CONTRACT_NAME}"))
        })?);
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
        match role {
            Role::Seller => {
                let variant = SellerVariant::parse(name)?;
                Ok(Box::new(FairswapSeller {
                    filename: self.params.filename.clone(),
                    price: self.params.price,
                    slice_count: self.slice_count,
                    slice_length: self.slice_length,
                    timeout: self.timeout,
                    contract: self.contract()?.clone(),
                    variant,
                }))
            }
            Role::Buyer => {
                if name != "Faithful" {
                    return Err(BenchError::Configuration(format!(
                        "unknown buyer strategy '{name}' for Fairswap"
                    )));
                }
                // Hash the expected file up front so it is not billed to
                // the measured run.
                let data = self.params.read_file()?;
                let tree = MerkleTree::from_bytes(&data, self.slice_count)
                    .map_err(BenchError::ProtocolInitialization)?;
                Ok(Box::new(FairswapBuyer {
                    price: self.params.price,
                    timeout: self.timeout,
                    expected_plain_digest: tree.digest(),
                }))
            }
        }
    }
}

/// Seller behavior selector; adversarial variants replace only the encode
/// step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SellerVariant {
    /// Honest encoding.
    Faithful,
    /// Encodes under an independent key; the committed key decrypts
    /// nothing useful.
    RootForging,
    /// Zeroes the first source leaf before masking.
    LeafForging,
    /// Additionally fixes up the first pack digest to match the forged
    /// leaf.
    NodeForging,
}

impl SellerVariant {
    fn parse(name: &str) -> Result<Self, BenchError> {
        match name {
            "Faithful" => Ok(Self::Faithful),
            "RootForging" => Ok(Self::RootForging),
            "LeafForging" => Ok(Self::LeafForging),
            "NodeForging" => Ok(Self::NodeForging),
            other => Err(BenchError::Configuration(format!(
                "unknown seller strategy '{other}' for Fairswap"
            ))),
        }
    }

    /// Produces the encoded tree for this variant.
    pub fn encode_file(&self, tree: &MerkleTree, key: &Digest) -> Result<MerkleTree, BenchError> {
        let result = match self {
            Self::Faithful => encode(tree, key),
            Self::RootForging => encode(tree, &random_key()),
            Self::LeafForging => encode_forge_first_leaf(tree, key),
            Self::NodeForging => encode_forge_first_leaf_first_hash(tree, key),
        };
        result.map_err(BenchError::ProtocolRuntime)
    }
}

struct FairswapSeller {
    filename: PathBuf,
    price: u128,
    slice_count: usize,
    slice_length: usize,
    timeout: u64,
    contract: Contract,
    variant: SellerVariant,
}

impl FairswapSeller {
    fn contract_timeout(
        &self,
        environment: &Environment,
        contract: &Contract,
    ) -> Result<u64, BenchError> {
        Ok(environment.call_contract(contract, "timeout", &[])?[0].as_uint()? as u64)
    }

    fn refund(&self, environment: &Environment, contract: &Contract) {
        if let Err(err) = environment.send_contract_transaction(contract, "refund", &[], 0, None) {
            warn!("refund failed: {err}");
        }
    }
}

impl Strategy for FairswapSeller {
    fn run(
        &mut self,
        environment: &Environment,
        p2p: &mut JsonObjectStream,
        opposite: Address,
    ) -> Result<(), BenchError> {
        // Phase 1: encode the file and deploy the contract.
        let data = std::fs::read(&self.filename)
            .map_err(|err| BenchError::ProtocolRuntime(format!("reading file: {err}")))?;
        let tree = MerkleTree::from_bytes(&data, self.slice_count)
            .map_err(BenchError::ProtocolInitialization)?;
        let key = random_key();
        let encoded = self.variant.encode_file(&tree, &key)?;

        let mut contract = self.contract.clone();
        let depth = (self.slice_count * 2).trailing_zeros() as u128;
        environment.deploy_contract(
            &mut contract,
            &[
                Token::Address(opposite),
                Token::Uint(depth),
                Token::Uint(self.slice_length as u128),
                Token::Uint(self.slice_count as u128),
                Token::Uint(self.price),
                Token::FixedBytes(keccak(&key)),
                Token::FixedBytes(encoded.digest()),
                Token::FixedBytes(tree.digest()),
                Token::Uint(u128::from(self.timeout)),
            ],
            0,
        )?;

        p2p.send_object(&json!({
            "contract_address": contract.address()?.to_hex(),
            "contract_abi": contract.abi().raw(),
            "tree": mt2obj_hex(&encoded),
        }))
        .map_err(BenchError::from)?;

        // Phase 2: wait for the buyer to accept.
        debug!("waiting for accept");
        let deadline = self.contract_timeout(environment, &contract)? + 1;
        let accepted = || {
            Ok(environment.call_contract(&contract, "phase", &[])?[0].as_uint()? == STAGE_ACCEPTED)
        };
        if environment.wait(Some(deadline), Some(&accepted))? == WaitResult::Timeout {
            debug!("timeout waiting for accept, requesting refund");
            self.refund(environment, &contract);
            return Ok(());
        }
        debug!("accepted");

        // Phase 3: reveal the key.
        environment.send_contract_transaction(
            &contract,
            "revealKey",
            &[Token::FixedBytes(key)],
            0,
            Some(REVEAL_KEY_GAS),
        )?;

        // Phase 5: wait for the payout (self-destruct) or claim it.
        debug!("waiting for payout or timeout");
        let deadline = self.contract_timeout(environment, &contract)? + 1;
        let address = contract.address()?;
        let destroyed = || environment.code_is_empty(address);
        match environment.wait(Some(deadline), Some(&destroyed))? {
            WaitResult::Condition => {
                debug!("contract has been destroyed, quitting");
            }
            WaitResult::Timeout => {
                debug!("timeout reached, requesting payout");
                self.refund(environment, &contract);
            }
        }
        Ok(())
    }
}

struct FairswapBuyer {
    price: u128,
    timeout: u64,
    expected_plain_digest: Digest,
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

impl Strategy for FairswapBuyer {
    fn run(
        &mut self,
        environment: &Environment,
        p2p: &mut JsonObjectStream,
        _opposite: Address,
    ) -> Result<(), BenchError> {
        // Phase 1: receive the seller's initialization.
        let received = p2p
            .receive_object(Some(Duration::from_secs(self.timeout * 2)))
            .map_err(BenchError::from)?;
        let Some((init, _)) = received else {
            return Err(BenchError::ProtocolRuntime(
                "seller closed the stream before initialization".to_string(),
            ));
        };
        let encoded = obj2mt_hex(&init["tree"]).map_err(BenchError::ProtocolRuntime)?;
        let abi = ContractAbi::from_value(&init["contract_abi"])?;
        let address: Address = init["contract_address"]
            .as_str()
            .ok_or_else(|| BenchError::ProtocolRuntime("initialization without address".into()))?
            .parse()
            .map_err(BenchError::ProtocolRuntime)?;
        let contract = Contract::at("FileSale", abi, address);

        // Phase 2: verify commitments, then accept.
        let file_root = environment.call_contract(&contract, "fileRoot", &[])?[0].as_fixed_bytes()?;
        if file_root != self.expected_plain_digest {
            debug!("wrong plain file hash, aborting");
            return Ok(());
        }
        let ciphertext_root =
            environment.call_contract(&contract, "ciphertextRoot", &[])?[0].as_fixed_bytes()?;
        if ciphertext_root != encoded.digest() {
            debug!("wrong ciphertext hash, aborting");
            return Ok(());
        }

        environment.send_contract_transaction(&contract, "accept", &[], self.price, None)?;

        // Phase 3: wait for the key revelation.
        debug!("waiting for key revelation");
        let deadline = environment.call_contract(&contract, "timeout", &[])?[0].as_uint()? as u64;
        let revealed =
            || Ok(environment.call_contract(&contract, "key", &[])?[0].as_fixed_bytes()? != B032);
        if environment.wait(Some(deadline + 1), Some(&revealed))? == WaitResult::Timeout {
            debug!("timeout waiting for key, requesting refund");
            environment.send_contract_transaction(&contract, "refund", &[], 0, None)?;
            return Ok(());
        }
        let key = environment.call_contract(&contract, "key", &[])?[0].as_fixed_bytes()?;
        debug!("key revealed");

        // Phase 4: decode and complain if necessary.
        let root_leaf = encoded.leaf_count() - 2;
        if crypt(encoded.leaf_data(root_leaf), root_leaf, &key) != self.expected_plain_digest {
            debug!("decrypted root does not match plain file hash, complaining about root");
            environment.send_contract_transaction(
                &contract,
                "complainAboutRoot",
                &[
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
            // Not calling `noComplain`: a rational buyer gains nothing by
            // paying for it; the seller's timeout branch releases payment.
            return Ok(());
        };

        match error.kind {
            MismatchKind::Leaf => {
                debug!("leaf digest mismatch, complaining about leaf");
                environment.send_contract_transaction(
                    &contract,
                    "complainAboutLeaf",
                    &[
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
                debug!("node digest mismatch, complaining about node");
                environment.send_contract_transaction(
                    &contract,
                    "complainAboutNode",
                    &[
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_file(size: usize) -> PathBuf {
        let unique = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let path = std::env::temp_dir().join(format!("fairbench_fairswap_{unique}.bin"));
        let data: Vec<u8> = (0..size).map(|i| i as u8).collect();
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&data)
            .unwrap();
        path
    }

    fn params(filename: PathBuf) -> ProtocolParams {
        ProtocolParams {
            filename,
            price: 1_000_000_000,
            extra: Default::default(),
        }
    }

    #[test]
    fn geometry_validation() {
        assert!(slice_geometry(8192, 4).is_ok());
        assert!(slice_geometry(8192, 3).is_err());
        assert!(slice_geometry(8192, 0).is_err());
        assert!(slice_geometry(8191, 4).is_err());
        // 8 slices of 16 bytes: not 32-aligned.
        assert!(slice_geometry(128, 8).is_err());
    }

    #[test]
    fn protocol_construction_checks_file() {
        let path = temp_file(8192);
        let protocol = Fairswap::new(params(path.clone())).unwrap();
        assert_eq!(protocol.slice_count, 4);
        assert_eq!(protocol.slice_length, 2048);
        std::fs::remove_file(&path).unwrap();

        let missing = Fairswap::new(params(PathBuf::from("/nonexistent/data.bin")));
        assert!(matches!(
            missing,
            Err(BenchError::ProtocolInitialization(_))
        ));
    }

    #[test]
    fn unknown_parameter_is_rejected() {
        let path = temp_file(256);
        let mut bad = params(path.clone());
        bad.extra.insert("slices".to_string(), "4".to_string());
        assert!(matches!(
            Fairswap::new(bad),
            Err(BenchError::Configuration(_))
        ));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn seller_variants_forge_as_advertised() {
        let data: Vec<u8> = (0..1024u32).map(|i| i as u8).collect();
        let tree = MerkleTree::from_bytes(&data, 4).unwrap();
        let key = keccak(b"variant test key");

        let honest = SellerVariant::Faithful.encode_file(&tree, &key).unwrap();
        let (_, errors) = decode(&honest, &key).unwrap();
        assert!(errors.is_empty());

        let leaf_forged = SellerVariant::LeafForging.encode_file(&tree, &key).unwrap();
        let (_, errors) = decode(&leaf_forged, &key).unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, MismatchKind::Leaf);

        let node_forged = SellerVariant::NodeForging.encode_file(&tree, &key).unwrap();
        let (_, errors) = decode(&node_forged, &key).unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, MismatchKind::Node);

        // Root forging: committed key decrypts garbage everywhere.
        let root_forged = SellerVariant::RootForging.encode_file(&tree, &key).unwrap();
        let root_leaf = root_forged.leaf_count() - 2;
        assert_ne!(
            crypt(root_forged.leaf_data(root_leaf), root_leaf, &key),
            tree.digest().to_vec()
        );
    }

    #[test]
    fn strategy_lookup() {
        let path = temp_file(256);
        let mut protocol = Fairswap::new(params(path.clone())).unwrap();
        // Strategies require a compiled contract for the seller side.
        let abi = ContractAbi::from_value(&serde_json::json!([])).unwrap();
        protocol.contract = Some(Contract::new(CONTRACT_NAME, abi, vec![0x60]));
        assert!(protocol.make_strategy(Role::Seller, "LeafForging").is_ok());
        assert!(protocol.make_strategy(Role::Seller, "Gracious").is_err());
        assert!(protocol.make_strategy(Role::Buyer, "Faithful").is_ok());
        assert!(protocol.make_strategy(Role::Buyer, "RootForging").is_err());
        std::fs::remove_file(&path).unwrap();
    }
}
