//! Perun state-channel file sale: off-chain signed state transitions with
//! the adjudicator as dispute fallback.
//!
//! The operator deploys the adjudicator, the ETH asset holder, the
//! file-sale app and the helper contract once per simulation; each
//! iteration opens a fresh channel (new nonce) in which any number of file
//! sales run as signed state updates.

pub mod buyer;
pub mod helper;
pub mod seller;

use std::path::PathBuf;

use log::debug;
use rand::RngCore;
use serde_json::{json, Value};

use crate::abi::{Address, Token};
use crate::chain::rpc::TransactionReceipt;
use crate::chain::Environment;
use crate::channel::{ChannelParams, ChannelState, SignedState};
use crate::contracts::{Contract, SoliditySourceSet};
use crate::crypto::Digest;
use crate::errors::BenchError;
use crate::merkle::MerkleTree;
use crate::protocols::fairswap::{slice_geometry, DEFAULT_SLICE_COUNT, DEFAULT_TIMEOUT};
use crate::protocols::{Protocol, ProtocolParams, ProtocolSpec, Role, Strategy};

const ADJUDICATOR_NAME: &str = "Adjudicator";
const ADJUDICATOR_SOURCE: &str = "perun-eth-contracts/contracts/Adjudicator.sol";
const ASSET_HOLDER_NAME: &str = "AssetHolderETH";
const ASSET_HOLDER_SOURCE: &str = "perun-eth-contracts/contracts/AssetHolderETH.sol";
const APP_NAME: &str = "FileSaleApp";
const APP_SOURCE: &str = "FileSaleApp.sol";
const HELPER_NAME: &str = "FileSaleHelper";
const HELPER_SOURCE: &str = "FileSaleHelper.sol";

/// Registry entry for the state-channel protocol.
pub fn spec() -> ProtocolSpec {
    ProtocolSpec {
        name: "StateChannelFileSale",
        build: |params| Ok(Box::new(StateChannelFileSale::new(params)?)),
        seller_strategies: &[
            "Faithful",
            "RootForging",
            "LeafForging",
            "NodeForging",
            "Grieving",
        ],
        buyer_strategies: &["Faithful"],
    }
}

/// Everything a state-channel strategy owns about its protocol instance;
/// handed over by value at construction so strategies never reference back
/// into the protocol.
#[derive(Debug, Clone)]
pub struct ChannelContext {
    /// Adjudicator contract handle.
    pub adjudicator: Contract,
    /// ETH asset holder contract handle.
    pub asset_holder: Contract,
    /// File-sale app contract handle.
    pub app: Contract,
    /// Parameters of this iteration's channel.
    pub channel_params: ChannelParams,
    /// Seller's funding deposit in wei.
    pub seller_deposit: u128,
    /// Buyer's funding deposit in wei.
    pub buyer_deposit: u128,
    /// Price per file sale in wei.
    pub price: u128,
    /// Phase timeout / challenge duration in seconds.
    pub timeout: u64,
    /// Number of file sales to run in the channel.
    pub iterations: u32,
    /// Slice count of the exchanged file.
    pub slice_count: usize,
}

impl ChannelContext {
    /// The channel identifier of this iteration.
    pub fn channel_id(&self) -> Digest {
        self.channel_params.channel_id()
    }
}

/// A state-channel disagreement: the party stops cooperating off-chain and
/// hands the dispute handler its recovery anchor plus, when available, a
/// prepared on-chain complaint.
#[derive(Debug)]
pub struct Disagreement {
    /// What went wrong.
    pub reason: String,
    /// The last commonly signed state.
    pub last_common: SignedState,
    /// A later state only we signed, when one exists.
    pub last_local: Option<ChannelState>,
    /// Complaint to execute during force-execution, when the encoded data
    /// itself is at fault.
    pub complaint: Option<Complaint>,
}

impl Disagreement {
    /// Disagreement without an on-chain complaint.
    pub fn new(reason: impl Into<String>, last_common: SignedState) -> Self {
        Self {
            reason: reason.into(),
            last_common,
            last_local: None,
            complaint: None,
        }
    }

    /// Disagreement with a prepared complaint.
    pub fn with_complaint(
        reason: impl Into<String>,
        last_common: SignedState,
        complaint: Complaint,
    ) -> Self {
        Self {
            reason: reason.into(),
            last_common,
            last_local: None,
            complaint: Some(complaint),
        }
    }
}

/// Outcome of one conducted file sale.
pub enum SaleOutcome {
    /// Both parties countersigned through to the new anchor.
    Completed,
    /// Off-chain cooperation broke down; escalate to the dispute handler.
    Disagreed(Disagreement),
}

/// A prepared on-chain complaint against the seller's encoding, submitted
/// to the app contract during force-execution.
#[derive(Debug, Clone)]
pub enum Complaint {
    /// The decrypted root-pack digest does not match the plain file root.
    Root {
        /// Digest of the encoded tree's root-pack leaf.
        leaf_digest: Digest,
        /// Proof of that leaf in the encoded tree.
        proof: Vec<Digest>,
    },
    /// A leaf pair does not fold to its committed digest.
    Leaf {
        /// Encoded-tree index of the committed digest leaf.
        index_out: usize,
        /// Encoded-tree index of the left input leaf.
        index_in: usize,
        /// Digest of the committed digest leaf.
        out_digest: Digest,
        /// 32-byte blocks of the left input leaf.
        in1_blocks: Vec<Digest>,
        /// 32-byte blocks of the right input leaf.
        in2_blocks: Vec<Digest>,
        /// Proof of the committed digest leaf.
        proof_out: Vec<Digest>,
        /// Proof of the left input leaf.
        proof_in1: Vec<Digest>,
    },
    /// Two pack digests do not fold to their committed parent.
    Node {
        /// Encoded-tree index of the committed digest leaf.
        index_out: usize,
        /// Encoded-tree index of the left input leaf.
        index_in: usize,
        /// Digest of the committed digest leaf.
        out_digest: Digest,
        /// Digest of the left input leaf.
        in1_digest: Digest,
        /// Digest of the right input leaf.
        in2_digest: Digest,
        /// Proof of the committed digest leaf.
        proof_out: Vec<Digest>,
        /// Proof of the left input leaf.
        proof_in1: Vec<Digest>,
    },
}

fn digests_token(digests: &[Digest]) -> Token {
    Token::Array(digests.iter().copied().map(Token::FixedBytes).collect())
}

impl Complaint {
    /// Submits the complaint to the app contract, referencing the
    /// registered anchor state and the seller's signature on it.
    pub fn execute(
        &self,
        environment: &Environment,
        app: &Contract,
        anchor: &SignedState,
    ) -> Result<TransactionReceipt, BenchError> {
        let params = anchor.params.to_token();
        let state = anchor.state.to_token();
        let seller_sig = Token::Bytes(anchor.sigs[crate::channel::SELLER].to_vec());
        match self {
            Self::Root { leaf_digest, proof } => environment.send_contract_transaction(
                app,
                "complainAboutRoot",
                &[
                    params,
                    state,
                    seller_sig,
                    Token::FixedBytes(*leaf_digest),
                    digests_token(proof),
                ],
                0,
                None,
            ),
            Self::Leaf {
                index_out,
                index_in,
                out_digest,
                in1_blocks,
                in2_blocks,
                proof_out,
                proof_in1,
            } => environment.send_contract_transaction(
                app,
                "complainAboutLeaf",
                &[
                    params,
                    state,
                    seller_sig,
                    Token::Uint(*index_out as u128),
                    Token::Uint(*index_in as u128),
                    Token::FixedBytes(*out_digest),
                    digests_token(in1_blocks),
                    digests_token(in2_blocks),
                    digests_token(proof_out),
                    digests_token(proof_in1),
                ],
                0,
                None,
            ),
            Self::Node {
                index_out,
                index_in,
                out_digest,
                in1_digest,
                in2_digest,
                proof_out,
                proof_in1,
            } => environment.send_contract_transaction(
                app,
                "complainAboutNode",
                &[
                    params,
                    state,
                    seller_sig,
                    Token::Uint(*index_out as u128),
                    Token::Uint(*index_in as u128),
                    Token::FixedBytes(*out_digest),
                    Token::FixedBytes(*in1_digest),
                    Token::FixedBytes(*in2_digest),
                    digests_token(proof_out),
                    digests_token(proof_in1),
                ],
                0,
                None,
            ),
        }
    }
}

/// The state-channel file-sale protocol.
pub struct StateChannelFileSale {
    params: ProtocolParams,
    slice_count: usize,
    timeout: u64,
    file_sale_iterations: u32,
    seller_deposit: u128,
    buyer_deposit: u128,
    contracts_dir: PathBuf,
    solc: String,
    adjudicator: Option<Contract>,
    asset_holder: Option<Contract>,
    app: Option<Contract>,
    helper_contract: Option<Contract>,
    channel_params: Option<ChannelParams>,
}

impl StateChannelFileSale {
    /// Validates parameters and prepares the protocol.
    pub fn new(params: ProtocolParams) -> Result<Self, BenchError> {
        params.ensure_known_keys(&[
            "slice_count",
            "timeout",
            "file_sale_iterations",
            "seller_deposit",
            "buyer_deposit",
            "contracts_dir",
            "solc",
        ])?;
        let slice_count = params.extra_u64("slice_count", DEFAULT_SLICE_COUNT as u64)?;
        let (slice_count, slice_length) = slice_geometry(params.file_size()?, slice_count)?;
        let timeout = params.extra_u64("timeout", DEFAULT_TIMEOUT)?;
        let file_sale_iterations = params.extra_u64("file_sale_iterations", 1)? as u32;
        if file_sale_iterations < 1 {
            return Err(BenchError::ProtocolInitialization(
                "file_sale_iterations must be >= 1".to_string(),
            ));
        }
        let seller_deposit = params.extra_u128("seller_deposit", 0)?;
        let buyer_deposit = params.extra_u128(
            "buyer_deposit",
            u128::from(file_sale_iterations) * params.price,
        )?;
        let contracts_dir = PathBuf::from(params.extra_str("contracts_dir", "contracts"));
        let solc = params.extra_str("solc", "solc");
        debug!("slice count: {slice_count}, slice length: {slice_length}");
        Ok(Self {
            params,
            slice_count,
            timeout,
            file_sale_iterations,
            seller_deposit,
            buyer_deposit,
            contracts_dir,
            solc,
            adjudicator: None,
            asset_holder: None,
            app: None,
            helper_contract: None,
            channel_params: None,
        })
    }

    fn contract<'a>(
        slot: &'a Option<Contract>,
        name: &str,
    ) -> Result<&'a Contract, BenchError> {
        slot.as_ref().ok_or_else(|| {
            BenchError::ProtocolRuntime(format!("accessing undeployed contract {name}"))
        })
    }

    fn context(&self) -> Result<ChannelContext, BenchError> {
        Ok(ChannelContext {
            adjudicator: Self::contract(&self.adjudicator, ADJUDICATOR_NAME)?.clone(),
            asset_holder: Self::contract(&self.asset_holder, ASSET_HOLDER_NAME)?.clone(),
            app: Self::contract(&self.app, APP_NAME)?.clone(),
            channel_params: self
                .channel_params
                .clone()
                .ok_or_else(|| {
                    BenchError::ProtocolRuntime("channel parameters not initialized".to_string())
                })?,
            seller_deposit: self.seller_deposit,
            buyer_deposit: self.buyer_deposit,
            price: self.params.price,
            timeout: self.timeout,
            iterations: self.file_sale_iterations,
            slice_count: self.slice_count,
        })
    }
}

impl Protocol for StateChannelFileSale {
    fn set_up_simulation(
        &mut self,
        operator: &Environment,
        _seller: Address,
        _buyer: Address,
    ) -> Result<(), BenchError> {
        debug!("compiling and deploying contracts");
        let mut sources = SoliditySourceSet::new();
        sources.add_source(self.contracts_dir.join(ADJUDICATOR_SOURCE));
        sources.add_source(self.contracts_dir.join(ASSET_HOLDER_SOURCE));
        sources.add_source(self.contracts_dir.join(APP_SOURCE));
        sources.add_source(self.contracts_dir.join(HELPER_SOURCE));
        sources.allow_path(&self.contracts_dir);
        let mut contracts = sources.compile(&self.solc)?;
        let mut take = |name: &str| {
            contracts.remove(name).ok_or_else(|| {
                BenchError::Configuration(format!("compilation did not yield {name}"))
            })
        };
        let mut adjudicator = take(ADJUDICATOR_NAME)?;
        let mut asset_holder = take(ASSET_HOLDER_NAME)?;
        let mut app = take(APP_NAME)?;
        let mut helper_contract = take(HELPER_NAME)?;

        operator.deploy_contract(&mut adjudicator, &[], 0)?;
        operator.deploy_contract(
            &mut asset_holder,
            &[Token::Address(adjudicator.address()?)],
            0,
        )?;
        operator.deploy_contract(&mut app, &[], 0)?;
        operator.deploy_contract(&mut helper_contract, &[], 0)?;

        self.adjudicator = Some(adjudicator);
        self.asset_holder = Some(asset_holder);
        self.app = Some(app);
        self.helper_contract = Some(helper_contract);
        Ok(())
    }

    fn set_up_iteration(
        &mut self,
        _operator: &Environment,
        seller: Address,
        buyer: Address,
    ) -> Result<(), BenchError> {
        let mut nonce_bytes = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        self.channel_params = Some(ChannelParams {
            challenge_duration: self.timeout,
            nonce: u128::from_be_bytes(nonce_bytes),
            participants: vec![seller, buyer],
            app: Self::contract(&self.app, APP_NAME)?.address()?,
            ledger_channel: true,
            virtual_channel: false,
        });
        Ok(())
    }

    fn snapshot(&self) -> Result<Value, BenchError> {
        Ok(json!({
            "adjudicator": Self::contract(&self.adjudicator, ADJUDICATOR_NAME)?.export(),
            "asset_holder": Self::contract(&self.asset_holder, ASSET_HOLDER_NAME)?.export(),
            "app": Self::contract(&self.app, APP_NAME)?.export(),
            "helper": Self::contract(&self.helper_contract, HELPER_NAME)?.export(),
            "channel_params": self.channel_params,
        }))
    }

    fn restore(&mut self, snapshot: &Value) -> Result<(), BenchError> {
        self.adjudicator = Some(Contract::import(&snapshot["adjudicator"])?);
        self.asset_holder = Some(Contract::import(&snapshot["asset_holder"])?);
        self.app = Some(Contract::import(&snapshot["app"])?);
        self.helper_contract = Some(Contract::import(&snapshot["helper"])?);
        self.channel_params = serde_json::from_value(snapshot["channel_params"].clone())
            .map_err(|err| {
                BenchError::ProtocolRuntime(format!("invalid channel params snapshot: {err}"))
            })?;
        Ok(())
    }

    fn make_strategy(&self, role: Role, name: &str) -> Result<Box<dyn Strategy>, BenchError> {
        let context = self.context()?;
        match role {
            Role::Seller => {
                let variant = seller::SellerVariant::parse(name)?;
                let data = self.params.read_file()?;
                let tree = MerkleTree::from_bytes(&data, self.slice_count)
                    .map_err(BenchError::ProtocolInitialization)?;
                Ok(Box::new(seller::StateChannelSeller::new(
                    context, tree, variant,
                )))
            }
            Role::Buyer => {
                if name != "Faithful" {
                    return Err(BenchError::Configuration(format!(
                        "unknown buyer strategy '{name}' for StateChannelFileSale"
                    )));
                }
                let data = self.params.read_file()?;
                let tree = MerkleTree::from_bytes(&data, self.slice_count)
                    .map_err(BenchError::ProtocolInitialization)?;
                Ok(Box::new(buyer::StateChannelBuyer::new(
                    context,
                    tree.digest(),
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::io::Write;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_file(size: usize) -> PathBuf {
        let unique = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let path = std::env::temp_dir().join(format!("fairbench_channel_{unique}.bin"));
        let data: Vec<u8> = (0..size).map(|i| i as u8).collect();
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&data)
            .unwrap();
        path
    }

    #[test]
    fn buyer_deposit_defaults_to_total_price() {
        let path = temp_file(8192);
        let mut extra = BTreeMap::new();
        extra.insert("file_sale_iterations".to_string(), "3".to_string());
        let protocol = StateChannelFileSale::new(ProtocolParams {
            filename: path.clone(),
            price: 1_000_000_000,
            extra,
        })
        .unwrap();
        assert_eq!(protocol.buyer_deposit, 3_000_000_000);
        assert_eq!(protocol.seller_deposit, 0);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn rejects_zero_iterations() {
        let path = temp_file(256);
        let mut extra = BTreeMap::new();
        extra.insert("file_sale_iterations".to_string(), "0".to_string());
        let result = StateChannelFileSale::new(ProtocolParams {
            filename: path.clone(),
            price: 1,
            extra,
        });
        assert!(matches!(
            result,
            Err(BenchError::ProtocolInitialization(_))
        ));
        std::fs::remove_file(&path).unwrap();
    }
}
