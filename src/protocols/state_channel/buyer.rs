//! Buyer side of the state-channel file sale.
//!
//! The buyer requests sales, validates every proposed state before
//! countersigning, and decodes each delivery. A failed delivery turns into
//! a disagreement whose dispute loop registers the recovery anchor,
//! executes the prepared complaint during force-execution and concludes
//! once the adjudicator times out.

use std::time::Duration;

use log::{debug, error, warn};
use serde_json::json;

use crate::abi::Address;
use crate::chain::Environment;
use crate::channel::{ChannelState, DisputePhase, SignedState, BUYER, SELLER};
use crate::crypto::{crypt, keccak, Digest};
use crate::encoding::{decode, MismatchKind};
use crate::errors::BenchError;
use crate::file_sale::{FileSaleAppState, FileSalePhase};
use crate::merkle::obj2mt_hex;
use crate::p2p::JsonObjectStream;
use crate::protocols::state_channel::helper::{
    deadline_passed, message_action, message_digest, message_signature, receive_message,
    ChannelHelper,
};
use crate::protocols::state_channel::{ChannelContext, Complaint, Disagreement, SaleOutcome};
use crate::protocols::Strategy;

/// The buyer strategy.
pub struct StateChannelBuyer {
    ctx: ChannelContext,
    expected_plain_digest: Digest,
}

impl StateChannelBuyer {
    /// Builds the strategy with its owned context and the precomputed
    /// digest of the expected file.
    pub fn new(ctx: ChannelContext, expected_plain_digest: Digest) -> Self {
        Self {
            ctx,
            expected_plain_digest,
        }
    }

    fn receive_timeout(&self) -> Duration {
        Duration::from_secs(self.ctx.timeout * 2)
    }

    fn open_channel(
        &self,
        environment: &Environment,
        p2p: &mut JsonObjectStream,
        opposite: Address,
    ) -> Result<Option<SignedState>, BenchError> {
        let helper = ChannelHelper::new(&self.ctx);
        let state = helper.initial_state()?;
        let my_sig = state.sign(environment.wallet())?;
        p2p.send_object(&json!({
            "action": "open",
            "signature": hex::encode(my_sig),
        }))
        .map_err(BenchError::from)?;

        let Some(message) = receive_message(p2p, self.receive_timeout())? else {
            warn!("seller never opened the channel");
            return Ok(None);
        };
        if message_action(&message)? != "open" {
            return Err(BenchError::ProtocolRuntime(
                "expected an open message".to_string(),
            ));
        }
        let seller_sig = message_signature(&message)?;
        if !state.verify_signature(&seller_sig, opposite)? {
            error!("seller's opening signature invalid");
            return Ok(None);
        }

        Ok(Some(SignedState {
            params: self.ctx.channel_params.clone(),
            state,
            sigs: [seller_sig, my_sig],
        }))
    }

    fn fund_channel(&self, environment: &Environment) -> Result<(), BenchError> {
        let helper = ChannelHelper::new(&self.ctx);
        if self.ctx.buyer_deposit > 0 {
            let id = helper.funding_id(environment.wallet_address());
            helper.deposit(environment, &id, self.ctx.buyer_deposit)?;
        }
        Ok(())
    }

    fn conduct_file_sale(
        &self,
        environment: &Environment,
        p2p: &mut JsonObjectStream,
        opposite: Address,
        anchor: &mut SignedState,
        iteration: u32,
    ) -> Result<SaleOutcome, BenchError> {
        debug!("requesting file (iteration {iteration})");
        p2p.send_object(&json!({
            "action": "request",
            "file_root": hex::encode(self.expected_plain_digest),
        }))
        .map_err(BenchError::from)?;

        // Phase 1: the seller's initialization.
        let Some(init) = receive_message(p2p, self.receive_timeout())? else {
            return Ok(SaleOutcome::Disagreed(Disagreement::new(
                "seller did not initialize the sale",
                anchor.clone(),
            )));
        };
        if message_action(&init)? != "initialize" {
            return Err(BenchError::ProtocolRuntime(format!(
                "expected initialize, got {}",
                message_action(&init)?
            )));
        }
        let encoded = obj2mt_hex(&init["tree"]).map_err(BenchError::ProtocolRuntime)?;
        let file_root = message_digest(&init, "file_root")?;
        let ciphertext_root = message_digest(&init, "ciphertext_root")?;
        let key_commitment = message_digest(&init, "key_commitment")?;
        let price: u128 = init["price"]
            .as_str()
            .ok_or_else(|| BenchError::ProtocolRuntime("initialize without price".to_string()))?
            .parse()
            .map_err(|_| BenchError::ProtocolRuntime("unreadable price".to_string()))?;

        // Phase 2: validate everything before countersigning.
        if file_root != self.expected_plain_digest {
            return Ok(SaleOutcome::Disagreed(Disagreement::new(
                "announced file root does not match the requested file",
                anchor.clone(),
            )));
        }
        if ciphertext_root != encoded.digest() {
            return Ok(SaleOutcome::Disagreed(Disagreement::new(
                "announced ciphertext root does not match the transmitted tree",
                anchor.clone(),
            )));
        }
        if price != self.ctx.price {
            return Ok(SaleOutcome::Disagreed(Disagreement::new(
                "announced price deviates from the agreed price",
                anchor.clone(),
            )));
        }

        let app = FileSaleAppState::accepted(file_root, ciphertext_root, key_commitment, price);
        let proposed = ChannelState {
            channel_id: anchor.state.channel_id,
            version: anchor.state.version + 1,
            outcome: anchor.state.outcome.clone(),
            app_data: app.encode_abi(),
            is_final: false,
        };
        anchor.state.check_successor(&proposed)?;
        let init_sig = message_signature(&init)?;
        if !proposed.verify_signature(&init_sig, opposite)? {
            return Ok(SaleOutcome::Disagreed(Disagreement::new(
                "init signature mismatch",
                anchor.clone(),
            )));
        }
        debug!("init signature validated");
        let accept_sig = proposed.sign(environment.wallet())?;
        anchor.state = proposed;
        anchor.sigs = [init_sig, accept_sig];
        p2p.send_object(&json!({
            "action": "accept",
            "signature": hex::encode(accept_sig),
        }))
        .map_err(BenchError::from)?;

        // Phase 3: the key revelation.
        debug!("waiting for key revelation");
        let Some(reveal) = receive_message(p2p, self.receive_timeout())? else {
            return Ok(SaleOutcome::Disagreed(Disagreement::new(
                "seller did not reveal the key",
                anchor.clone(),
            )));
        };
        if message_action(&reveal)? != "reveal_key" {
            return Err(BenchError::ProtocolRuntime(format!(
                "expected reveal_key, got {}",
                message_action(&reveal)?
            )));
        }
        let key = message_digest(&reveal, "key")?;
        let reveal_sig = message_signature(&reveal)?;

        if ChannelHelper::buyer_share(&anchor.state) < price {
            return Err(BenchError::ProtocolRuntime(
                "channel funds do not cover the price".to_string(),
            ));
        }
        let mut outcome = anchor.state.outcome.clone();
        outcome.balances[0][SELLER] += price;
        outcome.balances[0][BUYER] -= price;
        let revealed = ChannelState {
            channel_id: anchor.state.channel_id,
            version: anchor.state.version + 1,
            outcome,
            app_data: app.with_revealed_key(key).encode_abi(),
            is_final: false,
        };
        if !revealed.verify_signature(&reveal_sig, opposite)? {
            return Ok(SaleOutcome::Disagreed(Disagreement::new(
                "key revelation signature mismatch",
                anchor.clone(),
            )));
        }
        if keccak(&key) != key_commitment {
            // The revealed key cannot even open the commitment; there is
            // nothing to prove on chain, timing out the dispute suffices.
            return Ok(SaleOutcome::Disagreed(Disagreement::new(
                "key does not match commitment",
                anchor.clone(),
            )));
        }

        // From here on the seller's reveal signature is valid, so the
        // KEY_REVEALED state is commonly signable: it becomes the dispute
        // anchor for encoding complaints, making the registered app state
        // carry the key the complaint is verified against.
        let confirm_sig = revealed.sign(environment.wallet())?;
        let revealed_anchor = SignedState {
            params: anchor.params.clone(),
            state: revealed.clone(),
            sigs: [reveal_sig, confirm_sig],
        };

        let root_leaf = encoded.leaf_count() - 2;
        if crypt(encoded.leaf_data(root_leaf), root_leaf, &key) != self.expected_plain_digest {
            return Ok(SaleOutcome::Disagreed(Disagreement::with_complaint(
                "decrypted plain file hash does not match",
                revealed_anchor,
                Complaint::Root {
                    leaf_digest: encoded.leaf_digest(root_leaf),
                    proof: encoded.proof(root_leaf).map_err(BenchError::ProtocolRuntime)?,
                },
            )));
        }

        let (_, errors) =
            decode(&encoded, &key).map_err(|err| BenchError::ProtocolRuntime(err.to_string()))?;
        if let Some(mismatch) = errors.last() {
            let proof_out = encoded
                .proof(mismatch.index_out)
                .map_err(BenchError::ProtocolRuntime)?;
            let proof_in1 = encoded
                .proof(mismatch.index_in)
                .map_err(BenchError::ProtocolRuntime)?;
            let complaint = match mismatch.kind {
                MismatchKind::Leaf => Complaint::Leaf {
                    index_out: mismatch.index_out,
                    index_in: mismatch.index_in,
                    out_digest: encoded.leaf_digest(mismatch.index_out),
                    in1_blocks: encoded.leaf_data_blocks(mismatch.index_in),
                    in2_blocks: encoded.leaf_data_blocks(mismatch.index_in + 1),
                    proof_out,
                    proof_in1,
                },
                MismatchKind::Node => Complaint::Node {
                    index_out: mismatch.index_out,
                    index_in: mismatch.index_in,
                    out_digest: encoded.leaf_digest(mismatch.index_out),
                    in1_digest: encoded.leaf_digest(mismatch.index_in),
                    in2_digest: encoded.leaf_digest(mismatch.index_in + 1),
                    proof_out,
                    proof_in1,
                },
            };
            let reason = match mismatch.kind {
                MismatchKind::Leaf => "leaf hash mismatch",
                MismatchKind::Node => "node hash mismatch",
            };
            return Ok(SaleOutcome::Disagreed(Disagreement::with_complaint(
                reason,
                revealed_anchor,
                complaint,
            )));
        }

        // Phase 4: confirm; the countersigned state becomes the anchor.
        debug!("file successfully decrypted");
        *anchor = revealed_anchor;
        p2p.send_object(&json!({
            "action": "confirm",
            "signature": hex::encode(confirm_sig),
        }))
        .map_err(BenchError::from)?;
        Ok(SaleOutcome::Completed)
    }

    fn close_channel(
        &self,
        environment: &Environment,
        p2p: &mut JsonObjectStream,
        anchor: &mut SignedState,
    ) -> Result<(), BenchError> {
        let helper = ChannelHelper::new(&self.ctx);
        // Watch for the seller's concludeFinal before announcing closure.
        let mut filter = helper.channel_update_filter(environment)?;

        anchor.state.is_final = true;
        anchor.sigs[BUYER] = anchor.state.sign(environment.wallet())?;
        p2p.send_object(&json!({
            "action": "close",
            "signature": hex::encode(anchor.sigs[BUYER]),
        }))
        .map_err(BenchError::from)?;

        let channel_id = self.ctx.channel_id();
        loop {
            match filter.next()? {
                Some(entry) if entry.topics.len() > 1 && entry.topics[1] == channel_id => break,
                Some(_) => continue,
                None => {
                    warn!("no conclusion observed before the event timeout");
                    break;
                }
            }
        }
        helper.withdraw_holdings(environment)
    }

    fn force_complaint(
        &self,
        environment: &Environment,
        helper: &ChannelHelper<'_>,
        anchor: &SignedState,
        registered: &ChannelState,
        registered_app: &FileSaleAppState,
        complaint: &Complaint,
    ) -> Result<(), BenchError> {
        complaint.execute(environment, &self.ctx.app, anchor)?;

        if ChannelHelper::seller_share(registered) < self.ctx.price {
            return Err(BenchError::ProtocolRuntime(
                "registered state does not carry the price to revert".to_string(),
            ));
        }
        let mut outcome = registered.outcome.clone();
        outcome.balances[0][SELLER] -= self.ctx.price;
        outcome.balances[0][BUYER] += self.ctx.price;
        let successor = ChannelState {
            channel_id: registered.channel_id,
            version: registered.version + 1,
            outcome,
            app_data: registered_app.with_successful_complaint().encode_abi(),
            is_final: false,
        };
        let signature = successor.sign(environment.wallet())?;
        helper.progress(environment, registered, &successor, BUYER, &signature)
    }

    fn dispute(
        &self,
        environment: &Environment,
        disagreement: &Disagreement,
    ) -> Result<(), BenchError> {
        let helper = ChannelHelper::new(&self.ctx);
        let anchor = &disagreement.last_common;
        let mut filter = helper.channel_update_filter(environment)?;
        let mut last_state = anchor.state.clone();
        let mut complaint_pending = disagreement.complaint.is_some();
        let mut concluded = false;

        while !concluded {
            let dispute = helper.dispute(environment)?;
            let (updated, registered_app) =
                helper.update_last_state(environment, &mut filter, last_state)?;
            last_state = updated;
            let incentive =
                ChannelHelper::buyer_share(&last_state) > 0 || complaint_pending;

            match dispute.phase {
                DisputePhase::Dispute => {
                    if (ChannelHelper::buyer_share(&anchor.state) > 0 || complaint_pending)
                        && anchor.state.version > dispute.version
                    {
                        helper.register(environment, anchor)?;
                        continue;
                    }
                    if !dispute.registered() {
                        if !incentive {
                            break;
                        }
                    } else if incentive
                        && deadline_passed(
                            environment,
                            dispute.timeout + dispute.challenge_duration + 1,
                        )?
                    {
                        if complaint_pending && registered_app.phase == FileSalePhase::KeyRevealed {
                            if let Some(complaint) = &disagreement.complaint {
                                self.force_complaint(
                                    environment,
                                    &helper,
                                    anchor,
                                    &last_state,
                                    &registered_app,
                                    complaint,
                                )?;
                                complaint_pending = false;
                                continue;
                            }
                        }
                        helper.conclude(environment, &last_state)?;
                        continue;
                    }
                }
                DisputePhase::ForceExec => {
                    if complaint_pending && registered_app.phase == FileSalePhase::KeyRevealed {
                        if let Some(complaint) = &disagreement.complaint {
                            self.force_complaint(
                                environment,
                                &helper,
                                anchor,
                                &last_state,
                                &registered_app,
                                complaint,
                            )?;
                            complaint_pending = false;
                            continue;
                        }
                    }
                    if incentive && deadline_passed(environment, dispute.timeout + 1)? {
                        helper.conclude(environment, &last_state)?;
                        continue;
                    }
                }
                DisputePhase::Concluded => {
                    concluded = true;
                    continue;
                }
            }
            std::thread::sleep(Duration::from_secs(1));
        }

        if concluded {
            helper.withdraw_holdings(environment)?;
        }
        Ok(())
    }
}

impl Strategy for StateChannelBuyer {
    fn run(
        &mut self,
        environment: &Environment,
        p2p: &mut JsonObjectStream,
        opposite: Address,
    ) -> Result<(), BenchError> {
        let Some(mut anchor) = self.open_channel(environment, p2p, opposite)? else {
            return Ok(());
        };

        self.fund_channel(environment)?;

        for iteration in 1..=self.ctx.iterations {
            if self.ctx.iterations > 1 {
                debug!("starting file sale iteration {iteration}");
            }
            match self.conduct_file_sale(environment, p2p, opposite, &mut anchor, iteration)? {
                SaleOutcome::Completed => {}
                SaleOutcome::Disagreed(disagreement) => {
                    debug!("channel disagreement: {}", disagreement.reason);
                    self.dispute(environment, &disagreement)?;
                    return Ok(());
                }
            }
        }

        self.close_channel(environment, p2p, &mut anchor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::Address;
    use crate::channel::{Allocation, ChannelParams};
    use crate::contracts::{Contract, ContractAbi};
    use crate::crypto::B032;

    fn dummy_contract(name: &str) -> Contract {
        let abi = ContractAbi::from_value(&serde_json::json!([])).unwrap();
        Contract::at(name, abi, Address([0xeeu8; 20]))
    }

    fn context() -> ChannelContext {
        ChannelContext {
            adjudicator: dummy_contract("Adjudicator"),
            asset_holder: dummy_contract("AssetHolderETH"),
            app: dummy_contract("FileSaleApp"),
            channel_params: ChannelParams {
                challenge_duration: 10,
                nonce: 7,
                participants: vec![Address([1u8; 20]), Address([2u8; 20])],
                app: Address([3u8; 20]),
                ledger_channel: true,
                virtual_channel: false,
            },
            seller_deposit: 0,
            buyer_deposit: 3_000_000_000,
            price: 1_000_000_000,
            timeout: 10,
            iterations: 3,
            slice_count: 4,
        }
    }

    #[test]
    fn initial_state_carries_the_funding_allocation() {
        let ctx = context();
        let helper = ChannelHelper::new(&ctx);
        let state = helper.initial_state().unwrap();
        assert_eq!(state.version, 1);
        assert_eq!(state.outcome.balances, vec![vec![0, 3_000_000_000]]);
        assert!(!state.is_final);
        let app = FileSaleAppState::decode_abi(&state.app_data).unwrap();
        assert_eq!(app, FileSaleAppState::default());
        assert_eq!(app.key, B032);
    }

    #[test]
    fn reveal_transition_preserves_totals() {
        let ctx = context();
        let helper = ChannelHelper::new(&ctx);
        let accepted = helper.initial_state().unwrap();
        let mut outcome = Allocation {
            assets: accepted.outcome.assets.clone(),
            balances: accepted.outcome.balances.clone(),
            locked: Vec::new(),
        };
        outcome.balances[0][SELLER] += ctx.price;
        outcome.balances[0][BUYER] -= ctx.price;
        let revealed = ChannelState {
            channel_id: accepted.channel_id,
            version: accepted.version + 1,
            outcome,
            app_data: accepted.app_data.clone(),
            is_final: false,
        };
        assert!(accepted.check_successor(&revealed).is_ok());
        assert_eq!(ChannelHelper::seller_share(&revealed), ctx.price);
        assert_eq!(
            ChannelHelper::buyer_share(&revealed),
            ctx.buyer_deposit - ctx.price
        );
    }
}
