//! Seller side of the state-channel file sale.
//!
//! The seller answers `request` messages with initialize/reveal state
//! transitions, anchors every countersigned state, and falls back to the
//! adjudicator when the buyer stops cooperating while the seller holds
//! earned funds. Adversarial variants replace only the encoding of the
//! final iteration.

use std::time::Duration;

use log::{debug, error, warn};
use serde_json::{json, Value};

use crate::abi::Address;
use crate::chain::{unix_now, Environment, WaitResult};
use crate::channel::{ChannelState, DisputePhase, SignedState, BUYER, SELLER};
use crate::crypto::{keccak, random_key, Digest};
use crate::encoding::{encode, encode_forge_first_leaf, encode_forge_first_leaf_first_hash};
use crate::errors::BenchError;
use crate::file_sale::FileSaleAppState;
use crate::merkle::{mt2obj_hex, MerkleTree};
use crate::p2p::JsonObjectStream;
use crate::protocols::state_channel::helper::{
    deadline_passed, message_action, message_signature, receive_message, ChannelHelper,
};
use crate::protocols::state_channel::{ChannelContext, Disagreement, SaleOutcome};
use crate::protocols::Strategy;

/// Seller behavior selector for the state channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SellerVariant {
    /// Honest seller.
    Faithful,
    /// Encodes the final iteration under an independent key.
    RootForging,
    /// Zeroes the first leaf of the final iteration's encoding.
    LeafForging,
    /// Additionally fixes the first pack digest of the final iteration.
    NodeForging,
    /// Opens the channel, then vanishes before funding.
    Grieving,
}

impl SellerVariant {
    /// Parses a registry strategy name.
    pub fn parse(name: &str) -> Result<Self, BenchError> {
        match name {
            "Faithful" => Ok(Self::Faithful),
            "RootForging" => Ok(Self::RootForging),
            "LeafForging" => Ok(Self::LeafForging),
            "NodeForging" => Ok(Self::NodeForging),
            "Grieving" => Ok(Self::Grieving),
            other => Err(BenchError::Configuration(format!(
                "unknown seller strategy '{other}' for StateChannelFileSale"
            ))),
        }
    }

    /// Key the encoding actually uses; the commitment always covers the
    /// sale key.
    fn encode_key(&self, sale_key: &Digest, last_iteration: bool) -> Digest {
        match self {
            Self::RootForging if last_iteration => random_key(),
            _ => *sale_key,
        }
    }

    /// Encoded tree for one iteration.
    fn encode_tree(
        &self,
        tree: &MerkleTree,
        key: &Digest,
        last_iteration: bool,
    ) -> Result<MerkleTree, BenchError> {
        let result = match self {
            Self::LeafForging if last_iteration => encode_forge_first_leaf(tree, key),
            Self::NodeForging if last_iteration => encode_forge_first_leaf_first_hash(tree, key),
            _ => encode(tree, key),
        };
        result.map_err(BenchError::ProtocolRuntime)
    }
}

/// The seller strategy.
pub struct StateChannelSeller {
    ctx: ChannelContext,
    tree: MerkleTree,
    variant: SellerVariant,
}

impl StateChannelSeller {
    /// Builds the strategy with its owned context and the prepared plain
    /// file tree.
    pub fn new(ctx: ChannelContext, tree: MerkleTree, variant: SellerVariant) -> Self {
        Self { ctx, tree, variant }
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

        let Some(message) = receive_message(p2p, self.receive_timeout())? else {
            warn!("buyer never opened the channel");
            return Ok(None);
        };
        if message_action(&message)? != "open" {
            return Err(BenchError::ProtocolRuntime(
                "expected an open message".to_string(),
            ));
        }
        let buyer_sig = message_signature(&message)?;

        let my_sig = state.sign(environment.wallet())?;
        p2p.send_object(&json!({
            "action": "open",
            "signature": hex::encode(my_sig),
        }))
        .map_err(BenchError::from)?;

        if !state.verify_signature(&buyer_sig, opposite)? {
            error!("buyer's opening signature invalid");
            return Ok(None);
        }

        Ok(Some(SignedState {
            params: self.ctx.channel_params.clone(),
            state,
            sigs: [my_sig, buyer_sig],
        }))
    }

    fn fund_channel(&self, environment: &Environment) -> Result<WaitResult, BenchError> {
        let helper = ChannelHelper::new(&self.ctx);
        if self.ctx.seller_deposit > 0 {
            let id = helper.funding_id(environment.wallet_address());
            helper.deposit(environment, &id, self.ctx.seller_deposit)?;
        }
        // A rational seller reveals nothing before the buyer's deposit is
        // on chain.
        let buyer_funding = helper.funding_id(self.ctx.channel_params.participants[BUYER]);
        let funded = || {
            Ok(helper.holdings(environment, &buyer_funding)? >= self.ctx.buyer_deposit)
        };
        environment.wait(Some(unix_now() + self.ctx.timeout), Some(&funded))
    }

    fn conduct_file_sale(
        &self,
        environment: &Environment,
        p2p: &mut JsonObjectStream,
        opposite: Address,
        anchor: &mut SignedState,
        iteration: u32,
    ) -> Result<SaleOutcome, BenchError> {
        let last_iteration = iteration == self.ctx.iterations;
        let sale_key = random_key();
        let encode_key = self.variant.encode_key(&sale_key, last_iteration);
        let encoded = self.variant.encode_tree(&self.tree, &encode_key, last_iteration)?;

        // Initialize: propose the ACCEPTED state, balances untouched.
        let app = FileSaleAppState::accepted(
            self.tree.digest(),
            encoded.digest(),
            keccak(&sale_key),
            self.ctx.price,
        );
        let proposed = ChannelState {
            channel_id: anchor.state.channel_id,
            version: anchor.state.version + 1,
            outcome: anchor.state.outcome.clone(),
            app_data: app.encode_abi(),
            is_final: false,
        };
        let init_sig = proposed.sign(environment.wallet())?;
        p2p.send_object(&json!({
            "action": "initialize",
            "file_root": hex::encode(self.tree.digest()),
            "ciphertext_root": hex::encode(encoded.digest()),
            "key_commitment": hex::encode(keccak(&sale_key)),
            "price": self.ctx.price.to_string(),
            "tree": mt2obj_hex(&encoded),
            "signature": hex::encode(init_sig),
        }))
        .map_err(BenchError::from)?;

        let Some(message) = receive_message(p2p, self.receive_timeout())? else {
            return Ok(SaleOutcome::Disagreed(Disagreement::new(
                "buyer did not accept the sale",
                anchor.clone(),
            )));
        };
        if message_action(&message)? != "accept" {
            return Err(BenchError::ProtocolRuntime(format!(
                "expected accept, got {}",
                message_action(&message)?
            )));
        }
        let accept_sig = message_signature(&message)?;
        if !proposed.verify_signature(&accept_sig, opposite)? {
            return Ok(SaleOutcome::Disagreed(Disagreement::new(
                "accept signature mismatch",
                anchor.clone(),
            )));
        }
        anchor.state = proposed;
        anchor.sigs = [init_sig, accept_sig];
        debug!("sale {iteration} accepted");

        // Reveal: the price moves to the seller together with the key.
        if ChannelHelper::buyer_share(&anchor.state) < self.ctx.price {
            return Err(BenchError::ProtocolRuntime(
                "buyer's channel funds do not cover the price".to_string(),
            ));
        }
        let mut outcome = anchor.state.outcome.clone();
        outcome.balances[0][SELLER] += self.ctx.price;
        outcome.balances[0][BUYER] -= self.ctx.price;
        let revealed = ChannelState {
            channel_id: anchor.state.channel_id,
            version: anchor.state.version + 1,
            outcome,
            app_data: app.with_revealed_key(sale_key).encode_abi(),
            is_final: false,
        };
        let reveal_sig = revealed.sign(environment.wallet())?;
        p2p.send_object(&json!({
            "action": "reveal_key",
            "key": hex::encode(sale_key),
            "signature": hex::encode(reveal_sig),
        }))
        .map_err(BenchError::from)?;

        let Some(message) = receive_message(p2p, self.receive_timeout())? else {
            return Ok(SaleOutcome::Disagreed(Disagreement::new(
                "buyer did not confirm the key revelation",
                anchor.clone(),
            )));
        };
        if message_action(&message)? != "confirm" {
            return Err(BenchError::ProtocolRuntime(format!(
                "expected confirm, got {}",
                message_action(&message)?
            )));
        }
        let confirm_sig = message_signature(&message)?;
        if !revealed.verify_signature(&confirm_sig, opposite)? {
            return Ok(SaleOutcome::Disagreed(Disagreement::new(
                "confirm signature mismatch",
                anchor.clone(),
            )));
        }
        anchor.state = revealed;
        anchor.sigs = [reveal_sig, confirm_sig];
        debug!("sale {iteration} confirmed");
        Ok(SaleOutcome::Completed)
    }

    fn close_channel(
        &self,
        environment: &Environment,
        anchor: &mut SignedState,
        message: &Value,
        opposite: Address,
    ) -> Result<(), BenchError> {
        let helper = ChannelHelper::new(&self.ctx);
        anchor.state.is_final = true;
        let buyer_sig = message_signature(message)?;
        if !anchor.state.verify_signature(&buyer_sig, opposite)? {
            return Err(BenchError::ProtocolRuntime(
                "buyer's closing signature invalid".to_string(),
            ));
        }
        anchor.sigs[BUYER] = buyer_sig;
        anchor.sigs[SELLER] = anchor.state.sign(environment.wallet())?;
        helper.conclude_final(environment, anchor)?;
        helper.withdraw_holdings(environment)?;
        Ok(())
    }

    /// Earned funds beyond the seller's own deposit.
    fn has_earnings(&self, anchor: &SignedState) -> bool {
        ChannelHelper::seller_share(&anchor.state) > self.ctx.seller_deposit
    }

    fn dispute(
        &self,
        environment: &Environment,
        anchor: &SignedState,
    ) -> Result<(), BenchError> {
        let helper = ChannelHelper::new(&self.ctx);
        let mut filter = helper.channel_update_filter(environment)?;
        let mut last_state = anchor.state.clone();
        let mut concluded = false;

        while !concluded {
            let dispute = helper.dispute(environment)?;
            let (updated, _) = helper.update_last_state(environment, &mut filter, last_state)?;
            last_state = updated;

            match dispute.phase {
                DisputePhase::Dispute => {
                    if ChannelHelper::seller_share(&anchor.state) > 0
                        && anchor.state.version > dispute.version
                    {
                        helper.register(environment, anchor)?;
                        continue;
                    }
                    if !dispute.registered() {
                        // Nothing registered and nothing to gain.
                        break;
                    }
                    if ChannelHelper::seller_share(&last_state) > 0
                        && deadline_passed(
                            environment,
                            dispute.timeout + dispute.challenge_duration + 1,
                        )?
                    {
                        helper.conclude(environment, &last_state)?;
                        continue;
                    }
                    if ChannelHelper::seller_share(&last_state) == 0 {
                        break;
                    }
                }
                DisputePhase::ForceExec => {
                    if ChannelHelper::seller_share(&last_state) > 0
                        && deadline_passed(environment, dispute.timeout + 1)?
                    {
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

impl Strategy for StateChannelSeller {
    fn run(
        &mut self,
        environment: &Environment,
        p2p: &mut JsonObjectStream,
        opposite: Address,
    ) -> Result<(), BenchError> {
        let Some(mut anchor) = self.open_channel(environment, p2p, opposite)? else {
            return Ok(());
        };

        if self.variant == SellerVariant::Grieving {
            debug!("state channel opened, expecting buyer to fund, so quitting");
            return Ok(());
        }

        if self.fund_channel(environment)? == WaitResult::Timeout {
            warn!("buyer never funded the channel");
            if self.ctx.seller_deposit > 0 {
                self.dispute(environment, &anchor)?;
            }
            return Ok(());
        }

        let mut iteration = 1u32;
        loop {
            let Some(message) = receive_message(p2p, self.receive_timeout())? else {
                if self.has_earnings(&anchor) {
                    debug!("buyer left while we hold earnings, disputing");
                    self.dispute(environment, &anchor)?;
                }
                return Ok(());
            };
            match message_action(&message)? {
                "request" => {
                    debug!("received request message from buyer");
                    match self.conduct_file_sale(
                        environment,
                        p2p,
                        opposite,
                        &mut anchor,
                        iteration,
                    )? {
                        SaleOutcome::Completed => iteration += 1,
                        SaleOutcome::Disagreed(disagreement) => {
                            debug!("channel disagreement: {}", disagreement.reason);
                            if self.has_earnings(&disagreement.last_common) {
                                self.dispute(environment, &disagreement.last_common)?;
                            }
                            return Ok(());
                        }
                    }
                }
                "close" => {
                    debug!("received close message from buyer");
                    return self.close_channel(environment, &mut anchor, &message, opposite);
                }
                other => {
                    return Err(BenchError::ProtocolRuntime(format!(
                        "unexpected message action {other}"
                    )));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{decode, MismatchKind};

    fn sample_tree() -> MerkleTree {
        let data: Vec<u8> = (0..2048u32).map(|i| i as u8).collect();
        MerkleTree::from_bytes(&data, 4).unwrap()
    }

    #[test]
    fn variant_parsing() {
        assert_eq!(
            SellerVariant::parse("Grieving").unwrap(),
            SellerVariant::Grieving
        );
        assert!(SellerVariant::parse("Generous").is_err());
    }

    #[test]
    fn forging_only_hits_the_last_iteration() {
        let tree = sample_tree();
        let key = keccak(b"seller key");

        let early = SellerVariant::LeafForging
            .encode_tree(&tree, &key, false)
            .unwrap();
        let (_, errors) = decode(&early, &key).unwrap();
        assert!(errors.is_empty());

        let last = SellerVariant::LeafForging
            .encode_tree(&tree, &key, true)
            .unwrap();
        let (_, errors) = decode(&last, &key).unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, MismatchKind::Leaf);
    }

    #[test]
    fn root_forging_swaps_the_encode_key_last() {
        let key = keccak(b"sale key");
        assert_eq!(
            SellerVariant::RootForging.encode_key(&key, false),
            key
        );
        assert_ne!(SellerVariant::RootForging.encode_key(&key, true), key);
        assert_eq!(SellerVariant::Faithful.encode_key(&key, true), key);
    }
}
