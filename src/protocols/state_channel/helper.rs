//! Shared channel plumbing for the state-channel strategies: initial
//! state, funding, adjudicator interaction and dispute-state tracking.
//!
//! Channel identifiers, funding identifiers and state hashes are computed
//! locally; the on-chain helper contract exists for external consumers and
//! is never called here.

use std::time::Duration;

use log::debug;

use crate::abi::{Address, Token};
use crate::chain::{unix_now, Environment, EventFilter};
use crate::channel::{
    funding_id, ChannelState, Dispute, SignedState, WithdrawalAuth, BUYER, SELLER,
};
use crate::crypto::Digest;
use crate::errors::BenchError;
use crate::file_sale::FileSaleAppState;
use crate::protocols::state_channel::ChannelContext;

/// Gas limit for `register`; fixed so a mis-estimating node cannot stall
/// the dispute.
const REGISTER_GAS: u64 = 150_000;

/// Receives the next wire message, tolerating a clean peer shutdown.
///
/// Returns `None` both on clean close and on timeout; callers treat either
/// as the peer having left the protocol.
pub fn receive_message(
    p2p: &mut crate::p2p::JsonObjectStream,
    timeout: Duration,
) -> Result<Option<serde_json::Value>, BenchError> {
    match p2p.receive_object(Some(timeout)) {
        Ok(Some((message, _))) => Ok(Some(message)),
        Ok(None) => Ok(None),
        Err(crate::p2p::P2pError::Timeout) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Extracts the `action` field of a wire message.
pub fn message_action(message: &serde_json::Value) -> Result<&str, BenchError> {
    message["action"]
        .as_str()
        .ok_or_else(|| BenchError::ProtocolRuntime("wire message without action".to_string()))
}

/// Extracts a hex signature field of a wire message.
pub fn message_signature(
    message: &serde_json::Value,
) -> Result<crate::wallet::RecoverableSignature, BenchError> {
    let text = message["signature"].as_str().ok_or_else(|| {
        BenchError::ProtocolRuntime("wire message without signature".to_string())
    })?;
    Ok(crate::wallet::signature_from_hex(text)?)
}

/// Extracts a hex digest field of a wire message.
pub fn message_digest(
    message: &serde_json::Value,
    key: &str,
) -> Result<Digest, BenchError> {
    let text = message[key]
        .as_str()
        .ok_or_else(|| BenchError::ProtocolRuntime(format!("wire message without {key}")))?;
    crate::crypto::digest_from_hex(text).map_err(BenchError::ProtocolRuntime)
}

/// True once `deadline` (unix seconds) has passed on the wall clock and
/// on the chain.
pub fn deadline_passed(environment: &Environment, deadline: u64) -> Result<bool, BenchError> {
    Ok(unix_now() > deadline && environment.rpc().latest_block()?.timestamp >= deadline)
}

/// Channel operations shared by both roles.
pub struct ChannelHelper<'a> {
    ctx: &'a ChannelContext,
}

impl<'a> ChannelHelper<'a> {
    /// Helper over the strategy's owned context.
    pub fn new(ctx: &'a ChannelContext) -> Self {
        Self { ctx }
    }

    /// The version-1 state both parties derive from the shared channel
    /// parameters: funding allocation, idle app.
    pub fn initial_state(&self) -> Result<ChannelState, BenchError> {
        Ok(ChannelState {
            channel_id: self.ctx.channel_id(),
            version: 1,
            outcome: crate::channel::Allocation {
                assets: vec![self.ctx.asset_holder.address()?],
                balances: vec![vec![self.ctx.seller_deposit, self.ctx.buyer_deposit]],
                locked: Vec::new(),
            },
            app_data: FileSaleAppState::default().encode_abi(),
            is_final: false,
        })
    }

    /// Funding identifier of `participant` in this channel.
    pub fn funding_id(&self, participant: Address) -> Digest {
        funding_id(&self.ctx.channel_id(), participant)
    }

    /// Current holdings under a funding identifier.
    pub fn holdings(&self, environment: &Environment, id: &Digest) -> Result<u128, BenchError> {
        environment
            .call_contract(&self.ctx.asset_holder, "holdings", &[Token::FixedBytes(*id)])?[0]
            .as_uint()
            .map_err(BenchError::from)
    }

    /// Deposits `amount` wei under a funding identifier.
    pub fn deposit(
        &self,
        environment: &Environment,
        id: &Digest,
        amount: u128,
    ) -> Result<(), BenchError> {
        environment.send_contract_transaction(
            &self.ctx.asset_holder,
            "deposit",
            &[Token::FixedBytes(*id), Token::Uint(amount)],
            amount,
            None,
        )?;
        Ok(())
    }

    /// Reads the adjudicator's dispute record for this channel.
    pub fn dispute(&self, environment: &Environment) -> Result<Dispute, BenchError> {
        let fields = environment.call_contract(
            &self.ctx.adjudicator,
            "disputes",
            &[Token::FixedBytes(self.ctx.channel_id())],
        )?;
        Dispute::from_tokens(&fields)
    }

    /// Registers the anchor state, opening or refuting a dispute.
    pub fn register(
        &self,
        environment: &Environment,
        anchor: &SignedState,
    ) -> Result<(), BenchError> {
        debug!("registering state v{}", anchor.state.version);
        environment.send_contract_transaction(
            &self.ctx.adjudicator,
            "register",
            &[anchor.to_token(), Token::Array(Vec::new())],
            0,
            Some(REGISTER_GAS),
        )?;
        Ok(())
    }

    /// Concludes the dispute with the registered state.
    pub fn conclude(
        &self,
        environment: &Environment,
        state: &ChannelState,
    ) -> Result<(), BenchError> {
        debug!("concluding with state v{}", state.version);
        environment.send_contract_transaction(
            &self.ctx.adjudicator,
            "conclude",
            &[
                self.ctx.channel_params.to_token(),
                state.to_token(),
                Token::Array(Vec::new()),
            ],
            0,
            None,
        )?;
        Ok(())
    }

    /// Concludes a final (closing) state directly, skipping the dispute.
    pub fn conclude_final(
        &self,
        environment: &Environment,
        anchor: &SignedState,
    ) -> Result<(), BenchError> {
        environment.send_contract_transaction(
            &self.ctx.adjudicator,
            "concludeFinal",
            &[
                anchor.params.to_token(),
                anchor.state.to_token(),
                Token::Array(
                    anchor
                        .sigs
                        .iter()
                        .map(|sig| Token::Bytes(sig.to_vec()))
                        .collect(),
                ),
            ],
            0,
            None,
        )?;
        Ok(())
    }

    /// Force-executes an app transition from the registered state to a
    /// unilaterally signed successor.
    pub fn progress(
        &self,
        environment: &Environment,
        from: &ChannelState,
        to: &ChannelState,
        actor: usize,
        signature: &crate::wallet::RecoverableSignature,
    ) -> Result<(), BenchError> {
        environment.send_contract_transaction(
            &self.ctx.adjudicator,
            "progress",
            &[
                self.ctx.channel_params.to_token(),
                from.to_token(),
                to.to_token(),
                Token::Uint(actor as u128),
                Token::Bytes(signature.to_vec()),
            ],
            0,
            None,
        )?;
        Ok(())
    }

    /// Withdraws the caller's full current holdings, authorized by a
    /// signature over the withdrawal tuple.
    pub fn withdraw_holdings(&self, environment: &Environment) -> Result<(), BenchError> {
        let id = self.funding_id(environment.wallet_address());
        let amount = self.holdings(environment, &id)?;
        let authorization = WithdrawalAuth {
            channel_id: self.ctx.channel_id(),
            participant: environment.wallet_address(),
            receiver: environment.wallet_address(),
            amount,
        };
        let signature = authorization.sign(environment.wallet())?;
        environment.send_contract_transaction(
            &self.ctx.asset_holder,
            "withdraw",
            &[
                authorization.to_token(),
                Token::Bytes(signature.to_vec()),
            ],
            0,
            None,
        )?;
        debug!("withdrawn {amount}");
        Ok(())
    }

    /// Event filter over the adjudicator's channel updates, timing out
    /// after twice the channel timeout of silence.
    pub fn channel_update_filter<'e>(
        &self,
        environment: &'e Environment,
    ) -> Result<EventFilter<'e>, BenchError> {
        environment.filter_events(
            &self.ctx.adjudicator,
            "ChannelUpdate",
            Duration::from_secs(self.ctx.timeout * 2),
        )
    }

    /// Folds newly observed channel updates into the registered-state
    /// tracker by decoding the inputs of the causing transactions.
    pub fn update_last_state(
        &self,
        environment: &Environment,
        filter: &mut EventFilter<'_>,
        mut last_state: ChannelState,
    ) -> Result<(ChannelState, FileSaleAppState), BenchError> {
        let channel_id = self.ctx.channel_id();
        for entry in filter.poll_new()? {
            if entry.topics.len() < 2 || entry.topics[1] != channel_id {
                continue;
            }
            let Some(transaction) = environment.rpc().transaction_by_hash(&entry.transaction_hash)?
            else {
                continue;
            };
            let (function, args) = self
                .ctx
                .adjudicator
                .abi()
                .decode_function_input(&transaction.input)?;
            match function.name.as_str() {
                "register" => {
                    let channel = args[0].as_tuple()?;
                    last_state = ChannelState::from_token(&channel[1])?;
                }
                "progress" => {
                    last_state = ChannelState::from_token(&args[2])?;
                }
                "conclude" | "concludeFinal" => {
                    last_state = ChannelState::from_token(&args[1])?;
                }
                other => {
                    return Err(BenchError::ProtocolRuntime(format!(
                        "unrecognized channel update cause: {other}"
                    )));
                }
            }
        }
        let app_state = FileSaleAppState::decode_abi(&last_state.app_data)?;
        Ok((last_state, app_state))
    }

    /// Sugar for the seller's column of a state's single-asset balances.
    pub fn seller_share(state: &ChannelState) -> u128 {
        state.outcome.balances[0][SELLER]
    }

    /// Sugar for the buyer's column of a state's single-asset balances.
    pub fn buyer_share(state: &ChannelState) -> u128 {
        state.outcome.balances[0][BUYER]
    }
}
