//! Typed adapter over the EVM JSON-RPC boundary.
//!
//! One [`Environment`] per party and per process: it owns the party's
//! wallet, serializes transaction submission on that wallet's nonce, and
//! keeps running totals of transactions sent and gas paid for the
//! simulation accounting.

pub mod rpc;
pub mod tx;

use std::cell::Cell;
use std::collections::VecDeque;
use std::thread::sleep;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{debug, warn};

use crate::abi::{Address, Token};
use crate::contracts::Contract;
use crate::crypto::Digest;
use crate::errors::BenchError;
use crate::wallet::Wallet;

use rpc::{LogEntry, RpcClient, TransactionDraft, TransactionReceipt};

/// Default pause between chain polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(300);

/// Wall-clock budget for one receipt wait before the send is retried.
const RECEIPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Submission attempts before giving up on a transaction.
const SEND_ATTEMPTS: usize = 3;

/// Outcome of [`Environment::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// The deadline passed (wall clock and chain time) first.
    Timeout,
    /// The predicate became true first.
    Condition,
}

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// A party's connection to the chain: RPC endpoint plus wallet.
pub struct Environment {
    rpc: RpcClient,
    wallet: Wallet,
    chain_id: u64,
    poll_interval: Duration,
    tx_count: Cell<u64>,
    tx_fees_gas: Cell<u128>,
}

impl Environment {
    /// Connects to `endpoint_url` and probes the chain ID.
    pub fn new(endpoint_url: &str, wallet: Wallet) -> Result<Self, BenchError> {
        let rpc = RpcClient::new(endpoint_url)?;
        let chain_id = rpc.chain_id()?;
        Ok(Self {
            rpc,
            wallet,
            chain_id,
            poll_interval: DEFAULT_POLL_INTERVAL,
            tx_count: Cell::new(0),
            tx_fees_gas: Cell::new(0),
        })
    }

    /// The party's wallet.
    pub fn wallet(&self) -> &Wallet {
        &self.wallet
    }

    /// The party's account address.
    pub fn wallet_address(&self) -> Address {
        self.wallet.address()
    }

    /// Raw RPC client, for reads the typed surface does not cover.
    pub fn rpc(&self) -> &RpcClient {
        &self.rpc
    }

    /// Transactions submitted through this environment so far.
    pub fn tx_count(&self) -> u64 {
        self.tx_count.get()
    }

    /// Total gas consumed by those transactions.
    pub fn tx_fees_gas(&self) -> u128 {
        self.tx_fees_gas.get()
    }

    /// Own balance in wei.
    pub fn balance(&self) -> Result<u128, BenchError> {
        self.rpc.balance(self.wallet_address())
    }

    /// Balance of an arbitrary account in wei.
    pub fn balance_of(&self, address: Address) -> Result<u128, BenchError> {
        self.rpc.balance(address)
    }

    /// Deploys `contract` with constructor `args`, recording its address
    /// on the handle.
    pub fn deploy_contract(
        &self,
        contract: &mut Contract,
        args: &[Token],
        value: u128,
    ) -> Result<TransactionReceipt, BenchError> {
        let bytecode = contract.bytecode().ok_or_else(|| {
            BenchError::ProtocolRuntime(format!("contract {} has no bytecode", contract.name))
        })?;
        let mut data = bytecode.to_vec();
        data.extend_from_slice(&crate::abi::encode_tokens(args));
        let receipt = self.submit(None, value, data, None)?;
        let address = receipt.contract_address.ok_or_else(|| {
            BenchError::environment(format!("deployment of {} returned no address", contract.name))
        })?;
        debug!(
            "deployed {} at {} ({} gas used)",
            contract.name, address, receipt.gas_used
        );
        contract.set_address(address);
        Ok(receipt)
    }

    /// Sends a state-changing call to a contract method.
    pub fn send_contract_transaction(
        &self,
        contract: &Contract,
        method: &str,
        args: &[Token],
        value: u128,
        gas_limit: Option<u64>,
    ) -> Result<TransactionReceipt, BenchError> {
        let function = contract.abi().function(method)?;
        let data = function.encode_call(args)?;
        debug!("sending {}.{}", contract.name, method);
        self.submit(Some(contract.address()?), value, data, gas_limit)
    }

    /// Executes a read-only contract call and decodes its return values.
    pub fn call_contract(
        &self,
        contract: &Contract,
        method: &str,
        args: &[Token],
    ) -> Result<Vec<Token>, BenchError> {
        let function = contract.abi().function(method)?;
        let data = function.encode_call(args)?;
        let output = self
            .rpc
            .eth_call(self.wallet_address(), contract.address()?, &data)?;
        function.decode_output(&output)
    }

    /// True once the code at `address` is empty (never deployed or
    /// self-destructed).
    pub fn code_is_empty(&self, address: Address) -> Result<bool, BenchError> {
        Ok(self.rpc.code(address)?.is_empty())
    }

    fn submit(
        &self,
        to: Option<Address>,
        value: u128,
        data: Vec<u8>,
        gas_limit: Option<u64>,
    ) -> Result<TransactionReceipt, BenchError> {
        let from = self.wallet_address();
        let mut last_draft = None;

        for attempt in 1..=SEND_ATTEMPTS {
            let nonce = self.rpc.transaction_count(from)?;
            let gas_price = self.rpc.gas_price()?;
            let gas = match gas_limit {
                Some(gas) => gas,
                None => {
                    let estimate = self.rpc.estimate_gas(from, to, value, &data)?;
                    estimate + estimate / 5
                }
            };
            let draft = TransactionDraft {
                from,
                to,
                nonce,
                value,
                gas,
                gas_price,
                data: data.clone(),
            };

            let hash = if self.wallet.can_sign() {
                let raw = tx::sign_transaction(&draft, self.chain_id, &self.wallet)?;
                self.rpc.send_raw_transaction(&raw)?
            } else {
                self.rpc.send_transaction(&draft)?
            };

            match self.wait_for_receipt(&hash)? {
                Some(receipt) => {
                    self.tx_count.set(self.tx_count.get() + 1);
                    self.tx_fees_gas
                        .set(self.tx_fees_gas.get() + u128::from(receipt.gas_used));
                    if receipt.status != 1 {
                        return Err(BenchError::EnvironmentRuntime {
                            message: format!(
                                "transaction 0x{} reverted",
                                hex::encode(&receipt.transaction_hash)
                            ),
                            draft: Some(draft),
                            receipt: Some(receipt),
                        });
                    }
                    return Ok(receipt);
                }
                None => {
                    warn!(
                        "no receipt for 0x{} within {:?} (attempt {attempt}/{SEND_ATTEMPTS}), \
                         re-querying nonce and retrying",
                        hex::encode(hash),
                        RECEIPT_TIMEOUT
                    );
                    last_draft = Some(draft);
                }
            }
        }

        Err(BenchError::EnvironmentRuntime {
            message: format!("transaction not mined after {SEND_ATTEMPTS} attempts"),
            draft: last_draft,
            receipt: None,
        })
    }

    fn wait_for_receipt(&self, hash: &Digest) -> Result<Option<TransactionReceipt>, BenchError> {
        let deadline = Instant::now() + RECEIPT_TIMEOUT;
        loop {
            if let Some(receipt) = self.rpc.transaction_receipt(hash)? {
                return Ok(Some(receipt));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            sleep(self.poll_interval);
        }
    }

    /// Polls until `condition` holds or `timeout_at` (unix seconds) has
    /// passed on both the wall clock and the chain.
    ///
    /// At least one of the two must be supplied.
    pub fn wait(
        &self,
        timeout_at: Option<u64>,
        condition: Option<&dyn Fn() -> Result<bool, BenchError>>,
    ) -> Result<WaitResult, BenchError> {
        if timeout_at.is_none() && condition.is_none() {
            return Err(BenchError::ProtocolRuntime(
                "wait needs a timeout or a condition".to_string(),
            ));
        }
        loop {
            if let Some(condition) = condition {
                if condition()? {
                    return Ok(WaitResult::Condition);
                }
            }
            if let Some(deadline) = timeout_at {
                if unix_now() > deadline && self.rpc.latest_block()?.timestamp >= deadline {
                    return Ok(WaitResult::Timeout);
                }
            }
            sleep(self.poll_interval);
        }
    }

    /// Creates a poll-based filter over `event_name` logs of `contract`.
    ///
    /// The filter starts at the next block and times out only after
    /// `timeout` of silence since the last delivered event.
    pub fn filter_events(
        &self,
        contract: &Contract,
        event_name: &str,
        timeout: Duration,
    ) -> Result<EventFilter<'_>, BenchError> {
        let topic = contract.abi().event(event_name)?.topic();
        let from_block = self.rpc.latest_block()?.number + 1;
        Ok(EventFilter {
            environment: self,
            address: contract.address()?,
            topic,
            from_block,
            pending: VecDeque::new(),
            last_delivery: Instant::now(),
            timeout,
        })
    }
}

/// Poll-based event stream for one contract event.
pub struct EventFilter<'a> {
    environment: &'a Environment,
    address: Address,
    topic: Digest,
    from_block: u64,
    pending: VecDeque<LogEntry>,
    last_delivery: Instant,
    timeout: Duration,
}

impl EventFilter<'_> {
    fn fetch(&mut self) -> Result<(), BenchError> {
        let entries = self
            .environment
            .rpc
            .logs(self.address, &self.topic, self.from_block)?;
        for entry in entries {
            self.from_block = self.from_block.max(entry.block_number + 1);
            self.pending.push_back(entry);
        }
        Ok(())
    }

    /// Blocks until the next event or until the silence timeout elapses.
    /// Returns `None` on timeout.
    pub fn next(&mut self) -> Result<Option<LogEntry>, BenchError> {
        loop {
            if let Some(entry) = self.pending.pop_front() {
                self.last_delivery = Instant::now();
                return Ok(Some(entry));
            }
            self.fetch()?;
            if self.pending.is_empty() {
                if self.last_delivery.elapsed() >= self.timeout {
                    return Ok(None);
                }
                sleep(self.environment.poll_interval);
            }
        }
    }

    /// Drains whatever events are available right now without blocking.
    pub fn poll_new(&mut self) -> Result<Vec<LogEntry>, BenchError> {
        self.fetch()?;
        if !self.pending.is_empty() {
            self.last_delivery = Instant::now();
        }
        Ok(self.pending.drain(..).collect())
    }
}
