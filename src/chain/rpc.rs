//! Synchronous JSON-RPC transport to an EVM-compatible node.
//!
//! Thin typed layer over `eth_*` calls: quantities travel as `0x`-prefixed
//! hex, byte strings as hex blobs. Everything the adapter consumes is
//! parsed into the structs below; raw JSON never leaks upward.

use std::cell::Cell;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};

use crate::abi::Address;
use crate::crypto::Digest;
use crate::errors::BenchError;

const HTTP_TIMEOUT_SECS: u64 = 30;

/// Converts an integer into an `0x`-prefixed quantity string.
pub fn to_quantity(value: u128) -> String {
    format!("0x{value:x}")
}

/// Parses an `0x`-prefixed quantity string into a `u128`.
pub fn quantity_to_u128(value: &Value) -> Result<u128, BenchError> {
    let text = value
        .as_str()
        .ok_or_else(|| BenchError::environment(format!("expected quantity, got {value}")))?;
    u128::from_str_radix(text.trim_start_matches("0x"), 16)
        .map_err(|err| BenchError::environment(format!("invalid quantity {text}: {err}")))
}

/// Parses an `0x`-prefixed quantity string into a `u64`.
pub fn quantity_to_u64(value: &Value) -> Result<u64, BenchError> {
    let wide = quantity_to_u128(value)?;
    u64::try_from(wide)
        .map_err(|_| BenchError::environment(format!("quantity {wide} exceeds u64")))
}

/// Parses an `0x`-prefixed hex blob into bytes.
pub fn hex_to_bytes(value: &Value) -> Result<Vec<u8>, BenchError> {
    let text = value
        .as_str()
        .ok_or_else(|| BenchError::environment(format!("expected hex blob, got {value}")))?;
    hex::decode(text.trim_start_matches("0x"))
        .map_err(|err| BenchError::environment(format!("invalid hex blob: {err}")))
}

fn hex_to_digest(value: &Value) -> Result<Digest, BenchError> {
    let bytes = hex_to_bytes(value)?;
    if bytes.len() != 32 {
        return Err(BenchError::environment(format!(
            "expected 32-byte hash, got {} bytes",
            bytes.len()
        )));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

fn value_to_address(value: &Value) -> Result<Address, BenchError> {
    value
        .as_str()
        .ok_or_else(|| BenchError::environment(format!("expected address, got {value}")))?
        .parse()
        .map_err(BenchError::environment)
}

/// Transaction we are about to submit; kept for failure diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionDraft {
    /// Sending account.
    pub from: Address,
    /// Destination, absent for contract creation.
    pub to: Option<Address>,
    /// Nonce chosen at submission time.
    pub nonce: u64,
    /// Attached value in wei.
    pub value: u128,
    /// Gas limit.
    pub gas: u64,
    /// Gas price in wei.
    pub gas_price: u128,
    /// Call data (hex in serialized form).
    #[serde(serialize_with = "serialize_hex")]
    pub data: Vec<u8>,
}

fn serialize_hex<S: serde::Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format!("0x{}", hex::encode(data)))
}

/// Mined transaction receipt.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionReceipt {
    /// Hash of the mined transaction.
    #[serde(serialize_with = "serialize_hex")]
    pub transaction_hash: Vec<u8>,
    /// 1 on success, 0 on revert.
    pub status: u64,
    /// Gas consumed by this transaction.
    pub gas_used: u64,
    /// Block the transaction was mined in.
    pub block_number: u64,
    /// Address of the created contract, for deployments.
    pub contract_address: Option<Address>,
}

impl TransactionReceipt {
    fn from_value(value: &Value) -> Result<Self, BenchError> {
        Ok(Self {
            transaction_hash: hex_to_bytes(&value["transactionHash"])?,
            status: quantity_to_u64(&value["status"])?,
            gas_used: quantity_to_u64(&value["gasUsed"])?,
            block_number: quantity_to_u64(&value["blockNumber"])?,
            contract_address: match &value["contractAddress"] {
                Value::Null => None,
                other => Some(value_to_address(other)?),
            },
        })
    }
}

/// Header fields of a block the adapter cares about.
#[derive(Debug, Clone, Copy)]
pub struct BlockHeader {
    /// Block number.
    pub number: u64,
    /// Block timestamp in unix seconds.
    pub timestamp: u64,
}

/// A log entry returned by `eth_getLogs`.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Emitting contract.
    pub address: Address,
    /// Topic list; `topics[0]` is the event signature digest.
    pub topics: Vec<Digest>,
    /// Non-indexed data section.
    pub data: Vec<u8>,
    /// Block the log was emitted in.
    pub block_number: u64,
    /// Transaction that caused the log.
    pub transaction_hash: Digest,
}

impl LogEntry {
    fn from_value(value: &Value) -> Result<Self, BenchError> {
        let topics = value["topics"]
            .as_array()
            .ok_or_else(|| BenchError::environment("log entry without topics"))?
            .iter()
            .map(hex_to_digest)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            address: value_to_address(&value["address"])?,
            topics,
            data: hex_to_bytes(&value["data"])?,
            block_number: quantity_to_u64(&value["blockNumber"])?,
            transaction_hash: hex_to_digest(&value["transactionHash"])?,
        })
    }
}

/// A transaction fetched back from the node.
#[derive(Debug, Clone)]
pub struct RpcTransaction {
    /// Sender recovered by the node.
    pub from: Address,
    /// Destination address.
    pub to: Option<Address>,
    /// Call data.
    pub input: Vec<u8>,
}

/// Blocking JSON-RPC client for one endpoint.
pub struct RpcClient {
    http: reqwest::blocking::Client,
    url: String,
    next_id: Cell<u64>,
}

impl RpcClient {
    /// Creates a client for `url`.
    pub fn new(url: &str) -> Result<Self, BenchError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .map_err(|err| BenchError::environment(format!("building HTTP client: {err}")))?;
        Ok(Self {
            http,
            url: url.to_string(),
            next_id: Cell::new(1),
        })
    }

    /// Endpoint this client talks to.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Performs one JSON-RPC request and returns the `result` value.
    pub fn request(&self, method: &str, params: Value) -> Result<Value, BenchError> {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let response: Value = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .map_err(|err| BenchError::environment(format!("{method}: {err}")))?
            .json()
            .map_err(|err| BenchError::environment(format!("{method}: invalid response: {err}")))?;

        if let Some(error) = response.get("error").filter(|error| !error.is_null()) {
            return Err(BenchError::environment(format!("{method} failed: {error}")));
        }
        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }

    /// Chain ID reported by the node.
    pub fn chain_id(&self) -> Result<u64, BenchError> {
        quantity_to_u64(&self.request("eth_chainId", json!([]))?)
    }

    /// Account balance in wei at the latest block.
    pub fn balance(&self, address: Address) -> Result<u128, BenchError> {
        quantity_to_u128(&self.request(
            "eth_getBalance",
            json!([address.to_hex(), "latest"]),
        )?)
    }

    /// Pending-state nonce for `address`.
    pub fn transaction_count(&self, address: Address) -> Result<u64, BenchError> {
        quantity_to_u64(&self.request(
            "eth_getTransactionCount",
            json!([address.to_hex(), "pending"]),
        )?)
    }

    /// Current gas price suggestion.
    pub fn gas_price(&self) -> Result<u128, BenchError> {
        quantity_to_u128(&self.request("eth_gasPrice", json!([]))?)
    }

    /// Header of the latest block.
    pub fn latest_block(&self) -> Result<BlockHeader, BenchError> {
        let block = self.request("eth_getBlockByNumber", json!(["latest", false]))?;
        if block.is_null() {
            return Err(BenchError::environment("node returned no latest block"));
        }
        Ok(BlockHeader {
            number: quantity_to_u64(&block["number"])?,
            timestamp: quantity_to_u64(&block["timestamp"])?,
        })
    }

    /// Deployed code at `address` (empty when absent or self-destructed).
    pub fn code(&self, address: Address) -> Result<Vec<u8>, BenchError> {
        hex_to_bytes(&self.request("eth_getCode", json!([address.to_hex(), "latest"]))?)
    }

    /// Executes a read-only call and returns the raw return data.
    pub fn eth_call(
        &self,
        from: Address,
        to: Address,
        data: &[u8],
    ) -> Result<Vec<u8>, BenchError> {
        hex_to_bytes(&self.request(
            "eth_call",
            json!([
                {
                    "from": from.to_hex(),
                    "to": to.to_hex(),
                    "data": format!("0x{}", hex::encode(data)),
                },
                "latest"
            ]),
        )?)
    }

    /// Estimates gas for a draft call.
    pub fn estimate_gas(
        &self,
        from: Address,
        to: Option<Address>,
        value: u128,
        data: &[u8],
    ) -> Result<u64, BenchError> {
        let mut call = json!({
            "from": from.to_hex(),
            "value": to_quantity(value),
            "data": format!("0x{}", hex::encode(data)),
        });
        if let Some(to) = to {
            call["to"] = Value::String(to.to_hex());
        }
        quantity_to_u64(&self.request("eth_estimateGas", json!([call]))?)
    }

    /// Submits a locally signed raw transaction, returning its hash.
    pub fn send_raw_transaction(&self, raw: &[u8]) -> Result<Digest, BenchError> {
        hex_to_digest(&self.request(
            "eth_sendRawTransaction",
            json!([format!("0x{}", hex::encode(raw))]),
        )?)
    }

    /// Submits a node-signed transaction for an unlocked account.
    pub fn send_transaction(&self, draft: &TransactionDraft) -> Result<Digest, BenchError> {
        let mut call = json!({
            "from": draft.from.to_hex(),
            "nonce": to_quantity(draft.nonce as u128),
            "value": to_quantity(draft.value),
            "gas": to_quantity(draft.gas as u128),
            "gasPrice": to_quantity(draft.gas_price),
            "data": format!("0x{}", hex::encode(&draft.data)),
        });
        if let Some(to) = draft.to {
            call["to"] = Value::String(to.to_hex());
        }
        hex_to_digest(&self.request("eth_sendTransaction", json!([call]))?)
    }

    /// Fetches the receipt for a transaction hash if it has been mined.
    pub fn transaction_receipt(
        &self,
        hash: &Digest,
    ) -> Result<Option<TransactionReceipt>, BenchError> {
        let value = self.request(
            "eth_getTransactionReceipt",
            json!([format!("0x{}", hex::encode(hash))]),
        )?;
        if value.is_null() {
            return Ok(None);
        }
        TransactionReceipt::from_value(&value).map(Some)
    }

    /// Fetches a transaction body by hash.
    pub fn transaction_by_hash(&self, hash: &Digest) -> Result<Option<RpcTransaction>, BenchError> {
        let value = self.request(
            "eth_getTransactionByHash",
            json!([format!("0x{}", hex::encode(hash))]),
        )?;
        if value.is_null() {
            return Ok(None);
        }
        Ok(Some(RpcTransaction {
            from: value_to_address(&value["from"])?,
            to: match &value["to"] {
                Value::Null => None,
                other => Some(value_to_address(other)?),
            },
            input: hex_to_bytes(&value["input"])?,
        }))
    }

    /// Fetches logs for one contract and topic filter over a block range.
    pub fn logs(
        &self,
        address: Address,
        topic0: &Digest,
        from_block: u64,
    ) -> Result<Vec<LogEntry>, BenchError> {
        let value = self.request(
            "eth_getLogs",
            json!([{
                "address": address.to_hex(),
                "topics": [format!("0x{}", hex::encode(topic0))],
                "fromBlock": to_quantity(from_block as u128),
                "toBlock": "latest",
            }]),
        )?;
        value
            .as_array()
            .ok_or_else(|| BenchError::environment("eth_getLogs returned a non-array"))?
            .iter()
            .map(LogEntry::from_value)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantity_helpers() {
        assert_eq!(to_quantity(0), "0x0");
        assert_eq!(to_quantity(255), "0xff");
        assert_eq!(quantity_to_u128(&json!("0xff")).unwrap(), 255);
        assert_eq!(quantity_to_u64(&json!("0x10")).unwrap(), 16);
        assert!(quantity_to_u64(&json!(16)).is_err());
    }

    #[test]
    fn receipt_parsing() {
        let value = json!({
            "transactionHash": "0x00000000000000000000000000000000000000000000000000000000000000aa",
            "status": "0x1",
            "gasUsed": "0x5208",
            "blockNumber": "0x10",
            "contractAddress": null,
        });
        let receipt = TransactionReceipt::from_value(&value).unwrap();
        assert_eq!(receipt.status, 1);
        assert_eq!(receipt.gas_used, 21000);
        assert!(receipt.contract_address.is_none());
    }

    #[test]
    fn draft_serializes_data_as_hex() {
        let draft = TransactionDraft {
            from: Address([1u8; 20]),
            to: None,
            nonce: 0,
            value: 0,
            gas: 21000,
            gas_price: 1,
            data: vec![0xde, 0xad],
        };
        let encoded = serde_json::to_value(&draft).unwrap();
        assert_eq!(encoded["data"], "0xdead");
    }
}
