//! Contract handles: parsed ABI surfaces, compiled bytecode and deployment
//! addresses.
//!
//! Solidity compilation is delegated to an external `solc` executable
//! (`--combined-json abi,bin`); this module only consumes its output.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde_json::Value;

use crate::abi::{self, AbiType, Address, Token};
use crate::crypto::Digest;
use crate::errors::BenchError;

/// One callable function of a contract.
#[derive(Debug, Clone)]
pub struct FunctionAbi {
    /// Function name.
    pub name: String,
    /// Input parameter types in order.
    pub inputs: Vec<AbiType>,
    /// Output types in order.
    pub outputs: Vec<AbiType>,
}

impl FunctionAbi {
    /// 4-byte call selector.
    pub fn selector(&self) -> [u8; 4] {
        abi::function_selector(&self.name, &self.inputs)
    }

    /// Encodes a call to this function: selector followed by arguments.
    pub fn encode_call(&self, args: &[Token]) -> Result<Vec<u8>, BenchError> {
        if args.len() != self.inputs.len() {
            return Err(BenchError::ProtocolRuntime(format!(
                "{} expects {} arguments, got {}",
                self.name,
                self.inputs.len(),
                args.len()
            )));
        }
        let mut data = self.selector().to_vec();
        data.extend_from_slice(&abi::encode_tokens(args));
        Ok(data)
    }

    /// Decodes return data of this function.
    pub fn decode_output(&self, data: &[u8]) -> Result<Vec<Token>, BenchError> {
        Ok(abi::decode_tokens(&self.outputs, data)?)
    }

    /// Decodes the argument section of call data for this function.
    pub fn decode_input(&self, data: &[u8]) -> Result<Vec<Token>, BenchError> {
        Ok(abi::decode_tokens(&self.inputs, data)?)
    }
}

/// One event of a contract.
#[derive(Debug, Clone)]
pub struct EventAbi {
    /// Event name.
    pub name: String,
    /// Parameter types with their `indexed` flag.
    pub inputs: Vec<(AbiType, bool)>,
}

impl EventAbi {
    /// Topic-zero digest identifying this event in logs.
    pub fn topic(&self) -> Digest {
        let types: Vec<AbiType> = self.inputs.iter().map(|(ty, _)| ty.clone()).collect();
        abi::signature_digest(&self.name, &types)
    }
}

/// Parsed ABI surface of one contract.
#[derive(Debug, Clone)]
pub struct ContractAbi {
    functions: Vec<FunctionAbi>,
    events: Vec<EventAbi>,
    raw: Value,
}

fn parse_param(param: &Value) -> Result<AbiType, BenchError> {
    let type_str = param["type"]
        .as_str()
        .ok_or_else(|| BenchError::Configuration("ABI parameter without type".to_string()))?;

    // Struct parameters come in as `tuple` plus a `components` list, with
    // any number of array suffixes.
    if let Some(rest) = type_str.strip_prefix("tuple") {
        let members = param["components"]
            .as_array()
            .ok_or_else(|| {
                BenchError::Configuration(format!("tuple parameter without components: {param}"))
            })?
            .iter()
            .map(parse_param)
            .collect::<Result<Vec<_>, _>>()?;
        let mut ty = AbiType::Tuple(members);
        let mut suffix = rest;
        while let Some(next) = suffix.strip_prefix("[]") {
            ty = AbiType::Array(Box::new(ty));
            suffix = next;
        }
        if !suffix.is_empty() {
            return Err(BenchError::Configuration(format!(
                "unsupported ABI type suffix: {type_str}"
            )));
        }
        return Ok(ty);
    }

    AbiType::parse(type_str).map_err(|err| BenchError::Configuration(err.to_string()))
}

impl ContractAbi {
    /// Parses a contract ABI from its JSON representation.
    pub fn from_value(value: &Value) -> Result<Self, BenchError> {
        let entries = value
            .as_array()
            .ok_or_else(|| BenchError::Configuration("contract ABI must be an array".to_string()))?;

        let mut functions = Vec::new();
        let mut events = Vec::new();
        for entry in entries {
            match entry["type"].as_str() {
                Some("function") => {
                    let name = entry["name"]
                        .as_str()
                        .ok_or_else(|| {
                            BenchError::Configuration("function entry without name".to_string())
                        })?
                        .to_string();
                    let inputs = entry["inputs"]
                        .as_array()
                        .map(|params| params.iter().map(parse_param).collect())
                        .unwrap_or_else(|| Ok(Vec::new()))?;
                    let outputs = entry["outputs"]
                        .as_array()
                        .map(|params| params.iter().map(parse_param).collect())
                        .unwrap_or_else(|| Ok(Vec::new()))?;
                    functions.push(FunctionAbi {
                        name,
                        inputs,
                        outputs,
                    });
                }
                Some("event") => {
                    let name = entry["name"]
                        .as_str()
                        .ok_or_else(|| {
                            BenchError::Configuration("event entry without name".to_string())
                        })?
                        .to_string();
                    let inputs = entry["inputs"]
                        .as_array()
                        .map(|params| {
                            params
                                .iter()
                                .map(|param| {
                                    Ok((
                                        parse_param(param)?,
                                        param["indexed"].as_bool().unwrap_or(false),
                                    ))
                                })
                                .collect::<Result<Vec<_>, BenchError>>()
                        })
                        .unwrap_or_else(|| Ok(Vec::new()))?;
                    events.push(EventAbi { name, inputs });
                }
                _ => {}
            }
        }

        Ok(Self {
            functions,
            events,
            raw: value.clone(),
        })
    }

    /// Looks up a function by name.
    pub fn function(&self, name: &str) -> Result<&FunctionAbi, BenchError> {
        self.functions
            .iter()
            .find(|function| function.name == name)
            .ok_or_else(|| BenchError::ProtocolRuntime(format!("contract has no function {name}")))
    }

    /// Looks up an event by name.
    pub fn event(&self, name: &str) -> Result<&EventAbi, BenchError> {
        self.events
            .iter()
            .find(|event| event.name == name)
            .ok_or_else(|| BenchError::ProtocolRuntime(format!("contract has no event {name}")))
    }

    /// Resolves call data against this ABI: the matching function plus its
    /// decoded arguments.
    pub fn decode_function_input(
        &self,
        data: &[u8],
    ) -> Result<(&FunctionAbi, Vec<Token>), BenchError> {
        if data.len() < 4 {
            return Err(BenchError::ProtocolRuntime(
                "call data shorter than a selector".to_string(),
            ));
        }
        for function in &self.functions {
            if function.selector() == data[..4] {
                let args = function.decode_input(&data[4..])?;
                return Ok((function, args));
            }
        }
        Err(BenchError::ProtocolRuntime(format!(
            "no function matches selector 0x{}",
            hex::encode(&data[..4])
        )))
    }

    /// The raw ABI JSON (forwarded to the peer in one-shot Fairswap).
    pub fn raw(&self) -> &Value {
        &self.raw
    }
}

/// A contract with its ABI, optionally its creation bytecode and, once
/// deployed or received from the peer, its address.
#[derive(Debug, Clone)]
pub struct Contract {
    /// Contract name, as reported by the compiler.
    pub name: String,
    abi: ContractAbi,
    bytecode: Option<Vec<u8>>,
    address: Option<Address>,
}

impl Contract {
    /// A compiled, not yet deployed contract.
    pub fn new(name: impl Into<String>, abi: ContractAbi, bytecode: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            abi,
            bytecode: Some(bytecode),
            address: None,
        }
    }

    /// A handle onto an already deployed contract.
    pub fn at(name: impl Into<String>, abi: ContractAbi, address: Address) -> Self {
        Self {
            name: name.into(),
            abi,
            bytecode: None,
            address: Some(address),
        }
    }

    /// Parsed ABI surface.
    pub fn abi(&self) -> &ContractAbi {
        &self.abi
    }

    /// Creation bytecode, if this handle was produced by the compiler.
    pub fn bytecode(&self) -> Option<&[u8]> {
        self.bytecode.as_deref()
    }

    /// Deployment address; an error before deployment.
    pub fn address(&self) -> Result<Address, BenchError> {
        self.address.ok_or_else(|| {
            BenchError::ProtocolRuntime(format!("contract {} is not deployed", self.name))
        })
    }

    /// Records the deployment address.
    pub fn set_address(&mut self, address: Address) {
        self.address = Some(address);
    }

    /// Serializes the handle for another process (or the peer): name, ABI,
    /// optional bytecode and optional address.
    pub fn export(&self) -> Value {
        let mut value = serde_json::json!({
            "name": self.name,
            "abi": self.abi.raw(),
        });
        if let Some(bytecode) = &self.bytecode {
            value["bytecode"] = Value::String(hex::encode(bytecode));
        }
        if let Some(address) = self.address {
            value["address"] = Value::String(address.to_hex());
        }
        value
    }

    /// Rebuilds a handle serialized with [`Contract::export`].
    pub fn import(value: &Value) -> Result<Self, BenchError> {
        let name = value["name"]
            .as_str()
            .ok_or_else(|| BenchError::ProtocolRuntime("contract export without name".to_string()))?
            .to_string();
        let abi = ContractAbi::from_value(&value["abi"])?;
        let bytecode = match value["bytecode"].as_str() {
            Some(text) => Some(hex::decode(text).map_err(|err| {
                BenchError::ProtocolRuntime(format!("invalid exported bytecode: {err}"))
            })?),
            None => None,
        };
        let address = match value["address"].as_str() {
            Some(text) => Some(text.parse::<Address>().map_err(BenchError::ProtocolRuntime)?),
            None => None,
        };
        Ok(Self {
            name,
            abi,
            bytecode,
            address,
        })
    }
}

/// Collects Solidity source files and compiles them through an external
/// `solc` executable.
#[derive(Debug, Default)]
pub struct SoliditySourceSet {
    sources: Vec<PathBuf>,
    allow_paths: Vec<PathBuf>,
}

impl SoliditySourceSet {
    /// Empty source set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one source file.
    pub fn add_source(&mut self, path: impl AsRef<Path>) {
        self.sources.push(path.as_ref().to_path_buf());
    }

    /// Allows `solc` to read imports below `path`.
    pub fn allow_path(&mut self, path: impl AsRef<Path>) {
        self.allow_paths.push(path.as_ref().to_path_buf());
    }

    /// Compiles all collected sources, returning contracts by name.
    pub fn compile(&self, solc: &str) -> Result<BTreeMap<String, Contract>, BenchError> {
        let mut command = Command::new(solc);
        command.arg("--combined-json").arg("abi,bin");
        if !self.allow_paths.is_empty() {
            let joined = self
                .allow_paths
                .iter()
                .map(|path| path.display().to_string())
                .collect::<Vec<_>>()
                .join(",");
            command.arg("--allow-paths").arg(joined);
        }
        for source in &self.sources {
            command.arg(source);
        }

        let output = command.output().map_err(|err| {
            BenchError::Configuration(format!("failed to run {solc}: {err}"))
        })?;
        if !output.status.success() {
            return Err(BenchError::Configuration(format!(
                "{solc} failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        let combined: Value = serde_json::from_slice(&output.stdout).map_err(|err| {
            BenchError::Configuration(format!("unreadable solc output: {err}"))
        })?;
        let contracts = combined["contracts"].as_object().ok_or_else(|| {
            BenchError::Configuration("solc output without contracts".to_string())
        })?;

        let mut result = BTreeMap::new();
        for (identifier, body) in contracts {
            let name = identifier
                .rsplit(':')
                .next()
                .unwrap_or(identifier)
                .to_string();
            // Older solc releases emit the ABI as an embedded JSON string.
            let abi_value = match &body["abi"] {
                Value::String(text) => serde_json::from_str(text).map_err(|err| {
                    BenchError::Configuration(format!("unreadable ABI for {name}: {err}"))
                })?,
                other => other.clone(),
            };
            let abi = ContractAbi::from_value(&abi_value)?;
            let bytecode_hex = body["bin"].as_str().ok_or_else(|| {
                BenchError::Configuration(format!("missing bytecode for {name}"))
            })?;
            let bytecode = hex::decode(bytecode_hex).map_err(|err| {
                BenchError::Configuration(format!("invalid bytecode for {name}: {err}"))
            })?;
            result.insert(name.clone(), Contract::new(name, abi, bytecode));
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_abi() -> Value {
        json!([
            {
                "type": "function",
                "name": "accept",
                "inputs": [],
                "outputs": [],
                "stateMutability": "payable",
            },
            {
                "type": "function",
                "name": "revealKey",
                "inputs": [{"name": "_key", "type": "bytes32"}],
                "outputs": [],
            },
            {
                "type": "function",
                "name": "holdings",
                "inputs": [{"name": "fundingID", "type": "bytes32"}],
                "outputs": [{"name": "", "type": "uint256"}],
            },
            {
                "type": "function",
                "name": "register",
                "inputs": [
                    {
                        "name": "channel",
                        "type": "tuple",
                        "components": [
                            {"name": "version", "type": "uint64"},
                            {"name": "participants", "type": "address[]"},
                        ],
                    },
                    {"name": "subChannels", "type": "tuple[]", "components": [
                        {"name": "id", "type": "bytes32"},
                    ]},
                ],
                "outputs": [],
            },
            {
                "type": "event",
                "name": "ChannelUpdate",
                "inputs": [
                    {"name": "channelID", "type": "bytes32", "indexed": true},
                    {"name": "version", "type": "uint64", "indexed": false},
                ],
            },
        ])
    }

    #[test]
    fn parses_functions_and_events() {
        let abi = ContractAbi::from_value(&sample_abi()).unwrap();
        assert!(abi.function("accept").is_ok());
        assert!(abi.function("missing").is_err());
        let register = abi.function("register").unwrap();
        assert_eq!(
            register.inputs[0].canonical(),
            "(uint64,address[])"
        );
        assert_eq!(register.inputs[1].canonical(), "(bytes32)[]");
        let event = abi.event("ChannelUpdate").unwrap();
        assert_eq!(
            hex::encode(event.topic()),
            hex::encode(crate::abi::signature_digest(
                "ChannelUpdate",
                &[AbiType::FixedBytes(32), AbiType::Uint(64)]
            ))
        );
    }

    #[test]
    fn call_encoding_roundtrip() {
        let abi = ContractAbi::from_value(&sample_abi()).unwrap();
        let reveal = abi.function("revealKey").unwrap();
        let key = [7u8; 32];
        let data = reveal.encode_call(&[Token::FixedBytes(key)]).unwrap();
        assert_eq!(data.len(), 4 + 32);
        let (function, args) = abi.decode_function_input(&data).unwrap();
        assert_eq!(function.name, "revealKey");
        assert_eq!(args, vec![Token::FixedBytes(key)]);
    }

    #[test]
    fn encode_call_checks_arity() {
        let abi = ContractAbi::from_value(&sample_abi()).unwrap();
        let reveal = abi.function("revealKey").unwrap();
        assert!(reveal.encode_call(&[]).is_err());
    }

    #[test]
    fn contract_address_lifecycle() {
        let abi = ContractAbi::from_value(&sample_abi()).unwrap();
        let mut contract = Contract::new("FileSale", abi, vec![0x60]);
        assert!(contract.address().is_err());
        contract.set_address(Address([3u8; 20]));
        assert_eq!(contract.address().unwrap(), Address([3u8; 20]));
    }

    #[test]
    fn export_import_roundtrip() {
        let abi = ContractAbi::from_value(&sample_abi()).unwrap();
        let mut contract = Contract::new("FileSale", abi, vec![0x60, 0x80]);
        contract.set_address(Address([4u8; 20]));
        let imported = Contract::import(&contract.export()).unwrap();
        assert_eq!(imported.name, "FileSale");
        assert_eq!(imported.address().unwrap(), Address([4u8; 20]));
        assert_eq!(imported.bytecode(), Some([0x60u8, 0x80].as_slice()));
        assert!(imported.abi().function("accept").is_ok());
    }
}
