//! Ethereum contract ABI codec.
//!
//! Covers the value shapes the harness exchanges with its contracts:
//! unsigned integers up to 256 bits (carried as `u128`), booleans,
//! addresses, `bytes32`, dynamic `bytes`, dynamic arrays and (nested)
//! tuples. Encoding follows the standard head/tail layout so that hashes
//! over encodings match the EVM side byte for byte.

use std::{error::Error, fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::crypto::{keccak, Digest};

/// 20-byte Ethereum account or contract address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address(pub [u8; 20]);

impl Address {
    /// The all-zero address.
    pub const ZERO: Address = Address([0u8; 20]);

    /// Renders the address as a lowercase `0x`-prefixed hex string.
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for Address {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(input.trim_start_matches("0x"))
            .map_err(|err| format!("invalid address hex: {err}"))?;
        if bytes.len() != 20 {
            return Err(format!("address must be 20 bytes, got {}", bytes.len()));
        }
        let mut out = [0u8; 20];
        out.copy_from_slice(&bytes);
        Ok(Address(out))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// ABI value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// Unsigned integer word (`uintN`); the harness never exceeds `u128`.
    Uint(u128),
    /// Boolean word.
    Bool(bool),
    /// Address word.
    Address(Address),
    /// `bytes32` word.
    FixedBytes(Digest),
    /// Dynamic byte string.
    Bytes(Vec<u8>),
    /// Dynamic array of homogeneous values.
    Array(Vec<Token>),
    /// Fixed sequence of heterogeneous values.
    Tuple(Vec<Token>),
}

/// ABI type descriptor, mirrored from contract ABI JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbiType {
    /// `uintN` with `N` bits.
    Uint(usize),
    /// `bool`.
    Bool,
    /// `address`.
    Address,
    /// `bytes32`.
    FixedBytes(usize),
    /// `bytes`.
    Bytes,
    /// `T[]`.
    Array(Box<AbiType>),
    /// `(T1,...,Tn)`.
    Tuple(Vec<AbiType>),
}

/// Codec failures.
#[derive(Debug, Clone)]
pub enum AbiError {
    /// Encoded data ended prematurely or an offset points out of range.
    Truncated,
    /// A decoded word does not fit the target representation.
    ValueOutOfRange(String),
    /// A type string or ABI JSON fragment could not be understood.
    UnsupportedType(String),
}

impl fmt::Display for AbiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "ABI data truncated or offset out of range"),
            Self::ValueOutOfRange(what) => write!(f, "ABI value out of range: {what}"),
            Self::UnsupportedType(what) => write!(f, "unsupported ABI type: {what}"),
        }
    }
}

impl Error for AbiError {}

impl AbiType {
    /// Parses a Solidity type string (`uint256`, `address[]`, ...).
    /// Struct parameters arrive as `tuple`, resolved by the caller through
    /// their `components`, so plain `tuple` is rejected here.
    pub fn parse(input: &str) -> Result<Self, AbiError> {
        if let Some(element) = input.strip_suffix("[]") {
            return Ok(AbiType::Array(Box::new(AbiType::parse(element)?)));
        }
        match input {
            "bool" => Ok(AbiType::Bool),
            "address" => Ok(AbiType::Address),
            "bytes" => Ok(AbiType::Bytes),
            "uint" => Ok(AbiType::Uint(256)),
            _ => {
                if let Some(bits) = input.strip_prefix("uint") {
                    let bits: usize = bits
                        .parse()
                        .map_err(|_| AbiError::UnsupportedType(input.to_string()))?;
                    if bits == 0 || bits > 256 || bits % 8 != 0 {
                        return Err(AbiError::UnsupportedType(input.to_string()));
                    }
                    return Ok(AbiType::Uint(bits));
                }
                if let Some(size) = input.strip_prefix("bytes") {
                    let size: usize = size
                        .parse()
                        .map_err(|_| AbiError::UnsupportedType(input.to_string()))?;
                    if size != 32 {
                        return Err(AbiError::UnsupportedType(input.to_string()));
                    }
                    return Ok(AbiType::FixedBytes(size));
                }
                Err(AbiError::UnsupportedType(input.to_string()))
            }
        }
    }

    /// Canonical type string used in function and event signatures.
    pub fn canonical(&self) -> String {
        match self {
            Self::Uint(bits) => format!("uint{bits}"),
            Self::Bool => "bool".to_string(),
            Self::Address => "address".to_string(),
            Self::FixedBytes(size) => format!("bytes{size}"),
            Self::Bytes => "bytes".to_string(),
            Self::Array(element) => format!("{}[]", element.canonical()),
            Self::Tuple(members) => {
                let inner: Vec<String> = members.iter().map(AbiType::canonical).collect();
                format!("({})", inner.join(","))
            }
        }
    }

    fn is_dynamic(&self) -> bool {
        match self {
            Self::Bytes | Self::Array(_) => true,
            Self::Tuple(members) => members.iter().any(AbiType::is_dynamic),
            _ => false,
        }
    }

    /// Head size in bytes when the type is encoded inline.
    fn head_size(&self) -> usize {
        match self {
            Self::Tuple(members) if !self.is_dynamic() => {
                members.iter().map(AbiType::head_size).sum()
            }
            _ => 32,
        }
    }
}

fn token_is_dynamic(token: &Token) -> bool {
    match token {
        Token::Bytes(_) | Token::Array(_) => true,
        Token::Tuple(members) => members.iter().any(token_is_dynamic),
        _ => false,
    }
}

fn uint_word(value: u128) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[16..].copy_from_slice(&value.to_be_bytes());
    word
}

/// Encodes a sequence of values the way function arguments are encoded.
pub fn encode_tokens(tokens: &[Token]) -> Vec<u8> {
    let head_total: usize = tokens.iter().map(token_head_size).sum();
    let mut head = Vec::with_capacity(head_total);
    let mut tail = Vec::new();

    for token in tokens {
        if token_is_dynamic(token) {
            head.extend_from_slice(&uint_word((head_total + tail.len()) as u128));
            tail.extend_from_slice(&encode_body(token));
        } else {
            head.extend_from_slice(&encode_body(token));
        }
    }

    head.extend_from_slice(&tail);
    head
}

fn token_head_size(token: &Token) -> usize {
    match token {
        Token::Tuple(members) if !token_is_dynamic(token) => {
            members.iter().map(token_head_size).sum()
        }
        _ => 32,
    }
}

fn encode_body(token: &Token) -> Vec<u8> {
    match token {
        Token::Uint(value) => uint_word(*value).to_vec(),
        Token::Bool(value) => uint_word(u128::from(*value)).to_vec(),
        Token::Address(address) => {
            let mut word = [0u8; 32];
            word[12..].copy_from_slice(&address.0);
            word.to_vec()
        }
        Token::FixedBytes(bytes) => bytes.to_vec(),
        Token::Bytes(data) => {
            let mut out = uint_word(data.len() as u128).to_vec();
            out.extend_from_slice(data);
            let padding = (32 - data.len() % 32) % 32;
            out.extend(std::iter::repeat(0u8).take(padding));
            out
        }
        Token::Array(elements) => {
            let mut out = uint_word(elements.len() as u128).to_vec();
            out.extend_from_slice(&encode_tokens(elements));
            out
        }
        Token::Tuple(members) => encode_tokens(members),
    }
}

/// Computes the 4-byte function selector for `name` over `inputs`.
pub fn function_selector(name: &str, inputs: &[AbiType]) -> [u8; 4] {
    let digest = signature_digest(name, inputs);
    let mut selector = [0u8; 4];
    selector.copy_from_slice(&digest[..4]);
    selector
}

/// Computes the Keccak digest of a function or event signature; events use
/// the full digest as their topic zero.
pub fn signature_digest(name: &str, inputs: &[AbiType]) -> Digest {
    let types: Vec<String> = inputs.iter().map(AbiType::canonical).collect();
    keccak(format!("{}({})", name, types.join(",")).as_bytes())
}

/// Decodes a value sequence previously encoded with [`encode_tokens`].
pub fn decode_tokens(types: &[AbiType], data: &[u8]) -> Result<Vec<Token>, AbiError> {
    let mut tokens = Vec::with_capacity(types.len());
    let mut offset = 0usize;
    for ty in types {
        if ty.is_dynamic() {
            let pointer = read_usize(data, offset)?;
            tokens.push(decode_body(ty, data, pointer)?);
            offset += 32;
        } else {
            tokens.push(decode_body(ty, data, offset)?);
            offset += ty.head_size();
        }
    }
    Ok(tokens)
}

fn read_word(data: &[u8], offset: usize) -> Result<[u8; 32], AbiError> {
    if offset + 32 > data.len() {
        return Err(AbiError::Truncated);
    }
    let mut word = [0u8; 32];
    word.copy_from_slice(&data[offset..offset + 32]);
    Ok(word)
}

fn read_usize(data: &[u8], offset: usize) -> Result<usize, AbiError> {
    let word = read_word(data, offset)?;
    if word[..24].iter().any(|byte| *byte != 0) {
        return Err(AbiError::ValueOutOfRange("offset".to_string()));
    }
    Ok(u64::from_be_bytes(word[24..].try_into().unwrap()) as usize)
}

fn decode_body(ty: &AbiType, data: &[u8], offset: usize) -> Result<Token, AbiError> {
    match ty {
        AbiType::Uint(_) => {
            let word = read_word(data, offset)?;
            if word[..16].iter().any(|byte| *byte != 0) {
                return Err(AbiError::ValueOutOfRange("uint exceeds u128".to_string()));
            }
            Ok(Token::Uint(u128::from_be_bytes(word[16..].try_into().unwrap())))
        }
        AbiType::Bool => {
            let word = read_word(data, offset)?;
            Ok(Token::Bool(word[31] != 0))
        }
        AbiType::Address => {
            let word = read_word(data, offset)?;
            let mut address = [0u8; 20];
            address.copy_from_slice(&word[12..]);
            Ok(Token::Address(Address(address)))
        }
        AbiType::FixedBytes(_) => Ok(Token::FixedBytes(read_word(data, offset)?)),
        AbiType::Bytes => {
            let length = read_usize(data, offset)?;
            if offset + 32 + length > data.len() {
                return Err(AbiError::Truncated);
            }
            Ok(Token::Bytes(data[offset + 32..offset + 32 + length].to_vec()))
        }
        AbiType::Array(element) => {
            let length = read_usize(data, offset)?;
            if offset + 32 > data.len() || length > data.len() {
                return Err(AbiError::Truncated);
            }
            let body = &data[offset + 32..];
            let types: Vec<AbiType> = vec![(**element).clone(); length];
            Ok(Token::Array(decode_tokens(&types, body)?))
        }
        AbiType::Tuple(members) => {
            if offset > data.len() {
                return Err(AbiError::Truncated);
            }
            let body = &data[offset..];
            Ok(Token::Tuple(decode_tokens(members, body)?))
        }
    }
}

impl Token {
    /// Unwraps an integer token.
    pub fn as_uint(&self) -> Result<u128, AbiError> {
        match self {
            Token::Uint(value) => Ok(*value),
            other => Err(AbiError::ValueOutOfRange(format!("expected uint, got {other:?}"))),
        }
    }

    /// Unwraps a boolean token.
    pub fn as_bool(&self) -> Result<bool, AbiError> {
        match self {
            Token::Bool(value) => Ok(*value),
            other => Err(AbiError::ValueOutOfRange(format!("expected bool, got {other:?}"))),
        }
    }

    /// Unwraps an address token.
    pub fn as_address(&self) -> Result<Address, AbiError> {
        match self {
            Token::Address(address) => Ok(*address),
            other => Err(AbiError::ValueOutOfRange(format!(
                "expected address, got {other:?}"
            ))),
        }
    }

    /// Unwraps a `bytes32` token.
    pub fn as_fixed_bytes(&self) -> Result<Digest, AbiError> {
        match self {
            Token::FixedBytes(bytes) => Ok(*bytes),
            other => Err(AbiError::ValueOutOfRange(format!(
                "expected bytes32, got {other:?}"
            ))),
        }
    }

    /// Unwraps a dynamic bytes token.
    pub fn as_bytes(&self) -> Result<&[u8], AbiError> {
        match self {
            Token::Bytes(data) => Ok(data),
            other => Err(AbiError::ValueOutOfRange(format!(
                "expected bytes, got {other:?}"
            ))),
        }
    }

    /// Unwraps a tuple token.
    pub fn as_tuple(&self) -> Result<&[Token], AbiError> {
        match self {
            Token::Tuple(members) => Ok(members),
            other => Err(AbiError::ValueOutOfRange(format!(
                "expected tuple, got {other:?}"
            ))),
        }
    }

    /// Unwraps an array token.
    pub fn as_array(&self) -> Result<&[Token], AbiError> {
        match self {
            Token::Array(elements) => Ok(elements),
            other => Err(AbiError::ValueOutOfRange(format!(
                "expected array, got {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_parsing_and_display() {
        let address: Address = "0x00112233445566778899aabbccddeeff00112233".parse().unwrap();
        assert_eq!(address.to_hex(), "0x00112233445566778899aabbccddeeff00112233");
        assert!("0x1234".parse::<Address>().is_err());
    }

    #[test]
    fn static_values_encode_as_words() {
        let encoded = encode_tokens(&[Token::Uint(1), Token::Bool(true)]);
        assert_eq!(encoded.len(), 64);
        assert_eq!(encoded[31], 1);
        assert_eq!(encoded[63], 1);
    }

    #[test]
    fn known_selector() {
        let selector = function_selector(
            "transfer",
            &[AbiType::Address, AbiType::Uint(256)],
        );
        assert_eq!(hex::encode(selector), "a9059cbb");
    }

    #[test]
    fn dynamic_bytes_layout() {
        let encoded = encode_tokens(&[Token::Bytes(vec![0xaa; 5])]);
        // offset word, length word, one padded content word
        assert_eq!(encoded.len(), 96);
        assert_eq!(encoded[31], 0x20);
        assert_eq!(encoded[63], 5);
        assert_eq!(&encoded[64..69], &[0xaa; 5]);
        assert_eq!(&encoded[69..96], &[0u8; 27]);
    }

    #[test]
    fn dynamic_tuple_is_offset_at_top_level() {
        // A tuple containing an array is dynamic, so the top-level encoding
        // starts with the 0x20 offset word, matching eth_abi behavior.
        let tuple = Token::Tuple(vec![
            Token::Uint(7),
            Token::Array(vec![Token::Uint(1), Token::Uint(2)]),
        ]);
        let encoded = encode_tokens(&[tuple]);
        assert_eq!(encoded[31], 0x20);
        assert_eq!(encoded[63], 7);
    }

    #[test]
    fn static_tuple_is_inlined() {
        let tuple = Token::Tuple(vec![
            Token::FixedBytes([1u8; 32]),
            Token::Uint(5),
        ]);
        let encoded = encode_tokens(&[tuple]);
        assert_eq!(encoded.len(), 64);
        assert_eq!(encoded[0], 1);
    }

    #[test]
    fn decode_roundtrip_nested() {
        let ty = AbiType::Tuple(vec![
            AbiType::FixedBytes(32),
            AbiType::Uint(64),
            AbiType::Tuple(vec![
                AbiType::Array(Box::new(AbiType::Address)),
                AbiType::Array(Box::new(AbiType::Array(Box::new(AbiType::Uint(256))))),
            ]),
            AbiType::Bytes,
            AbiType::Bool,
        ]);
        let value = Token::Tuple(vec![
            Token::FixedBytes([9u8; 32]),
            Token::Uint(3),
            Token::Tuple(vec![
                Token::Array(vec![Token::Address(Address([7u8; 20]))]),
                Token::Array(vec![Token::Array(vec![Token::Uint(10), Token::Uint(20)])]),
            ]),
            Token::Bytes(vec![1, 2, 3]),
            Token::Bool(true),
        ]);
        let encoded = encode_tokens(std::slice::from_ref(&value));
        let decoded = decode_tokens(std::slice::from_ref(&ty), &encoded).unwrap();
        assert_eq!(decoded, vec![value]);
    }

    #[test]
    fn type_parsing() {
        assert_eq!(AbiType::parse("uint256").unwrap(), AbiType::Uint(256));
        assert_eq!(AbiType::parse("uint").unwrap(), AbiType::Uint(256));
        assert_eq!(
            AbiType::parse("bytes32[]").unwrap(),
            AbiType::Array(Box::new(AbiType::FixedBytes(32)))
        );
        assert!(AbiType::parse("tuple").is_err());
        assert!(AbiType::parse("int256").is_err());
    }

    #[test]
    fn canonical_signatures() {
        let ty = AbiType::Tuple(vec![
            AbiType::Uint(256),
            AbiType::Array(Box::new(AbiType::Address)),
        ]);
        assert_eq!(ty.canonical(), "(uint256,address[])");
    }
}
