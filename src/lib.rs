//! fairbench: benchmarking blockchain-based fair-exchange protocols.
//!
//! The crate simulates a seller selling a file to a buyer atomically
//! against payment, mediated by smart-contract adjudicators on an
//! EVM-compatible chain. Three protocol families are implemented: the
//! one-shot Fairswap contract, its reusable session-based variant, and a
//! Perun-style state channel embedding the file sale as signed off-chain
//! state transitions with on-chain dispute fallback.
//!
//! Each party runs as an isolated OS process; their off-chain traffic is
//! relayed through an instrumented forwarder and every iteration is
//! accounted for in wall-clock and CPU time, relay traffic, transaction
//! counts, gas and balance deltas.

/// Ethereum contract ABI codec.
pub mod abi;
/// Typed adapter over the EVM JSON-RPC boundary.
pub mod chain;
/// Perun-style channel types, signatures and dispute records.
pub mod channel;
/// Contract handles, ABI parsing and the delegated Solidity compiler.
pub mod contracts;
/// Keccak-256 and the position-indexed XOR cipher.
pub mod crypto;
/// Fairswap verifiable encoding, forgeries and decoding diagnostics.
pub mod encoding;
/// Per-role chain endpoint and wallet configuration.
pub mod environments;
/// Central error taxonomy.
pub mod errors;
/// The file-sale app state embedded in channel states.
pub mod file_sale;
/// Binary Merkle trees over Keccak-256.
pub mod merkle;
/// Framed JSON object streams and the instrumented forwarder.
pub mod p2p;
/// Isolated party processes with resource accounting.
pub mod process;
/// Protocol implementations and their registry.
pub mod protocols;
/// Simulation orchestration and result aggregation.
pub mod simulation;
/// secp256k1 wallets and EIP-191 signatures.
pub mod wallet;

pub use abi::{Address, Token};
pub use crypto::{crypt, keccak, Digest, B032};
pub use encoding::{decode, encode, DecodingError, DigestMismatch, MismatchKind};
pub use errors::BenchError;
pub use merkle::{mt2obj, mt2obj_hex, obj2mt, obj2mt_hex, MerkleTree};
pub use simulation::{Simulation, SimulationResult, SimulationResultCollector};
