//! Central error taxonomy for the benchmark harness.
//!
//! Transient chain failures are retried inside the chain adapter; whatever
//! reaches this taxonomy is surfaced to the caller. A party process that
//! fails with any of these logs the error and exits non-zero, and the
//! simulation proceeds with the next iteration.

use thiserror::Error;

use crate::chain::rpc::{TransactionDraft, TransactionReceipt};

/// Top-level error for simulation, protocol and chain operations.
#[derive(Debug, Error)]
pub enum BenchError {
    /// User-supplied configuration is invalid; abort the simulation.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The environments file cannot be read, parsed or is empty.
    #[error("environments configuration error: {0}")]
    EnvironmentsConfiguration(String),

    /// An on-chain interaction failed: RPC failure, non-success receipt
    /// status, or a receipt that never materialized after retries.
    #[error("environment runtime error: {message}")]
    EnvironmentRuntime {
        /// Human-readable failure description.
        message: String,
        /// The transaction we attempted to send, when one exists.
        draft: Option<TransactionDraft>,
        /// The receipt that reported the failure, when one was obtained.
        receipt: Option<TransactionReceipt>,
    },

    /// Protocol parameters are inconsistent; abort the iteration.
    #[error("protocol initialization error: {0}")]
    ProtocolInitialization(String),

    /// A protocol invariant was violated at run time.
    #[error("protocol runtime error: {0}")]
    ProtocolRuntime(String),

    /// A wait elapsed without its predicate becoming true.
    #[error("timed out: {0}")]
    Timeout(String),
}

impl BenchError {
    /// Shorthand for an environment runtime error without transaction
    /// context.
    pub fn environment(message: impl Into<String>) -> Self {
        Self::EnvironmentRuntime {
            message: message.into(),
            draft: None,
            receipt: None,
        }
    }
}

impl From<crate::abi::AbiError> for BenchError {
    fn from(err: crate::abi::AbiError) -> Self {
        Self::environment(err.to_string())
    }
}

impl From<crate::wallet::WalletError> for BenchError {
    fn from(err: crate::wallet::WalletError) -> Self {
        Self::ProtocolRuntime(err.to_string())
    }
}

impl From<crate::p2p::P2pError> for BenchError {
    fn from(err: crate::p2p::P2pError) -> Self {
        match err {
            crate::p2p::P2pError::Timeout => Self::Timeout("p2p receive".to_string()),
            other => Self::ProtocolRuntime(other.to_string()),
        }
    }
}
