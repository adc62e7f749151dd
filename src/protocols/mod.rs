//! Fair-exchange protocol implementations and their registry.
//!
//! Protocols and strategies are looked up through a compile-time table
//! mapping protocol name to a constructor and per-role strategy names; CLI
//! listing and resolution are plain table operations.

pub mod fairswap;
pub mod fairswap_reusable;
pub mod state_channel;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::abi::Address;
use crate::chain::Environment;
use crate::errors::BenchError;
use crate::p2p::JsonObjectStream;

/// Which side of the exchange a party plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// The selling party.
    Seller,
    /// The buying party.
    Buyer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Seller => write!(f, "seller"),
            Self::Buyer => write!(f, "buyer"),
        }
    }
}

/// Parameters shared by all protocols plus free-form per-protocol extras
/// (`-p KEY VALUE` on the command line).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolParams {
    /// File to be exchanged.
    pub filename: PathBuf,
    /// Price in wei the buyer pays per exchange.
    pub price: u128,
    /// Additional protocol-specific parameters.
    pub extra: BTreeMap<String, String>,
}

impl ProtocolParams {
    /// Size of the exchanged file in bytes.
    pub fn file_size(&self) -> Result<u64, BenchError> {
        Ok(std::fs::metadata(&self.filename)
            .map_err(|err| {
                BenchError::ProtocolInitialization(format!(
                    "{}: {err}",
                    self.filename.display()
                ))
            })?
            .len())
    }

    /// Reads the exchanged file.
    pub fn read_file(&self) -> Result<Vec<u8>, BenchError> {
        std::fs::read(&self.filename).map_err(|err| {
            BenchError::ProtocolRuntime(format!("{}: {err}", self.filename.display()))
        })
    }

    /// Fetches an extra parameter parsed as an integer.
    pub fn extra_u64(&self, key: &str, default: u64) -> Result<u64, BenchError> {
        match self.extra.get(key) {
            None => Ok(default),
            Some(text) => text.parse().map_err(|_| {
                BenchError::ProtocolInitialization(format!(
                    "parameter {key} must be an integer, got '{text}'"
                ))
            }),
        }
    }

    /// Fetches an extra parameter parsed as a wei amount.
    pub fn extra_u128(&self, key: &str, default: u128) -> Result<u128, BenchError> {
        match self.extra.get(key) {
            None => Ok(default),
            Some(text) => text.parse().map_err(|_| {
                BenchError::ProtocolInitialization(format!(
                    "parameter {key} must be an integer, got '{text}'"
                ))
            }),
        }
    }

    /// Fetches an extra string parameter.
    pub fn extra_str(&self, key: &str, default: &str) -> String {
        self.extra
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }

    /// Rejects parameters no protocol constructor consumed.
    pub fn ensure_known_keys(&self, allowed: &[&str]) -> Result<(), BenchError> {
        for key in self.extra.keys() {
            if !allowed.contains(&key.as_str()) {
                return Err(BenchError::Configuration(format!(
                    "unknown protocol parameter '{key}' (supported: {})",
                    allowed.join(", ")
                )));
            }
        }
        Ok(())
    }
}

/// A per-role state machine executing one side of the exchange.
///
/// Strategies own every piece of protocol context they need (addresses,
/// compiled contracts, channel parameters) and never reference back into
/// the protocol object.
pub trait Strategy {
    /// Runs the party to completion for one iteration.
    fn run(
        &mut self,
        environment: &Environment,
        p2p: &mut JsonObjectStream,
        opposite: Address,
    ) -> Result<(), BenchError>;
}

/// A fair-exchange protocol: simulation/iteration lifecycle hooks executed
/// by the operator, plus strategy construction for the party processes.
pub trait Protocol {
    /// Deploys per-simulation contracts; runs once in the parent.
    fn set_up_simulation(
        &mut self,
        operator: &Environment,
        seller: Address,
        buyer: Address,
    ) -> Result<(), BenchError> {
        let _ = (operator, seller, buyer);
        Ok(())
    }

    /// Prepares one iteration (fresh channel parameters and the like).
    fn set_up_iteration(
        &mut self,
        operator: &Environment,
        seller: Address,
        buyer: Address,
    ) -> Result<(), BenchError> {
        let _ = (operator, seller, buyer);
        Ok(())
    }

    /// Cleans up after one iteration.
    fn tear_down_iteration(
        &mut self,
        operator: &Environment,
        seller: Address,
        buyer: Address,
    ) -> Result<(), BenchError> {
        let _ = (operator, seller, buyer);
        Ok(())
    }

    /// Cleans up after the whole simulation.
    fn tear_down_simulation(
        &mut self,
        operator: &Environment,
        seller: Address,
        buyer: Address,
    ) -> Result<(), BenchError> {
        let _ = (operator, seller, buyer);
        Ok(())
    }

    /// Serializes the per-iteration state a party process needs.
    fn snapshot(&self) -> Result<Value, BenchError>;

    /// Restores a snapshot inside a party process.
    fn restore(&mut self, snapshot: &Value) -> Result<(), BenchError>;

    /// Builds the named strategy for `role`.
    fn make_strategy(&self, role: Role, name: &str) -> Result<Box<dyn Strategy>, BenchError>;
}

/// Constructor type for protocol instances.
pub type ProtocolBuild = fn(ProtocolParams) -> Result<Box<dyn Protocol>, BenchError>;

/// One row of the protocol registry.
pub struct ProtocolSpec {
    /// Protocol name as used on the command line.
    pub name: &'static str,
    /// Instance constructor.
    pub build: ProtocolBuild,
    /// Seller strategy names.
    pub seller_strategies: &'static [&'static str],
    /// Buyer strategy names.
    pub buyer_strategies: &'static [&'static str],
}

impl ProtocolSpec {
    /// Strategy names for one role.
    pub fn strategies(&self, role: Role) -> &'static [&'static str] {
        match role {
            Role::Seller => self.seller_strategies,
            Role::Buyer => self.buyer_strategies,
        }
    }
}

/// The protocol registry, populated at compile time.
pub fn protocol_specs() -> &'static [ProtocolSpec] {
    static SPECS: once_cell::sync::Lazy<Vec<ProtocolSpec>> = once_cell::sync::Lazy::new(|| {
        vec![
            fairswap::spec(),
            fairswap_reusable::spec(),
            state_channel::spec(),
        ]
    });
    &SPECS
}

/// Looks a protocol up by name.
pub fn find_protocol(name: &str) -> Result<&'static ProtocolSpec, BenchError> {
    protocol_specs()
        .iter()
        .find(|spec| spec.name == name)
        .ok_or_else(|| {
            BenchError::Configuration(format!(
                "unknown protocol '{name}' (available: {})",
                protocol_specs()
                    .iter()
                    .map(|spec| spec.name)
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_contains_all_protocols() {
        let names: Vec<_> = protocol_specs().iter().map(|spec| spec.name).collect();
        assert_eq!(
            names,
            vec!["Fairswap", "FairswapReusable", "StateChannelFileSale"]
        );
        assert!(find_protocol("Fairswap").is_ok());
        assert!(find_protocol("NoSuchProtocol").is_err());
    }

    #[test]
    fn every_protocol_has_faithful_strategies() {
        for spec in protocol_specs() {
            assert!(spec.strategies(Role::Seller).contains(&"Faithful"), "{}", spec.name);
            assert!(spec.strategies(Role::Buyer).contains(&"Faithful"), "{}", spec.name);
        }
    }

    #[test]
    fn unknown_extra_parameter_is_rejected() {
        let mut extra = BTreeMap::new();
        extra.insert("bogus".to_string(), "1".to_string());
        let params = ProtocolParams {
            filename: PathBuf::from("/dev/null"),
            price: 1,
            extra,
        };
        assert!(matches!(
            params.ensure_known_keys(&["slice_count", "timeout"]),
            Err(BenchError::Configuration(_))
        ));
    }
}
