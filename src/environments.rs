//! Environments configuration: one chain endpoint and wallet per role.
//!
//! Loaded from a YAML file (`.environments.yaml` by default) with the
//! three roles `operator`, `seller` and `buyer`.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::abi::Address;
use crate::chain::Environment;
use crate::errors::BenchError;
use crate::wallet::Wallet;

/// Fallback endpoint for roles without an explicit URL.
pub const DEFAULT_ENDPOINT_URL: &str = "http://localhost:8545/";

#[derive(Debug, Deserialize)]
struct RawEndpoint {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawWallet {
    address: Option<String>,
    #[serde(rename = "privateKey")]
    private_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawRole {
    endpoint: Option<RawEndpoint>,
    wallet: Option<RawWallet>,
}

#[derive(Debug, Deserialize)]
struct RawEnvironments {
    operator: Option<RawRole>,
    seller: Option<RawRole>,
    buyer: Option<RawRole>,
}

/// Connection settings for one role. Serializable so the parent process
/// can hand a role's settings to its party process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// JSON-RPC endpoint URL.
    pub endpoint_url: String,
    /// Account address, when configured explicitly.
    pub wallet_address: Option<Address>,
    /// Hex private key, when the role signs locally.
    pub private_key: Option<String>,
}

impl EnvironmentConfig {
    /// Builds the wallet described by this configuration.
    pub fn wallet(&self) -> Result<Wallet, BenchError> {
        Wallet::new(self.wallet_address, self.private_key.as_deref()).map_err(|err| {
            BenchError::EnvironmentsConfiguration(err.to_string())
        })
    }

    /// Connects to the configured endpoint.
    pub fn connect(&self) -> Result<Environment, BenchError> {
        Environment::new(&self.endpoint_url, self.wallet()?)
    }
}

fn role_config(role: Option<RawRole>, name: &str) -> Result<EnvironmentConfig, BenchError> {
    let role = role.ok_or_else(|| {
        BenchError::EnvironmentsConfiguration(format!("missing configuration for role {name}"))
    })?;
    let wallet = role.wallet.ok_or_else(|| {
        BenchError::EnvironmentsConfiguration(format!("role {name} has no wallet configuration"))
    })?;
    if wallet.address.is_none() && wallet.private_key.is_none() {
        return Err(BenchError::EnvironmentsConfiguration(format!(
            "role {name} needs a wallet address or private key"
        )));
    }
    let wallet_address = wallet
        .address
        .map(|text| {
            text.parse::<Address>()
                .map_err(BenchError::EnvironmentsConfiguration)
        })
        .transpose()?;
    let endpoint_url = role
        .endpoint
        .and_then(|endpoint| endpoint.url)
        .unwrap_or_else(|| DEFAULT_ENDPOINT_URL.to_string());

    let config = EnvironmentConfig {
        endpoint_url,
        wallet_address,
        private_key: wallet.private_key,
    };
    // Surface address/key mismatches at load time.
    config.wallet()?;
    Ok(config)
}

/// The three role configurations of a simulation.
#[derive(Debug, Clone)]
pub struct EnvironmentsConfiguration {
    /// Deploys contracts and observes balances.
    pub operator: EnvironmentConfig,
    /// The selling party.
    pub seller: EnvironmentConfig,
    /// The buying party.
    pub buyer: EnvironmentConfig,
}

impl EnvironmentsConfiguration {
    /// Loads and validates an environments file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, BenchError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|err| {
            BenchError::EnvironmentsConfiguration(format!("{}: {err}", path.display()))
        })?;
        Self::parse(&contents)
    }

    /// Parses environments YAML.
    pub fn parse(contents: &str) -> Result<Self, BenchError> {
        let raw: RawEnvironments = serde_yaml::from_str(contents).map_err(|err| {
            BenchError::EnvironmentsConfiguration(format!("invalid YAML: {err}"))
        })?;
        Ok(Self {
            operator: role_config(raw.operator, "operator")?,
            seller: role_config(raw.seller, "seller")?,
            buyer: role_config(raw.buyer, "buyer")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "
operator:
  endpoint:
    url: http://localhost:9545/
  wallet:
    privateKey: '0x0000000000000000000000000000000000000000000000000000000000000001'
seller:
  wallet:
    privateKey: '0x0000000000000000000000000000000000000000000000000000000000000002'
buyer:
  wallet:
    address: '0x7e5f4552091a69125d5dfcb7b8c2659029395bdf'
";

    #[test]
    fn parses_all_roles() {
        let config = EnvironmentsConfiguration::parse(SAMPLE).unwrap();
        assert_eq!(config.operator.endpoint_url, "http://localhost:9545/");
        assert_eq!(config.seller.endpoint_url, DEFAULT_ENDPOINT_URL);
        assert!(config.seller.wallet().unwrap().can_sign());
        assert!(!config.buyer.wallet().unwrap().can_sign());
    }

    #[test]
    fn rejects_missing_role() {
        let truncated = "
operator:
  wallet:
    address: '0x7e5f4552091a69125d5dfcb7b8c2659029395bdf'
";
        assert!(matches!(
            EnvironmentsConfiguration::parse(truncated),
            Err(BenchError::EnvironmentsConfiguration(_))
        ));
    }

    #[test]
    fn rejects_empty_wallet() {
        let empty_wallet = "
operator:
  wallet: {}
seller:
  wallet: {}
buyer:
  wallet: {}
";
        assert!(EnvironmentsConfiguration::parse(empty_wallet).is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert!(EnvironmentsConfiguration::parse(": not yaml [").is_err());
    }

    #[test]
    fn missing_file_is_reported() {
        assert!(matches!(
            EnvironmentsConfiguration::load("/nonexistent/environments.yaml"),
            Err(BenchError::EnvironmentsConfiguration(_))
        ));
    }
}
