//! Relay configuration: chains, token domains, submission strategy, gas thresholds,
//! sponsorship limits and timeouts.
//!
//! Loaded from the JSON file named by `RELAY_CONFIG_PATH`, or from built-in defaults for
//! Celo, Celo Alfajores, Base and Base Sepolia. RPC URLs are taken from `RPC_URL_<chainId>`
//! when the file does not provide one.

use alloy::primitives::{Address, address};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

use crate::from_env;
use crate::types::EvmAddress;

/// Default token symbol when a request does not name one.
pub const DEFAULT_TOKEN: &str = "USDC";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid RPC URL in {var}: {source}")]
    RpcUrl {
        var: String,
        #[source]
        source: url::ParseError,
    },
    #[error("chain {0} is configured more than once")]
    DuplicateChain(u64),
    #[error("chain {chain_id}: token {symbol} is configured more than once")]
    DuplicateToken { chain_id: u64, symbol: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayConfig {
    pub chains: Vec<ChainConfig>,
    #[serde(default)]
    pub sponsorship: SponsorshipConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    #[serde(default)]
    pub rpc_url: Option<Url>,
    #[serde(default = "default_true")]
    pub eip1559: bool,
    #[serde(default)]
    pub submission: SubmissionStrategy,
    #[serde(default = "default_confirmations")]
    pub confirmations: u64,
    pub tokens: Vec<TokenConfig>,
    pub gas: GasConfig,
}

impl ChainConfig {
    /// Case-insensitive lookup by symbol, or by contract address.
    pub fn token(&self, identity: &str) -> Option<&TokenConfig> {
        let by_address = EvmAddress::from_str(identity).ok();
        self.tokens.iter().find(|token| {
            token.symbol.eq_ignore_ascii_case(identity) || Some(token.address) == by_address
        })
    }
}

/// How the relay gets a `transferWithAuthorization` onto a chain.
///
/// Some RPC endpoints answer `eth_call`/`eth_estimateGas` unreliably; those chains submit
/// directly with a fixed gas limit instead of simulating first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum SubmissionStrategy {
    /// Simulate with `eth_call`, then send. When the simulation itself cannot be performed
    /// (transport failure), send with `fallback_gas_limit` if one is set.
    #[serde(rename_all = "camelCase")]
    SimulateThenSubmit { fallback_gas_limit: Option<u64> },
    /// Skip simulation and send with an explicit gas limit.
    #[serde(rename_all = "camelCase")]
    DirectSubmit { gas_limit: u64 },
}

impl Default for SubmissionStrategy {
    fn default() -> Self {
        SubmissionStrategy::SimulateThenSubmit {
            fallback_gas_limit: None,
        }
    }
}

/// A token deployment plus its EIP-712 domain parameters.
///
/// `domain_name` must equal the contract's own `name()` as used in its domain separator;
/// it differs between deployments of the same token.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenConfig {
    pub symbol: String,
    pub address: EvmAddress,
    pub domain_name: String,
    pub domain_version: String,
    pub decimals: u32,
}

/// Native-gas thresholds, in wei.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GasConfig {
    /// Minimum balance the relay account must hold before it submits.
    pub min_relay_balance: u128,
    /// Amount sent per sponsorship drip.
    pub drip_amount: u128,
    /// Accounts at or above this balance are told they already have gas.
    pub sponsor_threshold: u128,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SponsorshipConfig {
    pub max_drips_per_period: u32,
    pub period_secs: u64,
    /// Fixed wait after requesting a top-up of the relay account, before the single re-check.
    pub top_up_wait_secs: u64,
}

impl Default for SponsorshipConfig {
    fn default() -> Self {
        Self {
            max_drips_per_period: 3,
            period_secs: 86_400,
            top_up_wait_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeoutConfig {
    pub rpc_secs: u64,
    pub receipt_secs: u64,
}

impl TimeoutConfig {
    pub fn rpc(&self) -> Duration {
        Duration::from_secs(self.rpc_secs)
    }

    pub fn receipt(&self) -> Duration {
        Duration::from_secs(self.receipt_secs)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            rpc_secs: 10,
            receipt_secs: 60,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_confirmations() -> u64 {
    1
}

fn usdc(address: Address, domain_name: &str) -> TokenConfig {
    TokenConfig {
        symbol: DEFAULT_TOKEN.to_string(),
        address: EvmAddress(address),
        domain_name: domain_name.to_string(),
        domain_version: "2".to_string(),
        decimals: 6,
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        const CELO_GAS: GasConfig = GasConfig {
            min_relay_balance: 50_000_000_000_000_000,
            drip_amount: 10_000_000_000_000_000,
            sponsor_threshold: 5_000_000_000_000_000,
        };
        const BASE_GAS: GasConfig = GasConfig {
            min_relay_balance: 1_000_000_000_000_000,
            drip_amount: 100_000_000_000_000,
            sponsor_threshold: 50_000_000_000_000,
        };
        Self {
            chains: vec![
                ChainConfig {
                    chain_id: 42220,
                    name: "celo".to_string(),
                    rpc_url: None,
                    eip1559: true,
                    submission: SubmissionStrategy::DirectSubmit { gas_limit: 150_000 },
                    confirmations: 1,
                    tokens: vec![usdc(address!("0xcebA9300f2b948710d2653dD7B07f33A8B32118C"), "USDC")],
                    gas: CELO_GAS,
                },
                ChainConfig {
                    chain_id: 44787,
                    name: "celo-alfajores".to_string(),
                    rpc_url: None,
                    eip1559: true,
                    submission: SubmissionStrategy::DirectSubmit { gas_limit: 150_000 },
                    confirmations: 1,
                    tokens: vec![usdc(address!("0x2F25deB3848C207fc8E0c34035B3Ba7fC157602B"), "USDC")],
                    gas: CELO_GAS,
                },
                ChainConfig {
                    chain_id: 8453,
                    name: "base".to_string(),
                    rpc_url: None,
                    eip1559: true,
                    submission: SubmissionStrategy::SimulateThenSubmit {
                        fallback_gas_limit: Some(120_000),
                    },
                    confirmations: 1,
                    tokens: vec![usdc(address!("0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913"), "USD Coin")],
                    gas: BASE_GAS,
                },
                ChainConfig {
                    chain_id: 84532,
                    name: "base-sepolia".to_string(),
                    rpc_url: None,
                    eip1559: true,
                    submission: SubmissionStrategy::SimulateThenSubmit {
                        fallback_gas_limit: Some(120_000),
                    },
                    confirmations: 1,
                    tokens: vec![usdc(address!("0x036CbD53842c5426634e7929541eC2318f3dCF7e"), "USDC")],
                    gas: BASE_GAS,
                },
            ],
            sponsorship: SponsorshipConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Loads the file named by `RELAY_CONFIG_PATH` (or the defaults), then fills missing RPC
    /// URLs from `RPC_URL_<chainId>`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(from_env::ENV_RELAY_CONFIG_PATH) {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        config.apply_rpc_env()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: RelayConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for chain in &self.chains {
            if !seen.insert(chain.chain_id) {
                return Err(ConfigError::DuplicateChain(chain.chain_id));
            }
            let mut symbols = std::collections::HashSet::new();
            for token in &chain.tokens {
                if !symbols.insert(token.symbol.to_ascii_uppercase()) {
                    return Err(ConfigError::DuplicateToken {
                        chain_id: chain.chain_id,
                        symbol: token.symbol.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn apply_rpc_env(&mut self) -> Result<(), ConfigError> {
        for chain in self.chains.iter_mut() {
            if chain.rpc_url.is_some() {
                continue;
            }
            let var = from_env::rpc_env_name(chain.chain_id);
            if let Ok(raw) = std::env::var(&var) {
                let url = Url::parse(raw.trim())
                    .map_err(|source| ConfigError::RpcUrl { var: var.clone(), source })?;
                chain.rpc_url = Some(url);
            }
        }
        Ok(())
    }

    pub fn chain(&self, chain_id: u64) -> Option<&ChainConfig> {
        self.chains.iter().find(|chain| chain.chain_id == chain_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_domains_differ_per_chain() {
        let config = RelayConfig::default();
        let celo = config.chain(42220).unwrap().token("usdc").unwrap();
        let base = config.chain(8453).unwrap().token("USDC").unwrap();
        assert_eq!(celo.domain_name, "USDC");
        assert_eq!(base.domain_name, "USD Coin");
        assert_eq!(celo.domain_version, "2");
        assert_eq!(base.decimals, 6);
    }

    #[test]
    fn token_lookup_by_address() {
        let config = RelayConfig::default();
        let chain = config.chain(42220).unwrap();
        let token = chain
            .token("0xceba9300f2b948710d2653dd7b07f33a8b32118c")
            .unwrap();
        assert_eq!(token.symbol, "USDC");
        assert!(chain.token("DAI").is_none());
    }

    #[test]
    fn parses_json_config_with_defaults() {
        let raw = r#"{
            "chains": [{
                "chainId": 42220,
                "name": "celo",
                "rpcUrl": "https://forno.celo.org",
                "submission": {"mode": "directSubmit", "gasLimit": 200000},
                "tokens": [{
                    "symbol": "USDC",
                    "address": "0xcebA9300f2b948710d2653dD7B07f33A8B32118C",
                    "domainName": "USDC",
                    "domainVersion": "2",
                    "decimals": 6
                }],
                "gas": {"minRelayBalance": 1000, "dripAmount": 10, "sponsorThreshold": 5}
            }],
            "sponsorship": {"maxDripsPerPeriod": 1}
        }"#;
        let config = RelayConfig::from_json(raw).unwrap();
        let chain = config.chain(42220).unwrap();
        assert_eq!(
            chain.submission,
            SubmissionStrategy::DirectSubmit { gas_limit: 200_000 }
        );
        assert!(chain.eip1559);
        assert_eq!(chain.confirmations, 1);
        assert_eq!(config.sponsorship.max_drips_per_period, 1);
        assert_eq!(config.sponsorship.period_secs, 86_400);
        assert_eq!(config.timeouts.rpc_secs, 10);
    }

    #[test]
    fn rejects_duplicate_chains() {
        let mut config = RelayConfig::default();
        config.chains.push(config.chains[0].clone());
        let raw = serde_json::to_string(&config).unwrap();
        assert!(matches!(
            RelayConfig::from_json(&raw),
            Err(ConfigError::DuplicateChain(42220))
        ));
    }
}
