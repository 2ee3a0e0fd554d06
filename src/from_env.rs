use alloy::signers::local::PrivateKeySigner;
use serde::Deserialize;
use serde::Serialize;
use std::env;
use std::str::FromStr;

pub const ENV_SIGNER_TYPE: &str = "SIGNER_TYPE";
pub const ENV_EVM_PRIVATE_KEY: &str = "EVM_PRIVATE_KEY";

pub const ENV_RELAY_CONFIG_PATH: &str = "RELAY_CONFIG_PATH";
pub const ENV_RELAY_LEDGER_PATH: &str = "RELAY_LEDGER_PATH";
pub const ENV_RELAY_ADMIN_TOKEN: &str = "RELAY_ADMIN_TOKEN";
pub const ENV_GAS_FAUCET_URL: &str = "GAS_FAUCET_URL";

/// Prefix of the per-chain RPC URL variable, e.g. `RPC_URL_42220`.
pub const ENV_RPC_PREFIX: &str = "RPC_URL_";

pub fn rpc_env_name(chain_id: u64) -> String {
    format!("{ENV_RPC_PREFIX}{chain_id}")
}

/// Reads an optional variable, treating an empty value as unset.
pub fn optional(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Supported methods for constructing the relay signer from environment variables.
#[derive(Debug, Hash, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignerType {
    /// A local private key stored in the `EVM_PRIVATE_KEY` environment variable.
    #[serde(rename = "private-key")]
    PrivateKey,
}

impl SignerType {
    /// Parse the signer type from the `SIGNER_TYPE` environment variable.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let signer_type_string =
            env::var(ENV_SIGNER_TYPE).map_err(|_| format!("env {ENV_SIGNER_TYPE} not set"))?;
        match signer_type_string.as_str() {
            "private-key" => Ok(SignerType::PrivateKey),
            _ => Err(format!("Unknown signer type {signer_type_string}").into()),
        }
    }

    /// Constructs the relay's signing key.
    ///
    /// The relay runs a single account shared by every configured chain:
    /// - `SIGNER_TYPE`: currently only `"private-key"` is supported
    /// - `EVM_PRIVATE_KEY`: exactly one hex-encoded private key
    pub fn make_evm_signer(&self) -> Result<PrivateKeySigner, Box<dyn std::error::Error>> {
        match self {
            SignerType::PrivateKey => {
                let raw_key = env::var(ENV_EVM_PRIVATE_KEY)
                    .map_err(|_| format!("env {ENV_EVM_PRIVATE_KEY} not set"))?;
                let raw_key = raw_key.trim();
                if raw_key.is_empty() {
                    return Err(format!("env {ENV_EVM_PRIVATE_KEY} is empty").into());
                }
                if raw_key.contains(',') {
                    return Err(format!(
                        "env {ENV_EVM_PRIVATE_KEY} must contain exactly one private key"
                    )
                    .into());
                }
                let signer = PrivateKeySigner::from_str(raw_key)?;
                Ok(signer)
            }
        }
    }
}
