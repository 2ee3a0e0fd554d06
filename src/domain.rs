//! EIP-712 domain resolution.
//!
//! The domain of a token is configuration, not convention: the same token presents the
//! domain name `"USDC"` on Celo and `"USD Coin"` on Base because each deployment's `name()`
//! differs. [`DomainResolver`] maps `(chainId, token)` to the exact domain, and
//! [`verify_domain_separator`] proves the mapping against the live contract.

use alloy::primitives::B256;
use alloy::sol_types::{Eip712Domain, eip712_domain};
use std::collections::HashMap;

use crate::chain::{ChainClient, ChainError, ChainRegistry};
use crate::config::{ChainConfig, RelayConfig, TokenConfig};
use crate::types::EvmAddress;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("chain {0} is not supported")]
    UnsupportedChain(u64),
    #[error("token {token} is not configured on chain {chain_id}")]
    UnsupportedToken { chain_id: u64, token: String },
    #[error(
        "domain separator mismatch for {symbol} ({token}) on chain {chain_id}: configured {local}, contract reports {on_chain}"
    )]
    SeparatorMismatch {
        chain_id: u64,
        symbol: String,
        token: EvmAddress,
        local: B256,
        on_chain: B256,
    },
    #[error("could not read domain separator on chain {chain_id}: {source}")]
    Chain {
        chain_id: u64,
        #[source]
        source: ChainError,
    },
}

/// A token on a specific chain together with its signing domain.
#[derive(Debug, Clone)]
pub struct ResolvedToken {
    pub chain_id: u64,
    pub token: TokenConfig,
    pub domain: Eip712Domain,
}

impl ResolvedToken {
    pub fn address(&self) -> EvmAddress {
        self.token.address
    }
}

/// Builds the domain `{name, version, chainId, verifyingContract}` for one token deployment.
pub fn domain_for(chain_id: u64, token: &TokenConfig) -> Eip712Domain {
    eip712_domain! {
        name: token.domain_name.clone(),
        version: token.domain_version.clone(),
        chain_id: chain_id,
        verifying_contract: token.address.0,
    }
}

#[derive(Debug, Clone, Default)]
pub struct DomainResolver {
    chains: HashMap<u64, ChainConfig>,
}

impl DomainResolver {
    pub fn from_config(config: &RelayConfig) -> Self {
        let chains = config
            .chains
            .iter()
            .map(|chain| (chain.chain_id, chain.clone()))
            .collect();
        Self { chains }
    }

    /// Resolves by token symbol (case-insensitive) or contract address.
    pub fn resolve(&self, chain_id: u64, token: &str) -> Result<ResolvedToken, DomainError> {
        let config = self
            .chains
            .get(&chain_id)
            .ok_or(DomainError::UnsupportedChain(chain_id))?
            .token(token)
            .ok_or_else(|| DomainError::UnsupportedToken {
                chain_id,
                token: token.to_string(),
            })?;
        Ok(ResolvedToken {
            chain_id,
            domain: domain_for(chain_id, config),
            token: config.clone(),
        })
    }

    /// Every configured `(chainId, token)` pair, ordered by chain id.
    pub fn all(&self) -> Vec<ResolvedToken> {
        let mut chain_ids: Vec<u64> = self.chains.keys().copied().collect();
        chain_ids.sort_unstable();
        chain_ids
            .into_iter()
            .flat_map(|chain_id| {
                self.chains[&chain_id].tokens.iter().map(move |token| ResolvedToken {
                    chain_id,
                    domain: domain_for(chain_id, token),
                    token: token.clone(),
                })
            })
            .collect()
    }
}

/// Compares the configured domain's separator byte-for-byte with the contract's own
/// `DOMAIN_SEPARATOR()`. A mismatch means every signature built from this configuration
/// would be rejected on-chain.
pub async fn verify_domain_separator(
    chain: &dyn ChainClient,
    resolved: &ResolvedToken,
) -> Result<B256, DomainError> {
    let local = resolved.domain.separator();
    let on_chain = chain
        .domain_separator(resolved.address())
        .await
        .map_err(|source| DomainError::Chain {
            chain_id: resolved.chain_id,
            source,
        })?;
    if local != on_chain {
        return Err(DomainError::SeparatorMismatch {
            chain_id: resolved.chain_id,
            symbol: resolved.token.symbol.clone(),
            token: resolved.address(),
            local,
            on_chain,
        });
    }
    Ok(local)
}

/// Tally of a [`verify_all`] run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DomainReport {
    pub verified: usize,
    pub failed: usize,
    pub unreachable: usize,
}

impl DomainReport {
    /// True only when every configured token was checked against its contract and matched.
    pub fn is_clean(&self) -> bool {
        self.verified > 0 && self.failed == 0 && self.unreachable == 0
    }
}

/// Verifies every configured token on its chain. Tokens on chains without a client count as
/// unreachable.
pub async fn verify_all(resolver: &DomainResolver, chains: &ChainRegistry) -> DomainReport {
    let mut report = DomainReport::default();
    for resolved in resolver.all() {
        let Some(chain) = chains.by_chain_id(resolved.chain_id) else {
            report.unreachable += 1;
            tracing::error!(
                chain_id = resolved.chain_id,
                token = %resolved.token.symbol,
                "chain not reachable, token not verified"
            );
            continue;
        };
        match verify_domain_separator(chain.as_ref(), &resolved).await {
            Ok(separator) => {
                report.verified += 1;
                tracing::info!(
                    chain_id = resolved.chain_id,
                    token = %resolved.token.symbol,
                    separator = %separator,
                    "domain separator matches"
                );
            }
            Err(error) => {
                report.failed += 1;
                tracing::error!(
                    chain_id = resolved.chain_id,
                    token = %resolved.token.symbol,
                    error = %error,
                    "domain verification failed"
                );
            }
        }
    }
    report
}
