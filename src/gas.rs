//! Native-gas checks for the relay account and sponsorship drips for users.
//!
//! Before a submission, [`GasSponsorshipGuard::ensure_gas`] verifies the relay account can pay
//! for it. When it cannot, a top-up is requested from the configured [`GasSponsor`], the
//! guard waits a fixed short delay, re-checks once, and otherwise fails `InsufficientGas`.
//!
//! Users can separately ask for a small drip of native gas; drips are limited per recipient
//! and chain over a rolling period.

use alloy::primitives::U256;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;
use url::Url;

use crate::chain::{ChainClient, ChainRegistry};
use crate::config::{GasConfig, RelayConfig, SponsorshipConfig};
use crate::error::RelayError;
use crate::from_env;
use crate::timestamp::{Clock, UnixTimestamp};
use crate::types::{EvmAddress, SponsorResponse};

#[derive(Debug, thiserror::Error)]
pub enum SponsorError {
    #[error("top-up request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid faucet url: {0}")]
    Url(#[from] url::ParseError),
}

/// Something able to fund the relay account out of band.
#[async_trait]
pub trait GasSponsor: Send + Sync {
    async fn request_top_up(&self, chain_id: u64, account: EvmAddress) -> Result<(), SponsorError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TopUpRequest {
    address: EvmAddress,
    chain_id: u64,
}

/// Asks an HTTP faucet to fund an account: `POST {address, chainId}`.
#[derive(Debug, Clone)]
pub struct FaucetSponsor {
    client: reqwest::Client,
    url: Url,
}

impl FaucetSponsor {
    pub fn new(url: Url, timeout: Duration) -> Result<Self, SponsorError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url })
    }

    /// Built from `GAS_FAUCET_URL`, if set.
    pub fn from_env(timeout: Duration) -> Result<Option<Self>, SponsorError> {
        match from_env::optional(from_env::ENV_GAS_FAUCET_URL) {
            Some(raw) => Ok(Some(Self::new(Url::parse(&raw)?, timeout)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl GasSponsor for FaucetSponsor {
    async fn request_top_up(&self, chain_id: u64, account: EvmAddress) -> Result<(), SponsorError> {
        self.client
            .post(self.url.clone())
            .json(&TopUpRequest {
                address: account,
                chain_id,
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Rolling-window drip counter keyed by `(chainId, recipient)`.
#[derive(Debug)]
pub struct DripLimiter {
    max_per_period: u32,
    period_secs: u64,
    drips: DashMap<(u64, EvmAddress), VecDeque<UnixTimestamp>>,
}

impl DripLimiter {
    pub fn new(config: SponsorshipConfig) -> Self {
        Self {
            max_per_period: config.max_drips_per_period,
            period_secs: config.period_secs,
            drips: DashMap::new(),
        }
    }

    /// Reserves a drip at `now`, or returns when the next one becomes available.
    pub fn try_acquire(
        &self,
        chain_id: u64,
        account: EvmAddress,
        now: UnixTimestamp,
    ) -> Result<(), UnixTimestamp> {
        let mut window = self.drips.entry((chain_id, account)).or_default();
        while let Some(oldest) = window.front() {
            if *oldest + self.period_secs <= now {
                window.pop_front();
            } else {
                break;
            }
        }
        if window.len() >= self.max_per_period as usize {
            let next = match window.front() {
                Some(oldest) => *oldest + self.period_secs,
                None => now + self.period_secs,
            };
            return Err(next);
        }
        window.push_back(now);
        Ok(())
    }

    /// Gives back a reservation whose drip was never sent.
    pub fn release(&self, chain_id: u64, account: EvmAddress, at: UnixTimestamp) {
        if let Some(mut window) = self.drips.get_mut(&(chain_id, account)) {
            if let Some(position) = window.iter().rposition(|drip| *drip == at) {
                window.remove(position);
            }
        }
    }
}

pub struct GasSponsorshipGuard {
    chains: ChainRegistry,
    gas: HashMap<u64, GasConfig>,
    top_up_wait: Duration,
    sponsor: Option<Arc<dyn GasSponsor>>,
    limiter: DripLimiter,
    clock: Arc<dyn Clock>,
}

impl GasSponsorshipGuard {
    pub fn new(
        config: &RelayConfig,
        chains: ChainRegistry,
        sponsor: Option<Arc<dyn GasSponsor>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            chains,
            gas: config
                .chains
                .iter()
                .map(|chain| (chain.chain_id, chain.gas))
                .collect(),
            top_up_wait: Duration::from_secs(config.sponsorship.top_up_wait_secs),
            sponsor,
            limiter: DripLimiter::new(config.sponsorship),
            clock,
        }
    }

    fn chain(&self, chain_id: u64) -> Result<(&Arc<dyn ChainClient>, GasConfig), RelayError> {
        let chain = self
            .chains
            .by_chain_id(chain_id)
            .ok_or(RelayError::UnsupportedChain(chain_id))?;
        let gas = self
            .gas
            .get(&chain_id)
            .copied()
            .ok_or(RelayError::UnsupportedChain(chain_id))?;
        Ok((chain, gas))
    }

    /// Succeeds when `account` holds at least the chain's minimum relay balance, topping it
    /// up once if needed.
    #[instrument(skip_all, err, fields(chain_id = chain_id, account = %account))]
    pub async fn ensure_gas(&self, account: EvmAddress, chain_id: u64) -> Result<(), RelayError> {
        let (chain, gas) = self.chain(chain_id)?;
        let minimum = U256::from(gas.min_relay_balance);
        let balance = chain.native_balance(account).await?;
        if balance >= minimum {
            return Ok(());
        }
        let Some(sponsor) = &self.sponsor else {
            tracing::warn!(%balance, %minimum, "relay account below minimum and no sponsor configured");
            return Err(RelayError::InsufficientGas { chain_id, account });
        };
        tracing::warn!(%balance, %minimum, "relay account below minimum, requesting top-up");
        if let Err(error) = sponsor.request_top_up(chain_id, account).await {
            tracing::warn!(%error, "top-up request failed");
        }
        tokio::time::sleep(self.top_up_wait).await;
        let balance = chain.native_balance(account).await?;
        if balance >= minimum {
            tracing::info!(%balance, "relay account topped up");
            Ok(())
        } else {
            Err(RelayError::InsufficientGas { chain_id, account })
        }
    }

    /// Sends a drip of native gas to `address`, unless it already has enough or has used up
    /// its drips for the current period.
    #[instrument(skip_all, err, fields(chain_id = chain_id, address = %address))]
    pub async fn sponsor(
        &self,
        address: EvmAddress,
        chain_id: u64,
    ) -> Result<SponsorResponse, RelayError> {
        let (chain, gas) = self.chain(chain_id)?;
        let balance = chain.native_balance(address).await?;
        if balance >= U256::from(gas.sponsor_threshold) {
            return Ok(SponsorResponse::AlreadyFunded {
                already_has_gas: true,
            });
        }
        let now = self.clock.now()?;
        self.limiter
            .try_acquire(chain_id, address, now)
            .map_err(|next_drip_available| RelayError::RateLimited {
                next_drip_available,
            })?;
        match chain.send_native(address, U256::from(gas.drip_amount)).await {
            Ok(tx_hash) => {
                tracing::info!(%tx_hash, amount = gas.drip_amount, "sponsorship drip sent");
                Ok(SponsorResponse::Dripped { tx_hash })
            }
            Err(error) => {
                self.limiter.release(chain_id, address, now);
                Err(error.into())
            }
        }
    }
}
