//! Chain access for the relay.
//!
//! Everything the relay needs from a network goes through [`ChainClient`]: balances,
//! simulation, submission, receipts, sponsorship drips and the token's own view of its
//! EIP-712 domain. [`evm::EvmChainClient`] talks JSON-RPC through Alloy; tests use a scripted
//! fake.

use alloy::primitives::{B256, U256};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use crate::config::RelayConfig;
use crate::timestamp::UnixTimestamp;
use crate::types::{EvmAddress, EvmSignature, HexEncodedNonce, TokenAmount, TransactionHash};

pub mod evm;

/// Failure of a single chain interaction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    /// The call did not complete within its deadline.
    #[error("{operation} timed out after {seconds}s")]
    Timeout {
        operation: &'static str,
        seconds: u64,
    },
    /// The node could not be reached or returned garbage.
    #[error("transport error: {0}")]
    Transport(String),
    /// The node answered with an error, e.g. `insufficient funds` or `nonce too low`.
    #[error("rejected by node: {0}")]
    Rejected(String),
    /// Contract execution reverted.
    #[error("execution reverted: {0}")]
    Reverted(String),
}

impl ChainError {
    /// Failures unrelated to the chain's own logic.
    pub fn is_network(&self) -> bool {
        matches!(self, ChainError::Timeout { .. } | ChainError::Transport(_))
    }
}

/// Result of a read that may legitimately be unavailable, e.g. on RPC endpoints that do not
/// serve `eth_call` reliably. Unavailability is an outcome, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadResult<T> {
    Available(T),
    Unavailable(String),
}

impl<T> ReadResult<T> {
    pub fn available(self) -> Option<T> {
        match self {
            ReadResult::Available(value) => Some(value),
            ReadResult::Unavailable(_) => None,
        }
    }
}

impl<T> From<Result<T, ChainError>> for ReadResult<T> {
    fn from(result: Result<T, ChainError>) -> Self {
        match result {
            Ok(value) => ReadResult::Available(value),
            Err(error) => ReadResult::Unavailable(error.to_string()),
        }
    }
}

/// An ERC-3009 `transferWithAuthorization` call, ready to encode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferCall {
    pub token: EvmAddress,
    pub from: EvmAddress,
    pub to: EvmAddress,
    pub value: TokenAmount,
    pub valid_after: UnixTimestamp,
    pub valid_before: UnixTimestamp,
    pub nonce: HexEncodedNonce,
    pub signature: EvmSignature,
}

/// How much gas to attach when sending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GasLimit {
    /// Let the node estimate.
    Estimate,
    /// Use an explicit limit and skip estimation.
    Fixed(u64),
}

impl Display for GasLimit {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            GasLimit::Estimate => f.write_str("estimate"),
            GasLimit::Fixed(limit) => write!(f, "{limit}"),
        }
    }
}

/// Final on-chain outcome of a broadcast transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiptOutcome {
    pub tx_hash: TransactionHash,
    pub success: bool,
}

/// A per-chain signing context: one relay account, one RPC endpoint.
///
/// Implementations serialize their own sends so the relay account's transaction nonces never
/// collide.
#[async_trait]
pub trait ChainClient: Send + Sync {
    fn chain_id(&self) -> u64;

    /// Address of the relay account that pays gas on this chain.
    fn relay_address(&self) -> EvmAddress;

    async fn native_balance(&self, account: EvmAddress) -> Result<U256, ChainError>;

    /// Dry-runs the transfer from the relay account. `Err(Reverted)` carries the revert text.
    async fn simulate_transfer(&self, call: &TransferCall) -> Result<(), ChainError>;

    /// Broadcasts the transfer and returns its hash without waiting for inclusion.
    async fn send_transfer(
        &self,
        call: &TransferCall,
        gas_limit: GasLimit,
    ) -> Result<TransactionHash, ChainError>;

    async fn wait_for_receipt(&self, tx_hash: TransactionHash)
    -> Result<ReceiptOutcome, ChainError>;

    /// Sends native currency from the relay account; used for sponsorship drips.
    async fn send_native(&self, to: EvmAddress, amount: U256)
    -> Result<TransactionHash, ChainError>;

    /// The token contract's `DOMAIN_SEPARATOR()`.
    async fn domain_separator(&self, token: EvmAddress) -> Result<B256, ChainError>;

    /// The token contract's `authorizationState(authorizer, nonce)`: whether the nonce is
    /// already consumed on-chain.
    async fn authorization_state(
        &self,
        token: EvmAddress,
        authorizer: EvmAddress,
        nonce: HexEncodedNonce,
    ) -> ReadResult<bool>;
}

/// Configured chain clients keyed by chain id.
#[derive(Clone, Default)]
pub struct ChainRegistry {
    clients: HashMap<u64, Arc<dyn ChainClient>>,
}

impl ChainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, client: Arc<dyn ChainClient>) {
        self.clients.insert(client.chain_id(), client);
    }

    pub fn by_chain_id(&self, chain_id: u64) -> Option<&Arc<dyn ChainClient>> {
        self.clients.get(&chain_id)
    }

    pub fn chain_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.clients.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Connects every chain that has an RPC URL, sharing one relay key.
    ///
    /// Chains without an RPC URL are skipped with a warning.
    pub async fn from_config(
        config: &RelayConfig,
        signer: alloy::signers::local::PrivateKeySigner,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let mut registry = ChainRegistry::new();
        for chain in &config.chains {
            let Some(rpc_url) = chain.rpc_url.as_ref() else {
                tracing::warn!(chain_id = chain.chain_id, chain = %chain.name, "no RPC URL configured, skipping");
                continue;
            };
            let client =
                evm::EvmChainClient::try_new(chain, rpc_url, signer.clone(), config.timeouts)
                    .await?;
            registry.insert(Arc::new(client));
        }
        Ok(registry)
    }
}

impl std::fmt::Debug for ChainRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainRegistry")
            .field("chain_ids", &self.chain_ids())
            .finish()
    }
}
