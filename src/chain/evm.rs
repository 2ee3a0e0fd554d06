//! JSON-RPC implementation of [`ChainClient`] for EVM chains.
//!
//! - One relay account per chain, shared by every request.
//! - Sends are serialized behind a per-chain lock and use a pending-aware nonce cache, so two
//!   concurrent submissions never reuse a transaction nonce. A `nonce too low` rejection
//!   resyncs the cache from the chain and retries once; any other send failure drops the cached
//!   nonce so the next send refetches it.
//! - Every RPC call runs under an explicit deadline; exceeding it is [`ChainError::Timeout`].

use alloy::network::{EthereumWallet, TransactionBuilder};
use alloy::primitives::{Address, B256, Bytes, FixedBytes, U256};
use alloy::providers::fillers::{
    BlobGasFiller, ChainIdFiller, FillProvider, GasFiller, JoinFill, NonceFiller, NonceManager,
    WalletFiller,
};
use alloy::providers::{
    Identity, PendingTransactionBuilder, PendingTransactionError, Provider, ProviderBuilder,
    RootProvider,
};
use alloy::rpc::client::RpcClient;
use alloy::rpc::json_rpc::RpcError;
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;
use alloy::sol;
use alloy::sol_types::{SolCall, decode_revert_reason};
use alloy::transports::TransportError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::future::{Future, IntoFuture};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::Instrument;
use url::Url;

use crate::chain::{
    ChainClient, ChainError, GasLimit, ReadResult, ReceiptOutcome, TransferCall,
};
use crate::config::{ChainConfig, TimeoutConfig};
use crate::types::{EvmAddress, HexEncodedNonce, TransactionHash};

sol! {
    #[allow(missing_docs)]
    #[allow(clippy::too_many_arguments)]
    #[derive(Debug)]
    #[sol(rpc)]
    interface IEip3009Token {
        function transferWithAuthorization(
            address from,
            address to,
            uint256 value,
            uint256 validAfter,
            uint256 validBefore,
            bytes32 nonce,
            uint8 v,
            bytes32 r,
            bytes32 s
        ) external;
        function authorizationState(address authorizer, bytes32 nonce) external view returns (bool);
        function DOMAIN_SEPARATOR() external view returns (bytes32);
        function name() external view returns (string);
        function version() external view returns (string);
    }
}

/// Gas for a plain native transfer.
const NATIVE_TRANSFER_GAS: u64 = 21_000;

/// Combined filler type for gas, blob gas, nonce, and chain ID.
type InnerFiller = JoinFill<
    GasFiller,
    JoinFill<BlobGasFiller, JoinFill<NonceFiller<PendingNonceManager>, ChainIdFiller>>,
>;

/// The fully composed provider: fillers, wallet signing, and a [`RootProvider`] for JSON-RPC.
pub type InnerProvider = FillProvider<
    JoinFill<JoinFill<Identity, InnerFiller>, WalletFiller<EthereumWallet>>,
    RootProvider,
>;

/// A transaction sent by the relay account.
struct RelayTransaction {
    to: Address,
    calldata: Bytes,
    value: U256,
    gas_limit: GasLimit,
}

#[derive(Debug)]
pub struct EvmChainClient {
    inner: InnerProvider,
    chain_id: u64,
    /// Whether the network supports EIP-1559 gas pricing.
    eip1559: bool,
    relay_address: Address,
    confirmations: u64,
    timeouts: TimeoutConfig,
    /// Shared nonce manager so cached nonces can be resynced on demand.
    nonce_manager: PendingNonceManager,
    send_lock: Mutex<()>,
}

impl EvmChainClient {
    /// Connects to `rpc_url` and checks that the endpoint serves the configured chain.
    pub async fn try_new(
        chain: &ChainConfig,
        rpc_url: &Url,
        signer: PrivateKeySigner,
        timeouts: TimeoutConfig,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let relay_address = signer.address();
        let wallet = EthereumWallet::from(signer);
        let client = RpcClient::builder()
            .connect(rpc_url.as_str())
            .await
            .map_err(|e| format!("Failed to connect to chain {}: {e}", chain.chain_id))?;
        let nonce_manager = PendingNonceManager::default();
        let filler = Self::build_inner_filler(nonce_manager.clone());
        let inner = ProviderBuilder::default()
            .filler(filler)
            .wallet(wallet)
            .connect_client(client);

        let remote_chain_id = deadline("get_chain_id", timeouts.rpc(), async {
            inner.get_chain_id().await.map_err(rpc_error)
        })
        .await?;
        if remote_chain_id != chain.chain_id {
            return Err(format!(
                "RPC endpoint for chain {} reports chain id {remote_chain_id}",
                chain.chain_id
            )
            .into());
        }

        tracing::info!(
            chain_id = chain.chain_id,
            chain = %chain.name,
            relay = %relay_address,
            "Initialized chain client"
        );

        Ok(Self {
            inner,
            chain_id: chain.chain_id,
            eip1559: chain.eip1559,
            relay_address,
            confirmations: chain.confirmations,
            timeouts,
            nonce_manager,
            send_lock: Mutex::new(()),
        })
    }

    fn build_inner_filler(nonce_manager: PendingNonceManager) -> InnerFiller {
        let gas = GasFiller::default();
        let blob = BlobGasFiller::default();
        let nonce = NonceFiller::new(nonce_manager);
        let chain = ChainIdFiller::default();
        let nonce_chain = JoinFill::new(nonce, chain);
        let blob_nonce_chain = JoinFill::new(blob, nonce_chain);
        JoinFill::new(gas, blob_nonce_chain)
    }

    fn contract(&self, token: EvmAddress) -> IEip3009Token::IEip3009TokenInstance<&InnerProvider> {
        IEip3009Token::new(token.0, &self.inner)
    }

    /// Sends one transaction from the relay account while holding the send lock.
    async fn submit_transaction(
        &self,
        tx: &RelayTransaction,
    ) -> Result<TransactionHash, ChainError> {
        let _send_guard = self.send_lock.lock().await;
        let request = self.build_transaction_request(tx, None).await?;

        match self.send_request(request).await {
            Ok(tx_hash) => Ok(tx_hash),
            Err(ChainError::Rejected(message)) if is_nonce_too_low_error(&message) => {
                let latest_nonce = self.sync_nonce_from_chain("nonce-too-low error").await?;
                tracing::warn!(
                    relay = %self.relay_address,
                    latest_nonce,
                    error = %message,
                    "Nonce too low, retrying with latest nonce"
                );
                let retry_request = self.build_transaction_request(tx, Some(latest_nonce)).await?;
                let result = self.send_request(retry_request).await;
                if result.is_err() {
                    self.nonce_manager.reset_nonce(self.relay_address).await;
                }
                result
            }
            Err(error) => {
                tracing::warn!(
                    relay = %self.relay_address,
                    %error,
                    "Send failed, dropping cached nonce",
                );
                self.nonce_manager.reset_nonce(self.relay_address).await;
                Err(error)
            }
        }
    }

    async fn send_request(&self, request: TransactionRequest) -> Result<TransactionHash, ChainError> {
        deadline("send_transaction", self.timeouts.rpc(), async {
            let pending = self.inner.send_transaction(request).await.map_err(rpc_error)?;
            Ok(TransactionHash::from(*pending.tx_hash()))
        })
        .instrument(tracing::info_span!(
            "send_transaction",
            chain_id = self.chain_id,
            otel.kind = "client",
        ))
        .await
    }

    async fn sync_nonce_from_chain(&self, context: &str) -> Result<u64, ChainError> {
        let latest_nonce = deadline("get_transaction_count", self.timeouts.rpc(), async {
            self.inner
                .get_transaction_count(self.relay_address)
                .pending()
                .await
                .map_err(rpc_error)
        })
        .await
        .map_err(|e| ChainError::Transport(format!("Failed to refresh nonce after {context}: {e}")))?;
        self.nonce_manager
            .overwrite_nonce(self.relay_address, latest_nonce)
            .await;
        Ok(latest_nonce)
    }

    async fn build_transaction_request(
        &self,
        tx: &RelayTransaction,
        nonce_override: Option<u64>,
    ) -> Result<TransactionRequest, ChainError> {
        let mut txr = TransactionRequest::default()
            .with_to(tx.to)
            .with_from(self.relay_address)
            .with_value(tx.value)
            .with_input(tx.calldata.clone());

        if let Some(nonce) = nonce_override {
            txr.set_nonce(nonce);
        }
        if let GasLimit::Fixed(limit) = tx.gas_limit {
            txr.set_gas_limit(limit);
        }

        if !self.eip1559 {
            let gas_price: u128 = deadline("get_gas_price", self.timeouts.rpc(), async {
                self.inner.get_gas_price().await.map_err(rpc_error)
            })
            .instrument(tracing::info_span!("get_gas_price", otel.kind = "client"))
            .await?;
            txr.set_gas_price(gas_price);
        }

        Ok(txr)
    }
}

#[async_trait]
impl ChainClient for EvmChainClient {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn relay_address(&self) -> EvmAddress {
        EvmAddress(self.relay_address)
    }

    async fn native_balance(&self, account: EvmAddress) -> Result<U256, ChainError> {
        deadline("get_balance", self.timeouts.rpc(), async {
            self.inner
                .get_balance(account.0)
                .into_future()
                .await
                .map_err(rpc_error)
        })
        .instrument(tracing::info_span!(
            "get_balance",
            chain_id = self.chain_id,
            account = %account,
            otel.kind = "client",
        ))
        .await
    }

    async fn simulate_transfer(&self, call: &TransferCall) -> Result<(), ChainError> {
        let contract = self.contract(call.token);
        let args = TransferArgs::from(call);
        deadline("simulate_transfer", self.timeouts.rpc(), async {
            contract
                .transferWithAuthorization(
                    args.from,
                    args.to,
                    args.value,
                    args.valid_after,
                    args.valid_before,
                    args.nonce,
                    args.v,
                    args.r,
                    args.s,
                )
                .from(self.relay_address)
                .call()
                .await
                .map(|_| ())
                .map_err(contract_error)
        })
        .instrument(tracing::info_span!(
            "simulate_transfer",
            chain_id = self.chain_id,
            token = %call.token,
            from = %call.from,
            nonce = %call.nonce,
            otel.kind = "client",
        ))
        .await
    }

    async fn send_transfer(
        &self,
        call: &TransferCall,
        gas_limit: GasLimit,
    ) -> Result<TransactionHash, ChainError> {
        let args = TransferArgs::from(call);
        let calldata = IEip3009Token::transferWithAuthorizationCall {
            from: args.from,
            to: args.to,
            value: args.value,
            validAfter: args.valid_after,
            validBefore: args.valid_before,
            nonce: args.nonce,
            v: args.v,
            r: args.r,
            s: args.s,
        }
        .abi_encode();
        self.submit_transaction(&RelayTransaction {
            to: call.token.0,
            calldata: calldata.into(),
            value: U256::ZERO,
            gas_limit,
        })
        .instrument(tracing::info_span!(
            "call_transfer_with_authorization",
            chain_id = self.chain_id,
            token = %call.token,
            from = %call.from,
            to = %call.to,
            value = %call.value,
            valid_after = %call.valid_after,
            valid_before = %call.valid_before,
            nonce = %call.nonce,
            gas_limit = %gas_limit,
            otel.kind = "client",
        ))
        .await
    }

    async fn wait_for_receipt(
        &self,
        tx_hash: TransactionHash,
    ) -> Result<ReceiptOutcome, ChainError> {
        let pending = PendingTransactionBuilder::new(self.inner.root().clone(), B256::from(tx_hash.0))
            .with_required_confirmations(self.confirmations);
        let receipt = deadline("wait_for_receipt", self.timeouts.receipt(), async {
            pending.get_receipt().await.map_err(pending_error)
        })
        .instrument(tracing::info_span!(
            "wait_for_receipt",
            chain_id = self.chain_id,
            tx_hash = %tx_hash,
            otel.kind = "client",
        ))
        .await?;
        Ok(ReceiptOutcome {
            tx_hash,
            success: receipt.status(),
        })
    }

    async fn send_native(
        &self,
        to: EvmAddress,
        amount: U256,
    ) -> Result<TransactionHash, ChainError> {
        self.submit_transaction(&RelayTransaction {
            to: to.0,
            calldata: Bytes::new(),
            value: amount,
            gas_limit: GasLimit::Fixed(NATIVE_TRANSFER_GAS),
        })
        .instrument(tracing::info_span!(
            "send_native",
            chain_id = self.chain_id,
            to = %to,
            amount = %amount,
            otel.kind = "client",
        ))
        .await
    }

    async fn domain_separator(&self, token: EvmAddress) -> Result<B256, ChainError> {
        let contract = self.contract(token);
        deadline("domain_separator", self.timeouts.rpc(), async {
            contract
                .DOMAIN_SEPARATOR()
                .call()
                .await
                .map_err(contract_error)
        })
        .instrument(tracing::info_span!(
            "fetch_domain_separator",
            chain_id = self.chain_id,
            token = %token,
            otel.kind = "client",
        ))
        .await
    }

    async fn authorization_state(
        &self,
        token: EvmAddress,
        authorizer: EvmAddress,
        nonce: HexEncodedNonce,
    ) -> ReadResult<bool> {
        let contract = self.contract(token);
        deadline("authorization_state", self.timeouts.rpc(), async {
            contract
                .authorizationState(authorizer.0, FixedBytes(nonce.0))
                .call()
                .await
                .map_err(contract_error)
        })
        .instrument(tracing::info_span!(
            "fetch_authorization_state",
            chain_id = self.chain_id,
            authorizer = %authorizer,
            nonce = %nonce,
            otel.kind = "client",
        ))
        .await
        .into()
    }
}

/// ABI-typed arguments of `transferWithAuthorization`.
struct TransferArgs {
    from: Address,
    to: Address,
    value: U256,
    valid_after: U256,
    valid_before: U256,
    nonce: FixedBytes<32>,
    v: u8,
    r: FixedBytes<32>,
    s: FixedBytes<32>,
}

impl From<&TransferCall> for TransferArgs {
    fn from(call: &TransferCall) -> Self {
        Self {
            from: call.from.0,
            to: call.to.0,
            value: call.value.into(),
            valid_after: call.valid_after.into(),
            valid_before: call.valid_before.into(),
            nonce: FixedBytes(call.nonce.0),
            v: call.signature.v(),
            r: call.signature.r(),
            s: call.signature.s(),
        }
    }
}

/// Runs `future` under a deadline.
async fn deadline<T, F>(operation: &'static str, duration: Duration, future: F) -> Result<T, ChainError>
where
    F: Future<Output = Result<T, ChainError>>,
{
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(ChainError::Timeout {
            operation,
            seconds: duration.as_secs(),
        }),
    }
}

fn is_nonce_too_low_error(err: &str) -> bool {
    err.to_ascii_lowercase().contains("nonce too low")
}

/// Splits JSON-RPC failures into transport problems, node rejections and reverts.
fn rpc_error(error: TransportError) -> ChainError {
    match error {
        RpcError::ErrorResp(payload) => {
            let message = payload.message.to_string();
            let revert_data = payload.as_revert_data();
            if payload.code == 3 || revert_data.is_some() || message.contains("revert") {
                let reason = revert_data
                    .and_then(|data| decode_revert_reason(&data))
                    .map(|reason| format!("{message}: {reason}"))
                    .unwrap_or(message);
                ChainError::Reverted(reason)
            } else {
                ChainError::Rejected(message)
            }
        }
        RpcError::Transport(kind) => ChainError::Transport(kind.to_string()),
        other => ChainError::Transport(other.to_string()),
    }
}

fn contract_error(error: alloy::contract::Error) -> ChainError {
    match error {
        alloy::contract::Error::TransportError(transport) => rpc_error(transport),
        alloy::contract::Error::PendingTransactionError(pending) => pending_error(pending),
        other => ChainError::Reverted(other.to_string()),
    }
}

fn pending_error(error: PendingTransactionError) -> ChainError {
    match error {
        PendingTransactionError::TransportError(transport) => rpc_error(transport),
        other => ChainError::Transport(other.to_string()),
    }
}

/// A nonce manager that starts from the account's `pending` transaction count and then
/// hands out consecutive nonces from a local cache.
///
/// The cache is shared by all clones. Each address has its own lock, so allocation for one
/// account never races with itself; [`PendingNonceManager::overwrite_nonce`] resyncs after a
/// failed send.
#[derive(Clone, Debug, Default)]
pub struct PendingNonceManager {
    nonces: Arc<DashMap<Address, Arc<Mutex<u64>>>>,
}

#[async_trait]
impl NonceManager for PendingNonceManager {
    async fn get_next_nonce<P, N>(
        &self,
        provider: &P,
        address: Address,
    ) -> alloy::transports::TransportResult<u64>
    where
        P: Provider<N>,
        N: alloy::network::Network,
    {
        // Clone the Arc out so the map shard lock is not held across the await below.
        let nonce = {
            let entry = self
                .nonces
                .entry(address)
                .or_insert_with(|| Arc::new(Mutex::new(Self::UNFETCHED)));
            Arc::clone(entry.value())
        };

        let mut nonce = nonce.lock().await;
        let next = if *nonce == Self::UNFETCHED {
            tracing::trace!(%address, "fetching nonce");
            provider.get_transaction_count(address).pending().await?
        } else {
            tracing::trace!(%address, current_nonce = *nonce, "incrementing nonce");
            *nonce + 1
        };
        *nonce = next;
        Ok(next)
    }
}

impl PendingNonceManager {
    /// Sentinel for "not fetched yet".
    const UNFETCHED: u64 = u64::MAX;

    /// Forgets the cached nonce; the next allocation refetches the `pending` count.
    async fn reset_nonce(&self, address: Address) {
        if let Some(nonce) = self.nonces.get(&address).map(|entry| Arc::clone(entry.value())) {
            *nonce.lock().await = Self::UNFETCHED;
        }
    }

    /// Replaces the cached nonce so the next allocation continues from `latest_nonce`.
    ///
    /// The retried request carries `latest_nonce` explicitly, so the cache records it as the
    /// last nonce handed out.
    async fn overwrite_nonce(&self, address: Address, latest_nonce: u64) {
        let entry = self
            .nonces
            .entry(address)
            .or_insert_with(|| Arc::new(Mutex::new(latest_nonce)));
        let mut nonce = entry.value().lock().await;
        *nonce = latest_nonce;
    }
}
