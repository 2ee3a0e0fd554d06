//! Scripted chain and fixtures shared by unit tests.

use alloy::primitives::{Address, B256, U256};
use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::authorization::{SignedAuthorization, TransferAuthorization};
use crate::chain::{ChainClient, ChainError, GasLimit, ReadResult, ReceiptOutcome, TransferCall};
use crate::domain::ResolvedToken;
use crate::gas::{GasSponsor, SponsorError};
use crate::timestamp::UnixTimestamp;
use crate::types::{EvmAddress, EvmSignature, HexEncodedNonce, TokenAmount, TransactionHash};

pub fn address(byte: u8) -> EvmAddress {
    EvmAddress(Address::repeat_byte(byte))
}

pub fn signer(byte: u8) -> PrivateKeySigner {
    PrivateKeySigner::from_bytes(&B256::repeat_byte(byte)).unwrap()
}

/// A record-shaped authorization with a placeholder signature, for ledger tests.
pub fn record_fixture(
    chain_id: u64,
    from: u8,
    to: u8,
    nonce: u8,
    valid_before: u64,
) -> SignedAuthorization {
    let mut signature = [0x11u8; 65];
    signature[64] = 27;
    SignedAuthorization {
        chain_id,
        token: address(0xcc),
        message: TransferAuthorization::new(
            address(from),
            address(to),
            TokenAmount(U256::from(10_000u64)),
            UnixTimestamp(0),
            UnixTimestamp(valid_before),
            HexEncodedNonce([nonce; 32]),
        )
        .unwrap(),
        signature: EvmSignature(signature),
    }
}

/// Signs a transfer under `resolved`'s domain with an explicit window and nonce.
pub async fn signed_transfer(
    resolved: &ResolvedToken,
    user: &PrivateKeySigner,
    to: EvmAddress,
    value: u64,
    valid_after: u64,
    valid_before: u64,
    nonce: u8,
) -> SignedAuthorization {
    use alloy::signers::Signer;
    let message = TransferAuthorization::new(
        EvmAddress(user.address()),
        to,
        TokenAmount(U256::from(value)),
        UnixTimestamp(valid_after),
        UnixTimestamp(valid_before),
        HexEncodedNonce([nonce; 32]),
    )
    .unwrap();
    let signature = user
        .sign_hash(&message.signing_hash(&resolved.domain))
        .await
        .unwrap();
    SignedAuthorization {
        chain_id: resolved.chain_id,
        token: resolved.address(),
        message,
        signature: EvmSignature::from(signature),
    }
}

struct FakeState {
    balances: HashMap<EvmAddress, U256>,
    simulation: Result<(), ChainError>,
    send_failures: VecDeque<ChainError>,
    receipt: Result<bool, ChainError>,
    scripted_receipts: HashMap<TransactionHash, VecDeque<Result<bool, ChainError>>>,
    domain_separator: B256,
    authorization_state: ReadResult<bool>,
    send_delay: Duration,
    sends: Vec<(TransferCall, GasLimit)>,
    simulations: usize,
    drips: Vec<(EvmAddress, U256)>,
    next_tx: u64,
}

/// In-memory [`ChainClient`] whose every answer can be scripted.
///
/// Defaults: relay account funded with 1 native unit, simulations pass, sends succeed with
/// distinct hashes, receipts succeed, `authorizationState` is `false`.
pub struct FakeChain {
    chain_id: u64,
    relay: EvmAddress,
    state: Mutex<FakeState>,
}

impl FakeChain {
    pub fn new(chain_id: u64) -> Self {
        let relay = address(0xee);
        let mut balances = HashMap::new();
        balances.insert(relay, U256::from(10u64).pow(U256::from(18u64)));
        Self {
            chain_id,
            relay,
            state: Mutex::new(FakeState {
                balances,
                simulation: Ok(()),
                send_failures: VecDeque::new(),
                receipt: Ok(true),
                scripted_receipts: HashMap::new(),
                domain_separator: B256::ZERO,
                authorization_state: ReadResult::Available(false),
                send_delay: Duration::ZERO,
                sends: Vec::new(),
                simulations: 0,
                drips: Vec::new(),
                next_tx: 1,
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn set_balance(&self, account: EvmAddress, wei: u128) {
        self.state().balances.insert(account, U256::from(wei));
    }

    pub fn set_simulation(&self, result: Result<(), ChainError>) {
        self.state().simulation = result;
    }

    /// The next send fails with `error`; later sends are unaffected.
    pub fn push_send_failure(&self, error: ChainError) {
        self.state().send_failures.push_back(error);
    }

    pub fn set_receipt(&self, result: Result<bool, ChainError>) {
        self.state().receipt = result;
    }

    /// Answers for `tx_hash` in order; the last answer repeats.
    pub fn script_receipt(&self, tx_hash: TransactionHash, results: Vec<Result<bool, ChainError>>) {
        self.state()
            .scripted_receipts
            .insert(tx_hash, results.into_iter().collect());
    }

    pub fn set_domain_separator(&self, separator: B256) {
        self.state().domain_separator = separator;
    }

    pub fn set_authorization_state(&self, state: ReadResult<bool>) {
        self.state().authorization_state = state;
    }

    pub fn set_send_delay(&self, delay: Duration) {
        self.state().send_delay = delay;
    }

    pub fn sends(&self) -> Vec<(TransferCall, GasLimit)> {
        self.state().sends.clone()
    }

    pub fn simulation_count(&self) -> usize {
        self.state().simulations
    }

    pub fn drips(&self) -> Vec<(EvmAddress, U256)> {
        self.state().drips.clone()
    }

    fn next_hash(state: &mut FakeState) -> TransactionHash {
        let hash = TransactionHash(U256::from(state.next_tx).to_be_bytes::<32>());
        state.next_tx += 1;
        hash
    }
}

#[async_trait]
impl ChainClient for FakeChain {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn relay_address(&self) -> EvmAddress {
        self.relay
    }

    async fn native_balance(&self, account: EvmAddress) -> Result<U256, ChainError> {
        Ok(self.state().balances.get(&account).copied().unwrap_or_default())
    }

    async fn simulate_transfer(&self, _call: &TransferCall) -> Result<(), ChainError> {
        let mut state = self.state();
        state.simulations += 1;
        state.simulation.clone()
    }

    async fn send_transfer(
        &self,
        call: &TransferCall,
        gas_limit: GasLimit,
    ) -> Result<TransactionHash, ChainError> {
        let delay = self.state().send_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state();
        if let Some(error) = state.send_failures.pop_front() {
            return Err(error);
        }
        state.sends.push((call.clone(), gas_limit));
        Ok(Self::next_hash(&mut state))
    }

    async fn wait_for_receipt(
        &self,
        tx_hash: TransactionHash,
    ) -> Result<ReceiptOutcome, ChainError> {
        let mut state = self.state();
        let result = match state.scripted_receipts.get_mut(&tx_hash) {
            Some(script) if script.len() > 1 => script.pop_front(),
            Some(script) => script.front().cloned(),
            None => None,
        };
        let success = result.unwrap_or_else(|| state.receipt.clone())?;
        Ok(ReceiptOutcome { tx_hash, success })
    }

    async fn send_native(&self, to: EvmAddress, amount: U256) -> Result<TransactionHash, ChainError> {
        let mut state = self.state();
        state.drips.push((to, amount));
        let balance = state.balances.entry(to).or_default();
        *balance += amount;
        Ok(Self::next_hash(&mut state))
    }

    async fn domain_separator(&self, _token: EvmAddress) -> Result<B256, ChainError> {
        Ok(self.state().domain_separator)
    }

    async fn authorization_state(
        &self,
        _token: EvmAddress,
        _authorizer: EvmAddress,
        _nonce: HexEncodedNonce,
    ) -> ReadResult<bool> {
        self.state().authorization_state.clone()
    }
}

/// Top-up service that funds the account on a [`FakeChain`] when asked.
pub struct FakeSponsor {
    chain: Option<Arc<FakeChain>>,
    amount: u128,
    calls: AtomicUsize,
}

impl FakeSponsor {
    pub fn funding(chain: Arc<FakeChain>, amount: u128) -> Self {
        Self {
            chain: Some(chain),
            amount,
            calls: AtomicUsize::new(0),
        }
    }

    /// Accepts requests but never funds anything.
    pub fn idle() -> Self {
        Self {
            chain: None,
            amount: 0,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GasSponsor for FakeSponsor {
    async fn request_top_up(&self, _chain_id: u64, account: EvmAddress) -> Result<(), SponsorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(chain) = &self.chain {
            chain.set_balance(account, self.amount);
        }
        Ok(())
    }
}
