//! Submission of signed authorizations to the chain.
//!
//! [`RelaySubmitter::submit`] walks every failure boundary in order: prior use, the local
//! signature check, the validity window, the ledger record and its in-flight claim, earlier
//! broadcasts, relay gas, the on-chain nonce state, the per-chain submission strategy,
//! broadcast, and finally the receipt, which is reconciled back into the ledger.
//!
//! At most one submission per `(chainId, nonce)` ever reaches the chain from this process:
//! the ledger record is created or matched first, then a claim is taken, and everything from
//! the gas check onward runs under that claim.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{Instrument, instrument};
use tracing_core::Level;

use crate::authorization::{SignedAuthorization, TransferAuthorization, WindowPosition};
use crate::chain::{ChainClient, ChainError, ChainRegistry, GasLimit, ReadResult};
use crate::classify::RevertReason;
use crate::config::{DEFAULT_TOKEN, RelayConfig, SubmissionStrategy};
use crate::domain::{DomainResolver, ResolvedToken};
use crate::error::RelayError;
use crate::gas::GasSponsorshipGuard;
use crate::store::{
    AttemptOutcome, Authorization, AuthorizationStatus, AuthorizationStore, StoreError,
    SubmissionAttempt,
};
use crate::timestamp::{Clock, UnixTimestamp};
use crate::types::{SubmitRequest, TransactionHash};

pub struct RelaySubmitter {
    chains: ChainRegistry,
    strategies: HashMap<u64, SubmissionStrategy>,
    domains: DomainResolver,
    store: Arc<AuthorizationStore>,
    gas: Arc<GasSponsorshipGuard>,
    clock: Arc<dyn Clock>,
}

/// Checks `validAfter <= now < validBefore`.
pub fn check_window(message: &TransferAuthorization, now: UnixTimestamp) -> Result<(), RelayError> {
    match message.window_position(now) {
        WindowPosition::Valid => Ok(()),
        WindowPosition::NotYetValid => Err(RelayError::NotYetValid {
            valid_after: message.valid_after,
            now,
        }),
        WindowPosition::Expired => Err(RelayError::Expired {
            valid_before: message.valid_before,
            now,
        }),
    }
}

impl RelaySubmitter {
    pub fn new(
        config: &RelayConfig,
        chains: ChainRegistry,
        store: Arc<AuthorizationStore>,
        gas: Arc<GasSponsorshipGuard>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            chains,
            strategies: config
                .chains
                .iter()
                .map(|chain| (chain.chain_id, chain.submission))
                .collect(),
            domains: DomainResolver::from_config(config),
            store,
            gas,
            clock,
        }
    }

    pub fn store(&self) -> &Arc<AuthorizationStore> {
        &self.store
    }

    fn chain(&self, chain_id: u64) -> Result<&Arc<dyn ChainClient>, RelayError> {
        self.chains
            .by_chain_id(chain_id)
            .ok_or(RelayError::UnsupportedChain(chain_id))
    }

    /// Turns a wire request into a signed authorization, filling in the default recipient
    /// (the relay account on that chain) and token.
    pub fn authorization_from_request(
        &self,
        request: &SubmitRequest,
    ) -> Result<SignedAuthorization, RelayError> {
        let chain = self.chain(request.chain_id)?;
        let token = request.token.as_deref().unwrap_or(DEFAULT_TOKEN);
        let resolved = self.domains.resolve(request.chain_id, token)?;
        let message = TransferAuthorization::new(
            request.user_address,
            request.to.unwrap_or_else(|| chain.relay_address()),
            request.amount,
            request.valid_after,
            request.valid_before,
            request.nonce,
        )
        .map_err(|_| RelayError::InvalidWindow {
            valid_after: request.valid_after,
            valid_before: request.valid_before,
        })?;
        Ok(SignedAuthorization {
            chain_id: request.chain_id,
            token: resolved.address(),
            message,
            signature: request.signature,
        })
    }

    /// Submits `signed` and returns the hash of the transaction that consumed it.
    #[instrument(skip_all, err, fields(
        chain_id = signed.chain_id,
        from = %signed.message.from,
        nonce = %signed.message.nonce,
    ))]
    pub async fn submit(&self, signed: SignedAuthorization) -> Result<TransactionHash, RelayError> {
        let chain = self.chain(signed.chain_id)?.clone();
        let resolved = self
            .domains
            .resolve(signed.chain_id, &signed.token.to_string())?;

        let now = self.clock.now()?;
        if let Some(existing) = self.existing_record(&signed)? {
            Self::reject_terminal(&existing, now)?;
        }

        // nothing is written for a payload its sender did not sign
        if !signed.is_signed_by_sender(&resolved.domain) {
            return Err(RelayError::InvalidSignature {
                expected: signed.message.from,
                on_chain: false,
            });
        }
        if let Err(error) = check_window(&signed.message, now) {
            self.log_attempt(&signed, AttemptOutcome::Rejected, None, Some(error.code()));
            return Err(error);
        }

        let record = self.store.get_or_create(&signed)?;
        let _claim = self
            .store
            .claim(signed.chain_id, signed.message.nonce)?;
        // a racing request may have finished between get_or_create and the claim
        let record = self.store.get_by_id(record.id)?;
        Self::reject_terminal(&record, now)?;

        if let Some(tx_hash) = self.settle_earlier_broadcasts(chain.as_ref(), &record).await? {
            return Ok(tx_hash);
        }

        self.gas
            .ensure_gas(chain.relay_address(), signed.chain_id)
            .await?;

        if let Some(tx_hash) = self.reconcile_consumed_nonce(chain.as_ref(), &record).await? {
            return Ok(tx_hash);
        }

        let call = signed.transfer_call();
        let gas_limit = match self.gas_limit(chain.as_ref(), &record, &resolved).await {
            Ok(gas_limit) => gas_limit,
            Err(error) => return self.settle_revert(chain.as_ref(), &record, error).await,
        };

        // last look before spending gas
        let broadcast_at = self.clock.now()?;
        let record = self.store.get_by_id(record.id)?;
        Self::reject_terminal(&record, broadcast_at)?;
        if let Err(error) = check_window(&signed.message, broadcast_at) {
            self.log_attempt(&signed, AttemptOutcome::Rejected, None, Some(error.code()));
            return Err(error);
        }

        let tx_hash = match chain
            .send_transfer(&call, gas_limit)
            .instrument(tracing::info_span!("call_transferWithAuthorization",
                from = %call.from,
                to = %call.to,
                value = %call.value,
                valid_after = %call.valid_after,
                valid_before = %call.valid_before,
                nonce = %call.nonce,
                token_contract = %call.token,
                gas_limit = %gas_limit,
                otel.kind = "client",
            ))
            .await
        {
            Ok(tx_hash) => tx_hash,
            Err(error) => {
                let error = self.broadcast_failed(&record, &resolved, error);
                return self.settle_revert(chain.as_ref(), &record, error).await;
            }
        };
        self.log_attempt(&signed, AttemptOutcome::Broadcast, Some(tx_hash), None);
        self.store.record_attempt_tx(record.id, tx_hash)?;

        let outcome = match chain.wait_for_receipt(tx_hash).await {
            Ok(outcome) => outcome,
            Err(error) => {
                self.log_attempt(
                    &signed,
                    AttemptOutcome::NetworkError,
                    Some(tx_hash),
                    Some(&error.to_string()),
                );
                return Err(error.into());
            }
        };
        if outcome.success {
            self.finalize_used(&record, tx_hash, broadcast_at)
        } else {
            let error = self
                .receipt_reverted(chain.as_ref(), &record, &resolved, tx_hash)
                .await;
            self.settle_revert(chain.as_ref(), &record, error).await
        }
    }

    fn existing_record(&self, signed: &SignedAuthorization) -> Result<Option<Authorization>, RelayError> {
        match self.store.get(signed.chain_id, signed.message.nonce) {
            Ok(existing) if existing.signed != *signed => Err(RelayError::DuplicateNonce {
                chain_id: signed.chain_id,
                nonce: signed.message.nonce,
            }),
            Ok(existing) => Ok(Some(existing)),
            Err(StoreError::NotFound) => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    fn reject_terminal(record: &Authorization, now: UnixTimestamp) -> Result<(), RelayError> {
        match record.status {
            AuthorizationStatus::Used => Err(RelayError::AlreadyUsed {
                tx_hash: record.tx_hash,
            }),
            AuthorizationStatus::Cancelled => Err(RelayError::Cancelled),
            AuthorizationStatus::Expired => Err(RelayError::Expired {
                valid_before: record.signed.message.valid_before,
                now,
            }),
            AuthorizationStatus::Pending => Ok(()),
        }
    }

    /// Looks up every transaction already broadcast for this record. One that succeeded
    /// settles the record as used; one still unresolved is an error, so the authorization is
    /// never sent twice while an earlier send may yet land.
    async fn settle_earlier_broadcasts(
        &self,
        chain: &dyn ChainClient,
        record: &Authorization,
    ) -> Result<Option<TransactionHash>, RelayError> {
        let mut broadcasts: Vec<(TransactionHash, UnixTimestamp)> = self
            .store
            .attempts(record.signed.chain_id, record.signed.message.nonce)
            .into_iter()
            .filter(|attempt| attempt.outcome == AttemptOutcome::Broadcast)
            .filter_map(|attempt| attempt.tx_hash.map(|tx_hash| (tx_hash, attempt.at)))
            .collect();
        if let Some(tx_hash) = record.tx_hash {
            if !broadcasts.iter().any(|(hash, _)| *hash == tx_hash) {
                broadcasts.insert(0, (tx_hash, record.created_at));
            }
        }

        let mut unresolved = None;
        for (tx_hash, broadcast_at) in broadcasts {
            match chain.wait_for_receipt(tx_hash).await {
                Ok(outcome) if outcome.success => {
                    tracing::info!(%tx_hash, "earlier attempt already consumed the nonce");
                    return self.finalize_used(record, tx_hash, broadcast_at).map(Some);
                }
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!(%error, %tx_hash, "earlier attempt still unresolved");
                    unresolved = Some(error);
                }
            }
        }
        match unresolved {
            Some(error) => {
                self.log_attempt(
                    &record.signed,
                    AttemptOutcome::NetworkError,
                    None,
                    Some(&error.to_string()),
                );
                Err(error.into())
            }
            None => Ok(None),
        }
    }

    /// Asks the token whether the nonce is already consumed.
    async fn reconcile_consumed_nonce(
        &self,
        chain: &dyn ChainClient,
        record: &Authorization,
    ) -> Result<Option<TransactionHash>, RelayError> {
        let message = &record.signed.message;
        match chain
            .authorization_state(record.signed.token, message.from, message.nonce)
            .await
        {
            ReadResult::Available(false) => Ok(None),
            ReadResult::Unavailable(reason) => {
                tracing::debug!(%reason, "authorizationState unavailable, continuing");
                Ok(None)
            }
            ReadResult::Available(true) => self.authorization_used(chain, record).await.map(Some),
        }
    }

    /// The nonce is consumed on-chain. If one of our own transactions consumed it the record
    /// is settled with that hash; otherwise it is cancelled.
    async fn authorization_used(
        &self,
        chain: &dyn ChainClient,
        record: &Authorization,
    ) -> Result<TransactionHash, RelayError> {
        if let Some(tx_hash) = self.settle_earlier_broadcasts(chain, record).await? {
            return Ok(tx_hash);
        }
        tracing::warn!("nonce already consumed on-chain by another transaction");
        self.cancel(record, RevertReason::AuthorizationUsed.as_str());
        Err(RelayError::AlreadyUsed { tx_hash: None })
    }

    async fn settle_revert(
        &self,
        chain: &dyn ChainClient,
        record: &Authorization,
        error: RelayError,
    ) -> Result<TransactionHash, RelayError> {
        match error {
            RelayError::AlreadyUsed { tx_hash: None } => self.authorization_used(chain, record).await,
            error => Err(error),
        }
    }

    async fn gas_limit(
        &self,
        chain: &dyn ChainClient,
        record: &Authorization,
        resolved: &ResolvedToken,
    ) -> Result<GasLimit, RelayError> {
        let strategy = self
            .strategies
            .get(&record.signed.chain_id)
            .copied()
            .unwrap_or_default();
        let fallback_gas_limit = match strategy {
            SubmissionStrategy::DirectSubmit { gas_limit } => return Ok(GasLimit::Fixed(gas_limit)),
            SubmissionStrategy::SimulateThenSubmit { fallback_gas_limit } => fallback_gas_limit,
        };
        let call = record.signed.transfer_call();
        match chain
            .simulate_transfer(&call)
            .instrument(tracing::info_span!("simulate_transferWithAuthorization",
                from = %call.from,
                nonce = %call.nonce,
                otel.kind = "client",
            ))
            .await
        {
            Ok(()) => Ok(GasLimit::Estimate),
            Err(error) if error.is_network() => match fallback_gas_limit {
                Some(limit) => {
                    tracing::warn!(%error, gas_limit = limit, "simulation unavailable, sending with fallback gas limit");
                    Ok(GasLimit::Fixed(limit))
                }
                None => {
                    self.log_attempt(
                        &record.signed,
                        AttemptOutcome::NetworkError,
                        None,
                        Some(&error.to_string()),
                    );
                    Err(error.into())
                }
            },
            Err(error) => match RelayError::from(error) {
                RelayError::SimulationReverted(reason) => {
                    self.log_attempt(
                        &record.signed,
                        AttemptOutcome::SimulationReverted,
                        None,
                        Some(reason.as_str()),
                    );
                    Err(self.revert_error(record, resolved, reason, None))
                }
                other => {
                    self.log_attempt(&record.signed, AttemptOutcome::Rejected, None, Some(other.code()));
                    Err(other)
                }
            },
        }
    }

    fn broadcast_failed(
        &self,
        record: &Authorization,
        resolved: &ResolvedToken,
        error: ChainError,
    ) -> RelayError {
        let network = error.is_network();
        let raw = error.to_string();
        match RelayError::from(error) {
            RelayError::SimulationReverted(reason) => {
                self.log_attempt(
                    &record.signed,
                    AttemptOutcome::SimulationReverted,
                    None,
                    Some(reason.as_str()),
                );
                self.revert_error(record, resolved, reason, None)
            }
            other => {
                let outcome = if network {
                    AttemptOutcome::NetworkError
                } else {
                    AttemptOutcome::Rejected
                };
                self.log_attempt(&record.signed, outcome, None, Some(&raw));
                other
            }
        }
    }

    /// The transaction was mined but reverted. Its revert reason is recovered by replaying
    /// the call; a replay that now succeeds or cannot be performed yields an unclassified
    /// revert.
    async fn receipt_reverted(
        &self,
        chain: &dyn ChainClient,
        record: &Authorization,
        resolved: &ResolvedToken,
        tx_hash: TransactionHash,
    ) -> RelayError {
        let reason = match chain.simulate_transfer(&record.signed.transfer_call()).await {
            Err(error) if !error.is_network() => match RelayError::from(error) {
                RelayError::SimulationReverted(reason) => reason,
                other => RevertReason::Other(other.to_string()),
            },
            _ => RevertReason::Other("transaction reverted".to_string()),
        };
        tracing::event!(
            Level::WARN,
            status = "failed",
            tx = %tx_hash,
            %reason,
            "transferWithAuthorization reverted"
        );
        self.log_attempt(
            &record.signed,
            AttemptOutcome::Reverted,
            Some(tx_hash),
            Some(reason.as_str()),
        );
        self.revert_error(record, resolved, reason, Some(tx_hash))
    }

    /// Structural reverts cancel the record; anything else leaves it pending. A used
    /// authorization is left for [`Self::authorization_used`] to settle.
    fn revert_error(
        &self,
        record: &Authorization,
        resolved: &ResolvedToken,
        reason: RevertReason,
        tx_hash: Option<TransactionHash>,
    ) -> RelayError {
        if reason.is_structural() && !matches!(reason, RevertReason::AuthorizationUsed) {
            self.cancel(record, reason.as_str());
        }
        match reason {
            RevertReason::InvalidSignature => {
                tracing::error!(
                    alert = "domain_misconfiguration",
                    monotonic_counter.relay_domain_misconfiguration = 1u64,
                    chain_id = resolved.chain_id,
                    token = %resolved.address(),
                    domain_name = %resolved.token.domain_name,
                    domain_version = %resolved.token.domain_version,
                    "token rejected a signature that verified locally"
                );
                RelayError::InvalidSignature {
                    expected: record.signed.message.from,
                    on_chain: true,
                }
            }
            RevertReason::AuthorizationUsed => RelayError::AlreadyUsed { tx_hash: None },
            reason => match tx_hash {
                Some(tx_hash) => RelayError::Reverted { tx_hash, reason },
                None => RelayError::SimulationReverted(reason),
            },
        }
    }

    fn finalize_used(
        &self,
        record: &Authorization,
        tx_hash: TransactionHash,
        broadcast_at: UnixTimestamp,
    ) -> Result<TransactionHash, RelayError> {
        match self.store.mark_used(record.id, tx_hash, broadcast_at) {
            Ok(_) => {
                tracing::event!(Level::INFO,
                    status = "ok",
                    tx = %tx_hash,
                    "transferWithAuthorization succeeded"
                );
                self.log_attempt(&record.signed, AttemptOutcome::Confirmed, Some(tx_hash), None);
                Ok(tx_hash)
            }
            Err(error) => {
                tracing::warn!(%error, tx = %tx_hash, "transfer confirmed but record could not be marked used");
                let outcome = match error {
                    StoreError::InvalidTransition {
                        from: AuthorizationStatus::Cancelled,
                        ..
                    } => AttemptOutcome::CancelledInFlight,
                    _ => AttemptOutcome::Confirmed,
                };
                self.log_attempt(&record.signed, outcome, Some(tx_hash), Some(&error.to_string()));
                Err(error.into())
            }
        }
    }

    fn cancel(&self, record: &Authorization, reason: &str) {
        match self.store.mark_cancelled(record.id) {
            Ok(_) => tracing::info!(id = %record.id, %reason, "authorization cancelled"),
            Err(error) => tracing::debug!(id = %record.id, %error, "authorization not cancelled"),
        }
    }

    fn log_attempt(
        &self,
        signed: &SignedAuthorization,
        outcome: AttemptOutcome,
        tx_hash: Option<TransactionHash>,
        reason: Option<&str>,
    ) {
        let at = self.clock.now().unwrap_or_default();
        let attempt = SubmissionAttempt {
            chain_id: signed.chain_id,
            nonce: signed.message.nonce,
            at,
            outcome,
            tx_hash,
            reason: reason.map(str::to_string),
        };
        if let Err(error) = self.store.record_attempt(attempt) {
            tracing::warn!(%error, "failed to record submission attempt");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainError;
    use crate::test_support::{FakeChain, address, signed_transfer, signer};
    use crate::timestamp::ManualClock;
    use crate::types::EvmSignature;
    use std::time::Duration;

    const NOW: u64 = 1_700_000_000;

    struct Harness {
        submitter: Arc<RelaySubmitter>,
        chain: Arc<FakeChain>,
        clock: Arc<ManualClock>,
        resolver: DomainResolver,
    }

    fn harness(chain_id: u64) -> Harness {
        let mut config = RelayConfig::default();
        config.sponsorship.top_up_wait_secs = 0;
        let clock = Arc::new(ManualClock::at(NOW));
        let chain = Arc::new(FakeChain::new(chain_id));
        let mut chains = ChainRegistry::new();
        chains.insert(chain.clone());
        let store = Arc::new(AuthorizationStore::in_memory(clock.clone()));
        let gas = Arc::new(GasSponsorshipGuard::new(
            &config,
            chains.clone(),
            None,
            clock.clone(),
        ));
        let submitter = Arc::new(RelaySubmitter::new(&config, chains, store, gas, clock.clone()));
        Harness {
            submitter,
            chain,
            clock,
            resolver: DomainResolver::from_config(&config),
        }
    }

    impl Harness {
        async fn signed(&self, chain_id: u64, valid_after: u64, valid_before: u64, nonce: u8) -> SignedAuthorization {
            let resolved = self.resolver.resolve(chain_id, "USDC").unwrap();
            signed_transfer(&resolved, &signer(7), address(2), 10_000, valid_after, valid_before, nonce).await
        }
    }

    #[tokio::test]
    async fn celo_transfer_is_submitted_and_marked_used() {
        let h = harness(42220);
        let signed = h.signed(42220, 0, NOW + 3600, 1).await;

        let tx_hash = h.submitter.submit(signed).await.unwrap();

        let record = h.submitter.store().get(42220, signed.message.nonce).unwrap();
        assert_eq!(record.status, AuthorizationStatus::Used);
        assert_eq!(record.tx_hash, Some(tx_hash));
        assert_eq!(record.used_at, Some(UnixTimestamp(NOW)));
        let sends = h.chain.sends();
        assert_eq!(sends.len(), 1);
        // Celo submits directly with a fixed gas limit, no simulation
        assert_eq!(sends[0].1, GasLimit::Fixed(150_000));
        assert_eq!(h.chain.simulation_count(), 0);
    }

    #[tokio::test]
    async fn resubmission_returns_already_used_with_original_hash() {
        let h = harness(42220);
        let signed = h.signed(42220, 0, NOW + 3600, 2).await;
        let tx_hash = h.submitter.submit(signed).await.unwrap();
        let before = h.submitter.store().get(42220, signed.message.nonce).unwrap();

        h.clock.advance(30);
        match h.submitter.submit(signed).await {
            Err(RelayError::AlreadyUsed {
                tx_hash: Some(original),
            }) => assert_eq!(original, tx_hash),
            other => panic!("expected AlreadyUsed, got {other:?}"),
        }
        let after = h.submitter.store().get(42220, signed.message.nonce).unwrap();
        assert_eq!(before, after);
        assert_eq!(h.chain.sends().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_retries_have_exactly_one_winner() {
        let h = harness(42220);
        h.chain.set_send_delay(Duration::from_millis(50));
        let signed = h.signed(42220, 0, NOW + 3600, 3).await;

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let submitter = h.submitter.clone();
                tokio::spawn(async move { submitter.submit(signed).await })
            })
            .collect();
        let mut winners = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => winners += 1,
                Err(RelayError::DuplicateNonce { .. } | RelayError::AlreadyUsed { .. }) => {}
                Err(other) => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(h.chain.sends().len(), 1);
    }

    #[tokio::test]
    async fn window_boundaries_are_inclusive_exclusive() {
        let h = harness(42220);
        let at_valid_before = h.signed(42220, 0, NOW, 4).await;
        assert!(matches!(
            h.submitter.submit(at_valid_before).await,
            Err(RelayError::Expired { .. })
        ));

        let at_valid_after = h.signed(42220, NOW, NOW + 60, 5).await;
        assert!(h.submitter.submit(at_valid_after).await.is_ok());

        let future = h.signed(42220, NOW + 1, NOW + 60, 6).await;
        assert!(matches!(
            h.submitter.submit(future).await,
            Err(RelayError::NotYetValid { .. })
        ));
    }

    #[tokio::test]
    async fn expired_submission_only_touches_the_attempt_log() {
        let h = harness(42220);
        let signed = h.signed(42220, 0, NOW - 10, 7).await;
        assert!(matches!(
            h.submitter.submit(signed).await,
            Err(RelayError::Expired { .. })
        ));
        let store = h.submitter.store();
        assert!(store.is_empty());
        let attempts = store.attempts(42220, signed.message.nonce);
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].outcome, AttemptOutcome::Rejected);
        assert_eq!(attempts[0].reason.as_deref(), Some("expired"));
        assert!(h.chain.sends().is_empty());
    }

    #[tokio::test]
    async fn unsigned_expired_request_writes_nothing() {
        let h = harness(42220);
        let mut signed = h.signed(42220, 0, NOW - 10, 20).await;
        signed.signature = EvmSignature([0x22; 65]);
        signed.signature.0[64] = 27;

        assert!(matches!(
            h.submitter.submit(signed).await,
            Err(RelayError::InvalidSignature { on_chain: false, .. })
        ));
        let store = h.submitter.store();
        assert!(store.is_empty());
        assert!(store.attempts(42220, signed.message.nonce).is_empty());
    }

    #[tokio::test]
    async fn signature_from_another_chain_domain_is_rejected_locally() {
        let h = harness(42220);
        let base = h.resolver.resolve(8453, "USDC").unwrap();
        let mut signed =
            signed_transfer(&base, &signer(7), address(2), 10_000, 0, NOW + 3600, 8).await;
        signed.chain_id = 42220;
        signed.token = h.resolver.resolve(42220, "USDC").unwrap().address();

        assert!(matches!(
            h.submitter.submit(signed).await,
            Err(RelayError::InvalidSignature {
                on_chain: false,
                ..
            })
        ));
        assert!(h.submitter.store().is_empty());
        assert!(h.chain.sends().is_empty());
    }

    #[tokio::test]
    async fn on_chain_signature_rejection_cancels_and_flags_domain() {
        let h = harness(42220);
        h.chain.set_receipt(Ok(false));
        h.chain
            .set_simulation(Err(ChainError::Reverted("FiatTokenV2: invalid signature".into())));
        let signed = h.signed(42220, 0, NOW + 3600, 9).await;

        assert!(matches!(
            h.submitter.submit(signed).await,
            Err(RelayError::InvalidSignature { on_chain: true, .. })
        ));
        let record = h.submitter.store().get(42220, signed.message.nonce).unwrap();
        assert_eq!(record.status, AuthorizationStatus::Cancelled);
        assert!(record.tx_hash.is_some());
    }

    #[tokio::test]
    async fn ordinary_reverts_leave_the_record_pending() {
        let h = harness(8453);
        h.chain.set_simulation(Err(ChainError::Reverted(
            "ERC20: transfer amount exceeds balance".into(),
        )));
        let signed = h.signed(8453, 0, NOW + 3600, 10).await;

        assert!(matches!(
            h.submitter.submit(signed).await,
            Err(RelayError::SimulationReverted(RevertReason::InsufficientBalance))
        ));
        let record = h.submitter.store().get(8453, signed.message.nonce).unwrap();
        assert_eq!(record.status, AuthorizationStatus::Pending);
        assert!(h.chain.sends().is_empty());

        h.chain.set_simulation(Ok(()));
        assert!(h.submitter.submit(signed).await.is_ok());
        assert_eq!(h.chain.sends()[0].1, GasLimit::Estimate);
    }

    #[tokio::test]
    async fn unreliable_simulation_falls_back_to_fixed_gas() {
        let h = harness(8453);
        h.chain.set_simulation(Err(ChainError::Timeout {
            operation: "eth_call",
            seconds: 10,
        }));
        let signed = h.signed(8453, 0, NOW + 3600, 11).await;
        h.submitter.submit(signed).await.unwrap();
        assert_eq!(h.chain.sends()[0].1, GasLimit::Fixed(120_000));
    }

    #[tokio::test]
    async fn network_failures_are_retryable_and_keep_pending() {
        let h = harness(42220);
        h.chain
            .push_send_failure(ChainError::Transport("connection refused".into()));
        let signed = h.signed(42220, 0, NOW + 3600, 12).await;

        let error = h.submitter.submit(signed).await.unwrap_err();
        assert!(error.is_retryable());
        let record = h.submitter.store().get(42220, signed.message.nonce).unwrap();
        assert_eq!(record.status, AuthorizationStatus::Pending);

        assert!(h.submitter.submit(signed).await.is_ok());
    }

    #[tokio::test]
    async fn lost_receipt_is_reconciled_from_the_chain() {
        let h = harness(42220);
        h.chain.set_receipt(Err(ChainError::Timeout {
            operation: "receipt",
            seconds: 60,
        }));
        let signed = h.signed(42220, 0, NOW + 3600, 13).await;
        assert!(matches!(
            h.submitter.submit(signed).await,
            Err(RelayError::NetworkUnavailable(_))
        ));
        let first = h.submitter.store().get(42220, signed.message.nonce).unwrap();
        let tx_hash = first.tx_hash.unwrap();

        h.chain.set_receipt(Ok(true));
        h.chain.set_authorization_state(ReadResult::Available(true));
        assert_eq!(h.submitter.submit(signed).await.unwrap(), tx_hash);
        assert_eq!(h.chain.sends().len(), 1);
        let record = h.submitter.store().get(42220, signed.message.nonce).unwrap();
        assert_eq!(record.status, AuthorizationStatus::Used);
    }

    #[tokio::test]
    async fn unresolved_broadcast_is_never_sent_again() {
        let h = harness(42220);
        h.chain.set_receipt(Err(ChainError::Timeout {
            operation: "receipt",
            seconds: 60,
        }));
        let signed = h.signed(42220, 0, NOW + 3600, 17).await;
        assert!(matches!(
            h.submitter.submit(signed).await,
            Err(RelayError::NetworkUnavailable(_))
        ));
        let first = h.submitter.store().get(42220, signed.message.nonce).unwrap();
        let h1 = first.tx_hash.unwrap();

        // the first transaction is still in the mempool and the token cannot be queried
        h.chain
            .set_authorization_state(ReadResult::Unavailable("eth_call unsupported".into()));
        h.chain.set_simulation(Err(ChainError::Reverted(
            "FiatTokenV2: authorization is used or canceled".into(),
        )));
        h.clock.advance(5);
        assert!(matches!(
            h.submitter.submit(signed).await,
            Err(RelayError::NetworkUnavailable(_))
        ));
        assert_eq!(h.chain.sends().len(), 1);

        h.chain.set_receipt(Ok(false));
        h.chain.script_receipt(h1, vec![Ok(true)]);
        assert_eq!(h.submitter.submit(signed).await.unwrap(), h1);

        assert_eq!(h.chain.sends().len(), 1);
        let record = h.submitter.store().get(42220, signed.message.nonce).unwrap();
        assert_eq!(record.status, AuthorizationStatus::Used);
        assert_eq!(record.tx_hash, Some(h1));
    }

    #[tokio::test]
    async fn used_revert_settles_from_an_earlier_broadcast() {
        let h = harness(42220);
        h.chain.set_receipt(Err(ChainError::Timeout {
            operation: "receipt",
            seconds: 60,
        }));
        let signed = h.signed(42220, 0, NOW + 3600, 18).await;
        assert!(h.submitter.submit(signed).await.is_err());
        let h1 = h
            .submitter
            .store()
            .get(42220, signed.message.nonce)
            .unwrap()
            .tx_hash
            .unwrap();

        // the node first reports the earlier transaction as failed, then sees it mined
        h.chain.script_receipt(h1, vec![Ok(false), Ok(true)]);
        h.chain.set_receipt(Ok(false));
        h.chain.set_simulation(Err(ChainError::Reverted(
            "FiatTokenV2: authorization is used or canceled".into(),
        )));
        assert_eq!(h.submitter.submit(signed).await.unwrap(), h1);

        assert_eq!(h.chain.sends().len(), 2);
        let record = h.submitter.store().get(42220, signed.message.nonce).unwrap();
        assert_eq!(record.status, AuthorizationStatus::Used);
        assert_eq!(record.tx_hash, Some(h1));
    }

    #[tokio::test]
    async fn nonce_consumed_by_a_stranger_cancels_the_record() {
        let h = harness(8453);
        h.chain.set_simulation(Err(ChainError::Reverted(
            "FiatTokenV2: authorization is used or canceled".into(),
        )));
        let signed = h.signed(8453, 0, NOW + 3600, 19).await;
        assert!(matches!(
            h.submitter.submit(signed).await,
            Err(RelayError::AlreadyUsed { tx_hash: None })
        ));
        let record = h.submitter.store().get(8453, signed.message.nonce).unwrap();
        assert_eq!(record.status, AuthorizationStatus::Cancelled);
        assert!(h.chain.sends().is_empty());
    }

    #[tokio::test]
    async fn cancellation_mid_flight_is_not_reported_as_success() {
        let h = harness(42220);
        h.chain.set_send_delay(Duration::from_millis(50));
        let signed = h.signed(42220, 0, NOW + 3600, 14).await;
        let submitter = h.submitter.clone();
        let task = tokio::spawn(async move { submitter.submit(signed).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        let record = h.submitter.store().get(42220, signed.message.nonce).unwrap();
        h.submitter.store().mark_cancelled(record.id).unwrap();

        assert!(matches!(task.await.unwrap(), Err(RelayError::Cancelled)));
        let attempts = h.submitter.store().attempts(42220, signed.message.nonce);
        assert_eq!(
            attempts.last().map(|attempt| attempt.outcome),
            Some(AttemptOutcome::CancelledInFlight)
        );
    }

    #[tokio::test]
    async fn foreign_payload_on_a_taken_nonce_is_a_duplicate() {
        let h = harness(42220);
        let signed = h.signed(42220, 0, NOW + 3600, 15).await;
        h.submitter.submit(signed).await.unwrap();

        let resolved = h.resolver.resolve(42220, "USDC").unwrap();
        let other = signed_transfer(&resolved, &signer(8), address(2), 5, 0, NOW + 3600, 15).await;
        assert!(matches!(
            h.submitter.submit(other).await,
            Err(RelayError::DuplicateNonce { chain_id: 42220, .. })
        ));
    }

    #[tokio::test]
    async fn relay_without_gas_fails_before_any_send() {
        let h = harness(42220);
        h.chain.set_balance(h.chain.relay_address(), 0);
        let signed = h.signed(42220, 0, NOW + 3600, 16).await;
        assert!(matches!(
            h.submitter.submit(signed).await,
            Err(RelayError::InsufficientGas { chain_id: 42220, .. })
        ));
        assert!(h.chain.sends().is_empty());
    }
}
