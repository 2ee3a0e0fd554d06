//! [`Relay`] backed by this process's chain clients, ledger and sponsorship guard.

use std::sync::Arc;
use tracing::instrument;

use crate::chain::ChainRegistry;
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::gas::{GasSponsor, GasSponsorshipGuard};
use crate::relay::Relay;
use crate::store::{Authorization, AuthorizationStore, SubmissionAttempt};
use crate::submitter::RelaySubmitter;
use crate::timestamp::Clock;
use crate::types::{
    EvmAddress, FacilitatorAddress, HexEncodedNonce, SponsorRequest, SponsorResponse,
    SubmitRequest, SubmitResponse,
};

pub struct RelayLocal {
    chains: ChainRegistry,
    submitter: RelaySubmitter,
    gas: Arc<GasSponsorshipGuard>,
    store: Arc<AuthorizationStore>,
    admin_token: Option<String>,
}

impl RelayLocal {
    pub fn new(
        config: &RelayConfig,
        chains: ChainRegistry,
        store: Arc<AuthorizationStore>,
        sponsor: Option<Arc<dyn GasSponsor>>,
        clock: Arc<dyn Clock>,
        admin_token: Option<String>,
    ) -> Self {
        let gas = Arc::new(GasSponsorshipGuard::new(
            config,
            chains.clone(),
            sponsor,
            clock.clone(),
        ));
        let submitter = RelaySubmitter::new(config, chains.clone(), store.clone(), gas.clone(), clock);
        Self {
            chains,
            submitter,
            gas,
            store,
            admin_token,
        }
    }

    fn facilitator_address(&self, chain_id: u64) -> Result<FacilitatorAddress, RelayError> {
        let chain = self
            .chains
            .by_chain_id(chain_id)
            .ok_or(RelayError::UnsupportedChain(chain_id))?;
        Ok(FacilitatorAddress {
            chain_id,
            address: chain.relay_address(),
        })
    }

    fn check_operator(&self, presented: Option<&str>) -> Result<(), RelayError> {
        match (&self.admin_token, presented) {
            (Some(expected), Some(presented)) if expected.as_str() == presented => Ok(()),
            _ => Err(RelayError::Unauthorized),
        }
    }
}

impl Relay for RelayLocal {
    type Error = RelayError;

    #[instrument(skip_all, err, fields(chain_id = request.chain_id, user = %request.user_address))]
    async fn submit(&self, request: &SubmitRequest) -> Result<SubmitResponse, Self::Error> {
        let signed = self.submitter.authorization_from_request(request)?;
        let submitted = self.submitter.submit(signed).await;
        self.store.sync().await?;
        Ok(SubmitResponse {
            tx_hash: submitted?,
        })
    }

    async fn facilitators(&self) -> Result<Vec<FacilitatorAddress>, Self::Error> {
        self.chains
            .chain_ids()
            .into_iter()
            .map(|chain_id| self.facilitator_address(chain_id))
            .collect()
    }

    async fn facilitator(&self, chain_id: u64) -> Result<FacilitatorAddress, Self::Error> {
        self.facilitator_address(chain_id)
    }

    async fn sponsor(&self, request: &SponsorRequest) -> Result<SponsorResponse, Self::Error> {
        self.gas.sponsor(request.address, request.chain_id).await
    }

    async fn authorizations_by_party(
        &self,
        party: EvmAddress,
    ) -> Result<Vec<Authorization>, Self::Error> {
        Ok(self.store.list_by_party(party)?)
    }

    async fn authorization(
        &self,
        chain_id: u64,
        nonce: HexEncodedNonce,
    ) -> Result<Authorization, Self::Error> {
        Ok(self.store.get(chain_id, nonce)?)
    }

    async fn attempts(
        &self,
        chain_id: u64,
        nonce: HexEncodedNonce,
    ) -> Result<Vec<SubmissionAttempt>, Self::Error> {
        Ok(self.store.attempts(chain_id, nonce))
    }

    #[instrument(skip_all, err, fields(chain_id = chain_id, nonce = %nonce))]
    async fn cancel(
        &self,
        chain_id: u64,
        nonce: HexEncodedNonce,
        operator_token: Option<&str>,
    ) -> Result<Authorization, Self::Error> {
        self.check_operator(operator_token)?;
        let record = self.store.get(chain_id, nonce)?;
        let cancelled = self.store.mark_cancelled(record.id)?;
        self.store.sync().await?;
        tracing::info!(id = %cancelled.id, "authorization cancelled by operator");
        Ok(cancelled)
    }
}
