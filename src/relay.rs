//! The relay's service interface.
//!
//! HTTP handlers are generic over [`Relay`] so the transport layer never depends on how
//! submission, sponsorship or the ledger are implemented.

use std::fmt::{Debug, Display};
use std::future::Future;
use std::sync::Arc;

use crate::store::{Authorization, SubmissionAttempt};
use crate::types::{
    EvmAddress, FacilitatorAddress, HexEncodedNonce, SponsorRequest, SponsorResponse,
    SubmitRequest, SubmitResponse,
};

pub trait Relay {
    type Error: Debug + Display;

    /// Submits a gasless transfer and waits for its on-chain outcome.
    fn submit(
        &self,
        request: &SubmitRequest,
    ) -> impl Future<Output = Result<SubmitResponse, Self::Error>> + Send;

    /// The relay account on every configured chain.
    fn facilitators(&self) -> impl Future<Output = Result<Vec<FacilitatorAddress>, Self::Error>> + Send;

    fn facilitator(
        &self,
        chain_id: u64,
    ) -> impl Future<Output = Result<FacilitatorAddress, Self::Error>> + Send;

    /// Drips native gas to a user account, subject to rate limiting.
    fn sponsor(
        &self,
        request: &SponsorRequest,
    ) -> impl Future<Output = Result<SponsorResponse, Self::Error>> + Send;

    fn authorizations_by_party(
        &self,
        party: EvmAddress,
    ) -> impl Future<Output = Result<Vec<Authorization>, Self::Error>> + Send;

    fn authorization(
        &self,
        chain_id: u64,
        nonce: HexEncodedNonce,
    ) -> impl Future<Output = Result<Authorization, Self::Error>> + Send;

    fn attempts(
        &self,
        chain_id: u64,
        nonce: HexEncodedNonce,
    ) -> impl Future<Output = Result<Vec<SubmissionAttempt>, Self::Error>> + Send;

    /// Operator cancellation of a pending authorization. `operator_token` is the bearer token
    /// presented by the caller.
    fn cancel(
        &self,
        chain_id: u64,
        nonce: HexEncodedNonce,
        operator_token: Option<&str>,
    ) -> impl Future<Output = Result<Authorization, Self::Error>> + Send;
}

impl<T: Relay + Send + Sync> Relay for Arc<T> {
    type Error = T::Error;

    fn submit(
        &self,
        request: &SubmitRequest,
    ) -> impl Future<Output = Result<SubmitResponse, Self::Error>> + Send {
        self.as_ref().submit(request)
    }

    fn facilitators(&self) -> impl Future<Output = Result<Vec<FacilitatorAddress>, Self::Error>> + Send {
        self.as_ref().facilitators()
    }

    fn facilitator(
        &self,
        chain_id: u64,
    ) -> impl Future<Output = Result<FacilitatorAddress, Self::Error>> + Send {
        self.as_ref().facilitator(chain_id)
    }

    fn sponsor(
        &self,
        request: &SponsorRequest,
    ) -> impl Future<Output = Result<SponsorResponse, Self::Error>> + Send {
        self.as_ref().sponsor(request)
    }

    fn authorizations_by_party(
        &self,
        party: EvmAddress,
    ) -> impl Future<Output = Result<Vec<Authorization>, Self::Error>> + Send {
        self.as_ref().authorizations_by_party(party)
    }

    fn authorization(
        &self,
        chain_id: u64,
        nonce: HexEncodedNonce,
    ) -> impl Future<Output = Result<Authorization, Self::Error>> + Send {
        self.as_ref().authorization(chain_id, nonce)
    }

    fn attempts(
        &self,
        chain_id: u64,
        nonce: HexEncodedNonce,
    ) -> impl Future<Output = Result<Vec<SubmissionAttempt>, Self::Error>> + Send {
        self.as_ref().attempts(chain_id, nonce)
    }

    fn cancel(
        &self,
        chain_id: u64,
        nonce: HexEncodedNonce,
        operator_token: Option<&str>,
    ) -> impl Future<Output = Result<Authorization, Self::Error>> + Send {
        self.as_ref().cancel(chain_id, nonce, operator_token)
    }
}
