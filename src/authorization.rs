//! Building and signing ERC-3009 transfer authorizations.
//!
//! [`TransferAuthorization`] is the single schema for the six signed fields. It is validated
//! once at construction and is the only thing ever hashed, so the signing side and the
//! submission side cannot drift apart.

use alloy::primitives::{B256, FixedBytes};
use alloy::signers::Signer;
use alloy::sol_types::{Eip712Domain, SolStruct};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::SystemTimeError;

use crate::chain::TransferCall;
use crate::domain::ResolvedToken;
use crate::nonce::NonceGenerator;
use crate::timestamp::{Clock, UnixTimestamp};
use crate::types::{
    EvmAddress, EvmSignature, HexEncodedNonce, MoneyAmount, MoneyAmountParseError,
    SignatureDecodingError, TokenAmount, TransferWithAuthorization,
};

/// Version of the local authorization schema. Any change to the signed field list, order or
/// types is protocol-breaking and must bump this.
pub const AUTHORIZATION_SCHEMA_VERSION: u32 = 1;

/// Default lifetime of a freshly built authorization.
pub const DEFAULT_VALIDITY_SECS: u64 = 3600;

#[derive(Debug, thiserror::Error)]
pub enum AuthorizationError {
    #[error("invalid window: valid_after {valid_after} must be before valid_before {valid_before}")]
    InvalidWindow {
        valid_after: UnixTimestamp,
        valid_before: UnixTimestamp,
    },
    #[error("signer {signer} cannot authorize a transfer from {from}")]
    SignerMismatch { signer: EvmAddress, from: EvmAddress },
    #[error("signing failed: {0}")]
    Signing(#[from] alloy::signers::Error),
    #[error(transparent)]
    Signature(#[from] SignatureDecodingError),
    #[error("signature recovery failed: {0}")]
    Recovery(String),
    #[error(transparent)]
    Amount(#[from] MoneyAmountParseError),
    #[error("clock error: {0}")]
    Clock(#[from] SystemTimeError),
}

/// Where `now` falls relative to an authorization's validity window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowPosition {
    NotYetValid,
    Valid,
    Expired,
}

/// The six ERC-3009 fields, in signing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferAuthorization {
    pub from: EvmAddress,
    pub to: EvmAddress,
    pub value: TokenAmount,
    pub valid_after: UnixTimestamp,
    pub valid_before: UnixTimestamp,
    pub nonce: HexEncodedNonce,
}

impl TransferAuthorization {
    pub fn new(
        from: EvmAddress,
        to: EvmAddress,
        value: TokenAmount,
        valid_after: UnixTimestamp,
        valid_before: UnixTimestamp,
        nonce: HexEncodedNonce,
    ) -> Result<Self, AuthorizationError> {
        if valid_after >= valid_before {
            return Err(AuthorizationError::InvalidWindow {
                valid_after,
                valid_before,
            });
        }
        Ok(Self {
            from,
            to,
            value,
            valid_after,
            valid_before,
            nonce,
        })
    }

    /// `validAfter <= now < validBefore` is valid; `now == validBefore` is already expired.
    pub fn window_position(&self, now: UnixTimestamp) -> WindowPosition {
        if now >= self.valid_before {
            WindowPosition::Expired
        } else if now < self.valid_after {
            WindowPosition::NotYetValid
        } else {
            WindowPosition::Valid
        }
    }

    pub fn typed_data(&self) -> TransferWithAuthorization {
        TransferWithAuthorization {
            from: self.from.0,
            to: self.to.0,
            value: self.value.into(),
            validAfter: self.valid_after.into(),
            validBefore: self.valid_before.into(),
            nonce: FixedBytes(self.nonce.0),
        }
    }

    pub fn signing_hash(&self, domain: &Eip712Domain) -> B256 {
        self.typed_data().eip712_signing_hash(domain)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnsignedAuthorization {
    pub schema_version: u32,
    pub message: TransferAuthorization,
}

/// An authorization bound to a chain and token by its signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedAuthorization {
    pub chain_id: u64,
    pub token: EvmAddress,
    #[serde(flatten)]
    pub message: TransferAuthorization,
    pub signature: EvmSignature,
}

impl SignedAuthorization {
    /// Recovers the address that signed this authorization under `domain`.
    pub fn recover_signer(&self, domain: &Eip712Domain) -> Result<EvmAddress, AuthorizationError> {
        let hash = self.message.signing_hash(domain);
        let signature = self.signature.to_primitive()?;
        let address = signature
            .recover_address_from_prehash(&hash)
            .map_err(|e| AuthorizationError::Recovery(e.to_string()))?;
        Ok(EvmAddress(address))
    }

    /// True when the signature was produced by `from` under `domain`.
    pub fn is_signed_by_sender(&self, domain: &Eip712Domain) -> bool {
        matches!(self.recover_signer(domain), Ok(signer) if signer == self.message.from)
    }

    pub fn transfer_call(&self) -> TransferCall {
        TransferCall {
            token: self.token,
            from: self.message.from,
            to: self.message.to,
            value: self.message.value,
            valid_after: self.message.valid_after,
            valid_before: self.message.valid_before,
            nonce: self.message.nonce,
            signature: self.signature,
        }
    }
}

/// Assembles authorizations with fresh nonces and drives signing.
#[derive(Clone)]
pub struct AuthorizationBuilder {
    clock: Arc<dyn Clock>,
    nonces: NonceGenerator,
}

impl AuthorizationBuilder {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            nonces: NonceGenerator,
        }
    }

    /// Converts a display amount such as `"1.00"` into atomic units, refusing to round.
    pub fn atomic_amount(display: &str, decimals: u32) -> Result<TokenAmount, AuthorizationError> {
        Ok(MoneyAmount::parse(display)?.as_token_amount(decimals)?)
    }

    /// Builds an authorization valid immediately (`validAfter = 0`) until
    /// `now + validity_secs`.
    pub fn build(
        &self,
        from: EvmAddress,
        to: EvmAddress,
        value: TokenAmount,
        validity_secs: u64,
    ) -> Result<UnsignedAuthorization, AuthorizationError> {
        let now = self.clock.now()?;
        let message = TransferAuthorization::new(
            from,
            to,
            value,
            UnixTimestamp(0),
            now + validity_secs,
            self.nonces.generate(),
        )?;
        Ok(UnsignedAuthorization {
            schema_version: AUTHORIZATION_SCHEMA_VERSION,
            message,
        })
    }

    /// Signs under the domain of `resolved`. The signer must be the authorization's `from`.
    pub async fn sign<S>(
        &self,
        unsigned: UnsignedAuthorization,
        resolved: &ResolvedToken,
        signer: &S,
    ) -> Result<SignedAuthorization, AuthorizationError>
    where
        S: Signer + Send + Sync,
    {
        let signer_address = EvmAddress(signer.address());
        if signer_address != unsigned.message.from {
            return Err(AuthorizationError::SignerMismatch {
                signer: signer_address,
                from: unsigned.message.from,
            });
        }
        let hash = unsigned.message.signing_hash(&resolved.domain);
        let signature = signer.sign_hash(&hash).await?;
        Ok(SignedAuthorization {
            chain_id: resolved.chain_id,
            token: resolved.address(),
            message: unsigned.message,
            signature: EvmSignature::from(signature),
        })
    }
}
