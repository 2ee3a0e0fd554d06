//! The relay's client-facing error taxonomy.
//!
//! Every failure a caller can observe is one [`RelayError`] variant with a stable
//! [`RelayError::code`]. Raw chain text only ever appears as truncated detail.

use std::time::SystemTimeError;

use crate::chain::ChainError;
use crate::classify::{RevertReason, UserFacingReason, classify, classify_revert};
use crate::domain::DomainError;
use crate::store::{AuthorizationStatus, StoreError};
use crate::timestamp::UnixTimestamp;
use crate::types::{EvmAddress, HexEncodedNonce, TransactionHash};

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("chain {0} is not supported by this relay")]
    UnsupportedChain(u64),
    #[error("token {token} is not configured on chain {chain_id}")]
    UnsupportedToken { chain_id: u64, token: String },
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("invalid window: valid_after {valid_after} must be before valid_before {valid_before}")]
    InvalidWindow {
        valid_after: UnixTimestamp,
        valid_before: UnixTimestamp,
    },
    #[error("not yet valid: valid_after {valid_after} > now {now}")]
    NotYetValid {
        valid_after: UnixTimestamp,
        now: UnixTimestamp,
    },
    #[error("expired: now {now} >= valid_before {valid_before}")]
    Expired {
        valid_before: UnixTimestamp,
        now: UnixTimestamp,
    },
    /// `on_chain` is set when the token contract rejected a signature that recovered correctly
    /// here, which means the configured domain is wrong.
    #[error("signature does not authorize a transfer from {expected}")]
    InvalidSignature { expected: EvmAddress, on_chain: bool },
    #[error("nonce {nonce} on chain {chain_id} is already claimed by another submission")]
    DuplicateNonce {
        chain_id: u64,
        nonce: HexEncodedNonce,
    },
    #[error("authorization already used")]
    AlreadyUsed { tx_hash: Option<TransactionHash> },
    #[error("authorization was cancelled")]
    Cancelled,
    #[error("relay account {account} on chain {chain_id} has insufficient gas")]
    InsufficientGas { chain_id: u64, account: EvmAddress },
    #[error("gas sponsorship rate limited until {next_drip_available}")]
    RateLimited { next_drip_available: UnixTimestamp },
    #[error("simulation reverted: {0}")]
    SimulationReverted(RevertReason),
    #[error("transaction {tx_hash} reverted: {reason}")]
    Reverted {
        tx_hash: TransactionHash,
        reason: RevertReason,
    },
    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),
    #[error("{0}")]
    Chain(UserFacingReason),
    #[error("authorization not found")]
    NotFound,
    #[error("operator credentials required")]
    Unauthorized,
    #[error("clock error: {0}")]
    Clock(#[from] SystemTimeError),
    #[error("unknown error: {0}")]
    Unknown(String),
}

impl RelayError {
    /// Stable, translatable reason code.
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::UnsupportedChain(_) => "unsupported_chain",
            RelayError::UnsupportedToken { .. } => "unsupported_token",
            RelayError::Malformed(_) => "malformed_request",
            RelayError::InvalidWindow { .. } => "invalid_window",
            RelayError::NotYetValid { .. } => "not_yet_valid",
            RelayError::Expired { .. } => "expired",
            RelayError::InvalidSignature { .. } => "invalid_signature",
            RelayError::DuplicateNonce { .. } => "duplicate_nonce",
            RelayError::AlreadyUsed { .. } => "already_used",
            RelayError::Cancelled => "cancelled",
            RelayError::InsufficientGas { .. } => "insufficient_gas",
            RelayError::RateLimited { .. } => "rate_limited",
            RelayError::SimulationReverted(_) => "simulation_reverted",
            RelayError::Reverted { .. } => "reverted",
            RelayError::NetworkUnavailable(_) => "network_unavailable",
            RelayError::Chain(reason) => reason.code(),
            RelayError::NotFound => "not_found",
            RelayError::Unauthorized => "unauthorized",
            RelayError::Clock(_) | RelayError::Unknown(_) => "unknown",
        }
    }

    /// Short detail for the client, never the primary message.
    pub fn details(&self) -> Option<String> {
        match self {
            RelayError::UnsupportedChain(chain_id) => Some(chain_id.to_string()),
            RelayError::UnsupportedToken { token, .. } => Some(token.clone()),
            RelayError::Malformed(message) => Some(message.clone()),
            RelayError::SimulationReverted(reason) => Some(reason.to_string()),
            RelayError::Reverted { reason, .. } => Some(reason.to_string()),
            RelayError::AlreadyUsed {
                tx_hash: Some(tx_hash),
            } => Some(tx_hash.to_string()),
            RelayError::Chain(reason) => reason.details(),
            RelayError::NotYetValid { .. }
            | RelayError::Expired { .. }
            | RelayError::InvalidWindow { .. } => Some(self.to_string()),
            _ => None,
        }
    }

    /// Only transport-level failures may be retried by the caller with the same payload.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RelayError::NetworkUnavailable(_))
    }
}

impl From<ChainError> for RelayError {
    fn from(error: ChainError) -> Self {
        match error {
            ChainError::Timeout { .. } | ChainError::Transport(_) => {
                RelayError::NetworkUnavailable(error.to_string())
            }
            ChainError::Reverted(raw) => RelayError::SimulationReverted(classify_revert(&raw)),
            ChainError::Rejected(raw) => match classify(&raw) {
                UserFacingReason::Reverted(reason) => RelayError::SimulationReverted(reason),
                reason => RelayError::Chain(reason),
            },
        }
    }
}

impl From<DomainError> for RelayError {
    fn from(error: DomainError) -> Self {
        match error {
            DomainError::UnsupportedChain(chain_id) => RelayError::UnsupportedChain(chain_id),
            DomainError::UnsupportedToken { chain_id, token } => {
                RelayError::UnsupportedToken { chain_id, token }
            }
            DomainError::Chain { source, .. } => source.into(),
            DomainError::SeparatorMismatch { .. } => RelayError::Unknown(error.to_string()),
        }
    }
}

impl From<StoreError> for RelayError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::DuplicateNonce { chain_id, nonce }
            | StoreError::AlreadyClaimed { chain_id, nonce } => {
                RelayError::DuplicateNonce { chain_id, nonce }
            }
            StoreError::NotFound => RelayError::NotFound,
            StoreError::InvalidTransition {
                from: AuthorizationStatus::Used,
                ..
            } => RelayError::AlreadyUsed { tx_hash: None },
            StoreError::InvalidTransition {
                from: AuthorizationStatus::Cancelled,
                ..
            } => RelayError::Cancelled,
            StoreError::Clock(error) => RelayError::Clock(error),
            StoreError::InvalidTransition { .. } | StoreError::Journal(_) => {
                RelayError::Unknown(error.to_string())
            }
        }
    }
}
