//! Maps raw chain/RPC error text into a small, stable set of user-facing reasons.
//!
//! Classification is table driven: each table is an ordered list of `(pattern, reason)`
//! pairs matched case-insensitively against the raw message, first hit wins. New chain
//! error formats are supported by adding a row, never by touching call sites.

use serde::{Serialize, Serializer};
use std::fmt::{Display, Formatter};

/// Longest raw message surfaced to a client when nothing in the tables matched.
pub const MAX_RAW_MESSAGE_LEN: usize = 120;

/// Contract-level revert causes with stable, translatable identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevertReason {
    InsufficientBalance,
    InsufficientLiquidity,
    HealthFactorTooLow,
    InvalidAmount,
    InvalidSignature,
    AuthorizationUsed,
    AuthorizationNotYetValid,
    AuthorizationExpired,
    /// Unrecognized revert, carrying the truncated raw message.
    Other(String),
}

impl RevertReason {
    pub fn as_str(&self) -> &str {
        match self {
            RevertReason::InsufficientBalance => "insufficient_balance",
            RevertReason::InsufficientLiquidity => "insufficient_liquidity",
            RevertReason::HealthFactorTooLow => "health_factor_too_low",
            RevertReason::InvalidAmount => "invalid_amount",
            RevertReason::InvalidSignature => "invalid_signature",
            RevertReason::AuthorizationUsed => "authorization_used",
            RevertReason::AuthorizationNotYetValid => "authorization_not_yet_valid",
            RevertReason::AuthorizationExpired => "authorization_expired",
            RevertReason::Other(raw) => raw.as_str(),
        }
    }

    /// Reverts that will fail identically on every retry. The record is cancelled instead of
    /// being left `pending`. A not-yet-valid revert is clock skew and heals with time.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            RevertReason::InvalidSignature
                | RevertReason::AuthorizationUsed
                | RevertReason::AuthorizationExpired
        )
    }
}

impl Display for RevertReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The closed set of reasons a client can be shown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserFacingReason {
    InsufficientFunds,
    Reverted(RevertReason),
    UserRejected,
    NonceError,
    /// Nothing matched; carries the truncated raw message.
    Unknown(String),
}

impl UserFacingReason {
    pub fn code(&self) -> &'static str {
        match self {
            UserFacingReason::InsufficientFunds => "insufficient_funds",
            UserFacingReason::Reverted(_) => "reverted",
            UserFacingReason::UserRejected => "user_rejected",
            UserFacingReason::NonceError => "nonce_error",
            UserFacingReason::Unknown(_) => "unknown",
        }
    }

    pub fn details(&self) -> Option<String> {
        match self {
            UserFacingReason::Reverted(reason) => Some(reason.to_string()),
            UserFacingReason::Unknown(raw) if !raw.is_empty() => Some(raw.clone()),
            _ => None,
        }
    }
}

impl Display for UserFacingReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.details() {
            Some(details) => write!(f, "{}: {}", self.code(), details),
            None => f.write_str(self.code()),
        }
    }
}

impl Serialize for UserFacingReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

/// Top-level kinds, before a revert is refined into a [`RevertReason`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorKind {
    InsufficientFunds,
    UserRejected,
    Nonce,
    Revert,
}

/// Order matters: "insufficient funds for gas" must win over a generic "reverted", and
/// nonce errors are checked before reverts because some nodes wrap them in revert text.
const ERROR_PATTERNS: &[(&str, ErrorKind)] = &[
    ("user rejected", ErrorKind::UserRejected),
    ("user denied", ErrorKind::UserRejected),
    ("rejected the request", ErrorKind::UserRejected),
    ("insufficient funds", ErrorKind::InsufficientFunds),
    ("nonce too low", ErrorKind::Nonce),
    ("nonce too high", ErrorKind::Nonce),
    ("invalid nonce", ErrorKind::Nonce),
    ("replacement transaction underpriced", ErrorKind::Nonce),
    ("already known", ErrorKind::Nonce),
    ("execution reverted", ErrorKind::Revert),
    ("revert", ErrorKind::Revert),
    ("transaction failed", ErrorKind::Revert),
];

/// Revert strings from ERC-3009 tokens (FiatToken v2) and Aave-v3-style lending pools.
/// Lending pool errors are numeric codes, matched in quoted form to avoid stray digits.
const REVERT_PATTERNS: &[(&str, RevertReason)] = &[
    ("invalid signature", RevertReason::InvalidSignature),
    ("invalid signer", RevertReason::InvalidSignature),
    ("authorization is used", RevertReason::AuthorizationUsed),
    ("authorization is used or canceled", RevertReason::AuthorizationUsed),
    ("authorization is not yet valid", RevertReason::AuthorizationNotYetValid),
    ("authorization is expired", RevertReason::AuthorizationExpired),
    ("transfer amount exceeds balance", RevertReason::InsufficientBalance),
    ("exceeds balance", RevertReason::InsufficientBalance),
    ("insufficient balance", RevertReason::InsufficientBalance),
    ("not_enough_available_user_balance", RevertReason::InsufficientBalance),
    ("'32'", RevertReason::InsufficientBalance),
    ("insufficient liquidity", RevertReason::InsufficientLiquidity),
    ("not enough liquidity", RevertReason::InsufficientLiquidity),
    ("not_enough_liquidity", RevertReason::InsufficientLiquidity),
    ("health_factor_lower_than_liquidation_threshold", RevertReason::HealthFactorTooLow),
    ("health factor", RevertReason::HealthFactorTooLow),
    ("'35'", RevertReason::HealthFactorTooLow),
    ("invalid_amount", RevertReason::InvalidAmount),
    ("invalid amount", RevertReason::InvalidAmount),
    ("amount must be greater than 0", RevertReason::InvalidAmount),
    ("'26'", RevertReason::InvalidAmount),
];

/// Shortens a raw message for display, on a char boundary.
pub fn truncate(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.chars().count() <= MAX_RAW_MESSAGE_LEN {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(MAX_RAW_MESSAGE_LEN).collect();
    out.push('…');
    out
}

fn normalized(raw: &str) -> String {
    raw.to_ascii_lowercase().replace('"', "'")
}

/// Refines a revert message into a [`RevertReason`].
pub fn classify_revert(raw: &str) -> RevertReason {
    let haystack = normalized(raw);
    REVERT_PATTERNS
        .iter()
        .find(|(pattern, _)| haystack.contains(pattern))
        .map(|(_, reason)| reason.clone())
        .unwrap_or_else(|| RevertReason::Other(truncate(raw)))
}

/// Classifies any raw chain/RPC error text.
pub fn classify(raw: &str) -> UserFacingReason {
    let haystack = normalized(raw);
    let kind = ERROR_PATTERNS
        .iter()
        .find(|(pattern, _)| haystack.contains(pattern))
        .map(|(_, kind)| *kind);
    match kind {
        Some(ErrorKind::InsufficientFunds) => UserFacingReason::InsufficientFunds,
        Some(ErrorKind::UserRejected) => UserFacingReason::UserRejected,
        Some(ErrorKind::Nonce) => UserFacingReason::NonceError,
        Some(ErrorKind::Revert) => UserFacingReason::Reverted(classify_revert(raw)),
        None => UserFacingReason::Unknown(truncate(raw)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_error_pattern_maps_to_its_kind() {
        for (pattern, kind) in ERROR_PATTERNS {
            let raw = format!("server returned an error response: {}", pattern.to_uppercase());
            let reason = classify(&raw);
            let expected = match kind {
                ErrorKind::InsufficientFunds => "insufficient_funds",
                ErrorKind::UserRejected => "user_rejected",
                ErrorKind::Nonce => "nonce_error",
                ErrorKind::Revert => "reverted",
            };
            assert_eq!(reason.code(), expected, "pattern {pattern:?}");
        }
    }

    #[test]
    fn every_revert_pattern_maps_to_its_reason() {
        for (pattern, reason) in REVERT_PATTERNS {
            let raw = format!("execution reverted: {pattern}");
            assert_eq!(classify_revert(&raw), *reason, "pattern {pattern:?}");
            assert_eq!(classify(&raw), UserFacingReason::Reverted(reason.clone()));
        }
    }

    #[test]
    fn insufficient_gas_funds_wins_over_revert() {
        let raw = "insufficient funds for gas * price + value: have 0 want 21000 (execution reverted)";
        assert_eq!(classify(raw), UserFacingReason::InsufficientFunds);
    }

    #[test]
    fn fiat_token_reverts_are_structural() {
        let reason = classify_revert("execution reverted: FiatTokenV2: authorization is used or canceled");
        assert_eq!(reason, RevertReason::AuthorizationUsed);
        assert!(reason.is_structural());
        assert!(!RevertReason::InsufficientBalance.is_structural());
        assert!(!RevertReason::AuthorizationNotYetValid.is_structural());
    }

    #[test]
    fn aave_codes_match_only_when_quoted() {
        assert_eq!(
            classify_revert("execution reverted: reverted with reason string \"35\""),
            RevertReason::HealthFactorTooLow
        );
        assert!(matches!(
            classify_revert("execution reverted at block 3532"),
            RevertReason::Other(_)
        ));
    }

    #[test]
    fn unknown_errors_degrade_to_truncated_raw_message() {
        let raw = "x".repeat(500);
        match classify(&raw) {
            UserFacingReason::Unknown(message) => {
                assert_eq!(message.chars().count(), MAX_RAW_MESSAGE_LEN + 1);
                assert!(message.ends_with('…'));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(classify("  "), UserFacingReason::Unknown(String::new()));
    }

    #[test]
    fn reason_display_is_code_plus_detail() {
        let reason = UserFacingReason::Reverted(RevertReason::InsufficientLiquidity);
        assert_eq!(reason.to_string(), "reverted: insufficient_liquidity");
        assert_eq!(UserFacingReason::NonceError.to_string(), "nonce_error");
    }
}
