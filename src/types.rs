//! Wire types for the relay.
//!
//! Addresses, nonces, signatures, amounts and transaction hashes are strongly typed here and
//! validated while deserializing, so the rest of the crate never sees a malformed value.
//! Numeric fields that may exceed 53 bits (`amount`, `validAfter`, `validBefore`) are
//! decimal strings on the wire.

use alloy::primitives::{Address, B256, Signature, U256};
use alloy::{hex, sol};
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;

use crate::timestamp::UnixTimestamp;

/// An EVM account address.
///
/// Parsing accepts all-lowercase, all-uppercase or valid EIP-55 mixed-case input. The inner
/// value is raw bytes, so two spellings of the same address compare equal; display is always
/// the checksummed form.
#[derive(Debug, Copy, Clone, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub struct EvmAddress(pub Address);

impl Display for EvmAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_checksum(None))
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EvmAddressDecodingError {
    #[error("Failed to decode EVM address")]
    Malformed,
    #[error("EVM address has an invalid EIP-55 checksum")]
    BadChecksum,
}

impl FromStr for EvmAddress {
    type Err = EvmAddressDecodingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let body = s.strip_prefix("0x").unwrap_or(s);
        let has_lower = body.chars().any(|c| c.is_ascii_lowercase());
        let has_upper = body.chars().any(|c| c.is_ascii_uppercase());
        let address =
            Address::from_str(s).map_err(|_| EvmAddressDecodingError::Malformed)?;
        if has_lower && has_upper && address.to_checksum(None).trim_start_matches("0x") != body {
            return Err(EvmAddressDecodingError::BadChecksum);
        }
        Ok(Self(address))
    }
}

impl From<EvmAddress> for Address {
    fn from(address: EvmAddress) -> Self {
        address.0
    }
}

impl From<Address> for EvmAddress {
    fn from(address: Address) -> Self {
        EvmAddress(address)
    }
}

impl Serialize for EvmAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for EvmAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        EvmAddress::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// A 32-byte authorization nonce, hex-encoded with 0x prefix.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct HexEncodedNonce(pub [u8; 32]);

impl Debug for HexEncodedNonce {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "HexEncodedNonce(0x{})", hex::encode(self.0))
    }
}

impl Display for HexEncodedNonce {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl From<HexEncodedNonce> for B256 {
    fn from(value: HexEncodedNonce) -> Self {
        B256::from(value.0)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Invalid nonce format: expected 0x followed by 64 hex characters")]
pub struct NonceDecodingError;

impl FromStr for HexEncodedNonce {
    type Err = NonceDecodingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        static NONCE_REGEX: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"^0x[0-9a-fA-F]{64}$").expect("Invalid nonce regex"));
        if !NONCE_REGEX.is_match(s) {
            return Err(NonceDecodingError);
        }
        let bytes = hex::decode(&s[2..]).map_err(|_| NonceDecodingError)?;
        let array: [u8; 32] = bytes.try_into().map_err(|_| NonceDecodingError)?;
        Ok(HexEncodedNonce(array))
    }
}

impl<'de> Deserialize<'de> for HexEncodedNonce {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        HexEncodedNonce::from_str(&s).map_err(serde::de::Error::custom)
    }
}

impl Serialize for HexEncodedNonce {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

/// A 65-byte `(r, s, v)` ECDSA signature over an EIP-712 digest.
///
/// `v` may arrive as `27/28` or `0/1`; parsing stores `27/28`, the form ERC-3009 tokens
/// expect, so both encodings of one signature compare equal.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct EvmSignature(pub [u8; 65]);

impl EvmSignature {
    pub fn r(&self) -> B256 {
        B256::from_slice(&self.0[..32])
    }

    pub fn s(&self) -> B256 {
        B256::from_slice(&self.0[32..64])
    }

    pub fn v(&self) -> u8 {
        match self.0[64] {
            0 | 1 => self.0[64] + 27,
            v => v,
        }
    }

    /// Parses the bytes as a secp256k1 signature for local recovery. Signatures with `s` in
    /// the upper half of the curve order are refused, as the token's `ecrecover` refuses them.
    pub fn to_primitive(&self) -> Result<Signature, SignatureDecodingError> {
        let parity = match self.v() {
            27 => false,
            28 => true,
            other => return Err(SignatureDecodingError::InvalidRecoveryId(other)),
        };
        let signature = Signature::new(
            U256::from_be_bytes(self.r().0),
            U256::from_be_bytes(self.s().0),
            parity,
        );
        if signature.normalize_s().is_some() {
            return Err(SignatureDecodingError::HighS);
        }
        Ok(signature)
    }
}

impl From<Signature> for EvmSignature {
    fn from(signature: Signature) -> Self {
        EvmSignature(signature.as_bytes())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SignatureDecodingError {
    #[error("signature is not valid hex")]
    InvalidHex,
    #[error("signature must be 65 bytes (r, s, v), got {0}")]
    InvalidLength(usize),
    #[error("signature recovery id {0} is not one of 0, 1, 27, 28")]
    InvalidRecoveryId(u8),
    #[error("signature s value is in the upper half of the curve order")]
    HighS,
}

impl FromStr for EvmSignature {
    type Err = SignatureDecodingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes =
            hex::decode(s.trim_start_matches("0x")).map_err(|_| SignatureDecodingError::InvalidHex)?;
        let len = bytes.len();
        let mut array: [u8; 65] = bytes
            .try_into()
            .map_err(|_| SignatureDecodingError::InvalidLength(len))?;
        match array[64] {
            0 | 1 => array[64] += 27,
            27 | 28 => {}
            other => return Err(SignatureDecodingError::InvalidRecoveryId(other)),
        }
        Ok(EvmSignature(array))
    }
}

impl Debug for EvmSignature {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "EvmSignature(0x{})", hex::encode(self.0))
    }
}

impl Display for EvmSignature {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for EvmSignature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        EvmSignature::from_str(&s).map_err(serde::de::Error::custom)
    }
}

impl Serialize for EvmSignature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

/// A strictly positive amount in the token's atomic unit, e.g. `"1000000"` for 1.00 of a
/// 6-decimal token. Represented as a decimal string on the wire.
#[derive(Debug, Copy, Clone, PartialEq, Ord, PartialOrd, Eq, Hash)]
pub struct TokenAmount(pub U256);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TokenAmountError {
    #[error("amount must be a decimal integer string")]
    NotAnInteger,
    #[error("amount must be greater than zero")]
    Zero,
    #[error("amount does not fit in 256 bits")]
    Overflow,
}

impl TokenAmount {
    /// Parses a decimal integer string, rejecting zero, signs, fractions and hex.
    pub fn parse_positive(s: &str) -> Result<Self, TokenAmountError> {
        static DIGITS: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"^[0-9]+$").expect("Invalid amount regex"));
        if !DIGITS.is_match(s) {
            return Err(TokenAmountError::NotAnInteger);
        }
        let value = U256::from_str_radix(s, 10).map_err(|_| TokenAmountError::Overflow)?;
        if value.is_zero() {
            return Err(TokenAmountError::Zero);
        }
        Ok(TokenAmount(value))
    }
}

impl From<TokenAmount> for U256 {
    fn from(value: TokenAmount) -> Self {
        value.0
    }
}

impl<'de> Deserialize<'de> for TokenAmount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let string = String::deserialize(deserializer)?;
        TokenAmount::parse_positive(string.trim()).map_err(serde::de::Error::custom)
    }
}

impl Serialize for TokenAmount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl Display for TokenAmount {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A human-readable amount such as `"1.00"`, before scaling to atomic units.
#[derive(Debug, Clone, PartialEq)]
pub struct MoneyAmount(pub Decimal);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MoneyAmountParseError {
    #[error("Invalid number format")]
    InvalidFormat,
    #[error("Negative value is not allowed")]
    Negative,
    #[error("Too big of a precision: {money} vs {token} on token")]
    WrongPrecision { money: u32, token: u32 },
    #[error(transparent)]
    Amount(#[from] TokenAmountError),
}

impl MoneyAmount {
    pub fn parse(input: &str) -> Result<Self, MoneyAmountParseError> {
        let parsed =
            Decimal::from_str(input.trim()).map_err(|_| MoneyAmountParseError::InvalidFormat)?;
        if parsed.is_sign_negative() {
            return Err(MoneyAmountParseError::Negative);
        }
        Ok(MoneyAmount(parsed))
    }

    /// Scales to atomic units. Refuses to round: `"0.0000001"` on a 6-decimal token is an error.
    pub fn as_token_amount(&self, token_decimals: u32) -> Result<TokenAmount, MoneyAmountParseError> {
        let normalized = self.0.normalize();
        let money_decimals = normalized.scale();
        if money_decimals > token_decimals {
            return Err(MoneyAmountParseError::WrongPrecision {
                money: money_decimals,
                token: token_decimals,
            });
        }
        let multiplier = U256::from(10).pow(U256::from(token_decimals - money_decimals));
        let mantissa = U256::from(normalized.mantissa().unsigned_abs());
        let value = mantissa
            .checked_mul(multiplier)
            .ok_or(TokenAmountError::Overflow)?;
        if value.is_zero() {
            return Err(TokenAmountError::Zero.into());
        }
        Ok(TokenAmount(value))
    }
}

/// A 32-byte EVM transaction hash, 0x-prefixed hex on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionHash(pub [u8; 32]);

impl Debug for TransactionHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionHash({self})")
    }
}

impl Display for TransactionHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl From<B256> for TransactionHash {
    fn from(value: B256) -> Self {
        TransactionHash(value.0)
    }
}

impl Serialize for TransactionHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TransactionHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        static TX_HASH_REGEX: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"^0x[0-9a-fA-F]{64}$").expect("invalid regex"));
        if !TX_HASH_REGEX.is_match(&s) {
            return Err(serde::de::Error::custom("Invalid transaction hash format"));
        }
        let bytes = hex::decode(&s[2..])
            .map_err(|_| serde::de::Error::custom("Invalid hex in transaction hash"))?;
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("Transaction hash must be exactly 32 bytes"))?;
        Ok(TransactionHash(array))
    }
}

/// Inbound gasless transfer submission.
///
/// `to` defaults to the relay's own address on `chainId`, `token` to `USDC`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub chain_id: u64,
    pub user_address: EvmAddress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<EvmAddress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub amount: TokenAmount,
    pub valid_after: UnixTimestamp,
    pub valid_before: UnixTimestamp,
    pub nonce: HexEncodedNonce,
    pub signature: EvmSignature,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub tx_hash: TransactionHash,
}

/// Body of every failed response: a short stable reason code plus optional detail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacilitatorAddress {
    pub chain_id: u64,
    pub address: EvmAddress,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SponsorRequest {
    pub address: EvmAddress,
    pub chain_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SponsorResponse {
    Dripped {
        #[serde(rename = "txHash")]
        tx_hash: TransactionHash,
    },
    AlreadyFunded {
        #[serde(rename = "alreadyHasGas")]
        already_has_gas: bool,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitedResponse {
    pub error: String,
    pub next_drip_available: UnixTimestamp,
}

sol!(
    /// ERC-3009 `TransferWithAuthorization` typed-data struct.
    ///
    /// Field names, types and order are the on-chain type hash; changing any of them breaks
    /// every signature the token contract would accept.
    #[derive(Debug, Serialize, Deserialize)]
    struct TransferWithAuthorization {
        address from;
        address to;
        uint256 value;
        uint256 validAfter;
        uint256 validBefore;
        bytes32 nonce;
    }
);

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const CHECKSUMMED: &str = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed";

    #[test]
    fn addresses_in_any_case_are_the_same_entity() {
        let lower: EvmAddress = CHECKSUMMED.to_lowercase().parse().unwrap();
        let checksummed: EvmAddress = CHECKSUMMED.parse().unwrap();
        assert_eq!(lower, checksummed);
        assert_eq!(lower.to_string(), CHECKSUMMED);
    }

    #[test]
    fn mixed_case_with_bad_checksum_is_rejected() {
        let broken = CHECKSUMMED.replace("aA", "Aa");
        assert_eq!(
            broken.parse::<EvmAddress>(),
            Err(EvmAddressDecodingError::BadChecksum)
        );
    }

    #[test]
    fn token_amount_must_be_positive_integer() {
        assert_eq!(TokenAmount::parse_positive("10000").unwrap().0, U256::from(10_000u64));
        assert_eq!(TokenAmount::parse_positive("0"), Err(TokenAmountError::Zero));
        assert_eq!(TokenAmount::parse_positive("-5"), Err(TokenAmountError::NotAnInteger));
        assert_eq!(TokenAmount::parse_positive("1.5"), Err(TokenAmountError::NotAnInteger));
        assert_eq!(TokenAmount::parse_positive("0x10"), Err(TokenAmountError::NotAnInteger));
    }

    #[test]
    fn money_amount_scales_without_rounding() {
        let one = MoneyAmount::parse("1.00").unwrap();
        assert_eq!(one.as_token_amount(6).unwrap().0, U256::from(1_000_000u64));
        let tiny = MoneyAmount::parse("0.0000001").unwrap();
        assert!(matches!(
            tiny.as_token_amount(6),
            Err(MoneyAmountParseError::WrongPrecision { money: 7, token: 6 })
        ));
        assert!(MoneyAmount::parse("0").unwrap().as_token_amount(6).is_err());
    }

    #[test]
    fn signature_requires_65_bytes() {
        let short = format!("0x{}", "11".repeat(64));
        assert_eq!(
            short.parse::<EvmSignature>(),
            Err(SignatureDecodingError::InvalidLength(64))
        );
        let mut raw = [0x11u8; 65];
        raw[64] = 0;
        let sig: EvmSignature = format!("0x{}", hex::encode(raw)).parse().unwrap();
        assert_eq!(sig.v(), 27);
    }

    #[test]
    fn recovery_id_encodings_parse_to_the_same_signature() {
        let mut raw = [0x11u8; 65];
        raw[64] = 1;
        let zero_based: EvmSignature =
            serde_json::from_value(json!(format!("0x{}", hex::encode(raw)))).unwrap();
        raw[64] = 28;
        let legacy: EvmSignature =
            serde_json::from_value(json!(format!("0x{}", hex::encode(raw)))).unwrap();
        assert_eq!(zero_based, legacy);
        assert_eq!(zero_based.0[64], 28);
    }

    #[test]
    fn submit_request_uses_string_encoded_integers() {
        let body = json!({
            "chainId": 42220,
            "userAddress": CHECKSUMMED,
            "amount": "10000",
            "validAfter": "0",
            "validBefore": "1700003600",
            "nonce": format!("0x{}", "ab".repeat(32)),
            "signature": format!("0x{}1b", "22".repeat(64)),
        });
        let request: SubmitRequest = serde_json::from_value(body).unwrap();
        assert_eq!(request.chain_id, 42220);
        assert_eq!(request.valid_before, UnixTimestamp(1_700_003_600));
        assert!(request.to.is_none());

        let numeric = json!({
            "chainId": 42220,
            "userAddress": CHECKSUMMED,
            "amount": 10000,
            "validAfter": "0",
            "validBefore": "1700003600",
            "nonce": format!("0x{}", "ab".repeat(32)),
            "signature": format!("0x{}1b", "22".repeat(64)),
        });
        assert!(serde_json::from_value::<SubmitRequest>(numeric).is_err());
    }

    #[test]
    fn sponsor_response_shapes() {
        let funded = SponsorResponse::AlreadyFunded {
            already_has_gas: true,
        };
        assert_eq!(serde_json::to_value(&funded).unwrap(), json!({"alreadyHasGas": true}));
        let dripped = SponsorResponse::Dripped {
            tx_hash: TransactionHash([1u8; 32]),
        };
        assert_eq!(
            serde_json::to_value(&dripped).unwrap(),
            json!({"txHash": format!("0x{}", "01".repeat(32))})
        );
    }
}
