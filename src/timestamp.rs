//! Unix timestamps used for authorization validity windows.
//!
//! Timestamps travel over the wire as decimal strings (`"1699999999"`) so that clients in
//! languages without 64-bit integers never lose precision.

use alloy::primitives::U256;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Display, Formatter};
use std::ops::Add;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, SystemTimeError, UNIX_EPOCH};

/// Seconds since the Unix epoch.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct UnixTimestamp(pub u64);

impl UnixTimestamp {
    /// Reads the system clock.
    pub fn try_now() -> Result<Self, SystemTimeError> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?;
        Ok(UnixTimestamp(now.as_secs()))
    }

    pub fn as_secs(&self) -> u64 {
        self.0
    }

    /// Seconds from `self` until `later`, zero if `later` is not in the future.
    pub fn seconds_until(&self, later: UnixTimestamp) -> u64 {
        later.0.saturating_sub(self.0)
    }
}

impl Add<u64> for UnixTimestamp {
    type Output = UnixTimestamp;

    fn add(self, rhs: u64) -> Self::Output {
        UnixTimestamp(self.0.saturating_add(rhs))
    }
}

impl Display for UnixTimestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<UnixTimestamp> for U256 {
    fn from(value: UnixTimestamp) -> Self {
        U256::from(value.0)
    }
}

impl Serialize for UnixTimestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for UnixTimestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let string = String::deserialize(deserializer)?;
        let seconds = string
            .trim()
            .parse::<u64>()
            .map_err(|_| serde::de::Error::custom("timestamp must be a non-negative integer string"))?;
        Ok(UnixTimestamp(seconds))
    }
}

/// Source of "now" for window checks and record timestamps.
///
/// Production code uses [`SystemClock`]; tests pin time with [`ManualClock`].
pub trait Clock: Send + Sync {
    fn now(&self) -> Result<UnixTimestamp, SystemTimeError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Result<UnixTimestamp, SystemTimeError> {
        UnixTimestamp::try_now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn at(now: u64) -> Self {
        Self {
            now: AtomicU64::new(now),
        }
    }

    pub fn set(&self, now: u64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, seconds: u64) {
        self.now.fetch_add(seconds, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Result<UnixTimestamp, SystemTimeError> {
        Ok(UnixTimestamp(self.now.load(Ordering::SeqCst)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_as_decimal_string() {
        let ts = UnixTimestamp(1_700_000_000);
        assert_eq!(serde_json::to_string(&ts).unwrap(), "\"1700000000\"");
        let back: UnixTimestamp = serde_json::from_str("\"1700000000\"").unwrap();
        assert_eq!(back, ts);
    }

    #[test]
    fn rejects_negative_and_fractional_strings() {
        assert!(serde_json::from_str::<UnixTimestamp>("\"-1\"").is_err());
        assert!(serde_json::from_str::<UnixTimestamp>("\"1.5\"").is_err());
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::at(100);
        clock.advance(5);
        assert_eq!(clock.now().unwrap(), UnixTimestamp(105));
        assert_eq!(UnixTimestamp(100).seconds_until(UnixTimestamp(90)), 0);
    }
}
