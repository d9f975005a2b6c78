//! # Timestamps and Windows
//!
//! All times are milliseconds since the Unix epoch. The server sends them as
//! JSON numbers in payloads and as strings in SSE `id:` lines, so
//! [`Timestamp`] accepts both on the way in and always writes a number.
//!
//! ## Catch-up Window
//! ```text
//!   past ◄──────────────────────────────────────────────────────► now
//!          │                                         │
//!     now - long                               now - short
//!          │◄──────── batch catch-up runs ──────────►│
//!   too old: stream only                        too recent: stream only
//! ```

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::CoreError;

// =============================================================================
// Timestamp
// =============================================================================

/// Milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Creates a timestamp from epoch milliseconds.
    pub const fn from_millis(millis: i64) -> Self {
        Timestamp(millis)
    }

    /// Returns the epoch milliseconds.
    pub const fn millis(&self) -> i64 {
        self.0
    }

    /// Current wall-clock time.
    pub fn now() -> Self {
        Timestamp(chrono::Utc::now().timestamp_millis())
    }

    /// Returns this timestamp moved back by `duration` (saturating).
    pub fn saturating_sub(&self, duration: Duration) -> Self {
        let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        Timestamp(self.0.saturating_sub(millis))
    }

    /// Returns this timestamp moved forward by `millis`.
    pub fn offset(&self, millis: i64) -> Self {
        Timestamp(self.0.saturating_add(millis))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Timestamp {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Ok(millis) = trimmed.parse::<i64>() {
            return Ok(Timestamp(millis));
        }
        // Some producers send fractional milliseconds
        match trimmed.parse::<f64>() {
            Ok(value) if value.is_finite() => Ok(Timestamp(value as i64)),
            _ => Err(CoreError::InvalidTimestamp(s.to_string())),
        }
    }
}

impl From<i64> for Timestamp {
    fn from(millis: i64) -> Self {
        Timestamp(millis)
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.0)
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(TimestampVisitor)
    }
}

struct TimestampVisitor;

impl<'de> Visitor<'de> for TimestampVisitor {
    type Value = Timestamp;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("epoch milliseconds as a number or numeric string")
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Timestamp, E> {
        Ok(Timestamp(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Timestamp, E> {
        i64::try_from(v)
            .map(Timestamp)
            .map_err(|_| E::custom(format!("timestamp {v} out of range")))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Timestamp, E> {
        if v.is_finite() {
            Ok(Timestamp(v as i64))
        } else {
            Err(E::custom("timestamp must be finite"))
        }
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Timestamp, E> {
        v.parse().map_err(E::custom)
    }
}

// =============================================================================
// Freshness Window
// =============================================================================

/// Decides whether a persisted watermark is worth a batch catch-up.
///
/// A watermark newer than `now - short` is close enough for the live stream
/// to replay from; one older than `now - long` is too stale for the event
/// log and is left to the per-collection bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessWindow {
    /// Lower age bound (default: 1 hour).
    pub short: Duration,
    /// Upper age bound (default: 25 days).
    pub long: Duration,
}

impl Default for FreshnessWindow {
    fn default() -> Self {
        FreshnessWindow {
            short: Duration::from_secs(3600),
            long: Duration::from_secs(25 * 24 * 3600),
        }
    }
}

impl FreshnessWindow {
    /// Returns true if `watermark` lies strictly inside the window at `now`.
    pub fn contains(&self, watermark: Timestamp, now: Timestamp) -> bool {
        let newest = now.saturating_sub(self.short);
        let oldest = now.saturating_sub(self.long);
        oldest < watermark && watermark < newest
    }
}

/// Returns true if `mark` is absent or older than `now - staleness`.
pub fn is_stale(mark: Option<Timestamp>, staleness: Duration, now: Timestamp) -> bool {
    match mark {
        None => true,
        Some(mark) => mark < now.saturating_sub(staleness),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_from_number_and_string() {
        let a: Timestamp = serde_json::from_str("1700000000000").unwrap();
        let b: Timestamp = serde_json::from_str("\"1700000000000\"").unwrap();
        let c: Timestamp = serde_json::from_str("1700000000000.7").unwrap();
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_eq!(serde_json::to_string(&a).unwrap(), "1700000000000");
    }

    #[test]
    fn test_timestamp_rejects_garbage() {
        assert!(serde_json::from_str::<Timestamp>("\"yesterday\"").is_err());
        assert!(serde_json::from_str::<Timestamp>("null").is_err());
        assert!("".parse::<Timestamp>().is_err());
    }

    #[test]
    fn test_freshness_window_bounds() {
        let window = FreshnessWindow::default();
        let now = Timestamp::from_millis(100 * 24 * 3600 * 1000);
        let hour = 3600 * 1000;

        assert!(window.contains(now.offset(-2 * hour), now));
        // Too recent: the stream replays from the watermark itself
        assert!(!window.contains(now.offset(-hour / 2), now));
        // Too old for the event log
        assert!(!window.contains(now.offset(-26 * 24 * hour), now));
        // Bounds are exclusive
        assert!(!window.contains(now.offset(-hour), now));
    }

    #[test]
    fn test_is_stale() {
        let now = Timestamp::from_millis(1_000_000);
        let staleness = Duration::from_millis(1000);
        assert!(is_stale(None, staleness, now));
        assert!(is_stale(Some(Timestamp::from_millis(998_999)), staleness, now));
        assert!(!is_stale(Some(Timestamp::from_millis(999_000)), staleness, now));
    }
}
