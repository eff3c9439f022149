//! Order identifier minting.
//!
//! Identifiers are UTC timestamps with nanosecond resolution in a fixed
//! lexicographic format, so sorting identifiers as strings sorts them by
//! mint time.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// `strftime` layout for identifiers, e.g. `20261019T120000.123456789Z`.
pub const ORDER_ID_FORMAT: &str = "%Y%m%dT%H%M%S%.9fZ";

/// Identifier assigned to an accepted order request.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(String);

impl OrderId {
    /// Wrap an identifier received from the wire.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn from_nanos(nanos: i64) -> Self {
        Self(
            DateTime::<Utc>::from_timestamp_nanos(nanos)
                .format(ORDER_ID_FORMAT)
                .to_string(),
        )
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Mints strictly increasing order identifiers.
///
/// When two mints observe the same clock reading (or the clock steps
/// backwards) the later one is issued one nanosecond after the previous
/// identifier, so concurrent requests never share an identifier.
#[derive(Debug, Default)]
pub struct OrderIdGenerator {
    last_nanos: AtomicI64,
}

impl OrderIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint the next identifier.
    pub fn mint(&self) -> OrderId {
        self.mint_at(Utc::now())
    }

    fn mint_at(&self, now: DateTime<Utc>) -> OrderId {
        let observed = now.timestamp_nanos_opt().unwrap_or(i64::MAX);
        let mut last = self.last_nanos.load(Ordering::Relaxed);
        loop {
            let next = observed.max(last.saturating_add(1));
            match self.last_nanos.compare_exchange_weak(
                last,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return OrderId::from_nanos(next),
                Err(current) => last = current,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_format_is_fixed_width_utc() {
        let generator = OrderIdGenerator::new();
        let at = DateTime::parse_from_rfc3339("2026-10-19T12:00:00.123456789Z")
            .unwrap()
            .with_timezone(&Utc);

        let id = generator.mint_at(at);

        assert_eq!(id.as_str(), "20261019T120000.123456789Z");
    }

    #[test]
    fn test_same_instant_mints_distinct_increasing_ids() {
        let generator = OrderIdGenerator::new();
        let at = DateTime::parse_from_rfc3339("2026-10-19T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        let first = generator.mint_at(at);
        let second = generator.mint_at(at);

        assert_eq!(first.as_str(), "20261019T120000.000000000Z");
        assert_eq!(second.as_str(), "20261019T120000.000000001Z");
        assert!(second > first);
    }

    #[test]
    fn test_clock_going_backwards_still_increases() {
        let generator = OrderIdGenerator::new();
        let later = DateTime::parse_from_rfc3339("2026-10-19T12:00:01Z")
            .unwrap()
            .with_timezone(&Utc);
        let earlier = DateTime::parse_from_rfc3339("2026-10-19T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        let first = generator.mint_at(later);
        let second = generator.mint_at(earlier);

        assert!(second > first);
    }

    #[test]
    fn test_concurrent_mints_are_pairwise_distinct() {
        let generator = Arc::new(OrderIdGenerator::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let generator = Arc::clone(&generator);
                std::thread::spawn(move || (0..500).map(|_| generator.mint()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate order id minted");
            }
        }
        assert_eq!(seen.len(), 4000);
    }

    #[test]
    fn test_order_id_serializes_as_plain_string() {
        let id = OrderId::new("20261019T120000.000000000Z");
        assert_eq!(
            serde_json::to_string(&id).unwrap(),
            "\"20261019T120000.000000000Z\""
        );
    }
}
