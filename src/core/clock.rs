//! core::clock
//!
//! Wall-clock timestamps for lease bookkeeping.
//!
//! Leases are compared across execution units and across processes attached
//! to the same table, so they use wall-clock microseconds since the Unix
//! epoch rather than a per-process monotonic clock. Wait budgets, which are
//! only measured by the waiting unit itself, use `Instant` instead.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Microseconds since the Unix epoch, clamped to zero before it.
pub fn now_micros() -> u64 {
    to_micros(Utc::now())
}

/// Convert a timestamp to microseconds since the Unix epoch.
pub fn to_micros(at: DateTime<Utc>) -> u64 {
    u64::try_from(at.timestamp_micros()).unwrap_or(0)
}

/// Saturating conversion of a duration to whole microseconds.
pub fn duration_micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_after_2020() {
        // 2020-01-01T00:00:00Z
        assert!(now_micros() > 1_577_836_800_000_000);
    }

    #[test]
    fn now_is_non_decreasing_in_practice() {
        let a = now_micros();
        let b = now_micros();
        assert!(b >= a);
    }

    #[test]
    fn duration_conversion_saturates() {
        assert_eq!(duration_micros(Duration::from_millis(5)), 5000);
        assert_eq!(duration_micros(Duration::MAX), u64::MAX);
    }

    #[test]
    fn pre_epoch_clamps_to_zero() {
        let before = DateTime::<Utc>::from_timestamp(-10, 0).unwrap();
        assert_eq!(to_micros(before), 0);
    }
}
