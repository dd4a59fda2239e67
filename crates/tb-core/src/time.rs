//! Wall-clock helpers
//!
//! Allocation creation times, expiry deadlines and power transitions are
//! stored as Unix milliseconds so they serialize cleanly to clients.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current Unix timestamp in milliseconds.
///
/// Returns 0 if the system clock is before the Unix epoch.
pub fn current_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Whether a millisecond deadline has been reached at `now`.
pub fn deadline_passed(deadline: u64, now: u64) -> bool {
    now >= deadline
}

/// Idle `timeout` elapsed between `last_activity` and `now`.
pub fn idle_expired(last_activity: u64, timeout: Duration, now: u64) -> bool {
    now.saturating_sub(last_activity) >= timeout.as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_time_millis_is_positive() {
        assert!(current_time_millis() > 0);
    }

    #[test]
    fn test_deadline_passed() {
        assert!(deadline_passed(1_000, 1_000));
        assert!(!deadline_passed(1_001, 1_000));
    }

    #[test]
    fn test_idle_expired() {
        let timeout = Duration::from_secs(60);
        assert!(!idle_expired(10_000, timeout, 69_999));
        assert!(idle_expired(10_000, timeout, 70_000));
        // Activity stamped after `now` never counts as idle
        assert!(!idle_expired(80_000, timeout, 70_000));
    }
}
