//! Clock and time-window arithmetic
//!
//! All timestamps in the historian are Unix milliseconds (`i64`).

use std::time::Duration;

/// Current Unix timestamp in milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Convert a duration to whole milliseconds, saturating at `i64::MAX`
pub fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Convert a (possibly negative) millisecond span to a duration, flooring at zero
pub fn ms_duration(ms: i64) -> Duration {
    Duration::from_millis(ms.max(0) as u64)
}

/// Start of the window of width `interval` containing `timestamp`
///
/// An interval of zero means every distinct timestamp is its own window.
pub fn window_start(timestamp: i64, interval: i64) -> i64 {
    if interval <= 0 {
        timestamp
    } else {
        timestamp.div_euclid(interval) * interval
    }
}

/// End (exclusive) of the window of width `interval` containing `timestamp`
pub fn window_end(timestamp: i64, interval: i64) -> i64 {
    if interval <= 0 {
        timestamp
    } else {
        window_start(timestamp, interval).saturating_add(interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_start_aligns_down() {
        assert_eq!(window_start(12_345, 1_000), 12_000);
        assert_eq!(window_start(12_000, 1_000), 12_000);
        assert_eq!(window_start(-1, 1_000), -1_000);
    }

    #[test]
    fn test_zero_interval_is_identity() {
        assert_eq!(window_start(12_345, 0), 12_345);
        assert_eq!(window_end(12_345, 0), 12_345);
    }

    #[test]
    fn test_window_end() {
        assert_eq!(window_end(12_345, 1_000), 13_000);
        assert_eq!(window_end(12_000, 1_000), 13_000);
    }

    #[test]
    fn test_duration_conversions() {
        assert_eq!(duration_ms(Duration::from_secs(2)), 2_000);
        assert_eq!(ms_duration(-5), Duration::ZERO);
        assert_eq!(ms_duration(250), Duration::from_millis(250));
    }
}
