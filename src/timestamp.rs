//! Per-frame timestamp aggregation across channels.

/// Arithmetic mean of the channel timestamps, truncated to whole microseconds.
///
/// Returns `None` for an empty slice. The sum is widened to `u128` so four
/// timestamps near `u64::MAX` cannot overflow.
pub fn aggregate(timestamps: &[u64]) -> Option<u64> {
    if timestamps.is_empty() {
        return None;
    }
    let sum: u128 = timestamps.iter().map(|&t| t as u128).sum();
    Some((sum / timestamps.len() as u128) as u64)
}

/// Largest difference between any two channel timestamps.
pub fn spread(timestamps: &[u64]) -> u64 {
    match (timestamps.iter().min(), timestamps.iter().max()) {
        (Some(min), Some(max)) => max - min,
        _ => 0,
    }
}

/// Render a microsecond timestamp as `seconds.micros`.
pub fn format_timestamp(timestamp_us: u64) -> String {
    format!("{}.{:06}", timestamp_us / 1_000_000, timestamp_us % 1_000_000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_of_four_channels() {
        assert_eq!(aggregate(&[100, 200, 300, 400]), Some(250));
    }

    #[test]
    fn mean_truncates() {
        assert_eq!(aggregate(&[1, 2, 2, 2]), Some(1));
        assert_eq!(aggregate(&[10, 11]), Some(10));
    }

    #[test]
    fn mean_does_not_overflow() {
        let t = u64::MAX - 3;
        assert_eq!(aggregate(&[t, t, t, t]), Some(t));
    }

    #[test]
    fn empty_has_no_mean() {
        assert_eq!(aggregate(&[]), None);
        assert_eq!(spread(&[]), 0);
    }

    #[test]
    fn spread_is_max_minus_min() {
        assert_eq!(spread(&[1_000_004, 1_000_000, 1_000_001, 1_000_002]), 4);
    }

    #[test]
    fn formats_seconds_and_micros() {
        assert_eq!(format_timestamp(12_000_345), "12.000345");
        assert_eq!(format_timestamp(999), "0.000999");
    }
}
