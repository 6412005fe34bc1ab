//! `grpc-timeout` header encoding.
//!
//! The wire value is an integer of at most eight digits followed by a unit:
//! `H` hours, `M` minutes, `S` seconds, `m` milliseconds, `u` microseconds,
//! `n` nanoseconds. Encoding rounds the timeout up to three significant
//! figures (never shortening a deadline) and then picks the most compact
//! unit that represents the rounded value exactly.

use std::time::Duration;

/// Ceiling on an encodable timeout. Anything longer is clamped on the wire;
/// the local deadline still uses the caller's value.
pub const MAX_TIMEOUT_SECONDS: u64 = 99_999_999;

const MAX_TIMEOUT_NANOS: u128 = MAX_TIMEOUT_SECONDS as u128 * 1_000_000_000;

/// Units from largest to smallest, as (suffix, nanoseconds).
const UNITS: [(char, u128); 6] = [
    ('H', 3_600_000_000_000),
    ('M', 60_000_000_000),
    ('S', 1_000_000_000),
    ('m', 1_000_000),
    ('u', 1_000),
    ('n', 1),
];

/// Encode a timeout for the `grpc-timeout` request header.
///
/// Zero (the caller clamps negative remainders to zero) encodes as `"1n"`,
/// the smallest representable timeout. Values above [`MAX_TIMEOUT_SECONDS`]
/// are clamped to `"99999999S"` and the clamp is logged.
pub fn encode_timeout(timeout: Duration) -> String {
    if timeout.is_zero() {
        return "1n".to_owned();
    }

    let rounded = round_up_three_significant_figures(timeout.as_nanos());
    if rounded > MAX_TIMEOUT_NANOS {
        tracing::warn!(
            timeout_secs = timeout.as_secs(),
            "deadline timeout exceeds the maximum transmittable value and was clamped"
        );
        return format!("{MAX_TIMEOUT_SECONDS}S");
    }

    for (suffix, unit) in UNITS {
        if rounded % unit == 0 {
            let value = rounded / unit;
            if value <= 99_999_999 {
                return format!("{value}{suffix}");
            }
        }
    }

    // Unreachable: after rounding to three significant figures any value at
    // or under the clamp is exact in seconds or smaller with <= 8 digits.
    format!("{MAX_TIMEOUT_SECONDS}S")
}

/// Decode a `grpc-timeout` header value.
pub fn decode_timeout(value: &str) -> Option<Duration> {
    if value.len() < 2 || value.len() > 9 {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let amount: u64 = digits.parse().ok()?;
    let nanos_per_unit = match unit {
        "H" => 3_600_000_000_000u128,
        "M" => 60_000_000_000,
        "S" => 1_000_000_000,
        "m" => 1_000_000,
        "u" => 1_000,
        "n" => 1,
        _ => return None,
    };
    let nanos = amount as u128 * nanos_per_unit;
    Some(Duration::new(
        (nanos / 1_000_000_000) as u64,
        (nanos % 1_000_000_000) as u32,
    ))
}

fn round_up_three_significant_figures(nanos: u128) -> u128 {
    let digits = decimal_digits(nanos);
    if digits <= 3 {
        return nanos;
    }
    let scale = 10u128.pow(digits - 3);
    nanos.div_ceil(scale) * scale
}

fn decimal_digits(mut value: u128) -> u32 {
    let mut digits = 1;
    while value >= 10 {
        value /= 10;
        digits += 1;
    }
    digits
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_encodes_to_minimum() {
        assert_eq!(encode_timeout(Duration::ZERO), "1n");
    }

    #[test]
    fn small_values_pass_through() {
        assert_eq!(encode_timeout(Duration::from_nanos(100)), "100n");
        assert_eq!(encode_timeout(Duration::from_millis(1)), "1m");
        assert_eq!(encode_timeout(Duration::from_secs(1)), "1S");
    }

    #[test]
    fn rounds_up_to_three_significant_figures() {
        // 1234 ms rounds up to 1240 ms.
        assert_eq!(encode_timeout(Duration::from_millis(1234)), "1240m");
        // 1001 ns rounds up to 1010 ns; no larger unit divides it.
        assert_eq!(encode_timeout(Duration::from_nanos(1001)), "1010n");
        // Rounding never shortens the deadline.
        assert_eq!(encode_timeout(Duration::from_nanos(999_999)), "1m");
    }

    #[test]
    fn picks_most_compact_exact_unit() {
        assert_eq!(encode_timeout(Duration::from_millis(3_600_000)), "1H");
        assert_eq!(encode_timeout(Duration::from_secs(90)), "90S");
        assert_eq!(encode_timeout(Duration::from_secs(120)), "2M");
    }

    #[test]
    fn clamps_oversized_timeouts() {
        assert_eq!(
            encode_timeout(Duration::from_secs(999_999_999)),
            "99999999S"
        );
        // Rounding that would overshoot the clamp is also clamped.
        assert_eq!(encode_timeout(Duration::from_secs(99_999_000)), "99999999S");
    }

    #[test]
    fn decode_parses_all_units() {
        assert_eq!(decode_timeout("1H"), Some(Duration::from_secs(3600)));
        assert_eq!(decode_timeout("2M"), Some(Duration::from_secs(120)));
        assert_eq!(decode_timeout("7S"), Some(Duration::from_secs(7)));
        assert_eq!(decode_timeout("5m"), Some(Duration::from_millis(5)));
        assert_eq!(decode_timeout("9u"), Some(Duration::from_micros(9)));
        assert_eq!(decode_timeout("3n"), Some(Duration::from_nanos(3)));
    }

    #[test]
    fn decode_rejects_malformed_values() {
        assert!(decode_timeout("").is_none());
        assert!(decode_timeout("S").is_none());
        assert!(decode_timeout("12").is_none());
        assert!(decode_timeout("-1S").is_none());
        assert!(decode_timeout("123456789S").is_none());
    }

    #[test]
    fn encode_decode_round_trip_preserves_rounded_value() {
        for millis in [1u64, 9, 123, 1234, 56_789, 3_600_000] {
            let timeout = Duration::from_millis(millis);
            let rounded_nanos = round_up_three_significant_figures(timeout.as_nanos());
            let decoded = decode_timeout(&encode_timeout(timeout)).unwrap();
            assert_eq!(decoded.as_nanos(), rounded_nanos, "millis={millis}");
        }
    }
}
