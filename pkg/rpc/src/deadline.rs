use std::time::{Duration, Instant};

use common::errors::*;

/// The `grpc-timeout` header name.
pub const HEADER_NAME: &str = "grpc-timeout";

/// Encodes a duration as a `grpc-timeout` value: 1-8 decimal digits followed
/// by a single unit character. Always picks the coarsest unit that still
/// represents the duration exactly in digits, falling back to nanoseconds
/// (and clamping to 8 digits, per the wire grammar's limit) for anything
/// that doesn't divide evenly.
pub fn encode(duration: Duration) -> String {
    const UNITS: &[(char, u128)] = &[
        ('H', 3_600_000_000_000),
        ('M', 60_000_000_000),
        ('S', 1_000_000_000),
        ('m', 1_000_000),
        ('u', 1_000),
        ('n', 1),
    ];

    let total_nanos = duration.as_nanos();

    for (unit, nanos_per_unit) in UNITS {
        if total_nanos % nanos_per_unit == 0 {
            let value = total_nanos / nanos_per_unit;
            if value <= 99_999_999 {
                return format!("{}{}", value, unit);
            }
        }
    }

    // Degenerate case: duration doesn't fit in 8 digits at any unit.
    // Clamp to the largest representable value in hours.
    format!("{}H", 99_999_999u128)
}

/// Decodes a `grpc-timeout` header value into a `Duration`.
pub fn decode(value: &str) -> Result<Duration> {
    if value.is_empty() {
        return Err(err_msg("Empty grpc-timeout value"));
    }

    let (digits, unit) = value.split_at(value.len() - 1);
    if digits.is_empty() || digits.len() > 8 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format_err!("Invalid grpc-timeout value: {}", value));
    }

    let amount: u64 = digits
        .parse()
        .map_err(|_| format_err!("Invalid grpc-timeout value: {}", value))?;

    let nanos_per_unit: u64 = match unit {
        "H" => 3_600_000_000_000,
        "M" => 60_000_000_000,
        "S" => 1_000_000_000,
        "m" => 1_000_000,
        "u" => 1_000,
        "n" => 1,
        _ => return Err(format_err!("Unknown grpc-timeout unit: {}", unit)),
    };

    Ok(Duration::from_nanos(amount * nanos_per_unit))
}

/// Converts a `grpc-timeout` header value directly into an absolute
/// deadline, anchored at `now`.
pub fn decode_absolute(value: &str, now: Instant) -> Result<Instant> {
    Ok(now + decode(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_whole_seconds() {
        let d = Duration::from_secs(5);
        let encoded = encode(d);
        assert_eq!(decode(&encoded).unwrap(), d);
    }

    #[test]
    fn round_trips_sub_second() {
        let d = Duration::from_millis(250);
        let encoded = encode(d);
        assert_eq!(decode(&encoded).unwrap(), d);
    }

    #[test]
    fn decode_rejects_malformed_values() {
        assert!(decode("").is_err());
        assert!(decode("10").is_err());
        assert!(decode("abcS").is_err());
        assert!(decode("123456789S").is_err());
    }

    #[test]
    fn decode_accepts_all_units() {
        assert_eq!(decode("1H").unwrap(), Duration::from_secs(3600));
        assert_eq!(decode("1M").unwrap(), Duration::from_secs(60));
        assert_eq!(decode("1S").unwrap(), Duration::from_secs(1));
        assert_eq!(decode("1m").unwrap(), Duration::from_millis(1));
        assert_eq!(decode("1u").unwrap(), Duration::from_micros(1));
        assert_eq!(decode("1n").unwrap(), Duration::from_nanos(1));
    }
}
