//! Parsing and formatting for the textual byte-size and duration values used
//! in device profiles.
//!
//! Sizes take the form `<number><suffix>` where the suffix is one of `B`,
//! `KB`, `MB`, `GB`, `TB` (decimal) or `KiB`, `MiB`, `GiB`, `TiB` (binary),
//! case-insensitive. Durations take the form `<number><unit>` with units
//! `ns`, `us`, `µs`, `ms`, `s`, `m`, `h`. Both allow fractional numbers.

use std::time::Duration;

use thiserror::Error;

const KILOBYTE: u64 = 1000;
const MEGABYTE: u64 = 1000 * KILOBYTE;
const GIGABYTE: u64 = 1000 * MEGABYTE;
const TERABYTE: u64 = 1000 * GIGABYTE;
const KIBIBYTE: u64 = 1024;
const MEBIBYTE: u64 = 1024 * KIBIBYTE;
const GIBIBYTE: u64 = 1024 * MEBIBYTE;
const TEBIBYTE: u64 = 1024 * GIBIBYTE;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseBytesError {
    #[error("missing size suffix")]
    MissingSuffix,

    #[error("unrecognised size suffix {0:?}")]
    UnknownSuffix(String),

    #[error("invalid size number {0:?}")]
    InvalidNumber(String),

    #[error("size cannot be negative")]
    Negative,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseDurationError {
    #[error("missing duration unit")]
    MissingUnit,

    #[error("unrecognised duration unit {0:?}")]
    UnknownUnit(String),

    #[error("invalid duration number {0:?}")]
    InvalidNumber(String),

    #[error("duration cannot be negative")]
    Negative,
}

/// Parse a byte size such as `"12KB"`, `"43.11KiB"` or `"0B"`.
pub fn parse_bytes(s: &str) -> Result<u64, ParseBytesError> {
    let lower = s.to_lowercase();

    // The number runs up to the first letter that can start a suffix.
    let split = lower
        .find(['b', 'k', 'm', 'g', 't'])
        .ok_or(ParseBytesError::MissingSuffix)?;
    let (number, suffix) = lower.split_at(split);

    let number = number.trim();
    let value: f64 = number
        .parse()
        .map_err(|_| ParseBytesError::InvalidNumber(number.to_string()))?;
    if value < 0.0 {
        return Err(ParseBytesError::Negative);
    }

    let unit = match suffix.trim() {
        "b" => 1,
        "kb" => KILOBYTE,
        "mb" => MEGABYTE,
        "gb" => GIGABYTE,
        "tb" => TERABYTE,
        "kib" => KIBIBYTE,
        "mib" => MEBIBYTE,
        "gib" => GIBIBYTE,
        "tib" => TEBIBYTE,
        other => return Err(ParseBytesError::UnknownSuffix(other.to_string())),
    };

    Ok((value * unit as f64) as u64)
}

/// Format a byte count using the largest decimal suffix. Values that divide
/// evenly render as integers, so canonical strings like `"12KB"` survive a
/// parse/format round trip.
pub fn format_bytes(n: u64) -> String {
    let (base, suffix) = match n {
        _ if n >= TERABYTE => (TERABYTE, "TB"),
        _ if n >= GIGABYTE => (GIGABYTE, "GB"),
        _ if n >= MEGABYTE => (MEGABYTE, "MB"),
        _ if n >= KILOBYTE => (KILOBYTE, "KB"),
        _ => (1, "B"),
    };

    if n % base == 0 {
        format!("{}{}", n / base, suffix)
    } else {
        format!("{:.2}{}", n as f64 / base as f64, suffix)
    }
}

/// Parse a duration such as `"10ms"`, `"1.5s"` or `"100us"`.
pub fn parse_duration(s: &str) -> Result<Duration, ParseDurationError> {
    let s = s.trim();

    let split = s
        .find(|c: char| c.is_alphabetic())
        .ok_or(ParseDurationError::MissingUnit)?;
    let (number, unit) = s.split_at(split);

    let number = number.trim();
    let value: f64 = number
        .parse()
        .map_err(|_| ParseDurationError::InvalidNumber(number.to_string()))?;
    if value < 0.0 {
        return Err(ParseDurationError::Negative);
    }

    let nanos_per_unit: f64 = match unit.trim() {
        "ns" => 1.0,
        "us" | "µs" => 1_000.0,
        "ms" => 1_000_000.0,
        "s" => 1_000_000_000.0,
        "m" => 60.0 * 1_000_000_000.0,
        "h" => 3_600.0 * 1_000_000_000.0,
        other => return Err(ParseDurationError::UnknownUnit(other.to_string())),
    };

    Ok(Duration::from_nanos((value * nanos_per_unit).round() as u64))
}

/// Format a duration using the largest unit that divides it evenly.
pub fn format_duration(d: Duration) -> String {
    const UNITS: &[(u128, &str)] = &[
        (3_600_000_000_000, "h"),
        (60_000_000_000, "m"),
        (1_000_000_000, "s"),
        (1_000_000, "ms"),
        (1_000, "us"),
        (1, "ns"),
    ];

    let nanos = d.as_nanos();
    if nanos == 0 {
        return "0s".to_string();
    }

    for &(unit, suffix) in UNITS {
        if nanos >= unit && nanos % unit == 0 {
            return format!("{}{}", nanos / unit, suffix);
        }
    }

    unreachable!("every duration divides by 1ns")
}
