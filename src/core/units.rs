//! Human readable size and duration parsing used by route and server pool documents.
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

static SIZE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([\d.]+)\s*(b|byte|bytes|k|m|g|kb|mb|gb)$").expect("size regex is valid")
});

static SHORT_DURATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+(?:\.\d+)?)\s*(ms|s)$").expect("duration regex is valid"));

/// Errors produced while parsing size / duration strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UnitError {
    #[error("invalid size '{0}' (expected e.g. '512b', '10kb', '32mb', '1g')")]
    InvalidSize(String),

    #[error("invalid duration '{0}' (expected e.g. '300ms', '1.5s', '2h45m')")]
    InvalidDuration(String),
}

/// Parse a size such as `10mb` or `1.5k` into a byte count.
///
/// Units are binary (`k` = 1024). An empty string parses to `0`, which callers
/// treat as "unset" and resolve through the fallback chain.
pub fn parse_size(input: &str) -> Result<u64, UnitError> {
    let normalized = input.trim().to_lowercase();
    if normalized.is_empty() {
        return Ok(0);
    }

    let caps = SIZE_RE
        .captures(&normalized)
        .ok_or_else(|| UnitError::InvalidSize(input.to_string()))?;
    let amount: f64 = caps[1]
        .parse()
        .map_err(|_| UnitError::InvalidSize(input.to_string()))?;

    let multiplier = match &caps[2] {
        "k" | "kb" => 1024.0,
        "m" | "mb" => 1024.0 * 1024.0,
        "g" | "gb" => 1024.0 * 1024.0 * 1024.0,
        _ => 1.0,
    };

    Ok((amount * multiplier) as u64)
}

/// Parse a timeout such as `300ms`, `1.5s` or `2h45m`.
///
/// The short `<n>ms` / `<n>s` forms (fractions allowed) are tried first; anything
/// else goes through `humantime`. An empty string parses to `Duration::ZERO`.
pub fn parse_duration(input: &str) -> Result<Duration, UnitError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(Duration::ZERO);
    }

    if let Some(caps) = SHORT_DURATION_RE.captures(trimmed) {
        let amount: f64 = caps[1]
            .parse()
            .map_err(|_| UnitError::InvalidDuration(input.to_string()))?;
        let secs = match &caps[2] {
            "ms" => amount / 1000.0,
            _ => amount,
        };
        return Duration::try_from_secs_f64(secs)
            .map_err(|_| UnitError::InvalidDuration(input.to_string()));
    }

    humantime::parse_duration(trimmed).map_err(|_| UnitError::InvalidDuration(input.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_binary_sizes() {
        assert_eq!(parse_size("512b").unwrap(), 512);
        assert_eq!(parse_size("10 bytes").unwrap(), 10);
        assert_eq!(parse_size("2k").unwrap(), 2048);
        assert_eq!(parse_size("10MB").unwrap(), 10 * 1024 * 1024);
        assert_eq!(parse_size("1.5kb").unwrap(), 1536);
        assert_eq!(parse_size("1g").unwrap(), 1024 * 1024 * 1024);
    }

    #[test]
    fn empty_size_is_unset() {
        assert_eq!(parse_size("").unwrap(), 0);
        assert_eq!(parse_size("   ").unwrap(), 0);
    }

    #[test]
    fn rejects_unknown_size_units() {
        assert!(matches!(parse_size("10tb"), Err(UnitError::InvalidSize(_))));
        assert!(matches!(parse_size("mb"), Err(UnitError::InvalidSize(_))));
        assert!(matches!(parse_size("1.2.3k"), Err(UnitError::InvalidSize(_))));
    }

    #[test]
    fn parses_short_durations() {
        assert_eq!(parse_duration("300ms").unwrap(), Duration::from_millis(300));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("2 s").unwrap(), Duration::from_secs(2));
    }

    #[test]
    fn falls_back_to_humantime() {
        assert_eq!(
            parse_duration("2h45m").unwrap(),
            Duration::from_secs(2 * 3600 + 45 * 60)
        );
        assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
    }

    #[test]
    fn rejects_garbage_duration() {
        assert!(matches!(
            parse_duration("soon"),
            Err(UnitError::InvalidDuration(_))
        ));
        assert_eq!(parse_duration("").unwrap(), Duration::ZERO);
    }
}
