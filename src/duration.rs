//! Human-readable durations for the CLI and the configuration file.

use serde::{Deserialize, Deserializer};
use std::time::Duration;

/// Parse a duration from a human-readable string.
///
/// Supports the following suffixes:
/// - `s` or no suffix: seconds
/// - `m`: minutes
/// - `h`: hours
/// - `ms`: milliseconds
///
/// # Examples
/// ```
/// use envbeacon::duration::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
/// assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
/// assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
/// ```
pub fn parse_duration(src: &str) -> Result<Duration, String> {
    let src = src.trim();

    if src.is_empty() {
        return Err("empty duration string".to_string());
    }

    let (number, unit_ms) = if let Some(num) = src.strip_suffix("ms") {
        (num, 1)
    } else if let Some(num) = src.strip_suffix('h') {
        (num, 3_600_000)
    } else if let Some(num) = src.strip_suffix('m') {
        (num, 60_000)
    } else if let Some(num) = src.strip_suffix('s') {
        (num, 1_000)
    } else {
        (src, 1_000)
    };

    let value: u64 = number
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration: {}", src))?;
    value
        .checked_mul(unit_ms)
        .map(Duration::from_millis)
        .ok_or_else(|| format!("duration out of range: {}", src))
}

/// `serde` adapter for fields written as `"5s"`, `"150ms"`, ...
pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_duration(&raw).map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_seconds() {
        assert_eq!(parse_duration("3s").unwrap(), Duration::from_secs(3));
        assert_eq!(parse_duration("0s").unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_parse_duration_minutes_and_hours() {
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
    }

    #[test]
    fn test_parse_duration_milliseconds() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
    }

    #[test]
    fn test_parse_duration_no_suffix() {
        assert_eq!(parse_duration("10").unwrap(), Duration::from_secs(10));
    }

    #[test]
    fn test_parse_duration_with_whitespace() {
        assert_eq!(parse_duration(" 3s ").unwrap(), Duration::from_secs(3));
        assert_eq!(parse_duration("3 s").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn test_parse_duration_invalid() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("-1s").is_err());
        assert!(parse_duration("99999999999999999h").is_err());
    }

    #[test]
    fn test_deserialize_adapter() {
        #[derive(Deserialize)]
        struct Holder {
            #[serde(deserialize_with = "super::deserialize")]
            every: Duration,
        }

        let holder: Holder = toml::from_str(r#"every = "250ms""#).unwrap();
        assert_eq!(holder.every, Duration::from_millis(250));

        let err = toml::from_str::<Holder>(r#"every = "soon""#);
        assert!(err.is_err());
    }
}
