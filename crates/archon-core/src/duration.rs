//! Parser for the compact duration grammar used in plan files: `\d+[smhd]`.

use std::time::Duration;

use thiserror::Error;

/// Error returned for a string that is not `\d+[smhd]`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid duration {0:?} (expected e.g. 30s, 5m, 2h, 1d)")]
pub struct DurationParseError(pub String);

/// Parse `30s` / `5m` / `2h` / `1d` into a [`Duration`].
pub fn parse_duration(s: &str) -> Result<Duration, DurationParseError> {
    let err = || DurationParseError(s.to_owned());

    if s.len() < 2 {
        return Err(err());
    }
    let (digits, unit) = s.split_at(s.len() - 1);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(err());
    }
    let value: u64 = digits.parse().map_err(|_| err())?;
    let secs = match unit {
        "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        "d" => value * 86_400,
        _ => return Err(err()),
    };
    Ok(Duration::from_secs(secs))
}
