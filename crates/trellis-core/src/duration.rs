//! Duration parsing and serde helpers.
//!
//! Workflow files express durations either as bare integer seconds
//! (`timeoutSec: 30`) or as unit-suffixed strings (`interval: 30s`,
//! `startPeriod: 1m30s`). Compiled values are `std::time::Duration`,
//! serialized as integer seconds.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DurationError {
    #[error("Invalid duration: {0}")]
    Invalid(String),
}

/// Parse a duration from a bare-seconds integer or a unit-suffixed string.
pub fn parse_duration(raw: &str) -> Result<Duration, DurationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(DurationError::Invalid(raw.to_string()));
    }
    if let Ok(secs) = trimmed.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(trimmed).map_err(|_| DurationError::Invalid(raw.to_string()))
}

/// Serialize a `Duration` as integer seconds.
pub mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Serialize an `Option<Duration>` as optional integer seconds.
pub mod opt_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let secs = Option::<u64>::deserialize(d)?;
        Ok(secs.map(Duration::from_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_seconds() {
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
    }

    #[test]
    fn test_unit_suffix() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
    }

    #[test]
    fn test_invalid() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("soon").is_err());
    }
}
