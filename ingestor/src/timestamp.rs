//! Event-time handling shared by every gateway.
//!
//! Readings carry an instant with an explicit offset. Zone-less input is
//! interpreted as UTC before it is compared or stored, so a naive
//! `2024-05-01T10:00:00` and `2024-05-01T10:00:00Z` are the same instant.

use crate::errors::{Error, Result};
use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer};

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Parses an RFC 3339 instant, falling back to zone-less formats taken as UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<FixedOffset>> {
    let raw = raw.trim();

    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts);
    }
    // Offsets written without a colon, e.g. +0530
    if let Ok(ts) = DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Ok(ts);
    }

    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc().fixed_offset())
        .ok_or_else(|| Error::Validation(format!("Unrecognised timestamp '{}'", raw)))
}

/// Builds the offset server-assigned timestamps are rendered in.
pub fn display_offset(minutes_east: i32) -> Result<FixedOffset> {
    FixedOffset::east_opt(minutes_east.saturating_mul(60)).ok_or_else(|| {
        Error::Config(format!(
            "UTC offset of {} minutes is out of range",
            minutes_east
        ))
    })
}

pub fn now_in(offset: FixedOffset) -> DateTime<FixedOffset> {
    Utc::now().with_timezone(&offset)
}

/// Event-time ordering rule of the current-value cache: a candidate wins only
/// when nothing is cached yet or it is strictly later than what is cached.
pub fn is_newer(candidate: &DateTime<FixedOffset>, current: Option<&DateTime<FixedOffset>>) -> bool {
    match current {
        None => true,
        // chrono compares the underlying UTC instants, offsets do not matter
        Some(current) => candidate > current,
    }
}

/// Serde adapter for optional caller-supplied timestamps.
pub fn deserialize_optional<'de, D>(deserializer: D) -> std::result::Result<Option<DateTime<FixedOffset>>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => parse_timestamp(&raw)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}
