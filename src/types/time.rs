//! Timestamp codec for message time fields.
//!
//! Messages carry times as compact UTC strings, `YYYYMMDDTHHMMSS.fff`
//! (e.g. `20210921T011331.0123`). The older form without the `T` separator
//! (`20210921011331.0123`) is accepted on input. Internally every age and TTL
//! computation uses float seconds since the epoch.

use chrono::{DateTime, NaiveDateTime};
use thiserror::Error;

/// Errors that can occur when decoding a timestamp string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeError {
    /// The string is too short or the date portion does not parse.
    #[error("invalid timestamp: {0:?}")]
    Invalid(String),

    /// The fractional seconds portion does not parse.
    #[error("invalid fractional seconds in timestamp: {0:?}")]
    InvalidFraction(String),
}

/// Result type for timestamp decoding.
pub type Result<T> = std::result::Result<T, TimeError>;

const DATE_FORMAT: &str = "%Y%m%d%H%M%S";

/// Decodes a message timestamp into float epoch seconds.
pub fn timestr_to_flt(s: &str) -> Result<f64> {
    let compact: String = if s.as_bytes().get(8) == Some(&b'T') {
        s.replacen('T', "", 1)
    } else {
        s.to_string()
    };

    let date_part = compact
        .get(..14)
        .ok_or_else(|| TimeError::Invalid(s.to_string()))?;
    let parsed = NaiveDateTime::parse_from_str(date_part, DATE_FORMAT)
        .map_err(|_| TimeError::Invalid(s.to_string()))?;

    let fraction = &compact[14..];
    let frac = if fraction.is_empty() {
        0.0
    } else {
        format!("0{fraction}")
            .parse::<f64>()
            .map_err(|_| TimeError::InvalidFraction(s.to_string()))?
    };

    Ok(parsed.and_utc().timestamp() as f64 + frac)
}

/// Encodes float epoch seconds as a message timestamp.
///
/// Fractional seconds are written with up to nine digits, trailing zeros
/// trimmed; whole seconds carry no fraction at all.
pub fn timeflt_to_str(t: f64) -> String {
    let mut secs = t.floor() as i64;
    let mut nanos = ((t - t.floor()) * 1e9).round() as i64;
    if nanos >= 1_000_000_000 {
        secs += 1;
        nanos = 0;
    }

    let base = DateTime::from_timestamp(secs, 0)
        .map(|dt| dt.format("%Y%m%dT%H%M%S").to_string())
        .unwrap_or_else(|| "19700101T000000".to_string());

    if nanos == 0 {
        return base;
    }
    let digits = format!("{nanos:09}");
    format!("{base}.{}", digits.trim_end_matches('0'))
}
