//! Custom filters and functions available to templates
//!
//! - `percent`: integer percentage of a value, `{{ values.memory | percent(80) }}`
//! - `base64_encode`: encode a string
//! - `required`: fail if the value is undefined or none
//! - `duration(start, end)`: seconds between two RFC 3339 timestamps

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use minijinja::{Error, ErrorKind, Value};

/// Integer percentage of a value, truncated toward zero
pub fn percent(value: i64, pct: i64) -> String {
    (((value as f64) * (pct as f64 / 100.0)) as i64).to_string()
}

/// Base64 encode filter
pub fn base64_encode(value: &str) -> String {
    STANDARD.encode(value.as_bytes())
}

/// Fails if the value is undefined or none
pub fn required(value: Value) -> Result<Value, Error> {
    if value.is_undefined() || value.is_none() {
        Err(Error::new(
            ErrorKind::UndefinedError,
            "required value is undefined",
        ))
    } else {
        Ok(value)
    }
}

/// Seconds between two timestamps, zero if they are out of order
pub fn duration(start: &str, end: &str) -> Result<f64, Error> {
    let parse = |s: &str| {
        DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| {
                Error::new(
                    ErrorKind::InvalidOperation,
                    format!("invalid timestamp '{s}': {e}"),
                )
            })
    };
    let (start, end) = (parse(start)?, parse(end)?);
    if start < end {
        Ok((end - start).num_milliseconds() as f64 / 1000.0)
    } else {
        Ok(0.0)
    }
}
